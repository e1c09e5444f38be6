// Execution Module
// Matrix expansion, scheduling, step execution and run reporting

pub mod commands;
pub mod engine;
pub mod events;
pub mod executor;
pub mod matrix;
pub mod report;
pub mod scheduler;
pub mod scope;

// Re-export key types
pub use commands::{CommandUpdates, FileCommands};
pub use engine::{Engine, RunRequest};
pub use events::{progress_channel, EventSender, ExecutionEvent, LogLevel, ProgressReceiver, ProgressSender};
pub use executor::StepExecutor;
pub use matrix::{JobInstance, MatrixExpander};
pub use report::{ExecutionResult, InstanceStatus, RunId, RunReport, StepResult, StepStatus};
pub use scheduler::Scheduler;
pub use scope::VariableScope;
