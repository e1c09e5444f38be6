// Definition module
// Workflow YAML parsing, validation and the immutable job model

pub mod error;
pub mod inputs;
pub mod job;
pub mod loader;
pub mod models;

pub use error::{ParseError, ParseErrorKind};
pub use inputs::resolve_inputs;
pub use job::{
    ActionRef, InputSpec, InputType, JobDefinition, MatrixAxis, RetryPolicy, RunCondition,
    StepKind, StepSpec, Strategy, Trigger, TriggerKind, Workflow,
};
pub use loader::DefinitionLoader;
pub use models::WorkflowFile;
