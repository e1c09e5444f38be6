// Flowrun Engine Library
// Workflow parsing, matrix expansion and isolated parallel execution

pub mod artifacts;
pub mod config;
pub mod definition;
pub mod environment;
pub mod error;
pub mod execution;
pub mod runners;
pub mod utils;

// Re-export commonly used types
pub use config::EngineConfig;
pub use error::{EngineError, EngineResult};

// Re-export definition types
pub use definition::{
    DefinitionLoader, JobDefinition, MatrixAxis, ParseError, ParseErrorKind, StepKind, StepSpec,
    Trigger, TriggerKind, Workflow,
};

// Re-export execution types
pub use execution::{
    progress_channel, Engine, ExecutionEvent, ExecutionResult, InstanceStatus, JobInstance,
    MatrixExpander, ProgressReceiver, ProgressSender, RunId, RunReport, RunRequest, StepStatus,
};

// Re-export artifact and environment types
pub use artifacts::{Artifact, ArtifactHandle, ArtifactStore, FsArtifactStore, MemoryArtifactStore};
pub use environment::{EnvironmentProvider, IsolatedEnvironment, Provisioner};

// Re-export runner types
pub use runners::{ActionRegistry, Shell, ShellRunner, StepRunner};

pub use tokio_util::sync::CancellationToken;
