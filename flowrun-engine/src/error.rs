// Engine error types

use crate::definition::ParseError;

use thiserror::Error;

pub type EngineResult<T> = Result<T, EngineError>;

/// Errors produced by the workflow engine.
///
/// Only `DefinitionParse`, `EmptyAxis` and `InvalidInput` abort a run; the
/// instance-level variants are recorded on the instance they belong to and
/// never reach its siblings.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Invalid workflow definition: {0}")]
    DefinitionParse(#[from] ParseError),

    #[error("Matrix axis '{axis}' of job '{job}' has no values")]
    EmptyAxis { job: String, axis: String },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Failed to provision environment for {instance}: {reason}")]
    EnvironmentProvision { instance: String, reason: String },

    #[error("Step '{step}' failed: {reason}")]
    StepExecution {
        step: String,
        exit_code: Option<i32>,
        reason: String,
    },

    #[error("Artifact '{name}' already exists in run {run_id}")]
    DuplicateArtifact { run_id: String, name: String },

    #[error("Artifact '{name}' not found in run {run_id}")]
    ArtifactNotFound { run_id: String, name: String },

    #[error("Artifact '{0}' does not match its recorded digest")]
    ArtifactCorrupted(String),

    #[error("Run was cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EngineError {
    /// Whether this error aborts the whole run rather than a single instance
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EngineError::DefinitionParse(_)
                | EngineError::EmptyAxis { .. }
                | EngineError::InvalidInput(_)
        )
    }
}
