// Runners Module
// Step runners for inline commands and built-in actions

pub mod actions;
pub mod shell;

pub use actions::{Checkout, ToolSetup, UploadArtifact};
pub use shell::{Shell, ShellRunner};

use crate::artifacts::{Artifact, ArtifactStore};
use crate::definition::{ActionRef, StepSpec};
use crate::environment::IsolatedEnvironment;
use crate::execution::events::{EventSender, ExecutionEvent, ProgressSender};
use crate::execution::matrix::JobInstance;

use indexmap::IndexMap;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

/// Everything a runner needs to execute one step attempt
pub struct StepContext<'a> {
    pub instance: &'a JobInstance,
    pub environment: &'a IsolatedEnvironment,
    /// The step with placeholders already resolved
    pub step: &'a StepSpec,
    /// Full process environment for the step
    pub env: &'a IndexMap<String, String>,
    pub path_prepends: &'a [String],
    pub artifacts: &'a dyn ArtifactStore,
    /// Tree that `checkout` copies into the workspace
    pub source_dir: &'a Path,
    pub events: &'a Option<ProgressSender>,
}

impl StepContext<'_> {
    /// Action parameter from `with:`
    pub fn input(&self, name: &str) -> Option<&str> {
        self.step
            .with
            .get(name)
            .map(String::as_str)
            .filter(|value| !value.trim().is_empty())
    }

    pub fn emit(&self, event: ExecutionEvent) {
        self.events.send_event(event);
    }

    /// Report an output line on behalf of the step
    pub fn emit_output(&self, line: impl Into<String>, is_error: bool) {
        self.emit(ExecutionEvent::step_output(
            self.instance.key(),
            self.step.index,
            line,
            is_error,
        ));
    }
}

/// Result of one step attempt
#[derive(Debug, Clone, Default)]
pub struct StepOutcome {
    pub exit_code: Option<i32>,
    pub error: Option<String>,
    /// Artifacts stored by the step, kept even when the step failed later
    pub artifacts: Vec<Artifact>,
}

impl StepOutcome {
    pub fn success() -> Self {
        Self {
            exit_code: Some(0),
            ..Self::default()
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::default()
        }
    }

    /// Outcome of a finished process (`None` when killed by a signal)
    pub fn from_exit_code(code: Option<i32>) -> Self {
        match code {
            Some(0) => Self::success(),
            Some(code) => Self {
                exit_code: Some(code),
                error: Some(format!("Process completed with exit code {}", code)),
                artifacts: Vec::new(),
            },
            None => Self::failure("Process was terminated by a signal"),
        }
    }

    pub fn with_artifacts(mut self, artifacts: Vec<Artifact>) -> Self {
        self.artifacts = artifacts;
        self
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Executes a step
#[async_trait::async_trait]
pub trait StepRunner: Send + Sync {
    async fn run(&self, ctx: &StepContext<'_>) -> StepOutcome;
}

/// Maps `uses:` references to runners.
///
/// Lookup tries the full name (`actions/checkout`), then the last path
/// segment (`checkout`), then the `setup-<tool>` family.
pub struct ActionRegistry {
    actions: HashMap<String, Arc<dyn StepRunner>>,
}

impl ActionRegistry {
    /// Registry without any actions
    pub fn empty() -> Self {
        Self {
            actions: HashMap::new(),
        }
    }

    /// Registry with the built-in actions
    pub fn new() -> Self {
        let checkout: Arc<dyn StepRunner> = Arc::new(Checkout);
        let upload: Arc<dyn StepRunner> = Arc::new(UploadArtifact);
        Self::empty()
            .with_action("checkout", Arc::clone(&checkout))
            .with_action("actions/checkout", checkout)
            .with_action("upload-artifact", Arc::clone(&upload))
            .with_action("actions/upload-artifact", upload)
    }

    /// Register an action under `name`
    pub fn with_action(mut self, name: impl Into<String>, runner: Arc<dyn StepRunner>) -> Self {
        self.register(name, runner);
        self
    }

    pub fn register(&mut self, name: impl Into<String>, runner: Arc<dyn StepRunner>) {
        self.actions.insert(name.into(), runner);
    }

    pub fn resolve(&self, action: &ActionRef) -> Option<Arc<dyn StepRunner>> {
        if let Some(runner) = self.actions.get(&action.name) {
            return Some(Arc::clone(runner));
        }
        let short = action.short_name();
        if let Some(runner) = self.actions.get(short) {
            return Some(Arc::clone(runner));
        }
        short
            .strip_prefix("setup-")
            .filter(|tool| !tool.is_empty())
            .map(|tool| Arc::new(ToolSetup::new(tool)) as Arc<dyn StepRunner>)
    }
}

impl Default for ActionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
