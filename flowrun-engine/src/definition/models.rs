use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_yaml::Value;

/// A workflow file as written on disk.
///
/// This mirrors the YAML layout; `DefinitionLoader` turns it into validated
/// `JobDefinition`s. Keys the engine does not act on (`runs-on`,
/// `permissions`, ...) are accepted and ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowFile {
    /// The name of the workflow
    #[serde(default)]
    pub name: Option<String>,

    /// The trigger configuration for the workflow
    #[serde(rename = "on")]
    pub on: TriggerSpec,

    /// Workflow-level environment variables
    #[serde(default)]
    pub env: IndexMap<String, String>,

    /// The jobs that make up this workflow, in declaration order
    pub jobs: IndexMap<String, JobSpec>,
}

/// Trigger configuration.
///
/// Supports multiple formats:
/// - Simple: `on: push`
/// - List: `on: [push, workflow_dispatch]`
/// - Detailed: `on: { workflow_dispatch: { inputs: ... } }`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TriggerSpec {
    Single(String),
    Multiple(Vec<String>),
    Detailed(IndexMap<String, Value>),
}

impl TriggerSpec {
    /// Event names paired with their (possibly null) configuration
    pub fn events(&self) -> Vec<(String, Value)> {
        match self {
            TriggerSpec::Single(event) => vec![(event.clone(), Value::Null)],
            TriggerSpec::Multiple(events) => events
                .iter()
                .map(|event| (event.clone(), Value::Null))
                .collect(),
            TriggerSpec::Detailed(events) => events
                .iter()
                .map(|(event, config)| (event.clone(), config.clone()))
                .collect(),
        }
    }
}

/// Configuration of a manual (`workflow_dispatch`) trigger.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ManualTriggerSpec {
    #[serde(default)]
    pub inputs: IndexMap<String, InputSpecRaw>,
}

/// Configuration of a push trigger.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PushTriggerSpec {
    #[serde(default)]
    pub branches: Vec<String>,

    #[serde(default)]
    pub tags: Vec<String>,
}

/// One entry of a schedule trigger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub cron: String,
}

/// Input declared on a manual trigger.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InputSpecRaw {
    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub required: bool,

    /// Default value (any scalar)
    #[serde(default)]
    pub default: Option<Value>,

    /// string, boolean, number or choice
    #[serde(default, rename = "type")]
    pub input_type: Option<String>,

    /// Options for choice inputs
    #[serde(default)]
    pub options: Vec<String>,
}

/// A job within a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    /// Display name for the job
    #[serde(default)]
    pub name: Option<String>,

    /// Job-level environment variables
    #[serde(default)]
    pub env: IndexMap<String, String>,

    /// Matrix strategy for running multiple job instances
    #[serde(default)]
    pub strategy: Option<StrategySpec>,

    /// Container image to isolate the job in
    #[serde(default)]
    pub container: Option<ContainerSpec>,

    /// Job timeout in minutes
    #[serde(default, rename = "timeout-minutes")]
    pub timeout_minutes: Option<f64>,

    /// Default settings for steps in this job
    #[serde(default)]
    pub defaults: Option<DefaultsSpec>,

    /// The steps that make up this job
    #[serde(default)]
    pub steps: Vec<StepSpecRaw>,
}

/// Strategy configuration for matrix builds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StrategySpec {
    /// Axis name to value list, in declaration order
    #[serde(default)]
    pub matrix: Option<IndexMap<String, Value>>,

    /// Cancel the remaining instances when one fails
    #[serde(default, rename = "fail-fast")]
    pub fail_fast: Option<bool>,

    /// Maximum number of instances to run in parallel
    #[serde(default, rename = "max-parallel")]
    pub max_parallel: Option<usize>,
}

/// Container configuration for a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ContainerSpec {
    /// Simple image name
    Image(String),

    /// Detailed container configuration
    Detailed {
        image: String,
        #[serde(default)]
        options: Option<String>,
    },
}

/// Default settings for run steps.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DefaultsSpec {
    #[serde(default)]
    pub run: Option<RunDefaultsSpec>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunDefaultsSpec {
    #[serde(default)]
    pub shell: Option<String>,

    #[serde(default, rename = "working-directory")]
    pub working_directory: Option<String>,
}

/// A step within a job.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepSpecRaw {
    /// Identifier used to reference the step's outputs
    #[serde(default)]
    pub id: Option<String>,

    /// Display name for the step
    #[serde(default)]
    pub name: Option<String>,

    /// Run condition: success(), always() or failure()
    #[serde(default, rename = "if")]
    pub if_condition: Option<String>,

    /// Run this step even after an earlier step failed
    #[serde(default, rename = "always-run")]
    pub always_run: bool,

    /// Shell command to run
    #[serde(default)]
    pub run: Option<String>,

    /// Shell to use for the run command
    #[serde(default)]
    pub shell: Option<String>,

    /// Working directory for the step, relative to the workspace
    #[serde(default, rename = "working-directory")]
    pub working_directory: Option<String>,

    /// Action to use (e.g., "actions/checkout@v4")
    #[serde(default)]
    pub uses: Option<String>,

    /// Parameters passed to the action
    #[serde(default)]
    pub with: IndexMap<String, Value>,

    /// Step-level environment variables
    #[serde(default)]
    pub env: IndexMap<String, String>,

    /// Whether to continue the job if this step fails
    #[serde(default, rename = "continue-on-error")]
    pub continue_on_error: bool,

    /// Step timeout in minutes
    #[serde(default, rename = "timeout-minutes")]
    pub timeout_minutes: Option<f64>,

    /// Retry policy for flaky steps
    #[serde(default)]
    pub retry: Option<RetrySpec>,
}

/// Retry configuration of a step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySpec {
    /// Number of additional attempts after the first failure
    pub count: u32,

    /// Delay before the first retry, doubled on every further retry
    #[serde(default, rename = "backoff-ms")]
    pub backoff_ms: u64,
}
