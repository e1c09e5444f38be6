// Job Definition Model
// Validated, immutable job definitions produced by the loader

use indexmap::IndexMap;
use serde::Serialize;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// A loaded workflow: its name and jobs in declaration order
#[derive(Debug, Clone)]
pub struct Workflow {
    pub name: String,
    pub jobs: Vec<Arc<JobDefinition>>,
}

impl Workflow {
    /// Find a job by its id
    pub fn job(&self, id: &str) -> Option<&Arc<JobDefinition>> {
        self.jobs.iter().find(|job| job.id == id)
    }

    /// Triggers declared by the workflow (shared by all jobs)
    pub fn triggers(&self) -> &[Trigger] {
        self.jobs
            .first()
            .map(|job| job.triggers.as_slice())
            .unwrap_or_default()
    }
}

/// What started a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerKind {
    Manual,
    Push,
    Schedule,
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TriggerKind::Manual => "manual",
            TriggerKind::Push => "push",
            TriggerKind::Schedule => "schedule",
        };
        f.write_str(name)
    }
}

impl FromStr for TriggerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" | "workflow_dispatch" => Ok(TriggerKind::Manual),
            "push" => Ok(TriggerKind::Push),
            "schedule" => Ok(TriggerKind::Schedule),
            other => Err(format!(
                "unsupported trigger '{}', expected one of: manual, push, schedule",
                other
            )),
        }
    }
}

/// A declared trigger with its configuration
#[derive(Debug, Clone, Serialize)]
pub struct Trigger {
    pub kind: TriggerKind,
    /// Typed inputs (manual triggers only)
    pub inputs: Vec<InputSpec>,
    /// Branch filters (push triggers only)
    pub branches: Vec<String>,
    /// Tag filters (push triggers only)
    pub tags: Vec<String>,
    /// Cron expressions (schedule triggers only)
    pub cron: Vec<String>,
}

impl Trigger {
    pub fn new(kind: TriggerKind) -> Self {
        Self {
            kind,
            inputs: Vec::new(),
            branches: Vec::new(),
            tags: Vec::new(),
            cron: Vec::new(),
        }
    }
}

/// Type of a trigger input
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InputType {
    String,
    Boolean,
    Number,
    Choice(Vec<String>),
}

/// Input parameter declared on a manual trigger
#[derive(Debug, Clone, Serialize)]
pub struct InputSpec {
    pub name: String,
    pub description: Option<String>,
    pub required: bool,
    pub input_type: InputType,
    pub default: Option<String>,
}

/// One matrix dimension
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MatrixAxis {
    pub name: String,
    pub values: Vec<String>,
}

impl MatrixAxis {
    pub fn new(name: impl Into<String>, values: Vec<String>) -> Self {
        Self {
            name: name.into(),
            values,
        }
    }
}

/// Matrix and scheduling settings of a job
#[derive(Debug, Clone, Default, Serialize)]
pub struct Strategy {
    /// Axes in declaration order
    pub axes: Vec<MatrixAxis>,
    /// Cancel remaining instances after the first failure
    pub fail_fast: bool,
    /// Upper bound on concurrently running instances of this job
    pub max_parallel: Option<usize>,
}

/// Condition under which a step runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunCondition {
    /// Only while no earlier step has failed
    #[default]
    Success,
    /// Regardless of earlier failures
    Always,
    /// Only after an earlier step failed
    Failure,
}

impl RunCondition {
    /// Parse an `if:` expression. Accepts the bare function or `${{ fn() }}`.
    pub fn parse(expression: &str) -> Option<Self> {
        let trimmed = expression.trim();
        let inner = trimmed
            .strip_prefix("${{")
            .and_then(|rest| rest.strip_suffix("}}"))
            .unwrap_or(trimmed)
            .trim();

        match inner {
            "success()" => Some(RunCondition::Success),
            "always()" => Some(RunCondition::Always),
            "failure()" => Some(RunCondition::Failure),
            _ => None,
        }
    }
}

/// Retry policy for a step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RetryPolicy {
    /// Additional attempts after the first failure
    pub count: u32,
    /// Delay before the first retry; doubled for each further retry
    pub backoff: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based)
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry.saturating_sub(1)).unwrap_or(u32::MAX);
        self.backoff.saturating_mul(factor)
    }
}

/// Reference to a reusable action, e.g. `actions/checkout@v4`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActionRef {
    pub name: String,
    pub version: Option<String>,
}

impl ActionRef {
    pub fn parse(reference: &str) -> Self {
        match reference.split_once('@') {
            Some((name, version)) => Self {
                name: name.trim().to_string(),
                version: Some(version.trim().to_string()),
            },
            None => Self {
                name: reference.trim().to_string(),
                version: None,
            },
        }
    }

    /// Last path segment of the action name (`checkout` for `actions/checkout`)
    pub fn short_name(&self) -> &str {
        self.name.rsplit('/').next().unwrap_or(&self.name)
    }
}

impl fmt::Display for ActionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.version {
            Some(version) => write!(f, "{}@{}", self.name, version),
            None => f.write_str(&self.name),
        }
    }
}

/// What a step does
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    /// Inline shell command
    InlineCommand {
        script: String,
        shell: Option<String>,
    },
    /// Reusable action
    ActionReference(ActionRef),
}

/// A single step of a job
#[derive(Debug, Clone, Serialize)]
pub struct StepSpec {
    /// Position in the job (0-based)
    pub index: usize,
    pub id: Option<String>,
    pub name: Option<String>,
    pub kind: StepKind,
    /// Action parameters (unresolved placeholders allowed)
    pub with: IndexMap<String, String>,
    pub env: IndexMap<String, String>,
    pub working_directory: Option<String>,
    pub continue_on_error: bool,
    pub condition: RunCondition,
    pub retry: Option<RetryPolicy>,
    pub timeout: Option<Duration>,
}

impl StepSpec {
    /// Human readable name for progress output
    pub fn display_name(&self) -> String {
        if let Some(name) = &self.name {
            return name.clone();
        }
        match &self.kind {
            StepKind::ActionReference(action) => format!("Run {}", action),
            StepKind::InlineCommand { script, .. } => {
                let first_line = script.lines().next().unwrap_or_default().trim();
                if first_line.chars().count() > 50 {
                    let truncated: String = first_line.chars().take(47).collect();
                    format!("Run {}...", truncated)
                } else {
                    format!("Run {}", first_line)
                }
            }
        }
    }

    /// Whether the step may still run after an earlier failure
    pub fn always_runs(&self) -> bool {
        self.condition == RunCondition::Always
    }
}

/// A validated job, shared read-only by all of its instances
#[derive(Debug, Clone, Serialize)]
pub struct JobDefinition {
    /// Key of the job in the workflow file
    pub id: String,
    pub name: Option<String>,
    pub workflow_name: String,
    pub triggers: Vec<Trigger>,
    /// Workflow env merged with job env (job wins)
    pub env: IndexMap<String, String>,
    pub strategy: Strategy,
    /// Image for container isolation
    pub container: Option<String>,
    pub timeout: Option<Duration>,
    pub steps: Vec<StepSpec>,
}

impl JobDefinition {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    /// Input schema of the manual trigger, if one is declared
    pub fn inputs(&self) -> &[InputSpec] {
        self.triggers
            .iter()
            .find(|trigger| trigger.kind == TriggerKind::Manual)
            .map(|trigger| trigger.inputs.as_slice())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_condition_parse() {
        assert_eq!(RunCondition::parse("always()"), Some(RunCondition::Always));
        assert_eq!(
            RunCondition::parse("${{ failure() }}"),
            Some(RunCondition::Failure)
        );
        assert_eq!(RunCondition::parse(" success() "), Some(RunCondition::Success));
        assert_eq!(RunCondition::parse("github.ref == 'main'"), None);
    }

    #[test]
    fn test_action_ref_parse() {
        let action = ActionRef::parse("actions/upload-artifact@v4");
        assert_eq!(action.name, "actions/upload-artifact");
        assert_eq!(action.version.as_deref(), Some("v4"));
        assert_eq!(action.short_name(), "upload-artifact");
        assert_eq!(action.to_string(), "actions/upload-artifact@v4");

        let local = ActionRef::parse("checkout");
        assert_eq!(local.short_name(), "checkout");
        assert!(local.version.is_none());
    }

    #[test]
    fn test_retry_delay_doubles() {
        let policy = RetryPolicy {
            count: 3,
            backoff: Duration::from_millis(100),
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
    }

    #[test]
    fn test_trigger_kind_from_str() {
        assert_eq!("workflow_dispatch".parse::<TriggerKind>(), Ok(TriggerKind::Manual));
        assert_eq!("schedule".parse::<TriggerKind>(), Ok(TriggerKind::Schedule));
        assert!("pull_request".parse::<TriggerKind>().is_err());
    }

    #[test]
    fn test_step_display_name() {
        let mut step = StepSpec {
            index: 0,
            id: None,
            name: None,
            kind: StepKind::InlineCommand {
                script: "poe --directory ./a test\nmv coverage.xml out.xml".to_string(),
                shell: None,
            },
            with: IndexMap::new(),
            env: IndexMap::new(),
            working_directory: None,
            continue_on_error: false,
            condition: RunCondition::Success,
            retry: None,
            timeout: None,
        };
        assert_eq!(step.display_name(), "Run poe --directory ./a test");

        step.kind = StepKind::ActionReference(ActionRef::parse("actions/checkout@v4"));
        assert_eq!(step.display_name(), "Run actions/checkout@v4");

        step.name = Some("Checkout".to_string());
        assert_eq!(step.display_name(), "Checkout");
    }
}
