// Run results
// Per-step and per-instance outcomes and the aggregated run report

use crate::artifacts::Artifact;
use crate::definition::TriggerKind;
use crate::error::{EngineError, EngineResult};
use crate::execution::matrix::JobInstance;
use crate::utils::is_safe_segment;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Serialize, Serializer};

use std::fmt;
use std::time::Duration;

/// Identifier of a run, scoping its artifacts.
///
/// Run ids name directories under the work root and the artifact root, so
/// ids from outside the engine go through [`RunId::parse`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Validated run id
    pub fn parse(id: impl Into<String>) -> EngineResult<Self> {
        let id = id.into();
        Self::check(&id)?;
        Ok(Self(id))
    }

    /// Reject ids that are not a single safe path segment
    pub fn check(id: &str) -> EngineResult<()> {
        if is_safe_segment(id) {
            Ok(())
        } else {
            Err(EngineError::InvalidInput(format!(
                "invalid run id '{}': use letters, digits, '-', '_' or '.'",
                id
            )))
        }
    }

    /// Fresh random id
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Succeeded,
    Failed,
    Skipped,
    Cancelled,
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StepStatus::Succeeded => "succeeded",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
            StepStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Succeeded,
    Failed,
    Cancelled,
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InstanceStatus::Succeeded => "succeeded",
            InstanceStatus::Failed => "failed",
            InstanceStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Outcome of one step
#[derive(Debug, Clone, Serialize)]
pub struct StepResult {
    pub index: usize,
    pub id: Option<String>,
    pub name: String,
    pub status: StepStatus,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
    /// Number of attempts made (0 when the step never ran)
    pub attempts: u32,
    /// Failed, but `continue-on-error` kept the instance going
    pub continued_on_error: bool,
    pub outputs: IndexMap<String, String>,
    #[serde(rename = "duration_ms", serialize_with = "serialize_millis")]
    pub duration: Duration,
}

impl StepResult {
    /// A step that did not run
    pub fn not_run(index: usize, id: Option<String>, name: String, status: StepStatus) -> Self {
        Self {
            index,
            id,
            name,
            status,
            exit_code: None,
            error: None,
            attempts: 0,
            continued_on_error: false,
            outputs: IndexMap::new(),
            duration: Duration::ZERO,
        }
    }

    /// Outcome string exposed to later steps as `steps.<id>.outcome`
    pub fn outcome(&self) -> &'static str {
        match self.status {
            StepStatus::Succeeded => "success",
            StepStatus::Failed => "failure",
            StepStatus::Skipped => "skipped",
            StepStatus::Cancelled => "cancelled",
        }
    }
}

/// Outcome of one job instance
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub job_id: String,
    pub index: usize,
    pub total: usize,
    pub label: String,
    pub matrix: IndexMap<String, String>,
    pub status: InstanceStatus,
    pub steps: Vec<StepResult>,
    pub artifacts: Vec<Artifact>,
    /// Instance-level failure that is not attributable to a step
    pub error: Option<String>,
    #[serde(rename = "duration_ms", serialize_with = "serialize_millis")]
    pub duration: Duration,
}

impl ExecutionResult {
    /// Result of an instance whose steps never ran (provisioning failed or
    /// the run was cancelled while it was queued)
    pub fn unstarted(instance: &JobInstance, status: InstanceStatus, error: Option<String>) -> Self {
        let step_status = match status {
            InstanceStatus::Cancelled => StepStatus::Cancelled,
            _ => StepStatus::Skipped,
        };
        let steps = instance
            .definition
            .steps
            .iter()
            .map(|step| StepResult::not_run(step.index, step.id.clone(), step.display_name(), step_status))
            .collect();

        Self {
            job_id: instance.definition.id.clone(),
            index: instance.index,
            total: instance.total,
            label: instance.label(),
            matrix: instance.values.clone(),
            status,
            steps,
            artifacts: Vec::new(),
            error,
            duration: Duration::ZERO,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == InstanceStatus::Succeeded
    }

    /// First step whose failure decided the instance outcome
    pub fn failed_step(&self) -> Option<&StepResult> {
        self.steps
            .iter()
            .find(|step| step.status == StepStatus::Failed && !step.continued_on_error)
    }
}

/// Aggregated outcome of a run
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: RunId,
    pub workflow: String,
    pub trigger: TriggerKind,
    pub started_at: DateTime<Utc>,
    #[serde(rename = "duration_ms", serialize_with = "serialize_millis")]
    pub duration: Duration,
    /// Ordered by job then instance index
    pub results: Vec<ExecutionResult>,
}

impl RunReport {
    /// Pretty-printed JSON, as written by `flowrun run --json`
    pub fn to_json(&self) -> EngineResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn succeeded(&self) -> usize {
        self.count(InstanceStatus::Succeeded)
    }

    pub fn failed(&self) -> usize {
        self.count(InstanceStatus::Failed)
    }

    pub fn cancelled(&self) -> usize {
        self.count(InstanceStatus::Cancelled)
    }

    pub fn is_success(&self) -> bool {
        self.results.iter().all(ExecutionResult::is_success)
    }

    /// Process exit code: 0 when every instance succeeded, otherwise the
    /// number of unsuccessful instances, capped so it never wraps to 0
    pub fn exit_code(&self) -> i32 {
        let unsuccessful = self.failed() + self.cancelled();
        unsuccessful.min(255) as i32
    }

    pub fn artifacts(&self) -> impl Iterator<Item = &Artifact> {
        self.results.iter().flat_map(|result| result.artifacts.iter())
    }

    fn count(&self, status: InstanceStatus) -> usize {
        self.results
            .iter()
            .filter(|result| result.status == status)
            .count()
    }
}

fn serialize_millis<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(duration.as_millis() as u64)
}
