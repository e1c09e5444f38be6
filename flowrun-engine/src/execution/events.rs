// Execution Events
// Progress reporting and event types for workflow execution

use crate::execution::report::{InstanceStatus, StepStatus};

use std::time::Duration;
use tokio::sync::mpsc;

/// Sender for execution progress events
pub type ProgressSender = mpsc::UnboundedSender<ExecutionEvent>;

/// Receiver for execution progress events
pub type ProgressReceiver = mpsc::UnboundedReceiver<ExecutionEvent>;

/// Create a new progress channel
pub fn progress_channel() -> (ProgressSender, ProgressReceiver) {
    mpsc::unbounded_channel()
}

/// Events emitted during a run.
///
/// `instance` fields carry the instance key (`<job>-<index>`).
#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    /// Run started, all instances expanded
    RunStarted {
        run_id: String,
        workflow: String,
        total_instances: usize,
    },

    /// Run completed
    RunCompleted {
        run_id: String,
        success: bool,
        duration: Duration,
    },

    /// Instance environment provisioned, steps about to run
    InstanceStarted {
        instance: String,
        label: String,
        total_steps: usize,
    },

    /// Instance finished
    InstanceCompleted {
        instance: String,
        label: String,
        status: InstanceStatus,
        duration: Duration,
    },

    /// Step execution started
    StepStarted {
        instance: String,
        step_index: usize,
        display_name: String,
    },

    /// Step output (stdout/stderr)
    StepOutput {
        instance: String,
        step_index: usize,
        output: String,
        is_error: bool,
    },

    /// Step failed and will be attempted again after `delay`
    StepRetrying {
        instance: String,
        step_index: usize,
        attempt: u32,
        delay: Duration,
    },

    /// Step execution completed
    StepCompleted {
        instance: String,
        step_index: usize,
        status: StepStatus,
        duration: Duration,
        exit_code: Option<i32>,
    },

    /// Step did not run
    StepSkipped {
        instance: String,
        step_index: usize,
        display_name: String,
        reason: String,
    },

    /// Artifact stored
    ArtifactUploaded {
        instance: String,
        name: String,
        size: u64,
    },

    /// Log message (info, warning, error)
    Log {
        level: LogLevel,
        message: String,
        instance: Option<String>,
    },
}

/// Log level for log events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl ExecutionEvent {
    pub fn run_started(
        run_id: impl Into<String>,
        workflow: impl Into<String>,
        total_instances: usize,
    ) -> Self {
        Self::RunStarted {
            run_id: run_id.into(),
            workflow: workflow.into(),
            total_instances,
        }
    }

    pub fn run_completed(run_id: impl Into<String>, success: bool, duration: Duration) -> Self {
        Self::RunCompleted {
            run_id: run_id.into(),
            success,
            duration,
        }
    }

    pub fn instance_started(
        instance: impl Into<String>,
        label: impl Into<String>,
        total_steps: usize,
    ) -> Self {
        Self::InstanceStarted {
            instance: instance.into(),
            label: label.into(),
            total_steps,
        }
    }

    pub fn instance_completed(
        instance: impl Into<String>,
        label: impl Into<String>,
        status: InstanceStatus,
        duration: Duration,
    ) -> Self {
        Self::InstanceCompleted {
            instance: instance.into(),
            label: label.into(),
            status,
            duration,
        }
    }

    pub fn step_started(
        instance: impl Into<String>,
        step_index: usize,
        display_name: impl Into<String>,
    ) -> Self {
        Self::StepStarted {
            instance: instance.into(),
            step_index,
            display_name: display_name.into(),
        }
    }

    pub fn step_output(
        instance: impl Into<String>,
        step_index: usize,
        output: impl Into<String>,
        is_error: bool,
    ) -> Self {
        Self::StepOutput {
            instance: instance.into(),
            step_index,
            output: output.into(),
            is_error,
        }
    }

    pub fn step_completed(
        instance: impl Into<String>,
        step_index: usize,
        status: StepStatus,
        duration: Duration,
        exit_code: Option<i32>,
    ) -> Self {
        Self::StepCompleted {
            instance: instance.into(),
            step_index,
            status,
            duration,
            exit_code,
        }
    }

    pub fn step_skipped(
        instance: impl Into<String>,
        step_index: usize,
        display_name: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::StepSkipped {
            instance: instance.into(),
            step_index,
            display_name: display_name.into(),
            reason: reason.into(),
        }
    }

    /// Create an info log event
    pub fn info(message: impl Into<String>, instance: Option<String>) -> Self {
        Self::Log {
            level: LogLevel::Info,
            message: message.into(),
            instance,
        }
    }

    /// Create a warning log event
    pub fn warning(message: impl Into<String>, instance: Option<String>) -> Self {
        Self::Log {
            level: LogLevel::Warning,
            message: message.into(),
            instance,
        }
    }

    /// Create an error log event
    pub fn error(message: impl Into<String>, instance: Option<String>) -> Self {
        Self::Log {
            level: LogLevel::Error,
            message: message.into(),
            instance,
        }
    }
}

/// Helper trait for sending events, ignoring errors (fire-and-forget)
pub trait EventSender {
    fn send_event(&self, event: ExecutionEvent);
}

impl EventSender for ProgressSender {
    fn send_event(&self, event: ExecutionEvent) {
        let _ = self.send(event);
    }
}

impl EventSender for Option<ProgressSender> {
    fn send_event(&self, event: ExecutionEvent) {
        if let Some(sender) = self {
            let _ = sender.send(event);
        }
    }
}
