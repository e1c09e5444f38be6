// Step Executor
// Runs the steps of one job instance sequentially inside its environment

use crate::artifacts::{Artifact, ArtifactStore};
use crate::definition::{RunCondition, StepKind, StepSpec};
use crate::environment::IsolatedEnvironment;
use crate::error::EngineError;
use crate::execution::commands::{CommandUpdates, FileCommands};
use crate::execution::events::{EventSender, ExecutionEvent, ProgressSender};
use crate::execution::matrix::JobInstance;
use crate::execution::report::{ExecutionResult, InstanceStatus, StepResult, StepStatus};
use crate::execution::scope::VariableScope;
use crate::runners::{ActionRegistry, ShellRunner, StepContext, StepOutcome, StepRunner};

use indexmap::IndexMap;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Fallback per-step timeout (6 hours)
pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(360 * 60);

/// Why a step stopped the instance from running further steps
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interrupt {
    Cancelled,
    JobTimeout,
}

/// Everything recorded about one executed step
struct StepRun {
    result: StepResult,
    artifacts: Vec<Artifact>,
    interrupt: Option<Interrupt>,
}

/// Outcome of a single attempt
enum Attempt {
    Finished(StepOutcome),
    TimedOut(Duration),
    JobTimedOut,
    Cancelled,
}

/// Executes the steps of job instances.
///
/// Shared by all instances of a run; everything instance-specific lives in
/// the `VariableScope` created per call to [`StepExecutor::execute`].
#[derive(Clone)]
pub struct StepExecutor {
    shell: Arc<ShellRunner>,
    actions: Arc<ActionRegistry>,
    artifacts: Arc<dyn ArtifactStore>,
    source_dir: PathBuf,
    default_step_timeout: Duration,
    event_tx: Option<ProgressSender>,
}

impl StepExecutor {
    pub fn new(artifacts: Arc<dyn ArtifactStore>, source_dir: impl Into<PathBuf>) -> Self {
        Self {
            shell: Arc::new(ShellRunner::new()),
            actions: Arc::new(ActionRegistry::new()),
            artifacts,
            source_dir: source_dir.into(),
            default_step_timeout: DEFAULT_STEP_TIMEOUT,
            event_tx: None,
        }
    }

    pub fn with_shell_runner(mut self, shell: ShellRunner) -> Self {
        self.shell = Arc::new(shell);
        self
    }

    pub fn with_actions(mut self, actions: ActionRegistry) -> Self {
        self.actions = Arc::new(actions);
        self
    }

    /// Use a registry shared with other executors
    pub fn with_shared_actions(mut self, actions: Arc<ActionRegistry>) -> Self {
        self.actions = actions;
        self
    }

    /// Timeout for steps that do not declare `timeout-minutes`
    pub fn with_default_step_timeout(mut self, timeout: Duration) -> Self {
        self.default_step_timeout = timeout;
        self
    }

    /// Set progress event sender
    pub fn with_progress(mut self, tx: ProgressSender) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// Run every step of `instance` in `environment`
    pub async fn execute(
        &self,
        instance: &JobInstance,
        environment: &IsolatedEnvironment,
        inputs: &IndexMap<String, String>,
        cancel: &CancellationToken,
    ) -> ExecutionResult {
        let start = Instant::now();
        let definition = &instance.definition;
        let key = instance.key();
        let label = instance.label();
        // A timeout past the end of representable time never fires
        let deadline = definition.timeout.and_then(|timeout| start.checked_add(timeout));

        let mut scope = VariableScope::new(instance, inputs, environment.visible_workspace());

        self.event_tx.send_event(ExecutionEvent::instance_started(
            key.as_str(),
            label.as_str(),
            definition.steps.len(),
        ));
        tracing::info!(steps = definition.steps.len(), "instance started");

        let mut steps = Vec::with_capacity(definition.steps.len());
        let mut artifacts = Vec::new();
        let mut failed = false;
        let mut interrupt: Option<Interrupt> = None;

        for step in &definition.steps {
            if let Some(reason) = interrupt {
                let (status, message) = match reason {
                    Interrupt::Cancelled => (StepStatus::Cancelled, "run was cancelled"),
                    Interrupt::JobTimeout => (StepStatus::Skipped, "job timed out"),
                };
                steps.push(self.not_run(&key, step, status, message, &mut scope));
                continue;
            }

            if cancel.is_cancelled() {
                interrupt = Some(Interrupt::Cancelled);
                steps.push(self.not_run(&key, step, StepStatus::Cancelled, "run was cancelled", &mut scope));
                continue;
            }

            let should_run = match step.condition {
                RunCondition::Success => !failed,
                RunCondition::Always => true,
                RunCondition::Failure => failed,
            };
            if !should_run {
                let reason = match step.condition {
                    RunCondition::Failure => "no earlier step failed",
                    _ => "an earlier step failed",
                };
                steps.push(self.not_run(&key, step, StepStatus::Skipped, reason, &mut scope));
                continue;
            }

            let run = self
                .run_step(instance, environment, step, &mut scope, cancel, deadline)
                .await;

            artifacts.extend(run.artifacts);
            if run.result.status == StepStatus::Failed && !run.result.continued_on_error {
                failed = true;
            }
            // A job timeout fails the instance even on a continue-on-error step
            if run.interrupt == Some(Interrupt::JobTimeout) {
                failed = true;
            }
            if run.interrupt.is_some() {
                interrupt = run.interrupt;
            }
            scope.record_step(&run.result);
            steps.push(run.result);
        }

        let status = if interrupt == Some(Interrupt::Cancelled) {
            InstanceStatus::Cancelled
        } else if failed {
            InstanceStatus::Failed
        } else {
            InstanceStatus::Succeeded
        };
        let duration = start.elapsed();

        self.event_tx.send_event(ExecutionEvent::instance_completed(
            key.as_str(),
            label.as_str(),
            status,
            duration,
        ));
        tracing::info!(%status, duration_ms = duration.as_millis() as u64, "instance finished");

        ExecutionResult {
            job_id: definition.id.clone(),
            index: instance.index,
            total: instance.total,
            label,
            matrix: instance.values.clone(),
            status,
            steps,
            artifacts,
            error: None,
            duration,
        }
    }

    fn not_run(
        &self,
        key: &str,
        step: &StepSpec,
        status: StepStatus,
        reason: &str,
        scope: &mut VariableScope,
    ) -> StepResult {
        let display_name = step.display_name();
        tracing::debug!(step = %display_name, reason, "step not run");
        self.event_tx.send_event(ExecutionEvent::step_skipped(
            key,
            step.index,
            display_name.as_str(),
            reason,
        ));

        let result = StepResult::not_run(step.index, step.id.clone(), display_name, status);
        scope.record_step(&result);
        result
    }

    /// Copy of `step` with placeholders in its script, inputs and working
    /// directory resolved against the current scope
    fn resolve_step(step: &StepSpec, scope: &VariableScope) -> StepSpec {
        let mut resolved = step.clone();
        if let StepKind::InlineCommand { script, .. } = &mut resolved.kind {
            *script = scope.interpolate(script);
        }
        for value in resolved.with.values_mut() {
            *value = scope.interpolate(value);
        }
        resolved.working_directory = step
            .working_directory
            .as_deref()
            .map(|dir| scope.interpolate(dir));
        resolved
    }

    fn runner_for(&self, step: &StepSpec) -> Result<Arc<dyn StepRunner>, String> {
        match &step.kind {
            StepKind::InlineCommand { .. } => Ok(Arc::clone(&self.shell) as Arc<dyn StepRunner>),
            StepKind::ActionReference(action) => self
                .actions
                .resolve(action)
                .ok_or_else(|| format!("unknown action '{}'", action)),
        }
    }

    async fn run_step(
        &self,
        instance: &JobInstance,
        environment: &IsolatedEnvironment,
        step: &StepSpec,
        scope: &mut VariableScope,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
    ) -> StepRun {
        let start = Instant::now();
        let key = instance.key();
        let display_name = step.display_name();

        self.event_tx.send_event(ExecutionEvent::step_started(
            key.as_str(),
            step.index,
            display_name.as_str(),
        ));
        tracing::info!(step = %display_name, "step started");

        let resolved = Self::resolve_step(step, scope);
        let base_env = scope.step_environment(&step.env);
        let max_attempts = step.retry.as_ref().map_or(0, |retry| retry.count).saturating_add(1);

        let mut artifacts = Vec::new();
        let mut attempts = 0;
        let mut updates = CommandUpdates::default();
        let mut interrupt = None;

        let outcome = match self.runner_for(&resolved) {
            Err(e) => {
                attempts = 1;
                StepOutcome::failure(e)
            }
            Ok(runner) => loop {
                attempts += 1;
                let (attempt, attempt_updates) = self
                    .attempt(
                        instance,
                        environment,
                        &resolved,
                        runner.as_ref(),
                        &base_env,
                        scope,
                        cancel,
                        deadline,
                    )
                    .await;
                updates = attempt_updates;

                let outcome = match attempt {
                    Attempt::Finished(mut outcome) => {
                        artifacts.append(&mut outcome.artifacts);
                        outcome
                    }
                    Attempt::TimedOut(limit) => StepOutcome::failure(format!(
                        "step timed out after {}",
                        format_duration(limit)
                    )),
                    Attempt::JobTimedOut => {
                        interrupt = Some(Interrupt::JobTimeout);
                        StepOutcome::failure(format!(
                            "job exceeded its timeout of {}",
                            format_duration(instance.definition.timeout.unwrap_or_default())
                        ))
                    }
                    Attempt::Cancelled => {
                        interrupt = Some(Interrupt::Cancelled);
                        StepOutcome::failure(EngineError::Cancelled.to_string())
                    }
                };

                if outcome.is_success() || interrupt.is_some() || attempts >= max_attempts {
                    break outcome;
                }

                let delay = step
                    .retry
                    .as_ref()
                    .map_or(Duration::ZERO, |retry| retry.delay_for(attempts));
                tracing::warn!(
                    step = %display_name,
                    attempt = attempts,
                    error = outcome.error.as_deref().unwrap_or_default(),
                    delay_ms = delay.as_millis() as u64,
                    "step failed, retrying"
                );
                self.event_tx.send_event(ExecutionEvent::StepRetrying {
                    instance: key.clone(),
                    step_index: step.index,
                    attempt: attempts + 1,
                    delay,
                });

                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        interrupt = Some(Interrupt::Cancelled);
                        break StepOutcome::failure(EngineError::Cancelled.to_string());
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            },
        };

        // Env and PATH changes of the final attempt reach later steps, even
        // when the step failed
        if interrupt != Some(Interrupt::Cancelled) {
            scope.apply_env(updates.env);
            scope.prepend_path(updates.path);
        }

        let status = match (interrupt, outcome.is_success()) {
            (Some(Interrupt::Cancelled), _) => StepStatus::Cancelled,
            (_, true) => StepStatus::Succeeded,
            (_, false) => StepStatus::Failed,
        };
        let continued_on_error = status == StepStatus::Failed && step.continue_on_error;
        let duration = start.elapsed();

        if status == StepStatus::Failed {
            let failure = EngineError::StepExecution {
                step: display_name.clone(),
                exit_code: outcome.exit_code,
                reason: outcome.error.clone().unwrap_or_default(),
            };
            tracing::warn!(error = %failure, attempts, continued_on_error, "step failed");
        } else {
            tracing::info!(step = %display_name, %status, attempts, "step finished");
        }
        self.event_tx.send_event(ExecutionEvent::step_completed(
            key.as_str(),
            step.index,
            status,
            duration,
            outcome.exit_code,
        ));

        StepRun {
            result: StepResult {
                index: step.index,
                id: step.id.clone(),
                name: display_name,
                status,
                exit_code: outcome.exit_code,
                error: outcome.error,
                attempts,
                continued_on_error,
                outputs: updates.outputs,
                duration,
            },
            artifacts,
            interrupt,
        }
    }

    /// Run the step once, bounded by its timeout, the job deadline and
    /// cancellation. Command files are always collected.
    #[allow(clippy::too_many_arguments)]
    async fn attempt(
        &self,
        instance: &JobInstance,
        environment: &IsolatedEnvironment,
        step: &StepSpec,
        runner: &dyn StepRunner,
        base_env: &IndexMap<String, String>,
        scope: &VariableScope,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
    ) -> (Attempt, CommandUpdates) {
        let commands = match FileCommands::create(environment).await {
            Ok(commands) => commands,
            Err(e) => {
                let outcome = StepOutcome::failure(format!("failed to create command files: {}", e));
                return (Attempt::Finished(outcome), CommandUpdates::default());
            }
        };

        let mut env = base_env.clone();
        env.extend(commands.variables(environment));

        let ctx = StepContext {
            instance,
            environment,
            step,
            env: &env,
            path_prepends: scope.path_prepends(),
            artifacts: self.artifacts.as_ref(),
            source_dir: &self.source_dir,
            events: &self.event_tx,
        };

        let step_limit = step.timeout.unwrap_or(self.default_step_timeout);
        let job_remaining = deadline.map(|deadline| deadline.saturating_duration_since(Instant::now()));
        let (limit, job_bound) = match job_remaining {
            Some(remaining) if remaining < step_limit => (remaining, true),
            _ => (step_limit, false),
        };

        let attempt = tokio::select! {
            biased;
            _ = cancel.cancelled() => Attempt::Cancelled,
            result = tokio::time::timeout(limit, runner.run(&ctx)) => match result {
                Ok(outcome) => Attempt::Finished(outcome),
                Err(_) if job_bound => Attempt::JobTimedOut,
                Err(_) => Attempt::TimedOut(limit),
            },
        };

        (attempt, commands.collect().await)
    }
}

fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs >= 60 && secs % 60 == 0 {
        format!("{}m", secs / 60)
    } else if secs > 0 {
        format!("{}s", secs)
    } else {
        format!("{}ms", duration.as_millis())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::artifacts::MemoryArtifactStore;
    use crate::definition::{ActionRef, JobDefinition, RetryPolicy, Strategy};
    use crate::execution::events::progress_channel;
    use crate::execution::report::RunId;

    struct Harness {
        _dir: tempfile::TempDir,
        environment: IsolatedEnvironment,
        store: Arc<MemoryArtifactStore>,
        executor: StepExecutor,
    }

    impl Harness {
        async fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let environment = IsolatedEnvironment::create("test-0", dir.path().join("env"))
                .await
                .unwrap();
            let source = dir.path().join("source");
            std::fs::create_dir_all(&source).unwrap();
            let store = Arc::new(MemoryArtifactStore::new());
            let executor = StepExecutor::new(store.clone(), source);
            Self {
                _dir: dir,
                environment,
                store,
                executor,
            }
        }

        async fn run(&self, steps: Vec<StepSpec>) -> ExecutionResult {
            self.run_with(job(steps, None), &CancellationToken::new()).await
        }

        async fn run_with(&self, definition: JobDefinition, cancel: &CancellationToken) -> ExecutionResult {
            let instance = JobInstance {
                run_id: RunId::new("r1"),
                definition: Arc::new(definition),
                index: 0,
                total: 1,
                values: IndexMap::from([("package".to_string(), "./a".to_string())]),
            };
            self.executor
                .execute(&instance, &self.environment, &IndexMap::new(), cancel)
                .await
        }
    }

    fn job(steps: Vec<StepSpec>, timeout: Option<Duration>) -> JobDefinition {
        JobDefinition {
            id: "test".to_string(),
            name: None,
            workflow_name: "wf".to_string(),
            triggers: Vec::new(),
            env: IndexMap::new(),
            strategy: Strategy::default(),
            container: None,
            timeout,
            steps: steps
                .into_iter()
                .enumerate()
                .map(|(index, mut step)| {
                    step.index = index;
                    step
                })
                .collect(),
        }
    }

    fn run(script: &str) -> StepSpec {
        StepSpec {
            index: 0,
            id: None,
            name: None,
            kind: StepKind::InlineCommand {
                script: script.to_string(),
                shell: Some("sh".to_string()),
            },
            with: IndexMap::new(),
            env: IndexMap::new(),
            working_directory: None,
            continue_on_error: false,
            condition: RunCondition::Success,
            retry: None,
            timeout: None,
        }
    }

    fn with_id(mut step: StepSpec, id: &str) -> StepSpec {
        step.id = Some(id.to_string());
        step
    }

    fn statuses(result: &ExecutionResult) -> Vec<StepStatus> {
        result.steps.iter().map(|step| step.status).collect()
    }

    #[tokio::test]
    async fn test_all_steps_succeed() {
        let harness = Harness::new().await;
        let result = harness.run(vec![run("true"), run("echo ${{ matrix.package }}")]).await;

        assert_eq!(result.status, InstanceStatus::Succeeded);
        assert_eq!(statuses(&result), vec![StepStatus::Succeeded, StepStatus::Succeeded]);
        assert_eq!(result.label, "test (./a)");
    }

    #[tokio::test]
    async fn test_first_failure_skips_remaining_steps() {
        let harness = Harness::new().await;
        let result = harness
            .run(vec![run("exit 2"), run("touch ran"), run("touch ran-too")])
            .await;

        assert_eq!(result.status, InstanceStatus::Failed);
        assert_eq!(
            statuses(&result),
            vec![StepStatus::Failed, StepStatus::Skipped, StepStatus::Skipped]
        );
        assert_eq!(result.steps[0].exit_code, Some(2));
        assert_eq!(result.failed_step().map(|s| s.index), Some(0));
        assert!(!harness.environment.workspace.join("ran").exists());
    }

    #[tokio::test]
    async fn test_always_and_failure_conditions() {
        let harness = Harness::new().await;
        let mut always = run("touch always");
        always.condition = RunCondition::Always;
        let mut on_failure = run("touch on-failure");
        on_failure.condition = RunCondition::Failure;

        let result = harness
            .run(vec![run("false"), run("true"), always, on_failure])
            .await;

        assert_eq!(
            statuses(&result),
            vec![
                StepStatus::Failed,
                StepStatus::Skipped,
                StepStatus::Succeeded,
                StepStatus::Succeeded
            ]
        );
        assert!(harness.environment.workspace.join("always").exists());
        assert!(harness.environment.workspace.join("on-failure").exists());
        assert_eq!(result.status, InstanceStatus::Failed);
    }

    #[tokio::test]
    async fn test_failure_step_skipped_on_success() {
        let harness = Harness::new().await;
        let mut on_failure = run("true");
        on_failure.condition = RunCondition::Failure;

        let result = harness.run(vec![run("true"), on_failure]).await;
        assert_eq!(statuses(&result), vec![StepStatus::Succeeded, StepStatus::Skipped]);
        assert!(result.is_success());
    }

    #[tokio::test]
    async fn test_continue_on_error_keeps_instance_succeeded() {
        let harness = Harness::new().await;
        let mut flaky = with_id(run("exit 1"), "lint");
        flaky.continue_on_error = true;

        let result = harness
            .run(vec![flaky, run("test \"${{ steps.lint.outcome }}\" = failure")])
            .await;

        assert_eq!(result.status, InstanceStatus::Succeeded);
        assert!(result.steps[0].continued_on_error);
        assert_eq!(result.steps[0].status, StepStatus::Failed);
        assert_eq!(result.steps[1].status, StepStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_env_output_and_path_reach_later_steps() {
        let harness = Harness::new().await;
        let bin = harness.environment.root.join("bin");
        std::fs::create_dir_all(&bin).unwrap();
        let tool = bin.join("flowrun-test-tool");
        std::fs::write(&tool, "#!/bin/sh\necho tool\n").unwrap();
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let setup = with_id(
            run(&format!(
                "echo COVERAGE=cov.xml >> \"$FLOWRUN_ENV\"\n\
                 echo version=1.2 >> \"$GITHUB_OUTPUT\"\n\
                 echo {} >> \"$FLOWRUN_PATH\"",
                bin.display()
            )),
            "setup",
        );
        let check = run(
            "test \"$COVERAGE\" = cov.xml\n\
             test \"${{ steps.setup.outputs.version }}\" = 1.2\n\
             flowrun-test-tool",
        );

        let result = harness.run(vec![setup, check]).await;
        assert_eq!(result.status, InstanceStatus::Succeeded, "{:?}", result.steps);
        assert_eq!(result.steps[0].outputs["version"], "1.2");
    }

    #[tokio::test]
    async fn test_retry_stops_at_first_success() {
        let harness = Harness::new().await;
        let mut flaky = run("n=$(cat count 2>/dev/null || echo 0)\n\
             n=$((n+1)); echo $n > count\n\
             test $n -ge 2");
        flaky.retry = Some(RetryPolicy {
            count: 3,
            backoff: Duration::from_millis(5),
        });

        let result = harness.run(vec![flaky]).await;
        assert!(result.is_success());
        assert_eq!(result.steps[0].attempts, 2);
        let count = std::fs::read_to_string(harness.environment.workspace.join("count")).unwrap();
        assert_eq!(count.trim(), "2");
    }

    #[tokio::test]
    async fn test_retry_exhausted() {
        let harness = Harness::new().await;
        let mut broken = run("exit 1");
        broken.retry = Some(RetryPolicy {
            count: 2,
            backoff: Duration::from_millis(1),
        });

        let result = harness.run(vec![broken]).await;
        assert_eq!(result.status, InstanceStatus::Failed);
        assert_eq!(result.steps[0].attempts, 3);
    }

    #[tokio::test]
    async fn test_step_timeout_fails_step() {
        let harness = Harness::new().await;
        let mut slow = run("sleep 5");
        slow.timeout = Some(Duration::from_millis(100));

        let result = harness.run(vec![slow]).await;
        assert_eq!(result.status, InstanceStatus::Failed);
        assert!(result.steps[0].error.as_deref().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_job_timeout_skips_always_steps() {
        let harness = Harness::new().await;
        let mut always = run("true");
        always.condition = RunCondition::Always;

        let definition = job(vec![run("sleep 5"), always], Some(Duration::from_millis(100)));
        let result = harness.run_with(definition, &CancellationToken::new()).await;

        assert_eq!(result.status, InstanceStatus::Failed);
        assert!(result.steps[0].error.as_deref().unwrap().contains("job exceeded"));
        assert_eq!(result.steps[1].status, StepStatus::Skipped);
    }

    #[tokio::test]
    async fn test_job_timeout_fails_instance_despite_continue_on_error() {
        let harness = Harness::new().await;
        let mut slow = run("sleep 5");
        slow.continue_on_error = true;

        let definition = job(vec![slow, run("true")], Some(Duration::from_millis(100)));
        let result = harness.run_with(definition, &CancellationToken::new()).await;

        assert_eq!(result.status, InstanceStatus::Failed);
        assert_eq!(statuses(&result), vec![StepStatus::Failed, StepStatus::Skipped]);
    }

    #[tokio::test]
    async fn test_huge_timeouts_and_retry_count() {
        let harness = Harness::new().await;
        let mut step = run("true");
        step.retry = Some(RetryPolicy {
            count: u32::MAX,
            backoff: Duration::from_millis(1),
        });
        step.timeout = Some(Duration::MAX);

        let definition = job(vec![step], Some(Duration::MAX));
        let result = harness.run_with(definition, &CancellationToken::new()).await;

        assert_eq!(result.status, InstanceStatus::Succeeded);
        assert_eq!(result.steps[0].attempts, 1);
    }

    #[tokio::test]
    async fn test_env_file_cannot_override_matrix_variables() {
        let harness = Harness::new().await;
        let hijack = run("echo MATRIX_PACKAGE=hijacked >> \"$FLOWRUN_ENV\"");
        let check = run("test \"$MATRIX_PACKAGE\" = ./a");

        let result = harness.run(vec![hijack, check]).await;
        assert_eq!(result.status, InstanceStatus::Succeeded, "{:?}", result.steps);
    }

    #[tokio::test]
    async fn test_cancellation_marks_running_and_remaining_steps() {
        let harness = Harness::new().await;
        let mut always = run("touch always");
        always.condition = RunCondition::Always;
        let definition = job(vec![run("true"), run("sleep 5"), always], None);

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });

        let result = harness.run_with(definition, &cancel).await;
        assert_eq!(result.status, InstanceStatus::Cancelled);
        assert_eq!(
            statuses(&result),
            vec![StepStatus::Succeeded, StepStatus::Cancelled, StepStatus::Cancelled]
        );
        assert!(!harness.environment.workspace.join("always").exists());
    }

    #[tokio::test]
    async fn test_unknown_action_fails_step() {
        let harness = Harness::new().await;
        let mut step = run("");
        step.kind = StepKind::ActionReference(ActionRef::parse("actions/cache@v4"));

        let result = harness.run(vec![step]).await;
        assert_eq!(result.status, InstanceStatus::Failed);
        assert!(result.steps[0].error.as_deref().unwrap().contains("unknown action"));
    }

    #[tokio::test]
    async fn test_upload_after_failure_keeps_artifacts() {
        let harness = Harness::new().await;
        let mut upload = run("");
        upload.kind = StepKind::ActionReference(ActionRef::parse("actions/upload-artifact@v4"));
        upload.condition = RunCondition::Always;
        upload.with.insert("name".to_string(), "coverage-${{ strategy.job-index }}".to_string());
        upload.with.insert("path".to_string(), "./coverage_*.xml".to_string());

        let result = harness
            .run(vec![run("echo '<xml/>' > coverage_a.xml\nexit 1"), upload])
            .await;

        assert_eq!(result.status, InstanceStatus::Failed);
        assert_eq!(result.steps[1].status, StepStatus::Succeeded);
        assert_eq!(result.artifacts.len(), 1);
        assert_eq!(result.artifacts[0].handle.name, "coverage-0");
        assert_eq!(harness.store.len(), 1);
    }

    #[tokio::test]
    async fn test_events_follow_step_lifecycle() {
        let mut harness = Harness::new().await;
        let (tx, mut rx) = progress_channel();
        harness.executor = harness.executor.clone().with_progress(tx);

        harness.run(vec![run("echo hi")]).await;
        drop(harness);

        let mut kinds = Vec::new();
        while let Some(event) = rx.recv().await {
            kinds.push(match event {
                ExecutionEvent::InstanceStarted { .. } => "instance_started",
                ExecutionEvent::StepStarted { .. } => "step_started",
                ExecutionEvent::StepOutput { .. } => "output",
                ExecutionEvent::StepCompleted { .. } => "step_completed",
                ExecutionEvent::InstanceCompleted { .. } => "instance_completed",
                _ => "other",
            });
        }
        assert_eq!(
            kinds,
            vec!["instance_started", "step_started", "output", "step_completed", "instance_completed"]
        );
    }
}
