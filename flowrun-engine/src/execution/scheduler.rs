// Scheduler
// Dispatches job instances into isolated environments under a concurrency bound

use crate::environment::EnvironmentProvider;
use crate::execution::events::{EventSender, ExecutionEvent, ProgressSender};
use crate::execution::executor::StepExecutor;
use crate::execution::matrix::JobInstance;
use crate::execution::report::{ExecutionResult, InstanceStatus};

use indexmap::IndexMap;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// Runs instances with at most `max_parallel` in flight.
///
/// A queued instance is dispatched as soon as a running one completes and
/// its job is below its own `strategy.max-parallel`. Failures stay local to
/// their instance unless the job opts into `fail-fast`.
pub struct Scheduler {
    provider: Arc<dyn EnvironmentProvider>,
    executor: StepExecutor,
    max_parallel: usize,
    event_tx: Option<ProgressSender>,
}

/// Per-job bookkeeping
struct JobSlot {
    order: usize,
    limit: usize,
    running: usize,
    fail_fast: bool,
    token: CancellationToken,
}

impl Scheduler {
    pub fn new(
        provider: Arc<dyn EnvironmentProvider>,
        executor: StepExecutor,
        max_parallel: usize,
    ) -> Self {
        Self {
            provider,
            executor,
            max_parallel: max_parallel.max(1),
            event_tx: None,
        }
    }

    /// Set progress event sender
    pub fn with_progress(mut self, tx: ProgressSender) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn max_parallel(&self) -> usize {
        self.max_parallel
    }

    /// Run every instance exactly once.
    ///
    /// Results are ordered by job then instance index, whatever the
    /// completion order. Cancelling `cancel` stops running instances and
    /// reports queued ones as cancelled without provisioning them.
    pub async fn run(
        &self,
        instances: Vec<JobInstance>,
        inputs: Arc<IndexMap<String, String>>,
        cancel: &CancellationToken,
    ) -> Vec<ExecutionResult> {
        let mut jobs: HashMap<String, JobSlot> = HashMap::new();
        for instance in &instances {
            let definition = &instance.definition;
            let order = jobs.len();
            jobs.entry(definition.id.clone()).or_insert_with(|| JobSlot {
                order,
                limit: definition
                    .strategy
                    .max_parallel
                    .unwrap_or(usize::MAX)
                    .clamp(1, self.max_parallel),
                running: 0,
                fail_fast: definition.strategy.fail_fast,
                token: cancel.child_token(),
            });
        }

        let mut queue: VecDeque<JobInstance> = instances.into();
        let mut running: JoinSet<ExecutionResult> = JoinSet::new();
        let mut results = Vec::with_capacity(queue.len());

        loop {
            if cancel.is_cancelled() {
                while let Some(instance) = queue.pop_front() {
                    results.push(self.not_started(&instance, InstanceStatus::Cancelled, None));
                }
            }

            self.dispatch(&mut queue, &mut jobs, &mut running, &inputs, &mut results);

            let Some(joined) = running.join_next().await else {
                // Nothing running and nothing dispatchable
                while let Some(instance) = queue.pop_front() {
                    let error = Some("instance could not be scheduled".to_string());
                    results.push(self.not_started(&instance, InstanceStatus::Failed, error));
                }
                break;
            };

            match joined {
                Ok(result) => {
                    if let Some(slot) = jobs.get_mut(&result.job_id) {
                        slot.running = slot.running.saturating_sub(1);
                        if slot.fail_fast && result.status == InstanceStatus::Failed && !slot.token.is_cancelled() {
                            tracing::warn!(job = %result.job_id, "fail-fast: cancelling remaining instances");
                            slot.token.cancel();
                        }
                    }
                    results.push(result);
                }
                // The instance task catches panics itself, so this is only
                // reachable when the runtime shuts down
                Err(e) => tracing::error!(error = %e, "instance task aborted"),
            }
        }

        results.sort_by_key(|result| {
            let order = jobs.get(&result.job_id).map_or(usize::MAX, |slot| slot.order);
            (order, result.index)
        });
        results
    }

    /// Start queued instances while capacity allows
    fn dispatch(
        &self,
        queue: &mut VecDeque<JobInstance>,
        jobs: &mut HashMap<String, JobSlot>,
        running: &mut JoinSet<ExecutionResult>,
        inputs: &Arc<IndexMap<String, String>>,
        results: &mut Vec<ExecutionResult>,
    ) {
        let mut waiting = VecDeque::with_capacity(queue.len());

        while let Some(instance) = queue.pop_front() {
            let Some(slot) = jobs.get_mut(&instance.definition.id) else {
                continue;
            };

            if slot.token.is_cancelled() {
                results.push(self.not_started(&instance, InstanceStatus::Cancelled, None));
                continue;
            }
            if running.len() >= self.max_parallel || slot.running >= slot.limit {
                waiting.push_back(instance);
                continue;
            }

            slot.running += 1;
            let token = slot.token.clone();
            self.spawn_instance(running, instance, Arc::clone(inputs), token);
        }

        *queue = waiting;
    }

    fn spawn_instance(
        &self,
        running: &mut JoinSet<ExecutionResult>,
        instance: JobInstance,
        inputs: Arc<IndexMap<String, String>>,
        token: CancellationToken,
    ) {
        let provider = Arc::clone(&self.provider);
        let executor = self.executor.clone();
        let event_tx = self.event_tx.clone();
        let span = tracing::info_span!("instance", instance = %instance.key(), label = %instance.label());
        let fallback = instance.clone();

        running.spawn(async move {
            let task = tokio::spawn(
                run_instance(provider, executor, instance, inputs, token, event_tx.clone()).instrument(span),
            );
            match task.await {
                Ok(result) => result,
                Err(e) => {
                    let message = format!("instance task failed: {}", e);
                    tracing::error!(instance = %fallback.key(), "{}", message);
                    event_tx.send_event(ExecutionEvent::error(message.clone(), Some(fallback.key())));
                    ExecutionResult::unstarted(&fallback, InstanceStatus::Failed, Some(message))
                }
            }
        });
    }

    fn not_started(
        &self,
        instance: &JobInstance,
        status: InstanceStatus,
        error: Option<String>,
    ) -> ExecutionResult {
        let result = ExecutionResult::unstarted(instance, status, error);
        self.event_tx.send_event(ExecutionEvent::instance_completed(
            instance.key(),
            result.label.as_str(),
            status,
            result.duration,
        ));
        result
    }
}

/// Provision, execute and release one instance
async fn run_instance(
    provider: Arc<dyn EnvironmentProvider>,
    executor: StepExecutor,
    instance: JobInstance,
    inputs: Arc<IndexMap<String, String>>,
    token: CancellationToken,
    event_tx: Option<ProgressSender>,
) -> ExecutionResult {
    if token.is_cancelled() {
        let result = ExecutionResult::unstarted(&instance, InstanceStatus::Cancelled, None);
        event_tx.send_event(ExecutionEvent::instance_completed(
            instance.key(),
            result.label.as_str(),
            result.status,
            result.duration,
        ));
        return result;
    }

    let environment = match provider.provision(&instance).await {
        Ok(environment) => environment,
        Err(e) => {
            let message = e.to_string();
            tracing::error!(error = %message, "failed to provision environment");
            event_tx.send_event(ExecutionEvent::error(message.clone(), Some(instance.key())));
            let result = ExecutionResult::unstarted(&instance, InstanceStatus::Failed, Some(message));
            event_tx.send_event(ExecutionEvent::instance_completed(
                instance.key(),
                result.label.as_str(),
                result.status,
                result.duration,
            ));
            return result;
        }
    };

    let result = executor.execute(&instance, &environment, &inputs, &token).await;
    provider.release(environment).await;
    result
}
