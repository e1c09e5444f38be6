// Run Engine
// Ties definition, matrix expansion, scheduling and reporting into one run

use crate::artifacts::{ArtifactStore, FsArtifactStore};
use crate::config::EngineConfig;
use crate::definition::{resolve_inputs, JobDefinition, TriggerKind, Workflow};
use crate::environment::{EnvironmentProvider, Provisioner};
use crate::error::{EngineError, EngineResult};
use crate::execution::events::{EventSender, ExecutionEvent, ProgressSender};
use crate::execution::executor::StepExecutor;
use crate::execution::matrix::MatrixExpander;
use crate::execution::report::{RunId, RunReport};
use crate::execution::scheduler::Scheduler;
use crate::runners::{ActionRegistry, ShellRunner};

use chrono::Utc;
use indexmap::IndexMap;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use std::sync::Arc;

/// Parameters of a single run
#[derive(Debug, Clone)]
pub struct RunRequest {
    /// Generated when not given
    pub run_id: Option<RunId>,
    pub event: TriggerKind,
    pub inputs: IndexMap<String, String>,
    /// Run only this job
    pub job: Option<String>,
}

impl RunRequest {
    pub fn new(event: TriggerKind) -> Self {
        Self {
            run_id: None,
            event,
            inputs: IndexMap::new(),
            job: None,
        }
    }

    pub fn with_run_id(mut self, run_id: RunId) -> Self {
        self.run_id = Some(run_id);
        self
    }

    pub fn with_input(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.inputs.insert(name.into(), value.into());
        self
    }

    pub fn with_job(mut self, job: impl Into<String>) -> Self {
        self.job = Some(job.into());
        self
    }
}

impl Default for RunRequest {
    fn default() -> Self {
        Self::new(TriggerKind::Manual)
    }
}

/// Entry point for executing workflows
pub struct Engine {
    config: EngineConfig,
    provider: Arc<dyn EnvironmentProvider>,
    artifacts: Arc<dyn ArtifactStore>,
    actions: Arc<ActionRegistry>,
    event_tx: Option<ProgressSender>,
}

impl Engine {
    /// Engine with host/Docker environments under `work-root` and the
    /// filesystem artifact store under `artifact-dir`
    pub fn new(config: EngineConfig) -> Self {
        let provider = Provisioner::with_work_root(&config.work_root, config.keep_workspaces);
        let artifacts = FsArtifactStore::new(&config.artifact_dir);
        Self {
            config,
            provider: Arc::new(provider),
            artifacts: Arc::new(artifacts),
            actions: Arc::new(ActionRegistry::new()),
            event_tx: None,
        }
    }

    pub fn with_provider(mut self, provider: Arc<dyn EnvironmentProvider>) -> Self {
        self.provider = provider;
        self
    }

    pub fn with_artifact_store(mut self, artifacts: Arc<dyn ArtifactStore>) -> Self {
        self.artifacts = artifacts;
        self
    }

    pub fn with_actions(mut self, actions: ActionRegistry) -> Self {
        self.actions = Arc::new(actions);
        self
    }

    /// Set progress event sender
    pub fn with_progress(mut self, tx: ProgressSender) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn artifacts(&self) -> &Arc<dyn ArtifactStore> {
        &self.artifacts
    }

    /// Execute `workflow`.
    ///
    /// Inputs are checked and every matrix is expanded before any
    /// environment is provisioned, so those errors abort the run without
    /// side effects. Everything after that is reported per instance in the
    /// returned report.
    pub async fn run(
        &self,
        workflow: &Workflow,
        request: RunRequest,
        cancel: &CancellationToken,
    ) -> EngineResult<RunReport> {
        self.config.validate()?;
        let jobs = Self::select_jobs(workflow, request.job.as_deref())?;
        let inputs = resolve_inputs(workflow.triggers(), request.event, &request.inputs)?;
        let run_id = request.run_id.unwrap_or_else(RunId::generate);
        RunId::check(run_id.as_str())?;
        let instances = MatrixExpander::expand_all(&jobs, &run_id)?;

        let shell = match self.config.shell()? {
            Some(default_shell) => ShellRunner::with_default_shell(default_shell),
            None => ShellRunner::new(),
        };
        let executor = StepExecutor::new(Arc::clone(&self.artifacts), &self.config.source_dir)
            .with_shell_runner(shell)
            .with_shared_actions(Arc::clone(&self.actions))
            .with_default_step_timeout(self.config.default_step_timeout());
        let mut scheduler = Scheduler::new(Arc::clone(&self.provider), executor, self.config.max_parallel);
        if let Some(tx) = &self.event_tx {
            scheduler = scheduler.with_progress(tx.clone());
        }

        let started_at = Utc::now();
        let start = Instant::now();
        let span = tracing::info_span!("run", run_id = %run_id, workflow = %workflow.name);

        span.in_scope(|| {
            tracing::info!(
                instances = instances.len(),
                max_parallel = scheduler.max_parallel(),
                trigger = %request.event,
                "run started"
            )
        });
        self.event_tx.send_event(ExecutionEvent::run_started(
            run_id.as_str(),
            workflow.name.as_str(),
            instances.len(),
        ));

        let results = scheduler
            .run(instances, Arc::new(inputs), cancel)
            .instrument(span.clone())
            .await;

        let report = RunReport {
            run_id,
            workflow: workflow.name.clone(),
            trigger: request.event,
            started_at,
            duration: start.elapsed(),
            results,
        };

        span.in_scope(|| {
            tracing::info!(
                succeeded = report.succeeded(),
                failed = report.failed(),
                cancelled = report.cancelled(),
                duration_ms = report.duration.as_millis() as u64,
                "run finished"
            )
        });
        self.event_tx.send_event(ExecutionEvent::run_completed(
            report.run_id.as_str(),
            report.is_success(),
            report.duration,
        ));

        Ok(report)
    }

    fn select_jobs(workflow: &Workflow, job: Option<&str>) -> EngineResult<Vec<Arc<JobDefinition>>> {
        let Some(id) = job else {
            return Ok(workflow.jobs.clone());
        };
        match workflow.job(id) {
            Some(job) => Ok(vec![Arc::clone(job)]),
            None => {
                let available: Vec<&str> = workflow.jobs.iter().map(|job| job.id.as_str()).collect();
                Err(EngineError::InvalidInput(format!(
                    "unknown job '{}' (available: {})",
                    id,
                    available.join(", ")
                )))
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::artifacts::MemoryArtifactStore;
    use crate::definition::DefinitionLoader;
    use crate::environment::{IsolatedEnvironment, LocalEnvironmentProvider};
    use crate::execution::events::progress_channel;
    use crate::execution::matrix::JobInstance;
    use crate::execution::report::InstanceStatus;

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    const WORKFLOW: &str = r#"
name: Matrix tests
on:
  workflow_dispatch:
    inputs:
      branch:
        description: Branch to test
        required: true
        type: string
jobs:
  test:
    strategy:
      max-parallel: 2
      matrix:
        package: ["./a", "./b", "./c"]
    steps:
      - uses: actions/checkout@v4
      - id: test
        shell: sh
        run: |
          test -f ${{ matrix.package }}/ok
          echo "tested ${{ inputs.branch }}" > coverage_${{ strategy.job-index }}.xml
      - uses: actions/upload-artifact@v4
        if: always()
        with:
          name: coverage-${{ strategy.job-index }}
          path: ./coverage_*.xml
          if-no-files-found: ignore
"#;

    /// Counts provisioning calls on top of the local provider
    struct CountingProvider {
        local: LocalEnvironmentProvider,
        provisioned: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl EnvironmentProvider for CountingProvider {
        async fn provision(&self, instance: &JobInstance) -> EngineResult<IsolatedEnvironment> {
            self.provisioned.fetch_add(1, Ordering::SeqCst);
            self.local.provision(instance).await
        }

        async fn release(&self, environment: IsolatedEnvironment) {
            self.local.release(environment).await
        }
    }

    struct Setup {
        _dir: tempfile::TempDir,
        engine: Engine,
        provider: Arc<CountingProvider>,
        store: Arc<MemoryArtifactStore>,
    }

    fn setup(packages_ok: &[&str]) -> Setup {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("source");
        for package in ["a", "b", "c"] {
            std::fs::create_dir_all(source.join(package)).unwrap();
        }
        for package in packages_ok {
            std::fs::write(source.join(package).join("ok"), "").unwrap();
        }

        let config = EngineConfig {
            max_parallel: 4,
            work_root: dir.path().join("work"),
            artifact_dir: dir.path().join("artifacts"),
            source_dir: source,
            ..EngineConfig::default()
        };
        let provider = Arc::new(CountingProvider {
            local: LocalEnvironmentProvider::new(dir.path().join("work"), false),
            provisioned: AtomicUsize::new(0),
        });
        let store = Arc::new(MemoryArtifactStore::new());
        let engine = Engine::new(config)
            .with_provider(provider.clone())
            .with_artifact_store(store.clone());

        Setup {
            _dir: dir,
            engine,
            provider,
            store,
        }
    }

    fn request() -> RunRequest {
        RunRequest::default()
            .with_run_id(RunId::new("run-1"))
            .with_input("branch", "main")
    }

    #[tokio::test]
    async fn test_successful_matrix_run() {
        let setup = setup(&["a", "b", "c"]);
        let workflow = DefinitionLoader::parse(WORKFLOW).unwrap();

        let report = setup
            .engine
            .run(&workflow, request(), &CancellationToken::new())
            .await
            .unwrap();

        assert!(report.is_success());
        assert_eq!(report.exit_code(), 0);
        assert_eq!(report.results.len(), 3);
        let names: Vec<_> = report.artifacts().map(|a| a.handle.name.clone()).collect();
        assert_eq!(names, vec!["coverage-0", "coverage-1", "coverage-2"]);

        let stored = setup
            .store
            .get(&report.results[1].artifacts[0].handle)
            .await
            .unwrap();
        assert_eq!(String::from_utf8(stored).unwrap().trim(), "tested main");
    }

    #[tokio::test]
    async fn test_failures_set_exit_code_and_keep_artifacts() {
        let setup = setup(&["a"]);
        let workflow = DefinitionLoader::parse(WORKFLOW).unwrap();

        let report = setup
            .engine
            .run(&workflow, request(), &CancellationToken::new())
            .await
            .unwrap();

        let statuses: Vec<_> = report.results.iter().map(|r| r.status).collect();
        assert_eq!(
            statuses,
            vec![InstanceStatus::Succeeded, InstanceStatus::Failed, InstanceStatus::Failed]
        );
        assert_eq!(report.exit_code(), 2);
        assert_eq!(report.results[1].failed_step().map(|s| s.index), Some(1));
        // The upload step still ran; it found nothing for the failed instances
        assert_eq!(setup.store.len(), 1);
    }

    #[tokio::test]
    async fn test_empty_axis_aborts_before_provisioning() {
        let setup = setup(&[]);
        let yaml = WORKFLOW.replace(r#"["./a", "./b", "./c"]"#, "[]");
        let workflow = DefinitionLoader::parse(&yaml).unwrap();

        let err = setup
            .engine
            .run(&workflow, request(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::EmptyAxis { .. }));
        assert!(err.is_fatal());
        assert_eq!(setup.provider.provisioned.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_invalid_inputs_and_job_filter() {
        let setup = setup(&["a", "b", "c"]);
        let workflow = DefinitionLoader::parse(WORKFLOW).unwrap();
        let cancel = CancellationToken::new();

        let missing = RunRequest::default();
        let err = setup.engine.run(&workflow, missing, &cancel).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));

        let push = RunRequest::new(TriggerKind::Push);
        assert!(setup.engine.run(&workflow, push, &cancel).await.is_err());

        let unknown_job = request().with_job("deploy");
        let err = setup.engine.run(&workflow, unknown_job, &cancel).await.unwrap_err();
        assert!(err.to_string().contains("deploy"));
        assert_eq!(setup.provider.provisioned.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unsafe_run_id_rejected_before_provisioning() {
        let setup = setup(&["a", "b", "c"]);
        let workflow = DefinitionLoader::parse(WORKFLOW).unwrap();

        let escaping = request().with_run_id(RunId::new("../outside"));
        let err = setup
            .engine
            .run(&workflow, escaping, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::InvalidInput(_)));
        assert_eq!(setup.provider.provisioned.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cancel_after_first_instance_keeps_its_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = r#"
on: workflow_dispatch
jobs:
  test:
    strategy:
      matrix:
        package: [a, b]
    steps:
      - shell: sh
        run: |
          echo ${{ matrix.package }} > out.txt
          if [ ${{ matrix.package }} = b ]; then sleep 5; fi
      - uses: upload-artifact
        with:
          name: out-${{ matrix.package }}
          path: out.txt
"#;
        let workflow = DefinitionLoader::parse(yaml).unwrap();
        let config = EngineConfig {
            max_parallel: 1,
            work_root: dir.path().join("work"),
            source_dir: dir.path().to_path_buf(),
            ..EngineConfig::default()
        };
        let store = Arc::new(MemoryArtifactStore::new());
        let (tx, mut rx) = progress_channel();
        let engine = Engine::new(config)
            .with_artifact_store(store.clone())
            .with_progress(tx);

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let ExecutionEvent::InstanceStarted { instance, .. } = event {
                    if instance == "test-1" {
                        tokio::time::sleep(Duration::from_millis(200)).await;
                        trigger.cancel();
                    }
                }
            }
        });

        let report = engine
            .run(&workflow, RunRequest::default(), &cancel)
            .await
            .unwrap();

        assert_eq!(report.results[0].status, InstanceStatus::Succeeded);
        assert_eq!(report.results[1].status, InstanceStatus::Cancelled);
        assert_eq!(report.exit_code(), 1);
        let handles = store.list(&report.run_id).await.unwrap();
        let names: Vec<_> = handles.iter().map(|h| h.name.as_str()).collect();
        assert_eq!(names, vec!["out-a"]);
    }
}
