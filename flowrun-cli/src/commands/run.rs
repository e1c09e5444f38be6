use crate::commands::{load_config, load_workflow, parse_assignments, GlobalArgs};
use crate::output;

use std::collections::HashMap;
use std::path::PathBuf;

use clap::Args;
use color_eyre::eyre::WrapErr;
use color_eyre::Result;

use flowrun_engine::execution::events::LogLevel;
use flowrun_engine::{
    progress_channel, CancellationToken, Engine, ExecutionEvent, InstanceStatus, RunId, RunReport,
    RunRequest, StepStatus, TriggerKind,
};

/// Run a workflow locally
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Path to the workflow YAML file
    pub workflow: PathBuf,

    /// Run only a specific job
    #[arg(long, value_name = "JOB")]
    pub job: Option<String>,

    /// Trigger to simulate: manual, push or schedule
    #[arg(long, default_value = "manual", value_name = "EVENT")]
    pub event: TriggerKind,

    /// Set a trigger input (can be repeated, format: name=value)
    #[arg(long = "input", short = 'i', value_name = "NAME=VALUE")]
    pub inputs: Vec<String>,

    /// Maximum number of instances running at once
    #[arg(long = "jobs", short = 'j', value_name = "N", env = "FLOWRUN_MAX_PARALLEL")]
    pub max_parallel: Option<usize>,

    /// Run identifier (default: generated)
    #[arg(long, value_name = "ID")]
    pub run_id: Option<String>,

    /// Directory checked out into every workspace (default: repository root)
    #[arg(long, value_name = "DIR", env = "FLOWRUN_SOURCE")]
    pub source: Option<PathBuf>,

    /// Where instance environments are created
    #[arg(long, value_name = "DIR", env = "FLOWRUN_WORK_ROOT")]
    pub work_root: Option<PathBuf>,

    /// Where artifacts are stored
    #[arg(long, value_name = "DIR", env = "FLOWRUN_ARTIFACT_DIR")]
    pub artifact_dir: Option<PathBuf>,

    /// Keep instance directories after the run
    #[arg(long, env = "FLOWRUN_KEEP_WORKSPACES")]
    pub keep_workspaces: bool,

    /// Print the run report as JSON on stdout
    #[arg(long)]
    pub json: bool,
}

/// Run the workflow and return the process exit code
pub async fn execute(args: RunArgs, global: &GlobalArgs) -> Result<i32> {
    let workflow = load_workflow(&args.workflow)?;

    let mut config = load_config(global, args.source.as_deref())?;
    if let Some(max_parallel) = args.max_parallel {
        config.max_parallel = max_parallel;
    }
    if let Some(dir) = args.work_root {
        config.work_root = dir;
    }
    if let Some(dir) = args.artifact_dir {
        config.artifact_dir = dir;
    }
    if args.keep_workspaces {
        config.keep_workspaces = true;
    }
    tracing::debug!(
        max_parallel = config.max_parallel,
        work_root = %config.work_root.display(),
        artifact_dir = %config.artifact_dir.display(),
        source_dir = %config.source_dir.display(),
        "effective config"
    );

    let mut request = RunRequest::new(args.event);
    for (name, value) in parse_assignments(&args.inputs)? {
        request = request.with_input(name, value);
    }
    if let Some(job) = args.job {
        request = request.with_job(job);
    }
    if let Some(run_id) = args.run_id {
        request = request.with_run_id(RunId::parse(run_id)?);
    }

    output::status("Running", &format!("{}", args.workflow.display()));
    output::info(&format!(
        "Workflow '{}': {} jobs, up to {} instances in parallel",
        workflow.name,
        workflow.jobs.len(),
        config.max_parallel
    ));

    let (tx, mut rx) = progress_channel();
    let engine = Engine::new(config).with_progress(tx);

    // Ctrl-C cancels the run; finished instances and artifacts are kept
    let cancel = CancellationToken::new();
    let signal_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            output::warning("Cancelling run...");
            signal_token.cancel();
        }
    });

    // Spawn execution in background
    let exec_handle = tokio::spawn(async move { engine.run(&workflow, request, &cancel).await });

    // Process events in the foreground
    let mut printer = EventPrinter::new(!(global.quiet || args.json));
    while let Some(event) = rx.recv().await {
        printer.print(&event);
    }

    let report = exec_handle.await.wrap_err("Run task failed")??;

    if args.json {
        println!("{}", report.to_json()?);
    }
    print_summary(&report);

    Ok(report.exit_code())
}

/// Renders progress events, prefixing lines with the instance label
struct EventPrinter {
    verbose: bool,
    labels: HashMap<String, String>,
}

impl EventPrinter {
    fn new(verbose: bool) -> Self {
        Self {
            verbose,
            labels: HashMap::new(),
        }
    }

    fn label<'a>(&'a self, instance: &'a str) -> &'a str {
        self.labels.get(instance).map(String::as_str).unwrap_or(instance)
    }

    fn print(&mut self, event: &ExecutionEvent) {
        match event {
            ExecutionEvent::RunStarted {
                run_id,
                workflow,
                total_instances,
            } => {
                eprintln!();
                output::header(&format!(
                    "Workflow '{}' ({} instances, run {})",
                    workflow, total_instances, run_id
                ));
            }

            ExecutionEvent::RunCompleted { .. } => {}

            ExecutionEvent::InstanceStarted {
                instance,
                label,
                total_steps,
            } => {
                self.labels.insert(instance.clone(), label.clone());
                if self.verbose {
                    eprintln!("    Instance '{}' ({} steps)", label, total_steps);
                }
            }

            ExecutionEvent::InstanceCompleted {
                instance,
                label,
                status,
                duration,
            } => {
                self.labels.remove(instance);
                let line = format!(
                    "    Instance '{}' {} ({})",
                    label,
                    status,
                    output::seconds(*duration)
                );
                match status {
                    InstanceStatus::Succeeded => output::dim_success(&line),
                    _ => output::dim_failure(&line),
                }
            }

            ExecutionEvent::StepStarted {
                instance,
                step_index,
                display_name,
            } => {
                if self.verbose {
                    eprintln!(
                        "      [{}] Step {}: {}",
                        self.label(instance),
                        step_index + 1,
                        display_name
                    );
                }
            }

            ExecutionEvent::StepOutput {
                instance,
                output,
                is_error,
                ..
            } => {
                if !self.verbose {
                    return;
                }
                let label = self.label(instance);
                for line in output.lines() {
                    if *is_error {
                        output::step_error(label, line);
                    } else {
                        output::step_output(label, line);
                    }
                }
            }

            ExecutionEvent::StepRetrying {
                instance,
                step_index,
                attempt,
                delay,
            } => {
                output::warning(&format!(
                    "      [{}] Step {} failed, attempt {} in {}",
                    self.label(instance),
                    step_index + 1,
                    attempt,
                    output::seconds(*delay)
                ));
            }

            ExecutionEvent::StepCompleted {
                instance,
                step_index,
                status,
                duration,
                exit_code,
            } => {
                if !self.verbose && *status != StepStatus::Failed {
                    return;
                }
                let symbol = match status {
                    StepStatus::Succeeded => "OK",
                    StepStatus::Failed => "FAIL",
                    StepStatus::Skipped => "SKIP",
                    StepStatus::Cancelled => "CANCELLED",
                };
                let exit_info = match exit_code {
                    Some(code) if *code != 0 => format!(" (exit code: {})", code),
                    _ => String::new(),
                };
                let line = format!(
                    "      [{}] Step {} {} ({}){}",
                    self.label(instance),
                    step_index + 1,
                    symbol,
                    output::seconds(*duration),
                    exit_info
                );
                match status {
                    StepStatus::Succeeded => output::dim_success(&line),
                    StepStatus::Failed => output::dim_failure(&line),
                    _ => output::dim(&line),
                }
            }

            ExecutionEvent::StepSkipped {
                instance,
                display_name,
                reason,
                ..
            } => {
                if self.verbose {
                    output::dim(&format!(
                        "      [{}] {} skipped: {}",
                        self.label(instance),
                        display_name,
                        reason
                    ));
                }
            }

            ExecutionEvent::ArtifactUploaded {
                instance,
                name,
                size,
            } => {
                if self.verbose {
                    output::dim(&format!(
                        "      [{}] Uploaded artifact '{}' ({})",
                        self.label(instance),
                        name,
                        output::size(*size)
                    ));
                }
            }

            ExecutionEvent::Log {
                level,
                message,
                instance,
            } => {
                let message = match instance {
                    Some(instance) => format!("[{}] {}", self.label(instance), message),
                    None => message.clone(),
                };
                match level {
                    LogLevel::Error => output::error(&message),
                    LogLevel::Warning => output::warning(&message),
                    _ if self.verbose => output::dim(&message),
                    _ => {}
                }
            }
        }
    }
}

/// One line per instance with its failing step and artifacts, then totals
fn print_summary(report: &RunReport) {
    eprintln!();
    output::header(&format!("Summary of run {}", report.run_id));

    for result in &report.results {
        let line = format!(
            "{} [{}] ({})",
            result.label,
            result.status,
            output::seconds(result.duration)
        );
        match result.status {
            InstanceStatus::Succeeded => output::success(&line),
            _ => output::failure(&line),
        }

        if let Some(step) = result.failed_step() {
            let reason = step.error.as_deref().unwrap_or("failed");
            output::dim(&format!("      failed at step {} '{}': {}", step.index + 1, step.name, reason));
        } else if let Some(error) = &result.error {
            output::dim(&format!("      {}", error));
        }
        for artifact in &result.artifacts {
            output::dim(&format!(
                "      artifact {} ({})",
                artifact.handle.name,
                output::size(artifact.handle.size)
            ));
        }
    }

    let totals = format!(
        "{} succeeded, {} failed, {} cancelled in {}",
        report.succeeded(),
        report.failed(),
        report.cancelled(),
        output::seconds(report.duration)
    );
    eprintln!();
    if report.is_success() {
        output::success(&totals);
    } else {
        output::failure(&totals);
    }
}
