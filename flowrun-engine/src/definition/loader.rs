// Definition Loader
// Parses workflow YAML and validates it into job definitions

use crate::definition::error::ParseError;
use crate::definition::job::{
    ActionRef, InputSpec, InputType, JobDefinition, MatrixAxis, RetryPolicy, RunCondition,
    StepKind, StepSpec, Strategy, Trigger, TriggerKind, Workflow,
};
use crate::definition::models::{
    ContainerSpec, InputSpecRaw, JobSpec, ManualTriggerSpec, PushTriggerSpec, ScheduleEntry,
    StepSpecRaw, WorkflowFile,
};

use indexmap::IndexMap;
use serde_yaml::Value;

use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Loads workflow YAML into validated job definitions.
pub struct DefinitionLoader;

impl DefinitionLoader {
    /// Load a workflow from a file path.
    ///
    /// A workflow without a `name` is named after the file stem.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Workflow, ParseError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            ParseError::io(format!("failed to read {}: {}", path.display(), e))
        })?;
        let fallback = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or("workflow");
        Self::parse_named(&content, fallback)
    }

    /// Load a workflow from a YAML string.
    pub fn parse(content: &str) -> Result<Workflow, ParseError> {
        Self::parse_named(content, "workflow")
    }

    fn parse_named(content: &str, fallback_name: &str) -> Result<Workflow, ParseError> {
        let file: WorkflowFile = serde_yaml::from_str(content)
            .map_err(|e| ParseError::from_yaml_error(&e, content))?;
        Self::build(file, fallback_name)
    }

    /// Validate the raw file and convert it into job definitions.
    pub fn build(file: WorkflowFile, fallback_name: &str) -> Result<Workflow, ParseError> {
        let workflow_name = file
            .name
            .clone()
            .unwrap_or_else(|| fallback_name.to_string());

        if file.jobs.is_empty() {
            return Err(ParseError::validation(
                "workflow defines no jobs",
                "jobs",
            ));
        }

        let triggers = Self::build_triggers(&file)?;

        let mut jobs = Vec::with_capacity(file.jobs.len());
        for (job_id, job) in &file.jobs {
            let definition =
                Self::build_job(job_id, job, &workflow_name, &triggers, &file.env)?;
            jobs.push(Arc::new(definition));
        }

        Ok(Workflow {
            name: workflow_name,
            jobs,
        })
    }

    fn build_triggers(file: &WorkflowFile) -> Result<Vec<Trigger>, ParseError> {
        let mut triggers = Vec::new();
        let mut seen = HashSet::new();

        for (event, config) in file.on.events() {
            let path = format!("on.{}", event);
            let kind: TriggerKind = event
                .parse()
                .map_err(|msg: String| ParseError::validation(msg, path.clone()))?;

            if !seen.insert(kind) {
                return Err(ParseError::validation(
                    format!("trigger '{}' is declared more than once", kind),
                    path,
                ));
            }

            let mut trigger = Trigger::new(kind);
            match kind {
                TriggerKind::Manual => {
                    let manual: ManualTriggerSpec = from_optional_value(config, &path)?;
                    for (name, raw) in &manual.inputs {
                        let input_path = format!("{}.inputs.{}", path, name);
                        trigger.inputs.push(Self::build_input(name, raw, &input_path)?);
                    }
                }
                TriggerKind::Push => {
                    let push: PushTriggerSpec = from_optional_value(config, &path)?;
                    trigger.branches = push.branches;
                    trigger.tags = push.tags;
                }
                TriggerKind::Schedule => {
                    let entries: Vec<ScheduleEntry> = from_optional_value(config, &path)?;
                    trigger.cron = entries.into_iter().map(|entry| entry.cron).collect();
                }
            }
            triggers.push(trigger);
        }

        if triggers.is_empty() {
            return Err(ParseError::validation("workflow declares no trigger", "on"));
        }

        Ok(triggers)
    }

    fn build_input(name: &str, raw: &InputSpecRaw, path: &str) -> Result<InputSpec, ParseError> {
        let input_type = match raw.input_type.as_deref().unwrap_or("string") {
            "string" | "environment" => InputType::String,
            "boolean" => InputType::Boolean,
            "number" => InputType::Number,
            "choice" => {
                if raw.options.is_empty() {
                    return Err(ParseError::validation(
                        "choice input must list its options",
                        path,
                    ));
                }
                InputType::Choice(raw.options.clone())
            }
            other => {
                return Err(ParseError::validation(
                    format!(
                        "unknown input type '{}', expected string, boolean, number or choice",
                        other
                    ),
                    path,
                ))
            }
        };

        let default = match &raw.default {
            Some(value) => Some(scalar_to_string(value).ok_or_else(|| {
                ParseError::validation("input default must be a scalar", path)
            })?),
            None => None,
        };

        Ok(InputSpec {
            name: name.to_string(),
            description: raw.description.clone(),
            required: raw.required,
            input_type,
            default,
        })
    }

    fn build_job(
        job_id: &str,
        job: &JobSpec,
        workflow_name: &str,
        triggers: &[Trigger],
        workflow_env: &IndexMap<String, String>,
    ) -> Result<JobDefinition, ParseError> {
        let job_path = format!("jobs.{}", job_id);

        // Job ids name instance directories and containers
        let valid_id = job_id.starts_with(|c: char| c.is_ascii_alphabetic() || c == '_')
            && job_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid_id {
            return Err(ParseError::validation(
                format!("invalid job id '{}'", job_id),
                job_path,
            )
            .with_suggestion("start with a letter or '_' and use only letters, digits, '-' and '_'"));
        }

        if job.steps.is_empty() {
            return Err(ParseError::validation("job has no steps", job_path)
                .with_suggestion("add a 'steps:' list describing what the job should do"));
        }

        let strategy = Self::build_strategy(job, &job_path)?;

        let (default_shell, default_working_dir) = job
            .defaults
            .as_ref()
            .and_then(|defaults| defaults.run.as_ref())
            .map(|run| (run.shell.clone(), run.working_directory.clone()))
            .unwrap_or((None, None));

        let mut step_ids = HashSet::new();
        let mut steps = Vec::with_capacity(job.steps.len());
        for (index, raw) in job.steps.iter().enumerate() {
            let step_path = format!("{}.steps[{}]", job_path, index);
            let mut step = Self::build_step(index, raw, &step_path)?;

            if let Some(id) = &step.id {
                if !step_ids.insert(id.clone()) {
                    return Err(ParseError::validation(
                        format!("duplicate step id '{}'", id),
                        step_path,
                    ));
                }
            }

            if let StepKind::InlineCommand { shell, .. } = &mut step.kind {
                if shell.is_none() {
                    *shell = default_shell.clone();
                }
            }
            if step.working_directory.is_none() {
                step.working_directory = default_working_dir.clone();
            }

            steps.push(step);
        }

        let mut env = workflow_env.clone();
        env.extend(job.env.clone());

        let container = job.container.as_ref().map(|container| match container {
            ContainerSpec::Image(image) => image.clone(),
            ContainerSpec::Detailed { image, .. } => image.clone(),
        });

        Ok(JobDefinition {
            id: job_id.to_string(),
            name: job.name.clone(),
            workflow_name: workflow_name.to_string(),
            triggers: triggers.to_vec(),
            env,
            strategy,
            container,
            timeout: minutes(job.timeout_minutes, &job_path)?,
            steps,
        })
    }

    fn build_strategy(job: &JobSpec, job_path: &str) -> Result<Strategy, ParseError> {
        let Some(raw) = &job.strategy else {
            return Ok(Strategy::default());
        };

        let mut axes = Vec::new();
        if let Some(matrix) = &raw.matrix {
            for (name, values) in matrix {
                let axis_path = format!("{}.strategy.matrix.{}", job_path, name);
                if name == "include" || name == "exclude" {
                    return Err(ParseError::validation(
                        format!("matrix '{}' is not supported", name),
                        axis_path,
                    )
                    .with_suggestion("list every axis value explicitly instead"));
                }

                let Value::Sequence(items) = values else {
                    return Err(ParseError::validation(
                        "matrix axis must be a list of values",
                        axis_path,
                    ));
                };

                let values = items
                    .iter()
                    .map(|item| {
                        scalar_to_string(item).ok_or_else(|| {
                            ParseError::validation(
                                "matrix values must be strings, numbers or booleans",
                                axis_path.clone(),
                            )
                        })
                    })
                    .collect::<Result<Vec<_>, _>>()?;

                axes.push(MatrixAxis::new(name.clone(), values));
            }
        }

        if raw.max_parallel == Some(0) {
            return Err(ParseError::validation(
                "max-parallel must be at least 1",
                format!("{}.strategy.max-parallel", job_path),
            ));
        }

        Ok(Strategy {
            axes,
            fail_fast: raw.fail_fast.unwrap_or(false),
            max_parallel: raw.max_parallel,
        })
    }

    fn build_step(index: usize, raw: &StepSpecRaw, path: &str) -> Result<StepSpec, ParseError> {
        let kind = match (&raw.run, &raw.uses) {
            (Some(script), None) => StepKind::InlineCommand {
                script: script.clone(),
                shell: raw.shell.clone(),
            },
            (None, Some(uses)) => {
                if uses.trim().is_empty() {
                    return Err(ParseError::validation("'uses' must name an action", path));
                }
                StepKind::ActionReference(ActionRef::parse(uses))
            }
            (Some(_), Some(_)) => {
                return Err(ParseError::validation(
                    "step cannot have both 'run' and 'uses'",
                    path,
                ))
            }
            (None, None) => {
                return Err(ParseError::validation(
                    "step must have either 'run' or 'uses'",
                    path,
                ))
            }
        };

        let mut condition = match &raw.if_condition {
            Some(expression) => RunCondition::parse(expression).ok_or_else(|| {
                ParseError::validation(
                    format!("unsupported condition '{}'", expression),
                    format!("{}.if", path),
                )
                .with_suggestion("use success(), always() or failure()")
            })?,
            None => RunCondition::Success,
        };

        if raw.always_run {
            if condition == RunCondition::Failure {
                return Err(ParseError::validation(
                    "'always-run: true' conflicts with 'if: failure()'",
                    path,
                ));
            }
            condition = RunCondition::Always;
        }

        let retry = match &raw.retry {
            Some(retry) if retry.count == 0 => {
                return Err(ParseError::validation(
                    "retry count must be at least 1",
                    format!("{}.retry", path),
                ))
            }
            Some(retry) => Some(RetryPolicy {
                count: retry.count,
                backoff: Duration::from_millis(retry.backoff_ms),
            }),
            None => None,
        };

        let with = raw
            .with
            .iter()
            .map(|(key, value)| {
                scalar_to_string(value)
                    .map(|value| (key.clone(), value))
                    .ok_or_else(|| {
                        ParseError::validation(
                            "action parameters must be scalars",
                            format!("{}.with.{}", path, key),
                        )
                    })
            })
            .collect::<Result<IndexMap<_, _>, _>>()?;

        Ok(StepSpec {
            index,
            id: raw.id.clone(),
            name: raw.name.clone(),
            kind,
            with,
            env: raw.env.clone(),
            working_directory: raw.working_directory.clone(),
            continue_on_error: raw.continue_on_error,
            condition,
            retry,
            timeout: minutes(raw.timeout_minutes, path)?,
        })
    }
}

fn from_optional_value<T>(value: Value, path: &str) -> Result<T, ParseError>
where
    T: serde::de::DeserializeOwned + Default,
{
    if value.is_null() {
        return Ok(T::default());
    }
    serde_yaml::from_value(value)
        .map_err(|e| ParseError::validation(format!("invalid trigger configuration: {}", e), path))
}

fn minutes(value: Option<f64>, path: &str) -> Result<Option<Duration>, ParseError> {
    match value {
        Some(m) if !(m.is_finite() && m > 0.0) => Err(ParseError::validation(
            "timeout-minutes must be a positive number",
            path,
        )),
        Some(m) => Duration::try_from_secs_f64(m * 60.0).map(Some).map_err(|_| {
            ParseError::validation("timeout-minutes is too large", path)
        }),
        None => Ok(None),
    }
}

/// Render a YAML scalar the way it would appear in a shell command
pub(crate) fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Null => Some(String::new()),
        Value::Sequence(_) | Value::Mapping(_) | Value::Tagged(_) => None,
    }
}
