// Variable Scope
// Per-instance placeholder resolution and step environment construction

use crate::execution::matrix::JobInstance;
use crate::execution::report::StepResult;
use crate::utils::env_var_name;

use indexmap::IndexMap;

/// Variables visible to one job instance.
///
/// Each instance owns its scope; mutations made by a step (env, PATH,
/// outputs) are only seen by later steps of the same instance.
#[derive(Debug, Clone)]
pub struct VariableScope {
    run_id: String,
    job_id: String,
    workflow: String,
    runner_os: &'static str,
    workspace: String,
    job_index: usize,
    job_total: usize,
    matrix: IndexMap<String, String>,
    inputs: IndexMap<String, String>,
    env: IndexMap<String, String>,
    path_prepends: Vec<String>,
    step_outputs: IndexMap<String, IndexMap<String, String>>,
    step_outcomes: IndexMap<String, (String, String)>,
}

impl VariableScope {
    /// Build the scope of an instance.
    ///
    /// `workspace` is the workspace path as seen by the step processes.
    /// Workflow and job env values may themselves use placeholders; they are
    /// resolved in declaration order.
    pub fn new(
        instance: &JobInstance,
        inputs: &IndexMap<String, String>,
        workspace: impl Into<String>,
    ) -> Self {
        let definition = &instance.definition;
        let runner_os = if definition.container.is_some() {
            "Linux"
        } else {
            host_os()
        };

        let mut scope = Self {
            run_id: instance.run_id.to_string(),
            job_id: definition.id.clone(),
            workflow: definition.workflow_name.clone(),
            runner_os,
            workspace: workspace.into(),
            job_index: instance.index,
            job_total: instance.total,
            matrix: instance.values.clone(),
            inputs: inputs.clone(),
            env: IndexMap::new(),
            path_prepends: Vec::new(),
            step_outputs: IndexMap::new(),
            step_outcomes: IndexMap::new(),
        };

        for (name, value) in &definition.env {
            let value = scope.interpolate(value);
            scope.env.insert(name.clone(), value);
        }

        scope
    }

    /// Replace every `${{ expr }}` in `text` with its value.
    ///
    /// Unknown references render as the empty string. An unterminated
    /// placeholder is left as written.
    pub fn interpolate(&self, text: &str) -> String {
        let mut result = String::with_capacity(text.len());
        let mut rest = text;

        while let Some(start) = rest.find("${{") {
            let after_open = &rest[start + 3..];
            let Some(end) = after_open.find("}}") else {
                break;
            };

            result.push_str(&rest[..start]);
            let expression = after_open[..end].trim();
            match self.resolve(expression) {
                Some(value) => result.push_str(&value),
                None => {
                    tracing::warn!(
                        job = %self.job_id,
                        expression,
                        "unknown placeholder, substituting an empty string"
                    );
                }
            }
            rest = &after_open[end + 2..];
        }

        result.push_str(rest);
        result
    }

    /// Look up a single context reference such as `matrix.package`
    pub fn resolve(&self, expression: &str) -> Option<String> {
        let expression = expression.trim();

        if let Some(name) = expression.strip_prefix("matrix.") {
            return self.matrix.get(name).cloned();
        }
        if let Some(name) = expression
            .strip_prefix("inputs.")
            .or_else(|| expression.strip_prefix("github.event.inputs."))
        {
            return self.inputs.get(name).cloned();
        }
        if let Some(name) = expression.strip_prefix("env.") {
            return self.env.get(name).cloned();
        }
        if let Some(reference) = expression.strip_prefix("steps.") {
            return self.resolve_step(reference);
        }

        match expression {
            "strategy.job-index" => Some(self.job_index.to_string()),
            "strategy.job-total" => Some(self.job_total.to_string()),
            "github.run_id" | "run.id" => Some(self.run_id.clone()),
            "github.workspace" => Some(self.workspace.clone()),
            "github.job" => Some(self.job_id.clone()),
            "github.workflow" => Some(self.workflow.clone()),
            "runner.os" => Some(self.runner_os.to_string()),
            _ => None,
        }
    }

    fn resolve_step(&self, reference: &str) -> Option<String> {
        let (id, field) = reference.split_once('.')?;
        if let Some(name) = field.strip_prefix("outputs.") {
            return self.step_outputs.get(id)?.get(name).cloned();
        }
        let (outcome, conclusion) = self.step_outcomes.get(id)?;
        match field {
            "outcome" => Some(outcome.clone()),
            "conclusion" => Some(conclusion.clone()),
            _ => None,
        }
    }

    /// Environment for a step process: the instance env, the step's own env
    /// (placeholders resolved), then the built-in variables, which always win
    pub fn step_environment(&self, step_env: &IndexMap<String, String>) -> IndexMap<String, String> {
        let mut env: IndexMap<String, String> = self.env.clone();
        for (name, value) in step_env {
            env.insert(name.clone(), self.interpolate(value));
        }
        env.extend(self.builtin_environment());
        env
    }

    /// Read-only variables: `CI`, `FLOWRUN_*`, `MATRIX_<AXIS>`, `INPUT_<NAME>`
    fn builtin_environment(&self) -> IndexMap<String, String> {
        let mut env = IndexMap::new();
        env.insert("CI".to_string(), "true".to_string());
        env.insert("FLOWRUN_RUN_ID".to_string(), self.run_id.clone());
        env.insert("FLOWRUN_JOB".to_string(), self.job_id.clone());
        env.insert("FLOWRUN_WORKSPACE".to_string(), self.workspace.clone());
        env.insert("GITHUB_WORKSPACE".to_string(), self.workspace.clone());

        for (name, value) in &self.matrix {
            env.insert(env_var_name("MATRIX", name), value.clone());
        }
        for (name, value) in &self.inputs {
            env.insert(env_var_name("INPUT", name), value.clone());
        }
        env
    }

    /// Set variables for the remaining steps. Built-in names are ignored.
    pub fn apply_env(&mut self, updates: IndexMap<String, String>) {
        let builtin = self.builtin_environment();
        for (name, value) in updates {
            if builtin.contains_key(&name) {
                tracing::warn!(variable = %name, "ignoring update of read-only variable");
                continue;
            }
            self.env.insert(name, value);
        }
    }

    /// Prepend directories to PATH for the remaining steps (latest first)
    pub fn prepend_path(&mut self, dirs: Vec<String>) {
        for dir in dirs.into_iter().rev() {
            self.path_prepends.insert(0, dir);
        }
    }

    pub fn path_prepends(&self) -> &[String] {
        &self.path_prepends
    }

    /// Record a finished step so later steps can reference it by id
    pub fn record_step(&mut self, result: &StepResult) {
        let Some(id) = &result.id else {
            return;
        };
        let outcome = result.outcome().to_string();
        let conclusion = if result.continued_on_error {
            "success".to_string()
        } else {
            outcome.clone()
        };
        self.step_outcomes.insert(id.clone(), (outcome, conclusion));
        self.step_outputs.insert(id.clone(), result.outputs.clone());
    }

    pub fn matrix(&self) -> &IndexMap<String, String> {
        &self.matrix
    }

    pub fn env(&self) -> &IndexMap<String, String> {
        &self.env
    }
}

fn host_os() -> &'static str {
    match std::env::consts::OS {
        "macos" => "macOS",
        "windows" => "Windows",
        _ => "Linux",
    }
}
