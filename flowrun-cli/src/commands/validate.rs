use crate::commands::load_workflow;
use crate::output;

use std::path::PathBuf;

use clap::Args;
use color_eyre::eyre::bail;
use color_eyre::Result;

use flowrun_engine::definition::InputType;
use flowrun_engine::{MatrixExpander, RunId};

/// Validate a workflow YAML file
#[derive(Args, Debug)]
pub struct ValidateArgs {
    /// Path to the workflow YAML file
    pub workflow: PathBuf,
}

pub fn execute(args: ValidateArgs) -> Result<i32> {
    output::status("Validating", &format!("{}", args.workflow.display()));

    // Step 1: Parse and check the definition
    let workflow = load_workflow(&args.workflow)?;
    output::check("Definition valid");

    let steps_count: usize = workflow.jobs.iter().map(|job| job.steps.len()).sum();
    output::check(&format!(
        "Structure: {} jobs, {} steps",
        workflow.jobs.len(),
        steps_count
    ));

    // Step 2: Triggers and their inputs
    for trigger in workflow.triggers() {
        let inputs: Vec<String> = trigger
            .inputs
            .iter()
            .map(|input| {
                let kind = match &input.input_type {
                    InputType::String => "string".to_string(),
                    InputType::Boolean => "boolean".to_string(),
                    InputType::Number => "number".to_string(),
                    InputType::Choice(options) => format!("choice: {}", options.join("|")),
                };
                let required = if input.required { ", required" } else { "" };
                format!("{} ({}{})", input.name, kind, required)
            })
            .collect();

        if inputs.is_empty() {
            output::check(&format!("Trigger: {}", trigger.kind));
        } else {
            output::check(&format!("Trigger: {} [{}]", trigger.kind, inputs.join(", ")));
        }
    }

    // Step 3: Matrix expansion
    let run_id = RunId::new("validate");
    let mut errors = 0;
    for job in &workflow.jobs {
        match MatrixExpander::expand(job, &run_id) {
            Ok(instances) => output::check(&format!(
                "Job '{}': {} instance(s), {} steps",
                job.id,
                instances.len(),
                job.steps.len()
            )),
            Err(e) => {
                output::error(&e.to_string());
                errors += 1;
            }
        }
    }

    if errors > 0 {
        bail!("{} job(s) cannot be expanded", errors);
    }

    eprintln!();
    output::success("Workflow is valid");

    Ok(0)
}
