use crate::commands::load_workflow;
use crate::output;

use std::path::PathBuf;

use clap::Args;
use color_eyre::eyre::bail;
use color_eyre::Result;

use flowrun_engine::{MatrixExpander, RunId};

/// Show the job instances a workflow expands to
#[derive(Args, Debug)]
pub struct MatrixArgs {
    /// Path to the workflow YAML file
    pub workflow: PathBuf,

    /// Only expand a specific job
    #[arg(long, value_name = "JOB")]
    pub job: Option<String>,

    /// Print instances as JSON on stdout
    #[arg(long)]
    pub json: bool,
}

pub fn execute(args: MatrixArgs) -> Result<i32> {
    let workflow = load_workflow(&args.workflow)?;

    let jobs = match &args.job {
        Some(id) => match workflow.job(id) {
            Some(job) => vec![job.clone()],
            None => bail!("Unknown job '{}'", id),
        },
        None => workflow.jobs.clone(),
    };

    let instances = MatrixExpander::expand_all(&jobs, &RunId::new("matrix"))?;

    if args.json {
        let rows: Vec<serde_json::Value> = instances
            .iter()
            .map(|instance| {
                serde_json::json!({
                    "job": instance.definition.id,
                    "index": instance.index,
                    "total": instance.total,
                    "label": instance.label(),
                    "matrix": instance.values,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(0);
    }

    output::header(&format!(
        "Workflow '{}' expands to {} instance(s)",
        workflow.name,
        instances.len()
    ));
    for instance in &instances {
        let values: Vec<String> = instance
            .values
            .iter()
            .map(|(axis, value)| format!("{}={}", axis, value))
            .collect();
        println!(
            "  {:<16} {:<32} {}",
            instance.key(),
            instance.label(),
            values.join(" ")
        );
    }

    Ok(0)
}
