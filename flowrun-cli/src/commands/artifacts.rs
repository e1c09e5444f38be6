use crate::commands::{load_config, GlobalArgs};
use crate::output;

use std::path::PathBuf;

use clap::{Args, Subcommand};
use color_eyre::eyre::WrapErr;
use color_eyre::Result;
use tokio::io::AsyncWriteExt;

use flowrun_engine::{ArtifactStore, FsArtifactStore, RunId};

/// Inspect stored artifacts
#[derive(Subcommand, Debug)]
pub enum ArtifactsCommand {
    /// List the artifacts of a run
    List(ListArgs),
    /// Write an artifact to a file or stdout
    Get(GetArgs),
}

#[derive(Args, Debug)]
pub struct ListArgs {
    /// Run identifier
    pub run_id: String,

    /// Artifact store directory
    #[arg(long, value_name = "DIR", env = "FLOWRUN_ARTIFACT_DIR")]
    pub artifact_dir: Option<PathBuf>,

    /// Print handles as JSON on stdout
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct GetArgs {
    /// Run identifier
    pub run_id: String,

    /// Artifact name
    pub name: String,

    /// Destination file (default: stdout)
    #[arg(long, short = 'o', value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Artifact store directory
    #[arg(long, value_name = "DIR", env = "FLOWRUN_ARTIFACT_DIR")]
    pub artifact_dir: Option<PathBuf>,
}

pub async fn execute(command: ArtifactsCommand, global: &GlobalArgs) -> Result<i32> {
    match command {
        ArtifactsCommand::List(args) => list(args, global).await,
        ArtifactsCommand::Get(args) => get(args, global).await,
    }
}

fn store(artifact_dir: Option<PathBuf>, global: &GlobalArgs) -> Result<FsArtifactStore> {
    let dir = match artifact_dir {
        Some(dir) => dir,
        None => load_config(global, None)?.artifact_dir,
    };
    Ok(FsArtifactStore::new(dir))
}

async fn list(args: ListArgs, global: &GlobalArgs) -> Result<i32> {
    let store = store(args.artifact_dir, global)?;
    let run_id = RunId::parse(args.run_id)?;
    let handles = store.list(&run_id).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&handles)?);
        return Ok(0);
    }

    if handles.is_empty() {
        output::warning(&format!("No artifacts for run {}", run_id));
        return Ok(0);
    }

    output::header(&format!("{} artifact(s) in run {}", handles.len(), run_id));
    for handle in &handles {
        let digest: String = handle.digest.chars().take(12).collect();
        println!("  {:<40} {:>10}  sha256:{}", handle.name, output::size(handle.size), digest);
    }
    Ok(0)
}

async fn get(args: GetArgs, global: &GlobalArgs) -> Result<i32> {
    let store = store(args.artifact_dir, global)?;
    let run_id = RunId::parse(args.run_id)?;
    let handle = store.find(&run_id, &args.name).await?;
    let bytes = store.get(&handle).await?;

    match args.output {
        Some(path) => {
            tokio::fs::write(&path, &bytes)
                .await
                .wrap_err_with(|| format!("Failed to write {}", path.display()))?;
            if !global.quiet {
                output::success(&format!(
                    "Wrote '{}' ({}) to {}",
                    handle.name,
                    output::size(handle.size),
                    path.display()
                ));
            }
        }
        None => {
            let mut stdout = tokio::io::stdout();
            stdout.write_all(&bytes).await?;
            stdout.flush().await?;
        }
    }
    Ok(0)
}
