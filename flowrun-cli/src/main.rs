// flowrun CLI
// Command-line entry point: argument parsing, logging setup and dispatch

mod commands;
mod output;

use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand};
use color_eyre::Result;
use tracing_subscriber::EnvFilter;

use commands::artifacts::ArtifactsCommand;
use commands::matrix::MatrixArgs;
use commands::run::RunArgs;
use commands::validate::ValidateArgs;
use commands::GlobalArgs;

/// Run matrix CI workflows locally with isolated environments
#[derive(Parser, Debug)]
#[command(name = "flowrun", version, about)]
struct Cli {
    /// Engine config file (default: .flowrun.yml at the source root)
    #[arg(long, global = true, value_name = "FILE", env = "FLOWRUN_CONFIG")]
    config: Option<PathBuf>,

    /// More log output (repeatable)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    /// Only print the summary
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a workflow
    Run(RunArgs),
    /// Check a workflow without running it
    Validate(ValidateArgs),
    /// Show the job instances a workflow expands to
    Matrix(MatrixArgs),
    /// Inspect stored artifacts
    #[command(subcommand)]
    Artifacts(ArtifactsCommand),
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    let global = GlobalArgs {
        config: cli.config,
        quiet: cli.quiet,
    };

    let exit_code = match cli.command {
        Command::Run(args) => commands::run::execute(args, &global).await?,
        Command::Validate(args) => commands::validate::execute(args)?,
        Command::Matrix(args) => commands::matrix::execute(args)?,
        Command::Artifacts(command) => commands::artifacts::execute(command, &global).await?,
    };

    if exit_code != 0 {
        std::process::exit(exit_code);
    }
    Ok(())
}

/// Logs go to stderr; `FLOWRUN_LOG` takes precedence over `-v`/`-q`
fn init_tracing(verbose: u8, quiet: bool) {
    let level = match (quiet, verbose) {
        (true, _) => "error",
        (false, 0) => "warn",
        (false, 1) => "info",
        (false, 2) => "debug",
        (false, _) => "trace",
    };
    let filter = EnvFilter::try_from_env("FLOWRUN_LOG").unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}
