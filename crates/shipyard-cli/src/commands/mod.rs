//! CLI commands for Shipyard.
//!
//! - `run`: execute a pipeline against a commit
//! - `validate` / `plan`: load a definition and print the resolved order
//! - `approve` / `reject`: decide on a gated job of a running pipeline
//! - `history` / `show` / `releases`: read the event log
//! - `watch`: poll source control and run on matching pushes and tags
//! - `completions`: generate shell completions

pub mod approvals;
pub mod completions;
pub mod engine;
pub mod history;
pub mod inspect;
pub mod run;

use anyhow::Result;
use clap::{Args, CommandFactory, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

use crate::config::ShipyardConfig;
use crate::logging::init_logging;

/// Pipeline orchestration with gated environments and staged releases
#[derive(Parser, Debug)]
#[command(name = "shipyard")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file
    #[arg(long, global = true, env = "SHIPYARD_CONFIG")]
    config: Option<PathBuf>,

    /// Log level, overriding the configuration
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a pipeline
    Run(RunArgs),

    /// Validate a pipeline definition
    Validate(PipelineArgs),

    /// Print the resolved job order
    Plan(PipelineArgs),

    /// Approve a gated job
    Approve(DecisionArgs),

    /// Reject a gated job
    Reject(DecisionArgs),

    /// List recorded runs
    History(HistoryArgs),

    /// Show one run job by job
    Show(ShowArgs),

    /// List releases
    Releases(ReleasesArgs),

    /// Poll source control and run on matching events
    Watch(WatchArgs),

    /// Generate shell completions
    Completions(CompletionsArgs),
}

#[derive(Args, Debug)]
struct PipelineArgs {
    /// Pipeline definition file
    pipeline: PathBuf,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Pipeline definition file
    pipeline: PathBuf,

    /// Commit to build (defaults to the repository's HEAD)
    #[arg(long)]
    commit: Option<String>,

    /// Run as a push to this branch; the pipeline's triggers must match
    #[arg(long, conflicts_with = "tag")]
    branch: Option<String>,

    /// Run as the creation of this tag; the pipeline's triggers must match
    #[arg(long)]
    tag: Option<String>,
}

#[derive(Args, Debug)]
struct DecisionArgs {
    /// Run id or unique prefix
    #[arg(long)]
    run: String,

    /// Gated job
    #[arg(long)]
    job: String,

    /// Identity deciding
    #[arg(long = "as", value_name = "IDENTITY")]
    identity: String,
}

#[derive(Args, Debug)]
struct HistoryArgs {
    /// Only this pipeline
    #[arg(long)]
    pipeline: Option<String>,

    /// Most recent runs to list
    #[arg(short = 'n', long, default_value_t = 20)]
    limit: usize,
}

#[derive(Args, Debug)]
struct ShowArgs {
    /// Run id or unique prefix
    run: String,

    /// Print the run record as JSON
    #[arg(long)]
    output_json: bool,
}

#[derive(Args, Debug)]
struct ReleasesArgs {
    /// Include release notes
    #[arg(long)]
    notes: bool,
}

#[derive(Args, Debug)]
struct WatchArgs {
    /// Pipeline definition file
    pipeline: PathBuf,

    /// Time between polls
    #[arg(long, default_value = "30s", value_parser = humantime::parse_duration)]
    interval: Duration,
}

#[derive(Args, Debug)]
struct CompletionsArgs {
    /// Shell to generate completions for
    #[arg(value_enum)]
    shell: clap_complete::Shell,

    /// Output file (stdout if not specified)
    #[arg(short, long)]
    output: Option<PathBuf>,
}

/// Build the CLI command for completion generation
#[must_use]
pub fn build_cli() -> clap::Command {
    Cli::command()
}

/// Parse and execute CLI arguments
pub async fn run() -> Result<()> {
    execute(Cli::parse()).await
}

/// Executes parsed arguments
pub async fn execute(cli: Cli) -> Result<()> {
    if let Commands::Completions(args) = &cli.command {
        return completions::write_completions(args.shell, args.output.as_deref());
    }

    let config = ShipyardConfig::load(cli.config.as_deref())?;
    init_logging(cli.log_level.as_deref().unwrap_or(&config.log_level), cli.json);
    tracing::debug!(?config, "configuration loaded");

    match cli.command {
        Commands::Run(args) => {
            run::run_pipeline(&config, &args.pipeline, args.commit, args.branch, args.tag).await
        }
        Commands::Validate(args) => inspect::validate(&args.pipeline),
        Commands::Plan(args) => inspect::plan(&args.pipeline),
        Commands::Approve(args) => approvals::decide(&config, &args.run, &args.job, &args.identity, true).await,
        Commands::Reject(args) => approvals::decide(&config, &args.run, &args.job, &args.identity, false).await,
        Commands::History(args) => history::list_runs(&config, args.pipeline.as_deref(), args.limit).await,
        Commands::Show(args) => history::show_run(&config, &args.run, args.output_json).await,
        Commands::Releases(args) => history::list_releases(&config, args.notes).await,
        Commands::Watch(args) => run::watch(&config, &args.pipeline, args.interval).await,
        Commands::Completions(_) => Ok(()),
    }
}
