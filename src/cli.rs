// src/cli.rs

//! CLI argument parsing using `clap`.

use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::types::StageId;

/// Command-line arguments for `batchrelay`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "batchrelay",
    version,
    about = "Orchestrate a two-stage batch pipeline on ephemeral nodes.",
    long_about = None
)]
pub struct CliArgs {
    /// Path to the config file (TOML).
    ///
    /// Default: `Batchrelay.toml` in the current working directory.
    #[arg(long, global = true, value_name = "PATH", default_value = "Batchrelay.toml")]
    pub config: String,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `BATCHRELAY_LOG` or a default level will be used.
    #[arg(long, global = true, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Orchestrate the pipeline: schedule, controllers, watchdog.
    Run(RunArgs),
    /// Run one stage's job on this node (one-shot unit).
    Job(JobArgs),
    /// Print when the schedule fires next.
    NextTick,
}

#[derive(Debug, Clone, Args)]
pub struct RunArgs {
    /// Fire one run immediately and exit once it is settled.
    #[arg(long)]
    pub once: bool,

    /// Host both nodes in this process instead of using `[node]` commands.
    #[arg(long)]
    pub local: bool,

    /// Parse + validate, print the resolved pipeline, but don't run anything.
    #[arg(long)]
    pub dry_run: bool,
}

#[derive(Debug, Clone, Args)]
pub struct JobArgs {
    /// Which stage this node runs.
    #[arg(long, value_name = "STAGE")]
    pub stage: StageId,

    /// Correlation id of the run; a fresh one is generated if omitted.
    #[arg(long, value_name = "ID")]
    pub correlation_id: Option<String>,

    /// Date the run works on (`YYYY-MM-DD`), as passed by `{run_date}` in
    /// `[node].start_cmd`. Defaults to today in the pipeline's offset.
    #[arg(long, value_name = "DATE", value_parser = parse_run_date)]
    pub run_date: Option<NaiveDate>,
}

fn parse_run_date(s: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|e| format!("expected YYYY-MM-DD: {e}"))
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}
