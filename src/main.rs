//! F1 telemetry pipeline
//!
//! Ingests OpenF1 data into a SQLite store and derives tyre-strategy
//! features, driven by a small task graph.

mod cli;
mod config;
mod error;
mod features;
mod loader;
mod normalize;
mod orchestrator;
mod report;
mod retry;
mod source;
mod storage;
mod types;

use clap::Parser;
use std::process::ExitCode;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_json);

    match &cli.command {
        Commands::Run { force, format } => cli::run_once(&cli, *force, format).await,
        Commands::Schedule => cli::run_schedule(&cli).await,
        Commands::Enable => cli::run_toggle(&cli, true),
        Commands::Disable => cli::run_toggle(&cli, false),
        Commands::Status { runs } => cli::run_status(&cli, *runs),
        Commands::Mode => cli::run_mode(&cli),
        Commands::Features { all } => cli::run_features(&cli, *all),
    }
}

/// Logs go to stderr so `run --format json` keeps stdout clean.
fn init_tracing(verbose: bool, json: bool) {
    let default_filter = if verbose {
        "f1_pipeline=debug"
    } else {
        "f1_pipeline=info"
    };
    let registry = tracing_subscriber::registry().with(
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| default_filter.into()),
    );

    if json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}
