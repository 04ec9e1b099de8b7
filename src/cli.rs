//! CLI commands for f1-pipeline.
//!
//! Manual triggers, the scheduler loop, the on/off toggle and read-only
//! inspection of the store.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::features;
use crate::loader::select_mode;
use crate::orchestrator::lock::RunLock;
use crate::orchestrator::{is_enabled, Orchestrator};
use crate::report::RunReport;
use crate::source::{AnySource, FixtureSource, OpenF1Client, Retrying, TelemetrySource};
use crate::storage::Store;

#[derive(Parser)]
#[command(name = "f1-pipeline")]
#[command(version, about = "F1 telemetry ingestion and tyre-strategy feature pipeline", long_about = None)]
pub struct Cli {
    /// Configuration file (defaults to ./config.{toml,yaml,json} if present)
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Store path override
    #[arg(long, global = true, env = "F1_DB_PATH", value_name = "PATH")]
    pub db: Option<PathBuf>,

    /// Replay a recorded JSON dump instead of calling the API
    #[arg(long, global = true, value_name = "FILE")]
    pub fixture: Option<PathBuf>,

    /// Pipeline identifier override
    #[arg(long, global = true)]
    pub pipeline: Option<String>,

    /// Debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Log as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Trigger one run now
    Run {
        /// Run even if the pipeline is disabled
        #[arg(long)]
        force: bool,

        /// Output format (table, json)
        #[arg(short, long, default_value = "table")]
        format: String,
    },

    /// Trigger a run every `schedule_interval_secs` while enabled
    Schedule,

    /// Turn scheduled and manual runs on
    Enable,

    /// Turn scheduled and manual runs off
    Disable,

    /// Show the toggle, watermarks, row counts and recent runs
    Status {
        /// Number of recent runs to list
        #[arg(short, long, default_value_t = 5)]
        runs: usize,
    },

    /// Print the load mode the next run would use
    Mode,

    /// Rebuild tyre-change features without loading
    Features {
        /// Rebuild every session instead of the dirty ones
        #[arg(long)]
        all: bool,
    },
}

impl Cli {
    /// Layered configuration with the global flag overrides applied.
    pub fn load_config(&self) -> anyhow::Result<AppConfig> {
        let mut config = AppConfig::load(self.config.as_deref())?;
        if let Some(db) = &self.db {
            config.store.path = db.to_string_lossy().to_string();
        }
        if let Some(id) = &self.pipeline {
            config.pipeline.id = id.clone();
        }
        Ok(config)
    }

    /// The configured source behind the retry layer.
    fn source(&self, config: &AppConfig) -> anyhow::Result<Retrying<AnySource>> {
        let source = match &self.fixture {
            Some(path) => {
                info!(path = %path.display(), "replaying fixture");
                AnySource::Fixture(FixtureSource::from_file(path)?)
            }
            None => AnySource::OpenF1(OpenF1Client::new(&config.source)?),
        };
        Ok(Retrying::new(source, config.retry_config()))
    }
}

fn open_store(config: &AppConfig) -> anyhow::Result<Store> {
    Store::open(config.store.path())
        .with_context(|| format!("Failed to open store {}", config.store.path))
}

/// Set the cancellation flag on Ctrl-C.
fn cancel_on_ctrl_c<S: TelemetrySource>(orchestrator: &Orchestrator<S>) {
    let cancel = orchestrator.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping after the current node");
            cancel.store(true, Ordering::SeqCst);
        }
    });
}

fn print_report(report: &RunReport, format: &str) -> anyhow::Result<()> {
    match format {
        "json" => println!("{}", report.to_json()?),
        _ => report.print_table(),
    }
    Ok(())
}

/// Manual "trigger now".
pub async fn run_once(cli: &Cli, force: bool, format: &str) -> anyhow::Result<ExitCode> {
    let config = cli.load_config()?;
    {
        let store = open_store(&config)?;
        if !is_enabled(&store, &config)? && !force {
            bail!(
                "pipeline {} is disabled; enable it or pass --force",
                config.pipeline.id
            );
        }
    }

    let orchestrator = Orchestrator::new(cli.source(&config)?, config);
    cancel_on_ctrl_c(&orchestrator);

    let report = orchestrator
        .run()
        .await
        .context("Pipeline run could not start")?;
    print_report(&report, format)?;

    Ok(if report.succeeded() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Trigger a run on every tick while the pipeline is enabled.
pub async fn run_schedule(cli: &Cli) -> anyhow::Result<ExitCode> {
    let config = cli.load_config()?;
    let interval_secs = config.pipeline.schedule_interval_secs.max(1);
    let orchestrator = Orchestrator::new(cli.source(&config)?, config);
    cancel_on_ctrl_c(&orchestrator);
    let cancel = orchestrator.cancel_handle();

    info!(
        pipeline = %orchestrator.config().pipeline.id,
        interval_secs,
        "scheduler started"
    );
    let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::signal::ctrl_c() => break,
        }
        if cancel.load(Ordering::SeqCst) {
            break;
        }

        let enabled = {
            let store = open_store(orchestrator.config())?;
            is_enabled(&store, orchestrator.config())?
        };
        if !enabled {
            info!("pipeline disabled, skipping tick");
            continue;
        }

        match orchestrator.run().await {
            Ok(report) => info!(
                run_id = report.run_id,
                status = report.status.as_str(),
                rows = report.ingest.total_ingested(),
                "scheduled run finished"
            ),
            Err(e) => warn!(error = %e, "scheduled run did not start"),
        }
        if cancel.load(Ordering::SeqCst) {
            break;
        }
    }

    info!("scheduler stopped");
    Ok(ExitCode::SUCCESS)
}

pub fn run_toggle(cli: &Cli, enabled: bool) -> anyhow::Result<ExitCode> {
    let config = cli.load_config()?;
    let store = open_store(&config)?;
    store.set_pipeline_enabled(&config.pipeline.id, enabled)?;
    println!(
        "Pipeline {} {}",
        config.pipeline.id,
        if enabled { "enabled" } else { "disabled" }
    );
    Ok(ExitCode::SUCCESS)
}

pub fn run_status(cli: &Cli, runs: usize) -> anyhow::Result<ExitCode> {
    let config = cli.load_config()?;
    let store = open_store(&config)?;

    println!("Pipeline: {}", config.pipeline.id);
    println!(
        "Enabled:  {}",
        if is_enabled(&store, &config)? { "yes" } else { "no" }
    );
    println!("Store:    {}", config.store.path);
    println!();

    println!("=== Watermarks ===");
    let watermarks = store.watermarks()?;
    if watermarks.is_empty() {
        println!("  (none)");
    }
    for (kind, watermark) in &watermarks {
        println!("  {:<16} {}", kind.as_str(), watermark);
    }
    println!();

    println!("=== Tables ===");
    for (table, rows) in store.table_counts()? {
        println!("  {:<16} {:>9}", table, rows);
    }
    let dirty = store.dirty_sessions()?;
    println!("  {:<16} {:>9}", "(dirty sessions)", dirty.len());
    println!();

    println!("=== Recent Runs ===");
    for run in store.recent_runs(&config.pipeline.id, runs)? {
        println!(
            "  #{:<5} {:<12} {:<8} {}  {}",
            run.run_id,
            run.mode.as_deref().unwrap_or("-"),
            run.status,
            run.started_at,
            run.finished_at.as_deref().unwrap_or("-")
        );
    }

    Ok(ExitCode::SUCCESS)
}

pub fn run_mode(cli: &Cli) -> anyhow::Result<ExitCode> {
    let config = cli.load_config()?;
    let mode = select_mode(config.store.path())?;
    println!("{mode}");
    Ok(ExitCode::SUCCESS)
}

pub fn run_features(cli: &Cli, all: bool) -> anyhow::Result<ExitCode> {
    let config = cli.load_config()?;
    let _lock = RunLock::acquire(&config.store.lock_path())?;
    let mut store = open_store(&config)?;

    let summary = features::rebuild(&mut store, &config.features, all)?;
    println!("=== Features ===");
    println!("  Sessions processed: {}", summary.sessions_processed);
    println!("  Sessions skipped:   {}", summary.sessions_skipped);
    println!("  Events written:     {}", summary.events_written);

    Ok(if summary.sessions_skipped == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "f1-pipeline",
            "run",
            "--force",
            "--format",
            "json",
            "--db",
            "/tmp/x.db",
            "--pipeline",
            "nightly",
        ])
        .unwrap();

        assert_eq!(cli.db, Some(PathBuf::from("/tmp/x.db")));
        assert!(matches!(cli.command, Commands::Run { force: true, ref format } if format == "json"));

        let config = cli.load_config().unwrap();
        assert_eq!(config.store.path, "/tmp/x.db");
        assert_eq!(config.pipeline.id, "nightly");
    }

    #[test]
    fn test_features_flag() {
        let cli = Cli::try_parse_from(["f1-pipeline", "features", "--all"]).unwrap();
        assert!(matches!(cli.command, Commands::Features { all: true }));
    }

    #[test]
    fn test_toggle_and_mode_against_temp_store() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("f1.db");
        let db_arg = db.to_string_lossy().to_string();

        let cli = Cli::try_parse_from(["f1-pipeline", "--db", &db_arg, "disable"]).unwrap();
        assert_eq!(run_toggle(&cli, false).unwrap(), ExitCode::SUCCESS);

        let config = cli.load_config().unwrap();
        let store = Store::open(&db).unwrap();
        assert!(!is_enabled(&store, &config).unwrap());

        // Schema but no meetings yet
        assert_eq!(select_mode(&db).unwrap(), crate::types::LoadMode::Full);
        assert_eq!(run_mode(&cli).unwrap(), ExitCode::SUCCESS);
    }
}
