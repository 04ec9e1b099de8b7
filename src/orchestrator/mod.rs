//! Pipeline coordinator: dispatches the task graph for one run.
//!
//! The coordinator is the only writer for the duration of a run. Nodes share
//! no in-process state; they hand over through the store.

pub mod graph;
pub mod lock;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::config::AppConfig;
use crate::error::{PipelineError, Result};
use crate::features;
use crate::loader::{full_load, incremental_sync, select_mode};
use crate::report::{FeatureSummary, IngestReport, NodeOutcome, RunReport, RunStatus};
use crate::source::TelemetrySource;
use crate::storage::Store;
use crate::types::LoadMode;
use graph::{NodeId, TaskGraph};
use lock::RunLock;

/// Whether scheduled and manual runs are allowed.
pub fn is_enabled(store: &Store, config: &AppConfig) -> Result<bool> {
    Ok(store
        .pipeline_enabled(&config.pipeline.id)?
        .unwrap_or(config.pipeline.enabled_by_default))
}

/// Runs the pipeline graph against one store.
pub struct Orchestrator<S> {
    source: S,
    config: AppConfig,
    cancel: Arc<AtomicBool>,
}

/// State threaded through the nodes of one run.
#[derive(Default)]
struct RunState {
    mode: Option<LoadMode>,
    ingest: IngestReport,
    features: FeatureSummary,
}

impl<S: TelemetrySource> Orchestrator<S> {
    pub fn new(source: S, config: AppConfig) -> Self {
        Self {
            source,
            config,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag that aborts the run at the next node boundary once set.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    #[cfg(test)]
    pub fn source(&self) -> &S {
        &self.source
    }

    fn db_path(&self) -> &Path {
        self.config.store.path()
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.load(Ordering::SeqCst) {
            return Err(PipelineError::Cancelled);
        }
        Ok(())
    }

    /// Execute one run of the graph.
    ///
    /// Node failures are reported in the returned [`RunReport`]; an `Err`
    /// means the run could not start (lock held, store unavailable).
    pub async fn run(&self) -> Result<RunReport> {
        let _lock = RunLock::acquire(&self.config.store.lock_path())?;
        let mut store = Store::open(self.db_path())?;
        let pipeline_id = self.config.pipeline.id.clone();
        let run_id = store.start_run(&pipeline_id)?;
        info!(pipeline = %pipeline_id, run_id, "run started");

        let mut graph = TaskGraph::pipeline();
        let mut state = RunState::default();
        let mut cancelled = false;

        while let Some(node) = graph.next_ready() {
            if let Err(e) = self.check_cancelled() {
                warn!(%node, error = %e, "stopping between nodes");
                graph.skip_pending();
                cancelled = true;
                break;
            }

            graph.start(node)?;
            info!(%node, "node running");
            match self.execute(node, &mut store, &mut state).await {
                Ok(Some(chosen)) => {
                    info!(%node, %chosen, "branch taken");
                    graph.branch(node, chosen)?;
                }
                Ok(None) => {
                    info!(%node, "node succeeded");
                    graph.succeed(node)?;
                }
                Err(e) => {
                    error!(%node, error = %e, "node failed");
                    graph.fail(node, e.to_string())?;
                }
            }
        }

        debug_assert!(graph.is_terminal());
        let status = if graph.any_failed() || cancelled {
            RunStatus::Failed
        } else {
            RunStatus::Success
        };
        let report = RunReport {
            pipeline_id,
            run_id,
            mode: state.mode,
            status,
            cancelled,
            nodes: graph
                .outcomes()
                .into_iter()
                .map(|(node, state, error)| NodeOutcome { node, state, error })
                .collect(),
            ingest: state.ingest,
            features: state.features,
        };

        let summary = report.to_json().unwrap_or_default();
        store.finish_run(run_id, report.mode, report.status.as_str(), &summary)?;
        info!(run_id, status = report.status.as_str(), "run finished");
        Ok(report)
    }

    /// Body of one node; branch nodes return the successor they choose.
    async fn execute(
        &self,
        node: NodeId,
        store: &mut Store,
        state: &mut RunState,
    ) -> Result<Option<NodeId>> {
        match node {
            NodeId::SelectMode => {
                let mode = select_mode(self.db_path())?;
                state.mode = Some(mode);
                Ok(Some(match mode {
                    LoadMode::Full => NodeId::FullLoad,
                    LoadMode::Incremental => NodeId::IncrementalSync,
                }))
            }
            NodeId::FullLoad => {
                full_load(&self.source, store, &self.config, &mut state.ingest).await?;
                Ok(None)
            }
            NodeId::IncrementalSync => {
                incremental_sync(&self.source, store, &self.config, &mut state.ingest).await?;
                Ok(None)
            }
            NodeId::ComputeFeatures => {
                state.features = features::rebuild(store, &self.config.features, false)?;
                Ok(None)
            }
            NodeId::DownstreamConsumerHook => {
                self.notify_downstream(store).await?;
                Ok(None)
            }
        }
    }

    /// Run the configured consumer command, or log what consumers can read.
    async fn notify_downstream(&self, store: &Store) -> Result<()> {
        let Some(command) = &self.config.pipeline.downstream_command else {
            for (table, rows) in store.table_counts()? {
                info!(table, rows, "available to consumers");
            }
            return Ok(());
        };

        let db_path: PathBuf = std::fs::canonicalize(self.db_path())?;
        let status = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .env("F1_DB_PATH", &db_path)
            .status()
            .await?;
        if !status.success() {
            return Err(PipelineError::Downstream(format!("`{command}` exited with {status}")));
        }
        info!(command = %command, "downstream consumer notified");
        Ok(())
    }
}
