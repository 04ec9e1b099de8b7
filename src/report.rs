//! Run summary: per-kind ingest counts, feature counts and node outcomes.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::orchestrator::graph::{NodeId, NodeState};
use crate::types::{EntityKind, LoadMode};

/// Counters for one entity kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KindCounts {
    /// Records returned by the source.
    pub fetched: u64,
    /// Rows inserted or filled in the store.
    pub ingested: u64,
    /// Records dropped by the normalizer.
    pub skipped: u64,
    /// Requests or writes that failed after retries.
    pub failed: u64,
}

/// Per-kind counters for a loader run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IngestReport {
    pub kinds: BTreeMap<EntityKind, KindCounts>,
}

impl IngestReport {
    pub fn entry(&mut self, kind: EntityKind) -> &mut KindCounts {
        self.kinds.entry(kind).or_default()
    }

    #[cfg(test)]
    pub fn get(&self, kind: EntityKind) -> KindCounts {
        self.kinds.get(&kind).copied().unwrap_or_default()
    }

    pub fn total_ingested(&self) -> u64 {
        self.kinds.values().map(|c| c.ingested).sum()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSummary {
    pub sessions_processed: u64,
    pub sessions_skipped: u64,
    pub events_written: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeOutcome {
    pub node: NodeId,
    pub state: NodeState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Everything a caller needs to judge one pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub pipeline_id: String,
    pub run_id: i64,
    pub mode: Option<LoadMode>,
    pub status: RunStatus,
    pub cancelled: bool,
    pub nodes: Vec<NodeOutcome>,
    pub ingest: IngestReport,
    pub features: FeatureSummary,
}

impl RunReport {
    pub fn succeeded(&self) -> bool {
        self.status == RunStatus::Success
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Print the report in table format.
    pub fn print_table(&self) {
        println!("Pipeline: {} (run #{})", self.pipeline_id, self.run_id);
        match self.mode {
            Some(mode) => println!("Mode:     {mode}"),
            None => println!("Mode:     -"),
        }
        println!();

        println!("=== Tasks ===");
        for outcome in &self.nodes {
            match &outcome.error {
                Some(error) => println!(
                    "  {:<26} {:<8} {}",
                    outcome.node.as_str(),
                    outcome.state.as_str(),
                    error
                ),
                None => println!(
                    "  {:<26} {}",
                    outcome.node.as_str(),
                    outcome.state.as_str()
                ),
            }
        }
        println!();

        if !self.ingest.kinds.is_empty() {
            println!("=== Ingest ===");
            println!(
                "  {:<16} {:>9} {:>9} {:>8} {:>7}",
                "kind", "fetched", "ingested", "skipped", "failed"
            );
            for (kind, counts) in &self.ingest.kinds {
                println!(
                    "  {:<16} {:>9} {:>9} {:>8} {:>7}",
                    kind.as_str(),
                    counts.fetched,
                    counts.ingested,
                    counts.skipped,
                    counts.failed
                );
            }
            println!();
        }

        println!("=== Features ===");
        println!(
            "  sessions processed: {}, skipped: {}, events written: {}",
            self.features.sessions_processed,
            self.features.sessions_skipped,
            self.features.events_written
        );
        println!();

        if self.cancelled {
            println!("Status: {} (cancelled)", self.status.as_str());
        } else {
            println!("Status: {}", self.status.as_str());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ingest_report_accumulates_per_kind() {
        let mut report = IngestReport::default();
        report.entry(EntityKind::Laps).fetched += 20;
        report.entry(EntityKind::Laps).ingested += 18;
        report.entry(EntityKind::Sessions).ingested += 1;

        assert_eq!(report.get(EntityKind::Laps).fetched, 20);
        assert_eq!(report.get(EntityKind::Pit), KindCounts::default());
        assert_eq!(report.total_ingested(), 19);
    }

    #[test]
    fn test_report_json_shape() {
        let mut ingest = IngestReport::default();
        ingest.entry(EntityKind::Meetings).fetched = 2;
        let report = RunReport {
            pipeline_id: "f1_etl_pipeline".into(),
            run_id: 7,
            mode: Some(LoadMode::Incremental),
            status: RunStatus::Failed,
            cancelled: false,
            nodes: vec![NodeOutcome {
                node: NodeId::FullLoad,
                state: NodeState::Skipped,
                error: None,
            }],
            ingest,
            features: FeatureSummary::default(),
        };

        let value: serde_json::Value =
            serde_json::from_str(&report.to_json().unwrap()).unwrap();
        assert_eq!(value["mode"], "incremental");
        assert_eq!(value["status"], "failed");
        assert_eq!(value["nodes"][0]["node"], "full_load");
        assert_eq!(value["nodes"][0]["state"], "skipped");
        assert_eq!(value["ingest"]["meetings"]["fetched"], 2);

        let parsed: RunReport = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, report);
    }
}
