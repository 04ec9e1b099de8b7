//! Recorded upstream data served from memory.
//!
//! Used for offline replays (`--fixture dump.json`) and as the source in
//! loader and orchestrator tests, where failures can be injected per kind.

use anyhow::Context;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Mutex;

use super::{FetchFilter, SourceRecord, TelemetrySource};
use crate::error::{PipelineError, Result};
use crate::types::EntityKind;

/// How an injected failure behaves.
#[cfg_attr(not(test), allow(dead_code))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectedFailure {
    /// Fail the next `n` calls with a transient error, then recover.
    Transient(u32),
    /// Fail every call with a non-retryable error.
    Permanent,
}

#[derive(Default)]
struct FixtureState {
    records: BTreeMap<EntityKind, Vec<SourceRecord>>,
    failures: HashMap<EntityKind, InjectedFailure>,
    calls: Vec<(EntityKind, FetchFilter)>,
}

/// In-memory [`TelemetrySource`]
#[derive(Default)]
pub struct FixtureSource {
    state: Mutex<FixtureState>,
}

impl FixtureSource {
    #[cfg(test)]
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a dump shaped like `{"meetings": [...], "sessions": [...], ...}`.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read fixture {}", path.display()))?;
        let records: BTreeMap<EntityKind, Vec<SourceRecord>> =
            serde_json::from_str(&content).context("Failed to parse fixture JSON")?;
        Ok(Self {
            state: Mutex::new(FixtureState {
                records,
                ..Default::default()
            }),
        })
    }

    /// Append upstream records for a kind.
    #[cfg(test)]
    pub fn push(&self, kind: EntityKind, records: impl IntoIterator<Item = SourceRecord>) {
        if let Ok(mut state) = self.state.lock() {
            state.records.entry(kind).or_default().extend(records);
        }
    }

    #[cfg(test)]
    pub fn inject_failure(&self, kind: EntityKind, failure: InjectedFailure) {
        if let Ok(mut state) = self.state.lock() {
            state.failures.insert(kind, failure);
        }
    }

    #[cfg(test)]
    pub fn clear_failures(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.failures.clear();
        }
    }

    /// Filters this source has been asked for, in call order.
    #[cfg(test)]
    pub fn calls(&self, kind: EntityKind) -> Vec<FetchFilter> {
        self.state
            .lock()
            .map(|state| {
                state
                    .calls
                    .iter()
                    .filter(|(k, _)| *k == kind)
                    .map(|(_, f)| f.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn serve(&self, kind: EntityKind, filter: &FetchFilter) -> Result<Vec<SourceRecord>> {
        let mut state = self.state.lock().map_err(|_| PipelineError::Source {
            kind,
            message: "fixture state poisoned".into(),
        })?;
        state.calls.push((kind, filter.clone()));

        match state.failures.get(&kind).copied() {
            Some(InjectedFailure::Permanent) => {
                return Err(PipelineError::Source {
                    kind,
                    message: "injected failure".into(),
                });
            }
            Some(InjectedFailure::Transient(remaining)) if remaining > 0 => {
                state
                    .failures
                    .insert(kind, InjectedFailure::Transient(remaining - 1));
                return Err(PipelineError::TransientSource {
                    kind,
                    message: "injected 429".into(),
                });
            }
            _ => {}
        }

        Ok(state
            .records
            .get(&kind)
            .map(|records| {
                records
                    .iter()
                    .filter(|r| filter.matches(kind, r))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

impl TelemetrySource for FixtureSource {
    async fn fetch(&self, kind: EntityKind, filter: &FetchFilter) -> Result<Vec<SourceRecord>> {
        self.serve(kind, filter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    fn record(value: serde_json::Value) -> SourceRecord {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_filters_by_session() {
        let source = FixtureSource::new();
        source.push(
            EntityKind::Laps,
            vec![
                record(json!({"session_key": 1, "lap_number": 1})),
                record(json!({"session_key": 2, "lap_number": 1})),
            ],
        );

        let laps = source
            .fetch(EntityKind::Laps, &FetchFilter::for_session(2))
            .await
            .unwrap();
        assert_eq!(laps.len(), 1);
        assert_eq!(source.calls(EntityKind::Laps).len(), 1);
    }

    #[tokio::test]
    async fn test_transient_failure_recovers() {
        let source = FixtureSource::new();
        source.inject_failure(EntityKind::Meetings, InjectedFailure::Transient(1));

        let first = source.fetch(EntityKind::Meetings, &FetchFilter::default()).await;
        assert!(matches!(first, Err(PipelineError::TransientSource { .. })));
        let second = source.fetch(EntityKind::Meetings, &FetchFilter::default()).await;
        assert!(second.unwrap().is_empty());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"meetings": [{{"meeting_key": 1229, "year": 2024}}], "pit": []}}"#
        )
        .unwrap();

        let source = FixtureSource::from_file(file.path()).unwrap();
        let state = source.state.lock().unwrap();
        assert_eq!(state.records[&EntityKind::Meetings].len(), 1);
        assert!(state.records[&EntityKind::Pit].is_empty());
    }
}
