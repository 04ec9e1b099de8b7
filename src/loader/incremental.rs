//! Watermark-driven incremental sync.

use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

use super::{
    fetch_calendar, fetch_kind, fetch_session_children, normalizer_for, observed_watermarks,
    SessionCursors,
};
use crate::config::AppConfig;
use crate::error::Result;
use crate::normalize::Normalizer;
use crate::report::IngestReport;
use crate::source::{FetchFilter, TelemetrySource};
use crate::storage::Store;
use crate::types::{CursorField, EntityKind, Watermark};

/// Fetch everything newer than the stored watermarks and commit it in one
/// transaction together with the dirty marks and the watermark advance.
///
/// Per-session data is fetched for new sessions and for stored sessions
/// that may still be incomplete upstream, each bounded by its own stored
/// cursors. Stored sessions still missing their end time are fetched again
/// so late `date_end` values get filled.
pub async fn incremental_sync<S: TelemetrySource>(
    source: &S,
    store: &mut Store,
    config: &AppConfig,
    report: &mut IngestReport,
) -> Result<()> {
    let watermarks = store.watermarks()?;
    let open_sessions = store.open_sessions()?;
    let frontier = child_frontier(&watermarks);
    let pending = store.sessions_awaiting_children(frontier.as_ref())?;
    info!(
        watermarks = watermarks.len(),
        open_sessions = open_sessions.len(),
        pending_sessions = pending.len(),
        "starting incremental sync"
    );

    let mut normalizer = normalizer_for(store, config)?;
    fetch_calendar(source, config, &mut normalizer, &watermarks, report).await?;
    refetch_open_sessions(source, &mut normalizer, &open_sessions, report).await?;

    let targets: Vec<i64> = normalizer
        .batch()
        .sessions
        .iter()
        .map(|s| s.session_id)
        .chain(pending.iter().copied())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    debug!(?targets, "sessions to refresh");

    let mut cursors = SessionCursors::new();
    for &session_id in &targets {
        cursors.insert(session_id, store.session_cursors(session_id)?);
        normalizer.seed_lap_context(
            store.stints_for_session(session_id)?,
            store.weather_for_session(session_id)?,
            store.positions_for_session(session_id)?,
        );
    }
    fetch_session_children(source, &mut normalizer, &targets, &cursors, report).await?;

    let batch = normalizer.finish();

    // All-or-nothing: dropping the transaction on error rolls it back
    let tx = store.transaction()?;
    for kind in EntityKind::ALL {
        match tx.write_kind(kind, &batch) {
            Ok(changed) => report.entry(kind).ingested += changed,
            Err(e) => {
                warn!(%kind, error = %e, "write failed, rolling back");
                report.entry(kind).failed += batch.rows(kind) as u64;
                return Err(e);
            }
        }
    }
    for (kind, watermark) in observed_watermarks(&batch) {
        if tx.advance_watermark(kind, &watermark)? {
            info!(%kind, %watermark, "watermark advanced");
        }
    }
    tx.commit()?;

    info!(
        sessions = targets.len(),
        rows = report.total_ingested(),
        "incremental sync complete"
    );
    Ok(())
}

/// Oldest watermark among the timestamp-keyed per-session kinds.
///
/// `None` when none is set yet, e.g. after a full load that failed before
/// writing its watermarks; every stored session is then refreshed.
fn child_frontier(watermarks: &BTreeMap<EntityKind, Watermark>) -> Option<Watermark> {
    EntityKind::PER_SESSION
        .into_iter()
        .filter(|kind| matches!(kind.cursor(), CursorField::Timestamp(_)))
        .filter_map(|kind| watermarks.get(&kind).copied())
        .min()
}

/// Fetch stored open sessions by key; the `date_end` watermark may
/// already be past their end time.
async fn refetch_open_sessions<S: TelemetrySource>(
    source: &S,
    normalizer: &mut Normalizer,
    open_sessions: &[i64],
    report: &mut IngestReport,
) -> Result<()> {
    let kind = EntityKind::Sessions;
    for &session_id in open_sessions {
        let already_fetched = normalizer
            .batch()
            .sessions
            .iter()
            .any(|s| s.session_id == session_id);
        if already_fetched {
            continue;
        }
        let records = fetch_kind(source, kind, &FetchFilter::for_session(session_id), report).await?;
        normalizer.accept(kind, &records, report);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SourceConfig;
    use crate::loader::fixtures::{meeting, push_race, record, session};
    use crate::loader::full_load;
    use crate::source::fixture::InjectedFailure;
    use crate::source::FixtureSource;
    use crate::types::Lap;
    use serde_json::json;

    fn config() -> AppConfig {
        AppConfig {
            source: SourceConfig {
                session_names: vec!["Race".into(), "Sprint".into()],
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Two meetings, one finished race each, loaded in full.
    async fn loaded_store(source: &FixtureSource) -> Store {
        source.push(
            EntityKind::Meetings,
            vec![
                meeting(1, "2024-02-29T11:30:00+00:00"),
                meeting(2, "2024-03-07T13:30:00+00:00"),
            ],
        );
        source.push(
            EntityKind::Sessions,
            vec![
                session(11, 1, "Race", "2024-03-02T11:00:00+00:00", Some("2024-03-02T13:00:00+00:00")),
                session(21, 2, "Race", "2024-03-02T13:00:00+00:00", Some("2024-03-02T15:00:00+00:00")),
            ],
        );
        push_race(source, 11, 1, 11, 20);
        push_race(source, 21, 2, 13, 20);

        let mut store = Store::in_memory().unwrap();
        let mut report = IngestReport::default();
        full_load(source, &mut store, &config(), &mut report).await.unwrap();
        store
    }

    fn clear_dirty(store: &Store) {
        store.conn().execute("DELETE FROM feature_dirty", []).unwrap();
    }

    #[tokio::test]
    async fn test_second_run_ingests_only_the_new_session() {
        let source = FixtureSource::new();
        let mut store = loaded_store(&source).await;
        clear_dirty(&store);

        source.push(
            EntityKind::Sessions,
            vec![session(22, 2, "Sprint", "2024-03-02T17:00:00+00:00", Some("2024-03-02T18:00:00+00:00"))],
        );
        push_race(&source, 22, 2, 17, 20);

        let mut report = IngestReport::default();
        incremental_sync(&source, &mut store, &config(), &mut report)
            .await
            .unwrap();

        assert_eq!(report.get(EntityKind::Meetings).ingested, 0);
        assert_eq!(report.get(EntityKind::Sessions).ingested, 1);
        assert_eq!(report.get(EntityKind::Laps).ingested, 40);
        assert_eq!(report.get(EntityKind::Stints).ingested, 4);
        assert_eq!(report.get(EntityKind::Pit).ingested, 2);

        // Session 11 ended before every child watermark and is left alone;
        // session 21 is still near the frontier and asked from its own cursor
        let lap_calls: Vec<Option<i64>> = source
            .calls(EntityKind::Laps)
            .iter()
            .skip(2)
            .map(|f| f.session_key)
            .collect();
        assert_eq!(lap_calls, vec![Some(21), Some(22)]);
        let since_21 = source
            .calls(EntityKind::Laps)
            .iter()
            .find(|f| f.session_key == Some(21) && f.since.is_some())
            .and_then(|f| f.since)
            .map(|w| w.to_query_value());
        assert_eq!(since_21.as_deref(), Some("2024-03-02T13:40:00.000Z"));

        assert_eq!(
            store.watermarks().unwrap()[&EntityKind::Sessions].to_query_value(),
            "2024-03-02T18:00:00.000Z"
        );
        assert_eq!(store.dirty_sessions().unwrap(), vec![22]);
    }

    #[tokio::test]
    async fn test_rerun_without_new_data_changes_nothing() {
        let source = FixtureSource::new();
        source.push(
            EntityKind::Sessions,
            vec![session(31, 2, "Race", "2024-03-02T15:00:00+00:00", None)],
        );
        push_race(&source, 31, 2, 15, 12);
        let mut store = loaded_store(&source).await;
        clear_dirty(&store);
        let before = store.snapshot().unwrap();

        for _ in 0..2 {
            let mut report = IngestReport::default();
            incremental_sync(&source, &mut store, &config(), &mut report)
                .await
                .unwrap();
            assert_eq!(report.total_ingested(), 0);
            assert_eq!(store.snapshot().unwrap(), before);
        }
        // The open session's children were asked for on every run
        let open_calls = source
            .calls(EntityKind::Stints)
            .iter()
            .filter(|f| f.session_key == Some(31))
            .count();
        assert_eq!(open_calls, 3);
    }

    #[tokio::test]
    async fn test_late_end_time_fills_open_session() {
        let source = FixtureSource::new();
        source.push(
            EntityKind::Sessions,
            vec![session(31, 2, "Race", "2024-03-02T15:00:00+00:00", None)],
        );
        push_race(&source, 31, 2, 15, 12);
        let mut store = loaded_store(&source).await;
        assert_eq!(store.open_sessions().unwrap(), vec![31]);

        // Upstream now reports the end time; the old record is still served
        source.push(
            EntityKind::Sessions,
            vec![session(31, 2, "Race", "2024-03-02T15:00:00+00:00", Some("2024-03-02T16:45:00+00:00"))],
        );
        let mut report = IngestReport::default();
        incremental_sync(&source, &mut store, &config(), &mut report)
            .await
            .unwrap();

        assert!(store.open_sessions().unwrap().is_empty());
        assert_eq!(report.get(EntityKind::Sessions).ingested, 1);
        assert_eq!(
            store.watermarks().unwrap()[&EntityKind::Sessions].to_query_value(),
            "2024-03-02T16:45:00.000Z"
        );
        // Populated columns survive the null-carrying duplicate
        let name: String = store
            .conn()
            .query_row("SELECT session_name FROM sessions WHERE session_id = 31", [], |row| row.get(0))
            .unwrap();
        assert_eq!(name, "Race");
    }

    #[tokio::test]
    async fn test_failed_sync_commits_nothing() {
        let source = FixtureSource::new();
        let mut store = loaded_store(&source).await;
        let before = store.snapshot().unwrap();

        source.push(
            EntityKind::Sessions,
            vec![session(22, 2, "Sprint", "2024-03-02T17:00:00+00:00", Some("2024-03-02T18:00:00+00:00"))],
        );
        push_race(&source, 22, 2, 17, 20);
        source.inject_failure(EntityKind::Weather, InjectedFailure::Permanent);

        let mut report = IngestReport::default();
        let result = incremental_sync(&source, &mut store, &config(), &mut report).await;

        assert!(result.is_err());
        assert_eq!(report.get(EntityKind::Weather).failed, 1);
        assert_eq!(store.snapshot().unwrap(), before);

        // Recovery converges to the new session
        source.clear_failures();
        let mut report = IngestReport::default();
        incremental_sync(&source, &mut store, &config(), &mut report)
            .await
            .unwrap();
        assert_eq!(store.session_ids().unwrap(), vec![11, 21, 22]);
    }

    #[tokio::test]
    async fn test_children_published_after_the_session_are_fetched() {
        let source = FixtureSource::new();
        source.push(EntityKind::Meetings, vec![meeting(1, "2024-02-29T11:30:00+00:00")]);
        source.push(
            EntityKind::Sessions,
            vec![session(11, 1, "Race", "2024-03-02T11:00:00+00:00", Some("2024-03-02T13:00:00+00:00"))],
        );
        push_race(&source, 11, 1, 11, 20);
        let mut store = Store::in_memory().unwrap();
        full_load(&source, &mut store, &config(), &mut IngestReport::default())
            .await
            .unwrap();

        // The session is listed with its scheduled end before any timing data
        source.push(EntityKind::Meetings, vec![meeting(2, "2024-03-07T13:30:00+00:00")]);
        source.push(
            EntityKind::Sessions,
            vec![session(21, 2, "Race", "2024-03-02T13:00:00+00:00", Some("2024-03-02T15:00:00+00:00"))],
        );
        let mut report = IngestReport::default();
        incremental_sync(&source, &mut store, &config(), &mut report)
            .await
            .unwrap();
        assert_eq!(report.get(EntityKind::Sessions).ingested, 1);
        assert_eq!(report.get(EntityKind::Laps).ingested, 0);

        // A later session moves the lap watermark past session 21's laps
        source.push(
            EntityKind::Sessions,
            vec![session(22, 2, "Sprint", "2024-03-02T17:00:00+00:00", Some("2024-03-02T18:00:00+00:00"))],
        );
        push_race(&source, 22, 2, 17, 20);
        incremental_sync(&source, &mut store, &config(), &mut IngestReport::default())
            .await
            .unwrap();
        assert_eq!(
            store.watermarks().unwrap()[&EntityKind::Laps].to_query_value(),
            "2024-03-02T17:40:00.000Z"
        );

        // Session 21's data only now appears upstream
        push_race(&source, 21, 2, 13, 20);
        let mut report = IngestReport::default();
        incremental_sync(&source, &mut store, &config(), &mut report)
            .await
            .unwrap();

        assert_eq!(report.get(EntityKind::Laps).ingested, 40);
        assert_eq!(report.get(EntityKind::Stints).ingested, 4);
        assert_eq!(store.laps_for_session(21).unwrap().len(), 40);
        assert!(store.dirty_sessions().unwrap().contains(&21));

        // Once filled and behind the frontier, the session is settled
        let frontier = child_frontier(&store.watermarks().unwrap());
        assert!(!store
            .sessions_awaiting_children(frontier.as_ref())
            .unwrap()
            .contains(&21));
    }

    #[tokio::test]
    async fn test_new_laps_use_stored_weather_and_position() {
        let source = FixtureSource::new();
        source.push(EntityKind::Meetings, vec![meeting(2, "2024-03-07T13:30:00+00:00")]);
        source.push(
            EntityKind::Sessions,
            vec![session(31, 2, "Race", "2024-03-02T15:00:00+00:00", None)],
        );
        push_race(&source, 31, 2, 15, 5);
        let mut store = Store::in_memory().unwrap();
        full_load(&source, &mut store, &config(), &mut IngestReport::default())
            .await
            .unwrap();
        let lap_5 = store
            .laps_for_session(31)
            .unwrap()
            .into_iter()
            .find(|l| l.driver_number == 1 && l.lap_number == 5)
            .unwrap();
        assert_eq!(lap_5.track_temperature, Some(30.5));
        assert_eq!(lap_5.position, Some(1));

        // Laps 6-8 arrive with no new weather or position samples
        source.push(
            EntityKind::Laps,
            (6..=8).map(|lap| {
                record(json!({
                    "session_key": 31, "meeting_key": 2, "driver_number": 1,
                    "lap_number": lap,
                    "date_start": format!("2024-03-02T15:{:02}:00+00:00", lap * 2),
                    "lap_duration": 91.0
                }))
            }),
        );
        let mut report = IngestReport::default();
        incremental_sync(&source, &mut store, &config(), &mut report)
            .await
            .unwrap();
        assert_eq!(report.get(EntityKind::Laps).ingested, 3);
        assert_eq!(report.get(EntityKind::Weather).ingested, 0);
        assert_eq!(report.get(EntityKind::Position).ingested, 0);

        let new_laps: Vec<Lap> = store
            .laps_for_session(31)
            .unwrap()
            .into_iter()
            .filter(|l| l.lap_number > 5)
            .collect();
        assert_eq!(new_laps.len(), 3);
        for lap in new_laps {
            assert_eq!(lap.track_temperature, Some(30.5), "lap {}", lap.lap_number);
            assert_eq!(lap.air_temperature, Some(21.0));
            assert_eq!(lap.humidity, Some(40.0));
            assert_eq!(lap.rainfall, Some(0));
            assert_eq!(lap.position, Some(1));
        }
    }
}
