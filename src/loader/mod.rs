//! Full and incremental loaders.
//!
//! Both loaders run a fetch phase (network, async) that feeds a
//! [`Normalizer`], then a write phase of synchronous store transactions.
//! No transaction is held across an await.

pub mod full;
pub mod incremental;
pub mod selector;

use std::collections::BTreeMap;
use tracing::{debug, warn};

use crate::config::AppConfig;
use crate::error::Result;
use crate::normalize::identity::{DriverRegistry, TeamLineage};
use crate::normalize::{NormalizedBatch, Normalizer};
use crate::report::IngestReport;
use crate::source::{FetchFilter, SourceRecord, TelemetrySource};
use crate::storage::Store;
use crate::types::{EntityKind, Watermark};

pub use full::full_load;
pub use incremental::incremental_sync;
pub use selector::select_mode;

/// Normalizer primed with the identities and parents already stored.
pub fn normalizer_for(store: &Store, config: &AppConfig) -> Result<Normalizer> {
    let lineage = TeamLineage::with_extra(&config.identity.team_aliases);
    let drivers = DriverRegistry::new(store.driver_aliases()?);
    let mut normalizer = Normalizer::new(lineage, drivers);
    for (meeting_id, year) in store.known_meetings()? {
        normalizer.know_meeting(meeting_id, year);
    }
    for (session_id, info) in store.known_sessions()? {
        normalizer.know_session(session_id, info);
    }
    Ok(normalizer)
}

/// Fetch one kind, counting a failure against it once retries are spent.
async fn fetch_kind<S: TelemetrySource>(
    source: &S,
    kind: EntityKind,
    filter: &FetchFilter,
    report: &mut IngestReport,
) -> Result<Vec<SourceRecord>> {
    match source.fetch(kind, filter).await {
        Ok(records) => Ok(records),
        Err(e) => {
            warn!(%kind, error = %e, "fetch failed");
            report.entry(kind).failed += 1;
            Err(e)
        }
    }
}

/// Meetings and the configured sessions from `start_year` on, newer than
/// the given watermarks.
async fn fetch_calendar<S: TelemetrySource>(
    source: &S,
    config: &AppConfig,
    normalizer: &mut Normalizer,
    watermarks: &BTreeMap<EntityKind, Watermark>,
    report: &mut IngestReport,
) -> Result<()> {
    let base = FetchFilter {
        year_from: Some(config.source.start_year),
        ..Default::default()
    };

    let kind = EntityKind::Meetings;
    let filter = base.clone().since(watermarks.get(&kind).copied());
    let meetings = fetch_kind(source, kind, &filter, report).await?;
    normalizer.accept(kind, &meetings, report);

    let kind = EntityKind::Sessions;
    let filter = base.since(watermarks.get(&kind).copied());
    let sessions: Vec<SourceRecord> = fetch_kind(source, kind, &filter, report)
        .await?
        .into_iter()
        .filter(|r| {
            let name = r.get("session_name").and_then(|v| v.as_str()).unwrap_or("");
            config.source.wants_session(name)
        })
        .collect();
    normalizer.accept(kind, &sessions, report);
    Ok(())
}

/// Latest stored cursors of each session, keyed by session.
pub type SessionCursors = BTreeMap<i64, BTreeMap<EntityKind, Watermark>>;

/// Fetch drivers and every per-session kind for each target session.
///
/// Each session is bounded by its own stored cursors, so data published late
/// for an older session is still picked up after other sessions have moved
/// the global watermarks on.
async fn fetch_session_children<S: TelemetrySource>(
    source: &S,
    normalizer: &mut Normalizer,
    targets: &[i64],
    cursors: &SessionCursors,
    report: &mut IngestReport,
) -> Result<()> {
    for &session_id in targets {
        let Some(info) = normalizer.session_info(session_id) else {
            continue;
        };
        debug!(session_key = session_id, "fetching session data");
        let since = |kind: EntityKind| {
            cursors
                .get(&session_id)
                .and_then(|session| session.get(&kind))
                .copied()
        };

        let kind = EntityKind::Drivers;
        let filter = FetchFilter::for_session(session_id).since(since(kind));
        let drivers = fetch_kind(source, kind, &filter, report).await?;
        normalizer.accept(kind, &drivers, report);

        for kind in EntityKind::PER_SESSION {
            if kind == EntityKind::StartingGrid {
                let filter = FetchFilter {
                    meeting_key: Some(info.meeting_id),
                    ..Default::default()
                };
                let grid = fetch_kind(source, kind, &filter, report).await?;
                normalizer.accept_grid(session_id, &grid, report);
                continue;
            }

            let filter = FetchFilter::for_session(session_id).since(since(kind));
            let records = fetch_kind(source, kind, &filter, report).await?;
            normalizer.accept(kind, &records, report);
        }
    }
    Ok(())
}

/// Highest cursor value present in the batch, per kind.
pub fn observed_watermarks(batch: &NormalizedBatch) -> BTreeMap<EntityKind, Watermark> {
    fn max_timestamp<'a>(
        kind: EntityKind,
        values: impl Iterator<Item = Option<&'a str>>,
    ) -> Option<Watermark> {
        values
            .flatten()
            .filter_map(|raw| Watermark::parse(kind, raw))
            .max()
    }
    fn max_session(values: impl Iterator<Item = i64>) -> Option<Watermark> {
        values.max().map(Watermark::SessionKey)
    }

    let candidates = [
        (
            EntityKind::Meetings,
            max_timestamp(
                EntityKind::Meetings,
                batch.meetings.iter().map(|m| Some(m.date_start.as_str())),
            ),
        ),
        (
            EntityKind::Sessions,
            max_timestamp(
                EntityKind::Sessions,
                batch.sessions.iter().map(|s| s.date_end.as_deref()),
            ),
        ),
        (
            EntityKind::Drivers,
            max_session(batch.driver_sessions.iter().map(|d| d.session_id)),
        ),
        (
            EntityKind::Laps,
            max_timestamp(
                EntityKind::Laps,
                batch.laps.iter().map(|l| l.date_start.as_deref()),
            ),
        ),
        (
            EntityKind::Stints,
            max_session(batch.stints.iter().map(|s| s.session_id)),
        ),
        (
            EntityKind::Pit,
            max_timestamp(EntityKind::Pit, batch.pitstops.iter().map(|p| p.date.as_deref())),
        ),
        (
            EntityKind::Weather,
            max_timestamp(
                EntityKind::Weather,
                batch.weather.iter().map(|w| Some(w.date.as_str())),
            ),
        ),
        (
            EntityKind::SessionResult,
            max_session(batch.results.iter().map(|r| r.session_id)),
        ),
        (
            EntityKind::RaceControl,
            max_timestamp(
                EntityKind::RaceControl,
                batch.race_control.iter().map(|m| Some(m.date.as_str())),
            ),
        ),
        (
            EntityKind::Position,
            max_timestamp(
                EntityKind::Position,
                batch.positions.iter().map(|p| Some(p.date.as_str())),
            ),
        ),
        (
            EntityKind::StartingGrid,
            max_session(batch.grid.iter().map(|g| g.session_id)),
        ),
    ];

    candidates
        .into_iter()
        .filter_map(|(kind, watermark)| watermark.map(|w| (kind, w)))
        .collect()
}

#[cfg(test)]
pub(crate) mod fixtures {
    //! Synthetic upstream data shared by the loader and orchestrator tests.

    use serde_json::json;

    use crate::source::{FixtureSource, SourceRecord};
    use crate::types::EntityKind;

    pub fn record(value: serde_json::Value) -> SourceRecord {
        value.as_object().cloned().unwrap()
    }

    pub fn meeting(meeting_key: i64, date_start: &str) -> SourceRecord {
        record(json!({
            "meeting_key": meeting_key,
            "meeting_name": format!("Grand Prix {meeting_key}"),
            "location": "Somewhere",
            "country_code": "XYZ",
            "circuit_key": meeting_key + 100,
            "circuit_short_name": "Circuit",
            "year": 2024,
            "date_start": date_start
        }))
    }

    pub fn session(session_key: i64, meeting_key: i64, name: &str, start: &str, end: Option<&str>) -> SourceRecord {
        record(json!({
            "session_key": session_key,
            "meeting_key": meeting_key,
            "session_name": name,
            "session_type": name,
            "date_start": start,
            "date_end": end,
            "year": 2024
        }))
    }

    /// Two drivers with a SOFT → HARD stop on lap 11 and `laps` laps each.
    pub fn push_race(source: &FixtureSource, session_key: i64, meeting_key: i64, start_hour: u32, laps: i64) {
        let drivers = [(1, "Max VERSTAPPEN", "Red Bull Racing"), (16, "Charles LECLERC", "Ferrari")];
        source.push(
            EntityKind::Drivers,
            drivers.iter().map(|(number, name, team)| {
                record(json!({
                    "session_key": session_key,
                    "meeting_key": meeting_key,
                    "driver_number": number,
                    "full_name": name,
                    "team_name": team,
                    "team_colour": "ABCDEF"
                }))
            }),
        );

        let mut lap_records = Vec::new();
        let mut stint_records = Vec::new();
        let mut pit_records = Vec::new();
        let mut position_records = Vec::new();
        for (slot, (number, _, _)) in drivers.iter().enumerate() {
            for lap in 1..=laps {
                let minute = lap * 2;
                lap_records.push(record(json!({
                    "session_key": session_key,
                    "meeting_key": meeting_key,
                    "driver_number": number,
                    "lap_number": lap,
                    "date_start": format!("2024-03-02T{:02}:{:02}:00+00:00", start_hour + (minute / 60) as u32, minute % 60),
                    "lap_duration": if lap <= 10 { 90.0 } else { 92.0 },
                    "is_pit_out_lap": lap == 12
                })));
            }
            stint_records.push(record(json!({
                "session_key": session_key, "driver_number": number, "stint_number": 1,
                "compound": "SOFT", "lap_start": 1, "lap_end": 10.min(laps)
            })));
            if laps > 10 {
                stint_records.push(record(json!({
                    "session_key": session_key, "driver_number": number, "stint_number": 2,
                    "compound": "HARD", "lap_start": 11, "lap_end": laps
                })));
                pit_records.push(record(json!({
                    "session_key": session_key, "driver_number": number, "lap_number": 11,
                    "date": format!("2024-03-02T{:02}:22:00+00:00", start_hour),
                    "pit_duration": 22.5
                })));
            }
            position_records.push(record(json!({
                "session_key": session_key, "driver_number": number,
                "date": format!("2024-03-02T{:02}:00:00+00:00", start_hour),
                "position": slot + 1
            })));
        }
        source.push(EntityKind::Laps, lap_records);
        source.push(EntityKind::Stints, stint_records);
        source.push(EntityKind::Pit, pit_records);
        source.push(EntityKind::Position, position_records);
        source.push(
            EntityKind::Weather,
            vec![record(json!({
                "session_key": session_key,
                "date": format!("2024-03-02T{:02}:00:00+00:00", start_hour),
                "track_temperature": 30.5, "air_temperature": 21.0,
                "humidity": 40.0, "rainfall": 0
            }))],
        );
        source.push(
            EntityKind::SessionResult,
            drivers.iter().enumerate().map(|(slot, (number, _, _))| {
                record(json!({
                    "session_key": session_key, "driver_number": number,
                    "position": slot + 1, "number_of_laps": laps, "dnf": false
                }))
            }),
        );
        source.push(
            EntityKind::RaceControl,
            vec![record(json!({
                "session_key": session_key,
                "date": format!("2024-03-02T{:02}:00:00+00:00", start_hour),
                "category": "Flag", "flag": "GREEN", "message": "GREEN LIGHT - PIT EXIT OPEN"
            }))],
        );
        source.push(
            EntityKind::StartingGrid,
            drivers.iter().enumerate().map(|(slot, (number, _, _))| {
                record(json!({
                    "session_key": session_key - 4, "meeting_key": meeting_key,
                    "driver_number": number, "position": slot + 1
                }))
            }),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Lap, Session, Stint};

    #[test]
    fn test_observed_watermarks() {
        let batch = NormalizedBatch {
            sessions: vec![
                Session {
                    session_id: 1,
                    meeting_id: 1,
                    session_name: "Race".into(),
                    session_type: None,
                    date_start: "2024-03-02T15:00:00.000Z".into(),
                    date_end: Some("2024-03-02T17:00:00.000Z".into()),
                    year: 2024,
                },
                Session {
                    session_id: 2,
                    meeting_id: 2,
                    session_name: "Race".into(),
                    session_type: None,
                    date_start: "2024-03-09T17:00:00.000Z".into(),
                    date_end: None,
                    year: 2024,
                },
            ],
            laps: vec![Lap {
                session_id: 2,
                date_start: None,
                ..Default::default()
            }],
            stints: vec![Stint {
                session_id: 2,
                driver_id: "X".into(),
                driver_number: 1,
                stint_number: 1,
                compound: None,
                lap_start: 1,
                lap_end: None,
                tyre_age_at_start: None,
            }],
            ..Default::default()
        };

        let observed = observed_watermarks(&batch);
        assert_eq!(
            observed[&EntityKind::Sessions].to_query_value(),
            "2024-03-02T17:00:00.000Z"
        );
        assert_eq!(observed[&EntityKind::Stints], Watermark::SessionKey(2));
        // Laps without a start time give no cursor
        assert!(!observed.contains_key(&EntityKind::Laps));
        assert!(!observed.contains_key(&EntityKind::Meetings));
    }
}
