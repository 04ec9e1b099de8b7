//! Tyre-change features derived from stints, laps and pit stops.
//!
//! `tyre_changes` is a cache over the entity tables: every rebuild deletes a
//! session's rows and writes them again from scratch.

use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{debug, info, warn};

use crate::config::FeatureConfig;
use crate::error::{PipelineError, Result};
use crate::report::FeatureSummary;
use crate::storage::Store;
use crate::types::{Lap, Stint, TyreChangeEvent};

/// Builds tyre-change events for one session at a time.
#[derive(Debug, Clone)]
pub struct TyreChangeBuilder {
    window: usize,
    pit_adjacent_laps: i64,
}

/// Means over one side of a compound change.
#[derive(Debug, Default, PartialEq)]
struct WindowStats {
    lap_duration: Option<f64>,
    position: Option<f64>,
}

impl TyreChangeBuilder {
    pub fn new(config: &FeatureConfig) -> Self {
        Self {
            window: config.window.max(1),
            pit_adjacent_laps: config.pit_adjacent_laps.max(0),
        }
    }

    /// One event per adjacent stint pair of every driver in the session.
    ///
    /// Fails with [`PipelineError::InvariantViolation`] when a driver's
    /// stints do not tile their laps.
    pub fn session_events(
        &self,
        session_id: i64,
        stints: &[Stint],
        laps: &[Lap],
        pit_laps: &[(String, i64)],
    ) -> Result<Vec<TyreChangeEvent>> {
        let mut stints_by_driver: BTreeMap<&str, Vec<&Stint>> = BTreeMap::new();
        for stint in stints {
            stints_by_driver
                .entry(stint.driver_id.as_str())
                .or_default()
                .push(stint);
        }

        let mut laps_by_driver: HashMap<&str, BTreeMap<i64, &Lap>> = HashMap::new();
        for lap in laps {
            laps_by_driver
                .entry(lap.driver_id.as_str())
                .or_default()
                .insert(lap.lap_number, lap);
        }

        let mut pits_by_driver: HashMap<&str, Vec<i64>> = HashMap::new();
        for (driver_id, lap_number) in pit_laps {
            pits_by_driver
                .entry(driver_id.as_str())
                .or_default()
                .push(*lap_number);
        }

        let no_laps = BTreeMap::new();
        let mut events = Vec::new();
        for (driver_id, mut driver_stints) in stints_by_driver {
            driver_stints.sort_by_key(|s| s.stint_number);
            check_stints(session_id, driver_id, &driver_stints)?;

            let laps = laps_by_driver.get(driver_id).unwrap_or(&no_laps);
            let excluded = self.pit_affected_laps(
                laps,
                pits_by_driver.get(driver_id).map(Vec::as_slice).unwrap_or(&[]),
            );

            for pair in driver_stints.windows(2) {
                let (old, new) = (pair[0], pair[1]);
                let boundary = new.lap_start;

                let before = self.window_stats(
                    laps.range(old.lap_start..boundary).rev().map(|(_, l)| *l),
                    &excluded,
                );
                let after_laps = match new.lap_end {
                    Some(end) => laps.range(boundary..=end),
                    None => laps.range(boundary..),
                };
                let after = self.window_stats(after_laps.map(|(_, l)| *l), &excluded);

                let previous_compound = compound_name(old);
                let new_compound = compound_name(new);
                events.push(TyreChangeEvent {
                    session_id,
                    driver_id: driver_id.to_string(),
                    lap_number: boundary,
                    change_type: format!("{previous_compound}->{new_compound}"),
                    previous_compound,
                    new_compound,
                    // check_stints guarantees a lap_end on every stint but the last
                    laps_on_old_tyre: old.lap_end.map_or(0, |end| end - old.lap_start + 1),
                    laps_on_new_tyre: new.lap_end.map(|end| end - new.lap_start + 1),
                    lap_duration_before: before.lap_duration,
                    lap_duration_after: after.lap_duration,
                    lap_time_change: difference(before.lap_duration, after.lap_duration),
                    position_before: before.position,
                    position_after: after.position,
                    position_change: difference(before.position, after.position),
                });
            }
        }
        Ok(events)
    }

    /// Pit laps, the laps within `pit_adjacent_laps` of them, and flagged
    /// out laps.
    fn pit_affected_laps(&self, laps: &BTreeMap<i64, &Lap>, pit_laps: &[i64]) -> HashSet<i64> {
        let reach = self.pit_adjacent_laps.unsigned_abs();
        laps.values()
            .filter(|l| {
                l.is_pit_out_lap == Some(true)
                    || pit_laps
                        .iter()
                        .any(|&pit| l.lap_number.abs_diff(pit) <= reach)
            })
            .map(|l| l.lap_number)
            .collect()
    }

    /// Mean over the first `window` usable laps the iterator yields.
    ///
    /// Laps without a duration do not count toward the window.
    fn window_stats<'a>(
        &self,
        laps: impl Iterator<Item = &'a Lap>,
        excluded: &HashSet<i64>,
    ) -> WindowStats {
        let used: Vec<&Lap> = laps
            .filter(|l| !excluded.contains(&l.lap_number))
            .filter(|l| l.lap_duration.is_some())
            .take(self.window)
            .collect();

        WindowStats {
            lap_duration: mean(used.iter().filter_map(|l| l.lap_duration)),
            position: mean(used.iter().filter_map(|l| l.position.map(|p| p as f64))),
        }
    }
}

fn check_stints(session_id: i64, driver_id: &str, stints: &[&Stint]) -> Result<()> {
    let last = stints.len().saturating_sub(1);
    for (i, stint) in stints.iter().enumerate() {
        match stint.lap_end {
            Some(end) if end < stint.lap_start => {
                return Err(PipelineError::invariant(
                    session_id,
                    format!(
                        "{driver_id} stint {} ends on lap {end} before it starts on lap {}",
                        stint.stint_number, stint.lap_start
                    ),
                ));
            }
            None if i < last => {
                return Err(PipelineError::invariant(
                    session_id,
                    format!(
                        "{driver_id} stint {} has no end lap but is not the last stint",
                        stint.stint_number
                    ),
                ));
            }
            _ => {}
        }
    }

    for pair in stints.windows(2) {
        let (old, new) = (pair[0], pair[1]);
        if let Some(end) = old.lap_end {
            if new.lap_start != end + 1 {
                let problem = if new.lap_start <= end { "overlaps" } else { "leaves a gap after" };
                return Err(PipelineError::invariant(
                    session_id,
                    format!(
                        "{driver_id} stint {} {problem} stint {} (laps {}..={end}, next starts on {})",
                        new.stint_number, old.stint_number, old.lap_start, new.lap_start
                    ),
                ));
            }
        }
    }
    Ok(())
}

fn compound_name(stint: &Stint) -> String {
    stint
        .compound
        .clone()
        .unwrap_or_else(|| "UNKNOWN".to_string())
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, count) = values.fold((0.0, 0_u32), |(sum, count), v| (sum + v, count + 1));
    (count > 0).then(|| sum / f64::from(count))
}

fn difference(before: Option<f64>, after: Option<f64>) -> Option<f64> {
    Some(after? - before?)
}

/// Rebuild `tyre_changes` for the dirty sessions, or every session with
/// `all`.
///
/// Each session is replaced in its own transaction. A session whose stints
/// break an invariant is skipped: its entity rows and dirty mark stay, its
/// tyre-change rows are dropped since they no longer follow from its stints.
pub fn rebuild(store: &mut Store, config: &FeatureConfig, all: bool) -> Result<FeatureSummary> {
    let sessions = if all {
        store.session_ids()?
    } else {
        store.dirty_sessions()?
    };
    info!(sessions = sessions.len(), all, "rebuilding tyre-change features");

    let builder = TyreChangeBuilder::new(config);
    let mut summary = FeatureSummary::default();
    for session_id in sessions {
        let stints = store.stints_for_session(session_id)?;
        let laps = store.laps_for_session(session_id)?;
        let pit_laps = store.pit_laps_for_session(session_id)?;

        match builder.session_events(session_id, &stints, &laps, &pit_laps) {
            Ok(events) => {
                let written = store.replace_tyre_changes(session_id, &events)?;
                debug!(session_key = session_id, events = written, "features rebuilt");
                summary.sessions_processed += 1;
                summary.events_written += written;
            }
            Err(e) => {
                let dropped = store.clear_tyre_changes(session_id)?;
                warn!(session_key = session_id, error = %e, dropped, "skipping session");
                summary.sessions_skipped += 1;
            }
        }
    }

    info!(
        processed = summary.sessions_processed,
        skipped = summary.sessions_skipped,
        events = summary.events_written,
        "feature rebuild complete"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn stint(driver: &str, number: i64, compound: &str, start: i64, end: Option<i64>) -> Stint {
        Stint {
            session_id: 1,
            driver_id: driver.into(),
            driver_number: 1,
            stint_number: number,
            compound: Some(compound.into()),
            lap_start: start,
            lap_end: end,
            tyre_age_at_start: None,
        }
    }

    fn lap(driver: &str, number: i64, duration: Option<f64>) -> Lap {
        Lap {
            session_id: 1,
            driver_id: driver.into(),
            driver_number: 1,
            lap_number: number,
            lap_duration: duration,
            ..Default::default()
        }
    }

    fn builder() -> TyreChangeBuilder {
        TyreChangeBuilder::new(&FeatureConfig::default())
    }

    #[test]
    fn test_soft_to_hard_gives_one_event_at_lap_11() {
        let stints = vec![
            stint("VER", 1, "SOFT", 1, Some(10)),
            stint("VER", 2, "HARD", 11, Some(20)),
        ];
        let mut laps: Vec<Lap> = (1..=20)
            .map(|n| {
                let duration = if n <= 10 { 90.0 } else { 92.0 };
                let mut l = lap("VER", n, Some(duration));
                l.position = Some(if n <= 10 { 3 } else { 5 });
                l
            })
            .collect();
        laps[7].lap_duration = None; // lap 8: does not count toward the window
        laps[9].lap_duration = Some(120.0); // in-lap, next to the stop
        laps[10].lap_duration = Some(110.0); // pit lap
        laps[11].lap_duration = Some(100.0); // flagged out lap
        laps[11].is_pit_out_lap = Some(true);
        laps[12].lap_duration = Some(93.0);
        let pits = vec![("VER".to_string(), 11)];

        let events = builder().session_events(1, &stints, &laps, &pits).unwrap();

        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.lap_number, 11);
        assert_eq!(event.previous_compound, "SOFT");
        assert_eq!(event.new_compound, "HARD");
        assert_eq!(event.change_type, "SOFT->HARD");
        assert_eq!(event.laps_on_old_tyre, 10);
        assert_eq!(event.laps_on_new_tyre, Some(10));
        // Laps 9, 7, 6 before; laps 13, 14, 15 after
        assert_eq!(event.lap_duration_before, Some(90.0));
        let after = event.lap_duration_after.unwrap();
        assert!((after - (93.0 + 92.0 + 92.0) / 3.0).abs() < 1e-9);
        assert!((event.lap_time_change.unwrap() - (after - 90.0)).abs() < 1e-9);
        assert_eq!(event.position_before, Some(3.0));
        assert_eq!(event.position_after, Some(5.0));
        assert_eq!(event.position_change, Some(2.0));
    }

    #[test]
    fn test_single_stint_gives_no_events() {
        let stints = vec![stint("VER", 1, "MEDIUM", 1, None)];
        let laps: Vec<Lap> = (1..=5).map(|n| lap("VER", n, Some(90.0))).collect();
        let events = builder().session_events(1, &stints, &laps, &[]).unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn test_short_window_uses_available_laps() {
        let stints = vec![
            stint("VER", 1, "SOFT", 1, Some(2)),
            stint("VER", 2, "HARD", 3, None),
        ];
        let laps = vec![
            lap("VER", 1, Some(91.0)),
            lap("VER", 2, Some(93.0)),
            lap("VER", 3, None),
            lap("VER", 4, Some(95.0)),
        ];
        let events = builder().session_events(1, &stints, &laps, &[]).unwrap();

        assert_eq!(events[0].lap_duration_before, Some(92.0));
        assert_eq!(events[0].lap_duration_after, Some(95.0));
        assert_eq!(events[0].laps_on_new_tyre, None);
        assert_eq!(events[0].position_before, None);
    }

    #[test]
    fn test_window_without_usable_laps_is_null() {
        let stints = vec![
            stint("VER", 1, "SOFT", 1, Some(1)),
            stint("VER", 2, "HARD", 2, Some(3)),
        ];
        let laps = vec![lap("VER", 1, None), lap("VER", 2, Some(90.0)), lap("VER", 3, Some(91.0))];
        let events = builder().session_events(1, &stints, &laps, &[]).unwrap();

        assert_eq!(events[0].lap_duration_before, None);
        assert_eq!(events[0].lap_time_change, None);
    }

    #[test]
    fn test_events_per_driver() {
        let stints = vec![
            stint("LEC", 1, "MEDIUM", 1, Some(15)),
            stint("LEC", 2, "HARD", 16, Some(40)),
            stint("LEC", 3, "SOFT", 41, None),
            stint("VER", 1, "SOFT", 1, Some(18)),
            stint("VER", 2, "HARD", 19, None),
        ];
        let events = builder().session_events(1, &stints, &[], &[]).unwrap();
        let boundaries: Vec<(&str, i64)> = events
            .iter()
            .map(|e| (e.driver_id.as_str(), e.lap_number))
            .collect();
        assert_eq!(boundaries, vec![("LEC", 16), ("LEC", 41), ("VER", 19)]);
    }

    #[test]
    fn test_stint_invariants() {
        let cases = [
            // gap
            vec![stint("VER", 1, "SOFT", 1, Some(10)), stint("VER", 2, "HARD", 12, Some(20))],
            // overlap
            vec![stint("VER", 1, "SOFT", 1, Some(10)), stint("VER", 2, "HARD", 10, Some(20))],
            // open stint before the last
            vec![stint("VER", 1, "SOFT", 1, None), stint("VER", 2, "HARD", 11, Some(20))],
            // ends before it starts
            vec![stint("VER", 1, "SOFT", 5, Some(4))],
        ];
        for stints in cases {
            let err = builder().session_events(7, &stints, &[], &[]).unwrap_err();
            assert!(
                matches!(err, PipelineError::InvariantViolation { session_id: 7, .. }),
                "unexpected: {err}"
            );
        }
    }

    #[test]
    fn test_stints_are_ordered_by_number() {
        let stints = vec![
            stint("VER", 2, "HARD", 11, None),
            stint("VER", 1, "SOFT", 1, Some(10)),
        ];
        let events = builder().session_events(1, &stints, &[], &[]).unwrap();
        assert_eq!(events[0].change_type, "SOFT->HARD");
    }

    #[test]
    fn test_huge_pit_reach_excludes_every_lap_without_overflow() {
        let stints = vec![
            stint("VER", 1, "SOFT", 1, Some(10)),
            stint("VER", 2, "HARD", 11, Some(20)),
        ];
        let laps: Vec<Lap> = (1..=20).map(|n| lap("VER", n, Some(90.0))).collect();
        let pits = vec![("VER".to_string(), 11)];

        for reach in [i64::MAX, i64::MIN] {
            let config = FeatureConfig {
                window: 3,
                pit_adjacent_laps: reach,
            };
            let events = TyreChangeBuilder::new(&config)
                .session_events(1, &stints, &laps, &pits)
                .unwrap();
            assert_eq!(events.len(), 1);
            if reach > 0 {
                assert_eq!(events[0].lap_duration_before, None);
                assert_eq!(events[0].lap_duration_after, None);
            } else {
                // Negative reach is clamped to the pit lap alone
                assert_eq!(events[0].lap_duration_before, Some(90.0));
                assert_eq!(events[0].lap_duration_after, Some(90.0));
            }
        }
    }

    proptest! {
        #[test]
        fn window_means_stay_within_their_stint(
            lengths in prop::collection::vec(1_i64..12, 1..5),
            gaps in prop::collection::vec(any::<bool>(), 60),
            window in 1_usize..6,
        ) {
            // Stint k runs at a constant 80 + k seconds; some laps lack a time
            let mut stints = Vec::new();
            let mut laps = Vec::new();
            let mut start = 1;
            for (k, len) in lengths.iter().enumerate() {
                let end = start + len - 1;
                let last = k + 1 == lengths.len();
                stints.push(stint("VER", k as i64 + 1, "SOFT", start, (!last).then_some(end)));
                for n in start..=end {
                    let missing = gaps[(n as usize) % gaps.len()];
                    laps.push(lap("VER", n, (!missing).then_some(80.0 + k as f64)));
                }
                start = end + 1;
            }
            let config = FeatureConfig { window, pit_adjacent_laps: 0 };

            let events = TyreChangeBuilder::new(&config)
                .session_events(1, &stints, &laps, &[])
                .unwrap();

            prop_assert_eq!(events.len(), lengths.len() - 1);
            for (k, event) in events.iter().enumerate() {
                prop_assert_eq!(event.lap_number, stints[k + 1].lap_start);
                if let Some(before) = event.lap_duration_before {
                    prop_assert!((before - (80.0 + k as f64)).abs() < 1e-9);
                }
                if let Some(after) = event.lap_duration_after {
                    prop_assert!((after - (81.0 + k as f64)).abs() < 1e-9);
                }
            }
        }
    }

    mod rebuild {
        use super::super::*;
        use crate::config::AppConfig;
        use crate::loader::fixtures::{meeting, push_race, session};
        use crate::loader::full_load;
        use crate::report::IngestReport;
        use crate::source::FixtureSource;
        use crate::types::EntityKind;

        async fn loaded_store() -> Store {
            let source = FixtureSource::new();
            source.push(
                EntityKind::Meetings,
                vec![meeting(1, "2024-02-29T11:30:00+00:00"), meeting(2, "2024-03-07T13:30:00+00:00")],
            );
            source.push(
                EntityKind::Sessions,
                vec![
                    session(11, 1, "Race", "2024-03-02T11:00:00+00:00", Some("2024-03-02T13:00:00+00:00")),
                    session(21, 2, "Race", "2024-03-02T13:00:00+00:00", Some("2024-03-02T15:00:00+00:00")),
                ],
            );
            push_race(&source, 11, 1, 11, 20);
            push_race(&source, 21, 2, 13, 20);

            let mut store = Store::in_memory().unwrap();
            let mut report = IngestReport::default();
            full_load(&source, &mut store, &AppConfig::default(), &mut report)
                .await
                .unwrap();
            store
        }

        #[tokio::test]
        async fn test_rebuild_dirty_sessions() {
            let mut store = loaded_store().await;
            let config = FeatureConfig::default();

            let summary = rebuild(&mut store, &config, false).unwrap();
            assert_eq!(summary.sessions_processed, 2);
            assert_eq!(summary.events_written, 4);
            assert!(store.dirty_sessions().unwrap().is_empty());

            let events = store.tyre_changes_for_session(21).unwrap();
            assert_eq!(events.len(), 2);
            assert_eq!(events[0].lap_number, 11);
            // Laps 10-12 sit next to the stop
            assert_eq!(events[0].lap_duration_before, Some(90.0));
            assert_eq!(events[0].lap_duration_after, Some(92.0));
            assert_eq!(events[0].lap_time_change, Some(2.0));

            // Nothing dirty: nothing to do
            let summary = rebuild(&mut store, &config, false).unwrap();
            assert_eq!(summary, FeatureSummary::default());
        }

        #[tokio::test]
        async fn test_rebuild_all_is_idempotent() {
            let mut store = loaded_store().await;
            let config = FeatureConfig::default();
            rebuild(&mut store, &config, false).unwrap();
            let before = store.snapshot().unwrap();

            let summary = rebuild(&mut store, &config, true).unwrap();
            assert_eq!(summary.sessions_processed, 2);
            assert_eq!(store.snapshot().unwrap(), before);
        }

        #[tokio::test]
        async fn test_invalid_session_is_skipped_and_kept_dirty() {
            let mut store = loaded_store().await;
            let config = FeatureConfig::default();
            rebuild(&mut store, &config, false).unwrap();
            assert_eq!(store.tyre_changes_for_session(11).unwrap().len(), 2);
            let rows_21 = store.tyre_changes_for_session(21).unwrap();

            store
                .conn()
                .execute(
                    "UPDATE stints SET lap_start = 13 WHERE session_id = 11 AND stint_number = 2",
                    [],
                )
                .unwrap();
            store
                .conn()
                .execute("INSERT INTO feature_dirty (session_id) VALUES (11), (21)", [])
                .unwrap();

            let summary = rebuild(&mut store, &config, false).unwrap();
            assert_eq!(summary.sessions_processed, 1);
            assert_eq!(summary.sessions_skipped, 1);
            assert_eq!(store.dirty_sessions().unwrap(), vec![11]);
            // Rows derived from the old stints are gone, the valid session's stay
            assert!(store.tyre_changes_for_session(11).unwrap().is_empty());
            assert_eq!(store.tyre_changes_for_session(21).unwrap(), rows_21);
            let stints: i64 = store
                .conn()
                .query_row("SELECT COUNT(*) FROM stints WHERE session_id = 11", [], |row| row.get(0))
                .unwrap();
            assert_eq!(stints, 4);

            // Fixing the stints brings the session back
            store
                .conn()
                .execute(
                    "UPDATE stints SET lap_start = 11 WHERE session_id = 11 AND stint_number = 2",
                    [],
                )
                .unwrap();
            let summary = rebuild(&mut store, &config, false).unwrap();
            assert_eq!(summary.sessions_processed, 1);
            assert_eq!(store.tyre_changes_for_session(11).unwrap().len(), 2);
            assert!(store.dirty_sessions().unwrap().is_empty());
        }
    }
}
