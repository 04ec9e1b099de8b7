//! SQLite repository for the telemetry store
//!
//! Entity rows are written with fill-if-null upserts: a conflicting row only
//! has its null columns filled from the incoming record, so populated values
//! are never erased by a source re-sending stale data.

use chrono::{SecondsFormat, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row, Transaction};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use super::schema::{create_tables, ENTITY_TABLES};
use crate::error::Result;
use crate::normalize::{NormalizedBatch, SessionInfo};
use crate::types::{
    EntityKind, Lap, LoadMode, PositionSample, Stint, TyreChangeEvent, Watermark, WeatherSample,
};

/// One row of `pipeline_runs`
#[derive(Debug, Clone, PartialEq)]
pub struct RunRecord {
    pub run_id: i64,
    pub mode: Option<String>,
    pub status: String,
    pub started_at: String,
    pub finished_at: Option<String>,
}

/// Column layout of a fill-if-null upsert.
struct Upsert {
    table: &'static str,
    keys: &'static [&'static str],
    required: &'static [&'static str],
    nullable: &'static [&'static str],
}

impl Upsert {
    /// Bind order: keys, then required columns, then nullable columns.
    fn sql(&self) -> String {
        let table = self.table;
        let columns: Vec<&str> = self
            .keys
            .iter()
            .chain(self.required)
            .chain(self.nullable)
            .copied()
            .collect();
        let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{i}")).collect();

        let on_conflict = if self.nullable.is_empty() {
            "DO NOTHING".to_string()
        } else {
            let set: Vec<String> = self
                .nullable
                .iter()
                .map(|c| format!("{c} = COALESCE({table}.{c}, excluded.{c})"))
                .collect();
            let fills: Vec<String> = self
                .nullable
                .iter()
                .map(|c| format!("({table}.{c} IS NULL AND excluded.{c} IS NOT NULL)"))
                .collect();
            format!("DO UPDATE SET {} WHERE {}", set.join(", "), fills.join(" OR "))
        };

        format!(
            "INSERT INTO {table} ({}) VALUES ({}) ON CONFLICT({}) {on_conflict}",
            columns.join(", "),
            placeholders.join(", "),
            self.keys.join(", "),
        )
    }
}

const MEETINGS: Upsert = Upsert {
    table: "meetings",
    keys: &["meeting_id"],
    required: &["name", "year", "date_start"],
    nullable: &["location", "country_code", "circuit_key", "circuit_short_name"],
};

const SESSIONS: Upsert = Upsert {
    table: "sessions",
    keys: &["session_id"],
    required: &["meeting_id", "session_name", "date_start", "year"],
    nullable: &["session_type", "date_end"],
};

const TEAM_SEASONS: Upsert = Upsert {
    table: "team_seasons",
    keys: &["team_id", "season"],
    required: &["team_name"],
    nullable: &["team_colour"],
};

const TEAM_ALIASES: Upsert = Upsert {
    table: "team_aliases",
    keys: &["alias", "season"],
    required: &["team_id"],
    nullable: &[],
};

const DRIVERS: Upsert = Upsert {
    table: "drivers",
    keys: &["driver_id"],
    required: &["full_name"],
    nullable: &["broadcast_name", "name_acronym", "country_code"],
};

const DRIVER_ALIASES: Upsert = Upsert {
    table: "driver_aliases",
    keys: &["driver_number", "season"],
    required: &["driver_id"],
    nullable: &[],
};

const DRIVER_SESSIONS: Upsert = Upsert {
    table: "driver_sessions",
    keys: &["session_id", "driver_id"],
    required: &["driver_number"],
    nullable: &["team_id"],
};

const LAPS: Upsert = Upsert {
    table: "laps",
    keys: &["session_id", "driver_id", "lap_number"],
    required: &["driver_number"],
    nullable: &[
        "date_start",
        "lap_duration",
        "duration_sector_1",
        "duration_sector_2",
        "duration_sector_3",
        "st_speed",
        "is_pit_out_lap",
        "compound",
        "track_temperature",
        "air_temperature",
        "humidity",
        "rainfall",
        "position",
    ],
};

const STINTS: Upsert = Upsert {
    table: "stints",
    keys: &["session_id", "driver_id", "stint_number"],
    required: &["driver_number", "lap_start"],
    nullable: &["compound", "lap_end", "tyre_age_at_start"],
};

const PITSTOPS: Upsert = Upsert {
    table: "pitstops",
    keys: &["session_id", "driver_id", "lap_number"],
    required: &["driver_number"],
    nullable: &["date", "pit_duration"],
};

const WEATHER: Upsert = Upsert {
    table: "weather",
    keys: &["session_id", "date"],
    required: &[],
    nullable: &[
        "track_temperature",
        "air_temperature",
        "humidity",
        "rainfall",
        "pressure",
        "wind_speed",
        "wind_direction",
    ],
};

const SESSION_RESULTS: Upsert = Upsert {
    table: "session_results",
    keys: &["session_id", "driver_id"],
    required: &["driver_number", "status"],
    nullable: &[
        "position",
        "number_of_laps",
        "points",
        "duration",
        "gap_to_leader",
    ],
};

const RACE_CONTROL: Upsert = Upsert {
    table: "race_control",
    keys: &["session_id", "date", "category", "message"],
    required: &[],
    nullable: &["flag", "scope", "lap_number", "driver_number"],
};

const POSITIONS: Upsert = Upsert {
    table: "positions",
    keys: &["session_id", "driver_id", "date"],
    required: &["driver_number", "position"],
    nullable: &[],
};

const STARTING_GRID: Upsert = Upsert {
    table: "starting_grid",
    keys: &["session_id", "driver_id"],
    required: &["driver_number"],
    nullable: &["position"],
};

/// Keeps the latest display name per team; same-season rows only fill a
/// missing colour.
const UPSERT_TEAM_SQL: &str = r#"
    INSERT INTO teams (team_id, team_name, team_colour, last_season)
    VALUES (?1, ?2, ?3, ?4)
    ON CONFLICT(team_id) DO UPDATE SET
        team_name = excluded.team_name,
        team_colour = COALESCE(excluded.team_colour, teams.team_colour),
        last_season = excluded.last_season
    WHERE excluded.last_season > teams.last_season
       OR (excluded.last_season = teams.last_season
           AND teams.team_colour IS NULL
           AND excluded.team_colour IS NOT NULL)
"#;

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Repository for the telemetry store
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open the store, creating the file, its directory and the schema if
    /// needed.
    pub fn open(db_path: &Path) -> Result<Self> {
        // Create parent directories if needed
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(db_path)?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        create_tables(&conn)?;

        Ok(Self { conn })
    }

    /// Create an in-memory store (for testing)
    #[cfg(test)]
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        create_tables(&conn)?;
        Ok(Self { conn })
    }

    pub fn transaction(&mut self) -> Result<StoreTx<'_>> {
        Ok(StoreTx {
            tx: self.conn.transaction()?,
        })
    }

    // ==================== Loader State ====================

    #[cfg(test)]
    pub fn meeting_count(&self) -> Result<i64> {
        Ok(self
            .conn
            .query_row("SELECT COUNT(*) FROM meetings", [], |row| row.get(0))?)
    }

    /// (meeting_id, year) of every stored meeting.
    pub fn known_meetings(&self) -> Result<Vec<(i64, i32)>> {
        let mut stmt = self.conn.prepare("SELECT meeting_id, year FROM meetings")?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    pub fn known_sessions(&self) -> Result<Vec<(i64, SessionInfo)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT session_id, meeting_id, year FROM sessions")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get(0)?,
                SessionInfo {
                    meeting_id: row.get(1)?,
                    year: row.get(2)?,
                },
            ))
        })?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// Sessions still waiting for their end time.
    pub fn open_sessions(&self) -> Result<Vec<i64>> {
        let mut stmt = self.conn.prepare(
            "SELECT session_id FROM sessions WHERE date_end IS NULL ORDER BY session_id",
        )?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// (driver_number, season, driver_id) of every stored alias.
    pub fn driver_aliases(&self) -> Result<Vec<(i64, i32, String)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT driver_number, season, driver_id FROM driver_aliases")?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// Stored watermarks; unparseable values are treated as absent.
    pub fn watermarks(&self) -> Result<BTreeMap<EntityKind, Watermark>> {
        let mut stmt = self
            .conn
            .prepare("SELECT entity_type, last_value FROM sync_watermark")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut watermarks = BTreeMap::new();
        for row in rows {
            let (entity_type, last_value) = row?;
            if let Some(kind) = EntityKind::parse(&entity_type) {
                if let Some(watermark) = Watermark::parse(kind, &last_value) {
                    watermarks.insert(kind, watermark);
                }
            }
        }
        Ok(watermarks)
    }

    /// Sessions whose per-session data may still be incomplete upstream.
    ///
    /// That is every session with no laps yet, no end time yet, or an end
    /// time past `frontier`, the oldest per-session watermark. Without a
    /// frontier every session qualifies.
    pub fn sessions_awaiting_children(&self, frontier: Option<&Watermark>) -> Result<Vec<i64>> {
        let frontier = frontier.map(Watermark::to_query_value);
        let mut stmt = self.conn.prepare(
            r#"
            SELECT s.session_id FROM sessions s
            WHERE ?1 IS NULL
               OR s.date_end IS NULL
               OR s.date_end > ?1
               OR NOT EXISTS (SELECT 1 FROM laps l WHERE l.session_id = s.session_id)
            ORDER BY s.session_id
            "#,
        )?;
        let rows = stmt.query_map([frontier], |row| row.get(0))?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// Latest stored cursor per timestamp-keyed kind within one session.
    ///
    /// Session-keyed kinds have no cursor inside a session and are absent.
    pub fn session_cursors(&self, session_id: i64) -> Result<BTreeMap<EntityKind, Watermark>> {
        const CURSOR_COLUMNS: [(EntityKind, &str, &str); 5] = [
            (EntityKind::Laps, "laps", "date_start"),
            (EntityKind::Pit, "pitstops", "date"),
            (EntityKind::Weather, "weather", "date"),
            (EntityKind::RaceControl, "race_control", "date"),
            (EntityKind::Position, "positions", "date"),
        ];

        let mut cursors = BTreeMap::new();
        for (kind, table, column) in CURSOR_COLUMNS {
            let latest: Option<String> = self.conn.query_row(
                &format!("SELECT MAX({column}) FROM {table} WHERE session_id = ?1"),
                [session_id],
                |row| row.get(0),
            )?;
            if let Some(watermark) = latest.and_then(|raw| Watermark::parse(kind, &raw)) {
                cursors.insert(kind, watermark);
            }
        }
        Ok(cursors)
    }

    pub fn weather_for_session(&self, session_id: i64) -> Result<Vec<WeatherSample>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT session_id, date, track_temperature, air_temperature, humidity,
                   rainfall, pressure, wind_speed, wind_direction
            FROM weather
            WHERE session_id = ?1
            ORDER BY date
            "#,
        )?;
        let rows = stmt.query_map([session_id], |row| {
            Ok(WeatherSample {
                session_id: row.get(0)?,
                date: row.get(1)?,
                track_temperature: row.get(2)?,
                air_temperature: row.get(3)?,
                humidity: row.get(4)?,
                rainfall: row.get(5)?,
                pressure: row.get(6)?,
                wind_speed: row.get(7)?,
                wind_direction: row.get(8)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    pub fn positions_for_session(&self, session_id: i64) -> Result<Vec<PositionSample>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT session_id, driver_id, driver_number, date, position
            FROM positions
            WHERE session_id = ?1
            ORDER BY driver_id, date
            "#,
        )?;
        let rows = stmt.query_map([session_id], |row| {
            Ok(PositionSample {
                session_id: row.get(0)?,
                driver_id: row.get(1)?,
                driver_number: row.get(2)?,
                date: row.get(3)?,
                position: row.get(4)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    // ==================== Feature Inputs ====================

    pub fn session_ids(&self) -> Result<Vec<i64>> {
        let mut stmt = self
            .conn
            .prepare("SELECT session_id FROM sessions ORDER BY session_id")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    pub fn dirty_sessions(&self) -> Result<Vec<i64>> {
        let mut stmt = self
            .conn
            .prepare("SELECT session_id FROM feature_dirty ORDER BY session_id")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    pub fn stints_for_session(&self, session_id: i64) -> Result<Vec<Stint>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT session_id, driver_id, driver_number, stint_number, compound,
                   lap_start, lap_end, tyre_age_at_start
            FROM stints
            WHERE session_id = ?1
            ORDER BY driver_id, stint_number
            "#,
        )?;
        let rows = stmt.query_map([session_id], |row| {
            Ok(Stint {
                session_id: row.get(0)?,
                driver_id: row.get(1)?,
                driver_number: row.get(2)?,
                stint_number: row.get(3)?,
                compound: row.get(4)?,
                lap_start: row.get(5)?,
                lap_end: row.get(6)?,
                tyre_age_at_start: row.get(7)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    pub fn laps_for_session(&self, session_id: i64) -> Result<Vec<Lap>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT session_id, driver_id, driver_number, lap_number, date_start,
                   lap_duration, duration_sector_1, duration_sector_2, duration_sector_3,
                   st_speed, is_pit_out_lap, compound, track_temperature,
                   air_temperature, humidity, rainfall, position
            FROM laps
            WHERE session_id = ?1
            ORDER BY driver_id, lap_number
            "#,
        )?;
        let rows = stmt.query_map([session_id], lap_from_row)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// (driver_id, lap_number) of every pit stop in a session.
    pub fn pit_laps_for_session(&self, session_id: i64) -> Result<Vec<(String, i64)>> {
        let mut stmt = self.conn.prepare(
            "SELECT driver_id, lap_number FROM pitstops WHERE session_id = ?1 ORDER BY driver_id, lap_number",
        )?;
        let rows = stmt.query_map([session_id], |row| Ok((row.get(0)?, row.get(1)?)))?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// Replace a session's tyre-change rows and clear its dirty mark in one
    /// transaction.
    pub fn replace_tyre_changes(
        &mut self,
        session_id: i64,
        events: &[TyreChangeEvent],
    ) -> Result<u64> {
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM tyre_changes WHERE session_id = ?1", [session_id])?;
        {
            let mut stmt = tx.prepare_cached(
                r#"
                INSERT INTO tyre_changes
                (session_id, driver_id, lap_number, previous_compound, new_compound,
                 change_type, laps_on_old_tyre, laps_on_new_tyre, lap_duration_before,
                 lap_duration_after, lap_time_change, position_before, position_after,
                 position_change)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
                "#,
            )?;
            for e in events {
                stmt.execute(params![
                    e.session_id,
                    e.driver_id,
                    e.lap_number,
                    e.previous_compound,
                    e.new_compound,
                    e.change_type,
                    e.laps_on_old_tyre,
                    e.laps_on_new_tyre,
                    e.lap_duration_before,
                    e.lap_duration_after,
                    e.lap_time_change,
                    e.position_before,
                    e.position_after,
                    e.position_change,
                ])?;
            }
        }
        tx.execute("DELETE FROM feature_dirty WHERE session_id = ?1", [session_id])?;
        tx.commit()?;
        Ok(events.len() as u64)
    }

    /// Drop a session's tyre-change rows, leaving its dirty mark.
    pub fn clear_tyre_changes(&self, session_id: i64) -> Result<u64> {
        let deleted = self
            .conn
            .execute("DELETE FROM tyre_changes WHERE session_id = ?1", [session_id])?;
        Ok(deleted as u64)
    }

    #[cfg(test)]
    pub fn tyre_changes_for_session(&self, session_id: i64) -> Result<Vec<TyreChangeEvent>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT session_id, driver_id, lap_number, previous_compound, new_compound,
                   change_type, laps_on_old_tyre, laps_on_new_tyre, lap_duration_before,
                   lap_duration_after, lap_time_change, position_before, position_after,
                   position_change
            FROM tyre_changes
            WHERE session_id = ?1
            ORDER BY driver_id, lap_number
            "#,
        )?;
        let rows = stmt.query_map([session_id], |row| {
            Ok(TyreChangeEvent {
                session_id: row.get(0)?,
                driver_id: row.get(1)?,
                lap_number: row.get(2)?,
                previous_compound: row.get(3)?,
                new_compound: row.get(4)?,
                change_type: row.get(5)?,
                laps_on_old_tyre: row.get(6)?,
                laps_on_new_tyre: row.get(7)?,
                lap_duration_before: row.get(8)?,
                lap_duration_after: row.get(9)?,
                lap_time_change: row.get(10)?,
                position_before: row.get(11)?,
                position_after: row.get(12)?,
                position_change: row.get(13)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    // ==================== Query Operations ====================

    /// Row count of every consumer-visible table.
    pub fn table_counts(&self) -> Result<Vec<(&'static str, i64)>> {
        ENTITY_TABLES
            .iter()
            .map(|table| -> Result<(&'static str, i64)> {
                let count = self.conn.query_row(
                    &format!("SELECT COUNT(*) FROM {table}"),
                    [],
                    |row| row.get(0),
                )?;
                Ok((*table, count))
            })
            .collect()
    }

    /// Every entity, watermark and dirty-mark row, for comparing store states.
    #[cfg(test)]
    pub fn snapshot(&self) -> Result<String> {
        let mut out = String::new();
        let tables = ENTITY_TABLES
            .iter()
            .copied()
            .chain(["sync_watermark", "feature_dirty"]);
        for table in tables {
            let mut stmt = self
                .conn
                .prepare(&format!("SELECT * FROM {table} ORDER BY rowid"))?;
            let width = stmt.column_count();
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                let values = (0..width)
                    .map(|i| row.get::<_, Value>(i))
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                out.push_str(&format!("{table}: {values:?}\n"));
            }
        }
        Ok(out)
    }

    // ==================== Pipeline State ====================

    pub fn pipeline_enabled(&self, pipeline_id: &str) -> Result<Option<bool>> {
        Ok(self
            .conn
            .query_row(
                "SELECT enabled FROM pipeline_state WHERE pipeline_id = ?1",
                [pipeline_id],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub fn set_pipeline_enabled(&self, pipeline_id: &str, enabled: bool) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO pipeline_state (pipeline_id, enabled, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(pipeline_id) DO UPDATE SET
                enabled = excluded.enabled,
                updated_at = excluded.updated_at
            "#,
            params![pipeline_id, enabled, now()],
        )?;
        Ok(())
    }

    /// Record a run as started; returns its id.
    pub fn start_run(&self, pipeline_id: &str) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO pipeline_runs (pipeline_id, status, started_at) VALUES (?1, 'running', ?2)",
            params![pipeline_id, now()],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn finish_run(
        &self,
        run_id: i64,
        mode: Option<LoadMode>,
        status: &str,
        summary_json: &str,
    ) -> Result<()> {
        self.conn.execute(
            r#"
            UPDATE pipeline_runs
            SET mode = ?2, status = ?3, finished_at = ?4, summary_json = ?5
            WHERE run_id = ?1
            "#,
            params![
                run_id,
                mode.map(|m| m.to_string()),
                status,
                now(),
                summary_json
            ],
        )?;
        Ok(())
    }

    /// Most recent runs first.
    pub fn recent_runs(&self, pipeline_id: &str, limit: usize) -> Result<Vec<RunRecord>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT run_id, mode, status, started_at, finished_at
            FROM pipeline_runs
            WHERE pipeline_id = ?1
            ORDER BY run_id DESC
            LIMIT ?2
            "#,
        )?;
        let rows = stmt.query_map(params![pipeline_id, limit as i64], |row| {
            Ok(RunRecord {
                run_id: row.get(0)?,
                mode: row.get(1)?,
                status: row.get(2)?,
                started_at: row.get(3)?,
                finished_at: row.get(4)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    #[cfg(test)]
    pub fn conn(&self) -> &Connection {
        &self.conn
    }
}

fn lap_from_row(row: &Row<'_>) -> rusqlite::Result<Lap> {
    Ok(Lap {
        session_id: row.get(0)?,
        driver_id: row.get(1)?,
        driver_number: row.get(2)?,
        lap_number: row.get(3)?,
        date_start: row.get(4)?,
        lap_duration: row.get(5)?,
        duration_sector_1: row.get(6)?,
        duration_sector_2: row.get(7)?,
        duration_sector_3: row.get(8)?,
        st_speed: row.get(9)?,
        is_pit_out_lap: row.get(10)?,
        compound: row.get(11)?,
        track_temperature: row.get(12)?,
        air_temperature: row.get(13)?,
        humidity: row.get(14)?,
        rainfall: row.get(15)?,
        position: row.get(16)?,
    })
}

/// Write side of one store transaction.
pub struct StoreTx<'a> {
    tx: Transaction<'a>,
}

impl StoreTx<'_> {
    /// Upsert the batch rows of one entity kind; returns rows inserted or
    /// filled. Sessions whose lap, stint or pit rows changed are marked for a
    /// feature rebuild.
    pub fn write_kind(&self, kind: EntityKind, batch: &NormalizedBatch) -> Result<u64> {
        let changed = match kind {
            EntityKind::Meetings => self
                .upsert(&MEETINGS, &batch.meetings, |m| {
                    vec![
                        m.meeting_id.into(),
                        m.name.clone().into(),
                        m.year.into(),
                        m.date_start.clone().into(),
                        m.location.clone().into(),
                        m.country_code.clone().into(),
                        m.circuit_key.into(),
                        m.circuit_short_name.clone().into(),
                    ]
                })?
                .len(),
            EntityKind::Sessions => self
                .upsert(&SESSIONS, &batch.sessions, |s| {
                    vec![
                        s.session_id.into(),
                        s.meeting_id.into(),
                        s.session_name.clone().into(),
                        s.date_start.clone().into(),
                        s.year.into(),
                        s.session_type.clone().into(),
                        s.date_end.clone().into(),
                    ]
                })?
                .len(),
            EntityKind::Drivers => self.write_identities(batch)?,
            EntityKind::Laps => {
                let changed = self.upsert(&LAPS, &batch.laps, |l| {
                    vec![
                        l.session_id.into(),
                        l.driver_id.clone().into(),
                        l.lap_number.into(),
                        l.driver_number.into(),
                        l.date_start.clone().into(),
                        l.lap_duration.into(),
                        l.duration_sector_1.into(),
                        l.duration_sector_2.into(),
                        l.duration_sector_3.into(),
                        l.st_speed.into(),
                        l.is_pit_out_lap.into(),
                        l.compound.clone().into(),
                        l.track_temperature.into(),
                        l.air_temperature.into(),
                        l.humidity.into(),
                        l.rainfall.into(),
                        l.position.into(),
                    ]
                })?;
                self.mark_dirty(changed.iter().map(|l| l.session_id))?;
                changed.len()
            }
            EntityKind::Stints => {
                let changed = self.upsert(&STINTS, &batch.stints, |s| {
                    vec![
                        s.session_id.into(),
                        s.driver_id.clone().into(),
                        s.stint_number.into(),
                        s.driver_number.into(),
                        s.lap_start.into(),
                        s.compound.clone().into(),
                        s.lap_end.into(),
                        s.tyre_age_at_start.into(),
                    ]
                })?;
                self.mark_dirty(changed.iter().map(|s| s.session_id))?;
                changed.len()
            }
            EntityKind::Pit => {
                let changed = self.upsert(&PITSTOPS, &batch.pitstops, |p| {
                    vec![
                        p.session_id.into(),
                        p.driver_id.clone().into(),
                        p.lap_number.into(),
                        p.driver_number.into(),
                        p.date.clone().into(),
                        p.pit_duration.into(),
                    ]
                })?;
                self.mark_dirty(changed.iter().map(|p| p.session_id))?;
                changed.len()
            }
            EntityKind::Weather => self
                .upsert(&WEATHER, &batch.weather, |w| {
                    vec![
                        w.session_id.into(),
                        w.date.clone().into(),
                        w.track_temperature.into(),
                        w.air_temperature.into(),
                        w.humidity.into(),
                        w.rainfall.into(),
                        w.pressure.into(),
                        w.wind_speed.into(),
                        w.wind_direction.into(),
                    ]
                })?
                .len(),
            EntityKind::SessionResult => self
                .upsert(&SESSION_RESULTS, &batch.results, |r| {
                    vec![
                        r.session_id.into(),
                        r.driver_id.clone().into(),
                        r.driver_number.into(),
                        r.status.clone().into(),
                        r.position.into(),
                        r.number_of_laps.into(),
                        r.points.into(),
                        r.duration.into(),
                        r.gap_to_leader.clone().into(),
                    ]
                })?
                .len(),
            EntityKind::RaceControl => self
                .upsert(&RACE_CONTROL, &batch.race_control, |m| {
                    vec![
                        m.session_id.into(),
                        m.date.clone().into(),
                        m.category.clone().into(),
                        m.message.clone().into(),
                        m.flag.clone().into(),
                        m.scope.clone().into(),
                        m.lap_number.into(),
                        m.driver_number.into(),
                    ]
                })?
                .len(),
            EntityKind::Position => self
                .upsert(&POSITIONS, &batch.positions, |p| {
                    vec![
                        p.session_id.into(),
                        p.driver_id.clone().into(),
                        p.date.clone().into(),
                        p.driver_number.into(),
                        p.position.into(),
                    ]
                })?
                .len(),
            EntityKind::StartingGrid => self
                .upsert(&STARTING_GRID, &batch.grid, |g| {
                    vec![
                        g.session_id.into(),
                        g.driver_id.clone().into(),
                        g.driver_number.into(),
                        g.position.into(),
                    ]
                })?
                .len(),
        };
        Ok(changed as u64)
    }

    /// Teams, drivers and their aliases, parents first.
    fn write_identities(&self, batch: &NormalizedBatch) -> Result<usize> {
        let mut changed = 0;
        {
            let mut stmt = self.tx.prepare_cached(UPSERT_TEAM_SQL)?;
            for t in &batch.team_seasons {
                changed += stmt.execute(params![t.team_id, t.team_name, t.team_colour, t.season])?;
            }
        }
        changed += self
            .upsert(&TEAM_SEASONS, &batch.team_seasons, |t| {
                vec![
                    t.team_id.into(),
                    t.season.into(),
                    t.team_name.clone().into(),
                    t.team_colour.clone().into(),
                ]
            })?
            .len();
        changed += self
            .upsert(&TEAM_ALIASES, &batch.team_aliases, |a| {
                vec![a.alias.clone().into(), a.season.into(), a.team_id.into()]
            })?
            .len();
        changed += self
            .upsert(&DRIVERS, &batch.drivers, |d| {
                vec![
                    d.driver_id.clone().into(),
                    d.full_name.clone().into(),
                    d.broadcast_name.clone().into(),
                    d.name_acronym.clone().into(),
                    d.country_code.clone().into(),
                ]
            })?
            .len();
        changed += self
            .upsert(&DRIVER_ALIASES, &batch.driver_aliases, |a| {
                vec![
                    a.driver_number.into(),
                    a.season.into(),
                    a.driver_id.clone().into(),
                ]
            })?
            .len();
        changed += self
            .upsert(&DRIVER_SESSIONS, &batch.driver_sessions, |d| {
                vec![
                    d.session_id.into(),
                    d.driver_id.clone().into(),
                    d.driver_number.into(),
                    d.team_id.into(),
                ]
            })?
            .len();
        Ok(changed)
    }

    /// Run one upsert per row; returns the rows that changed the store.
    fn upsert<'r, T>(
        &self,
        upsert: &Upsert,
        rows: &'r [T],
        bind: impl Fn(&T) -> Vec<Value>,
    ) -> Result<Vec<&'r T>> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        let mut stmt = self.tx.prepare_cached(&upsert.sql())?;
        let mut changed = Vec::new();
        for row in rows {
            if stmt.execute(params_from_iter(bind(row)))? > 0 {
                changed.push(row);
            }
        }
        Ok(changed)
    }

    /// Queue sessions for a feature rebuild.
    pub fn mark_dirty(&self, sessions: impl IntoIterator<Item = i64>) -> Result<()> {
        let sessions: BTreeSet<i64> = sessions.into_iter().collect();
        let mut stmt = self
            .tx
            .prepare_cached("INSERT OR IGNORE INTO feature_dirty (session_id) VALUES (?1)")?;
        for session_id in sessions {
            stmt.execute([session_id])?;
        }
        Ok(())
    }

    /// Move a watermark forward; never moves it back.
    pub fn advance_watermark(&self, kind: EntityKind, candidate: &Watermark) -> Result<bool> {
        let current: Option<String> = self
            .tx
            .query_row(
                "SELECT last_value FROM sync_watermark WHERE entity_type = ?1",
                [kind.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(current) = current.and_then(|raw| Watermark::parse(kind, &raw)) {
            if *candidate <= current {
                return Ok(false);
            }
        }

        self.tx.execute(
            r#"
            INSERT INTO sync_watermark (entity_type, last_value) VALUES (?1, ?2)
            ON CONFLICT(entity_type) DO UPDATE SET last_value = excluded.last_value
            "#,
            params![kind.as_str(), candidate.to_query_value()],
        )?;
        Ok(true)
    }

    pub fn commit(self) -> Result<()> {
        self.tx.commit()?;
        Ok(())
    }
}
