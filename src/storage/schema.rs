//! SQLite schema for the telemetry store
//!
//! Tables:
//! - meetings, sessions: race weekends and their timed segments
//! - teams, team_seasons, team_aliases: canonical teams and their names per season
//! - drivers, driver_aliases, driver_sessions: canonical drivers, racing numbers, participation
//! - laps, stints, pitstops, weather, session_results, race_control, positions,
//!   starting_grid: per-session telemetry
//! - tyre_changes: derived tyre-change events
//! - sync_watermark, feature_dirty: loader state
//! - pipeline_state, pipeline_runs: trigger toggle and run history

use rusqlite::{Connection, Result};

/// Entity and derived tables visible to downstream consumers, in
/// dependency order.
pub const ENTITY_TABLES: [&str; 17] = [
    "meetings",
    "sessions",
    "teams",
    "team_seasons",
    "team_aliases",
    "drivers",
    "driver_aliases",
    "driver_sessions",
    "laps",
    "stints",
    "pitstops",
    "weather",
    "session_results",
    "race_control",
    "positions",
    "starting_grid",
    "tyre_changes",
];

/// Create all tables in the database
pub fn create_tables(conn: &Connection) -> Result<()> {
    // Race weekends
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS meetings (
            meeting_id INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            location TEXT,
            country_code TEXT,
            circuit_key INTEGER,
            circuit_short_name TEXT,
            year INTEGER NOT NULL,
            date_start TEXT NOT NULL
        )
        "#,
        [],
    )?;

    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS sessions (
            session_id INTEGER PRIMARY KEY,
            meeting_id INTEGER NOT NULL REFERENCES meetings(meeting_id),
            session_name TEXT NOT NULL,
            session_type TEXT,
            date_start TEXT NOT NULL,
            date_end TEXT,
            year INTEGER NOT NULL
        )
        "#,
        [],
    )?;

    // Latest display name per canonical team
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS teams (
            team_id INTEGER PRIMARY KEY,
            team_name TEXT NOT NULL,
            team_colour TEXT,
            last_season INTEGER NOT NULL
        )
        "#,
        [],
    )?;

    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS team_seasons (
            team_id INTEGER NOT NULL REFERENCES teams(team_id),
            season INTEGER NOT NULL,
            team_name TEXT NOT NULL,
            team_colour TEXT,
            PRIMARY KEY (team_id, season)
        )
        "#,
        [],
    )?;

    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS team_aliases (
            alias TEXT NOT NULL,
            season INTEGER NOT NULL,
            team_id INTEGER NOT NULL REFERENCES teams(team_id),
            PRIMARY KEY (alias, season)
        )
        "#,
        [],
    )?;

    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS drivers (
            driver_id TEXT PRIMARY KEY,
            full_name TEXT NOT NULL,
            broadcast_name TEXT,
            name_acronym TEXT,
            country_code TEXT
        )
        "#,
        [],
    )?;

    // Racing numbers are reused across seasons
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS driver_aliases (
            driver_number INTEGER NOT NULL,
            season INTEGER NOT NULL,
            driver_id TEXT NOT NULL REFERENCES drivers(driver_id),
            PRIMARY KEY (driver_number, season)
        )
        "#,
        [],
    )?;

    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS driver_sessions (
            session_id INTEGER NOT NULL REFERENCES sessions(session_id),
            driver_id TEXT NOT NULL REFERENCES drivers(driver_id),
            driver_number INTEGER NOT NULL,
            team_id INTEGER REFERENCES teams(team_id),
            PRIMARY KEY (session_id, driver_id)
        )
        "#,
        [],
    )?;

    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS laps (
            session_id INTEGER NOT NULL REFERENCES sessions(session_id),
            driver_id TEXT NOT NULL REFERENCES drivers(driver_id),
            lap_number INTEGER NOT NULL,
            driver_number INTEGER NOT NULL,
            date_start TEXT,
            lap_duration REAL,
            duration_sector_1 REAL,
            duration_sector_2 REAL,
            duration_sector_3 REAL,
            st_speed REAL,
            is_pit_out_lap INTEGER,
            compound TEXT,
            track_temperature REAL,
            air_temperature REAL,
            humidity REAL,
            rainfall INTEGER,
            position INTEGER,
            PRIMARY KEY (session_id, driver_id, lap_number)
        )
        "#,
        [],
    )?;

    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS stints (
            session_id INTEGER NOT NULL REFERENCES sessions(session_id),
            driver_id TEXT NOT NULL REFERENCES drivers(driver_id),
            stint_number INTEGER NOT NULL,
            driver_number INTEGER NOT NULL,
            lap_start INTEGER NOT NULL,
            compound TEXT,
            lap_end INTEGER,
            tyre_age_at_start INTEGER,
            PRIMARY KEY (session_id, driver_id, stint_number)
        )
        "#,
        [],
    )?;

    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS pitstops (
            session_id INTEGER NOT NULL REFERENCES sessions(session_id),
            driver_id TEXT NOT NULL REFERENCES drivers(driver_id),
            lap_number INTEGER NOT NULL,
            driver_number INTEGER NOT NULL,
            date TEXT,
            pit_duration REAL,
            PRIMARY KEY (session_id, driver_id, lap_number)
        )
        "#,
        [],
    )?;

    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS weather (
            session_id INTEGER NOT NULL REFERENCES sessions(session_id),
            date TEXT NOT NULL,
            track_temperature REAL,
            air_temperature REAL,
            humidity REAL,
            rainfall INTEGER,
            pressure REAL,
            wind_speed REAL,
            wind_direction INTEGER,
            PRIMARY KEY (session_id, date)
        )
        "#,
        [],
    )?;

    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS session_results (
            session_id INTEGER NOT NULL REFERENCES sessions(session_id),
            driver_id TEXT NOT NULL REFERENCES drivers(driver_id),
            driver_number INTEGER NOT NULL,
            status TEXT NOT NULL,
            position INTEGER,
            number_of_laps INTEGER,
            points REAL,
            duration REAL,
            gap_to_leader TEXT,
            PRIMARY KEY (session_id, driver_id)
        )
        "#,
        [],
    )?;

    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS race_control (
            session_id INTEGER NOT NULL REFERENCES sessions(session_id),
            date TEXT NOT NULL,
            category TEXT NOT NULL,
            message TEXT NOT NULL,
            flag TEXT,
            scope TEXT,
            lap_number INTEGER,
            driver_number INTEGER,
            PRIMARY KEY (session_id, date, category, message)
        )
        "#,
        [],
    )?;

    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS positions (
            session_id INTEGER NOT NULL REFERENCES sessions(session_id),
            driver_id TEXT NOT NULL REFERENCES drivers(driver_id),
            date TEXT NOT NULL,
            driver_number INTEGER NOT NULL,
            position INTEGER NOT NULL,
            PRIMARY KEY (session_id, driver_id, date)
        )
        "#,
        [],
    )?;

    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS starting_grid (
            session_id INTEGER NOT NULL REFERENCES sessions(session_id),
            driver_id TEXT NOT NULL REFERENCES drivers(driver_id),
            driver_number INTEGER NOT NULL,
            position INTEGER,
            PRIMARY KEY (session_id, driver_id)
        )
        "#,
        [],
    )?;

    // Derived; rebuilt per session
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS tyre_changes (
            session_id INTEGER NOT NULL REFERENCES sessions(session_id),
            driver_id TEXT NOT NULL REFERENCES drivers(driver_id),
            lap_number INTEGER NOT NULL,
            previous_compound TEXT NOT NULL,
            new_compound TEXT NOT NULL,
            change_type TEXT NOT NULL,
            laps_on_old_tyre INTEGER NOT NULL,
            laps_on_new_tyre INTEGER,
            lap_duration_before REAL,
            lap_duration_after REAL,
            lap_time_change REAL,
            position_before REAL,
            position_after REAL,
            position_change REAL,
            PRIMARY KEY (session_id, driver_id, lap_number)
        )
        "#,
        [],
    )?;

    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS sync_watermark (
            entity_type TEXT PRIMARY KEY,
            last_value TEXT NOT NULL
        )
        "#,
        [],
    )?;

    // Sessions whose tyre_changes must be rebuilt
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS feature_dirty (
            session_id INTEGER PRIMARY KEY REFERENCES sessions(session_id)
        )
        "#,
        [],
    )?;

    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS pipeline_state (
            pipeline_id TEXT PRIMARY KEY,
            enabled INTEGER NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
        [],
    )?;

    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS pipeline_runs (
            run_id INTEGER PRIMARY KEY AUTOINCREMENT,
            pipeline_id TEXT NOT NULL,
            mode TEXT,
            status TEXT NOT NULL,
            started_at TEXT NOT NULL,
            finished_at TEXT,
            summary_json TEXT
        )
        "#,
        [],
    )?;

    // Create indexes
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_sessions_meeting ON sessions(meeting_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_sessions_date_end ON sessions(date_end)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_positions_session ON positions(session_id, driver_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_runs_pipeline ON pipeline_runs(pipeline_id, run_id)",
        [],
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    #[test]
    fn test_create_tables() {
        let conn = Connection::open_in_memory().unwrap();
        create_tables(&conn).unwrap();

        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        // Entity tables + watermark, dirty marks, state and runs
        assert_eq!(count, ENTITY_TABLES.len() as i64 + 4);
    }

    #[test]
    fn test_create_tables_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        create_tables(&conn).unwrap();
        // Should not fail on second call
        create_tables(&conn).unwrap();
    }
}
