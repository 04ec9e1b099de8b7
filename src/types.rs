//! Domain types shared by the loaders, the store and the feature engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Upstream entity types, one per API endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Meetings,
    Sessions,
    Drivers,
    Laps,
    Stints,
    Pit,
    Weather,
    SessionResult,
    RaceControl,
    Position,
    StartingGrid,
}

/// How the watermark of an entity kind is measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorField {
    /// An RFC 3339 timestamp field of the record.
    Timestamp(&'static str),
    /// The owning session's key.
    SessionKey,
}

impl EntityKind {
    /// Dependency order used by the loaders.
    pub const ALL: [EntityKind; 11] = [
        EntityKind::Meetings,
        EntityKind::Sessions,
        EntityKind::Drivers,
        EntityKind::Laps,
        EntityKind::Stints,
        EntityKind::Pit,
        EntityKind::Weather,
        EntityKind::SessionResult,
        EntityKind::RaceControl,
        EntityKind::Position,
        EntityKind::StartingGrid,
    ];

    /// Kinds fetched once per session.
    pub const PER_SESSION: [EntityKind; 8] = [
        EntityKind::Laps,
        EntityKind::Stints,
        EntityKind::Pit,
        EntityKind::Weather,
        EntityKind::SessionResult,
        EntityKind::RaceControl,
        EntityKind::Position,
        EntityKind::StartingGrid,
    ];

    /// Endpoint name, also used as the `sync_watermark.entity_type` key.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Meetings => "meetings",
            EntityKind::Sessions => "sessions",
            EntityKind::Drivers => "drivers",
            EntityKind::Laps => "laps",
            EntityKind::Stints => "stints",
            EntityKind::Pit => "pit",
            EntityKind::Weather => "weather",
            EntityKind::SessionResult => "session_result",
            EntityKind::RaceControl => "race_control",
            EntityKind::Position => "position",
            EntityKind::StartingGrid => "starting_grid",
        }
    }

    /// Inverse of [`EntityKind::as_str`].
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == name)
    }

    pub fn cursor(&self) -> CursorField {
        match self {
            EntityKind::Meetings => CursorField::Timestamp("date_start"),
            EntityKind::Sessions => CursorField::Timestamp("date_end"),
            EntityKind::Laps => CursorField::Timestamp("date_start"),
            EntityKind::Pit
            | EntityKind::Weather
            | EntityKind::RaceControl
            | EntityKind::Position => CursorField::Timestamp("date"),
            EntityKind::Drivers
            | EntityKind::Stints
            | EntityKind::SessionResult
            | EntityKind::StartingGrid => CursorField::SessionKey,
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Highest value ingested for one entity kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Watermark {
    Timestamp(DateTime<Utc>),
    SessionKey(i64),
}

impl Watermark {
    /// Parse the TEXT stored in `sync_watermark.last_value`.
    pub fn parse(kind: EntityKind, raw: &str) -> Option<Self> {
        match kind.cursor() {
            CursorField::Timestamp(_) => DateTime::parse_from_rfc3339(raw)
                .ok()
                .map(|dt| Watermark::Timestamp(dt.with_timezone(&Utc))),
            CursorField::SessionKey => raw.parse().ok().map(Watermark::SessionKey),
        }
    }

    /// Value passed to the source as the `since` bound.
    pub fn to_query_value(&self) -> String {
        match self {
            Watermark::Timestamp(ts) => ts.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            Watermark::SessionKey(key) => key.to_string(),
        }
    }
}

impl fmt::Display for Watermark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_query_value())
    }
}

/// Outcome of the load-mode selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadMode {
    Full,
    Incremental,
}

impl fmt::Display for LoadMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadMode::Full => f.write_str("full"),
            LoadMode::Incremental => f.write_str("incremental"),
        }
    }
}

// ==================== Entities ====================

#[derive(Debug, Clone, PartialEq)]
pub struct Meeting {
    pub meeting_id: i64,
    pub name: String,
    pub location: Option<String>,
    pub country_code: Option<String>,
    pub circuit_key: Option<i64>,
    pub circuit_short_name: Option<String>,
    pub year: i32,
    pub date_start: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub session_id: i64,
    pub meeting_id: i64,
    pub session_name: String,
    pub session_type: Option<String>,
    pub date_start: String,
    pub date_end: Option<String>,
    pub year: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TeamSeason {
    pub team_id: i64,
    pub season: i32,
    pub team_name: String,
    pub team_colour: Option<String>,
}

/// Upstream team name bound to a canonical team for one season.
#[derive(Debug, Clone, PartialEq)]
pub struct TeamAlias {
    pub alias: String,
    pub season: i32,
    pub team_id: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Driver {
    pub driver_id: String,
    pub full_name: String,
    pub broadcast_name: Option<String>,
    pub name_acronym: Option<String>,
    pub country_code: Option<String>,
}

/// Racing number bound to a canonical driver for one season.
#[derive(Debug, Clone, PartialEq)]
pub struct DriverAlias {
    pub driver_number: i64,
    pub season: i32,
    pub driver_id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DriverSession {
    pub session_id: i64,
    pub driver_id: String,
    pub driver_number: i64,
    pub team_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Lap {
    pub session_id: i64,
    pub driver_id: String,
    pub driver_number: i64,
    pub lap_number: i64,
    pub date_start: Option<String>,
    pub lap_duration: Option<f64>,
    pub duration_sector_1: Option<f64>,
    pub duration_sector_2: Option<f64>,
    pub duration_sector_3: Option<f64>,
    pub st_speed: Option<f64>,
    pub is_pit_out_lap: Option<bool>,
    pub compound: Option<String>,
    pub track_temperature: Option<f64>,
    pub air_temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub rainfall: Option<i64>,
    pub position: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Stint {
    pub session_id: i64,
    pub driver_id: String,
    pub driver_number: i64,
    pub stint_number: i64,
    pub compound: Option<String>,
    pub lap_start: i64,
    pub lap_end: Option<i64>,
    pub tyre_age_at_start: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PitStop {
    pub session_id: i64,
    pub driver_id: String,
    pub driver_number: i64,
    pub lap_number: i64,
    pub date: Option<String>,
    pub pit_duration: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WeatherSample {
    pub session_id: i64,
    pub date: String,
    pub track_temperature: Option<f64>,
    pub air_temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub rainfall: Option<i64>,
    pub pressure: Option<f64>,
    pub wind_speed: Option<f64>,
    pub wind_direction: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionResult {
    pub session_id: i64,
    pub driver_id: String,
    pub driver_number: i64,
    pub position: Option<i64>,
    pub number_of_laps: Option<i64>,
    pub points: Option<f64>,
    pub duration: Option<f64>,
    pub gap_to_leader: Option<String>,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RaceControlMessage {
    pub session_id: i64,
    pub date: String,
    pub category: String,
    pub message: String,
    pub flag: Option<String>,
    pub scope: Option<String>,
    pub lap_number: Option<i64>,
    pub driver_number: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PositionSample {
    pub session_id: i64,
    pub driver_id: String,
    pub driver_number: i64,
    pub date: String,
    pub position: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GridSlot {
    pub session_id: i64,
    pub driver_id: String,
    pub driver_number: i64,
    pub position: Option<i64>,
}

/// Derived tyre-change feature row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TyreChangeEvent {
    pub session_id: i64,
    pub driver_id: String,
    pub lap_number: i64,
    pub previous_compound: String,
    pub new_compound: String,
    pub change_type: String,
    pub laps_on_old_tyre: i64,
    pub laps_on_new_tyre: Option<i64>,
    pub lap_duration_before: Option<f64>,
    pub lap_duration_after: Option<f64>,
    pub lap_time_change: Option<f64>,
    pub position_before: Option<f64>,
    pub position_after: Option<f64>,
    pub position_change: Option<f64>,
}
