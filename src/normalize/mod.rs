//! Maps loosely typed upstream records onto the relational schema.
//!
//! A record missing a required field, referencing an unknown parent or
//! breaking an identity rule is rejected with [`PipelineError::SchemaMismatch`];
//! the batch carries on and the rejection is counted.

pub mod identity;

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use tracing::warn;

use crate::error::{PipelineError, Result};
use crate::report::IngestReport;
use crate::source::{field_i64, SourceRecord};
use crate::types::{
    Driver, DriverAlias, DriverSession, EntityKind, GridSlot, Lap, Meeting, PitStop,
    PositionSample, RaceControlMessage, Session, SessionResult, Stint, TeamAlias, TeamSeason,
    WeatherSample,
};
use identity::{canonical_driver_id, DriverRegistry, TeamLineage};

/// Meeting and season of a known session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionInfo {
    pub meeting_id: i64,
    pub year: i32,
}

/// Rows ready to be written, grouped by table.
#[derive(Debug, Clone, Default)]
pub struct NormalizedBatch {
    pub meetings: Vec<Meeting>,
    pub sessions: Vec<Session>,
    pub team_seasons: Vec<TeamSeason>,
    pub team_aliases: Vec<TeamAlias>,
    pub drivers: Vec<Driver>,
    pub driver_aliases: Vec<DriverAlias>,
    pub driver_sessions: Vec<DriverSession>,
    pub laps: Vec<Lap>,
    pub stints: Vec<Stint>,
    pub pitstops: Vec<PitStop>,
    pub weather: Vec<WeatherSample>,
    pub results: Vec<SessionResult>,
    pub race_control: Vec<RaceControlMessage>,
    pub positions: Vec<PositionSample>,
    pub grid: Vec<GridSlot>,
}

impl NormalizedBatch {
    /// Rows written under one entity kind.
    pub fn rows(&self, kind: EntityKind) -> usize {
        match kind {
            EntityKind::Meetings => self.meetings.len(),
            EntityKind::Sessions => self.sessions.len(),
            EntityKind::Drivers => self.driver_sessions.len(),
            EntityKind::Laps => self.laps.len(),
            EntityKind::Stints => self.stints.len(),
            EntityKind::Pit => self.pitstops.len(),
            EntityKind::Weather => self.weather.len(),
            EntityKind::SessionResult => self.results.len(),
            EntityKind::RaceControl => self.race_control.len(),
            EntityKind::Position => self.positions.len(),
            EntityKind::StartingGrid => self.grid.len(),
        }
    }
}

/// Stored rows lap enrichment may need but the batch does not carry.
#[derive(Debug, Clone, Default)]
struct LapContext {
    stints: Vec<Stint>,
    weather: Vec<WeatherSample>,
    positions: Vec<PositionSample>,
}

/// Stateful normalizer for one loader run.
///
/// Parents must be accepted before their children: sessions resolve their
/// meeting, and every per-driver record resolves its racing number through
/// the season of its session.
pub struct Normalizer {
    meetings: HashMap<i64, i32>,
    sessions: HashMap<i64, SessionInfo>,
    lineage: TeamLineage,
    drivers: DriverRegistry,
    batch: NormalizedBatch,
    context: LapContext,
}

impl Normalizer {
    pub fn new(lineage: TeamLineage, drivers: DriverRegistry) -> Self {
        Self {
            meetings: HashMap::new(),
            sessions: HashMap::new(),
            lineage,
            drivers,
            batch: NormalizedBatch::default(),
            context: LapContext::default(),
        }
    }

    /// Register a meeting already present in the store.
    pub fn know_meeting(&mut self, meeting_id: i64, year: i32) {
        self.meetings.insert(meeting_id, year);
    }

    /// Register a session already present in the store.
    pub fn know_session(&mut self, session_id: i64, info: SessionInfo) {
        self.sessions.insert(session_id, info);
    }

    pub fn session_info(&self, session_id: i64) -> Option<SessionInfo> {
        self.sessions.get(&session_id).copied()
    }

    /// Add already stored stints and samples of a session as lookup
    /// context for lap enrichment. They are not written back.
    pub fn seed_lap_context(
        &mut self,
        stints: Vec<Stint>,
        weather: Vec<WeatherSample>,
        positions: Vec<PositionSample>,
    ) {
        self.context.stints.extend(stints);
        self.context.weather.extend(weather);
        self.context.positions.extend(positions);
    }

    pub fn batch(&self) -> &NormalizedBatch {
        &self.batch
    }

    /// Normalise a page of records, counting fetched and skipped ones.
    pub fn accept(&mut self, kind: EntityKind, records: &[SourceRecord], report: &mut IngestReport) {
        report.entry(kind).fetched += records.len() as u64;
        for record in records {
            if let Err(e) = self.normalize(kind, record) {
                warn!(%kind, error = %e, "skipping record");
                report.entry(kind).skipped += 1;
            }
        }
    }

    /// Normalise starting-grid records onto `session_id`.
    ///
    /// The grid is published against the qualifying session of a meeting,
    /// so records are re-keyed to the session being loaded.
    pub fn accept_grid(
        &mut self,
        session_id: i64,
        records: &[SourceRecord],
        report: &mut IngestReport,
    ) {
        let kind = EntityKind::StartingGrid;
        report.entry(kind).fetched += records.len() as u64;
        for record in records {
            match self.grid_slot(session_id, record) {
                Ok(slot) => self.batch.grid.push(slot),
                Err(e) => {
                    warn!(%kind, session_key = session_id, error = %e, "skipping record");
                    report.entry(kind).skipped += 1;
                }
            }
        }
    }

    /// Enrich laps from the batch's stints, weather and positions, falling
    /// back on the seeded context, and hand back the rows.
    pub fn finish(mut self) -> NormalizedBatch {
        enrich_laps(&mut self.batch, &self.context);
        self.batch
    }

    fn normalize(&mut self, kind: EntityKind, r: &SourceRecord) -> Result<()> {
        match kind {
            EntityKind::Meetings => {
                let meeting = meeting(r)?;
                self.meetings.insert(meeting.meeting_id, meeting.year);
                self.batch.meetings.push(meeting);
            }
            EntityKind::Sessions => {
                let session = self.session(r)?;
                self.sessions.insert(
                    session.session_id,
                    SessionInfo {
                        meeting_id: session.meeting_id,
                        year: session.year,
                    },
                );
                self.batch.sessions.push(session);
            }
            EntityKind::Drivers => self.driver(r)?,
            EntityKind::Laps => {
                let lap = self.lap(r)?;
                self.batch.laps.push(lap);
            }
            EntityKind::Stints => {
                let stint = self.stint(r)?;
                self.batch.stints.push(stint);
            }
            EntityKind::Pit => {
                let stop = self.pit_stop(r)?;
                self.batch.pitstops.push(stop);
            }
            EntityKind::Weather => {
                let sample = self.weather(r)?;
                self.batch.weather.push(sample);
            }
            EntityKind::SessionResult => {
                let result = self.session_result(r)?;
                self.batch.results.push(result);
            }
            EntityKind::RaceControl => {
                let message = self.race_control(r)?;
                self.batch.race_control.push(message);
            }
            EntityKind::Position => {
                let sample = self.position(r)?;
                self.batch.positions.push(sample);
            }
            EntityKind::StartingGrid => {
                let session_id = req_i64(kind, r, "session_key")?;
                let slot = self.grid_slot(session_id, r)?;
                self.batch.grid.push(slot);
            }
        }
        Ok(())
    }

    fn session(&self, r: &SourceRecord) -> Result<Session> {
        let kind = EntityKind::Sessions;
        let session_id = req_i64(kind, r, "session_key")?;
        let meeting_id = req_i64(kind, r, "meeting_key")?;
        let meeting_year = self.meetings.get(&meeting_id).copied().ok_or_else(|| {
            PipelineError::schema(
                kind,
                format!("session {session_id} references unknown meeting {meeting_id}"),
            )
        })?;

        Ok(Session {
            session_id,
            meeting_id,
            session_name: req_str(kind, r, "session_name")?,
            session_type: opt_str(r, "session_type"),
            date_start: req_timestamp(kind, r, "date_start")?,
            date_end: opt_timestamp(r, "date_end"),
            year: opt_i32(r, "year").unwrap_or(meeting_year),
        })
    }

    fn driver(&mut self, r: &SourceRecord) -> Result<()> {
        let kind = EntityKind::Drivers;
        let session_id = req_i64(kind, r, "session_key")?;
        let season = self.season_of(kind, session_id)?;
        let number = req_i64(kind, r, "driver_number")?;
        let full_name = req_str(kind, r, "full_name")?;
        let driver_id = canonical_driver_id(&full_name)
            .ok_or_else(|| PipelineError::schema(kind, "blank full_name"))?;

        let team = match opt_str(r, "team_name") {
            Some(name) => {
                let team_id = self.lineage.resolve(&name, season).ok_or_else(|| {
                    PipelineError::schema(
                        kind,
                        format!("unresolved team alias `{name}` for season {season}"),
                    )
                })?;
                Some((team_id, name))
            }
            None => None,
        };

        // Registered last so a rejected record leaves no alias behind.
        let new_alias = self
            .drivers
            .register(number, season, &driver_id)
            .map_err(|conflict| {
                PipelineError::schema(
                    kind,
                    format!(
                        "driver number {number} already belongs to {} in {season}",
                        conflict.existing
                    ),
                )
            })?;
        if new_alias {
            self.batch.driver_aliases.push(DriverAlias {
                driver_number: number,
                season,
                driver_id: driver_id.clone(),
            });
        }

        self.batch.drivers.push(Driver {
            driver_id: driver_id.clone(),
            full_name: full_name.split_whitespace().collect::<Vec<_>>().join(" "),
            broadcast_name: opt_str(r, "broadcast_name"),
            name_acronym: opt_str(r, "name_acronym"),
            country_code: opt_str(r, "country_code"),
        });

        let team_id = team.map(|(team_id, name)| {
            self.batch.team_seasons.push(TeamSeason {
                team_id,
                season,
                team_name: name.clone(),
                team_colour: opt_str(r, "team_colour").map(|c| c.to_lowercase()),
            });
            self.batch.team_aliases.push(TeamAlias {
                alias: name,
                season,
                team_id,
            });
            team_id
        });

        self.batch.driver_sessions.push(DriverSession {
            session_id,
            driver_id,
            driver_number: number,
            team_id,
        });
        Ok(())
    }

    fn lap(&self, r: &SourceRecord) -> Result<Lap> {
        let kind = EntityKind::Laps;
        let session_id = req_i64(kind, r, "session_key")?;
        let (driver_id, driver_number) = self.resolve_driver(kind, r, session_id)?;

        Ok(Lap {
            session_id,
            driver_id,
            driver_number,
            lap_number: req_i64(kind, r, "lap_number")?,
            date_start: opt_timestamp(r, "date_start"),
            lap_duration: opt_f64(r, "lap_duration"),
            duration_sector_1: opt_f64(r, "duration_sector_1"),
            duration_sector_2: opt_f64(r, "duration_sector_2"),
            duration_sector_3: opt_f64(r, "duration_sector_3"),
            st_speed: opt_f64(r, "st_speed"),
            is_pit_out_lap: opt_bool(r, "is_pit_out_lap"),
            compound: opt_str(r, "compound").map(|c| c.to_uppercase()),
            track_temperature: opt_f64(r, "track_temperature"),
            air_temperature: opt_f64(r, "air_temperature"),
            humidity: opt_f64(r, "humidity"),
            rainfall: opt_flag(r, "rainfall"),
            position: field_i64(r, "position"),
        })
    }

    fn stint(&self, r: &SourceRecord) -> Result<Stint> {
        let kind = EntityKind::Stints;
        let session_id = req_i64(kind, r, "session_key")?;
        let (driver_id, driver_number) = self.resolve_driver(kind, r, session_id)?;

        Ok(Stint {
            session_id,
            driver_id,
            driver_number,
            stint_number: req_i64(kind, r, "stint_number")?,
            compound: opt_str(r, "compound").map(|c| c.to_uppercase()),
            lap_start: req_i64(kind, r, "lap_start")?,
            lap_end: field_i64(r, "lap_end"),
            tyre_age_at_start: field_i64(r, "tyre_age_at_start"),
        })
    }

    fn pit_stop(&self, r: &SourceRecord) -> Result<PitStop> {
        let kind = EntityKind::Pit;
        let session_id = req_i64(kind, r, "session_key")?;
        let (driver_id, driver_number) = self.resolve_driver(kind, r, session_id)?;

        Ok(PitStop {
            session_id,
            driver_id,
            driver_number,
            lap_number: req_i64(kind, r, "lap_number")?,
            date: opt_timestamp(r, "date"),
            pit_duration: opt_f64(r, "pit_duration"),
        })
    }

    fn weather(&self, r: &SourceRecord) -> Result<WeatherSample> {
        let kind = EntityKind::Weather;
        let session_id = req_i64(kind, r, "session_key")?;
        self.season_of(kind, session_id)?;

        Ok(WeatherSample {
            session_id,
            date: req_timestamp(kind, r, "date")?,
            track_temperature: opt_f64(r, "track_temperature"),
            air_temperature: opt_f64(r, "air_temperature"),
            humidity: opt_f64(r, "humidity"),
            rainfall: opt_flag(r, "rainfall"),
            pressure: opt_f64(r, "pressure"),
            wind_speed: opt_f64(r, "wind_speed"),
            wind_direction: field_i64(r, "wind_direction"),
        })
    }

    fn session_result(&self, r: &SourceRecord) -> Result<SessionResult> {
        let kind = EntityKind::SessionResult;
        let session_id = req_i64(kind, r, "session_key")?;
        let (driver_id, driver_number) = self.resolve_driver(kind, r, session_id)?;

        Ok(SessionResult {
            session_id,
            driver_id,
            driver_number,
            position: field_i64(r, "position"),
            number_of_laps: field_i64(r, "number_of_laps"),
            points: opt_f64(r, "points"),
            // Qualifying results carry one duration per segment.
            duration: opt_f64(r, "duration"),
            gap_to_leader: opt_str(r, "gap_to_leader"),
            status: result_status(r).to_string(),
        })
    }

    fn race_control(&self, r: &SourceRecord) -> Result<RaceControlMessage> {
        let kind = EntityKind::RaceControl;
        let session_id = req_i64(kind, r, "session_key")?;
        self.season_of(kind, session_id)?;

        Ok(RaceControlMessage {
            session_id,
            date: req_timestamp(kind, r, "date")?,
            category: req_str(kind, r, "category")?,
            message: req_str(kind, r, "message")?,
            flag: opt_str(r, "flag"),
            scope: opt_str(r, "scope"),
            lap_number: field_i64(r, "lap_number"),
            driver_number: field_i64(r, "driver_number"),
        })
    }

    fn position(&self, r: &SourceRecord) -> Result<PositionSample> {
        let kind = EntityKind::Position;
        let session_id = req_i64(kind, r, "session_key")?;
        let (driver_id, driver_number) = self.resolve_driver(kind, r, session_id)?;

        Ok(PositionSample {
            session_id,
            driver_id,
            driver_number,
            date: req_timestamp(kind, r, "date")?,
            position: req_i64(kind, r, "position")?,
        })
    }

    fn grid_slot(&self, session_id: i64, r: &SourceRecord) -> Result<GridSlot> {
        let kind = EntityKind::StartingGrid;
        let (driver_id, driver_number) = self.resolve_driver(kind, r, session_id)?;

        Ok(GridSlot {
            session_id,
            driver_id,
            driver_number,
            position: field_i64(r, "position"),
        })
    }

    fn season_of(&self, kind: EntityKind, session_id: i64) -> Result<i32> {
        self.sessions
            .get(&session_id)
            .map(|info| info.year)
            .ok_or_else(|| PipelineError::schema(kind, format!("unknown session {session_id}")))
    }

    fn resolve_driver(
        &self,
        kind: EntityKind,
        r: &SourceRecord,
        session_id: i64,
    ) -> Result<(String, i64)> {
        let number = req_i64(kind, r, "driver_number")?;
        let season = self.season_of(kind, session_id)?;
        let driver_id = self.drivers.resolve(number, season).ok_or_else(|| {
            PipelineError::schema(
                kind,
                format!("driver number {number} is not registered for season {season}"),
            )
        })?;
        Ok((driver_id.to_string(), number))
    }
}

fn meeting(r: &SourceRecord) -> Result<Meeting> {
    let kind = EntityKind::Meetings;
    let name = opt_str(r, "meeting_name")
        .or_else(|| opt_str(r, "meeting_official_name"))
        .ok_or_else(|| missing(kind, r, "meeting_name"))?;

    Ok(Meeting {
        meeting_id: req_i64(kind, r, "meeting_key")?,
        name,
        location: opt_str(r, "location"),
        country_code: opt_str(r, "country_code"),
        circuit_key: field_i64(r, "circuit_key"),
        circuit_short_name: opt_str(r, "circuit_short_name"),
        year: opt_i32(r, "year").ok_or_else(|| missing(kind, r, "year"))?,
        date_start: req_timestamp(kind, r, "date_start")?,
    })
}

/// `dsq` wins over `dns`, which wins over `dnf`.
fn result_status(r: &SourceRecord) -> &'static str {
    let flag = |name: &str| opt_bool(r, name).unwrap_or(false);
    if flag("dsq") {
        "dsq"
    } else if flag("dns") {
        "dns"
    } else if flag("dnf") {
        "dnf"
    } else {
        "finish"
    }
}

/// Fill lap context the lap endpoint does not carry.
///
/// Compound comes from the stint covering the lap; weather and running
/// position from the latest sample at or before the lap start.
fn enrich_laps(batch: &mut NormalizedBatch, context: &LapContext) {
    let NormalizedBatch {
        laps,
        stints,
        weather,
        positions,
        ..
    } = batch;

    // Batch rows take precedence over the stored context
    let mut stints_by_driver: HashMap<(i64, i64), Vec<&Stint>> = HashMap::new();
    for stint in stints.iter().chain(&context.stints) {
        stints_by_driver
            .entry((stint.session_id, stint.driver_number))
            .or_default()
            .push(stint);
    }

    let mut weather_by_session: HashMap<i64, BTreeMap<&str, &WeatherSample>> = HashMap::new();
    for sample in context.weather.iter().chain(weather.iter()) {
        weather_by_session
            .entry(sample.session_id)
            .or_default()
            .insert(sample.date.as_str(), sample);
    }

    let mut positions_by_driver: HashMap<(i64, i64), BTreeMap<&str, i64>> = HashMap::new();
    for sample in context.positions.iter().chain(positions.iter()) {
        positions_by_driver
            .entry((sample.session_id, sample.driver_number))
            .or_default()
            .insert(sample.date.as_str(), sample.position);
    }

    for lap in laps.iter_mut() {
        let key = (lap.session_id, lap.driver_number);

        if lap.compound.is_none() {
            lap.compound = stints_by_driver.get(&key).and_then(|stints| {
                stints
                    .iter()
                    .find(|s| {
                        lap.lap_number >= s.lap_start
                            && s.lap_end.map_or(true, |end| lap.lap_number <= end)
                    })
                    .and_then(|s| s.compound.clone())
            });
        }

        let Some(date) = lap.date_start.clone() else {
            continue;
        };

        if let Some(sample) = weather_by_session
            .get(&lap.session_id)
            .and_then(|samples| samples.range(..=date.as_str()).next_back())
            .map(|(_, sample)| *sample)
        {
            lap.track_temperature = lap.track_temperature.or(sample.track_temperature);
            lap.air_temperature = lap.air_temperature.or(sample.air_temperature);
            lap.humidity = lap.humidity.or(sample.humidity);
            lap.rainfall = lap.rainfall.or(sample.rainfall);
        }

        if lap.position.is_none() {
            lap.position = positions_by_driver
                .get(&key)
                .and_then(|samples| samples.range(..=date.as_str()).next_back())
                .map(|(_, position)| *position);
        }
    }
}

// ==================== Field accessors ====================

/// RFC 3339 UTC with millisecond precision, so stored timestamps order
/// lexicographically.
pub fn normalize_timestamp(raw: &str) -> Option<String> {
    let raw = raw.trim();
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
                .ok()
                .map(|naive| naive.and_utc())
        })
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Millis, true))
}

fn missing(kind: EntityKind, r: &SourceRecord, name: &str) -> PipelineError {
    match r.get(name) {
        None | Some(Value::Null) => {
            PipelineError::schema(kind, format!("missing required field `{name}`"))
        }
        Some(value) => {
            PipelineError::schema(kind, format!("field `{name}` has unexpected value {value}"))
        }
    }
}

fn req_i64(kind: EntityKind, r: &SourceRecord, name: &str) -> Result<i64> {
    field_i64(r, name).ok_or_else(|| missing(kind, r, name))
}

fn opt_i32(r: &SourceRecord, name: &str) -> Option<i32> {
    field_i64(r, name).and_then(|v| i32::try_from(v).ok())
}

fn opt_f64(r: &SourceRecord, name: &str) -> Option<f64> {
    match r.get(name)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn opt_bool(r: &SourceRecord, name: &str) -> Option<bool> {
    match r.get(name)? {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_i64().map(|v| v != 0),
        _ => None,
    }
}

/// 0/1 flag stored as an integer; accepts booleans too.
fn opt_flag(r: &SourceRecord, name: &str) -> Option<i64> {
    field_i64(r, name).or_else(|| opt_bool(r, name).map(i64::from))
}

fn opt_str(r: &SourceRecord, name: &str) -> Option<String> {
    match r.get(name)? {
        Value::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn req_str(kind: EntityKind, r: &SourceRecord, name: &str) -> Result<String> {
    opt_str(r, name).ok_or_else(|| missing(kind, r, name))
}

fn opt_timestamp(r: &SourceRecord, name: &str) -> Option<String> {
    r.get(name)
        .and_then(Value::as_str)
        .and_then(normalize_timestamp)
}

fn req_timestamp(kind: EntityKind, r: &SourceRecord, name: &str) -> Result<String> {
    opt_timestamp(r, name).ok_or_else(|| missing(kind, r, name))
}
