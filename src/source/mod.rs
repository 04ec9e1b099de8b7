//! Read-only client side of the upstream telemetry API.
//!
//! Records come back as loosely typed JSON maps; the normalizer turns them
//! into the relational types in [`crate::types`].

pub mod fixture;
pub mod openf1;
pub mod rate_limiter;
pub mod retrying;

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::future::Future;

use crate::error::Result;
use crate::types::{CursorField, EntityKind, Watermark};

pub use fixture::FixtureSource;
pub use openf1::OpenF1Client;
pub use rate_limiter::RateLimiter;
pub use retrying::Retrying;

/// One upstream record as returned by the API.
pub type SourceRecord = serde_json::Map<String, Value>;

/// Identity and time filter for a fetch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchFilter {
    pub year_from: Option<i32>,
    pub meeting_key: Option<i64>,
    pub session_key: Option<i64>,
    /// Only records strictly newer than this watermark.
    pub since: Option<Watermark>,
}

impl FetchFilter {
    pub fn for_session(session_key: i64) -> Self {
        Self {
            session_key: Some(session_key),
            ..Default::default()
        }
    }

    pub fn since(mut self, watermark: Option<Watermark>) -> Self {
        self.since = watermark;
        self
    }

    /// Whether `record` satisfies every bound of this filter.
    pub fn matches(&self, kind: EntityKind, record: &SourceRecord) -> bool {
        if let Some(year) = self.year_from {
            if field_i64(record, "year").is_some_and(|y| y < i64::from(year)) {
                return false;
            }
        }
        if let Some(key) = self.meeting_key {
            if field_i64(record, "meeting_key") != Some(key) {
                return false;
            }
        }
        if let Some(key) = self.session_key {
            if field_i64(record, "session_key") != Some(key) {
                return false;
            }
        }
        // A session-key cursor is already bounded by an explicit session filter.
        let since = match (kind.cursor(), self.session_key) {
            (CursorField::SessionKey, Some(_)) => None,
            _ => self.since.as_ref(),
        };
        is_newer(kind, record, since)
    }
}

/// Paginated read access to the upstream API.
pub trait TelemetrySource: Send + Sync {
    fn fetch(
        &self,
        kind: EntityKind,
        filter: &FetchFilter,
    ) -> impl Future<Output = Result<Vec<SourceRecord>>> + Send;
}

/// Source selected at startup: live API or a recorded fixture.
pub enum AnySource {
    OpenF1(OpenF1Client),
    Fixture(FixtureSource),
}

impl TelemetrySource for AnySource {
    async fn fetch(&self, kind: EntityKind, filter: &FetchFilter) -> Result<Vec<SourceRecord>> {
        match self {
            AnySource::OpenF1(client) => client.fetch(kind, filter).await,
            AnySource::Fixture(fixture) => fixture.fetch(kind, filter).await,
        }
    }
}

/// Whether a record lies strictly after `since` on the kind's cursor.
///
/// Records without a cursor value are kept: they cannot be placed before the
/// watermark, and re-ingesting them is idempotent.
pub fn is_newer(kind: EntityKind, record: &SourceRecord, since: Option<&Watermark>) -> bool {
    let Some(since) = since else {
        return true;
    };
    match (kind.cursor(), since) {
        (CursorField::Timestamp(field), Watermark::Timestamp(bound)) => {
            field_timestamp(record, field).map_or(true, |ts| ts > *bound)
        }
        (CursorField::SessionKey, Watermark::SessionKey(bound)) => {
            field_i64(record, "session_key").map_or(true, |key| key > *bound)
        }
        _ => true,
    }
}

/// Integer field, accepting JSON numbers and numeric strings.
pub fn field_i64(record: &SourceRecord, name: &str) -> Option<i64> {
    match record.get(name)? {
        Value::Number(n) => n.as_i64().or_else(|| {
            n.as_f64()
                .filter(|f| f.fract() == 0.0)
                .map(|f| f as i64)
        }),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub fn field_timestamp(record: &SourceRecord, name: &str) -> Option<DateTime<Utc>> {
    match record.get(name)? {
        Value::String(s) => DateTime::parse_from_rfc3339(s.trim())
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: serde_json::Value) -> SourceRecord {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_is_newer_timestamp() {
        let since = Watermark::parse(EntityKind::Sessions, "2024-03-02T17:00:00Z").unwrap();
        let later = record(json!({"date_end": "2024-03-09T19:00:00+00:00"}));
        let same = record(json!({"date_end": "2024-03-02T17:00:00+00:00"}));
        let open = record(json!({"date_end": null}));

        assert!(is_newer(EntityKind::Sessions, &later, Some(&since)));
        assert!(!is_newer(EntityKind::Sessions, &same, Some(&since)));
        assert!(is_newer(EntityKind::Sessions, &open, Some(&since)));
        assert!(is_newer(EntityKind::Sessions, &same, None));
    }

    #[test]
    fn test_is_newer_session_key() {
        let since = Watermark::SessionKey(9158);
        let stint = record(json!({"session_key": 9158}));
        assert!(!is_newer(EntityKind::Stints, &stint, Some(&since)));
        let stint = record(json!({"session_key": 9165}));
        assert!(is_newer(EntityKind::Stints, &stint, Some(&since)));
    }

    #[test]
    fn test_filter_matches() {
        let filter = FetchFilter {
            year_from: Some(2023),
            ..Default::default()
        };
        assert!(filter.matches(EntityKind::Meetings, &record(json!({"year": 2024}))));
        assert!(!filter.matches(EntityKind::Meetings, &record(json!({"year": 2022}))));

        let filter = FetchFilter::for_session(7);
        assert!(filter.matches(EntityKind::Laps, &record(json!({"session_key": "7"}))));
        assert!(!filter.matches(EntityKind::Laps, &record(json!({"session_key": 8}))));

        let filter = FetchFilter::for_session(7).since(Some(Watermark::SessionKey(9)));
        assert!(filter.matches(EntityKind::Stints, &record(json!({"session_key": 7}))));
    }

    #[test]
    fn test_field_i64_accepts_integral_floats() {
        let r = record(json!({"a": 3.0, "b": 3.5, "c": "12"}));
        assert_eq!(field_i64(&r, "a"), Some(3));
        assert_eq!(field_i64(&r, "b"), None);
        assert_eq!(field_i64(&r, "c"), Some(12));
        assert_eq!(field_i64(&r, "missing"), None);
    }
}
