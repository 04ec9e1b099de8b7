//! HTTP client for the OpenF1 telemetry API.

use anyhow::Context;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

use super::{FetchFilter, RateLimiter, SourceRecord, TelemetrySource};
use crate::config::SourceConfig;
use crate::error::{PipelineError, Result};
use crate::types::{CursorField, EntityKind};

/// Base URL of the public OpenF1 API
pub const BASE_URL: &str = "https://api.openf1.org/v1";

/// Build an endpoint URL with OpenF1 comparison filters.
///
/// OpenF1 expects raw operators in the query string (`year>=2023`), so the
/// query is assembled by hand rather than through `RequestBuilder::query`.
pub fn endpoint_url(base_url: &str, kind: EntityKind, filter: &FetchFilter) -> String {
    let mut params = Vec::new();
    if let Some(year) = filter.year_from {
        params.push(format!("year>={year}"));
    }
    if let Some(key) = filter.meeting_key {
        params.push(format!("meeting_key={key}"));
    }
    if let Some(key) = filter.session_key {
        params.push(format!("session_key={key}"));
    }
    if let Some(since) = &filter.since {
        match kind.cursor() {
            CursorField::Timestamp(field) => {
                params.push(format!("{field}>{}", since.to_query_value()));
            }
            // Per-session kinds are already bounded by the session key.
            CursorField::SessionKey if filter.session_key.is_none() => {
                params.push(format!("session_key>{}", since.to_query_value()));
            }
            CursorField::SessionKey => {}
        }
    }

    let base = base_url.trim_end_matches('/');
    if params.is_empty() {
        format!("{}/{}", base, kind.as_str())
    } else {
        format!("{}/{}?{}", base, kind.as_str(), params.join("&"))
    }
}

/// How a response status is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StatusClass {
    Records,
    /// OpenF1 answers 404 when a filter matches nothing.
    NoRecords,
    Transient,
    Rejected,
}

fn classify_status(status: StatusCode) -> StatusClass {
    if status == StatusCode::NOT_FOUND {
        StatusClass::NoRecords
    } else if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        StatusClass::Transient
    } else if status.is_success() {
        StatusClass::Records
    } else {
        StatusClass::Rejected
    }
}

/// Rate-limited OpenF1 client; one request per fetch, retries are layered
/// on with [`super::Retrying`].
pub struct OpenF1Client {
    client: Client,
    base_url: String,
    limiter: RateLimiter,
}

impl OpenF1Client {
    /// Creates a new client from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(config: &SourceConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: config.base_url.clone(),
            limiter: RateLimiter::new(
                config.requests_per_minute,
                Duration::from_millis(config.min_delay_ms),
                Duration::from_millis(config.max_delay_ms),
            ),
        })
    }

    async fn get_records(&self, kind: EntityKind, url: &str) -> Result<Vec<SourceRecord>> {
        self.limiter.acquire().await;

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| classify_reqwest_error(kind, e))?;

        let status = response.status();
        match classify_status(status) {
            StatusClass::Records => {}
            StatusClass::NoRecords => {
                debug!(%kind, url, "no records");
                return Ok(Vec::new());
            }
            StatusClass::Transient => {
                return Err(PipelineError::TransientSource {
                    kind,
                    message: format!("HTTP {status}"),
                });
            }
            StatusClass::Rejected => {
                let body = response.text().await.unwrap_or_default();
                return Err(PipelineError::Source {
                    kind,
                    message: format!("HTTP {status}: {body}"),
                });
            }
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| classify_reqwest_error(kind, e))?;
        Ok(into_records(kind, body))
    }
}

impl TelemetrySource for OpenF1Client {
    async fn fetch(&self, kind: EntityKind, filter: &FetchFilter) -> Result<Vec<SourceRecord>> {
        let url = endpoint_url(&self.base_url, kind, filter);
        let records = self.get_records(kind, &url).await?;

        let fetched = records.len();
        let records: Vec<_> = records
            .into_iter()
            .filter(|r| filter.matches(kind, r))
            .collect();
        debug!(%kind, fetched, kept = records.len(), "fetched page");
        Ok(records)
    }
}

fn classify_reqwest_error(kind: EntityKind, err: reqwest::Error) -> PipelineError {
    let message = err.to_string();
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        PipelineError::TransientSource { kind, message }
    } else {
        PipelineError::Source { kind, message }
    }
}

/// Split a JSON array response into records, dropping non-object items.
fn into_records(kind: EntityKind, body: Value) -> Vec<SourceRecord> {
    match body {
        Value::Array(items) => items
            .into_iter()
            .filter_map(|item| match item {
                Value::Object(map) => Some(map),
                other => {
                    warn!(%kind, item = %other, "ignoring non-object item");
                    None
                }
            })
            .collect(),
        Value::Object(map) => vec![map],
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Watermark;
    use serde_json::json;

    #[test]
    fn test_endpoint_url_without_filters() {
        let url = endpoint_url(BASE_URL, EntityKind::Meetings, &FetchFilter::default());
        assert_eq!(url, "https://api.openf1.org/v1/meetings");
    }

    #[test]
    fn test_endpoint_url_year_and_since() {
        let filter = FetchFilter {
            year_from: Some(2023),
            since: Watermark::parse(EntityKind::Sessions, "2024-03-02T17:00:00+00:00"),
            ..Default::default()
        };
        let url = endpoint_url("https://example.test/v1/", EntityKind::Sessions, &filter);
        assert_eq!(
            url,
            "https://example.test/v1/sessions?year>=2023&date_end>2024-03-02T17:00:00.000Z"
        );
    }

    #[test]
    fn test_endpoint_url_session_key_cursor() {
        let filter = FetchFilter::for_session(9165).since(Some(Watermark::SessionKey(9158)));
        let url = endpoint_url(BASE_URL, EntityKind::Stints, &filter);
        assert_eq!(url, "https://api.openf1.org/v1/stints?session_key=9165");

        let filter = FetchFilter::default().since(Some(Watermark::SessionKey(9158)));
        let url = endpoint_url(BASE_URL, EntityKind::Drivers, &filter);
        assert_eq!(url, "https://api.openf1.org/v1/drivers?session_key>9158");
    }

    #[test]
    fn test_status_classes() {
        assert_eq!(classify_status(StatusCode::OK), StatusClass::Records);
        assert_eq!(classify_status(StatusCode::NOT_FOUND), StatusClass::NoRecords);
        for status in [
            StatusCode::TOO_MANY_REQUESTS,
            StatusCode::INTERNAL_SERVER_ERROR,
            StatusCode::BAD_GATEWAY,
            StatusCode::SERVICE_UNAVAILABLE,
            StatusCode::GATEWAY_TIMEOUT,
        ] {
            assert_eq!(classify_status(status), StatusClass::Transient, "{status}");
        }
        for status in [
            StatusCode::BAD_REQUEST,
            StatusCode::UNAUTHORIZED,
            StatusCode::FORBIDDEN,
            StatusCode::UNPROCESSABLE_ENTITY,
        ] {
            assert_eq!(classify_status(status), StatusClass::Rejected, "{status}");
        }
    }

    fn local_client(base_url: String, timeout_secs: u64) -> OpenF1Client {
        let config = SourceConfig {
            base_url,
            timeout_secs,
            min_delay_ms: 0,
            max_delay_ms: 0,
            ..Default::default()
        };
        OpenF1Client::new(&config).unwrap()
    }

    #[tokio::test]
    async fn test_refused_connection_is_transient() {
        // Bind then drop to get a port nobody listens on
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let client = local_client(format!("http://127.0.0.1:{port}/v1"), 5);

        let err = client
            .fetch(EntityKind::Meetings, &FetchFilter::default())
            .await
            .unwrap_err();
        assert!(err.is_transient(), "got {err}");
    }

    #[tokio::test]
    async fn test_timeout_is_transient() {
        // Accepted by the backlog but never answered
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let client = local_client(format!("http://127.0.0.1:{port}/v1"), 1);

        let err = client
            .fetch(EntityKind::Meetings, &FetchFilter::default())
            .await
            .unwrap_err();
        assert!(err.is_transient(), "got {err}");
        drop(listener);
    }

    #[test]
    fn test_into_records_skips_scalars() {
        let records = into_records(EntityKind::Laps, json!([{"lap_number": 1}, 5, {"lap_number": 2}]));
        assert_eq!(records.len(), 2);
        assert!(into_records(EntityKind::Laps, json!("oops")).is_empty());
    }
}
