//! Retry layer over any [`TelemetrySource`].

use super::{FetchFilter, SourceRecord, TelemetrySource};
use crate::error::Result;
use crate::retry::{retry_transient, RetryConfig};
use crate::types::EntityKind;

/// Retries transient fetch failures of the wrapped source with backoff.
pub struct Retrying<S> {
    inner: S,
    config: RetryConfig,
}

impl<S> Retrying<S> {
    pub fn new(inner: S, config: RetryConfig) -> Self {
        Self { inner, config }
    }

    #[cfg(test)]
    pub fn inner(&self) -> &S {
        &self.inner
    }
}

impl<S: TelemetrySource> TelemetrySource for Retrying<S> {
    async fn fetch(&self, kind: EntityKind, filter: &FetchFilter) -> Result<Vec<SourceRecord>> {
        let name = match filter.session_key {
            Some(key) => format!("fetch {kind} for session {key}"),
            None => format!("fetch {kind}"),
        };
        retry_transient(&self.config, &name, || self.inner.fetch(kind, filter)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipelineError;
    use crate::loader::fixtures::record;
    use crate::source::fixture::InjectedFailure;
    use crate::source::FixtureSource;
    use serde_json::json;

    fn source_with_laps() -> FixtureSource {
        let source = FixtureSource::new();
        source.push(
            EntityKind::Laps,
            vec![record(json!({"session_key": 9472, "driver_number": 1, "lap_number": 1}))],
        );
        source
    }

    #[tokio::test]
    async fn test_transient_failures_within_budget_recover() {
        let source = Retrying::new(source_with_laps(), RetryConfig::immediate(2));
        source
            .inner()
            .inject_failure(EntityKind::Laps, InjectedFailure::Transient(2));

        let records = source
            .fetch(EntityKind::Laps, &FetchFilter::for_session(9472))
            .await
            .unwrap();

        assert_eq!(records.len(), 1);
        assert_eq!(source.inner().calls(EntityKind::Laps).len(), 3);
    }

    #[tokio::test]
    async fn test_three_failed_attempts_surface_the_error() {
        let source = Retrying::new(source_with_laps(), RetryConfig::immediate(2));
        source
            .inner()
            .inject_failure(EntityKind::Laps, InjectedFailure::Transient(3));

        let err = source
            .fetch(EntityKind::Laps, &FetchFilter::for_session(9472))
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::TransientSource { .. }), "got {err}");
        assert_eq!(source.inner().calls(EntityKind::Laps).len(), 3);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let source = Retrying::new(source_with_laps(), RetryConfig::immediate(2));
        source
            .inner()
            .inject_failure(EntityKind::Laps, InjectedFailure::Permanent);

        let err = source
            .fetch(EntityKind::Laps, &FetchFilter::default())
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::Source { .. }), "got {err}");
        assert_eq!(source.inner().calls(EntityKind::Laps).len(), 1);
    }
}
