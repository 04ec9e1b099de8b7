//! Full historical load.

use std::collections::BTreeMap;
use tracing::{info, warn};

use super::{
    fetch_calendar, fetch_session_children, normalizer_for, observed_watermarks, SessionCursors,
};
use crate::config::AppConfig;
use crate::error::Result;
use crate::report::IngestReport;
use crate::source::TelemetrySource;
use crate::storage::Store;
use crate::types::EntityKind;

/// Load every configured session from `start_year` on.
///
/// Each entity kind is committed in its own transaction, in dependency
/// order. Watermarks are written last, so a load that fails part way
/// leaves them unset and the next run converges through idempotent
/// upserts.
pub async fn full_load<S: TelemetrySource>(
    source: &S,
    store: &mut Store,
    config: &AppConfig,
    report: &mut IngestReport,
) -> Result<()> {
    info!(start_year = config.source.start_year, "starting full load");

    let mut normalizer = normalizer_for(store, config)?;
    let unbounded = BTreeMap::new();
    fetch_calendar(source, config, &mut normalizer, &unbounded, report).await?;

    let targets: Vec<i64> = normalizer
        .batch()
        .sessions
        .iter()
        .map(|s| s.session_id)
        .collect();
    info!(sessions = targets.len(), "fetching session data");
    fetch_session_children(source, &mut normalizer, &targets, &SessionCursors::new(), report)
        .await?;

    let batch = normalizer.finish();

    for kind in EntityKind::ALL {
        let written = store
            .transaction()
            .and_then(|tx| {
                let changed = tx.write_kind(kind, &batch)?;
                tx.commit()?;
                Ok(changed)
            });
        match written {
            Ok(changed) => {
                report.entry(kind).ingested += changed;
                info!(%kind, rows = batch.rows(kind), changed, "committed");
            }
            Err(e) => {
                warn!(%kind, error = %e, "write failed");
                report.entry(kind).failed += batch.rows(kind) as u64;
                return Err(e);
            }
        }
    }

    let tx = store.transaction()?;
    tx.mark_dirty(targets.iter().copied())?;
    for (kind, watermark) in observed_watermarks(&batch) {
        if tx.advance_watermark(kind, &watermark)? {
            info!(%kind, %watermark, "watermark initialised");
        }
    }
    tx.commit()?;

    info!(
        sessions = targets.len(),
        rows = report.total_ingested(),
        "full load complete"
    );
    Ok(())
}
