//! Load-mode selection.

use rusqlite::{Connection, OpenFlags};
use std::path::Path;
use tracing::debug;

use crate::error::Result;
use crate::types::LoadMode;

/// FULL when the store is missing or holds no meetings, INCREMENTAL otherwise.
///
/// Opens the store read-only, so the decision never creates or alters the
/// file it inspects.
pub fn select_mode(db_path: &Path) -> Result<LoadMode> {
    if !db_path.exists() {
        debug!(path = %db_path.display(), "store missing");
        return Ok(LoadMode::Full);
    }

    let conn = Connection::open_with_flags(
        db_path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    let has_meetings_table: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'meetings')",
        [],
        |row| row.get(0),
    )?;
    if !has_meetings_table {
        debug!(path = %db_path.display(), "store has no schema");
        return Ok(LoadMode::Full);
    }

    let meetings: i64 = conn.query_row("SELECT COUNT(*) FROM meetings", [], |row| row.get(0))?;
    debug!(meetings, "inspected store");
    Ok(if meetings == 0 {
        LoadMode::Full
    } else {
        LoadMode::Incremental
    })
}
