//! SQLite storage for telemetry entities, derived features and loader state

pub mod repository;
pub mod schema;

pub use repository::{RunRecord, Store, StoreTx};
