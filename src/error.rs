//! Error taxonomy for the ingestion pipeline.
//!
//! Node-local recoverable errors (`TransientSource`, `SchemaMismatch`) are
//! retried or skipped with a count; the rest fail the node that raised them.

use crate::orchestrator::graph::GraphError;
use crate::types::EntityKind;

/// Errors produced while fetching, normalising, persisting or deriving data.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Network failure, timeout or rate limit; safe to retry.
    #[error("transient source error fetching {kind}: {message}")]
    TransientSource { kind: EntityKind, message: String },

    /// Upstream rejected the request; retrying will not help.
    #[error("source error fetching {kind}: {message}")]
    Source { kind: EntityKind, message: String },

    /// Upstream record is missing a required field or breaks a uniqueness rule.
    #[error("schema mismatch in {kind} record: {message}")]
    SchemaMismatch { kind: EntityKind, message: String },

    /// Store unavailable or transaction failure.
    #[error("persistence error: {0}")]
    Persistence(#[from] rusqlite::Error),

    /// Derived-feature precondition broken for one session.
    #[error("invariant violation in session {session_id}: {message}")]
    InvariantViolation { session_id: i64, message: String },

    /// Another run already holds the store lock.
    #[error("another pipeline run holds the lock on {0}")]
    LockUnavailable(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The run was aborted between nodes.
    #[error("run cancelled")]
    Cancelled,

    /// The downstream consumer command exited unsuccessfully.
    #[error("downstream consumer failed: {0}")]
    Downstream(String),

    #[error("task graph: {0}")]
    Graph(#[from] GraphError),
}

impl PipelineError {
    pub fn schema(kind: EntityKind, message: impl Into<String>) -> Self {
        Self::SchemaMismatch {
            kind,
            message: message.into(),
        }
    }

    pub fn invariant(session_id: i64, message: impl Into<String>) -> Self {
        Self::InvariantViolation {
            session_id,
            message: message.into(),
        }
    }

    /// Whether the retry helper should try the operation again.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientSource { .. })
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
