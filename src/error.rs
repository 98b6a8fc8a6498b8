//! Error taxonomy for the runtime.
//!
//! In-tick errors surface to the tick caller. Background tasks (bridge,
//! convergence, streamer) log these and carry on.

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RuntimeError>;

#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Beam failed sanity checks; no ledger entry is produced.
    #[error("invalid beam {id:?}: {reason}")]
    InvalidBeam { id: String, reason: String },

    /// I/O failure while appending to the JSONL ledger. Fatal for the tick.
    #[error("ledger write failed: {0}")]
    LedgerWrite(#[source] std::io::Error),

    #[error("rollback failed: {reason}")]
    RollbackFailed { reason: String },

    #[error("regulator saturated: |corrective| = {corrective:.4}")]
    RegulatorSaturation { corrective: f64 },

    #[error("peer {peer} unreachable: {reason}")]
    PeerUnreachable { peer: String, reason: String },

    #[error("subscriber {subscriber} failed: {reason}")]
    SubscriberFailure { subscriber: u64, reason: String },

    #[error("ledger not found: {0}")]
    LedgerNotFound(PathBuf),

    #[error("malformed record at line {line}: {reason}")]
    MalformedRecord { line: usize, reason: String },

    #[error("sqlite: {0}")]
    Index(#[from] rusqlite::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

impl RuntimeError {
    pub fn invalid_beam(id: &str, reason: impl Into<String>) -> Self {
        RuntimeError::InvalidBeam {
            id: id.to_string(),
            reason: reason.into(),
        }
    }

    /// Short machine-readable tag used in log records.
    pub fn kind(&self) -> &'static str {
        match self {
            RuntimeError::InvalidBeam { .. } => "invalid_beam",
            RuntimeError::LedgerWrite(_) => "ledger_write_failure",
            RuntimeError::RollbackFailed { .. } => "rollback_failed",
            RuntimeError::RegulatorSaturation { .. } => "regulator_saturation",
            RuntimeError::PeerUnreachable { .. } => "peer_unreachable",
            RuntimeError::SubscriberFailure { .. } => "subscriber_failure",
            RuntimeError::LedgerNotFound(_) => "ledger_not_found",
            RuntimeError::MalformedRecord { .. } => "malformed_record",
            RuntimeError::Index(_) => "index",
            RuntimeError::Io(_) => "io",
            RuntimeError::Json(_) => "json",
        }
    }
}
