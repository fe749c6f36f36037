//! Error taxonomy for the sync engine.
//!
//! The propagation policy lives with the code that applies it: decode and
//! chunk errors are logged and dropped, per-chunk send failures retry with
//! backoff before failing the file, integrity failures discard the file and
//! surface an `Error` message to the peer.

use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("transport closed")]
    TransportClosed,

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("decode failed: {0}")]
    Decode(String),

    #[error("integrity check failed for {path}: expected {expected}, got {actual}")]
    Integrity {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("apply rejected: {0}")]
    ApplyFailed(String),

    #[error("i/o failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("cancelled")]
    Cancelled,
}

impl SyncError {
    /// Stable code carried in outbound `Error` messages.
    pub fn error_code(&self) -> &'static str {
        match self {
            SyncError::TransportClosed => "TRANSPORT_CLOSED",
            SyncError::Timeout(_) => "TIMEOUT",
            SyncError::Decode(_) => "DECODE",
            SyncError::Integrity { .. } => "INTEGRITY",
            SyncError::Protocol(_) => "PROTOCOL",
            SyncError::NotFound(_) => "NOT_FOUND",
            SyncError::ApplyFailed(_) => "APPLY_FAILED",
            SyncError::Io(_) => "IO_FAILED",
            SyncError::Cancelled => "CANCELLED",
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Decode(e.to_string())
    }
}
