//! Error taxonomy for the sync engine.
//!
//! Only `RemoteUnavailable` is retried automatically. Everything else is
//! either surfaced to the caller or logged and absorbed at the boundary that
//! produced it.

use thiserror::Error;

pub type SyncResult<T> = Result<T, SyncError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    /// Network failure, timeout or backend 5xx.
    #[error("orders backend unavailable: {0}")]
    RemoteUnavailable(String),

    /// Backend refused the request (HTTP 4xx). Replaying it would fail again.
    #[error("orders backend rejected the request (HTTP {status}): {message}")]
    RemoteRejected { status: u16, message: String },

    /// Backend answered with something that is not the expected shape.
    #[error("malformed response from orders backend: {0}")]
    Protocol(String),

    /// Local SQLite read/write failure.
    #[error("local persistence failed: {0}")]
    Persistence(String),

    /// A user mutation is missing fields the backend requires.
    #[error("invalid order: {0}")]
    Validation(String),
}

impl SyncError {
    /// Whether the failed operation should stay queued for the next drain.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::RemoteUnavailable(_))
    }

    /// Whether the backend said the target record does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, SyncError::RemoteRejected { status: 404, .. })
    }
}

impl From<rusqlite::Error> for SyncError {
    fn from(err: rusqlite::Error) -> Self {
        SyncError::Persistence(format!("sqlite: {err}"))
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Persistence(format!("json: {err}"))
    }
}
