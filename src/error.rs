//! Transfer error taxonomy.
//!
//! Every adapter classifies its failures into one of these variants before
//! returning; nothing above the adapter layer ever sees a raw transport
//! error.  The engine's retry policy keys off [`TransferError::is_transient`],
//! and the cache propagates the same value to every coalesced waiter, so the
//! type is `Clone`.

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransferError {
    /// Network-level failure (connect refused, reset, timeout).  Retried
    /// with exponential backoff.
    #[error("connection error: {0}")]
    Connection(String),

    /// Credentials rejected.  Permanent until configuration changes; the
    /// entry or source is marked failed and not retried automatically.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// The remote entry vanished between listing and fetch.  Skipped and
    /// logged, never a pass failure.
    #[error("not found: {0}")]
    NotFound(String),

    /// Cache or disk full after eviction was attempted.  Fatal for the
    /// operation that hit it.
    #[error("capacity exceeded: {0}")]
    Capacity(String),

    /// Malformed source configuration.  Rejected at registration; never
    /// reaches the engine.
    #[error("invalid configuration: {0}")]
    Validation(String),

    /// Cooperative stop.  Not a failure; the task ends with partial results.
    #[error("operation cancelled")]
    Cancelled,
}

impl TransferError {
    /// Whether the engine's retry-with-backoff policy applies.
    pub fn is_transient(&self) -> bool {
        matches!(self, TransferError::Connection(_))
    }

    /// Classify an I/O error.  Out-of-space maps to `Capacity`, everything
    /// else to `Connection` so it goes through the normal retry path.
    pub fn from_io(err: &std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => TransferError::NotFound(err.to_string()),
            std::io::ErrorKind::PermissionDenied => TransferError::Auth(err.to_string()),
            std::io::ErrorKind::StorageFull => TransferError::Capacity(err.to_string()),
            _ => TransferError::Connection(err.to_string()),
        }
    }

    /// Classify a reqwest error.  Timeouts and connect failures are
    /// transient; 401/403 are auth; 404 is not-found; other HTTP statuses
    /// are treated as transient upstream trouble.
    pub fn from_reqwest(err: &reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return Self::from_http_status(status.as_u16(), &err.to_string());
        }
        TransferError::Connection(err.to_string())
    }

    /// Classify a bare HTTP status code.
    pub fn from_http_status(status: u16, detail: &str) -> Self {
        match status {
            401 | 403 => TransferError::Auth(format!("HTTP {status}: {detail}")),
            404 | 410 => TransferError::NotFound(format!("HTTP {status}: {detail}")),
            _ => TransferError::Connection(format!("HTTP {status}: {detail}")),
        }
    }
}
