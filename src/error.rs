//! Error types for the offline pipeline.
//!
//! Three layers: `StoreError` for the local SQLite store, `RemoteError` for
//! calls against the remote datastore, and `SyncError` for failures that
//! abort a whole sync run. Per-item remote failures never surface as
//! `SyncError`; they are recorded on the queue item instead.

use std::sync::PoisonError;
use thiserror::Error;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialize: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("database connection lock poisoned")]
    Poisoned,

    #[error("{entity} '{key}' not found in store {store_id}")]
    NotFound {
        entity: &'static str,
        key: String,
        store_id: String,
    },

    #[error("invalid mutation: {0}")]
    Invalid(String),

    #[error("unknown {kind} value in local store: {value}")]
    Corrupt { kind: &'static str, value: String },
}

impl<T> From<PoisonError<T>> for StoreError {
    fn from(_: PoisonError<T>) -> Self {
        StoreError::Poisoned
    }
}

/// Failure reported by the remote datastore (or the transport to it).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    #[error("Cannot reach remote store: {0}")]
    Unreachable(String),

    #[error("Remote store server error (HTTP {status}): {message}")]
    Server { status: u16, message: String },

    #[error("{message} (HTTP {status})")]
    Rejected { status: u16, message: String },

    #[error("Remote store refused credentials: {0}")]
    Unauthorized(String),

    #[error("Invalid response from remote store: {0}")]
    InvalidResponse(String),

    /// A referenced record only exists locally so far (its create has not
    /// synced yet).
    #[error("{0}")]
    Unresolved(String),
}

impl RemoteError {
    /// Worth retrying unchanged later.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RemoteError::Unreachable(_)
                | RemoteError::Server { .. }
                | RemoteError::InvalidResponse(_)
                | RemoteError::Unresolved(_)
        )
    }

    /// The remote rejected the data itself; retrying identical data fails again.
    pub fn is_validation(&self) -> bool {
        matches!(self, RemoteError::Rejected { .. })
    }

    /// Failures that make every other item in the run pointless.
    pub fn is_systemic(&self) -> bool {
        matches!(self, RemoteError::Unauthorized(_))
    }
}

/// Failure that aborts an entire sync run. Unprocessed items stay pending.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("remote store unavailable: {0}")]
    Offline(RemoteError),

    #[error("remote store refused credentials: {0}")]
    Unauthorized(String),

    #[error("local store failure: {0}")]
    Store(#[from] StoreError),
}

impl From<RemoteError> for SyncError {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::Unauthorized(msg) => SyncError::Unauthorized(msg),
            other => SyncError::Offline(other),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("parse config {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid value for {key}: {value}")]
    InvalidEnv { key: String, value: String },

    #[error("{0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_error_classification() {
        let offline = RemoteError::Unreachable("connection refused".into());
        let server = RemoteError::Server {
            status: 503,
            message: "unavailable".into(),
        };
        let rejected = RemoteError::Rejected {
            status: 409,
            message: "duplicate key value violates unique constraint".into(),
        };
        let auth = RemoteError::Unauthorized("JWT expired".into());

        assert!(offline.is_transient());
        assert!(server.is_transient());
        assert!(!rejected.is_transient());
        assert!(rejected.is_validation());
        assert!(auth.is_systemic());
        assert!(!auth.is_transient());
    }

    #[test]
    fn test_sync_error_from_remote_keeps_auth_distinct() {
        let err: SyncError = RemoteError::Unauthorized("bad key".into()).into();
        assert!(matches!(err, SyncError::Unauthorized(_)));

        let err: SyncError = RemoteError::Unreachable("dns".into()).into();
        assert!(matches!(err, SyncError::Offline(_)));
    }
}
