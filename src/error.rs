//! Crate-wide error type for the cache-backed file core.
//!
//! Mirrors the teacher's layered error design (`QueueError`/`DownloadError`):
//! typed variants for every condition callers need to branch on, plus an
//! `Internal` catch-all for database/IO failures that are never meant to be
//! surfaced raw (spec §7) — the background workers log and requeue around
//! `Internal`, they never propagate it to a reader/writer.

use std::fmt;

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Classification for the opaque `Internal` variant, used the way the
/// teacher's `QueueDbErrorKind` lets callers branch on retryability without
/// matching on the underlying driver error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InternalErrorKind {
    /// The durable store is unreachable or returned a transient failure.
    StoreUnavailable,
    /// Local filesystem I/O failed (temp file creation, read, write).
    Io,
    /// Unclassified internal failure.
    Other,
}

impl fmt::Display for InternalErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::StoreUnavailable => "store_unavailable",
            Self::Io => "io",
            Self::Other => "other",
        };
        write!(f, "{label}")
    }
}

/// Errors surfaced by the cache-backed file core.
///
/// Variants map 1:1 to spec §7's error kinds. `Internal` wraps database/IO
/// failures that the background subsystem handles itself (requeue, retry,
/// offline pending-list) — it is never the terminal error returned to a
/// reader or writer; see [`CoreError::Internal`] docs.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Data could not be loaded within the configured wait bound, or the
    /// segment carries a sticky load error from a previous attempt.
    #[error("file offline: {0}")]
    FileOffline(String),

    /// Write attempted on a read-only handle, or a sharing/retention
    /// violation blocked the operation.
    #[error("access denied: {0}")]
    AccessDenied(String),

    /// Write would exceed the configured maximum file size, or an
    /// in-memory segment overflowed without a convertible loader.
    #[error("disk full: {0}")]
    DiskFull(String),

    /// No file exists at the given virtual path.
    #[error("file not found: {0}")]
    FileNotFound(String),

    /// A file already exists where a create-new was requested.
    #[error("file exists: {0}")]
    FileExists(String),

    /// The virtual path exceeds the maximum supported length.
    #[error("file name too long: {0}")]
    FileNameTooLong(String),

    /// A byte-range lock held by another opener conflicts with this request.
    #[error("lock conflict: {0}")]
    LockConflict(String),

    /// Requested sharing mode conflicts with an existing open.
    #[error("sharing violation: {0}")]
    SharingViolation(String),

    /// Operation not implemented by the active loader.
    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// Internal database/IO failure. Never returned from a public read/write
    /// path directly — the background workers classify it, requeue, and
    /// (for saves) keep an in-process pending list until the store recovers,
    /// per spec §7.
    #[error("internal error ({kind}): {message}")]
    Internal {
        /// Coarse classification used to decide requeue vs. log-and-continue.
        kind: InternalErrorKind,
        /// Human-readable detail, never parsed by callers.
        message: String,
    },
}

impl CoreError {
    /// Builds an [`CoreError::Internal`] from a database error, classifying
    /// transient-looking failures as `StoreUnavailable` so the background
    /// workers know to requeue rather than drop the request.
    #[must_use]
    pub fn from_sqlx(err: &sqlx::Error) -> Self {
        let kind = match err {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                InternalErrorKind::StoreUnavailable
            }
            _ => InternalErrorKind::Other,
        };
        Self::Internal {
            kind,
            message: err.to_string(),
        }
    }

    /// Returns `true` when this is an internal error that likely resolves on
    /// retry (store offline, pool exhausted) rather than a structural one.
    #[must_use]
    pub fn is_retryable_internal(&self) -> bool {
        matches!(
            self,
            Self::Internal {
                kind: InternalErrorKind::StoreUnavailable,
                ..
            }
        )
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        Self::from_sqlx(&err)
    }
}

impl From<sqlx::migrate::MigrateError> for CoreError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        Self::Internal {
            kind: InternalErrorKind::StoreUnavailable,
            message: err.to_string(),
        }
    }
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        Self::Internal {
            kind: InternalErrorKind::Io,
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn internal_from_io_is_io_kind() {
        let io_err = std::io::Error::other("disk error");
        let err: CoreError = io_err.into();
        assert!(matches!(
            err,
            CoreError::Internal {
                kind: InternalErrorKind::Io,
                ..
            }
        ));
    }

    #[test]
    fn pool_timeout_is_retryable() {
        let err = CoreError::Internal {
            kind: InternalErrorKind::StoreUnavailable,
            message: "pool timed out".to_string(),
        };
        assert!(err.is_retryable_internal());
    }

    #[test]
    fn file_offline_is_not_retryable_internal() {
        let err = CoreError::FileOffline("timed out waiting for load".to_string());
        assert!(!err.is_retryable_internal());
    }

    #[test]
    fn display_messages_are_human_readable() {
        let err = CoreError::FileNotFound("/docs/report.pdf".to_string());
        assert_eq!(err.to_string(), "file not found: /docs/report.pdf");
    }
}
