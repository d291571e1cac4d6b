//! Error types for the ingestion manager
//!
//! Two layers of errors exist. [`crate::db::DbError`] is internal: transient
//! aborts and unique-constraint violations are consumed by the retry loops in
//! the record store and never reach callers. [`IngestError`] is what escapes
//! the coordinator; a `Db` variant there is by definition permanent.

use std::time::Duration;
use thiserror::Error;

use crate::db::DbError;

/// Result alias for ingestion operations.
pub type Result<T> = std::result::Result<T, IngestError>;

/// Errors surfaced by the ingestion manager.
#[derive(Error, Debug)]
pub enum IngestError {
    /// A downstream service (or a connector that talks to one) is
    /// unavailable. The caller should reschedule the document rather than
    /// fail it; `retry_after` is the suggested delay before retrying.
    #[error("service interruption: {message}")]
    ServiceInterruption {
        message: String,
        retry_after: Duration,
    },

    /// The document data stream failed while being read.
    #[error("document stream failed: {0}")]
    Io(#[from] std::io::Error),

    /// A database failure that survived the internal retry loops.
    #[error(transparent)]
    Db(#[from] DbError),

    /// The lock manager failed to acquire or release a named lock.
    #[error("lock manager failure: {0}")]
    Lock(String),
}

impl IngestError {
    /// A service interruption with no suggested backoff: retry as soon as
    /// the caller gets around to it. Used when a connector is not installed.
    pub fn interruption(message: impl Into<String>) -> Self {
        IngestError::ServiceInterruption {
            message: message.into(),
            retry_after: Duration::ZERO,
        }
    }

    /// A service interruption with a retry-after hint.
    pub fn interruption_after(message: impl Into<String>, retry_after: Duration) -> Self {
        IngestError::ServiceInterruption {
            message: message.into(),
            retry_after,
        }
    }

    pub fn is_service_interruption(&self) -> bool {
        matches!(self, IngestError::ServiceInterruption { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interruption_has_zero_backoff() {
        let err = IngestError::interruption("connector not installed");
        match err {
            IngestError::ServiceInterruption { retry_after, .. } => {
                assert_eq!(retry_after, Duration::ZERO);
            },
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_is_service_interruption() {
        assert!(IngestError::interruption("x").is_service_interruption());
        assert!(!IngestError::Lock("x".into()).is_service_interruption());
    }
}
