use sea_orm::{DbErr, SqlErr};
use thiserror::Error;

use crate::storage::StorageError;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    Conflict(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Object store error: {0}")]
    UpstreamStorage(#[from] StorageError),

    #[error("Transaction error: {0}")]
    Transaction(#[from] DbErr),

    #[error("Deadline exceeded: {0}")]
    DeadlineExceeded(String),

    #[error("Unreadable stored record: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Coarse classification callers branch on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Conflict,
    InvalidArgument,
    UpstreamStorage,
    Transaction,
    DeadlineExceeded,
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::NotFound(_) => ErrorKind::NotFound,
            StoreError::Conflict(_) => ErrorKind::Conflict,
            StoreError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            StoreError::UpstreamStorage(_) => ErrorKind::UpstreamStorage,
            StoreError::Transaction(_) | StoreError::Serialization(_) => ErrorKind::Transaction,
            StoreError::DeadlineExceeded(_) => ErrorKind::DeadlineExceeded,
        }
    }

    /// Whether repeating the same call unchanged can succeed.
    ///
    /// Conflicts need a different name, invalid arguments are caller bugs and
    /// a missing record stays missing. Storage, database and deadline failures
    /// are transient.
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::UpstreamStorage(StorageError::InvalidKey(_)) => false,
            StoreError::Serialization(_) => false,
            _ => matches!(
                self.kind(),
                ErrorKind::UpstreamStorage | ErrorKind::Transaction | ErrorKind::DeadlineExceeded
            ),
        }
    }

    /// Translate a unique-constraint violation into `Conflict`, leaving every
    /// other database error untouched.
    pub(crate) fn from_db_conflict(err: DbErr, what: impl FnOnce() -> String) -> Self {
        if is_unique_violation(&err) {
            StoreError::Conflict(what())
        } else {
            StoreError::Transaction(err)
        }
    }
}

fn is_unique_violation(err: &DbErr) -> bool {
    matches!(err.sql_err(), Some(SqlErr::UniqueConstraintViolation(_)))
}

pub type Result<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(!StoreError::Conflict("a".into()).is_retryable());
        assert!(!StoreError::InvalidArgument("project id".into()).is_retryable());
        assert!(!StoreError::NotFound("x".into()).is_retryable());
        assert!(StoreError::DeadlineExceeded("upload".into()).is_retryable());
        assert!(StoreError::UpstreamStorage(StorageError::Request("503".into())).is_retryable());
        assert!(!StoreError::UpstreamStorage(StorageError::InvalidKey("../x".into())).is_retryable());
        assert!(StoreError::Transaction(DbErr::Custom("locked".into())).is_retryable());
    }

    #[test]
    fn test_kind_mapping() {
        let err = StoreError::from(StorageError::NotFound("k".into()));
        assert_eq!(err.kind(), ErrorKind::UpstreamStorage);
        let err = StoreError::from_db_conflict(DbErr::Custom("boom".into()), || "dup".into());
        assert_eq!(err.kind(), ErrorKind::Transaction);
    }
}
