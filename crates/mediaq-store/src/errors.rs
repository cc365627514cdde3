//! Error types for the storage layer.
//!
//! [`StorageError`] is returned by every operation in this crate. Engine
//! errors (including constraint violations) are carried unwrapped in
//! [`StorageError::Sqlite`] so callers can interpret them directly.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// `SQLite` engine error, passed through unchanged.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Transaction protocol misuse (begin while open, commit/rollback while closed).
    #[error("transaction state error: {0}")]
    TransactionState(String),

    /// No connection became available before the acquire deadline.
    #[error("timed out after {}ms waiting for a pooled connection", waited.as_millis())]
    PoolTimeout {
        /// How long the caller waited.
        waited: Duration,
    },

    /// The pool has been shut down.
    #[error("connection pool is shutting down")]
    PoolShuttingDown,

    /// Update or delete target is absent.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Entity (table) name.
        entity: &'static str,
        /// Primary key that was looked up.
        id: String,
    },

    /// Schema migration failed.
    #[error("migration v{version} failed: {message}")]
    Migration {
        /// Version of the failing migration.
        version: u32,
        /// Describes what went wrong.
        message: String,
    },

    /// Query criteria could not be turned into SQL.
    #[error("invalid criteria: {0}")]
    InvalidCriteria(String),

    /// Batch input was malformed (e.g. rows with differing columns).
    #[error("invalid batch: {0}")]
    InvalidBatch(String),

    /// Configuration value out of range.
    #[error("invalid storage config: {0}")]
    InvalidConfig(String),

    /// A stored value failed typed validation while mapping a row.
    #[error("row mapping error: {0}")]
    Mapping(String),

    /// Internal error (e.g. a blocking worker panicked).
    #[error("internal error: {0}")]
    Internal(String),
}

impl StorageError {
    /// Shorthand for a [`StorageError::NotFound`].
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Whether this is a [`StorageError::NotFound`].
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Whether the engine rejected a write because of a constraint.
    pub fn is_constraint_violation(&self) -> bool {
        matches!(
            self,
            Self::Sqlite(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation
        )
    }

    /// Whether a caller may reasonably retry (with backoff).
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::PoolTimeout { .. } => true,
            Self::Sqlite(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

/// Convenience type alias for storage results.
pub type Result<T> = std::result::Result<T, StorageError>;

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn sqlite_failure(code: i32) -> rusqlite::Error {
        rusqlite::Error::SqliteFailure(rusqlite::ffi::Error::new(code), None)
    }

    #[test]
    fn sqlite_error_display() {
        let err = StorageError::Sqlite(rusqlite::Error::QueryReturnedNoRows);
        assert!(err.to_string().contains("sqlite error"));
    }

    #[test]
    fn pool_timeout_display() {
        let err = StorageError::PoolTimeout {
            waited: Duration::from_millis(250),
        };
        assert_eq!(
            err.to_string(),
            "timed out after 250ms waiting for a pooled connection"
        );
    }

    #[test]
    fn not_found_display() {
        let err = StorageError::not_found("queue", 42);
        assert_eq!(err.to_string(), "queue not found: 42");
        assert!(err.is_not_found());
    }

    #[test]
    fn migration_error_display() {
        let err = StorageError::Migration {
            version: 3,
            message: "table already exists".into(),
        };
        assert_eq!(err.to_string(), "migration v3 failed: table already exists");
    }

    #[test]
    fn constraint_violation_detected() {
        let err = StorageError::Sqlite(sqlite_failure(rusqlite::ffi::SQLITE_CONSTRAINT));
        assert!(err.is_constraint_violation());
        assert!(!err.is_retryable());
    }

    #[test]
    fn busy_and_timeout_are_retryable() {
        let busy = StorageError::Sqlite(sqlite_failure(rusqlite::ffi::SQLITE_BUSY));
        assert!(busy.is_retryable());
        assert!(
            StorageError::PoolTimeout {
                waited: Duration::ZERO
            }
            .is_retryable()
        );
        assert!(!StorageError::PoolShuttingDown.is_retryable());
        assert!(!StorageError::TransactionState("x".into()).is_retryable());
    }

    #[test]
    fn from_rusqlite_error() {
        let err: StorageError = rusqlite::Error::QueryReturnedNoRows.into();
        assert!(matches!(err, StorageError::Sqlite(_)));
    }
}
