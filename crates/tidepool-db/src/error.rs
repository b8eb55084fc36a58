//! # Database Error Types
//!
//! Error types for local store operations.
//!
//! ## Error Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Error Propagation                                    │
//! │                                                                         │
//! │  SQLite Error (sqlx::Error)          CoreError (validation, records)   │
//! │       │                                   │                             │
//! │       └──────────────┬────────────────────┘                             │
//! │                      ▼                                                  │
//! │  DbError (this module) ← Adds table/key context and categorization     │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  Caller of LocalTable / SyncError in tidepool-sync                     │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;
use tidepool_core::{CoreError, ValidationError};

/// Database operation errors.
#[derive(Debug, Error)]
pub enum DbError {
    /// Record not found.
    ///
    /// ## When This Occurs
    /// - `update()` on a key that does not exist
    /// - `get_required()` on a missing key
    #[error("Record not found in '{table}': {key}")]
    NotFound { table: String, key: String },

    /// Key already exists.
    ///
    /// ## When This Occurs
    /// - `add()` with a key that is already stored
    /// - `bulk_add()` where any key exists or repeats within the batch
    #[error("Duplicate key in '{table}': '{key}' already exists")]
    DuplicateKey { table: String, key: String },

    /// The store predates a structure this operation needs.
    ///
    /// ## When This Occurs
    /// - The change log or sync metadata table is missing
    /// - Migrations were disabled and never applied
    #[error("Store upgrade required: missing '{0}'")]
    UpgradeRequired(String),

    /// Table was not declared in the database configuration.
    #[error("Unknown table: {0}")]
    UnknownTable(String),

    /// Invalid record, key or schema.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Stored JSON could not be read or written.
    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// Database connection failed.
    ///
    /// ## When This Occurs
    /// - Database file doesn't exist and can't be created
    /// - File permissions issue
    /// - Disk full
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Migration failed.
    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    /// Query execution failed.
    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// Transaction failed.
    #[error("Transaction failed: {0}")]
    TransactionFailed(String),

    /// Pool exhausted (all connections in use).
    #[error("Connection pool exhausted")]
    PoolExhausted,

    /// Internal database error.
    #[error("Internal database error: {0}")]
    Internal(String),
}

impl DbError {
    /// Creates a NotFound error for a table and key.
    pub fn not_found(table: impl Into<String>, key: impl Into<String>) -> Self {
        DbError::NotFound {
            table: table.into(),
            key: key.into(),
        }
    }

    /// Creates a DuplicateKey error.
    pub fn duplicate(table: impl Into<String>, key: impl Into<String>) -> Self {
        DbError::DuplicateKey {
            table: table.into(),
            key: key.into(),
        }
    }

    /// Returns true for errors caused by the caller's input rather than storage.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            DbError::NotFound { .. }
                | DbError::DuplicateKey { .. }
                | DbError::UnknownTable(_)
                | DbError::Core(_)
        )
    }
}

impl From<ValidationError> for DbError {
    fn from(err: ValidationError) -> Self {
        DbError::Core(CoreError::Validation(err))
    }
}

impl From<serde_json::Error> for DbError {
    fn from(err: serde_json::Error) -> Self {
        DbError::Serialization(err.to_string())
    }
}

/// Convert sqlx errors to DbError.
///
/// ## Error Mapping
/// ```text
/// sqlx::Error::RowNotFound    → DbError::NotFound
/// "no such table: X"          → DbError::UpgradeRequired(X)
/// "UNIQUE constraint failed"  → DbError::DuplicateKey
/// sqlx::Error::PoolTimedOut   → DbError::PoolExhausted
/// Other                       → DbError::Internal
/// ```
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => DbError::NotFound {
                table: "unknown".to_string(),
                key: "unknown".to_string(),
            },

            sqlx::Error::Database(db_err) => {
                let msg = db_err.message();

                if let Some(table) = msg.strip_prefix("no such table: ") {
                    DbError::UpgradeRequired(table.trim().to_string())
                } else if msg.contains("UNIQUE constraint failed") {
                    let table = msg
                        .split("UNIQUE constraint failed: ")
                        .nth(1)
                        .unwrap_or("unknown")
                        .to_string();
                    DbError::DuplicateKey {
                        table,
                        key: "unknown".to_string(),
                    }
                } else {
                    DbError::QueryFailed(msg.to_string())
                }
            }

            sqlx::Error::PoolTimedOut => DbError::PoolExhausted,

            sqlx::Error::PoolClosed => DbError::ConnectionFailed("Pool is closed".to_string()),

            _ => DbError::Internal(err.to_string()),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for DbError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        DbError::MigrationFailed(err.to_string())
    }
}

/// Result type for database operations.
pub type DbResult<T> = Result<T, DbError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DbError::not_found("todos", "42");
        assert_eq!(err.to_string(), "Record not found in 'todos': 42");

        let err = DbError::duplicate("todos", "42");
        assert!(err.to_string().contains("already exists"));

        let err = DbError::UpgradeRequired("change_log".into());
        assert_eq!(err.to_string(), "Store upgrade required: missing 'change_log'");
    }

    #[test]
    fn test_client_errors() {
        assert!(DbError::not_found("t", "k").is_client_error());
        assert!(DbError::UnknownTable("t".into()).is_client_error());
        assert!(!DbError::PoolExhausted.is_client_error());
        assert!(!DbError::UpgradeRequired("change_log".into()).is_client_error());
    }
}
