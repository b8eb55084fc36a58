//! # Error Types
//!
//! Domain-specific error types for tidepool-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  tidepool-core errors (this file)                                      │
//! │  ├── CoreError        - Record / conflict errors                       │
//! │  └── ValidationError  - Input validation failures                      │
//! │                                                                         │
//! │  tidepool-db errors (separate crate)                                   │
//! │  └── DbError          - Storage failures (NotFound, DuplicateKey, ...) │
//! │                                                                         │
//! │  tidepool-sync errors (separate crate)                                 │
//! │  └── SyncError        - Remote, config and engine failures             │
//! │                                                                         │
//! │  Flow: ValidationError → CoreError → DbError → SyncError               │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

// =============================================================================
// Core Error
// =============================================================================

/// Core data model errors.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A record is not shaped the way a table expects.
    ///
    /// ## When This Occurs
    /// - The value passed to `add`/`put` is not a JSON object
    /// - A partial update is not a JSON object
    #[error("Invalid record for table '{table}': {reason}")]
    InvalidRecord { table: String, reason: String },

    /// A record's key field is set to something that cannot be a key
    /// (empty string, boolean, object or array).
    #[error("Record in table '{table}' has no usable value for key field '{field}'")]
    MissingKey { table: String, field: String },

    /// A custom conflict handler failed.
    ///
    /// ## User Workflow
    /// ```text
    /// pull() receives remote record
    ///      │
    ///      ▼
    /// detect_conflict → Some(conflict)
    ///      │
    ///      ▼
    /// custom handler returns Err("merge failed")
    ///      │
    ///      ▼
    /// ConflictResolutionFailed { table, key, reason }
    ///      │
    ///      ▼
    /// table marked `error`, pull continues with next table
    /// ```
    #[error("Conflict resolution failed for {table}/{key}: {reason}")]
    ConflictResolutionFailed {
        table: String,
        key: String,
        reason: String,
    },

    /// Validation error (wraps ValidationError).
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

impl CoreError {
    /// Creates an InvalidRecord error.
    pub fn invalid_record(table: impl Into<String>, reason: impl Into<String>) -> Self {
        CoreError::InvalidRecord {
            table: table.into(),
            reason: reason.into(),
        }
    }
}

// =============================================================================
// Validation Error
// =============================================================================

/// Input validation errors.
///
/// Raised before anything touches storage.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// A required field is missing or empty.
    #[error("{field} is required")]
    Required { field: String },

    /// Field value is too long.
    #[error("{field} must be at most {max} characters")]
    TooLong { field: String, max: usize },

    /// Invalid format (e.g., table name with spaces).
    #[error("{field} has invalid format: {reason}")]
    InvalidFormat { field: String, reason: String },

    /// Value is reserved for internal use.
    #[error("{field} '{value}' is reserved")]
    Reserved { field: String, value: String },

    /// Duplicate value (e.g., a table declared twice).
    #[error("{field} '{value}' already exists")]
    Duplicate { field: String, value: String },
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// Convenience type alias for Results with CoreError.
pub type CoreResult<T> = Result<T, CoreError>;

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = CoreError::ConflictResolutionFailed {
            table: "todos".to_string(),
            key: "t-1".to_string(),
            reason: "merge failed".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Conflict resolution failed for todos/t-1: merge failed"
        );
    }

    #[test]
    fn test_validation_error_messages() {
        let err = ValidationError::Required {
            field: "table".to_string(),
        };
        assert_eq!(err.to_string(), "table is required");

        let err = ValidationError::Reserved {
            field: "table".to_string(),
            value: "_changes".to_string(),
        };
        assert_eq!(err.to_string(), "table '_changes' is reserved");
    }

    #[test]
    fn test_validation_converts_to_core_error() {
        let validation_err = ValidationError::Required {
            field: "key".to_string(),
        };
        let core_err: CoreError = validation_err.into();
        assert!(matches!(core_err, CoreError::Validation(_)));
    }
}
