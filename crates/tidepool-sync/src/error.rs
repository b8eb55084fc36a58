//! # Sync Error Types
//!
//! Error types for sync operations.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Sync Error Categories                             │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │     Remote      │  │     Local store         │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  InvalidConfig  │  │  RemoteUnavail. │  │  Database               │ │
//! │  │  ConfigLoad     │  │  ConflictRes.   │  │  UnknownTable           │ │
//! │  │  ConfigSave     │  │  Failed         │  │                         │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  push/pull isolate these per table; push_all and callers see them.     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;
use tidepool_core::CoreError;
use tidepool_db::DbError;

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Sync error type covering all possible sync failures.
#[derive(Debug, Error)]
pub enum SyncError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid sync configuration.
    #[error("Invalid sync configuration: {0}")]
    InvalidConfig(String),

    /// Failed to load config file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    /// Failed to save config file.
    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    // =========================================================================
    // Remote Errors
    // =========================================================================
    /// The remote backend rejected or could not serve a request.
    ///
    /// ## When This Occurs
    /// - Network failure during upsert/delete/select
    /// - Backend returned an error for one table
    #[error("Remote unavailable for '{table}': {message}")]
    RemoteUnavailable { table: String, message: String },

    /// A custom conflict handler failed.
    #[error("Conflict resolution failed for {table}/{key}: {reason}")]
    ConflictResolutionFailed {
        table: String,
        key: String,
        reason: String,
    },

    // =========================================================================
    // Local Errors
    // =========================================================================
    /// Local store operation failed.
    #[error("Database error: {0}")]
    Database(#[from] DbError),

    /// Table is not part of the sync configuration.
    #[error("Table '{0}' is not configured for sync")]
    UnknownTable(String),

    /// Failed to serialize a payload.
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Internal sync error.
    #[error("Internal error: {0}")]
    Internal(String),

    /// The store was closed.
    #[error("Local store is closed")]
    ShuttingDown,
}

// =============================================================================
// Error Conversions
// =============================================================================

impl SyncError {
    /// Creates a RemoteUnavailable error.
    pub fn remote(table: impl Into<String>, message: impl Into<String>) -> Self {
        SyncError::RemoteUnavailable {
            table: table.into(),
            message: message.into(),
        }
    }
}

impl From<CoreError> for SyncError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::ConflictResolutionFailed { table, key, reason } => {
                SyncError::ConflictResolutionFailed { table, key, reason }
            }
            other => SyncError::Database(DbError::Core(other)),
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::SerializationFailed(err.to_string())
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for SyncError {
    fn from(err: toml::ser::Error) -> Self {
        SyncError::ConfigSaveFailed(err.to_string())
    }
}

// =============================================================================
// Error Categorization (for retry logic)
// =============================================================================

impl SyncError {
    /// Returns true if the operation can be retried later.
    ///
    /// ## Retryable Errors
    /// - Remote unavailable (network issues, backend outage)
    /// - Pool exhaustion in the local store
    ///
    /// ## Non-Retryable Errors
    /// - Configuration errors
    /// - Conflict handler failures
    /// - Invalid records
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::RemoteUnavailable { .. } | SyncError::Database(DbError::PoolExhausted)
        )
    }

    /// Returns true if this error indicates a configuration problem.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidConfig(_)
                | SyncError::ConfigLoadFailed(_)
                | SyncError::ConfigSaveFailed(_)
                | SyncError::UnknownTable(_)
        )
    }
}
