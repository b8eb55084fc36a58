//! # Validation Module
//!
//! Input validation for table names, index field paths and record keys.
//!
//! Table names and index fields end up spliced into SQL as identifiers and
//! JSON paths, so they are restricted to a conservative character set here,
//! before anything reaches tidepool-db.
//!
//! ## Usage
//! ```rust
//! use tidepool_core::validation::{validate_table_name, validate_key};
//!
//! validate_table_name("todos").unwrap();
//! validate_key("todo-1").unwrap();
//! ```

use crate::error::ValidationError;

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Maximum length of a table name.
pub const MAX_TABLE_NAME_LEN: usize = 64;

/// Maximum length of a record key.
pub const MAX_KEY_LEN: usize = 512;

// =============================================================================
// Identifier Validators
// =============================================================================

/// Validates a table name.
///
/// ## Rules
/// - Must not be empty
/// - At most 64 characters
/// - Letters, digits and underscores only, not starting with a digit
/// - Must not start with `_` (reserved for internal tables)
///
/// ## Example
/// ```rust
/// use tidepool_core::validation::validate_table_name;
///
/// assert!(validate_table_name("todos").is_ok());
/// assert!(validate_table_name("_changes").is_err());
/// assert!(validate_table_name("my table").is_err());
/// ```
pub fn validate_table_name(name: &str) -> ValidationResult<()> {
    if name.is_empty() {
        return Err(ValidationError::Required {
            field: "table".to_string(),
        });
    }

    if name.len() > MAX_TABLE_NAME_LEN {
        return Err(ValidationError::TooLong {
            field: "table".to_string(),
            max: MAX_TABLE_NAME_LEN,
        });
    }

    if name.starts_with('_') {
        return Err(ValidationError::Reserved {
            field: "table".to_string(),
            value: name.to_string(),
        });
    }

    if name.starts_with(|c: char| c.is_ascii_digit()) {
        return Err(ValidationError::InvalidFormat {
            field: "table".to_string(),
            reason: "must not start with a digit".to_string(),
        });
    }

    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(ValidationError::InvalidFormat {
            field: "table".to_string(),
            reason: "must contain only letters, numbers, and underscores".to_string(),
        });
    }

    Ok(())
}

/// Validates a field path used as a primary key or secondary index.
///
/// ## Rules
/// - Must not be empty
/// - Dot-separated segments of letters, digits and underscores
/// - No empty segments (`a..b`, `.a`, `a.`)
pub fn validate_field_path(path: &str) -> ValidationResult<()> {
    if path.is_empty() {
        return Err(ValidationError::Required {
            field: "field".to_string(),
        });
    }

    let valid = path.split('.').all(|segment| {
        !segment.is_empty()
            && segment
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
    });

    if !valid {
        return Err(ValidationError::InvalidFormat {
            field: "field".to_string(),
            reason: format!("'{}' is not a valid field path", path),
        });
    }

    Ok(())
}

/// Validates a record key.
///
/// ## Rules
/// - Must not be empty
/// - At most 512 bytes
pub fn validate_key(key: &str) -> ValidationResult<()> {
    if key.is_empty() {
        return Err(ValidationError::Required {
            field: "key".to_string(),
        });
    }

    if key.len() > MAX_KEY_LEN {
        return Err(ValidationError::TooLong {
            field: "key".to_string(),
            max: MAX_KEY_LEN,
        });
    }

    Ok(())
}

// =============================================================================
// Unit Tests
// =============================================================================
