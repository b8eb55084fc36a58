//! # Domain Types
//!
//! Core types shared by the store, the change log and the sync engine.
//!
//! ## Type Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Domain Types                                    │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │    Record       │   │  ChangeRecord   │   │  SyncMetadata   │       │
//! │  │  ─────────────  │   │  ─────────────  │   │  ─────────────  │       │
//! │  │  JSON object    │   │  id (UUID)      │   │  table          │       │
//! │  │  one key field  │   │  table, key     │   │  last_sync_ts   │       │
//! │  │                 │   │  operation      │   │  pending        │       │
//! │  │                 │   │  data?, synced  │   │  sync_status    │       │
//! │  └─────────────────┘   └─────────────────┘   └─────────────────┘       │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │  TableSchema    │   │ ChangeOperation │   │   SyncState     │       │
//! │  │  ─────────────  │   │  ─────────────  │   │  ─────────────  │       │
//! │  │  primary_key    │   │  Create         │   │  Idle           │       │
//! │  │  auto_increment │   │  Update         │   │  Syncing        │       │
//! │  │  indexes        │   │  Delete         │   │  Error          │       │
//! │  └─────────────────┘   └─────────────────┘   └─────────────────┘       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Timestamps
//! All timestamps are milliseconds since the Unix epoch (`i64`). Record-level
//! `createdAt`/`updatedAt` autofill writes RFC 3339 strings instead, so that
//! they sort chronologically as plain strings.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{CoreError, CoreResult, ValidationError};
use crate::query::get_field;
use crate::validation::{validate_field_path, validate_table_name};

// =============================================================================
// Primitive Aliases
// =============================================================================

/// A stored record: a schema-less JSON object.
pub type Record = Value;

/// Primary key of a record, always in its text form.
pub type RecordKey = String;

/// Milliseconds since the Unix epoch.
pub type Timestamp = i64;

/// Field written on create when timestamp autofill is enabled.
pub const CREATED_AT_FIELD: &str = "createdAt";

/// Field written on every local write when timestamp autofill is enabled.
pub const UPDATED_AT_FIELD: &str = "updatedAt";

/// Returns the current time in epoch milliseconds.
pub fn now_millis() -> Timestamp {
    Utc::now().timestamp_millis()
}

/// Formats an epoch-millisecond timestamp as RFC 3339 with millisecond precision.
pub fn format_timestamp(ts: Timestamp) -> String {
    DateTime::<Utc>::from_timestamp_millis(ts)
        .unwrap_or_default()
        .to_rfc3339_opts(SecondsFormat::Millis, true)
}

// =============================================================================
// Change Operation
// =============================================================================

/// Kind of mutation captured by a [`ChangeRecord`].
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOperation {
    /// Record inserted through `add`.
    Create,
    /// Record written through `put` or `update`.
    Update,
    /// Record removed through `delete`.
    Delete,
}

impl ChangeOperation {
    /// Returns the lowercase name stored in the change log.
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeOperation::Create => "create",
            ChangeOperation::Update => "update",
            ChangeOperation::Delete => "delete",
        }
    }

    /// Returns true for operations that carry record data.
    pub fn is_upsert(&self) -> bool {
        !matches!(self, ChangeOperation::Delete)
    }
}

impl fmt::Display for ChangeOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChangeOperation {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(ChangeOperation::Create),
            "update" => Ok(ChangeOperation::Update),
            "delete" => Ok(ChangeOperation::Delete),
            other => Err(ValidationError::InvalidFormat {
                field: "operation".to_string(),
                reason: format!("unknown change operation '{}'", other),
            }),
        }
    }
}

// =============================================================================
// Change Record
// =============================================================================

/// One entry of the append-only change log.
///
/// ## Lifecycle
/// ```text
/// local mutation ──► ChangeRecord { synced: false }
///                          │
///                          │  push() uploads batch
///                          ▼
///                    ChangeRecord { synced: true }   (never reverses)
///                          │
///                          │  clear_synced_changes()
///                          ▼
///                       deleted
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    /// Unique change id (UUID v4).
    pub id: String,
    /// Local table name.
    pub table: String,
    /// Key of the mutated record.
    pub key: RecordKey,
    /// What happened.
    pub operation: ChangeOperation,
    /// Record state after the mutation; `None` for deletes.
    pub data: Option<Record>,
    /// When the mutation happened (epoch ms).
    pub timestamp: Timestamp,
    /// Whether the change has reached the remote backend.
    pub synced: bool,
}

impl ChangeRecord {
    /// Creates a new, unsynced change entry stamped with the current time.
    pub fn new(
        table: impl Into<String>,
        key: impl Into<RecordKey>,
        operation: ChangeOperation,
        data: Option<Record>,
    ) -> Self {
        ChangeRecord {
            id: Uuid::new_v4().to_string(),
            table: table.into(),
            key: key.into(),
            operation,
            data: if operation.is_upsert() { data } else { None },
            timestamp: now_millis(),
            synced: false,
        }
    }
}

// =============================================================================
// Sync Metadata
// =============================================================================

/// Per-table sync status.
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    /// Last sync cycle finished cleanly (or none has run yet).
    #[default]
    Idle,
    /// A sync cycle is touching this table right now.
    Syncing,
    /// The last sync cycle for this table failed.
    Error,
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncState::Idle => write!(f, "idle"),
            SyncState::Syncing => write!(f, "syncing"),
            SyncState::Error => write!(f, "error"),
        }
    }
}

/// Sync bookkeeping for one table.
///
/// Created lazily on the first sync of a table, never deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncMetadata {
    /// Local table name.
    pub table: String,
    /// Start time of the last successful pull (epoch ms, 0 = never).
    pub last_sync_timestamp: Timestamp,
    /// Opaque remote version marker, if the backend reports one.
    pub last_remote_version: Option<String>,
    /// Unsynced change entries at the end of the last cycle.
    pub pending_changes: i64,
    /// Current status.
    pub sync_status: SyncState,
}

impl SyncMetadata {
    /// Metadata for a table that has never been synced.
    pub fn new(table: impl Into<String>) -> Self {
        SyncMetadata {
            table: table.into(),
            last_sync_timestamp: 0,
            last_remote_version: None,
            pending_changes: 0,
            sync_status: SyncState::Idle,
        }
    }

    /// Returns `None` when the table has never completed a pull.
    pub fn since(&self) -> Option<Timestamp> {
        (self.last_sync_timestamp > 0).then_some(self.last_sync_timestamp)
    }
}

// =============================================================================
// Table Schema
// =============================================================================

/// Declared shape of one application table.
///
/// ## Example
/// ```rust
/// use tidepool_core::TableSchema;
///
/// let todos = TableSchema::new("todos")
///     .auto_increment()
///     .index("done")
///     .index("dueDate")
///     .timestamps();
///
/// assert_eq!(todos.primary_key, "id");
/// assert!(todos.has_index("done"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    /// Table name.
    pub name: String,
    /// Field holding the primary key. Default: `id`.
    pub primary_key: String,
    /// Generate integer keys from a per-table sequence instead of UUIDs.
    pub auto_increment: bool,
    /// Fields with a secondary index.
    pub indexes: Vec<String>,
    /// Fill `createdAt`/`updatedAt` on local writes.
    pub timestamps: bool,
}

impl TableSchema {
    /// Creates a schema with primary key `id`, UUID keys and no indexes.
    pub fn new(name: impl Into<String>) -> Self {
        TableSchema {
            name: name.into(),
            primary_key: "id".to_string(),
            auto_increment: false,
            indexes: Vec::new(),
            timestamps: false,
        }
    }

    /// Sets the primary key field.
    pub fn primary_key(mut self, field: impl Into<String>) -> Self {
        self.primary_key = field.into();
        self
    }

    /// Enables auto-increment integer keys.
    pub fn auto_increment(mut self) -> Self {
        self.auto_increment = true;
        self
    }

    /// Adds a secondary index.
    pub fn index(mut self, field: impl Into<String>) -> Self {
        self.indexes.push(field.into());
        self
    }

    /// Enables `createdAt`/`updatedAt` autofill.
    pub fn timestamps(mut self) -> Self {
        self.timestamps = true;
        self
    }

    /// Returns true if `field` has a secondary index.
    pub fn has_index(&self, field: &str) -> bool {
        self.indexes.iter().any(|f| f == field)
    }

    /// Checks the table name, key field and index fields.
    pub fn validate(&self) -> CoreResult<()> {
        validate_table_name(&self.name)?;
        validate_field_path(&self.primary_key)?;

        let mut seen = HashSet::new();
        for field in &self.indexes {
            validate_field_path(field)?;
            if !seen.insert(field.as_str()) {
                return Err(ValidationError::Duplicate {
                    field: "index".to_string(),
                    value: field.clone(),
                }
                .into());
            }
        }

        Ok(())
    }

    /// Reads the primary key from a record, if present.
    pub fn extract_key(&self, record: &Record) -> Option<RecordKey> {
        get_field(record, &self.primary_key).and_then(key_from_value)
    }
}

// =============================================================================
// Record Helpers
// =============================================================================

/// Converts a JSON key value to its text form.
///
/// Strings are taken as-is, integers and floats use their decimal form.
/// Empty strings, null, booleans and containers are not keys.
pub fn key_from_value(value: &Value) -> Option<RecordKey> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Borrows a record as a JSON object.
pub fn as_object_mut<'a>(table: &str, record: &'a mut Record) -> CoreResult<&'a mut Map<String, Value>> {
    record
        .as_object_mut()
        .ok_or_else(|| CoreError::invalid_record(table, "record must be a JSON object"))
}

/// Writes `value` at a dot-separated path, creating intermediate objects.
pub fn set_field(record: &mut Record, path: &str, value: Value) {
    let segments: Vec<&str> = path.split('.').collect();
    let Some((last, parents)) = segments.split_last() else {
        return;
    };

    let mut current = record;
    for segment in parents {
        if !current.is_object() {
            *current = Value::Object(Map::new());
        }
        current = match current {
            Value::Object(map) => map
                .entry(segment.to_string())
                .or_insert_with(|| Value::Object(Map::new())),
            _ => return,
        };
    }

    if !current.is_object() {
        *current = Value::Object(Map::new());
    }
    if let Value::Object(map) = current {
        map.insert(last.to_string(), value);
    }
}

/// Applies `createdAt`/`updatedAt` autofill.
///
/// `createdAt` is only written when absent, `updatedAt` is always refreshed.
pub fn apply_timestamps(map: &mut Map<String, Value>, now: Timestamp) {
    let stamp = Value::String(format_timestamp(now));
    map.entry(CREATED_AT_FIELD.to_string())
        .or_insert_with(|| stamp.clone());
    map.insert(UPDATED_AT_FIELD.to_string(), stamp);
}

/// Shallow-merges `changes` over `base`.
///
/// Top-level fields of `changes` replace those of `base`. Both must be objects.
pub fn shallow_merge(table: &str, base: &Record, changes: &Record) -> CoreResult<Record> {
    let mut merged = base.clone();
    let target = as_object_mut(table, &mut merged)?;
    let patch = changes
        .as_object()
        .ok_or_else(|| CoreError::invalid_record(table, "changes must be a JSON object"))?;
    for (field, value) in patch {
        target.insert(field.clone(), value.clone());
    }
    Ok(merged)
}

// =============================================================================
// Unit Tests
// =============================================================================
