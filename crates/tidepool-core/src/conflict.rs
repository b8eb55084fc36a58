//! # Conflict Detection & Resolution
//!
//! Pure decision logic used by the sync engine when a pulled remote record
//! meets an existing local record with the same key.
//!
//! ## Decision Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     Conflict Handling (per record)                      │
//! │                                                                         │
//! │  local ts  = updatedAt ▸ createdAt ▸ now                               │
//! │  remote ts = updatedAt ▸ createdAt ▸ now                               │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  |local − remote| > threshold (1000 ms) ?                              │
//! │       │                                                                 │
//! │       ├── no  ──► no conflict, remote record is kept                   │
//! │       │                                                                 │
//! │       └── yes ──► Conflict ──► strategy                                │
//! │                                 ├── last-write-wins (ties → remote)    │
//! │                                 ├── local-wins                         │
//! │                                 ├── remote-wins                        │
//! │                                 └── custom async handler               │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The `now` fallback means a record without any timestamp field always
//! looks freshly written. Two such records therefore never conflict.

use async_trait::async_trait;
use chrono::DateTime;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::warn;

use crate::error::{CoreError, CoreResult, ValidationError};
use crate::query::get_field;
use crate::types::{now_millis, Record, RecordKey, Timestamp};

/// Default minimum timestamp gap that counts as a conflict.
pub const DEFAULT_CONFLICT_THRESHOLD_MS: i64 = 1000;

// =============================================================================
// Conflict
// =============================================================================

/// Two diverging versions of one record. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    pub table: String,
    pub key: RecordKey,
    pub local: Record,
    pub remote: Record,
    pub local_timestamp: Timestamp,
    pub remote_timestamp: Timestamp,
}

// =============================================================================
// Strategy
// =============================================================================

/// Caller-supplied resolution logic.
///
/// ## Example
/// ```rust,ignore
/// struct MergeTags;
///
/// #[async_trait]
/// impl ConflictHandler for MergeTags {
///     async fn resolve(&self, conflict: &Conflict) -> Result<Record, String> {
///         let mut merged = conflict.remote.clone();
///         merged["tags"] = union(&conflict.local["tags"], &conflict.remote["tags"]);
///         Ok(merged)
///     }
/// }
/// ```
#[async_trait]
pub trait ConflictHandler: Send + Sync {
    /// Returns the record to keep, or a reason why none could be chosen.
    async fn resolve(&self, conflict: &Conflict) -> Result<Record, String>;
}

/// How to pick a winner for a detected conflict.
#[derive(Clone, Default)]
pub enum ConflictStrategy {
    /// Larger timestamp wins; ties go to remote.
    #[default]
    LastWriteWins,
    LocalWins,
    RemoteWins,
    Custom(Arc<dyn ConflictHandler>),
}

impl ConflictStrategy {
    /// Parses a configured strategy name, falling back to last-write-wins.
    pub fn from_name(name: &str) -> Self {
        name.parse().unwrap_or_else(|_| {
            warn!(strategy = %name, "Unknown conflict strategy, using last-write-wins");
            ConflictStrategy::LastWriteWins
        })
    }

    /// Wraps a custom handler.
    pub fn custom(handler: impl ConflictHandler + 'static) -> Self {
        ConflictStrategy::Custom(Arc::new(handler))
    }

    /// Returns the configuration name of this strategy.
    pub fn name(&self) -> &'static str {
        match self {
            ConflictStrategy::LastWriteWins => "last-write-wins",
            ConflictStrategy::LocalWins => "local-wins",
            ConflictStrategy::RemoteWins => "remote-wins",
            ConflictStrategy::Custom(_) => "custom",
        }
    }
}

impl fmt::Debug for ConflictStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConflictStrategy({})", self.name())
    }
}

impl FromStr for ConflictStrategy {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "last-write-wins" | "lww" => Ok(ConflictStrategy::LastWriteWins),
            "local-wins" | "local" => Ok(ConflictStrategy::LocalWins),
            "remote-wins" | "remote" => Ok(ConflictStrategy::RemoteWins),
            other => Err(ValidationError::InvalidFormat {
                field: "conflict_resolution".to_string(),
                reason: format!(
                    "unknown strategy '{}'. Valid options: last-write-wins, local-wins, remote-wins",
                    other
                ),
            }),
        }
    }
}

// =============================================================================
// Resolver
// =============================================================================

/// Detects and resolves conflicts between local and remote record versions.
#[derive(Debug, Clone)]
pub struct ConflictResolver {
    threshold_ms: i64,
    updated_fields: Vec<String>,
    created_fields: Vec<String>,
}

impl Default for ConflictResolver {
    fn default() -> Self {
        ConflictResolver {
            threshold_ms: DEFAULT_CONFLICT_THRESHOLD_MS,
            updated_fields: vec!["updatedAt".to_string(), "updated_at".to_string()],
            created_fields: vec!["createdAt".to_string(), "created_at".to_string()],
        }
    }
}

impl ConflictResolver {
    /// Creates a resolver with the default 1000 ms threshold.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the conflict threshold.
    pub fn with_threshold(mut self, threshold_ms: i64) -> Self {
        self.threshold_ms = threshold_ms.max(0);
        self
    }

    pub fn threshold_ms(&self) -> i64 {
        self.threshold_ms
    }

    /// Compares two versions of a record.
    ///
    /// ## Returns
    /// * `Some(Conflict)` - timestamps differ by more than the threshold
    /// * `None` - no conflict; the caller keeps the remote record
    pub fn detect_conflict(
        &self,
        local: &Record,
        remote: &Record,
        table: &str,
        key: &str,
    ) -> Option<Conflict> {
        self.detect_conflict_at(local, remote, table, key, now_millis())
    }

    /// Same as [`detect_conflict`](Self::detect_conflict) with an explicit "now".
    pub fn detect_conflict_at(
        &self,
        local: &Record,
        remote: &Record,
        table: &str,
        key: &str,
        now: Timestamp,
    ) -> Option<Conflict> {
        let local_timestamp = self.record_timestamp(local).unwrap_or(now);
        let remote_timestamp = self.record_timestamp(remote).unwrap_or(now);

        if local_timestamp.abs_diff(remote_timestamp) <= self.threshold_ms.max(0) as u64 {
            return None;
        }

        Some(Conflict {
            table: table.to_string(),
            key: key.to_string(),
            local: local.clone(),
            remote: remote.clone(),
            local_timestamp,
            remote_timestamp,
        })
    }

    /// Picks the record to keep.
    ///
    /// ## Errors
    /// * `ConflictResolutionFailed` - a custom handler returned an error
    pub async fn resolve(&self, conflict: &Conflict, strategy: &ConflictStrategy) -> CoreResult<Record> {
        match strategy {
            ConflictStrategy::LastWriteWins => {
                if conflict.local_timestamp > conflict.remote_timestamp {
                    Ok(conflict.local.clone())
                } else {
                    Ok(conflict.remote.clone())
                }
            }
            ConflictStrategy::LocalWins => Ok(conflict.local.clone()),
            ConflictStrategy::RemoteWins => Ok(conflict.remote.clone()),
            ConflictStrategy::Custom(handler) => {
                handler
                    .resolve(conflict)
                    .await
                    .map_err(|reason| CoreError::ConflictResolutionFailed {
                        table: conflict.table.clone(),
                        key: conflict.key.clone(),
                        reason,
                    })
            }
        }
    }

    /// Reads the update-time field, falling back to the creation-time field.
    pub fn record_timestamp(&self, record: &Record) -> Option<Timestamp> {
        self.updated_fields
            .iter()
            .chain(self.created_fields.iter())
            .find_map(|field| get_field(record, field).and_then(parse_timestamp))
    }
}

/// Parses epoch milliseconds (number or numeric string) or an RFC 3339 string.
pub fn parse_timestamp(value: &Value) -> Option<Timestamp> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.timestamp_millis())
            .ok()
            .or_else(|| s.parse::<i64>().ok()),
        _ => None,
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const NOW: Timestamp = 1_700_000_000_000;

    #[test]
    fn test_parse_timestamp() {
        assert_eq!(parse_timestamp(&json!(1234)), Some(1234));
        assert_eq!(parse_timestamp(&json!("1234")), Some(1234));
        assert_eq!(
            parse_timestamp(&json!("2023-11-14T22:13:20.000Z")),
            Some(NOW)
        );
        assert_eq!(parse_timestamp(&json!("yesterday")), None);
        assert_eq!(parse_timestamp(&json!(true)), None);
    }

    #[test]
    fn test_no_conflict_within_threshold() {
        let resolver = ConflictResolver::new();
        let local = json!({"id": 1, "updatedAt": NOW});
        let remote = json!({"id": 1, "updatedAt": NOW + 1000});
        assert!(resolver.detect_conflict_at(&local, &remote, "t", "1", NOW).is_none());
    }

    #[test]
    fn test_conflict_above_threshold() {
        let resolver = ConflictResolver::new();
        let local = json!({"id": 1, "updatedAt": NOW + 5000});
        let remote = json!({"id": 1, "updatedAt": NOW});
        let conflict = resolver
            .detect_conflict_at(&local, &remote, "todos", "1", NOW)
            .unwrap();
        assert_eq!(conflict.local_timestamp, NOW + 5000);
        assert_eq!(conflict.remote_timestamp, NOW);
        assert_eq!(conflict.table, "todos");
    }

    #[test]
    fn test_timestamp_fallbacks() {
        let resolver = ConflictResolver::new();
        // created_at used when no updated field exists
        let record = json!({"created_at": 500});
        assert_eq!(resolver.record_timestamp(&record), Some(500));

        // updatedAt wins over createdAt
        let record = json!({"createdAt": 1, "updatedAt": 2});
        assert_eq!(resolver.record_timestamp(&record), Some(2));

        // no fields at all -> "now" for both sides, never a conflict
        let conflict = resolver.detect_conflict_at(&json!({}), &json!({}), "t", "k", NOW);
        assert!(conflict.is_none());

        // one side missing -> compared against "now"
        let old_remote = json!({"updatedAt": NOW - 60_000});
        let conflict = resolver.detect_conflict_at(&json!({}), &old_remote, "t", "k", NOW);
        assert_eq!(conflict.unwrap().local_timestamp, NOW);
    }

    #[test]
    fn test_custom_threshold() {
        let resolver = ConflictResolver::new().with_threshold(10_000);
        let local = json!({"updatedAt": NOW + 5000});
        let remote = json!({"updatedAt": NOW});
        assert!(resolver.detect_conflict_at(&local, &remote, "t", "k", NOW).is_none());
    }

    #[test]
    fn test_extreme_timestamps_do_not_overflow() {
        let resolver = ConflictResolver::new();
        let local = json!({"updatedAt": i64::MAX});
        let remote = json!({"updatedAt": i64::MIN});
        let conflict = resolver
            .detect_conflict_at(&local, &remote, "t", "k", NOW)
            .unwrap();
        assert_eq!(conflict.local_timestamp, i64::MAX);
        assert_eq!(conflict.remote_timestamp, i64::MIN);

        let same = json!({"updatedAt": i64::MIN});
        assert!(resolver.detect_conflict_at(&same, &same, "t", "k", NOW).is_none());
    }

    #[tokio::test]
    async fn test_last_write_wins() {
        let resolver = ConflictResolver::new();
        let newer_local = json!({"v": "local", "updatedAt": NOW + 5000});
        let remote = json!({"v": "remote", "updatedAt": NOW});

        let conflict = resolver
            .detect_conflict_at(&newer_local, &remote, "t", "k", NOW)
            .unwrap();
        let winner = resolver
            .resolve(&conflict, &ConflictStrategy::LastWriteWins)
            .await
            .unwrap();
        assert_eq!(winner["v"], "local");

        let conflict = resolver
            .detect_conflict_at(&remote, &newer_local, "t", "k", NOW)
            .unwrap();
        let winner = resolver
            .resolve(&conflict, &ConflictStrategy::LastWriteWins)
            .await
            .unwrap();
        assert_eq!(winner["v"], "local");
    }

    #[tokio::test]
    async fn test_fixed_strategies() {
        let resolver = ConflictResolver::new();
        let conflict = Conflict {
            table: "t".into(),
            key: "k".into(),
            local: json!({"v": "local"}),
            remote: json!({"v": "remote"}),
            local_timestamp: NOW + 9000,
            remote_timestamp: NOW,
        };

        let local = resolver.resolve(&conflict, &ConflictStrategy::LocalWins).await.unwrap();
        assert_eq!(local["v"], "local");

        let remote = resolver.resolve(&conflict, &ConflictStrategy::RemoteWins).await.unwrap();
        assert_eq!(remote["v"], "remote");
    }

    struct Merge;

    #[async_trait]
    impl ConflictHandler for Merge {
        async fn resolve(&self, conflict: &Conflict) -> Result<Record, String> {
            let mut merged = conflict.remote.clone();
            merged["note"] = conflict.local["note"].clone();
            Ok(merged)
        }
    }

    struct Refuse;

    #[async_trait]
    impl ConflictHandler for Refuse {
        async fn resolve(&self, _conflict: &Conflict) -> Result<Record, String> {
            Err("cannot merge".to_string())
        }
    }

    #[tokio::test]
    async fn test_custom_strategy() {
        let resolver = ConflictResolver::new();
        let conflict = Conflict {
            table: "notes".into(),
            key: "n1".into(),
            local: json!({"title": "old", "note": "mine"}),
            remote: json!({"title": "new", "note": "theirs"}),
            local_timestamp: NOW,
            remote_timestamp: NOW + 5000,
        };

        let merged = resolver
            .resolve(&conflict, &ConflictStrategy::custom(Merge))
            .await
            .unwrap();
        assert_eq!(merged, json!({"title": "new", "note": "mine"}));

        let err = resolver
            .resolve(&conflict, &ConflictStrategy::custom(Refuse))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::ConflictResolutionFailed { .. }));
    }

    #[test]
    fn test_strategy_names() {
        assert!(matches!(
            ConflictStrategy::from_name("remote-wins"),
            ConflictStrategy::RemoteWins
        ));
        assert!(matches!(
            ConflictStrategy::from_name("local_wins"),
            ConflictStrategy::LocalWins
        ));
        assert!(matches!(
            ConflictStrategy::from_name("coin-flip"),
            ConflictStrategy::LastWriteWins
        ));
        assert!("coin-flip".parse::<ConflictStrategy>().is_err());
        assert_eq!(ConflictStrategy::default().name(), "last-write-wins");
    }
}
