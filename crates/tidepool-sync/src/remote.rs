//! # Remote Backend
//!
//! The seam between the sync engine and whatever stores records remotely.
//!
//! ```text
//! ┌────────────┐   upsert / delete    ┌──────────────────────┐
//! │ SyncEngine │ ───────────────────► │                      │
//! │            │   select_since       │   RemoteBackend      │
//! │            │ ◄─────────────────── │   (hosted DB, REST,  │
//! │            │                      │    MemoryBackend)    │
//! │ Realtime   │   subscribe (feed)   │                      │
//! │ handler    │ ◄═══════════════════ │                      │
//! └────────────┘                      └──────────────────────┘
//! ```
//!
//! Backends receive remote table names. Mapping local → remote names is
//! the engine's job.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use tokio::sync::mpsc;
use tracing::debug;

use tidepool_core::query::get_field;
use tidepool_core::{key_from_value, now_millis, Record, RecordKey, Timestamp};

use crate::error::{SyncError, SyncResult};

/// Buffer size of a change feed channel.
pub const FEED_CAPACITY: usize = 256;

// =============================================================================
// Realtime Events
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RealtimeEventType {
    Insert,
    Update,
    Delete,
}

/// One entry of a backend change feed.
///
/// For deletes `record` only needs to carry the key field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RealtimeEvent {
    pub event_type: RealtimeEventType,
    /// Remote table name.
    pub table: String,
    pub record: Record,
}

impl RealtimeEvent {
    pub fn insert(table: impl Into<String>, record: Record) -> Self {
        RealtimeEvent {
            event_type: RealtimeEventType::Insert,
            table: table.into(),
            record,
        }
    }

    pub fn update(table: impl Into<String>, record: Record) -> Self {
        RealtimeEvent {
            event_type: RealtimeEventType::Update,
            table: table.into(),
            record,
        }
    }

    pub fn delete(table: impl Into<String>, record: Record) -> Self {
        RealtimeEvent {
            event_type: RealtimeEventType::Delete,
            table: table.into(),
            record,
        }
    }
}

// =============================================================================
// Backend Trait
// =============================================================================

/// Remote storage used by the sync engine.
///
/// Every method may fail with [`SyncError::RemoteUnavailable`]; the engine
/// isolates such failures per table.
#[async_trait]
pub trait RemoteBackend: Send + Sync {
    /// Idempotent upsert of `records`, matched on `key_field`.
    async fn upsert(&self, table: &str, records: &[Record], key_field: &str) -> SyncResult<()>;

    /// Deletes records by key. Unknown keys are ignored.
    async fn delete(&self, table: &str, keys: &[RecordKey]) -> SyncResult<()>;

    /// Records changed at or after `since`, or every record when `None`.
    async fn select_since(&self, table: &str, since: Option<Timestamp>) -> SyncResult<Vec<Record>>;

    /// Opens a change feed for `tables`.
    ///
    /// Returns `Ok(None)` when the backend has no feed. The feed ends when
    /// the receiver yields `None`.
    async fn subscribe(&self, tables: &[String]) -> SyncResult<Option<mpsc::Receiver<RealtimeEvent>>> {
        let _ = tables;
        Ok(None)
    }
}

// =============================================================================
// Memory Backend
// =============================================================================

/// Number of calls made to a [`MemoryBackend`], per method.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub upserts: usize,
    pub deletes: usize,
    pub selects: usize,
    pub subscribes: usize,
}

impl CallCounts {
    pub fn total(&self) -> usize {
        self.upserts + self.deletes + self.selects + self.subscribes
    }
}

#[derive(Debug, Clone)]
struct StoredRow {
    record: Record,
    changed_at: Timestamp,
}

struct Feed {
    tables: HashSet<String>,
    tx: mpsc::Sender<RealtimeEvent>,
}

#[derive(Default)]
struct MemoryInner {
    tables: HashMap<String, BTreeMap<RecordKey, StoredRow>>,
    failing: HashSet<String>,
    calls: CallCounts,
    feeds: Vec<Feed>,
    realtime: bool,
}

/// In-process backend for tests, demos and offline development.
///
/// ## Example
/// ```rust
/// use serde_json::json;
/// use tidepool_sync::{MemoryBackend, RemoteBackend};
///
/// # tokio_test_block(async {
/// let backend = MemoryBackend::new();
/// backend.upsert("todos", &[json!({"id": "1", "title": "x"})], "id").await.unwrap();
/// assert_eq!(backend.records("todos").len(), 1);
///
/// backend.fail_table("todos");
/// assert!(backend.select_since("todos", None).await.is_err());
/// # });
/// # fn tokio_test_block(f: impl std::future::Future<Output = ()>) {
/// #     tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(f)
/// # }
/// ```
pub struct MemoryBackend {
    inner: Mutex<MemoryInner>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("MemoryBackend")
            .field("tables", &inner.tables.keys().collect::<Vec<_>>())
            .field("failing", &inner.failing)
            .field("calls", &inner.calls)
            .finish()
    }
}

impl MemoryBackend {
    /// An empty backend with a change feed.
    pub fn new() -> Self {
        MemoryBackend {
            inner: Mutex::new(MemoryInner {
                realtime: true,
                ..Default::default()
            }),
        }
    }

    /// A backend whose `subscribe` reports no feed.
    pub fn without_realtime() -> Self {
        let backend = Self::new();
        backend.inner.lock().realtime = false;
        backend
    }

    /// Makes every call touching `table` fail.
    pub fn fail_table(&self, table: &str) {
        self.inner.lock().failing.insert(table.to_string());
    }

    /// Undoes [`fail_table`](Self::fail_table).
    pub fn recover_table(&self, table: &str) {
        self.inner.lock().failing.remove(table);
    }

    /// Stores a record as if another client had written it now.
    pub fn set_record(&self, table: &str, key: &str, record: Record) {
        self.set_record_at(table, key, record, now_millis());
    }

    /// Stores a record with an explicit change time.
    pub fn set_record_at(&self, table: &str, key: &str, record: Record, changed_at: Timestamp) {
        self.inner
            .lock()
            .tables
            .entry(table.to_string())
            .or_default()
            .insert(key.to_string(), StoredRow { record, changed_at });
    }

    /// Removes a record without going through a call.
    pub fn remove_record(&self, table: &str, key: &str) {
        if let Some(rows) = self.inner.lock().tables.get_mut(table) {
            rows.remove(key);
        }
    }

    pub fn record(&self, table: &str, key: &str) -> Option<Record> {
        self.inner
            .lock()
            .tables
            .get(table)
            .and_then(|rows| rows.get(key))
            .map(|row| row.record.clone())
    }

    /// Every stored record of `table`, in key order.
    pub fn records(&self, table: &str) -> Vec<Record> {
        self.inner
            .lock()
            .tables
            .get(table)
            .map(|rows| rows.values().map(|row| row.record.clone()).collect())
            .unwrap_or_default()
    }

    pub fn calls(&self) -> CallCounts {
        self.inner.lock().calls
    }

    pub fn reset_calls(&self) {
        self.inner.lock().calls = CallCounts::default();
    }

    /// Delivers `event` to every open feed subscribed to its table.
    ///
    /// ## Returns
    /// Number of feeds that accepted the event. Closed feeds are dropped.
    pub fn emit(&self, event: RealtimeEvent) -> usize {
        let mut inner = self.inner.lock();
        inner.feeds.retain(|feed| !feed.tx.is_closed());

        let mut delivered = 0;
        for feed in inner.feeds.iter().filter(|f| f.tables.contains(&event.table)) {
            if feed.tx.try_send(event.clone()).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// Ends every open feed, as a dropped connection would.
    pub fn close_feeds(&self) {
        self.inner.lock().feeds.clear();
    }

    /// Number of feeds still open.
    pub fn open_feeds(&self) -> usize {
        let mut inner = self.inner.lock();
        inner.feeds.retain(|feed| !feed.tx.is_closed());
        inner.feeds.len()
    }

    fn check(inner: &MemoryInner, table: &str) -> SyncResult<()> {
        if inner.failing.contains(table) {
            return Err(SyncError::remote(table, "backend unavailable"));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteBackend for MemoryBackend {
    async fn upsert(&self, table: &str, records: &[Record], key_field: &str) -> SyncResult<()> {
        let mut inner = self.inner.lock();
        inner.calls.upserts += 1;
        Self::check(&inner, table)?;

        let mut keyed = Vec::with_capacity(records.len());
        for record in records {
            let key = get_field(record, key_field)
                .and_then(key_from_value)
                .ok_or_else(|| {
                    SyncError::remote(table, format!("record without '{}' rejected", key_field))
                })?;
            keyed.push((key, record.clone()));
        }

        let now = now_millis();
        let rows = inner.tables.entry(table.to_string()).or_default();
        for (key, record) in keyed {
            rows.insert(key, StoredRow { record, changed_at: now });
        }

        debug!(table = %table, count = records.len(), "Memory backend upsert");
        Ok(())
    }

    async fn delete(&self, table: &str, keys: &[RecordKey]) -> SyncResult<()> {
        let mut inner = self.inner.lock();
        inner.calls.deletes += 1;
        Self::check(&inner, table)?;

        if let Some(rows) = inner.tables.get_mut(table) {
            for key in keys {
                rows.remove(key);
            }
        }
        Ok(())
    }

    async fn select_since(&self, table: &str, since: Option<Timestamp>) -> SyncResult<Vec<Record>> {
        let mut inner = self.inner.lock();
        inner.calls.selects += 1;
        Self::check(&inner, table)?;

        Ok(inner
            .tables
            .get(table)
            .map(|rows| {
                rows.values()
                    .filter(|row| since.map_or(true, |ts| row.changed_at >= ts))
                    .map(|row| row.record.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn subscribe(&self, tables: &[String]) -> SyncResult<Option<mpsc::Receiver<RealtimeEvent>>> {
        let mut inner = self.inner.lock();
        inner.calls.subscribes += 1;
        if !inner.realtime {
            return Ok(None);
        }
        for table in tables {
            Self::check(&inner, table)?;
        }

        let (tx, rx) = mpsc::channel(FEED_CAPACITY);
        inner.feeds.push(Feed {
            tables: tables.iter().cloned().collect(),
            tx,
        });
        Ok(Some(rx))
    }
}
