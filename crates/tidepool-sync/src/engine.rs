//! # Sync Engine
//!
//! Moves changes between the local store and a [`RemoteBackend`].
//!
//! ## Operations
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          SyncEngine                                     │
//! │                                                                         │
//! │  push()      change_log (pending) ──► fold per table ──► upsert/delete │
//! │                                        └──► mark batch synced           │
//! │                                                                         │
//! │  pull()      select_since(lastSync) ──► detect/resolve ──► put (no log)│
//! │                                        └──► lastSync = pull start       │
//! │                                                                         │
//! │  full()      pull() then push()                                         │
//! │  push_all()  every local record ──► upsert ──► mark pending synced      │
//! │                                                                         │
//! │  State guard (single flight):                                           │
//! │       IDLE ──CAS──► SYNCING ──drop──► IDLE                              │
//! │       a call that loses the CAS returns a skipped report                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! push and pull isolate failures per table: the table is marked `error`
//! and the cycle moves on. push_all stops at the first failure.

use serde::Serialize;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use tidepool_core::{
    now_millis, ConflictHandler, ConflictResolver, ConflictStrategy, SyncMetadata, TableSchema,
};
use tidepool_db::{Database, LocalTable};

use crate::config::{SyncConfig, SyncStrategy};
use crate::error::{SyncError, SyncResult};
use crate::outbox::{dedup_by_key, PushBatch};
use crate::remote::{RealtimeEvent, RealtimeEventType, RemoteBackend};

const STATE_IDLE: u8 = 0;
const STATE_SYNCING: u8 = 1;

// =============================================================================
// Sync Report
// =============================================================================

/// Outcome of one sync operation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    /// Records upserted remotely.
    pub pushed: usize,
    /// Keys deleted remotely.
    pub deleted: usize,
    /// Remote records written locally.
    pub pulled: usize,
    /// Conflicts detected (and resolved) during pull.
    pub conflicts: usize,
    /// Local names of tables that failed, in processing order.
    pub failed_tables: Vec<String>,
    /// Another operation was in flight; nothing ran.
    pub skipped: bool,
}

impl SyncReport {
    pub fn skipped() -> Self {
        SyncReport {
            skipped: true,
            ..Default::default()
        }
    }

    /// True when the operation ran and no table failed.
    pub fn is_clean(&self) -> bool {
        !self.skipped && self.failed_tables.is_empty()
    }

    fn absorb(&mut self, other: SyncReport) {
        self.pushed += other.pushed;
        self.deleted += other.deleted;
        self.pulled += other.pulled;
        self.conflicts += other.conflicts;
        for table in other.failed_tables {
            if !self.failed_tables.contains(&table) {
                self.failed_tables.push(table);
            }
        }
    }
}

// =============================================================================
// Single-Flight Guard
// =============================================================================

/// Holds the engine in `SYNCING` until dropped.
struct FlightGuard<'a> {
    state: &'a AtomicU8,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.state.store(STATE_IDLE, Ordering::Release);
    }
}

// =============================================================================
// Sync Engine
// =============================================================================

/// Push/pull coordinator for the configured tables.
///
/// ## Example
/// ```rust,ignore
/// let engine = SyncEngine::new(db.clone(), Arc::new(MemoryBackend::new()), config)?;
/// let report = engine.sync().await?;
/// println!("pushed {} pulled {}", report.pushed, report.pulled);
/// ```
pub struct SyncEngine {
    db: Database,
    remote: Arc<dyn RemoteBackend>,
    config: SyncConfig,
    resolver: ConflictResolver,
    strategy: ConflictStrategy,
    state: AtomicU8,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("tables", &self.config.tables)
            .field("strategy", &self.config.sync.strategy)
            .field("conflicts", &self.strategy)
            .field("syncing", &self.is_syncing())
            .finish()
    }
}

impl SyncEngine {
    /// Creates an engine for the tables mapped in `config`.
    ///
    /// ## Errors
    /// * `InvalidConfig` - the configuration does not validate
    /// * `UnknownTable` - a mapped local table is not declared in `db`
    pub fn new(db: Database, remote: Arc<dyn RemoteBackend>, config: SyncConfig) -> SyncResult<Self> {
        config.validate()?;
        for local in config.tables.keys() {
            db.schema(local)
                .map_err(|_| SyncError::UnknownTable(local.clone()))?;
        }

        let resolver = ConflictResolver::new().with_threshold(config.sync.conflict_threshold_ms);
        let strategy = config.conflict_strategy();

        info!(
            tables = config.tables.len(),
            strategy = %config.sync.strategy,
            conflicts = strategy.name(),
            "Sync engine created"
        );

        Ok(SyncEngine {
            db,
            remote,
            config,
            resolver,
            strategy,
            state: AtomicU8::new(STATE_IDLE),
        })
    }

    /// Replaces the configured conflict policy.
    pub fn with_conflict_strategy(mut self, strategy: ConflictStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Resolves conflicts with a caller-supplied handler.
    pub fn with_conflict_handler(self, handler: impl ConflictHandler + 'static) -> Self {
        self.with_conflict_strategy(ConflictStrategy::custom(handler))
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn conflict_strategy(&self) -> &ConflictStrategy {
        &self.strategy
    }

    /// True while a push/pull/full/push_all is in flight.
    pub fn is_syncing(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_SYNCING
    }

    fn try_begin(&self) -> Option<FlightGuard<'_>> {
        self.state
            .compare_exchange(STATE_IDLE, STATE_SYNCING, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| FlightGuard { state: &self.state })
    }

    fn remote_name(&self, local: &str) -> SyncResult<&str> {
        self.config
            .remote_table(local)
            .ok_or_else(|| SyncError::UnknownTable(local.to_string()))
    }

    fn schema(&self, local: &str) -> SyncResult<Arc<TableSchema>> {
        Ok(self.db.schema(local)?)
    }

    // =========================================================================
    // Public Operations
    // =========================================================================

    /// Runs the configured strategy.
    pub async fn sync(&self) -> SyncResult<SyncReport> {
        match self.config.sync.strategy {
            SyncStrategy::Push => self.push().await,
            SyncStrategy::Pull => self.pull().await,
            SyncStrategy::Bidirectional => self.full().await,
        }
    }

    /// Uploads pending local changes.
    ///
    /// ## Returns
    /// * `Ok(report)` - `failed_tables` lists tables whose remote calls failed
    /// * `Err(SyncError)` - the change log itself could not be read
    pub async fn push(&self) -> SyncResult<SyncReport> {
        let Some(_guard) = self.try_begin() else {
            debug!("Push skipped, sync already in flight");
            return Ok(SyncReport::skipped());
        };
        self.push_pending().await
    }

    /// Downloads remote changes since each table's last pull.
    pub async fn pull(&self) -> SyncResult<SyncReport> {
        let Some(_guard) = self.try_begin() else {
            debug!("Pull skipped, sync already in flight");
            return Ok(SyncReport::skipped());
        };
        self.pull_all().await
    }

    /// Pull, then push, as one operation.
    pub async fn full(&self) -> SyncResult<SyncReport> {
        let Some(_guard) = self.try_begin() else {
            debug!("Full sync skipped, sync already in flight");
            return Ok(SyncReport::skipped());
        };

        let mut report = self.pull_all().await?;
        report.absorb(self.push_pending().await?);
        Ok(report)
    }

    /// Uploads every local record of every mapped table.
    ///
    /// Pending change entries of a table are marked synced after its upload.
    ///
    /// ## Errors
    /// The first failing table aborts the operation; it is marked `error`.
    pub async fn push_all(&self) -> SyncResult<SyncReport> {
        let Some(_guard) = self.try_begin() else {
            debug!("Push-all skipped, sync already in flight");
            return Ok(SyncReport::skipped());
        };

        let tracker = self.db.change_tracker();
        let metadata = self.db.sync_metadata();
        let mut report = SyncReport::default();

        for table in self.config.tables.keys() {
            metadata.mark_syncing(table).await?;
            match self.push_table_snapshot(table).await {
                Ok(count) => {
                    let pending = tracker.count_pending(Some(table.as_str())).await?;
                    metadata.mark_success(table, None, pending).await?;
                    report.pushed += count;
                }
                Err(e) => {
                    error!(table = %table, ?e, "Push-all failed");
                    metadata.mark_error(table, None).await?;
                    return Err(e);
                }
            }
        }

        info!(pushed = report.pushed, "Push-all complete");
        Ok(report)
    }

    /// Sync metadata of every mapped table, in table name order.
    pub async fn statuses(&self) -> SyncResult<Vec<SyncMetadata>> {
        let metadata = self.db.sync_metadata();
        let mut out = Vec::with_capacity(self.config.tables.len());
        for table in self.config.tables.keys() {
            out.push(metadata.get_or_default(table).await?);
        }
        Ok(out)
    }

    /// Sync metadata of one mapped table.
    pub async fn status(&self, table: &str) -> SyncResult<SyncMetadata> {
        self.remote_name(table)?;
        Ok(self.db.sync_metadata().get_or_default(table).await?)
    }

    /// Applies one change feed event to the local store.
    ///
    /// No conflict detection runs and no change entry is recorded.
    ///
    /// ## Returns
    /// * `Ok(true)` - the event was applied
    /// * `Ok(false)` - the event named an unmapped table or carried no key
    pub async fn apply_realtime_event(&self, event: &RealtimeEvent) -> SyncResult<bool> {
        let Some(local) = self.config.local_table(&event.table) else {
            warn!(table = %event.table, "Realtime event for unmapped table dropped");
            return Ok(false);
        };

        let table = self.db.table(local)?.without_change_log();
        let Some(key) = table.schema().extract_key(&event.record) else {
            warn!(table = %local, "Realtime event without key dropped");
            return Ok(false);
        };

        match event.event_type {
            RealtimeEventType::Insert | RealtimeEventType::Update => {
                table.put_with_key(event.record.clone(), &key).await?;
            }
            RealtimeEventType::Delete => {
                table.delete(&key).await?;
            }
        }

        debug!(table = %local, key = %key, event = ?event.event_type, "Realtime event applied");
        Ok(true)
    }

    // =========================================================================
    // Push
    // =========================================================================

    async fn push_pending(&self) -> SyncResult<SyncReport> {
        let tracker = self.db.change_tracker();
        let metadata = self.db.sync_metadata();
        let pending = tracker.get_pending_changes(None).await?;
        let mut report = SyncReport::default();

        if pending.is_empty() {
            debug!("Nothing to push");
            return Ok(report);
        }

        for batch in PushBatch::group(&pending) {
            if self.config.remote_table(&batch.table).is_none() {
                debug!(table = %batch.table, "Table not mapped for sync, changes left pending");
                continue;
            }

            metadata.mark_syncing(&batch.table).await?;
            match self.push_batch(&batch).await {
                Ok(()) => {
                    let left = tracker.count_pending(Some(batch.table.as_str())).await?;
                    metadata.mark_success(&batch.table, None, left).await?;
                    report.pushed += batch.upserts.len();
                    report.deleted += batch.deletes.len();
                    debug!(
                        table = %batch.table,
                        upserts = batch.upserts.len(),
                        deletes = batch.deletes.len(),
                        changes = batch.change_ids.len(),
                        "Batch pushed"
                    );
                }
                Err(e) => {
                    error!(table = %batch.table, ?e, "Push failed");
                    let left = tracker.count_pending(Some(batch.table.as_str())).await?;
                    metadata.mark_error(&batch.table, Some(left)).await?;
                    report.failed_tables.push(batch.table.clone());
                }
            }
        }

        info!(
            pushed = report.pushed,
            deleted = report.deleted,
            failed = report.failed_tables.len(),
            "Push complete"
        );
        Ok(report)
    }

    async fn push_batch(&self, batch: &PushBatch) -> SyncResult<()> {
        let remote = self.remote_name(&batch.table)?;
        let schema = self.schema(&batch.table)?;

        if !batch.upserts.is_empty() {
            self.remote
                .upsert(remote, &batch.upserts, &schema.primary_key)
                .await?;
        }
        if !batch.deletes.is_empty() {
            self.remote.delete(remote, &batch.deletes).await?;
        }

        self.db
            .change_tracker()
            .mark_multiple_as_synced(&batch.change_ids)
            .await?;
        Ok(())
    }

    async fn push_table_snapshot(&self, table: &str) -> SyncResult<usize> {
        let remote = self.remote_name(table)?;
        let local = self.db.table(table)?;
        let schema = local.schema().clone();

        // Collected before the snapshot so later writes stay pending.
        let pending: Vec<String> = self
            .db
            .change_tracker()
            .get_pending_changes(Some(table))
            .await?
            .into_iter()
            .map(|c| c.id)
            .collect();

        let records = dedup_by_key(local.get_all().await?, |r| schema.extract_key(r));
        if !records.is_empty() {
            self.remote
                .upsert(remote, &records, &schema.primary_key)
                .await?;
        }

        self.db
            .change_tracker()
            .mark_multiple_as_synced(&pending)
            .await?;
        debug!(table = %table, count = records.len(), "Table snapshot pushed");
        Ok(records.len())
    }

    // =========================================================================
    // Pull
    // =========================================================================

    async fn pull_all(&self) -> SyncResult<SyncReport> {
        let tracker = self.db.change_tracker();
        let metadata = self.db.sync_metadata();
        let mut report = SyncReport::default();

        for table in self.config.tables.keys() {
            let started = now_millis();
            metadata.mark_syncing(table).await?;

            match self.pull_table(table).await {
                Ok((pulled, conflicts)) => {
                    let pending = tracker.count_pending(Some(table.as_str())).await?;
                    metadata.mark_success(table, Some(started), pending).await?;
                    report.pulled += pulled;
                    report.conflicts += conflicts;
                }
                Err(e) => {
                    error!(table = %table, ?e, "Pull failed");
                    metadata.mark_error(table, None).await?;
                    report.failed_tables.push(table.clone());
                }
            }
        }

        info!(
            pulled = report.pulled,
            conflicts = report.conflicts,
            failed = report.failed_tables.len(),
            "Pull complete"
        );
        Ok(report)
    }

    /// Returns (records written, conflicts seen).
    async fn pull_table(&self, table: &str) -> SyncResult<(usize, usize)> {
        let remote = self.remote_name(table)?;
        let since = self.db.sync_metadata().get_or_default(table).await?.since();
        let records = self.remote.select_since(remote, since).await?;

        let local: LocalTable = self.db.table(table)?;
        let writer = local.without_change_log();
        let mut pulled = 0;
        let mut conflicts = 0;

        for incoming in records {
            let Some(key) = local.schema().extract_key(&incoming) else {
                warn!(table = %table, "Remote record without key skipped");
                continue;
            };

            let existing = local.get(&key).await?;
            let keep = match &existing {
                None => incoming,
                Some(current) => {
                    match self.resolver.detect_conflict(current, &incoming, table, &key) {
                        None => incoming,
                        Some(conflict) => {
                            conflicts += 1;
                            debug!(
                                table = %table,
                                key = %key,
                                local_ts = conflict.local_timestamp,
                                remote_ts = conflict.remote_timestamp,
                                "Conflict detected"
                            );
                            self.resolver.resolve(&conflict, &self.strategy).await?
                        }
                    }
                }
            };

            if existing.as_ref() == Some(&keep) {
                continue;
            }
            writer.put_with_key(keep, &key).await?;
            pulled += 1;
        }

        debug!(table = %table, since = ?since, pulled, conflicts, "Table pulled");
        Ok((pulled, conflicts))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MemoryBackend;
    use async_trait::async_trait;
    use serde_json::json;
    use tidepool_core::{Conflict, Record, SyncState};
    use tidepool_db::DbConfig;

    async fn setup(config: SyncConfig) -> (Database, Arc<MemoryBackend>, SyncEngine) {
        let db = Database::new(
            DbConfig::in_memory()
                .table(TableSchema::new("todos"))
                .table(TableSchema::new("users")),
        )
        .await
        .unwrap();
        let backend = Arc::new(MemoryBackend::new());
        let engine = SyncEngine::new(db.clone(), backend.clone(), config).unwrap();
        (db, backend, engine)
    }

    fn both_tables() -> SyncConfig {
        SyncConfig::new()
            .table("todos", "remote_todos")
            .table("users", "remote_users")
    }

    #[tokio::test]
    async fn test_new_rejects_undeclared_table() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let err = SyncEngine::new(
            db,
            Arc::new(MemoryBackend::new()),
            SyncConfig::new().table("ghosts", "ghosts"),
        )
        .unwrap_err();
        assert!(matches!(err, SyncError::UnknownTable(t) if t == "ghosts"));
    }

    #[tokio::test]
    async fn test_push_uploads_and_marks_synced() {
        let (db, backend, engine) = setup(both_tables()).await;
        let todos = db.table("todos").unwrap();
        todos.put(json!({"id": "1", "title": "a"})).await.unwrap();
        todos.update("1", json!({"title": "b"})).await.unwrap();
        todos.put(json!({"id": "2", "title": "gone"})).await.unwrap();
        todos.delete("2").await.unwrap();

        let report = engine.push().await.unwrap();
        assert_eq!(report.pushed, 1);
        assert_eq!(report.deleted, 1);
        assert!(report.is_clean());

        assert_eq!(backend.record("remote_todos", "1").unwrap()["title"], "b");
        assert_eq!(db.change_tracker().count_pending(None).await.unwrap(), 0);

        let status = engine.status("todos").await.unwrap();
        assert_eq!(status.sync_status, SyncState::Idle);
        assert_eq!(status.last_sync_timestamp, 0);
    }

    #[tokio::test]
    async fn test_second_push_makes_no_calls() {
        let (db, backend, engine) = setup(both_tables()).await;
        db.table("users").unwrap().put(json!({"id": "u1"})).await.unwrap();

        engine.push().await.unwrap();
        let after_first = backend.calls();
        engine.push().await.unwrap();
        assert_eq!(backend.calls(), after_first);
    }

    #[tokio::test]
    async fn test_push_isolates_failing_table() {
        let (db, backend, engine) = setup(both_tables()).await;
        db.table("todos").unwrap().put(json!({"id": "1"})).await.unwrap();
        db.table("users").unwrap().put(json!({"id": "u1"})).await.unwrap();
        backend.fail_table("remote_todos");

        let report = engine.push().await.unwrap();
        assert_eq!(report.failed_tables, vec!["todos".to_string()]);
        assert_eq!(report.pushed, 1);
        assert!(backend.record("remote_users", "u1").is_some());

        let tracker = db.change_tracker();
        assert_eq!(tracker.count_pending(Some("todos")).await.unwrap(), 1);
        assert_eq!(tracker.count_pending(Some("users")).await.unwrap(), 0);

        let status = engine.status("todos").await.unwrap();
        assert_eq!(status.sync_status, SyncState::Error);
        assert_eq!(status.pending_changes, 1);
    }

    #[tokio::test]
    async fn test_pull_writes_without_change_log() {
        let (db, backend, engine) = setup(both_tables()).await;
        backend.set_record("remote_todos", "r1", json!({"id": "r1", "title": "from remote"}));

        let report = engine.pull().await.unwrap();
        assert_eq!(report.pulled, 1);

        let local = db.table("todos").unwrap().get("r1").await.unwrap().unwrap();
        assert_eq!(local["title"], "from remote");
        assert!(local.get("updatedAt").is_none());
        assert_eq!(db.change_tracker().count_pending(None).await.unwrap(), 0);

        let status = engine.status("todos").await.unwrap();
        assert!(status.last_sync_timestamp > 0);
        assert_eq!(status.sync_status, SyncState::Idle);
    }

    #[tokio::test]
    async fn test_pull_failure_keeps_watermark() {
        let (_db, backend, engine) = setup(both_tables()).await;
        engine.pull().await.unwrap();
        let before = engine.status("users").await.unwrap().last_sync_timestamp;

        backend.fail_table("remote_users");
        let report = engine.pull().await.unwrap();
        assert_eq!(report.failed_tables, vec!["users".to_string()]);

        let status = engine.status("users").await.unwrap();
        assert_eq!(status.last_sync_timestamp, before);
        assert_eq!(status.sync_status, SyncState::Error);
        assert_eq!(engine.status("todos").await.unwrap().sync_status, SyncState::Idle);
    }

    #[tokio::test]
    async fn test_pull_conflict_last_write_wins() {
        let (db, backend, engine) = setup(both_tables()).await;
        let todos = db.table("todos").unwrap().without_change_log();
        todos
            .put(json!({"id": "1", "title": "local", "updatedAt": 5_000}))
            .await
            .unwrap();
        todos
            .put(json!({"id": "2", "title": "local newer", "updatedAt": 90_000}))
            .await
            .unwrap();
        backend.set_record("remote_todos", "1", json!({"id": "1", "title": "remote", "updatedAt": 80_000}));
        backend.set_record("remote_todos", "2", json!({"id": "2", "title": "remote older", "updatedAt": 10_000}));

        let report = engine.pull().await.unwrap();
        assert_eq!(report.conflicts, 2);
        assert_eq!(report.pulled, 1);

        let local = db.table("todos").unwrap();
        assert_eq!(local.get("1").await.unwrap().unwrap()["title"], "remote");
        assert_eq!(local.get("2").await.unwrap().unwrap()["title"], "local newer");
    }

    struct Concat;

    #[async_trait]
    impl ConflictHandler for Concat {
        async fn resolve(&self, conflict: &Conflict) -> Result<Record, String> {
            let mut merged = conflict.remote.clone();
            merged["title"] = json!(format!(
                "{}+{}",
                conflict.local["title"].as_str().unwrap_or_default(),
                conflict.remote["title"].as_str().unwrap_or_default()
            ));
            Ok(merged)
        }
    }

    struct Refuse;

    #[async_trait]
    impl ConflictHandler for Refuse {
        async fn resolve(&self, _conflict: &Conflict) -> Result<Record, String> {
            Err("no".to_string())
        }
    }

    #[tokio::test]
    async fn test_custom_conflict_handler() {
        let (db, backend, engine) = setup(both_tables()).await;
        let engine = engine.with_conflict_handler(Concat);
        db.table("todos")
            .unwrap()
            .without_change_log()
            .put(json!({"id": "1", "title": "L", "updatedAt": 1_000}))
            .await
            .unwrap();
        backend.set_record("remote_todos", "1", json!({"id": "1", "title": "R", "updatedAt": 9_000}));

        engine.pull().await.unwrap();
        let merged = db.table("todos").unwrap().get("1").await.unwrap().unwrap();
        assert_eq!(merged["title"], "L+R");
    }

    #[tokio::test]
    async fn test_failing_handler_marks_table_error() {
        let (db, backend, engine) = setup(both_tables()).await;
        let engine = engine.with_conflict_handler(Refuse);
        db.table("todos")
            .unwrap()
            .without_change_log()
            .put(json!({"id": "1", "updatedAt": 1_000}))
            .await
            .unwrap();
        backend.set_record("remote_todos", "1", json!({"id": "1", "updatedAt": 9_000}));

        let report = engine.pull().await.unwrap();
        assert_eq!(report.failed_tables, vec!["todos".to_string()]);
        assert_eq!(engine.status("todos").await.unwrap().sync_status, SyncState::Error);
    }

    #[tokio::test]
    async fn test_push_all_dedups_and_marks_pending() {
        let (db, backend, engine) = setup(SyncConfig::new().table("todos", "todos")).await;
        let todos = db.table("todos").unwrap();
        todos.put(json!({"id": "a", "v": 1})).await.unwrap();
        todos.put(json!({"id": "a", "v": 2})).await.unwrap();
        todos.put(json!({"id": "b", "v": 1})).await.unwrap();

        let report = engine.push_all().await.unwrap();
        assert_eq!(report.pushed, 2);
        assert_eq!(backend.record("todos", "a").unwrap()["v"], 2);
        assert_eq!(db.change_tracker().count_pending(None).await.unwrap(), 0);
        assert_eq!(backend.calls().upserts, 1);
    }

    #[tokio::test]
    async fn test_push_all_aborts_on_failure() {
        let (db, backend, engine) = setup(both_tables()).await;
        db.table("todos").unwrap().put(json!({"id": "1"})).await.unwrap();
        db.table("users").unwrap().put(json!({"id": "u"})).await.unwrap();
        backend.fail_table("remote_todos");

        let err = engine.push_all().await.unwrap_err();
        assert!(err.is_retryable());
        // "todos" sorts first, so "users" is never reached
        assert!(backend.records("remote_users").is_empty());
        assert_eq!(engine.status("todos").await.unwrap().sync_status, SyncState::Error);
        assert!(!engine.is_syncing());
    }

    #[tokio::test]
    async fn test_single_flight_guard() {
        let (_db, _backend, engine) = setup(both_tables()).await;
        let guard = engine.try_begin().unwrap();
        assert!(engine.is_syncing());

        assert!(engine.push().await.unwrap().skipped);
        assert!(engine.pull().await.unwrap().skipped);
        assert!(engine.full().await.unwrap().skipped);
        assert!(engine.push_all().await.unwrap().skipped);

        drop(guard);
        assert!(!engine.is_syncing());
        assert!(!engine.full().await.unwrap().skipped);
    }

    #[tokio::test]
    async fn test_realtime_event_application() {
        let (db, _backend, engine) = setup(both_tables()).await;
        let todos = db.table("todos").unwrap();
        todos.put(json!({"id": "1", "title": "local edit"})).await.unwrap();

        let applied = engine
            .apply_realtime_event(&RealtimeEvent::update("remote_todos", json!({"id": "1", "title": "remote"})))
            .await
            .unwrap();
        assert!(applied);
        assert_eq!(todos.get("1").await.unwrap().unwrap()["title"], "remote");

        engine
            .apply_realtime_event(&RealtimeEvent::delete("remote_todos", json!({"id": "1"})))
            .await
            .unwrap();
        assert!(todos.get("1").await.unwrap().is_none());

        // only the local put was logged
        assert_eq!(db.change_tracker().count_pending(None).await.unwrap(), 1);

        let dropped = engine
            .apply_realtime_event(&RealtimeEvent::insert("elsewhere", json!({"id": "x"})))
            .await
            .unwrap();
        assert!(!dropped);
    }

    #[tokio::test]
    async fn test_statuses_cover_mapped_tables() {
        let (_db, _backend, engine) = setup(both_tables()).await;
        let statuses = engine.statuses().await.unwrap();
        let names: Vec<_> = statuses.iter().map(|s| s.table.as_str()).collect();
        assert_eq!(names, vec!["todos", "users"]);
        assert!(matches!(engine.status("nope").await, Err(SyncError::UnknownTable(_))));
    }
}
