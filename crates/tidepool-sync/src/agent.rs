//! # Auto-Sync
//!
//! Runs the configured sync strategy on a timer.
//!
//! ```text
//!   start ──── interval ────► tick ──► engine.sync() ──── interval ────► tick ...
//!                              │
//!                              ├─ sync already in flight → skipped report
//!                              └─ error → logged, timer keeps running
//! ```
//!
//! The first tick fires one full interval after start. Ticks missed while a
//! slow cycle runs are dropped, not queued.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::engine::SyncEngine;
use crate::error::{SyncError, SyncResult};

/// Controls a running [`AutoSync`] task. Dropping it stops the task.
pub struct AutoSyncHandle {
    shutdown_tx: mpsc::Sender<()>,
    cycles: Arc<AtomicU64>,
    task: JoinHandle<()>,
}

impl AutoSyncHandle {
    /// Number of ticks that ran a sync (skipped ticks excluded).
    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    /// Stops the timer and waits for an in-flight cycle to finish.
    pub async fn shutdown(self) -> SyncResult<()> {
        let _ = self.shutdown_tx.send(()).await;
        self.task
            .await
            .map_err(|e| SyncError::Internal(format!("auto-sync task failed: {}", e)))
    }
}

/// Timer-driven sync loop.
pub struct AutoSync {
    engine: Arc<SyncEngine>,
    interval: Duration,
    cycles: Arc<AtomicU64>,
    shutdown_rx: mpsc::Receiver<()>,
}

impl AutoSync {
    /// Spawns the loop.
    ///
    /// ## Errors
    /// * `InvalidConfig` - `interval` is zero
    pub fn spawn(engine: Arc<SyncEngine>, interval: Duration) -> SyncResult<AutoSyncHandle> {
        if interval.is_zero() {
            return Err(SyncError::InvalidConfig(
                "auto-sync interval must be greater than 0".into(),
            ));
        }

        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let cycles = Arc::new(AtomicU64::new(0));

        let auto = AutoSync {
            engine,
            interval,
            cycles: cycles.clone(),
            shutdown_rx,
        };
        let task = tokio::spawn(auto.run());

        Ok(AutoSyncHandle {
            shutdown_tx,
            cycles,
            task,
        })
    }

    async fn run(mut self) {
        info!(interval = ?self.interval, "Auto-sync starting");

        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick().await,

                _ = self.shutdown_rx.recv() => {
                    info!("Auto-sync shutting down");
                    break;
                }
            }
        }

        info!("Auto-sync stopped");
    }

    async fn tick(&self) {
        match self.engine.sync().await {
            Ok(report) if report.skipped => {
                debug!("Auto-sync tick skipped, sync already in flight");
            }
            Ok(report) => {
                self.cycles.fetch_add(1, Ordering::Relaxed);
                if report.failed_tables.is_empty() {
                    debug!(
                        pushed = report.pushed,
                        pulled = report.pulled,
                        "Auto-sync cycle complete"
                    );
                } else {
                    error!(failed = ?report.failed_tables, "Auto-sync cycle had failing tables");
                }
            }
            Err(e) => {
                self.cycles.fetch_add(1, Ordering::Relaxed);
                error!(?e, "Auto-sync cycle failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SyncConfig, SyncStrategy};
    use crate::remote::{MemoryBackend, RemoteBackend};
    use async_trait::async_trait;
    use serde_json::json;
    use tidepool_core::{Record, RecordKey, TableSchema, Timestamp};
    use tidepool_db::{Database, DbConfig};
    use tokio::sync::{Notify, Semaphore};

    /// Holds every upsert until a permit is added.
    struct GatedBackend {
        inner: MemoryBackend,
        gate: Semaphore,
        entered: Notify,
    }

    #[async_trait]
    impl RemoteBackend for GatedBackend {
        async fn upsert(&self, table: &str, records: &[Record], key_field: &str) -> SyncResult<()> {
            self.entered.notify_one();
            let _permit = self
                .gate
                .acquire()
                .await
                .map_err(|e| SyncError::Internal(e.to_string()))?;
            self.inner.upsert(table, records, key_field).await
        }

        async fn delete(&self, table: &str, keys: &[RecordKey]) -> SyncResult<()> {
            self.inner.delete(table, keys).await
        }

        async fn select_since(&self, table: &str, since: Option<Timestamp>) -> SyncResult<Vec<Record>> {
            self.inner.select_since(table, since).await
        }
    }

    async fn setup() -> (Database, Arc<MemoryBackend>, Arc<SyncEngine>) {
        let db = Database::new(DbConfig::in_memory().table(TableSchema::new("todos")))
            .await
            .unwrap();
        let backend = Arc::new(MemoryBackend::new());
        let config = SyncConfig::new()
            .table("todos", "todos")
            .strategy(SyncStrategy::Push);
        let engine = Arc::new(SyncEngine::new(db.clone(), backend.clone(), config).unwrap());
        (db, backend, engine)
    }

    #[tokio::test]
    async fn test_first_tick_after_one_interval() {
        let (db, backend, engine) = setup().await;
        db.table("todos").unwrap().put(json!({"id": "1"})).await.unwrap();

        let handle = AutoSync::spawn(engine, Duration::from_millis(300)).unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(backend.calls().total(), 0);

        for _ in 0..200 {
            if backend.record("todos", "1").is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(backend.record("todos", "1").is_some());
        assert!(handle.cycles() >= 1);

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_errors_do_not_stop_timer() {
        let (db, backend, engine) = setup().await;
        db.table("todos").unwrap().put(json!({"id": "1"})).await.unwrap();
        backend.fail_table("todos");

        let handle = AutoSync::spawn(engine, Duration::from_millis(20)).unwrap();
        for _ in 0..200 {
            if handle.cycles() >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(handle.cycles() >= 2);

        backend.recover_table("todos");
        for _ in 0..200 {
            if backend.record("todos", "1").is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(backend.record("todos", "1").is_some());
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_zero_interval_rejected() {
        let (_db, _backend, engine) = setup().await;
        let err = AutoSync::spawn(engine, Duration::ZERO).err().unwrap();
        assert!(err.is_config_error());
    }

    #[tokio::test]
    async fn test_ticks_skipped_while_sync_in_flight() {
        let db = Database::new(DbConfig::in_memory().table(TableSchema::new("todos")))
            .await
            .unwrap();
        let backend = Arc::new(GatedBackend {
            inner: MemoryBackend::new(),
            gate: Semaphore::new(0),
            entered: Notify::new(),
        });
        let config = SyncConfig::new()
            .table("todos", "todos")
            .strategy(SyncStrategy::Push);
        let engine = Arc::new(SyncEngine::new(db.clone(), backend.clone(), config).unwrap());
        db.table("todos").unwrap().put(json!({"id": "1"})).await.unwrap();

        let busy = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.push().await })
        };
        backend.entered.notified().await;
        assert!(engine.is_syncing());
        assert!(engine.sync().await.unwrap().skipped);

        let handle = AutoSync::spawn(engine.clone(), Duration::from_millis(10)).unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(handle.cycles(), 0);

        backend.gate.add_permits(1);
        assert_eq!(busy.await.unwrap().unwrap().pushed, 1);
        assert!(backend.inner.record("todos", "1").is_some());

        for _ in 0..200 {
            if handle.cycles() >= 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(handle.cycles() >= 1);
        handle.shutdown().await.unwrap();
    }
}
