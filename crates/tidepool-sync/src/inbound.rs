//! # Realtime Handler
//!
//! Applies the backend change feed to the local store as events arrive.
//!
//! ## Feed Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │   CONNECTING ──subscribe ok──► SUBSCRIBED ──feed closed──► BACKOFF     │
//! │       ▲                            │                          │         │
//! │       │                            │ event                    │ sleep   │
//! │       │                            ▼                          │ 0.5s,1s │
//! │       │                  engine.apply_realtime_event          │ ..60s   │
//! │       └───────────────────────────────────────────────────────┘         │
//! │                                                                         │
//! │   subscribe → None (no feed)  ──► UNSUPPORTED (task ends)               │
//! │   shutdown at any point       ──► STOPPED                               │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Events bypass conflict detection and the change log, so they overwrite
//! unsynced local edits.

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::SyncConfig;
use crate::engine::SyncEngine;
use crate::error::{SyncError, SyncResult};
use crate::remote::{RealtimeEvent, RemoteBackend};

// =============================================================================
// Feed State
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedState {
    Connecting,
    Subscribed,
    Backoff,
    /// The backend has no change feed.
    Unsupported,
    Stopped,
}

impl std::fmt::Display for FeedState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FeedState::Connecting => write!(f, "connecting"),
            FeedState::Subscribed => write!(f, "subscribed"),
            FeedState::Backoff => write!(f, "backoff"),
            FeedState::Unsupported => write!(f, "unsupported"),
            FeedState::Stopped => write!(f, "stopped"),
        }
    }
}

// =============================================================================
// Handle
// =============================================================================

/// Controls a running [`RealtimeHandler`]. Dropping it stops the task.
pub struct RealtimeHandle {
    shutdown_tx: mpsc::Sender<()>,
    state: Arc<RwLock<FeedState>>,
    task: JoinHandle<()>,
}

impl RealtimeHandle {
    pub async fn state(&self) -> FeedState {
        *self.state.read().await
    }

    /// Stops the handler and waits for it to finish.
    pub async fn shutdown(self) -> SyncResult<()> {
        // A closed channel means the task already ended.
        let _ = self.shutdown_tx.send(()).await;
        self.task
            .await
            .map_err(|e| SyncError::Internal(format!("realtime task failed: {}", e)))
    }
}

// =============================================================================
// Realtime Handler
// =============================================================================

pub struct RealtimeHandler {
    engine: Arc<SyncEngine>,
    remote: Arc<dyn RemoteBackend>,
    /// Remote table names to subscribe to.
    tables: Vec<String>,
    initial_backoff: Duration,
    max_backoff: Duration,
    state: Arc<RwLock<FeedState>>,
    shutdown_rx: mpsc::Receiver<()>,
}

impl RealtimeHandler {
    /// Spawns the handler for every table mapped in `config`.
    pub fn spawn(
        engine: Arc<SyncEngine>,
        remote: Arc<dyn RemoteBackend>,
        config: &SyncConfig,
    ) -> RealtimeHandle {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let state = Arc::new(RwLock::new(FeedState::Connecting));

        let handler = RealtimeHandler {
            engine,
            remote,
            tables: config.tables.values().cloned().collect(),
            initial_backoff: Duration::from_millis(config.sync.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.sync.max_backoff_ms),
            state: state.clone(),
            shutdown_rx,
        };

        let task = tokio::spawn(handler.run());

        RealtimeHandle {
            shutdown_tx,
            state,
            task,
        }
    }

    async fn run(mut self) {
        info!(tables = ?self.tables, "Realtime handler starting");

        let mut backoff = self.create_backoff();

        loop {
            *self.state.write().await = FeedState::Connecting;

            match self.remote.subscribe(&self.tables).await {
                Ok(Some(feed)) => {
                    info!("Change feed subscribed");
                    *self.state.write().await = FeedState::Subscribed;
                    backoff.reset();

                    if self.consume(feed).await {
                        break;
                    }
                    warn!("Change feed closed");
                }
                Ok(None) => {
                    warn!("Backend has no change feed, realtime disabled");
                    *self.state.write().await = FeedState::Unsupported;
                    return;
                }
                Err(e) => {
                    error!(?e, "Failed to subscribe to change feed");
                }
            }

            *self.state.write().await = FeedState::Backoff;

            match backoff.next_backoff() {
                Some(duration) => {
                    debug!(?duration, "Waiting before resubscribe");
                    tokio::select! {
                        _ = tokio::time::sleep(duration) => {}
                        _ = self.shutdown_rx.recv() => {
                            info!("Shutdown during backoff");
                            break;
                        }
                    }
                }
                None => {
                    error!("Backoff exhausted");
                    break;
                }
            }
        }

        *self.state.write().await = FeedState::Stopped;
        info!("Realtime handler stopped");
    }

    /// Applies events until the feed ends. Returns true on shutdown.
    async fn consume(&mut self, mut feed: mpsc::Receiver<RealtimeEvent>) -> bool {
        loop {
            tokio::select! {
                event = feed.recv() => match event {
                    Some(event) => {
                        if let Err(e) = self.engine.apply_realtime_event(&event).await {
                            error!(?e, table = %event.table, "Failed to apply realtime event");
                        }
                    }
                    None => return false,
                },

                _ = self.shutdown_rx.recv() => {
                    info!("Realtime handler shutting down");
                    return true;
                }
            }
        }
    }

    fn create_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: self.initial_backoff,
            max_interval: self.max_backoff,
            multiplier: 2.0,
            max_elapsed_time: None,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MemoryBackend;
    use serde_json::json;
    use tidepool_core::TableSchema;
    use tidepool_db::{Database, DbConfig};

    async fn setup(backend: Arc<MemoryBackend>) -> (Database, Arc<SyncEngine>, SyncConfig) {
        let db = Database::new(DbConfig::in_memory().table(TableSchema::new("todos")))
            .await
            .unwrap();
        let mut config = SyncConfig::new().table("todos", "remote_todos").realtime(true);
        config.sync.initial_backoff_ms = 10;
        config.sync.max_backoff_ms = 50;
        let engine = Arc::new(SyncEngine::new(db.clone(), backend, config.clone()).unwrap());
        (db, engine, config)
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..300 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_events_applied_and_feed_resubscribed() {
        let backend = Arc::new(MemoryBackend::new());
        let (db, engine, config) = setup(backend.clone()).await;
        let handle = RealtimeHandler::spawn(engine, backend.clone(), &config);

        eventually(|| backend.open_feeds() == 1).await;
        backend.emit(RealtimeEvent::insert("remote_todos", json!({"id": "1", "title": "hi"})));

        let todos = db.table("todos").unwrap();
        let mut found = false;
        for _ in 0..300 {
            if todos.get("1").await.unwrap().is_some() {
                found = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(found);
        assert_eq!(db.change_tracker().count_pending(None).await.unwrap(), 0);

        backend.close_feeds();
        eventually(|| backend.calls().subscribes >= 2 && backend.open_feeds() == 1).await;
        assert_eq!(handle.state().await, FeedState::Subscribed);

        handle.shutdown().await.unwrap();
        assert_eq!(backend.open_feeds(), 0);
    }

    #[tokio::test]
    async fn test_backend_without_feed() {
        let backend = Arc::new(MemoryBackend::without_realtime());
        let (_db, engine, config) = setup(backend.clone()).await;
        let handle = RealtimeHandler::spawn(engine, backend.clone(), &config);

        eventually(|| backend.calls().subscribes == 1).await;
        let mut state = handle.state().await;
        for _ in 0..100 {
            if state == FeedState::Unsupported {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            state = handle.state().await;
        }
        assert_eq!(state, FeedState::Unsupported);
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_subscribe_retries() {
        let backend = Arc::new(MemoryBackend::new());
        backend.fail_table("remote_todos");
        let (_db, engine, config) = setup(backend.clone()).await;
        let handle = RealtimeHandler::spawn(engine, backend.clone(), &config);

        eventually(|| backend.calls().subscribes >= 2).await;
        backend.recover_table("remote_todos");
        eventually(|| backend.open_feeds() == 1).await;

        handle.shutdown().await.unwrap();
    }
}
