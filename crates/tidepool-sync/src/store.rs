//! # Local Store
//!
//! The application-facing owner of the local database and, when a remote
//! backend is supplied, the sync engine and its background tasks.
//!
//! ```text
//! LocalStoreBuilder::new(db_config)
//!     .with_remote(backend)          ── optional: without it the store is offline
//!     .with_sync_config(config)      ── tables to sync, strategy, timers
//!     .with_conflict_handler(h)      ── optional custom resolution
//!     .build().await?
//!
//! store.start().await?   ── auto-sync timer + realtime feed (if enabled)
//! store.table("todos")?  ── LocalTable
//! store.sync().await?    ── one cycle of the configured strategy
//! store.stop().await?
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use tidepool_core::{ConflictHandler, ConflictStrategy};
use tidepool_db::{Database, DbConfig, LocalTable, ScopedTransaction};

use crate::agent::{AutoSync, AutoSyncHandle};
use crate::config::SyncConfig;
use crate::engine::{SyncEngine, SyncReport};
use crate::error::{SyncError, SyncResult};
use crate::inbound::{RealtimeHandle, RealtimeHandler};
use crate::remote::RemoteBackend;

#[derive(Default)]
struct BackgroundTasks {
    auto_sync: Option<AutoSyncHandle>,
    realtime: Option<RealtimeHandle>,
}

/// Owner of the local database and the optional sync engine.
pub struct LocalStore {
    db: Database,
    sync: Option<(Arc<SyncEngine>, Arc<dyn RemoteBackend>)>,
    tasks: Mutex<BackgroundTasks>,
    closed: AtomicBool,
}

impl std::fmt::Debug for LocalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalStore")
            .field("db", &self.db)
            .field("engine", &self.sync.as_ref().map(|(engine, _)| engine))
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl LocalStore {
    pub fn builder(db_config: DbConfig) -> LocalStoreBuilder {
        LocalStoreBuilder::new(db_config)
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// The sync engine, or `None` for an offline store.
    pub fn engine(&self) -> Option<&Arc<SyncEngine>> {
        self.sync.as_ref().map(|(engine, _)| engine)
    }

    pub fn is_offline(&self) -> bool {
        self.sync.is_none()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> SyncResult<()> {
        if self.is_closed() {
            return Err(SyncError::ShuttingDown);
        }
        Ok(())
    }

    pub fn table(&self, name: &str) -> SyncResult<LocalTable> {
        Ok(self.db.table(name)?)
    }

    pub async fn transaction(&self) -> SyncResult<ScopedTransaction> {
        Ok(self.db.transaction().await?)
    }

    /// Runs the configured strategy once. An offline store reports a skip.
    ///
    /// ## Errors
    /// * `ShuttingDown` - the store was closed
    pub async fn sync(&self) -> SyncResult<SyncReport> {
        self.ensure_open()?;
        match self.engine() {
            Some(engine) => engine.sync().await,
            None => {
                debug!("Offline store, sync skipped");
                Ok(SyncReport::skipped())
            }
        }
    }

    /// Starts the auto-sync timer and realtime feed when configured.
    ///
    /// Calling it again while tasks run has no effect. A closed store
    /// cannot be restarted (`ShuttingDown`).
    pub async fn start(&self) -> SyncResult<()> {
        self.ensure_open()?;
        let Some((engine, remote)) = &self.sync else {
            debug!("Offline store, no background tasks");
            return Ok(());
        };
        let config = engine.config();
        let mut tasks = self.tasks.lock().await;

        if config.sync.auto_sync && tasks.auto_sync.is_none() {
            tasks.auto_sync = Some(AutoSync::spawn(engine.clone(), config.sync_interval())?);
        }
        if config.sync.realtime && tasks.realtime.is_none() {
            tasks.realtime = Some(RealtimeHandler::spawn(engine.clone(), remote.clone(), config));
        }

        info!(
            auto_sync = tasks.auto_sync.is_some(),
            realtime = tasks.realtime.is_some(),
            "Local store started"
        );
        Ok(())
    }

    /// True while the auto-sync timer runs.
    pub async fn is_auto_syncing(&self) -> bool {
        self.tasks.lock().await.auto_sync.is_some()
    }

    /// True while the realtime handler runs.
    pub async fn is_realtime(&self) -> bool {
        self.tasks.lock().await.realtime.is_some()
    }

    /// Stops background tasks, waiting for in-flight work.
    pub async fn stop(&self) -> SyncResult<()> {
        let mut tasks = self.tasks.lock().await;
        if let Some(handle) = tasks.auto_sync.take() {
            handle.shutdown().await?;
        }
        if let Some(handle) = tasks.realtime.take() {
            handle.shutdown().await?;
        }
        debug!("Local store background tasks stopped");
        Ok(())
    }

    /// Stops background tasks and closes the database. Closing twice is a no-op.
    pub async fn close(&self) -> SyncResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.stop().await?;
        self.db.close().await;
        Ok(())
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Builder for [`LocalStore`].
pub struct LocalStoreBuilder {
    db_config: DbConfig,
    remote: Option<Arc<dyn RemoteBackend>>,
    sync_config: Option<SyncConfig>,
    conflict: Option<ConflictStrategy>,
}

impl LocalStoreBuilder {
    pub fn new(db_config: DbConfig) -> Self {
        LocalStoreBuilder {
            db_config,
            remote: None,
            sync_config: None,
            conflict: None,
        }
    }

    /// Enables sync against `remote`.
    pub fn with_remote(mut self, remote: Arc<dyn RemoteBackend>) -> Self {
        self.remote = Some(remote);
        self
    }

    /// Sets the sync configuration. Without one, every declared table
    /// syncs under its own name with default settings.
    pub fn with_sync_config(mut self, config: SyncConfig) -> Self {
        self.sync_config = Some(config);
        self
    }

    /// Overrides the configured conflict policy.
    pub fn with_conflict_strategy(mut self, strategy: ConflictStrategy) -> Self {
        self.conflict = Some(strategy);
        self
    }

    pub fn with_conflict_handler(self, handler: impl ConflictHandler + 'static) -> Self {
        self.with_conflict_strategy(ConflictStrategy::custom(handler))
    }

    /// Opens the database and creates the engine.
    ///
    /// ## Errors
    /// * `Database` - the database could not be opened or migrated
    /// * `InvalidConfig` / `UnknownTable` - the sync configuration is unusable
    pub async fn build(self) -> SyncResult<LocalStore> {
        let db = Database::new(self.db_config).await?;

        let sync = match self.remote {
            Some(remote) => {
                let config = self.sync_config.unwrap_or_else(|| {
                    db.table_names()
                        .into_iter()
                        .fold(SyncConfig::new(), |config, name| config.table(name.clone(), name))
                });

                let mut engine = SyncEngine::new(db.clone(), remote.clone(), config)?;
                if let Some(strategy) = self.conflict {
                    engine = engine.with_conflict_strategy(strategy);
                }
                Some((Arc::new(engine), remote))
            }
            None => {
                if self.sync_config.is_some() {
                    warn!("Sync configuration given without a remote backend, store is offline");
                }
                None
            }
        };

        info!(
            tables = db.table_names().len(),
            offline = sync.is_none(),
            "Local store ready"
        );

        Ok(LocalStore {
            db,
            sync,
            tasks: Mutex::new(BackgroundTasks::default()),
            closed: AtomicBool::new(false),
        })
    }
}
