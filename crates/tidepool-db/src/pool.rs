//! # Database Pool Management
//!
//! Connection pool creation, declared table schemas and the entry points to
//! every repository.
//!
//! ## Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Database (Clone)                                │
//! │                                                                         │
//! │  DbConfig::new(path).table(schema)...                                  │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  Database::new(config).await ← validate schemas, create pool,          │
//! │       │                        run migrations, ensure indexes           │
//! │       ▼                                                                 │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐  ┌────────────┐  │
//! │  │  SqlitePool  │  │   schemas    │  │  ChangeBus   │  │ live views │  │
//! │  │  (WAL mode)  │  │ name → Arc<> │  │  broadcast   │──►  refresh   │  │
//! │  └──────┬───────┘  └──────┬───────┘  └──────▲───────┘  └────────────┘  │
//! │         │                 │                 │                           │
//! │         ▼                 ▼                 │ publish(table)            │
//! │  db.table("todos") ─► LocalTable ───────────┘ after commit              │
//! │  db.change_tracker() ─► ChangeTracker                                  │
//! │  db.sync_metadata()  ─► SyncMetadataRepository                         │
//! │  db.transaction()    ─► ScopedTransaction                              │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## WAL Mode
//! SQLite WAL (Write-Ahead Logging) mode is enabled so readers don't block
//! writers and writers don't block readers.

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use tidepool_core::{CoreError, TableSchema, ValidationError};

use crate::error::{DbError, DbResult};
use crate::live::{ChangeBus, LiveView, DEFAULT_BUS_CAPACITY};
use crate::migrations;
use crate::repository::change_log::ChangeTracker;
use crate::repository::metadata::SyncMetadataRepository;
use crate::repository::table::LocalTable;
use crate::transaction::ScopedTransaction;

// =============================================================================
// Configuration
// =============================================================================

/// Database configuration.
///
/// ## Example
/// ```rust,ignore
/// let config = DbConfig::new("/path/to/tidepool.db")
///     .table(TableSchema::new("todos").auto_increment().index("done"))
///     .table(TableSchema::new("users").timestamps())
///     .max_connections(5);
/// ```
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Path to the SQLite database file.
    pub database_path: PathBuf,

    /// Declared tables. Writes to undeclared tables are rejected.
    pub tables: Vec<TableSchema>,

    /// Maximum number of connections in the pool.
    /// Default: 5
    pub max_connections: u32,

    /// Minimum number of connections to keep alive.
    /// Default: 1
    pub min_connections: u32,

    /// Connection timeout duration.
    /// Default: 30 seconds
    pub connect_timeout: Duration,

    /// Idle timeout before closing a connection.
    /// Default: 10 minutes
    pub idle_timeout: Duration,

    /// Whether to run migrations on connect.
    /// Default: true
    pub run_migrations: bool,

    /// Buffered invalidations per live view before it resyncs.
    /// Default: 256
    pub bus_capacity: usize,
}

impl DbConfig {
    /// Creates a new database configuration with the given path.
    ///
    /// ## Arguments
    /// * `path` - Path to the SQLite database file. Will be created if it doesn't exist.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        DbConfig {
            database_path: path.into(),
            tables: Vec::new(),
            max_connections: 5,
            min_connections: 1,
            connect_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600),
            run_migrations: true,
            bus_capacity: DEFAULT_BUS_CAPACITY,
        }
    }

    /// Declares a table.
    pub fn table(mut self, schema: TableSchema) -> Self {
        self.tables.push(schema);
        self
    }

    /// Sets the maximum number of connections.
    pub fn max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    /// Sets the minimum number of connections.
    pub fn min_connections(mut self, min: u32) -> Self {
        self.min_connections = min;
        self
    }

    /// Sets the connection timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets whether to run migrations on connect.
    pub fn run_migrations(mut self, run: bool) -> Self {
        self.run_migrations = run;
        self
    }

    /// Sets the live view invalidation buffer size.
    pub fn bus_capacity(mut self, capacity: usize) -> Self {
        self.bus_capacity = capacity;
        self
    }

    /// Creates an in-memory database configuration (for testing).
    ///
    /// ## Usage
    /// ```rust,ignore
    /// let config = DbConfig::in_memory().table(TableSchema::new("todos"));
    /// let db = Database::new(config).await?;
    /// ```
    pub fn in_memory() -> Self {
        DbConfig {
            database_path: PathBuf::from(":memory:"),
            max_connections: 1, // In-memory requires single connection
            min_connections: 1,
            connect_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(60),
            ..DbConfig::new(":memory:")
        }
    }
}

// =============================================================================
// Database
// =============================================================================

/// Main database handle providing repository access.
///
/// Cheap to clone; clones share the pool, the schemas and the change bus.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
    schemas: Arc<HashMap<String, Arc<TableSchema>>>,
    bus: ChangeBus,
}

impl Database {
    /// Creates a new database connection pool.
    ///
    /// ## What This Does
    /// 1. Validates every declared schema (names, index paths, duplicates)
    /// 2. Creates the database file if it doesn't exist
    /// 3. Creates the connection pool (WAL, NORMAL synchronous)
    /// 4. Runs migrations and creates declared indexes (if enabled)
    ///
    /// ## Returns
    /// * `Ok(Database)` - Ready-to-use database handle
    /// * `Err(DbError)` - Invalid schema, connection or migration failed
    pub async fn new(config: DbConfig) -> DbResult<Self> {
        info!(
            path = %config.database_path.display(),
            tables = config.tables.len(),
            "Initializing database connection"
        );

        let mut schemas = HashMap::with_capacity(config.tables.len());
        for schema in config.tables {
            schema.validate()?;
            if schemas.contains_key(&schema.name) {
                return Err(CoreError::Validation(ValidationError::Duplicate {
                    field: "table".to_string(),
                    value: schema.name,
                })
                .into());
            }
            schemas.insert(schema.name.clone(), Arc::new(schema));
        }

        let connect_url = format!("sqlite://{}?mode=rwc", config.database_path.display());

        let connect_options = SqliteConnectOptions::from_str(&connect_url)
            .map_err(|e| DbError::ConnectionFailed(e.to_string()))?
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .create_if_missing(true);

        debug!("Connection options configured");

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.connect_timeout)
            .idle_timeout(Some(config.idle_timeout))
            .connect_with(connect_options)
            .await
            .map_err(|e| DbError::ConnectionFailed(e.to_string()))?;

        info!(
            max_connections = config.max_connections,
            "Database pool created"
        );

        let db = Database {
            pool,
            schemas: Arc::new(schemas),
            bus: ChangeBus::new(config.bus_capacity),
        };

        if config.run_migrations {
            db.run_migrations().await?;
        }

        Ok(db)
    }

    /// Runs database migrations, then ensures declared indexes exist.
    ///
    /// ## When To Call
    /// - Automatically called by `new()` if `run_migrations` is true
    /// - Manually call when migrations are disabled in config
    pub async fn run_migrations(&self) -> DbResult<()> {
        info!("Running database migrations");
        migrations::run_migrations(&self.pool).await?;
        let indexes =
            migrations::ensure_indexes(&self.pool, self.schemas.values().map(Arc::as_ref)).await?;
        info!(indexes, "Migrations complete");
        Ok(())
    }

    /// Returns a reference to the connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Returns the repository for a declared table.
    ///
    /// ## Errors
    /// * `UnknownTable` - the table was not declared in [`DbConfig`]
    pub fn table(&self, name: &str) -> DbResult<LocalTable> {
        let schema = self.schema(name)?;
        Ok(LocalTable::new(self.pool.clone(), schema, self.bus.clone()))
    }

    /// Returns the declared schema of a table.
    pub fn schema(&self, name: &str) -> DbResult<Arc<TableSchema>> {
        self.schemas
            .get(name)
            .cloned()
            .ok_or_else(|| DbError::UnknownTable(name.to_string()))
    }

    /// Declared table names, sorted.
    pub fn table_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.schemas.keys().cloned().collect();
        names.sort();
        names
    }

    /// Returns the change log reader.
    pub fn change_tracker(&self) -> ChangeTracker {
        ChangeTracker::new(self.pool.clone())
    }

    /// Returns the sync metadata repository.
    pub fn sync_metadata(&self) -> SyncMetadataRepository {
        SyncMetadataRepository::new(self.pool.clone())
    }

    /// Starts a transaction spanning any declared tables.
    ///
    /// On an in-memory database the single connection is held until the
    /// transaction ends; do not use other repositories meanwhile.
    pub async fn transaction(&self) -> DbResult<ScopedTransaction> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| DbError::TransactionFailed(e.to_string()))?;
        Ok(ScopedTransaction::new(
            tx,
            Arc::clone(&self.schemas),
            self.bus.clone(),
        ))
    }

    /// The bus live views listen on.
    pub fn changes(&self) -> &ChangeBus {
        &self.bus
    }

    /// A live view over an arbitrary query depending on `tables`.
    ///
    /// ## Example
    /// ```rust,ignore
    /// let db2 = db.clone();
    /// let open_count = db.live(["todos"], move || {
    ///     let db = db2.clone();
    ///     async move { db.table("todos")?.query().where_eq("done", false).count().await }
    /// });
    /// ```
    pub fn live<T, F, Fut>(&self, tables: impl IntoIterator<Item = impl Into<String>>, query: F) -> LiveView<T>
    where
        T: Send + Sync + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = DbResult<T>> + Send + 'static,
    {
        LiveView::new(self.bus.clone(), tables, query)
    }

    /// Closes the database connection pool.
    ///
    /// After calling close, all repository operations will fail.
    pub async fn close(&self) {
        info!("Closing database connection pool");
        self.pool.close().await;
    }

    /// Checks if the database is healthy (can execute queries).
    pub async fn health_check(&self) -> bool {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .is_ok()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
