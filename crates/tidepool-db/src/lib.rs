//! # tidepool-db: Local Store for Tidepool
//!
//! Keyed tables, an atomic change log, queries and live views on SQLite,
//! using sqlx for async access.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Tidepool Data Flow                               │
//! │                                                                         │
//! │  table.add(record) / tx.commit() / SyncEngine.pull()                   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                   tidepool-db (THIS CRATE)                      │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────────┐    ┌───────────────┐    ┌──────────────┐  │   │
//! │  │   │   Database    │    │  Repositories │    │  Migrations  │  │   │
//! │  │   │   (pool.rs)   │    │               │    │  + indexes   │  │   │
//! │  │   │               │    │ LocalTable    │    │              │  │   │
//! │  │   │ SqlitePool    │◄───│ ChangeTracker │    │ 001_init.sql │  │   │
//! │  │   │ Schemas       │    │ SyncMetadata  │    │ json_extract │  │   │
//! │  │   │ ChangeBus ────┼──┐ └───────────────┘    └──────────────┘  │   │
//! │  │   └───────────────┘  │                                         │   │
//! │  │                      └──► LiveView (re-runs query, notifies)   │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                     SQLite Database (WAL)                       │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`pool`] - Connection pool, declared schemas, repository access
//! - [`migrations`] - Embedded migrations and secondary indexes
//! - [`repository`] - LocalTable, ChangeTracker, SyncMetadataRepository
//! - [`query`] - Chainable table queries
//! - [`transaction`] - Multi-table transactions
//! - [`live`] - Change bus and live views
//! - [`error`] - Database error types
//!
//! ## Usage
//!
//! ```rust,ignore
//! use serde_json::json;
//! use tidepool_core::TableSchema;
//! use tidepool_db::{Database, DbConfig};
//!
//! let config = DbConfig::new("path/to/tidepool.db")
//!     .table(TableSchema::new("todos").auto_increment().index("done"));
//! let db = Database::new(config).await?;
//!
//! let todos = db.table("todos")?;
//! let key = todos.add(json!({"title": "write docs", "done": false})).await?;
//! let open = todos.query().where_eq("done", false).to_vec().await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod live;
pub mod migrations;
pub mod pool;
pub mod query;
pub mod repository;
pub mod transaction;

// =============================================================================
// Re-exports
// =============================================================================

pub use error::{DbError, DbResult};
pub use live::{ChangeBus, LiveSubscription, LiveView, TableChange};
pub use pool::{Database, DbConfig};
pub use query::TableQuery;
pub use transaction::ScopedTransaction;

// Repository re-exports for convenience
pub use repository::change_log::ChangeTracker;
pub use repository::metadata::SyncMetadataRepository;
pub use repository::table::{LocalTable, WriteOrigin};
