//! # tidepool-sync: Sync Engine for Tidepool
//!
//! Keeps the local store and a remote backend in step while every local
//! read and write stays offline-capable.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Sync Architecture                                │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                   LocalStore (owner)                             │  │
//! │  │                                                                  │  │
//! │  │  Database (tidepool-db) + optional SyncEngine                    │  │
//! │  │  Starts/stops background tasks                                   │  │
//! │  └────────────────────────────┬─────────────────────────────────────┘  │
//! │                               │                                         │
//! │         ┌─────────────────────┼─────────────────────┐                  │
//! │         ▼                     ▼                     ▼                   │
//! │  ┌────────────────┐  ┌────────────────┐  ┌────────────────────────┐    │
//! │  │   AutoSync     │  │  SyncEngine    │  │  RealtimeHandler       │    │
//! │  │                │  │                │  │                        │    │
//! │  │ Timer running  │  │ push / pull /  │  │ Applies the backend    │    │
//! │  │ the configured │  │ full/push_all  │  │ change feed, resub-    │    │
//! │  │ strategy       │  │ single flight  │  │ scribes with backoff   │    │
//! │  └────────────────┘  └───────┬────────┘  └────────────────────────┘    │
//! │                              │                                          │
//! │                              ▼                                          │
//! │                   ┌────────────────────┐                                │
//! │                   │   RemoteBackend    │  (MemoryBackend in-process)    │
//! │                   └────────────────────┘                                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//! - [`store`] - `LocalStore` and its builder
//! - [`engine`] - `SyncEngine` operations and `SyncReport`
//! - [`outbox`] - Folding the change log into push batches
//! - [`remote`] - `RemoteBackend` trait, realtime events, `MemoryBackend`
//! - [`agent`] - Auto-sync timer
//! - [`inbound`] - Realtime change feed handler
//! - [`config`] - Sync configuration (tables, strategy, timers)
//! - [`error`] - Sync error types
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tidepool_core::TableSchema;
//! use tidepool_db::DbConfig;
//! use tidepool_sync::{LocalStore, MemoryBackend, SyncConfig};
//!
//! let store = LocalStore::builder(DbConfig::new("app.db").table(TableSchema::new("todos")))
//!     .with_remote(Arc::new(MemoryBackend::new()))
//!     .with_sync_config(SyncConfig::load_or_default(None).table("todos", "todos"))
//!     .build()
//!     .await?;
//!
//! store.start().await?;
//! store.table("todos")?.add(json!({"title": "Write docs"})).await?;
//! let report = store.sync().await?;
//! println!("pushed {} pulled {}", report.pushed, report.pulled);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod agent;
pub mod config;
pub mod engine;
pub mod error;
pub mod inbound;
pub mod outbox;
pub mod remote;
pub mod store;

// =============================================================================
// Re-exports
// =============================================================================

pub use agent::{AutoSync, AutoSyncHandle};
pub use config::{SyncConfig, SyncSettings, SyncStrategy};
pub use engine::{SyncEngine, SyncReport};
pub use error::{SyncError, SyncResult};
pub use inbound::{FeedState, RealtimeHandle, RealtimeHandler};
pub use outbox::PushBatch;
pub use remote::{CallCounts, MemoryBackend, RealtimeEvent, RealtimeEventType, RemoteBackend};
pub use store::{LocalStore, LocalStoreBuilder};
