//! # Repository Module
//!
//! Repositories over the fixed store tables.
//!
//! ## Layout
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  Application                          SyncEngine                       │
//! │       │                                    │                            │
//! │       │ db.table("todos")                  │ db.change_tracker()        │
//! │       ▼                                    ▼ db.sync_metadata()         │
//! │  LocalTable ──── writes ────► records + change_log (one transaction)   │
//! │                                    │                                    │
//! │                                    ▼                                    │
//! │                    ChangeTracker / SyncMetadataRepository               │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Available Repositories
//!
//! - [`LocalTable`] - Keyed CRUD on one declared table
//! - [`ChangeTracker`] - Pending change entries for push
//! - [`SyncMetadataRepository`] - Per-table sync bookkeeping

pub mod change_log;
pub mod metadata;
pub mod table;

pub use change_log::ChangeTracker;
pub use metadata::SyncMetadataRepository;
pub use table::{LocalTable, WriteOrigin};
