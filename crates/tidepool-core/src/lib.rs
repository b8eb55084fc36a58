//! # tidepool-core: Pure Data Model for Tidepool
//!
//! This crate holds every type and algorithm of the local-first data layer
//! that does not need I/O.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Tidepool Architecture                            │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                    Application code                             │   │
//! │  │     table.add(..) ──► table.query().where(..) ──► view.live()   │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │          tidepool-sync (SyncEngine, RemoteBackend)              │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │     tidepool-db (LocalTable, ChangeTracker, LiveView)           │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               ★ tidepool-core (THIS CRATE) ★                    │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────┐  ┌───────────┐  ┌───────────┐  ┌───────────┐  │   │
//! │  │   │   types   │  │   query   │  │ conflict  │  │ validation│  │   │
//! │  │   │  Record   │  │WhereClause│  │ Resolver  │  │  names    │  │   │
//! │  │   │ChangeRec. │  │ sort/page │  │ Strategy  │  │  keys     │  │   │
//! │  │   └───────────┘  └───────────┘  └───────────┘  └───────────┘  │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO DATABASE • NO NETWORK                            │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - Records, change log entries, sync metadata, table schemas
//! - [`query`] - Where clauses, value ordering, sort and pagination
//! - [`conflict`] - Conflict detection and resolution strategies
//! - [`error`] - Domain error types
//! - [`validation`] - Name and key validation
//!
//! ## Example Usage
//!
//! ```rust
//! use serde_json::json;
//! use tidepool_core::{QuerySpec, SortSpec, WhereClause};
//!
//! let spec = QuerySpec {
//!     clauses: vec![WhereClause::eq("done", false)],
//!     sort: Some(SortSpec::asc("title")),
//!     ..Default::default()
//! };
//!
//! let rows = vec![
//!     json!({"id": 1, "title": "b", "done": false}),
//!     json!({"id": 2, "title": "a", "done": false}),
//!     json!({"id": 3, "title": "c", "done": true}),
//! ];
//! let out = spec.apply(rows, None);
//! assert_eq!(out[0]["id"], 2);
//! assert_eq!(out.len(), 2);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod conflict;
pub mod error;
pub mod query;
pub mod types;
pub mod validation;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use conflict::{
    Conflict, ConflictHandler, ConflictResolver, ConflictStrategy, DEFAULT_CONFLICT_THRESHOLD_MS,
};
pub use error::{CoreError, CoreResult, ValidationError};
pub use query::{Condition, QuerySpec, SortDirection, SortSpec, WhereClause};
pub use types::*;
