//! # Change Log Repository
//!
//! Append-only journal of local mutations awaiting push.
//!
//! ## Lifecycle of an Entry
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  LocalTable.add/put/update/delete                                      │
//! │       │  (same transaction as the record write)                         │
//! │       ▼                                                                 │
//! │  change_log: synced = 0  ──────► get_pending_changes() (seq order)     │
//! │                                        │                                │
//! │                                        ▼                                │
//! │                              SyncEngine pushes to remote               │
//! │                                        │                                │
//! │                                        ▼                                │
//! │  change_log: synced = 1  ◄──── mark_multiple_as_synced(ids)            │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  clear_synced_changes() ← housekeeping, never touches unsynced rows    │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Entries are ordered by an autoincrement sequence, so two mutations in the
//! same millisecond still come back in the order they were made.

use sqlx::{FromRow, SqliteConnection, SqlitePool};
use tracing::debug;

use crate::error::{DbError, DbResult};
use tidepool_core::{ChangeOperation, ChangeRecord, Timestamp};

/// Row shape of the `change_log` table.
#[derive(Debug, FromRow)]
struct ChangeRow {
    id: String,
    table_name: String,
    key: String,
    operation: ChangeOperation,
    data: Option<String>,
    timestamp: Timestamp,
    synced: bool,
}

impl TryFrom<ChangeRow> for ChangeRecord {
    type Error = DbError;

    fn try_from(row: ChangeRow) -> DbResult<Self> {
        let data = row
            .data
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;

        Ok(ChangeRecord {
            id: row.id,
            table: row.table_name,
            key: row.key,
            operation: row.operation,
            data,
            timestamp: row.timestamp,
            synced: row.synced,
        })
    }
}

fn into_records(rows: Vec<ChangeRow>) -> DbResult<Vec<ChangeRecord>> {
    rows.into_iter().map(ChangeRecord::try_from).collect()
}

/// Appends an entry on the caller's connection (normally inside the
/// transaction that wrote the record).
pub(crate) async fn append(conn: &mut SqliteConnection, change: &ChangeRecord) -> DbResult<()> {
    let data = change.data.as_ref().map(serde_json::to_string).transpose()?;

    sqlx::query(
        r#"
        INSERT INTO change_log (id, table_name, key, operation, data, timestamp, synced)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        "#,
    )
    .bind(&change.id)
    .bind(&change.table)
    .bind(&change.key)
    .bind(change.operation)
    .bind(data)
    .bind(change.timestamp)
    .bind(change.synced)
    .execute(&mut *conn)
    .await?;

    debug!(
        table = %change.table,
        key = %change.key,
        operation = %change.operation,
        "Change recorded"
    );
    Ok(())
}

/// Reads and acknowledges change log entries.
#[derive(Debug, Clone)]
pub struct ChangeTracker {
    pool: SqlitePool,
}

impl ChangeTracker {
    pub fn new(pool: SqlitePool) -> Self {
        ChangeTracker { pool }
    }

    /// Returns unsynced entries, oldest first.
    ///
    /// ## Arguments
    /// * `table` - Restrict to one table, or `None` for all tables
    pub async fn get_pending_changes(&self, table: Option<&str>) -> DbResult<Vec<ChangeRecord>> {
        let rows: Vec<ChangeRow> = sqlx::query_as(
            r#"
            SELECT id, table_name, key, operation, data, timestamp, synced
            FROM change_log
            WHERE synced = 0 AND (?1 IS NULL OR table_name = ?1)
            ORDER BY seq ASC
            "#,
        )
        .bind(table)
        .fetch_all(&self.pool)
        .await?;

        into_records(rows)
    }

    /// Returns every entry of one table (synced or not), oldest first.
    pub async fn get_changes_by_table(&self, table: &str) -> DbResult<Vec<ChangeRecord>> {
        let rows: Vec<ChangeRow> = sqlx::query_as(
            r#"
            SELECT id, table_name, key, operation, data, timestamp, synced
            FROM change_log
            WHERE table_name = ?1
            ORDER BY seq ASC
            "#,
        )
        .bind(table)
        .fetch_all(&self.pool)
        .await?;

        into_records(rows)
    }

    /// Counts unsynced entries.
    pub async fn count_pending(&self, table: Option<&str>) -> DbResult<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM change_log WHERE synced = 0 AND (?1 IS NULL OR table_name = ?1)",
        )
        .bind(table)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    /// Marks one entry as synced. Unknown ids are ignored.
    pub async fn mark_as_synced(&self, id: &str) -> DbResult<()> {
        sqlx::query("UPDATE change_log SET synced = 1 WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Marks many entries as synced in one transaction.
    ///
    /// ## Returns
    /// Number of entries that changed from unsynced to synced.
    pub async fn mark_multiple_as_synced<S: AsRef<str>>(&self, ids: &[S]) -> DbResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        let mut marked = 0;
        for id in ids {
            marked += sqlx::query("UPDATE change_log SET synced = 1 WHERE id = ?1 AND synced = 0")
                .bind(id.as_ref())
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }
        tx.commit().await?;

        debug!(requested = ids.len(), marked, "Changes marked as synced");
        Ok(marked)
    }

    /// Deletes synced entries. Unsynced entries are never removed.
    pub async fn clear_synced_changes(&self) -> DbResult<u64> {
        let removed = sqlx::query("DELETE FROM change_log WHERE synced = 1")
            .execute(&self.pool)
            .await?
            .rows_affected();

        debug!(removed, "Synced changes cleared");
        Ok(removed)
    }
}
