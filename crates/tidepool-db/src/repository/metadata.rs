//! # Sync Metadata Repository
//!
//! One row per table that has been through at least one sync cycle.

use sqlx::{FromRow, SqlitePool};

use crate::error::DbResult;
use tidepool_core::{now_millis, SyncMetadata, SyncState, Timestamp};

#[derive(Debug, FromRow)]
struct MetadataRow {
    table_name: String,
    last_sync_timestamp: Timestamp,
    last_remote_version: Option<String>,
    pending_changes: i64,
    sync_status: SyncState,
}

impl From<MetadataRow> for SyncMetadata {
    fn from(row: MetadataRow) -> Self {
        SyncMetadata {
            table: row.table_name,
            last_sync_timestamp: row.last_sync_timestamp,
            last_remote_version: row.last_remote_version,
            pending_changes: row.pending_changes,
            sync_status: row.sync_status,
        }
    }
}

/// Repository for per-table sync bookkeeping.
#[derive(Debug, Clone)]
pub struct SyncMetadataRepository {
    pool: SqlitePool,
}

impl SyncMetadataRepository {
    pub fn new(pool: SqlitePool) -> Self {
        SyncMetadataRepository { pool }
    }

    /// Gets metadata for a table, or `None` if it has never synced.
    pub async fn get(&self, table: &str) -> DbResult<Option<SyncMetadata>> {
        let row: Option<MetadataRow> = sqlx::query_as(
            r#"
            SELECT table_name, last_sync_timestamp, last_remote_version,
                   pending_changes, sync_status
            FROM sync_metadata
            WHERE table_name = ?1
            "#,
        )
        .bind(table)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(SyncMetadata::from))
    }

    /// Gets metadata for a table, falling back to a fresh, never-synced value.
    pub async fn get_or_default(&self, table: &str) -> DbResult<SyncMetadata> {
        Ok(self
            .get(table)
            .await?
            .unwrap_or_else(|| SyncMetadata::new(table)))
    }

    /// Lists metadata for every table that has synced, by table name.
    pub async fn list(&self) -> DbResult<Vec<SyncMetadata>> {
        let rows: Vec<MetadataRow> = sqlx::query_as(
            r#"
            SELECT table_name, last_sync_timestamp, last_remote_version,
                   pending_changes, sync_status
            FROM sync_metadata
            ORDER BY table_name
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(SyncMetadata::from).collect())
    }

    /// Writes a full metadata row.
    pub async fn upsert(&self, meta: &SyncMetadata) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_metadata (
                table_name, last_sync_timestamp, last_remote_version,
                pending_changes, sync_status, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT (table_name) DO UPDATE SET
                last_sync_timestamp = excluded.last_sync_timestamp,
                last_remote_version = excluded.last_remote_version,
                pending_changes = excluded.pending_changes,
                sync_status = excluded.sync_status,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&meta.table)
        .bind(meta.last_sync_timestamp)
        .bind(&meta.last_remote_version)
        .bind(meta.pending_changes)
        .bind(meta.sync_status)
        .bind(now_millis())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Sets status to `syncing`.
    pub async fn mark_syncing(&self, table: &str) -> DbResult<()> {
        let mut meta = self.get_or_default(table).await?;
        meta.sync_status = SyncState::Syncing;
        self.upsert(&meta).await
    }

    /// Records a finished cycle.
    ///
    /// ## Arguments
    /// * `pulled_at` - Start time of a successful pull, or `None` for push-only
    ///   cycles (which leave `last_sync_timestamp` untouched)
    /// * `pending` - Unsynced change count after the cycle
    pub async fn mark_success(
        &self,
        table: &str,
        pulled_at: Option<Timestamp>,
        pending: i64,
    ) -> DbResult<()> {
        let mut meta = self.get_or_default(table).await?;
        if let Some(ts) = pulled_at {
            meta.last_sync_timestamp = ts;
        }
        meta.pending_changes = pending;
        meta.sync_status = SyncState::Idle;
        self.upsert(&meta).await
    }

    /// Records a failed cycle. The pull watermark is never advanced here.
    pub async fn mark_error(&self, table: &str, pending: Option<i64>) -> DbResult<()> {
        let mut meta = self.get_or_default(table).await?;
        if let Some(pending) = pending {
            meta.pending_changes = pending;
        }
        meta.sync_status = SyncState::Error;
        self.upsert(&meta).await
    }
}
