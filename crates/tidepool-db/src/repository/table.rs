//! # Local Table Repository
//!
//! Keyed CRUD over one declared table. This is the only place where a
//! mutation becomes both a store write and a change log entry.
//!
//! ## Write Path
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    LocalTable.put(record)                               │
//! │                                                                         │
//! │  resolve key:  explicit ▸ record[primary_key] ▸ generated              │
//! │       │                   (sequence if auto_increment, else UUID v4)   │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                   SINGLE TRANSACTION                            │   │
//! │  │                                                                 │   │
//! │  │  1. INSERT INTO records ... ON CONFLICT DO UPDATE               │   │
//! │  │                                                                 │   │
//! │  │  2. INSERT INTO change_log (id, table, key, 'update', data)     │   │
//! │  │     (skipped for remote-origin writes)                          │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  COMMIT ──► ChangeBus.publish(table) ──► live views refresh            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use serde_json::Value;
use sqlx::{SqliteConnection, SqlitePool};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use tidepool_core::query::get_field;
use tidepool_core::validation::validate_key;
use tidepool_core::{
    apply_timestamps, as_object_mut, now_millis, set_field, shallow_merge, ChangeOperation,
    ChangeRecord, CoreError, Record, RecordKey, TableSchema,
};

use crate::error::{DbError, DbResult};
use crate::live::ChangeBus;
use crate::query::TableQuery;
use crate::repository::change_log;

// =============================================================================
// Write Origin
// =============================================================================

/// Who is writing.
///
/// Local writes are recorded in the change log and get timestamp autofill.
/// Remote writes (pull, realtime) are applied verbatim and never recorded,
/// so they are not pushed back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOrigin {
    Local,
    Remote,
}

// =============================================================================
// Connection-level operations (shared with ScopedTransaction)
// =============================================================================

/// Reads one record.
pub(crate) async fn fetch(
    conn: &mut SqliteConnection,
    table: &str,
    key: &str,
) -> DbResult<Option<Record>> {
    let data: Option<String> =
        sqlx::query_scalar("SELECT data FROM records WHERE table_name = ?1 AND key = ?2")
            .bind(table)
            .bind(key)
            .fetch_optional(&mut *conn)
            .await?;

    data.map(|d| serde_json::from_str(&d).map_err(DbError::from))
        .transpose()
}

/// Takes the next value of a table's auto-increment sequence.
async fn next_sequence(conn: &mut SqliteConnection, table: &str) -> DbResult<i64> {
    let value: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO key_sequences (table_name, next_value) VALUES (?1, 2)
        ON CONFLICT (table_name) DO UPDATE SET next_value = next_value + 1
        RETURNING next_value - 1
        "#,
    )
    .bind(table)
    .fetch_one(&mut *conn)
    .await?;

    Ok(value)
}

/// Moves a sequence past an explicitly supplied integer key.
async fn bump_sequence(conn: &mut SqliteConnection, table: &str, used: i64) -> DbResult<()> {
    sqlx::query(
        r#"
        INSERT INTO key_sequences (table_name, next_value) VALUES (?1, ?2)
        ON CONFLICT (table_name) DO UPDATE SET next_value = MAX(next_value, excluded.next_value)
        "#,
    )
    .bind(table)
    .bind(used.saturating_add(1))
    .execute(&mut *conn)
    .await?;

    Ok(())
}

/// Resolves the key, writes it into the record and applies autofill.
async fn prepare(
    conn: &mut SqliteConnection,
    schema: &TableSchema,
    origin: WriteOrigin,
    mut item: Record,
    key: Option<&str>,
) -> DbResult<(RecordKey, Record)> {
    as_object_mut(&schema.name, &mut item)?;

    let existing = schema.extract_key(&item);
    let key = match (key, existing) {
        (Some(explicit), current) => {
            validate_key(explicit)?;
            if current.as_deref() != Some(explicit) {
                set_field(&mut item, &schema.primary_key, key_value(schema, explicit));
            }
            explicit.to_string()
        }
        (None, Some(found)) => {
            validate_key(&found)?;
            found
        }
        (None, None) => {
            // A key field that is set but unusable is never silently replaced.
            if get_field(&item, &schema.primary_key).is_some_and(|v| !v.is_null()) {
                return Err(CoreError::MissingKey {
                    table: schema.name.clone(),
                    field: schema.primary_key.clone(),
                }
                .into());
            }
            let generated = if schema.auto_increment {
                let next = next_sequence(conn, &schema.name).await?;
                set_field(&mut item, &schema.primary_key, Value::from(next));
                next.to_string()
            } else {
                let id = Uuid::new_v4().to_string();
                set_field(&mut item, &schema.primary_key, Value::String(id.clone()));
                id
            };
            debug!(table = %schema.name, key = %generated, "Generated key");
            generated
        }
    };

    if schema.auto_increment {
        if let Ok(n) = key.parse::<i64>() {
            bump_sequence(conn, &schema.name, n).await?;
        }
    }

    if origin == WriteOrigin::Local && schema.timestamps {
        apply_timestamps(as_object_mut(&schema.name, &mut item)?, now_millis());
    }

    Ok((key, item))
}

fn key_value(schema: &TableSchema, key: &str) -> Value {
    match key.parse::<i64>() {
        Ok(n) if schema.auto_increment => Value::from(n),
        _ => Value::String(key.to_string()),
    }
}

async fn record_change(
    conn: &mut SqliteConnection,
    schema: &TableSchema,
    origin: WriteOrigin,
    key: &str,
    operation: ChangeOperation,
    data: Option<&Record>,
) -> DbResult<()> {
    if origin == WriteOrigin::Remote {
        return Ok(());
    }
    let change = ChangeRecord::new(&schema.name, key, operation, data.cloned());
    change_log::append(conn, &change).await
}

/// Inserts a new record. Fails with `DuplicateKey` if the key exists.
pub(crate) async fn insert(
    conn: &mut SqliteConnection,
    schema: &TableSchema,
    origin: WriteOrigin,
    item: Record,
    key: Option<&str>,
) -> DbResult<(RecordKey, Record)> {
    let (key, item) = prepare(conn, schema, origin, item, key).await?;
    let data = serde_json::to_string(&item)?;

    let result = sqlx::query("INSERT INTO records (table_name, key, data) VALUES (?1, ?2, ?3)")
        .bind(&schema.name)
        .bind(&key)
        .bind(&data)
        .execute(&mut *conn)
        .await;

    match result {
        Ok(_) => {}
        Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
            return Err(DbError::duplicate(&schema.name, &key));
        }
        Err(e) => return Err(e.into()),
    }

    record_change(conn, schema, origin, &key, ChangeOperation::Create, Some(&item)).await?;
    Ok((key, item))
}

/// Inserts or replaces a record.
pub(crate) async fn upsert(
    conn: &mut SqliteConnection,
    schema: &TableSchema,
    origin: WriteOrigin,
    item: Record,
    key: Option<&str>,
) -> DbResult<(RecordKey, Record)> {
    let (key, item) = prepare(conn, schema, origin, item, key).await?;
    let data = serde_json::to_string(&item)?;

    sqlx::query(
        r#"
        INSERT INTO records (table_name, key, data) VALUES (?1, ?2, ?3)
        ON CONFLICT (table_name, key) DO UPDATE SET data = excluded.data
        "#,
    )
    .bind(&schema.name)
    .bind(&key)
    .bind(&data)
    .execute(&mut *conn)
    .await?;

    record_change(conn, schema, origin, &key, ChangeOperation::Update, Some(&item)).await?;
    Ok((key, item))
}

/// Reads, shallow-merges and writes back. Fails with `NotFound` if absent.
///
/// The primary key field cannot be changed through `changes`.
pub(crate) async fn merge(
    conn: &mut SqliteConnection,
    schema: &TableSchema,
    origin: WriteOrigin,
    key: &str,
    changes: &Record,
) -> DbResult<Record> {
    let current = fetch(conn, &schema.name, key)
        .await?
        .ok_or_else(|| DbError::not_found(&schema.name, key))?;

    let mut merged = shallow_merge(&schema.name, &current, changes)?;
    if let Some(original) = tidepool_core::query::get_field(&current, &schema.primary_key) {
        set_field(&mut merged, &schema.primary_key, original.clone());
    }

    let (_, stored) = upsert(conn, schema, origin, merged, Some(key)).await?;
    Ok(stored)
}

/// Deletes a record. Absent keys are a no-op and record nothing.
pub(crate) async fn remove(
    conn: &mut SqliteConnection,
    schema: &TableSchema,
    origin: WriteOrigin,
    key: &str,
) -> DbResult<bool> {
    let affected = sqlx::query("DELETE FROM records WHERE table_name = ?1 AND key = ?2")
        .bind(&schema.name)
        .bind(key)
        .execute(&mut *conn)
        .await?
        .rows_affected();

    if affected == 0 {
        return Ok(false);
    }

    record_change(conn, schema, origin, key, ChangeOperation::Delete, None).await?;
    Ok(true)
}

// =============================================================================
// Local Table
// =============================================================================

/// Repository for one declared table.
///
/// ## Usage
/// ```rust,ignore
/// let users = db.table("users")?;
///
/// let key = users.add(json!({"name": "John"})).await?;
/// users.update(&key, json!({"name": "Jane"})).await?;
/// let jane = users.get(&key).await?;
/// users.delete(&key).await?;
/// ```
#[derive(Debug, Clone)]
pub struct LocalTable {
    pool: SqlitePool,
    schema: Arc<TableSchema>,
    bus: ChangeBus,
    origin: WriteOrigin,
}

impl LocalTable {
    pub(crate) fn new(pool: SqlitePool, schema: Arc<TableSchema>, bus: ChangeBus) -> Self {
        LocalTable {
            pool,
            schema,
            bus,
            origin: WriteOrigin::Local,
        }
    }

    /// Returns a view of this table whose writes skip the change log.
    ///
    /// Used to apply remote data without echoing it back on the next push.
    pub fn without_change_log(&self) -> Self {
        LocalTable {
            origin: WriteOrigin::Remote,
            ..self.clone()
        }
    }

    pub fn name(&self) -> &str {
        &self.schema.name
    }

    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    pub fn origin(&self) -> WriteOrigin {
        self.origin
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Gets a record by key.
    pub async fn get(&self, key: &str) -> DbResult<Option<Record>> {
        let mut conn = self.pool.acquire().await?;
        fetch(&mut conn, &self.schema.name, key).await
    }

    /// Gets a record by key, failing with `NotFound` if absent.
    pub async fn get_required(&self, key: &str) -> DbResult<Record> {
        self.get(key)
            .await?
            .ok_or_else(|| DbError::not_found(&self.schema.name, key))
    }

    /// Gets every record of the table, in key order.
    pub async fn get_all(&self) -> DbResult<Vec<Record>> {
        let rows: Vec<String> =
            sqlx::query_scalar("SELECT data FROM records WHERE table_name = ?1 ORDER BY key")
                .bind(&self.schema.name)
                .fetch_all(&self.pool)
                .await?;

        rows.iter()
            .map(|d| serde_json::from_str(d).map_err(DbError::from))
            .collect()
    }

    /// Gets several records by key. The result lines up with `keys`.
    pub async fn bulk_get<K: AsRef<str>>(&self, keys: &[K]) -> DbResult<Vec<Option<Record>>> {
        let mut conn = self.pool.acquire().await?;
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            out.push(fetch(&mut conn, &self.schema.name, key.as_ref()).await?);
        }
        Ok(out)
    }

    /// Counts records in the table.
    pub async fn count(&self) -> DbResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM records WHERE table_name = ?1")
            .bind(&self.schema.name)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Starts a query over this table.
    pub fn query(&self) -> TableQuery {
        TableQuery::new(self.pool.clone(), Arc::clone(&self.schema), self.bus.clone())
    }

    // =========================================================================
    // Single-record writes
    // =========================================================================

    /// Adds a new record, returning its key.
    ///
    /// ## Errors
    /// * `DuplicateKey` - the key already exists
    /// * `Core(InvalidRecord)` - `item` is not a JSON object
    pub async fn add(&self, item: Record) -> DbResult<RecordKey> {
        self.add_inner(item, None).await
    }

    /// Adds a new record under an explicit key.
    pub async fn add_with_key(&self, item: Record, key: &str) -> DbResult<RecordKey> {
        self.add_inner(item, Some(key)).await
    }

    async fn add_inner(&self, item: Record, key: Option<&str>) -> DbResult<RecordKey> {
        let mut tx = self.pool.begin().await?;
        let (key, _) = insert(&mut tx, &self.schema, self.origin, item, key).await?;
        tx.commit().await?;

        debug!(table = %self.schema.name, key = %key, "Record added");
        self.bus.publish(&self.schema.name);
        Ok(key)
    }

    /// Inserts or replaces a record, returning its key.
    pub async fn put(&self, item: Record) -> DbResult<RecordKey> {
        self.put_inner(item, None).await
    }

    /// Inserts or replaces a record under an explicit key.
    pub async fn put_with_key(&self, item: Record, key: &str) -> DbResult<RecordKey> {
        self.put_inner(item, Some(key)).await
    }

    async fn put_inner(&self, item: Record, key: Option<&str>) -> DbResult<RecordKey> {
        let mut tx = self.pool.begin().await?;
        let (key, _) = upsert(&mut tx, &self.schema, self.origin, item, key).await?;
        tx.commit().await?;

        debug!(table = %self.schema.name, key = %key, "Record put");
        self.bus.publish(&self.schema.name);
        Ok(key)
    }

    /// Shallow-merges `changes` into an existing record and returns the result.
    ///
    /// ## Errors
    /// * `NotFound` - no record with this key
    pub async fn update(&self, key: &str, changes: Record) -> DbResult<Record> {
        let mut tx = self.pool.begin().await?;
        let stored = merge(&mut tx, &self.schema, self.origin, key, &changes).await?;
        tx.commit().await?;

        debug!(table = %self.schema.name, key = %key, "Record updated");
        self.bus.publish(&self.schema.name);
        Ok(stored)
    }

    /// Deletes a record.
    ///
    /// ## Returns
    /// * `true` - a record was removed and a delete entry recorded
    /// * `false` - no such key; nothing was recorded
    pub async fn delete(&self, key: &str) -> DbResult<bool> {
        let mut tx = self.pool.begin().await?;
        let removed = remove(&mut tx, &self.schema, self.origin, key).await?;
        tx.commit().await?;

        if removed {
            debug!(table = %self.schema.name, key = %key, "Record deleted");
            self.bus.publish(&self.schema.name);
        }
        Ok(removed)
    }

    /// Removes every record of the table without recording change entries.
    pub async fn clear(&self) -> DbResult<u64> {
        let removed = sqlx::query("DELETE FROM records WHERE table_name = ?1")
            .bind(&self.schema.name)
            .execute(&self.pool)
            .await?
            .rows_affected();

        debug!(table = %self.schema.name, removed, "Table cleared");
        self.bus.publish(&self.schema.name);
        Ok(removed)
    }

    // =========================================================================
    // Bulk writes (one transaction per call)
    // =========================================================================

    /// Adds several records atomically. Any duplicate aborts the whole batch.
    pub async fn bulk_add(&self, items: Vec<Record>) -> DbResult<Vec<RecordKey>> {
        let mut tx = self.pool.begin().await?;
        let mut keys = Vec::with_capacity(items.len());
        for item in items {
            let (key, _) = insert(&mut tx, &self.schema, self.origin, item, None).await?;
            keys.push(key);
        }
        tx.commit().await?;

        debug!(table = %self.schema.name, count = keys.len(), "Bulk add");
        self.bus.publish(&self.schema.name);
        Ok(keys)
    }

    /// Inserts or replaces several records atomically.
    pub async fn bulk_put(&self, items: Vec<Record>) -> DbResult<Vec<RecordKey>> {
        let mut tx = self.pool.begin().await?;
        let mut keys = Vec::with_capacity(items.len());
        for item in items {
            let (key, _) = upsert(&mut tx, &self.schema, self.origin, item, None).await?;
            keys.push(key);
        }
        tx.commit().await?;

        debug!(table = %self.schema.name, count = keys.len(), "Bulk put");
        self.bus.publish(&self.schema.name);
        Ok(keys)
    }

    /// Deletes several records atomically, returning how many existed.
    pub async fn bulk_delete<K: AsRef<str>>(&self, keys: &[K]) -> DbResult<u64> {
        let mut tx = self.pool.begin().await?;
        let mut removed = 0;
        for key in keys {
            if remove(&mut tx, &self.schema, self.origin, key.as_ref()).await? {
                removed += 1;
            }
        }
        tx.commit().await?;

        debug!(table = %self.schema.name, removed, "Bulk delete");
        if removed > 0 {
            self.bus.publish(&self.schema.name);
        }
        Ok(removed)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
