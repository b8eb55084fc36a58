//! # Database Migrations
//!
//! Embedded SQL migrations for the fixed store layout, plus the per-table
//! secondary indexes derived from declared schemas.
//!
//! ## Startup Sequence
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  Database::new(config)                                                 │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  MIGRATOR.run()  ← records, key_sequences, change_log, sync_metadata   │
//! │       │            (tracked in _sqlx_migrations, applied once)         │
//! │       ▼                                                                 │
//! │  ensure_indexes(schemas)                                               │
//! │       │                                                                 │
//! │       ├── todos.done      ─► idx_records_todos_done                    │
//! │       └── users.address.city ─► idx_records_users_address__city        │
//! │                                                                         │
//! │  CREATE INDEX IF NOT EXISTS ... ON records (json_extract(data, '$.f')) │
//! │      WHERE table_name = 'todos'                                        │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Adding New Migrations
//!
//! 1. Create a new file in `migrations/sqlite/` with the next sequence number
//! 2. Name format: `NNN_description.sql`
//! 3. **NEVER** modify existing migrations - always add new ones

use sqlx::SqlitePool;
use tracing::{debug, info};

use crate::error::DbResult;
use tidepool_core::validation::{validate_field_path, validate_table_name};
use tidepool_core::TableSchema;

/// Embedded migrations from the `migrations/sqlite` directory.
static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("../../migrations/sqlite");

/// Runs all pending database migrations.
///
/// Idempotent: already applied migrations are skipped.
pub async fn run_migrations(pool: &SqlitePool) -> DbResult<()> {
    info!("Checking for pending migrations");

    MIGRATOR.run(pool).await?;

    info!("All migrations applied successfully");
    Ok(())
}

/// SQL expression that reads `field` out of a stored record.
///
/// Queries must use exactly this text for SQLite to pick the expression
/// index. Callers pass validated field paths only.
pub fn index_expression(field: &str) -> String {
    format!("json_extract(data, '$.{field}')")
}

/// Name of the index backing `table.field`.
pub fn index_name(table: &str, field: &str) -> String {
    format!("idx_records_{}_{}", table, field.replace('.', "__"))
}

/// Creates the secondary indexes declared by `schemas`.
///
/// ## Returns
/// Number of indexes ensured (existing ones included).
pub async fn ensure_indexes<'a>(
    pool: &SqlitePool,
    schemas: impl IntoIterator<Item = &'a TableSchema>,
) -> DbResult<usize> {
    let mut ensured = 0;

    for schema in schemas {
        validate_table_name(&schema.name)?;
        for field in &schema.indexes {
            validate_field_path(field)?;

            let sql = format!(
                r#"CREATE INDEX IF NOT EXISTS "{name}" ON records ({expr}) WHERE table_name = '{table}'"#,
                name = index_name(&schema.name, field),
                expr = index_expression(field),
                table = schema.name,
            );
            sqlx::query(&sql).execute(pool).await?;

            debug!(table = %schema.name, field = %field, "Index ensured");
            ensured += 1;
        }
    }

    Ok(ensured)
}

/// Returns information about migrations.
///
/// ## Returns
/// Tuple of (total_migrations, applied_migrations)
pub async fn migration_status(pool: &SqlitePool) -> DbResult<(usize, usize)> {
    let total = MIGRATOR.migrations.len();

    let applied: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM _sqlx_migrations")
        .fetch_one(pool)
        .await
        .unwrap_or(0);

    Ok((total, applied as usize))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{Database, DbConfig};

    #[test]
    fn test_index_naming() {
        assert_eq!(index_name("todos", "done"), "idx_records_todos_done");
        assert_eq!(
            index_name("users", "address.city"),
            "idx_records_users_address__city"
        );
        assert_eq!(index_expression("a.b"), "json_extract(data, '$.a.b')");
    }

    #[tokio::test]
    async fn test_indexes_created_once() {
        let config = DbConfig::in_memory()
            .table(TableSchema::new("todos").index("done").index("meta.rank"));
        let db = Database::new(config).await.unwrap();

        let names: Vec<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type = 'index' AND name LIKE 'idx_records_%' ORDER BY name",
        )
        .fetch_all(db.pool())
        .await
        .unwrap();
        assert_eq!(names, vec!["idx_records_todos_done", "idx_records_todos_meta__rank"]);

        // re-running is a no-op
        db.run_migrations().await.unwrap();
        let (total, applied) = migration_status(db.pool()).await.unwrap();
        assert_eq!(total, applied);
    }
}
