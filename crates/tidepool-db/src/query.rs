//! # Table Query Builder
//!
//! Chainable, immutable query over one table.
//!
//! ## Execution Pipeline
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  1. candidates                                                          │
//! │     first where clause on an indexed field with a range condition?     │
//! │       ├── yes ─► SELECT ... WHERE json_extract(data,'$.f') <op> ?       │
//! │       │          (partial expression index on records)                  │
//! │       └── no  ─► SELECT ... WHERE table_name = ? ORDER BY key           │
//! │                                                                         │
//! │  2. every where clause (including the one used for the scan)           │
//! │  3. filter predicates (AND-composed)                                   │
//! │  4. sort (stable, nulls last)                                          │
//! │  5. offset, then limit                                                 │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The index scan only narrows the candidate set; step 2 re-checks every
//! clause with the in-memory comparison rules, so results do not depend on
//! whether an index was used.

use serde_json::Value;
use sqlx::SqlitePool;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

use tidepool_core::query::SortSpec;
use tidepool_core::{Condition, QuerySpec, Record, RecordKey, TableSchema, WhereClause};

use crate::error::{DbError, DbResult};
use crate::live::{ChangeBus, LiveView};
use crate::migrations::index_expression;

/// Boxed record predicate used by [`TableQuery::filter`].
pub type Predicate = Arc<dyn Fn(&Record) -> bool + Send + Sync>;

/// Query over one table. Every builder method returns a new query.
///
/// ## Example
/// ```rust,ignore
/// let open = todos
///     .query()
///     .where_eq("done", false)
///     .order_by("title")
///     .limit(20)
///     .to_vec()
///     .await?;
/// ```
#[derive(Clone)]
pub struct TableQuery {
    pool: SqlitePool,
    schema: Arc<TableSchema>,
    bus: ChangeBus,
    spec: QuerySpec,
    predicate: Option<Predicate>,
}

impl fmt::Debug for TableQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TableQuery")
            .field("table", &self.schema.name)
            .field("spec", &self.spec)
            .field("predicate", &self.predicate.is_some())
            .finish()
    }
}

impl TableQuery {
    pub(crate) fn new(pool: SqlitePool, schema: Arc<TableSchema>, bus: ChangeBus) -> Self {
        TableQuery {
            pool,
            schema,
            bus,
            spec: QuerySpec::default(),
            predicate: None,
        }
    }

    // =========================================================================
    // Builder
    // =========================================================================

    /// Adds a where clause. Clauses are AND-ed.
    pub fn where_clause(mut self, clause: WhereClause) -> Self {
        self.spec.clauses.push(clause);
        self
    }

    /// Shorthand for `where_clause(WhereClause::eq(field, value))`.
    pub fn where_eq(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.where_clause(WhereClause::eq(field, value))
    }

    /// Adds an arbitrary predicate. Several filters are AND-ed.
    pub fn filter<F>(mut self, f: F) -> Self
    where
        F: Fn(&Record) -> bool + Send + Sync + 'static,
    {
        let next: Predicate = match self.predicate.take() {
            Some(previous) => Arc::new(move |r: &Record| previous(r) && f(r)),
            None => Arc::new(f),
        };
        self.predicate = Some(next);
        self
    }

    /// Sorts ascending by a field.
    pub fn order_by(mut self, field: impl Into<String>) -> Self {
        self.spec.sort = Some(SortSpec::asc(field));
        self
    }

    /// Sorts descending by a field.
    pub fn order_by_desc(mut self, field: impl Into<String>) -> Self {
        self.spec.sort = Some(SortSpec::desc(field));
        self
    }

    /// Flips the sort direction. No-op without a sort.
    pub fn reverse(mut self) -> Self {
        self.spec.sort = self.spec.sort.take().map(SortSpec::reversed);
        self
    }

    pub fn offset(mut self, n: usize) -> Self {
        self.spec.offset = n;
        self
    }

    pub fn limit(mut self, n: usize) -> Self {
        self.spec.limit = Some(n);
        self
    }

    /// The declarative part of this query.
    pub fn spec(&self) -> &QuerySpec {
        &self.spec
    }

    // =========================================================================
    // Execution
    // =========================================================================

    /// Runs the query.
    pub async fn to_vec(&self) -> DbResult<Vec<Record>> {
        let candidates = self.candidates().await?;
        Ok(self.spec.apply(candidates, self.predicate.as_deref()))
    }

    /// Runs the query and returns the first result.
    pub async fn first(&self) -> DbResult<Option<Record>> {
        let mut query = self.clone();
        query.spec.limit = Some(query.spec.limit.map_or(1, |n| n.min(1)));
        Ok(query.to_vec().await?.into_iter().next())
    }

    /// Counts matching records (after offset and limit).
    pub async fn count(&self) -> DbResult<usize> {
        Ok(self.to_vec().await?.len())
    }

    /// Keys of the matching records, in result order.
    pub async fn keys(&self) -> DbResult<Vec<RecordKey>> {
        Ok(self
            .to_vec()
            .await?
            .iter()
            .filter_map(|r| self.schema.extract_key(r))
            .collect())
    }

    /// A live view that re-runs this query whenever the table changes.
    pub fn live(&self) -> LiveView<Vec<Record>> {
        let query = self.clone();
        LiveView::new(self.bus.clone(), [self.schema.name.clone()], move || {
            let query = query.clone();
            async move { query.to_vec().await }
        })
    }

    async fn candidates(&self) -> DbResult<Vec<Record>> {
        let indexed = match self.spec.index_candidate() {
            Some(clause) if self.schema.has_index(&clause.field) => {
                Some(self.index_scan(clause).await)
            }
            _ => None,
        };
        self.or_full_scan(indexed).await
    }

    /// Uses the index scan result when there is a good one.
    async fn or_full_scan(&self, indexed: Option<DbResult<Vec<Record>>>) -> DbResult<Vec<Record>> {
        match indexed {
            Some(Ok(records)) => Ok(records),
            Some(Err(e)) => {
                warn!(
                    table = %self.schema.name,
                    error = %e,
                    "Index scan failed, falling back to full scan"
                );
                self.full_scan().await
            }
            None => self.full_scan().await,
        }
    }

    async fn full_scan(&self) -> DbResult<Vec<Record>> {
        let rows: Vec<String> =
            sqlx::query_scalar("SELECT data FROM records WHERE table_name = ?1 ORDER BY key")
                .bind(&self.schema.name)
                .fetch_all(&self.pool)
                .await?;
        decode_rows(&rows)
    }

    async fn index_scan(&self, clause: &WhereClause) -> DbResult<Vec<Record>> {
        let expr = index_expression(&clause.field);
        let (predicate, bounds): (String, Vec<&Value>) = match &clause.condition {
            Condition::Eq(v) => (format!("{expr} = ?"), vec![v]),
            Condition::Gt(v) => (format!("{expr} > ?"), vec![v]),
            Condition::Gte(v) => (format!("{expr} >= ?"), vec![v]),
            Condition::Lt(v) => (format!("{expr} < ?"), vec![v]),
            Condition::Lte(v) => (format!("{expr} <= ?"), vec![v]),
            Condition::Between(lo, hi) => (format!("{expr} BETWEEN ? AND ?"), vec![lo, hi]),
            other => {
                return Err(DbError::QueryFailed(format!(
                    "condition {other:?} cannot drive an index scan"
                )))
            }
        };

        // Table names are validated identifiers. The literal keeps the
        // statement matching the partial index's WHERE clause.
        let sql = format!(
            "SELECT data FROM records WHERE table_name = '{table}' AND {predicate} ORDER BY {expr}, key",
            table = self.schema.name,
        );
        debug!(table = %self.schema.name, field = %clause.field, "Index scan");

        let mut query = sqlx::query_scalar::<_, String>(&sql);
        for bound in bounds {
            query = match index_bound(bound)? {
                IndexBound::Integer(i) => query.bind(i),
                IndexBound::Real(f) => query.bind(f),
                IndexBound::Text(s) => query.bind(s),
            };
        }

        let rows = query.fetch_all(&self.pool).await?;
        decode_rows(&rows)
    }
}

/// A where-clause operand as SQLite compares it against `json_extract`.
#[derive(Debug, Clone, PartialEq)]
enum IndexBound {
    Integer(i64),
    Real(f64),
    Text(String),
}

fn index_bound(value: &Value) -> DbResult<IndexBound> {
    match value {
        Value::Bool(b) => Ok(IndexBound::Integer(i64::from(*b))),
        Value::Number(n) => match (n.as_i64(), n.as_f64()) {
            (Some(i), _) => Ok(IndexBound::Integer(i)),
            (None, Some(f)) if f.is_finite() => Ok(IndexBound::Real(f)),
            _ => Err(DbError::QueryFailed(format!(
                "number {n} cannot be used as an index bound"
            ))),
        },
        Value::String(s) => Ok(IndexBound::Text(s.clone())),
        other => Err(DbError::QueryFailed(format!(
            "non-scalar index bound: {other}"
        ))),
    }
}

fn decode_rows(rows: &[String]) -> DbResult<Vec<Record>> {
    rows.iter()
        .map(|d| serde_json::from_str(d).map_err(DbError::from))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{Database, DbConfig};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn ids(records: &[Record]) -> Vec<i64> {
        records.iter().filter_map(|r| r["id"].as_i64()).collect()
    }

    async fn seeded() -> Database {
        let config = DbConfig::in_memory()
            .table(TableSchema::new("todos").auto_increment().index("priority"))
            .table(TableSchema::new("users"));
        let db = Database::new(config).await.unwrap();

        db.table("todos")
            .unwrap()
            .bulk_add(vec![
                json!({"title": "write", "priority": 2, "done": false}),
                json!({"title": "read", "priority": 5, "done": true}),
                json!({"title": "cook", "priority": 1, "done": false}),
                json!({"title": "nap", "done": false}),
                json!({"title": "swim", "priority": "high", "done": false}),
            ])
            .await
            .unwrap();
        db
    }

    #[tokio::test]
    async fn test_full_scan_returns_key_order() {
        let db = seeded().await;
        let all = db.table("todos").unwrap().query().to_vec().await.unwrap();
        assert_eq!(ids(&all), vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_index_and_full_scan_agree() {
        let db = seeded().await;
        let todos = db.table("todos").unwrap();

        let indexed = todos
            .query()
            .where_clause(WhereClause::gte("priority", 2))
            .order_by("title")
            .to_vec()
            .await
            .unwrap();

        // an unindexable first clause forces a full scan
        let unindexed = todos
            .query()
            .filter(|_| true)
            .where_clause(WhereClause::ne("title", "zzz"))
            .where_clause(WhereClause::gte("priority", 2))
            .order_by("title")
            .to_vec()
            .await
            .unwrap();

        assert_eq!(indexed, unindexed);
        assert_eq!(ids(&indexed), vec![2, 1]);
    }

    #[tokio::test]
    async fn test_between_and_string_values_on_index() {
        let db = seeded().await;
        let todos = db.table("todos").unwrap();

        let mid = todos
            .query()
            .where_clause(WhereClause::between("priority", 1, 2))
            .to_vec()
            .await
            .unwrap();
        assert_eq!(ids(&mid), vec![3, 1]);

        let text = todos.query().where_eq("priority", "high").keys().await.unwrap();
        assert_eq!(text, vec!["5".to_string()]);
    }

    #[tokio::test]
    async fn test_filters_compose_and_pagination() {
        let db = seeded().await;
        let todos = db.table("todos").unwrap();

        let q = todos
            .query()
            .filter(|r| r["done"] == json!(false))
            .filter(|r| r["title"].as_str().map_or(false, |t| t.len() > 3))
            .order_by("title");
        assert_eq!(ids(&q.to_vec().await.unwrap()), vec![3, 5, 1]);
        assert_eq!(ids(&q.clone().offset(1).limit(1).to_vec().await.unwrap()), vec![5]);
        assert_eq!(ids(&q.clone().reverse().to_vec().await.unwrap()), vec![1, 5, 3]);
        assert_eq!(q.count().await.unwrap(), 3);
        assert_eq!(q.first().await.unwrap().unwrap()["title"], "cook");
    }

    #[tokio::test]
    async fn test_sort_puts_missing_last_both_ways() {
        let db = seeded().await;
        let todos = db.table("todos").unwrap();

        let q = todos
            .query()
            .where_clause(WhereClause::ne("priority", "high"))
            .order_by("priority");
        assert_eq!(ids(&q.to_vec().await.unwrap()), vec![3, 1, 2, 4]);
        assert_eq!(ids(&q.reverse().to_vec().await.unwrap()), vec![2, 1, 3, 4]);
    }

    #[tokio::test]
    async fn test_first_respects_zero_limit() {
        let db = seeded().await;
        let todos = db.table("todos").unwrap();
        assert!(todos.query().limit(0).first().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_live_query_tracks_table() {
        let db = seeded().await;
        let todos = db.table("todos").unwrap();
        let open = todos.query().where_eq("done", false).live();

        let seen = Arc::new(AtomicUsize::new(0));
        let s = Arc::clone(&seen);
        let _sub = open
            .subscribe(move |rows: &Vec<Record>| s.store(rows.len(), Ordering::SeqCst))
            .await
            .unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 4);

        todos.update("3", json!({"done": true})).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 3);

        // writes to another table do not matter
        db.table("users").unwrap().add(json!({"n": 1})).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_failed_index_scan_falls_back_to_full_scan() {
        let db = seeded().await;
        let todos = db.table("todos").unwrap();
        let query = todos.query().where_clause(WhereClause::gte("priority", 2));

        let bad = query
            .index_scan(&WhereClause::eq("priority", json!([2])))
            .await;
        assert!(matches!(bad, Err(DbError::QueryFailed(_))));

        let candidates = query.or_full_scan(Some(bad)).await.unwrap();
        assert_eq!(candidates, query.full_scan().await.unwrap());
        assert_eq!(
            query.spec.apply(candidates, None),
            query.to_vec().await.unwrap()
        );
    }

    #[test]
    fn test_index_bounds() {
        assert_eq!(index_bound(&json!(true)).unwrap(), IndexBound::Integer(1));
        assert_eq!(index_bound(&json!(-4)).unwrap(), IndexBound::Integer(-4));
        assert_eq!(index_bound(&json!(2.5)).unwrap(), IndexBound::Real(2.5));
        assert_eq!(
            index_bound(&json!(u64::MAX)).unwrap(),
            IndexBound::Real(u64::MAX as f64)
        );
        assert_eq!(
            index_bound(&json!("high")).unwrap(),
            IndexBound::Text("high".to_string())
        );
        assert!(matches!(
            index_bound(&json!({"a": 1})),
            Err(DbError::QueryFailed(_))
        ));
        assert!(matches!(index_bound(&Value::Null), Err(DbError::QueryFailed(_))));
    }
}
