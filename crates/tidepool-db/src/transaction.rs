//! # Scoped Transactions
//!
//! Groups writes to several tables into one atomic unit. Every write still
//! records its change entry, inside the same transaction.
//!
//! ```rust,ignore
//! let mut tx = db.transaction().await?;
//! let order = tx.add("orders", json!({"total": 12})).await?;
//! tx.update("customers", "c1", json!({"lastOrder": order})).await?;
//! tx.commit().await?;   // dropping without commit rolls back
//! ```

use sqlx::{Sqlite, Transaction};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::debug;

use tidepool_core::{Record, RecordKey, TableSchema};

use crate::error::{DbError, DbResult};
use crate::live::ChangeBus;
use crate::repository::table::{self as ops, WriteOrigin};

/// An open transaction spanning any declared tables.
///
/// Reads made through it see its own uncommitted writes. Live views are
/// notified once, on commit, for every table touched.
pub struct ScopedTransaction {
    tx: Transaction<'static, Sqlite>,
    schemas: Arc<HashMap<String, Arc<TableSchema>>>,
    bus: ChangeBus,
    touched: BTreeSet<String>,
}

impl ScopedTransaction {
    pub(crate) fn new(
        tx: Transaction<'static, Sqlite>,
        schemas: Arc<HashMap<String, Arc<TableSchema>>>,
        bus: ChangeBus,
    ) -> Self {
        ScopedTransaction {
            tx,
            schemas,
            bus,
            touched: BTreeSet::new(),
        }
    }

    fn schema(&self, table: &str) -> DbResult<Arc<TableSchema>> {
        self.schemas
            .get(table)
            .cloned()
            .ok_or_else(|| DbError::UnknownTable(table.to_string()))
    }

    pub async fn get(&mut self, table: &str, key: &str) -> DbResult<Option<Record>> {
        let schema = self.schema(table)?;
        ops::fetch(&mut self.tx, &schema.name, key).await
    }

    pub async fn add(&mut self, table: &str, item: Record) -> DbResult<RecordKey> {
        let schema = self.schema(table)?;
        let (key, _) = ops::insert(&mut self.tx, &schema, WriteOrigin::Local, item, None).await?;
        self.touched.insert(schema.name.clone());
        Ok(key)
    }

    pub async fn put(&mut self, table: &str, item: Record) -> DbResult<RecordKey> {
        let schema = self.schema(table)?;
        let (key, _) = ops::upsert(&mut self.tx, &schema, WriteOrigin::Local, item, None).await?;
        self.touched.insert(schema.name.clone());
        Ok(key)
    }

    pub async fn update(&mut self, table: &str, key: &str, changes: Record) -> DbResult<Record> {
        let schema = self.schema(table)?;
        let stored = ops::merge(&mut self.tx, &schema, WriteOrigin::Local, key, &changes).await?;
        self.touched.insert(schema.name.clone());
        Ok(stored)
    }

    pub async fn delete(&mut self, table: &str, key: &str) -> DbResult<bool> {
        let schema = self.schema(table)?;
        let removed = ops::remove(&mut self.tx, &schema, WriteOrigin::Local, key).await?;
        if removed {
            self.touched.insert(schema.name.clone());
        }
        Ok(removed)
    }

    /// Commits and notifies live views of every touched table.
    pub async fn commit(self) -> DbResult<()> {
        self.tx
            .commit()
            .await
            .map_err(|e| DbError::TransactionFailed(e.to_string()))?;

        debug!(tables = ?self.touched, "Transaction committed");
        for table in &self.touched {
            self.bus.publish(table);
        }
        Ok(())
    }

    /// Discards every write made through this transaction.
    pub async fn rollback(self) -> DbResult<()> {
        self.tx
            .rollback()
            .await
            .map_err(|e| DbError::TransactionFailed(e.to_string()))?;
        debug!("Transaction rolled back");
        Ok(())
    }
}
