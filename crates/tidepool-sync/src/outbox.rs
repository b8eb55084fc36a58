//! # Push Batches
//!
//! Folds the pending change log of one table into the smallest set of
//! remote calls.
//!
//! ## Folding Rules
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  change log (seq order)            │  batch                             │
//! │  ──────────────────────────────────┼─────────────────────────────────── │
//! │  create k1 {a}, update k1 {b}      │  upsert k1 {b}                     │
//! │  update k1 {b}, create k1 {a}      │  upsert k1 {b}   (update kept)     │
//! │  create k2, delete k2              │  delete k2                         │
//! │  delete k3, create k3 {c}          │  upsert k3 {c}                     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every change id that went into the batch is marked synced once both
//! remote calls succeed, including the ones folded away.

use std::collections::BTreeMap;
use tracing::warn;

use tidepool_core::{ChangeOperation, ChangeRecord, Record, RecordKey};

#[derive(Debug, Clone, PartialEq)]
enum Pending {
    Upsert { record: Record, from_update: bool },
    Delete,
}

/// The remote work for one table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PushBatch {
    /// Local table name.
    pub table: String,
    /// Records to upsert, in key order.
    pub upserts: Vec<Record>,
    /// Keys to delete, in key order.
    pub deletes: Vec<RecordKey>,
    /// Every change entry covered by this batch.
    pub change_ids: Vec<String>,
}

impl PushBatch {
    /// Folds `changes` (already in log order) for `table`.
    ///
    /// Entries belonging to other tables are ignored.
    pub fn from_changes<'a>(
        table: &str,
        changes: impl IntoIterator<Item = &'a ChangeRecord>,
    ) -> Self {
        let mut pending: BTreeMap<RecordKey, Pending> = BTreeMap::new();
        let mut change_ids = Vec::new();

        for change in changes.into_iter().filter(|c| c.table == table) {
            change_ids.push(change.id.clone());

            match change.operation {
                ChangeOperation::Delete => {
                    pending.insert(change.key.clone(), Pending::Delete);
                }
                op => {
                    let Some(record) = change.data.clone() else {
                        warn!(table = %table, key = %change.key, id = %change.id, "Change entry without data skipped");
                        continue;
                    };
                    let from_update = op == ChangeOperation::Update;
                    let keep_existing = !from_update
                        && matches!(
                            pending.get(&change.key),
                            Some(Pending::Upsert { from_update: true, .. })
                        );
                    if !keep_existing {
                        pending.insert(change.key.clone(), Pending::Upsert { record, from_update });
                    }
                }
            }
        }

        let mut batch = PushBatch {
            table: table.to_string(),
            change_ids,
            ..Default::default()
        };
        for (key, entry) in pending {
            match entry {
                Pending::Upsert { record, .. } => batch.upserts.push(record),
                Pending::Delete => batch.deletes.push(key),
            }
        }
        batch
    }

    /// Groups changes by table, one batch per table in name order.
    pub fn group(changes: &[ChangeRecord]) -> Vec<PushBatch> {
        let mut tables: Vec<&str> = changes.iter().map(|c| c.table.as_str()).collect();
        tables.sort_unstable();
        tables.dedup();

        tables
            .into_iter()
            .map(|table| PushBatch::from_changes(table, changes))
            .collect()
    }

    /// True when the batch needs no remote call.
    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty() && self.deletes.is_empty()
    }
}

/// Deduplicates full-table records by key, keeping the last one seen.
///
/// Records without a key are dropped. Output is in key order.
pub fn dedup_by_key(records: Vec<Record>, key_of: impl Fn(&Record) -> Option<RecordKey>) -> Vec<Record> {
    let mut by_key: BTreeMap<RecordKey, Record> = BTreeMap::new();
    for record in records {
        match key_of(&record) {
            Some(key) => {
                by_key.insert(key, record);
            }
            None => warn!("Record without key skipped"),
        }
    }
    by_key.into_values().collect()
}
