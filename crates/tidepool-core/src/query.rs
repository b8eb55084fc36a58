//! # Query Model
//!
//! The storage-independent half of the query pipeline.
//!
//! ## Pipeline
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Query Pipeline                                  │
//! │                                                                         │
//! │  1. candidates    index range (tidepool-db) or full table scan         │
//! │        │                                                                │
//! │        ▼                                                                │
//! │  2. where clauses every clause re-applied in memory  ◄── this module   │
//! │        │                                                                │
//! │        ▼                                                                │
//! │  3. predicate     caller-supplied closure            ◄── this module   │
//! │        │                                                                │
//! │        ▼                                                                │
//! │  4. sort          single field, stable, nulls last   ◄── this module   │
//! │        │                                                                │
//! │        ▼                                                                │
//! │  5. offset/limit                                     ◄── this module   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Step 2 runs even when step 1 used an index, so the index path and the
//! scan path always return the same records.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;

use crate::types::Record;

// =============================================================================
// Value Comparison
// =============================================================================

/// Compares two JSON values for sorting.
///
/// - Both Null → Equal
/// - Null sorts after everything else
/// - Numbers numerically, strings lexicographically, false < true
/// - Cross-type → type rank: number, string, bool, other
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Null, _) => Ordering::Greater,
        (_, Value::Null) => Ordering::Less,
        (Value::Number(na), Value::Number(nb)) => {
            let fa = na.as_f64().unwrap_or(f64::NAN);
            let fb = nb.as_f64().unwrap_or(f64::NAN);
            fa.partial_cmp(&fb).unwrap_or(Ordering::Equal)
        }
        (Value::String(sa), Value::String(sb)) => sa.cmp(sb),
        (Value::Bool(ba), Value::Bool(bb)) => ba.cmp(bb),
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

fn type_rank(v: &Value) -> u8 {
    match v {
        Value::Number(_) => 0,
        Value::String(_) => 1,
        Value::Bool(_) => 2,
        _ => 3,
    }
}

fn same_scalar_type(a: &Value, b: &Value) -> bool {
    matches!(
        (a, b),
        (Value::Number(_), Value::Number(_))
            | (Value::String(_), Value::String(_))
            | (Value::Bool(_), Value::Bool(_))
    )
}

/// Returns true for values an index range can be built from.
pub fn is_scalar(v: &Value) -> bool {
    matches!(v, Value::Number(_) | Value::String(_) | Value::Bool(_))
}

/// Reads a nested value using a dot-separated path.
///
/// Returns `None` if any segment is missing or a parent is not an object.
pub fn get_field<'a>(record: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = record;
    for part in path.split('.') {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

// =============================================================================
// Where Clauses
// =============================================================================

/// Comparison applied by a [`WhereClause`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "op", content = "value")]
pub enum Condition {
    Eq(Value),
    Ne(Value),
    Gt(Value),
    Gte(Value),
    Lt(Value),
    Lte(Value),
    /// Inclusive on both ends.
    Between(Value, Value),
    AnyOf(Vec<Value>),
    StartsWith(String),
}

/// A single field condition.
///
/// ## Example
/// ```rust
/// use serde_json::json;
/// use tidepool_core::WhereClause;
///
/// let adults = WhereClause::gte("age", 18);
/// assert!(adults.matches(&json!({"age": 30})));
/// assert!(!adults.matches(&json!({"age": "30"}))); // cross-type never matches
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WhereClause {
    pub field: String,
    pub condition: Condition,
}

impl WhereClause {
    fn new(field: impl Into<String>, condition: Condition) -> Self {
        WhereClause {
            field: field.into(),
            condition,
        }
    }

    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, Condition::Eq(value.into()))
    }

    pub fn ne(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, Condition::Ne(value.into()))
    }

    pub fn gt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, Condition::Gt(value.into()))
    }

    pub fn gte(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, Condition::Gte(value.into()))
    }

    pub fn lt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, Condition::Lt(value.into()))
    }

    pub fn lte(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, Condition::Lte(value.into()))
    }

    pub fn between(
        field: impl Into<String>,
        lower: impl Into<Value>,
        upper: impl Into<Value>,
    ) -> Self {
        Self::new(field, Condition::Between(lower.into(), upper.into()))
    }

    pub fn any_of<V: Into<Value>>(field: impl Into<String>, values: impl IntoIterator<Item = V>) -> Self {
        Self::new(
            field,
            Condition::AnyOf(values.into_iter().map(Into::into).collect()),
        )
    }

    pub fn starts_with(field: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self::new(field, Condition::StartsWith(prefix.into()))
    }

    /// Evaluates the clause against a record. Missing fields read as null.
    pub fn matches(&self, record: &Record) -> bool {
        let value = get_field(record, &self.field).unwrap_or(&Value::Null);
        match &self.condition {
            Condition::Eq(expected) => value == expected,
            Condition::Ne(expected) => value != expected,
            Condition::Gt(bound) => ordered(value, bound, |o| o == Ordering::Greater),
            Condition::Gte(bound) => ordered(value, bound, |o| o != Ordering::Less),
            Condition::Lt(bound) => ordered(value, bound, |o| o == Ordering::Less),
            Condition::Lte(bound) => ordered(value, bound, |o| o != Ordering::Greater),
            Condition::Between(lower, upper) => {
                ordered(value, lower, |o| o != Ordering::Less)
                    && ordered(value, upper, |o| o != Ordering::Greater)
            }
            Condition::AnyOf(options) => options.iter().any(|o| o == value),
            Condition::StartsWith(prefix) => value
                .as_str()
                .map(|s| s.starts_with(prefix.as_str()))
                .unwrap_or(false),
        }
    }

    /// Returns true if the condition can be answered by an index range scan.
    pub fn is_index_range(&self) -> bool {
        match &self.condition {
            Condition::Eq(v)
            | Condition::Gt(v)
            | Condition::Gte(v)
            | Condition::Lt(v)
            | Condition::Lte(v) => is_scalar(v),
            Condition::Between(lo, hi) => is_scalar(lo) && is_scalar(hi) && same_scalar_type(lo, hi),
            _ => false,
        }
    }
}

fn ordered(value: &Value, bound: &Value, accept: impl Fn(Ordering) -> bool) -> bool {
    if !same_scalar_type(value, bound) {
        return false;
    }
    accept(compare_values(value, bound))
}

// =============================================================================
// Sorting & Pagination
// =============================================================================

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

/// Single-field sort.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortSpec {
    pub field: String,
    pub direction: SortDirection,
}

impl SortSpec {
    pub fn asc(field: impl Into<String>) -> Self {
        SortSpec {
            field: field.into(),
            direction: SortDirection::Asc,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        SortSpec {
            field: field.into(),
            direction: SortDirection::Desc,
        }
    }

    /// Flips the direction.
    pub fn reversed(self) -> Self {
        let direction = match self.direction {
            SortDirection::Asc => SortDirection::Desc,
            SortDirection::Desc => SortDirection::Asc,
        };
        SortSpec { direction, ..self }
    }
}

/// Stable sort by one field. Missing and null values stay last in both directions.
pub fn sort_records(records: &mut [Record], sort: &SortSpec) {
    records.sort_by(|a, b| {
        let va = get_field(a, &sort.field).unwrap_or(&Value::Null);
        let vb = get_field(b, &sort.field).unwrap_or(&Value::Null);
        match (va.is_null(), vb.is_null()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Greater,
            (false, true) => Ordering::Less,
            (false, false) => match sort.direction {
                SortDirection::Asc => compare_values(va, vb),
                SortDirection::Desc => compare_values(vb, va),
            },
        }
    });
}

/// Applies offset, then limit.
pub fn paginate(records: Vec<Record>, offset: usize, limit: Option<usize>) -> Vec<Record> {
    let iter = records.into_iter().skip(offset);
    match limit {
        Some(n) => iter.take(n).collect(),
        None => iter.collect(),
    }
}

// =============================================================================
// Query Spec
// =============================================================================

/// Steps 2 to 5 of the pipeline, without the predicate.
///
/// The predicate is a closure and lives on the storage-side query builder;
/// it is passed into [`QuerySpec::apply`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QuerySpec {
    pub clauses: Vec<WhereClause>,
    pub sort: Option<SortSpec>,
    pub offset: usize,
    pub limit: Option<usize>,
}

impl QuerySpec {
    /// The first clause, if it can drive an index range scan.
    pub fn index_candidate(&self) -> Option<&WhereClause> {
        self.clauses.first().filter(|c| c.is_index_range())
    }

    /// Runs filter, predicate, sort and pagination over candidate records.
    pub fn apply(
        &self,
        candidates: Vec<Record>,
        predicate: Option<&(dyn Fn(&Record) -> bool + Send + Sync)>,
    ) -> Vec<Record> {
        let mut records: Vec<Record> = candidates
            .into_iter()
            .filter(|r| self.clauses.iter().all(|c| c.matches(r)))
            .filter(|r| predicate.map(|p| p(r)).unwrap_or(true))
            .collect();

        if let Some(sort) = &self.sort {
            sort_records(&mut records, sort);
        }

        paginate(records, self.offset, self.limit)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
