//! Relational store collaborator: transactional row CRUD over declared tables.

pub mod memory;
pub mod postgres;

use crate::config::ColumnType;
use crate::error::StoreError;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::cmp::Ordering;

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// One relational row (or a column subset of it, such as a primary-key map).
pub type Row = Map<String, Value>;

#[derive(Clone, Debug, PartialEq)]
pub struct Column {
    pub name: String,
    pub ty: ColumnType,
    pub primary_key: bool,
    pub nullable: bool,
    pub auto_increment: bool,
    pub default: Option<Value>,
}

/// Physical table description handed to the store. Key columns are sorted by name.
#[derive(Clone, Debug, PartialEq)]
pub struct TableDef {
    pub name: String,
    pub columns: Vec<Column>,
    pub key_columns: Vec<String>,
}

impl TableDef {
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Key map of `row` (key columns only).
    pub fn key_of(&self, row: &Row) -> Row {
        self.key_columns
            .iter()
            .map(|k| (k.clone(), row.get(k).cloned().unwrap_or(Value::Null)))
            .collect()
    }
}

/// Row predicate: OR over conjunctions of column equalities.
#[derive(Clone, Debug, PartialEq)]
pub enum Filter {
    All,
    AnyOf(Vec<Row>),
}

impl Filter {
    pub fn by_ids(ids: Vec<Row>) -> Self {
        Filter::AnyOf(ids)
    }

    pub fn eq(column: &str, value: Value) -> Self {
        let mut cond = Row::new();
        cond.insert(column.to_string(), value);
        Filter::AnyOf(vec![cond])
    }

    pub fn column_in(column: &str, values: impl IntoIterator<Item = Value>) -> Self {
        Filter::AnyOf(
            values
                .into_iter()
                .map(|v| {
                    let mut cond = Row::new();
                    cond.insert(column.to_string(), v);
                    cond
                })
                .collect(),
        )
    }

    /// True when the filter can match no row at all.
    pub fn is_empty(&self) -> bool {
        matches!(self, Filter::AnyOf(v) if v.is_empty())
    }

    /// Conjunction of two filters, distributed into OR-of-AND form.
    pub fn and(self, other: Filter) -> Filter {
        match (self, other) {
            (Filter::All, f) | (f, Filter::All) => f,
            (Filter::AnyOf(a), Filter::AnyOf(b)) => {
                let mut out = Vec::new();
                for left in &a {
                    'pair: for right in &b {
                        let mut merged = left.clone();
                        for (k, v) in right {
                            match merged.get(k) {
                                Some(existing) if !values_eq(existing, v) => continue 'pair,
                                _ => {
                                    merged.insert(k.clone(), v.clone());
                                }
                            }
                        }
                        out.push(merged);
                    }
                }
                Filter::AnyOf(out)
            }
        }
    }

    pub fn matches(&self, row: &Row) -> bool {
        match self {
            Filter::All => true,
            Filter::AnyOf(conds) => conds.iter().any(|cond| {
                cond.iter()
                    .all(|(k, v)| values_eq(row.get(k).unwrap_or(&Value::Null), v))
            }),
        }
    }
}

#[async_trait]
pub trait RelationalTx: Send + Sync {
    /// Insert and return the stored row (defaults and generated keys filled in).
    async fn insert(&mut self, table: &TableDef, row: &Row) -> Result<Row, StoreError>;

    /// Apply `changes` to the row identified by `key`. Changes may include key columns.
    async fn update(
        &mut self,
        table: &TableDef,
        key: &Row,
        changes: &Row,
    ) -> Result<Option<Row>, StoreError>;

    async fn delete(&mut self, table: &TableDef, key: &Row) -> Result<Option<Row>, StoreError>;

    /// Rows matching `filter`, ordered by the table's key columns.
    async fn select(
        &mut self,
        table: &TableDef,
        filter: &Filter,
        limit: Option<u64>,
        offset: Option<u64>,
    ) -> Result<Vec<Row>, StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

#[async_trait]
pub trait RelationalStore: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn RelationalTx>, StoreError>;
}

/// Equality with numeric normalization (`1 == 1.0`).
pub fn values_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(n), Value::Number(m)) => match (n.as_i64(), m.as_i64()) {
            (Some(x), Some(y)) => x == y,
            _ => n.as_f64() == m.as_f64(),
        },
        _ => a == b,
    }
}

/// Total order used for key ordering: null < bool < number < string < anything else.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
        }
    }
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(n), Value::Number(m)) => match (n.as_i64(), m.as_i64()) {
            (Some(x), Some(y)) => x.cmp(&y),
            _ => n
                .as_f64()
                .partial_cmp(&m.as_f64())
                .unwrap_or(Ordering::Equal),
        },
        (Value::String(x), Value::String(y)) => x.cmp(y),
        _ => rank(a)
            .cmp(&rank(b))
            .then_with(|| a.to_string().cmp(&b.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(v: Value) -> Row {
        v.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn and_distributes_and_drops_conflicts() {
        let ids = Filter::by_ids(vec![row(json!({"id": 1})), row(json!({"id": 2}))]);
        let by_store = Filter::eq("store_id", json!(7));
        let combined = ids.and(by_store);
        assert_eq!(
            combined,
            Filter::AnyOf(vec![
                row(json!({"id": 1, "store_id": 7})),
                row(json!({"id": 2, "store_id": 7})),
            ])
        );

        let conflicting = Filter::eq("id", json!(1)).and(Filter::eq("id", json!(2)));
        assert!(conflicting.is_empty());
    }

    #[test]
    fn matches_normalizes_numbers() {
        let f = Filter::eq("price", json!(10));
        assert!(f.matches(&row(json!({"price": 10.0}))));
        assert!(!f.matches(&row(json!({"price": "10"}))));
        assert!(Filter::All.matches(&Row::new()));
    }
}
