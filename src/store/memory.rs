//! In-process relational store. Transactions work on a snapshot that replaces the
//! committed tables on commit (last committer wins).

use super::{compare_values, values_eq, Filter, RelationalStore, RelationalTx, Row, TableDef};
use crate::error::StoreError;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

const UNIQUE_VIOLATION: &str = "23505";
const NOT_NULL_VIOLATION: &str = "23502";

#[derive(Clone, Debug, Default)]
struct Tables {
    rows: HashMap<String, Vec<Row>>,
    sequences: HashMap<String, i64>,
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Tables>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Committed rows of `table`, for assertions.
    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.inner
            .lock()
            .map(|t| t.rows.get(table).cloned().unwrap_or_default())
            .unwrap_or_default()
    }
}

#[async_trait]
impl RelationalStore for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn RelationalTx>, StoreError> {
        let snapshot = self
            .inner
            .lock()
            .map_err(|_| StoreError::Backend("memory store lock poisoned".into()))?
            .clone();
        Ok(Box::new(MemoryTx {
            store: self.inner.clone(),
            working: snapshot,
        }))
    }
}

pub struct MemoryTx {
    store: Arc<Mutex<Tables>>,
    working: Tables,
}

fn key_matches(table: &TableDef, row: &Row, key: &Row) -> bool {
    key.iter()
        .all(|(k, v)| values_eq(row.get(k).unwrap_or(&Value::Null), v))
        && !key.is_empty()
        && key.keys().all(|k| table.column(k).is_some())
}

fn describe_key(table: &TableDef, row: &Row) -> String {
    let cols = table.key_columns.join(", ");
    let vals: Vec<String> = table
        .key_columns
        .iter()
        .map(|k| match row.get(k) {
            Some(Value::String(s)) => s.clone(),
            Some(v) => v.to_string(),
            None => "null".into(),
        })
        .collect();
    format!("Key ({})=({}) already exists.", cols, vals.join(", "))
}

impl MemoryTx {
    fn check_unique(&self, table: &TableDef, row: &Row, skip: Option<usize>) -> Result<(), StoreError> {
        let rows = self.working.rows.get(&table.name).map(Vec::as_slice).unwrap_or(&[]);
        let key = table.key_of(row);
        let clash = rows
            .iter()
            .enumerate()
            .any(|(i, r)| Some(i) != skip && key_matches(table, r, &key));
        if clash {
            return Err(StoreError::Integrity {
                code: UNIQUE_VIOLATION.into(),
                message: format!(
                    "duplicate key value violates unique constraint \"{}_pkey\"",
                    table.name
                ),
                params: Value::Object(row.clone()),
                details: Some(describe_key(table, row)),
            });
        }
        Ok(())
    }

    fn next_sequence(&mut self, table: &TableDef, column: &str) -> i64 {
        let seq_name = format!("{}.{}", table.name, column);
        let max_existing = self
            .working
            .rows
            .get(&table.name)
            .into_iter()
            .flatten()
            .filter_map(|r| r.get(column).and_then(Value::as_i64))
            .max()
            .unwrap_or(0);
        let seq = self.working.sequences.entry(seq_name).or_insert(0);
        *seq = (*seq).max(max_existing) + 1;
        *seq
    }
}

#[async_trait]
impl RelationalTx for MemoryTx {
    async fn insert(&mut self, table: &TableDef, row: &Row) -> Result<Row, StoreError> {
        let mut stored = Row::new();
        for col in &table.columns {
            let mut value = row.get(&col.name).cloned().unwrap_or(Value::Null);
            if value.is_null() {
                if col.auto_increment {
                    value = Value::from(self.next_sequence(table, &col.name));
                } else if let Some(default) = &col.default {
                    value = default.clone();
                } else if !col.nullable {
                    return Err(StoreError::Integrity {
                        code: NOT_NULL_VIOLATION.into(),
                        message: format!(
                            "null value in column \"{}\" of relation \"{}\" violates not-null constraint",
                            col.name, table.name
                        ),
                        params: Value::Object(row.clone()),
                        details: None,
                    });
                }
            }
            stored.insert(col.name.clone(), value);
        }
        self.check_unique(table, &stored, None)?;
        self.working
            .rows
            .entry(table.name.clone())
            .or_default()
            .push(stored.clone());
        Ok(stored)
    }

    async fn update(
        &mut self,
        table: &TableDef,
        key: &Row,
        changes: &Row,
    ) -> Result<Option<Row>, StoreError> {
        let Some(pos) = self
            .working
            .rows
            .get(&table.name)
            .and_then(|rows| rows.iter().position(|r| key_matches(table, r, key)))
        else {
            return Ok(None);
        };
        let mut updated = self.working.rows[&table.name][pos].clone();
        for (k, v) in changes {
            if table.column(k).is_some() {
                updated.insert(k.clone(), v.clone());
            }
        }
        self.check_unique(table, &updated, Some(pos))?;
        if let Some(rows) = self.working.rows.get_mut(&table.name) {
            rows[pos] = updated.clone();
        }
        Ok(Some(updated))
    }

    async fn delete(&mut self, table: &TableDef, key: &Row) -> Result<Option<Row>, StoreError> {
        let Some(rows) = self.working.rows.get_mut(&table.name) else {
            return Ok(None);
        };
        match rows.iter().position(|r| key_matches(table, r, key)) {
            Some(pos) => Ok(Some(rows.remove(pos))),
            None => Ok(None),
        }
    }

    async fn select(
        &mut self,
        table: &TableDef,
        filter: &Filter,
        limit: Option<u64>,
        offset: Option<u64>,
    ) -> Result<Vec<Row>, StoreError> {
        let mut rows: Vec<Row> = self
            .working
            .rows
            .get(&table.name)
            .into_iter()
            .flatten()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            table
                .key_columns
                .iter()
                .map(|k| {
                    compare_values(
                        a.get(k).unwrap_or(&Value::Null),
                        b.get(k).unwrap_or(&Value::Null),
                    )
                })
                .find(|o| o.is_ne())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        let offset = offset.unwrap_or(0) as usize;
        let limit = limit.map(|l| l as usize).unwrap_or(usize::MAX);
        Ok(rows.into_iter().skip(offset).take(limit).collect())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let mut committed = self
            .store
            .lock()
            .map_err(|_| StoreError::Backend("memory store lock poisoned".into()))?;
        *committed = self.working;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}
