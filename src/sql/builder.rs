//! Builds parameterized INSERT, SELECT, UPDATE, DELETE over a table definition.
//! Every statement yields one `row_to_json` column so rows decode straight into JSON.

use crate::config::ColumnType;
use crate::store::{Filter, Row, TableDef};
use serde_json::Value;

/// Quote identifier for PostgreSQL (safe: only from entity declarations).
pub fn quoted(s: &str) -> String {
    format!("\"{}\"", s.replace('"', "\"\""))
}

pub fn pg_type(ty: &ColumnType) -> &'static str {
    match ty {
        ColumnType::Integer => "bigint",
        ColumnType::Number => "double precision",
        ColumnType::String => "text",
        ColumnType::Boolean => "boolean",
        ColumnType::Json => "jsonb",
    }
}

#[derive(Debug)]
pub struct QueryBuf {
    pub sql: String,
    pub params: Vec<Value>,
}

impl QueryBuf {
    fn new() -> Self {
        QueryBuf {
            sql: String::new(),
            params: Vec::new(),
        }
    }

    fn push_param(&mut self, v: Value) -> u32 {
        let n = self.params.len() as u32 + 1;
        self.params.push(v);
        n
    }

    /// Push `v` and return its placeholder, cast to the column type when known.
    fn placeholder(&mut self, table: &TableDef, column: &str, v: Value) -> String {
        let n = self.push_param(v);
        table
            .column(column)
            .map(|c| format!("${}::{}", n, pg_type(&c.ty)))
            .unwrap_or_else(|| format!("${}", n))
    }
}

/// `a = $1 AND b = $2`; a null value becomes `IS NULL`.
fn conjunction(q: &mut QueryBuf, table: &TableDef, alias: &str, cond: &Row) -> String {
    if cond.is_empty() {
        return "TRUE".into();
    }
    cond.iter()
        .map(|(col, val)| {
            let lhs = format!("{}.{}", alias, quoted(col));
            if val.is_null() {
                format!("{} IS NULL", lhs)
            } else {
                let ph = q.placeholder(table, col, val.clone());
                format!("{} = {}", lhs, ph)
            }
        })
        .collect::<Vec<_>>()
        .join(" AND ")
}

fn where_clause(q: &mut QueryBuf, table: &TableDef, alias: &str, filter: &Filter) -> String {
    match filter {
        Filter::All => String::new(),
        Filter::AnyOf(conds) if conds.is_empty() => " WHERE 1 = 0".into(),
        Filter::AnyOf(conds) => {
            let parts: Vec<String> = conds
                .iter()
                .map(|c| format!("({})", conjunction(q, table, alias, c)))
                .collect();
            format!(" WHERE {}", parts.join(" OR "))
        }
    }
}

fn known_columns<'a>(table: &'a TableDef, row: &'a Row) -> impl Iterator<Item = (&'a String, &'a Value)> {
    row.iter().filter(move |(k, _)| table.column(k).is_some())
}

/// SELECT rows matching `filter` ordered by the key columns.
pub fn select(table: &TableDef, filter: &Filter, limit: Option<u64>, offset: Option<u64>) -> QueryBuf {
    const ALIAS: &str = "t";
    let mut q = QueryBuf::new();
    let where_sql = where_clause(&mut q, table, ALIAS, filter);
    let order: Vec<String> = table
        .key_columns
        .iter()
        .map(|k| format!("{}.{}", ALIAS, quoted(k)))
        .collect();
    let order_clause = if order.is_empty() {
        String::new()
    } else {
        format!(" ORDER BY {}", order.join(", "))
    };
    let limit_clause = limit.map(|n| format!(" LIMIT {}", n)).unwrap_or_default();
    let offset_clause = offset.map(|n| format!(" OFFSET {}", n)).unwrap_or_default();
    q.sql = format!(
        "SELECT row_to_json({alias}) AS row FROM {} {alias}{}{}{}{}",
        quoted(&table.name),
        where_sql,
        order_clause,
        limit_clause,
        offset_clause,
        alias = ALIAS,
    );
    q
}

/// INSERT the known columns of `row`. Generated keys left null are omitted so the
/// column default applies.
pub fn insert(table: &TableDef, row: &Row) -> QueryBuf {
    let mut q = QueryBuf::new();
    let mut cols = Vec::new();
    let mut placeholders = Vec::new();
    for (name, val) in known_columns(table, row) {
        let generated = table.column(name).map(|c| c.auto_increment).unwrap_or(false);
        if generated && val.is_null() {
            continue;
        }
        placeholders.push(q.placeholder(table, name, val.clone()));
        cols.push(quoted(name));
    }
    let values = if cols.is_empty() {
        "DEFAULT VALUES".to_string()
    } else {
        format!("({}) VALUES ({})", cols.join(", "), placeholders.join(", "))
    };
    q.sql = format!(
        "WITH r AS (INSERT INTO {} {} RETURNING *) SELECT row_to_json(r) AS row FROM r",
        quoted(&table.name),
        values
    );
    q
}

/// UPDATE the row identified by `key`; with no known changes this degrades to a select.
pub fn update(table: &TableDef, key: &Row, changes: &Row) -> QueryBuf {
    let mut q = QueryBuf::new();
    let mut sets = Vec::new();
    for (name, val) in known_columns(table, changes) {
        let rhs = q.placeholder(table, name, val.clone());
        sets.push(format!("{} = {}", quoted(name), rhs));
    }
    if sets.is_empty() {
        return select(table, &Filter::AnyOf(vec![key.clone()]), Some(1), None);
    }
    let cond = conjunction(&mut q, table, &quoted(&table.name), key);
    q.sql = format!(
        "WITH r AS (UPDATE {} SET {} WHERE {} RETURNING *) SELECT row_to_json(r) AS row FROM r",
        quoted(&table.name),
        sets.join(", "),
        cond
    );
    q
}

pub fn delete(table: &TableDef, key: &Row) -> QueryBuf {
    let mut q = QueryBuf::new();
    let cond = conjunction(&mut q, table, &quoted(&table.name), key);
    q.sql = format!(
        "WITH r AS (DELETE FROM {} WHERE {} RETURNING *) SELECT row_to_json(r) AS row FROM r",
        quoted(&table.name),
        cond
    );
    q
}
