//! PostgreSQL relational store over a sqlx pool.

use super::{Filter, RelationalStore, RelationalTx, Row, TableDef};
use crate::error::StoreError;
use crate::sql::{self, PgBindValue, QueryBuf};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::{PgDatabaseError, PgPool};
use sqlx::{PgConnection, Postgres, Transaction};

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        PgStore { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl RelationalStore for PgStore {
    async fn begin(&self) -> Result<Box<dyn RelationalTx>, StoreError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgTx { tx }))
    }
}

pub struct PgTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl RelationalTx for PgTx {
    async fn insert(&mut self, table: &TableDef, row: &Row) -> Result<Row, StoreError> {
        let q = sql::insert(table, row);
        let rows = fetch_rows(&mut self.tx, &q, &Value::Object(row.clone())).await?;
        rows.into_iter()
            .next()
            .ok_or_else(|| StoreError::Backend(format!("insert into {} returned no row", table.name)))
    }

    async fn update(
        &mut self,
        table: &TableDef,
        key: &Row,
        changes: &Row,
    ) -> Result<Option<Row>, StoreError> {
        let q = sql::update(table, key, changes);
        let rows = fetch_rows(&mut self.tx, &q, &Value::Object(changes.clone())).await?;
        Ok(rows.into_iter().next())
    }

    async fn delete(&mut self, table: &TableDef, key: &Row) -> Result<Option<Row>, StoreError> {
        let q = sql::delete(table, key);
        let rows = fetch_rows(&mut self.tx, &q, &Value::Object(key.clone())).await?;
        Ok(rows.into_iter().next())
    }

    async fn select(
        &mut self,
        table: &TableDef,
        filter: &Filter,
        limit: Option<u64>,
        offset: Option<u64>,
    ) -> Result<Vec<Row>, StoreError> {
        let q = sql::select(table, filter, limit, offset);
        fetch_rows(&mut self.tx, &q, &Value::Null).await
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.rollback().await?;
        Ok(())
    }
}

async fn fetch_rows(conn: &mut PgConnection, q: &QueryBuf, input: &Value) -> Result<Vec<Row>, StoreError> {
    tracing::debug!(sql = %q.sql, params = ?q.params, "query");
    let mut query = sqlx::query_scalar::<Postgres, Value>(&q.sql);
    for p in &q.params {
        query = query.bind(PgBindValue::from_json(p));
    }
    let values = query
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| map_db_error(e, input))?;
    Ok(values
        .into_iter()
        .filter_map(|v| match v {
            Value::Object(m) => Some(m),
            _ => None,
        })
        .collect())
}

/// SQLSTATE class 23 is integrity-constraint violation; everything else stays opaque.
fn map_db_error(e: sqlx::Error, input: &Value) -> StoreError {
    if let sqlx::Error::Database(db) = &e {
        if let Some(code) = db.code().filter(|c| c.starts_with("23")) {
            let details = db
                .try_downcast_ref::<PgDatabaseError>()
                .and_then(|pg| pg.detail())
                .map(String::from);
            return StoreError::Integrity {
                code: code.into_owned(),
                message: db.message().to_string(),
                params: input.clone(),
                details,
            };
        }
    }
    StoreError::Db(e)
}
