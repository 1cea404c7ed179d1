//! DDL for the relational entities: tables, join tables, then foreign keys.
//! Tables use CREATE TABLE IF NOT EXISTS; constraints that already exist are skipped.

use crate::config::{ColumnType, EntityKind};
use crate::error::AppError;
use crate::model::{ForeignKeySide, Registry};
use crate::sql::{pg_type, quoted};
use crate::store::{Column, TableDef};
use serde_json::Value;
use sqlx::PgPool;
use std::collections::BTreeSet;

fn literal(v: &Value, ty: &ColumnType) -> String {
    let text = match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    let quoted_text = format!("'{}'", text.replace('\'', "''"));
    match ty {
        ColumnType::Json => format!("{}::jsonb", quoted_text),
        ColumnType::String => quoted_text,
        _ => text,
    }
}

fn column_def(c: &Column) -> String {
    let mut def = format!("{} {}", quoted(&c.name), pg_type(&c.ty));
    if c.auto_increment && c.ty == ColumnType::Integer {
        def.push_str(" GENERATED BY DEFAULT AS IDENTITY");
    }
    if !c.nullable || c.primary_key {
        def.push_str(" NOT NULL");
    }
    if let Some(d) = c.default.as_ref().filter(|d| !d.is_null()) {
        def.push_str(" DEFAULT ");
        def.push_str(&literal(d, &c.ty));
    }
    def
}

pub fn create_table_sql(table: &TableDef) -> String {
    let mut defs: Vec<String> = table.columns.iter().map(column_def).collect();
    if !table.key_columns.is_empty() {
        let keys: Vec<String> = table.key_columns.iter().map(|k| quoted(k)).collect();
        defs.push(format!("PRIMARY KEY ({})", keys.join(", ")));
    }
    format!(
        "CREATE TABLE IF NOT EXISTS {} (\n  {}\n)",
        quoted(&table.name),
        defs.join(",\n  ")
    )
}

fn foreign_key(table: &str, column: &str, ref_table: &TableDef, ref_column: &str) -> Option<String> {
    // A reference must point at the whole primary key.
    if ref_table.key_columns.len() != 1 || ref_table.key_columns[0] != ref_column {
        return None;
    }
    Some(format!(
        "ALTER TABLE {} ADD CONSTRAINT {} FOREIGN KEY ({}) REFERENCES {} ({})",
        quoted(table),
        quoted(&format!("fk_{}_{}_{}", table, column, ref_table.name)),
        quoted(column),
        quoted(&ref_table.name),
        quoted(ref_column)
    ))
}

/// Every foreign key implied by the resolved relationships, deduplicated.
pub fn foreign_keys_sql(registry: &Registry) -> Vec<String> {
    let mut out = BTreeSet::new();
    for entity in registry.iter().filter(|e| e.kind == EntityKind::Relational) {
        for rel in &entity.relationships {
            let target = registry.get(rel.target);
            let sql = match (&rel.fk_side, &rel.secondary) {
                (ForeignKeySide::Local, _) => {
                    foreign_key(&entity.table.name, &rel.local_column, &target.table, &rel.remote_column)
                }
                (ForeignKeySide::Remote, _) => {
                    foreign_key(&target.table.name, &rel.remote_column, &entity.table, &rel.local_column)
                }
                (ForeignKeySide::JoinTable, Some(join)) => {
                    if let Some(sql) =
                        foreign_key(&join.table.name, &join.source_column, &entity.table, &rel.local_column)
                    {
                        out.insert(sql);
                    }
                    foreign_key(&join.table.name, &join.target_column, &target.table, &rel.remote_column)
                }
                (ForeignKeySide::JoinTable, None) => None,
            };
            if let Some(sql) = sql {
                out.insert(sql);
            }
        }
    }
    out.into_iter().collect()
}

/// Create every relational entity table and join table, then add foreign keys.
pub async fn ensure_tables(pool: &PgPool, registry: &Registry) -> Result<(), AppError> {
    let tables = registry
        .iter()
        .filter(|e| e.kind == EntityKind::Relational)
        .map(|e| &e.table)
        .chain(registry.join_tables());
    for table in tables {
        let sql = create_table_sql(table);
        tracing::debug!(table = %table.name, sql = %sql, "ensure table");
        sqlx::query(&sql).execute(pool).await?;
    }
    for sql in foreign_keys_sql(registry) {
        if let Err(e) = sqlx::query(&sql).execute(pool).await {
            tracing::debug!(sql = %sql, error = %e, "foreign key skipped");
        }
    }
    tracing::info!(entities = registry.len(), "tables ensured");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EntityConfig;
    use crate::model::RegistryBuilder;
    use serde_json::json;

    fn registry() -> Registry {
        let configs: Vec<EntityConfig> = serde_json::from_value(json!([
            {
                "name": "Owner",
                "columns": [
                    {"name": "id", "type": "integer", "primary_key": true, "auto_increment": true},
                    {"name": "name", "type": "string", "nullable": false, "default": "anon"}
                ],
                "relationships": [
                    {"name": "cars", "target": "car", "cardinality": "many", "local_column": "id", "remote_column": "owner_id"}
                ]
            },
            {
                "name": "Car",
                "columns": [
                    {"name": "id", "type": "integer", "primary_key": true},
                    {"name": "owner_id", "type": "integer"}
                ]
            }
        ]))
        .unwrap();
        RegistryBuilder::new().register_all(configs).unwrap().build().unwrap()
    }

    #[test]
    fn table_ddl() {
        let registry = registry();
        let sql = create_table_sql(&registry.by_key("owner").unwrap().table);
        assert!(sql.starts_with("CREATE TABLE IF NOT EXISTS \"owner\""));
        assert!(sql.contains("\"id\" bigint GENERATED BY DEFAULT AS IDENTITY NOT NULL"));
        assert!(sql.contains("\"name\" text NOT NULL DEFAULT 'anon'"));
        assert!(sql.contains("PRIMARY KEY (\"id\")"));
    }

    #[test]
    fn remote_side_keys_live_on_the_target() {
        let fks = foreign_keys_sql(&registry());
        assert_eq!(fks.len(), 1);
        assert!(fks[0].starts_with("ALTER TABLE \"car\" ADD CONSTRAINT"));
        assert!(fks[0].ends_with("FOREIGN KEY (\"owner_id\") REFERENCES \"owner\" (\"id\")"));
    }
}
