//! Relational entity operations: nested writes, reads through the cache, and the
//! recursive dictionary form stored in cache buckets.

use super::identity::EntityRef;
use super::registry::{EntityType, ForeignKeySide, Registry, Relationship};
use crate::config::Cardinality;
use crate::error::{AppError, CacheError, ModelError, StoreError};
use crate::session::Session;
use crate::store::{values_eq, Filter, Row, TableDef};
use futures_util::future::BoxFuture;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};

/// Key carrying the nested operation inside a relationship value.
pub const OPERATION_KEY: &str = "_operation";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum NestedOp {
    Get,
    Insert,
    Update,
    Delete,
    Remove,
}

impl NestedOp {
    fn parse(v: Option<Value>, input: &Value) -> Result<Self, ModelError> {
        let Some(v) = v else {
            return Ok(NestedOp::Get);
        };
        match v.as_str() {
            Some("get") => Ok(NestedOp::Get),
            Some("insert") => Ok(NestedOp::Insert),
            Some("update") => Ok(NestedOp::Update),
            Some("delete") => Ok(NestedOp::Delete),
            Some("remove") => Ok(NestedOp::Remove),
            _ => Err(ModelError::new(format!("Invalid nested operation {}", v)).with_instance(input.clone())),
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            NestedOp::Get => "get",
            NestedOp::Insert => "insert",
            NestedOp::Update => "update",
            NestedOp::Delete => "delete",
            NestedOp::Remove => "remove",
        }
    }
}

/// Outcome of one nested relationship item.
enum Nested {
    Link(Row),
    Unlink(Row),
    Deleted,
}

/// Options of a read.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct GetQuery {
    pub ids: Option<Vec<Row>>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    /// Column equalities (array = any of) or relationship filters (object / array of objects).
    pub filters: Row,
}

pub(crate) fn as_objects(objs: &Value) -> Result<Vec<Row>, ModelError> {
    let items: Vec<&Value> = match objs {
        Value::Array(items) => items.iter().collect(),
        other => vec![other],
    };
    items
        .into_iter()
        .map(|v| match v {
            Value::Object(m) => Ok(m.clone()),
            other => Err(ModelError::new(format!("expected an object, got {}", other)).with_instance(objs.clone())),
        })
        .collect()
}

async fn select(session: &mut Session, table: &TableDef, filter: Filter) -> Result<Vec<Row>, AppError> {
    if filter.is_empty() {
        return Ok(Vec::new());
    }
    Ok(session.tx().await?.select(table, &filter, None, None).await?)
}

pub(crate) async fn load_row(session: &mut Session, entity: &EntityType, ids: &Row) -> Result<Option<Row>, AppError> {
    let rows = session
        .tx()
        .await?
        .select(&entity.table, &Filter::AnyOf(vec![ids.clone()]), Some(1), None)
        .await?;
    Ok(rows.into_iter().next())
}

fn non_null(row: &Row, column: &str) -> Option<Value> {
    row.get(column).filter(|v| !v.is_null()).cloned()
}

/// Target rows reached from `row` through `rel`.
async fn targets_of(
    session: &mut Session,
    registry: &Registry,
    rel: &Relationship,
    row: &Row,
) -> Result<Vec<Row>, AppError> {
    let Some(value) = non_null(row, &rel.local_column) else {
        return Ok(Vec::new());
    };
    let target = registry.get(rel.target);
    match &rel.secondary {
        None => select(session, &target.table, Filter::eq(&rel.remote_column, value)).await,
        Some(join) => {
            let links = select(session, &join.table, Filter::eq(&join.source_column, value)).await?;
            let values: Vec<Value> = links.iter().filter_map(|l| non_null(l, &join.target_column)).collect();
            select(session, &target.table, Filter::column_in(&rel.remote_column, values)).await
        }
    }
}

/// Values of `rel.local_column` on source rows that reach any of `targets` through `rel`.
async fn source_values(
    session: &mut Session,
    rel: &Relationship,
    targets: &[Row],
) -> Result<Vec<Value>, AppError> {
    let values: Vec<Value> = targets.iter().filter_map(|t| non_null(t, &rel.remote_column)).collect();
    match &rel.secondary {
        None => Ok(values),
        Some(join) => {
            let links = select(session, &join.table, Filter::column_in(&join.target_column, values)).await?;
            Ok(links.iter().filter_map(|l| non_null(l, &join.source_column)).collect())
        }
    }
}

/// Instances whose dictionary form embeds `row` (sources of every backreference).
async fn related_to_row(
    session: &mut Session,
    registry: &Registry,
    entity: &EntityType,
    row: &Row,
) -> Result<Vec<(EntityRef, Row)>, AppError> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for backref in &entity.backrefs {
        let source = registry.get(backref.source);
        let rel = &source.relationships[backref.relationship];
        let values = source_values(session, rel, std::slice::from_ref(row)).await?;
        for r in select(session, &source.table, Filter::column_in(&rel.local_column, values)).await? {
            let r_ref = source.entity_ref(&r)?;
            if seen.insert(r_ref.clone()) {
                out.push((r_ref, source.ids_of(&r)));
            }
        }
    }
    Ok(out)
}

/// Related-entities query for the instance identified by `ids`.
pub async fn related(session: &mut Session, entity: &EntityType, ids: &Row) -> Result<Vec<(EntityRef, Row)>, AppError> {
    let registry = session.registry().clone();
    match load_row(session, entity, ids).await? {
        Some(row) => related_to_row(session, &registry, entity, &row).await,
        None => Ok(Vec::new()),
    }
}

/// Dictionary form of `row`: columns plus relationships, expanded recursively.
pub async fn todict(session: &mut Session, entity: &EntityType, row: &Row) -> Result<Value, AppError> {
    let registry = session.registry().clone();
    let mut path = Vec::new();
    todict_inner(session, &registry, entity, row, &entity.todict_schema, &mut path).await
}

fn todict_inner<'a>(
    session: &'a mut Session,
    registry: &'a Registry,
    entity: &'a EntityType,
    row: &'a Row,
    schema: &'a Map<String, Value>,
    path: &'a mut Vec<EntityRef>,
) -> BoxFuture<'a, Result<Value, AppError>> {
    Box::pin(async move {
        let mut out = Map::new();
        for col in &entity.table.columns {
            if schema.get(&col.name) == Some(&Value::Bool(false)) {
                continue;
            }
            out.insert(col.name.clone(), row.get(&col.name).cloned().unwrap_or(Value::Null));
        }
        path.push(entity.entity_ref(row)?);
        for rel in &entity.relationships {
            let target = registry.get(rel.target);
            let sub_schema = match schema.get(&rel.name) {
                Some(Value::Bool(false)) => continue,
                Some(Value::Object(m)) => m.clone(),
                _ => target.todict_schema.clone(),
            };
            let rows = targets_of(session, registry, rel, row).await?;
            let found = !rows.is_empty();
            let mut items = Vec::with_capacity(rows.len());
            for trow in &rows {
                if path.contains(&target.entity_ref(trow)?) {
                    continue;
                }
                items.push(todict_inner(session, registry, target, trow, &sub_schema, path).await?);
            }
            match rel.cardinality {
                Cardinality::Many => {
                    out.insert(rel.name.clone(), Value::Array(items));
                }
                Cardinality::One => match items.into_iter().next() {
                    Some(v) => {
                        out.insert(rel.name.clone(), v);
                    }
                    None if !found => {
                        out.insert(rel.name.clone(), Value::Null);
                    }
                    None => {}
                },
            }
        }
        path.pop();
        Ok(Value::Object(out))
    })
}

/// Split an input object into column values and relationship values.
fn split_values<'e>(
    entity: &'e EntityType,
    values: Row,
    input: &Value,
) -> Result<(Row, Vec<(&'e Relationship, Value)>), ModelError> {
    let mut columns = Row::new();
    let mut rels = Vec::new();
    for (name, value) in values {
        if entity.column(&name).is_some() {
            columns.insert(name, value);
        } else if let Some(rel) = entity.relationship(&name) {
            rels.push((rel, value));
        } else {
            return Err(ModelError::new(format!(
                "{} is an invalid keyword argument for {}",
                name, entity.name
            ))
            .with_instance(input.clone()));
        }
    }
    Ok((columns, rels))
}

/// Items of a nested relationship value; None stands for an explicit null.
fn nested_items(rel: &Relationship, value: Value, input: &Value) -> Result<Vec<Option<Row>>, ModelError> {
    let items = match (rel.cardinality, value) {
        (Cardinality::One, Value::Array(_)) => {
            return Err(ModelError::new(format!("Relationship '{}' don't use lists.", rel.name))
                .with_instance(input.clone()))
        }
        (Cardinality::One, Value::Null) => return Ok(vec![None]),
        (Cardinality::One, v) => vec![v],
        (Cardinality::Many, Value::Null) => Vec::new(),
        (Cardinality::Many, Value::Array(items)) => items,
        (Cardinality::Many, _) => {
            return Err(ModelError::new(format!("Relationship '{}' expects a list.", rel.name))
                .with_instance(input.clone()))
        }
    };
    items
        .into_iter()
        .map(|v| match v {
            Value::Object(m) => Ok(Some(m)),
            other => Err(ModelError::new(format!(
                "invalid value {} for relationship '{}'",
                other, rel.name
            ))
            .with_instance(input.clone())),
        })
        .collect()
}

async fn existing_row(
    session: &mut Session,
    target: &EntityType,
    item: &Row,
    op: NestedOp,
    input: &Value,
) -> Result<Row, AppError> {
    let ids = target.cast_ids(item).map_err(|e| e.with_instance(input.clone()))?;
    let existing = match ids {
        Some(ids) => load_row(session, target, &ids).await?,
        None => None,
    };
    existing.ok_or_else(|| {
        ModelError::new(format!("Can't execute nested '{}' operation", op.as_str()))
            .with_instance(input.clone())
            .into()
    })
}

async fn resolve_nested(
    session: &mut Session,
    registry: &Registry,
    target: &EntityType,
    mut item: Row,
    input: &Value,
) -> Result<Nested, AppError> {
    let op = NestedOp::parse(item.remove(OPERATION_KEY), input)?;
    match op {
        NestedOp::Insert => Ok(Nested::Link(new_instance(session, registry, target, item, input).await?)),
        NestedOp::Get => Ok(Nested::Link(existing_row(session, target, &item, op, input).await?)),
        NestedOp::Update => {
            let row = existing_row(session, target, &item, op, input).await?;
            Ok(Nested::Link(update_instance(session, registry, target, row, item, input).await?))
        }
        NestedOp::Delete => {
            let row = existing_row(session, target, &item, op, input).await?;
            delete_instance(session, registry, target, &row).await?;
            Ok(Nested::Deleted)
        }
        NestedOp::Remove => Ok(Nested::Unlink(existing_row(session, target, &item, op, input).await?)),
    }
}

fn not_linked(target: &EntityType, row: &Row, input: &Value) -> ModelError {
    let values: Vec<Value> = target
        .id_names
        .iter()
        .map(|n| row.get(n).cloned().unwrap_or(Value::Null))
        .collect();
    ModelError::new(format!(
        "can't remove model '{}' on column(s) '{}' with value(s) {}",
        target.key,
        target.id_names.join("', '"),
        Value::Array(values)
    ))
    .with_instance(input.clone())
}

/// Relationship whose foreign key sits on the source row: resolved before the row is written.
async fn apply_local(
    session: &mut Session,
    registry: &Registry,
    rel: &Relationship,
    value: Value,
    row: &mut Row,
    input: &Value,
) -> Result<(), AppError> {
    let target = registry.get(rel.target);
    for item in nested_items(rel, value, input)? {
        let linked = match item {
            None => Value::Null,
            Some(obj) => match resolve_nested(session, registry, target, obj, input).await? {
                Nested::Link(t) => t.get(&rel.remote_column).cloned().unwrap_or(Value::Null),
                Nested::Unlink(_) | Nested::Deleted => Value::Null,
            },
        };
        row.insert(rel.local_column.clone(), linked);
    }
    Ok(())
}

/// Relationship stored on target rows or in a join table: applied once the source row exists.
async fn apply_remote(
    session: &mut Session,
    registry: &Registry,
    rel: &Relationship,
    value: Value,
    source_row: &Row,
    input: &Value,
) -> Result<(), AppError> {
    let target = registry.get(rel.target);
    let key_value = source_row.get(&rel.local_column).cloned().unwrap_or(Value::Null);
    for item in nested_items(rel, value, input)? {
        let outcome = match item {
            None => None,
            Some(obj) => Some(resolve_nested(session, registry, target, obj, input).await?),
        };
        let current = targets_of(session, registry, rel, source_row).await?;
        match outcome {
            Some(Nested::Deleted) => {}
            Some(Nested::Link(t)) => {
                if rel.cardinality == Cardinality::One {
                    let keep = target.identity(&t)?;
                    for other in &current {
                        if target.identity(other)? != keep {
                            unlink(session, registry, rel, &key_value, other).await?;
                        }
                    }
                }
                link(session, registry, rel, &key_value, &t).await?;
            }
            Some(Nested::Unlink(t)) if rel.cardinality == Cardinality::Many => {
                let t_key = target.identity(&t)?;
                let mut is_linked = false;
                for c in &current {
                    if target.identity(c)? == t_key {
                        is_linked = true;
                    }
                }
                if !is_linked {
                    return Err(not_linked(target, &t, input).into());
                }
                unlink(session, registry, rel, &key_value, &t).await?;
            }
            Some(Nested::Unlink(_)) | None => {
                for other in &current {
                    unlink(session, registry, rel, &key_value, other).await?;
                }
            }
        }
    }
    Ok(())
}

async fn link(
    session: &mut Session,
    registry: &Registry,
    rel: &Relationship,
    key_value: &Value,
    target_row: &Row,
) -> Result<(), AppError> {
    let target = registry.get(rel.target);
    match (&rel.secondary, rel.fk_side) {
        (Some(join), _) => {
            let mut link_row = Row::new();
            link_row.insert(join.source_column.clone(), key_value.clone());
            link_row.insert(
                join.target_column.clone(),
                target_row.get(&rel.remote_column).cloned().unwrap_or(Value::Null),
            );
            let exists = !select(session, &join.table, Filter::AnyOf(vec![link_row.clone()])).await?.is_empty();
            if !exists {
                session.tx().await?.insert(&join.table, &link_row).await?;
            }
        }
        (None, ForeignKeySide::Remote) => {
            if !values_eq(target_row.get(&rel.remote_column).unwrap_or(&Value::Null), key_value) {
                let mut changes = Row::new();
                changes.insert(rel.remote_column.clone(), key_value.clone());
                update_row(session, registry, target, target_row, changes).await?;
            }
        }
        (None, ForeignKeySide::Local | ForeignKeySide::JoinTable) => {}
    }
    Ok(())
}

async fn unlink(
    session: &mut Session,
    registry: &Registry,
    rel: &Relationship,
    key_value: &Value,
    target_row: &Row,
) -> Result<(), AppError> {
    let target = registry.get(rel.target);
    match &rel.secondary {
        Some(join) => {
            let mut link_row = Row::new();
            link_row.insert(join.source_column.clone(), key_value.clone());
            link_row.insert(
                join.target_column.clone(),
                target_row.get(&rel.remote_column).cloned().unwrap_or(Value::Null),
            );
            session.tx().await?.delete(&join.table, &link_row).await?;
        }
        None => {
            let mut changes = Row::new();
            changes.insert(rel.remote_column.clone(), Value::Null);
            update_row(session, registry, target, target_row, changes).await?;
        }
    }
    Ok(())
}

/// Update one stored row, refreshing every instance that embedded its previous state.
async fn update_row(
    session: &mut Session,
    registry: &Registry,
    entity: &EntityType,
    current: &Row,
    changes: Row,
) -> Result<Row, AppError> {
    let before = related_to_row(session, registry, entity, current).await?;
    session.mark_related(before);
    let old_key = entity.identity(current)?;
    let updated = session
        .tx()
        .await?
        .update(&entity.table, &entity.ids_of(current), &changes)
        .await?
        .ok_or_else(|| StoreError::Backend(format!("row of '{}' vanished during update", entity.key)))?;
    session.mark_persisted(entity, &updated)?;
    if entity.identity(&updated)? != old_key {
        session.mark_renamed(entity, old_key, &updated)?;
    }
    Ok(updated)
}

fn new_instance<'a>(
    session: &'a mut Session,
    registry: &'a Registry,
    entity: &'a EntityType,
    values: Row,
    input: &'a Value,
) -> BoxFuture<'a, Result<Row, AppError>> {
    Box::pin(async move {
        let (columns, rels) = split_values(entity, values, input)?;
        let mut row = entity.cast_row(&columns).map_err(|e| e.with_instance(input.clone()))?;
        let (local, remote): (Vec<_>, Vec<_>) = rels.into_iter().partition(|(r, _)| r.fk_side == ForeignKeySide::Local);
        for (rel, value) in local {
            apply_local(session, registry, rel, value, &mut row, input).await?;
        }
        let stored = session.tx().await?.insert(&entity.table, &row).await?;
        session.mark_persisted(entity, &stored)?;
        for (rel, value) in remote {
            apply_remote(session, registry, rel, value, &stored, input).await?;
        }
        Ok(stored)
    })
}

fn update_instance<'a>(
    session: &'a mut Session,
    registry: &'a Registry,
    entity: &'a EntityType,
    current: Row,
    values: Row,
    input: &'a Value,
) -> BoxFuture<'a, Result<Row, AppError>> {
    Box::pin(async move {
        let (columns, rels) = split_values(entity, values, input)?;
        let mut changes = entity.cast_row(&columns).map_err(|e| e.with_instance(input.clone()))?;
        let (local, remote): (Vec<_>, Vec<_>) = rels.into_iter().partition(|(r, _)| r.fk_side == ForeignKeySide::Local);
        for (rel, value) in local {
            apply_local(session, registry, rel, value, &mut changes, input).await?;
        }
        let row = update_row(session, registry, entity, &current, changes).await?;
        for (rel, value) in remote {
            apply_remote(session, registry, rel, value, &row, input).await?;
        }
        Ok(row)
    })
}

async fn delete_instance(
    session: &mut Session,
    registry: &Registry,
    entity: &EntityType,
    row: &Row,
) -> Result<(), AppError> {
    let related = related_to_row(session, registry, entity, row).await?;

    let mut links: Vec<(&TableDef, Filter)> = Vec::new();
    for rel in &entity.relationships {
        if let (Some(join), Some(v)) = (&rel.secondary, non_null(row, &rel.local_column)) {
            links.push((&join.table, Filter::eq(&join.source_column, v)));
        }
        if let (Some(join), true, Some(v)) = (&rel.secondary, rel.target == entity.id, non_null(row, &rel.remote_column)) {
            links.push((&join.table, Filter::eq(&join.target_column, v)));
        }
    }
    for backref in &entity.backrefs {
        let rel = &registry.get(backref.source).relationships[backref.relationship];
        if let (Some(join), Some(v)) = (&rel.secondary, non_null(row, &rel.remote_column)) {
            links.push((&join.table, Filter::eq(&join.target_column, v)));
        }
    }
    for (table, filter) in links {
        for link_row in select(session, table, filter).await? {
            session.tx().await?.delete(table, &table.key_of(&link_row)).await?;
        }
    }

    session.tx().await?.delete(&entity.table, &entity.ids_of(row)).await?;
    session.mark_deleted(entity, row, related)?;
    Ok(())
}

/// Filter for `filters`: columns by equality, relationships by the related ids.
async fn build_filter(
    session: &mut Session,
    registry: &Registry,
    entity: &EntityType,
    filters: &Row,
) -> Result<Filter, AppError> {
    let mut filter = Filter::All;
    for (name, value) in filters {
        let part = if entity.column(name).is_some() {
            let values: Vec<Value> = match value {
                Value::Array(items) => items.clone(),
                other => vec![other.clone()],
            };
            let mut cast = Vec::with_capacity(values.len());
            for v in &values {
                let mut one = Row::new();
                one.insert(name.clone(), v.clone());
                if let Some(c) = entity.cast_row(&one)?.remove(name) {
                    cast.push(c);
                }
            }
            Filter::column_in(name, cast)
        } else if let Some(rel) = entity.relationship(name) {
            let target = registry.get(rel.target);
            let conds = as_objects(value)?
                .iter()
                .map(|o| target.cast_row(o))
                .collect::<Result<Vec<_>, _>>()?;
            let targets = select(session, &target.table, Filter::AnyOf(conds)).await?;
            let values = source_values(session, rel, &targets).await?;
            Filter::column_in(&rel.local_column, values)
        } else {
            return Err(ModelError::new(format!(
                "{} is an invalid keyword argument for {}",
                name, entity.name
            ))
            .with_instance(Value::Object(filters.clone()))
            .into());
        };
        filter = filter.and(part);
    }
    Ok(filter)
}

async fn rows_to_dicts(session: &mut Session, entity: &EntityType, ids: &[Row]) -> Result<Vec<Value>, AppError> {
    let mut out = Vec::with_capacity(ids.len());
    for id in ids {
        if let Some(row) = load_row(session, entity, id).await? {
            out.push(todict(session, entity, &row).await?);
        }
    }
    Ok(out)
}

/// Insert one object or a list; nested relationship values run their `_operation`.
pub async fn insert(session: &mut Session, entity: &EntityType, objs: &Value) -> Result<Vec<Value>, AppError> {
    let registry = session.registry().clone();
    let mut created = Vec::new();
    for obj in as_objects(objs)? {
        let row = new_instance(session, &registry, entity, obj, objs).await?;
        created.push(entity.ids_of(&row));
    }
    session.commit().await?;
    rows_to_dicts(session, entity, &created).await
}

/// Update objects located by `ids` (paired by position) or by their own identity fields.
/// Objects whose row does not exist are skipped.
pub async fn update(
    session: &mut Session,
    entity: &EntityType,
    objs: &Value,
    ids: Option<Vec<Row>>,
) -> Result<Vec<Value>, AppError> {
    let registry = session.registry().clone();
    let objects = as_objects(objs)?;
    let lookups: Vec<Option<Row>> = match ids {
        Some(ids) => ids
            .iter()
            .map(|i| entity.cast_row(i).map(Some))
            .collect::<Result<_, _>>()?,
        None => objects
            .iter()
            .map(|o| entity.cast_ids(o))
            .collect::<Result<_, _>>()?,
    };
    let mut updated = Vec::new();
    for (lookup, obj) in lookups.into_iter().zip(objects) {
        let Some(lookup) = lookup else { continue };
        let Some(current) = select(session, &entity.table, Filter::AnyOf(vec![lookup])).await?.into_iter().next() else {
            continue;
        };
        let row = update_instance(session, &registry, entity, current, obj, objs).await?;
        updated.push(entity.ids_of(&row));
    }
    session.commit().await?;
    rows_to_dicts(session, entity, &updated).await
}

/// Delete every row matching each id map; missing rows are ignored.
pub async fn delete(session: &mut Session, entity: &EntityType, ids: &[Row]) -> Result<(), AppError> {
    let registry = session.registry().clone();
    for id in ids {
        let lookup = entity.cast_row(id)?;
        for row in select(session, &entity.table, Filter::AnyOf(vec![lookup])).await? {
            delete_instance(session, &registry, entity, &row).await?;
        }
    }
    session.commit().await?;
    Ok(())
}

/// Read instances. With ids, reads go through the cache bucket of the filter shape and
/// misses are back-filled; without ids the relational store is queried directly.
pub async fn get(session: &mut Session, entity: &EntityType, query: GetQuery) -> Result<Vec<Value>, AppError> {
    let registry = session.registry().clone();
    let GetQuery {
        ids,
        limit,
        offset,
        filters,
    } = query;

    let Some(ids) = ids else {
        let filter = build_filter(session, &registry, entity, &filters).await?;
        if filter.is_empty() {
            return Ok(Vec::new());
        }
        let rows = session.tx().await?.select(&entity.table, &filter, limit, offset).await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            out.push(todict(session, entity, row).await?);
        }
        return Ok(out);
    };

    let start = offset.unwrap_or(0) as usize;
    let end = limit.map(|l| start.saturating_add(l as usize)).unwrap_or(usize::MAX);
    let ids: Vec<Row> = ids
        .iter()
        .skip(start)
        .take(end.saturating_sub(start))
        .map(|i| entity.cast_row(i))
        .collect::<Result<_, _>>()?;
    let keys: Option<Vec<String>> = ids.iter().map(|i| entity.identity(i).ok()).collect();

    match (session.cache().cloned(), keys) {
        (Some(cache), Some(keys)) if entity.use_cache => {
            let mut names: Vec<String> = filters.keys().cloned().collect();
            names.sort();
            let bucket = entity.bucket(&names);
            let cached = cache.hmget(&bucket, &keys).await?;

            let mut found: HashMap<String, Value> = HashMap::new();
            let mut missing = Vec::new();
            for ((key, id), hit) in keys.iter().zip(&ids).zip(cached) {
                match hit {
                    Some(text) => {
                        let value = serde_json::from_str(&text).map_err(|source| CacheError::Decode {
                            key: bucket.clone(),
                            field: key.clone(),
                            source,
                        })?;
                        found.insert(key.clone(), value);
                    }
                    None => missing.push(id.clone()),
                }
            }

            if !missing.is_empty() {
                if bucket != entity.key {
                    cache.sadd(&entity.filters_names_key(), &bucket).await?;
                }
                let filter = Filter::by_ids(missing).and(build_filter(session, &registry, entity, &filters).await?);
                let mut entries = Vec::new();
                for row in select(session, &entity.table, filter).await? {
                    let key = entity.identity(&row)?;
                    let value = todict(session, entity, &row).await?;
                    entries.push((key.clone(), value.to_string()));
                    found.insert(key, value);
                }
                cache.hmset(&bucket, &entries).await?;
                tracing::debug!(entity = %entity.key, bucket = %bucket, count = entries.len(), "cache back-fill");
            }
            Ok(keys.iter().filter_map(|k| found.remove(k)).collect())
        }
        (_, keys) => {
            let filter = Filter::by_ids(ids).and(build_filter(session, &registry, entity, &filters).await?);
            let rows = select(session, &entity.table, filter).await?;
            let mut by_key: HashMap<String, Value> = HashMap::new();
            let mut ordered = Vec::with_capacity(rows.len());
            for row in &rows {
                let value = todict(session, entity, row).await?;
                match &keys {
                    Some(_) => {
                        by_key.insert(entity.identity(row)?, value);
                    }
                    None => ordered.push(value),
                }
            }
            match keys {
                Some(keys) => Ok(keys.iter().filter_map(|k| by_key.remove(k)).collect()),
                None => Ok(ordered),
            }
        }
    }
}
