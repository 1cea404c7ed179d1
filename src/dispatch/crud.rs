//! Standard per-entity operations addressable by `operationId`.

use super::Operation;
use crate::error::{AppError, ValidationError};
use crate::model::{self, EntityType, GetQuery};
use crate::response::{ApiResponse, ValidatedRequest};
use crate::session::Session;
use crate::store::Row;
use async_trait::async_trait;
use axum::http::StatusCode;
use serde_json::{Map, Value};
use std::str::FromStr;

const DEFAULT_SEARCH_SIZE: u64 = 100;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StandardOperation {
    Insert,
    Update,
    UpdateMany,
    Delete,
    DeleteMany,
    Get,
    GetMany,
    GetAll,
    Search,
}

impl StandardOperation {
    pub const ALL: [StandardOperation; 9] = [
        StandardOperation::Insert,
        StandardOperation::Update,
        StandardOperation::UpdateMany,
        StandardOperation::Delete,
        StandardOperation::DeleteMany,
        StandardOperation::Get,
        StandardOperation::GetMany,
        StandardOperation::GetAll,
        StandardOperation::Search,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StandardOperation::Insert => "swagger_insert",
            StandardOperation::Update => "swagger_update",
            StandardOperation::UpdateMany => "swagger_update_many",
            StandardOperation::Delete => "swagger_delete",
            StandardOperation::DeleteMany => "swagger_delete_many",
            StandardOperation::Get => "swagger_get",
            StandardOperation::GetMany => "swagger_get_many",
            StandardOperation::GetAll => "swagger_get_all",
            StandardOperation::Search => "swagger_search",
        }
    }
}

impl FromStr for StandardOperation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StandardOperation::ALL
            .into_iter()
            .find(|op| op.as_str() == s)
            .ok_or_else(|| format!("unknown standard operation: {}", s))
    }
}

/// 404 on an empty result, otherwise `status` with the list (or its first element).
fn respond(objs: Vec<Value>, status: StatusCode, first: bool) -> ApiResponse {
    match (objs.is_empty(), first) {
        (true, _) => ApiResponse::empty(StatusCode::NOT_FOUND),
        (false, true) => ApiResponse::json(status, objs.into_iter().next().unwrap_or(Value::Null)),
        (false, false) => ApiResponse::json(status, Value::Array(objs)),
    }
}

fn body(req: &ValidatedRequest) -> Value {
    req.body.clone().unwrap_or_else(|| Value::Array(Vec::new()))
}

/// Id objects from a list; scalars are accepted for single-field identities.
fn ids_from(entity: &EntityType, value: &Value) -> Result<Vec<Row>, ValidationError> {
    let items = match value {
        Value::Array(items) => items.clone(),
        other => vec![other.clone()],
    };
    items
        .into_iter()
        .map(|item| match item {
            Value::Object(m) => Ok(m),
            scalar if entity.id_names.len() == 1 && !scalar.is_null() => {
                let mut m = Map::new();
                m.insert(entity.id_names[0].clone(), scalar);
                Ok(m)
            }
            other => Err(ValidationError::new(format!("invalid id {} for {}", other, entity.name))
                .with_instance(value.clone())),
        })
        .collect()
}

fn as_u64(query: &Map<String, Value>, name: &str) -> Result<Option<u64>, ValidationError> {
    match query.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) if n.as_u64().is_some() => Ok(n.as_u64()),
        Some(Value::String(s)) => s
            .parse::<u64>()
            .map(Some)
            .map_err(|_| ValidationError::new(format!("invalid value '{}' for '{}'", s, name))),
        Some(other) => Err(ValidationError::new(format!("invalid value {} for '{}'", other, name))
            .with_instance(other.clone())),
    }
}

/// Split the query into paging options, ids and attribute filters.
fn get_query(entity: &EntityType, query: &Map<String, Value>) -> Result<GetQuery, ValidationError> {
    let mut filters = query.clone();
    let ids = filters.remove("ids").map(|v| ids_from(entity, &v)).transpose()?;
    filters.remove("limit");
    filters.remove("offset");
    Ok(GetQuery {
        ids,
        limit: as_u64(query, "limit")?,
        offset: as_u64(query, "offset")?,
        filters,
    })
}

#[async_trait]
impl Operation for StandardOperation {
    async fn call(
        &self,
        entity: &EntityType,
        req: ValidatedRequest,
        session: &mut Session,
    ) -> Result<ApiResponse, AppError> {
        tracing::debug!(entity = %entity.key, operation = self.as_str(), "standard operation");
        match self {
            StandardOperation::Insert => {
                let objs = model::insert(session, entity, &body(&req)).await?;
                Ok(ApiResponse::json(StatusCode::CREATED, Value::Array(objs)))
            }
            StandardOperation::Update => {
                let objs = Value::Array(vec![req.body.clone().unwrap_or_else(|| Value::Object(Map::new()))]);
                let ids = vec![req.path_params.clone()];
                let objs = model::update(session, entity, &objs, Some(ids)).await?;
                Ok(respond(objs, StatusCode::OK, true))
            }
            StandardOperation::UpdateMany => {
                let objs = model::update(session, entity, &body(&req), None).await?;
                Ok(respond(objs, StatusCode::OK, false))
            }
            StandardOperation::Delete => {
                model::delete(session, entity, &[req.path_params.clone()]).await?;
                Ok(ApiResponse::empty(StatusCode::NO_CONTENT))
            }
            StandardOperation::DeleteMany => {
                let ids = ids_from(entity, &body(&req))?;
                model::delete(session, entity, &ids).await?;
                Ok(ApiResponse::empty(StatusCode::NO_CONTENT))
            }
            StandardOperation::Get => {
                let mut query = get_query(entity, &req.query)?;
                query.ids = Some(vec![req.path_params.clone()]);
                let objs = model::get(session, entity, query).await?;
                Ok(respond(objs, StatusCode::OK, true))
            }
            StandardOperation::GetMany | StandardOperation::GetAll => {
                let query = get_query(entity, &req.query)?;
                let objs = model::get(session, entity, query).await?;
                Ok(respond(objs, StatusCode::OK, false))
            }
            StandardOperation::Search => {
                let pattern = match req.query.get("pattern") {
                    Some(Value::String(s)) => s.clone(),
                    Some(other) => other.to_string(),
                    None => String::new(),
                };
                let page = as_u64(&req.query, "page")?.unwrap_or(0);
                let size = as_u64(&req.query, "size")?.unwrap_or(DEFAULT_SEARCH_SIZE);
                let objs = model::search(session, entity, &pattern, page, size).await?;
                Ok(respond(objs, StatusCode::OK, false))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EntityConfig;
    use crate::model::RegistryBuilder;
    use serde_json::json;

    #[test]
    fn operation_ids_round_trip() {
        for op in StandardOperation::ALL {
            assert_eq!(op.as_str().parse::<StandardOperation>(), Ok(op));
        }
        assert!("swagger_nothing".parse::<StandardOperation>().is_err());
    }

    #[test]
    fn query_splits_into_ids_paging_and_filters() {
        let config: EntityConfig = serde_json::from_value(json!({
            "name": "Car",
            "columns": [{"name": "id", "type": "integer", "primary_key": true}, {"name": "model", "type": "string"}]
        }))
        .unwrap();
        let registry = RegistryBuilder::new().register_all(vec![config]).unwrap().build().unwrap();
        let car = registry.by_key("car").unwrap();
        let query = json!({"ids": [1, {"id": 2}], "limit": 5, "offset": "1", "model": "beetle"});
        let q = get_query(car, query.as_object().unwrap()).unwrap();
        assert_eq!(
            q.ids,
            Some(vec![
                json!({"id": 1}).as_object().cloned().unwrap(),
                json!({"id": 2}).as_object().cloned().unwrap()
            ])
        );
        assert_eq!((q.limit, q.offset), (Some(5), Some(1)));
        assert_eq!(q.filters, json!({"model": "beetle"}).as_object().cloned().unwrap());
    }

    #[test]
    fn empty_results_are_not_found() {
        assert_eq!(respond(vec![], StatusCode::OK, true).status, StatusCode::NOT_FOUND);
        assert_eq!(respond(vec![json!(1), json!(2)], StatusCode::OK, true).body, Some(json!(1)));
    }
}
