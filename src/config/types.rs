//! Raw declaration types: entity definitions and their Swagger 2.0 path schemas.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

fn default_true() -> bool {
    true
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    /// Rows in the relational store, mirrored into the cache on commit.
    #[default]
    Relational,
    /// Objects that live only in the cache store (plus optional search index).
    Cache,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Integer,
    Number,
    String,
    Boolean,
    Json,
}

impl ColumnType {
    /// Cast a loosely typed value (path segments, query strings) to this column type.
    /// Returns None when the value cannot represent the type. Null passes through.
    pub fn cast(&self, v: &Value) -> Option<Value> {
        if v.is_null() {
            return Some(Value::Null);
        }
        match (self, v) {
            (ColumnType::Json, _) => Some(v.clone()),
            (ColumnType::Integer, Value::Number(n)) => n
                .as_i64()
                .map(Value::from)
                .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| Value::from(f as i64))),
            (ColumnType::Integer, Value::String(s)) => s.trim().parse::<i64>().ok().map(Value::from),
            (ColumnType::Number, Value::Number(_)) => Some(v.clone()),
            (ColumnType::Number, Value::String(s)) => s
                .trim()
                .parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number),
            (ColumnType::String, Value::String(_)) => Some(v.clone()),
            (ColumnType::String, Value::Number(n)) => Some(Value::String(n.to_string())),
            (ColumnType::String, Value::Bool(b)) => Some(Value::String(b.to_string())),
            (ColumnType::Boolean, Value::Bool(_)) => Some(v.clone()),
            (ColumnType::Boolean, Value::String(s)) => match s.as_str() {
                "true" => Some(Value::Bool(true)),
                "false" => Some(Value::Bool(false)),
                _ => None,
            },
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ColumnConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub type_: ColumnType,
    #[serde(default)]
    pub primary_key: bool,
    #[serde(default = "default_true")]
    pub nullable: bool,
    #[serde(default)]
    pub auto_increment: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cardinality {
    One,
    Many,
}

/// Join table of a many-to-many relationship. `local_column` references the source's
/// join column, `remote_column` the target's.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SecondaryConfig {
    pub table: String,
    pub local_column: String,
    pub remote_column: String,
}

/// Directed edge: `source.local_column == target.remote_column`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RelationshipConfig {
    pub name: String,
    /// Target entity, by key or by name.
    pub target: String,
    pub cardinality: Cardinality,
    pub local_column: String,
    pub remote_column: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secondary: Option<SecondaryConfig>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EntityConfig {
    pub name: String,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub table: Option<String>,
    #[serde(default)]
    pub kind: EntityKind,
    #[serde(default)]
    pub columns: Vec<ColumnConfig>,
    #[serde(default)]
    pub relationships: Vec<RelationshipConfig>,
    /// Identity fields for cache-only entities (relational ones use their primary key).
    #[serde(default)]
    pub id_names: Vec<String>,
    #[serde(default = "default_true")]
    pub use_cache: bool,
    #[serde(default)]
    pub use_search: bool,
    #[serde(default)]
    pub key_separator: Option<String>,
    #[serde(default)]
    pub todict_schema: Option<Map<String, Value>>,
    #[serde(default)]
    pub api: Option<ApiSchema>,
}

/// Declared Swagger paths and shared definitions for one entity.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ApiSchema {
    #[serde(default)]
    pub paths: BTreeMap<String, PathItem>,
    #[serde(default)]
    pub definitions: Map<String, Value>,
}

/// One path: shared parameters plus a method map (`get`, `post`, ...).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PathItem {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<Parameter>,
    #[serde(flatten)]
    pub methods: BTreeMap<String, MethodSchema>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MethodSchema {
    #[serde(rename = "operationId")]
    pub operation_id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<Parameter>,
    #[serde(default)]
    pub responses: Map<String, Value>,
    /// summary, description, tags, ... carried into the published document.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamLocation {
    Path,
    Query,
    Header,
    Body,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    #[serde(rename = "in")]
    pub location: ParamLocation,
    #[serde(default)]
    pub required: bool,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub type_: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<Value>,
    /// enum, format, minimum, description, ...
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}
