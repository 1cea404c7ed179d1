//! Coercion of raw parameter strings into typed values.
//!
//! Arrays are comma-joined (`1,2,3`), objects are `key:value|key:value`. An array inside
//! an array, or an object inside an object, cannot be expressed and is rejected.

use crate::error::ValidationError;
use serde_json::{Map, Number, Value};

#[derive(Default)]
struct Nesting {
    array: bool,
    object: bool,
}

/// Coerce `raw` according to `schema["type"]` (string when absent).
pub fn build_value(raw: &str, schema: &Value) -> Result<Value, ValidationError> {
    let input = Value::String(raw.to_string());
    build(raw, schema, &mut Nesting::default(), &input)
}

fn build(raw: &str, schema: &Value, nesting: &mut Nesting, input: &Value) -> Result<Value, ValidationError> {
    match schema.get("type").and_then(Value::as_str).unwrap_or("string") {
        "array" => build_array(raw, schema, nesting, input),
        "object" => build_object(raw, schema, nesting, input),
        ty => build_scalar(raw, ty, schema),
    }
}

fn build_scalar(raw: &str, ty: &str, schema: &Value) -> Result<Value, ValidationError> {
    let invalid = || {
        ValidationError::new(format!("invalid value '{}' for type '{}'", raw, ty))
            .with_instance(Value::String(raw.to_string()))
            .with_schema(schema.clone())
    };
    match ty {
        "string" => Ok(Value::String(raw.to_string())),
        "integer" => raw.trim().parse::<i64>().map(Value::from).map_err(|_| invalid()),
        "number" => match raw.trim().parse::<i64>() {
            Ok(i) => Ok(Value::from(i)),
            Err(_) => raw
                .trim()
                .parse::<f64>()
                .ok()
                .and_then(Number::from_f64)
                .map(Value::Number)
                .ok_or_else(invalid),
        },
        "boolean" => match serde_json::from_str::<Value>(raw.trim()) {
            Ok(Value::Bool(b)) => Ok(Value::Bool(b)),
            _ => Err(invalid()),
        },
        "null" if raw == "null" => Ok(Value::Null),
        _ => Err(invalid()),
    }
}

fn build_array(raw: &str, schema: &Value, nesting: &mut Nesting, input: &Value) -> Result<Value, ValidationError> {
    if nesting.array {
        return Err(ValidationError::new("nested array was not allowed").with_instance(input.clone()));
    }
    let parts: Vec<&str> = if raw.is_empty() { Vec::new() } else { raw.split(',').collect() };
    nesting.array = true;
    let result = match schema.get("items") {
        Some(Value::Array(tuple)) => {
            if tuple.len() != parts.len() {
                Err(ValidationError::new(format!("size mismatch for items array '{}'", raw))
                    .with_instance(input.clone())
                    .with_schema(Value::Array(tuple.clone())))
            } else {
                parts
                    .iter()
                    .zip(tuple)
                    .map(|(p, s)| build(p, s, nesting, input))
                    .collect::<Result<Vec<_>, _>>()
                    .map(Value::Array)
            }
        }
        Some(items @ Value::Object(_)) => parts
            .iter()
            .map(|p| build(p, items, nesting, input))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        _ => Ok(Value::Array(parts.iter().map(|p| Value::String(p.to_string())).collect())),
    };
    nesting.array = false;
    result
}

fn build_object(raw: &str, schema: &Value, nesting: &mut Nesting, input: &Value) -> Result<Value, ValidationError> {
    if nesting.object {
        return Err(ValidationError::new("nested object was not allowed").with_instance(input.clone()));
    }
    nesting.object = true;
    let mut out = Map::new();
    let mut result = Ok(());
    for prop in raw.split('|').filter(|p| !p.is_empty()) {
        let Some((key, value)) = prop.split_once(':') else {
            result = Err(ValidationError::new(format!("invalid value '{}' for type 'object'", prop))
                .with_instance(input.clone())
                .with_schema(schema.clone()));
            break;
        };
        let Some(prop_schema) = schema.get("properties").and_then(|p| p.get(key)) else {
            result = Err(ValidationError::new(format!("Invalid property '{}'", key))
                .with_instance(input.clone())
                .with_schema(schema.clone()));
            break;
        };
        match build(value, prop_schema, nesting, input) {
            Ok(v) => {
                out.insert(key.to_string(), v);
            }
            Err(e) => {
                result = Err(e);
                break;
            }
        }
    }
    nesting.object = false;
    result.map(|_| Value::Object(out))
}
