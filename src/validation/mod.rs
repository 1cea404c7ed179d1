//! Per-method request validation: raw path, query and header strings are coerced to the
//! declared types, each group is checked against its schema, and the JSON body is parsed
//! and checked against the body parameter schema.

pub mod coerce;
pub mod schema;

pub use coerce::build_value;
pub use schema::CompiledSchema;

use crate::config::{ParamLocation, Parameter};
use crate::error::{ConfigError, ValidationError};
use crate::response::{ApiRequest, ValidatedRequest};
use serde_json::{json, Map, Value};
use std::collections::HashMap;

/// Validators for one declared path + method.
#[derive(Debug, Default)]
pub struct MethodValidator {
    path: Option<CompiledSchema>,
    query: Option<CompiledSchema>,
    headers: Option<CompiledSchema>,
    body: Option<CompiledSchema>,
    body_required: bool,
    /// `Some(required)` when an `Authorization` header is declared.
    pub authorization: Option<bool>,
}

/// Method parameters override path parameters with the same name and location.
pub fn merge_parameters(path_level: &[Parameter], method_level: &[Parameter]) -> Vec<Parameter> {
    let mut merged: Vec<Parameter> = path_level
        .iter()
        .filter(|p| {
            !method_level
                .iter()
                .any(|m| m.location == p.location && m.name == p.name)
        })
        .cloned()
        .collect();
    merged.extend(method_level.iter().cloned());
    merged
}

fn property_schema(param: &Parameter) -> Value {
    let mut prop = param.extra.clone();
    prop.remove("description");
    prop.insert(
        "type".into(),
        Value::String(param.type_.clone().unwrap_or_else(|| "string".into())),
    );
    if let Some(items) = &param.items {
        prop.insert("items".into(), items.clone());
    }
    if let (Some("object"), Some(Value::Object(schema))) = (param.type_.as_deref(), &param.schema) {
        prop.extend(schema.clone());
    }
    Value::Object(prop)
}

fn group_schema(
    params: &[&Parameter],
    definitions: &Map<String, Value>,
    lowercase: bool,
) -> Result<Option<CompiledSchema>, ConfigError> {
    if params.is_empty() {
        return Ok(None);
    }
    let name = |p: &Parameter| if lowercase { p.name.to_lowercase() } else { p.name.clone() };
    let properties: Map<String, Value> = params.iter().map(|p| (name(*p), property_schema(p))).collect();
    let required: Vec<String> = params.iter().filter(|p| p.required).map(|p| name(*p)).collect();
    let mut schema = json!({"type": "object", "properties": properties});
    if !required.is_empty() {
        schema["required"] = json!(required);
    }
    if !definitions.is_empty() {
        schema["definitions"] = Value::Object(definitions.clone());
    }
    CompiledSchema::compile(schema).map(Some)
}

impl MethodValidator {
    pub fn build(params: &[Parameter], definitions: &Map<String, Value>) -> Result<Self, ConfigError> {
        let of = |loc: ParamLocation| params.iter().filter(|p| p.location == loc).collect::<Vec<_>>();
        let (auth, headers): (Vec<&Parameter>, Vec<&Parameter>) = of(ParamLocation::Header)
            .into_iter()
            .partition(|p| p.name.eq_ignore_ascii_case("authorization"));
        let authorization = auth.first().map(|p| p.required);

        let body_param = params.iter().find(|p| p.location == ParamLocation::Body);
        let body = match body_param {
            Some(p) => {
                let mut schema = p.schema.clone().unwrap_or_else(|| json!({}));
                if let (Value::Object(obj), false) = (&mut schema, definitions.is_empty()) {
                    obj.entry("definitions")
                        .or_insert_with(|| Value::Object(definitions.clone()));
                }
                Some(CompiledSchema::compile(schema)?)
            }
            None => None,
        };

        Ok(MethodValidator {
            path: group_schema(&of(ParamLocation::Path), definitions, false)?,
            query: group_schema(&of(ParamLocation::Query), definitions, false)?,
            headers: group_schema(&headers, definitions, true)?,
            body,
            body_required: body_param.map(|p| p.required).unwrap_or(false),
            authorization,
        })
    }

    pub fn auth_required(&self) -> bool {
        self.authorization == Some(true)
    }

    pub fn validate(&self, req: &ApiRequest) -> Result<ValidatedRequest, ValidationError> {
        Ok(ValidatedRequest {
            path: req.path.clone(),
            method: req.method.clone(),
            path_params: typed_group(&req.path_params, self.path.as_ref())?,
            query: typed_group(&req.query, self.query.as_ref())?,
            headers: typed_group(&req.headers, self.headers.as_ref())?,
            body: self.validate_body(req)?,
            body_schema: self.body.as_ref().map(|s| s.schema().clone()),
        })
    }

    fn validate_body(&self, req: &ApiRequest) -> Result<Option<Value>, ValidationError> {
        let text = req.body.as_deref().map(|b| String::from_utf8_lossy(b).into_owned());
        let content_type = req.headers.get("content-type");

        if let (None, Some(text)) = (content_type, &text) {
            return Err(ValidationError::new("Request content_type is missing").with_instance(parse_or_raw(text)));
        }
        if self.body_required && text.is_none() {
            return Err(ValidationError::new("Request body is missing"));
        }
        if !content_type.is_some_and(|ct| ct.contains("application/json")) {
            return Ok(None);
        }
        let Some(text) = text else {
            return Err(ValidationError::new(
                "Request body must be setted when 'content-type' header is setted",
            ));
        };
        let parsed = serde_json::from_str::<Value>(&text);
        let Some(schema) = &self.body else {
            return Err(ValidationError::new("Request body is not acceptable").with_instance(parse_or_raw(&text)));
        };
        let body = parsed.map_err(|e| ValidationError::new(e.to_string()).with_instance(Value::String(text.clone())))?;
        schema.validate(&body)?;
        Ok(Some(body))
    }
}

fn parse_or_raw(text: &str) -> Value {
    serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
}

/// Coerce declared names per their property schema, keep undeclared ones as strings,
/// then validate the group.
fn typed_group(raw: &HashMap<String, String>, schema: Option<&CompiledSchema>) -> Result<Map<String, Value>, ValidationError> {
    let mut out = Map::new();
    for (name, value) in raw {
        let typed = match schema.and_then(|s| s.property(name)) {
            Some(prop) => build_value(value, prop)?,
            None => Value::String(value.clone()),
        };
        out.insert(name.clone(), typed);
    }
    if let Some(schema) = schema {
        schema.validate(&Value::Object(out.clone()))?;
    }
    Ok(out)
}
