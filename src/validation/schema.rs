//! Draft 4 schema checks with error reports that carry the failing schema fragment.

use crate::error::{ConfigError, ValidationError};
use serde_json::Value;

pub struct CompiledSchema {
    schema: Value,
    validator: jsonschema::Validator,
}

impl std::fmt::Debug for CompiledSchema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledSchema").field("schema", &self.schema).finish()
    }
}

impl CompiledSchema {
    pub fn compile(schema: Value) -> Result<Self, ConfigError> {
        let validator =
            jsonschema::draft4::new(&schema).map_err(|e| ConfigError::InvalidSchema(format!("{}: {}", schema, e)))?;
        Ok(CompiledSchema { schema, validator })
    }

    pub fn schema(&self) -> &Value {
        &self.schema
    }

    /// Schema of property `name`, when declared.
    pub fn property(&self, name: &str) -> Option<&Value> {
        self.schema.get("properties").and_then(|p| p.get(name))
    }

    /// First violation of `instance`, reported as the offending sub-instance and the
    /// schema object holding the failed keyword.
    pub fn validate(&self, instance: &Value) -> Result<(), ValidationError> {
        let Some(err) = self.validator.iter_errors(instance).next() else {
            return Ok(());
        };
        let instance_path = err.instance_path.to_string();
        let schema_path = err.schema_path.to_string();

        let mut message = err.to_string();
        if !instance_path.is_empty() || !schema_path.is_empty() {
            message = format!(
                "{}. Failed validating instance{} for schema{}",
                message,
                bracketed(&instance_path),
                bracketed(&schema_path)
            );
        }
        let fragment = self
            .schema
            .pointer(parent(&schema_path))
            .cloned()
            .unwrap_or_else(|| self.schema.clone());
        let offending = instance.pointer(&instance_path).cloned().unwrap_or(Value::Null);
        Err(ValidationError::new(message)
            .with_schema(fragment)
            .with_instance(offending))
    }
}

fn segments(pointer: &str) -> impl Iterator<Item = String> + '_ {
    pointer
        .split('/')
        .skip(1)
        .map(|s| s.replace("~1", "/").replace("~0", "~"))
}

/// `/properties/a` -> `['properties']['a']`
fn bracketed(pointer: &str) -> String {
    segments(pointer).map(|s| format!("['{}']", s)).collect()
}

fn parent(pointer: &str) -> &str {
    match pointer.rfind('/') {
        Some(i) => &pointer[..i],
        None => "",
    }
}
