//! Identity keys: primary-key values sorted by field name, joined by the entity separator.

use super::registry::{EntityId, EntityType};
use crate::error::ModelError;
use crate::store::Row;
use serde_json::Value;

/// One tracked instance: entity type plus identity key.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityRef {
    pub entity: EntityId,
    pub key: String,
}

/// Text form of one key value inside an identity key.
pub fn key_part(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl EntityType {
    /// Identity key of `obj`. Every identity field must be present and non-null.
    pub fn identity(&self, obj: &Row) -> Result<String, ModelError> {
        let mut parts = Vec::with_capacity(self.id_names.len());
        for name in &self.id_names {
            match obj.get(name) {
                Some(v) if !v.is_null() => parts.push(key_part(v)),
                _ => {
                    return Err(ModelError::new(format!(
                        "missing identity field '{}' for {}",
                        name, self.name
                    ))
                    .with_instance(Value::Object(obj.clone())))
                }
            }
        }
        Ok(parts.join(&self.key_separator))
    }

    pub fn entity_ref(&self, obj: &Row) -> Result<EntityRef, ModelError> {
        Ok(EntityRef {
            entity: self.id,
            key: self.identity(obj)?,
        })
    }

    /// Identity fields of `row`, as stored.
    pub fn ids_of(&self, row: &Row) -> Row {
        self.id_names
            .iter()
            .map(|n| (n.clone(), row.get(n).cloned().unwrap_or(Value::Null)))
            .collect()
    }

    fn cast_value(&self, name: &str, v: &Value) -> Result<Value, ModelError> {
        match self.column(name) {
            Some(col) => col.ty.cast(v).ok_or_else(|| {
                ModelError::new(format!("invalid value {} for '{}' of {}", v, name, self.name))
                    .with_instance(v.clone())
            }),
            None => Ok(v.clone()),
        }
    }

    /// Identity fields of `obj`, cast to their column types. None when any is missing.
    pub fn cast_ids(&self, obj: &Row) -> Result<Option<Row>, ModelError> {
        let mut ids = Row::new();
        for name in &self.id_names {
            match obj.get(name) {
                Some(v) if !v.is_null() => {
                    ids.insert(name.clone(), self.cast_value(name, v)?);
                }
                _ => return Ok(None),
            }
        }
        Ok(Some(ids))
    }

    /// Every column of `obj` cast to its type; keys that are not columns are kept as given.
    pub fn cast_row(&self, obj: &Row) -> Result<Row, ModelError> {
        obj.iter()
            .map(|(k, v)| Ok((k.clone(), self.cast_value(k, v)?)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use crate::config::EntityConfig;
    use crate::model::RegistryBuilder;
    use crate::store::Row;
    use serde_json::{json, Value};

    fn row(v: Value) -> Row {
        v.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn composite_keys_sort_by_field_name() {
        let config: EntityConfig = serde_json::from_value(json!({
            "name": "Price",
            "columns": [
                {"name": "store", "type": "string", "primary_key": true},
                {"name": "item", "type": "integer", "primary_key": true},
                {"name": "value", "type": "number"}
            ]
        }))
        .unwrap();
        let registry = RegistryBuilder::new().register_all(vec![config]).unwrap().build().unwrap();
        let price = registry.by_key("price").unwrap();
        assert_eq!(price.id_names, vec!["item", "store"]);
        assert_eq!(price.identity(&row(json!({"store": "a", "item": 2}))).unwrap(), "2|a");
        assert!(price.identity(&row(json!({"store": "a"}))).is_err());

        let ids = price.cast_ids(&row(json!({"store": "a", "item": "2"}))).unwrap();
        assert_eq!(ids, Some(row(json!({"item": 2, "store": "a"}))));
        assert_eq!(price.cast_ids(&row(json!({"store": "a"}))).unwrap(), None);
        assert!(price.cast_ids(&row(json!({"store": "a", "item": "x"}))).is_err());
    }
}
