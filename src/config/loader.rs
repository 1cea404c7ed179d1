//! Load entity declarations from JSON files.

use crate::config::types::EntityConfig;
use crate::error::ConfigError;
use serde_json::Value;
use std::path::Path;

/// Parse one document: a single entity object or an array of them.
pub fn parse_entities(text: &str) -> Result<Vec<EntityConfig>, ConfigError> {
    let value: Value = serde_json::from_str(text).map_err(|e| ConfigError::Load(e.to_string()))?;
    let result = match value {
        Value::Array(_) => serde_json::from_value(value),
        other => serde_json::from_value(other).map(|e| vec![e]),
    };
    result.map_err(|e| ConfigError::Load(e.to_string()))
}

/// Read every `*.json` file of `dir`, in file-name order.
pub async fn load_entities_from_dir(dir: impl AsRef<Path>) -> Result<Vec<EntityConfig>, ConfigError> {
    let dir = dir.as_ref();
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| ConfigError::Load(format!("{}: {}", dir.display(), e)))?;
    let mut files = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| ConfigError::Load(e.to_string()))?
    {
        let path = entry.path();
        if path.extension().and_then(|s| s.to_str()) == Some("json") {
            files.push(path);
        }
    }
    files.sort();

    let mut out = Vec::new();
    for path in files {
        let text = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| ConfigError::Load(format!("{}: {}", path.display(), e)))?;
        let entities = parse_entities(&text)
            .map_err(|e| ConfigError::Load(format!("{}: {}", path.display(), e)))?;
        tracing::debug!(file = %path.display(), count = entities.len(), "loaded entity declarations");
        out.extend(entities);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_object_or_array() {
        let one = parse_entities(r#"{"name": "Store"}"#).unwrap();
        assert_eq!(one.len(), 1);
        let many = parse_entities(r#"[{"name": "Store"}, {"name": "Item"}]"#).unwrap();
        assert_eq!(many[1].name, "Item");
        assert!(parse_entities("[1]").is_err());
    }

    #[tokio::test]
    async fn directory_is_read_in_name_order() {
        let dir = std::env::temp_dir().join(format!("schemacache-loader-{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        tokio::fs::write(dir.join("b.json"), r#"{"name": "Second"}"#).await.unwrap();
        tokio::fs::write(dir.join("a.json"), r#"[{"name": "First"}]"#).await.unwrap();
        tokio::fs::write(dir.join("notes.txt"), "ignored").await.unwrap();
        let entities = load_entities_from_dir(&dir).await.unwrap();
        let names: Vec<_> = entities.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["First", "Second"]);
        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }
}
