//! Process settings from the environment.

use crate::error::ConfigError;

pub const DEFAULT_KEY_SEPARATOR: &str = "|";
const DEFAULT_MAX_BODY_BYTES: usize = 2 * 1024 * 1024;

#[derive(Clone, Debug, PartialEq)]
pub struct Settings {
    pub database_url: Option<String>,
    pub models_path: String,
    pub bind_addr: String,
    pub api_title: Option<String>,
    pub api_version: String,
    pub api_base_path: String,
    pub key_separator: String,
    pub max_body_bytes: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            database_url: None,
            models_path: "models".into(),
            bind_addr: "0.0.0.0:3000".into(),
            api_title: None,
            api_version: "1.0.0".into(),
            api_base_path: String::new(),
            key_separator: DEFAULT_KEY_SEPARATOR.into(),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }
}

impl Settings {
    /// Read settings from the process environment. Call `dotenvy::dotenv()` first to
    /// pick up a `.env` file.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Settings::default();
        let max_body_bytes = match get("MAX_BODY_BYTES") {
            Some(v) => v
                .parse()
                .map_err(|_| ConfigError::Load(format!("MAX_BODY_BYTES is not a number: {v}")))?,
            None => defaults.max_body_bytes,
        };
        Ok(Settings {
            database_url: get("DATABASE_URL"),
            models_path: get("MODELS_PATH").unwrap_or(defaults.models_path),
            bind_addr: get("BIND_ADDR").unwrap_or(defaults.bind_addr),
            api_title: get("API_TITLE"),
            api_version: get("API_VERSION").unwrap_or(defaults.api_version),
            api_base_path: get("API_BASE_PATH").unwrap_or(defaults.api_base_path),
            key_separator: get("CACHE_KEY_SEPARATOR").unwrap_or(defaults.key_separator),
            max_body_bytes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_and_overrides() {
        let env: HashMap<&str, &str> = [("API_BASE_PATH", "/v1"), ("MAX_BODY_BYTES", "1024")].into();
        let s = Settings::from_lookup(|k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(s.api_base_path, "/v1");
        assert_eq!(s.max_body_bytes, 1024);
        assert_eq!(s.key_separator, "|");
        assert_eq!(s.models_path, "models");
        assert!(s.database_url.is_none());
    }

    #[test]
    fn bad_body_limit_is_rejected() {
        let r = Settings::from_lookup(|k| (k == "MAX_BODY_BYTES").then(|| "lots".to_string()));
        assert!(matches!(r, Err(ConfigError::Load(_))));
    }
}
