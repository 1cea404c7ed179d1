//! Identifier case conversion for entity keys.

use once_cell::sync::Lazy;
use regex::Regex;

static WORD_START: Lazy<Regex> = Lazy::new(|| Regex::new("(.)([A-Z][a-z]+)").unwrap());
static LOWER_UPPER: Lazy<Regex> = Lazy::new(|| Regex::new("([a-z0-9])([A-Z])").unwrap());

/// Convert a CamelCase identifier to snake_case.
/// e.g. "StoreItem" -> "store_item", "HTTPRequest" -> "http_request"
pub fn to_snake_case(s: &str) -> String {
    let partial = WORD_START.replace_all(s, "${1}_${2}");
    LOWER_UPPER.replace_all(&partial, "${1}_${2}").to_lowercase()
}

/// Default cache/entity key for a type name: drop every "Model" occurrence, then snake_case.
pub fn entity_key(type_name: &str) -> String {
    to_snake_case(&type_name.replace("Model", ""))
}
