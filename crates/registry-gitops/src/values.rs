//! Registry values document handling.
//!
//! Every registry repository carries a YAML values document at
//! [`VALUES_LOCATION`]. Branch preparation and codebase import both combine
//! two such documents, where the overriding side wins for scalar and list
//! values and nested mappings are merged recursively.

use serde_yaml::{Mapping, Value};
use thiserror::Error;

/// Repository-relative path of the values document.
pub const VALUES_LOCATION: &str = "deploy-templates/values.yaml";

#[derive(Error, Debug)]
pub enum ValuesError {
    #[error("Failed to parse values document: {0}")]
    Parse(#[source] serde_yaml::Error),

    #[error("Values document must be a mapping, found {0}")]
    NotAMapping(&'static str),

    #[error("Failed to render values document: {0}")]
    Render(#[source] serde_yaml::Error),

    #[error("Invalid values override: {0}")]
    InvalidOverride(String),
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Sequence(_) => "a sequence",
        Value::Mapping(_) => "a mapping",
        Value::Tagged(_) => "a tagged value",
    }
}

/// Parses a values document. Blank or `null` documents yield an empty mapping.
pub fn parse_values(content: &str) -> Result<Mapping, ValuesError> {
    if content.trim().is_empty() {
        return Ok(Mapping::new());
    }
    let value: Value = serde_yaml::from_str(content).map_err(ValuesError::Parse)?;
    match value {
        Value::Null => Ok(Mapping::new()),
        Value::Mapping(mapping) => Ok(mapping),
        other => Err(ValuesError::NotAMapping(kind_of(&other))),
    }
}

pub fn render_values(values: &Mapping) -> Result<String, ValuesError> {
    serde_yaml::to_string(values).map_err(ValuesError::Render)
}

/// Combines `overrides` onto `base` without touching either input.
///
/// Keys missing from `overrides` keep their `base` value. When both sides
/// hold a mapping for the same key the two are merged recursively; in every
/// other case the override replaces the base value outright.
pub fn merge_values(overrides: &Mapping, base: &Mapping) -> Mapping {
    let mut merged = base.clone();
    for (key, value) in overrides {
        let combined = match (merged.get(key), value) {
            (Some(Value::Mapping(current)), Value::Mapping(incoming)) => {
                Value::Mapping(merge_values(incoming, current))
            }
            _ => value.clone(),
        };
        merged.insert(key.clone(), combined);
    }
    merged
}

/// Merges two serialized documents, `overrides` winning over `base`.
pub fn merge_documents(overrides: &str, base: &str) -> Result<String, ValuesError> {
    let overrides = parse_values(overrides)?;
    let base = parse_values(base)?;
    render_values(&merge_values(&overrides, &base))
}

/// Converts a JSON object (the codebase values override annotation) into a
/// values mapping. Blank input yields an empty mapping.
pub fn parse_override_patch(json: &str) -> Result<Mapping, ValuesError> {
    if json.trim().is_empty() {
        return Ok(Mapping::new());
    }
    let parsed: serde_json::Value =
        serde_json::from_str(json).map_err(|e| ValuesError::InvalidOverride(e.to_string()))?;
    if !parsed.is_object() {
        return Err(ValuesError::InvalidOverride(
            "expected a JSON object".to_string(),
        ));
    }
    match serde_yaml::to_value(parsed).map_err(|e| ValuesError::InvalidOverride(e.to_string()))? {
        Value::Mapping(mapping) => Ok(mapping),
        other => Err(ValuesError::NotAMapping(kind_of(&other))),
    }
}
