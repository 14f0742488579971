//! Structural validator for the JSON-schema subset used by bundled schemas
//!
//! Supported keywords: `type` (single or list), `properties`, `required`,
//! `additionalProperties` (bool or schema), `items`, `enum`, `format: "uuid"`.

use crate::error::SchemaViolation;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// One or more accepted JSON types
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum TypeSet {
    One(String),
    Many(Vec<String>),
}

impl TypeSet {
    fn accepts(&self, actual: &Value) -> bool {
        match self {
            Self::One(t) => type_matches(t, actual),
            Self::Many(ts) => ts.iter().any(|t| type_matches(t, actual)),
        }
    }

    fn describe(&self) -> String {
        match self {
            Self::One(t) => t.clone(),
            Self::Many(ts) => ts.join(" | "),
        }
    }
}

/// `additionalProperties` is either a flag or a schema for extra keys
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Additional {
    Allowed(bool),
    Schema(Box<SchemaNode>),
}

impl Default for Additional {
    fn default() -> Self {
        Self::Allowed(true)
    }
}

/// A node in a schema tree. An empty node accepts any value.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SchemaNode {
    #[serde(rename = "type")]
    pub kind: Option<TypeSet>,
    pub properties: BTreeMap<String, SchemaNode>,
    pub required: Vec<String>,
    pub additional_properties: Additional,
    pub items: Option<Box<SchemaNode>>,
    #[serde(rename = "enum")]
    pub allowed: Option<Vec<Value>>,
    pub format: Option<String>,
}

impl SchemaNode {
    /// Validate `value` at `path`, appending every violation found
    pub fn validate(&self, value: &Value, path: &str, out: &mut Vec<SchemaViolation>) {
        if let Some(kind) = &self.kind {
            if !kind.accepts(value) {
                out.push(SchemaViolation::new(
                    path,
                    format!("expected {}, found {}", kind.describe(), type_name(value)),
                ));
                return;
            }
        }

        if let Some(allowed) = &self.allowed {
            if !allowed.contains(value) {
                out.push(SchemaViolation::new(
                    path,
                    format!("value {} is not one of {}", value, Value::from(allowed.clone())),
                ));
            }
        }

        match value {
            Value::String(s) => self.validate_format(s, path, out),
            Value::Object(map) => self.validate_object(map, path, out),
            Value::Array(items) => {
                if let Some(node) = &self.items {
                    for (i, item) in items.iter().enumerate() {
                        node.validate(item, &format!("{path}[{i}]"), out);
                    }
                }
            }
            _ => {}
        }
    }

    fn validate_format(&self, s: &str, path: &str, out: &mut Vec<SchemaViolation>) {
        if self.format.as_deref() == Some("uuid") && uuid::Uuid::parse_str(s).is_err() {
            out.push(SchemaViolation::new(path, format!("'{s}' is not a valid UUID")));
        }
    }

    fn validate_object(&self, map: &Map<String, Value>, path: &str, out: &mut Vec<SchemaViolation>) {
        for key in &self.required {
            if !map.contains_key(key) {
                out.push(SchemaViolation::new(
                    join_path(path, key),
                    "required field is missing",
                ));
            }
        }

        for (key, child) in map {
            let child_path = join_path(path, key);
            if let Some(node) = self.properties.get(key) {
                node.validate(child, &child_path, out);
                continue;
            }
            match &self.additional_properties {
                Additional::Allowed(true) => {}
                Additional::Allowed(false) => {
                    out.push(SchemaViolation::new(child_path, "unexpected field"));
                }
                Additional::Schema(node) => node.validate(child, &child_path, out),
            }
        }
    }
}

fn join_path(path: &str, key: &str) -> String {
    if path.is_empty() {
        key.to_string()
    } else {
        format!("{path}.{key}")
    }
}

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "object" => value.is_object(),
        "array" => value.is_array(),
        "string" => value.is_string(),
        "boolean" => value.is_boolean(),
        "null" => value.is_null(),
        "integer" => value.is_i64() || value.is_u64(),
        "number" => value.is_number(),
        _ => false,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "number",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
