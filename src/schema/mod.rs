//! Event schema registry: resolve and validate event documents by (type, version)
//!
//! Schemas ship with the crate (see `schemas/`) and are parsed once into a
//! process-wide [`MemorySchemaRegistry`] returned by [`global`]. The registry
//! is immutable after construction, so lookups take no locks.

mod bundled;
pub mod validator;

use crate::error::{EiffelError, Result, SchemaViolation};
use serde::Deserialize;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, OnceLock};

pub use validator::SchemaNode;

/// Constraints on one link type
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LinkRule {
    /// At least one link of this type must be present
    pub required: bool,

    /// More than one link of this type is allowed
    pub multiple: bool,
}

impl Default for LinkRule {
    fn default() -> Self {
        Self {
            required: false,
            multiple: true,
        }
    }
}

/// Schema definition for an event type at a specific version
#[derive(Debug, Clone)]
pub struct EventSchema {
    /// Event type identifier (e.g., "EiffelActivityTriggeredEvent")
    pub event_type: String,

    /// Schema version (semantic version string)
    pub version: String,

    /// Optional description of this schema version
    pub description: String,

    /// Schema for the `data` block
    pub data: SchemaNode,

    /// Allowed link types
    pub links: BTreeMap<String, LinkRule>,
}

#[derive(Deserialize)]
struct SchemaDocument {
    #[serde(default)]
    description: String,
    #[serde(default)]
    data: SchemaNode,
    #[serde(default)]
    links: BTreeMap<String, LinkRule>,
}

impl EventSchema {
    /// Parse a schema document (`{"description", "data", "links"}`)
    pub fn parse(event_type: &str, version: &str, document: &str) -> Result<Self> {
        let doc: SchemaDocument = serde_json::from_str(document)?;
        Ok(Self {
            event_type: event_type.to_string(),
            version: version.to_string(),
            description: doc.description,
            data: doc.data,
            links: doc.links,
        })
    }
}

/// Trait for event schema registries
pub trait SchemaRegistry: Send + Sync {
    /// Get the schema for an event type at a specific version
    fn resolve(&self, event_type: &str, version: &str) -> Result<Arc<EventSchema>>;

    /// Validate a full event document (`meta`, `data`, `links`)
    ///
    /// Returns the list of violations (empty when valid). Fails only when
    /// no schema exists for (type, version).
    fn validate(
        &self,
        event_type: &str,
        version: &str,
        document: &Value,
    ) -> Result<Vec<SchemaViolation>>;

    /// Get the newest version registered for an event type
    fn latest_version(&self, event_type: &str) -> Option<String>;

    /// List all registered event types
    fn list_types(&self) -> Vec<String>;
}

/// In-memory schema registry
///
/// Built once, then shared read-only.
pub struct MemorySchemaRegistry {
    /// (event_type, version) → schema
    schemas: HashMap<(String, String), Arc<EventSchema>>,

    /// Schema for the `meta` block shared by all event types
    meta: SchemaNode,
}

impl MemorySchemaRegistry {
    /// Create a registry with no event schemas
    pub fn new() -> Self {
        let meta = serde_json::from_str(bundled::META_SCHEMA).unwrap_or_else(|e| {
            tracing::error!(error = %e, "Bundled meta schema is unreadable, meta is unchecked");
            SchemaNode::default()
        });
        Self {
            schemas: HashMap::new(),
            meta,
        }
    }

    /// Create a registry holding every schema bundled with the crate
    pub fn bundled() -> Self {
        let mut registry = Self::new();
        for (event_type, version, document) in bundled::BUNDLED_SCHEMAS {
            if let Err(e) = registry.load(event_type, version, document) {
                tracing::error!(
                    event_type = %event_type,
                    version = %version,
                    error = %e,
                    "Skipping unreadable bundled schema"
                );
            }
        }
        tracing::debug!(count = registry.schemas.len(), "Loaded bundled schemas");
        registry
    }

    /// Register a parsed schema, replacing any previous (type, version) entry
    pub fn register(&mut self, schema: EventSchema) -> Result<()> {
        if schema.event_type.is_empty() {
            return Err(EiffelError::Config("Event type cannot be empty".to_string()));
        }
        if schema.version.is_empty() {
            return Err(EiffelError::Config("Schema version cannot be empty".to_string()));
        }
        let key = (schema.event_type.clone(), schema.version.clone());
        self.schemas.insert(key, Arc::new(schema));
        Ok(())
    }

    /// Parse and register a schema document
    pub fn load(&mut self, event_type: &str, version: &str, document: &str) -> Result<()> {
        self.register(EventSchema::parse(event_type, version, document)?)
    }

    /// Number of registered (type, version) pairs
    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }

    fn check_document(&self, schema: &EventSchema, document: &Value) -> Vec<SchemaViolation> {
        let mut out = Vec::new();
        let Some(root) = document.as_object() else {
            out.push(SchemaViolation::new("", "event document must be an object"));
            return out;
        };

        match root.get("meta") {
            Some(meta) => {
                self.meta.validate(meta, "meta", &mut out);
                check_meta_identity(schema, meta, &mut out);
            }
            None => out.push(SchemaViolation::new("meta", "required field is missing")),
        }

        match root.get("data") {
            Some(data) => schema.data.validate(data, "data", &mut out),
            None => out.push(SchemaViolation::new("data", "required field is missing")),
        }

        match root.get("links") {
            Some(links) => check_links(schema, links, &mut out),
            None => out.push(SchemaViolation::new("links", "required field is missing")),
        }

        for key in root.keys() {
            if !matches!(key.as_str(), "meta" | "data" | "links") {
                out.push(SchemaViolation::new(key.as_str(), "unexpected field"));
            }
        }

        out
    }
}

impl Default for MemorySchemaRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SchemaRegistry for MemorySchemaRegistry {
    fn resolve(&self, event_type: &str, version: &str) -> Result<Arc<EventSchema>> {
        self.schemas
            .get(&(event_type.to_string(), version.to_string()))
            .cloned()
            .ok_or_else(|| EiffelError::SchemaNotFound {
                event_type: event_type.to_string(),
                version: version.to_string(),
            })
    }

    fn validate(
        &self,
        event_type: &str,
        version: &str,
        document: &Value,
    ) -> Result<Vec<SchemaViolation>> {
        let schema = self.resolve(event_type, version)?;
        Ok(self.check_document(&schema, document))
    }

    fn latest_version(&self, event_type: &str) -> Option<String> {
        self.schemas
            .keys()
            .filter(|(t, _)| t == event_type)
            .map(|(_, v)| v)
            .max_by(|a, b| compare_versions(a, b))
            .cloned()
    }

    fn list_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .schemas
            .keys()
            .map(|(t, _)| t.clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        types.sort();
        types
    }
}

/// Process-wide registry of bundled schemas, parsed on first use
pub fn global() -> &'static MemorySchemaRegistry {
    static REGISTRY: OnceLock<MemorySchemaRegistry> = OnceLock::new();
    REGISTRY.get_or_init(MemorySchemaRegistry::bundled)
}

/// Order dotted version strings numerically ("3.10.0" > "3.9.1")
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let parse = |v: &str| -> Vec<u64> {
        v.split('.')
            .map(|part| part.parse::<u64>().unwrap_or(0))
            .collect()
    };
    parse(a).cmp(&parse(b))
}

fn check_meta_identity(schema: &EventSchema, meta: &Value, out: &mut Vec<SchemaViolation>) {
    if let Some(t) = meta.get("type").and_then(Value::as_str) {
        if t != schema.event_type {
            out.push(SchemaViolation::new(
                "meta.type",
                format!("expected '{}', found '{}'", schema.event_type, t),
            ));
        }
    }
    if let Some(v) = meta.get("version").and_then(Value::as_str) {
        if v != schema.version {
            out.push(SchemaViolation::new(
                "meta.version",
                format!("expected '{}', found '{}'", schema.version, v),
            ));
        }
    }
}

fn check_links(schema: &EventSchema, links: &Value, out: &mut Vec<SchemaViolation>) {
    let Some(links) = links.as_array() else {
        out.push(SchemaViolation::new("links", "expected array"));
        return;
    };

    let mut counts: HashMap<&str, usize> = HashMap::new();
    for (i, link) in links.iter().enumerate() {
        let path = format!("links[{i}]");
        let Some(obj) = link.as_object() else {
            out.push(SchemaViolation::new(path, "expected object"));
            continue;
        };

        match obj.get("type").and_then(Value::as_str) {
            Some(link_type) if schema.links.contains_key(link_type) => {
                *counts.entry(link_type).or_default() += 1;
            }
            Some(link_type) => out.push(SchemaViolation::new(
                format!("{path}.type"),
                format!("link type '{link_type}' is not allowed"),
            )),
            None => out.push(SchemaViolation::new(
                format!("{path}.type"),
                "required string field is missing",
            )),
        }

        match obj.get("target").and_then(Value::as_str) {
            Some(target) if uuid::Uuid::parse_str(target).is_ok() => {}
            Some(target) => out.push(SchemaViolation::new(
                format!("{path}.target"),
                format!("'{target}' is not a valid UUID"),
            )),
            None => out.push(SchemaViolation::new(
                format!("{path}.target"),
                "required string field is missing",
            )),
        }

        for key in obj.keys() {
            if key != "type" && key != "target" {
                out.push(SchemaViolation::new(format!("{path}.{key}"), "unexpected field"));
            }
        }
    }

    for (link_type, rule) in &schema.links {
        let count = counts.get(link_type.as_str()).copied().unwrap_or(0);
        if rule.required && count == 0 {
            out.push(SchemaViolation::new(
                "links",
                format!("required link type '{link_type}' is missing"),
            ));
        }
        if !rule.multiple && count > 1 {
            out.push(SchemaViolation::new(
                "links",
                format!("link type '{link_type}' may appear at most once, found {count}"),
            ));
        }
    }
}
