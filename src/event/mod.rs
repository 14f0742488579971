//! Eiffel event model: meta, data and links, validation, wire format and routing keys
//!
//! An event serializes as `{"meta": {...}, "data": {...}, "links": [...]}`.
//! Routing-key segments (family, tag, domain id) travel as broker metadata only,
//! so they are not part of the document.

mod data;
mod links;
mod meta;

pub use data::Data;
pub use links::{Link, LinkTarget, Links, CONTEXT};
pub use meta::{Meta, Source};

use crate::error::{EiffelError, Result, SchemaViolation};
use crate::schema::{self, SchemaRegistry};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Placeholder for unset routing-key segments
const UNSET_SEGMENT: &str = "_";

/// A single Eiffel event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    meta: Meta,

    /// Type-specific payload
    #[serde(default)]
    pub data: Data,

    /// Causal and contextual links to other events
    #[serde(default)]
    pub links: Links,

    #[serde(skip)]
    family: Option<String>,

    #[serde(skip)]
    tag: Option<String>,

    #[serde(skip)]
    domain_id: Option<String>,
}

impl Event {
    /// Create an event with a generated id and empty data/links
    ///
    /// Fails with `UnknownEventType` if no schema is bundled for (type, version).
    pub fn new(event_type: impl Into<String>, version: impl Into<String>) -> Result<Self> {
        let event_type = event_type.into();
        let version = version.into();
        if schema::global().resolve(&event_type, &version).is_err() {
            return Err(EiffelError::UnknownEventType {
                event_type,
                version,
            });
        }
        Ok(Self::unchecked(event_type, version))
    }

    /// Create an event at the newest bundled version of its type
    pub fn latest(event_type: impl Into<String>) -> Result<Self> {
        let event_type = event_type.into();
        match schema::global().latest_version(&event_type) {
            Some(version) => Ok(Self::unchecked(event_type, version)),
            None => Err(EiffelError::UnknownEventType {
                event_type,
                version: "latest".to_string(),
            }),
        }
    }

    /// Create an event without checking that a schema exists
    ///
    /// For types registered in a custom [`SchemaRegistry`]; validate with
    /// [`Event::validate_with`].
    pub fn unchecked(event_type: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            meta: Meta::new(event_type, version),
            data: Data::new(),
            links: Links::new(),
            family: None,
            tag: None,
            domain_id: None,
        }
    }

    /// Set the routing-key family segment
    pub fn with_family(mut self, family: impl Into<String>) -> Self {
        self.family = Some(family.into());
        self
    }

    /// Set the routing-key tag segment
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    /// Set the routing-key domain-id segment
    pub fn with_domain_id(mut self, domain_id: impl Into<String>) -> Self {
        self.domain_id = Some(domain_id.into());
        self
    }

    pub fn id(&self) -> &str {
        self.meta.id()
    }

    pub fn event_type(&self) -> &str {
        self.meta.event_type()
    }

    pub fn version(&self) -> &str {
        self.meta.version()
    }

    pub fn meta(&self) -> &Meta {
        &self.meta
    }

    /// Mutable access to optional meta members; identity stays fixed
    pub fn meta_mut(&mut self) -> &mut Meta {
        &mut self.meta
    }

    pub fn family(&self) -> Option<&str> {
        self.family.as_deref()
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    pub fn domain_id(&self) -> Option<&str> {
        self.domain_id.as_deref()
    }

    /// Target id of the most recently added CONTEXT link
    pub fn context(&self) -> Option<&str> {
        self.links.context()
    }

    /// Broker routing key: `eiffel.<family>.<type>.<tag>.<domain-id>`
    pub fn routing_key(&self) -> String {
        format!(
            "eiffel.{}.{}.{}.{}",
            self.family.as_deref().unwrap_or(UNSET_SEGMENT),
            self.event_type(),
            self.tag.as_deref().unwrap_or(UNSET_SEGMENT),
            self.domain_id.as_deref().unwrap_or(UNSET_SEGMENT),
        )
    }

    /// Validate against the bundled schema for (type, version)
    ///
    /// Returns the violations found (empty when valid). Fails only with
    /// `SchemaNotFound`.
    pub fn validate(&self) -> Result<Vec<SchemaViolation>> {
        self.validate_with(schema::global())
    }

    /// Validate against a specific registry
    pub fn validate_with(&self, registry: &dyn SchemaRegistry) -> Result<Vec<SchemaViolation>> {
        let document = serde_json::to_value(self)?;
        registry.validate(self.event_type(), self.version(), &document)
    }

    /// Validate and fail with `InvalidEvent` on any violation
    pub fn check(&self) -> Result<()> {
        let violations = self.validate()?;
        if violations.is_empty() {
            Ok(())
        } else {
            Err(EiffelError::InvalidEvent {
                event_type: self.event_type().to_string(),
                version: self.version().to_string(),
                violations,
            })
        }
    }

    /// Serialize to wire bytes (field order: meta, data, links)
    pub fn to_wire(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse wire bytes
    ///
    /// Fails with `MalformedEvent` when the bytes are not an event document.
    /// A document that parses but breaks its schema is returned as-is; call
    /// [`Event::validate`] to check it.
    pub fn from_wire(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| EiffelError::MalformedEvent(e.to_string()))
    }

    /// Parse wire bytes, also returning the document as received
    ///
    /// The event drops members it does not model; validate the returned
    /// document to see them.
    pub fn from_wire_document(bytes: &[u8]) -> Result<(Self, Value)> {
        let malformed = |e: serde_json::Error| EiffelError::MalformedEvent(e.to_string());
        let document: Value = serde_json::from_slice(bytes).map_err(malformed)?;
        let event = Self::deserialize(&document).map_err(malformed)?;
        Ok((event, document))
    }

    /// Human-readable rendering: sorted keys, 4-space indentation
    pub fn pretty(&self) -> Result<String> {
        let value = sort_keys(serde_json::to_value(self)?);
        let mut buf = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
        value.serialize(&mut ser)?;
        String::from_utf8(buf).map_err(|e| EiffelError::MalformedEvent(e.to_string()))
    }
}

fn sort_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            Value::Object(entries.into_iter().map(|(k, v)| (k, sort_keys(v))).collect())
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sort_keys).collect()),
        other => other,
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} v{} ({})", self.event_type(), self.version(), self.id())
    }
}
