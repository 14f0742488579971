//! The `meta` block: identity, type, version, timestamp and optional members

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Keys owned by the event itself; `Meta::add` never overwrites them
const RESERVED_KEYS: [&str; 4] = ["id", "type", "version", "time"];

/// Get current time in milliseconds since Unix epoch
pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Event meta information
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Meta {
    id: String,

    #[serde(rename = "type")]
    event_type: String,

    version: String,

    /// Creation time (Unix milliseconds)
    time: i64,

    /// Optional members (`tags`, `source`, `security`)
    #[serde(flatten)]
    optional: BTreeMap<String, Value>,
}

impl Meta {
    pub(crate) fn new(event_type: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            event_type: event_type.into(),
            version: version.into(),
            time: now_millis(),
            optional: BTreeMap::new(),
        }
    }

    /// Unique event id (UUID v4)
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Creation time in Unix milliseconds
    pub fn time(&self) -> i64 {
        self.time
    }

    /// Set an optional meta member
    ///
    /// Reserved keys (`id`, `type`, `version`, `time`) are ignored.
    pub fn add(&mut self, key: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        let key = key.into();
        if RESERVED_KEYS.contains(&key.as_str()) {
            tracing::warn!(key = %key, event_id = %self.id, "Ignoring reserved meta key");
            return self;
        }
        self.optional.insert(key, value.into());
        self
    }

    /// Get an optional meta member
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.optional.get(key)
    }

    /// Attach a source descriptor
    pub fn set_source(&mut self, source: &Source) -> &mut Self {
        match serde_json::to_value(source) {
            Ok(value) => self.add("source", value),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to encode meta source");
                self
            }
        }
    }

    /// Decode the source descriptor, if one is set
    pub fn source(&self) -> Option<Source> {
        self.optional
            .get("source")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

/// Describes who sent an event (`meta.source`)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Source {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub serializer: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
}

impl Source {
    /// Create a source with a name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn with_domain_id(mut self, domain_id: impl Into<String>) -> Self {
        self.domain_id = Some(domain_id.into());
        self
    }

    pub fn with_serializer(mut self, serializer: impl Into<String>) -> Self {
        self.serializer = Some(serializer.into());
        self
    }

    pub fn with_uri(mut self, uri: impl Into<String>) -> Self {
        self.uri = Some(uri.into());
        self
    }
}
