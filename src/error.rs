//! Error types for eiffel-event

use std::fmt;
use thiserror::Error;

/// A single schema violation found while validating an event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaViolation {
    /// Location of the offending value (e.g. `data.outcome.conclusion`, `links[1].type`)
    pub path: String,

    /// Human-readable reason
    pub reason: String,
}

impl SchemaViolation {
    pub fn new(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for SchemaViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.reason)
    }
}

fn join_violations(violations: &[SchemaViolation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors that can occur in the event layer
#[derive(Debug, Error)]
pub enum EiffelError {
    /// No schema is bundled for the requested event type/version
    #[error("Unknown event type '{event_type}' v{version}")]
    UnknownEventType { event_type: String, version: String },

    /// Schema lookup failed for a type/version pair
    #[error("Schema not found for '{event_type}' v{version}")]
    SchemaNotFound { event_type: String, version: String },

    /// Event does not conform to its schema
    #[error("Invalid event '{event_type}' v{version}: {}", join_violations(.violations))]
    InvalidEvent {
        event_type: String,
        version: String,
        violations: Vec<SchemaViolation>,
    },

    /// Wire bytes could not be parsed into an event
    #[error("Malformed event: {0}")]
    MalformedEvent(String),

    /// Operation requires a live broker channel
    #[error("Not connected to broker")]
    NotConnected,

    /// Broker connection failure
    #[error("Connection error: {0}")]
    Connection(String),

    /// Publish failure
    #[error("Failed to publish event with routing key '{routing_key}': {reason}")]
    Publish { routing_key: String, reason: String },

    /// Queue declaration, binding or consumer setup failure
    #[error("Failed to subscribe to '{pattern}': {reason}")]
    Subscribe { pattern: String, reason: String },

    /// Acknowledgement failure
    #[error("Failed to acknowledge message: {0}")]
    Ack(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EiffelError {
    /// Whether the error is a connectivity problem the background loop recovers from
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::NotConnected | Self::Connection(_) | Self::Publish { .. } | Self::Ack(_)
        )
    }
}

/// Result type alias for event operations
pub type Result<T> = std::result::Result<T, EiffelError>;
