//! The `links` block: typed references to other events

use super::Event;
use serde::{Deserialize, Serialize};

/// Link type naming the context an event belongs to
pub const CONTEXT: &str = "CONTEXT";

/// A typed reference from one event to another
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    /// Link type (e.g., "CAUSE", "CONTEXT", "ACTIVITY_EXECUTION")
    #[serde(rename = "type")]
    pub link_type: String,

    /// Id of the linked event
    pub target: String,
}

/// Anything that identifies a link target: an id or another event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkTarget(String);

impl From<&Event> for LinkTarget {
    fn from(event: &Event) -> Self {
        Self(event.id().to_string())
    }
}

impl From<&str> for LinkTarget {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for LinkTarget {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&String> for LinkTarget {
    fn from(id: &String) -> Self {
        Self(id.clone())
    }
}

impl From<uuid::Uuid> for LinkTarget {
    fn from(id: uuid::Uuid) -> Self {
        Self(id.to_string())
    }
}

/// Ordered sequence of links
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Links(Vec<Link>);

impl Links {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a link; the target may be an id or an event
    pub fn add(&mut self, link_type: impl Into<String>, target: impl Into<LinkTarget>) -> &mut Self {
        self.0.push(Link {
            link_type: link_type.into(),
            target: target.into().0,
        });
        self
    }

    /// Links of one type, in insertion order
    pub fn of_type<'a>(&'a self, link_type: &'a str) -> impl Iterator<Item = &'a Link> + 'a {
        self.0.iter().filter(move |l| l.link_type == link_type)
    }

    /// Target of the most recently added CONTEXT link
    pub fn context(&self) -> Option<&str> {
        self.0
            .iter()
            .rev()
            .find(|l| l.link_type == CONTEXT)
            .map(|l| l.target.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Link> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
