//! The `data` block of an event

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Type-specific event payload, keyed by field name
///
/// Values are not checked when added; call `Event::validate` before sending.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Data(BTreeMap<String, Value>);

impl Data {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a field, replacing any previous value
    pub fn add(&mut self, key: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }
}

impl FromIterator<(String, Value)> for Data {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_add_and_replace() {
        let mut data = Data::new();
        data.add("name", "build").add("name", "test");
        data.add("triggers", json!([{"type": "MANUAL"}]));
        assert_eq!(data.len(), 2);
        assert_eq!(data.get("name"), Some(&json!("test")));
        assert!(data.contains("triggers"));
        assert_eq!(data.remove("name"), Some(json!("test")));
        assert!(!data.contains("name"));
    }

    #[test]
    fn test_serializes_as_plain_object() {
        let mut data = Data::new();
        data.add("b", 2).add("a", 1);
        assert_eq!(serde_json::to_string(&data).unwrap(), r#"{"a":1,"b":2}"#);
    }
}
