//! # Failure Context
//!
//! Opaque key/value context attached to failure events and passed to
//! remediation actions (component path, originating line/column, ...).

use std::fmt;

use serde::{Deserialize, Serialize};

/// Key/value context carried by a failure event
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FailureContext {
    data: serde_json::Map<String, serde_json::Value>,
}

impl FailureContext {
    /// Creates an empty context
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a key-value pair to the context
    pub fn add<K, V>(mut self, key: K, value: V) -> Self
    where
        K: Into<String>,
        V: Serialize,
    {
        if let Ok(value) = serde_json::to_value(value) {
            self.data.insert(key.into(), value);
        }
        self
    }

    /// Looks up a context value
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.data.get(key)
    }

    /// Looks up a context value as a string slice
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(|v| v.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &serde_json::Value)> {
        self.data.iter()
    }
}

impl From<serde_json::Map<String, serde_json::Value>> for FailureContext {
    fn from(data: serde_json::Map<String, serde_json::Value>) -> Self {
        Self { data }
    }
}

impl fmt::Display for FailureContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        let mut first = true;
        for (k, v) in &self.data {
            if !first {
                write!(f, ", ")?;
            }
            write!(f, "{}: {}", k, v)?;
            first = false;
        }
        write!(f, "]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_creation() {
        let ctx = FailureContext::new()
            .add("line", 42)
            .add("componentPath", "App > Panel");

        assert_eq!(ctx.len(), 2);
        assert_eq!(ctx.get("line"), Some(&serde_json::json!(42)));
        assert_eq!(ctx.get_str("componentPath"), Some("App > Panel"));
        assert!(ctx.get_str("line").is_none());
    }

    #[test]
    fn test_context_display() {
        let ctx = FailureContext::new().add("column", 7);
        assert_eq!(ctx.to_string(), "[column: 7]");
        assert_eq!(FailureContext::new().to_string(), "[]");
    }

    #[test]
    fn test_context_is_transparent_map() {
        let ctx = FailureContext::new().add("a", true);
        let value = serde_json::to_value(&ctx).unwrap();
        assert_eq!(value, serde_json::json!({ "a": true }));
    }
}
