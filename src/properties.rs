//! Typed property bags for markers
//!
//! Reserved keys (marker id, range labels, overlay node type) live in their own
//! namespace and are addressed through [`PropertyKey`] constants, so a user
//! property can never shadow them no matter what it is called.
//!
//! # Example
//!
//! ```rust
//! use mergetree_core::properties::{PropertySet, MARKER_ID};
//!
//! let mut props = PropertySet::new();
//! props.set(MARKER_ID, &"A_Node0".to_string());
//! props.insert("markerId", "user value");
//!
//! assert_eq!(props.get(MARKER_ID).as_deref(), Some("A_Node0"));
//! assert_eq!(props.user_value("markerId"), Some(&serde_json::json!("user value")));
//! ```

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;

/// Name of a reserved property together with the type stored under it
pub struct PropertyKey<T> {
    name: &'static str,
    _type: PhantomData<fn() -> T>,
}

impl<T> PropertyKey<T> {
    /// Declare a reserved key
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _type: PhantomData,
        }
    }

    /// Wire name of the key
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl<T> Clone for PropertyKey<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for PropertyKey<T> {}

impl<T> fmt::Debug for PropertyKey<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PropertyKey({})", self.name)
    }
}

/// Unique id of a marker
pub const MARKER_ID: PropertyKey<String> = PropertyKey::new("markerId");

/// Labels scoping which scans recognise a marker
pub const RANGE_LABELS: PropertyKey<Vec<String>> = PropertyKey::new("rangeLabels");

/// Overlay node type carried by begin markers
pub const NODE_TYPE: PropertyKey<String> = PropertyKey::new("nodeType");

/// Property bag with separate reserved and user namespaces
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PropertySet {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    reserved: BTreeMap<String, Value>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    user: BTreeMap<String, Value>,
}

impl PropertySet {
    /// Create an empty property set
    pub fn new() -> Self {
        Self::default()
    }

    /// True if neither namespace holds a value
    pub fn is_empty(&self) -> bool {
        self.reserved.is_empty() && self.user.is_empty()
    }

    /// Read a reserved property
    ///
    /// Returns `None` if the key is absent or holds a value of the wrong shape.
    pub fn get<T: DeserializeOwned>(&self, key: PropertyKey<T>) -> Option<T> {
        self.reserved
            .get(key.name)
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }

    /// Check whether a reserved property is present
    pub fn contains<T>(&self, key: PropertyKey<T>) -> bool {
        self.reserved.contains_key(key.name)
    }

    /// Write a reserved property
    pub fn set<T: Serialize>(&mut self, key: PropertyKey<T>, value: &T) -> &mut Self {
        match serde_json::to_value(value) {
            Ok(value) => {
                self.reserved.insert(key.name.to_string(), value);
            }
            Err(e) => {
                tracing::warn!(key = key.name, error = %e, "Failed to encode reserved property");
            }
        }
        self
    }

    /// Remove a reserved property
    pub fn clear<T>(&mut self, key: PropertyKey<T>) {
        self.reserved.remove(key.name);
    }

    /// Write a user property
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        self.user.insert(name.into(), value.into());
        self
    }

    /// Read a user property
    pub fn user_value(&self, name: &str) -> Option<&Value> {
        self.user.get(name)
    }

    /// Iterate over user properties in key order
    pub fn user_properties(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.user.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Copy every user property of `other` into this set
    pub fn extend_user(&mut self, other: &PropertySet) {
        for (name, value) in &other.user {
            self.user.insert(name.clone(), value.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_reserved_roundtrip() {
        let mut props = PropertySet::new();
        props.set(RANGE_LABELS, &vec!["onode".to_string()]);

        assert_eq!(props.get(RANGE_LABELS), Some(vec!["onode".to_string()]));
        assert!(props.contains(RANGE_LABELS));
        assert!(!props.contains(MARKER_ID));
    }

    #[test]
    fn test_user_keys_do_not_collide() {
        let mut props = PropertySet::new();
        props.set(NODE_TYPE, &"folder".to_string());
        props.insert("nodeType", 42);

        assert_eq!(props.get(NODE_TYPE).as_deref(), Some("folder"));
        assert_eq!(props.user_value("nodeType"), Some(&json!(42)));
    }

    #[test]
    fn test_wrong_shape_reads_as_none() {
        let mut props = PropertySet::new();
        props.set(MARKER_ID, &"x".to_string());

        let labels_as_id: PropertyKey<Vec<String>> = PropertyKey::new("markerId");
        assert_eq!(props.get(labels_as_id), None);
    }

    #[test]
    fn test_clear_and_empty() {
        let mut props = PropertySet::new();
        assert!(props.is_empty());

        props.set(MARKER_ID, &"x".to_string());
        assert!(!props.is_empty());

        props.clear(MARKER_ID);
        assert!(props.is_empty());
    }

    #[test]
    fn test_serialization_skips_empty_namespaces() {
        let mut props = PropertySet::new();
        props.insert("label", "Docs");

        let json = serde_json::to_value(&props).unwrap();
        assert_eq!(json, json!({ "user": { "label": "Docs" } }));

        let back: PropertySet = serde_json::from_value(json).unwrap();
        assert_eq!(back, props);
    }
}
