//! The working value set threaded through a pipeline execution.
//!
//! An open-ended string-keyed map of `serde_json::Value`s. There is no
//! fixed schema; each module declares the keys it reads and writes.
//! Modules receive a clone and merge their outputs back, so keys written
//! by earlier modules stay visible to later ones unless overwritten.

use std::collections::HashMap;

use serde_json::{Map, Value};

/// Key under which modules record whether their output passed critique.
pub const IS_VALID_KEY: &str = "is_valid";

/// String-keyed working values for one pipeline execution.
///
/// Uses `serde_json::Value` as the wire type so heterogeneous modules can
/// thread numbers, strings, and nested records without a shared schema.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValueSet {
    map: Map<String, Value>,
}

impl ValueSet {
    /// Create an empty value set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap an existing map.
    pub fn from_map(map: Map<String, Value>) -> Self {
        Self { map }
    }

    /// Insert a value, returning the previous one if the key existed.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.map.insert(key.into(), value.into())
    }

    /// Builder-style insert, for constructing initial values.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    /// Look up a value.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.map.get(key)
    }

    /// Look up a string value.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.map.get(key).and_then(Value::as_str)
    }

    /// Remove a key (the explicit "pop" escape from append-only threading).
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.map.remove(key)
    }

    /// Whether the key is present.
    pub fn contains(&self, key: &str) -> bool {
        self.map.contains_key(key)
    }

    /// Merge another map in, overwriting on key collision.
    pub fn merge(&mut self, other: Map<String, Value>) {
        for (k, v) in other {
            self.map.insert(k, v);
        }
    }

    /// Whether the last module marked this record valid.
    pub fn is_valid(&self) -> bool {
        self.map
            .get(IS_VALID_KEY)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Number of keys.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Borrow the underlying map.
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.map
    }

    /// Build the substitution map for prompt rendering: keys upper-cased,
    /// strings taken verbatim, everything else compact JSON.
    pub fn template_vars(&self) -> HashMap<String, String> {
        self.map
            .iter()
            .map(|(k, v)| {
                let rendered = match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (k.to_uppercase(), rendered)
            })
            .collect()
    }
}
