//! The structured key-value bag passed into and returned from task
//! closures. The core treats it as opaque; schema is the sequencing
//! layer's concern.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A JSON-shaped object map of string keys to dynamically-typed values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Record(Map<String, Value>);

impl Record {
    /// An empty record.
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Inserts a value, returning whatever was previously stored at `key`.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(key.into(), value.into())
    }

    /// Reads the value stored at `key`, if any.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn into_inner(self) -> Map<String, Value> {
        self.0
    }
}

impl From<Map<String, Value>> for Record {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}
