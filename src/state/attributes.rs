use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Current values of an entity's attribute sensors.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttributeMap {
    values: BTreeMap<String, Value>,
}

/// Outcome of an attribute write
#[derive(Clone, Debug, PartialEq)]
pub struct AttributeChange {
    pub previous: Option<Value>,
    /// False when the new value equals the stored one; no event is emitted then.
    pub changed: bool,
}

impl AttributeMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_values(values: BTreeMap<String, Value>) -> Self {
        Self { values }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    /// Store a value. An absent attribute compares equal to null.
    pub fn set(&mut self, name: &str, value: Value) -> AttributeChange {
        let changed = self.values.get(name).unwrap_or(&Value::Null) != &value;
        if !changed {
            return AttributeChange {
                previous: self.values.get(name).cloned(),
                changed,
            };
        }
        let previous = self.values.insert(name.to_string(), value);
        AttributeChange { previous, changed }
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.values.remove(name)
    }

    pub fn values(&self) -> &BTreeMap<String, Value> {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
