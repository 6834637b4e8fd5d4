//! Key/value state shared between detection, scheduling and the outside world.
//!
//! Keys are `<appliance>.<field>`. The store is the single source of truth for
//! `running`, `scheduled` and `startTime`; nothing aliases them in memory.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::StoreError;

pub trait StateStore {
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError>;

    /// `committed` marks the write as confirmed by this system rather than
    /// requested by an operator.
    fn set(&mut self, key: &str, value: Value, committed: bool) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    System,
    Operator,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateField {
    Running,
    Scheduled,
    StartTime,
}

impl StateField {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Scheduled => "scheduled",
            Self::StartTime => "startTime",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "running" => Some(Self::Running),
            "scheduled" => Some(Self::Scheduled),
            "startTime" => Some(Self::StartTime),
            _ => None,
        }
    }
}

/// An observed write to one appliance field.
#[derive(Debug, Clone, PartialEq)]
pub struct StateChange {
    pub device: String,
    pub field: StateField,
    pub value: Value,
    pub origin: Origin,
}

impl StateChange {
    pub fn operator(device: &str, field: StateField, value: Value) -> Self {
        Self {
            device: device.to_string(),
            field,
            value,
            origin: Origin::Operator,
        }
    }
}

pub fn key(device: &str, field: StateField) -> String {
    format!("{device}.{}", field.as_str())
}

pub fn read_bool(store: &dyn StateStore, key: &str) -> Result<bool, StoreError> {
    match store.get(key)? {
        None | Some(Value::Null) => Ok(false),
        Some(Value::Bool(value)) => Ok(value),
        Some(Value::String(text)) if text == "true" => Ok(true),
        Some(Value::String(text)) if text == "false" || text.is_empty() => Ok(false),
        Some(other) => Err(StoreError::UnexpectedValue {
            key: key.to_string(),
            found: other.to_string(),
        }),
    }
}

/// Reads a text field; absent, null and empty strings all read as `None`.
pub fn read_text(store: &dyn StateStore, key: &str) -> Result<Option<String>, StoreError> {
    match store.get(key)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(text)) if text.trim().is_empty() => Ok(None),
        Some(Value::String(text)) => Ok(Some(text)),
        Some(other) => Ok(Some(other.to_string())),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredValue {
    pub value: Value,
    pub committed: bool,
}

/// In-memory store, last write wins.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryStore {
    entries: BTreeMap<String, StoredValue>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entry(&self, key: &str) -> Option<&StoredValue> {
        self.entries.get(key)
    }
}

impl StateStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.entries.get(key).map(|entry| entry.value.clone()))
    }

    fn set(&mut self, key: &str, value: Value, committed: bool) -> Result<(), StoreError> {
        self.entries
            .insert(key.to_string(), StoredValue { value, committed });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn keys_are_appliance_dot_field() {
        assert_eq!(key("dryer", StateField::Scheduled), "dryer.scheduled");
        assert_eq!(key("laundry.washer", StateField::StartTime), "laundry.washer.startTime");
    }

    #[test]
    fn reads_loosely_typed_flags() {
        let mut store = MemoryStore::new();
        store.set("a.running", json!(true), true).unwrap();
        store.set("b.running", json!("false"), false).unwrap();
        store.set("c.running", json!(3), false).unwrap();

        assert!(read_bool(&store, "a.running").unwrap());
        assert!(!read_bool(&store, "b.running").unwrap());
        assert!(!read_bool(&store, "missing.running").unwrap());
        assert!(read_bool(&store, "c.running").is_err());
    }

    #[test]
    fn empty_text_reads_as_absent() {
        let mut store = MemoryStore::new();
        store.set("a.startTime", json!("  "), false).unwrap();

        assert_eq!(read_text(&store, "a.startTime").unwrap(), None);
        assert_eq!(store.entry("a.startTime").map(|e| e.committed), Some(false));
    }
}
