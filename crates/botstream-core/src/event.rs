//! Change events and their routing keys

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Row-level operation carried by a change message
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Insert => "insert",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown operation `{0}`")]
pub struct UnknownOperation(pub String);

impl FromStr for Operation {
    type Err = UnknownOperation;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "insert" => Ok(Operation::Insert),
            "update" => Ok(Operation::Update),
            "delete" => Ok(Operation::Delete),
            _ => Err(UnknownOperation(s.to_string())),
        }
    }
}

/// Routing key `"{table}.{operation}"`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventType(String);

impl EventType {
    pub fn new(table: &str, operation: Operation) -> Self {
        Self(format!("{}.{}", table, operation.as_str()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EventType {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for EventType {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&EventType> for EventType {
    fn from(value: &EventType) -> Self {
        value.clone()
    }
}

impl Borrow<str> for EventType {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// One normalized row change
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChangeEvent {
    /// Local identifier for log correlation
    pub id: Uuid,

    pub table: String,

    pub operation: Operation,

    /// Upstream row key, when the source sends one
    pub key: Option<String>,

    /// Row payload; never inspected by the pipeline
    pub value: serde_json::Value,

    /// When the pipeline read the change from upstream
    pub observed_at: DateTime<Utc>,
}

impl ChangeEvent {
    pub fn new(table: impl Into<String>, operation: Operation, value: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            table: table.into(),
            operation,
            key: None,
            value,
            observed_at: Utc::now(),
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn event_type(&self) -> EventType {
        EventType::new(&self.table, self.operation)
    }
}
