//! Change/control message framing

use botstream_core::{ChangeMessage, ControlMessage, Operation, ShapeMessage, TransportError};
use serde::Deserialize;

pub const HANDLE_HEADER: &str = "electric-handle";
pub const OFFSET_HEADER: &str = "electric-offset";
pub const CURSOR_HEADER: &str = "electric-cursor";

#[derive(Debug, Deserialize)]
struct RawMessage {
    #[serde(default)]
    key: Option<String>,
    #[serde(default)]
    value: serde_json::Value,
    #[serde(default)]
    headers: RawHeaders,
}

#[derive(Debug, Default, Deserialize)]
struct RawHeaders {
    operation: Option<String>,
    control: Option<String>,
    relation: Option<Vec<String>>,
    table: Option<String>,
}

impl RawMessage {
    fn into_message(self) -> Result<ShapeMessage, TransportError> {
        let RawHeaders {
            operation,
            control,
            relation,
            table,
        } = self.headers;

        if let Some(operation) = operation {
            let operation: Operation = operation
                .parse()
                .map_err(|e| TransportError::Protocol(format!("{}", e)))?;
            let table = table.or_else(|| relation.and_then(|mut parts| parts.pop()));
            return Ok(ShapeMessage::Change(ChangeMessage {
                operation,
                table,
                key: self.key,
                value: self.value,
            }));
        }

        let control = match control.as_deref() {
            Some("up-to-date") => ControlMessage::UpToDate,
            Some("must-refetch") => ControlMessage::MustRefetch,
            Some(other) => ControlMessage::Other(other.to_string()),
            None => ControlMessage::Other("heartbeat".to_string()),
        };
        Ok(ShapeMessage::Control(control))
    }
}

/// Decode one response body: a JSON array of messages
pub fn parse_messages(body: &[u8]) -> Result<Vec<ShapeMessage>, TransportError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Vec::new());
    }
    let raw: Vec<RawMessage> = serde_json::from_slice(body)?;
    raw.into_iter().map(RawMessage::into_message).collect()
}
