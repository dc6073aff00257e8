//! Opaque message records exchanged between components.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single message as seen by hooks. The payload is never interpreted by the
/// harness itself, only by user supplied closures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(rename = "type")]
    pub message_type: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
}

impl Message {
    pub fn new(message_type: impl Into<String>, payload: Value) -> Self {
        Self {
            message_type: message_type.into(),
            payload,
            trace_id: None,
        }
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_shape_uses_type_and_trace_id() {
        let msg = Message::new("Ping", json!({"seq": 1})).with_trace_id("t-1");
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value, json!({"type": "Ping", "payload": {"seq": 1}, "traceId": "t-1"}));
    }

    #[test]
    fn test_missing_payload_defaults_to_null() {
        let msg: Message = serde_json::from_str(r#"{"type": "Heartbeat"}"#).unwrap();
        assert_eq!(msg.message_type, "Heartbeat");
        assert!(msg.payload.is_null());
        assert!(msg.trace_id.is_none());
    }
}
