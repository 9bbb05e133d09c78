//! Wire envelope shared by the Relay, the Pylon and Desktop clients.
//!
//! Envelopes are open JSON objects: `type` is a free-form string and
//! `payload` is routed verbatim. Only synthesized diagnostic replies
//! (`echo`, `pong`, `deviceList`) carry the relay's own `from` and
//! `timestamp` fields.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Class of a registered device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    /// Host process running agent sessions.
    Pylon,
    /// Human-facing client.
    Desktop,
    /// The relay itself, used only as the `from` of synthesized replies.
    Relay,
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pylon => write!(f, "pylon"),
            Self::Desktop => write!(f, "desktop"),
            Self::Relay => write!(f, "relay"),
        }
    }
}

/// Reference to a device, used for addressed routing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRef {
    pub device_id: String,
    pub device_type: DeviceType,
}

impl DeviceRef {
    #[must_use]
    pub fn new(device_id: impl Into<String>, device_type: DeviceType) -> Self {
        Self {
            device_id: device_id.into(),
            device_type,
        }
    }

    /// The relay's own `from` marker on synthesized replies.
    #[must_use]
    pub fn relay() -> Self {
        Self::new("relay", DeviceType::Relay)
    }
}

/// Broadcast class selector on an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BroadcastClass {
    /// Every registered pylon except the sender.
    Pylons,
    /// Every connection except the sender.
    All,
}

/// Message envelope exchanged on every wire in the system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<DeviceRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<DeviceRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broadcast: Option<BroadcastClass>,
    /// Unix millis, set only on relay-synthesized replies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

impl Envelope {
    /// Create an envelope with an empty payload.
    #[must_use]
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            payload: Value::Null,
            from: None,
            to: None,
            broadcast: None,
            timestamp: None,
        }
    }

    /// Create an envelope carrying a payload.
    #[must_use]
    pub fn with_payload(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            payload,
            ..Self::new(kind)
        }
    }

    /// Create an `error` envelope with a human-readable message.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self::with_payload(
            types::ERROR,
            serde_json::json!({ "message": message.into() }),
        )
    }

    /// Address this envelope to a specific device.
    #[must_use]
    pub fn to(mut self, target: DeviceRef) -> Self {
        self.to = Some(target);
        self
    }

    /// Stamp the envelope with the current time.
    #[must_use]
    pub fn stamped(mut self) -> Self {
        self.timestamp = Some(now_millis());
        self
    }
}

/// Current time as unix milliseconds.
#[must_use]
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

/// Well-known envelope type strings.
pub mod types {
    // Relay-level types.
    pub const IDENTIFY: &str = "identify";
    pub const AUTH: &str = "auth";
    pub const REGISTERED: &str = "registered";
    pub const DEVICE_STATUS: &str = "deviceStatus";
    pub const GET_DEVICES: &str = "getDevices";
    pub const DEVICE_LIST: &str = "deviceList";
    pub const ECHO: &str = "echo";
    pub const PING: &str = "ping";
    pub const PONG: &str = "pong";
    pub const ERROR: &str = "error";

    // Pylon-local types.
    pub const CONNECTED: &str = "connected";
    pub const RELAY_STATUS: &str = "relay_status";
    pub const TO_RELAY: &str = "toRelay";
    pub const FROM_RELAY: &str = "fromRelay";
    pub const NOTIFICATION: &str = "notification";

    // Application types.
    pub const DESK_LIST: &str = "desk_list";
    pub const DESK_LIST_RESULT: &str = "desk_list_result";
    pub const DESK_STATUS: &str = "desk_status";
    pub const DESK_CREATE: &str = "desk_create";
    pub const CLAUDE_SEND: &str = "claude_send";
    pub const CLAUDE_EVENT: &str = "claude_event";
    pub const CLAUDE_PERMISSION: &str = "claude_permission";
    pub const CLAUDE_ANSWER: &str = "claude_answer";
    pub const CLAUDE_CONTROL: &str = "claude_control";
    pub const MESSAGE_HISTORY: &str = "message_history";

    // Blob protocol types.
    pub const BLOB_START: &str = "blob_start";
    pub const BLOB_CHUNK: &str = "blob_chunk";
    pub const BLOB_END: &str = "blob_end";
    pub const BLOB_REQUEST: &str = "blob_request";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_roundtrip() {
        let env = Envelope::with_payload("chat", serde_json::json!({"text": "hi"}))
            .to(DeviceRef::new("42", DeviceType::Pylon));
        let json = serde_json::to_string(&env).unwrap();
        assert!(json.contains("\"type\":\"chat\""));
        assert!(json.contains("\"deviceId\":\"42\""));
        assert!(!json.contains("broadcast"));

        let parsed: Envelope = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.kind, "chat");
        assert_eq!(parsed.to.unwrap().device_type, DeviceType::Pylon);
    }

    #[test]
    fn broadcast_class_is_lowercase() {
        let mut env = Envelope::new("deviceStatus");
        env.broadcast = Some(BroadcastClass::Pylons);
        let json = serde_json::to_string(&env).unwrap();
        assert!(json.contains("\"broadcast\":\"pylons\""));
    }

    #[test]
    fn missing_optional_fields_parse() {
        let parsed: Envelope = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(parsed.kind, "ping");
        assert!(parsed.payload.is_null());
        assert!(parsed.from.is_none());
    }
}
