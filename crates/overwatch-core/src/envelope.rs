use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Kind tag of a message pushed to a live connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboundKind {
    Connected,
    Welcome,
    EventLogged,
    Intervention,
    HeartbeatAck,
    AckReceived,
    Error,
    Unknown,
}

impl OutboundKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Welcome => "welcome",
            Self::EventLogged => "event_logged",
            Self::Intervention => "intervention",
            Self::HeartbeatAck => "heartbeat_ack",
            Self::AckReceived => "ack_received",
            Self::Error => "error",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for OutboundKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wire frame for every hub message: `{type, data, timestamp}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: OutboundKind,
    pub data: Value,
    pub timestamp: String,
}

impl Envelope {
    pub fn new(kind: OutboundKind, data: Value) -> Self {
        Self {
            kind,
            data,
            timestamp: crate::timestamp_now(),
        }
    }

    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Self::new(
            OutboundKind::Error,
            serde_json::json!({ "code": code, "message": message.into() }),
        )
    }

    pub fn to_json(&self) -> String {
        // Value and String fields always serialize.
        serde_json::to_string(self).unwrap_or_else(|_| String::from("{}"))
    }
}
