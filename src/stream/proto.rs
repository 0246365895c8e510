use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Liveness probe sent by the client.
pub const PING_FRAME: &str = "ping";
/// Liveness reply sent by the server.
pub const PONG_FRAME: &str = "pong";
/// Reserved topic that receives every decoded message.
pub const ALL_TOPIC: &str = "all";

/// Returns true for the two reserved single-word liveness payloads.
pub fn is_liveness_frame(text: &str) -> bool {
    text == PING_FRAME || text == PONG_FRAME
}

/// Structured server message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,
}

impl Envelope {
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            data,
            priority: None,
        }
    }

    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Decodes `data` into a concrete payload type.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.data)
    }
}

/// Text frame after liveness filtering.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Liveness,
    Event(Envelope),
}

impl InboundFrame {
    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        if is_liveness_frame(text) {
            return Ok(Self::Liveness);
        }
        Envelope::from_text(text).map(Self::Event)
    }
}

/// Server event type with a known payload shape.
///
/// Registering through a `Topic` ties the listener's payload type to the
/// `type` discriminator it subscribes to.
pub trait Topic {
    const NAME: &'static str;
    type Payload: DeserializeOwned + Send + 'static;
}

/// Bot log lines pushed as they are written.
#[derive(Debug, Clone, Copy)]
pub struct LogTopic;

impl Topic for LogTopic {
    const NAME: &'static str = "log";
    type Payload = LogEntry;
}

/// Kill-switch trips, pushed with `priority: "critical"`.
#[derive(Debug, Clone, Copy)]
pub struct KillSwitchTopic;

impl Topic for KillSwitchTopic {
    const NAME: &'static str = "kill_switch";
    type Payload = LogEntry;
}

/// A bot log record as serialized by the backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct LogEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bot_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl LogEntry {
    /// Kill-switch records carry this marker in their message text.
    pub const KILL_SWITCH_MARKER: &'static str = "KILL-SWITCH";

    pub fn is_kill_switch(&self) -> bool {
        self.message.contains(Self::KILL_SWITCH_MARKER)
    }
}
