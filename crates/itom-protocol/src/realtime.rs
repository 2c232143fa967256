use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Discriminator for realtime envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeType {
    Chat,
    Status,
    Error,
    Heartbeat,
}

/// Realtime sync message, both directions.
/// Wire: `{ "type": "chat", "payload": {...}, "correlationId": "abc" }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: EnvelopeType,
    #[serde(default)]
    pub payload: Value,
    #[serde(
        rename = "correlationId",
        alias = "correlation_id",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub correlation_id: Option<String>,
}

impl Envelope {
    pub fn new(kind: EnvelopeType, payload: impl Serialize) -> Self {
        Self {
            kind,
            payload: serde_json::to_value(payload).unwrap_or(Value::Null),
            correlation_id: None,
        }
    }

    /// Keep-alive sent while the channel is connected.
    pub fn heartbeat() -> Self {
        Self::new(
            EnvelopeType::Heartbeat,
            HeartbeatPayload {
                timestamp: chrono::Utc::now().to_rfc3339(),
            },
        )
    }

    pub fn chat(payload: ChatPayload) -> Self {
        Self::new(EnvelopeType::Chat, payload)
    }

    pub fn with_correlation(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Decode an inbound text frame. Anything that is not a well-formed
    /// envelope yields `None`.
    pub fn decode(text: &str) -> Option<Self> {
        serde_json::from_str(text).ok()
    }

    pub fn encode(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Typed view of a `chat` payload.
    pub fn as_chat(&self) -> Option<ChatPayload> {
        if self.kind != EnvelopeType::Chat {
            return None;
        }
        serde_json::from_value(self.payload.clone()).ok()
    }

    pub fn as_status(&self) -> Option<StatusPayload> {
        if self.kind != EnvelopeType::Status {
            return None;
        }
        serde_json::from_value(self.payload.clone()).ok()
    }

    pub fn as_error(&self) -> Option<ErrorPayload> {
        if self.kind != EnvelopeType::Error {
            return None;
        }
        serde_json::from_value(self.payload.clone()).ok()
    }
}

/// Payload of a `chat` envelope: one message mirrored to other clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatPayload {
    pub conversation_id: String,
    pub content: String,
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
}

/// Payload of a `status` envelope: agent availability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusPayload {
    pub agent_id: String,
    /// `online`, `offline` or `busy`.
    pub status: String,
    #[serde(default)]
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    pub timestamp: String,
}
