use itom_core::{Artifact, SuggestedAction};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::sse::RawEvent;

/// Typed chat stream event.
///
/// Every payload field is optional on the wire; a missing field decodes to
/// its default rather than rejecting the event.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Emitted once at the beginning with response metadata.
    Start(StreamStart),

    /// One incremental chunk of the assistant reply.
    Token { token: String, message_id: Option<String> },

    /// Stream completed; `full_content` is authoritative when non-empty.
    End(StreamEnd),

    /// Server-reported failure.
    Error { code: Option<String>, message: String },

    /// The orchestrator needs the user to disambiguate before routing.
    Clarification(ClarificationRequest),
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct StreamStart {
    pub message_id: Option<String>,
    pub agent_id: Option<String>,
    pub conversation_id: Option<String>,
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamEnd {
    pub message_id: Option<String>,
    pub full_content: Option<String>,
    pub agent_id: Option<String>,
    pub agent_name: Option<String>,
    pub conversation_id: Option<String>,
    pub timestamp: Option<String>,
    pub artifacts: Vec<Artifact>,
    pub suggested_actions: Vec<SuggestedAction>,
}

/// A pending disambiguation question. Answers must echo `pending_token`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClarificationRequest {
    pub question: String,
    pub options: Vec<String>,
    pub pending_token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
}

impl StreamEvent {
    /// Interpret a decoded frame. Unknown event names yield `None`.
    pub fn from_raw(raw: RawEvent) -> Option<Self> {
        let RawEvent { event, data } = raw;
        match event.as_str() {
            "stream_start" => Some(Self::Start(
                serde_json::from_value(data).unwrap_or_default(),
            )),
            "token" => Some(Self::Token {
                token: str_field(&data, "token").unwrap_or_default(),
                message_id: str_field(&data, "message_id"),
            }),
            "stream_end" => Some(Self::End(decode_stream_end(&data))),
            "error" => Some(Self::Error {
                code: str_field(&data, "code").filter(|c| !c.trim().is_empty()),
                message: str_field(&data, "message")
                    .unwrap_or_else(|| "An unknown error occurred".to_string()),
            }),
            "clarification" => Some(Self::Clarification(ClarificationRequest {
                question: str_field(&data, "question").unwrap_or_default(),
                options: data
                    .get("options")
                    .and_then(Value::as_array)
                    .map(|items| {
                        items
                            .iter()
                            .filter_map(|v| v.as_str().map(str::to_string))
                            .collect()
                    })
                    .unwrap_or_default(),
                pending_token: str_field(&data, "pending_message_token").unwrap_or_default(),
                message_id: str_field(&data, "message_id"),
            })),
            other => {
                debug!(event = other, "ignoring unknown stream event");
                None
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Start(_) => "stream_start",
            Self::Token { .. } => "token",
            Self::End(_) => "stream_end",
            Self::Error { .. } => "error",
            Self::Clarification(_) => "clarification",
        }
    }
}

fn str_field(data: &Value, key: &str) -> Option<String> {
    data.get(key).and_then(Value::as_str).map(str::to_string)
}

/// Decode `data[key]` as a list. Items that fail to decode are dropped
/// individually; the rest survive.
pub fn decode_list<T: serde::de::DeserializeOwned>(data: &Value, key: &str) -> Vec<T> {
    data.get(key)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| serde_json::from_value(item.clone()).ok())
                .collect()
        })
        .unwrap_or_default()
}

fn decode_stream_end(data: &Value) -> StreamEnd {
    StreamEnd {
        message_id: str_field(data, "message_id"),
        full_content: str_field(data, "full_content"),
        agent_id: str_field(data, "agent_id"),
        agent_name: str_field(data, "agent_name"),
        conversation_id: str_field(data, "conversation_id"),
        timestamp: str_field(data, "timestamp"),
        artifacts: decode_list(data, "artifacts"),
        suggested_actions: decode_list(data, "suggested_actions"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(event: &str, data: Value) -> RawEvent {
        RawEvent {
            event: event.to_string(),
            data,
        }
    }

    #[test]
    fn stream_start_captures_ids() {
        let ev = StreamEvent::from_raw(raw(
            "stream_start",
            json!({"message_id": "M1", "agent_id": "cmdb-agent", "conversation_id": "C1"}),
        ));
        match ev {
            Some(StreamEvent::Start(start)) => {
                assert_eq!(start.message_id.as_deref(), Some("M1"));
                assert_eq!(start.agent_id.as_deref(), Some("cmdb-agent"));
            }
            other => panic!("expected start, got {other:?}"),
        }
    }

    #[test]
    fn stream_start_with_wrong_types_still_decodes() {
        let ev = StreamEvent::from_raw(raw("stream_start", json!({"message_id": 42})));
        assert_eq!(ev, Some(StreamEvent::Start(StreamStart::default())));
    }

    #[test]
    fn blank_error_code_becomes_none() {
        let ev = StreamEvent::from_raw(raw("error", json!({"code": "  ", "message": "boom"})));
        assert_eq!(
            ev,
            Some(StreamEvent::Error {
                code: None,
                message: "boom".to_string()
            })
        );
    }

    #[test]
    fn clarification_reads_pending_token_and_options() {
        let ev = StreamEvent::from_raw(raw(
            "clarification",
            json!({
                "question": "Which environment?",
                "options": ["prod", "staging", 3],
                "pending_message_token": "tok-9"
            }),
        ));
        let Some(StreamEvent::Clarification(req)) = ev else {
            panic!("expected clarification");
        };
        assert_eq!(req.options, ["prod", "staging"]);
        assert_eq!(req.pending_token, "tok-9");
        assert!(req.message_id.is_none());
    }

    #[test]
    fn stream_end_keeps_valid_artifacts_only() {
        let ev = StreamEvent::from_raw(raw(
            "stream_end",
            json!({
                "message_id": "M1",
                "full_content": "done",
                "artifacts": [
                    {"artifact_id": "a1", "artifact_type": "table", "title": "Servers"},
                    {"artifact_id": "a2", "artifact_type": "hologram"}
                ],
                "suggested_actions": [{"label": "Audit", "prompt": "Audit web-01"}]
            }),
        ));
        let Some(StreamEvent::End(end)) = ev else {
            panic!("expected end");
        };
        assert_eq!(end.artifacts.len(), 1);
        assert_eq!(end.artifacts[0].title, "Servers");
        assert_eq!(end.suggested_actions[0].prompt, "Audit web-01");
    }

    #[test]
    fn unknown_events_are_ignored() {
        assert!(StreamEvent::from_raw(raw("progress", json!({}))).is_none());
    }
}
