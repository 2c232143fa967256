use serde::{Deserialize, Serialize};

/// Body of `POST /api/chat/stream`.
///
/// `agent_target` is always serialized; `null` lets the orchestrator route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamChatRequest {
    pub content: String,
    pub conversation_id: String,
    pub agent_target: Option<String>,
}

/// Body of `POST /api/chat/clarify`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClarifyRequest {
    pub pending_message_token: String,
    pub clarification_answer: String,
    pub conversation_id: String,
}
