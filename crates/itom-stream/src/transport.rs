use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use itom_core::config::{CHAT_CLARIFY_PATH, CHAT_STREAM_PATH};
use itom_protocol::{ClarifyRequest, StreamChatRequest};
use reqwest::header::ACCEPT;
use reqwest::StatusCode;
use tracing::debug;

use crate::error::{Result, TransportError};

/// Response body delivered chunk by chunk.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// What a streaming request asks the backend for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamRequest {
    Chat(StreamChatRequest),
    Clarify(ClarifyRequest),
}

impl StreamRequest {
    pub fn chat(
        content: impl Into<String>,
        conversation_id: impl Into<String>,
        agent_target: Option<String>,
    ) -> Self {
        Self::Chat(StreamChatRequest {
            content: content.into(),
            conversation_id: conversation_id.into(),
            agent_target,
        })
    }

    pub fn clarify(
        pending_token: impl Into<String>,
        answer: impl Into<String>,
        conversation_id: impl Into<String>,
    ) -> Self {
        Self::Clarify(ClarifyRequest {
            pending_message_token: pending_token.into(),
            clarification_answer: answer.into(),
            conversation_id: conversation_id.into(),
        })
    }

    pub fn path(&self) -> &'static str {
        match self {
            StreamRequest::Chat(_) => CHAT_STREAM_PATH,
            StreamRequest::Clarify(_) => CHAT_CLARIFY_PATH,
        }
    }

    pub fn conversation_id(&self) -> &str {
        match self {
            StreamRequest::Chat(req) => &req.conversation_id,
            StreamRequest::Clarify(req) => &req.conversation_id,
        }
    }

    pub fn is_clarification(&self) -> bool {
        matches!(self, StreamRequest::Clarify(_))
    }
}

/// Status line plus the (possibly absent) body of a streaming response.
pub struct TransportResponse {
    pub status: u16,
    pub reason: String,
    pub body: Option<ByteStream>,
}

impl TransportResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

impl std::fmt::Debug for TransportResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportResponse")
            .field("status", &self.status)
            .field("reason", &self.reason)
            .field("has_body", &self.body.is_some())
            .finish()
    }
}

/// Issues the POST that opens a chat stream.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn open(&self, request: &StreamRequest) -> Result<TransportResponse>;
}

/// reqwest-backed transport against the chat backend.
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl ChatTransport for HttpTransport {
    async fn open(&self, request: &StreamRequest) -> Result<TransportResponse> {
        let url = format!("{}{}", self.base_url, request.path());
        debug!(url = %url, "opening chat stream");

        let builder = self
            .client
            .post(&url)
            .header(ACCEPT, "text/event-stream");
        let builder = match request {
            StreamRequest::Chat(body) => builder.json(body),
            StreamRequest::Clarify(body) => builder.json(body),
        };
        let resp = builder.send().await?;

        let status = resp.status();
        let reason = status.canonical_reason().unwrap_or_default().to_string();
        let body = if status == StatusCode::NO_CONTENT {
            None
        } else {
            let stream = resp
                .bytes_stream()
                .map(|chunk| chunk.map_err(TransportError::from));
            Some(Box::pin(stream) as ByteStream)
        };

        Ok(TransportResponse {
            status: status.as_u16(),
            reason,
            body,
        })
    }
}
