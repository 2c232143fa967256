use itom_protocol::ClarificationRequest;

use crate::error::StreamError;

/// Lifecycle of the one stream a controller tracks.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum StreamingState {
    #[default]
    Idle,
    Connecting,
    Streaming {
        message_id: Option<String>,
        agent_id: Option<String>,
        partial_content: String,
        has_received_first_token: bool,
    },
    Complete {
        message_id: Option<String>,
        agent_id: Option<String>,
        full_content: String,
    },
    Error {
        error: StreamError,
        /// Text received before the failure, if any.
        partial_content: Option<String>,
    },
    Clarification {
        clarification: ClarificationRequest,
        message_id: Option<String>,
    },
}

impl StreamingState {
    /// Connecting or streaming: a request is in flight and may still change state.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Connecting | Self::Streaming { .. })
    }

    pub fn partial_content(&self) -> Option<&str> {
        match self {
            Self::Streaming {
                partial_content, ..
            } => Some(partial_content),
            Self::Error {
                partial_content, ..
            } => partial_content.as_deref(),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&StreamError> {
        match self {
            Self::Error { error, .. } => Some(error),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Streaming { .. } => "streaming",
            Self::Complete { .. } => "complete",
            Self::Error { .. } => "error",
            Self::Clarification { .. } => "clarification",
        }
    }
}
