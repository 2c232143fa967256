use thiserror::Error;

#[derive(Debug, Error)]
pub enum RealtimeError {
    #[error("Connect failed: {0}")]
    Connect(String),

    #[error("Connect timed out after {0}s")]
    Timeout(u64),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Connection closed")]
    Closed,
}

impl RealtimeError {
    pub fn code(&self) -> &'static str {
        match self {
            RealtimeError::Connect(_) => "CONNECT_FAILED",
            RealtimeError::Timeout(_) => "CONNECT_TIMEOUT",
            RealtimeError::WebSocket(_) => "WEBSOCKET_ERROR",
            RealtimeError::Closed => "CONNECTION_CLOSED",
        }
    }
}

pub type Result<T> = std::result::Result<T, RealtimeError>;
