use std::fmt;

use serde::{Serialize, Serializer};
use thiserror::Error;

/// Errors raised by a [`ChatTransport`](crate::transport::ChatTransport)
/// before or while the response body is read.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Body read failed: {0}")]
    Body(String),
}

impl TransportError {
    pub fn code(&self) -> &'static str {
        match self {
            TransportError::Request(_) => "REQUEST_FAILED",
            TransportError::Body(_) => "BODY_READ_FAILED",
        }
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// Classification of a failed stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamErrorCode {
    /// Non-2xx response.
    HttpError,
    /// 2xx response without a readable body.
    NoResponseBody,
    /// Transport failure, premature end, or inactivity timeout.
    NetworkError,
    /// The user cancelled the request.
    StreamAborted,
    /// Server `error` event without a code.
    UnknownError,
    /// Code carried verbatim from a server `error` event.
    Server(String),
}

impl StreamErrorCode {
    pub fn as_str(&self) -> &str {
        match self {
            StreamErrorCode::HttpError => "HTTP_ERROR",
            StreamErrorCode::NoResponseBody => "NO_RESPONSE_BODY",
            StreamErrorCode::NetworkError => "NETWORK_ERROR",
            StreamErrorCode::StreamAborted => "STREAM_ABORTED",
            StreamErrorCode::UnknownError => "UNKNOWN_ERROR",
            StreamErrorCode::Server(code) => code,
        }
    }
}

impl fmt::Display for StreamErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for StreamErrorCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// `{code, message}` pair surfaced to the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Error)]
#[error("{code}: {message}")]
pub struct StreamError {
    pub code: StreamErrorCode,
    pub message: String,
}

impl StreamError {
    pub fn new(code: StreamErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn aborted() -> Self {
        Self::new(StreamErrorCode::StreamAborted, "Stream was cancelled")
    }

    pub fn is_aborted(&self) -> bool {
        self.code == StreamErrorCode::StreamAborted
    }
}
