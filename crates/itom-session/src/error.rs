use thiserror::Error;

/// Errors from the conversation CRUD backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("conversation not found: {0}")]
    NotFound(String),

    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
}

impl StoreError {
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::NotFound(_) => "NOT_FOUND",
            StoreError::Http { .. } => "HTTP_ERROR",
            StoreError::Request(_) => "NETWORK_ERROR",
        }
    }
}

/// Errors surfaced by [`ChatSession`](crate::session::ChatSession) operations
/// that cannot be reported through the error slot.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no conversation store configured")]
    NoStore,

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl SessionError {
    pub fn code(&self) -> &'static str {
        match self {
            SessionError::NoStore => "NO_STORE",
            SessionError::Store(e) => e.code(),
        }
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;
