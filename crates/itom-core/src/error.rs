use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid role: {0}")]
    InvalidRole(String),
}

impl CoreError {
    /// Short, stable error code for logs and UI error slots.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::Config(_) => "CONFIG_ERROR",
            CoreError::InvalidRole(_) => "INVALID_ROLE",
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
