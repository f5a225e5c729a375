use std::time::Duration;

use thiserror::Error;

pub type Result<T, E = ChatError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("invalid model url: {0}")]
    Validation(String),

    #[error("download failed{}: {message}", status.map(|code| format!(" with status {code}")).unwrap_or_default())]
    Download {
        status: Option<u16>,
        message: String,
    },

    #[error("integrity check failed: {0}")]
    Integrity(String),

    #[error("model failed to load: {0}")]
    EngineLoad(String),

    #[error("model metadata was not available within {0:?}")]
    EngineTimeout(Duration),

    #[error("generation failed: {0}")]
    Generation(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("download cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ChatError {
    pub fn download_status(status: u16) -> Self {
        ChatError::Download {
            status: Some(status),
            message: format!("server responded with status {status}"),
        }
    }

    pub fn transfer(message: impl Into<String>) -> Self {
        ChatError::Download {
            status: None,
            message: message.into(),
        }
    }

    /// True for failures a user should see as a message rather than a log line.
    #[must_use]
    pub fn is_user_facing(&self) -> bool {
        matches!(
            self,
            ChatError::Validation(_)
                | ChatError::Download { .. }
                | ChatError::Integrity(_)
                | ChatError::EngineLoad(_)
                | ChatError::EngineTimeout(_)
                | ChatError::NotFound(_)
        )
    }
}

impl From<serde_json::Error> for ChatError {
    fn from(error: serde_json::Error) -> Self {
        ChatError::Storage(error.to_string())
    }
}
