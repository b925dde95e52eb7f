use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConvoError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Could not determine home directory")]
    NoHomeDir,

    #[error("Conversation not found: {0}")]
    ConversationNotFound(String),

    #[error("Invalid session id: {0:?}")]
    InvalidSessionId(String),

    #[error("Invalid conversation file: {0}")]
    InvalidFormat(PathBuf),
}

pub type Result<T> = std::result::Result<T, ConvoError>;
