use thiserror::Error;

/// Errors that can occur during PTY operations
#[derive(Debug, Error)]
pub enum PtyError {
    /// Failed to create PTY
    #[error("Failed to create PTY: {0}")]
    CreateFailed(String),
    /// Failed to write to PTY
    #[error("Failed to write to PTY: {0}")]
    WriteFailed(String),
    /// Failed to resize PTY
    #[error("Failed to resize PTY: {0}")]
    ResizeFailed(String),
    /// Failed to kill PTY process
    #[error("Failed to kill PTY: {0}")]
    KillFailed(String),
    /// The actor behind a handle has shut down
    #[error("PTY process has exited")]
    ProcessExited,
}

impl From<anyhow::Error> for PtyError {
    fn from(err: anyhow::Error) -> Self {
        PtyError::CreateFailed(format!("{:#}", err))
    }
}
