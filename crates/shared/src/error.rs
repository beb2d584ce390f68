use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("no open command channel")]
    ConnectionUnavailable,
    #[error("command channel transport error: {0}")]
    Transport(String),
    #[error("failed to encode command: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("command `{command}` not delivered: {reason}")]
    FallbackExhausted { command: String, reason: String },
    #[error("command channel is shut down")]
    Shutdown,
}

impl ChannelError {
    /// Errors a caller may answer with a fallback transport.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::ConnectionUnavailable | Self::Transport(_))
    }
}
