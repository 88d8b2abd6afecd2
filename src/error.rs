//! Error types for the voice session core.

/// Top-level error type for the voice session core.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Opening or re-opening the remote channel failed.
    #[error("connection error: {0}")]
    Connection(String),

    /// Microphone or speaker unavailable (missing device, permission denied).
    #[error("audio device error: {0}")]
    Device(String),

    /// A frame or acknowledgement could not be handed to the channel.
    #[error("send failure: {0}")]
    Send(String),

    /// A tool invocation did not match the declared schema.
    #[error("tool validation error: {0}")]
    ToolValidation(String),

    /// Inbound audio payload could not be decoded.
    #[error("codec error: {0}")]
    Codec(String),

    /// Wire message could not be parsed or serialized.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Internal channel send/receive error.
    #[error("channel error: {0}")]
    Channel(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SessionError {
    /// Whether the controller absorbs this failure without ending the session.
    ///
    /// Transport and payload failures are retried or dropped; device and
    /// configuration failures end the current start attempt.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Connection(_) | Self::Send(_) | Self::Codec(_) | Self::Protocol(_)
        )
    }
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, SessionError>;
