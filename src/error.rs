//! Error types for event channels and the transports underneath them.

/// Result type for channel operations
pub type IpcResult<T> = Result<T, IpcError>;

/// Errors surfaced by [`EventChannel`](crate::EventChannel).
#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    /// The handle cannot deliver message events at all.
    #[error("invalid process object: handle does not provide message events{}", detail_suffix(.details))]
    InvalidProcessObject { details: Option<String> },

    /// The handle delivers events but has no open channel to send on.
    #[error("IPC channel not found: handle has no send capability{}", detail_suffix(.details))]
    IpcChannelNotFound { details: Option<String> },

    #[error("transmission failed: {0}")]
    Transport(#[from] TransportError),

    #[error("payload codec error: {0}")]
    Codec(#[from] CodecError),
}

impl IpcError {
    pub fn invalid_process_object(details: impl Into<String>) -> Self {
        IpcError::InvalidProcessObject {
            details: Some(details.into()),
        }
    }

    pub fn ipc_channel_not_found(details: impl Into<String>) -> Self {
        IpcError::IpcChannelNotFound {
            details: Some(details.into()),
        }
    }

    /// Extra context attached to a construction failure
    pub fn details(&self) -> Option<&str> {
        match self {
            IpcError::InvalidProcessObject { details } | IpcError::IpcChannelNotFound { details } => {
                details.as_deref()
            }
            _ => None,
        }
    }

    /// Machine readable reason code
    pub fn reason(&self) -> &'static str {
        match self {
            IpcError::InvalidProcessObject { .. } => "invalid_process_object",
            IpcError::IpcChannelNotFound { .. } => "ipc_channel_not_found",
            IpcError::Transport(_) => "transmission_failed",
            IpcError::Codec(_) => "payload_codec_error",
        }
    }

    /// Status classification. Every failure at this layer is a server fault.
    pub fn status_code(&self) -> u16 {
        500
    }
}

fn detail_suffix(details: &Option<String>) -> String {
    details
        .as_deref()
        .map(|details| format!(" ({})", details))
        .unwrap_or_default()
}

/// Failures reported through a transport's completion callback.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("channel closed")]
    ChannelClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON encode error: {0}")]
    Encode(#[from] serde_json::Error),

    /// The transport dropped the completion callback without calling it.
    #[error("send abandoned before completion")]
    Abandoned,

    #[error("{0}")]
    Rejected(String),
}

impl TransportError {
    /// Convenience constructor for transports reporting a plain message
    pub fn rejected(message: impl Into<String>) -> Self {
        TransportError::Rejected(message.into())
    }
}

/// Errors of the enhanced JSON codec.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("expected an argument array, got {0}")]
    NotAnArray(&'static str),

    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
}
