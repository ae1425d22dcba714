//! Error type for the link crate.

/// Errors surfaced by the link.
///
/// None of these are fatal to the process. Transport failures feed the
/// reconnect path, decode failures drop a single frame, and send failures
/// are reported to the caller as `false`.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    /// The transport could not even construct a socket for the endpoint.
    #[error("invalid endpoint {endpoint}: {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },

    /// An inbound frame was not a JSON object of the expected shape.
    #[error("malformed frame: {0}")]
    MalformedFrame(#[from] serde_json::Error),

    /// An inbound frame exceeded the configured size limit.
    #[error("frame too large ({size} bytes, limit {limit})")]
    FrameTooLarge { size: usize, limit: usize },

    /// An outbound message could not be serialized.
    #[error("failed to encode outbound message: {0}")]
    Encode(String),

    /// The transport rejected an outbound frame.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// The runtime event loop is gone.
    #[error("link runtime has shut down")]
    RuntimeClosed,
}

pub type Result<T> = std::result::Result<T, LinkError>;
