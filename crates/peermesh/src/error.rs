//! Error types for the mesh orchestrator

/// Result type alias using the mesh Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while orchestrating peer sessions
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid configuration parameter
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Signaling bus or bridge error
    #[error("Signaling error: {0}")]
    SignalingError(String),

    /// Inbound signal could not be parsed into a known kind
    #[error("Malformed signal from {sender}: {reason}")]
    MalformedSignal {
        /// Peer that sent the signal
        sender: String,
        /// Why parsing failed
        reason: String,
    },

    /// Peer not found
    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    /// Session store is full
    #[error("Maximum peer limit reached ({0})")]
    PeerLimitReached(u32),

    /// Session was closed while an operation was in flight
    #[error("Session closed: {0}")]
    SessionClosed(String),

    /// Context is not ready to admit connect requests
    #[error("Context not ready: {0}")]
    ContextNotReady(String),

    /// Description generation or application failed
    #[error("SDP negotiation error: {0}")]
    SdpError(String),

    /// Offer was not answered in time
    #[error("Negotiation with {peer_id} timed out after {timeout_ms}ms")]
    NegotiationTimeout {
        /// Remote peer
        peer_id: String,
        /// Configured timeout
        timeout_ms: u64,
    },

    /// ICE candidate error
    #[error("ICE candidate error: {0}")]
    IceCandidateError(String),

    /// Data channel error
    #[error("Data channel error: {0}")]
    DataChannelError(String),

    /// Media track error
    #[error("Media track error: {0}")]
    MediaTrackError(String),

    /// Track constraint could not be applied
    #[error("Constraint error: {0}")]
    ConstraintError(String),

    /// One or more sessions failed during a fan-out operation
    #[error("{operation} failed on {failed} of {total} sessions; first failure: {first}")]
    Fanout {
        /// Operation name, e.g. "add_stream"
        operation: &'static str,
        /// Number of sessions that failed
        failed: usize,
        /// Number of sessions attempted
        total: usize,
        /// First failure message
        first: String,
    },

    /// Operation timeout
    #[error("Operation timeout: {0}")]
    OperationTimeout(String),

    /// Object is in the wrong lifecycle state for the call
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// WebSocket error
    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// WebRTC library error
    #[error("WebRTC error: {0}")]
    WebRtcError(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Any other error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::SerializationError(e.to_string())
    }
}

impl Error {
    /// Whether re-issuing the triggering event may succeed
    ///
    /// These leave the session in a non-terminal state.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::SignalingError(_)
                | Error::SdpError(_)
                | Error::NegotiationTimeout { .. }
                | Error::OperationTimeout(_)
                | Error::WebSocketError(_)
                | Error::IoError(_)
        )
    }

    /// Whether the error is scoped to one peer session
    pub fn is_session_error(&self) -> bool {
        matches!(
            self,
            Error::PeerNotFound(_)
                | Error::PeerLimitReached(_)
                | Error::SessionClosed(_)
                | Error::IceCandidateError(_)
                | Error::SdpError(_)
                | Error::NegotiationTimeout { .. }
        )
    }
}
