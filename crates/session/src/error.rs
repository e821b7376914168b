//! Error types for the session stack

/// Result type alias using the session Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while negotiating, multiplexing, and supervising a
/// session
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid configuration parameter
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Relay connection or signaling protocol error
    #[error("Signaling error: {0}")]
    Signaling(String),

    /// Relay refused an operation as unauthorized
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Relay reported a room failure (not found, conflict, full)
    #[error("Room error: {0}")]
    Room(String),

    /// Remote or local session description was rejected
    #[error("Description rejected: {0}")]
    DescriptionRejected(String),

    /// ICE candidate was rejected
    #[error("Candidate rejected: {0}")]
    CandidateRejected(String),

    /// A negotiation step did not finish in time
    #[error("Negotiation timeout: {0}")]
    NegotiationTimeout(String),

    /// Simultaneous offers; the lexically smaller client id wins
    #[error("Offer glare: {0}")]
    Glare(String),

    /// Renegotiation budget exhausted; the session is closed
    #[error("Retries exhausted: {0}")]
    RetriesExhausted(String),

    /// Control data channel failure
    #[error("Data channel error: {0}")]
    DataChannel(String),

    /// Frame referenced a transfer this side has no record of
    #[error("Unknown transfer: {0}")]
    UnknownTransfer(String),

    /// Payload exceeds a configured size limit
    #[error("Size limit exceeded: {size} > {limit}")]
    SizeLimitExceeded {
        /// Offered size in bytes
        size: u64,
        /// Configured limit in bytes
        limit: u64,
    },

    /// Payload matches the configured denylist
    #[error("Rejected by policy: {0}")]
    PolicyRejected(String),

    /// Transfer stalled without a `file_end`; partial state was discarded
    #[error("Transfer timed out: {0}")]
    TransferTimeout(String),

    /// Reassembled bytes do not match the announced digest
    #[error("Checksum mismatch: {0}")]
    ChecksumMismatch(String),

    /// Media track error
    #[error("Media track error: {0}")]
    MediaTrack(String),

    /// Storage sink failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// WebRTC library error
    #[error("WebRTC error: {0}")]
    WebRtc(String),

    /// Protocol or crypto error from the core types
    #[error(transparent)]
    Core(#[from] deskbridge_core::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Any other error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Whether local recovery (backoff, renegotiation) may retry after this
    /// error
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Signaling(_)
                | Error::NegotiationTimeout(_)
                | Error::WebRtc(_)
                | Error::Io(_)
        )
    }

    /// Whether this is a security failure: dropped whole, never retried
    pub fn is_security(&self) -> bool {
        match self {
            Error::Unauthorized(_) => true,
            Error::Core(e) => e.is_security(),
            _ => false,
        }
    }
}
