//! Error types for the relay

/// Result type alias using the relay Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while registering clients, managing rooms, and
/// routing envelopes
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid configuration parameter
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Presented token or HMAC failed validation
    #[error("Authorization failed: {0}")]
    AuthFailed(String),

    /// No live room with the requested id
    #[error("Room not found: {0}")]
    RoomNotFound(String),

    /// Requested room id is already live
    #[error("Room conflict: {0}")]
    RoomConflict(String),

    /// Room is at its membership limit
    #[error("Room full: {0}")]
    RoomFull(String),

    /// No connected client with the given id
    #[error("Client not found: {0}")]
    ClientNotFound(String),

    /// Frame could not be parsed as a signaling envelope
    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// WebSocket transport error
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Protocol or crypto error from the core types
    #[error(transparent)]
    Core(#[from] deskbridge_core::Error),
}

impl Error {
    /// Whether this failure must be reported as `unauthorized` and must not
    /// mutate room state
    pub fn is_unauthorized(&self) -> bool {
        match self {
            Error::AuthFailed(_) => true,
            Error::Core(e) => e.is_security(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::RoomNotFound("room-1".to_string());
        assert_eq!(err.to_string(), "Room not found: room-1");
    }

    #[test]
    fn test_is_unauthorized() {
        assert!(Error::AuthFailed("expired".to_string()).is_unauthorized());
        assert!(Error::Core(deskbridge_core::Error::TokenExpired).is_unauthorized());
        assert!(!Error::RoomConflict("room-1".to_string()).is_unauthorized());
    }
}
