//! Error types shared by the protocol and crypto primitives

/// Result type alias using the core Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by protocol (de)serialization and the security primitives
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Envelope or control message failed to (de)serialize
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Token is malformed or carries a bad signature
    #[error("Token invalid: {0}")]
    TokenInvalid(String),

    /// Token is past its expiry
    #[error("Token expired")]
    TokenExpired,

    /// Claim does not match the session it was presented for
    #[error("Claim mismatch: {0}")]
    ClaimMismatch(String),

    /// HMAC verification failed
    #[error("Signature mismatch")]
    SignatureMismatch,

    /// Payload encryption failed
    #[error("Encryption error: {0}")]
    Encryption(String),

    /// Payload could not be decrypted (wrong key or corrupted data)
    #[error("Decryption failed")]
    Decryption,
}

impl Error {
    /// Check if this error is a security failure (never retried, never
    /// partially applied)
    pub fn is_security(&self) -> bool {
        matches!(
            self,
            Error::TokenInvalid(_)
                | Error::TokenExpired
                | Error::ClaimMismatch(_)
                | Error::SignatureMismatch
                | Error::Decryption
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::TokenInvalid("truncated".to_string());
        assert_eq!(err.to_string(), "Token invalid: truncated");
    }

    #[test]
    fn test_is_security() {
        assert!(Error::SignatureMismatch.is_security());
        assert!(Error::TokenExpired.is_security());
        assert!(!Error::Serialization("bad json".to_string()).is_security());
    }
}
