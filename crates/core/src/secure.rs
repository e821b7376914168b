//! Secure envelope sealing for the control channel
//!
//! When encryption is configured, the canonical payload is encrypted with
//! ChaCha20-Poly1305 under a fresh random 96-bit nonce per message; the nonce
//! is transmitted alongside the ciphertext and never reused. When signing is
//! configured, an HMAC-SHA256 over the canonical payload is attached and
//! verified before dispatch. A message that fails verification is dropped
//! whole; it is never delivered to sub-handlers.
//!
//! `file_header` metadata is always sent in the clear (even with encryption
//! active) so a receiver can identify an incoming transfer; it is still
//! signed when signing is configured.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use crate::control::ControlMessage;
use crate::error::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

const NONCE_LEN: usize = 12;

/// Security configuration for one control channel
///
/// Passed explicitly into the negotiator and multiplexer at construction.
/// Both features default to off; a disabled codec passes messages through as
/// plain JSON.
#[derive(Clone, Default)]
pub struct SecurityConfig {
    encryption_key: Option<[u8; 32]>,
    signing_key: Option<Vec<u8>>,
}

impl SecurityConfig {
    /// Configuration with neither encryption nor signing
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Enable payload encryption with a 256-bit key
    pub fn with_encryption(mut self, key: [u8; 32]) -> Self {
        self.encryption_key = Some(key);
        self
    }

    /// Enable payload signing with a shared secret
    pub fn with_signing(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.signing_key = Some(key.into());
        self
    }

    /// Whether payload encryption is configured
    pub fn encryption_enabled(&self) -> bool {
        self.encryption_key.is_some()
    }

    /// Whether payload signing is configured
    pub fn signing_enabled(&self) -> bool {
        self.signing_key.is_some()
    }

    /// Generate a fresh random encryption key
    pub fn generate_key() -> [u8; 32] {
        let mut key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut key);
        key
    }
}

impl std::fmt::Debug for SecurityConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityConfig")
            .field("encryption", &self.encryption_enabled())
            .field("signing", &self.signing_enabled())
            .finish()
    }
}

/// Seals and opens control messages according to a [`SecurityConfig`]
pub struct EnvelopeCodec {
    config: SecurityConfig,
}

impl EnvelopeCodec {
    /// Create a codec for the given configuration
    pub fn new(config: SecurityConfig) -> Self {
        Self { config }
    }

    /// The configuration this codec was built with
    pub fn config(&self) -> &SecurityConfig {
        &self.config
    }

    /// Serialize a message to its wire form, encrypting and signing as
    /// configured
    pub fn seal(&self, msg: &ControlMessage) -> Result<Vec<u8>> {
        let canonical = canonical_bytes(msg)?;
        let hmac = match &self.config.signing_key {
            Some(key) => Some(sign(key, &canonical)?),
            None => None,
        };

        match self.config.encryption_key {
            Some(key) if msg.encryptable() => {
                let mut nonce_bytes = [0u8; NONCE_LEN];
                rand::thread_rng().fill_bytes(&mut nonce_bytes);
                let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
                let ciphertext = cipher
                    .encrypt(Nonce::from_slice(&nonce_bytes), canonical.as_slice())
                    .map_err(|_| Error::Encryption("Payload encryption failed".to_string()))?;

                let mut frame = serde_json::Map::new();
                frame.insert(
                    "iv".to_string(),
                    serde_json::Value::String(BASE64.encode(nonce_bytes)),
                );
                frame.insert(
                    "ciphertext".to_string(),
                    serde_json::Value::String(BASE64.encode(&ciphertext)),
                );
                if let Some(mac) = hmac {
                    frame.insert("hmac".to_string(), serde_json::Value::String(mac));
                }
                serde_json::to_vec(&serde_json::Value::Object(frame))
                    .map_err(|e| Error::Serialization(format!("Failed to serialize frame: {}", e)))
            }
            _ => {
                let mut value: serde_json::Value = serde_json::from_slice(&canonical)
                    .map_err(|e| Error::Serialization(format!("Canonical form invalid: {}", e)))?;
                if let (Some(mac), Some(obj)) = (hmac, value.as_object_mut()) {
                    obj.insert("hmac".to_string(), serde_json::Value::String(mac));
                }
                serde_json::to_vec(&value)
                    .map_err(|e| Error::Serialization(format!("Failed to serialize frame: {}", e)))
            }
        }
    }

    /// Parse a wire frame back into a message, verifying its signature and
    /// decrypting as configured
    pub fn open(&self, bytes: &[u8]) -> Result<ControlMessage> {
        let mut value: serde_json::Value = serde_json::from_slice(bytes)
            .map_err(|e| Error::Serialization(format!("Malformed frame: {}", e)))?;
        let obj = value
            .as_object_mut()
            .ok_or_else(|| Error::Serialization("Frame is not an object".to_string()))?;

        let presented_mac = obj
            .remove("hmac")
            .and_then(|v| v.as_str().map(str::to_string));

        let canonical = if obj.contains_key("ciphertext") {
            let key = self
                .config
                .encryption_key
                .as_ref()
                .ok_or(Error::Decryption)?;
            let nonce = obj
                .get("iv")
                .and_then(|v| v.as_str())
                .and_then(|s| BASE64.decode(s).ok())
                .ok_or(Error::Decryption)?;
            if nonce.len() != NONCE_LEN {
                return Err(Error::Decryption);
            }
            let ciphertext = obj
                .get("ciphertext")
                .and_then(|v| v.as_str())
                .and_then(|s| BASE64.decode(s).ok())
                .ok_or(Error::Decryption)?;

            let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
            cipher
                .decrypt(Nonce::from_slice(&nonce), ciphertext.as_slice())
                .map_err(|_| Error::Decryption)?
        } else {
            serde_json::to_vec(&value)
                .map_err(|e| Error::Serialization(format!("Canonical form invalid: {}", e)))?
        };

        if let Some(key) = &self.config.signing_key {
            let presented = presented_mac.ok_or(Error::SignatureMismatch)?;
            verify(key, &canonical, &presented)?;
        }

        serde_json::from_slice(&canonical)
            .map_err(|e| Error::Serialization(format!("Malformed control message: {}", e)))
    }
}

/// Canonical payload bytes: JSON with object keys in sorted order, so both
/// ends sign and verify identical bytes
fn canonical_bytes(msg: &ControlMessage) -> Result<Vec<u8>> {
    let value = serde_json::to_value(msg)
        .map_err(|e| Error::Serialization(format!("Failed to serialize message: {}", e)))?;
    serde_json::to_vec(&value)
        .map_err(|e| Error::Serialization(format!("Failed to serialize message: {}", e)))
}

fn sign(key: &[u8], payload: &[u8]) -> Result<String> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|e| Error::Encryption(format!("Invalid signing key: {}", e)))?;
    mac.update(payload);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

fn verify(key: &[u8], payload: &[u8], presented: &str) -> Result<()> {
    let presented = hex::decode(presented).map_err(|_| Error::SignatureMismatch)?;
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|e| Error::Encryption(format!("Invalid signing key: {}", e)))?;
    mac.update(payload);
    mac.verify_slice(&presented)
        .map_err(|_| Error::SignatureMismatch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::{ControlMessage, MouseAction};

    fn mouse_move() -> ControlMessage {
        ControlMessage::Mouse {
            action: MouseAction::Move,
            x: Some(10),
            y: Some(20),
            delta_x: None,
            delta_y: None,
            button: None,
            monitor: None,
        }
    }

    fn header() -> ControlMessage {
        ControlMessage::FileHeader {
            id: "t-1".to_string(),
            name: "notes.txt".to_string(),
            mime: "text/plain".to_string(),
            size: 11,
            sha256: None,
        }
    }

    #[test]
    fn test_plain_roundtrip() {
        let codec = EnvelopeCodec::new(SecurityConfig::disabled());
        let wire = codec.seal(&mouse_move()).unwrap();
        assert_eq!(codec.open(&wire).unwrap(), mouse_move());
    }

    #[test]
    fn test_signed_roundtrip() {
        let codec = EnvelopeCodec::new(SecurityConfig::disabled().with_signing(b"sig".to_vec()));
        let wire = codec.seal(&mouse_move()).unwrap();
        assert!(std::str::from_utf8(&wire).unwrap().contains("hmac"));
        assert_eq!(codec.open(&wire).unwrap(), mouse_move());
    }

    #[test]
    fn test_encrypted_roundtrip() {
        let key = SecurityConfig::generate_key();
        let codec = EnvelopeCodec::new(SecurityConfig::disabled().with_encryption(key));
        let wire = codec.seal(&mouse_move()).unwrap();

        let text = std::str::from_utf8(&wire).unwrap();
        assert!(text.contains("ciphertext"));
        assert!(text.contains("iv"));
        assert!(!text.contains("mouse"));

        assert_eq!(codec.open(&wire).unwrap(), mouse_move());
    }

    #[test]
    fn test_encrypted_and_signed_roundtrip() {
        let key = SecurityConfig::generate_key();
        let config = SecurityConfig::disabled()
            .with_encryption(key)
            .with_signing(b"sig".to_vec());
        let codec = EnvelopeCodec::new(config);
        let wire = codec.seal(&mouse_move()).unwrap();
        assert_eq!(codec.open(&wire).unwrap(), mouse_move());
    }

    #[test]
    fn test_file_header_stays_plaintext() {
        let key = SecurityConfig::generate_key();
        let codec = EnvelopeCodec::new(SecurityConfig::disabled().with_encryption(key));
        let wire = codec.seal(&header()).unwrap();

        let text = std::str::from_utf8(&wire).unwrap();
        assert!(text.contains("notes.txt"));
        assert!(!text.contains("ciphertext"));
        assert_eq!(codec.open(&wire).unwrap(), header());
    }

    #[test]
    fn test_nonce_is_fresh_per_message() {
        let key = SecurityConfig::generate_key();
        let codec = EnvelopeCodec::new(SecurityConfig::disabled().with_encryption(key));
        let a = codec.seal(&mouse_move()).unwrap();
        let b = codec.seal(&mouse_move()).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_tampered_ciphertext_rejected() {
        let key = SecurityConfig::generate_key();
        let codec = EnvelopeCodec::new(SecurityConfig::disabled().with_encryption(key));
        let wire = codec.seal(&mouse_move()).unwrap();

        let mut value: serde_json::Value = serde_json::from_slice(&wire).unwrap();
        value["ciphertext"] = serde_json::Value::String(BASE64.encode(b"garbage"));
        let tampered = serde_json::to_vec(&value).unwrap();

        assert!(matches!(codec.open(&tampered), Err(Error::Decryption)));
    }

    #[test]
    fn test_tampered_signature_rejected() {
        let codec = EnvelopeCodec::new(SecurityConfig::disabled().with_signing(b"sig".to_vec()));
        let wire = codec.seal(&mouse_move()).unwrap();

        let mut value: serde_json::Value = serde_json::from_slice(&wire).unwrap();
        value["hmac"] = serde_json::Value::String("00".repeat(32));
        let tampered = serde_json::to_vec(&value).unwrap();

        assert!(matches!(
            codec.open(&tampered),
            Err(Error::SignatureMismatch)
        ));
    }

    #[test]
    fn test_missing_signature_rejected_when_signing_enabled() {
        let plain = EnvelopeCodec::new(SecurityConfig::disabled());
        let signing = EnvelopeCodec::new(SecurityConfig::disabled().with_signing(b"sig".to_vec()));

        let wire = plain.seal(&mouse_move()).unwrap();
        assert!(matches!(
            signing.open(&wire),
            Err(Error::SignatureMismatch)
        ));
    }

    #[test]
    fn test_encrypted_frame_without_key_rejected() {
        let key = SecurityConfig::generate_key();
        let sealing = EnvelopeCodec::new(SecurityConfig::disabled().with_encryption(key));
        let plain = EnvelopeCodec::new(SecurityConfig::disabled());

        let wire = sealing.seal(&mouse_move()).unwrap();
        assert!(matches!(plain.open(&wire), Err(Error::Decryption)));
    }
}
