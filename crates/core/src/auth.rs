//! Authorization claims, compact tokens, and PKCE primitives
//!
//! The relay issues a signed claim at registration and validates it on every
//! privileged room operation. Tokens are compact HMAC-SHA256 pairs:
//! `base64url(claim_json) "." base64url(mac)`. An expired or
//! session-mismatched claim is never honored.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{Error, Result};
use crate::protocol::PeerRole;

type HmacSha256 = Hmac<Sha256>;

/// Default claim lifetime: 12 hours
pub const DEFAULT_TOKEN_TTL_SECS: u64 = 12 * 60 * 60;

/// A right granted to a claim subject
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Right {
    /// May create rooms
    CreateRoom,
    /// May join rooms
    JoinRoom,
    /// May attach a media source
    Share,
    /// May send input events
    Input,
}

/// A verified, time-bounded statement of a subject's identity and rights
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claim {
    /// Subject (client) id the claim was issued to
    pub subject: String,

    /// Relay session the claim is bound to
    pub session_id: String,

    /// Role the subject registered with
    pub role: PeerRole,

    /// Granted rights
    pub rights: Vec<Right>,

    /// Issue time, seconds since the Unix epoch
    pub issued_at: u64,

    /// Expiry time, seconds since the Unix epoch
    pub expires_at: u64,
}

impl Claim {
    /// Whether the claim has expired as of `now` (epoch seconds)
    pub fn is_expired_at(&self, now: u64) -> bool {
        now >= self.expires_at
    }

    /// Whether the claim grants `right`
    pub fn allows(&self, right: Right) -> bool {
        self.rights.contains(&right)
    }
}

/// Rights granted to a role at registration
pub fn rights_for_role(role: PeerRole) -> Vec<Right> {
    match role {
        PeerRole::Host => vec![Right::CreateRoom, Right::JoinRoom, Right::Share, Right::Input],
        PeerRole::Viewer => vec![Right::JoinRoom, Right::Input],
    }
}

/// Token issuance and validation
///
/// The relay holds an implementation of this; the in-tree one is
/// [`Hs256Issuer`]. Validation errors map onto the security taxonomy and are
/// never retried.
pub trait TokenIssuer: Send + Sync {
    /// Issue a token for `subject` bound to `session_id`
    fn issue(&self, subject: &str, session_id: &str, role: PeerRole) -> Result<String>;

    /// Validate a token and return its claim
    fn validate(&self, token: &str) -> Result<Claim>;
}

/// HMAC-SHA256 token issuer
pub struct Hs256Issuer {
    key: Vec<u8>,
    ttl_secs: u64,
}

impl Hs256Issuer {
    /// Create an issuer with the default TTL
    pub fn new(key: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            ttl_secs: DEFAULT_TOKEN_TTL_SECS,
        }
    }

    /// Override the claim lifetime
    pub fn with_ttl_secs(mut self, ttl_secs: u64) -> Self {
        self.ttl_secs = ttl_secs;
        self
    }

    fn mac(&self, payload: &[u8]) -> Result<Vec<u8>> {
        let mut mac = HmacSha256::new_from_slice(&self.key)
            .map_err(|e| Error::Encryption(format!("Invalid signing key: {}", e)))?;
        mac.update(payload);
        Ok(mac.finalize().into_bytes().to_vec())
    }
}

impl TokenIssuer for Hs256Issuer {
    fn issue(&self, subject: &str, session_id: &str, role: PeerRole) -> Result<String> {
        let now = now_secs();
        let claim = Claim {
            subject: subject.to_string(),
            session_id: session_id.to_string(),
            role,
            rights: rights_for_role(role),
            issued_at: now,
            expires_at: now + self.ttl_secs,
        };

        let payload = serde_json::to_vec(&claim)
            .map_err(|e| Error::Serialization(format!("Failed to serialize claim: {}", e)))?;
        let encoded = URL_SAFE_NO_PAD.encode(&payload);
        let mac = self.mac(encoded.as_bytes())?;

        Ok(format!("{}.{}", encoded, URL_SAFE_NO_PAD.encode(mac)))
    }

    fn validate(&self, token: &str) -> Result<Claim> {
        let (payload, mac) = token
            .split_once('.')
            .ok_or_else(|| Error::TokenInvalid("Missing signature segment".to_string()))?;

        let mac_bytes = URL_SAFE_NO_PAD
            .decode(mac)
            .map_err(|_| Error::TokenInvalid("Signature is not base64url".to_string()))?;

        let mut verifier = HmacSha256::new_from_slice(&self.key)
            .map_err(|e| Error::Encryption(format!("Invalid signing key: {}", e)))?;
        verifier.update(payload.as_bytes());
        verifier
            .verify_slice(&mac_bytes)
            .map_err(|_| Error::SignatureMismatch)?;

        let claim_bytes = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|_| Error::TokenInvalid("Payload is not base64url".to_string()))?;
        let claim: Claim = serde_json::from_slice(&claim_bytes)
            .map_err(|e| Error::TokenInvalid(format!("Malformed claim: {}", e)))?;

        if claim.is_expired_at(now_secs()) {
            return Err(Error::TokenExpired);
        }

        Ok(claim)
    }
}

/// Validate a token and additionally bind it to an expected session
pub fn validate_for_session(
    issuer: &dyn TokenIssuer,
    token: &str,
    session_id: &str,
) -> Result<Claim> {
    let claim = issuer.validate(token)?;
    if claim.session_id != session_id {
        return Err(Error::ClaimMismatch(format!(
            "Claim bound to session {}, presented for {}",
            claim.session_id, session_id
        )));
    }
    Ok(claim)
}

/// HMAC over a room id keyed by the room secret, hex-encoded
///
/// Attached to `join-room` when signing is enabled; the relay refuses the
/// join without mutating membership when verification fails.
pub fn room_hmac(key: &[u8], room_id: &str, client_id: &str) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| Error::Encryption(format!("Invalid room key: {}", e)))?;
    mac.update(room_id.as_bytes());
    mac.update(b"\x00");
    mac.update(client_id.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Verify a hex-encoded room HMAC in constant time
pub fn verify_room_hmac(key: &[u8], room_id: &str, client_id: &str, hmac: &str) -> Result<()> {
    let presented = hex::decode(hmac).map_err(|_| Error::SignatureMismatch)?;
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| Error::Encryption(format!("Invalid room key: {}", e)))?;
    mac.update(room_id.as_bytes());
    mac.update(b"\x00");
    mac.update(client_id.as_bytes());
    mac.verify_slice(&presented)
        .map_err(|_| Error::SignatureMismatch)
}

/// PKCE code-challenge strategy
///
/// Both standard methods are implemented behind one interface; the method is
/// chosen once at startup by [`CodeChallengeMethod::select`] and the chosen
/// strategy object is passed to whoever needs it. Business logic never
/// branches on the method inline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeChallengeMethod {
    /// SHA-256 challenge (preferred)
    S256,
    /// Verifier sent verbatim (fallback when a digest is unavailable)
    Plain,
}

// SHA-256 of the ASCII string "deskbridge-pkce-probe"
const PKCE_PROBE_DIGEST: &str =
    "050f4381bcce283249bbd28b72194e604aeb0bfd81a52813fd88f4d0197ad785";

impl CodeChallengeMethod {
    /// Probe digest availability once and pick the strongest method
    pub fn select() -> Self {
        let digest = hex::encode(Sha256::digest(b"deskbridge-pkce-probe"));
        if digest == PKCE_PROBE_DIGEST {
            CodeChallengeMethod::S256
        } else {
            CodeChallengeMethod::Plain
        }
    }

    /// Wire name of the method
    pub fn as_str(&self) -> &'static str {
        match self {
            CodeChallengeMethod::S256 => "S256",
            CodeChallengeMethod::Plain => "plain",
        }
    }

    /// Derive the challenge for a verifier
    pub fn challenge(&self, verifier: &str) -> String {
        match self {
            CodeChallengeMethod::S256 => {
                URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
            }
            CodeChallengeMethod::Plain => verifier.to_string(),
        }
    }

    /// Check a verifier against a previously issued challenge
    pub fn verify(&self, verifier: &str, challenge: &str) -> bool {
        self.challenge(verifier) == challenge
    }
}

/// Generate a random PKCE verifier (43 base64url characters)
pub fn generate_verifier() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Current time, seconds since the Unix epoch
fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
