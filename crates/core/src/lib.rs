//! Core protocol types for deskbridge
//!
//! This crate holds everything both sides of a session agree on and nothing
//! else: the signaling envelope exchanged over the relay, the control-channel
//! message set, authorization claims and compact tokens, and the secure
//! envelope codec. It performs no I/O.
//!
//! # Example
//!
//! ```
//! use deskbridge_core::protocol::Envelope;
//!
//! let msg = Envelope::CreateRoom {
//!     room_id: Some("room-1".to_string()),
//!     token: "tok".to_string(),
//! };
//! let json = msg.to_json().unwrap();
//! assert_eq!(Envelope::from_json(&json).unwrap(), msg);
//! ```

#![warn(clippy::all)]

pub mod auth;
pub mod control;
pub mod error;
pub mod protocol;
pub mod secure;

pub use auth::{Claim, CodeChallengeMethod, Hs256Issuer, Right, TokenIssuer};
pub use control::{ClipboardEntry, ControlMessage};
pub use error::{Error, Result};
pub use protocol::{ClientId, Envelope, PeerRole, RoomId, RoomSettings};
pub use secure::{EnvelopeCodec, SecurityConfig};

/// Get the version of this crate
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
