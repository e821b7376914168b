//! Peer-side session stack for deskbridge
//!
//! Everything between the relay connection and the presentation layer: the
//! signaling client, the per-peer negotiation state machine over WebRTC, the
//! secure control-channel multiplexer (input, clipboard, file transfer,
//! presence), and the health monitor that turns degradation into recovery.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │  Session                                             │
//! │  ├─ SignalingClient (envelopes over WebSocket)       │
//! │  ├─ Negotiator per peer (offer/answer/ICE, glare,    │
//! │  │   bounded renegotiation)                          │
//! │  │   └─ Multiplexer (sealed control messages on the  │
//! │  │       ordered data channel)                       │
//! │  └─ HealthMonitor per peer (quality → recovery)      │
//! │     ↓ SessionEvent channel                           │
//! │  presentation / capture collaborators                │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use deskbridge_session::{Session, SessionConfig};
//! use deskbridge_session::collaborators::FsSink;
//! use std::sync::Arc;
//!
//! # async fn example() -> deskbridge_session::Result<()> {
//! let config = SessionConfig::default();
//! let (session, mut events) = Session::new(config, Arc::new(FsSink::new("downloads")))?;
//!
//! session.connect().await?;
//! let room = session.create_room(Some("room-1".to_string())).await?;
//! println!("hosting {}", room);
//!
//! while let Some(event) = events.recv().await {
//!     println!("{:?}", event);
//! }
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]

pub mod backoff;
pub mod channel;
pub mod collaborators;
pub mod config;
pub mod error;
pub mod events;
pub mod health;
pub mod negotiator;
pub mod session;
pub mod signaling;

pub use backoff::ReconnectPolicy;
pub use channel::Multiplexer;
pub use collaborators::{FsSink, MediaSource, MemorySink, StorageSink};
pub use config::{ChannelConfig, HealthConfig, NegotiationConfig, SessionConfig, TurnServerConfig};
pub use error::{Error, Result};
pub use events::{EventReceiver, SessionEvent, TransferUpdate};
pub use health::{ConnectionQuality, HealthMonitor, QualityReport, QualitySample};
pub use negotiator::{NegotiationState, Negotiator};
pub use session::Session;
pub use signaling::SignalingClient;

/// Get the version of this crate
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
