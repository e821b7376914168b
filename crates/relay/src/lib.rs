//! Signaling relay for deskbridge
//!
//! A WebSocket rendezvous service: it registers clients, matches them into
//! rooms, relays `offer`/`answer`/`ice-candidate` envelopes between room
//! members, and evicts clients that stop heartbeating. Room state lives in a
//! single in-memory [`registry::Registry`]; the relay never carries media or
//! control traffic.
//!
//! # Example
//!
//! ```no_run
//! use deskbridge_relay::{RelayConfig, RelayServer};
//!
//! # async fn example() -> deskbridge_relay::Result<()> {
//! let server = RelayServer::new(RelayConfig::default().with_bind_addr("127.0.0.1:0"))?;
//! let handle = server.start().await?;
//! println!("relay at {}", handle.url());
//! handle.shutdown().await;
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod registry;
pub mod server;
pub mod state;

mod handler;

pub use config::RelayConfig;
pub use error::{Error, Result};
pub use registry::Registry;
pub use server::{RelayHandle, RelayServer};
pub use state::RelayState;

/// Get the version of this crate
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
