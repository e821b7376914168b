//! Relay server binary entry point
//!
//! # Usage
//!
//! ```bash
//! # Start on the default port
//! cargo run --bin relay_server
//!
//! # Bind elsewhere, tighten the heartbeat, require join HMACs
//! cargo run --bin relay_server -- \
//!   --bind 0.0.0.0:9030 \
//!   --heartbeat-timeout-secs 20 \
//!   --room-secret my-shared-secret
//! ```

use clap::Parser;
use deskbridge_relay::{RelayConfig, RelayServer};
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// deskbridge signaling relay
///
/// Matches peers into rooms and relays session negotiation envelopes between
/// them. Carries no media or control traffic.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Socket address to bind
    #[arg(long, default_value = "0.0.0.0:9030", env = "DESKBRIDGE_RELAY_BIND")]
    bind: String,

    /// Seconds of silence before a client is treated as disconnected
    #[arg(long, default_value_t = 30, env = "DESKBRIDGE_HEARTBEAT_TIMEOUT")]
    heartbeat_timeout_secs: u64,

    /// Maximum members per room
    #[arg(long, default_value_t = 8, env = "DESKBRIDGE_MAX_ROOM_MEMBERS")]
    max_room_members: usize,

    /// Shared secret for join-room HMACs; joins without a valid HMAC are
    /// refused when set
    #[arg(long, env = "DESKBRIDGE_ROOM_SECRET")]
    room_secret: Option<String>,

    /// Token signing key; a random per-run key is used when absent
    #[arg(long, env = "DESKBRIDGE_TOKEN_KEY")]
    token_key: Option<String>,

    /// Lifetime of issued tokens in seconds
    #[arg(long, default_value_t = 12 * 60 * 60, env = "DESKBRIDGE_TOKEN_TTL")]
    token_ttl_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let mut config = RelayConfig::default()
        .with_bind_addr(args.bind)
        .with_heartbeat_timeout(Duration::from_secs(args.heartbeat_timeout_secs));
    config.room_settings.max_members = args.max_room_members;
    config.token_ttl_secs = args.token_ttl_secs;
    if let Some(secret) = args.room_secret {
        config = config.with_room_secret(secret.into_bytes());
    }
    if let Some(key) = args.token_key {
        config = config.with_token_key(key.into_bytes());
    }

    let handle = RelayServer::new(config)?.start().await?;
    info!("Relay ready at {}", handle.url());

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    handle.shutdown().await;

    Ok(())
}
