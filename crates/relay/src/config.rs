//! Relay configuration

use deskbridge_core::protocol::RoomSettings;
use std::net::SocketAddr;
use std::time::Duration;

use crate::error::{Error, Result};

/// Configuration for the relay server
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Socket address to bind
    pub bind_addr: String,

    /// A client silent for longer than this is treated as disconnected
    pub heartbeat_timeout: Duration,

    /// How often the sweeper looks for silent clients
    pub sweep_interval: Duration,

    /// Settings applied to newly created rooms
    pub room_settings: RoomSettings,

    /// Secret for `join-room` HMACs; when set, joins without a valid HMAC
    /// are refused
    pub room_secret: Option<Vec<u8>>,

    /// Key for signing issued tokens; a random key is generated at startup
    /// when absent (tokens then do not survive a relay restart)
    pub token_key: Option<Vec<u8>>,

    /// Lifetime of issued tokens in seconds
    pub token_ttl_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:9030".to_string(),
            heartbeat_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(5),
            room_settings: RoomSettings::default(),
            room_secret: None,
            token_key: None,
            token_ttl_secs: deskbridge_core::auth::DEFAULT_TOKEN_TTL_SECS,
        }
    }
}

impl RelayConfig {
    /// Validate configuration parameters
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `bind_addr` is not a valid socket address
    /// - `heartbeat_timeout` or `sweep_interval` is zero
    /// - `sweep_interval` is not shorter than `heartbeat_timeout`
    /// - `room_settings.max_members` is below 2
    pub fn validate(&self) -> Result<()> {
        if self.bind_addr.parse::<SocketAddr>().is_err() {
            return Err(Error::InvalidConfig(format!(
                "bind_addr is not a socket address: {}",
                self.bind_addr
            )));
        }

        if self.heartbeat_timeout.is_zero() {
            return Err(Error::InvalidConfig(
                "heartbeat_timeout must be non-zero".to_string(),
            ));
        }

        if self.sweep_interval.is_zero() || self.sweep_interval >= self.heartbeat_timeout {
            return Err(Error::InvalidConfig(format!(
                "sweep_interval must be non-zero and shorter than heartbeat_timeout ({:?} vs {:?})",
                self.sweep_interval, self.heartbeat_timeout
            )));
        }

        if self.room_settings.max_members < 2 {
            return Err(Error::InvalidConfig(format!(
                "max_members must be at least 2, got {}",
                self.room_settings.max_members
            )));
        }

        Ok(())
    }

    /// Set the bind address
    pub fn with_bind_addr(mut self, addr: impl Into<String>) -> Self {
        self.bind_addr = addr.into();
        self
    }

    /// Set the heartbeat timeout and a proportionate sweep interval
    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = timeout;
        self.sweep_interval = (timeout / 4).max(Duration::from_millis(50));
        self
    }

    /// Require join HMACs keyed by `secret`
    pub fn with_room_secret(mut self, secret: impl Into<Vec<u8>>) -> Self {
        self.room_secret = Some(secret.into());
        self
    }

    /// Sign tokens with `key` instead of a startup-generated one
    pub fn with_token_key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.token_key = Some(key.into());
        self
    }
}
