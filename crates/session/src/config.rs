//! Session configuration

use deskbridge_core::protocol::PeerRole;
use deskbridge_core::secure::SecurityConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::backoff::ReconnectPolicy;
use crate::error::{Error, Result};

/// TURN server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnServerConfig {
    /// TURN server URL (turn:// or turns://)
    pub url: String,

    /// Username for TURN authentication
    pub username: String,

    /// Credential for TURN authentication
    pub credential: String,
}

/// Timeouts and budgets for the negotiation state machine
#[derive(Debug, Clone)]
pub struct NegotiationConfig {
    /// How long a room operation may wait for the relay's reply
    pub room_op_timeout: Duration,

    /// How long a peer connection may sit unestablished before the
    /// supervisor renegotiates
    pub establish_timeout: Duration,

    /// Full renegotiations allowed before the session closes with an error
    pub max_renegotiations: u32,
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            room_op_timeout: Duration::from_secs(10),
            establish_timeout: Duration::from_secs(30),
            max_renegotiations: 5,
        }
    }
}

/// Limits and policies for the control channel
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Fixed chunk size for outgoing file transfers
    pub chunk_size: usize,

    /// Largest file accepted or offered, in bytes
    pub max_file_size: u64,

    /// Largest clipboard entry propagated, in bytes
    pub max_clipboard_bytes: usize,

    /// Denylisted MIME types and file extensions, matched case-insensitively
    pub clipboard_denylist: Vec<String>,

    /// Clipboard history ring capacity (oldest evicted first)
    pub clipboard_history: usize,

    /// An incoming transfer with no chunk for this long is abandoned
    pub transfer_timeout: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            chunk_size: 64 * 1024,
            max_file_size: 512 * 1024 * 1024,
            max_clipboard_bytes: 1024 * 1024,
            clipboard_denylist: vec![
                "application/x-ms-dos-executable".to_string(),
                ".exe".to_string(),
                ".bat".to_string(),
                ".cmd".to_string(),
                ".ps1".to_string(),
                ".sh".to_string(),
            ],
            clipboard_history: 16,
            transfer_timeout: Duration::from_secs(30),
        }
    }
}

/// Sampling and thresholds for the health monitor
#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// Fixed interval between quality samples
    pub sample_interval: Duration,

    /// Consecutive `poor` samples before the monitor forces renegotiation
    pub poor_samples_before_recovery: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            sample_interval: Duration::from_secs(2),
            poor_samples_before_recovery: 3,
        }
    }
}

/// Main configuration for a session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// WebSocket relay URL (ws:// or wss://)
    pub relay_url: String,

    /// Role announced to the relay; hosts initiate offers to joining peers
    pub role: PeerRole,

    /// Short human-readable tag shown to peers
    pub display_token: Option<String>,

    /// STUN server URLs (at least one required)
    pub stun_servers: Vec<String>,

    /// TURN server configurations (optional)
    pub turn_servers: Vec<TurnServerConfig>,

    /// Control-channel security; passed to the multiplexer at construction
    pub security: SecurityConfig,

    /// Shared secret for `join-room` HMACs, when the relay requires them
    pub room_secret: Option<Vec<u8>>,

    /// Backoff for relay reconnection and transport renegotiation
    pub reconnect: ReconnectPolicy,

    /// Negotiation timeouts and budgets
    pub negotiation: NegotiationConfig,

    /// Control-channel limits and policies
    pub channel: ChannelConfig,

    /// Health monitor settings
    pub health: HealthConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            relay_url: "ws://localhost:9030".to_string(),
            role: PeerRole::Viewer,
            display_token: None,
            stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            turn_servers: Vec::new(),
            security: SecurityConfig::disabled(),
            room_secret: None,
            reconnect: ReconnectPolicy::default(),
            negotiation: NegotiationConfig::default(),
            channel: ChannelConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl SessionConfig {
    /// Validate configuration parameters
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `relay_url` is not a WebSocket URL
    /// - `stun_servers` is empty
    /// - `channel.chunk_size` is zero or above 256 KiB
    /// - `channel.clipboard_history` is zero
    /// - any timeout is zero
    pub fn validate(&self) -> Result<()> {
        if !self.relay_url.starts_with("ws://") && !self.relay_url.starts_with("wss://") {
            return Err(Error::InvalidConfig(format!(
                "relay_url must start with ws:// or wss://, got {}",
                self.relay_url
            )));
        }

        if self.stun_servers.is_empty() {
            return Err(Error::InvalidConfig(
                "At least one STUN server is required".to_string(),
            ));
        }

        if self.channel.chunk_size == 0 || self.channel.chunk_size > 256 * 1024 {
            return Err(Error::InvalidConfig(format!(
                "chunk_size must be in range 1-262144, got {}",
                self.channel.chunk_size
            )));
        }

        if self.channel.clipboard_history == 0 {
            return Err(Error::InvalidConfig(
                "clipboard_history must be non-zero".to_string(),
            ));
        }

        for (name, d) in [
            ("room_op_timeout", self.negotiation.room_op_timeout),
            ("establish_timeout", self.negotiation.establish_timeout),
            ("transfer_timeout", self.channel.transfer_timeout),
            ("sample_interval", self.health.sample_interval),
        ] {
            if d.is_zero() {
                return Err(Error::InvalidConfig(format!("{} must be non-zero", name)));
            }
        }

        Ok(())
    }

    /// Preset for interactive screen control: tight timeouts, aggressive
    /// recovery, small clipboard ceiling
    pub fn low_latency_preset(relay_url: &str) -> Self {
        Self {
            relay_url: relay_url.to_string(),
            reconnect: ReconnectPolicy::aggressive(),
            negotiation: NegotiationConfig {
                room_op_timeout: Duration::from_secs(5),
                establish_timeout: Duration::from_secs(15),
                max_renegotiations: 10,
            },
            health: HealthConfig {
                sample_interval: Duration::from_secs(1),
                poor_samples_before_recovery: 2,
            },
            ..Self::default()
        }
    }

    /// Preset for lossy or cellular networks: patient timeouts, conservative
    /// recovery
    pub fn resilient_preset(relay_url: &str) -> Self {
        Self {
            relay_url: relay_url.to_string(),
            stun_servers: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
            ],
            reconnect: ReconnectPolicy::conservative(),
            negotiation: NegotiationConfig {
                room_op_timeout: Duration::from_secs(20),
                establish_timeout: Duration::from_secs(60),
                max_renegotiations: 3,
            },
            health: HealthConfig {
                sample_interval: Duration::from_secs(5),
                poor_samples_before_recovery: 5,
            },
            ..Self::default()
        }
    }

    /// Set the announced role
    pub fn with_role(mut self, role: PeerRole) -> Self {
        self.role = role;
        self
    }

    /// Set the control-channel security configuration
    pub fn with_security(mut self, security: SecurityConfig) -> Self {
        self.security = security;
        self
    }

    /// Set the shared join-HMAC secret
    pub fn with_room_secret(mut self, secret: impl Into<Vec<u8>>) -> Self {
        self.room_secret = Some(secret.into());
        self
    }

    /// Add TURN servers
    pub fn with_turn_servers(mut self, turn_servers: Vec<TurnServerConfig>) -> Self {
        self.turn_servers = turn_servers;
        self
    }
}
