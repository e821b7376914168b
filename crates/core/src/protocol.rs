//! Signaling envelope types
//!
//! Every message exchanged over the relay connection is one of these
//! envelopes, serialized as a JSON object with a `type` discriminator.
//! Envelopes between a fixed pair of peers are delivered in send order;
//! no ordering is guaranteed relative to the control channel.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Identifier assigned to a relay client at registration
pub type ClientId = String;

/// Identifier of a live room
pub type RoomId = String;

/// Role a client announces for itself
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PeerRole {
    /// Exposes a screen and accepts input
    Host,
    /// Views a screen and sends input
    #[default]
    Viewer,
}

/// Per-room settings echoed to every joiner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomSettings {
    /// Maximum number of members admitted to the room
    pub max_members: usize,

    /// Whether control-channel payload encryption is required in this room
    pub encryption_required: bool,
}

impl Default for RoomSettings {
    fn default() -> Self {
        Self {
            max_members: 8,
            encryption_required: false,
        }
    }
}

/// Signaling envelope
///
/// The `direction` noted per variant is advisory; the relay rejects
/// client-sent envelopes that only the server may originate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Envelope {
    /// server -> client: registration result, sent once per connection
    Welcome {
        /// Assigned client identifier
        client_id: ClientId,
        /// Signed authorization token for privileged room operations
        token: String,
    },

    /// client -> server: update display token and role for this client
    Announce {
        /// Short human-readable tag shown to peers
        #[serde(skip_serializing_if = "Option::is_none")]
        display_token: Option<String>,
        /// Announced role
        role: PeerRole,
    },

    /// client -> server: create a room, optionally with a caller-supplied id
    CreateRoom {
        /// Requested room id; a fresh one is minted when absent
        #[serde(skip_serializing_if = "Option::is_none")]
        room_id: Option<RoomId>,
        /// Authorization token from `welcome`
        token: String,
    },

    /// server -> client: room creation succeeded
    RoomCreated {
        /// Id of the created room
        room_id: RoomId,
    },

    /// client -> server: join an existing room
    JoinRoom {
        /// Id of the room to join
        room_id: RoomId,
        /// Authorization token from `welcome`
        token: String,
        /// Optional HMAC over the room id, required when signing is enabled
        #[serde(skip_serializing_if = "Option::is_none")]
        hmac: Option<String>,
    },

    /// server -> client: join succeeded
    RoomJoined {
        /// Id of the joined room
        room_id: RoomId,
        /// Ids of the members already present
        peers: Vec<ClientId>,
        /// Room settings
        settings: RoomSettings,
    },

    /// server -> client: another member entered the room
    PeerJoined {
        /// Id of the new member
        peer_id: ClientId,
    },

    /// server -> client: a member left gracefully
    PeerLeft {
        /// Id of the departed member
        peer_id: ClientId,
    },

    /// server -> client: a member timed out or dropped without leaving
    PeerDisconnected {
        /// Id of the lost member
        peer_id: ClientId,
    },

    /// client -> server: leave the current room (idempotent)
    LeaveRoom {
        /// Id of the room being left
        room_id: RoomId,
    },

    /// server -> client: leave acknowledged
    RoomLeft {
        /// Id of the room that was left
        room_id: RoomId,
    },

    /// relayed: SDP offer
    Offer {
        /// Sending client id
        from: ClientId,
        /// Addressed client id
        to: ClientId,
        /// SDP offer text
        sdp: String,
    },

    /// relayed: SDP answer
    Answer {
        /// Sending client id
        from: ClientId,
        /// Addressed client id
        to: ClientId,
        /// SDP answer text
        sdp: String,
    },

    /// relayed: discovered ICE candidate
    IceCandidate {
        /// Sending client id
        from: ClientId,
        /// Addressed client id
        to: ClientId,
        /// Candidate string
        candidate: String,
        /// SDP media stream identification tag
        #[serde(skip_serializing_if = "Option::is_none")]
        sdp_mid: Option<String>,
        /// SDP media line index
        #[serde(skip_serializing_if = "Option::is_none")]
        sdp_mline_index: Option<u16>,
    },

    /// both directions: heartbeat probe
    Ping,

    /// both directions: heartbeat reply
    Pong,

    /// server -> client: request failed
    Error {
        /// Human-readable failure description
        message: String,
    },

    /// server -> client: authorization failed; no state was mutated
    Unauthorized {
        /// Human-readable failure description
        message: String,
    },
}

impl Envelope {
    /// Serialize to the JSON wire form
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| Error::Serialization(format!("Failed to serialize envelope: {}", e)))
    }

    /// Parse from the JSON wire form
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| Error::Serialization(format!("Failed to deserialize envelope: {}", e)))
    }

    /// Wire name of this envelope's `type` tag
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Welcome { .. } => "welcome",
            Envelope::Announce { .. } => "announce",
            Envelope::CreateRoom { .. } => "create-room",
            Envelope::RoomCreated { .. } => "room-created",
            Envelope::JoinRoom { .. } => "join-room",
            Envelope::RoomJoined { .. } => "room-joined",
            Envelope::PeerJoined { .. } => "peer-joined",
            Envelope::PeerLeft { .. } => "peer-left",
            Envelope::PeerDisconnected { .. } => "peer-disconnected",
            Envelope::LeaveRoom { .. } => "leave-room",
            Envelope::RoomLeft { .. } => "room-left",
            Envelope::Offer { .. } => "offer",
            Envelope::Answer { .. } => "answer",
            Envelope::IceCandidate { .. } => "ice-candidate",
            Envelope::Ping => "ping",
            Envelope::Pong => "pong",
            Envelope::Error { .. } => "error",
            Envelope::Unauthorized { .. } => "unauthorized",
        }
    }

    /// Whether this envelope is relayed peer-to-peer rather than handled by
    /// the server itself
    pub fn is_relayed(&self) -> bool {
        matches!(
            self,
            Envelope::Offer { .. } | Envelope::Answer { .. } | Envelope::IceCandidate { .. }
        )
    }

    /// Addressee of a relayed envelope
    pub fn target(&self) -> Option<&ClientId> {
        match self {
            Envelope::Offer { to, .. }
            | Envelope::Answer { to, .. }
            | Envelope::IceCandidate { to, .. } => Some(to),
            _ => None,
        }
    }

    /// Claimed sender of a relayed envelope
    pub fn source(&self) -> Option<&ClientId> {
        match self {
            Envelope::Offer { from, .. }
            | Envelope::Answer { from, .. }
            | Envelope::IceCandidate { from, .. } => Some(from),
            _ => None,
        }
    }
}
