//! Control-channel message types
//!
//! These messages ride the ordered, reliable data channel of an established
//! peer connection: input events, clipboard entries, file-transfer frames,
//! and presence updates. Input events are fire-and-forget; the channel's
//! in-order delivery is the only ordering guarantee they need.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Mouse action carried in a `mouse` message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MouseAction {
    /// Pointer moved to absolute coordinates
    Move,
    /// Button pressed
    Down,
    /// Button released
    Up,
    /// Wheel scrolled by deltas
    Scroll,
}

/// Mouse buttons, including the navigation pair found on most mice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MouseButton {
    Left,
    Middle,
    Right,
    Back,
    Forward,
}

/// Kind of content held by a clipboard entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClipboardContentType {
    Text,
    Html,
    Image,
}

/// Origin of a clipboard entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClipboardSource {
    /// Captured from the local clipboard
    Local,
    /// Received from the remote peer
    Remote,
}

/// One clipboard entry
///
/// Binary content (images) is base64-encoded into `data`; text and HTML are
/// carried verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClipboardEntry {
    /// Unique entry id
    pub id: String,

    /// Kind of content
    pub content_type: ClipboardContentType,

    /// MIME type of the content
    pub mime: String,

    /// Content, base64-encoded when binary
    pub data: String,

    /// Size of the decoded content in bytes
    pub size_bytes: usize,

    /// Where the entry came from
    pub source: ClipboardSource,

    /// Creation time, milliseconds since the Unix epoch
    pub timestamp_ms: u64,
}

/// Presence state announced over the control channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceState {
    /// Peer is attached and interactive
    Active,
    /// Peer is about to close the session
    Closing,
}

/// Control message
///
/// Serialized as a JSON object with a `type` discriminator. When security is
/// enabled, every variant except `file_header` may additionally be sealed
/// (encrypted and/or signed) by the channel layer; `file_header` metadata is
/// always sent in the clear so a receiver can identify an incoming transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Pointer event
    Mouse {
        /// What happened
        action: MouseAction,
        /// Absolute x coordinate (move/down/up)
        #[serde(skip_serializing_if = "Option::is_none")]
        x: Option<i32>,
        /// Absolute y coordinate (move/down/up)
        #[serde(skip_serializing_if = "Option::is_none")]
        y: Option<i32>,
        /// Horizontal wheel delta (scroll)
        #[serde(skip_serializing_if = "Option::is_none")]
        delta_x: Option<f32>,
        /// Vertical wheel delta (scroll)
        #[serde(skip_serializing_if = "Option::is_none")]
        delta_y: Option<f32>,
        /// Button involved (down/up)
        #[serde(skip_serializing_if = "Option::is_none")]
        button: Option<MouseButton>,
        /// Target monitor for multi-monitor hosts
        #[serde(skip_serializing_if = "Option::is_none")]
        monitor: Option<usize>,
    },

    /// Key event
    Keyboard {
        /// Platform-neutral key code
        key_code: u32,
        /// Active modifier names ("shift", "ctrl", ...)
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        modifiers: Vec<String>,
        /// true for press, false for release
        pressed: bool,
    },

    /// Clipboard entry propagated to the peer
    Clipboard {
        /// The entry
        entry: ClipboardEntry,
    },

    /// Start of a file transfer; always sent unencrypted
    FileHeader {
        /// Transfer id, unique per transfer
        id: String,
        /// Original file name
        name: String,
        /// MIME type
        mime: String,
        /// Total size in bytes
        size: u64,
        /// Hex SHA-256 digest of the source file, verified on completion
        #[serde(skip_serializing_if = "Option::is_none")]
        sha256: Option<String>,
    },

    /// One chunk of file content; chunks are not numbered — the channel's
    /// ordering guarantee is asserted at channel creation
    FileChunk {
        /// Transfer id
        id: String,
        /// Chunk bytes
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },

    /// End marker completing a transfer
    FileEnd {
        /// Transfer id
        id: String,
    },

    /// Presence update
    Presence {
        /// Announcing peer id
        peer_id: String,
        /// Announced state
        state: PresenceState,
    },
}

impl ControlMessage {
    /// Serialize to the JSON wire form
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| {
            Error::Serialization(format!("Failed to serialize control message: {}", e))
        })
    }

    /// Parse from the JSON wire form
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| {
            Error::Serialization(format!("Failed to deserialize control message: {}", e))
        })
    }

    /// Whether this message's payload may be encrypted in transit
    pub fn encryptable(&self) -> bool {
        !matches!(self, ControlMessage::FileHeader { .. })
    }

    /// Transfer id, for the file-transfer frames
    pub fn transfer_id(&self) -> Option<&str> {
        match self {
            ControlMessage::FileHeader { id, .. }
            | ControlMessage::FileChunk { id, .. }
            | ControlMessage::FileEnd { id } => Some(id),
            _ => None,
        }
    }
}

/// Base64 (de)serialization for chunk bytes embedded in JSON
mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &Vec<u8>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mouse_move_roundtrip() {
        let msg = ControlMessage::Mouse {
            action: MouseAction::Move,
            x: Some(640),
            y: Some(360),
            delta_x: None,
            delta_y: None,
            button: None,
            monitor: Some(1),
        };
        let json = msg.to_json().unwrap();
        assert!(json.contains("\"type\":\"mouse\""));
        assert!(!json.contains("delta_x"));
        assert_eq!(ControlMessage::from_json(&json).unwrap(), msg);
    }

    #[test]
    fn test_keyboard_empty_modifiers_omitted() {
        let msg = ControlMessage::Keyboard {
            key_code: 65,
            modifiers: vec![],
            pressed: true,
        };
        let json = msg.to_json().unwrap();
        assert!(!json.contains("modifiers"));
        assert_eq!(ControlMessage::from_json(&json).unwrap(), msg);
    }

    #[test]
    fn test_file_chunk_base64() {
        let msg = ControlMessage::FileChunk {
            id: "t-1".to_string(),
            data: vec![0xDE, 0xAD, 0xBE, 0xEF],
        };
        let json = msg.to_json().unwrap();
        assert!(json.contains("3q2+7w=="));
        assert_eq!(ControlMessage::from_json(&json).unwrap(), msg);
    }

    #[test]
    fn test_file_header_is_not_encryptable() {
        let header = ControlMessage::FileHeader {
            id: "t-1".to_string(),
            name: "report.pdf".to_string(),
            mime: "application/pdf".to_string(),
            size: 4096,
            sha256: None,
        };
        assert!(!header.encryptable());
        assert!(ControlMessage::FileEnd {
            id: "t-1".to_string()
        }
        .encryptable());
    }

    #[test]
    fn test_transfer_id() {
        let end = ControlMessage::FileEnd {
            id: "t-9".to_string(),
        };
        assert_eq!(end.transfer_id(), Some("t-9"));

        let key = ControlMessage::Keyboard {
            key_code: 13,
            modifiers: vec![],
            pressed: false,
        };
        assert_eq!(key.transfer_id(), None);
    }

    #[test]
    fn test_clipboard_entry_roundtrip() {
        let msg = ControlMessage::Clipboard {
            entry: ClipboardEntry {
                id: "e-1".to_string(),
                content_type: ClipboardContentType::Text,
                mime: "text/plain".to_string(),
                data: "hello".to_string(),
                size_bytes: 5,
                source: ClipboardSource::Local,
                timestamp_ms: 1_700_000_000_000,
            },
        };
        let json = msg.to_json().unwrap();
        assert!(json.contains("\"content_type\":\"text\""));
        assert_eq!(ControlMessage::from_json(&json).unwrap(), msg);
    }
}
