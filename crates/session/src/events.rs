//! Typed session events
//!
//! Everything the presentation layer needs flows through one event channel,
//! consumed by a single dispatch loop on the embedder's side. There is no
//! listener registration; the channel is handed out once at construction.

use deskbridge_core::control::{ClipboardEntry, ControlMessage};
use deskbridge_core::protocol::ClientId;
use std::sync::Arc;
use tokio::sync::mpsc;
use webrtc::track::track_remote::TrackRemote;

use crate::health::QualityReport;
use crate::negotiator::NegotiationState;

/// Sender half of the session event channel
pub type EventSender = mpsc::UnboundedSender<SessionEvent>;

/// Receiver half of the session event channel
pub type EventReceiver = mpsc::UnboundedReceiver<SessionEvent>;

/// Progress of one file transfer
#[derive(Debug, Clone, PartialEq)]
pub enum TransferUpdate {
    /// Header received or sent; the transfer is on record
    Started {
        /// Transfer id
        id: String,
        /// File name
        name: String,
        /// Announced total size in bytes
        size: u64,
    },
    /// A chunk moved
    Progress {
        /// Transfer id
        id: String,
        /// Bytes moved so far
        transferred: u64,
        /// Announced total size in bytes
        total: u64,
    },
    /// Artifact flushed to the storage sink
    Completed {
        /// Transfer id
        id: String,
        /// Path handed to the sink
        path: String,
    },
    /// Transfer abandoned; partial state was discarded
    Failed {
        /// Transfer id
        id: String,
        /// Failure description
        reason: String,
    },
}

/// Events emitted to the presentation layer
pub enum SessionEvent {
    /// A remote media track arrived
    Stream {
        /// Peer the track came from
        peer_id: ClientId,
        /// The remote track
        track: Arc<TrackRemote>,
    },

    /// A peer connection changed state
    ConnectionState {
        /// Peer whose connection changed
        peer_id: ClientId,
        /// New state
        state: NegotiationState,
    },

    /// A control message arrived (input, presence)
    Data {
        /// Peer the message came from
        peer_id: ClientId,
        /// The message
        message: ControlMessage,
    },

    /// A clipboard entry arrived and was recorded in the history ring
    Clipboard {
        /// Peer the entry came from
        peer_id: ClientId,
        /// The entry
        entry: ClipboardEntry,
    },

    /// File transfer progress
    Transfer {
        /// Peer on the other end of the transfer
        peer_id: ClientId,
        /// What happened
        update: TransferUpdate,
    },

    /// Periodic connection quality report
    Monitors {
        /// Peer the report covers
        peer_id: ClientId,
        /// The report
        report: QualityReport,
    },

    /// The relay accepted our registration and issued a token
    Authorized {
        /// Our assigned client id
        client_id: ClientId,
    },

    /// The relay refused an operation
    Unauthorized {
        /// Relay-provided description
        message: String,
    },

    /// Relay connectivity changed
    RelayConnection {
        /// Whether the relay connection is up
        connected: bool,
    },
}

impl std::fmt::Debug for SessionEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionEvent::Stream { peer_id, .. } => {
                f.debug_struct("Stream").field("peer_id", peer_id).finish()
            }
            SessionEvent::ConnectionState { peer_id, state } => f
                .debug_struct("ConnectionState")
                .field("peer_id", peer_id)
                .field("state", state)
                .finish(),
            SessionEvent::Data { peer_id, message } => f
                .debug_struct("Data")
                .field("peer_id", peer_id)
                .field("message", message)
                .finish(),
            SessionEvent::Clipboard { peer_id, entry } => f
                .debug_struct("Clipboard")
                .field("peer_id", peer_id)
                .field("entry_id", &entry.id)
                .finish(),
            SessionEvent::Transfer { peer_id, update } => f
                .debug_struct("Transfer")
                .field("peer_id", peer_id)
                .field("update", update)
                .finish(),
            SessionEvent::Monitors { peer_id, report } => f
                .debug_struct("Monitors")
                .field("peer_id", peer_id)
                .field("report", report)
                .finish(),
            SessionEvent::Authorized { client_id } => f
                .debug_struct("Authorized")
                .field("client_id", client_id)
                .finish(),
            SessionEvent::Unauthorized { message } => f
                .debug_struct("Unauthorized")
                .field("message", message)
                .finish(),
            SessionEvent::RelayConnection { connected } => f
                .debug_struct("RelayConnection")
                .field("connected", connected)
                .finish(),
        }
    }
}
