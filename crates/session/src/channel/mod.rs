//! Secure channel multiplexer
//!
//! One ordered, reliable data channel carries every control sub-protocol:
//! input, clipboard, file transfer, presence. Each message is a typed
//! envelope; with security configured the payload is sealed by the
//! [`EnvelopeCodec`] and verified before dispatch. A frame that fails
//! verification is dropped whole and logged as a security event, never
//! delivered to sub-handlers.
//!
//! Ordering is verified, not assumed: the multiplexer refuses a transport
//! that does not guarantee in-order delivery, because chunked file transfers
//! carry no sequence numbers.

use async_trait::async_trait;
use bytes::Bytes;
use deskbridge_core::control::{ClipboardEntry, ControlMessage};
use deskbridge_core::protocol::ClientId;
use deskbridge_core::secure::{EnvelopeCodec, SecurityConfig};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;

use crate::collaborators::StorageSink;
use crate::config::ChannelConfig;
use crate::error::{Error, Result};
use crate::events::{EventSender, SessionEvent, TransferUpdate};

pub mod clipboard;
pub mod input;
pub mod transfer;

pub use clipboard::ClipboardManager;
pub use transfer::TransferManager;

/// Byte transport under the multiplexer
///
/// The production implementation wraps the WebRTC data channel; tests wire
/// two multiplexers together in memory.
#[async_trait]
pub trait ControlTransport: Send + Sync {
    /// Send one framed message
    async fn send(&self, bytes: &[u8]) -> Result<()>;

    /// Whether the transport guarantees in-order delivery
    fn is_ordered(&self) -> bool;
}

/// [`ControlTransport`] over a WebRTC data channel
pub struct DataChannelTransport {
    channel: Arc<RTCDataChannel>,
}

impl DataChannelTransport {
    /// Wrap an established data channel
    pub fn new(channel: Arc<RTCDataChannel>) -> Self {
        Self { channel }
    }
}

#[async_trait]
impl ControlTransport for DataChannelTransport {
    async fn send(&self, bytes: &[u8]) -> Result<()> {
        self.channel
            .send(&Bytes::copy_from_slice(bytes))
            .await
            .map_err(|e| Error::DataChannel(format!("Send failed: {}", e)))?;
        Ok(())
    }

    fn is_ordered(&self) -> bool {
        self.channel.ordered()
    }
}

/// Frames, seals, and dispatches control messages for one peer pair
pub struct Multiplexer {
    peer_id: ClientId,
    transport: Arc<dyn ControlTransport>,
    codec: EnvelopeCodec,
    config: ChannelConfig,
    clipboard: ClipboardManager,
    transfers: TransferManager,
    events: EventSender,
}

impl Multiplexer {
    /// Build a multiplexer over an arbitrary transport
    ///
    /// Fails with [`Error::DataChannel`] when the transport does not
    /// guarantee ordering.
    pub fn new(
        peer_id: ClientId,
        transport: Arc<dyn ControlTransport>,
        security: SecurityConfig,
        config: ChannelConfig,
        sink: Arc<dyn StorageSink>,
        events: EventSender,
    ) -> Result<Arc<Self>> {
        if !transport.is_ordered() {
            return Err(Error::DataChannel(
                "control channel must guarantee ordered delivery".to_string(),
            ));
        }

        let clipboard = ClipboardManager::new(&config);
        let transfers = TransferManager::new(peer_id.clone(), &config, sink, events.clone());

        Ok(Arc::new(Self {
            peer_id,
            transport,
            codec: EnvelopeCodec::new(security),
            config,
            clipboard,
            transfers,
            events,
        }))
    }

    /// Attach to an established WebRTC data channel
    ///
    /// Registers the inbound message handler and starts the stalled-transfer
    /// collector. The collector stops when the multiplexer is dropped.
    pub fn attach(
        peer_id: ClientId,
        channel: Arc<RTCDataChannel>,
        security: SecurityConfig,
        config: ChannelConfig,
        sink: Arc<dyn StorageSink>,
        events: EventSender,
    ) -> Result<Arc<Self>> {
        let transport = Arc::new(DataChannelTransport::new(Arc::clone(&channel)));
        let mux = Self::new(peer_id, transport, security, config, sink, events)?;

        let weak = Arc::downgrade(&mux);
        channel.on_message(Box::new(move |msg: DataChannelMessage| {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(mux) = weak.upgrade() {
                    mux.process_frame(&msg.data).await;
                }
            })
        }));

        let weak = Arc::downgrade(&mux);
        let sweep = mux.config.transfer_timeout / 2;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep.max(std::time::Duration::from_millis(50)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(mux) = weak.upgrade() else { break };
                mux.transfers.collect_stalled().await;
            }
        });

        info!(peer_id = %mux.peer_id, "Control channel attached");
        Ok(mux)
    }

    /// Peer on the other end of the channel
    pub fn peer_id(&self) -> &ClientId {
        &self.peer_id
    }

    /// Clipboard history and policy
    pub fn clipboard(&self) -> &ClipboardManager {
        &self.clipboard
    }

    /// Incoming transfer state (exposed for supervision)
    pub fn transfers(&self) -> &TransferManager {
        &self.transfers
    }

    /// Feed one raw inbound frame
    ///
    /// Opens the sealed envelope and dispatches the message to its
    /// sub-handler. A failed signature or undecryptable payload drops the
    /// frame whole.
    pub async fn process_frame(&self, bytes: &[u8]) {
        let message = match self.codec.open(bytes) {
            Ok(message) => message,
            Err(e) if e.is_security() => {
                warn!(
                    peer_id = %self.peer_id,
                    "Security event: dropping control frame ({})",
                    e
                );
                return;
            }
            Err(e) => {
                debug!(peer_id = %self.peer_id, "Dropping malformed control frame: {}", e);
                return;
            }
        };

        self.dispatch(message).await;
    }

    async fn dispatch(&self, message: ControlMessage) {
        match message {
            message @ (ControlMessage::Mouse { .. }
            | ControlMessage::Keyboard { .. }
            | ControlMessage::Presence { .. }) => {
                let _ = self.events.send(SessionEvent::Data {
                    peer_id: self.peer_id.clone(),
                    message,
                });
            }

            ControlMessage::Clipboard { entry } => {
                match self.clipboard.accept_remote(&entry).await {
                    Ok(()) => {
                        let _ = self.events.send(SessionEvent::Clipboard {
                            peer_id: self.peer_id.clone(),
                            entry,
                        });
                    }
                    Err(e) => {
                        warn!(peer_id = %self.peer_id, "Rejected remote clipboard entry: {}", e);
                    }
                }
            }

            message @ (ControlMessage::FileHeader { .. }
            | ControlMessage::FileChunk { .. }
            | ControlMessage::FileEnd { .. }) => {
                self.transfers.handle(message).await;
            }
        }
    }

    /// Send an input event; fire-and-forget
    pub async fn send_input(&self, message: ControlMessage) -> Result<()> {
        self.send_raw(&message).await
    }

    /// Send a presence update
    pub async fn send_presence(&self, message: ControlMessage) -> Result<()> {
        self.send_raw(&message).await
    }

    /// Propagate a clipboard entry
    ///
    /// The entry is validated against the size limit and denylist first;
    /// rejected entries are never sent.
    pub async fn send_clipboard(&self, entry: ClipboardEntry) -> Result<()> {
        self.clipboard.accept_local(&entry).await?;
        self.send_raw(&ControlMessage::Clipboard { entry }).await
    }

    /// Send a file as header, fixed-size chunks, and end marker
    ///
    /// Returns the transfer id. The header always travels unencrypted so the
    /// receiver can identify the transfer; chunk payloads are sealed like any
    /// other message.
    pub async fn send_file(&self, name: &str, mime: &str, bytes: &[u8]) -> Result<String> {
        if bytes.len() as u64 > self.config.max_file_size {
            return Err(Error::SizeLimitExceeded {
                size: bytes.len() as u64,
                limit: self.config.max_file_size,
            });
        }
        self.clipboard.check_file_name(name)?;

        let id = Uuid::new_v4().to_string();
        let digest = hex::encode(Sha256::digest(bytes));

        self.send_raw(&ControlMessage::FileHeader {
            id: id.clone(),
            name: name.to_string(),
            mime: mime.to_string(),
            size: bytes.len() as u64,
            sha256: Some(digest),
        })
        .await?;
        self.emit_transfer(TransferUpdate::Started {
            id: id.clone(),
            name: name.to_string(),
            size: bytes.len() as u64,
        });

        let mut sent = 0u64;
        for part in bytes.chunks(self.config.chunk_size) {
            self.send_raw(&ControlMessage::FileChunk {
                id: id.clone(),
                data: part.to_vec(),
            })
            .await?;
            sent += part.len() as u64;
            self.emit_transfer(TransferUpdate::Progress {
                id: id.clone(),
                transferred: sent,
                total: bytes.len() as u64,
            });
        }

        self.send_raw(&ControlMessage::FileEnd { id: id.clone() })
            .await?;
        self.emit_transfer(TransferUpdate::Completed {
            id: id.clone(),
            path: name.to_string(),
        });

        info!(
            peer_id = %self.peer_id,
            transfer_id = %id,
            bytes = bytes.len(),
            "File sent"
        );
        Ok(id)
    }

    async fn send_raw(&self, message: &ControlMessage) -> Result<()> {
        let wire = self.codec.seal(message)?;
        self.transport.send(&wire).await
    }

    fn emit_transfer(&self, update: TransferUpdate) {
        let _ = self.events.send(SessionEvent::Transfer {
            peer_id: self.peer_id.clone(),
            update,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::clipboard::text_entry;
    use crate::channel::input::mouse_move;
    use crate::collaborators::MemorySink;
    use deskbridge_core::control::ClipboardSource;
    use tokio::sync::mpsc;

    struct MemoryTransport {
        tx: mpsc::UnboundedSender<Vec<u8>>,
        ordered: bool,
    }

    #[async_trait]
    impl ControlTransport for MemoryTransport {
        async fn send(&self, bytes: &[u8]) -> Result<()> {
            self.tx
                .send(bytes.to_vec())
                .map_err(|_| Error::DataChannel("peer gone".to_string()))
        }

        fn is_ordered(&self) -> bool {
            self.ordered
        }
    }

    struct Side {
        mux: Arc<Multiplexer>,
        events: mpsc::UnboundedReceiver<SessionEvent>,
        sink: Arc<MemorySink>,
    }

    /// Two multiplexers joined by in-memory ordered transports, with pump
    /// tasks shuttling frames between them
    fn pair(
        config: ChannelConfig,
        security_a: SecurityConfig,
        security_b: SecurityConfig,
    ) -> (Side, Side) {
        let (a_to_b_tx, mut a_to_b_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let (b_to_a_tx, mut b_to_a_rx) = mpsc::unbounded_channel::<Vec<u8>>();

        let build = |tx, security, config: &ChannelConfig| {
            let sink = Arc::new(MemorySink::new());
            let (events_tx, events_rx) = mpsc::unbounded_channel();
            let mux = Multiplexer::new(
                "peer".to_string(),
                Arc::new(MemoryTransport { tx, ordered: true }),
                security,
                config.clone(),
                Arc::clone(&sink) as Arc<dyn StorageSink>,
                events_tx,
            )
            .unwrap();
            Side {
                mux,
                events: events_rx,
                sink,
            }
        };

        let a = build(a_to_b_tx, security_a, &config);
        let b = build(b_to_a_tx, security_b, &config);

        let b_mux = Arc::clone(&b.mux);
        tokio::spawn(async move {
            while let Some(frame) = a_to_b_rx.recv().await {
                b_mux.process_frame(&frame).await;
            }
        });
        let a_mux = Arc::clone(&a.mux);
        tokio::spawn(async move {
            while let Some(frame) = b_to_a_rx.recv().await {
                a_mux.process_frame(&frame).await;
            }
        });

        (a, b)
    }

    async fn recv_event(events: &mut mpsc::UnboundedReceiver<SessionEvent>) -> SessionEvent {
        tokio::time::timeout(std::time::Duration::from_secs(2), events.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    #[test]
    fn test_unordered_transport_refused() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let result = Multiplexer::new(
            "peer".to_string(),
            Arc::new(MemoryTransport { tx, ordered: false }),
            SecurityConfig::disabled(),
            ChannelConfig::default(),
            Arc::new(MemorySink::new()),
            events_tx,
        );
        assert!(matches!(result, Err(Error::DataChannel(_))));
    }

    #[tokio::test]
    async fn test_input_event_dispatches_to_peer() {
        let (a, mut b) = pair(
            ChannelConfig::default(),
            SecurityConfig::disabled(),
            SecurityConfig::disabled(),
        );

        a.mux.send_input(mouse_move(10, 20, None)).await.unwrap();

        match recv_event(&mut b.events).await {
            SessionEvent::Data { message, .. } => {
                assert_eq!(message, mouse_move(10, 20, None));
            }
            other => panic!("expected data event, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_clipboard_roundtrip_and_history() {
        let (a, mut b) = pair(
            ChannelConfig::default(),
            SecurityConfig::disabled(),
            SecurityConfig::disabled(),
        );

        let entry = text_entry("copied text", ClipboardSource::Local);
        a.mux.send_clipboard(entry.clone()).await.unwrap();

        match recv_event(&mut b.events).await {
            SessionEvent::Clipboard { entry: got, .. } => assert_eq!(got.data, "copied text"),
            other => panic!("expected clipboard event, got {:?}", other),
        }

        assert_eq!(a.mux.clipboard().history().await.len(), 1);
        assert_eq!(b.mux.clipboard().history().await.len(), 1);
    }

    #[tokio::test]
    async fn test_oversized_clipboard_never_sent() {
        let mut config = ChannelConfig::default();
        config.max_clipboard_bytes = 8;
        let (a, mut b) = pair(
            config,
            SecurityConfig::disabled(),
            SecurityConfig::disabled(),
        );

        let entry = text_entry("way too large for the limit", ClipboardSource::Local);
        let err = a.mux.send_clipboard(entry).await.unwrap_err();
        assert!(matches!(err, Error::SizeLimitExceeded { .. }));

        // nothing reached the peer
        a.mux.send_input(mouse_move(1, 1, None)).await.unwrap();
        assert!(matches!(
            recv_event(&mut b.events).await,
            SessionEvent::Data { .. }
        ));
    }

    #[tokio::test]
    async fn test_denylisted_file_never_sent() {
        let (a, _b) = pair(
            ChannelConfig::default(),
            SecurityConfig::disabled(),
            SecurityConfig::disabled(),
        );

        let err = a
            .mux
            .send_file("installer.exe", "application/octet-stream", b"MZ")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PolicyRejected(_)));
    }

    #[tokio::test]
    async fn test_file_roundtrip_single_chunk() {
        let (a, mut b) = pair(
            ChannelConfig::default(),
            SecurityConfig::disabled(),
            SecurityConfig::disabled(),
        );

        a.mux
            .send_file("notes.txt", "text/plain", b"hello world")
            .await
            .unwrap();

        // wait for the receiver's completion event
        loop {
            if let SessionEvent::Transfer {
                update: TransferUpdate::Completed { .. },
                ..
            } = recv_event(&mut b.events).await
            {
                break;
            }
        }
        assert_eq!(
            b.sink.get("notes.txt").await,
            Some(b"hello world".to_vec())
        );
    }

    #[tokio::test]
    async fn test_file_roundtrip_many_chunks() {
        let mut config = ChannelConfig::default();
        config.chunk_size = 16;
        let (a, mut b) = pair(
            config,
            SecurityConfig::disabled(),
            SecurityConfig::disabled(),
        );

        // 120 chunks of 16 bytes
        let source: Vec<u8> = (0..=255u8).cycle().take(16 * 120).collect();
        a.mux
            .send_file("blob.bin", "application/octet-stream", &source)
            .await
            .unwrap();

        loop {
            if let SessionEvent::Transfer {
                update: TransferUpdate::Completed { .. },
                ..
            } = recv_event(&mut b.events).await
            {
                break;
            }
        }
        assert_eq!(b.sink.get("blob.bin").await, Some(source));
    }

    #[tokio::test]
    async fn test_sealed_roundtrip_with_shared_keys() {
        let key = SecurityConfig::generate_key();
        let security = SecurityConfig::disabled()
            .with_encryption(key)
            .with_signing(b"mac-key".to_vec());
        let (a, mut b) = pair(ChannelConfig::default(), security.clone(), security);

        a.mux.send_input(mouse_move(7, 7, None)).await.unwrap();
        assert!(matches!(
            recv_event(&mut b.events).await,
            SessionEvent::Data { .. }
        ));

        a.mux
            .send_file("secret.txt", "text/plain", b"classified")
            .await
            .unwrap();
        loop {
            if let SessionEvent::Transfer {
                update: TransferUpdate::Completed { .. },
                ..
            } = recv_event(&mut b.events).await
            {
                break;
            }
        }
        assert_eq!(b.sink.get("secret.txt").await, Some(b"classified".to_vec()));
    }

    #[tokio::test]
    async fn test_unsigned_frames_dropped_by_signing_peer() {
        let (a, mut b) = pair(
            ChannelConfig::default(),
            SecurityConfig::disabled(),
            SecurityConfig::disabled().with_signing(b"mac-key".to_vec()),
        );

        // unsigned input frame: dropped whole, never dispatched
        a.mux.send_input(mouse_move(1, 2, None)).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(b.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_file_header_stays_identifiable_under_encryption() {
        let key = SecurityConfig::generate_key();
        let security = SecurityConfig::disabled().with_encryption(key);

        let (frame_tx, mut frame_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let mux = Multiplexer::new(
            "peer".to_string(),
            Arc::new(MemoryTransport {
                tx: frame_tx,
                ordered: true,
            }),
            security,
            ChannelConfig::default(),
            Arc::new(MemorySink::new()),
            events_tx,
        )
        .unwrap();

        mux.send_file("report.pdf", "application/pdf", b"%PDF data")
            .await
            .unwrap();

        let header = String::from_utf8(frame_rx.try_recv().unwrap()).unwrap();
        assert!(header.contains("report.pdf"));
        assert!(!header.contains("ciphertext"));

        let chunk = String::from_utf8(frame_rx.try_recv().unwrap()).unwrap();
        assert!(chunk.contains("ciphertext"));
        assert!(!chunk.contains("%PDF"));
    }
}
