//! Incoming file-transfer reassembly
//!
//! Three-message protocol: `file_header`, N `file_chunk`s, `file_end`.
//! Chunks carry no sequence numbers; the control channel's verified ordering
//! is the ordering. Reassembled artifacts are flushed to the storage sink
//! only once `file_end` arrives for a transfer with a header and at least
//! one chunk on record. A transfer that stalls is abandoned and its partial
//! state discarded; there is no resume.

use deskbridge_core::control::ControlMessage;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::collaborators::StorageSink;
use crate::config::ChannelConfig;
use crate::events::{EventSender, SessionEvent, TransferUpdate};

struct IncomingTransfer {
    name: String,
    size: u64,
    sha256: Option<String>,
    data: Vec<u8>,
    chunks: usize,
    last_activity: Instant,
}

/// Reassembles incoming transfers for one peer pair
pub struct TransferManager {
    peer_id: String,
    incoming: Mutex<HashMap<String, IncomingTransfer>>,
    sink: Arc<dyn StorageSink>,
    events: EventSender,
    max_file_size: u64,
    timeout: Duration,
}

impl TransferManager {
    /// Build from the channel configuration
    pub fn new(
        peer_id: impl Into<String>,
        config: &ChannelConfig,
        sink: Arc<dyn StorageSink>,
        events: EventSender,
    ) -> Self {
        Self {
            peer_id: peer_id.into(),
            incoming: Mutex::new(HashMap::new()),
            sink,
            events,
            max_file_size: config.max_file_size,
            timeout: config.transfer_timeout,
        }
    }

    /// Handle one file-transfer frame
    pub async fn handle(&self, message: ControlMessage) {
        match message {
            ControlMessage::FileHeader {
                id,
                name,
                size,
                sha256,
                ..
            } => self.handle_header(id, name, size, sha256).await,
            ControlMessage::FileChunk { id, data } => self.handle_chunk(id, data).await,
            ControlMessage::FileEnd { id } => self.handle_end(id).await,
            other => {
                debug!(kind = ?other, "Non-transfer message routed to transfer manager");
            }
        }
    }

    async fn handle_header(&self, id: String, name: String, size: u64, sha256: Option<String>) {
        if size > self.max_file_size {
            warn!(
                transfer_id = %id,
                size,
                limit = self.max_file_size,
                "Refusing oversized transfer"
            );
            self.emit(TransferUpdate::Failed {
                id,
                reason: format!("size {} exceeds limit {}", size, self.max_file_size),
            });
            return;
        }

        info!(transfer_id = %id, name = %name, size, "Incoming transfer");
        let mut incoming = self.incoming.lock().await;
        // a header with a known id restarts the transfer; there is no resume
        if incoming.remove(&id).is_some() {
            debug!(transfer_id = %id, "Header repeated, discarding partial state");
        }
        incoming.insert(
            id.clone(),
            IncomingTransfer {
                name: name.clone(),
                size,
                sha256,
                data: Vec::with_capacity(size.min(4 * 1024 * 1024) as usize),
                chunks: 0,
                last_activity: Instant::now(),
            },
        );
        drop(incoming);

        self.emit(TransferUpdate::Started { id, name, size });
    }

    async fn handle_chunk(&self, id: String, data: Vec<u8>) {
        let mut incoming = self.incoming.lock().await;
        let Some(transfer) = incoming.get_mut(&id) else {
            debug!(transfer_id = %id, "Chunk for unknown transfer dropped");
            return;
        };

        transfer.data.extend_from_slice(&data);
        transfer.chunks += 1;
        transfer.last_activity = Instant::now();

        let update = TransferUpdate::Progress {
            id: id.clone(),
            transferred: transfer.data.len() as u64,
            total: transfer.size,
        };
        drop(incoming);
        self.emit(update);
    }

    async fn handle_end(&self, id: String) {
        let Some(transfer) = self.incoming.lock().await.remove(&id) else {
            debug!(transfer_id = %id, "file_end for unknown transfer ignored");
            return;
        };

        if transfer.chunks == 0 {
            warn!(transfer_id = %id, "Transfer ended without any chunk");
            self.emit(TransferUpdate::Failed {
                id,
                reason: "no chunks received".to_string(),
            });
            return;
        }

        if transfer.data.len() as u64 != transfer.size {
            warn!(
                transfer_id = %id,
                announced = transfer.size,
                received = transfer.data.len(),
                "Transfer size differs from header"
            );
        }

        if let Some(expected) = &transfer.sha256 {
            let actual = hex::encode(Sha256::digest(&transfer.data));
            if &actual != expected {
                warn!(transfer_id = %id, "Checksum mismatch, discarding artifact");
                self.emit(TransferUpdate::Failed {
                    id,
                    reason: format!("checksum mismatch: expected {}, got {}", expected, actual),
                });
                return;
            }
        }

        match self.sink.write(&transfer.name, &transfer.data).await {
            Ok(()) => {
                info!(
                    transfer_id = %id,
                    name = %transfer.name,
                    bytes = transfer.data.len(),
                    "Transfer complete"
                );
                self.emit(TransferUpdate::Completed {
                    id,
                    path: transfer.name,
                });
            }
            Err(e) => {
                warn!(transfer_id = %id, "Failed to store artifact: {}", e);
                self.emit(TransferUpdate::Failed {
                    id,
                    reason: e.to_string(),
                });
            }
        }
    }

    /// Abandon transfers that have not seen a chunk within the timeout
    ///
    /// Returns how many were discarded. A failed transfer is reported but
    /// never terminates the session.
    pub async fn collect_stalled(&self) -> usize {
        let mut incoming = self.incoming.lock().await;
        let stalled: Vec<String> = incoming
            .iter()
            .filter(|(_, t)| t.last_activity.elapsed() > self.timeout)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &stalled {
            incoming.remove(id);
            warn!(transfer_id = %id, "Transfer stalled, discarding partial state");
            self.emit(TransferUpdate::Failed {
                id: id.clone(),
                reason: "timed out waiting for chunks".to_string(),
            });
        }

        stalled.len()
    }

    /// Number of transfers currently in flight
    pub async fn active(&self) -> usize {
        self.incoming.lock().await.len()
    }

    fn emit(&self, update: TransferUpdate) {
        let _ = self.events.send(SessionEvent::Transfer {
            peer_id: self.peer_id.clone(),
            update,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::MemorySink;
    use tokio::sync::mpsc;

    fn setup(
        config: ChannelConfig,
    ) -> (
        TransferManager,
        Arc<MemorySink>,
        mpsc::UnboundedReceiver<SessionEvent>,
    ) {
        let sink = Arc::new(MemorySink::new());
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let manager = TransferManager::new("peer-1", &config, Arc::clone(&sink) as _, events_tx);
        (manager, sink, events_rx)
    }

    fn header(id: &str, name: &str, size: u64, sha256: Option<String>) -> ControlMessage {
        ControlMessage::FileHeader {
            id: id.to_string(),
            name: name.to_string(),
            mime: "application/octet-stream".to_string(),
            size,
            sha256,
        }
    }

    fn chunk(id: &str, data: &[u8]) -> ControlMessage {
        ControlMessage::FileChunk {
            id: id.to_string(),
            data: data.to_vec(),
        }
    }

    fn end(id: &str) -> ControlMessage {
        ControlMessage::FileEnd { id: id.to_string() }
    }

    fn last_update(rx: &mut mpsc::UnboundedReceiver<SessionEvent>) -> Option<TransferUpdate> {
        let mut last = None;
        while let Ok(event) = rx.try_recv() {
            if let SessionEvent::Transfer { update, .. } = event {
                last = Some(update);
            }
        }
        last
    }

    #[tokio::test]
    async fn test_single_chunk_roundtrip() {
        let (manager, sink, mut events) = setup(ChannelConfig::default());

        manager.handle(header("t-1", "hello.txt", 5, None)).await;
        manager.handle(chunk("t-1", b"hello")).await;
        manager.handle(end("t-1")).await;

        assert_eq!(sink.get("hello.txt").await, Some(b"hello".to_vec()));
        assert!(matches!(
            last_update(&mut events),
            Some(TransferUpdate::Completed { .. })
        ));
        assert_eq!(manager.active().await, 0);
    }

    #[tokio::test]
    async fn test_many_chunks_reassemble_in_order() {
        let (manager, sink, _events) = setup(ChannelConfig::default());

        let source: Vec<u8> = (0..=255u8).cycle().take(120 * 37).collect();
        manager
            .handle(header("t-1", "blob.bin", source.len() as u64, None))
            .await;
        for part in source.chunks(37) {
            manager.handle(chunk("t-1", part)).await;
        }
        manager.handle(end("t-1")).await;

        assert_eq!(sink.get("blob.bin").await, Some(source));
    }

    #[tokio::test]
    async fn test_checksum_verified_on_completion() {
        let (manager, sink, mut events) = setup(ChannelConfig::default());

        let digest = hex::encode(Sha256::digest(b"payload"));
        manager
            .handle(header("t-1", "ok.bin", 7, Some(digest)))
            .await;
        manager.handle(chunk("t-1", b"payload")).await;
        manager.handle(end("t-1")).await;
        assert_eq!(sink.get("ok.bin").await, Some(b"payload".to_vec()));

        manager
            .handle(header("t-2", "bad.bin", 7, Some("00".repeat(32))))
            .await;
        manager.handle(chunk("t-2", b"payload")).await;
        manager.handle(end("t-2")).await;

        assert_eq!(sink.get("bad.bin").await, None);
        assert!(matches!(
            last_update(&mut events),
            Some(TransferUpdate::Failed { .. })
        ));
    }

    #[tokio::test]
    async fn test_end_for_unknown_id_is_ignored() {
        let (manager, sink, mut events) = setup(ChannelConfig::default());

        manager.handle(end("ghost")).await;
        assert!(sink.is_empty().await);
        assert!(last_update(&mut events).is_none());
    }

    #[tokio::test]
    async fn test_end_without_chunks_fails() {
        let (manager, sink, mut events) = setup(ChannelConfig::default());

        manager.handle(header("t-1", "empty.bin", 0, None)).await;
        manager.handle(end("t-1")).await;

        assert!(sink.is_empty().await);
        assert!(matches!(
            last_update(&mut events),
            Some(TransferUpdate::Failed { .. })
        ));
    }

    #[tokio::test]
    async fn test_oversized_header_refused() {
        let mut config = ChannelConfig::default();
        config.max_file_size = 16;
        let (manager, sink, mut events) = setup(config);

        manager.handle(header("t-1", "big.bin", 1024, None)).await;
        assert_eq!(manager.active().await, 0);

        // chunks for the refused transfer are dropped
        manager.handle(chunk("t-1", b"data")).await;
        manager.handle(end("t-1")).await;
        assert!(sink.is_empty().await);
        assert!(matches!(
            last_update(&mut events),
            Some(TransferUpdate::Failed { .. })
        ));
    }

    #[tokio::test]
    async fn test_stalled_transfer_is_discarded() {
        let mut config = ChannelConfig::default();
        config.transfer_timeout = Duration::from_millis(20);
        let (manager, sink, mut events) = setup(config);

        manager.handle(header("t-1", "slow.bin", 100, None)).await;
        manager.handle(chunk("t-1", b"partial")).await;

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(manager.collect_stalled().await, 1);
        assert_eq!(manager.active().await, 0);
        assert!(sink.is_empty().await);
        assert!(matches!(
            last_update(&mut events),
            Some(TransferUpdate::Failed { .. })
        ));

        // a late end marker now refers to an unknown id and is ignored
        manager.handle(end("t-1")).await;
        assert!(sink.is_empty().await);
    }

    #[tokio::test]
    async fn test_repeated_header_restarts_transfer() {
        let (manager, sink, _events) = setup(ChannelConfig::default());

        manager.handle(header("t-1", "a.bin", 4, None)).await;
        manager.handle(chunk("t-1", b"xx")).await;

        // sender restarted from the header; old partial state is gone
        manager.handle(header("t-1", "a.bin", 4, None)).await;
        manager.handle(chunk("t-1", b"ab")).await;
        manager.handle(chunk("t-1", b"cd")).await;
        manager.handle(end("t-1")).await;

        assert_eq!(sink.get("a.bin").await, Some(b"abcd".to_vec()));
    }
}
