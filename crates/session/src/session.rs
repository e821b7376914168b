//! Session orchestrator
//!
//! Owns the relay connection, one negotiator per peer, and the control
//! channel riding each established transport. Inbound signaling envelopes are
//! consumed by a single dispatch loop; per-peer supervision tasks drive
//! establishment timeouts, failure recovery, and health monitoring.
//!
//! Hosts initiate: when a peer joins the room, the host side creates the
//! offer (attaching its media source first). Viewers answer.

use deskbridge_core::auth::room_hmac;
use deskbridge_core::control::{ClipboardEntry, ControlMessage, PresenceState};
use deskbridge_core::protocol::{ClientId, Envelope, PeerRole, RoomId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, error, info, warn};

use crate::backoff::Backoff;
use crate::channel::Multiplexer;
use crate::collaborators::{MediaSource, StorageSink};
use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::events::{EventReceiver, EventSender, SessionEvent};
use crate::health::{HealthMonitor, RecoveryAction};
use crate::negotiator::{NegotiationState, Negotiator, TransportSignal};
use crate::signaling::{EnvelopeReceiver, SignalingClient};

struct PeerEntry {
    negotiator: Arc<Negotiator>,
    mux: Arc<RwLock<Option<Arc<Multiplexer>>>>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl PeerEntry {
    fn abort_tasks(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// A peer-side session: relay membership plus direct transports
pub struct Session {
    config: SessionConfig,
    sink: Arc<dyn StorageSink>,
    media: RwLock<Option<Arc<dyn MediaSource>>>,
    events_tx: EventSender,
    signaling: RwLock<Option<Arc<SignalingClient>>>,
    peers: RwLock<HashMap<ClientId, PeerEntry>>,
    room: RwLock<Option<RoomId>>,
    closed: AtomicBool,
}

impl Session {
    /// Validate the configuration and create a session
    ///
    /// Returns the session and the event receiver the presentation layer
    /// consumes.
    pub fn new(
        config: SessionConfig,
        sink: Arc<dyn StorageSink>,
    ) -> Result<(Arc<Self>, EventReceiver)> {
        config.validate()?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        Ok((
            Arc::new(Self {
                config,
                sink,
                media: RwLock::new(None),
                events_tx,
                signaling: RwLock::new(None),
                peers: RwLock::new(HashMap::new()),
                room: RwLock::new(None),
                closed: AtomicBool::new(false),
            }),
            events_rx,
        ))
    }

    /// Provide the media source attached to outgoing connections (hosts)
    pub async fn set_media_source(&self, source: Arc<dyn MediaSource>) {
        *self.media.write().await = Some(source);
    }

    /// Connect and register with the relay
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        let (client, envelopes) = SignalingClient::connect(
            &self.config.relay_url,
            self.config.role,
            self.config.display_token.clone(),
        )
        .await?;

        let client = Arc::new(client);
        let client_id = client.client_id().clone();
        *self.signaling.write().await = Some(Arc::clone(&client));

        let _ = self.events_tx.send(SessionEvent::Authorized {
            client_id: client_id.clone(),
        });
        let _ = self
            .events_tx
            .send(SessionEvent::RelayConnection { connected: true });

        let session = Arc::clone(self);
        tokio::spawn(async move {
            session.run_envelope_loop(envelopes).await;
        });

        info!(client_id = %client_id, "Session connected to relay");
        Ok(())
    }

    /// Our relay-assigned client id, when connected
    pub async fn client_id(&self) -> Option<ClientId> {
        self.signaling
            .read()
            .await
            .as_ref()
            .map(|c| c.client_id().clone())
    }

    /// Create a room, optionally with a caller-supplied id
    pub async fn create_room(&self, room_id: Option<RoomId>) -> Result<RoomId> {
        let client = self.require_signaling().await?;
        let room_id = client
            .create_room(room_id, self.config.negotiation.room_op_timeout)
            .await?;
        *self.room.write().await = Some(room_id.clone());
        Ok(room_id)
    }

    /// Join a room, presenting an HMAC when a room secret is configured
    ///
    /// Returns the members already present.
    pub async fn join_room(self: &Arc<Self>, room_id: &str) -> Result<Vec<ClientId>> {
        let client = self.require_signaling().await?;
        let hmac = match &self.config.room_secret {
            Some(secret) => Some(room_hmac(secret, room_id, client.client_id())?),
            None => None,
        };

        let (peers, settings) = client
            .join_room(room_id, hmac, self.config.negotiation.room_op_timeout)
            .await?;

        if settings.encryption_required && !self.config.security.encryption_enabled() {
            // surfaced before any negotiation starts; the relay admitted us
            // but peers would refuse unsealed control traffic
            warn!(room_id = %room_id, "Room requires encryption but none is configured");
        }

        *self.room.write().await = Some(room_id.to_string());

        // Hosts offer to everyone already present (relevant after a relay
        // reconnect, where we rejoin with a fresh client id).
        if self.config.role == PeerRole::Host {
            for peer_id in &peers {
                if let Err(e) = self.initiate_peer(peer_id.clone()).await {
                    warn!(peer_id = %peer_id, "Failed to initiate peer: {}", e);
                }
            }
        }

        Ok(peers)
    }

    /// Leave the current room; idempotent, callable mid-negotiation
    ///
    /// Outstanding negotiation state is discarded; the call never waits for
    /// peer acknowledgment.
    pub async fn leave_room(&self) -> Result<()> {
        let room = self.room.write().await.take();
        if let Some(room_id) = room {
            if let Some(client) = self.signaling.read().await.as_ref() {
                let _ = client.leave_room(&room_id);
            }
            self.close_all_peers().await;
            info!(room_id = %room_id, "Left room");
        }
        Ok(())
    }

    /// Negotiation state of a peer connection
    pub async fn peer_state(&self, peer_id: &str) -> Option<NegotiationState> {
        self.peers
            .read()
            .await
            .get(peer_id)
            .map(|p| p.negotiator.state())
    }

    /// Send an input event to a peer's control channel
    pub async fn send_input(&self, peer_id: &str, message: ControlMessage) -> Result<()> {
        self.mux_for(peer_id).await?.send_input(message).await
    }

    /// Propagate a clipboard entry to a peer
    pub async fn send_clipboard(&self, peer_id: &str, entry: ClipboardEntry) -> Result<()> {
        self.mux_for(peer_id).await?.send_clipboard(entry).await
    }

    /// Send a file to a peer; returns the transfer id
    pub async fn send_file(
        &self,
        peer_id: &str,
        name: &str,
        mime: &str,
        bytes: &[u8],
    ) -> Result<String> {
        self.mux_for(peer_id).await?.send_file(name, mime, bytes).await
    }

    /// Close the session: leave the room, tear down every peer transport,
    /// and drop the relay connection; idempotent
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Closing session");

        // best-effort goodbye on each control channel
        for entry in self.peers.read().await.values() {
            if let Some(mux) = entry.mux.read().await.as_ref() {
                let _ = mux
                    .send_presence(ControlMessage::Presence {
                        peer_id: self.client_id_or_default().await,
                        state: PresenceState::Closing,
                    })
                    .await;
            }
        }

        let _ = self.leave_room().await;
        self.close_all_peers().await;

        if let Some(client) = self.signaling.write().await.take() {
            client.close();
        }
    }

    async fn client_id_or_default(&self) -> String {
        self.client_id().await.unwrap_or_default()
    }

    async fn require_signaling(&self) -> Result<Arc<SignalingClient>> {
        self.signaling
            .read()
            .await
            .as_ref()
            .cloned()
            .ok_or_else(|| Error::Signaling("Not connected to relay".to_string()))
    }

    async fn mux_for(&self, peer_id: &str) -> Result<Arc<Multiplexer>> {
        let mux_slot = {
            let peers = self.peers.read().await;
            let entry = peers
                .get(peer_id)
                .ok_or_else(|| Error::Signaling(format!("No session with peer {}", peer_id)))?;
            Arc::clone(&entry.mux)
        };
        let mux = mux_slot
            .read()
            .await
            .as_ref()
            .cloned()
            .ok_or_else(|| Error::DataChannel(format!("No control channel with {}", peer_id)));
        mux
    }

    /// Single dispatch loop over inbound relay envelopes
    async fn run_envelope_loop(self: Arc<Self>, mut envelopes: EnvelopeReceiver) {
        while let Some(envelope) = envelopes.recv().await {
            match envelope {
                Envelope::PeerJoined { peer_id } => {
                    info!(peer_id = %peer_id, "Peer joined room");
                    if self.config.role == PeerRole::Host {
                        if let Err(e) = self.initiate_peer(peer_id.clone()).await {
                            warn!(peer_id = %peer_id, "Failed to initiate peer: {}", e);
                        }
                    }
                }

                Envelope::PeerLeft { peer_id } | Envelope::PeerDisconnected { peer_id } => {
                    info!(peer_id = %peer_id, "Peer gone");
                    self.remove_peer(&peer_id).await;
                }

                Envelope::Offer { from, sdp, .. } => {
                    self.handle_remote_offer(from, sdp).await;
                }

                Envelope::Answer { from, sdp, .. } => {
                    let negotiator = self.peers.read().await.get(&from).map(|p| {
                        Arc::clone(&p.negotiator)
                    });
                    match negotiator {
                        Some(negotiator) => {
                            if let Err(e) = negotiator.handle_answer(sdp).await {
                                warn!(peer_id = %from, "Answer rejected: {}", e);
                            }
                        }
                        None => debug!(peer_id = %from, "Answer from unknown peer dropped"),
                    }
                }

                Envelope::IceCandidate {
                    from,
                    candidate,
                    sdp_mid,
                    sdp_mline_index,
                    ..
                } => {
                    let negotiator = self.peers.read().await.get(&from).map(|p| {
                        Arc::clone(&p.negotiator)
                    });
                    match negotiator {
                        Some(negotiator) => {
                            if let Err(e) = negotiator
                                .handle_candidate(candidate, sdp_mid, sdp_mline_index)
                                .await
                            {
                                warn!(peer_id = %from, "Candidate rejected: {}", e);
                            }
                        }
                        None => debug!(peer_id = %from, "Candidate from unknown peer dropped"),
                    }
                }

                Envelope::RoomLeft { room_id } => {
                    let mut room = self.room.write().await;
                    if room.as_deref() == Some(room_id.as_str()) {
                        // dissolution or our own leave acknowledged
                        *room = None;
                        drop(room);
                        self.close_all_peers().await;
                        info!(room_id = %room_id, "No longer in room");
                    }
                }

                Envelope::Unauthorized { message } => {
                    warn!("Relay refused an operation: {}", message);
                    let _ = self.events_tx.send(SessionEvent::Unauthorized { message });
                }

                Envelope::Error { message } => {
                    warn!("Relay error: {}", message);
                }

                Envelope::Pong | Envelope::Ping => {}

                other => {
                    debug!(kind = other.kind(), "Ignoring unexpected relay envelope");
                }
            }
        }

        // The relay connection is gone; recover with backoff unless closing.
        let _ = self
            .events_tx
            .send(SessionEvent::RelayConnection { connected: false });
        if !self.closed.load(Ordering::SeqCst) {
            warn!("Relay connection lost, starting reconnect loop");
            let session = Arc::clone(&self);
            tokio::spawn(session.run_relay_reconnect());
        }
    }

    /// Relay reconnect loop: backoff, re-register, re-announce room presence
    ///
    /// Returns a boxed future so its `Send`-ness is a concrete, nameable type
    /// rather than an opaque `impl Future`; this breaks the auto-trait
    /// inference cycle with `run_envelope_loop`, which spawns this task.
    fn run_relay_reconnect(
        self: Arc<Self>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> {
        Box::pin(async move {
        let mut backoff = Backoff::new(self.config.reconnect.clone());

        loop {
            if self.closed.load(Ordering::SeqCst) {
                return;
            }
            let Some(delay) = backoff.next_delay() else {
                error!("Relay reconnect budget exhausted, giving up");
                return;
            };
            tokio::time::sleep(delay).await;

            match SignalingClient::connect(
                &self.config.relay_url,
                self.config.role,
                self.config.display_token.clone(),
            )
            .await
            {
                Ok((client, envelopes)) => {
                    let client = Arc::new(client);
                    info!(client_id = %client.client_id(), "Relay connection re-established");
                    *self.signaling.write().await = Some(Arc::clone(&client));
                    let _ = self.events_tx.send(SessionEvent::Authorized {
                        client_id: client.client_id().clone(),
                    });
                    let _ = self
                        .events_tx
                        .send(SessionEvent::RelayConnection { connected: true });

                    // Still a member according to local state: re-announce by
                    // rejoining under the fresh registration.
                    let room = self.room.read().await.clone();
                    if let Some(room_id) = room {
                        match self.join_room(&room_id).await {
                            Ok(_) => info!(room_id = %room_id, "Room presence re-announced"),
                            Err(e) => {
                                warn!(room_id = %room_id, "Failed to re-announce presence: {}", e)
                            }
                        }
                    }

                    let session = Arc::clone(&self);
                    tokio::spawn(async move {
                        session.run_envelope_loop(envelopes).await;
                    });
                    return;
                }
                Err(e) => {
                    warn!(attempt = backoff.attempt(), "Relay reconnect failed: {}", e);
                }
            }
        }
        })
    }

    /// Create the negotiator for a peer and send the initial offer
    async fn initiate_peer(self: &Arc<Self>, peer_id: ClientId) -> Result<()> {
        if self.peers.read().await.contains_key(&peer_id) {
            debug!(peer_id = %peer_id, "Peer already has a negotiator");
            return Ok(());
        }

        let negotiator = self.spawn_peer(peer_id.clone()).await?;

        if let Some(source) = self.media.read().await.as_ref() {
            negotiator.attach_media(Arc::clone(source)).await?;
        }
        negotiator.start_offer().await
    }

    /// Handle a relayed offer, resolving glare by client-id comparison
    async fn handle_remote_offer(self: &Arc<Self>, from: ClientId, sdp: String) {
        let existing = self.peers.read().await.get(&from).map(|p| {
            Arc::clone(&p.negotiator)
        });

        let negotiator = match existing {
            Some(negotiator) if negotiator.offer_in_flight() => {
                if negotiator.wins_glare() {
                    // our offer wins; the peer discards its own and answers
                    debug!(peer_id = %from, "Glare: discarding remote offer, ours wins");
                    return;
                }
                // our offer loses and the transport cannot roll it back;
                // rebuild the pair state and answer theirs
                debug!(peer_id = %from, "Glare: yielding, rebuilding pair state");
                self.remove_peer(&from).await;
                match self.spawn_peer(from.clone()).await {
                    Ok(negotiator) => negotiator,
                    Err(e) => {
                        warn!(peer_id = %from, "Failed to rebuild negotiator: {}", e);
                        return;
                    }
                }
            }
            Some(negotiator) => negotiator,
            None => match self.spawn_peer(from.clone()).await {
                Ok(negotiator) => negotiator,
                Err(e) => {
                    warn!(peer_id = %from, "Failed to create negotiator: {}", e);
                    return;
                }
            },
        };

        if let Err(e) = negotiator.handle_offer(sdp).await {
            warn!(peer_id = %from, "Offer rejected: {}", e);
        }
    }

    /// Build a negotiator plus its supervision tasks and register the peer
    async fn spawn_peer(self: &Arc<Self>, peer_id: ClientId) -> Result<Arc<Negotiator>> {
        let client = self.require_signaling().await?;
        let local_id = client.client_id().clone();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Envelope>();
        let negotiator = Negotiator::new(
            local_id,
            peer_id.clone(),
            &self.config,
            out_tx,
            self.events_tx.clone(),
        )
        .await?;

        let mux_slot: Arc<RwLock<Option<Arc<Multiplexer>>>> = Arc::new(RwLock::new(None));
        let mut tasks = Vec::new();

        // Outbound signaling bridge; resolves the signaling client per send
        // so it survives a relay reconnect.
        {
            let session = Arc::clone(self);
            tasks.push(tokio::spawn(async move {
                while let Some(envelope) = out_rx.recv().await {
                    let client = session.signaling.read().await.as_ref().cloned();
                    match client {
                        Some(client) => {
                            if let Err(e) = client.send(envelope) {
                                debug!("Dropping outbound envelope: {}", e);
                            }
                        }
                        None => debug!("No relay connection, dropping outbound envelope"),
                    }
                }
            }));
        }

        // Control channels become multiplexers as they arrive.
        {
            let session = Arc::clone(self);
            let negotiator = Arc::clone(&negotiator);
            let mux_slot = Arc::clone(&mux_slot);
            let peer = peer_id.clone();
            tasks.push(tokio::spawn(async move {
                let Some(mut channels) = negotiator.take_data_channels().await else {
                    return;
                };
                while let Some(channel) = channels.recv().await {
                    match Multiplexer::attach(
                        peer.clone(),
                        channel,
                        session.config.security.clone(),
                        session.config.channel.clone(),
                        Arc::clone(&session.sink),
                        session.events_tx.clone(),
                    ) {
                        Ok(mux) => {
                            *mux_slot.write().await = Some(mux);
                        }
                        Err(e) => warn!(peer_id = %peer, "Control channel refused: {}", e),
                    }
                }
            }));
        }

        // Transport supervision: establishment timeout, failure recovery,
        // and health-driven renegotiation.
        {
            let session = Arc::clone(self);
            let negotiator = Arc::clone(&negotiator);
            let peer = peer_id.clone();

            let (actions_tx, actions_rx) = mpsc::unbounded_channel();
            let monitor = HealthMonitor::new(
                peer.clone(),
                self.config.health.clone(),
                negotiator.metrics(),
                self.events_tx.clone(),
                actions_tx,
            );
            tasks.push(tokio::spawn(monitor.run()));
            tasks.push(tokio::spawn(async move {
                session.supervise_transport(peer, negotiator, actions_rx).await;
            }));
        }

        self.peers.write().await.insert(
            peer_id,
            PeerEntry {
                negotiator: Arc::clone(&negotiator),
                mux: mux_slot,
                tasks,
            },
        );

        Ok(negotiator)
    }

    /// Drive one peer transport until it closes
    async fn supervise_transport(
        self: Arc<Self>,
        peer_id: ClientId,
        negotiator: Arc<Negotiator>,
        mut actions: mpsc::UnboundedReceiver<RecoveryAction>,
    ) {
        let Some(mut signals) = negotiator.take_signals().await else {
            return;
        };
        let establish_timeout = self.config.negotiation.establish_timeout;
        let mut actions_open = true;

        loop {
            let awaiting_establishment = matches!(
                negotiator.state(),
                NegotiationState::Offering
                    | NegotiationState::Answering
                    | NegotiationState::Negotiating
                    | NegotiationState::Reconnecting
            );

            tokio::select! {
                signal = signals.recv() => match signal {
                    Some(TransportSignal::Established) => {
                        info!(peer_id = %peer_id, "Transport established");
                        negotiator.mark_established();
                    }
                    Some(TransportSignal::Failed) => {
                        warn!(peer_id = %peer_id, "Transport failed, renegotiating");
                        if !self.try_renegotiate(&peer_id, &negotiator).await {
                            break;
                        }
                    }
                    Some(TransportSignal::Closed) | None => break,
                },

                action = actions.recv(), if actions_open => match action {
                    Some(RecoveryAction::QualityDegraded) => negotiator.mark_degraded(),
                    Some(RecoveryAction::QualityRecovered) => negotiator.mark_recovered(),
                    Some(RecoveryAction::RenegotiateTransport) => {
                        if !self.try_renegotiate(&peer_id, &negotiator).await {
                            break;
                        }
                    }
                    // the monitor is gone; supervision continues on signals
                    None => actions_open = false,
                },

                _ = tokio::time::sleep(establish_timeout), if awaiting_establishment => {
                    warn!(peer_id = %peer_id, "Establishment timed out, renegotiating");
                    if !self.try_renegotiate(&peer_id, &negotiator).await {
                        break;
                    }
                }
            }
        }

        debug!(peer_id = %peer_id, "Transport supervision ended");
    }

    /// Returns false when the budget is exhausted and the session closed
    async fn try_renegotiate(&self, peer_id: &str, negotiator: &Arc<Negotiator>) -> bool {
        match negotiator.renegotiate().await {
            Ok(()) => true,
            Err(Error::RetriesExhausted(e)) => {
                error!(peer_id = %peer_id, "Recovery exhausted: {}", e);
                false
            }
            Err(e) => {
                warn!(peer_id = %peer_id, "Renegotiation attempt failed: {}", e);
                true
            }
        }
    }

    async fn remove_peer(&self, peer_id: &str) {
        let entry = self.peers.write().await.remove(peer_id);
        if let Some(entry) = entry {
            entry.abort_tasks();
            if let Err(e) = entry.negotiator.close().await {
                debug!(peer_id = %peer_id, "Error closing negotiator: {}", e);
            }
        }
    }

    async fn close_all_peers(&self) {
        let peers: Vec<ClientId> = self.peers.read().await.keys().cloned().collect();
        for peer_id in peers {
            self.remove_peer(&peer_id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::MemorySink;

    fn test_config() -> SessionConfig {
        let mut config = SessionConfig::default();
        config.reconnect.jitter_enabled = false;
        config.reconnect.backoff_initial_ms = 1;
        config.reconnect.backoff_max_ms = 2;
        config
    }

    #[tokio::test]
    async fn test_new_validates_config() {
        let mut config = test_config();
        config.relay_url = "http://not-a-ws".to_string();
        assert!(Session::new(config, Arc::new(MemorySink::new())).is_err());
    }

    #[tokio::test]
    async fn test_operations_require_relay_connection() {
        let (session, _events) = Session::new(test_config(), Arc::new(MemorySink::new())).unwrap();

        assert!(matches!(
            session.create_room(None).await,
            Err(Error::Signaling(_))
        ));
        assert!(matches!(
            session.join_room("room-1").await,
            Err(Error::Signaling(_))
        ));
        assert!(session.client_id().await.is_none());
    }

    #[tokio::test]
    async fn test_leave_room_is_idempotent_without_room() {
        let (session, _events) = Session::new(test_config(), Arc::new(MemorySink::new())).unwrap();
        session.leave_room().await.unwrap();
        session.leave_room().await.unwrap();
    }

    #[tokio::test]
    async fn test_failure_signal_drives_renegotiation() {
        let (session, mut events) =
            Session::new(test_config(), Arc::new(MemorySink::new())).unwrap();

        // a negotiator wired directly, bypassing the relay
        let (out_tx, _out_rx) = mpsc::unbounded_channel();
        let negotiator = Negotiator::new(
            "local".to_string(),
            "remote".to_string(),
            &session.config,
            out_tx,
            session.events_tx.clone(),
        )
        .await
        .unwrap();

        let (_actions_tx, actions_rx) = mpsc::unbounded_channel();
        let supervisor = tokio::spawn({
            let session = Arc::clone(&session);
            let negotiator = Arc::clone(&negotiator);
            async move {
                session
                    .supervise_transport("remote".to_string(), negotiator, actions_rx)
                    .await;
            }
        });

        negotiator.inject_signal(TransportSignal::Failed);

        // the supervisor reacts with a renegotiation: reconnecting state
        let deadline = tokio::time::Duration::from_secs(5);
        let reached = tokio::time::timeout(deadline, async {
            loop {
                if let Some(SessionEvent::ConnectionState { state, .. }) = events.recv().await {
                    if state == NegotiationState::Reconnecting {
                        return;
                    }
                }
            }
        })
        .await;
        assert!(reached.is_ok(), "supervisor never entered reconnecting");

        negotiator.inject_signal(TransportSignal::Closed);
        let _ = tokio::time::timeout(deadline, supervisor).await;
    }

    #[tokio::test]
    async fn test_recovery_exhaustion_closes_with_error() {
        let mut config = test_config();
        config.negotiation.max_renegotiations = 1;
        let (session, mut events) = Session::new(config, Arc::new(MemorySink::new())).unwrap();

        let (out_tx, _out_rx) = mpsc::unbounded_channel();
        let negotiator = Negotiator::new(
            "local".to_string(),
            "remote".to_string(),
            &session.config,
            out_tx,
            session.events_tx.clone(),
        )
        .await
        .unwrap();

        let (_actions_tx, actions_rx) = mpsc::unbounded_channel();
        let supervisor = tokio::spawn({
            let session = Arc::clone(&session);
            let negotiator = Arc::clone(&negotiator);
            async move {
                session
                    .supervise_transport("remote".to_string(), negotiator, actions_rx)
                    .await;
            }
        });

        // two failures exhaust a budget of one
        negotiator.inject_signal(TransportSignal::Failed);
        negotiator.inject_signal(TransportSignal::Failed);

        let deadline = tokio::time::Duration::from_secs(5);
        let reached = tokio::time::timeout(deadline, async {
            loop {
                if let Some(SessionEvent::ConnectionState { state, .. }) = events.recv().await {
                    if state == NegotiationState::Closed {
                        return;
                    }
                }
            }
        })
        .await;
        assert!(reached.is_ok(), "session never closed");
        assert_eq!(negotiator.state(), NegotiationState::Closed);

        let _ = tokio::time::timeout(deadline, supervisor).await;
    }
}
