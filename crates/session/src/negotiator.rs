//! Per-peer negotiation state machine
//!
//! One negotiator per ordered pair of peers attempting a direct transport.
//! It drives the offer/answer/candidate exchange over the relay, buffers
//! remote candidates that arrive before the remote description, resolves
//! offer glare by comparing client ids, and performs bounded full
//! renegotiation when the transport fails or degrades.

use deskbridge_core::protocol::{ClientId, Envelope};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::backoff::ReconnectPolicy;
use crate::collaborators::MediaSource;
use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::events::{EventSender, SessionEvent};
use crate::health::MetricsHandle;

/// Label of the control data channel
pub const CONTROL_CHANNEL_LABEL: &str = "control";

/// Negotiation state for one peer pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    /// No exchange started
    Idle,
    /// Local offer sent, awaiting answer
    Offering,
    /// Remote offer received, producing an answer
    Answering,
    /// Descriptions exchanged, ICE in progress
    Negotiating,
    /// Transport established
    Connected,
    /// Still nominally connected, but quality or connectivity degraded
    Degraded,
    /// Tearing down and redoing the exchange
    Reconnecting,
    /// Done, by request or by exhausted recovery
    Closed,
}

/// Transport-level signals consumed by the session supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportSignal {
    /// The transport reached the established state
    Established,
    /// The transport reported a hard failure
    Failed,
    /// The transport closed
    Closed,
}

/// State machine for one peer pair
pub struct Negotiator {
    local_id: ClientId,
    remote_id: ClientId,

    pc: Arc<RTCPeerConnection>,

    state_tx: watch::Sender<NegotiationState>,
    signal_tx: mpsc::UnboundedSender<TransportSignal>,
    signal_rx: Mutex<Option<mpsc::UnboundedReceiver<TransportSignal>>>,

    /// Control channels from either side of the exchange: the offerer's
    /// locally created one and the answerer's remotely announced one both
    /// come through here
    channel_tx: mpsc::UnboundedSender<Arc<RTCDataChannel>>,
    channel_rx: Mutex<Option<mpsc::UnboundedReceiver<Arc<RTCDataChannel>>>>,

    /// Outbound signaling envelopes, pre-addressed, sent via the relay
    out_tx: mpsc::UnboundedSender<Envelope>,
    events: EventSender,

    /// Candidates from the peer that arrived before the remote description;
    /// applied in arrival order once it is set, never dropped
    pending_remote: Mutex<Vec<RTCIceCandidateInit>>,
    remote_description_set: AtomicBool,

    /// A local offer is in flight; used for glare detection
    offer_pending: AtomicBool,

    /// Consecutive renegotiations; reset when the transport establishes
    attempts: AtomicU32,
    policy: ReconnectPolicy,
    max_renegotiations: u32,

    media: RwLock<Option<(Arc<dyn MediaSource>, Arc<TrackLocalStaticSample>)>>,
    metrics: Arc<MetricsHandle>,
}

impl Negotiator {
    /// Create a negotiator for the pair (`local_id`, `remote_id`)
    pub async fn new(
        local_id: ClientId,
        remote_id: ClientId,
        config: &SessionConfig,
        out_tx: mpsc::UnboundedSender<Envelope>,
        events: EventSender,
    ) -> Result<Arc<Self>> {
        info!(local = %local_id, remote = %remote_id, "Creating negotiator");

        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| Error::WebRtc(format!("Failed to register codecs: {}", e)))?;

        let interceptor_registry = register_default_interceptors(Default::default(), &mut media_engine)
            .map_err(|e| Error::WebRtc(format!("Failed to register interceptors: {}", e)))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(interceptor_registry)
            .build();

        let ice_servers: Vec<RTCIceServer> = config
            .stun_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .chain(config.turn_servers.iter().map(|turn| {
                RTCIceServer {
                    urls: vec![turn.url.clone()],
                    username: turn.username.clone(),
                    credential: turn.credential.clone(),
                }
            }))
            .collect();

        let pc = Arc::new(
            api.new_peer_connection(RTCConfiguration {
                ice_servers,
                ..Default::default()
            })
            .await
            .map_err(|e| Error::WebRtc(format!("Failed to create peer connection: {}", e)))?,
        );

        let (state_tx, _) = watch::channel(NegotiationState::Idle);
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (channel_tx, channel_rx) = mpsc::unbounded_channel();
        let metrics = Arc::new(MetricsHandle::new());

        let negotiator = Arc::new(Self {
            local_id: local_id.clone(),
            remote_id: remote_id.clone(),
            pc,
            state_tx,
            signal_tx: signal_tx.clone(),
            signal_rx: Mutex::new(Some(signal_rx)),
            channel_tx: channel_tx.clone(),
            channel_rx: Mutex::new(Some(channel_rx)),
            out_tx,
            events: events.clone(),
            pending_remote: Mutex::new(Vec::new()),
            remote_description_set: AtomicBool::new(false),
            offer_pending: AtomicBool::new(false),
            attempts: AtomicU32::new(0),
            policy: config.reconnect.clone(),
            max_renegotiations: config.negotiation.max_renegotiations,
            media: RwLock::new(None),
            metrics: Arc::clone(&metrics),
        });

        // Transport state changes drive our state machine and the
        // supervisor's signals.
        {
            let this = Arc::downgrade(&negotiator);
            negotiator.pc.on_peer_connection_state_change(Box::new(
                move |s: RTCPeerConnectionState| {
                    let this = this.clone();
                    Box::pin(async move {
                        let Some(this) = this.upgrade() else { return };
                        match s {
                            RTCPeerConnectionState::Connected => {
                                this.metrics.set_connected(true);
                                this.set_state(NegotiationState::Connected);
                                let _ = this.signal_tx.send(TransportSignal::Established);
                            }
                            RTCPeerConnectionState::Disconnected => {
                                this.metrics.set_connected(false);
                                // transient per ICE; the supervisor acts only
                                // on Failed
                                if this.state() == NegotiationState::Connected {
                                    this.set_state(NegotiationState::Degraded);
                                }
                            }
                            RTCPeerConnectionState::Failed => {
                                this.metrics.set_connected(false);
                                let _ = this.signal_tx.send(TransportSignal::Failed);
                            }
                            RTCPeerConnectionState::Closed => {
                                this.metrics.set_connected(false);
                                let _ = this.signal_tx.send(TransportSignal::Closed);
                            }
                            _ => {}
                        }
                    })
                },
            ));
        }

        // Local candidates go out as they are gathered.
        {
            let out_tx = negotiator.out_tx.clone();
            let from = local_id.clone();
            let to = remote_id.clone();
            negotiator
                .pc
                .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                    let out_tx = out_tx.clone();
                    let from = from.clone();
                    let to = to.clone();
                    Box::pin(async move {
                        let Some(candidate) = candidate else { return };
                        match candidate.to_json() {
                            Ok(init) => {
                                let _ = out_tx.send(Envelope::IceCandidate {
                                    from,
                                    to,
                                    candidate: init.candidate,
                                    sdp_mid: init.sdp_mid,
                                    sdp_mline_index: init.sdp_mline_index,
                                });
                            }
                            Err(e) => warn!("Failed to serialize local candidate: {}", e),
                        }
                    })
                }));
        }

        // The answering side receives the control channel from the offerer.
        {
            let channel_tx = channel_tx.clone();
            negotiator
                .pc
                .on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
                    let channel_tx = channel_tx.clone();
                    Box::pin(async move {
                        debug!("Remote data channel: {}", channel.label());
                        let _ = channel_tx.send(channel);
                    })
                }));
        }

        // Remote media tracks surface as stream events.
        {
            let events = events.clone();
            let peer_id = remote_id.clone();
            negotiator.pc.on_track(Box::new(move |track, _receiver, _transceiver| {
                let events = events.clone();
                let peer_id = peer_id.clone();
                Box::pin(async move {
                    info!(peer_id = %peer_id, "Remote track received");
                    let _ = events.send(SessionEvent::Stream {
                        peer_id,
                        track,
                    });
                })
            }));
        }

        Ok(negotiator)
    }

    /// Remote peer id
    pub fn remote_id(&self) -> &ClientId {
        &self.remote_id
    }

    /// Whether a local offer is awaiting its answer
    pub fn offer_in_flight(&self) -> bool {
        self.offer_pending.load(Ordering::SeqCst)
    }

    /// Glare rule: the lexically smaller client id's offer wins
    pub fn wins_glare(&self) -> bool {
        self.local_id < self.remote_id
    }

    /// Current state
    pub fn state(&self) -> NegotiationState {
        *self.state_tx.borrow()
    }

    /// Subscribe to state transitions
    pub fn subscribe(&self) -> watch::Receiver<NegotiationState> {
        self.state_tx.subscribe()
    }

    /// Take the transport signal receiver (available once)
    pub async fn take_signals(&self) -> Option<mpsc::UnboundedReceiver<TransportSignal>> {
        self.signal_rx.lock().await.take()
    }

    /// Take the data channel receiver (available once)
    pub async fn take_data_channels(
        &self,
    ) -> Option<mpsc::UnboundedReceiver<Arc<RTCDataChannel>>> {
        self.channel_rx.lock().await.take()
    }

    /// Shared metrics handle for the health monitor
    pub fn metrics(&self) -> Arc<MetricsHandle> {
        Arc::clone(&self.metrics)
    }

    /// Attach the pending local media source
    ///
    /// Creates the outbound video track, adds it to the connection, and hands
    /// it to the provider to feed. Must happen before the offer so the track
    /// is in the SDP.
    pub async fn attach_media(&self, source: Arc<dyn MediaSource>) -> Result<()> {
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: "video/VP8".to_string(),
                clock_rate: 90000,
                channels: 0,
                sdp_fmtp_line: String::new(),
                rtcp_feedback: vec![],
            },
            format!("video-{}", self.remote_id),
            format!("stream-{}", self.local_id),
        ));

        self.pc
            .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| Error::MediaTrack(format!("Failed to add video track: {}", e)))?;

        source.attach(Arc::clone(&track)).await?;
        *self.media.write().await = Some((source, track));

        debug!(remote = %self.remote_id, "Media source attached");
        Ok(())
    }

    /// Send the initial offer
    ///
    /// Creates the control data channel first so it is part of the SDP.
    pub async fn start_offer(&self) -> Result<()> {
        self.set_state(NegotiationState::Offering);
        self.create_control_channel().await?;

        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| Error::DescriptionRejected(format!("Failed to create offer: {}", e)))?;
        self.pc
            .set_local_description(offer)
            .await
            .map_err(|e| Error::DescriptionRejected(format!("Failed to set offer: {}", e)))?;
        let sdp = self.local_sdp().await?;

        self.offer_pending.store(true, Ordering::SeqCst);
        self.send_envelope(Envelope::Offer {
            from: self.local_id.clone(),
            to: self.remote_id.clone(),
            sdp,
        })?;

        debug!(remote = %self.remote_id, "Offer sent");
        Ok(())
    }

    /// Handle a remote offer and answer it
    ///
    /// An offer arriving while ours is in flight is glare; the session
    /// resolves it by id comparison (the lexically smaller id's offer wins)
    /// before calling here, so an in-flight local offer is reported as
    /// [`Error::Glare`] rather than fed to the transport, which cannot roll
    /// a local offer back. An offer while connected is a renegotiation
    /// request and is answered like any other.
    pub async fn handle_offer(&self, sdp: String) -> Result<()> {
        if self.offer_pending.load(Ordering::SeqCst) {
            return Err(Error::Glare(format!(
                "Offer from {} while ours is in flight",
                self.remote_id
            )));
        }

        self.set_state(NegotiationState::Answering);

        let offer = RTCSessionDescription::offer(sdp)
            .map_err(|e| Error::DescriptionRejected(format!("Malformed offer: {}", e)))?;
        self.pc
            .set_remote_description(offer)
            .await
            .map_err(|e| Error::DescriptionRejected(format!("Failed to set offer: {}", e)))?;
        self.remote_description_set.store(true, Ordering::SeqCst);
        self.drain_pending_candidates().await;

        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| Error::DescriptionRejected(format!("Failed to create answer: {}", e)))?;
        self.pc
            .set_local_description(answer)
            .await
            .map_err(|e| Error::DescriptionRejected(format!("Failed to set answer: {}", e)))?;
        let sdp = self.local_sdp().await?;

        self.send_envelope(Envelope::Answer {
            from: self.local_id.clone(),
            to: self.remote_id.clone(),
            sdp,
        })?;
        self.set_state(NegotiationState::Negotiating);

        debug!(remote = %self.remote_id, "Answer sent");
        Ok(())
    }

    /// Handle the remote answer to our offer
    pub async fn handle_answer(&self, sdp: String) -> Result<()> {
        if !self.offer_pending.swap(false, Ordering::SeqCst) {
            return Err(Error::DescriptionRejected(
                "Answer received without a pending offer".to_string(),
            ));
        }

        let answer = RTCSessionDescription::answer(sdp)
            .map_err(|e| Error::DescriptionRejected(format!("Malformed answer: {}", e)))?;
        self.pc
            .set_remote_description(answer)
            .await
            .map_err(|e| Error::DescriptionRejected(format!("Failed to set answer: {}", e)))?;
        self.remote_description_set.store(true, Ordering::SeqCst);
        self.drain_pending_candidates().await;
        self.set_state(NegotiationState::Negotiating);

        debug!(remote = %self.remote_id, "Answer applied");
        Ok(())
    }

    /// Handle a remote ICE candidate
    ///
    /// Candidates arriving before the remote description are buffered and
    /// applied in arrival order once it is set.
    pub async fn handle_candidate(
        &self,
        candidate: String,
        sdp_mid: Option<String>,
        sdp_mline_index: Option<u16>,
    ) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate,
            sdp_mid,
            sdp_mline_index,
            username_fragment: None,
        };

        if !self.remote_description_set.load(Ordering::SeqCst) {
            let mut pending = self.pending_remote.lock().await;
            pending.push(init);
            debug!(
                remote = %self.remote_id,
                buffered = pending.len(),
                "Buffered early candidate"
            );
            return Ok(());
        }

        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| Error::CandidateRejected(format!("Failed to add candidate: {}", e)))
    }

    /// Number of candidates waiting for the remote description
    pub async fn pending_candidates(&self) -> usize {
        self.pending_remote.lock().await.len()
    }

    /// Full renegotiation: backoff, then a fresh offer with ICE restart
    ///
    /// Bounded by the renegotiation budget; exhausting it closes the session
    /// with [`Error::RetriesExhausted`]. The budget resets whenever the
    /// transport establishes, so only consecutive failures count.
    pub async fn renegotiate(&self) -> Result<()> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt >= self.max_renegotiations {
            warn!(remote = %self.remote_id, attempts = attempt, "Renegotiation budget exhausted");
            self.close().await?;
            return Err(Error::RetriesExhausted(format!(
                "Gave up on {} after {} renegotiations",
                self.remote_id, attempt
            )));
        }

        let backoff = self.policy.calculate_backoff(attempt);
        info!(
            remote = %self.remote_id,
            attempt = attempt + 1,
            budget = self.max_renegotiations,
            backoff_ms = backoff.as_millis() as u64,
            "Renegotiating"
        );

        self.set_state(NegotiationState::Reconnecting);
        tokio::time::sleep(backoff).await;

        // Fresh exchange rather than incremental repair: new offer with ICE
        // restart, remote description considered unset until the answer.
        self.remote_description_set.store(false, Ordering::SeqCst);
        let offer = self
            .pc
            .create_offer(Some(RTCOfferOptions {
                ice_restart: true,
                ..Default::default()
            }))
            .await
            .map_err(|e| Error::DescriptionRejected(format!("ICE restart failed: {}", e)))?;
        self.pc
            .set_local_description(offer)
            .await
            .map_err(|e| Error::DescriptionRejected(format!("Failed to set offer: {}", e)))?;
        let sdp = self.local_sdp().await?;

        self.offer_pending.store(true, Ordering::SeqCst);
        self.send_envelope(Envelope::Offer {
            from: self.local_id.clone(),
            to: self.remote_id.clone(),
            sdp,
        })?;

        Ok(())
    }

    /// Reset the renegotiation budget; called when the transport establishes
    pub fn mark_established(&self) {
        self.attempts.store(0, Ordering::SeqCst);
    }

    /// Quality fell below thresholds while still nominally connected
    pub fn mark_degraded(&self) {
        if self.state() == NegotiationState::Connected {
            self.set_state(NegotiationState::Degraded);
        }
    }

    /// Quality came back; undo a degraded marking
    pub fn mark_recovered(&self) {
        if self.state() == NegotiationState::Degraded {
            self.set_state(NegotiationState::Connected);
        }
    }

    /// Close the connection and release transport resources; idempotent
    pub async fn close(&self) -> Result<()> {
        if self.state() == NegotiationState::Closed {
            return Ok(());
        }
        info!(remote = %self.remote_id, "Closing negotiator");
        self.set_state(NegotiationState::Closed);

        if let Some((source, _track)) = self.media.write().await.take() {
            source.detach().await;
        }
        self.metrics.set_connected(false);

        self.pc
            .close()
            .await
            .map_err(|e| Error::WebRtc(format!("Failed to close connection: {}", e)))
    }

    async fn create_control_channel(&self) -> Result<()> {
        let channel = self
            .pc
            .create_data_channel(
                CONTROL_CHANNEL_LABEL,
                Some(RTCDataChannelInit {
                    ordered: Some(true),
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| Error::DataChannel(format!("Failed to create control channel: {}", e)))?;

        let _ = self.channel_tx.send(channel);
        Ok(())
    }

    async fn drain_pending_candidates(&self) {
        let pending: Vec<RTCIceCandidateInit> =
            std::mem::take(&mut *self.pending_remote.lock().await);
        if pending.is_empty() {
            return;
        }

        debug!(
            remote = %self.remote_id,
            count = pending.len(),
            "Applying buffered candidates in arrival order"
        );
        for init in pending {
            if let Err(e) = self.pc.add_ice_candidate(init).await {
                // redundant or stale candidates are tolerated; the transport
                // dedups pairs itself
                warn!(remote = %self.remote_id, "Buffered candidate rejected: {}", e);
            }
        }
    }

    async fn local_sdp(&self) -> Result<String> {
        self.pc
            .local_description()
            .await
            .map(|d| d.sdp)
            .ok_or_else(|| {
                Error::DescriptionRejected("No local description after setting it".to_string())
            })
    }

    fn send_envelope(&self, envelope: Envelope) -> Result<()> {
        self.out_tx
            .send(envelope)
            .map_err(|_| Error::Signaling("Signaling channel closed".to_string()))
    }

    fn set_state(&self, new_state: NegotiationState) {
        let changed = self.state_tx.send_if_modified(|state| {
            if *state != new_state {
                *state = new_state;
                true
            } else {
                false
            }
        });
        if changed {
            debug!(remote = %self.remote_id, state = ?new_state, "State transition");
            let _ = self.events.send(SessionEvent::ConnectionState {
                peer_id: self.remote_id.clone(),
                state: new_state,
            });
        }
    }

    #[cfg(test)]
    pub(crate) fn inject_signal(&self, signal: TransportSignal) {
        let _ = self.signal_tx.send(signal);
    }
}
