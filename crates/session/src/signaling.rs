//! Signaling client
//!
//! One instance covers one relay connection's lifetime: connect, take the
//! `welcome` handshake, then pump envelopes both ways. Room operations are
//! request/reply with a timeout; the relay answers a connection's requests in
//! order, so replies are matched first-in-first-out. Everything that is not a
//! reply (peer-joined, relayed offers, candidates) flows out of the envelope
//! receiver handed back from [`SignalingClient::connect`].
//!
//! When the connection drops the receiver ends; reconnecting with backoff is
//! the session supervisor's job, not this client's.

use deskbridge_core::protocol::{ClientId, Envelope, PeerRole, RoomId, RoomSettings};
use futures_util::{SinkExt, StreamExt};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// How often the client heartbeats the relay
const PING_INTERVAL: Duration = Duration::from_secs(10);

enum Command {
    Send(Envelope),
    Request {
        envelope: Envelope,
        reply: oneshot::Sender<Envelope>,
    },
    Close,
}

/// Envelopes the session consumes: everything that is not a room-op reply
pub type EnvelopeReceiver = mpsc::UnboundedReceiver<Envelope>;

/// Client side of one relay connection
pub struct SignalingClient {
    client_id: ClientId,
    token: String,
    cmd_tx: mpsc::UnboundedSender<Command>,
}

impl SignalingClient {
    /// Connect, register, and announce the given role
    ///
    /// Returns the client plus the receiver of unsolicited envelopes. The
    /// receiver yields `None` once the relay connection is gone.
    pub async fn connect(
        url: &str,
        role: PeerRole,
        display_token: Option<String>,
    ) -> Result<(Self, EnvelopeReceiver)> {
        let (stream, _) = connect_async(url)
            .await
            .map_err(|e| Error::Signaling(format!("Relay connect failed: {}", e)))?;
        let (mut writer, mut reader) = stream.split();

        // Registration: the relay greets first.
        let (client_id, mut token) = match read_envelope(&mut reader).await? {
            Envelope::Welcome { client_id, token } => (client_id, token),
            other => {
                return Err(Error::Signaling(format!(
                    "Expected welcome, got {}",
                    other.kind()
                )))
            }
        };

        // Announce role and display token; rights follow the role, so the
        // relay reissues the token.
        writer
            .send(WsMessage::Text(
                Envelope::Announce {
                    display_token,
                    role,
                }
                .to_json()?,
            ))
            .await
            .map_err(|e| Error::Signaling(format!("Announce failed: {}", e)))?;
        match read_envelope(&mut reader).await? {
            Envelope::Welcome { token: fresh, .. } => token = fresh,
            other => {
                return Err(Error::Signaling(format!(
                    "Expected reissued welcome, got {}",
                    other.kind()
                )))
            }
        }

        info!(client_id = %client_id, "Registered with relay");

        let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<Command>();
        let (env_tx, env_rx) = mpsc::unbounded_channel::<Envelope>();

        let task_client_id = client_id.clone();
        tokio::spawn(async move {
            let mut pending: VecDeque<oneshot::Sender<Envelope>> = VecDeque::new();
            let mut ping = tokio::time::interval(PING_INTERVAL);
            ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ping.tick().await; // the first tick fires immediately

            loop {
                tokio::select! {
                    cmd = cmd_rx.recv() => match cmd {
                        Some(Command::Send(envelope)) => {
                            if send_envelope(&mut writer, &envelope).await.is_err() {
                                break;
                            }
                        }
                        Some(Command::Request { envelope, reply }) => {
                            if send_envelope(&mut writer, &envelope).await.is_err() {
                                break;
                            }
                            pending.push_back(reply);
                        }
                        Some(Command::Close) | None => {
                            let _ = writer.send(WsMessage::Close(None)).await;
                            break;
                        }
                    },
                    msg = reader.next() => match msg {
                        Some(Ok(WsMessage::Text(text))) => {
                            let envelope = match Envelope::from_json(&text) {
                                Ok(envelope) => envelope,
                                Err(e) => {
                                    warn!("Dropping malformed relay envelope: {}", e);
                                    continue;
                                }
                            };
                            if is_reply(&envelope) && !pending.is_empty() {
                                if let Some(reply) = pending.pop_front() {
                                    let _ = reply.send(envelope);
                                }
                            } else if env_tx.send(envelope).is_err() {
                                break;
                            }
                        }
                        Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_))) => {}
                        Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => break,
                        Some(Ok(_)) => {}
                    },
                    _ = ping.tick() => {
                        if send_envelope(&mut writer, &Envelope::Ping).await.is_err() {
                            break;
                        }
                    }
                }
            }

            // Pending requesters learn about the loss through the dropped
            // oneshot; the session learns through the closed receiver.
            debug!(client_id = %task_client_id, "Relay connection task ended");
        });

        Ok((
            Self {
                client_id,
                token,
                cmd_tx,
            },
            env_rx,
        ))
    }

    /// Our relay-assigned client id
    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    /// The token issued at registration
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Fire-and-forget send (offers, answers, candidates, pongs)
    pub fn send(&self, envelope: Envelope) -> Result<()> {
        self.cmd_tx
            .send(Command::Send(envelope))
            .map_err(|_| Error::Signaling("Relay connection lost".to_string()))
    }

    /// Create a room, optionally with a caller-supplied id
    pub async fn create_room(
        &self,
        room_id: Option<RoomId>,
        timeout: Duration,
    ) -> Result<RoomId> {
        let reply = self
            .request(
                Envelope::CreateRoom {
                    room_id,
                    token: self.token.clone(),
                },
                timeout,
            )
            .await?;

        match reply {
            Envelope::RoomCreated { room_id } => Ok(room_id),
            other => Err(room_op_failure("create-room", other)),
        }
    }

    /// Join a room, presenting an HMAC when a room secret is configured
    pub async fn join_room(
        &self,
        room_id: &str,
        hmac: Option<String>,
        timeout: Duration,
    ) -> Result<(Vec<ClientId>, RoomSettings)> {
        let reply = self
            .request(
                Envelope::JoinRoom {
                    room_id: room_id.to_string(),
                    token: self.token.clone(),
                    hmac,
                },
                timeout,
            )
            .await?;

        match reply {
            Envelope::RoomJoined { peers, settings, .. } => Ok((peers, settings)),
            other => Err(room_op_failure("join-room", other)),
        }
    }

    /// Leave a room; fire-and-forget, the caller is never blocked on
    /// acknowledgment
    pub fn leave_room(&self, room_id: &str) -> Result<()> {
        self.send(Envelope::LeaveRoom {
            room_id: room_id.to_string(),
        })
    }

    /// Close the relay connection
    pub fn close(&self) {
        let _ = self.cmd_tx.send(Command::Close);
    }

    async fn request(&self, envelope: Envelope, timeout: Duration) -> Result<Envelope> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Request {
                envelope,
                reply: reply_tx,
            })
            .map_err(|_| Error::Signaling("Relay connection lost".to_string()))?;

        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(envelope)) => Ok(envelope),
            Ok(Err(_)) => Err(Error::Signaling("Relay connection lost".to_string())),
            Err(_) => Err(Error::NegotiationTimeout(
                "Relay did not acknowledge room operation".to_string(),
            )),
        }
    }
}

/// Reply kinds for room operations; `room-left` is never matched here
/// because leaves are fire-and-forget, so it reaches the session as an event
/// (acknowledgment or room dissolution)
fn is_reply(envelope: &Envelope) -> bool {
    matches!(
        envelope,
        Envelope::RoomCreated { .. }
            | Envelope::RoomJoined { .. }
            | Envelope::Error { .. }
            | Envelope::Unauthorized { .. }
    )
}

fn room_op_failure(op: &str, reply: Envelope) -> Error {
    match reply {
        Envelope::Unauthorized { message } => Error::Unauthorized(message),
        Envelope::Error { message } => Error::Room(message),
        other => Error::Signaling(format!("Unexpected {} reply: {}", op, other.kind())),
    }
}

async fn send_envelope<S>(writer: &mut S, envelope: &Envelope) -> Result<()>
where
    S: futures_util::Sink<WsMessage> + Unpin,
    S::Error: std::fmt::Display,
{
    let json = envelope.to_json()?;
    writer
        .send(WsMessage::Text(json))
        .await
        .map_err(|e| Error::Signaling(format!("Relay send failed: {}", e)))
}

async fn read_envelope<S>(reader: &mut S) -> Result<Envelope>
where
    S: futures_util::Stream<
            Item = std::result::Result<WsMessage, tokio_tungstenite::tungstenite::Error>,
        > + Unpin,
{
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(10), reader.next())
            .await
            .map_err(|_| Error::NegotiationTimeout("Relay handshake timed out".to_string()))?
            .ok_or_else(|| Error::Signaling("Relay closed during handshake".to_string()))?
            .map_err(|e| Error::Signaling(format!("Relay read failed: {}", e)))?;

        match msg {
            WsMessage::Text(text) => return Ok(Envelope::from_json(&text)?),
            WsMessage::Ping(_) | WsMessage::Pong(_) => continue,
            other => {
                return Err(Error::Signaling(format!(
                    "Unexpected relay frame: {:?}",
                    other
                )))
            }
        }
    }
}
