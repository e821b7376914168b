//! Per-connection envelope handling
//!
//! Each WebSocket connection gets one task running [`handle_connection`]:
//! inbound envelopes are processed to completion in arrival order, outbound
//! delivery goes through the client's registry sender. Authorization failures
//! reply `unauthorized` and never mutate room state.

use deskbridge_core::auth::{validate_for_session, verify_room_hmac, Right};
use deskbridge_core::protocol::Envelope;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{accept_async, tungstenite::Message as WsMessage};
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::registry::EnvelopeSender;
use crate::state::RelayState;

/// Accept a WebSocket connection and run its envelope loop until the peer
/// goes away
pub async fn handle_connection(stream: TcpStream, state: Arc<RelayState>) -> Result<()> {
    let ws_stream = accept_async(stream)
        .await
        .map_err(|e| Error::WebSocket(format!("WebSocket handshake failed: {}", e)))?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();

    // Register and greet; the default role is viewer until announced.
    let client_id = state
        .registry
        .register(Default::default(), tx.clone())
        .await;
    let token = state.issue_token(&client_id, Default::default())?;
    let _ = tx.send(Envelope::Welcome {
        client_id: client_id.clone(),
        token,
    });

    // Outbound pump: registry broadcasts and direct replies both arrive here.
    let send_task = tokio::spawn(async move {
        while let Some(envelope) = rx.recv().await {
            let json = match envelope.to_json() {
                Ok(json) => json,
                Err(e) => {
                    error!("Dropping unserializable envelope: {}", e);
                    continue;
                }
            };
            if ws_sender.send(WsMessage::Text(json)).await.is_err() {
                break;
            }
        }
    });

    while let Some(msg) = ws_receiver.next().await {
        match msg {
            Ok(WsMessage::Text(text)) => {
                state.registry.touch(&client_id).await;
                match Envelope::from_json(&text) {
                    Ok(envelope) => dispatch(&state, &client_id, &tx, envelope).await,
                    Err(e) => {
                        debug!(client_id = %client_id, "Malformed envelope: {}", e);
                        let _ = tx.send(Envelope::Error {
                            message: "malformed envelope".to_string(),
                        });
                    }
                }
            }
            Ok(WsMessage::Ping(_)) | Ok(WsMessage::Pong(_)) => {
                state.registry.touch(&client_id).await;
            }
            Ok(WsMessage::Close(_)) | Err(_) => break,
            Ok(_) => {
                let _ = tx.send(Envelope::Error {
                    message: "expected text frames".to_string(),
                });
            }
        }
    }

    // Same cleanup path as a heartbeat timeout; a second invocation is a
    // no-op because membership removal already happened.
    state.registry.disconnect(&client_id).await;
    send_task.abort();

    info!(client_id = %client_id, "Connection closed");
    Ok(())
}

/// Handle one inbound envelope to completion
pub(crate) async fn dispatch(
    state: &RelayState,
    client_id: &str,
    tx: &EnvelopeSender,
    envelope: Envelope,
) {
    match envelope {
        Envelope::Announce { display_token, role } => {
            if let Err(e) = state.registry.announce(client_id, display_token, role).await {
                reply_error(tx, &e);
                return;
            }
            // Rights follow the role, so a fresh token is issued.
            match state.issue_token(client_id, role) {
                Ok(token) => {
                    let _ = tx.send(Envelope::Welcome {
                        client_id: client_id.to_string(),
                        token,
                    });
                }
                Err(e) => reply_error(tx, &e),
            }
        }

        Envelope::CreateRoom { room_id, token } => {
            if let Err(e) = authorize(state, client_id, &token, Right::CreateRoom) {
                reply_error(tx, &e);
                return;
            }
            let settings = state.config.room_settings.clone();
            match state.registry.create_room(client_id, room_id, settings).await {
                Ok(room_id) => {
                    let _ = tx.send(Envelope::RoomCreated { room_id });
                }
                Err(e) => reply_error(tx, &e),
            }
        }

        Envelope::JoinRoom {
            room_id,
            token,
            hmac,
        } => {
            if let Err(e) = authorize(state, client_id, &token, Right::JoinRoom) {
                reply_error(tx, &e);
                return;
            }
            if let Some(secret) = &state.config.room_secret {
                let verified = match hmac {
                    Some(mac) => verify_room_hmac(secret, &room_id, client_id, &mac)
                        .map_err(Error::Core),
                    None => Err(Error::AuthFailed("join HMAC required".to_string())),
                };
                if let Err(e) = verified {
                    warn!(client_id = %client_id, room_id = %room_id, "Join HMAC rejected");
                    reply_error(tx, &e);
                    return;
                }
            }
            match state.registry.join_room(client_id, &room_id).await {
                Ok((peers, settings)) => {
                    let _ = tx.send(Envelope::RoomJoined {
                        room_id,
                        peers,
                        settings,
                    });
                }
                Err(e) => reply_error(tx, &e),
            }
        }

        Envelope::LeaveRoom { room_id } => {
            // Idempotent: acknowledged even when no membership existed.
            state.registry.leave_room(client_id).await;
            let _ = tx.send(Envelope::RoomLeft { room_id });
        }

        envelope @ (Envelope::Offer { .. }
        | Envelope::Answer { .. }
        | Envelope::IceCandidate { .. }) => {
            state.registry.route(client_id, envelope).await;
        }

        Envelope::Ping => {
            let _ = tx.send(Envelope::Pong);
        }
        Envelope::Pong => {}

        other => {
            debug!(client_id = %client_id, kind = other.kind(), "Client sent server-only envelope");
            let _ = tx.send(Envelope::Error {
                message: format!("unexpected envelope: {}", other.kind()),
            });
        }
    }
}

/// Validate the presented token for a privileged operation
fn authorize(
    state: &RelayState,
    client_id: &str,
    token: &str,
    right: Right,
) -> Result<()> {
    let claim = validate_for_session(state.issuer(), token, state.instance_id())?;
    if claim.subject != client_id {
        return Err(Error::AuthFailed(format!(
            "claim issued to {}, presented by {}",
            claim.subject, client_id
        )));
    }
    if !claim.allows(right) {
        return Err(Error::AuthFailed(format!("missing right: {:?}", right)));
    }
    Ok(())
}

/// Map a failure to the right reply envelope
fn reply_error(tx: &EnvelopeSender, error: &Error) {
    let envelope = if error.is_unauthorized() {
        Envelope::Unauthorized {
            message: error.to_string(),
        }
    } else {
        Envelope::Error {
            message: error.to_string(),
        }
    };
    let _ = tx.send(envelope);
}
