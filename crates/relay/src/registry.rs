//! Rendezvous registry
//!
//! The registry is the only owner of the Client and Room tables. All room
//! mutations go through its operations and run inside a single write lock,
//! so concurrent joins and leaves against the same room serialize and cannot
//! lose updates. Broadcasts to room members are delivered through per-client
//! unbounded senders, so a slow client never blocks a mutation.

use deskbridge_core::protocol::{ClientId, Envelope, PeerRole, RoomId, RoomSettings};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Outbound delivery handle for one connected client
pub type EnvelopeSender = mpsc::UnboundedSender<Envelope>;

/// How a client departed a room; timeouts and transport drops broadcast
/// `peer-disconnected`, an explicit leave broadcasts `peer-left`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Departure {
    /// Explicit `leave-room`
    Left,
    /// Transport drop or heartbeat timeout
    Disconnected,
}

struct ClientEntry {
    display_token: String,
    role: PeerRole,
    sender: EnvelopeSender,
    room: Option<RoomId>,
    last_seen: Instant,
}

struct Room {
    owner: ClientId,
    /// Members in join order; the head inherits ownership on a graceful
    /// owner leave
    members: Vec<ClientId>,
    settings: RoomSettings,
    #[allow(dead_code)]
    created_at: Instant,
}

#[derive(Default)]
struct Tables {
    clients: HashMap<ClientId, ClientEntry>,
    rooms: HashMap<RoomId, Room>,
}

/// In-memory store of connected clients, rooms, and peer membership
pub struct Registry {
    tables: RwLock<Tables>,
}

impl Registry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
        }
    }

    /// Register a newly connected client and return its assigned id
    pub async fn register(&self, role: PeerRole, sender: EnvelopeSender) -> ClientId {
        let id = Uuid::new_v4().to_string();
        let mut tables = self.tables.write().await;

        tables.clients.insert(
            id.clone(),
            ClientEntry {
                display_token: String::new(),
                role,
                sender,
                room: None,
                last_seen: Instant::now(),
            },
        );

        info!(client_id = %id, "Client registered");
        id
    }

    /// Update a client's display token and role
    pub async fn announce(
        &self,
        client_id: &str,
        display_token: Option<String>,
        role: PeerRole,
    ) -> Result<()> {
        let mut tables = self.tables.write().await;
        let entry = tables
            .clients
            .get_mut(client_id)
            .ok_or_else(|| Error::ClientNotFound(client_id.to_string()))?;

        if let Some(display) = display_token {
            entry.display_token = display;
        }
        entry.role = role;
        entry.last_seen = Instant::now();

        debug!(client_id = %client_id, role = ?role, "Client announced");
        Ok(())
    }

    /// Refresh a client's idle timer
    pub async fn touch(&self, client_id: &str) {
        let mut tables = self.tables.write().await;
        if let Some(entry) = tables.clients.get_mut(client_id) {
            entry.last_seen = Instant::now();
        }
    }

    /// Current role of a client
    pub async fn client_role(&self, client_id: &str) -> Option<PeerRole> {
        self.tables
            .read()
            .await
            .clients
            .get(client_id)
            .map(|e| e.role)
    }

    /// Create a room with the caller as owner and sole member
    ///
    /// Fails with [`Error::RoomConflict`] when the requested id is already
    /// live, without mutating anything. A caller already in another room
    /// leaves it first.
    pub async fn create_room(
        &self,
        client_id: &str,
        requested: Option<RoomId>,
        settings: RoomSettings,
    ) -> Result<RoomId> {
        let mut tables = self.tables.write().await;

        if !tables.clients.contains_key(client_id) {
            return Err(Error::ClientNotFound(client_id.to_string()));
        }

        let room_id = requested.unwrap_or_else(|| Uuid::new_v4().to_string());
        if tables.rooms.contains_key(&room_id) {
            return Err(Error::RoomConflict(room_id));
        }

        leave_locked(&mut tables, client_id, Departure::Left);

        tables.rooms.insert(
            room_id.clone(),
            Room {
                owner: client_id.to_string(),
                members: vec![client_id.to_string()],
                settings,
                created_at: Instant::now(),
            },
        );
        if let Some(entry) = tables.clients.get_mut(client_id) {
            entry.room = Some(room_id.clone());
        }

        info!(client_id = %client_id, room_id = %room_id, "Room created");
        Ok(room_id)
    }

    /// Add a client to a room
    ///
    /// Returns the ids of the members already present and the room settings.
    /// Fails with [`Error::RoomNotFound`] or [`Error::RoomFull`] without any
    /// membership change; rejoining the same room is a no-op that returns the
    /// current peer list.
    pub async fn join_room(
        &self,
        client_id: &str,
        room_id: &str,
    ) -> Result<(Vec<ClientId>, RoomSettings)> {
        let mut tables = self.tables.write().await;

        if !tables.clients.contains_key(client_id) {
            return Err(Error::ClientNotFound(client_id.to_string()));
        }

        {
            let room = tables
                .rooms
                .get(room_id)
                .ok_or_else(|| Error::RoomNotFound(room_id.to_string()))?;

            if room.members.iter().any(|m| m == client_id) {
                let peers = room
                    .members
                    .iter()
                    .filter(|m| *m != client_id)
                    .cloned()
                    .collect();
                return Ok((peers, room.settings.clone()));
            }

            if room.members.len() >= room.settings.max_members {
                return Err(Error::RoomFull(room_id.to_string()));
            }
        }

        leave_locked(&mut tables, client_id, Departure::Left);

        let (peers, settings) = {
            let room = tables
                .rooms
                .get_mut(room_id)
                .ok_or_else(|| Error::RoomNotFound(room_id.to_string()))?;
            let peers: Vec<ClientId> = room.members.clone();
            room.members.push(client_id.to_string());
            (peers, room.settings.clone())
        };

        if let Some(entry) = tables.clients.get_mut(client_id) {
            entry.room = Some(room_id.to_string());
        }

        for peer in &peers {
            send_locked(
                &tables,
                peer,
                Envelope::PeerJoined {
                    peer_id: client_id.to_string(),
                },
            );
        }

        info!(client_id = %client_id, room_id = %room_id, members = peers.len() + 1, "Client joined room");
        Ok((peers, settings))
    }

    /// Remove a client from its room, if any; idempotent
    ///
    /// Returns the id of the room that was left.
    pub async fn leave_room(&self, client_id: &str) -> Option<RoomId> {
        let mut tables = self.tables.write().await;
        leave_locked(&mut tables, client_id, Departure::Left)
    }

    /// Remove a client entirely: leave its room with a `peer-disconnected`
    /// broadcast and drop it from the client table; idempotent
    pub async fn disconnect(&self, client_id: &str) {
        let mut tables = self.tables.write().await;
        leave_locked(&mut tables, client_id, Departure::Disconnected);
        if tables.clients.remove(client_id).is_some() {
            info!(client_id = %client_id, "Client disconnected");
        }
    }

    /// Disconnect every client silent for longer than `timeout`
    ///
    /// Returns the ids of the evicted clients.
    pub async fn sweep_idle(&self, timeout: Duration) -> Vec<ClientId> {
        let mut tables = self.tables.write().await;

        let stale: Vec<ClientId> = tables
            .clients
            .iter()
            .filter(|(_, entry)| entry.last_seen.elapsed() > timeout)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &stale {
            warn!(client_id = %id, "Heartbeat timeout, evicting client");
            leave_locked(&mut tables, id, Departure::Disconnected);
            tables.clients.remove(id);
        }

        stale
    }

    /// Forward a relayed envelope (`offer`, `answer`, `ice-candidate`) to its
    /// addressee
    ///
    /// The envelope is delivered verbatim only when the claimed sender
    /// matches `from` and both parties are members of a common room;
    /// otherwise it is dropped and logged. Returns whether it was delivered.
    pub async fn route(&self, from: &str, envelope: Envelope) -> bool {
        let tables = self.tables.read().await;

        let (source, target) = match (envelope.source(), envelope.target()) {
            (Some(s), Some(t)) => (s.clone(), t.clone()),
            _ => {
                warn!(from = %from, kind = envelope.kind(), "Refusing to route non-relayed envelope");
                return false;
            }
        };

        if source != from {
            warn!(from = %from, claimed = %source, "Dropping envelope with spoofed sender");
            return false;
        }

        let sender_room = tables.clients.get(from).and_then(|e| e.room.as_ref());
        let target_room = tables.clients.get(&target).and_then(|e| e.room.as_ref());

        match (sender_room, target_room) {
            (Some(a), Some(b)) if a == b => {
                let delivered = send_locked(&tables, &target, envelope);
                if !delivered {
                    warn!(to = %target, "Route target vanished mid-delivery");
                }
                delivered
            }
            _ => {
                warn!(
                    from = %from,
                    to = %target,
                    "Dropping envelope between peers without a common room"
                );
                false
            }
        }
    }

    /// Number of connected clients
    pub async fn client_count(&self) -> usize {
        self.tables.read().await.clients.len()
    }

    /// Members of a room, in join order; `None` when the room is not live
    pub async fn room_members(&self, room_id: &str) -> Option<Vec<ClientId>> {
        self.tables
            .read()
            .await
            .rooms
            .get(room_id)
            .map(|r| r.members.clone())
    }

    /// Owner of a room, when live
    pub async fn room_owner(&self, room_id: &str) -> Option<ClientId> {
        self.tables
            .read()
            .await
            .rooms
            .get(room_id)
            .map(|r| r.owner.clone())
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

/// Remove `client_id` from its room inside an already-held write lock
///
/// Broadcasts the departure to remaining members, reassigns or dissolves the
/// room per the departure kind, and destroys the room when it empties.
/// Calling it twice for the same client is a no-op the second time.
fn leave_locked(tables: &mut Tables, client_id: &str, departure: Departure) -> Option<RoomId> {
    let room_id = tables.clients.get_mut(client_id).and_then(|e| e.room.take())?;

    let (remaining, owner_departed, dissolve) = {
        let room = tables.rooms.get_mut(&room_id)?;
        room.members.retain(|m| m != client_id);
        let owner_departed = room.owner == client_id;
        // A disconnected owner dissolves the room; a graceful leave hands
        // ownership to the oldest remaining member.
        let dissolve = room.members.is_empty()
            || (owner_departed && departure == Departure::Disconnected);
        if owner_departed && !dissolve {
            room.owner = room.members[0].clone();
        }
        (room.members.clone(), owner_departed, dissolve)
    };

    let notice = match departure {
        Departure::Left => Envelope::PeerLeft {
            peer_id: client_id.to_string(),
        },
        Departure::Disconnected => Envelope::PeerDisconnected {
            peer_id: client_id.to_string(),
        },
    };
    for member in &remaining {
        send_locked(tables, member, notice.clone());
    }

    if dissolve {
        for member in &remaining {
            if let Some(entry) = tables.clients.get_mut(member) {
                entry.room = None;
            }
            send_locked(
                tables,
                member,
                Envelope::RoomLeft {
                    room_id: room_id.clone(),
                },
            );
        }
        tables.rooms.remove(&room_id);
        info!(room_id = %room_id, "Room destroyed");
    } else if owner_departed {
        debug!(room_id = %room_id, "Room ownership reassigned");
    }

    Some(room_id)
}

/// Deliver an envelope to a client's outbound channel; a closed channel is
/// treated as an already-gone client
fn send_locked(tables: &Tables, client_id: &str, envelope: Envelope) -> bool {
    match tables.clients.get(client_id) {
        Some(entry) => entry.sender.send(envelope).is_ok(),
        None => false,
    }
}
