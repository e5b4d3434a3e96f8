use std::collections::HashMap;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::messages::{Envelope, RelayKind, ServerMessage};
use super::types::{
    CloseReason, ConnectionId, Identity, Outbound, PeerHandle, Role, Room, RoomId, RoomSnapshot,
    SignalingError, ViewerId, ViewerState,
};

const COMMAND_QUEUE_SIZE: usize = 1024;

/// Commands sent to the room manager actor
pub(crate) enum RoomCommand {
    Identify {
        room: RoomId,
        role: Role,
        secret: String,
        conn: ConnectionId,
        peer_tx: mpsc::UnboundedSender<Outbound>,
        reply: oneshot::Sender<Result<Identity, SignalingError>>,
    },
    Relay {
        room: RoomId,
        sender: Identity,
        conn: ConnectionId,
        kind: RelayKind,
        envelope: Envelope,
    },
    Leave {
        room: RoomId,
        identity: Identity,
        conn: ConnectionId,
    },
    Snapshot {
        room: RoomId,
        reply: oneshot::Sender<Option<RoomSnapshot>>,
    },
    RoomCount {
        reply: oneshot::Sender<usize>,
    },
}

/// Every room, owned by the actor task.
///
/// A room exists only while it has a host or at least one viewer.
#[derive(Debug, Default)]
pub(crate) struct RoomRegistry {
    rooms: HashMap<RoomId, Room>,
}

impl RoomRegistry {
    pub fn identify(
        &mut self,
        room_id: RoomId,
        role: Role,
        secret: String,
        peer: PeerHandle,
    ) -> Result<Identity, SignalingError> {
        if let Some(room) = self.rooms.get(&room_id) {
            if !room.admits(&secret) {
                info!("Rejected {} in room {}: secret mismatch", role, room_id);
                return Err(SignalingError::Forbidden);
            }
        }

        let room = self.rooms.entry(room_id.clone()).or_insert_with(Room::new);
        match role {
            Role::Host => {
                install_host(room, &room_id, secret, peer);
                Ok(Identity::Host)
            }
            Role::Viewer => {
                let viewer_id = room.allocate_viewer_id();

                match &room.host {
                    Some(host) => {
                        host.send(&ServerMessage::ViewerJoined { viewer_id });
                        peer.send(&ServerMessage::Ready { role: Role::Viewer });
                    }
                    None => debug!("Viewer {} waiting for host in room {}", viewer_id, room_id),
                }
                room.viewers
                    .insert(viewer_id, ViewerState { peer, secret });

                info!("Viewer {} joined room {}", viewer_id, room_id);
                Ok(Identity::Viewer(viewer_id))
            }
        }
    }

    pub fn relay(
        &mut self,
        room_id: &RoomId,
        sender: Identity,
        conn: ConnectionId,
        kind: RelayKind,
        mut envelope: Envelope,
    ) -> Result<(), SignalingError> {
        let room = self
            .rooms
            .get(room_id)
            .ok_or(SignalingError::NotIdentified(conn))?;

        if !kind.allowed_from(sender.role()) {
            return Err(SignalingError::UnexpectedMessage {
                kind: kind.as_str(),
                role: sender.role(),
            });
        }

        match sender {
            Identity::Viewer(viewer_id) => {
                let registered = room
                    .viewers
                    .get(&viewer_id)
                    .is_some_and(|v| v.peer.conn == conn);
                if !registered {
                    return Err(SignalingError::NotIdentified(conn));
                }
                let host = room
                    .host
                    .as_ref()
                    .ok_or_else(|| SignalingError::TargetNotFound(Role::Host.to_string()))?;

                envelope.tag_from_viewer(viewer_id);
                host.send_raw(envelope.to_outbound());
            }
            Identity::Host => {
                if !room.host.as_ref().is_some_and(|h| h.conn == conn) {
                    return Err(SignalingError::NotIdentified(conn));
                }
                let target = envelope.target_viewer().ok_or_else(|| {
                    SignalingError::TargetNotFound("missing viewer target".to_string())
                })?;
                let viewer = room
                    .viewers
                    .get(&target)
                    .ok_or_else(|| SignalingError::TargetNotFound(target.to_string()))?;

                envelope.tag_from_host();
                viewer.peer.send_raw(envelope.to_outbound());
            }
        }
        Ok(())
    }

    /// Unregister a connection; a no-op when `conn` no longer holds the slot
    pub fn leave(&mut self, room_id: &RoomId, identity: Identity, conn: ConnectionId) {
        let Some(room) = self.rooms.get_mut(room_id) else {
            return;
        };

        match identity {
            Identity::Host => {
                if room.host.as_ref().is_some_and(|h| h.conn == conn) {
                    for viewer in room.viewers.values() {
                        viewer.peer.send(&ServerMessage::HostDisconnected);
                    }
                    room.host = None;
                    info!(
                        "Host left room {} ({} viewers notified)",
                        room_id,
                        room.viewers.len()
                    );
                }
            }
            Identity::Viewer(viewer_id) => {
                if room
                    .viewers
                    .get(&viewer_id)
                    .is_some_and(|v| v.peer.conn == conn)
                {
                    if let Some(host) = &room.host {
                        host.send(&ServerMessage::ViewerLeft { viewer_id });
                    }
                    room.viewers.remove(&viewer_id);
                    info!("Viewer {} left room {}", viewer_id, room_id);
                }
            }
        }

        if room.is_empty() {
            self.rooms.remove(room_id);
            info!("Room {} removed (empty)", room_id);
        }
    }

    pub fn snapshot(&self, room_id: &RoomId) -> Option<RoomSnapshot> {
        self.rooms.get(room_id).map(Room::snapshot)
    }

    pub fn len(&self) -> usize {
        self.rooms.len()
    }
}

/// Put `peer` in the host slot, replacing any previous host.
fn install_host(room: &mut Room, room_id: &RoomId, secret: String, peer: PeerHandle) {
    if room.secret.is_empty() && !secret.is_empty() {
        room.secret = secret;
        let rejected: Vec<ViewerId> = room
            .viewers
            .iter()
            .filter(|(_, v)| v.secret != room.secret)
            .map(|(id, _)| *id)
            .collect();
        for id in rejected {
            if let Some(viewer) = room.viewers.remove(&id) {
                viewer
                    .peer
                    .send(&ServerMessage::error(&SignalingError::Forbidden));
                viewer.peer.close(CloseReason::Forbidden);
                info!("Viewer {} rejected from room {}: secret mismatch", id, room_id);
            }
        }
    }

    if let Some(previous) = room.host.take() {
        previous.send(&ServerMessage::HostDisconnected);
        previous.close(CloseReason::Replaced);
        for viewer in room.viewers.values() {
            viewer.peer.send(&ServerMessage::HostDisconnected);
        }
        warn!(
            "Host {} replaced by {} in room {}",
            previous.conn, peer.conn, room_id
        );
    }

    for (viewer_id, viewer) in &room.viewers {
        peer.send(&ServerMessage::ViewerJoined {
            viewer_id: *viewer_id,
        });
        viewer.peer.send(&ServerMessage::Ready { role: Role::Viewer });
    }

    info!(
        "Host {} joined room {} ({} viewers waiting)",
        peer.conn,
        room_id,
        room.viewers.len()
    );
    room.host = Some(peer);
}

/// Single sequential owner of every room. Rooms never observe each other's
/// state, but commands for different rooms also queue behind one another, so
/// aggregate throughput is bounded by this one task.
pub(crate) async fn room_manager_actor(mut rx: mpsc::Receiver<RoomCommand>) {
    let mut registry = RoomRegistry::default();

    while let Some(cmd) = rx.recv().await {
        match cmd {
            RoomCommand::Identify {
                room,
                role,
                secret,
                conn,
                peer_tx,
                reply,
            } => {
                let peer = PeerHandle { conn, tx: peer_tx };
                let result = registry.identify(room, role, secret, peer);
                let _ = reply.send(result);
            }

            RoomCommand::Relay {
                room,
                sender,
                conn,
                kind,
                envelope,
            } => {
                if let Err(e) = registry.relay(&room, sender, conn, kind, envelope) {
                    debug!("Dropped {} in room {}: {}", kind.as_str(), room, e);
                }
            }

            RoomCommand::Leave {
                room,
                identity,
                conn,
            } => registry.leave(&room, identity, conn),

            RoomCommand::Snapshot { room, reply } => {
                let _ = reply.send(registry.snapshot(&room));
            }

            RoomCommand::RoomCount { reply } => {
                let _ = reply.send(registry.len());
            }
        }
    }
}

/// Handle to communicate with the room manager actor
#[derive(Clone)]
pub struct RoomManagerHandle {
    pub(crate) tx: mpsc::Sender<RoomCommand>,
}

impl RoomManagerHandle {
    /// Start the actor on the current runtime
    pub fn spawn() -> Self {
        let (tx, rx) = mpsc::channel::<RoomCommand>(COMMAND_QUEUE_SIZE);
        tokio::spawn(room_manager_actor(rx));
        Self { tx }
    }

    /// Register a connection in `room`; viewers get their assigned id back
    pub async fn identify(
        &self,
        room: RoomId,
        role: Role,
        secret: String,
        conn: ConnectionId,
        peer_tx: mpsc::UnboundedSender<Outbound>,
    ) -> Result<Identity, SignalingError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let _ = self
            .tx
            .send(RoomCommand::Identify {
                room,
                role,
                secret,
                conn,
                peer_tx,
                reply: reply_tx,
            })
            .await;
        reply_rx
            .await
            .map_err(|_| SignalingError::Internal("actor channel closed".to_string()))?
    }

    /// Forward a negotiation message; delivery failures are logged by the actor
    pub async fn relay(
        &self,
        room: RoomId,
        sender: Identity,
        conn: ConnectionId,
        kind: RelayKind,
        envelope: Envelope,
    ) -> Result<(), SignalingError> {
        self.tx
            .send(RoomCommand::Relay {
                room,
                sender,
                conn,
                kind,
                envelope,
            })
            .await
            .map_err(|_| SignalingError::Internal("actor channel closed".to_string()))
    }

    pub async fn leave(&self, room: RoomId, identity: Identity, conn: ConnectionId) {
        let _ = self
            .tx
            .send(RoomCommand::Leave {
                room,
                identity,
                conn,
            })
            .await;
    }

    pub async fn room_snapshot(&self, room: RoomId) -> Option<RoomSnapshot> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let _ = self
            .tx
            .send(RoomCommand::Snapshot {
                room,
                reply: reply_tx,
            })
            .await;
        reply_rx.await.ok().flatten()
    }

    pub async fn room_count(&self) -> usize {
        let (reply_tx, reply_rx) = oneshot::channel();
        let _ = self.tx.send(RoomCommand::RoomCount { reply: reply_tx }).await;
        reply_rx.await.unwrap_or_default()
    }
}
