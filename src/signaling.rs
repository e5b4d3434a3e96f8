//! WebSocket signaling server for host/viewer stream rooms

mod actor;
mod messages;
mod server;
mod types;

pub use actor::RoomManagerHandle;
pub use messages::{Envelope, Inbound, RelayKind, ServerMessage};
pub use server::SignalingServer;
pub use types::{
    CloseReason, ConnectionId, Identity, Outbound, OutboundMessage, Role, RoomId, RoomSnapshot,
    SignalingError, ViewerId,
};
