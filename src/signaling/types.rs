use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use rand::Rng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Utf8Bytes;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

use super::messages::ServerMessage;

/// Signaling server errors
#[derive(Debug, Error)]
pub enum SignalingError {
    /// Room secret did not match the one presented on identify
    #[error("forbidden")]
    Forbidden,

    #[error("identify_timeout")]
    IdentifyTimeout,

    /// Relay addressed to a peer that is not (or no longer) in the room
    #[error("target not found: {0}")]
    TargetNotFound(String),

    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// Message type not accepted from the sender's role
    #[error("unexpected {kind} from {role}")]
    UnexpectedMessage { kind: &'static str, role: Role },

    /// Sender is no longer registered under the identity it claims
    #[error("connection {0} is not identified in this room")]
    NotIdentified(ConnectionId),

    #[error("unknown path: {0}")]
    UnknownPath(String),

    #[error("invalid room id: {0}")]
    InvalidRoomId(String),

    #[error("internal error: {0}")]
    Internal(String),
}

const VIEWER_ID_PREFIX: &[u8] = b"viewer_";
const VIEWER_ID_LEN: usize = 15;
const HEX_CHARS: &[u8] = b"0123456789abcdef";
const ROOM_PATH_PREFIX: &str = "/ws/";

/// Client-chosen room id taken from the `/ws/<room-id>` connection path
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoomId(Arc<str>);

impl RoomId {
    pub fn parse(s: &str, max_len: usize) -> Result<Self, SignalingError> {
        if s.is_empty() || s.len() > max_len {
            return Err(SignalingError::InvalidRoomId(s.to_string()));
        }
        if s.chars().any(|c| c == '/' || c.is_control() || c.is_whitespace()) {
            return Err(SignalingError::InvalidRoomId(s.to_string()));
        }
        Ok(Self(Arc::from(s)))
    }

    /// Extract the room id from a request path such as `/ws/abc123`
    pub fn from_request_path(path: &str, max_len: usize) -> Result<Self, SignalingError> {
        let rest = path
            .strip_prefix(ROOM_PATH_PREFIX)
            .ok_or_else(|| SignalingError::UnknownPath(path.to_string()))?;
        Self::parse(rest.strip_suffix('/').unwrap_or(rest), max_len)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for RoomId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Viewer ID: 15-byte fixed array ("viewer_" + 8 hex)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ViewerId {
    bytes: [u8; VIEWER_ID_LEN],
}

impl ViewerId {
    pub fn from_sequence(value: u32) -> Self {
        let mut bytes = [0u8; VIEWER_ID_LEN];
        bytes[..VIEWER_ID_PREFIX.len()].copy_from_slice(VIEWER_ID_PREFIX);

        for i in 0..8 {
            let nibble = ((value >> (28 - i * 4)) & 0xF) as usize;
            bytes[VIEWER_ID_PREFIX.len() + i] = HEX_CHARS[nibble];
        }
        Self { bytes }
    }

    /// Accepts only well-formed ids, so a host cannot address a truncated or padded name
    pub fn parse(s: &str) -> Option<Self> {
        let src = s.as_bytes();
        if src.len() != VIEWER_ID_LEN || !src.starts_with(VIEWER_ID_PREFIX) {
            return None;
        }
        if !src[VIEWER_ID_PREFIX.len()..]
            .iter()
            .all(|b| HEX_CHARS.contains(b))
        {
            return None;
        }
        let mut bytes = [0u8; VIEWER_ID_LEN];
        bytes.copy_from_slice(src);
        Some(Self { bytes })
    }

    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.bytes).unwrap_or("")
    }
}

impl fmt::Display for ViewerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for ViewerId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ViewerId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = <&str>::deserialize(deserializer)?;
        ViewerId::parse(s)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid viewer id: {s}")))
    }
}

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique id of one WebSocket connection.
///
/// Registrations in a room remember the connection that made them, so a late
/// disconnect from a replaced host or a departed viewer cannot touch whoever
/// holds the slot now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Host,
    Viewer,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Host => f.write_str("host"),
            Role::Viewer => f.write_str("viewer"),
        }
    }
}

/// What an identified connection is registered as
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Identity {
    Host,
    Viewer(ViewerId),
}

impl Identity {
    pub fn role(&self) -> Role {
        match self {
            Identity::Host => Role::Host,
            Identity::Viewer(_) => Role::Viewer,
        }
    }
}

/// Wrapper for outbound WebSocket messages using tungstenite's Utf8Bytes.
#[derive(Debug, Clone)]
pub struct OutboundMessage(Utf8Bytes);

impl OutboundMessage {
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    /// Get the inner Utf8Bytes for tungstenite Message::Text
    pub fn into_inner(self) -> Utf8Bytes {
        self.0
    }
}

impl From<String> for OutboundMessage {
    fn from(s: String) -> Self {
        Self(Utf8Bytes::from(s))
    }
}

/// Why the server is closing a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Forbidden,
    IdentifyTimeout,
    /// Host slot taken over by a newer host connection
    Replaced,
}

impl CloseReason {
    pub fn frame(self) -> CloseFrame {
        match self {
            CloseReason::Forbidden => CloseFrame {
                code: CloseCode::Policy,
                reason: Utf8Bytes::from_static("forbidden"),
            },
            CloseReason::IdentifyTimeout => CloseFrame {
                code: CloseCode::Policy,
                reason: Utf8Bytes::from_static("identify_timeout"),
            },
            CloseReason::Replaced => CloseFrame {
                code: CloseCode::Normal,
                reason: Utf8Bytes::from_static("replaced"),
            },
        }
    }
}

/// Item queued for a connection's writer task
#[derive(Debug, Clone)]
pub enum Outbound {
    Message(OutboundMessage),
    /// Send a close frame, then stop writing
    Close(CloseReason),
}

/// Sending side of one registered connection
#[derive(Debug, Clone)]
pub(crate) struct PeerHandle {
    pub conn: ConnectionId,
    /// Uses OutboundMessage (Utf8Bytes) for cheap broadcast cloning.
    pub tx: mpsc::UnboundedSender<Outbound>,
}

impl PeerHandle {
    pub fn send(&self, msg: &ServerMessage) {
        let _ = self.tx.send(Outbound::Message(msg.to_outbound()));
    }

    pub fn send_raw(&self, msg: OutboundMessage) {
        let _ = self.tx.send(Outbound::Message(msg));
    }

    pub fn close(&self, reason: CloseReason) {
        let _ = self.tx.send(Outbound::Close(reason));
    }
}

#[derive(Debug)]
pub(crate) struct ViewerState {
    pub peer: PeerHandle,
    /// Secret presented on identify, rechecked if a host secures the room later
    pub secret: String,
}

#[derive(Debug)]
pub(crate) struct Room {
    /// Empty means unrestricted
    pub secret: String,
    pub host: Option<PeerHandle>,
    pub viewers: HashMap<ViewerId, ViewerState>,
    /// Sequence for the next viewer id; only moves forward while the room lives
    next_viewer: u32,
}

impl Room {
    /// Viewer ids start at a random offset so they are not guessable across rooms
    pub fn new() -> Self {
        Self {
            secret: String::new(),
            host: None,
            viewers: HashMap::new(),
            next_viewer: rand::rng().random(),
        }
    }

    /// Hand out the next id in sequence. A freed id comes back only after the
    /// counter wraps all the way around.
    pub fn allocate_viewer_id(&mut self) -> ViewerId {
        loop {
            let id = ViewerId::from_sequence(self.next_viewer);
            self.next_viewer = self.next_viewer.wrapping_add(1);
            if !self.viewers.contains_key(&id) {
                return id;
            }
        }
    }

    pub fn admits(&self, secret: &str) -> bool {
        self.secret.is_empty() || self.secret == secret
    }

    pub fn is_empty(&self) -> bool {
        self.host.is_none() && self.viewers.is_empty()
    }

    pub fn snapshot(&self) -> RoomSnapshot {
        let mut viewers: Vec<ViewerId> = self.viewers.keys().copied().collect();
        viewers.sort();
        RoomSnapshot {
            has_host: self.host.is_some(),
            viewers,
            secured: !self.secret.is_empty(),
        }
    }
}

/// Point-in-time view of a room's membership
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoomSnapshot {
    pub has_host: bool,
    pub viewers: Vec<ViewerId>,
    pub secured: bool,
}
