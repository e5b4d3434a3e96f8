use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::types::{OutboundMessage, Role, SignalingError, ViewerId};

const TYPE_FIELD: &str = "type";
const TARGET_FIELD: &str = "target";
const VIEWER_ID_FIELD: &str = "viewerId";
const FROM_FIELD: &str = "from";

/// JSON object received from a client.
///
/// Only the envelope fields are ever read; everything else (`sdp`,
/// `candidate`, unknown keys) is carried through untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    fields: Map<String, Value>,
}

impl Envelope {
    pub fn parse(text: &str) -> Result<Self, SignalingError> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| SignalingError::MalformedMessage(e.to_string()))?;
        let Value::Object(fields) = value else {
            return Err(SignalingError::MalformedMessage(
                "expected a JSON object".to_string(),
            ));
        };
        match fields.get(TYPE_FIELD) {
            Some(Value::String(_)) => Ok(Self { fields }),
            _ => Err(SignalingError::MalformedMessage(
                "missing string field `type`".to_string(),
            )),
        }
    }

    pub fn kind(&self) -> &str {
        self.str_field(TYPE_FIELD).unwrap_or_default()
    }

    pub fn str_field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(Value::as_str)
    }

    /// Viewer addressed by a host message: `target`, falling back to `viewerId`
    pub fn target_viewer(&self) -> Option<ViewerId> {
        self.str_field(TARGET_FIELD)
            .and_then(ViewerId::parse)
            .or_else(|| self.str_field(VIEWER_ID_FIELD).and_then(ViewerId::parse))
    }

    /// Tag a viewer's message so the host can attribute it
    pub fn tag_from_viewer(&mut self, id: ViewerId) {
        self.fields
            .insert(VIEWER_ID_FIELD.to_string(), Value::from(id.as_str()));
        self.fields
            .insert(FROM_FIELD.to_string(), Value::from(id.as_str()));
    }

    pub fn tag_from_host(&mut self) {
        self.fields
            .insert(FROM_FIELD.to_string(), Value::from(Role::Host.to_string()));
    }

    pub fn to_outbound(&self) -> OutboundMessage {
        let json = serde_json::to_string(&self.fields)
            .expect("JSON object serialization should never fail");
        OutboundMessage::from(json)
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.fields)
    }
}

/// Negotiation message types relayed between host and viewers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayKind {
    Offer,
    Answer,
    IceCandidate,
}

impl RelayKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RelayKind::Offer => "offer",
            RelayKind::Answer => "answer",
            RelayKind::IceCandidate => "ice-candidate",
        }
    }

    /// Whether a connection registered under `role` may send this kind
    pub fn allowed_from(self, role: Role) -> bool {
        matches!(
            (self, role),
            (RelayKind::Offer, Role::Viewer)
                | (RelayKind::Answer, Role::Host)
                | (RelayKind::IceCandidate, _)
        )
    }
}

#[derive(Debug, Deserialize)]
struct IdentifyFields {
    role: Role,
    #[serde(default)]
    secret: Option<String>,
}

/// Messages sent from client to server, classified by envelope type
#[derive(Debug)]
pub enum Inbound {
    /// Join the connection's room under a role
    Identify { role: Role, secret: String },

    Relay(RelayKind, Envelope),

    /// Unrecognized type, ignored
    Unknown(String),
}

impl Inbound {
    pub fn parse(text: &str) -> Result<Self, SignalingError> {
        let envelope = Envelope::parse(text)?;
        let kind = match envelope.kind() {
            "identify" => {
                let fields: IdentifyFields = serde_json::from_value(envelope.into_value())
                    .map_err(|e| SignalingError::MalformedMessage(e.to_string()))?;
                return Ok(Inbound::Identify {
                    role: fields.role,
                    secret: fields.secret.unwrap_or_default(),
                });
            }
            "offer" => RelayKind::Offer,
            "answer" => RelayKind::Answer,
            "ice-candidate" => RelayKind::IceCandidate,
            other => return Ok(Inbound::Unknown(other.to_string())),
        };
        Ok(Inbound::Relay(kind, envelope))
    }
}

/// Messages sent from server to client
#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// Viewer may start offer negotiation
    #[serde(rename = "ready")]
    Ready { role: Role },

    #[serde(rename = "viewer_joined")]
    ViewerJoined {
        #[serde(rename = "viewerId")]
        viewer_id: ViewerId,
    },

    #[serde(rename = "viewer_left")]
    ViewerLeft {
        #[serde(rename = "viewerId")]
        viewer_id: ViewerId,
    },

    #[serde(rename = "host_disconnected")]
    HostDisconnected,

    /// Error notice (`forbidden`, `identify_timeout`)
    #[serde(rename = "error")]
    Error { message: String },
}

impl ServerMessage {
    pub fn error(err: &SignalingError) -> Self {
        ServerMessage::Error {
            message: err.to_string(),
        }
    }

    pub fn to_outbound(&self) -> OutboundMessage {
        let json =
            serde_json::to_string(self).expect("ServerMessage serialization should never fail");
        OutboundMessage::from(json)
    }
}
