use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::identity::Identity;

/// Peer-visible connection identifier.
pub type ConnectionId = String;

pub const AUTH: &str = "auth";
pub const PING: &str = "ping";
pub const PONG: &str = "pong";
pub const CONNECTION_SUCCESS: &str = "connection-success";
pub const NEW_PEER: &str = "new-peer";
pub const PEER_LEFT: &str = "peer-left";
pub const ERROR: &str = "error";

const TARGET_FIELD: &str = "targetClientId";
const SOURCE_FIELD: &str = "sourceClientId";

/// Types the server answers or emits itself; a client may never relay them.
const RESERVED_TYPES: &[&str] = &[
    AUTH,
    PING,
    PONG,
    CONNECTION_SUCCESS,
    NEW_PEER,
    PEER_LEFT,
    ERROR,
];

/// Generate a fresh connection id.
pub fn generate_connection_id() -> ConnectionId {
    uuid::Uuid::new_v4().to_string()
}

pub fn is_reserved_type(kind: &str) -> bool {
    RESERVED_TYPES.contains(&kind)
}

/// One `{type, payload}` frame as it travels on the socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireFrame {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
}

impl WireFrame {
    pub fn parse(text: &str) -> Result<Self, FrameError> {
        serde_json::from_str(text).map_err(|err| FrameError::Json(err.to_string()))
    }

    pub fn is_auth(&self) -> bool {
        self.kind == AUTH
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame is not valid json: {0}")]
    Json(String),
    #[error("frame type is empty")]
    EmptyType,
    #[error("auth frame is missing a token")]
    MissingToken,
    #[error("payload of '{0}' must be an object")]
    PayloadNotObject(String),
    #[error("'{0}' frame is missing targetClientId")]
    MissingTarget(String),
    #[error("'{0}' is a reserved type and cannot be relayed")]
    ReservedType(String),
    #[error("'{0}' is not an allowed relay type")]
    TypeNotAllowed(String),
    #[error("frame is not valid utf-8")]
    NotUtf8,
}

impl FrameError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            FrameError::Json(_) => "invalid_json",
            FrameError::EmptyType => "empty_type",
            FrameError::MissingToken => "missing_token",
            FrameError::PayloadNotObject(_) => "payload_not_object",
            FrameError::MissingTarget(_) => "missing_target",
            FrameError::ReservedType(_) => "reserved_type",
            FrameError::TypeNotAllowed(_) => "type_not_allowed",
            FrameError::NotUtf8 => "not_utf8",
        }
    }
}

/// Messages a client may send, validated at decode time.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Auth { token: String },
    Ping,
    Relay(RelayRequest),
}

/// A directed frame addressed to another peer.
///
/// `kind` and everything in `payload` except `targetClientId` are opaque to the
/// server. The payload still carries `targetClientId` when forwarded.
#[derive(Debug, Clone, PartialEq)]
pub struct RelayRequest {
    pub kind: String,
    pub target: ConnectionId,
    pub payload: Map<String, Value>,
}

impl RelayRequest {
    /// Stamp the sender id onto the payload, replacing anything the client put there.
    pub fn into_forwarded(mut self, source: &str) -> ServerMessage {
        self.payload
            .insert(SOURCE_FIELD.to_string(), Value::String(source.to_string()));
        ServerMessage::Relayed {
            kind: self.kind,
            payload: self.payload,
        }
    }
}

/// Which directed types may be relayed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum RelayPolicy {
    /// Anything carrying `targetClientId` that is not reserved.
    #[default]
    AnyDirected,
    AllowList(Vec<String>),
}

impl RelayPolicy {
    pub fn permits(&self, kind: &str) -> bool {
        match self {
            RelayPolicy::AnyDirected => true,
            RelayPolicy::AllowList(kinds) => kinds.iter().any(|allowed| allowed == kind),
        }
    }
}

impl ClientMessage {
    pub fn decode(frame: WireFrame, policy: &RelayPolicy) -> Result<Self, FrameError> {
        let WireFrame { kind, payload } = frame;
        if kind.is_empty() {
            return Err(FrameError::EmptyType);
        }
        if kind == AUTH {
            let token = payload
                .get("token")
                .and_then(Value::as_str)
                .filter(|token| !token.is_empty())
                .ok_or(FrameError::MissingToken)?;
            return Ok(ClientMessage::Auth {
                token: token.to_string(),
            });
        }
        if kind == PING {
            return Ok(ClientMessage::Ping);
        }
        if is_reserved_type(&kind) {
            return Err(FrameError::ReservedType(kind));
        }

        let payload = match payload {
            Value::Object(map) => map,
            _ => return Err(FrameError::PayloadNotObject(kind)),
        };
        let target = match payload.get(TARGET_FIELD).and_then(Value::as_str) {
            Some(target) if !target.is_empty() => target.to_string(),
            _ => return Err(FrameError::MissingTarget(kind)),
        };
        if !policy.permits(&kind) {
            return Err(FrameError::TypeNotAllowed(kind));
        }
        Ok(ClientMessage::Relay(RelayRequest {
            kind,
            target,
            payload,
        }))
    }
}

/// Directory entry as clients see it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    pub client_id: ConnectionId,
    #[serde(flatten)]
    pub identity: Identity,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionSuccess {
    pub client_id: ConnectionId,
    pub existing_peers: Vec<PeerInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerLeft {
    pub client_id: ConnectionId,
}

/// Messages sent from the server to a client.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    ConnectionSuccess(ConnectionSuccess),
    NewPeer(PeerInfo),
    PeerLeft(PeerLeft),
    Pong,
    Error { message: String },
    /// A relayed frame; `kind` is whatever the sender used.
    Relayed {
        kind: String,
        payload: Map<String, Value>,
    },
}

impl ServerMessage {
    pub fn kind(&self) -> &str {
        match self {
            ServerMessage::ConnectionSuccess(_) => CONNECTION_SUCCESS,
            ServerMessage::NewPeer(_) => NEW_PEER,
            ServerMessage::PeerLeft(_) => PEER_LEFT,
            ServerMessage::Pong => PONG,
            ServerMessage::Error { .. } => ERROR,
            ServerMessage::Relayed { kind, .. } => kind,
        }
    }

    pub fn into_frame(self) -> Result<WireFrame, serde_json::Error> {
        let kind = self.kind().to_string();
        let payload = match self {
            ServerMessage::ConnectionSuccess(body) => serde_json::to_value(body)?,
            ServerMessage::NewPeer(peer) => serde_json::to_value(peer)?,
            ServerMessage::PeerLeft(body) => serde_json::to_value(body)?,
            ServerMessage::Pong => Value::Object(Map::new()),
            ServerMessage::Error { message } => serde_json::json!({ "message": message }),
            ServerMessage::Relayed { payload, .. } => Value::Object(payload),
        };
        Ok(WireFrame { kind, payload })
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.clone().into_frame()?)
    }
}
