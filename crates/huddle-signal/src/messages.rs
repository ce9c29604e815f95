//! Signal service wire messages
//!
//! Push frames are JSON objects `{"event": <name>, "data": <payload>}`, with
//! the event names forming the wire contract. HTTP bodies use camelCase keys.

use serde::{Deserialize, Serialize};

use huddle_core::{ErrorCode, ParticipantId};

/// Frames a push client sends
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientEvent {
    /// Enter the room named in the connection URL
    JoinRoom,

    /// Relay a negotiation payload to another participant
    Signal {
        to: ParticipantId,
        signal: serde_json::Value,
    },

    /// Keepalive; refreshes liveness
    Ping,
}

/// Frames the service pushes to a client
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    /// First frame on every connection: the identity in use
    Welcome(ParticipantId),

    /// Everyone else in the room, sent once to the joiner
    AllUsers(Vec<ParticipantId>),

    UserJoined(ParticipantId),

    UserLeft(ParticipantId),

    /// Relayed negotiation payload
    Signal {
        from: ParticipantId,
        signal: serde_json::Value,
    },

    Error { code: ErrorCode, message: String },
}

impl ClientEvent {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl ServerEvent {
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            code,
            message: message.into(),
        }
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// `POST /presence/announce`, `/presence/leave` and `/identity/claim` body
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRequest {
    pub participant_id: ParticipantId,
    /// Raw room name; validated by the handler so bad names get a JSON error
    #[serde(default)]
    pub room: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SuccessResponse {
    pub success: bool,
}

impl SuccessResponse {
    pub fn ok() -> Self {
        Self { success: true }
    }
}

/// `GET /presence/list` query
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub room: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ListResponse {
    pub participants: Vec<ParticipantId>,
}

/// `POST /signal/send` body
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SendRequest {
    pub from: ParticipantId,
    pub to: ParticipantId,
    pub signal: serde_json::Value,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SendResponse {
    pub success: bool,
    pub delivered: bool,
}

/// `GET /signal/poll` query
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollQuery {
    pub participant_id: ParticipantId,
}

/// A relayed payload waiting in a poll mailbox
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RelayedSignal {
    pub from: ParticipantId,
    pub signal: serde_json::Value,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PollResponse {
    pub messages: Vec<RelayedSignal>,
}

/// `GET /ws` query
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ConnectQuery {
    #[serde(default)]
    pub room: Option<String>,
    /// Previously claimed identity; the service mints one when absent
    #[serde(default)]
    pub id: Option<ParticipantId>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub rooms: usize,
    pub participants: usize,
}

/// HTTP error body
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub code: ErrorCode,
    pub message: String,
}
