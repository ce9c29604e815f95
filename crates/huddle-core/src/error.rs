//! Error types shared by the signal service and the mesh client

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{ParticipantId, RoomName};

/// Coordination errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HuddleError {
    /// Slot already held by someone else; the allocator moves to the next one
    #[error("identity {0} is already claimed")]
    IdentityConflict(ParticipantId),

    #[error("room {room} is full ({max_slots} slots)")]
    RoomFull { room: RoomName, max_slots: u32 },

    #[error("media access denied: {0}")]
    MediaAccessDenied(String),

    /// No live link for the recipient. Expected while discovering.
    #[error("peer {0} is unreachable")]
    PeerUnreachable(ParticipantId),

    #[error("negotiation with {0} timed out")]
    NegotiationTimeout(ParticipantId),

    #[error("invalid room name: {0}")]
    InvalidRoom(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("media error: {0}")]
    Media(String),

    #[error("entropy source unavailable: {0}")]
    Entropy(String),

    #[error("session already closed")]
    SessionClosed,
}

impl HuddleError {
    /// Failures that end a join attempt and must reach the user unretried
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            HuddleError::RoomFull { .. } | HuddleError::MediaAccessDenied(_)
        )
    }

    /// Failures the reconciliation loop absorbs and retries on the next tick
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            HuddleError::IdentityConflict(_)
                | HuddleError::PeerUnreachable(_)
                | HuddleError::NegotiationTimeout(_)
                | HuddleError::Transport(_)
        )
    }

    pub fn code(&self) -> ErrorCode {
        ErrorCode::from(self)
    }
}

/// Wire error codes (sent in HTTP error bodies and push `error` events)
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    IdentityConflict,
    RoomFull,
    InvalidRequest,
    NotJoined,
    InternalError,
}

impl From<&HuddleError> for ErrorCode {
    fn from(e: &HuddleError) -> Self {
        match e {
            HuddleError::IdentityConflict(_) => ErrorCode::IdentityConflict,
            HuddleError::RoomFull { .. } => ErrorCode::RoomFull,
            HuddleError::InvalidRoom(_) | HuddleError::Protocol(_) => ErrorCode::InvalidRequest,
            HuddleError::PeerUnreachable(_) | HuddleError::SessionClosed => ErrorCode::NotJoined,
            _ => ErrorCode::InternalError,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_errors() {
        let room = RoomName::parse("demo").unwrap();
        assert!(HuddleError::RoomFull { room, max_slots: 10 }.is_terminal());
        assert!(HuddleError::MediaAccessDenied("camera".into()).is_terminal());
        assert!(!HuddleError::IdentityConflict("demo-1".into()).is_terminal());
        assert!(!HuddleError::PeerUnreachable("abc".into()).is_terminal());
    }

    #[test]
    fn test_retryable_errors() {
        assert!(HuddleError::IdentityConflict("demo-1".into()).is_retryable());
        assert!(HuddleError::Transport("reset".into()).is_retryable());
        assert!(!HuddleError::MediaAccessDenied("mic".into()).is_retryable());
    }

    #[test]
    fn test_error_code_serialization() {
        let code = HuddleError::IdentityConflict("demo-2".into()).code();
        assert_eq!(serde_json::to_string(&code).unwrap(), "\"identity_conflict\"");
    }
}
