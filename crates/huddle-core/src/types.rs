//! Core type definitions for Huddle
//!
//! Room names and participant identities are shared by the signal service
//! and the mesh client, so both sides normalize them the same way.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::HuddleError;
use crate::{DEFAULT_ROOM, MAX_ROOM_NAME_LEN};

/// Number of random bytes in an opaque participant ID
pub const OPAQUE_ID_BYTES: usize = 8;

/// A normalized room name (trimmed, lowercased)
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RoomName(String);

impl RoomName {
    /// Parse and normalize a human-entered room name.
    ///
    /// Blank input resolves to the default room.
    pub fn parse(raw: &str) -> Result<Self, HuddleError> {
        let normalized = raw.trim().to_lowercase();

        if normalized.is_empty() {
            return Ok(Self(DEFAULT_ROOM.to_string()));
        }
        if normalized.len() > MAX_ROOM_NAME_LEN {
            return Err(HuddleError::InvalidRoom(format!(
                "room name longer than {} bytes",
                MAX_ROOM_NAME_LEN
            )));
        }
        if normalized.chars().any(|c| c.is_control()) {
            return Err(HuddleError::InvalidRoom(
                "room name contains control characters".into(),
            ));
        }

        Ok(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RoomName {
    fn default() -> Self {
        Self(DEFAULT_ROOM.to_string())
    }
}

impl fmt::Display for RoomName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for RoomName {
    type Error = HuddleError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<RoomName> for String {
    fn from(room: RoomName) -> Self {
        room.0
    }
}

/// Identity of one joined client
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Mint a random opaque identity (16 hex chars)
    pub fn generate() -> Result<Self, HuddleError> {
        let mut bytes = [0u8; OPAQUE_ID_BYTES];
        getrandom::fill(&mut bytes).map_err(|e| HuddleError::Entropy(e.to_string()))?;
        Ok(Self(hex::encode(bytes)))
    }

    /// Deterministic slot identity: `<room>-<slot>`
    pub fn for_slot(room: &RoomName, slot: u32) -> Self {
        Self(format!("{}-{}", room, slot))
    }

    /// Slot number if this identity is a slot identity in `room`
    pub fn slot_in(&self, room: &RoomName) -> Option<u32> {
        self.0
            .strip_prefix(room.as_str())
            .and_then(|rest| rest.strip_prefix('-'))
            .and_then(|n| n.parse().ok())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form for log lines and labels
    pub fn short(&self) -> &str {
        self.0.get(..8).unwrap_or(&self.0)
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ParticipantId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_room_name_normalization() {
        let room = RoomName::parse("  Demo Room ").unwrap();
        assert_eq!(room.as_str(), "demo room");
        assert_eq!(RoomName::parse("DEMO").unwrap(), RoomName::parse("demo").unwrap());
    }

    #[test]
    fn test_blank_room_is_global() {
        assert_eq!(RoomName::parse("   ").unwrap().as_str(), "global");
        assert_eq!(RoomName::default().as_str(), "global");
    }

    #[test]
    fn test_room_name_too_long() {
        let raw = "x".repeat(MAX_ROOM_NAME_LEN + 1);
        assert!(matches!(RoomName::parse(&raw), Err(HuddleError::InvalidRoom(_))));
    }

    #[test]
    fn test_room_name_deserialize_normalizes() {
        let room: RoomName = serde_json::from_str("\" Lobby \"").unwrap();
        assert_eq!(room.as_str(), "lobby");
    }

    #[test]
    fn test_generated_ids_are_distinct() {
        let a = ParticipantId::generate().unwrap();
        let b = ParticipantId::generate().unwrap();
        assert_eq!(a.as_str().len(), OPAQUE_ID_BYTES * 2);
        assert_ne!(a, b);
    }

    #[test]
    fn test_slot_identity() {
        let room = RoomName::parse("Demo").unwrap();
        let id = ParticipantId::for_slot(&room, 3);
        assert_eq!(id.as_str(), "demo-3");
        assert_eq!(id.slot_in(&room), Some(3));

        let other = RoomName::parse("lobby").unwrap();
        assert_eq!(id.slot_in(&other), None);
    }
}
