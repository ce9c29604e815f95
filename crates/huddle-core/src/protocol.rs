//! Negotiation payloads exchanged between two participants
//!
//! On the wire each payload is a JSON object with exactly one key:
//! `{"offer": ...}`, `{"answer": ...}` or `{"candidate": ...}`. The signal
//! service forwards these as opaque JSON; only the mesh client decodes them.

use serde::{Deserialize, Serialize};

use crate::error::HuddleError;

/// Session description (offer or answer body)
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate as produced by the media layer
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex", skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
        }
    }
}

/// One negotiation message
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalPayload {
    Offer(SessionDescription),
    Answer(SessionDescription),
    Candidate(IceCandidate),
}

impl SignalPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            SignalPayload::Offer(_) => "offer",
            SignalPayload::Answer(_) => "answer",
            SignalPayload::Candidate(_) => "candidate",
        }
    }

    /// Decode from the opaque JSON carried by the relay
    pub fn from_value(value: serde_json::Value) -> Result<Self, HuddleError> {
        serde_json::from_value(value).map_err(|e| HuddleError::Protocol(e.to_string()))
    }

    pub fn to_value(&self) -> Result<serde_json::Value, HuddleError> {
        serde_json::to_value(self).map_err(|e| HuddleError::Protocol(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_offer_wire_shape() {
        let payload = SignalPayload::Offer(SessionDescription::offer("v=0"));
        let value = payload.to_value().unwrap();
        assert_eq!(value, json!({"offer": {"type": "offer", "sdp": "v=0"}}));
    }

    #[test]
    fn test_candidate_wire_shape() {
        let value = json!({
            "candidate": {
                "candidate": "candidate:1 1 udp 2122260223 10.0.0.2 54321 typ host",
                "sdpMid": "0",
                "sdpMLineIndex": 0
            }
        });
        match SignalPayload::from_value(value).unwrap() {
            SignalPayload::Candidate(c) => {
                assert_eq!(c.sdp_mid.as_deref(), Some("0"));
                assert_eq!(c.sdp_mline_index, Some(0));
            }
            other => panic!("wrong payload: {:?}", other),
        }
    }

    #[test]
    fn test_rejects_unknown_key() {
        let value = json!({"bye": {}});
        assert!(matches!(
            SignalPayload::from_value(value),
            Err(HuddleError::Protocol(_))
        ));
    }

    #[test]
    fn test_rejects_two_keys() {
        let value = json!({
            "offer": {"type": "offer", "sdp": "a"},
            "answer": {"type": "answer", "sdp": "b"}
        });
        assert!(SignalPayload::from_value(value).is_err());
    }
}
