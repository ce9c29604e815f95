//! Discovery transport seam
//!
//! One interface, interchangeable implementations: [`PollTransport`]
//! (announce/list/poll over HTTP), [`PushTransport`] (WebSocket events) and
//! [`MemoryTransport`] (in-process, for tests and embedding).
//!
//! [`PollTransport`]: crate::poll::PollTransport
//! [`PushTransport`]: crate::push::PushTransport
//! [`MemoryTransport`]: crate::memory::MemoryTransport

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::warn;

use huddle_core::{HuddleError, IdentityClaimer, ParticipantId, RoomName, SignalPayload};

/// What a transport tells the orchestrator
#[derive(Clone, Debug, PartialEq)]
pub enum DiscoveryEvent {
    /// Everyone else currently in the room
    Roster(Vec<ParticipantId>),
    Joined(ParticipantId),
    Left(ParticipantId),
    /// Relayed negotiation payload
    Signal {
        from: ParticipantId,
        payload: SignalPayload,
    },
}

pub type DiscoveryEvents = mpsc::UnboundedReceiver<DiscoveryEvent>;

/// Presence plus signal relay, from the client side
#[async_trait]
pub trait DiscoveryTransport: IdentityClaimer {
    /// Register as `id` in `room` and start receiving events
    async fn connect(&self, room: &RoomName, id: &ParticipantId)
        -> Result<DiscoveryEvents, HuddleError>;

    /// Periodic upkeep: refresh liveness, and for pull transports fetch the
    /// roster and pending signals
    async fn tick(&self) -> Result<(), HuddleError>;

    /// Relay a payload. A recipient that cannot be reached is not an error.
    async fn send_signal(&self, to: &ParticipantId, payload: &SignalPayload)
        -> Result<(), HuddleError>;

    /// Withdraw presence. The transport may be connected again afterwards.
    async fn leave(&self) -> Result<(), HuddleError>;
}

/// Lets the identity allocator claim through any transport
pub struct TransportClaimer<'a>(pub &'a dyn DiscoveryTransport);

#[async_trait]
impl<'a> IdentityClaimer for TransportClaimer<'a> {
    async fn claim(&self, room: &RoomName, candidate: &ParticipantId) -> Result<(), HuddleError> {
        self.0.claim(room, candidate).await
    }
}

/// Decode a relayed payload; malformed payloads are logged and skipped
pub fn decode_signal(from: ParticipantId, signal: serde_json::Value) -> Option<DiscoveryEvent> {
    match SignalPayload::from_value(signal) {
        Ok(payload) => Some(DiscoveryEvent::Signal { from, payload }),
        Err(e) => {
            warn!("Dropping malformed signal from {}: {}", from, e);
            None
        }
    }
}
