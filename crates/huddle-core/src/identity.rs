//! Identity allocation
//!
//! Two strategies:
//! - **Opaque**: a random ID, no conflicts possible
//! - **Slot**: `<room>-1`, `<room>-2`, ... up to `max_slots`, each claimed
//!   through an [`IdentityClaimer`]. A conflict moves on to the next slot;
//!   running out of slots is `RoomFull`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::HuddleError;
use crate::types::{ParticipantId, RoomName};

/// Reference room capacity for the slot strategy
pub const DEFAULT_MAX_SLOTS: u32 = 10;

/// Which identity strategy a deployment uses
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityStrategy {
    Opaque,
    Slot,
}

/// Authority that accepts or rejects a claim on a candidate identity
#[async_trait]
pub trait IdentityClaimer: Send + Sync {
    /// Claim `candidate` in `room`. Must fail with
    /// [`HuddleError::IdentityConflict`] when the identity is already held.
    async fn claim(&self, room: &RoomName, candidate: &ParticipantId) -> Result<(), HuddleError>;
}

/// Resolves a room into a participant identity
#[derive(Clone, Copy, Debug)]
pub struct IdentityAllocator {
    strategy: IdentityStrategy,
    max_slots: u32,
}

impl IdentityAllocator {
    pub fn new(strategy: IdentityStrategy, max_slots: u32) -> Self {
        Self {
            strategy,
            max_slots,
        }
    }

    pub fn opaque() -> Self {
        Self::new(IdentityStrategy::Opaque, DEFAULT_MAX_SLOTS)
    }

    pub fn slots(max_slots: u32) -> Self {
        Self::new(IdentityStrategy::Slot, max_slots)
    }

    pub fn strategy(&self) -> IdentityStrategy {
        self.strategy
    }

    pub fn max_slots(&self) -> u32 {
        self.max_slots
    }

    /// All candidate identities for `room`, in claim order
    pub fn candidates(&self, room: &RoomName) -> Vec<ParticipantId> {
        (1..=self.max_slots)
            .map(|slot| ParticipantId::for_slot(room, slot))
            .collect()
    }

    /// Allocate an identity in `room`.
    ///
    /// With the opaque strategy the claimer is not consulted.
    pub async fn allocate(
        &self,
        room: &RoomName,
        claimer: &dyn IdentityClaimer,
    ) -> Result<ParticipantId, HuddleError> {
        match self.strategy {
            IdentityStrategy::Opaque => ParticipantId::generate(),
            IdentityStrategy::Slot => self.claim_slot(room, claimer).await,
        }
    }

    async fn claim_slot(
        &self,
        room: &RoomName,
        claimer: &dyn IdentityClaimer,
    ) -> Result<ParticipantId, HuddleError> {
        for candidate in self.candidates(room) {
            match claimer.claim(room, &candidate).await {
                Ok(()) => {
                    info!("Claimed identity {} in room {}", candidate, room);
                    return Ok(candidate);
                }
                Err(HuddleError::IdentityConflict(_)) => {
                    debug!("Identity {} taken, trying next slot", candidate);
                }
                Err(e) => return Err(e),
            }
        }

        Err(HuddleError::RoomFull {
            room: room.clone(),
            max_slots: self.max_slots,
        })
    }
}
