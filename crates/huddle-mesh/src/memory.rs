//! In-process discovery
//!
//! A [`MemoryHub`] plays the signal service for transports in the same
//! process: push-style join/leave events, immediate relay, insert-only
//! claims. No expiry.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use huddle_core::{HuddleError, IdentityClaimer, ParticipantId, RoomName, SignalPayload};

use crate::discovery::{DiscoveryEvent, DiscoveryEvents, DiscoveryTransport};

type Inbox = mpsc::UnboundedSender<DiscoveryEvent>;

/// Shared room table. A member without an inbox has claimed but not connected.
#[derive(Debug, Default)]
pub struct MemoryHub {
    rooms: Mutex<HashMap<RoomName, BTreeMap<ParticipantId, Option<Inbox>>>>,
}

impl MemoryHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn members(&self, room: &RoomName) -> Vec<ParticipantId> {
        self.rooms
            .lock()
            .get(room)
            .map(|members| members.keys().cloned().collect())
            .unwrap_or_default()
    }
}

pub struct MemoryTransport {
    hub: Arc<MemoryHub>,
    session: Mutex<Option<(RoomName, ParticipantId)>>,
}

impl MemoryTransport {
    pub fn new(hub: Arc<MemoryHub>) -> Self {
        Self {
            hub,
            session: Mutex::new(None),
        }
    }

    fn session(&self) -> Result<(RoomName, ParticipantId), HuddleError> {
        self.session.lock().clone().ok_or(HuddleError::SessionClosed)
    }
}

#[async_trait]
impl IdentityClaimer for MemoryTransport {
    async fn claim(&self, room: &RoomName, candidate: &ParticipantId) -> Result<(), HuddleError> {
        let mut rooms = self.hub.rooms.lock();
        let members = rooms.entry(room.clone()).or_default();
        if members.contains_key(candidate) {
            return Err(HuddleError::IdentityConflict(candidate.clone()));
        }
        members.insert(candidate.clone(), None);
        Ok(())
    }
}

#[async_trait]
impl DiscoveryTransport for MemoryTransport {
    async fn connect(
        &self,
        room: &RoomName,
        id: &ParticipantId,
    ) -> Result<DiscoveryEvents, HuddleError> {
        let (tx, rx) = mpsc::unbounded_channel();

        let others: Vec<_> = {
            let mut rooms = self.hub.rooms.lock();
            let members = rooms.entry(room.clone()).or_default();
            for inbox in members
                .iter()
                .filter(|(other, _)| *other != id)
                .filter_map(|(_, inbox)| inbox.as_ref())
            {
                let _ = inbox.send(DiscoveryEvent::Joined(id.clone()));
            }
            members.insert(id.clone(), Some(tx.clone()));
            members.keys().filter(|other| *other != id).cloned().collect()
        };

        let _ = tx.send(DiscoveryEvent::Roster(others));
        *self.session.lock() = Some((room.clone(), id.clone()));
        Ok(rx)
    }

    async fn tick(&self) -> Result<(), HuddleError> {
        self.session().map(|_| ())
    }

    async fn send_signal(
        &self,
        to: &ParticipantId,
        payload: &SignalPayload,
    ) -> Result<(), HuddleError> {
        let (room, from) = self.session()?;
        let rooms = self.hub.rooms.lock();
        let inbox = rooms
            .get(&room)
            .and_then(|members| members.get(to))
            .and_then(|inbox| inbox.as_ref());

        match inbox {
            Some(inbox) => {
                let _ = inbox.send(DiscoveryEvent::Signal {
                    from,
                    payload: payload.clone(),
                });
            }
            None => debug!("{}", HuddleError::PeerUnreachable(to.clone())),
        }
        Ok(())
    }

    async fn leave(&self) -> Result<(), HuddleError> {
        let session = self.session.lock().take();
        let Some((room, id)) = session else {
            return Ok(());
        };

        let mut rooms = self.hub.rooms.lock();
        if let Some(members) = rooms.get_mut(&room) {
            members.remove(&id);
            for inbox in members.values().flatten() {
                let _ = inbox.send(DiscoveryEvent::Left(id.clone()));
            }
            if members.is_empty() {
                rooms.remove(&room);
            }
        }
        Ok(())
    }
}
