//! Poll discovery
//!
//! Every tick: announce (liveness), list the room, drain the signal mailbox.
//! Peer departures are never reported as such; the orchestrator learns of
//! them from the media link or from the peer staying off the roster.

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info};

use huddle_core::{HuddleError, IdentityClaimer, ParticipantId, RoomName, SignalPayload};

use crate::client::SignalClient;
use crate::discovery::{decode_signal, DiscoveryEvent, DiscoveryEvents, DiscoveryTransport};

#[derive(Clone)]
struct PollSession {
    room: RoomName,
    id: ParticipantId,
    tx: mpsc::UnboundedSender<DiscoveryEvent>,
}

pub struct PollTransport {
    client: SignalClient,
    session: Mutex<Option<PollSession>>,
}

impl PollTransport {
    pub fn new(client: SignalClient) -> Self {
        Self {
            client,
            session: Mutex::new(None),
        }
    }

    fn session(&self) -> Result<PollSession, HuddleError> {
        self.session.lock().clone().ok_or(HuddleError::SessionClosed)
    }
}

#[async_trait]
impl IdentityClaimer for PollTransport {
    async fn claim(&self, room: &RoomName, candidate: &ParticipantId) -> Result<(), HuddleError> {
        self.client.claim(candidate, room).await
    }
}

#[async_trait]
impl DiscoveryTransport for PollTransport {
    async fn connect(
        &self,
        room: &RoomName,
        id: &ParticipantId,
    ) -> Result<DiscoveryEvents, HuddleError> {
        self.client.announce(id, room).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        *self.session.lock() = Some(PollSession {
            room: room.clone(),
            id: id.clone(),
            tx,
        });

        info!("Announced {} in room {} (poll)", id, room);
        Ok(rx)
    }

    async fn tick(&self) -> Result<(), HuddleError> {
        let session = self.session()?;

        self.client.announce(&session.id, &session.room).await?;

        let others: Vec<_> = self
            .client
            .list(&session.room)
            .await?
            .into_iter()
            .filter(|id| *id != session.id)
            .collect();
        if session.tx.send(DiscoveryEvent::Roster(others)).is_err() {
            return Err(HuddleError::SessionClosed);
        }

        for relayed in self.client.poll(&session.id).await? {
            if let Some(event) = decode_signal(relayed.from, relayed.signal) {
                let _ = session.tx.send(event);
            }
        }
        Ok(())
    }

    async fn send_signal(
        &self,
        to: &ParticipantId,
        payload: &SignalPayload,
    ) -> Result<(), HuddleError> {
        let session = self.session()?;
        let delivered = self.client.send(&session.id, to, payload.to_value()?).await?;
        if !delivered {
            debug!("{}", HuddleError::PeerUnreachable(to.clone()));
        }
        Ok(())
    }

    async fn leave(&self) -> Result<(), HuddleError> {
        let session = self.session.lock().take();
        if let Some(session) = session {
            self.client.leave(&session.id, &session.room).await?;
            info!("Left room {} (poll)", session.room);
        }
        Ok(())
    }
}
