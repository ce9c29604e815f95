//! Room state held by the presence registry

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use huddle_core::{ParticipantId, RoomName};

use crate::messages::{RelayedSignal, ServerEvent};

/// Handle used to push events to a connected client
pub type PushSender = mpsc::UnboundedSender<ServerEvent>;

/// How relayed signals reach a participant
#[derive(Debug)]
pub enum Link {
    /// Held WebSocket; delivery is immediate
    Push(PushSender),
    /// Request/response client; signals wait here until the next poll
    Mailbox(VecDeque<RelayedSignal>),
}

/// A participant in a room
#[derive(Debug)]
pub struct Participant {
    pub last_seen: Instant,
    pub link: Link,
}

impl Participant {
    fn polling(now: Instant) -> Self {
        Self {
            last_seen: now,
            link: Link::Mailbox(VecDeque::new()),
        }
    }

    pub fn push_sender(&self) -> Option<&PushSender> {
        match &self.link {
            Link::Push(tx) => Some(tx),
            Link::Mailbox(_) => None,
        }
    }
}

/// A named scope in which participants discover each other
#[derive(Debug)]
pub struct Room {
    pub name: RoomName,
    participants: HashMap<ParticipantId, Participant>,
    last_activity: Instant,
}

impl Room {
    pub fn new(name: RoomName, now: Instant) -> Self {
        Self {
            name,
            participants: HashMap::new(),
            last_activity: now,
        }
    }

    /// Insert or refresh a polling participant. Returns true if it was new.
    pub fn upsert(&mut self, id: &ParticipantId, now: Instant) -> bool {
        self.last_activity = now;
        match self.participants.get_mut(id) {
            Some(participant) => {
                participant.last_seen = now;
                false
            }
            None => {
                self.participants.insert(id.clone(), Participant::polling(now));
                true
            }
        }
    }

    /// Insert only if absent. Returns false when the identity is held.
    pub fn claim(&mut self, id: &ParticipantId, now: Instant) -> bool {
        if self.participants.contains_key(id) {
            return false;
        }
        self.upsert(id, now)
    }

    /// Attach a push link, creating the participant if needed
    pub fn attach(&mut self, id: &ParticipantId, tx: PushSender, now: Instant) {
        self.last_activity = now;
        self.participants.insert(
            id.clone(),
            Participant {
                last_seen: now,
                link: Link::Push(tx),
            },
        );
    }

    pub fn remove(&mut self, id: &ParticipantId, now: Instant) -> Option<Participant> {
        self.last_activity = now;
        self.participants.remove(id)
    }

    pub fn get_mut(&mut self, id: &ParticipantId) -> Option<&mut Participant> {
        self.participants.get_mut(id)
    }

    pub fn contains(&self, id: &ParticipantId) -> bool {
        self.participants.contains_key(id)
    }

    /// Sorted participant IDs
    pub fn participant_ids(&self) -> Vec<ParticipantId> {
        let mut ids: Vec<_> = self.participants.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Push links of everyone except `except`
    pub fn push_senders_except(&self, except: &ParticipantId) -> Vec<PushSender> {
        self.participants
            .iter()
            .filter(|(id, _)| *id != except)
            .filter_map(|(_, p)| p.push_sender().cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    pub fn is_stale(&self, now: Instant, window: Duration) -> bool {
        now.saturating_duration_since(self.last_activity) > window
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_activity = now;
    }
}
