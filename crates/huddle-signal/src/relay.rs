//! Signal relay
//!
//! Forwards negotiation payloads between two participants without looking
//! inside them. A recipient with a held WebSocket gets the payload pushed at
//! once; a polling recipient finds it in its mailbox on the next poll.
//! Anything else is dropped silently: the sender's negotiation timeout is
//! the only way a lost payload is noticed.

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::debug;

use huddle_core::ParticipantId;

use crate::messages::{RelayedSignal, ServerEvent};
use crate::registry::PresenceRegistry;
use crate::room::Link;

/// Outcome of one relay attempt. Never an error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Delivery {
    /// Dispatched over the recipient's WebSocket
    Pushed,
    /// Waiting in the recipient's poll mailbox
    Queued,
    /// No live link for the recipient
    Dropped,
}

impl Delivery {
    pub fn delivered(self) -> bool {
        !matches!(self, Delivery::Dropped)
    }
}

pub struct SignalRelay {
    registry: Arc<PresenceRegistry>,
    mailbox_capacity: usize,
}

impl SignalRelay {
    pub fn new(registry: Arc<PresenceRegistry>, mailbox_capacity: usize) -> Self {
        Self {
            registry,
            mailbox_capacity: mailbox_capacity.max(1),
        }
    }

    /// Forward `signal` from `from` to `to`
    pub fn relay(&self, from: &ParticipantId, to: &ParticipantId, signal: serde_json::Value) -> Delivery {
        let capacity = self.mailbox_capacity;
        let relayed = RelayedSignal {
            from: from.clone(),
            signal,
        };

        let delivery = self
            .registry
            .with_participant(to, move |participant| match &mut participant.link {
                Link::Push(tx) => {
                    let event = ServerEvent::Signal {
                        from: relayed.from,
                        signal: relayed.signal,
                    };
                    if tx.send(event).is_ok() {
                        Delivery::Pushed
                    } else {
                        Delivery::Dropped
                    }
                }
                Link::Mailbox(queue) => {
                    enqueue(queue, relayed, capacity);
                    Delivery::Queued
                }
            })
            .unwrap_or(Delivery::Dropped);

        if delivery == Delivery::Dropped {
            debug!("Relay {} -> {} dropped: peer unreachable", from, to);
        }
        delivery
    }

    /// Take everything waiting for a polling participant; counts as liveness
    pub fn poll(&self, id: &ParticipantId) -> Vec<RelayedSignal> {
        let drained = self.registry.with_participant(id, |participant| match &mut participant.link {
            Link::Mailbox(queue) => queue.drain(..).collect(),
            Link::Push(_) => Vec::new(),
        });
        self.registry.record_liveness(id);
        drained.unwrap_or_default()
    }
}

/// Append, dropping the oldest entry when full
fn enqueue(queue: &mut VecDeque<RelayedSignal>, relayed: RelayedSignal, capacity: usize) {
    while queue.len() >= capacity {
        queue.pop_front();
    }
    queue.push_back(relayed);
}
