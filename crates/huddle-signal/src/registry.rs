//! Presence registry
//!
//! Per-room membership with weak, time-bounded liveness. Rooms live in a
//! sharded map so mutations serialize per room; a participant index lets the
//! relay find a recipient without knowing its room.
//!
//! Expiry is whole-room: a room whose last activity is older than the
//! staleness window is dropped by the sweeper, and reads treat it as gone
//! even before the sweeper gets to it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::mapref::one::RefMut;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info};

use huddle_core::{
    Clock, HuddleError, IdentityClaimer, ParticipantId, RoomName, SystemClock, MIN_SWEEP_INTERVAL,
};

use crate::messages::ServerEvent;
use crate::room::{Participant, PushSender, Room};

/// Source of truth for who is in which room
pub struct PresenceRegistry {
    rooms: DashMap<RoomName, Room>,
    /// Participant to room, used by the relay. Verified against the room on use.
    index: DashMap<ParticipantId, RoomName>,
    clock: Arc<dyn Clock>,
    staleness: Duration,
}

impl PresenceRegistry {
    pub fn new(staleness: Duration) -> Self {
        Self::with_clock(staleness, Arc::new(SystemClock))
    }

    pub fn with_clock(staleness: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            rooms: DashMap::new(),
            index: DashMap::new(),
            clock,
            staleness,
        }
    }

    pub fn staleness(&self) -> Duration {
        self.staleness
    }

    /// Idempotent upsert; creates the room and refreshes activity
    pub fn announce(&self, id: &ParticipantId, room: &RoomName) {
        let now = self.clock.now();
        let is_new = self.live_room(room, now).upsert(id, now);
        self.reindex(id, room);

        if is_new {
            info!("Participant {} announced in room {}", id, room);
        }
    }

    /// Insert-only claim on an identity
    pub fn claim(&self, id: &ParticipantId, room: &RoomName) -> Result<(), HuddleError> {
        let now = self.clock.now();
        if !self.live_room(room, now).claim(id, now) {
            debug!("Claim on {} in room {} rejected", id, room);
            return Err(HuddleError::IdentityConflict(id.clone()));
        }
        self.reindex(id, room);
        info!("Participant {} claimed in room {}", id, room);
        Ok(())
    }

    /// Push join: attach the transport, tell the others, return who they are
    pub fn join(&self, id: &ParticipantId, room: &RoomName, tx: PushSender) -> Vec<ParticipantId> {
        let now = self.clock.now();
        let (others, senders) = {
            let mut entry = self.live_room(room, now);
            entry.attach(id, tx, now);
            let others: Vec<_> = entry
                .participant_ids()
                .into_iter()
                .filter(|other| other != id)
                .collect();
            (others, entry.push_senders_except(id))
        };
        self.reindex(id, room);

        for sender in senders {
            let _ = sender.send(ServerEvent::UserJoined(id.clone()));
        }

        info!("Participant {} joined room {} ({} others)", id, room, others.len());
        others
    }

    /// Explicit departure or disconnect. Returns whether the participant was present.
    pub fn leave(&self, id: &ParticipantId, room: &RoomName) -> bool {
        let now = self.clock.now();
        let (removed, senders) = match self.rooms.get_mut(room) {
            Some(mut entry) => {
                let removed = entry.remove(id, now).is_some();
                (removed, entry.push_senders_except(id))
            }
            None => (false, Vec::new()),
        };
        self.index.remove_if(id, |_, indexed| indexed == room);

        if removed {
            for sender in senders {
                let _ = sender.send(ServerEvent::UserLeft(id.clone()));
            }
            info!("Participant {} left room {}", id, room);
        }

        if self.rooms.remove_if(room, |_, r| r.is_empty()).is_some() {
            debug!("Room {} removed (empty)", room);
        }

        removed
    }

    /// Refresh a participant's last-seen and its room's activity
    pub fn record_liveness(&self, id: &ParticipantId) -> bool {
        let now = self.clock.now();
        self.with_participant(id, |participant| participant.last_seen = now)
            .is_some()
    }

    /// Current members of `room`; empty if unknown or past its staleness window
    pub fn list(&self, room: &RoomName) -> Vec<ParticipantId> {
        let now = self.clock.now();
        match self.rooms.get(room) {
            Some(entry) if !entry.is_stale(now, self.staleness) => entry.participant_ids(),
            _ => Vec::new(),
        }
    }

    pub fn room_of(&self, id: &ParticipantId) -> Option<RoomName> {
        self.index.get(id).map(|room| room.value().clone())
    }

    /// Run `f` on a participant's record, touching its room
    pub fn with_participant<R>(
        &self,
        id: &ParticipantId,
        f: impl FnOnce(&mut Participant) -> R,
    ) -> Option<R> {
        let room = self.room_of(id)?;
        let now = self.clock.now();
        let mut entry = self.rooms.get_mut(&room)?;
        let result = entry.get_mut(id).map(f)?;
        entry.touch(now);
        Some(result)
    }

    /// Drop every room whose last activity is older than the staleness window
    pub fn sweep(&self) -> Vec<RoomName> {
        let now = self.clock.now();
        let staleness = self.staleness;
        let mut evicted = Vec::new();
        let mut orphaned = Vec::new();

        self.rooms.retain(|name, room| {
            if room.is_stale(now, staleness) {
                evicted.push(name.clone());
                orphaned.extend(room.participant_ids());
                false
            } else {
                true
            }
        });

        for id in orphaned {
            self.index.remove_if(&id, |_, room| evicted.contains(room));
        }
        for name in &evicted {
            info!("Room {} removed (idle timeout)", name);
        }

        evicted
    }

    /// Run [`sweep`](Self::sweep) on a fixed interval until the task is aborted.
    /// Periods below [`MIN_SWEEP_INTERVAL`] are raised to it.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        let every = every.max(MIN_SWEEP_INTERVAL);
        tokio::spawn(async move {
            let mut tick = interval(every);
            // First tick completes immediately
            tick.tick().await;
            loop {
                tick.tick().await;
                let evicted = registry.sweep();
                debug!(
                    "Sweep evicted {} rooms, {} remain",
                    evicted.len(),
                    registry.room_count()
                );
            }
        })
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn participant_count(&self) -> usize {
        self.rooms.iter().map(|room| room.len()).sum()
    }

    /// Point the index at `room`, dropping the participant from the room it
    /// was indexed under before. One ID is in at most one room.
    fn reindex(&self, id: &ParticipantId, room: &RoomName) {
        let previous = self.index.insert(id.clone(), room.clone());
        if let Some(previous) = previous.filter(|previous| previous != room) {
            debug!("Participant {} moved from room {} to {}", id, previous, room);
            self.leave(id, &previous);
        }
    }

    /// Room entry for writing; a stale room is replaced by a fresh one
    fn live_room(&self, room: &RoomName, now: Instant) -> RefMut<'_, RoomName, Room> {
        let mut entry = self
            .rooms
            .entry(room.clone())
            .or_insert_with(|| Room::new(room.clone(), now));

        if entry.is_stale(now, self.staleness) {
            debug!("Room {} expired before sweep, starting fresh", room);
            *entry = Room::new(room.clone(), now);
        }
        entry
    }
}

#[async_trait]
impl IdentityClaimer for PresenceRegistry {
    async fn claim(&self, room: &RoomName, candidate: &ParticipantId) -> Result<(), HuddleError> {
        PresenceRegistry::claim(self, candidate, room)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use huddle_core::{IdentityAllocator, ManualClock};
    use std::collections::HashSet;
    use tokio::sync::mpsc;

    fn registry() -> (PresenceRegistry, ManualClock) {
        let clock = ManualClock::new();
        let registry = PresenceRegistry::with_clock(Duration::from_secs(60), Arc::new(clock.clone()));
        (registry, clock)
    }

    fn room(name: &str) -> RoomName {
        RoomName::parse(name).unwrap()
    }

    #[test]
    fn test_announce_twice_is_one_member() {
        let (registry, _clock) = registry();
        let demo = room("demo");
        registry.announce(&"a".into(), &demo);
        registry.announce(&"a".into(), &demo);
        assert_eq!(registry.list(&demo), vec![ParticipantId::from("a")]);
    }

    #[test]
    fn test_unknown_room_is_empty() {
        let (registry, _clock) = registry();
        assert!(registry.list(&room("nowhere")).is_empty());
    }

    #[test]
    fn test_listing_only_contains_announced() {
        let (registry, _clock) = registry();
        let demo = room("demo");
        let lobby = room("lobby");
        registry.announce(&"a".into(), &demo);
        registry.announce(&"b".into(), &lobby);
        registry.claim(&"demo-1".into(), &demo).unwrap();

        let listed: HashSet<_> = registry.list(&demo).into_iter().collect();
        let expected: HashSet<ParticipantId> = ["a".into(), "demo-1".into()].into_iter().collect();
        assert_eq!(listed, expected);
    }

    #[test]
    fn test_stale_room_disappears_before_sweep() {
        let (registry, clock) = registry();
        let demo = room("demo");
        registry.announce(&"a".into(), &demo);

        clock.advance(Duration::from_secs(59));
        assert_eq!(registry.list(&demo).len(), 1);

        clock.advance(Duration::from_secs(2));
        assert!(registry.list(&demo).is_empty());
    }

    #[test]
    fn test_sweep_drops_whole_room() {
        let (registry, clock) = registry();
        let demo = room("demo");
        let lobby = room("lobby");
        registry.announce(&"a".into(), &demo);
        registry.announce(&"b".into(), &demo);

        clock.advance(Duration::from_secs(45));
        registry.announce(&"c".into(), &lobby);
        clock.advance(Duration::from_secs(30));

        let evicted = registry.sweep();
        assert_eq!(evicted, vec![demo.clone()]);
        assert!(registry.list(&demo).is_empty());
        assert_eq!(registry.list(&lobby).len(), 1);
        assert!(registry.room_of(&"a".into()).is_none());
        assert_eq!(registry.room_count(), 1);
    }

    #[test]
    fn test_activity_keeps_room_alive() {
        let (registry, clock) = registry();
        let demo = room("demo");
        registry.announce(&"a".into(), &demo);

        for _ in 0..5 {
            clock.advance(Duration::from_secs(30));
            registry.announce(&"a".into(), &demo);
        }
        assert!(registry.sweep().is_empty());
        assert_eq!(registry.list(&demo).len(), 1);
    }

    #[test]
    fn test_reannounce_after_expiry_starts_fresh_room() {
        let (registry, clock) = registry();
        let demo = room("demo");
        registry.announce(&"old".into(), &demo);
        clock.advance(Duration::from_secs(120));

        registry.announce(&"new".into(), &demo);
        assert_eq!(registry.list(&demo), vec![ParticipantId::from("new")]);
    }

    #[test]
    fn test_claim_conflict() {
        let (registry, _clock) = registry();
        let demo = room("demo");
        registry.claim(&"demo-1".into(), &demo).unwrap();
        assert_eq!(
            registry.claim(&"demo-1".into(), &demo),
            Err(HuddleError::IdentityConflict("demo-1".into()))
        );
    }

    #[test]
    fn test_join_notifies_others() {
        let (registry, _clock) = registry();
        let demo = room("demo");
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, _rx_b) = mpsc::unbounded_channel();

        assert!(registry.join(&"a".into(), &demo, tx_a).is_empty());
        let others = registry.join(&"b".into(), &demo, tx_b);
        assert_eq!(others, vec![ParticipantId::from("a")]);
        assert_eq!(rx_a.try_recv().unwrap(), ServerEvent::UserJoined("b".into()));
    }

    #[test]
    fn test_leave_notifies_and_removes_empty_room() {
        let (registry, _clock) = registry();
        let demo = room("demo");
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, _rx_b) = mpsc::unbounded_channel();
        registry.join(&"a".into(), &demo, tx_a);
        registry.join(&"b".into(), &demo, tx_b);

        assert!(registry.leave(&"b".into(), &demo));
        assert_eq!(rx_a.try_recv().unwrap(), ServerEvent::UserLeft("b".into()));
        assert!(!registry.leave(&"b".into(), &demo));

        assert!(registry.leave(&"a".into(), &demo));
        assert_eq!(registry.room_count(), 0);
    }

    #[test]
    fn test_announce_in_another_room_moves_participant() {
        let (registry, _clock) = registry();
        let demo = room("demo");
        let lobby = room("lobby");
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        registry.join(&"b".into(), &demo, tx_b);
        registry.announce(&"a".into(), &demo);

        registry.announce(&"a".into(), &lobby);
        assert_eq!(registry.list(&demo), vec![ParticipantId::from("b")]);
        assert_eq!(registry.list(&lobby), vec![ParticipantId::from("a")]);
        assert_eq!(registry.room_of(&"a".into()), Some(lobby.clone()));
        assert_eq!(rx_b.try_recv().unwrap(), ServerEvent::UserLeft("a".into()));

        assert!(registry.leave(&"a".into(), &lobby));
        assert!(registry.room_of(&"a".into()).is_none());
        assert_eq!(registry.room_count(), 1);
    }

    #[tokio::test]
    async fn test_zero_sweep_interval_still_sweeps() {
        let (registry, clock) = registry();
        let registry = Arc::new(registry);
        registry.announce(&"a".into(), &room("demo"));
        clock.advance(Duration::from_secs(61));

        let sweeper = registry.spawn_sweeper(Duration::ZERO);
        tokio::time::timeout(Duration::from_secs(5), async {
            while registry.room_count() > 0 {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .expect("stale room was never swept");
        assert!(!sweeper.is_finished());
        sweeper.abort();
    }

    #[test]
    fn test_record_liveness() {
        let (registry, clock) = registry();
        let demo = room("demo");
        registry.announce(&"a".into(), &demo);

        clock.advance(Duration::from_secs(50));
        assert!(registry.record_liveness(&"a".into()));
        clock.advance(Duration::from_secs(50));
        assert_eq!(registry.list(&demo).len(), 1);

        assert!(!registry.record_liveness(&"ghost".into()));
    }

    #[tokio::test]
    async fn test_eleven_slot_claims_against_registry() {
        let (registry, _clock) = registry();
        let registry = Arc::new(registry);
        let demo = room("demo");

        let mut handles = Vec::new();
        for _ in 0..11 {
            let registry = Arc::clone(&registry);
            let demo = demo.clone();
            handles.push(tokio::spawn(async move {
                IdentityAllocator::slots(10).allocate(&demo, registry.as_ref()).await
            }));
        }

        let mut claimed = HashSet::new();
        let mut full = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(id) => assert!(claimed.insert(id)),
                Err(HuddleError::RoomFull { max_slots, .. }) => {
                    assert_eq!(max_slots, 10);
                    full += 1;
                }
                Err(e) => panic!("unexpected error: {}", e),
            }
        }
        assert_eq!(claimed.len(), 10);
        assert_eq!(full, 1);
        assert_eq!(registry.list(&demo).len(), 10);
    }
}
