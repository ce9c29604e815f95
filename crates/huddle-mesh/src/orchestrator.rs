//! Mesh connection orchestrator
//!
//! Turns "who else is in the room" into one negotiated media link per remote
//! participant. Runs inside a single driver task; every method takes
//! `&mut self` and the only suspension points are transport, link and timer
//! awaits.
//!
//! # Roster absence
//!
//! A peer missing from one roster snapshot keeps its connection; snapshots
//! are allowed to race with joins. It is closed once it has been missing
//! from at least [`ABSENT_SNAPSHOTS`] consecutive snapshots spanning the
//! roster grace window. Transports that never resend a roster (push after
//! `all-users`) therefore never trigger this.
//!
//! # Glare
//!
//! When both sides offer at once, the side with the lexicographically smaller
//! participant ID drops its own offer and answers; the larger side ignores the
//! incoming offer and waits for that answer. Both sides reach the same
//! decision independently, so exactly one link survives per pair.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, warn};

use huddle_core::{
    ClientConfig, Clock, HuddleError, IceCandidate, IdentityStrategy, ParticipantId, RoomName,
    SessionDescription, SignalPayload, SystemClock,
};

use crate::connection::{buffer_candidate, ConnectionRecord, Effect, PeerState, RecordEvent, Role};
use crate::discovery::{DiscoveryEvent, DiscoveryTransport};
use crate::media::{LinkEvents, LocalMedia, MediaEngine, PeerLinkEvent, RemoteStream};

/// Capacity of the [`MeshEvent`] broadcast channel
pub const EVENT_CAPACITY: usize = 64;

/// Consecutive snapshots a peer must be missing from before it is closed
pub const ABSENT_SNAPSHOTS: u32 = 2;

/// When a peer first went missing from the roster, and for how many snapshots
#[derive(Clone, Copy, Debug)]
struct Absence {
    since: Instant,
    snapshots: u32,
}

/// Where the desired peer set comes from on each reconciliation
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DiscoverySource {
    /// Latest roster from the transport
    Roster,
    /// Every slot identity in the room
    Slots { max_slots: u32 },
}

#[derive(Clone, Debug)]
pub struct MeshSettings {
    pub ice_servers: Vec<String>,
    pub negotiation_timeout: Duration,
    pub roster_grace: Duration,
    pub discovery: DiscoverySource,
}

impl MeshSettings {
    pub fn from_config(config: &ClientConfig) -> Self {
        let discovery = match config.identity {
            IdentityStrategy::Opaque => DiscoverySource::Roster,
            IdentityStrategy::Slot => DiscoverySource::Slots {
                max_slots: config.max_slots,
            },
        };
        Self {
            ice_servers: config.stun_servers.clone(),
            negotiation_timeout: config.negotiation_timeout(),
            roster_grace: config.roster_grace(),
            discovery,
        }
    }
}

/// Change visible to the UI layer
#[derive(Clone, Debug, PartialEq)]
pub enum MeshEvent {
    StreamAdded(RemoteStream),
    StreamRemoved(ParticipantId),
    PeerState { peer: ParticipantId, state: PeerState },
}

pub struct MeshOrchestrator {
    local: ParticipantId,
    room: RoomName,
    settings: MeshSettings,
    engine: Arc<dyn MediaEngine>,
    media: LocalMedia,
    transport: Arc<dyn DiscoveryTransport>,
    clock: Arc<dyn Clock>,
    records: HashMap<ParticipantId, ConnectionRecord>,
    /// Candidates from peers we have no record for yet
    early: HashMap<ParticipantId, VecDeque<IceCandidate>>,
    roster: BTreeSet<ParticipantId>,
    absent: HashMap<ParticipantId, Absence>,
    next_link_id: u64,
    link_tx: mpsc::UnboundedSender<PeerLinkEvent>,
    events: broadcast::Sender<MeshEvent>,
    streams: watch::Sender<Vec<RemoteStream>>,
}

impl MeshOrchestrator {
    pub fn new(
        local: ParticipantId,
        room: RoomName,
        settings: MeshSettings,
        engine: Arc<dyn MediaEngine>,
        media: LocalMedia,
        transport: Arc<dyn DiscoveryTransport>,
        link_tx: mpsc::UnboundedSender<PeerLinkEvent>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (streams, _) = watch::channel(Vec::new());
        Self {
            local,
            room,
            settings,
            engine,
            media,
            transport,
            clock: Arc::new(SystemClock),
            records: HashMap::new(),
            early: HashMap::new(),
            roster: BTreeSet::new(),
            absent: HashMap::new(),
            next_link_id: 0,
            link_tx,
            events,
            streams,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn local(&self) -> &ParticipantId {
        &self.local
    }

    pub fn room(&self) -> &RoomName {
        &self.room
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MeshEvent> {
        self.events.subscribe()
    }

    pub fn event_sender(&self) -> broadcast::Sender<MeshEvent> {
        self.events.clone()
    }

    /// Sorted snapshot of remote streams, updated on every change
    pub fn watch_streams(&self) -> watch::Receiver<Vec<RemoteStream>> {
        self.streams.subscribe()
    }

    pub fn peer_state(&self, peer: &ParticipantId) -> Option<PeerState> {
        self.records.get(peer).map(|record| record.state())
    }

    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    /// Every record and its state, sorted by peer
    pub fn peers(&self) -> Vec<(ParticipantId, PeerState)> {
        let mut peers: Vec<_> = self
            .records
            .iter()
            .map(|(id, record)| (id.clone(), record.state()))
            .collect();
        peers.sort_by(|a, b| a.0.cmp(&b.0));
        peers
    }

    pub async fn handle_discovery(&mut self, event: DiscoveryEvent) {
        match event {
            DiscoveryEvent::Roster(ids) => {
                self.roster = ids.into_iter().filter(|id| *id != self.local).collect();
                debug!("Roster for {}: {} others", self.room, self.roster.len());
                self.note_absences();
                self.ensure_records().await;
            }
            DiscoveryEvent::Joined(id) => {
                if id == self.local {
                    return;
                }
                self.roster.insert(id.clone());
                self.absent.remove(&id);
                self.offer_to(&id).await;
            }
            DiscoveryEvent::Left(id) => {
                self.roster.remove(&id);
                self.early.remove(&id);
                self.close_record(&id, "left the room").await;
            }
            DiscoveryEvent::Signal { from, payload } => self.handle_signal(from, payload).await,
        }
    }

    pub async fn handle_link(&mut self, event: PeerLinkEvent) {
        let Some(record) = self.records.get_mut(&event.remote) else {
            debug!("Link event for {} without a record", event.remote);
            return;
        };
        if record.link_id() != event.link_id {
            debug!("Stale link event for {} (link {})", event.remote, event.link_id);
            return;
        }

        let effect = record.intake(RecordEvent::Link(event.event)).await;
        self.apply(&event.remote, effect).await;
    }

    /// Expire stuck negotiations and long-absent peers, then offer to every
    /// desired peer without a record
    pub async fn reconcile(&mut self) {
        let now = self.clock.now();
        let timeout = self.settings.negotiation_timeout;
        let expired: Vec<_> = self
            .records
            .iter()
            .filter(|(_, record)| record.is_expired(now, timeout))
            .map(|(id, _)| id.clone())
            .collect();

        for id in expired {
            warn!("{}", HuddleError::NegotiationTimeout(id.clone()));
            self.close_record(&id, "negotiation timed out").await;
        }

        let grace = self.settings.roster_grace;
        let departed: Vec<_> = self
            .absent
            .iter()
            .filter(|(_, absence)| {
                absence.snapshots >= ABSENT_SNAPSHOTS
                    && now.saturating_duration_since(absence.since) >= grace
            })
            .map(|(id, _)| id.clone())
            .collect();

        for id in departed {
            self.close_record(&id, "gone from the roster").await;
        }

        self.ensure_records().await;
    }

    /// Close every record and forget all peers
    pub async fn shutdown(&mut self) {
        let ids: Vec<_> = self.records.keys().cloned().collect();
        for id in ids {
            self.close_record(&id, "leaving").await;
        }
        self.early.clear();
        self.roster.clear();
        self.absent.clear();
        self.publish_streams();
    }

    /// Count one more miss for every record whose peer the latest roster
    /// left out; forget peers it lists
    fn note_absences(&mut self) {
        let now = self.clock.now();
        let roster = &self.roster;
        self.absent.retain(|id, _| !roster.contains(id));
        for id in self.records.keys().filter(|id| !roster.contains(*id)) {
            self.absent
                .entry(id.clone())
                .and_modify(|absence| absence.snapshots += 1)
                .or_insert(Absence {
                    since: now,
                    snapshots: 1,
                });
        }
    }

    fn desired_peers(&self) -> Vec<ParticipantId> {
        match self.settings.discovery {
            DiscoverySource::Roster => self.roster.iter().cloned().collect(),
            DiscoverySource::Slots { max_slots } => (1..=max_slots)
                .map(|slot| ParticipantId::for_slot(&self.room, slot))
                .filter(|id| *id != self.local)
                .collect(),
        }
    }

    async fn ensure_records(&mut self) {
        for peer in self.desired_peers() {
            if !self.records.contains_key(&peer) {
                self.offer_to(&peer).await;
            }
        }
    }

    async fn offer_to(&mut self, remote: &ParticipantId) {
        if *remote == self.local {
            return;
        }
        if let Some(record) = self.records.get(remote) {
            debug!("Already {:?} with {}, not offering", record.state(), remote);
            return;
        }

        let mut record = match self.create_record(remote).await {
            Ok(record) => record,
            Err(e) => {
                warn!("Failed to create link to {}: {}", remote, e);
                return;
            }
        };

        match record.start_offer().await {
            Ok(offer) => {
                info!("Offering to {}", remote);
                self.records.insert(remote.clone(), record);
                self.publish_state(remote, PeerState::Negotiating(Role::Offerer));
                self.send(remote, &offer).await;
            }
            Err(e) => {
                warn!("Failed to create offer for {}: {}", remote, e);
                record.close().await;
            }
        }
    }

    async fn create_record(&mut self, remote: &ParticipantId) -> Result<ConnectionRecord, HuddleError> {
        self.next_link_id += 1;
        let link_id = self.next_link_id;
        let events = LinkEvents::new(self.local.clone(), remote.clone(), link_id, self.link_tx.clone());
        let link = self
            .engine
            .connect(remote, &self.media, &self.settings.ice_servers, events)
            .await?;

        let mut record = ConnectionRecord::new(remote.clone(), link_id, link, self.clock.now());
        if let Some(early) = self.early.remove(remote) {
            record.adopt_candidates(early);
        }
        Ok(record)
    }

    async fn handle_signal(&mut self, from: ParticipantId, payload: SignalPayload) {
        if from == self.local {
            return;
        }

        let event = match payload {
            SignalPayload::Offer(offer) => return self.on_offer(from, offer).await,
            other => RecordEvent::from(other),
        };

        let Some(record) = self.records.get_mut(&from) else {
            match event {
                RecordEvent::Candidate(candidate) => {
                    buffer_candidate(self.early.entry(from).or_default(), candidate)
                }
                _ => debug!("Answer from {} without a record", from),
            }
            return;
        };

        let effect = record.intake(event).await;
        self.apply(&from, effect).await;
    }

    async fn on_offer(&mut self, from: ParticipantId, offer: SessionDescription) {
        let existing = self
            .records
            .get(&from)
            .map(|record| (record.awaiting_answer(), record.state()));
        if let Some((awaiting_answer, state)) = existing {
            if !awaiting_answer {
                debug!("Ignoring offer from {}: already {:?}", from, state);
                return;
            }
            if self.local > from {
                debug!("Glare with {}: keeping our offer", from);
                return;
            }

            info!("Glare with {}: yielding and answering", from);
            if let Some(mut ours) = self.records.remove(&from) {
                ours.close().await;
            }
        }

        let mut record = match self.create_record(&from).await {
            Ok(record) => record,
            Err(e) => {
                warn!("Failed to create link for offer from {}: {}", from, e);
                return;
            }
        };

        let effect = record.intake(RecordEvent::Offer(offer)).await;
        if !matches!(effect, Effect::Closed(_)) {
            self.records.insert(from.clone(), record);
            self.publish_state(&from, PeerState::Negotiating(Role::Answerer));
        }
        self.apply(&from, effect).await;
    }

    async fn apply(&mut self, remote: &ParticipantId, effect: Effect) {
        match effect {
            Effect::Nothing => {}
            Effect::Send(payload) => self.send(remote, &payload).await,
            Effect::StreamReady(stream) => {
                info!("Connected to {}", remote);
                self.publish_state(remote, PeerState::Connected);
                let _ = self.events.send(MeshEvent::StreamAdded(stream));
                self.publish_streams();
            }
            Effect::Closed(stream) => {
                self.records.remove(remote);
                self.absent.remove(remote);
                self.retract(remote, stream);
            }
        }
    }

    async fn close_record(&mut self, remote: &ParticipantId, reason: &str) {
        self.absent.remove(remote);
        if let Some(mut record) = self.records.remove(remote) {
            info!("Closing connection to {} ({})", remote, reason);
            let stream = record.close().await;
            self.retract(remote, stream);
        }
    }

    fn retract(&mut self, remote: &ParticipantId, stream: Option<RemoteStream>) {
        if stream.is_some() {
            let _ = self.events.send(MeshEvent::StreamRemoved(remote.clone()));
        }
        self.publish_state(remote, PeerState::Closed);
        self.publish_streams();
    }

    async fn send(&self, to: &ParticipantId, payload: &SignalPayload) {
        if let Err(e) = self.transport.send_signal(to, payload).await {
            warn!("Failed to send {} to {}: {}", payload.kind(), to, e);
        }
    }

    fn publish_state(&self, peer: &ParticipantId, state: PeerState) {
        let _ = self.events.send(MeshEvent::PeerState {
            peer: peer.clone(),
            state,
        });
    }

    fn publish_streams(&self) {
        let mut streams: Vec<_> = self
            .records
            .values()
            .filter_map(|record| record.stream().cloned())
            .collect();
        streams.sort();
        self.streams.send_replace(streams);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::DiscoveryEvents;
    use crate::loopback::{LoopbackEngine, LoopbackNetwork};
    use crate::memory::{MemoryHub, MemoryTransport};
    use huddle_core::ManualClock;

    struct Side {
        orchestrator: MeshOrchestrator,
        discovery: DiscoveryEvents,
        links: mpsc::UnboundedReceiver<PeerLinkEvent>,
        media: LocalMedia,
    }

    fn settings(discovery: DiscoverySource) -> MeshSettings {
        MeshSettings {
            ice_servers: vec!["stun:stun.example.org:3478".into()],
            negotiation_timeout: Duration::from_secs(15),
            roster_grace: Duration::from_secs(30),
            discovery,
        }
    }

    async fn side(
        hub: &Arc<MemoryHub>,
        network: &Arc<LoopbackNetwork>,
        id: &str,
        discovery: DiscoverySource,
        clock: &ManualClock,
    ) -> Side {
        let room = RoomName::parse("demo").unwrap();
        let engine = Arc::new(LoopbackEngine::new(Arc::clone(network)));
        let media = engine.capture().await.unwrap();
        let transport = Arc::new(MemoryTransport::new(Arc::clone(hub)));
        let discovery_rx = transport.connect(&room, &id.into()).await.unwrap();
        let (link_tx, links) = mpsc::unbounded_channel();

        let orchestrator = MeshOrchestrator::new(
            id.into(),
            room,
            settings(discovery),
            engine,
            media.clone(),
            transport,
            link_tx,
        )
        .with_clock(Arc::new(clock.clone()));

        Side {
            orchestrator,
            discovery: discovery_rx,
            links,
            media,
        }
    }

    /// Deliver everything in flight until both sides are quiet
    async fn pump(sides: &mut [&mut Side]) {
        loop {
            let mut progressed = false;
            for side in sides.iter_mut() {
                while let Ok(event) = side.discovery.try_recv() {
                    side.orchestrator.handle_discovery(event).await;
                    progressed = true;
                }
                while let Ok(event) = side.links.try_recv() {
                    side.orchestrator.handle_link(event).await;
                    progressed = true;
                }
            }
            if !progressed {
                break;
            }
        }
    }

    fn id(s: &str) -> ParticipantId {
        ParticipantId::from(s)
    }

    fn stream_peers(side: &Side) -> Vec<ParticipantId> {
        side.orchestrator
            .watch_streams()
            .borrow()
            .iter()
            .map(|s| s.peer.clone())
            .collect()
    }

    #[tokio::test]
    async fn test_two_peers_connect() {
        let hub = MemoryHub::new();
        let network = LoopbackNetwork::new();
        let clock = ManualClock::new();
        let mut alice = side(&hub, &network, "alice", DiscoverySource::Roster, &clock).await;
        let mut bob = side(&hub, &network, "bob", DiscoverySource::Roster, &clock).await;

        pump(&mut [&mut alice, &mut bob]).await;

        assert_eq!(alice.orchestrator.peers(), vec![(id("bob"), PeerState::Connected)]);
        assert_eq!(bob.orchestrator.peers(), vec![(id("alice"), PeerState::Connected)]);
        assert_eq!(stream_peers(&alice), vec![id("bob")]);
        assert_eq!(stream_peers(&bob), vec![id("alice")]);
        assert_eq!(network.link_count(), 2);
    }

    #[tokio::test]
    async fn test_glare_converges_to_one_link_per_pair() {
        let hub = MemoryHub::new();
        let network = LoopbackNetwork::new();
        let clock = ManualClock::new();
        let mut alice = side(&hub, &network, "alice", DiscoverySource::Roster, &clock).await;
        let mut bob = side(&hub, &network, "bob", DiscoverySource::Roster, &clock).await;

        // Both learn of each other and offer before either offer is delivered
        while alice.discovery.try_recv().is_ok() {}
        while bob.discovery.try_recv().is_ok() {}
        alice.orchestrator.handle_discovery(DiscoveryEvent::Joined(id("bob"))).await;
        bob.orchestrator.handle_discovery(DiscoveryEvent::Roster(vec![id("alice")])).await;
        assert_eq!(alice.orchestrator.peer_state(&id("bob")), Some(PeerState::Negotiating(Role::Offerer)));
        assert_eq!(bob.orchestrator.peer_state(&id("alice")), Some(PeerState::Negotiating(Role::Offerer)));

        pump(&mut [&mut alice, &mut bob]).await;

        assert_eq!(alice.orchestrator.record_count(), 1);
        assert_eq!(bob.orchestrator.record_count(), 1);
        assert_eq!(alice.orchestrator.peer_state(&id("bob")), Some(PeerState::Connected));
        assert_eq!(bob.orchestrator.peer_state(&id("alice")), Some(PeerState::Connected));
        // alice yielded: her offer link is gone, one pair remains
        assert_eq!(network.link_count(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_discovery_is_suppressed() {
        let hub = MemoryHub::new();
        let network = LoopbackNetwork::new();
        let clock = ManualClock::new();
        let mut alice = side(&hub, &network, "alice", DiscoverySource::Roster, &clock).await;

        for _ in 0..3 {
            alice.orchestrator.handle_discovery(DiscoveryEvent::Joined(id("carol"))).await;
        }
        alice.orchestrator.handle_discovery(DiscoveryEvent::Roster(vec![id("carol")])).await;
        alice.orchestrator.reconcile().await;
        assert_eq!(alice.orchestrator.record_count(), 1);
        assert_eq!(network.link_count(), 1);
    }

    #[tokio::test]
    async fn test_roster_omission_keeps_connection() {
        let hub = MemoryHub::new();
        let network = LoopbackNetwork::new();
        let clock = ManualClock::new();
        let mut alice = side(&hub, &network, "alice", DiscoverySource::Roster, &clock).await;
        let mut bob = side(&hub, &network, "bob", DiscoverySource::Roster, &clock).await;
        pump(&mut [&mut alice, &mut bob]).await;

        alice.orchestrator.handle_discovery(DiscoveryEvent::Roster(vec![])).await;
        alice.orchestrator.reconcile().await;
        assert_eq!(alice.orchestrator.peer_state(&id("bob")), Some(PeerState::Connected));

        // One omitted snapshot is not a departure, however long ago it was
        clock.advance(Duration::from_secs(120));
        alice.orchestrator.reconcile().await;
        assert_eq!(alice.orchestrator.peer_state(&id("bob")), Some(PeerState::Connected));

        // Listed again: the miss is forgotten
        alice.orchestrator.handle_discovery(DiscoveryEvent::Roster(vec![id("bob")])).await;
        alice.orchestrator.handle_discovery(DiscoveryEvent::Roster(vec![])).await;
        alice.orchestrator.reconcile().await;
        assert_eq!(alice.orchestrator.peer_state(&id("bob")), Some(PeerState::Connected));
    }

    #[tokio::test]
    async fn test_sustained_roster_absence_closes() {
        let hub = MemoryHub::new();
        let network = LoopbackNetwork::new();
        let clock = ManualClock::new();
        let mut alice = side(&hub, &network, "alice", DiscoverySource::Roster, &clock).await;
        let mut bob = side(&hub, &network, "bob", DiscoverySource::Roster, &clock).await;
        pump(&mut [&mut alice, &mut bob]).await;
        // Bob vanishes without his link ever reporting a close
        drop(bob);

        let mut events = alice.orchestrator.subscribe();
        for _ in 0..5 {
            alice.orchestrator.handle_discovery(DiscoveryEvent::Roster(vec![])).await;
            alice.orchestrator.reconcile().await;
            clock.advance(Duration::from_secs(3));
        }
        // Several misses, but still inside the grace window
        assert_eq!(alice.orchestrator.peer_state(&id("bob")), Some(PeerState::Connected));

        clock.advance(Duration::from_secs(30));
        alice.orchestrator.handle_discovery(DiscoveryEvent::Roster(vec![])).await;
        alice.orchestrator.reconcile().await;

        assert_eq!(alice.orchestrator.record_count(), 0);
        assert!(stream_peers(&alice).is_empty());
        assert_eq!(events.try_recv().unwrap(), MeshEvent::StreamRemoved(id("bob")));
        assert_eq!(
            events.try_recv().unwrap(),
            MeshEvent::PeerState { peer: id("bob"), state: PeerState::Closed }
        );
    }

    #[tokio::test]
    async fn test_left_retracts_stream() {
        let hub = MemoryHub::new();
        let network = LoopbackNetwork::new();
        let clock = ManualClock::new();
        let mut alice = side(&hub, &network, "alice", DiscoverySource::Roster, &clock).await;
        let mut bob = side(&hub, &network, "bob", DiscoverySource::Roster, &clock).await;
        pump(&mut [&mut alice, &mut bob]).await;

        let mut events = alice.orchestrator.subscribe();
        alice.orchestrator.handle_discovery(DiscoveryEvent::Left(id("bob"))).await;

        assert_eq!(alice.orchestrator.record_count(), 0);
        assert!(stream_peers(&alice).is_empty());
        assert_eq!(events.try_recv().unwrap(), MeshEvent::StreamRemoved(id("bob")));

        // Bob's side hears the link close
        pump(&mut [&mut alice, &mut bob]).await;
        assert_eq!(bob.orchestrator.record_count(), 0);
        assert!(stream_peers(&bob).is_empty());
    }

    #[tokio::test]
    async fn test_negotiation_timeout() {
        let hub = MemoryHub::new();
        let network = LoopbackNetwork::new();
        let clock = ManualClock::new();
        let mut alice = side(&hub, &network, "alice", DiscoverySource::Roster, &clock).await;

        // Nobody answers for a ghost
        alice.orchestrator.handle_discovery(DiscoveryEvent::Joined(id("ghost"))).await;
        clock.advance(Duration::from_secs(10));
        alice.orchestrator.reconcile().await;
        assert!(alice.orchestrator.peer_state(&id("ghost")).is_some());

        alice.orchestrator.handle_discovery(DiscoveryEvent::Roster(vec![])).await;
        clock.advance(Duration::from_secs(6));
        alice.orchestrator.reconcile().await;
        assert!(alice.orchestrator.peer_state(&id("ghost")).is_none());
    }

    #[tokio::test]
    async fn test_timed_out_peer_still_listed_is_retried() {
        let hub = MemoryHub::new();
        let network = LoopbackNetwork::new();
        let clock = ManualClock::new();
        let mut alice = side(&hub, &network, "alice", DiscoverySource::Roster, &clock).await;

        alice.orchestrator.handle_discovery(DiscoveryEvent::Roster(vec![id("ghost")])).await;
        let mut events = alice.orchestrator.subscribe();
        clock.advance(Duration::from_secs(16));
        alice.orchestrator.reconcile().await;

        assert_eq!(
            events.try_recv().unwrap(),
            MeshEvent::PeerState { peer: id("ghost"), state: PeerState::Closed }
        );
        assert_eq!(
            alice.orchestrator.peer_state(&id("ghost")),
            Some(PeerState::Negotiating(Role::Offerer))
        );
    }

    #[tokio::test]
    async fn test_slot_enumeration() {
        let hub = MemoryHub::new();
        let network = LoopbackNetwork::new();
        let clock = ManualClock::new();
        let mut alice =
            side(&hub, &network, "demo-2", DiscoverySource::Slots { max_slots: 3 }, &clock).await;

        alice.orchestrator.reconcile().await;
        let peers: Vec<_> = alice.orchestrator.peers().into_iter().map(|(id, _)| id).collect();
        assert_eq!(peers, vec![id("demo-1"), id("demo-3")]);
    }

    #[tokio::test]
    async fn test_early_candidates_wait_for_record() {
        let hub = MemoryHub::new();
        let network = LoopbackNetwork::new();
        let clock = ManualClock::new();
        let mut alice = side(&hub, &network, "alice", DiscoverySource::Roster, &clock).await;
        let mut bob = side(&hub, &network, "bob", DiscoverySource::Roster, &clock).await;
        while alice.discovery.try_recv().is_ok() {}
        while bob.discovery.try_recv().is_ok() {}

        // A candidate that outruns the offer is held, not dropped
        let candidate = SignalPayload::Candidate(IceCandidate::new("candidate:early"));
        alice
            .orchestrator
            .handle_discovery(DiscoveryEvent::Signal { from: id("bob"), payload: candidate })
            .await;
        assert_eq!(alice.orchestrator.record_count(), 0);

        bob.orchestrator.handle_discovery(DiscoveryEvent::Joined(id("alice"))).await;
        pump(&mut [&mut alice, &mut bob]).await;
        assert_eq!(alice.orchestrator.peer_state(&id("bob")), Some(PeerState::Connected));
    }

    #[tokio::test]
    async fn test_shutdown_closes_everything() {
        let hub = MemoryHub::new();
        let network = LoopbackNetwork::new();
        let clock = ManualClock::new();
        let mut alice = side(&hub, &network, "alice", DiscoverySource::Roster, &clock).await;
        let mut bob = side(&hub, &network, "bob", DiscoverySource::Roster, &clock).await;
        pump(&mut [&mut alice, &mut bob]).await;

        alice.orchestrator.shutdown().await;
        assert_eq!(alice.orchestrator.record_count(), 0);
        assert!(stream_peers(&alice).is_empty());
        assert!(!alice.media.is_stopped());

        pump(&mut [&mut alice, &mut bob]).await;
        assert_eq!(bob.orchestrator.record_count(), 0);
    }
}
