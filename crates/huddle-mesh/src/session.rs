//! Call session
//!
//! Join order: capture media, allocate an identity, connect discovery, then
//! hand everything to a driver task that owns the [`MeshOrchestrator`].
//! Leaving (or dropping the session) stops the driver, which closes every
//! link, releases the capture and withdraws presence.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use huddle_core::{
    ClientConfig, HuddleError, IdentityAllocator, ParticipantId, RoomName, MIN_RECONCILE_INTERVAL,
};

use crate::connection::PeerState;
use crate::discovery::{DiscoveryEvents, DiscoveryTransport, TransportClaimer};
use crate::media::{LocalMedia, MediaEngine, PeerLinkEvent, RemoteStream};
use crate::orchestrator::{MeshEvent, MeshOrchestrator, MeshSettings};

enum Command {
    Peers(oneshot::Sender<Vec<(ParticipantId, PeerState)>>),
    Leave(oneshot::Sender<()>),
}

/// A joined call. Dropping it leaves the room in the background.
pub struct CallSession {
    local: ParticipantId,
    room: RoomName,
    media: LocalMedia,
    joined: Arc<AtomicBool>,
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<MeshEvent>,
    streams: watch::Receiver<Vec<RemoteStream>>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl CallSession {
    /// Join `room`. Nothing is left registered or captured on failure.
    pub async fn join(
        config: &ClientConfig,
        room: RoomName,
        engine: Arc<dyn MediaEngine>,
        transport: Arc<dyn DiscoveryTransport>,
    ) -> Result<Self, HuddleError> {
        let media = engine.capture().await.map_err(|e| {
            warn!("Local media unavailable: {}", e);
            e
        })?;

        let allocator = IdentityAllocator::new(config.identity, config.max_slots);
        let local = match allocator.allocate(&room, &TransportClaimer(transport.as_ref())).await {
            Ok(id) => id,
            Err(e) => {
                media.stop();
                return Err(e);
            }
        };

        let discovery = match transport.connect(&room, &local).await {
            Ok(discovery) => discovery,
            Err(e) => {
                media.stop();
                return Err(e);
            }
        };

        let (link_tx, links) = mpsc::unbounded_channel();
        let orchestrator = MeshOrchestrator::new(
            local.clone(),
            room.clone(),
            MeshSettings::from_config(config),
            engine,
            media.clone(),
            Arc::clone(&transport),
            link_tx,
        );
        let events = orchestrator.event_sender();
        let streams = orchestrator.watch_streams();

        let joined = Arc::new(AtomicBool::new(true));
        let (commands, command_rx) = mpsc::unbounded_channel();
        let driver = Driver {
            orchestrator,
            transport,
            media: media.clone(),
            discovery,
            links,
            commands: command_rx,
            interval: config.reconcile_interval(),
            joined: Arc::clone(&joined),
        };
        let handle = tokio::spawn(driver.run());

        info!("Joined room {} as {}", room, local);
        Ok(Self {
            local,
            room,
            media,
            joined,
            commands,
            events,
            streams,
            driver: Mutex::new(Some(handle)),
        })
    }

    pub fn local_id(&self) -> &ParticipantId {
        &self.local
    }

    pub fn room(&self) -> &RoomName {
        &self.room
    }

    pub fn local_media(&self) -> &LocalMedia {
        &self.media
    }

    pub fn is_joined(&self) -> bool {
        self.joined.load(Ordering::SeqCst)
    }

    /// Current remote streams, sorted by peer
    pub fn remote_streams(&self) -> Vec<RemoteStream> {
        self.streams.borrow().clone()
    }

    pub fn watch_streams(&self) -> watch::Receiver<Vec<RemoteStream>> {
        self.streams.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MeshEvent> {
        self.events.subscribe()
    }

    /// Every remote with a connection record and its state
    pub async fn peers(&self) -> Result<Vec<(ParticipantId, PeerState)>, HuddleError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Peers(reply))
            .map_err(|_| HuddleError::SessionClosed)?;
        rx.await.map_err(|_| HuddleError::SessionClosed)
    }

    /// Leave the room and wait for teardown to finish
    pub async fn leave(&self) -> Result<(), HuddleError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Leave(reply))
            .map_err(|_| HuddleError::SessionClosed)?;
        rx.await.map_err(|_| HuddleError::SessionClosed)?;

        let handle = self.driver.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Session driver ended abnormally: {}", e);
            }
        }
        Ok(())
    }
}

struct Driver {
    orchestrator: MeshOrchestrator,
    transport: Arc<dyn DiscoveryTransport>,
    media: LocalMedia,
    discovery: DiscoveryEvents,
    links: mpsc::UnboundedReceiver<PeerLinkEvent>,
    commands: mpsc::UnboundedReceiver<Command>,
    interval: Duration,
    joined: Arc<AtomicBool>,
}

impl Driver {
    async fn run(mut self) {
        let mut tick = tokio::time::interval(self.interval.max(MIN_RECONCILE_INTERVAL));
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut discovery_open = true;
        let mut ack = None;

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    if let Err(e) = self.transport.tick().await {
                        warn!("Discovery tick failed: {}", e);
                    }
                    self.orchestrator.reconcile().await;
                }
                event = self.discovery.recv(), if discovery_open => match event {
                    Some(event) => self.orchestrator.handle_discovery(event).await,
                    None => {
                        warn!("Discovery stream ended");
                        discovery_open = false;
                    }
                },
                Some(event) = self.links.recv() => self.orchestrator.handle_link(event).await,
                command = self.commands.recv() => match command {
                    Some(Command::Peers(reply)) => {
                        let _ = reply.send(self.orchestrator.peers());
                    }
                    Some(Command::Leave(reply)) => {
                        ack = Some(reply);
                        break;
                    }
                    None => {
                        debug!("Session handle dropped, leaving");
                        break;
                    }
                },
            }
        }

        self.shutdown().await;
        if let Some(ack) = ack {
            let _ = ack.send(());
        }
    }

    async fn shutdown(&mut self) {
        self.orchestrator.shutdown().await;
        self.media.stop();
        if let Err(e) = self.transport.leave().await {
            warn!("Failed to withdraw presence: {}", e);
        }
        self.joined.store(false, Ordering::SeqCst);
        info!(
            "Left room {} as {}",
            self.orchestrator.room(),
            self.orchestrator.local()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::{LoopbackEngine, LoopbackNetwork};
    use crate::memory::{MemoryHub, MemoryTransport};
    use huddle_core::IdentityStrategy;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    fn config(identity: IdentityStrategy, max_slots: u32) -> ClientConfig {
        ClientConfig {
            identity,
            max_slots,
            reconcile_interval_ms: 20,
            ..ClientConfig::default()
        }
    }

    fn room() -> RoomName {
        RoomName::parse("demo").unwrap()
    }

    async fn join(
        config: &ClientConfig,
        hub: &Arc<MemoryHub>,
        network: &Arc<LoopbackNetwork>,
    ) -> Result<CallSession, HuddleError> {
        CallSession::join(
            config,
            room(),
            Arc::new(LoopbackEngine::new(Arc::clone(network))),
            Arc::new(MemoryTransport::new(Arc::clone(hub))),
        )
        .await
    }

    async fn wait_for_streams(session: &CallSession, count: usize) {
        let mut streams = session.watch_streams();
        timeout(WAIT, streams.wait_for(|streams| streams.len() == count))
            .await
            .expect("timed out waiting for streams")
            .expect("session dropped");
    }

    #[tokio::test]
    async fn test_two_sessions_converge_and_leave() {
        let hub = MemoryHub::new();
        let network = LoopbackNetwork::new();
        let config = config(IdentityStrategy::Opaque, 10);

        let a = join(&config, &hub, &network).await.unwrap();
        let b = join(&config, &hub, &network).await.unwrap();
        assert_ne!(a.local_id(), b.local_id());

        wait_for_streams(&a, 1).await;
        wait_for_streams(&b, 1).await;
        assert_eq!(a.remote_streams()[0].peer, *b.local_id());
        assert_eq!(
            a.peers().await.unwrap(),
            vec![(b.local_id().clone(), PeerState::Connected)]
        );

        b.leave().await.unwrap();
        assert!(!b.is_joined());
        assert!(b.local_media().is_stopped());
        assert_eq!(b.leave().await, Err(HuddleError::SessionClosed));

        wait_for_streams(&a, 0).await;
        assert_eq!(hub.members(&room()), vec![a.local_id().clone()]);
        assert!(a.is_joined());

        a.leave().await.unwrap();
        assert!(hub.members(&room()).is_empty());
        assert_eq!(network.link_count(), 0);
    }

    #[tokio::test]
    async fn test_zero_reconcile_interval_still_leaves() {
        let hub = MemoryHub::new();
        let network = LoopbackNetwork::new();
        let config = ClientConfig {
            reconcile_interval_ms: 0,
            ..config(IdentityStrategy::Opaque, 10)
        };

        let a = join(&config, &hub, &network).await.unwrap();
        let b = join(&config, &hub, &network).await.unwrap();
        wait_for_streams(&a, 1).await;

        a.leave().await.unwrap();
        b.leave().await.unwrap();
        assert!(!a.is_joined());
        assert!(a.local_media().is_stopped());
        assert!(hub.members(&room()).is_empty());
    }

    #[tokio::test]
    async fn test_media_denied_registers_nothing() {
        let hub = MemoryHub::new();
        let network = LoopbackNetwork::new();

        let result = CallSession::join(
            &config(IdentityStrategy::Slot, 10),
            room(),
            Arc::new(LoopbackEngine::denying(network)),
            Arc::new(MemoryTransport::new(Arc::clone(&hub))),
        )
        .await;

        assert!(matches!(result, Err(HuddleError::MediaAccessDenied(_))));
        assert!(hub.members(&room()).is_empty());
    }

    #[tokio::test]
    async fn test_slot_room_full() {
        let hub = MemoryHub::new();
        let network = LoopbackNetwork::new();
        let config = config(IdentityStrategy::Slot, 2);

        let first = join(&config, &hub, &network).await.unwrap();
        let second = join(&config, &hub, &network).await.unwrap();
        assert_eq!(first.local_id().as_str(), "demo-1");
        assert_eq!(second.local_id().as_str(), "demo-2");

        let third = join(&config, &hub, &network).await;
        assert!(matches!(third, Err(HuddleError::RoomFull { max_slots: 2, .. })));

        wait_for_streams(&first, 1).await;
        wait_for_streams(&second, 1).await;
    }

    #[tokio::test]
    async fn test_dropping_session_leaves() {
        let hub = MemoryHub::new();
        let network = LoopbackNetwork::new();
        let config = config(IdentityStrategy::Opaque, 10);

        let session = join(&config, &hub, &network).await.unwrap();
        let media = session.local_media().clone();
        drop(session);

        timeout(WAIT, async {
            while !hub.members(&room()).is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("presence was not withdrawn");
        assert!(media.is_stopped());
    }
}
