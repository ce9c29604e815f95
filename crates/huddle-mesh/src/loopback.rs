//! In-process media engine
//!
//! Links created by any [`LoopbackEngine`] sharing one [`LoopbackNetwork`]
//! can negotiate with each other. Descriptions are `loopback:<owner>:<token>`;
//! applying an answer pairs the two links and both report a remote stream.
//! Closing a paired link reports `Closed` on the other side.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use huddle_core::{HuddleError, IceCandidate, ParticipantId, SdpKind, SessionDescription};

use crate::media::{LinkEvent, LinkEvents, LocalMedia, MediaEngine, PeerLink, RemoteStream};

const SCHEME: &str = "loopback";

/// Shared switchboard for loopback links
#[derive(Debug, Default)]
pub struct LoopbackNetwork {
    links: Mutex<HashMap<u64, Arc<LoopbackLink>>>,
    next_token: AtomicU64,
}

impl LoopbackNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Links not yet closed
    pub fn link_count(&self) -> usize {
        self.links.lock().len()
    }

    fn get(&self, token: u64) -> Option<Arc<LoopbackLink>> {
        self.links.lock().get(&token).cloned()
    }
}

/// [`MediaEngine`] backed by a [`LoopbackNetwork`]
pub struct LoopbackEngine {
    network: Arc<LoopbackNetwork>,
    deny_capture: bool,
}

impl LoopbackEngine {
    pub fn new(network: Arc<LoopbackNetwork>) -> Self {
        Self {
            network,
            deny_capture: false,
        }
    }

    /// Engine whose capture is always refused
    pub fn denying(network: Arc<LoopbackNetwork>) -> Self {
        Self {
            network,
            deny_capture: true,
        }
    }
}

#[async_trait]
impl MediaEngine for LoopbackEngine {
    async fn capture(&self) -> Result<LocalMedia, HuddleError> {
        if self.deny_capture {
            return Err(HuddleError::MediaAccessDenied(
                "camera and microphone access blocked".into(),
            ));
        }
        let n = self.network.next_token.fetch_add(1, Ordering::Relaxed);
        Ok(LocalMedia::new(format!("{}-capture-{}", SCHEME, n)))
    }

    async fn connect(
        &self,
        remote: &ParticipantId,
        _media: &LocalMedia,
        ice_servers: &[String],
        events: LinkEvents,
    ) -> Result<Arc<dyn PeerLink>, HuddleError> {
        let token = self.network.next_token.fetch_add(1, Ordering::Relaxed);
        debug!(
            "Loopback link {} toward {} ({} ice servers ignored)",
            token,
            remote,
            ice_servers.len()
        );

        let link = Arc::new(LoopbackLink {
            token,
            owner: events.local().clone(),
            remote: remote.clone(),
            events,
            network: Arc::downgrade(&self.network),
            state: Mutex::new(LinkState::default()),
        });
        self.network.links.lock().insert(token, Arc::clone(&link));
        Ok(link)
    }
}

#[derive(Debug, Default)]
struct LinkState {
    peer: Option<u64>,
    remote_set: bool,
    closed: bool,
    candidates: usize,
}

#[derive(Debug)]
struct LoopbackLink {
    token: u64,
    owner: ParticipantId,
    remote: ParticipantId,
    events: LinkEvents,
    network: Weak<LoopbackNetwork>,
    state: Mutex<LinkState>,
}

impl LoopbackLink {
    fn describe(&self) -> String {
        format!("{}:{}:{}", SCHEME, self.owner, self.token)
    }

    fn ensure_open(&self) -> Result<(), HuddleError> {
        if self.state.lock().closed {
            return Err(HuddleError::Media(format!("loopback link {} is closed", self.token)));
        }
        Ok(())
    }

    fn lookup(&self, token: u64) -> Result<Arc<LoopbackLink>, HuddleError> {
        self.network
            .upgrade()
            .and_then(|network| network.get(token))
            .ok_or_else(|| HuddleError::Media(format!("no loopback link {}", token)))
    }

    fn emit_host_candidate(&self) {
        let port = 40000 + self.token % 20000;
        self.events.emit(LinkEvent::LocalCandidate(IceCandidate {
            candidate: format!(
                "candidate:{} 1 udp 2122260223 127.0.0.1 {} typ host",
                self.token, port
            ),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
        }));
    }

    fn announce_stream(&self) {
        self.events.emit(LinkEvent::RemoteStream(RemoteStream {
            peer: self.remote.clone(),
            label: format!("{}:{}", SCHEME, self.remote),
        }));
    }
}

/// Token out of `loopback:<owner>:<token>`
fn parse_token(description: &SessionDescription, expected: SdpKind) -> Result<u64, HuddleError> {
    if description.kind != expected {
        return Err(HuddleError::Protocol(format!(
            "expected {:?} description, got {:?}",
            expected, description.kind
        )));
    }
    description
        .sdp
        .strip_prefix(SCHEME)
        .and_then(|rest| rest.strip_prefix(':'))
        .and_then(|rest| rest.rsplit_once(':'))
        .and_then(|(_, token)| token.parse().ok())
        .ok_or_else(|| HuddleError::Protocol(format!("not a loopback description: {}", description.sdp)))
}

#[async_trait]
impl PeerLink for LoopbackLink {
    async fn create_offer(&self) -> Result<SessionDescription, HuddleError> {
        self.ensure_open()?;
        let offer = SessionDescription::offer(self.describe());
        self.emit_host_candidate();
        Ok(offer)
    }

    async fn accept_offer(
        &self,
        offer: SessionDescription,
    ) -> Result<SessionDescription, HuddleError> {
        self.ensure_open()?;
        let offerer = parse_token(&offer, SdpKind::Offer)?;
        self.lookup(offerer)?;

        {
            let mut state = self.state.lock();
            state.peer = Some(offerer);
            state.remote_set = true;
        }

        let answer = SessionDescription::answer(self.describe());
        self.emit_host_candidate();
        Ok(answer)
    }

    async fn apply_answer(&self, answer: SessionDescription) -> Result<(), HuddleError> {
        self.ensure_open()?;
        let answerer_token = parse_token(&answer, SdpKind::Answer)?;
        let answerer = self.lookup(answerer_token)?;

        if answerer.state.lock().peer != Some(self.token) {
            return Err(HuddleError::Media(format!(
                "answer from link {} does not match offer {}",
                answerer_token, self.token
            )));
        }

        {
            let mut state = self.state.lock();
            state.peer = Some(answerer_token);
            state.remote_set = true;
        }

        self.announce_stream();
        answerer.announce_stream();
        Ok(())
    }

    async fn add_candidate(&self, _candidate: IceCandidate) -> Result<(), HuddleError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(HuddleError::Media(format!("loopback link {} is closed", self.token)));
        }
        if !state.remote_set {
            return Err(HuddleError::Protocol("candidate before remote description".into()));
        }
        state.candidates += 1;
        Ok(())
    }

    async fn close(&self) {
        let peer = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.peer
        };

        let Some(network) = self.network.upgrade() else {
            return;
        };
        network.links.lock().remove(&self.token);

        if let Some(other) = peer.and_then(|token| network.get(token)) {
            if other.state.lock().peer == Some(self.token) {
                other.events.emit(LinkEvent::Closed);
            }
        }
        debug!("Loopback link {} closed", self.token);
    }
}
