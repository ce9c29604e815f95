//! Media layer seam
//!
//! The actual audio/video transport lives outside this crate. The
//! orchestrator drives it through [`MediaEngine`] and [`PeerLink`] and hears
//! back through [`LinkEvents`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use huddle_core::{HuddleError, IceCandidate, ParticipantId, SessionDescription};

/// Shared handle to the local capture
///
/// Cloned into every link; only the call session stops it.
#[derive(Clone, Debug)]
pub struct LocalMedia {
    inner: Arc<LocalMediaInner>,
}

#[derive(Debug)]
struct LocalMediaInner {
    label: String,
    stopped: AtomicBool,
}

impl LocalMedia {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(LocalMediaInner {
                label: label.into(),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// Release the capture devices. Idempotent.
    pub fn stop(&self) {
        if !self.inner.stopped.swap(true, Ordering::SeqCst) {
            debug!("Local media {} stopped", self.inner.label);
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }
}

/// Media arriving from one remote participant
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct RemoteStream {
    pub peer: ParticipantId,
    pub label: String,
}

/// Something a link reports about itself
#[derive(Clone, Debug, PartialEq)]
pub enum LinkEvent {
    /// Candidate gathered locally; forward it to the remote
    LocalCandidate(IceCandidate),
    /// The remote's media is flowing
    RemoteStream(RemoteStream),
    /// The link was closed from the other side
    Closed,
    /// The link failed and will not recover
    Failed(String),
}

/// A [`LinkEvent`] with the link it came from
#[derive(Clone, Debug, PartialEq)]
pub struct PeerLinkEvent {
    pub remote: ParticipantId,
    pub link_id: u64,
    pub event: LinkEvent,
}

/// Event sink handed to a link at creation
#[derive(Clone, Debug)]
pub struct LinkEvents {
    local: ParticipantId,
    remote: ParticipantId,
    link_id: u64,
    tx: mpsc::UnboundedSender<PeerLinkEvent>,
}

impl LinkEvents {
    pub fn new(
        local: ParticipantId,
        remote: ParticipantId,
        link_id: u64,
        tx: mpsc::UnboundedSender<PeerLinkEvent>,
    ) -> Self {
        Self {
            local,
            remote,
            link_id,
            tx,
        }
    }

    pub fn local(&self) -> &ParticipantId {
        &self.local
    }

    pub fn remote(&self) -> &ParticipantId {
        &self.remote
    }

    pub fn link_id(&self) -> u64 {
        self.link_id
    }

    /// Report an event. Returns false once the session is gone.
    pub fn emit(&self, event: LinkEvent) -> bool {
        self.tx
            .send(PeerLinkEvent {
                remote: self.remote.clone(),
                link_id: self.link_id,
                event,
            })
            .is_ok()
    }
}

/// One media connection to one remote participant
#[async_trait]
pub trait PeerLink: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, HuddleError>;

    /// Apply a remote offer and produce the answer
    async fn accept_offer(&self, offer: SessionDescription)
        -> Result<SessionDescription, HuddleError>;

    async fn apply_answer(&self, answer: SessionDescription) -> Result<(), HuddleError>;

    async fn add_candidate(&self, candidate: IceCandidate) -> Result<(), HuddleError>;

    /// Tear down. Must not fail and must be safe to call twice.
    async fn close(&self);
}

/// Factory for local capture and peer links
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Acquire camera and microphone. Refusal is [`HuddleError::MediaAccessDenied`].
    async fn capture(&self) -> Result<LocalMedia, HuddleError>;

    /// New link toward `remote` carrying `media`
    async fn connect(
        &self,
        remote: &ParticipantId,
        media: &LocalMedia,
        ice_servers: &[String],
        events: LinkEvents,
    ) -> Result<Arc<dyn PeerLink>, HuddleError>;
}
