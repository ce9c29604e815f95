//! Per-remote connection record
//!
//! One record per remote participant, owned by the orchestrator:
//!
//! ```text
//! Idle ──offer──▶ Negotiating(Offerer) ──answer──┐
//!   │                                            ├──stream──▶ Connected
//!   └──inbound offer──▶ Negotiating(Answerer) ───┘
//!
//! any ──closed / failed / timeout / left──▶ Closed
//! ```
//!
//! Candidates that arrive before the remote description is applied are held
//! and flushed once it is.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, warn};

use huddle_core::{HuddleError, IceCandidate, ParticipantId, SessionDescription, SignalPayload};

use crate::media::{LinkEvent, PeerLink, RemoteStream};

/// Candidates held per peer before a remote description exists
pub const MAX_PENDING_CANDIDATES: usize = 32;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Offerer,
    Answerer,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "role")]
pub enum PeerState {
    Idle,
    Negotiating(Role),
    Connected,
    Closed,
}

/// Input to [`ConnectionRecord::intake`]
#[derive(Clone, Debug, PartialEq)]
pub enum RecordEvent {
    /// Offer relayed from the remote
    Offer(SessionDescription),
    /// Answer relayed from the remote
    Answer(SessionDescription),
    /// Candidate relayed from the remote
    Candidate(IceCandidate),
    /// Something the link reported
    Link(LinkEvent),
}

impl From<SignalPayload> for RecordEvent {
    fn from(payload: SignalPayload) -> Self {
        match payload {
            SignalPayload::Offer(offer) => RecordEvent::Offer(offer),
            SignalPayload::Answer(answer) => RecordEvent::Answer(answer),
            SignalPayload::Candidate(candidate) => RecordEvent::Candidate(candidate),
        }
    }
}

/// What the orchestrator must do after an intake
#[derive(Clone, Debug, PartialEq)]
pub enum Effect {
    Nothing,
    /// Relay this to the remote
    Send(SignalPayload),
    /// Remote media is now available
    StreamReady(RemoteStream),
    /// The record closed itself; drop it and retract the stream if any
    Closed(Option<RemoteStream>),
}

/// Push onto a bounded candidate buffer, dropping the oldest
pub fn buffer_candidate(queue: &mut VecDeque<IceCandidate>, candidate: IceCandidate) {
    while queue.len() >= MAX_PENDING_CANDIDATES {
        queue.pop_front();
    }
    queue.push_back(candidate);
}

pub struct ConnectionRecord {
    remote: ParticipantId,
    link_id: u64,
    link: Arc<dyn PeerLink>,
    state: PeerState,
    remote_description_set: bool,
    pending: VecDeque<IceCandidate>,
    stream: Option<RemoteStream>,
    started_at: Instant,
}

impl ConnectionRecord {
    pub fn new(remote: ParticipantId, link_id: u64, link: Arc<dyn PeerLink>, now: Instant) -> Self {
        Self {
            remote,
            link_id,
            link,
            state: PeerState::Idle,
            remote_description_set: false,
            pending: VecDeque::new(),
            stream: None,
            started_at: now,
        }
    }

    pub fn remote(&self) -> &ParticipantId {
        &self.remote
    }

    pub fn link_id(&self) -> u64 {
        self.link_id
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    pub fn stream(&self) -> Option<&RemoteStream> {
        self.stream.as_ref()
    }

    pub fn is_closed(&self) -> bool {
        self.state == PeerState::Closed
    }

    /// Offered and still waiting for the answer
    pub fn awaiting_answer(&self) -> bool {
        self.state == PeerState::Negotiating(Role::Offerer) && !self.remote_description_set
    }

    /// Negotiating for longer than `timeout`
    pub fn is_expired(&self, now: Instant, timeout: Duration) -> bool {
        matches!(self.state, PeerState::Negotiating(_))
            && now.saturating_duration_since(self.started_at) > timeout
    }

    /// Hand over candidates that arrived before this record existed
    pub fn adopt_candidates(&mut self, early: impl IntoIterator<Item = IceCandidate>) {
        for candidate in early {
            buffer_candidate(&mut self.pending, candidate);
        }
    }

    /// Idle → Negotiating(Offerer); returns the offer to relay
    pub async fn start_offer(&mut self) -> Result<SignalPayload, HuddleError> {
        if self.state != PeerState::Idle {
            return Err(HuddleError::Protocol(format!(
                "cannot offer to {} from {:?}",
                self.remote, self.state
            )));
        }
        self.state = PeerState::Negotiating(Role::Offerer);
        let offer = self.link.create_offer().await?;
        debug!("Offer created for {}", self.remote);
        Ok(SignalPayload::Offer(offer))
    }

    /// Feed one event through the state machine
    pub async fn intake(&mut self, event: RecordEvent) -> Effect {
        if self.is_closed() {
            return Effect::Nothing;
        }

        match event {
            RecordEvent::Offer(offer) => self.on_offer(offer).await,
            RecordEvent::Answer(answer) => self.on_answer(answer).await,
            RecordEvent::Candidate(candidate) => {
                if self.remote_description_set {
                    self.apply_candidate(candidate).await;
                } else {
                    buffer_candidate(&mut self.pending, candidate);
                }
                Effect::Nothing
            }
            RecordEvent::Link(LinkEvent::LocalCandidate(candidate)) => {
                Effect::Send(SignalPayload::Candidate(candidate))
            }
            RecordEvent::Link(LinkEvent::RemoteStream(stream)) => {
                if self.stream.is_some() {
                    return Effect::Nothing;
                }
                self.state = PeerState::Connected;
                self.stream = Some(stream.clone());
                Effect::StreamReady(stream)
            }
            RecordEvent::Link(LinkEvent::Closed) => {
                debug!("Link to {} closed by remote", self.remote);
                Effect::Closed(self.close().await)
            }
            RecordEvent::Link(LinkEvent::Failed(reason)) => {
                warn!("Link to {} failed: {}", self.remote, reason);
                Effect::Closed(self.close().await)
            }
        }
    }

    /// Close the link and retract the stream. Idempotent.
    pub async fn close(&mut self) -> Option<RemoteStream> {
        if self.is_closed() {
            return None;
        }
        self.state = PeerState::Closed;
        self.pending.clear();
        self.link.close().await;
        self.stream.take()
    }

    async fn on_offer(&mut self, offer: SessionDescription) -> Effect {
        if self.state != PeerState::Idle {
            debug!("Ignoring offer from {} in {:?}", self.remote, self.state);
            return Effect::Nothing;
        }
        self.state = PeerState::Negotiating(Role::Answerer);

        match self.link.accept_offer(offer).await {
            Ok(answer) => {
                self.remote_description_set = true;
                self.flush_pending().await;
                Effect::Send(SignalPayload::Answer(answer))
            }
            Err(e) => {
                warn!("Failed to accept offer from {}: {}", self.remote, e);
                Effect::Closed(self.close().await)
            }
        }
    }

    async fn on_answer(&mut self, answer: SessionDescription) -> Effect {
        if !self.awaiting_answer() {
            debug!("Stale answer from {} in {:?}", self.remote, self.state);
            return Effect::Nothing;
        }

        match self.link.apply_answer(answer).await {
            Ok(()) => {
                self.remote_description_set = true;
                self.flush_pending().await;
                Effect::Nothing
            }
            Err(e) => {
                warn!("Failed to apply answer from {}: {}", self.remote, e);
                Effect::Closed(self.close().await)
            }
        }
    }

    async fn flush_pending(&mut self) {
        let pending: Vec<_> = self.pending.drain(..).collect();
        if !pending.is_empty() {
            debug!("Flushing {} buffered candidates for {}", pending.len(), self.remote);
        }
        for candidate in pending {
            self.apply_candidate(candidate).await;
        }
    }

    async fn apply_candidate(&self, candidate: IceCandidate) {
        if let Err(e) = self.link.add_candidate(candidate).await {
            warn!("Failed to add candidate from {}: {}", self.remote, e);
        }
    }
}
