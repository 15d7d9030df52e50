//! Offer/answer negotiation with one remote connection.
//!
//! A [`NegotiationSession`] owns the transport for a single remote key and
//! walks it through `Idle -> Offering|Answering -> Connected`. Everything it
//! learns asynchronously (transport callbacks, timers) comes back through the
//! meeting's event loop as a [`LoopEvent`] so that all work on one key stays
//! serialized behind that key's registry lock.

use std::fmt;
use std::mem;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::state::PeerSnapshot;
use crate::config::IceServer;
use crate::media::{LocalTrack, TrackKind, TrackState};
use crate::signaling::{ConnectionKey, SignalingChannel, SignalingEnvelope, SignalingMessage};
use crate::transport::{
    IceCandidate, LinkState, PeerTransport, SessionDescription, TransportContext, TransportError,
    TransportEvent, TransportFactory,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NegotiationState {
    Idle,
    Offering,
    Answering,
    Connected,
    Disconnected,
    Closed,
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            NegotiationState::Idle => "idle",
            NegotiationState::Offering => "offering",
            NegotiationState::Answering => "answering",
            NegotiationState::Connected => "connected",
            NegotiationState::Disconnected => "disconnected",
            NegotiationState::Closed => "closed",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Offerer,
    Answerer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiationFailure {
    Signaling(String),
    MalformedPayload(String),
    Transport(String),
    AnswerTimeout,
}

impl fmt::Display for NegotiationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NegotiationFailure::Signaling(detail) => write!(f, "signaling: {detail}"),
            NegotiationFailure::MalformedPayload(detail) => write!(f, "malformed payload: {detail}"),
            NegotiationFailure::Transport(detail) => write!(f, "transport: {detail}"),
            NegotiationFailure::AnswerTimeout => f.write_str("no answer before the deadline"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("negotiation with {peer} failed: {reason}")]
pub struct NegotiationFailed {
    pub peer: ConnectionKey,
    pub reason: NegotiationFailure,
}

/// Why a session reached `Closed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The local side left the meeting.
    Local,
    /// The remote left, or stayed away past the grace period.
    RemoteDeparted,
    /// A newer connection of the same participant took over.
    Replaced,
    Failed(NegotiationFailure),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionTimer {
    Grace,
    Negotiation,
}

/// Work for the meeting's event loop.
#[derive(Debug)]
pub(crate) enum LoopEvent {
    Signal(SignalingEnvelope),
    Transport {
        peer: ConnectionKey,
        generation: u64,
        event: TransportEvent,
    },
    Timer {
        peer: ConnectionKey,
        epoch: u64,
        timer: SessionTimer,
    },
}

/// Local tracks a new transport should send.
#[derive(Debug, Clone, Default)]
pub(crate) struct OutboundTracks {
    pub audio: Option<LocalTrack>,
    pub video: Option<LocalTrack>,
}

/// Shared by every session of one meeting.
pub(crate) struct NegotiatorContext {
    pub local_key: ConnectionKey,
    pub participant_id: String,
    pub signaling: SignalingChannel,
    pub transports: Arc<dyn TransportFactory>,
    pub ice_servers: Vec<IceServer>,
    pub negotiation_timeout: Duration,
    pub disconnect_grace: Duration,
    pub loop_tx: mpsc::UnboundedSender<LoopEvent>,
}

pub struct NegotiationSession {
    ctx: Arc<NegotiatorContext>,
    remote_key: ConnectionKey,
    participant_id: Option<String>,
    state: NegotiationState,
    role: Option<Role>,
    transport: Option<Arc<dyn PeerTransport>>,
    generation: u64,
    pump: Option<JoinHandle<()>>,
    remote_description_set: bool,
    pending_candidates: Vec<IceCandidate>,
    remote_tracks: TrackState,
    epoch: u64,
    timer: Option<(u64, JoinHandle<()>)>,
    close_reason: Option<CloseReason>,
}

impl NegotiationSession {
    pub(crate) fn new(
        ctx: Arc<NegotiatorContext>,
        remote_key: ConnectionKey,
        participant_id: Option<String>,
    ) -> Self {
        Self {
            ctx,
            remote_key,
            participant_id,
            state: NegotiationState::Idle,
            role: None,
            transport: None,
            generation: 0,
            pump: None,
            remote_description_set: false,
            pending_candidates: Vec::new(),
            remote_tracks: TrackState::default(),
            epoch: 0,
            timer: None,
            close_reason: None,
        }
    }

    pub fn remote_key(&self) -> &ConnectionKey {
        &self.remote_key
    }

    pub fn participant_id(&self) -> Option<&str> {
        self.participant_id.as_deref()
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn role(&self) -> Option<Role> {
        self.role
    }

    pub fn remote_tracks(&self) -> TrackState {
        self.remote_tracks
    }

    pub fn close_reason(&self) -> Option<&CloseReason> {
        self.close_reason.as_ref()
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    pub fn snapshot(&self) -> PeerSnapshot {
        PeerSnapshot {
            key: self.remote_key.clone(),
            participant_id: self.participant_id.clone(),
            state: self.state,
            role: self.role,
            remote_tracks: self.remote_tracks,
        }
    }

    pub(crate) fn learn_participant(&mut self, participant_id: &str) {
        if self.participant_id.is_none() {
            self.participant_id = Some(participant_id.to_owned());
        }
    }

    /// Offer to the remote. Only an idle session offers; later calls are
    /// no-ops so repeated presence for one key never yields a second offer.
    pub(crate) async fn start_offer(
        &mut self,
        tracks: &OutboundTracks,
    ) -> Result<(), NegotiationFailed> {
        if self.state != NegotiationState::Idle {
            tracing::debug!(peer = %self.remote_key, state = %self.state, "offer already underway");
            return Ok(());
        }
        self.role = Some(Role::Offerer);
        self.set_state(NegotiationState::Offering);
        match self.offer(tracks).await {
            Ok(()) => Ok(()),
            Err(reason) => Err(self.fail(reason).await),
        }
    }

    async fn offer(&mut self, tracks: &OutboundTracks) -> Result<(), NegotiationFailure> {
        let transport = self.open_transport(tracks).await?;
        let offer = transport
            .create_offer()
            .await
            .map_err(|err| NegotiationFailure::Transport(err.to_string()))?;
        self.signal(SignalingMessage::Offer {
            to_key: self.remote_key.clone(),
            sdp: offer.sdp,
            participant_id: Some(self.ctx.participant_id.clone()),
        })?;
        self.arm_timer(SessionTimer::Negotiation, self.ctx.negotiation_timeout);
        Ok(())
    }

    /// Apply a remote offer and answer it.
    ///
    /// Concurrent offers resolve by key order: the smaller key keeps its own
    /// offer and drops the incoming one; the larger key abandons its transport
    /// and answers on a fresh one. An offer on an established session is
    /// answered on the existing transport.
    pub(crate) async fn handle_offer(
        &mut self,
        sdp: String,
        tracks: &OutboundTracks,
    ) -> Result<(), NegotiationFailed> {
        let fresh = match self.state {
            NegotiationState::Closed => return Ok(()),
            NegotiationState::Offering if self.ctx.local_key < self.remote_key => {
                tracing::debug!(peer = %self.remote_key, "offer collision: keeping local offer");
                return Ok(());
            }
            NegotiationState::Offering => {
                tracing::debug!(peer = %self.remote_key, "offer collision: yielding to remote offer");
                self.discard_transport().await;
                true
            }
            NegotiationState::Idle => true,
            NegotiationState::Answering
            | NegotiationState::Connected
            | NegotiationState::Disconnected => self.transport.is_none(),
        };
        if fresh {
            self.role = Some(Role::Answerer);
            self.set_state(NegotiationState::Answering);
        }
        match self.answer(sdp, tracks, fresh).await {
            Ok(()) => Ok(()),
            Err(reason) => Err(self.fail(reason).await),
        }
    }

    async fn answer(
        &mut self,
        sdp: String,
        tracks: &OutboundTracks,
        fresh: bool,
    ) -> Result<(), NegotiationFailure> {
        let transport = match (&self.transport, fresh) {
            (Some(transport), false) => Arc::clone(transport),
            _ => self.open_transport(tracks).await?,
        };
        transport
            .set_remote_description(SessionDescription::offer(sdp))
            .await
            .map_err(description_failure)?;
        self.remote_description_set = true;
        self.flush_candidates(&transport).await;
        let answer = transport
            .create_answer()
            .await
            .map_err(|err| NegotiationFailure::Transport(err.to_string()))?;
        self.signal(SignalingMessage::Answer {
            to_key: self.remote_key.clone(),
            sdp: answer.sdp,
        })?;
        if fresh {
            self.arm_timer(SessionTimer::Negotiation, self.ctx.negotiation_timeout);
        }
        Ok(())
    }

    /// Apply the answer to our offer. Anything but the first answer while
    /// offering is ignored.
    pub(crate) async fn handle_answer(&mut self, sdp: String) -> Result<(), NegotiationFailed> {
        if self.state != NegotiationState::Offering || self.remote_description_set {
            tracing::debug!(peer = %self.remote_key, state = %self.state, "ignoring unexpected answer");
            return Ok(());
        }
        let Some(transport) = self.transport.clone() else {
            return Ok(());
        };
        if let Err(err) = transport
            .set_remote_description(SessionDescription::answer(sdp))
            .await
        {
            return Err(self.fail(description_failure(err)).await);
        }
        self.remote_description_set = true;
        self.flush_candidates(&transport).await;
        Ok(())
    }

    /// Apply a remote candidate, or hold it until a remote description is in
    /// place.
    pub(crate) async fn handle_candidate(&mut self, candidate: IceCandidate) {
        if self.state == NegotiationState::Closed {
            return;
        }
        match (&self.transport, self.remote_description_set) {
            (Some(transport), true) => {
                if let Err(err) = transport.add_ice_candidate(candidate).await {
                    tracing::warn!(peer = %self.remote_key, error = %err, "remote candidate rejected");
                }
            }
            _ => {
                tracing::trace!(peer = %self.remote_key, "buffering remote candidate");
                self.pending_candidates.push(candidate);
            }
        }
    }

    pub(crate) async fn handle_transport_event(
        &mut self,
        generation: u64,
        event: TransportEvent,
    ) -> Result<(), NegotiationFailed> {
        if generation != self.generation || self.state == NegotiationState::Closed {
            tracing::trace!(peer = %self.remote_key, generation, "stale transport event");
            return Ok(());
        }
        match event {
            TransportEvent::LocalCandidate(candidate) => {
                let sent = self.signal(SignalingMessage::Candidate {
                    to_key: self.remote_key.clone(),
                    candidate,
                });
                if let Err(reason) = sent {
                    return Err(self.fail(reason).await);
                }
            }
            TransportEvent::Link(LinkState::Connected) => match self.state {
                NegotiationState::Offering
                | NegotiationState::Answering
                | NegotiationState::Disconnected => {
                    self.cancel_timer();
                    self.set_state(NegotiationState::Connected);
                }
                _ => {}
            },
            TransportEvent::Link(LinkState::Failed) if self.is_negotiating() => {
                return Err(self
                    .fail(NegotiationFailure::Transport("link failed".into()))
                    .await);
            }
            TransportEvent::Link(LinkState::Disconnected | LinkState::Failed | LinkState::Closed) => {
                self.enter_grace();
            }
            TransportEvent::RemoteTrack(kind) => self.set_remote_track(kind, true),
            TransportEvent::RemoteTrackEnded(kind) => self.set_remote_track(kind, false),
        }
        Ok(())
    }

    /// The remote announced it is leaving. An established session waits out
    /// the grace period in case the remote comes back; anything still
    /// negotiating is closed straight away.
    pub(crate) async fn handle_remote_left(&mut self) {
        match self.state {
            NegotiationState::Connected => self.enter_grace(),
            NegotiationState::Disconnected | NegotiationState::Closed => {}
            NegotiationState::Idle | NegotiationState::Offering | NegotiationState::Answering => {
                self.close(CloseReason::RemoteDeparted).await;
            }
        }
    }

    pub(crate) async fn handle_timer(
        &mut self,
        epoch: u64,
        timer: SessionTimer,
    ) -> Result<(), NegotiationFailed> {
        if self.timer.as_ref().map(|(armed, _)| *armed) != Some(epoch) {
            return Ok(());
        }
        self.timer = None;
        match timer {
            SessionTimer::Grace if self.state == NegotiationState::Disconnected => {
                tracing::debug!(peer = %self.remote_key, "grace period elapsed");
                self.close(CloseReason::RemoteDeparted).await;
            }
            SessionTimer::Negotiation if self.is_negotiating() => {
                return Err(self.fail(NegotiationFailure::AnswerTimeout).await);
            }
            _ => {}
        }
        Ok(())
    }

    pub(crate) fn handle_media_state(&mut self, tracks: TrackState) {
        if self.state != NegotiationState::Closed {
            self.remote_tracks = tracks;
        }
    }

    pub(crate) async fn replace_video_track(&self, track: &LocalTrack) -> Result<(), TransportError> {
        match &self.transport {
            Some(transport) => transport.replace_video_track(track).await,
            None => Ok(()),
        }
    }

    /// Tear down the transport and timers. Closing twice is a no-op.
    pub(crate) async fn close(&mut self, reason: CloseReason) {
        if self.state == NegotiationState::Closed {
            return;
        }
        self.cancel_timer();
        self.discard_transport().await;
        self.remote_tracks = TrackState::default();
        tracing::debug!(peer = %self.remote_key, ?reason, "negotiation session closed");
        self.close_reason = Some(reason);
        self.set_state(NegotiationState::Closed);
    }

    async fn fail(&mut self, reason: NegotiationFailure) -> NegotiationFailed {
        tracing::warn!(peer = %self.remote_key, state = %self.state, %reason, "negotiation failed");
        self.close(CloseReason::Failed(reason.clone())).await;
        NegotiationFailed {
            peer: self.remote_key.clone(),
            reason,
        }
    }

    fn is_negotiating(&self) -> bool {
        matches!(
            self.state,
            NegotiationState::Offering | NegotiationState::Answering
        )
    }

    fn enter_grace(&mut self) {
        if self.state == NegotiationState::Connected {
            self.set_state(NegotiationState::Disconnected);
            self.arm_timer(SessionTimer::Grace, self.ctx.disconnect_grace);
        }
    }

    fn set_state(&mut self, next: NegotiationState) {
        if self.state != next {
            tracing::debug!(peer = %self.remote_key, from = %self.state, to = %next, "negotiation state");
            self.state = next;
        }
    }

    fn set_remote_track(&mut self, kind: TrackKind, live: bool) {
        match kind {
            TrackKind::Audio => self.remote_tracks.audio_enabled = live,
            TrackKind::Video => self.remote_tracks.video_enabled = live,
            TrackKind::Screen => self.remote_tracks.screen_sharing = live,
        }
    }

    fn signal(&self, message: SignalingMessage) -> Result<(), NegotiationFailure> {
        self.ctx
            .signaling
            .send(message)
            .map_err(|err| NegotiationFailure::Signaling(err.to_string()))
    }

    async fn open_transport(
        &mut self,
        tracks: &OutboundTracks,
    ) -> Result<Arc<dyn PeerTransport>, NegotiationFailure> {
        self.generation += 1;
        let generation = self.generation;
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();

        let peer = self.remote_key.clone();
        let loop_tx = self.ctx.loop_tx.clone();
        let pump = tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                let forwarded = LoopEvent::Transport {
                    peer: peer.clone(),
                    generation,
                    event,
                };
                if loop_tx.send(forwarded).is_err() {
                    break;
                }
            }
        });
        if let Some(previous) = self.pump.replace(pump) {
            previous.abort();
        }

        let transport = self
            .ctx
            .transports
            .create(TransportContext {
                local_key: self.ctx.local_key.clone(),
                remote_key: self.remote_key.clone(),
                ice_servers: self.ctx.ice_servers.clone(),
                audio: tracks.audio.clone(),
                video: tracks.video.clone(),
                events: events_tx,
            })
            .await
            .map_err(|err| NegotiationFailure::Transport(err.to_string()))?;
        self.transport = Some(Arc::clone(&transport));
        self.remote_description_set = false;
        Ok(transport)
    }

    async fn discard_transport(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        self.remote_description_set = false;
        self.pending_candidates.clear();
        if let Some(transport) = self.transport.take() {
            if let Err(err) = transport.close().await {
                tracing::debug!(peer = %self.remote_key, error = %err, "transport close failed");
            }
        }
    }

    async fn flush_candidates(&mut self, transport: &Arc<dyn PeerTransport>) {
        for candidate in mem::take(&mut self.pending_candidates) {
            if let Err(err) = transport.add_ice_candidate(candidate).await {
                tracing::warn!(peer = %self.remote_key, error = %err, "buffered candidate rejected");
            }
        }
    }

    fn arm_timer(&mut self, timer: SessionTimer, after: Duration) {
        self.cancel_timer();
        self.epoch += 1;
        let epoch = self.epoch;
        let peer = self.remote_key.clone();
        let loop_tx = self.ctx.loop_tx.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = loop_tx.send(LoopEvent::Timer { peer, epoch, timer });
        });
        self.timer = Some((epoch, handle));
    }

    fn cancel_timer(&mut self) {
        if let Some((_, handle)) = self.timer.take() {
            handle.abort();
        }
    }
}

impl Drop for NegotiationSession {
    fn drop(&mut self) {
        self.cancel_timer();
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

fn description_failure(err: TransportError) -> NegotiationFailure {
    match err {
        TransportError::Rejected(detail) => NegotiationFailure::MalformedPayload(detail),
        other => NegotiationFailure::Transport(other.to_string()),
    }
}
