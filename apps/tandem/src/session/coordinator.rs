use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::negotiator::{
    CloseReason, LoopEvent, NegotiationFailed, NegotiationSession, NegotiationState,
    NegotiatorContext, OutboundTracks, SessionTimer,
};
use super::registry::PeerRegistry;
use super::state::{self, PeerEvent, PeerSnapshot, SessionFault, SessionState, StateHub};
use super::{ConnectionPhase, JoinError, SessionError};
use crate::chat::ChatChannel;
use crate::config::SessionConfig;
use crate::listeners::Subscription;
use crate::media::{
    MediaConstraints, MediaDevices, MediaSource, TrackKind, TrackState, TrackTransition,
};
use crate::signaling::{
    ConnectionKey, SignalingChannel, SignalingEnvelope, SignalingError, SignalingMessage,
    SignalingRelay,
};
use crate::transport::{IceCandidate, TransportFactory};

/// The pluggable edges of a coordinator.
#[derive(Clone)]
pub struct CoordinatorDeps {
    pub relay: Arc<dyn SignalingRelay>,
    pub devices: Arc<dyn MediaDevices>,
    pub transports: Arc<dyn TransportFactory>,
}

/// Joins one meeting at a time and keeps a single peer connection to the
/// other participant alive.
///
/// State is published through [`SessionCoordinator::watch_state`] and
/// [`SessionCoordinator::on_state_change`]. All signaling and transport input
/// is handled on one event loop per joined meeting.
pub struct SessionCoordinator {
    deps: CoordinatorDeps,
    config: SessionConfig,
    fixed_key: Option<ConnectionKey>,
    hub: Arc<StateHub>,
    pending: Mutex<Option<CancellationToken>>,
    active: AsyncMutex<Option<ActiveMeeting>>,
}

struct ActiveMeeting {
    meeting: Arc<Meeting>,
    cancel: CancellationToken,
    event_loop: JoinHandle<()>,
    subscription: Subscription,
    chat: ChatChannel,
}

/// Everything owned by one joined meeting.
struct Meeting {
    participant_id: String,
    local_key: ConnectionKey,
    signaling: SignalingChannel,
    media: AsyncMutex<MediaSource>,
    outbound: Mutex<OutboundTracks>,
    registry: PeerRegistry<NegotiationSession>,
    peers: RwLock<BTreeMap<ConnectionKey, PeerSnapshot>>,
    negotiator: Arc<NegotiatorContext>,
    hub: Arc<StateHub>,
}

impl SessionCoordinator {
    pub fn new(deps: CoordinatorDeps, config: SessionConfig) -> Self {
        Self {
            deps,
            config,
            fixed_key: None,
            hub: Arc::new(StateHub::new()),
            pending: Mutex::new(None),
            active: AsyncMutex::new(None),
        }
    }

    /// Use `key` for every join instead of a fresh random one.
    pub fn with_connection_key(mut self, key: impl Into<ConnectionKey>) -> Self {
        self.fixed_key = Some(key.into());
        self
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        self.hub.current()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.hub.watch()
    }

    pub fn on_state_change<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&SessionState) + Send + Sync + 'static,
    {
        self.hub.on_state_change(callback)
    }

    pub fn on_peer_event<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&PeerEvent) + Send + Sync + 'static,
    {
        self.hub.on_peer_event(callback)
    }

    /// Join `meeting_id` as `participant_id`.
    ///
    /// Acquires local media, connects signaling and announces presence. On any
    /// failure everything acquired so far is released before the error is
    /// returned. A concurrent [`SessionCoordinator::leave`] cancels the join.
    pub async fn join(
        &self,
        meeting_id: &str,
        participant_id: &str,
        constraints: MediaConstraints,
    ) -> Result<(), JoinError> {
        let token = {
            let mut pending = self.pending.lock();
            if pending.is_some() {
                return Err(JoinError::AlreadyJoined);
            }
            let token = CancellationToken::new();
            *pending = Some(token.clone());
            token
        };
        if self.active.lock().await.is_some() {
            self.pending.lock().take();
            return Err(JoinError::AlreadyJoined);
        }

        tracing::info!(meeting = meeting_id, participant = participant_id, "joining meeting");
        self.hub.update(|state| {
            *state = SessionState {
                connection_phase: ConnectionPhase::Connecting,
                ..SessionState::default()
            };
        });

        let established = self
            .establish(&token, meeting_id, participant_id, constraints)
            .await;

        let mut active = self.active.lock().await;
        let cancelled = {
            let mut pending = self.pending.lock();
            pending.take();
            token.is_cancelled()
        };
        match established {
            Ok(meeting) if cancelled => {
                drop(active);
                teardown(meeting).await;
                Err(JoinError::Cancelled)
            }
            Ok(meeting) => {
                tracing::info!(
                    meeting = meeting_id,
                    key = %meeting.meeting.local_key,
                    "joined meeting"
                );
                *active = Some(meeting);
                Ok(())
            }
            Err(err) => {
                if !cancelled {
                    tracing::warn!(meeting = meeting_id, error = %err, "join failed");
                    let fault = SessionFault::Join(err.to_string());
                    self.hub.update(|state| {
                        state.connection_phase = ConnectionPhase::Idle;
                        state.last_error = Some(fault);
                    });
                }
                Err(err)
            }
        }
    }

    async fn establish(
        &self,
        token: &CancellationToken,
        meeting_id: &str,
        participant_id: &str,
        constraints: MediaConstraints,
    ) -> Result<ActiveMeeting, JoinError> {
        let mut media = MediaSource::new(Arc::clone(&self.deps.devices));
        let acquired = tokio::select! {
            biased;
            _ = token.cancelled() => None,
            result = media.acquire(constraints) => Some(result),
        };
        match acquired {
            None => {
                media.release();
                return Err(JoinError::Cancelled);
            }
            Some(Err(err)) => {
                media.release();
                return Err(JoinError::Media(err));
            }
            Some(Ok(_)) => {}
        }
        let local_tracks = media.track_state();
        let outbound = outbound_tracks(&media);

        let local_key = self
            .fixed_key
            .clone()
            .unwrap_or_else(ConnectionKey::generate);
        let connected = tokio::select! {
            biased;
            _ = token.cancelled() => None,
            result = SignalingChannel::connect(
                self.deps.relay.as_ref(),
                meeting_id,
                local_key.clone(),
                self.config.join_timeout,
            ) => Some(result),
        };
        let signaling = match connected {
            Some(Ok(signaling)) => signaling,
            failed => {
                media.release();
                return Err(match failed {
                    Some(Err(SignalingError::Timeout(after))) => JoinError::Timeout(after),
                    Some(Err(err)) => JoinError::Signaling(err),
                    _ => JoinError::Cancelled,
                });
            }
        };

        let (loop_tx, loop_rx) = mpsc::unbounded_channel();
        let meeting = Arc::new(Meeting {
            participant_id: participant_id.to_owned(),
            local_key: local_key.clone(),
            signaling: signaling.clone(),
            outbound: Mutex::new(outbound),
            media: AsyncMutex::new(media),
            registry: PeerRegistry::new(),
            peers: RwLock::new(BTreeMap::new()),
            negotiator: Arc::new(NegotiatorContext {
                local_key,
                participant_id: participant_id.to_owned(),
                signaling: signaling.clone(),
                transports: Arc::clone(&self.deps.transports),
                ice_servers: self.config.ice_servers.clone(),
                negotiation_timeout: self.config.negotiation_timeout,
                disconnect_grace: self.config.disconnect_grace,
                loop_tx: loop_tx.clone(),
            }),
            hub: Arc::clone(&self.hub),
        });

        let subscription = signaling.subscribe(move |envelope| {
            let _ = loop_tx.send(LoopEvent::Signal(envelope.clone()));
        });
        if let Err(err) = signaling.announce_join(participant_id) {
            drop(subscription);
            signaling.disconnect();
            meeting.media.lock().await.release();
            return Err(JoinError::Signaling(err));
        }

        self.hub
            .update(|state| state.local_track_state = local_tracks);
        let cancel = token.child_token();
        let event_loop = tokio::spawn(run_event_loop(
            Arc::clone(&meeting),
            loop_rx,
            cancel.clone(),
        ));
        Ok(ActiveMeeting {
            chat: ChatChannel::new(signaling, participant_id),
            meeting,
            cancel,
            event_loop,
            subscription,
        })
    }

    /// Leave the current meeting, or cancel a join still in flight.
    ///
    /// Closes every peer session, stops all local tracks, tells the other side
    /// and drops the signaling link. Calling it when not joined is a no-op.
    pub async fn leave(&self) {
        let cancelled_join = match self.pending.lock().as_ref() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        };
        let active = self.active.lock().await.take();
        if active.is_none() && !cancelled_join {
            return;
        }
        if let Some(active) = active {
            tracing::info!(key = %active.meeting.local_key, "leaving meeting");
            teardown(active).await;
        }
        self.hub.update(|state| {
            state.connection_phase = ConnectionPhase::Left;
            state.local_track_state = TrackState::default();
            state.remote_track_state = None;
        });
    }

    /// Flip the microphone. Returns whether audio is now enabled.
    pub async fn toggle_audio(&self) -> Result<bool, SessionError> {
        self.toggle_track(TrackKind::Audio).await
    }

    /// Flip the camera. Returns whether video is now enabled. Refused while
    /// the screen is being shared, since the screen track is what goes out.
    pub async fn toggle_video(&self) -> Result<bool, SessionError> {
        self.toggle_track(TrackKind::Video).await
    }

    async fn toggle_track(&self, kind: TrackKind) -> Result<bool, SessionError> {
        let active = self.active.lock().await;
        let meeting = &active.as_ref().ok_or(SessionError::NotJoined)?.meeting;
        let (enabled, tracks) = {
            let mut media = meeting.media.lock().await;
            if kind == TrackKind::Video && media.screen_track().is_some() {
                return Err(SessionError::ScreenShareActive);
            }
            let current = media.track_state();
            let enabled = match kind {
                TrackKind::Audio => !current.audio_enabled,
                _ => !current.video_enabled,
            };
            media.set_track_enabled(kind, enabled)?;
            (enabled, media.track_state())
        };
        meeting.publish_local_tracks(tracks)?;
        Ok(enabled)
    }

    /// Swap the outbound video between camera and screen. Returns whether the
    /// screen is now being shared. The swap replaces the track on every live
    /// transport without renegotiating.
    pub async fn toggle_screen_share(&self) -> Result<bool, SessionError> {
        let active = self.active.lock().await;
        let meeting = &active.as_ref().ok_or(SessionError::NotJoined)?.meeting;
        let (sharing, outbound, tracks) = {
            let mut media = meeting.media.lock().await;
            let sharing = if media.screen_track().is_some() {
                media.stop_screen_share();
                false
            } else {
                media.start_screen_share().await?;
                true
            };
            (sharing, outbound_tracks(&media), media.track_state())
        };

        if let Some(video) = &outbound.video {
            for (key, entry) in meeting.registry.entries() {
                if let Err(err) = entry.lock().await.replace_video_track(video).await {
                    tracing::warn!(peer = %key, error = %err, "outbound video swap failed");
                }
            }
        }
        *meeting.outbound.lock() = outbound;
        meeting.publish_local_tracks(tracks)?;
        Ok(sharing)
    }

    pub async fn is_joined(&self) -> bool {
        self.active.lock().await.is_some()
    }

    pub async fn local_key(&self) -> Option<ConnectionKey> {
        let active = self.active.lock().await;
        active.as_ref().map(|a| a.meeting.local_key.clone())
    }

    /// Chat over the current meeting's signaling link.
    pub async fn chat(&self) -> Option<ChatChannel> {
        let active = self.active.lock().await;
        active.as_ref().map(|a| a.chat.clone())
    }

    pub async fn signaling(&self) -> Option<SignalingChannel> {
        let active = self.active.lock().await;
        active.as_ref().map(|a| a.meeting.signaling.clone())
    }

    pub async fn peers(&self) -> Vec<PeerSnapshot> {
        let active = self.active.lock().await;
        active
            .as_ref()
            .map(|a| a.meeting.peers.read().values().cloned().collect())
            .unwrap_or_default()
    }

    /// Negotiation sessions currently held.
    pub async fn active_sessions(&self) -> usize {
        let active = self.active.lock().await;
        active.as_ref().map_or(0, |a| a.meeting.registry.len())
    }

    /// Local tracks that have not been stopped.
    pub async fn live_tracks(&self) -> usize {
        let active = self.active.lock().await;
        match active.as_ref() {
            Some(a) => a.meeting.media.lock().await.live_track_count(),
            None => 0,
        }
    }

    pub async fn track_transitions(&self) -> Vec<TrackTransition> {
        let active = self.active.lock().await;
        match active.as_ref() {
            Some(a) => a.meeting.media.lock().await.transitions().to_vec(),
            None => Vec::new(),
        }
    }
}

impl Drop for SessionCoordinator {
    fn drop(&mut self) {
        if let Some(token) = self.pending.get_mut().take() {
            token.cancel();
        }
        if let Some(active) = self.active.get_mut().take() {
            active.cancel.cancel();
            active.event_loop.abort();
            active.meeting.signaling.disconnect();
            if let Ok(mut media) = active.meeting.media.try_lock() {
                media.release();
            }
        }
    }
}

fn outbound_tracks(media: &MediaSource) -> OutboundTracks {
    OutboundTracks {
        audio: media.stream().and_then(|stream| stream.audio.clone()),
        video: media.outbound_video(),
    }
}

async fn teardown(active: ActiveMeeting) {
    let ActiveMeeting {
        meeting,
        cancel,
        event_loop,
        subscription,
        chat: _,
    } = active;
    cancel.cancel();
    if let Err(err) = event_loop.await {
        if err.is_panic() {
            tracing::error!(error = %err, "meeting event loop panicked");
        }
    }

    for (_, entry) in meeting.registry.drain() {
        entry.lock().await.close(CloseReason::Local).await;
    }
    meeting.peers.write().clear();
    meeting.media.lock().await.release();
    if let Err(err) = meeting.signaling.announce_leave(&meeting.participant_id) {
        tracing::debug!(error = %err, "leave announcement not sent");
    }
    meeting.signaling.disconnect();
    drop(subscription);
}

async fn run_event_loop(
    meeting: Arc<Meeting>,
    mut events: mpsc::UnboundedReceiver<LoopEvent>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = meeting.handle(event) => {}
        }
    }
    tracing::debug!(key = %meeting.local_key, "meeting event loop stopped");
}

impl Meeting {
    async fn handle(&self, event: LoopEvent) {
        match event {
            LoopEvent::Signal(envelope) => self.handle_signal(envelope).await,
            LoopEvent::Transport {
                peer,
                generation,
                event,
            } => {
                let Some(entry) = self.registry.get(&peer) else {
                    return;
                };
                let mut session = entry.lock().await;
                let before = session.state();
                let result = session.handle_transport_event(generation, event).await;
                self.settle(&mut session, before, result);
            }
            LoopEvent::Timer { peer, epoch, timer } => self.on_timer(peer, epoch, timer).await,
        }
    }

    async fn handle_signal(&self, envelope: SignalingEnvelope) {
        let SignalingEnvelope { from, message, .. } = envelope;
        if let Some(to) = message.recipient() {
            if *to != self.local_key {
                tracing::trace!(%from, %to, kind = message.label(), "message for another connection");
                return;
            }
        }
        match message {
            SignalingMessage::Join {
                connection_key,
                participant_id,
            } => self.on_presence(connection_key, participant_id).await,
            SignalingMessage::Leave { connection_key, .. } => {
                self.on_departure(connection_key).await
            }
            SignalingMessage::Offer {
                sdp,
                participant_id,
                ..
            } => self.on_offer(from, sdp, participant_id).await,
            SignalingMessage::Answer { sdp, .. } => self.on_answer(from, sdp).await,
            SignalingMessage::Candidate { candidate, .. } => {
                self.on_candidate(from, candidate).await
            }
            SignalingMessage::Media { track_state } => self.on_remote_media(from, track_state).await,
            SignalingMessage::Chat { .. } => {}
        }
    }

    async fn on_presence(&self, key: ConnectionKey, participant_id: String) {
        if key == self.local_key {
            return;
        }
        if !self.admit(&key, Some(&participant_id)).await {
            return;
        }
        let (entry, created) = self.registry.get_or_create(&key, || {
            NegotiationSession::new(
                Arc::clone(&self.negotiator),
                key.clone(),
                Some(participant_id.clone()),
            )
        });
        let mut session = entry.lock().await;
        if !created {
            tracing::debug!(peer = %key, "repeated presence ignored");
            session.learn_participant(&participant_id);
            let before = session.state();
            self.settle(&mut session, before, Ok(()));
            return;
        }
        tracing::debug!(peer = %key, participant = %participant_id, "remote joined");
        let tracks = self.outbound.lock().clone();
        let before = session.state();
        let result = session.start_offer(&tracks).await;
        self.settle(&mut session, before, result);
    }

    async fn on_departure(&self, key: ConnectionKey) {
        let Some(entry) = self.registry.get(&key) else {
            return;
        };
        tracing::debug!(peer = %key, "remote announced leave");
        let mut session = entry.lock().await;
        let before = session.state();
        session.handle_remote_left().await;
        self.settle(&mut session, before, Ok(()));
    }

    async fn on_offer(&self, from: ConnectionKey, sdp: String, participant_id: Option<String>) {
        if !self.registry.contains(&from) && !self.admit(&from, participant_id.as_deref()).await {
            return;
        }
        let (entry, _) = self.registry.get_or_create(&from, || {
            NegotiationSession::new(Arc::clone(&self.negotiator), from.clone(), None)
        });
        let mut session = entry.lock().await;
        if let Some(participant_id) = &participant_id {
            session.learn_participant(participant_id);
        }
        let tracks = self.outbound.lock().clone();
        let before = session.state();
        let result = session.handle_offer(sdp, &tracks).await;
        self.settle(&mut session, before, result);
    }

    async fn on_answer(&self, from: ConnectionKey, sdp: String) {
        let Some(entry) = self.registry.get(&from) else {
            tracing::debug!(peer = %from, "answer without a session");
            return;
        };
        let mut session = entry.lock().await;
        let before = session.state();
        let result = session.handle_answer(sdp).await;
        self.settle(&mut session, before, result);
    }

    async fn on_candidate(&self, from: ConnectionKey, candidate: IceCandidate) {
        let Some(entry) = self.registry.get(&from) else {
            tracing::debug!(peer = %from, "candidate without a session");
            return;
        };
        entry.lock().await.handle_candidate(candidate).await;
    }

    async fn on_remote_media(&self, from: ConnectionKey, tracks: TrackState) {
        let Some(entry) = self.registry.get(&from) else {
            return;
        };
        let mut session = entry.lock().await;
        let before = session.state();
        session.handle_media_state(tracks);
        self.settle(&mut session, before, Ok(()));
    }

    async fn on_timer(&self, peer: ConnectionKey, epoch: u64, timer: SessionTimer) {
        let Some(entry) = self.registry.get(&peer) else {
            return;
        };
        let mut session = entry.lock().await;
        let before = session.state();
        let result = session.handle_timer(epoch, timer).await;
        self.settle(&mut session, before, result);
    }

    /// Decide whether a connection `key` may pair with us.
    ///
    /// Only one remote connection is allowed at a time. A newcomer replaces
    /// the existing one when it belongs to the same participant or when the
    /// existing link is down. Anything else is recorded as a protocol
    /// violation and ignored.
    async fn admit(&self, key: &ConnectionKey, participant_id: Option<&str>) -> bool {
        let others: Vec<PeerSnapshot> = self
            .peers
            .read()
            .values()
            .filter(|peer| peer.key != *key)
            .cloned()
            .collect();
        for other in others {
            let replaceable = other.state == NegotiationState::Disconnected
                || participant_id.is_some_and(|incoming| {
                    other.participant_id.as_deref() == Some(incoming)
                });
            if !replaceable {
                tracing::warn!(peer = %key, paired = %other.key, "rejecting third connection");
                let fault = SessionFault::ProtocolViolation(format!(
                    "connection {key} rejected while paired with {}",
                    other.key
                ));
                self.hub.update(|state| state.last_error = Some(fault));
                return false;
            }
            if let Some(entry) = self.registry.get(&other.key) {
                tracing::debug!(stale = %other.key, replacement = %key, "replacing stale connection");
                let mut session = entry.lock().await;
                let before = session.state();
                session.close(CloseReason::Replaced).await;
                self.settle(&mut session, before, Ok(()));
            }
        }
        true
    }

    /// Fold the outcome of one session operation into meeting state.
    fn settle(
        &self,
        session: &mut NegotiationSession,
        before: NegotiationState,
        result: Result<(), NegotiationFailed>,
    ) {
        let peer = session.remote_key().clone();
        let after = session.state();
        if before != after {
            self.hub.peer_event(PeerEvent::StateChanged {
                peer: peer.clone(),
                from: before,
                to: after,
            });
        }
        if let Err(failed) = result {
            self.hub.peer_event(PeerEvent::Failed {
                peer: peer.clone(),
                reason: failed.reason.clone(),
            });
            let fault = SessionFault::Negotiation {
                peer: failed.peer,
                reason: failed.reason,
            };
            self.hub.update(|state| state.last_error = Some(fault));
        }

        if after == NegotiationState::Closed {
            self.registry.remove(&peer);
            self.peers.write().remove(&peer);
            if session.close_reason() == Some(&CloseReason::RemoteDeparted) {
                tracing::info!(peer = %peer, "remote participant left");
                self.hub.peer_event(PeerEvent::Departed { peer });
            }
        } else {
            self.peers.write().insert(peer, session.snapshot());
            if after == NegotiationState::Connected && before != NegotiationState::Connected {
                tracing::info!(peer = %session.remote_key(), "peer connected");
                // A failure lands in last_error; the call itself is up.
                let _ = self.broadcast_local_tracks();
            }
        }

        let peers = self.peers.read();
        let phase = state::derive_phase(peers.values());
        let remote = state::remote_tracks(peers.values());
        drop(peers);
        self.hub.update(|state| {
            state.connection_phase = phase;
            state.remote_track_state = remote;
        });
    }

    /// Send the local track state to the other side. A failed send is
    /// recorded in `last_error` as well as returned.
    fn broadcast_local_tracks(&self) -> Result<(), SignalingError> {
        let tracks = self.hub.current().local_track_state;
        self.signaling
            .send(SignalingMessage::Media {
                track_state: tracks,
            })
            .inspect_err(|err| {
                tracing::warn!(error = %err, "track state broadcast failed");
                let fault = SessionFault::Signaling(err.to_string());
                self.hub.update(|state| state.last_error = Some(fault));
            })
    }

    /// Local flags change even when the broadcast fails.
    fn publish_local_tracks(&self, tracks: TrackState) -> Result<(), SignalingError> {
        self.hub.update(|state| state.local_track_state = tracks);
        self.broadcast_local_tracks()
    }
}
