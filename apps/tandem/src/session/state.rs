use std::fmt;
use tokio::sync::watch;

use super::negotiator::{NegotiationFailure, NegotiationState, Role};
use crate::listeners::{Listeners, Subscription};
use crate::media::TrackState;
use crate::signaling::ConnectionKey;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionPhase {
    #[default]
    Idle,
    Connecting,
    Connected,
    Reconnecting,
    Left,
}

impl fmt::Display for ConnectionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnectionPhase::Idle => "idle",
            ConnectionPhase::Connecting => "connecting",
            ConnectionPhase::Connected => "connected",
            ConnectionPhase::Reconnecting => "reconnecting",
            ConnectionPhase::Left => "left",
        })
    }
}

/// The last thing that went wrong, in a form that can be cloned into state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionFault {
    Negotiation {
        peer: ConnectionKey,
        reason: NegotiationFailure,
    },
    ProtocolViolation(String),
    Signaling(String),
    Join(String),
}

impl fmt::Display for SessionFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionFault::Negotiation { peer, reason } => {
                write!(f, "negotiation with {peer} failed: {reason}")
            }
            SessionFault::ProtocolViolation(detail) => write!(f, "protocol violation: {detail}"),
            SessionFault::Signaling(detail) => write!(f, "signaling error: {detail}"),
            SessionFault::Join(detail) => write!(f, "join failed: {detail}"),
        }
    }
}

/// What a caller observes about the meeting.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionState {
    pub connection_phase: ConnectionPhase,
    pub local_track_state: TrackState,
    /// Absent while no peer is connected or reconnecting.
    pub remote_track_state: Option<TrackState>,
    pub last_error: Option<SessionFault>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSnapshot {
    pub key: ConnectionKey,
    pub participant_id: Option<String>,
    pub state: NegotiationState,
    pub role: Option<Role>,
    pub remote_tracks: TrackState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    StateChanged {
        peer: ConnectionKey,
        from: NegotiationState,
        to: NegotiationState,
    },
    Failed {
        peer: ConnectionKey,
        reason: NegotiationFailure,
    },
    /// The remote connection left or never came back within the grace period.
    Departed { peer: ConnectionKey },
}

/// Phase while joined, from the peers currently known.
pub(crate) fn derive_phase<'a>(peers: impl IntoIterator<Item = &'a PeerSnapshot>) -> ConnectionPhase {
    let mut reconnecting = false;
    for peer in peers {
        match peer.state {
            NegotiationState::Connected => return ConnectionPhase::Connected,
            NegotiationState::Disconnected => reconnecting = true,
            _ => {}
        }
    }
    if reconnecting {
        ConnectionPhase::Reconnecting
    } else {
        ConnectionPhase::Connecting
    }
}

pub(crate) fn remote_tracks<'a>(
    peers: impl IntoIterator<Item = &'a PeerSnapshot>,
) -> Option<TrackState> {
    peers
        .into_iter()
        .find(|peer| {
            matches!(
                peer.state,
                NegotiationState::Connected | NegotiationState::Disconnected
            )
        })
        .map(|peer| peer.remote_tracks)
}

/// Publishes state and peer events to watchers and callbacks.
pub(crate) struct StateHub {
    state: watch::Sender<SessionState>,
    state_listeners: Listeners<SessionState>,
    peer_listeners: Listeners<PeerEvent>,
}

impl StateHub {
    pub(crate) fn new() -> Self {
        let (state, _) = watch::channel(SessionState::default());
        Self {
            state,
            state_listeners: Listeners::new(),
            peer_listeners: Listeners::new(),
        }
    }

    pub(crate) fn current(&self) -> SessionState {
        self.state.borrow().clone()
    }

    pub(crate) fn watch(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub(crate) fn update(&self, modify: impl FnOnce(&mut SessionState)) {
        let changed = self.state.send_if_modified(|state| {
            let before = state.clone();
            modify(state);
            *state != before
        });
        if changed {
            let snapshot = self.current();
            tracing::debug!(
                phase = %snapshot.connection_phase,
                remote = snapshot.remote_track_state.is_some(),
                "session state changed"
            );
            self.state_listeners.emit(&snapshot);
        }
    }

    pub(crate) fn peer_event(&self, event: PeerEvent) {
        self.peer_listeners.emit(&event);
    }

    pub(crate) fn on_state_change<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&SessionState) + Send + Sync + 'static,
    {
        self.state_listeners.add(callback)
    }

    pub(crate) fn on_peer_event<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&PeerEvent) + Send + Sync + 'static,
    {
        self.peer_listeners.add(callback)
    }
}
