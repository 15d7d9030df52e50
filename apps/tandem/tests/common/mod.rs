#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tandem::media::SyntheticDevices;
use tandem::signaling::{LocalRelay, SignalingEnvelope};
use tandem::transport::LoopbackNetwork;
use tandem::{
    ConnectionKey, ConnectionPhase, CoordinatorDeps, MediaConstraints, PeerEvent, SessionConfig,
    SessionCoordinator, SessionState, SignalingMessage, Subscription,
};

pub const MEETING: &str = "meeting-42";

/// How long the second participant waits before joining. Long enough for the
/// first participant's presence to have gone out, so only the first one
/// offers.
pub const JOIN_GAP: Duration = Duration::from_millis(500);

/// A relay and a loopback network shared by every participant of a test.
pub struct Rig {
    pub relay: LocalRelay,
    pub network: LoopbackNetwork,
}

pub struct Participant {
    pub coordinator: SessionCoordinator,
    pub devices: Arc<SyntheticDevices>,
}

impl Rig {
    pub fn new() -> Self {
        Self {
            relay: LocalRelay::new(),
            network: LoopbackNetwork::new(),
        }
    }

    pub fn config() -> SessionConfig {
        SessionConfig::default().with_ice_servers(Vec::new())
    }

    pub fn participant(&self, key: &str) -> Participant {
        self.participant_with(key, SyntheticDevices::new(), Self::config())
    }

    pub fn participant_with(
        &self,
        key: &str,
        devices: SyntheticDevices,
        config: SessionConfig,
    ) -> Participant {
        let devices = Arc::new(devices);
        let coordinator = SessionCoordinator::new(
            CoordinatorDeps {
                relay: Arc::new(self.relay.clone()),
                devices: devices.clone(),
                transports: Arc::new(self.network.clone()),
            },
            config,
        )
        .with_connection_key(key);
        Participant {
            coordinator,
            devices,
        }
    }

    /// Deliver `message` to `to` as if `from` had sent it.
    pub fn inject(&self, to: &str, from: &str, message: SignalingMessage) {
        let delivered = self.relay.inject(
            &ConnectionKey::from(to),
            SignalingEnvelope {
                meeting_id: MEETING.into(),
                from: from.into(),
                message,
            },
        );
        assert!(delivered, "{to} is not connected to the relay");
    }
}

/// `first` joins as alice, `second` joins as bob [`JOIN_GAP`] later.
pub async fn join_in_turn(first: &Participant, second: &Participant) {
    first
        .coordinator
        .join(MEETING, "alice", MediaConstraints::default())
        .await
        .expect("alice joins");
    tokio::time::sleep(JOIN_GAP).await;
    second
        .coordinator
        .join(MEETING, "bob", MediaConstraints::default())
        .await
        .expect("bob joins");
}

pub fn presence(key: &str, participant: &str) -> SignalingMessage {
    SignalingMessage::Join {
        connection_key: key.into(),
        participant_id: participant.into(),
    }
}

/// Resolve with the first published state matching `predicate`.
pub async fn wait_for<F>(coordinator: &SessionCoordinator, predicate: F) -> SessionState
where
    F: Fn(&SessionState) -> bool,
{
    let mut states = coordinator.watch_state();
    loop {
        {
            let state = states.borrow_and_update();
            if predicate(&state) {
                return state.clone();
            }
        }
        states.changed().await.expect("coordinator dropped");
    }
}

/// Connected, with the remote camera and microphone arrived.
pub async fn connected(coordinator: &SessionCoordinator) -> SessionState {
    wait_for(coordinator, |state| {
        state.connection_phase == ConnectionPhase::Connected
            && state
                .remote_track_state
                .is_some_and(|tracks| tracks.audio_enabled && tracks.video_enabled)
    })
    .await
}

pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    while !check().await {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Everything published through a callback, for later inspection.
pub struct Recorder<T> {
    pub seen: Arc<Mutex<Vec<T>>>,
    _subscription: Subscription,
}

impl<T> Recorder<T> {
    pub fn snapshot(&self) -> Vec<T>
    where
        T: Clone,
    {
        self.seen.lock().clone()
    }
}

pub fn record_phases(coordinator: &SessionCoordinator) -> Recorder<ConnectionPhase> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let subscription =
        coordinator.on_state_change(move |state| sink.lock().push(state.connection_phase));
    Recorder {
        seen,
        _subscription: subscription,
    }
}

pub fn record_peer_events(coordinator: &SessionCoordinator) -> Recorder<PeerEvent> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let subscription = coordinator.on_peer_event(move |event| sink.lock().push(event.clone()));
    Recorder {
        seen,
        _subscription: subscription,
    }
}
