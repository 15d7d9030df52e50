mod common;

use std::time::Duration;

use common::{
    JOIN_GAP, MEETING, Rig, connected, eventually, join_in_turn, presence, record_peer_events,
    record_phases, wait_for,
};
use tandem::session::{NegotiationState, Role};
use tandem::{
    ConnectionKey, ConnectionPhase, MediaConstraints, MediaError, PeerEvent, SessionError,
    SessionFault, SignalingError, TrackKind,
};
use tokio::time::Instant;

#[test_timeout::tokio_timeout_test(60, paused)]
async fn later_joiner_is_offered_to_and_sees_the_leave_through_grace() {
    let rig = Rig::new();
    let x = rig.participant("k1");
    let y = rig.participant("k2");
    let x_events = record_peer_events(&x.coordinator);

    x.coordinator
        .join(MEETING, "alice", MediaConstraints::default())
        .await
        .unwrap();
    assert_eq!(
        x.coordinator.state().connection_phase,
        ConnectionPhase::Connecting
    );
    tokio::time::sleep(JOIN_GAP).await;
    let y_joined_at = Instant::now();
    y.coordinator
        .join(MEETING, "bob", MediaConstraints::default())
        .await
        .unwrap();

    let x_state = connected(&x.coordinator).await;
    let y_state = connected(&y.coordinator).await;
    assert!(y_joined_at.elapsed() < Rig::config().negotiation_timeout);
    let remote = x_state.remote_track_state.unwrap();
    assert!(remote.audio_enabled && remote.video_enabled && !remote.screen_sharing);
    assert!(y_state.local_track_state.audio_enabled);

    let x_peers = x.coordinator.peers().await;
    assert_eq!(x_peers.len(), 1);
    assert_eq!(x_peers[0].key, ConnectionKey::from("k2"));
    assert_eq!(x_peers[0].participant_id.as_deref(), Some("bob"));
    assert_eq!(x_peers[0].role, Some(Role::Offerer));
    // k2 never saw k1's presence; it learns who called from the offer.
    let y_peers = y.coordinator.peers().await;
    assert_eq!(y_peers.len(), 1);
    assert_eq!(y_peers[0].key, ConnectionKey::from("k1"));
    assert_eq!(y_peers[0].participant_id.as_deref(), Some("alice"));
    assert_eq!(y_peers[0].role, Some(Role::Answerer));

    assert_eq!(rig.network.active_links(), 1);
    assert_eq!(rig.network.offers_created(), 1);
    assert_eq!(x.coordinator.active_sessions().await, 1);

    let left_at = Instant::now();
    y.coordinator.leave().await;
    let after = wait_for(&x.coordinator, |state| {
        state.connection_phase == ConnectionPhase::Connecting
            && state.remote_track_state.is_none()
    })
    .await;
    assert!(left_at.elapsed() >= Rig::config().disconnect_grace);
    assert!(after.last_error.is_none());
    assert_eq!(x.coordinator.active_sessions().await, 0);

    let events = x_events.snapshot();
    let k2 = ConnectionKey::from("k2");
    assert!(events.contains(&PeerEvent::StateChanged {
        peer: k2.clone(),
        from: NegotiationState::Connected,
        to: NegotiationState::Disconnected,
    }));
    assert!(events.contains(&PeerEvent::StateChanged {
        peer: k2.clone(),
        from: NegotiationState::Disconnected,
        to: NegotiationState::Closed,
    }));
    assert!(events.contains(&PeerEvent::Departed { peer: k2 }));
}

#[test_timeout::tokio_timeout_test(60, paused)]
async fn remote_leave_waits_out_the_grace_period() {
    let rig = Rig::new();
    let x = rig.participant("k1");
    let y = rig.participant("k2");
    let events = record_peer_events(&x.coordinator);

    join_in_turn(&x, &y).await;
    connected(&x.coordinator).await;

    let left_at = Instant::now();
    y.coordinator.leave().await;

    let reconnecting = wait_for(&x.coordinator, |state| {
        state.connection_phase == ConnectionPhase::Reconnecting
    })
    .await;
    assert!(reconnecting.remote_track_state.is_some());

    let after = wait_for(&x.coordinator, |state| {
        state.connection_phase == ConnectionPhase::Connecting
            && state.remote_track_state.is_none()
    })
    .await;
    assert!(left_at.elapsed() >= Rig::config().disconnect_grace);
    assert!(after.last_error.is_none());
    assert_eq!(x.coordinator.active_sessions().await, 0);
    assert!(x.coordinator.is_joined().await);
    assert!(
        events
            .snapshot()
            .contains(&PeerEvent::Departed { peer: "k2".into() })
    );
}

#[test_timeout::tokio_timeout_test(60, paused)]
async fn short_outage_recovers_without_tearing_down() {
    let rig = Rig::new();
    let x = rig.participant("k1");
    let y = rig.participant("k2");

    join_in_turn(&x, &y).await;
    connected(&x.coordinator).await;
    connected(&y.coordinator).await;
    let phases = record_phases(&x.coordinator);

    rig.network.interrupt(&"k1".into());
    wait_for(&x.coordinator, |state| {
        state.connection_phase == ConnectionPhase::Reconnecting
    })
    .await;
    tokio::time::sleep(Duration::from_secs(2)).await;
    rig.network.restore(&"k1".into());
    connected(&x.coordinator).await;

    // Well past the grace period: nothing expires after recovery.
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(
        x.coordinator.state().connection_phase,
        ConnectionPhase::Connected
    );
    assert_eq!(x.coordinator.active_sessions().await, 1);
    let phases = phases.snapshot();
    assert!(phases.contains(&ConnectionPhase::Reconnecting));
    assert_eq!(phases.last(), Some(&ConnectionPhase::Connected));
    assert!(phases.iter().all(|phase| matches!(
        phase,
        ConnectionPhase::Connected | ConnectionPhase::Reconnecting
    )));
    assert_eq!(rig.network.offers_created(), 1);
}

#[test_timeout::tokio_timeout_test(10)]
async fn leave_releases_every_resource() {
    let rig = Rig::new();
    let x = rig.participant("k1");
    let y = rig.participant("k2");

    join_in_turn(&x, &y).await;
    connected(&x.coordinator).await;
    let signaling = x.coordinator.signaling().await.unwrap();
    assert!(signaling.subscriber_count() > 0);
    assert_eq!(x.devices.live_tracks(), 2);

    x.coordinator.leave().await;

    let state = x.coordinator.state();
    assert_eq!(state.connection_phase, ConnectionPhase::Left);
    assert_eq!(state.remote_track_state, None);
    assert_eq!(x.coordinator.active_sessions().await, 0);
    assert_eq!(x.coordinator.live_tracks().await, 0);
    assert_eq!(x.devices.live_tracks(), 0);
    assert_eq!(signaling.subscriber_count(), 0);
    assert!(!signaling.is_connected());
    assert!(x.coordinator.chat().await.is_none());
    eventually(|| async { rig.relay.member_count(MEETING) == 1 }).await;

    // Leaving again changes nothing.
    x.coordinator.leave().await;
    assert_eq!(
        x.coordinator.state().connection_phase,
        ConnectionPhase::Left
    );
}

#[test_timeout::tokio_timeout_test(10)]
async fn repeated_presence_yields_one_session() {
    let rig = Rig::new();
    rig.relay.set_duplicate_delivery(true);
    let x = rig.participant("k1");
    let y = rig.participant("k2");

    join_in_turn(&x, &y).await;
    connected(&x.coordinator).await;
    connected(&y.coordinator).await;

    rig.inject("k1", "k2", presence("k2", "bob"));
    rig.inject("k1", "k2", presence("k2", "bob"));
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(x.coordinator.active_sessions().await, 1);
    assert_eq!(y.coordinator.active_sessions().await, 1);
    assert_eq!(rig.network.offers_created(), 1);
    assert_eq!(rig.network.active_links(), 1);
    assert_eq!(
        x.coordinator.state().connection_phase,
        ConnectionPhase::Connected
    );
}

#[test_timeout::tokio_timeout_test(10)]
async fn simultaneous_offers_settle_on_the_smaller_key() {
    let rig = Rig::new();
    let a = rig.participant("a");
    let b = rig.participant("b");

    a.coordinator
        .join(MEETING, "alice", MediaConstraints::default())
        .await
        .unwrap();
    b.coordinator
        .join(MEETING, "bob", MediaConstraints::default())
        .await
        .unwrap();
    // b learns about a as well, so both sides start an offer.
    rig.inject("b", "a", presence("a", "alice"));

    connected(&a.coordinator).await;
    connected(&b.coordinator).await;

    let a_peers = a.coordinator.peers().await;
    let b_peers = b.coordinator.peers().await;
    assert_eq!(a_peers.len(), 1);
    assert_eq!(b_peers.len(), 1);
    assert_eq!(a_peers[0].role, Some(Role::Offerer));
    assert_eq!(b_peers[0].role, Some(Role::Answerer));
    assert_eq!(rig.network.active_links(), 1);
    eventually(|| async { rig.network.open_endpoints() == 2 }).await;
}

#[test_timeout::tokio_timeout_test(10)]
async fn mute_flips_the_track_without_renegotiating() {
    let rig = Rig::new();
    let x = rig.participant("k1");
    let y = rig.participant("k2");

    join_in_turn(&x, &y).await;
    connected(&x.coordinator).await;
    connected(&y.coordinator).await;
    let offers = rig.network.offers_created();

    assert!(!x.coordinator.toggle_audio().await.unwrap());
    let transitions = x.coordinator.track_transitions().await;
    assert_eq!(transitions.len(), 1);
    assert_eq!(transitions[0].kind, TrackKind::Audio);
    assert!(!transitions[0].enabled);
    assert!(!x.coordinator.state().local_track_state.audio_enabled);

    wait_for(&y.coordinator, |state| {
        state
            .remote_track_state
            .is_some_and(|tracks| !tracks.audio_enabled && tracks.video_enabled)
    })
    .await;

    assert!(x.coordinator.toggle_audio().await.unwrap());
    assert!(!x.coordinator.toggle_video().await.unwrap());
    assert_eq!(x.coordinator.track_transitions().await.len(), 3);
    wait_for(&y.coordinator, |state| {
        state
            .remote_track_state
            .is_some_and(|tracks| tracks.audio_enabled && !tracks.video_enabled)
    })
    .await;

    assert_eq!(rig.network.offers_created(), offers);
    assert_eq!(x.devices.live_tracks(), 2);
}

#[test_timeout::tokio_timeout_test(10)]
async fn screen_share_replaces_outbound_video_in_place() {
    let rig = Rig::new();
    let x = rig.participant("k1");
    let y = rig.participant("k2");

    join_in_turn(&x, &y).await;
    connected(&x.coordinator).await;
    connected(&y.coordinator).await;
    let offers = rig.network.offers_created();

    assert!(x.coordinator.toggle_screen_share().await.unwrap());
    assert!(x.coordinator.state().local_track_state.screen_sharing);
    wait_for(&y.coordinator, |state| {
        state.remote_track_state.is_some_and(|t| t.screen_sharing)
    })
    .await;
    assert_eq!(rig.network.video_replacements(), 1);

    assert!(!x.coordinator.toggle_screen_share().await.unwrap());
    wait_for(&y.coordinator, |state| {
        state.remote_track_state.is_some_and(|t| !t.screen_sharing)
    })
    .await;
    assert_eq!(rig.network.video_replacements(), 2);
    assert_eq!(rig.network.offers_created(), offers);
    // Camera tracks stay live; the screen track is stopped.
    assert_eq!(x.devices.live_tracks(), 2);
}

#[test_timeout::tokio_timeout_test(10)]
async fn denied_screen_capture_leaves_the_camera_in_place() {
    let rig = Rig::new();
    let x = rig.participant_with(
        "k1",
        tandem::media::SyntheticDevices::new().deny_display_media(),
        Rig::config(),
    );
    x.coordinator
        .join(MEETING, "alice", MediaConstraints::default())
        .await
        .unwrap();

    let err = x.coordinator.toggle_screen_share().await.unwrap_err();
    assert!(matches!(
        err,
        SessionError::Media(MediaError::ScreenShareDenied)
    ));
    assert!(!x.coordinator.state().local_track_state.screen_sharing);
    assert_eq!(x.coordinator.live_tracks().await, 2);
}

#[test_timeout::tokio_timeout_test(10)]
async fn toggles_need_a_joined_meeting() {
    let rig = Rig::new();
    let x = rig.participant("k1");
    assert!(matches!(
        x.coordinator.toggle_audio().await,
        Err(SessionError::NotJoined)
    ));
    assert!(matches!(
        x.coordinator.toggle_screen_share().await,
        Err(SessionError::NotJoined)
    ));
    // Leaving without joining is a no-op.
    x.coordinator.leave().await;
    assert_eq!(x.coordinator.state().connection_phase, ConnectionPhase::Idle);
}

#[test_timeout::tokio_timeout_test(10)]
async fn chat_reaches_the_other_participant() {
    let rig = Rig::new();
    let x = rig.participant("k1");
    let y = rig.participant("k2");
    join_in_turn(&x, &y).await;

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let y_chat = y.coordinator.chat().await.unwrap();
    let _sub = y_chat.on_message(move |message| {
        let _ = tx.send(message.clone());
    });

    let x_chat = x.coordinator.chat().await.unwrap();
    assert!(matches!(x_chat.send("  "), Err(tandem::ChatError::Empty)));
    x_chat.send("hi bob").unwrap();

    let message = rx.recv().await.unwrap();
    assert_eq!(message.text, "hi bob");
    assert_eq!(message.sender_id, "alice");
    assert_eq!(message.from, ConnectionKey::from("k1"));
    assert!(rx.try_recv().is_err());
}

#[test_timeout::tokio_timeout_test(10)]
async fn camera_toggle_is_refused_while_sharing_the_screen() {
    let rig = Rig::new();
    let x = rig.participant("k1");
    x.coordinator
        .join(MEETING, "alice", MediaConstraints::default())
        .await
        .unwrap();
    assert!(x.coordinator.toggle_screen_share().await.unwrap());

    let err = x.coordinator.toggle_video().await.unwrap_err();
    assert!(matches!(err, SessionError::ScreenShareActive));
    let local = x.coordinator.state().local_track_state;
    assert!(local.video_enabled && local.screen_sharing);
    assert!(x.coordinator.track_transitions().await.is_empty());

    // The microphone is unaffected, and the camera works again once sharing stops.
    assert!(!x.coordinator.toggle_audio().await.unwrap());
    assert!(!x.coordinator.toggle_screen_share().await.unwrap());
    assert!(!x.coordinator.toggle_video().await.unwrap());
}

#[test_timeout::tokio_timeout_test(10)]
async fn failed_track_broadcast_is_reported() {
    let rig = Rig::new();
    let x = rig.participant("k1");
    x.coordinator
        .join(MEETING, "alice", MediaConstraints::default())
        .await
        .unwrap();
    x.coordinator.signaling().await.unwrap().disconnect();

    let err = x.coordinator.toggle_audio().await.unwrap_err();
    assert!(matches!(err, SessionError::Signaling(SignalingError::Closed)));
    let state = x.coordinator.state();
    assert!(!state.local_track_state.audio_enabled);
    assert!(matches!(state.last_error, Some(SessionFault::Signaling(_))));
}
