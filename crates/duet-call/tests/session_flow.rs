mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{
    default_party, drain_notices, expect_notice, fast_config, init_tracing, party, GatewayRelay,
    Party,
};
use duet_call::{
    CallError, CallNotice, CallSession, ConnectionState, LoopbackNetwork, MemorySessionIdStore,
    PeerEvent, Role, SessionEvent, SyntheticMediaSource,
};
use duet_proto::MediaState;

async fn connected_pair(room: &str) -> (Arc<GatewayRelay>, LoopbackNetwork, Party, Party) {
    init_tracing();
    let relay = GatewayRelay::new();
    let network = LoopbackNetwork::new();
    let alice = default_party(relay.clone(), &network);
    let bob = default_party(relay.clone(), &network);

    alice.handle.start(Some(room)).await.unwrap();
    assert_eq!(alice.handle.state(), ConnectionState::Waiting);
    bob.handle.join(room).await.unwrap();

    alice
        .handle
        .wait_for_state(ConnectionState::Connected)
        .await
        .unwrap();
    bob.handle
        .wait_for_state(ConnectionState::Connected)
        .await
        .unwrap();
    (relay, network, alice, bob)
}

fn remote_states(notices: &[CallNotice]) -> Vec<MediaState> {
    notices
        .iter()
        .filter_map(|notice| match notice {
            CallNotice::RemoteMedia(state) => Some(*state),
            _ => None,
        })
        .collect()
}

#[test_timeout::tokio_timeout_test(30, paused)]
async fn initiator_and_joiner_connect_through_relay() {
    let (relay, network, mut alice, bob) = connected_pair("room-42").await;

    let alice_view = alice.handle.snapshot().await.unwrap();
    assert_eq!(alice_view.role, Some(Role::Initiator));
    assert_eq!(alice_view.session_id.as_deref(), Some("room-42"));
    assert_eq!(
        alice_view.share_link.as_deref(),
        Some("https://duet.test/call?room=room-42")
    );
    assert!(!alice_view.polling);

    let bob_view = bob.handle.snapshot().await.unwrap();
    assert_eq!(bob_view.role, Some(Role::Joiner));

    let link = expect_notice(&mut alice.notices, |n| {
        matches!(n, CallNotice::ShareLink { .. })
    })
    .await;
    assert_eq!(
        link,
        CallNotice::ShareLink {
            session_id: "room-42".into(),
            link: "https://duet.test/call?room=room-42".into(),
        }
    );

    // Reading the answer retired the session.
    assert!(relay.gateway().fetch_offer("room-42").await.is_err());
    assert_eq!(network.open_links(), 2);
}

#[test_timeout::tokio_timeout_test(30, paused)]
async fn mute_reaches_peer_exactly_once() {
    let (_relay, _network, alice, mut bob) = connected_pair("room-42").await;

    // The post-open flush carries the initial state.
    let initial = expect_notice(&mut bob.notices, |n| {
        matches!(n, CallNotice::RemoteMedia(_))
    })
    .await;
    assert_eq!(initial, CallNotice::RemoteMedia(MediaState::default()));

    let local = alice.handle.toggle_mute().await.unwrap();
    assert_eq!(local, MediaState::new(true, false));

    tokio::time::sleep(Duration::from_millis(500)).await;
    let seen = remote_states(&drain_notices(&mut bob.notices));
    assert_eq!(seen, vec![MediaState::new(true, false)]);
    assert_eq!(
        bob.handle.snapshot().await.unwrap().remote,
        MediaState::new(true, false)
    );
}

#[test_timeout::tokio_timeout_test(30, paused)]
async fn rapid_toggles_collapse_into_latest_state() {
    let (_relay, _network, alice, mut bob) = connected_pair("room-7").await;
    expect_notice(&mut bob.notices, |n| matches!(n, CallNotice::RemoteMedia(_))).await;

    alice.handle.toggle_mute().await.unwrap();
    alice.handle.toggle_video().await.unwrap();
    alice.handle.toggle_mute().await.unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;
    let seen = remote_states(&drain_notices(&mut bob.notices));
    assert_eq!(seen, vec![MediaState::new(false, true)]);
}

#[test_timeout::tokio_timeout_test(30, paused)]
async fn toggle_right_after_connect_is_not_repeated() {
    let (_relay, _network, alice, mut bob) = connected_pair("room-8").await;

    // Lands while the post-open flush may still be pending.
    alice.handle.toggle_mute().await.unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;

    let seen = remote_states(&drain_notices(&mut bob.notices));
    let muted = MediaState::new(true, false);
    assert_eq!(seen.iter().filter(|state| **state == muted).count(), 1);
    assert_eq!(seen.last(), Some(&muted));
}

#[test_timeout::tokio_timeout_test(30, paused)]
async fn state_changed_before_open_is_delivered_once() {
    init_tracing();
    let relay = GatewayRelay::new();
    let network = LoopbackNetwork::new();
    let alice = default_party(relay.clone(), &network);
    let mut bob = default_party(relay.clone(), &network);

    alice.handle.start(Some("early")).await.unwrap();
    alice.handle.toggle_mute().await.unwrap();
    alice.handle.toggle_mute().await.unwrap();
    let latest = alice.handle.toggle_video().await.unwrap();
    assert_eq!(latest, MediaState::new(false, true));
    tokio::time::sleep(Duration::from_millis(100)).await;

    bob.handle.join("early").await.unwrap();
    bob.handle
        .wait_for_state(ConnectionState::Connected)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;

    let seen = remote_states(&drain_notices(&mut bob.notices));
    assert_eq!(seen, vec![MediaState::new(false, true)]);
}

fn bare_session(relay: Arc<GatewayRelay>, network: &LoopbackNetwork) -> CallSession {
    CallSession::new(
        fast_config(),
        relay,
        Arc::new(network.factory()),
        Arc::new(SyntheticMediaSource::new()),
    )
    .with_identity(Arc::new(MemorySessionIdStore::new()))
}

fn control_text(epoch: u64, text: &str) -> SessionEvent {
    SessionEvent::Peer {
        epoch,
        event: PeerEvent::ControlMessage(text.to_string()),
    }
}

#[test_timeout::tokio_timeout_test(30, paused)]
async fn call_ended_while_connecting_returns_joiner_to_idle() {
    init_tracing();
    let relay = GatewayRelay::new();
    let network = LoopbackNetwork::new();
    let mut config = fast_config();
    // Keep the initiator from picking up the answer.
    config.poll_interval = Duration::from_secs(10);
    let alice = party(config, relay.clone(), &network, SyntheticMediaSource::new());
    alice.handle.start(Some("half-open")).await.unwrap();

    let mut bob = bare_session(relay.clone(), &network);
    let mut notices = bob.subscribe_notices();
    bob.join_call("half-open").await.unwrap();
    assert_eq!(bob.state(), ConnectionState::Connecting);
    assert_eq!(network.open_links(), 2);

    let before = bob.epoch();
    bob.handle_event(control_text(before, r#"{"type":"callEnded"}"#))
        .await;

    assert_eq!(bob.state(), ConnectionState::Idle);
    assert!(bob.epoch() > before);
    assert_eq!(network.open_links(), 1);
    assert!(bob.session_id().is_none());
    let notice = expect_notice(&mut notices, |n| matches!(n, CallNotice::Ended { .. })).await;
    assert_eq!(notice, CallNotice::Ended { by_peer: true });
    assert_eq!(alice.handle.state(), ConnectionState::Waiting);
}

#[test_timeout::tokio_timeout_test(30, paused)]
async fn malformed_control_frames_leave_call_connected() {
    init_tracing();
    let relay = GatewayRelay::new();
    let network = LoopbackNetwork::new();
    let alice = default_party(relay.clone(), &network);
    alice.handle.start(Some("noisy")).await.unwrap();

    let mut bob = bare_session(relay.clone(), &network);
    let mut notices = bob.subscribe_notices();
    bob.join_call("noisy").await.unwrap();
    while bob.state() != ConnectionState::Connected {
        let event = bob.next_event().await.unwrap();
        bob.handle_event(event).await;
    }

    let epoch = bob.epoch();
    let remote = bob.snapshot().remote;
    drain_notices(&mut notices);
    for frame in ["not json", r#"{"type":"mystery"}"#, r#"{"type":"mediaState""#] {
        bob.handle_event(control_text(epoch, frame)).await;
    }

    assert_eq!(bob.state(), ConnectionState::Connected);
    assert_eq!(bob.epoch(), epoch);
    assert_eq!(bob.snapshot().remote, remote);
    assert_eq!(network.open_links(), 2);
    assert!(drain_notices(&mut notices).is_empty());
    alice
        .handle
        .wait_for_state(ConnectionState::Connected)
        .await
        .unwrap();
}

#[test_timeout::tokio_timeout_test(30, paused)]
async fn joining_by_share_link_reaches_the_room() {
    init_tracing();
    let relay = GatewayRelay::new();
    let network = LoopbackNetwork::new();
    let alice = default_party(relay.clone(), &network);
    let bob = default_party(relay.clone(), &network);

    alice.handle.start(Some("room-x")).await.unwrap();
    bob.handle
        .join("https://duet.test/call?room=room-x")
        .await
        .unwrap();
    assert_eq!(
        bob.handle.snapshot().await.unwrap().session_id.as_deref(),
        Some("room-x")
    );

    alice
        .handle
        .wait_for_state(ConnectionState::Connected)
        .await
        .unwrap();
    bob.handle
        .wait_for_state(ConnectionState::Connected)
        .await
        .unwrap();
}

#[test_timeout::tokio_timeout_test(30, paused)]
async fn poll_gives_up_after_max_attempts() {
    init_tracing();
    let relay = GatewayRelay::new();
    let network = LoopbackNetwork::new();
    let mut config = fast_config();
    config.max_poll_attempts = 5;
    let mut alice = party(config, relay.clone(), &network, SyntheticMediaSource::new());

    alice.handle.start(Some("lonely")).await.unwrap();
    let notice = expect_notice(&mut alice.notices, |n| matches!(n, CallNotice::Error(_))).await;
    assert_eq!(
        notice,
        CallNotice::Error("Timeout. Second user did not connect.".into())
    );

    alice
        .handle
        .wait_for_state(ConnectionState::Idle)
        .await
        .unwrap();
    assert_eq!(relay.answer_fetches(), 5);
    assert_eq!(network.open_links(), 0);
    let view = alice.handle.snapshot().await.unwrap();
    assert!(view.session_id.is_none());
    assert!(!view.polling);

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(relay.answer_fetches(), 5);
}

#[test_timeout::tokio_timeout_test(30, paused)]
async fn answer_stops_polling() {
    let (relay, _network, _alice, _bob) = connected_pair("room-9").await;
    let fetched = relay.answer_fetches();
    assert!(fetched >= 1);
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(relay.answer_fetches(), fetched);
}

#[test_timeout::tokio_timeout_test(30, paused)]
async fn hang_up_tears_down_both_sides() {
    let (_relay, network, mut alice, mut bob) = connected_pair("room-5").await;

    alice.handle.end().await.unwrap();
    assert_eq!(alice.handle.state(), ConnectionState::Idle);
    expect_notice(&mut alice.notices, |n| {
        *n == CallNotice::Ended { by_peer: false }
    })
    .await;

    expect_notice(&mut bob.notices, |n| {
        *n == CallNotice::Ended { by_peer: true }
    })
    .await;
    bob.handle
        .wait_for_state(ConnectionState::Idle)
        .await
        .unwrap();

    // The link closing behind the hang-up must not read as a failure.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!drain_notices(&mut bob.notices)
        .iter()
        .any(|n| matches!(n, CallNotice::Error(_))));
    assert_eq!(network.open_links(), 0);
    assert!(bob.handle.snapshot().await.unwrap().session_id.is_none());
}

#[test_timeout::tokio_timeout_test(30, paused)]
async fn failed_link_reports_connection_lost() {
    let (_relay, network, mut alice, mut bob) = connected_pair("room-3").await;

    network.fail_links();
    for side in [&mut alice, &mut bob] {
        let notice = expect_notice(&mut side.notices, |n| matches!(n, CallNotice::Error(_))).await;
        assert_eq!(notice, CallNotice::Error("Connection lost".into()));
        side.handle
            .wait_for_state(ConnectionState::Idle)
            .await
            .unwrap();
    }
    assert_eq!(network.open_links(), 0);
}

#[test_timeout::tokio_timeout_test(30, paused)]
async fn starting_an_offered_room_joins_it() {
    init_tracing();
    let relay = GatewayRelay::new();
    let network = LoopbackNetwork::new();
    let alice = default_party(relay.clone(), &network);
    let bob = default_party(relay.clone(), &network);

    alice.handle.start(Some("shared")).await.unwrap();
    bob.handle.start(Some("Shared")).await.unwrap();
    assert_eq!(bob.handle.snapshot().await.unwrap().role, Some(Role::Joiner));

    alice
        .handle
        .wait_for_state(ConnectionState::Connected)
        .await
        .unwrap();
    bob.handle
        .wait_for_state(ConnectionState::Connected)
        .await
        .unwrap();
}

#[test_timeout::tokio_timeout_test(30, paused)]
async fn second_start_while_active_is_refused() {
    let relay = GatewayRelay::new();
    let network = LoopbackNetwork::new();
    let alice = default_party(relay, &network);

    alice.handle.start(Some("busy-room")).await.unwrap();
    let err = alice.handle.start(Some("other")).await.unwrap_err();
    assert!(matches!(err, CallError::Busy(ConnectionState::Waiting)));
    let err = alice.handle.join("other").await.unwrap_err();
    assert!(matches!(err, CallError::Busy(ConnectionState::Waiting)));
    assert_eq!(
        alice.handle.snapshot().await.unwrap().session_id.as_deref(),
        Some("busy-room")
    );
}

#[test_timeout::tokio_timeout_test(30, paused)]
async fn unusable_room_names_are_rejected() {
    let relay = GatewayRelay::new();
    let network = LoopbackNetwork::new();
    let mut alice = default_party(relay, &network);

    let err = alice.handle.start(Some("!!!")).await.unwrap_err();
    assert!(matches!(err, CallError::Validation(_)));
    let notice = expect_notice(&mut alice.notices, |n| matches!(n, CallNotice::Error(_))).await;
    assert_eq!(notice, CallNotice::Error("Room ID not specified".into()));

    assert!(matches!(
        alice.handle.join("  ").await,
        Err(CallError::Validation(_))
    ));
    assert_eq!(alice.handle.state(), ConnectionState::Idle);
    assert_eq!(network.open_links(), 0);
}

#[test_timeout::tokio_timeout_test(30, paused)]
async fn hanging_up_while_waiting_removes_offer() {
    let relay = GatewayRelay::new();
    let network = LoopbackNetwork::new();
    let alice = default_party(relay.clone(), &network);

    alice.handle.start(Some("abandoned")).await.unwrap();
    assert!(relay.gateway().fetch_offer("abandoned").await.is_ok());

    alice.handle.end().await.unwrap();
    assert!(relay.gateway().fetch_offer("abandoned").await.is_err());

    let fetched = relay.answer_fetches();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(relay.answer_fetches(), fetched);
    assert_eq!(network.open_links(), 0);
}

#[test_timeout::tokio_timeout_test(30, paused)]
async fn missing_microphone_aborts_start() {
    let relay = GatewayRelay::new();
    let network = LoopbackNetwork::new();
    let mut alice = party(
        fast_config(),
        relay.clone(),
        &network,
        SyntheticMediaSource::new().refuse_audio(true),
    );

    let err = alice.handle.start(Some("quiet")).await.unwrap_err();
    assert!(matches!(err, CallError::Media(_)));
    let notice = expect_notice(&mut alice.notices, |n| matches!(n, CallNotice::Error(_))).await;
    assert_eq!(notice, CallNotice::Error("Could not access microphone".into()));
    assert_eq!(alice.handle.state(), ConnectionState::Idle);
    assert_eq!(network.open_links(), 0);
    assert!(relay.gateway().fetch_offer("quiet").await.is_err());
}

#[test_timeout::tokio_timeout_test(30, paused)]
async fn camera_failure_falls_back_to_audio_only() {
    init_tracing();
    let relay = GatewayRelay::new();
    let network = LoopbackNetwork::new();
    let mut alice = party(
        fast_config(),
        relay.clone(),
        &network,
        SyntheticMediaSource::new().refuse_video(true),
    );
    let mut bob = default_party(relay.clone(), &network);

    alice.handle.start(Some("audio")).await.unwrap();
    let warning = expect_notice(&mut alice.notices, |n| matches!(n, CallNotice::Warning(_))).await;
    assert_eq!(
        warning,
        CallNotice::Warning("Camera unavailable. Audio only.".into())
    );
    assert_eq!(
        alice.handle.snapshot().await.unwrap().local,
        MediaState::new(false, true)
    );
    // No camera track, so the toggle changes nothing.
    assert_eq!(
        alice.handle.toggle_video().await.unwrap(),
        MediaState::new(false, true)
    );

    bob.handle.join("audio").await.unwrap();
    let remote = expect_notice(&mut bob.notices, |n| matches!(n, CallNotice::RemoteMedia(_))).await;
    assert_eq!(remote, CallNotice::RemoteMedia(MediaState::new(false, true)));
}

#[test_timeout::tokio_timeout_test(30, paused)]
async fn joining_unknown_room_fails() {
    let relay = GatewayRelay::new();
    let network = LoopbackNetwork::new();
    let mut bob = default_party(relay, &network);

    let err = bob.handle.join("ghost").await.unwrap_err();
    assert!(matches!(err, CallError::NotFound(_)));
    let notice = expect_notice(&mut bob.notices, |n| matches!(n, CallNotice::Error(_))).await;
    assert_eq!(notice, CallNotice::Error("Error joining call".into()));
    assert_eq!(bob.handle.state(), ConnectionState::Idle);
    assert_eq!(network.open_links(), 0);
}

#[test_timeout::tokio_timeout_test(30, paused)]
async fn dropping_the_handle_ends_the_call() {
    let (_relay, network, alice, mut bob) = connected_pair("room-1").await;

    let Party { handle, task, .. } = alice;
    drop(handle);
    task.join().await;

    expect_notice(&mut bob.notices, |n| {
        *n == CallNotice::Ended { by_peer: true }
    })
    .await;
    bob.handle
        .wait_for_state(ConnectionState::Idle)
        .await
        .unwrap();
    assert_eq!(network.open_links(), 0);
}
