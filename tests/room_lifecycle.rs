//! Raum-Lebenszyklus gegen das In-Process Relay

mod common;

use async_trait::async_trait;
use common::{eventually, params, peer, peer_with_config, test_config, APP_ID, ROOM_ID};
use roomlink::callback::ExitReason;
use roomlink::signaling::{Credentials, SignalingError, TransportConnector, TransportSession};
use roomlink::{
    codes, AppScene, EnterRoomParams, MemoryRelay, RoomEngine, RoomEvent, RoomState,
    VirtualDeviceBackend,
};
use std::sync::Arc;
use std::time::Duration;

/// Verzögert den Verbindungsaufbau zum Relay
struct SlowConnector {
    relay: MemoryRelay,
    delay: Duration,
}

#[async_trait]
impl TransportConnector for SlowConnector {
    async fn connect(&self, credentials: Credentials) -> Result<TransportSession, SignalingError> {
        tokio::time::sleep(self.delay).await;
        self.relay.connect(credentials).await
    }
}

/// Antwortet nie
struct SilentConnector;

#[async_trait]
impl TransportConnector for SilentConnector {
    async fn connect(&self, _credentials: Credentials) -> Result<TransportSession, SignalingError> {
        std::future::pending().await
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_enter_and_exit_restores_idle() {
    let relay = MemoryRelay::new();
    let alice = peer(&relay, "alice");

    alice.join().await;
    assert_eq!(alice.engine.room_state(), RoomState::Joined);
    assert_eq!(relay.members(ROOM_ID), vec!["alice".to_string()]);

    alice.engine.exit_room();
    assert_eq!(alice.engine.room_state(), RoomState::Idle);
    assert!(alice.engine.participants().is_empty());
    alice.engine.flush().await;
    assert_eq!(
        alice.events.count(|e| *e == RoomEvent::ExitRoom { reason: ExitReason::Requested }),
        1
    );
    eventually("relay membership cleared", || relay.members(ROOM_ID).is_empty()).await;

    // Die Engine ist wiederverwendbar
    alice.join().await;
    assert_eq!(alice.engine.room_state(), RoomState::Joined);
    assert_eq!(
        alice.events.count(|e| matches!(e, RoomEvent::EnterRoom { .. })),
        2
    );
    eventually("relay membership restored", || {
        relay.members(ROOM_ID) == vec!["alice".to_string()]
    })
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_invalid_params_fail_fast() {
    let relay = MemoryRelay::new();
    let alice = peer(&relay, "alice");

    let err = alice
        .engine
        .enter_room(EnterRoomParams::new(APP_ID, 0, "alice", "sig"), AppScene::VideoCall)
        .unwrap_err();
    assert_eq!(err.code(), codes::ERR_ROOM_ID_INVALID);
    assert_eq!(alice.engine.room_state(), RoomState::Idle);

    let err = alice
        .engine
        .enter_room(EnterRoomParams::new(APP_ID, ROOM_ID, "", "sig"), AppScene::VideoCall)
        .unwrap_err();
    assert_eq!(err.code(), codes::ERR_USER_ID_INVALID);

    alice.engine.flush().await;
    assert_eq!(
        alice.events.count(|e| matches!(e, RoomEvent::EnterRoomFailed { .. })),
        2
    );
    assert!(relay.members(ROOM_ID).is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_second_enter_is_rejected() {
    let relay = MemoryRelay::new();
    let alice = peer(&relay, "alice");
    alice.join().await;

    let err = alice
        .engine
        .enter_room(params("alice"), AppScene::VideoCall)
        .unwrap_err();
    assert_eq!(err.code(), codes::ERR_ALREADY_IN_ROOM);
    assert_eq!(alice.engine.room_state(), RoomState::Joined);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_rejected_signature_reports_failure() {
    let relay = MemoryRelay::new();
    relay.reject_user_sig("sig-alice");
    let alice = peer(&relay, "alice");

    alice
        .engine
        .enter_room(params("alice"), AppScene::VideoCall)
        .expect("params are valid");
    let event = alice
        .events
        .wait_for(|e| matches!(e, RoomEvent::EnterRoomFailed { .. }))
        .await;
    assert!(matches!(
        event,
        RoomEvent::EnterRoomFailed { code, .. } if code == codes::ERR_USER_SIG_INVALID
    ));
    eventually("session back to idle", || alice.engine.room_state() == RoomState::Idle).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_enter_timeout() {
    let config = roomlink::EngineConfig {
        enter_room_timeout_ms: 100,
        ..test_config()
    };
    let engine = RoomEngine::new(
        config,
        Arc::new(SilentConnector),
        Arc::new(VirtualDeviceBackend::new()),
    )
    .unwrap();
    let mut events = engine.subscribe();

    engine.enter_room(params("alice"), AppScene::Live).unwrap();
    let event = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(event @ RoomEvent::EnterRoomFailed { .. }) = events.recv().await {
                return event;
            }
        }
    })
    .await
    .expect("enter should time out");
    assert!(matches!(
        event,
        RoomEvent::EnterRoomFailed { code, .. } if code == codes::ERR_ENTER_ROOM_TIMEOUT
    ));
    assert_eq!(engine.room_state(), RoomState::Idle);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_exit_while_entering_discards_connection() {
    let relay = MemoryRelay::new();
    let engine = RoomEngine::new(
        test_config(),
        Arc::new(SlowConnector {
            relay: relay.clone(),
            delay: Duration::from_millis(200),
        }),
        Arc::new(VirtualDeviceBackend::new()),
    )
    .unwrap();
    let recorder = Arc::new(common::Recorder::default());
    engine.add_observer(recorder.clone());

    engine.enter_room(params("alice"), AppScene::VideoCall).unwrap();
    assert_eq!(engine.room_state(), RoomState::Entering);
    engine.exit_room();
    assert_eq!(engine.room_state(), RoomState::Idle);

    tokio::time::sleep(Duration::from_millis(400)).await;
    engine.flush().await;
    assert_eq!(recorder.count(|e| matches!(e, RoomEvent::EnterRoom { .. })), 0);
    assert_eq!(recorder.count(|e| matches!(e, RoomEvent::ExitRoom { .. })), 1);
    assert!(relay.members(ROOM_ID).is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_exit_from_idle_emits_nothing() {
    let relay = MemoryRelay::new();
    let alice = peer(&relay, "alice");

    alice.engine.exit_room();
    alice.engine.flush().await;
    assert!(alice.events.events().iter().all(|e| !matches!(e, RoomEvent::ExitRoom { .. })));
    assert_eq!(alice.engine.room_state(), RoomState::Idle);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_membership_events() {
    let relay = MemoryRelay::new();
    let alice = peer(&relay, "alice");
    let bob = peer(&relay, "bob");
    alice.join().await;
    bob.join().await;

    alice
        .events
        .wait_for(|e| matches!(e, RoomEvent::UserEnter { user_id } if user_id == "bob"))
        .await;
    assert_eq!(bob.engine.participants().len(), 1);

    bob.engine.start_local_audio();
    alice
        .events
        .wait_for(|e| {
            matches!(e, RoomEvent::UserAudioAvailable { user_id, available: true } if user_id == "bob")
        })
        .await;

    bob.engine.exit_room();
    alice
        .events
        .wait_for(|e| matches!(e, RoomEvent::UserExit { user_id, .. } if user_id == "bob"))
        .await;
    eventually("bob removed", || alice.engine.participants().is_empty()).await;
    assert!(!bob.engine.is_mic_active());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_reconnect_resyncs_participants() {
    let relay = MemoryRelay::new();
    let alice = peer(&relay, "alice");
    let bob = peer(&relay, "bob");
    alice.join().await;
    bob.join().await;
    eventually("bob visible", || alice.engine.participants().len() == 1).await;

    assert!(relay.interrupt(ROOM_ID, "alice"));
    alice
        .events
        .wait_for(|e| matches!(e, RoomEvent::ConnectionRecovery))
        .await;
    alice.engine.flush().await;

    let events = alice.events.events();
    let lost = events.iter().position(|e| matches!(e, RoomEvent::ConnectionLost));
    let retry = events
        .iter()
        .position(|e| matches!(e, RoomEvent::TryToReconnect { attempt: 1 }));
    let recovered = events.iter().position(|e| matches!(e, RoomEvent::ConnectionRecovery));
    assert!(lost < retry && retry < recovered);
    assert_eq!(alice.engine.room_state(), RoomState::Joined);
    assert_eq!(alice.engine.participants().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_displaced_session_reports_reason() {
    let relay = MemoryRelay::new();
    let first = peer(&relay, "alice");
    let second = peer(&relay, "alice");
    first.join().await;
    second.join().await;

    first
        .events
        .wait_for(|e| matches!(e, RoomEvent::Error { code, .. } if *code == codes::ERR_USER_DISPLACED))
        .await;
    assert_eq!(first.engine.room_state(), RoomState::Error);
    assert_eq!(second.engine.room_state(), RoomState::Joined);

    first.engine.exit_room();
    first
        .events
        .wait_for(|e| *e == RoomEvent::ExitRoom { reason: ExitReason::Displaced })
        .await;
    assert_eq!(first.engine.room_state(), RoomState::Idle);
    assert_eq!(relay.members(ROOM_ID), vec!["alice".to_string()]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_statistics_and_network_quality() {
    let relay = MemoryRelay::new();
    let alice = peer_with_config(&relay, "alice", test_config());
    alice.join().await;

    alice
        .events
        .wait_for(|e| matches!(e, RoomEvent::Statistics(_)))
        .await;

    assert!(relay.set_network_quality(ROOM_ID, "alice", roomlink::signaling::Quality::Poor));
    alice
        .events
        .wait_for(|e| {
            matches!(e, RoomEvent::NetworkQuality { local, .. } if *local == roomlink::signaling::Quality::Poor)
        })
        .await;
}
