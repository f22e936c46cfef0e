//! Geräteverwaltung, Gerätetests, Speed Test und Beobachter

mod common;

use common::{eventually, peer, FrameCounter, Recorder, APP_ID};
use roomlink::config::DebugViewMode;
use roomlink::devices::DeviceState;
use roomlink::{codes, DeviceKind, MemoryRelay, RoomEvent, RoomObserver};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_device_selection_and_volume() {
    let relay = MemoryRelay::new();
    let alice = peer(&relay, "alice");

    let cameras = alice.engine.get_devices(DeviceKind::Camera);
    assert_eq!(cameras.len(), 2);
    alice
        .engine
        .set_current_device(DeviceKind::Camera, &cameras[1].id)
        .unwrap();
    assert_eq!(
        alice.engine.current_device(DeviceKind::Camera).map(|d| d.id),
        Some(cameras[1].id.clone())
    );

    let err = alice
        .engine
        .set_current_device(DeviceKind::Microphone, "no-such-mic")
        .unwrap_err();
    assert_eq!(err.code(), codes::ERR_DEVICE_NOT_FOUND);

    alice
        .engine
        .set_current_device_volume(DeviceKind::Speaker, 40)
        .unwrap();
    assert_eq!(alice.engine.current_device_volume(DeviceKind::Speaker), Some(40));
    let err = alice
        .engine
        .set_current_device_volume(DeviceKind::Camera, 40)
        .unwrap_err();
    assert_eq!(err.code(), codes::ERR_INVALID_PARAMETER);
    assert_eq!(alice.engine.current_device_volume(DeviceKind::Camera), None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_hotplug_is_reported() {
    let relay = MemoryRelay::new();
    let alice = peer(&relay, "alice");

    alice.devices.plug(DeviceKind::Microphone, "usb-mic", "USB Microphone");
    alice
        .events
        .wait_for(|e| {
            matches!(e, RoomEvent::DeviceChange { device_id, state: DeviceState::Added, .. } if device_id == "usb-mic")
        })
        .await;
    assert!(alice
        .engine
        .get_devices(DeviceKind::Microphone)
        .iter()
        .any(|d| d.id == "usb-mic"));

    alice.devices.unplug(DeviceKind::Microphone, "usb-mic");
    alice
        .events
        .wait_for(|e| {
            matches!(e, RoomEvent::DeviceChange { device_id, state: DeviceState::Removed, .. } if device_id == "usb-mic")
        })
        .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_camera_device_test_renders_without_room() {
    let relay = MemoryRelay::new();
    let alice = peer(&relay, "alice");

    let counter = Arc::new(FrameCounter::default());
    alice.engine.start_camera_device_test(counter.clone());
    alice.events.wait_for(|e| matches!(e, RoomEvent::CameraDidReady)).await;
    eventually("test frames", || counter.frames() >= 2).await;
    assert!(!alice.engine.is_camera_active());

    alice.engine.stop_camera_device_test();
    let stopped = counter.frames();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(counter.frames(), stopped);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_mic_device_test_reports_level() {
    let relay = MemoryRelay::new();
    let alice = peer(&relay, "alice");

    alice.engine.start_mic_device_test(100);
    alice
        .events
        .wait_for(|e| matches!(e, RoomEvent::TestMicVolume { volume } if *volume > 0))
        .await;
    alice.engine.stop_mic_device_test();

    alice.events.clear();
    tokio::time::sleep(Duration::from_millis(250)).await;
    alice.engine.flush().await;
    assert_eq!(
        alice.events.count(|e| matches!(e, RoomEvent::TestMicVolume { .. })),
        0
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_volume_evaluation() {
    let relay = MemoryRelay::new();
    let alice = peer(&relay, "alice");
    alice.join().await;
    alice.engine.start_local_audio();
    alice.events.wait_for(|e| matches!(e, RoomEvent::MicDidReady)).await;

    alice.engine.enable_audio_volume_evaluation(100, 3);
    let event = alice
        .events
        .wait_for(|e| matches!(e, RoomEvent::UserVoiceVolume { total, .. } if *total > 0))
        .await;
    let RoomEvent::UserVoiceVolume { volumes, .. } = event else {
        unreachable!()
    };
    assert_eq!(volumes[0].user_id, "");

    alice.engine.enable_audio_volume_evaluation(0, 3);
    alice.events.clear();
    tokio::time::sleep(Duration::from_millis(250)).await;
    alice.engine.flush().await;
    assert_eq!(
        alice.events.count(|e| matches!(e, RoomEvent::UserVoiceVolume { .. })),
        0
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_speed_test_reports_each_round() {
    let relay = MemoryRelay::new();
    let alice = peer(&relay, "alice");

    let err = alice.engine.start_speed_test(0, "alice", "sig").unwrap_err();
    assert_eq!(err.code(), codes::ERR_SDK_APPID_INVALID);

    alice.engine.start_speed_test(APP_ID, "alice", "sig").unwrap();
    alice
        .events
        .wait_for(|e| matches!(e, RoomEvent::SpeedTest { finished: 3, .. }))
        .await;

    let rounds: Vec<(u32, u32)> = alice
        .events
        .events()
        .iter()
        .filter_map(|e| match e {
            RoomEvent::SpeedTest {
                result,
                finished,
                total,
            } => {
                assert_eq!(result.ip, "127.0.0.1");
                Some((*finished, *total))
            }
            _ => None,
        })
        .collect();
    assert_eq!(rounds, vec![(1, 3), (2, 3), (3, 3)]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_speed_test_rejected_signature_warns() {
    let relay = MemoryRelay::new();
    relay.reject_user_sig("expired");
    let alice = peer(&relay, "alice");

    alice.engine.start_speed_test(APP_ID, "alice", "expired").unwrap();
    alice
        .events
        .wait_for(|e| {
            matches!(e, RoomEvent::Warning { code, .. } if *code == codes::ERR_USER_SIG_INVALID)
        })
        .await;
    assert_eq!(
        alice.events.count(|e| matches!(e, RoomEvent::SpeedTest { .. })),
        0
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_removed_observer_gets_nothing() {
    let relay = MemoryRelay::new();
    let alice = peer(&relay, "alice");
    let extra = Arc::new(Recorder::default());
    let observer: Arc<dyn RoomObserver> = extra.clone();
    alice.engine.add_observer(observer.clone());

    alice.join().await;
    alice.engine.flush().await;
    assert!(extra.count(|e| matches!(e, RoomEvent::EnterRoom { .. })) == 1);

    alice.engine.remove_observer(&observer);
    let seen = extra.events().len();
    alice.engine.exit_room();
    alice.engine.flush().await;
    assert_eq!(extra.events().len(), seen);
    assert_eq!(
        alice.events.count(|e| matches!(e, RoomEvent::ExitRoom { .. })),
        1
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_event_stream_subscription() {
    let relay = MemoryRelay::new();
    let alice = peer(&relay, "alice");
    let mut stream = alice.engine.subscribe();

    alice.join().await;
    let first = tokio::time::timeout(Duration::from_secs(5), stream.recv())
        .await
        .expect("event")
        .expect("open stream");
    assert!(matches!(first, RoomEvent::EnterRoom { .. }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_debug_view_levels() {
    let relay = MemoryRelay::new();
    let alice = peer(&relay, "alice");
    assert_eq!(alice.engine.debug_view(), DebugViewMode::Hidden);

    alice.engine.show_debug_view(2);
    assert_eq!(alice.engine.debug_view(), DebugViewMode::Full);
    alice.join().await;
    alice
        .events
        .wait_for(|e| matches!(e, RoomEvent::Statistics(_)))
        .await;

    alice.engine.show_debug_view(1);
    assert_eq!(alice.engine.debug_view(), DebugViewMode::Summary);
    assert!(!roomlink::sdk_version().is_empty());
}
