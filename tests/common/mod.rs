//! Gemeinsame Hilfen für die Integrationstests

#![allow(dead_code)]

use parking_lot::Mutex;
use roomlink::media::{VideoFrame, VideoRenderer, ViewTransform};
use roomlink::{
    AppScene, EngineConfig, EnterRoomParams, MemoryRelay, RoomEngine, RoomEvent, RoomObserver,
    VirtualDeviceBackend,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const APP_ID: u32 = 1400;
pub const ROOM_ID: u32 = 4242;
pub const WAIT: Duration = Duration::from_secs(5);

/// Sammelt alle Events eines Beobachters
#[derive(Default)]
pub struct Recorder {
    events: Mutex<Vec<RoomEvent>>,
}

impl RoomObserver for Recorder {
    fn on_event(&self, event: &RoomEvent) {
        self.events.lock().push(event.clone());
    }
}

impl Recorder {
    pub fn events(&self) -> Vec<RoomEvent> {
        self.events.lock().clone()
    }

    pub fn count(&self, pred: impl Fn(&RoomEvent) -> bool) -> usize {
        self.events.lock().iter().filter(|e| pred(*e)).count()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }

    /// Wartet auf das erste passende Event
    pub async fn wait_for(&self, pred: impl Fn(&RoomEvent) -> bool) -> RoomEvent {
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            if let Some(event) = self.events.lock().iter().find(|e| pred(*e)) {
                return event.clone();
            }
            if tokio::time::Instant::now() > deadline {
                panic!("event not observed, got: {:?}", self.names());
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Wartet, bis mindestens `n` passende Events aufgezeichnet sind
    pub async fn wait_for_count(&self, n: usize, pred: impl Fn(&RoomEvent) -> bool) {
        let deadline = tokio::time::Instant::now() + WAIT;
        while self.count(&pred) < n {
            if tokio::time::Instant::now() > deadline {
                panic!("expected {n} events, got: {:?}", self.names());
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn names(&self) -> Vec<&'static str> {
        self.events.lock().iter().map(|e| e.name()).collect()
    }
}

/// Zählt gerenderte Bilder
#[derive(Default)]
pub struct FrameCounter {
    frames: AtomicU64,
    last_width: AtomicU64,
}

impl VideoRenderer for FrameCounter {
    fn render(&self, frame: &VideoFrame, _transform: &ViewTransform) {
        self.last_width.store(frame.width as u64, Ordering::Relaxed);
        self.frames.fetch_add(1, Ordering::Relaxed);
    }
}

impl FrameCounter {
    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    pub fn last_width(&self) -> u64 {
        self.last_width.load(Ordering::Relaxed)
    }
}

pub struct Peer {
    pub engine: RoomEngine,
    pub events: Arc<Recorder>,
    pub devices: Arc<VirtualDeviceBackend>,
    pub user_id: String,
}

pub fn test_config() -> EngineConfig {
    EngineConfig {
        statistics_interval_ms: 100,
        ..EngineConfig::default()
    }
}

pub fn peer(relay: &MemoryRelay, user_id: &str) -> Peer {
    peer_with_config(relay, user_id, test_config())
}

pub fn peer_with_config(relay: &MemoryRelay, user_id: &str, config: EngineConfig) -> Peer {
    let devices = Arc::new(VirtualDeviceBackend::new());
    let engine = RoomEngine::new(config, Arc::new(relay.clone()), devices.clone())
        .expect("engine");
    let events = Arc::new(Recorder::default());
    engine.add_observer(events.clone());
    Peer {
        engine,
        events,
        devices,
        user_id: user_id.to_string(),
    }
}

pub fn params(user_id: &str) -> EnterRoomParams {
    EnterRoomParams::new(APP_ID, ROOM_ID, user_id, format!("sig-{user_id}"))
}

impl Peer {
    /// Tritt bei und wartet auf das neue `EnterRoom`, auch nach früheren Beitritten
    pub async fn join(&self) {
        let entered = |e: &RoomEvent| matches!(e, RoomEvent::EnterRoom { .. });
        let before = self.events.count(entered);
        self.engine
            .enter_room(params(&self.user_id), AppScene::VideoCall)
            .expect("enter_room");
        self.events.wait_for_count(before + 1, entered).await;
    }
}

/// Wartet, bis `cond` gilt
pub async fn eventually(what: &str, cond: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !cond() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
