//! Callback Module - Event-Modell und Verteilung an Beobachter

mod dispatcher;
mod events;

pub use dispatcher::{CallbackDispatcher, EventEmitter, RoomObserver};
pub use events::{
    ExitReason, LocalStatistics, RemoteStatistics, RoomEvent, SpeedTestResult, Statistics,
    VolumeInfo,
};
