//! RoomLink - Room Session & Media Engine
//!
//! Eine Engine für Mehrparteien-Räume mit:
//! - Raum-Sitzung mit Teilnehmerliste und Reconnect-Abgleich
//! - Lokalen Tracks (Kamera, Mikrofon, Bildschirm) mit Dual-Stream
//! - Abonnements entfernter Streams mit Big/Small-Umschaltung
//! - Custom Messages mit Rate Limit, Retransmit und Reihenfolge
//! - CDN-Weiterleitung und Mix-Layouts
//! - Beobachter-Callbacks auf einem eigenen Dispatch-Thread
//!
//! Transport und Geräte sind austauschbar: [`signaling::SignalingClient`]
//! spricht WebSocket mit einem Relay, [`signaling::MemoryRelay`] und
//! [`devices::VirtualDeviceBackend`] laufen komplett im Prozess.

pub mod callback;
pub mod cdn;
pub mod config;
pub mod devices;
pub mod engine;
pub mod error;
pub mod media;
pub mod messaging;
pub mod session;
pub mod signaling;

pub use callback::{ExitReason, RoomEvent, RoomObserver, Statistics};
pub use config::{EngineConfig, LogConfig, LogLevel};
pub use devices::{DeviceBackend, DeviceKind, VirtualDeviceBackend};
pub use engine::{sdk_version, RoomEngine};
pub use error::{codes, EngineError, EngineResult};
pub use session::{AppScene, EnterRoomParams, RoomState};
pub use signaling::{MemoryRelay, SignalingClient, TransportConnector};
