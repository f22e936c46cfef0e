//! Engine Module - Room Engine
//!
//! Verbindet Sitzung, Medien, Custom Messages und CDN-Relay hinter einer
//! Fassade. Der Zustand liegt unter einem Lock; Relay-Events, Timer und
//! Geräte laufen als Tasks auf der Tokio-Runtime des Aufrufers.

mod state;
mod devices;
#[allow(clippy::module_inception)]
mod engine;

pub use engine::{sdk_version, RoomEngine};
