//! Signaling Module - Transport Channel zum Relay-Dienst
//!
//! Dieses Modul verwaltet die Verbindung einer Raum-Sitzung:
//! - Wire-Format (JSON, getaggte Nachrichten)
//! - Transport-Abstraktion für die Engine
//! - WebSocket-Client mit Heartbeat und Reconnect
//! - In-Process Relay für Tests und Headless-Betrieb

mod client;
mod memory;
mod messages;
mod transport;

pub use client::SignalingClient;
pub use memory::MemoryRelay;
pub use messages::*;
pub use transport::{
    Credentials, SignalingError, TransportConnector, TransportEvent, TransportLink,
    TransportSession,
};
