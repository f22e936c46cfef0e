//! Transport Channel - Abstraktion über die Relay-Verbindung
//!
//! Die Engine kennt nur [`TransportConnector`] und [`TransportLink`]. Konkrete
//! Implementierungen sind der WebSocket-Client und das In-Process-Relay.

use super::messages::{ClientMessage, ServerMessage, UserInfo};
use crate::error::codes;
use crate::session::{AppScene, EnterRoomParams};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SignalingError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Not connected to relay")]
    NotConnected,

    #[error("Failed to send message: {0}")]
    SendFailed(String),

    #[error("Timed out waiting for the relay")]
    Timeout,

    #[error("Server error: {code} - {message}")]
    ServerError { code: i32, message: String },

    #[error("Reconnect gave up after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },
}

impl SignalingError {
    pub fn code(&self) -> i32 {
        match self {
            SignalingError::ConnectionFailed(_) => codes::ERR_ROOM_ENTER_FAIL,
            SignalingError::NotConnected => codes::ERR_CONNECTION_LOST,
            SignalingError::SendFailed(_) => codes::ERR_SEND_FAILED,
            SignalingError::Timeout => codes::ERR_ENTER_ROOM_TIMEOUT,
            SignalingError::ServerError { code, .. } => *code,
            SignalingError::ReconnectExhausted { .. } => codes::ERR_CONNECTION_LOST,
        }
    }
}

// ============================================================================
// CREDENTIALS
// ============================================================================

/// Alles was das Relay zur Authentifizierung braucht
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub sdk_app_id: u32,
    pub room_id: u32,
    pub user_id: String,
    pub user_sig: String,
    pub scene: AppScene,
    pub private_map_key: Option<String>,
    pub business_info: Option<String>,
    pub probe: bool,
}

impl Credentials {
    pub fn for_room(params: &EnterRoomParams, scene: AppScene) -> Self {
        Self {
            sdk_app_id: params.sdk_app_id,
            room_id: params.room_id,
            user_id: params.user_id.clone(),
            user_sig: params.user_sig.clone(),
            scene,
            private_map_key: params.private_map_key.clone(),
            business_info: params.business_info.clone(),
            probe: false,
        }
    }

    /// Credentials für eine Speed-Test-Verbindung
    pub fn probe(sdk_app_id: u32, user_id: &str, user_sig: &str) -> Self {
        Self {
            sdk_app_id,
            room_id: 0,
            user_id: user_id.to_string(),
            user_sig: user_sig.to_string(),
            scene: AppScene::VideoCall,
            private_map_key: None,
            business_info: None,
            probe: true,
        }
    }

    /// Erster Frame einer Verbindung
    pub fn enter_message(&self, resume: bool) -> ClientMessage {
        ClientMessage::EnterRoom {
            sdk_app_id: self.sdk_app_id,
            room_id: self.room_id,
            user_id: self.user_id.clone(),
            user_sig: self.user_sig.clone(),
            scene: self.scene,
            private_map_key: self.private_map_key.clone(),
            business_info: self.business_info.clone(),
            resume,
            probe: self.probe,
        }
    }
}

// ============================================================================
// TRANSPORT EVENTS
// ============================================================================

/// Events die eine Transport-Sitzung nach oben meldet
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Message(ServerMessage),

    /// Verbindung unterbrochen, Reconnect läuft
    ConnectionLost,

    Reconnecting { attempt: u32 },

    /// Verbindung wiederhergestellt, mit aktuellem Teilnehmer-Snapshot
    ConnectionRecovered { users: Vec<UserInfo> },

    /// Endgültig beendet. `error: None` = regulär geschlossen
    Closed { error: Option<SignalingError> },
}

// ============================================================================
// TRAITS
// ============================================================================

/// Sende-Seite einer offenen Transport-Sitzung
pub trait TransportLink: Send + Sync {
    /// Reiht eine Nachricht ein, blockiert nie
    fn send(&self, msg: ClientMessage) -> Result<(), SignalingError>;

    /// Schließt die Sitzung. Weitere Aufrufe sind wirkungslos.
    fn close(&self);

    fn is_connected(&self) -> bool;
}

/// Ergebnis eines erfolgreichen Verbindungsaufbaus
pub struct TransportSession {
    pub link: Arc<dyn TransportLink>,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
    /// Teilnehmer die beim Betreten bereits im Raum waren
    pub users: Vec<UserInfo>,
}

impl std::fmt::Debug for TransportSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportSession")
            .field("connected", &self.link.is_connected())
            .field("users", &self.users)
            .finish()
    }
}

/// Baut authentifizierte Transport-Sitzungen auf
#[async_trait]
pub trait TransportConnector: Send + Sync {
    /// Verbindet und authentifiziert. Kehrt erst nach `room_entered` zurück.
    async fn connect(&self, credentials: Credentials) -> Result<TransportSession, SignalingError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(SignalingError::Timeout.code(), codes::ERR_ENTER_ROOM_TIMEOUT);
        assert_eq!(
            SignalingError::ServerError {
                code: codes::ERR_USER_SIG_INVALID,
                message: "bad sig".into()
            }
            .code(),
            codes::ERR_USER_SIG_INVALID
        );
        assert!(SignalingError::ReconnectExhausted { attempts: 5 }.code() < 0);
    }

    #[test]
    fn test_probe_credentials() {
        let creds = Credentials::probe(1400000001, "alice", "sig");
        match creds.enter_message(false) {
            ClientMessage::EnterRoom { probe, room_id, .. } => {
                assert!(probe);
                assert_eq!(room_id, 0);
            }
            other => panic!("unexpected message {other:?}"),
        }
    }
}
