//! Sitzungs-Datenmodell: Zustände, Enter-Parameter, Teilnehmer

use crate::error::{codes, EngineError};
use crate::media::StreamType;
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Maximale Länge einer Nutzer-ID in Bytes
pub const MAX_USER_ID_LEN: usize = 32;

// ============================================================================
// ROOM STATE
// ============================================================================

/// Lebenszyklus einer Raum-Sitzung
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RoomState {
    #[default]
    Idle,
    Entering,
    Joined,
    Exiting,
    /// Unbehebbarer Transportfehler, der Aufrufer muss `exit_room` aufrufen
    Error,
}

/// Szenario beim Betreten eines Raums
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AppScene {
    /// Interaktiver Videoanruf
    #[default]
    VideoCall,
    /// One-to-many Übertragung
    Live,
}

// ============================================================================
// ENTER PARAMETERS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EnterRoomParams {
    pub sdk_app_id: u32,
    pub user_id: String,
    pub user_sig: String,
    pub room_id: u32,
    /// Berechtigungsschlüssel für geschützte Räume
    pub private_map_key: Option<String>,
    /// Freie Zusatzinformationen für das Relay
    pub business_info: Option<String>,
    /// Eigene Stream-ID für das direkte CDN-Relay
    pub stream_id: Option<String>,
}

impl EnterRoomParams {
    pub fn new(sdk_app_id: u32, room_id: u32, user_id: impl Into<String>, user_sig: impl Into<String>) -> Self {
        Self {
            sdk_app_id,
            room_id,
            user_id: user_id.into(),
            user_sig: user_sig.into(),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.sdk_app_id == 0 {
            return Err(EngineError::invalid(
                codes::ERR_SDK_APPID_INVALID,
                "sdk_app_id must not be 0",
            ));
        }
        if self.room_id == 0 {
            return Err(EngineError::invalid(
                codes::ERR_ROOM_ID_INVALID,
                "room_id must not be 0",
            ));
        }
        if self.user_id.is_empty() || self.user_id.len() > MAX_USER_ID_LEN {
            return Err(EngineError::invalid(
                codes::ERR_USER_ID_INVALID,
                format!("user_id must be 1..={} bytes", MAX_USER_ID_LEN),
            ));
        }
        if !self
            .user_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(EngineError::invalid(
                codes::ERR_USER_ID_INVALID,
                format!("user_id contains invalid characters: {}", self.user_id),
            ));
        }
        if self.user_sig.is_empty() {
            return Err(EngineError::invalid(
                codes::ERR_USER_SIG_INVALID,
                "user_sig must not be empty",
            ));
        }
        Ok(())
    }
}

// ============================================================================
// REMOTE PARTICIPANT
// ============================================================================

/// Ein sichtbarer Teilnehmer im Raum
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteParticipant {
    pub user_id: String,
    pub audio_available: bool,
    pub video_available: bool,
    pub small_video_available: bool,
    pub sub_stream_available: bool,
    /// Aktuell abonnierte Stufe des Hauptstreams
    pub stream_tier: Option<StreamType>,
    pub joined_at: Instant,
}

impl RemoteParticipant {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            audio_available: false,
            video_available: false,
            small_video_available: false,
            sub_stream_available: false,
            stream_tier: None,
            joined_at: Instant::now(),
        }
    }

    /// Verfügbarkeit einer Stream-Stufe
    pub fn has_stream(&self, stream: StreamType) -> bool {
        match stream {
            StreamType::Big => self.video_available,
            StreamType::Small => self.video_available && self.small_video_available,
            StreamType::Sub => self.sub_stream_available,
        }
    }
}

/// Änderung an der Teilnehmerliste
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParticipantUpdate {
    Entered { user_id: String },
    Left { user_id: String, reason: u32 },
    AudioAvailable { user_id: String, available: bool },
    VideoAvailable { user_id: String, available: bool },
    SmallVideoAvailable { user_id: String, available: bool },
    SubStreamAvailable { user_id: String, available: bool },
}

impl ParticipantUpdate {
    pub fn user_id(&self) -> &str {
        match self {
            ParticipantUpdate::Entered { user_id }
            | ParticipantUpdate::Left { user_id, .. }
            | ParticipantUpdate::AudioAvailable { user_id, .. }
            | ParticipantUpdate::VideoAvailable { user_id, .. }
            | ParticipantUpdate::SmallVideoAvailable { user_id, .. }
            | ParticipantUpdate::SubStreamAvailable { user_id, .. } => user_id,
        }
    }
}
