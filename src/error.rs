//! Fehler-Taxonomie der Engine
//!
//! Jeder Komponentenfehler wird in [`EngineError`] gefaltet. Synchrone Aufrufe
//! geben den Fehler direkt zurück, asynchrone Fehler laufen als Event mit dem
//! numerischen Code aus [`codes`] über den Callback Dispatcher.

use crate::cdn::CdnError;
use crate::config::ConfigError;
use crate::devices::DeviceError;
use crate::messaging::MessageError;
use crate::signaling::SignalingError;
use thiserror::Error;

// ============================================================================
// STATUS CODES
// ============================================================================

/// Numerische Status-Codes (0 = Erfolg, negativ = Fehler, positiv = Warnung)
pub mod codes {
    pub const OK: i32 = 0;

    // Allgemeine Parameter- und Ressourcenfehler
    pub const ERR_INVALID_PARAMETER: i32 = -1;
    pub const ERR_TRACK_NOT_FOUND: i32 = -2;
    pub const ERR_UNSUPPORTED_FORMAT: i32 = -3;
    pub const ERR_INVALID_STATE: i32 = -4;

    // Geräte
    pub const ERR_CAMERA_START_FAIL: i32 = -1301;
    pub const ERR_MIC_START_FAIL: i32 = -1302;
    pub const ERR_SPEAKER_START_FAIL: i32 = -1321;
    pub const ERR_DEVICE_NOT_FOUND: i32 = -1303;
    pub const ERR_SCREEN_CAPTURE_START_FAIL: i32 = -1308;
    pub const ERR_SCREEN_CAPTURE_NO_TARGET: i32 = -1309;

    // Video-Konfiguration
    pub const ERR_VIDEO_ENC_PARAM_INVALID: i32 = -1310;
    pub const ERR_SMALL_STREAM_ASPECT_RATIO: i32 = -1311;

    // Raum
    pub const ERR_ROOM_ENTER_FAIL: i32 = -3301;
    pub const ERR_ENTER_ROOM_TIMEOUT: i32 = -3308;
    pub const ERR_ENTER_ROOM_PARAM_NULL: i32 = -3316;
    pub const ERR_SDK_APPID_INVALID: i32 = -3317;
    pub const ERR_ROOM_ID_INVALID: i32 = -3318;
    pub const ERR_USER_ID_INVALID: i32 = -3319;
    pub const ERR_USER_SIG_INVALID: i32 = -3320;
    pub const ERR_ALREADY_IN_ROOM: i32 = -3325;
    pub const ERR_NOT_IN_ROOM: i32 = -3326;
    pub const ERR_CONNECTION_LOST: i32 = -3330;
    pub const ERR_SEND_FAILED: i32 = -3331;
    pub const ERR_USER_DISPLACED: i32 = -3332;

    // Custom Messages
    pub const ERR_CUSTOM_MSG_CMD_ID: i32 = -3350;
    pub const ERR_CUSTOM_MSG_TOO_LARGE: i32 = -3351;
    pub const ERR_CUSTOM_MSG_FLAGS: i32 = -3352;
    pub const ERR_CUSTOM_MSG_RATE_LIMITED: i32 = -3353;
    pub const ERR_CUSTOM_MSG_QUEUE_FULL: i32 = -3354;
    pub const ERR_CUSTOM_MSG_MISSED: i32 = -3355;

    // CDN
    pub const ERR_PUBLISH_CDN_STREAM_FAILED: i32 = -3360;
    pub const ERR_MIX_TRANSCODING_INVALID: i32 = -3361;

    // Warnungen
    pub const WARNING_RECONNECTING: i32 = 1101;
    pub const WARNING_REMOTE_TRACK_ERROR: i32 = 1102;
    pub const WARNING_MESSAGE_RETRY_EXHAUSTED: i32 = 1103;
}

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("A room session is already open")]
    AlreadyInRoom,

    #[error("No room session is open")]
    NotInRoom,

    #[error("Invalid parameter ({code}): {reason}")]
    InvalidParams { code: i32, reason: String },

    #[error(
        "Small stream aspect ratio {small_w}x{small_h} does not match primary {big_w}x{big_h}"
    )]
    AspectRatioMismatch {
        big_w: u32,
        big_h: u32,
        small_w: u32,
        small_h: u32,
    },

    #[error("Track not found: {0}")]
    TrackNotFound(String),

    #[error("Unsupported render format combination")]
    UnsupportedRenderFormat,

    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),

    #[error("Custom message rejected: {0}")]
    Message(#[from] MessageError),

    #[error("CDN relay error: {0}")]
    Cdn(#[from] CdnError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl EngineError {
    pub fn invalid(code: i32, reason: impl Into<String>) -> Self {
        EngineError::InvalidParams {
            code,
            reason: reason.into(),
        }
    }

    /// Stabiler numerischer Code für Events und Status-Rückgaben
    pub fn code(&self) -> i32 {
        match self {
            EngineError::AlreadyInRoom => codes::ERR_ALREADY_IN_ROOM,
            EngineError::NotInRoom => codes::ERR_NOT_IN_ROOM,
            EngineError::InvalidParams { code, .. } => *code,
            EngineError::AspectRatioMismatch { .. } => codes::ERR_SMALL_STREAM_ASPECT_RATIO,
            EngineError::TrackNotFound(_) => codes::ERR_TRACK_NOT_FOUND,
            EngineError::UnsupportedRenderFormat => codes::ERR_UNSUPPORTED_FORMAT,
            EngineError::Device(e) => e.code(),
            EngineError::Signaling(e) => e.code(),
            EngineError::Message(e) => e.code(),
            EngineError::Cdn(e) => e.code(),
            EngineError::Config(_) => codes::ERR_INVALID_PARAMETER,
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
