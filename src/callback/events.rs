//! Event-Modell für Beobachter

use crate::devices::{DeviceKind, DeviceState};
use crate::media::StreamType;
use crate::signaling::{Quality, RemoteQuality};
use serde::Serialize;

/// Grund für das Verlassen eines Raums
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    /// `exit_room` wurde aufgerufen
    Requested,
    /// Dieselbe Nutzer-Id hat sich anderswo angemeldet
    Displaced,
    /// Verbindung nach allen Reconnect-Versuchen verloren
    ConnectionFailed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalStatistics {
    pub stream: StreamType,
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    pub video_bitrate_kbps: u32,
    pub frames_sent: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteStatistics {
    pub user_id: String,
    pub stream: StreamType,
    pub width: u32,
    pub height: u32,
    pub frames_received: u64,
    pub audio_frames_received: u64,
}

/// Periodischer Statistik-Report
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Statistics {
    pub rtt_ms: u32,
    pub sent_bytes: u64,
    pub received_bytes: u64,
    pub local: Vec<LocalStatistics>,
    pub remote: Vec<RemoteStatistics>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeInfo {
    /// Leer für den lokalen Nutzer
    pub user_id: String,
    pub volume: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeedTestResult {
    pub ip: String,
    pub quality: Quality,
    pub upload_loss: f32,
    pub download_loss: f32,
    pub rtt_ms: u32,
}

/// Alle Events, die die Engine an Beobachter liefert
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum RoomEvent {
    // ------------------------------------------------------------------------
    // Raum-Lebenszyklus
    // ------------------------------------------------------------------------
    EnterRoom { elapsed_ms: u64 },
    EnterRoomFailed { code: i32, message: String },
    ExitRoom { reason: ExitReason },
    Error { code: i32, message: String },
    Warning { code: i32, message: String },
    ConnectionLost,
    TryToReconnect { attempt: u32 },
    ConnectionRecovery,

    // ------------------------------------------------------------------------
    // Teilnehmer
    // ------------------------------------------------------------------------
    UserEnter { user_id: String },
    UserExit { user_id: String, reason: u32 },
    UserVideoAvailable { user_id: String, available: bool },
    UserSubStreamAvailable { user_id: String, available: bool },
    UserAudioAvailable { user_id: String, available: bool },
    /// `user_id` leer = lokales Vorschaubild
    FirstVideoFrame {
        user_id: String,
        stream: StreamType,
        width: u32,
        height: u32,
    },
    FirstAudioFrame { user_id: String },

    // ------------------------------------------------------------------------
    // Qualität und Pegel
    // ------------------------------------------------------------------------
    NetworkQuality {
        local: Quality,
        remote: Vec<RemoteQuality>,
    },
    Statistics(Statistics),
    UserVoiceVolume { volumes: Vec<VolumeInfo>, total: u32 },

    // ------------------------------------------------------------------------
    // Custom Messages
    // ------------------------------------------------------------------------
    RecvCustomCmdMsg {
        user_id: String,
        cmd_id: u32,
        seq: u32,
        data: Vec<u8>,
    },
    MissCustomCmdMsg {
        user_id: String,
        cmd_id: u32,
        error_code: i32,
        missed: u32,
    },

    // ------------------------------------------------------------------------
    // CDN
    // ------------------------------------------------------------------------
    StartPublishCdnStream { code: i32, message: String },
    StopPublishCdnStream { code: i32, message: String },
    SetMixTranscodingConfig { code: i32, message: String },

    // ------------------------------------------------------------------------
    // Geräte und Tests
    // ------------------------------------------------------------------------
    SpeedTest {
        result: SpeedTestResult,
        finished: u32,
        total: u32,
    },
    TestMicVolume { volume: u32 },
    CameraDidReady,
    MicDidReady,
    DeviceChange {
        device_id: String,
        kind: DeviceKind,
        state: DeviceState,
    },
    ScreenCaptureStarted,
    ScreenCapturePaused,
    ScreenCaptureResumed,
    ScreenCaptureStopped { reason: i32 },
}

impl RoomEvent {
    /// Name für Logs
    pub fn name(&self) -> &'static str {
        match self {
            RoomEvent::EnterRoom { .. } => "enter_room",
            RoomEvent::EnterRoomFailed { .. } => "enter_room_failed",
            RoomEvent::ExitRoom { .. } => "exit_room",
            RoomEvent::Error { .. } => "error",
            RoomEvent::Warning { .. } => "warning",
            RoomEvent::ConnectionLost => "connection_lost",
            RoomEvent::TryToReconnect { .. } => "try_to_reconnect",
            RoomEvent::ConnectionRecovery => "connection_recovery",
            RoomEvent::UserEnter { .. } => "user_enter",
            RoomEvent::UserExit { .. } => "user_exit",
            RoomEvent::UserVideoAvailable { .. } => "user_video_available",
            RoomEvent::UserSubStreamAvailable { .. } => "user_sub_stream_available",
            RoomEvent::UserAudioAvailable { .. } => "user_audio_available",
            RoomEvent::FirstVideoFrame { .. } => "first_video_frame",
            RoomEvent::FirstAudioFrame { .. } => "first_audio_frame",
            RoomEvent::NetworkQuality { .. } => "network_quality",
            RoomEvent::Statistics(_) => "statistics",
            RoomEvent::UserVoiceVolume { .. } => "user_voice_volume",
            RoomEvent::RecvCustomCmdMsg { .. } => "recv_custom_cmd_msg",
            RoomEvent::MissCustomCmdMsg { .. } => "miss_custom_cmd_msg",
            RoomEvent::StartPublishCdnStream { .. } => "start_publish_cdn_stream",
            RoomEvent::StopPublishCdnStream { .. } => "stop_publish_cdn_stream",
            RoomEvent::SetMixTranscodingConfig { .. } => "set_mix_transcoding_config",
            RoomEvent::SpeedTest { .. } => "speed_test",
            RoomEvent::TestMicVolume { .. } => "test_mic_volume",
            RoomEvent::CameraDidReady => "camera_did_ready",
            RoomEvent::MicDidReady => "mic_did_ready",
            RoomEvent::DeviceChange { .. } => "device_change",
            RoomEvent::ScreenCaptureStarted => "screen_capture_started",
            RoomEvent::ScreenCapturePaused => "screen_capture_paused",
            RoomEvent::ScreenCaptureResumed => "screen_capture_resumed",
            RoomEvent::ScreenCaptureStopped { .. } => "screen_capture_stopped",
        }
    }

    /// Hochfrequente Events, die nur auf Trace-Level geloggt werden
    pub fn is_periodic(&self) -> bool {
        matches!(
            self,
            RoomEvent::NetworkQuality { .. }
                | RoomEvent::Statistics(_)
                | RoomEvent::UserVoiceVolume { .. }
                | RoomEvent::TestMicVolume { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serializes_tagged() {
        let event = RoomEvent::UserVideoAvailable {
            user_id: "bob".into(),
            available: false,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "user_video_available");
        assert_eq!(json["userId"], "bob");
        assert_eq!(event.name(), "user_video_available");
    }

    #[test]
    fn test_periodic_events() {
        assert!(RoomEvent::Statistics(Statistics::default()).is_periodic());
        assert!(!RoomEvent::ConnectionLost.is_periodic());
    }
}
