//! Message Types für das Relay-Protokoll
//!
//! JSON-Textframes, getaggt über `"type"`. Binäre Nutzdaten (Custom Messages,
//! Medienpakete) werden base64-kodiert übertragen.

use crate::cdn::{PublishCdnParam, TranscodingConfig};
use crate::media::StreamType;
use crate::session::AppScene;
use serde::{Deserialize, Serialize};

// ============================================================================
// BASE64 PAYLOADS
// ============================================================================

/// serde-Adapter für `Vec<u8>` als base64-String
pub mod b64 {
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        BASE64.decode(text).map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// SHARED PAYLOADS
// ============================================================================

/// Veröffentlichungsstatus eines Teilnehmers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct UserInfo {
    pub user_id: String,
    #[serde(default)]
    pub audio: bool,
    #[serde(default)]
    pub video: bool,
    #[serde(default)]
    pub small_video: bool,
    #[serde(default)]
    pub sub_video: bool,
}

/// Ein kodiertes Videobild (I420) auf dem Draht
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoPayload {
    pub width: u32,
    pub height: u32,
    pub timestamp_ms: u64,
    /// Drehung in Grad, die der Empfänger anwenden soll
    #[serde(default)]
    pub rotation: u32,
    #[serde(with = "b64")]
    pub data: Vec<u8>,
}

/// PCM-Audio (i16 little endian) auf dem Draht
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioPayload {
    pub timestamp_ms: u64,
    pub sample_rate: u32,
    pub channels: u16,
    #[serde(with = "b64")]
    pub data: Vec<u8>,
}

/// Netzqualität, von `Unknown` bis `Down`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Quality {
    #[default]
    Unknown,
    Excellent,
    Good,
    Poor,
    Bad,
    VeryBad,
    Down,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteQuality {
    pub user_id: String,
    pub quality: Quality,
}

// ============================================================================
// CLIENT → SERVER MESSAGES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Erster Frame jeder Verbindung
    EnterRoom {
        sdk_app_id: u32,
        room_id: u32,
        user_id: String,
        user_sig: String,
        scene: AppScene,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        private_map_key: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        business_info: Option<String>,
        /// Wiederaufnahme einer bestehenden Sitzung nach Reconnect
        #[serde(default)]
        resume: bool,
        /// Verbindung nur für den Speed-Test, ohne Raum-Mitgliedschaft
        #[serde(default)]
        probe: bool,
    },

    ExitRoom,

    Heartbeat {
        timestamp: i64,
    },

    /// Aktueller Veröffentlichungsstatus des lokalen Nutzers
    PublishState {
        audio: bool,
        video: bool,
        small_video: bool,
        sub_video: bool,
    },

    Subscribe {
        user_id: String,
        stream: StreamType,
    },

    Unsubscribe {
        user_id: String,
        stream: StreamType,
    },

    VideoPacket {
        stream: StreamType,
        frame: VideoPayload,
    },

    AudioPacket {
        frame: AudioPayload,
    },

    CustomCmd {
        cmd_id: u32,
        seq: u32,
        reliable: bool,
        ordered: bool,
        #[serde(with = "b64")]
        data: Vec<u8>,
    },

    StartPublishCdn {
        param: PublishCdnParam,
    },

    StopPublishCdn,

    /// `config: None` beendet das Mixing
    SetMixTranscoding {
        version: u64,
        config: Option<TranscodingConfig>,
    },

    SpeedTest {
        probe_bytes: u32,
    },
}

impl ClientMessage {
    /// Name des Message-Typs für Logs
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::EnterRoom { .. } => "enter_room",
            ClientMessage::ExitRoom => "exit_room",
            ClientMessage::Heartbeat { .. } => "heartbeat",
            ClientMessage::PublishState { .. } => "publish_state",
            ClientMessage::Subscribe { .. } => "subscribe",
            ClientMessage::Unsubscribe { .. } => "unsubscribe",
            ClientMessage::VideoPacket { .. } => "video_packet",
            ClientMessage::AudioPacket { .. } => "audio_packet",
            ClientMessage::CustomCmd { .. } => "custom_cmd",
            ClientMessage::StartPublishCdn { .. } => "start_publish_cdn",
            ClientMessage::StopPublishCdn => "stop_publish_cdn",
            ClientMessage::SetMixTranscoding { .. } => "set_mix_transcoding",
            ClientMessage::SpeedTest { .. } => "speed_test",
        }
    }
}

// ============================================================================
// SERVER → CLIENT MESSAGES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// Antwort auf `enter_room` mit den bereits anwesenden Teilnehmern
    RoomEntered {
        #[serde(default)]
        users: Vec<UserInfo>,
    },

    UserEnter {
        user_id: String,
    },

    UserExit {
        user_id: String,
        #[serde(default)]
        reason: u32,
    },

    UserAvailability {
        user_id: String,
        audio: bool,
        video: bool,
        small_video: bool,
        sub_video: bool,
    },

    VideoFrame {
        user_id: String,
        stream: StreamType,
        frame: VideoPayload,
    },

    AudioFrame {
        user_id: String,
        frame: AudioPayload,
    },

    CustomCmd {
        user_id: String,
        cmd_id: u32,
        seq: u32,
        reliable: bool,
        ordered: bool,
        #[serde(with = "b64")]
        data: Vec<u8>,
    },

    /// Relay hat eine zuverlässige Nachricht übernommen
    CustomCmdAck {
        cmd_id: u32,
        seq: u32,
    },

    NetworkQuality {
        local: Quality,
        #[serde(default)]
        remote: Vec<RemoteQuality>,
    },

    CdnPublishResult {
        code: i32,
        #[serde(default)]
        message: String,
    },

    CdnStopResult {
        code: i32,
        #[serde(default)]
        message: String,
    },

    MixTranscodingResult {
        version: u64,
        code: i32,
        #[serde(default)]
        message: String,
    },

    SpeedTestResult {
        ip: String,
        quality: Quality,
        upload_loss: f32,
        download_loss: f32,
        rtt_ms: u32,
    },

    Error {
        code: i32,
        message: String,
    },

    Pong {
        timestamp: i64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enter_room_wire_format() {
        let msg = ClientMessage::EnterRoom {
            sdk_app_id: 1400000001,
            room_id: 42,
            user_id: "alice".into(),
            user_sig: "sig".into(),
            scene: AppScene::VideoCall,
            private_map_key: None,
            business_info: None,
            resume: false,
            probe: false,
        };

        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "enter_room");
        assert_eq!(json["sdkAppId"], 1400000001);
        assert_eq!(json["roomId"], 42);
        assert_eq!(json["scene"], "video_call");
        assert!(json.get("privateMapKey").is_none());
    }

    #[test]
    fn test_custom_cmd_payload_is_base64() {
        let msg = ClientMessage::CustomCmd {
            cmd_id: 3,
            seq: 7,
            reliable: true,
            ordered: true,
            data: b"hello".to_vec(),
        };

        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["data"], "aGVsbG8=");
        assert_eq!(json["cmdId"], 3);
    }

    #[test]
    fn test_parse_server_messages() {
        let text = r#"{"type":"user_availability","userId":"bob","audio":true,"video":false,"smallVideo":false,"subVideo":true}"#;
        let msg: ServerMessage = serde_json::from_str(text).unwrap();
        assert_eq!(
            msg,
            ServerMessage::UserAvailability {
                user_id: "bob".into(),
                audio: true,
                video: false,
                small_video: false,
                sub_video: true,
            }
        );

        let text = r#"{"type":"room_entered"}"#;
        let msg: ServerMessage = serde_json::from_str(text).unwrap();
        assert_eq!(msg, ServerMessage::RoomEntered { users: vec![] });

        let text = r#"{"type":"custom_cmd","userId":"bob","cmdId":1,"seq":2,"reliable":false,"ordered":false,"data":"AQI="}"#;
        match serde_json::from_str::<ServerMessage>(text).unwrap() {
            ServerMessage::CustomCmd { data, .. } => assert_eq!(data, vec![1, 2]),
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn test_invalid_base64_rejected() {
        let text = r#"{"type":"custom_cmd","userId":"bob","cmdId":1,"seq":2,"reliable":false,"ordered":false,"data":"!!"}"#;
        assert!(serde_json::from_str::<ServerMessage>(text).is_err());
    }

    #[test]
    fn test_quality_ordering() {
        assert!(Quality::Excellent < Quality::Poor);
        assert!(Quality::Bad < Quality::Down);
    }
}
