//! CDN Module - Weiterleitung der Raum-Streams an ein CDN
//!
//! Zwei Modi, die sich nicht ausschließen:
//! - Direkt: jeder Stream unter eigener Stream-Id
//! - Mix-Transcoding: serverseitig komponiertes Layout aus mehreren Streams

mod relay;

pub use relay::{CdnPublishState, CdnRelayCoordinator, CdnResult};

use crate::error::codes;
use crate::media::StreamType;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CdnError {
    #[error("Invalid CDN publish parameter: {0}")]
    InvalidPublishParam(String),

    #[error("Invalid mix transcoding config: {0}")]
    InvalidMixConfig(String),

    #[error("Relay rejected request ({code}): {message}")]
    Rejected { code: i32, message: String },
}

impl CdnError {
    pub fn code(&self) -> i32 {
        match self {
            CdnError::InvalidPublishParam(_) => codes::ERR_PUBLISH_CDN_STREAM_FAILED,
            CdnError::InvalidMixConfig(_) => codes::ERR_MIX_TRANSCODING_INVALID,
            CdnError::Rejected { code, .. } => *code,
        }
    }
}

// ============================================================================
// CONFIGURATION TYPES
// ============================================================================

/// Ziel für die Weiterleitung an ein fremdes CDN
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishCdnParam {
    pub app_id: u32,
    pub biz_id: u32,
    /// RTMP Push-Adresse
    pub url: String,
}

impl PublishCdnParam {
    pub fn validate(&self) -> Result<(), CdnError> {
        let parsed = url::Url::parse(&self.url)
            .map_err(|e| CdnError::InvalidPublishParam(format!("{}: {}", self.url, e)))?;
        if parsed.scheme() != "rtmp" {
            return Err(CdnError::InvalidPublishParam(format!(
                "unsupported scheme {}",
                parsed.scheme()
            )));
        }
        Ok(())
    }
}

/// Position eines Streams im Mix-Layout
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MixUser {
    pub user_id: String,
    /// Leer = aktueller Raum
    #[serde(default)]
    pub room_id: Option<u32>,
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub z_order: u32,
    pub stream: StreamType,
    /// Nur Audio dieses Nutzers mischen
    #[serde(default)]
    pub pure_audio: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscodingConfig {
    pub app_id: u32,
    pub biz_id: u32,
    pub video_width: u32,
    pub video_height: u32,
    pub video_bitrate_kbps: u32,
    pub video_fps: u32,
    pub video_gop: u32,
    pub audio_sample_rate: u32,
    pub audio_bitrate_kbps: u32,
    pub audio_channels: u16,
    pub mix_users: Vec<MixUser>,
}

impl Default for TranscodingConfig {
    fn default() -> Self {
        Self {
            app_id: 0,
            biz_id: 0,
            video_width: 640,
            video_height: 360,
            video_bitrate_kbps: 900,
            video_fps: 15,
            video_gop: 3,
            audio_sample_rate: 48000,
            audio_bitrate_kbps: 64,
            audio_channels: 1,
            mix_users: Vec::new(),
        }
    }
}

const AUDIO_SAMPLE_RATES: [u32; 3] = [32000, 44100, 48000];

impl TranscodingConfig {
    /// Leere Nutzerliste bedeutet: Mixing beenden
    pub fn is_cancel(&self) -> bool {
        self.mix_users.is_empty()
    }

    pub fn validate(&self) -> Result<(), CdnError> {
        let invalid = |reason: String| Err(CdnError::InvalidMixConfig(reason));

        let has_video = self.mix_users.iter().any(|u| !u.pure_audio);
        if has_video {
            if self.video_width == 0 || self.video_height == 0 {
                return invalid("canvas size must not be 0".into());
            }
            if self.video_fps == 0 || self.video_fps > 60 {
                return invalid(format!("video fps {} out of range", self.video_fps));
            }
            if self.video_gop == 0 {
                return invalid("gop must not be 0".into());
            }
        }
        if !AUDIO_SAMPLE_RATES.contains(&self.audio_sample_rate) {
            return invalid(format!("audio sample rate {}", self.audio_sample_rate));
        }
        if !(1..=2).contains(&self.audio_channels) {
            return invalid(format!("audio channels {}", self.audio_channels));
        }

        let mut seen = HashSet::new();
        for user in &self.mix_users {
            if user.user_id.is_empty() {
                return invalid("mix user without user id".into());
            }
            if !seen.insert((user.user_id.as_str(), user.room_id, user.stream.is_main())) {
                return invalid(format!("{} listed twice for {:?}", user.user_id, user.stream));
            }
            if user.pure_audio {
                continue;
            }
            if user.width == 0 || user.height == 0 {
                return invalid(format!("{} has an empty region", user.user_id));
            }
            if user.x + user.width > self.video_width || user.y + user.height > self.video_height {
                return invalid(format!("{} is placed outside the canvas", user.user_id));
            }
        }
        Ok(())
    }
}
