//! Track-Modell und Video-Parameter
//!
//! Ein Track beschreibt einen gerichteten Medienfluss
//! (Besitzer × Art × Richtung) plus seine Encode- bzw. Darstellungsparameter.

use crate::error::{codes, EngineError};
use serde::{Deserialize, Serialize};

// ============================================================================
// STREAM TYPES
// ============================================================================

/// Video-Stream eines Teilnehmers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamType {
    /// Hauptstream in voller Auflösung
    Big,
    /// Niedrig aufgelöste Variante des Hauptstreams (Dual-Stream)
    Small,
    /// Substream (Bildschirmfreigabe)
    Sub,
}

impl StreamType {
    /// Small und Big gehören zur selben Hauptstream-Ansicht
    pub fn is_main(&self) -> bool {
        matches!(self, StreamType::Big | StreamType::Small)
    }
}

// ============================================================================
// TRACK IDENTITY
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TrackOwner {
    Local,
    Remote(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    VideoMain,
    VideoSub,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Publish,
    Subscribe,
}

/// Eindeutige Identität eines Tracks
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TrackId {
    pub owner: TrackOwner,
    pub kind: TrackKind,
    pub direction: Direction,
}

impl TrackId {
    pub fn local(kind: TrackKind) -> Self {
        Self {
            owner: TrackOwner::Local,
            kind,
            direction: Direction::Publish,
        }
    }

    pub fn remote(user_id: &str, kind: TrackKind) -> Self {
        Self {
            owner: TrackOwner::Remote(user_id.to_string()),
            kind,
            direction: Direction::Subscribe,
        }
    }
}

impl std::fmt::Display for TrackId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let owner = match &self.owner {
            TrackOwner::Local => "local",
            TrackOwner::Remote(user) => user.as_str(),
        };
        write!(f, "{}/{:?}/{:?}", owner, self.kind, self.direction)
    }
}

// ============================================================================
// RENDER TRANSFORM
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FillMode {
    /// Bild füllt die Fläche, Ränder werden beschnitten
    #[default]
    Fill,
    /// Bild passt vollständig hinein, ggf. mit schwarzen Rändern
    Fit,
}

/// Drehung im Uhrzeigersinn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Rotation {
    #[default]
    #[serde(rename = "0")]
    R0,
    #[serde(rename = "90")]
    R90,
    #[serde(rename = "180")]
    R180,
    #[serde(rename = "270")]
    R270,
}

impl Rotation {
    pub fn degrees(&self) -> u32 {
        match self {
            Rotation::R0 => 0,
            Rotation::R90 => 90,
            Rotation::R180 => 180,
            Rotation::R270 => 270,
        }
    }

    /// Rundet auf das nächste Vielfache von 90 Grad
    pub fn from_degrees(degrees: u32) -> Rotation {
        match ((degrees + 45) / 90) % 4 {
            1 => Rotation::R90,
            2 => Rotation::R180,
            3 => Rotation::R270,
            _ => Rotation::R0,
        }
    }

    /// Summe zweier Drehungen
    pub fn combine(&self, other: Rotation) -> Rotation {
        match (self.degrees() + other.degrees()) % 360 {
            90 => Rotation::R90,
            180 => Rotation::R180,
            270 => Rotation::R270,
            _ => Rotation::R0,
        }
    }
}

/// Darstellungsparameter einer Ansicht
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ViewTransform {
    pub fill_mode: FillMode,
    pub rotation: Rotation,
    pub mirror: bool,
}

// ============================================================================
// ENCODER PARAMETERS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionMode {
    #[default]
    Landscape,
    Portrait,
}

/// Encoder-Parameter eines Video-Streams
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoEncParam {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub min_bitrate_kbps: u32,
    pub max_bitrate_kbps: u32,
    pub resolution_mode: ResolutionMode,
}

/// Erlaubte Abweichung beim Seitenverhältnis-Vergleich
pub const ASPECT_RATIO_TOLERANCE: f64 = 0.01;

impl VideoEncParam {
    pub fn new(width: u32, height: u32, fps: u32, max_bitrate_kbps: u32) -> Self {
        Self {
            width,
            height,
            fps,
            min_bitrate_kbps: max_bitrate_kbps / 4,
            max_bitrate_kbps,
            resolution_mode: ResolutionMode::Landscape,
        }
    }

    /// Standard für den Hauptstream (640x360, 15 fps)
    pub fn main_default() -> Self {
        Self::new(640, 360, 15, 900)
    }

    /// Standard für den Small-Stream
    pub fn small_default() -> Self {
        Self::new(160, 90, 15, 100)
    }

    /// Standard für den Substream (Bildschirmfreigabe)
    pub fn sub_default() -> Self {
        Self::new(1920, 1080, 10, 1600)
    }

    /// Ausgabe-Breite/Höhe unter Berücksichtigung des Modus
    pub fn output_dimensions(&self) -> (u32, u32) {
        match self.resolution_mode {
            ResolutionMode::Landscape => (self.width.max(self.height), self.width.min(self.height)),
            ResolutionMode::Portrait => (self.width.min(self.height), self.width.max(self.height)),
        }
    }

    pub fn aspect_ratio(&self) -> f64 {
        let (w, h) = self.output_dimensions();
        w as f64 / h.max(1) as f64
    }

    /// Prüft ob beide Parameter dasselbe Seitenverhältnis haben
    pub fn aspect_matches(&self, other: &VideoEncParam) -> bool {
        let a = self.aspect_ratio();
        let b = other.aspect_ratio();
        ((a - b) / a).abs() <= ASPECT_RATIO_TOLERANCE
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.width == 0 || self.height == 0 {
            return Err(EngineError::invalid(
                codes::ERR_VIDEO_ENC_PARAM_INVALID,
                "resolution must not be 0",
            ));
        }
        if self.fps == 0 || self.fps > 60 {
            return Err(EngineError::invalid(
                codes::ERR_VIDEO_ENC_PARAM_INVALID,
                format!("fps {} out of range 1..=60", self.fps),
            ));
        }
        if self.max_bitrate_kbps == 0 || self.min_bitrate_kbps > self.max_bitrate_kbps {
            return Err(EngineError::invalid(
                codes::ERR_VIDEO_ENC_PARAM_INVALID,
                "bitrate range must satisfy 0 < min <= max",
            ));
        }
        Ok(())
    }

    /// Prüft die Small-Stream Parameter gegen den Hauptstream
    pub fn validate_small_stream(&self, small: &VideoEncParam) -> Result<(), EngineError> {
        small.validate()?;
        if !self.aspect_matches(small) {
            let (big_w, big_h) = self.output_dimensions();
            let (small_w, small_h) = small.output_dimensions();
            return Err(EngineError::AspectRatioMismatch {
                big_w,
                big_h,
                small_w,
                small_h,
            });
        }
        Ok(())
    }
}

impl Default for VideoEncParam {
    fn default() -> Self {
        Self::main_default()
    }
}

// ============================================================================
// NETWORK QOS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum QosPreference {
    /// Bei schwachem Netz zuerst die Auflösung opfern
    Smooth,
    /// Bei schwachem Netz zuerst die Framerate opfern
    #[default]
    Clear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum QosControlMode {
    Client,
    #[default]
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct NetworkQosParam {
    pub preference: QosPreference,
    pub control_mode: QosControlMode,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aspect_ratio_match() {
        let big = VideoEncParam::new(1280, 720, 15, 1200);
        let small = VideoEncParam::new(320, 180, 15, 150);
        assert!(big.aspect_matches(&small));
        assert!(big.validate_small_stream(&small).is_ok());
    }

    #[test]
    fn test_aspect_ratio_mismatch_rejected() {
        let big = VideoEncParam::new(1280, 720, 15, 1200);
        let small = VideoEncParam::new(320, 240, 15, 150);
        let err = big.validate_small_stream(&small).unwrap_err();
        assert_eq!(err.code(), codes::ERR_SMALL_STREAM_ASPECT_RATIO);
        assert!(matches!(
            err,
            EngineError::AspectRatioMismatch {
                small_w: 320,
                small_h: 240,
                ..
            }
        ));
    }

    #[test]
    fn test_aspect_within_tolerance() {
        // 854x480 ist nicht exakt 16:9, liegt aber innerhalb der Toleranz
        let big = VideoEncParam::new(1280, 720, 15, 1200);
        let small = VideoEncParam::new(854, 480, 15, 400);
        assert!(big.aspect_matches(&small));
    }

    #[test]
    fn test_portrait_mode_orients_output() {
        let mut param = VideoEncParam::new(640, 360, 15, 800);
        param.resolution_mode = ResolutionMode::Portrait;
        assert_eq!(param.output_dimensions(), (360, 640));
    }

    #[test]
    fn test_invalid_enc_params() {
        assert!(VideoEncParam::new(0, 360, 15, 800).validate().is_err());
        assert!(VideoEncParam::new(640, 360, 0, 800).validate().is_err());
        let mut param = VideoEncParam::new(640, 360, 15, 800);
        param.min_bitrate_kbps = 900;
        assert!(param.validate().is_err());
    }

    #[test]
    fn test_rotation_combine() {
        assert_eq!(Rotation::R90.combine(Rotation::R270), Rotation::R0);
        assert_eq!(Rotation::R180.combine(Rotation::R90), Rotation::R270);
        assert_eq!(Rotation::from_degrees(270), Rotation::R270);
        assert_eq!(Rotation::from_degrees(360), Rotation::R0);
    }

    #[test]
    fn test_stream_type_serde() {
        let json = serde_json::to_string(&StreamType::Small).unwrap();
        assert_eq!(json, "\"small\"");
        assert!(StreamType::Small.is_main());
        assert!(!StreamType::Sub.is_main());
    }
}
