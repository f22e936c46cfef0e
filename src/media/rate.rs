//! Rate Control pro Stream-Variante
//!
//! Jede Variante (Big, Small, Sub) hat einen eigenen Controller. Netzqualität
//! verschiebt eine Stufe zwischen 0 (volle Qualität) und [`MAX_LEVEL`]; die
//! QoS-Präferenz entscheidet, ob zuerst Framerate oder Auflösung sinkt.

use super::track::{QosPreference, VideoEncParam};
use crate::signaling::Quality;

pub const MAX_LEVEL: u32 = 4;

/// Kleinste Framerate, auf die gedrosselt wird
const MIN_FPS: u32 = 5;

#[derive(Debug, Clone)]
pub struct RateController {
    param: VideoEncParam,
    preference: QosPreference,
    level: u32,
    next_due_ms: Option<u64>,
}

impl RateController {
    pub fn new(param: VideoEncParam, preference: QosPreference) -> Self {
        Self {
            param,
            preference,
            level: 0,
            next_due_ms: None,
        }
    }

    pub fn param(&self) -> &VideoEncParam {
        &self.param
    }

    pub fn set_param(&mut self, param: VideoEncParam) {
        self.param = param;
        self.next_due_ms = None;
    }

    pub fn set_preference(&mut self, preference: QosPreference) {
        self.preference = preference;
    }

    pub fn level(&self) -> u32 {
        self.level
    }

    /// Passt die Drosselstufe an die gemeldete Netzqualität an
    pub fn on_quality(&mut self, quality: Quality) {
        let before = self.level;
        self.level = match quality {
            Quality::Unknown => self.level,
            Quality::Excellent | Quality::Good => self.level.saturating_sub(1),
            Quality::Poor => (self.level + 1).min(2),
            Quality::Bad | Quality::VeryBad => (self.level + 1).min(MAX_LEVEL),
            Quality::Down => MAX_LEVEL,
        };
        if before != self.level {
            tracing::debug!(
                "Rate level {} -> {} ({}x{} @ {} fps)",
                before,
                self.level,
                self.output_size().0,
                self.output_size().1,
                self.target_fps()
            );
        }
    }

    fn fps_steps(&self) -> u32 {
        match self.preference {
            // Flüssig: Framerate bleibt, Auflösung sinkt zuerst
            QosPreference::Smooth => self.level.saturating_sub(2),
            QosPreference::Clear => self.level.min(2),
        }
    }

    fn scale_steps(&self) -> u32 {
        self.level - self.fps_steps()
    }

    pub fn target_fps(&self) -> u32 {
        (self.param.fps >> self.fps_steps()).max(MIN_FPS.min(self.param.fps))
    }

    /// Ausgabegröße, immer gerade Kantenlängen
    pub fn output_size(&self) -> (u32, u32) {
        let (w, h) = self.param.output_dimensions();
        let factor = 1u32 << self.scale_steps();
        let even = |v: u32| ((v / factor).max(2)) & !1;
        (even(w), even(h))
    }

    pub fn target_bitrate_kbps(&self) -> u32 {
        let (w, h) = self.output_size();
        let (fw, fh) = self.param.output_dimensions();
        let area = (w * h) as f64 / (fw * fh).max(1) as f64;
        let rate = self.target_fps() as f64 / self.param.fps.max(1) as f64;
        let kbps = self.param.max_bitrate_kbps as f64 * area.max(rate * area);
        (kbps as u32).clamp(self.param.min_bitrate_kbps.min(self.param.max_bitrate_kbps), self.param.max_bitrate_kbps)
    }

    /// Frame-Pacing: soll ein Bild mit diesem Zeitstempel gesendet werden?
    pub fn should_send(&mut self, timestamp_ms: u64) -> bool {
        let interval = 1000 / self.target_fps().max(1) as u64;
        match self.next_due_ms {
            Some(due) if timestamp_ms + interval / 4 < due => false,
            _ => {
                self.next_due_ms = Some(timestamp_ms + interval);
                true
            }
        }
    }
}
