//! Audio - PCM-Frames, Resampling und Lautstärke-Messung
//!
//! Interne Verarbeitung in f32 bei 48 kHz mono, auf dem Draht i16 little endian.

use crate::signaling::AudioPayload;
use ringbuf::{traits::*, HeapRb};

// ============================================================================
// CONSTANTS
// ============================================================================

/// Sample Rate (48kHz ist der Standard für beste Qualität)
pub const SAMPLE_RATE: u32 = 48000;

/// Channels (Mono für Voice)
pub const CHANNELS: u16 = 1;

/// Frame Size in Samples (20ms @ 48kHz = 960 samples)
pub const FRAME_SIZE: usize = 960;

/// Dauer eines Frames in Millisekunden
pub const FRAME_DURATION_MS: u64 = 20;

// ============================================================================
// AUDIO FRAME
// ============================================================================

/// Ein Block PCM-Samples
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub timestamp_ms: u64,
    pub sample_rate: u32,
    pub channels: u16,
    pub samples: Vec<f32>,
}

impl AudioFrame {
    pub fn new(timestamp_ms: u64, samples: Vec<f32>) -> Self {
        Self {
            timestamp_ms,
            sample_rate: SAMPLE_RATE,
            channels: CHANNELS,
            samples,
        }
    }

    /// Skaliert alle Samples mit `volume` (0-100)
    pub fn apply_volume(&mut self, volume: u32) {
        if volume >= 100 {
            return;
        }
        let gain = volume as f32 / 100.0;
        for sample in &mut self.samples {
            *sample *= gain;
        }
    }

    /// Resampling auf [`SAMPLE_RATE`] falls nötig
    pub fn normalized(self) -> Self {
        if self.sample_rate == SAMPLE_RATE || self.sample_rate == 0 {
            return self;
        }
        Self {
            samples: resample_linear(&self.samples, self.sample_rate, SAMPLE_RATE),
            sample_rate: SAMPLE_RATE,
            ..self
        }
    }

    pub fn to_payload(&self) -> AudioPayload {
        let mut data = Vec::with_capacity(self.samples.len() * 2);
        for sample in &self.samples {
            let value = (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
            data.extend_from_slice(&value.to_le_bytes());
        }
        AudioPayload {
            timestamp_ms: self.timestamp_ms,
            sample_rate: self.sample_rate,
            channels: self.channels,
            data,
        }
    }

    pub fn from_payload(payload: &AudioPayload) -> Self {
        let samples = payload
            .data
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 / i16::MAX as f32)
            .collect();
        Self {
            timestamp_ms: payload.timestamp_ms,
            sample_rate: payload.sample_rate,
            channels: payload.channels,
            samples,
        }
    }
}

/// Einfaches Linear-Resampling
pub fn resample_linear(data: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || data.is_empty() {
        return data.to_vec();
    }
    let ratio = to_rate as f32 / from_rate as f32;
    let new_len = (data.len() as f32 * ratio) as usize;
    (0..new_len)
        .map(|i| {
            let src_idx = i as f32 / ratio;
            let idx = src_idx as usize;
            let frac = src_idx - idx as f32;
            let s1 = data.get(idx).copied().unwrap_or(0.0);
            let s2 = data.get(idx + 1).copied().unwrap_or(s1);
            s1 + (s2 - s1) * frac
        })
        .collect()
}

/// RMS-Pegel eines Blocks (0.0 - 1.0)
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f32 = samples.iter().map(|s| s * s).sum();
    (sum / samples.len() as f32).sqrt().min(1.0)
}

// ============================================================================
// VOLUME METER
// ============================================================================

/// Glättet RMS-Pegel über die letzten `smooth` Blöcke
pub struct VolumeMeter {
    history: HeapRb<f32>,
    smooth: usize,
}

impl VolumeMeter {
    /// `smooth` = Anzahl der Blöcke im Mittel (mindestens 1)
    pub fn new(smooth: usize) -> Self {
        Self {
            history: HeapRb::new(smooth.max(1)),
            smooth: smooth.max(1),
        }
    }

    pub fn feed(&mut self, samples: &[f32]) {
        self.history.push_overwrite(rms(samples));
    }

    /// Geglätteter Pegel auf der Skala 0-100
    pub fn volume(&self) -> u32 {
        let count = self.history.occupied_len();
        if count == 0 {
            return 0;
        }
        let mean = self.history.iter().sum::<f32>() / count as f32;
        // Sprachpegel liegen typischerweise weit unter 1.0, daher Wurzel-Kurve
        (mean.sqrt() * 100.0).round().min(100.0) as u32
    }

    pub fn reset(&mut self) {
        self.history = HeapRb::new(self.smooth);
    }
}

impl std::fmt::Debug for VolumeMeter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VolumeMeter")
            .field("volume", &self.volume())
            .finish()
    }
}

/// Testton für synthetische Mikrofone
pub fn sine_wave(frequency: f32, amplitude: f32, offset: usize, len: usize) -> Vec<f32> {
    (0..len)
        .map(|i| {
            let t = (offset + i) as f32 / SAMPLE_RATE as f32;
            (t * frequency * std::f32::consts::TAU).sin() * amplitude
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rms_of_silence_and_full_scale() {
        assert_eq!(rms(&[0.0; FRAME_SIZE]), 0.0);
        assert!((rms(&[1.0; FRAME_SIZE]) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_meter_smooths_over_history() {
        let mut meter = VolumeMeter::new(4);
        assert_eq!(meter.volume(), 0);

        meter.feed(&[1.0; FRAME_SIZE]);
        assert_eq!(meter.volume(), 100);

        for _ in 0..3 {
            meter.feed(&[0.0; FRAME_SIZE]);
        }
        // Mittel 0.25 → sqrt = 0.5
        assert_eq!(meter.volume(), 50);

        meter.feed(&[0.0; FRAME_SIZE]);
        assert_eq!(meter.volume(), 0);
    }

    #[test]
    fn test_payload_conversion() {
        let frame = AudioFrame::new(40, vec![0.0, 0.5, -0.5, 1.0]);
        let payload = frame.to_payload();
        assert_eq!(payload.data.len(), 8);

        let decoded = AudioFrame::from_payload(&payload);
        assert_eq!(decoded.samples.len(), 4);
        assert!((decoded.samples[1] - 0.5).abs() < 1e-3);
        assert_eq!(decoded.timestamp_ms, 40);
    }

    #[test]
    fn test_resample_doubles_length() {
        let out = resample_linear(&[0.0, 1.0, 0.0, 1.0], 24000, 48000);
        assert_eq!(out.len(), 8);
        assert!((out[1] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_apply_volume() {
        let mut frame = AudioFrame::new(0, vec![1.0, -1.0]);
        frame.apply_volume(25);
        assert_eq!(frame.samples, vec![0.25, -0.25]);
    }
}
