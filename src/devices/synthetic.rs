//! Synthetische Geräte für Headless-Betrieb und Tests
//!
//! Kameras und Bildschirme liefern Testbilder, Mikrofone einen Sinuston.
//! Jede geöffnete Quelle läuft auf einem eigenen Thread, bis ihr
//! [`CaptureStream`] gedroppt wird.

use super::{
    capture_channel, AudioOutput, CaptureStream, DeviceBackend, DeviceChange, DeviceError,
    DeviceInfo, DeviceKind, DeviceState, ScreenCaptureTarget, ScreenSource, ScreenSourceKind,
};
use crate::media::{rms, sine_wave, AudioFrame, VideoFrame, FRAME_DURATION_MS, FRAME_SIZE};
use parking_lot::Mutex;
use ringbuf::{traits::*, HeapRb};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

/// Größe des Wiedergabe-Puffers (1 Sekunde bei 48kHz)
const PLAYBACK_BUFFER_SIZE: usize = 48000;

/// Frames, die ein Capture-Kanal puffert
const CAPTURE_QUEUE: usize = 8;

struct SyntheticState {
    cameras: Vec<DeviceInfo>,
    microphones: Vec<DeviceInfo>,
    speakers: Vec<DeviceInfo>,
    screens: Vec<ScreenSource>,
    failing: HashSet<DeviceKind>,
    tone_amplitude: f32,
}

/// Gerätesatz ohne Hardware
#[derive(Clone)]
pub struct VirtualDeviceBackend {
    state: Arc<Mutex<SyntheticState>>,
    changes: broadcast::Sender<DeviceChange>,
    played: Arc<AtomicU64>,
    playback: Arc<Mutex<HeapRb<f32>>>,
}

fn device(kind: DeviceKind, prefix: &str, label: &str, index: usize) -> DeviceInfo {
    DeviceInfo {
        id: format!("{prefix}-{index}"),
        name: format!("{label} {index}"),
        kind,
    }
}

impl VirtualDeviceBackend {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(32);
        let state = SyntheticState {
            cameras: (0..2)
                .map(|i| device(DeviceKind::Camera, "virtual-camera", "Virtual Camera", i))
                .collect(),
            microphones: (0..2)
                .map(|i| device(DeviceKind::Microphone, "virtual-mic", "Virtual Microphone", i))
                .collect(),
            speakers: vec![device(DeviceKind::Speaker, "virtual-speaker", "Virtual Speaker", 0)],
            screens: vec![
                ScreenSource {
                    id: "screen-0".into(),
                    name: "Virtual Display".into(),
                    kind: ScreenSourceKind::Screen,
                    width: 640,
                    height: 360,
                },
                ScreenSource {
                    id: "window-1".into(),
                    name: "Virtual Window".into(),
                    kind: ScreenSourceKind::Window,
                    width: 480,
                    height: 320,
                },
            ],
            failing: HashSet::new(),
            tone_amplitude: 0.3,
        };
        Self {
            state: Arc::new(Mutex::new(state)),
            changes,
            played: Arc::new(AtomicU64::new(0)),
            playback: Arc::new(Mutex::new(HeapRb::new(PLAYBACK_BUFFER_SIZE))),
        }
    }

    /// Lässt jeden weiteren Open-Versuch dieser Geräteart scheitern
    pub fn set_failing(&self, kind: DeviceKind, failing: bool) {
        let mut state = self.state.lock();
        if failing {
            state.failing.insert(kind);
        } else {
            state.failing.remove(&kind);
        }
    }

    /// Amplitude des Mikrofon-Testtons (0.0 = Stille)
    pub fn set_tone_amplitude(&self, amplitude: f32) {
        self.state.lock().tone_amplitude = amplitude.clamp(0.0, 1.0);
    }

    /// Simuliert Hotplug
    pub fn plug(&self, kind: DeviceKind, id: &str, name: &str) {
        {
            let mut state = self.state.lock();
            let info = DeviceInfo {
                id: id.to_string(),
                name: name.to_string(),
                kind,
            };
            match kind {
                DeviceKind::Camera => state.cameras.push(info),
                DeviceKind::Microphone => state.microphones.push(info),
                DeviceKind::Speaker => state.speakers.push(info),
                DeviceKind::Screen => return,
            }
        }
        self.notify(kind, id, DeviceState::Added);
    }

    pub fn unplug(&self, kind: DeviceKind, id: &str) {
        let removed = {
            let mut state = self.state.lock();
            let list = match kind {
                DeviceKind::Camera => &mut state.cameras,
                DeviceKind::Microphone => &mut state.microphones,
                DeviceKind::Speaker => &mut state.speakers,
                DeviceKind::Screen => return,
            };
            let before = list.len();
            list.retain(|d| d.id != id);
            before != list.len()
        };
        if removed {
            self.notify(kind, id, DeviceState::Removed);
        }
    }

    fn notify(&self, kind: DeviceKind, id: &str, state: DeviceState) {
        let _ = self.changes.send(DeviceChange {
            device_id: id.to_string(),
            kind,
            state,
        });
    }

    /// Bisher über den Lautsprecher ausgegebene Samples
    pub fn played_samples(&self) -> u64 {
        self.played.load(Ordering::Relaxed)
    }

    /// RMS der zuletzt gepufferten Wiedergabe
    pub fn playback_level(&self) -> f32 {
        let buffer = self.playback.lock();
        let samples: Vec<f32> = buffer.iter().copied().collect();
        let tail = samples.len().saturating_sub(FRAME_SIZE);
        rms(&samples[tail..])
    }

    fn check(&self, kind: DeviceKind, device_id: &str) -> Result<(), DeviceError> {
        let state = self.state.lock();
        let known = match kind {
            DeviceKind::Camera => state.cameras.iter().any(|d| d.id == device_id),
            DeviceKind::Microphone => state.microphones.iter().any(|d| d.id == device_id),
            DeviceKind::Speaker => state.speakers.iter().any(|d| d.id == device_id),
            DeviceKind::Screen => state.screens.iter().any(|s| s.id == device_id),
        };
        if !known {
            return Err(DeviceError::NotFound {
                kind,
                id: device_id.to_string(),
            });
        }
        if state.failing.contains(&kind) {
            return Err(DeviceError::OpenFailed {
                kind,
                reason: "device busy".into(),
            });
        }
        Ok(())
    }

    fn spawn_video(
        &self,
        kind: DeviceKind,
        name: String,
        width: u32,
        height: u32,
        fps: u32,
        seed: u8,
    ) -> Result<CaptureStream<VideoFrame>, DeviceError> {
        let (sink, stream) = capture_channel(CAPTURE_QUEUE);
        let interval = Duration::from_millis(1000 / fps.clamp(1, 60) as u64);
        std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let started = Instant::now();
                tracing::debug!("Capture thread {} started ({}x{})", name, width, height);
                loop {
                    let ts = started.elapsed().as_millis() as u64;
                    if !sink.push(VideoFrame::test_pattern(width, height, ts, seed)) {
                        break;
                    }
                    std::thread::sleep(interval);
                }
                tracing::debug!("Capture thread {} stopped", name);
            })
            .map_err(|e| DeviceError::OpenFailed {
                kind,
                reason: e.to_string(),
            })?;
        Ok(stream)
    }
}

impl Default for VirtualDeviceBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceBackend for VirtualDeviceBackend {
    fn devices(&self, kind: DeviceKind) -> Vec<DeviceInfo> {
        let state = self.state.lock();
        match kind {
            DeviceKind::Camera => state.cameras.clone(),
            DeviceKind::Microphone => state.microphones.clone(),
            DeviceKind::Speaker => state.speakers.clone(),
            DeviceKind::Screen => state
                .screens
                .iter()
                .map(|s| DeviceInfo {
                    id: s.id.clone(),
                    name: s.name.clone(),
                    kind: DeviceKind::Screen,
                })
                .collect(),
        }
    }

    fn open_camera(
        &self,
        device_id: &str,
        width: u32,
        height: u32,
        fps: u32,
    ) -> Result<CaptureStream<VideoFrame>, DeviceError> {
        self.check(DeviceKind::Camera, device_id)?;
        tracing::info!("Opening virtual camera {} ({}x{} @ {} fps)", device_id, width, height, fps);
        self.spawn_video(DeviceKind::Camera, format!("camera-{device_id}"), width.max(2), height.max(2), fps, 0)
    }

    fn open_microphone(&self, device_id: &str) -> Result<CaptureStream<AudioFrame>, DeviceError> {
        self.check(DeviceKind::Microphone, device_id)?;
        tracing::info!("Opening virtual microphone {}", device_id);

        let (sink, stream) = capture_channel(CAPTURE_QUEUE);
        let state = self.state.clone();
        std::thread::Builder::new()
            .name(format!("mic-{device_id}"))
            .spawn(move || {
                let mut offset = 0usize;
                loop {
                    let amplitude = state.lock().tone_amplitude;
                    let samples = sine_wave(440.0, amplitude, offset, FRAME_SIZE);
                    let ts = (offset / FRAME_SIZE) as u64 * FRAME_DURATION_MS;
                    offset += FRAME_SIZE;
                    if !sink.push(AudioFrame::new(ts, samples)) {
                        break;
                    }
                    std::thread::sleep(Duration::from_millis(FRAME_DURATION_MS));
                }
            })
            .map_err(|e| DeviceError::OpenFailed {
                kind: DeviceKind::Microphone,
                reason: e.to_string(),
            })?;
        Ok(stream)
    }

    fn open_speaker(&self, device_id: &str) -> Result<Box<dyn AudioOutput>, DeviceError> {
        self.check(DeviceKind::Speaker, device_id)?;
        Ok(Box::new(VirtualSpeaker {
            played: self.played.clone(),
            playback: self.playback.clone(),
        }))
    }

    fn screen_sources(&self) -> Vec<ScreenSource> {
        self.state.lock().screens.clone()
    }

    fn open_screen(
        &self,
        target: &ScreenCaptureTarget,
        fps: u32,
    ) -> Result<CaptureStream<VideoFrame>, DeviceError> {
        self.check(DeviceKind::Screen, &target.source.id)?;
        let (width, height) = target.capture_size();
        if width == 0 || height == 0 {
            return Err(DeviceError::OpenFailed {
                kind: DeviceKind::Screen,
                reason: "capture rect outside of source".into(),
            });
        }
        let seed = target.source.id.bytes().fold(0u8, |acc, b| acc.wrapping_add(b));
        tracing::info!("Opening screen capture {} ({}x{})", target.source.id, width, height);
        self.spawn_video(DeviceKind::Screen, format!("screen-{}", target.source.id), width, height, fps, seed)
    }

    fn subscribe_changes(&self) -> broadcast::Receiver<DeviceChange> {
        self.changes.subscribe()
    }
}

struct VirtualSpeaker {
    played: Arc<AtomicU64>,
    playback: Arc<Mutex<HeapRb<f32>>>,
}

impl AudioOutput for VirtualSpeaker {
    fn play(&mut self, frame: &AudioFrame) {
        let mut buffer = self.playback.lock();
        for sample in &frame.samples {
            buffer.push_overwrite(*sample);
        }
        self.played
            .fetch_add(frame.samples.len() as u64, Ordering::Relaxed);
    }
}
