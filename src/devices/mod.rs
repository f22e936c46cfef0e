//! Devices Module - Capture-Adapter für Kamera, Mikrofon, Lautsprecher und Bildschirm
//!
//! Die Engine spricht Geräte nur über [`DeviceBackend`] an. Geöffnete Quellen
//! liefern einen [`CaptureStream`]; wird der Stream gedroppt, beendet die Quelle
//! ihre Aufnahme.

mod synthetic;

pub use synthetic::VirtualDeviceBackend;

use crate::error::codes;
use crate::media::{AudioFrame, VideoFrame};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeviceError {
    #[error("{kind:?} device not found: {id}")]
    NotFound { kind: DeviceKind, id: String },

    #[error("Failed to open {kind:?}: {reason}")]
    OpenFailed { kind: DeviceKind, reason: String },

    #[error("No screen capture target selected")]
    NoScreenTarget,
}

impl DeviceError {
    pub fn code(&self) -> i32 {
        match self {
            DeviceError::NotFound { .. } => codes::ERR_DEVICE_NOT_FOUND,
            DeviceError::OpenFailed { kind, .. } => match kind {
                DeviceKind::Camera => codes::ERR_CAMERA_START_FAIL,
                DeviceKind::Microphone => codes::ERR_MIC_START_FAIL,
                DeviceKind::Speaker => codes::ERR_SPEAKER_START_FAIL,
                DeviceKind::Screen => codes::ERR_SCREEN_CAPTURE_START_FAIL,
            },
            DeviceError::NoScreenTarget => codes::ERR_SCREEN_CAPTURE_NO_TARGET,
        }
    }
}

// ============================================================================
// DEVICE MODEL
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    Camera,
    Microphone,
    Speaker,
    Screen,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub id: String,
    pub name: String,
    pub kind: DeviceKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceState {
    Added,
    Removed,
    Active,
}

/// Hotplug-Benachrichtigung des Backends
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceChange {
    pub device_id: String,
    pub kind: DeviceKind,
    pub state: DeviceState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScreenSourceKind {
    Screen,
    Window,
}

/// Eine freigebbare Quelle (ganzer Bildschirm oder Fenster)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScreenSource {
    pub id: String,
    pub name: String,
    pub kind: ScreenSourceKind,
    pub width: u32,
    pub height: u32,
}

/// Ausschnitt innerhalb einer Quelle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScreenCaptureTarget {
    pub source: ScreenSource,
    /// `None` = ganze Quelle
    pub rect: Option<CaptureRect>,
    pub capture_mouse: bool,
    pub highlight_window: bool,
}

impl ScreenCaptureTarget {
    pub fn whole(source: ScreenSource) -> Self {
        Self {
            source,
            rect: None,
            capture_mouse: true,
            highlight_window: false,
        }
    }

    /// Größe der gelieferten Bilder, Ausschnitt auf die Quelle begrenzt
    pub fn capture_size(&self) -> (u32, u32) {
        match self.rect {
            Some(rect) => (
                rect.width.min(self.source.width.saturating_sub(rect.x)),
                rect.height.min(self.source.height.saturating_sub(rect.y)),
            ),
            None => (self.source.width, self.source.height),
        }
    }
}

// ============================================================================
// CAPTURE STREAMS
// ============================================================================

/// Empfangsseite einer laufenden Aufnahme
#[derive(Debug)]
pub struct CaptureStream<T> {
    frames: mpsc::Receiver<T>,
    stop: Arc<AtomicBool>,
}

/// Sendeseite, gehalten vom Capture-Thread
#[derive(Debug, Clone)]
pub struct CaptureSink<T> {
    tx: mpsc::Sender<T>,
    stop: Arc<AtomicBool>,
}

/// Erzeugt ein gebundenes Paar aus Sink und Stream
pub fn capture_channel<T>(capacity: usize) -> (CaptureSink<T>, CaptureStream<T>) {
    let (tx, frames) = mpsc::channel(capacity.max(1));
    let stop = Arc::new(AtomicBool::new(false));
    (
        CaptureSink {
            tx,
            stop: stop.clone(),
        },
        CaptureStream { frames, stop },
    )
}

impl<T> CaptureStream<T> {
    pub async fn next(&mut self) -> Option<T> {
        self.frames.recv().await
    }

    pub fn try_next(&mut self) -> Option<T> {
        self.frames.try_recv().ok()
    }
}

impl<T> Drop for CaptureStream<T> {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
    }
}

impl<T> CaptureSink<T> {
    /// Reicht ein Element weiter. Bei vollem Kanal wird es verworfen.
    /// `false` wenn die Aufnahme beendet werden soll.
    pub fn push(&self, item: T) -> bool {
        if self.is_stopped() {
            return false;
        }
        match self.tx.try_send(item) {
            Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => true,
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire) || self.tx.is_closed()
    }
}

// ============================================================================
// BACKEND BOUNDARY
// ============================================================================

/// Wiedergabe-Gerät
pub trait AudioOutput: Send {
    fn play(&mut self, frame: &AudioFrame);
}

/// Schnittstelle zu den Medien-APIs des Betriebssystems.
/// Alle `open_*` Aufrufe dürfen blockieren.
pub trait DeviceBackend: Send + Sync {
    fn devices(&self, kind: DeviceKind) -> Vec<DeviceInfo>;

    fn open_camera(
        &self,
        device_id: &str,
        width: u32,
        height: u32,
        fps: u32,
    ) -> Result<CaptureStream<VideoFrame>, DeviceError>;

    fn open_microphone(&self, device_id: &str) -> Result<CaptureStream<AudioFrame>, DeviceError>;

    fn open_speaker(&self, device_id: &str) -> Result<Box<dyn AudioOutput>, DeviceError>;

    fn screen_sources(&self) -> Vec<ScreenSource>;

    fn open_screen(
        &self,
        target: &ScreenCaptureTarget,
        fps: u32,
    ) -> Result<CaptureStream<VideoFrame>, DeviceError>;

    fn subscribe_changes(&self) -> broadcast::Receiver<DeviceChange>;
}

// ============================================================================
// DEVICE MANAGER
// ============================================================================

/// Geräteauswahl und Lautstärken
pub struct DeviceManager {
    backend: Arc<dyn DeviceBackend>,
    selected: RwLock<HashMap<DeviceKind, String>>,
    mic_volume: AtomicU32,
    speaker_volume: AtomicU32,
}

impl DeviceManager {
    pub fn new(backend: Arc<dyn DeviceBackend>) -> Self {
        Self {
            backend,
            selected: RwLock::new(HashMap::new()),
            mic_volume: AtomicU32::new(100),
            speaker_volume: AtomicU32::new(100),
        }
    }

    pub fn backend(&self) -> &Arc<dyn DeviceBackend> {
        &self.backend
    }

    pub fn devices(&self, kind: DeviceKind) -> Vec<DeviceInfo> {
        self.backend.devices(kind)
    }

    /// Gewähltes Gerät, sonst das erste verfügbare
    pub fn current(&self, kind: DeviceKind) -> Option<DeviceInfo> {
        let devices = self.backend.devices(kind);
        let selected = self.selected.read().get(&kind).cloned();
        selected
            .and_then(|id| devices.iter().find(|d| d.id == id).cloned())
            .or_else(|| devices.into_iter().next())
    }

    pub fn select(&self, kind: DeviceKind, device_id: &str) -> Result<(), DeviceError> {
        if !self.backend.devices(kind).iter().any(|d| d.id == device_id) {
            return Err(DeviceError::NotFound {
                kind,
                id: device_id.to_string(),
            });
        }
        tracing::info!("Selected {:?} device {}", kind, device_id);
        self.selected.write().insert(kind, device_id.to_string());
        Ok(())
    }

    /// Id des aktuellen Geräts oder Fehler, wenn keines existiert
    pub fn current_id(&self, kind: DeviceKind) -> Result<String, DeviceError> {
        self.current(kind)
            .map(|d| d.id)
            .ok_or_else(|| DeviceError::NotFound {
                kind,
                id: String::new(),
            })
    }

    pub fn set_mic_volume(&self, volume: u32) {
        self.mic_volume.store(volume.min(100), Ordering::Relaxed);
    }

    pub fn mic_volume(&self) -> u32 {
        self.mic_volume.load(Ordering::Relaxed)
    }

    pub fn set_speaker_volume(&self, volume: u32) {
        self.speaker_volume.store(volume.min(100), Ordering::Relaxed);
    }

    pub fn speaker_volume(&self) -> u32 {
        self.speaker_volume.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for DeviceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceManager")
            .field("selected", &*self.selected.read())
            .field("mic_volume", &self.mic_volume())
            .field("speaker_volume", &self.speaker_volume())
            .finish()
    }
}
