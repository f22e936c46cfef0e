//! Lokale Capture-Pipelines
//!
//! Jede Pipeline wird von einer Capture-Task gespeist und arbeitet ohne den
//! Engine-Lock: Vorschau zustellen, Rate Control, Pakete auf den Uplink legen.

use super::audio::{AudioFrame, VolumeMeter};
use super::rate::RateController;
use super::render::{RenderSlot, VideoFrame};
use super::track::{QosPreference, Rotation, StreamType, VideoEncParam};
use crate::callback::{EventEmitter, RoomEvent};
use crate::devices::DeviceManager;
use crate::signaling::{ClientMessage, Quality, TransportLink};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

// ============================================================================
// UPLINK
// ============================================================================

/// Gemeinsamer Sendeweg aller lokalen Pipelines. Ohne Link wird nichts gesendet.
#[derive(Default)]
pub struct Uplink {
    link: RwLock<Option<Arc<dyn TransportLink>>>,
    sent_bytes: AtomicU64,
}

impl Uplink {
    pub fn attach(&self, link: Arc<dyn TransportLink>) {
        *self.link.write() = Some(link);
    }

    pub fn detach(&self) {
        *self.link.write() = None;
    }

    pub fn is_attached(&self) -> bool {
        self.link.read().is_some()
    }

    /// `false` wenn kein Link existiert oder das Senden scheitert
    pub fn send(&self, msg: ClientMessage) -> bool {
        let link = self.link.read().clone();
        let Some(link) = link else {
            return false;
        };
        let size = match &msg {
            ClientMessage::VideoPacket { frame, .. } => frame.data.len(),
            ClientMessage::AudioPacket { frame } => frame.data.len(),
            ClientMessage::CustomCmd { data, .. } => data.len(),
            _ => 0,
        };
        match link.send(msg) {
            Ok(()) => {
                self.sent_bytes.fetch_add(size as u64, Ordering::Relaxed);
                true
            }
            Err(e) => {
                tracing::debug!("Uplink send failed: {}", e);
                false
            }
        }
    }

    pub fn sent_bytes(&self) -> u64 {
        self.sent_bytes.load(Ordering::Relaxed)
    }

    pub fn reset_counters(&self) {
        self.sent_bytes.store(0, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for Uplink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Uplink")
            .field("attached", &self.is_attached())
            .field("sent_bytes", &self.sent_bytes())
            .finish()
    }
}

// ============================================================================
// VIDEO VARIANT
// ============================================================================

/// Eine encodierte Variante (Big, Small oder Sub) mit eigener Rate Control
#[derive(Debug)]
pub struct VideoVariant {
    stream: StreamType,
    rate: Mutex<RateController>,
    frames_sent: AtomicU64,
    last_size: Mutex<(u32, u32)>,
}

impl VideoVariant {
    pub fn new(stream: StreamType, param: VideoEncParam, preference: QosPreference) -> Self {
        Self {
            stream,
            rate: Mutex::new(RateController::new(param, preference)),
            frames_sent: AtomicU64::new(0),
            last_size: Mutex::new((0, 0)),
        }
    }

    pub fn stream(&self) -> StreamType {
        self.stream
    }

    pub fn set_param(&self, param: VideoEncParam) {
        self.rate.lock().set_param(param);
    }

    pub fn param(&self) -> VideoEncParam {
        *self.rate.lock().param()
    }

    pub fn set_preference(&self, preference: QosPreference) {
        self.rate.lock().set_preference(preference);
    }

    pub fn on_quality(&self, quality: Quality) {
        self.rate.lock().on_quality(quality);
    }

    /// Skaliert und sendet das Bild, wenn das Pacing es zulässt
    pub fn push(&self, frame: &VideoFrame, rotation: Rotation, uplink: &Uplink) -> bool {
        if !uplink.is_attached() {
            return false;
        }
        let size = {
            let mut rate = self.rate.lock();
            if !rate.should_send(frame.timestamp_ms) {
                return false;
            }
            rate.output_size()
        };
        let mut encoded = frame.scale_i420(size.0, size.1);
        encoded.rotation = encoded.rotation.combine(rotation);
        let sent = uplink.send(ClientMessage::VideoPacket {
            stream: self.stream,
            frame: encoded.to_payload(),
        });
        if sent {
            self.frames_sent.fetch_add(1, Ordering::Relaxed);
            *self.last_size.lock() = (encoded.width, encoded.height);
        }
        sent
    }

    pub fn statistics(&self) -> crate::callback::LocalStatistics {
        let rate = self.rate.lock();
        let (width, height) = *self.last_size.lock();
        crate::callback::LocalStatistics {
            stream: self.stream,
            width,
            height,
            frame_rate: rate.target_fps(),
            video_bitrate_kbps: rate.target_bitrate_kbps(),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
        }
    }
}

// ============================================================================
// CAMERA
// ============================================================================

/// Kamera: Vorschau plus Big- und optional Small-Variante
pub struct CameraPipeline {
    uplink: Arc<Uplink>,
    preview: Arc<RenderSlot>,
    emitter: EventEmitter,
    muted: AtomicBool,
    rotation: AtomicU32,
    big: VideoVariant,
    small: RwLock<Option<Arc<VideoVariant>>>,
    first_frame: AtomicBool,
}

impl CameraPipeline {
    pub fn new(
        uplink: Arc<Uplink>,
        preview: Arc<RenderSlot>,
        emitter: EventEmitter,
        big: VideoEncParam,
        preference: QosPreference,
    ) -> Self {
        Self {
            uplink,
            preview,
            emitter,
            muted: AtomicBool::new(false),
            rotation: AtomicU32::new(0),
            big: VideoVariant::new(StreamType::Big, big, preference),
            small: RwLock::new(None),
            first_frame: AtomicBool::new(false),
        }
    }

    pub fn preview(&self) -> &Arc<RenderSlot> {
        &self.preview
    }

    pub fn big(&self) -> &VideoVariant {
        &self.big
    }

    pub fn set_small(&self, small: Option<(VideoEncParam, QosPreference)>) {
        *self.small.write() =
            small.map(|(param, pref)| Arc::new(VideoVariant::new(StreamType::Small, param, pref)));
    }

    pub fn small(&self) -> Option<Arc<VideoVariant>> {
        self.small.read().clone()
    }

    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::Release);
    }

    pub fn set_rotation(&self, rotation: Rotation) {
        self.rotation.store(rotation.degrees(), Ordering::Relaxed);
    }

    pub fn on_quality(&self, quality: Quality) {
        self.big.on_quality(quality);
        if let Some(small) = self.small() {
            small.on_quality(quality);
        }
    }

    pub fn set_preference(&self, preference: QosPreference) {
        self.big.set_preference(preference);
        if let Some(small) = self.small() {
            small.set_preference(preference);
        }
    }

    pub fn on_frame(&self, frame: VideoFrame) {
        if !self.first_frame.swap(true, Ordering::AcqRel) {
            self.emitter.emit(RoomEvent::FirstVideoFrame {
                user_id: String::new(),
                stream: StreamType::Big,
                width: frame.width,
                height: frame.height,
            });
        }
        self.preview.deliver(&frame);

        if self.muted.load(Ordering::Acquire) || !self.uplink.is_attached() {
            return;
        }
        let rotation = Rotation::from_degrees(self.rotation.load(Ordering::Relaxed));
        self.big.push(&frame, rotation, &self.uplink);
        if let Some(small) = self.small() {
            small.push(&frame, rotation, &self.uplink);
        }
    }

    pub fn statistics(&self) -> Vec<crate::callback::LocalStatistics> {
        let mut stats = vec![self.big.statistics()];
        if let Some(small) = self.small() {
            stats.push(small.statistics());
        }
        stats
    }
}

impl std::fmt::Debug for CameraPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CameraPipeline")
            .field("muted", &self.muted.load(Ordering::Relaxed))
            .field("dual", &self.small.read().is_some())
            .finish()
    }
}

// ============================================================================
// MICROPHONE
// ============================================================================

pub struct MicPipeline {
    uplink: Arc<Uplink>,
    devices: Arc<DeviceManager>,
    muted: AtomicBool,
    meter: Mutex<VolumeMeter>,
    frames_sent: AtomicU64,
}

impl MicPipeline {
    pub fn new(uplink: Arc<Uplink>, devices: Arc<DeviceManager>, smooth: usize) -> Self {
        Self {
            uplink,
            devices,
            muted: AtomicBool::new(false),
            meter: Mutex::new(VolumeMeter::new(smooth)),
            frames_sent: AtomicU64::new(0),
        }
    }

    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::Release);
    }

    pub fn volume(&self) -> u32 {
        if self.muted.load(Ordering::Acquire) {
            return 0;
        }
        self.meter.lock().volume()
    }

    pub fn set_smoothing(&self, smooth: usize) {
        *self.meter.lock() = VolumeMeter::new(smooth);
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent.load(Ordering::Relaxed)
    }

    pub fn on_frame(&self, frame: AudioFrame) {
        let mut frame = frame.normalized();
        frame.apply_volume(self.devices.mic_volume());
        self.meter.lock().feed(&frame.samples);

        if self.muted.load(Ordering::Acquire) {
            return;
        }
        if self.uplink.send(ClientMessage::AudioPacket {
            frame: frame.to_payload(),
        }) {
            self.frames_sent.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl std::fmt::Debug for MicPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MicPipeline")
            .field("muted", &self.muted.load(Ordering::Relaxed))
            .field("frames_sent", &self.frames_sent())
            .finish()
    }
}
