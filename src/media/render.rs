//! Render-Pfad: Videobilder, Renderer und Raw-Frame Callbacks
//!
//! Jede Ansicht hat einen [`RenderSlot`]. Ein gebundener Raw-Frame Callback
//! unterdrückt den eingebauten Renderer, bis er wieder gelöscht wird.
//! Nach [`RenderSlot::deactivate`] wird kein Bild mehr zugestellt.

use super::track::{Rotation, StreamType, ViewTransform};
use crate::error::{codes, EngineError};
use crate::signaling::VideoPayload;
use parking_lot::{Mutex, RwLock};
use std::cell::Cell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

// ============================================================================
// FRAME FORMATS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PixelFormat {
    /// Sentinel zum Löschen eines Callbacks
    #[default]
    Unknown,
    I420,
    Bgra32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BufferType {
    /// Sentinel zum Löschen eines Callbacks
    #[default]
    Unknown,
    /// Zusammenhängender Byte-Puffer
    Buffer,
}

/// Ein unkomprimiertes Videobild
#[derive(Debug, Clone, PartialEq)]
pub struct VideoFrame {
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    pub timestamp_ms: u64,
    pub rotation: Rotation,
    pub data: Vec<u8>,
}

/// Byte-Länge eines I420-Bildes
pub fn i420_len(width: u32, height: u32) -> usize {
    let (w, h) = (width as usize, height as usize);
    let chroma = w.div_ceil(2) * h.div_ceil(2);
    w * h + 2 * chroma
}

impl VideoFrame {
    pub fn i420(width: u32, height: u32, timestamp_ms: u64, data: Vec<u8>) -> Self {
        Self {
            format: PixelFormat::I420,
            width,
            height,
            timestamp_ms,
            rotation: Rotation::R0,
            data,
        }
    }

    /// Testbild: horizontaler Luma-Verlauf, verschoben um `seed`
    pub fn test_pattern(width: u32, height: u32, timestamp_ms: u64, seed: u8) -> Self {
        let mut data = vec![128u8; i420_len(width, height)];
        let w = width as usize;
        for row in 0..height as usize {
            for col in 0..w {
                data[row * w + col] = ((col * 255 / w.max(1)) as u8).wrapping_add(seed);
            }
        }
        Self::i420(width, height, timestamp_ms, data)
    }

    pub fn is_valid(&self) -> bool {
        match self.format {
            PixelFormat::I420 => self.data.len() >= i420_len(self.width, self.height),
            PixelFormat::Bgra32 => self.data.len() >= (self.width * self.height * 4) as usize,
            PixelFormat::Unknown => false,
        }
    }

    /// Konvertiert in das gewünschte Format (nur I420 → BGRA32 wird unterstützt)
    pub fn convert(&self, format: PixelFormat) -> Option<VideoFrame> {
        if !self.is_valid() {
            return None;
        }
        match (self.format, format) {
            (a, b) if a == b => Some(self.clone()),
            (PixelFormat::I420, PixelFormat::Bgra32) => Some(self.i420_to_bgra32()),
            _ => None,
        }
    }

    fn i420_to_bgra32(&self) -> VideoFrame {
        let (w, h) = (self.width as usize, self.height as usize);
        let cw = w.div_ceil(2);
        let y_size = w * h;
        let uv_size = cw * h.div_ceil(2);

        let y_plane = &self.data[..y_size];
        let u_plane = &self.data[y_size..y_size + uv_size];
        let v_plane = &self.data[y_size + uv_size..y_size + 2 * uv_size];

        let mut bgra = Vec::with_capacity(y_size * 4);
        for row in 0..h {
            for col in 0..w {
                let uv_idx = (row / 2) * cw + col / 2;
                let y = y_plane[row * w + col] as f32;
                let u = u_plane[uv_idx] as f32 - 128.0;
                let v = v_plane[uv_idx] as f32 - 128.0;

                let r = (y + 1.402 * v).clamp(0.0, 255.0) as u8;
                let g = (y - 0.344 * u - 0.714 * v).clamp(0.0, 255.0) as u8;
                let b = (y + 1.772 * u).clamp(0.0, 255.0) as u8;
                bgra.extend_from_slice(&[b, g, r, 255]);
            }
        }

        VideoFrame {
            format: PixelFormat::Bgra32,
            width: self.width,
            height: self.height,
            timestamp_ms: self.timestamp_ms,
            rotation: self.rotation,
            data: bgra,
        }
    }

    /// Nearest-Neighbour Skalierung eines I420-Bildes
    pub fn scale_i420(&self, width: u32, height: u32) -> VideoFrame {
        if self.format != PixelFormat::I420
            || !self.is_valid()
            || (width == self.width && height == self.height)
        {
            return self.clone();
        }

        let (sw, sh) = (self.width as usize, self.height as usize);
        let (dw, dh) = (width.max(1) as usize, height.max(1) as usize);
        let mut out = vec![0u8; i420_len(dw as u32, dh as u32)];

        let plane = |src: &[u8], src_w: usize, src_h: usize, dst: &mut [u8], dst_w: usize, dst_h: usize| {
            for row in 0..dst_h {
                let src_row = row * src_h / dst_h;
                for col in 0..dst_w {
                    let src_col = col * src_w / dst_w;
                    dst[row * dst_w + col] = src[src_row * src_w + src_col];
                }
            }
        };

        let (scw, sch) = (sw.div_ceil(2), sh.div_ceil(2));
        let (dcw, dch) = (dw.div_ceil(2), dh.div_ceil(2));
        let (src_y, src_uv) = self.data.split_at(sw * sh);
        let (src_u, src_v) = src_uv.split_at(scw * sch);
        let (dst_y, dst_uv) = out.split_at_mut(dw * dh);
        let (dst_u, dst_v) = dst_uv.split_at_mut(dcw * dch);

        plane(src_y, sw, sh, dst_y, dw, dh);
        plane(src_u, scw, sch, dst_u, dcw, dch);
        plane(src_v, scw, sch, dst_v, dcw, dch);

        VideoFrame {
            format: PixelFormat::I420,
            width: dw as u32,
            height: dh as u32,
            timestamp_ms: self.timestamp_ms,
            rotation: self.rotation,
            data: out,
        }
    }

    pub fn to_payload(&self) -> VideoPayload {
        VideoPayload {
            width: self.width,
            height: self.height,
            timestamp_ms: self.timestamp_ms,
            rotation: self.rotation.degrees(),
            data: self.data.clone(),
        }
    }

    pub fn from_payload(payload: VideoPayload) -> Self {
        Self {
            format: PixelFormat::I420,
            width: payload.width,
            height: payload.height,
            timestamp_ms: payload.timestamp_ms,
            rotation: Rotation::from_degrees(payload.rotation),
            data: payload.data,
        }
    }
}

// ============================================================================
// SINKS
// ============================================================================

/// Eingebaute Darstellungsfläche
pub trait VideoRenderer: Send + Sync {
    fn render(&self, frame: &VideoFrame, transform: &ViewTransform);
}

/// Raw-Frame Callback der Anwendung. `user_id` ist leer für lokale Bilder.
pub trait VideoRenderCallback: Send + Sync {
    fn on_render_video_frame(&self, user_id: &str, stream: StreamType, frame: &VideoFrame);
}

#[derive(Clone)]
struct CustomRender {
    format: PixelFormat,
    callback: Arc<dyn VideoRenderCallback>,
}

/// Prüft ein Callback-Binding. `Ok(None)` bedeutet: Callback löschen.
pub fn check_render_binding(
    format: PixelFormat,
    buffer: BufferType,
    callback: Option<&Arc<dyn VideoRenderCallback>>,
) -> Result<Option<PixelFormat>, EngineError> {
    match (format, buffer, callback) {
        (_, _, None) | (PixelFormat::Unknown, BufferType::Unknown, _) => Ok(None),
        (PixelFormat::I420 | PixelFormat::Bgra32, BufferType::Buffer, Some(_)) => Ok(Some(format)),
        _ => Err(EngineError::UnsupportedRenderFormat),
    }
}

/// Status-Code für die Rückgabe der Binding-Aufrufe
pub fn render_status(result: &Result<(), EngineError>) -> i32 {
    match result {
        Ok(()) => codes::OK,
        Err(e) => e.code(),
    }
}

#[derive(Clone, Default)]
struct RenderSink {
    renderer: Option<Arc<dyn VideoRenderer>>,
    custom: Option<CustomRender>,
    transform: ViewTransform,
}

thread_local! {
    /// Adresse des Slots, dessen Zustellung gerade auf diesem Thread läuft
    static DELIVERING: Cell<usize> = const { Cell::new(0) };
}

/// Zustellpunkt einer Ansicht
pub struct RenderSlot {
    user_id: String,
    stream: RwLock<StreamType>,
    sink: RwLock<RenderSink>,
    delivery: Mutex<()>,
    active: AtomicBool,
}

impl RenderSlot {
    pub fn new(user_id: impl Into<String>, stream: StreamType) -> Arc<Self> {
        Arc::new(Self {
            user_id: user_id.into(),
            stream: RwLock::new(stream),
            sink: RwLock::new(RenderSink::default()),
            delivery: Mutex::new(()),
            active: AtomicBool::new(true),
        })
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn set_stream(&self, stream: StreamType) {
        *self.stream.write() = stream;
    }

    pub fn set_renderer(&self, renderer: Option<Arc<dyn VideoRenderer>>) {
        self.sink.write().renderer = renderer;
    }

    pub fn has_renderer(&self) -> bool {
        self.sink.read().renderer.is_some()
    }

    pub fn set_callback(&self, format: Option<PixelFormat>, callback: Option<Arc<dyn VideoRenderCallback>>) {
        let mut sink = self.sink.write();
        sink.custom = match (format, callback) {
            (Some(format), Some(callback)) => Some(CustomRender { format, callback }),
            _ => None,
        };
    }

    pub fn has_callback(&self) -> bool {
        self.sink.read().custom.is_some()
    }

    pub fn transform(&self) -> ViewTransform {
        self.sink.read().transform
    }

    pub fn update_transform(&self, update: impl FnOnce(&mut ViewTransform)) {
        update(&mut self.sink.write().transform);
    }

    /// Stellt ein Bild zu. Ohne Binding wird das Bild verworfen.
    pub fn deliver(&self, frame: &VideoFrame) {
        let _delivery = self.delivery.lock();
        if !self.is_active() {
            return;
        }
        // Snapshot, damit Callbacks das Binding ändern dürfen
        let sink = self.sink.read().clone();

        let marker = self as *const _ as usize;
        let previous = DELIVERING.with(|d| d.replace(marker));

        if let Some(custom) = &sink.custom {
            let stream = *self.stream.read();
            match frame.convert(custom.format) {
                Some(converted) => custom
                    .callback
                    .on_render_video_frame(&self.user_id, stream, &converted),
                None => tracing::trace!("Dropping frame, no conversion to {:?}", custom.format),
            }
        } else if let Some(renderer) = &sink.renderer {
            renderer.render(frame, &sink.transform);
        }

        DELIVERING.with(|d| d.set(previous));
    }

    /// Beendet die Zustellung. Kehrt erst zurück, wenn keine Zustellung mehr
    /// läuft (außer der Aufruf kommt aus dieser Zustellung selbst).
    /// Darf nicht unter einem Lock aufgerufen werden, den ein Callback braucht.
    pub fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
        let marker = self as *const _ as usize;
        if DELIVERING.with(|d| d.get()) != marker {
            drop(self.delivery.lock());
        }
    }
}

impl std::fmt::Debug for RenderSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderSlot")
            .field("user_id", &self.user_id)
            .field("stream", &*self.stream.read())
            .field("active", &self.is_active())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Collect {
        frames: Mutex<Vec<(PixelFormat, u32)>>,
    }

    impl VideoRenderer for Collect {
        fn render(&self, frame: &VideoFrame, _transform: &ViewTransform) {
            self.frames.lock().push((frame.format, frame.width));
        }
    }

    impl VideoRenderCallback for Collect {
        fn on_render_video_frame(&self, _user_id: &str, _stream: StreamType, frame: &VideoFrame) {
            self.frames.lock().push((frame.format, frame.width));
        }
    }

    #[test]
    fn test_callback_suppresses_renderer() {
        let slot = RenderSlot::new("bob", StreamType::Big);
        let renderer = Arc::new(Collect::default());
        let callback = Arc::new(Collect::default());
        slot.set_renderer(Some(renderer.clone()));

        let frame = VideoFrame::test_pattern(4, 4, 0, 0);
        slot.deliver(&frame);
        assert_eq!(renderer.frames.lock().len(), 1);

        slot.set_callback(Some(PixelFormat::Bgra32), Some(callback.clone()));
        slot.deliver(&frame);
        assert_eq!(renderer.frames.lock().len(), 1);
        assert_eq!(callback.frames.lock()[0], (PixelFormat::Bgra32, 4));

        // Löschen stellt den Renderer wieder her
        slot.set_callback(None, None);
        slot.deliver(&frame);
        assert_eq!(renderer.frames.lock().len(), 2);
    }

    #[test]
    fn test_no_delivery_after_deactivate() {
        let slot = RenderSlot::new("bob", StreamType::Big);
        let renderer = Arc::new(Collect::default());
        slot.set_renderer(Some(renderer.clone()));
        slot.deactivate();
        slot.deliver(&VideoFrame::test_pattern(4, 4, 0, 0));
        assert!(renderer.frames.lock().is_empty());
    }

    #[test]
    fn test_render_binding_validation() {
        let cb: Arc<dyn VideoRenderCallback> = Arc::new(Collect::default());
        assert_eq!(
            check_render_binding(PixelFormat::I420, BufferType::Buffer, Some(&cb)),
            Ok(Some(PixelFormat::I420))
        );
        assert_eq!(
            check_render_binding(PixelFormat::Unknown, BufferType::Unknown, Some(&cb)),
            Ok(None)
        );
        assert_eq!(
            check_render_binding(PixelFormat::Bgra32, BufferType::Buffer, None),
            Ok(None)
        );
        assert_eq!(
            check_render_binding(PixelFormat::Unknown, BufferType::Buffer, Some(&cb)),
            Err(EngineError::UnsupportedRenderFormat)
        );
        assert_eq!(
            check_render_binding(PixelFormat::I420, BufferType::Unknown, Some(&cb)),
            Err(EngineError::UnsupportedRenderFormat)
        );
    }

    #[test]
    fn test_i420_to_bgra_grey() {
        let frame = VideoFrame::i420(2, 2, 0, vec![128, 128, 128, 128, 128, 128]);
        let bgra = frame.convert(PixelFormat::Bgra32).unwrap();
        assert_eq!(bgra.data.len(), 16);
        assert_eq!(&bgra.data[..4], &[128, 128, 128, 255]);
        assert!(bgra.convert(PixelFormat::I420).is_none());
    }

    #[test]
    fn test_scale_keeps_plane_layout() {
        let frame = VideoFrame::test_pattern(64, 36, 5, 0);
        let small = frame.scale_i420(16, 9);
        assert_eq!((small.width, small.height), (16, 9));
        assert_eq!(small.data.len(), i420_len(16, 9));
        assert!(small.is_valid());
        assert_eq!(small.timestamp_ms, 5);
    }
}
