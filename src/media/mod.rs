//! Media Module - Media Track Manager
//!
//! Dieses Modul verwaltet alle Medienflüsse einer Engine:
//! - Track-Modell, Encoder- und Darstellungsparameter
//! - Render-Slots mit Raw-Frame Callbacks
//! - Capture-Pipelines mit Rate Control und Dual-Stream
//! - Bildschirmfreigabe als Substream
//! - Abonnements und Wiedergabe entfernter Teilnehmer

mod audio;
mod manager;
mod pipeline;
mod rate;
mod render;
mod screen;
mod track;

pub use audio::{
    resample_linear, rms, sine_wave, AudioFrame, VolumeMeter, CHANNELS, FRAME_DURATION_MS,
    FRAME_SIZE, SAMPLE_RATE,
};
pub use manager::{resolve_tier, MediaTrackManager};
pub use pipeline::{CameraPipeline, MicPipeline, Uplink, VideoVariant};
pub use rate::{RateController, MAX_LEVEL};
pub use render::{
    check_render_binding, i420_len, render_status, BufferType, PixelFormat, RenderSlot,
    VideoFrame, VideoRenderCallback, VideoRenderer,
};
pub use screen::{spawn_pump, ScreenCaptureState, ScreenCommand, ScreenShareController};
pub use track::{
    Direction, FillMode, NetworkQosParam, QosControlMode, QosPreference, ResolutionMode,
    Rotation, StreamType, TrackId, TrackKind, TrackOwner, VideoEncParam, ViewTransform,
    ASPECT_RATIO_TOLERANCE,
};
