//! Media Track Manager
//!
//! Besitzt alle lokalen und entfernten Tracks einer Engine. Läuft unter dem
//! Engine-Lock; Bildzustellung und das Deaktivieren von Slots passieren danach.
//! Entfernte Ansichten referenzieren Teilnehmer nur über ihre Nutzer-Id.

use super::audio::{AudioFrame, VolumeMeter};
use super::pipeline::{CameraPipeline, MicPipeline, Uplink, VideoVariant};
use super::render::{
    check_render_binding, BufferType, PixelFormat, RenderSlot, VideoFrame, VideoRenderCallback,
    VideoRenderer,
};
use super::screen::{ScreenCaptureState, ScreenShareController};
use super::track::{
    FillMode, NetworkQosParam, Rotation, StreamType, TrackId, TrackKind, VideoEncParam,
    ViewTransform,
};
use crate::callback::{EventEmitter, LocalStatistics, RemoteStatistics, RoomEvent, VolumeInfo};
use crate::devices::{AudioOutput, CaptureStream, DeviceError, DeviceManager, ScreenCaptureTarget};
use crate::error::{EngineError, EngineResult};
use crate::session::{ParticipantUpdate, RoomSession};
use crate::signaling::{ClientMessage, Quality, TransportLink};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

/// Anzahl Blöcke im Pegel-Mittel, solange nichts anderes eingestellt ist
const DEFAULT_VOLUME_SMOOTHING: usize = 5;

/// Wählt die abonnierte Stufe. Bevorzugt `preferred`, fällt auf das zurück,
/// was der Sender tatsächlich liefert, und nimmt Big wenn beides da ist.
pub fn resolve_tier(preferred: StreamType, big: bool, small: bool) -> Option<StreamType> {
    match preferred {
        StreamType::Small if small => Some(StreamType::Small),
        _ if big => Some(StreamType::Big),
        _ if small => Some(StreamType::Small),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct PublishFlags {
    audio: bool,
    video: bool,
    small_video: bool,
    sub_video: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ViewKey {
    user_id: String,
    sub: bool,
}

impl ViewKey {
    fn main(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            sub: false,
        }
    }

    fn sub(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            sub: true,
        }
    }

    fn track_id(&self) -> TrackId {
        let kind = if self.sub {
            TrackKind::VideoSub
        } else {
            TrackKind::VideoMain
        };
        TrackId::remote(&self.user_id, kind)
    }
}

#[derive(Debug)]
struct RemoteView {
    slot: Arc<RenderSlot>,
    subscribed: Option<StreamType>,
    first_frame: bool,
    frames: u64,
    size: (u32, u32),
}

#[derive(Debug)]
struct RemoteAudio {
    meter: VolumeMeter,
    first_frame: bool,
    frames: u64,
}

// ============================================================================
// MEDIA TRACK MANAGER
// ============================================================================

pub struct MediaTrackManager {
    runtime: Handle,
    devices: Arc<DeviceManager>,
    emitter: EventEmitter,
    uplink: Arc<Uplink>,

    // Kamera und lokale Vorschau
    camera_generation: u64,
    camera: Option<Arc<CameraPipeline>>,
    camera_task: Option<JoinHandle<()>>,
    local_renderer: Option<Arc<dyn VideoRenderer>>,
    local_callback: Option<(PixelFormat, Arc<dyn VideoRenderCallback>)>,
    local_transform: ViewTransform,
    video_muted: bool,
    encoder: VideoEncParam,
    small: Option<VideoEncParam>,
    qos: NetworkQosParam,
    encoder_rotation: Rotation,

    // Mikrofon
    mic_generation: u64,
    mic: Option<Arc<MicPipeline>>,
    mic_task: Option<JoinHandle<()>>,
    audio_muted: bool,
    volume_smoothing: usize,

    // Substream
    screen: ScreenShareController,
    sub_variant: Arc<VideoVariant>,
    sub_mix_volume: u32,

    last_published: Option<PublishFlags>,

    // Entfernte Tracks
    views: HashMap<ViewKey, RemoteView>,
    tier_overrides: HashMap<String, StreamType>,
    default_tier: StreamType,
    remote_audio: HashMap<String, RemoteAudio>,
    mute_all_remote: bool,
    remote_mute_overrides: HashMap<String, bool>,
    speaker: Option<Box<dyn AudioOutput>>,
    received_bytes: u64,

    retired: Vec<Arc<RenderSlot>>,
}

impl MediaTrackManager {
    pub fn new(runtime: Handle, devices: Arc<DeviceManager>, emitter: EventEmitter) -> Self {
        let qos = NetworkQosParam::default();
        let sub = VideoEncParam::sub_default();
        Self {
            runtime,
            devices,
            emitter,
            uplink: Arc::new(Uplink::default()),
            camera_generation: 0,
            camera: None,
            camera_task: None,
            local_renderer: None,
            local_callback: None,
            local_transform: ViewTransform::default(),
            video_muted: false,
            encoder: VideoEncParam::main_default(),
            small: None,
            qos,
            encoder_rotation: Rotation::R0,
            mic_generation: 0,
            mic: None,
            mic_task: None,
            audio_muted: false,
            volume_smoothing: DEFAULT_VOLUME_SMOOTHING,
            screen: ScreenShareController::new(),
            sub_variant: Arc::new(VideoVariant::new(StreamType::Sub, sub, qos.preference)),
            sub_mix_volume: 100,
            last_published: None,
            views: HashMap::new(),
            tier_overrides: HashMap::new(),
            default_tier: StreamType::Big,
            remote_audio: HashMap::new(),
            mute_all_remote: false,
            remote_mute_overrides: HashMap::new(),
            speaker: None,
            received_bytes: 0,
            retired: Vec::new(),
        }
    }

    /// Slots, die seit dem letzten Aufruf stillgelegt wurden. Der Aufrufer
    /// muss sie ohne Engine-Lock deaktivieren.
    pub fn take_retired(&mut self) -> Vec<Arc<RenderSlot>> {
        std::mem::take(&mut self.retired)
    }

    // ========================================================================
    // LINK LIFECYCLE
    // ========================================================================

    /// Raum betreten: Veröffentlichung und Abonnements beginnen
    pub fn attach_link(&mut self, link: Arc<dyn TransportLink>, session: &mut RoomSession) {
        self.uplink.reset_counters();
        self.uplink.attach(link);
        self.received_bytes = 0;
        self.resync(session);
    }

    /// Nach einem Reconnect: Status erneut melden, Abonnements neu anfordern
    pub fn resync(&mut self, session: &mut RoomSession) {
        self.last_published = None;
        self.sync_publish();
        let keys: Vec<ViewKey> = self.views.keys().cloned().collect();
        for key in keys {
            if let Some(view) = self.views.get_mut(&key) {
                view.subscribed = None;
            }
            self.reconcile(session, &key);
        }
    }

    /// Link weg (Fehlerzustand): nichts mehr senden, Ansichten bleiben
    pub fn detach(&mut self) {
        self.uplink.detach();
        self.last_published = None;
        for view in self.views.values_mut() {
            view.subscribed = None;
        }
    }

    pub fn is_attached(&self) -> bool {
        self.uplink.is_attached()
    }

    pub fn sent_bytes(&self) -> u64 {
        self.uplink.sent_bytes()
    }

    pub fn received_bytes(&self) -> u64 {
        self.received_bytes
    }

    /// Baut alles ab, was zu einer Raum-Sitzung gehört, inklusive Vorschau
    pub fn teardown(&mut self) {
        self.stop_camera();
        self.stop_mic();
        if self.stop_screen() {
            self.emitter.emit(RoomEvent::ScreenCaptureStopped { reason: 0 });
        }
        for (_, view) in self.views.drain() {
            self.retired.push(view.slot);
        }
        self.tier_overrides.clear();
        self.default_tier = StreamType::Big;
        self.remote_audio.clear();
        self.remote_mute_overrides.clear();
        self.mute_all_remote = false;
        self.speaker = None;
        self.video_muted = false;
        self.audio_muted = false;
        self.uplink.detach();
        self.last_published = None;
        tracing::debug!("Media tracks torn down");
    }

    // ========================================================================
    // PUBLISH STATE
    // ========================================================================

    fn publish_flags(&self) -> PublishFlags {
        let video = self.camera_task.is_some() && !self.video_muted;
        PublishFlags {
            audio: self.mic_task.is_some() && !self.audio_muted,
            video,
            small_video: video && self.small.is_some(),
            sub_video: self.screen.is_active(),
        }
    }

    /// Meldet den Veröffentlichungsstatus, wenn er sich geändert hat
    pub fn sync_publish(&mut self) {
        if !self.uplink.is_attached() {
            return;
        }
        let flags = self.publish_flags();
        if self.last_published == Some(flags) {
            return;
        }
        tracing::debug!(
            "Publishing audio={} video={} small={} sub={}",
            flags.audio,
            flags.video,
            flags.small_video,
            flags.sub_video
        );
        if self.uplink.send(ClientMessage::PublishState {
            audio: flags.audio,
            video: flags.video,
            small_video: flags.small_video,
            sub_video: flags.sub_video,
        }) {
            self.last_published = Some(flags);
        }
    }

    // ========================================================================
    // CAMERA
    // ========================================================================

    pub fn camera_active(&self) -> bool {
        self.camera.is_some()
    }

    pub fn local_preview(&self) -> Option<Arc<RenderSlot>> {
        self.camera.as_ref().map(|c| c.preview().clone())
    }

    pub fn set_local_renderer(&mut self, renderer: Option<Arc<dyn VideoRenderer>>) {
        if let Some(camera) = &self.camera {
            camera.preview().set_renderer(renderer.clone());
        }
        self.local_renderer = renderer;
    }

    /// Legt eine neue Kamera-Pipeline an. `None` wenn die Kamera schon läuft.
    pub fn begin_camera(&mut self) -> Option<u64> {
        if self.camera.is_some() {
            return None;
        }
        let preview = RenderSlot::new("", StreamType::Big);
        preview.set_renderer(self.local_renderer.clone());
        if let Some((format, callback)) = &self.local_callback {
            preview.set_callback(Some(*format), Some(callback.clone()));
        }
        let transform = self.local_transform;
        preview.update_transform(|t| *t = transform);

        let pipeline = CameraPipeline::new(
            self.uplink.clone(),
            preview,
            self.emitter.clone(),
            self.encoder,
            self.qos.preference,
        );
        pipeline.set_small(self.small.map(|p| (p, self.qos.preference)));
        pipeline.set_muted(self.video_muted);
        pipeline.set_rotation(self.encoder_rotation);

        self.camera_generation += 1;
        self.camera = Some(Arc::new(pipeline));
        Some(self.camera_generation)
    }

    /// Parameter zum Öffnen der Kamera
    pub fn camera_capture_params(&self) -> (u32, u32, u32) {
        let (w, h) = self.encoder.output_dimensions();
        (w, h, self.encoder.fps)
    }

    /// Verbindet eine geöffnete Kamera. `false` wenn der Start veraltet ist.
    pub fn attach_camera(&mut self, generation: u64, mut stream: CaptureStream<VideoFrame>) -> bool {
        if generation != self.camera_generation {
            return false;
        }
        let Some(pipeline) = self.camera.clone() else {
            return false;
        };
        self.camera_task = Some(self.runtime.spawn(async move {
            while let Some(frame) = stream.next().await {
                pipeline.on_frame(frame);
            }
            tracing::debug!("Camera capture ended");
        }));
        self.sync_publish();
        true
    }

    /// Öffnen fehlgeschlagen. `false` wenn der Start veraltet ist.
    pub fn camera_failed(&mut self, generation: u64) -> bool {
        if generation != self.camera_generation || self.camera.is_none() {
            return false;
        }
        self.stop_camera()
    }

    pub fn stop_camera(&mut self) -> bool {
        let Some(camera) = self.camera.take() else {
            return false;
        };
        self.camera_generation += 1;
        if let Some(task) = self.camera_task.take() {
            task.abort();
        }
        self.retired.push(camera.preview().clone());
        self.sync_publish();
        true
    }

    pub fn mute_local_video(&mut self, mute: bool) {
        self.video_muted = mute;
        if let Some(camera) = &self.camera {
            camera.set_muted(mute);
        }
        self.sync_publish();
    }

    pub fn is_video_muted(&self) -> bool {
        self.video_muted
    }

    // ========================================================================
    // MICROPHONE & SPEAKER
    // ========================================================================

    pub fn mic_active(&self) -> bool {
        self.mic.is_some()
    }

    pub fn begin_mic(&mut self) -> Option<u64> {
        if self.mic.is_some() {
            return None;
        }
        let pipeline = MicPipeline::new(self.uplink.clone(), self.devices.clone(), self.volume_smoothing);
        pipeline.set_muted(self.audio_muted);
        self.mic_generation += 1;
        self.mic = Some(Arc::new(pipeline));
        Some(self.mic_generation)
    }

    pub fn attach_mic(&mut self, generation: u64, mut stream: CaptureStream<AudioFrame>) -> bool {
        if generation != self.mic_generation {
            return false;
        }
        let Some(pipeline) = self.mic.clone() else {
            return false;
        };
        self.mic_task = Some(self.runtime.spawn(async move {
            while let Some(frame) = stream.next().await {
                pipeline.on_frame(frame);
            }
            tracing::debug!("Microphone capture ended");
        }));
        self.sync_publish();
        true
    }

    pub fn mic_failed(&mut self, generation: u64) -> bool {
        if generation != self.mic_generation || self.mic.is_none() {
            return false;
        }
        self.stop_mic()
    }

    pub fn stop_mic(&mut self) -> bool {
        if self.mic.take().is_none() {
            return false;
        }
        self.mic_generation += 1;
        if let Some(task) = self.mic_task.take() {
            task.abort();
        }
        self.sync_publish();
        true
    }

    pub fn mute_local_audio(&mut self, mute: bool) {
        self.audio_muted = mute;
        if let Some(mic) = &self.mic {
            mic.set_muted(mute);
        }
        self.sync_publish();
    }

    pub fn is_audio_muted(&self) -> bool {
        self.audio_muted
    }

    pub fn attach_speaker(&mut self, speaker: Box<dyn AudioOutput>) {
        self.speaker = Some(speaker);
    }

    pub fn has_speaker(&self) -> bool {
        self.speaker.is_some()
    }

    // ========================================================================
    // SCREEN SHARE (SUBSTREAM)
    // ========================================================================

    pub fn screen_state(&self) -> ScreenCaptureState {
        self.screen.state()
    }

    pub fn screen_target(&self) -> Option<&ScreenCaptureTarget> {
        self.screen.target()
    }

    pub fn screen_generation(&self) -> u64 {
        self.screen.generation()
    }

    /// Neues Ziel; bei laufender Aufnahme die Generation für die neue Quelle
    pub fn select_screen_target(&mut self, target: ScreenCaptureTarget) -> Option<u64> {
        tracing::info!("Screen capture target: {} ({:?})", target.source.id, target.rect);
        self.screen.select_target(target)
    }

    /// Startet die Freigabe. `Ok(None)` wenn sie bereits läuft.
    pub fn begin_screen(&mut self) -> Result<Option<u64>, DeviceError> {
        if self.screen.target().is_none() {
            return Err(DeviceError::NoScreenTarget);
        }
        if self.screen.is_active() {
            return Ok(None);
        }
        let variant = self.sub_variant.clone();
        let uplink = self.uplink.clone();
        let generation = self.screen.start(&self.runtime, move |frame: VideoFrame| {
            variant.push(&frame, Rotation::R0, &uplink);
        });
        self.sync_publish();
        Ok(Some(generation))
    }

    pub fn attach_screen(&mut self, generation: u64, stream: CaptureStream<VideoFrame>) -> bool {
        self.screen.attach(generation, stream)
    }

    pub fn screen_failed(&mut self, generation: u64) -> bool {
        if generation != self.screen.generation() {
            return false;
        }
        self.stop_screen()
    }

    pub fn pause_screen(&mut self) -> bool {
        self.screen.pause()
    }

    pub fn resume_screen(&mut self) -> bool {
        self.screen.resume()
    }

    pub fn stop_screen(&mut self) -> bool {
        let stopped = self.screen.stop();
        if stopped {
            self.sync_publish();
        }
        stopped
    }

    pub fn set_sub_stream_mix_volume(&mut self, volume: u32) {
        self.sub_mix_volume = volume.min(100);
    }

    pub fn sub_stream_mix_volume(&self) -> u32 {
        self.sub_mix_volume
    }

    // ========================================================================
    // ENCODER & QOS
    // ========================================================================

    pub fn encoder_param(&self) -> VideoEncParam {
        self.encoder
    }

    pub fn small_stream_param(&self) -> Option<VideoEncParam> {
        self.small
    }

    /// Hauptstream-Parameter. Mit aktivem Dual-Stream muss das
    /// Seitenverhältnis zum Small-Stream passen.
    pub fn set_video_encoder_param(&mut self, param: VideoEncParam) -> EngineResult<()> {
        param.validate()?;
        if let Some(small) = &self.small {
            param.validate_small_stream(small)?;
        }
        self.encoder = param;
        if let Some(camera) = &self.camera {
            camera.big().set_param(param);
        }
        Ok(())
    }

    pub fn enable_small_video_stream(&mut self, enable: bool, param: VideoEncParam) -> EngineResult<()> {
        if enable {
            self.encoder.validate_small_stream(&param)?;
            self.small = Some(param);
        } else {
            self.small = None;
        }
        tracing::info!("Dual stream {}", if enable { "enabled" } else { "disabled" });
        if let Some(camera) = &self.camera {
            camera.set_small(self.small.map(|p| (p, self.qos.preference)));
        }
        self.sync_publish();
        Ok(())
    }

    pub fn set_sub_stream_encoder_param(&mut self, param: VideoEncParam) -> EngineResult<()> {
        param.validate()?;
        self.sub_variant.set_param(param);
        Ok(())
    }

    pub fn sub_stream_param(&self) -> VideoEncParam {
        self.sub_variant.param()
    }

    pub fn set_network_qos_param(&mut self, qos: NetworkQosParam) {
        tracing::debug!("QoS preference {:?}, control {:?}", qos.preference, qos.control_mode);
        self.qos = qos;
        if let Some(camera) = &self.camera {
            camera.set_preference(qos.preference);
        }
        self.sub_variant.set_preference(qos.preference);
    }

    pub fn network_qos_param(&self) -> NetworkQosParam {
        self.qos
    }

    pub fn set_video_encoder_rotation(&mut self, rotation: Rotation) {
        self.encoder_rotation = rotation;
        if let Some(camera) = &self.camera {
            camera.set_rotation(rotation);
        }
    }

    /// Netzqualität des lokalen Uplinks treibt alle Rate Controller
    pub fn on_network_quality(&mut self, local: Quality) {
        if let Some(camera) = &self.camera {
            camera.on_quality(local);
        }
        self.sub_variant.on_quality(local);
    }

    // ========================================================================
    // LOCAL RENDER PARAMETERS
    // ========================================================================

    fn update_local_transform(&mut self, update: impl Fn(&mut ViewTransform)) {
        update(&mut self.local_transform);
        if let Some(camera) = &self.camera {
            camera.preview().update_transform(update);
        }
    }

    pub fn set_local_view_fill_mode(&mut self, mode: FillMode) {
        self.update_local_transform(|t| t.fill_mode = mode);
    }

    pub fn set_local_view_rotation(&mut self, rotation: Rotation) {
        self.update_local_transform(|t| t.rotation = rotation);
    }

    pub fn set_local_view_mirror(&mut self, mirror: bool) {
        self.update_local_transform(|t| t.mirror = mirror);
    }

    pub fn local_transform(&self) -> ViewTransform {
        self.local_transform
    }

    pub fn set_local_video_render_callback(
        &mut self,
        format: PixelFormat,
        buffer: BufferType,
        callback: Option<Arc<dyn VideoRenderCallback>>,
    ) -> EngineResult<()> {
        let binding = check_render_binding(format, buffer, callback.as_ref())?;
        self.local_callback = binding.zip(callback);
        if let Some(camera) = &self.camera {
            match &self.local_callback {
                Some((format, callback)) => {
                    camera.preview().set_callback(Some(*format), Some(callback.clone()))
                }
                None => camera.preview().set_callback(None, None),
            }
        }
        Ok(())
    }

    // ========================================================================
    // REMOTE VIEWS
    // ========================================================================

    /// Startet eine Ansicht. Der Teilnehmer darf noch fehlen; das Abonnement
    /// folgt, sobald er den Stream veröffentlicht.
    pub fn start_remote_view(
        &mut self,
        session: &mut RoomSession,
        user_id: &str,
        sub: bool,
        renderer: Option<Arc<dyn VideoRenderer>>,
    ) {
        let key = if sub { ViewKey::sub(user_id) } else { ViewKey::main(user_id) };
        let initial = if sub { StreamType::Sub } else { StreamType::Big };
        let view = self.views.entry(key.clone()).or_insert_with(|| {
            tracing::info!("Starting remote view {}", key.track_id());
            RemoteView {
                slot: RenderSlot::new(user_id, initial),
                subscribed: None,
                first_frame: false,
                frames: 0,
                size: (0, 0),
            }
        });
        view.slot.set_renderer(renderer);
        self.reconcile(session, &key);
    }

    pub fn stop_remote_view(&mut self, session: &mut RoomSession, user_id: &str, sub: bool) -> bool {
        let key = if sub { ViewKey::sub(user_id) } else { ViewKey::main(user_id) };
        let Some(view) = self.views.remove(&key) else {
            return false;
        };
        tracing::info!("Stopping remote view {}", key.track_id());
        if let Some(stream) = view.subscribed {
            self.uplink.send(ClientMessage::Unsubscribe {
                user_id: user_id.to_string(),
                stream,
            });
        }
        if !sub {
            if let Some(participant) = session.participant_mut(user_id) {
                participant.stream_tier = None;
            }
        }
        self.retired.push(view.slot);
        true
    }

    /// Beendet alle Ansichten, Substreams eingeschlossen
    pub fn stop_all_remote_view(&mut self, session: &mut RoomSession) {
        let keys: Vec<ViewKey> = self.views.keys().cloned().collect();
        for key in keys {
            self.stop_remote_view(session, &key.user_id, key.sub);
        }
    }

    pub fn has_remote_view(&self, user_id: &str, sub: bool) -> bool {
        let key = if sub { ViewKey::sub(user_id) } else { ViewKey::main(user_id) };
        self.views.contains_key(&key)
    }

    pub fn remote_view_count(&self) -> usize {
        self.views.len()
    }

    /// Aktuell abonnierte Stufe einer Ansicht
    pub fn subscribed_stream(&self, user_id: &str, sub: bool) -> Option<StreamType> {
        let key = if sub { ViewKey::sub(user_id) } else { ViewKey::main(user_id) };
        self.views.get(&key).and_then(|v| v.subscribed)
    }

    pub fn set_remote_stream_type(&mut self, session: &mut RoomSession, user_id: &str, tier: StreamType) -> EngineResult<()> {
        if !tier.is_main() {
            return Err(EngineError::invalid(
                crate::error::codes::ERR_INVALID_PARAMETER,
                "stream type must be big or small",
            ));
        }
        self.tier_overrides.insert(user_id.to_string(), tier);
        self.reconcile(session, &ViewKey::main(user_id));
        Ok(())
    }

    pub fn set_prior_remote_stream_type(&mut self, session: &mut RoomSession, tier: StreamType) -> EngineResult<()> {
        if !tier.is_main() {
            return Err(EngineError::invalid(
                crate::error::codes::ERR_INVALID_PARAMETER,
                "stream type must be big or small",
            ));
        }
        self.default_tier = tier;
        let keys: Vec<ViewKey> = self
            .views
            .keys()
            .filter(|k| !k.sub && !self.tier_overrides.contains_key(&k.user_id))
            .cloned()
            .collect();
        for key in keys {
            self.reconcile(session, &key);
        }
        Ok(())
    }

    /// Gewünschte Stufe eines Nutzers (Override vor Default)
    pub fn preferred_tier(&self, user_id: &str) -> StreamType {
        self.tier_overrides
            .get(user_id)
            .copied()
            .unwrap_or(self.default_tier)
    }

    /// Gleicht das Abonnement einer Ansicht mit der Verfügbarkeit ab
    fn reconcile(&mut self, session: &mut RoomSession, key: &ViewKey) {
        let preferred = self.preferred_tier(&key.user_id);
        let attached = self.uplink.is_attached();
        let Some(view) = self.views.get_mut(key) else {
            return;
        };

        let participant = session.participant(&key.user_id);
        let desired = match participant {
            Some(_) if !attached => None,
            None => None,
            Some(p) if key.sub => p.has_stream(StreamType::Sub).then_some(StreamType::Sub),
            Some(p) => resolve_tier(
                preferred,
                p.has_stream(StreamType::Big),
                p.has_stream(StreamType::Small),
            ),
        };
        if view.subscribed == desired {
            return;
        }

        if let Some(old) = view.subscribed {
            self.uplink.send(ClientMessage::Unsubscribe {
                user_id: key.user_id.clone(),
                stream: old,
            });
        }
        if let Some(stream) = desired {
            self.uplink.send(ClientMessage::Subscribe {
                user_id: key.user_id.clone(),
                stream,
            });
            view.slot.set_stream(stream);
        }
        tracing::debug!("{}: subscribed {:?} -> {:?}", key.track_id(), view.subscribed, desired);
        view.subscribed = desired;
        view.first_frame = false;

        if !key.sub {
            if let Some(p) = session.participant_mut(&key.user_id) {
                p.stream_tier = desired;
            }
        }
    }

    /// Reagiert auf Änderungen der Teilnehmerliste
    pub fn on_participant_updates(&mut self, session: &mut RoomSession, updates: &[ParticipantUpdate]) {
        for update in updates {
            match update {
                ParticipantUpdate::Entered { user_id }
                | ParticipantUpdate::VideoAvailable { user_id, .. }
                | ParticipantUpdate::SmallVideoAvailable { user_id, .. } => {
                    self.reconcile(session, &ViewKey::main(user_id));
                    if matches!(update, ParticipantUpdate::Entered { .. }) {
                        self.reconcile(session, &ViewKey::sub(user_id));
                    }
                }
                ParticipantUpdate::SubStreamAvailable { user_id, .. } => {
                    self.reconcile(session, &ViewKey::sub(user_id));
                }
                ParticipantUpdate::Left { user_id, .. } => {
                    for key in [ViewKey::main(user_id), ViewKey::sub(user_id)] {
                        if let Some(view) = self.views.remove(&key) {
                            tracing::debug!("{} left, dropping view", key.track_id());
                            self.retired.push(view.slot);
                        }
                    }
                    self.remote_audio.remove(user_id);
                }
                ParticipantUpdate::AudioAvailable { .. } => {}
            }
        }
    }

    fn update_remote_transform(
        &mut self,
        key: ViewKey,
        update: impl FnOnce(&mut ViewTransform),
    ) -> EngineResult<()> {
        let view = self
            .views
            .get(&key)
            .ok_or_else(|| EngineError::TrackNotFound(key.track_id().to_string()))?;
        view.slot.update_transform(update);
        Ok(())
    }

    pub fn set_remote_view_fill_mode(&mut self, user_id: &str, sub: bool, mode: FillMode) -> EngineResult<()> {
        let key = if sub { ViewKey::sub(user_id) } else { ViewKey::main(user_id) };
        self.update_remote_transform(key, |t| t.fill_mode = mode)
    }

    pub fn set_remote_view_rotation(&mut self, user_id: &str, sub: bool, rotation: Rotation) -> EngineResult<()> {
        let key = if sub { ViewKey::sub(user_id) } else { ViewKey::main(user_id) };
        self.update_remote_transform(key, |t| t.rotation = rotation)
    }

    pub fn remote_transform(&self, user_id: &str, sub: bool) -> Option<ViewTransform> {
        let key = if sub { ViewKey::sub(user_id) } else { ViewKey::main(user_id) };
        self.views.get(&key).map(|v| v.slot.transform())
    }

    /// Raw-Frame Callback für die Hauptansicht eines Nutzers
    pub fn set_remote_video_render_callback(
        &mut self,
        user_id: &str,
        format: PixelFormat,
        buffer: BufferType,
        callback: Option<Arc<dyn VideoRenderCallback>>,
    ) -> EngineResult<()> {
        let key = ViewKey::main(user_id);
        let view = self
            .views
            .get(&key)
            .ok_or_else(|| EngineError::TrackNotFound(key.track_id().to_string()))?;
        let binding = check_render_binding(format, buffer, callback.as_ref())?;
        match binding {
            Some(format) => view.slot.set_callback(Some(format), callback),
            None => view.slot.set_callback(None, None),
        }
        Ok(())
    }

    /// Ordnet ein empfangenes Bild seiner Ansicht zu. Bilder einer nicht
    /// mehr abonnierten Stufe werden verworfen.
    pub fn on_remote_video(&mut self, user_id: &str, stream: StreamType, frame: &VideoFrame) -> Option<Arc<RenderSlot>> {
        self.received_bytes += frame.data.len() as u64;
        let key = if stream == StreamType::Sub {
            ViewKey::sub(user_id)
        } else {
            ViewKey::main(user_id)
        };
        let view = self.views.get_mut(&key)?;
        if view.subscribed != Some(stream) {
            tracing::trace!("Discarding {:?} frame of {}", stream, user_id);
            return None;
        }
        view.frames += 1;
        view.size = (frame.width, frame.height);
        if !view.first_frame {
            view.first_frame = true;
            self.emitter.emit(RoomEvent::FirstVideoFrame {
                user_id: user_id.to_string(),
                stream,
                width: frame.width,
                height: frame.height,
            });
        }
        Some(view.slot.clone())
    }

    // ========================================================================
    // REMOTE AUDIO
    // ========================================================================

    pub fn mute_remote_audio(&mut self, user_id: &str, mute: bool) {
        self.remote_mute_overrides.insert(user_id.to_string(), mute);
    }

    /// Gilt für alle Nutzer und verwirft Einzel-Einstellungen
    pub fn mute_all_remote_audio(&mut self, mute: bool) {
        self.mute_all_remote = mute;
        self.remote_mute_overrides.clear();
    }

    pub fn is_remote_audio_muted(&self, user_id: &str) -> bool {
        self.remote_mute_overrides
            .get(user_id)
            .copied()
            .unwrap_or(self.mute_all_remote)
    }

    pub fn on_remote_audio(&mut self, user_id: &str, frame: AudioFrame) {
        self.received_bytes += (frame.samples.len() * 2) as u64;
        let smoothing = self.volume_smoothing;
        let entry = self
            .remote_audio
            .entry(user_id.to_string())
            .or_insert_with(|| RemoteAudio {
                meter: VolumeMeter::new(smoothing),
                first_frame: false,
                frames: 0,
            });
        entry.frames += 1;
        if !entry.first_frame {
            entry.first_frame = true;
            self.emitter.emit(RoomEvent::FirstAudioFrame {
                user_id: user_id.to_string(),
            });
        }

        let mut frame = frame.normalized();
        entry.meter.feed(&frame.samples);

        if self.is_remote_audio_muted(user_id) {
            return;
        }
        if let Some(speaker) = self.speaker.as_mut() {
            frame.apply_volume(self.devices.speaker_volume());
            speaker.play(&frame);
        }
    }

    // ========================================================================
    // LEVELS & STATISTICS
    // ========================================================================

    pub fn set_volume_smoothing(&mut self, smooth: usize) {
        self.volume_smoothing = smooth.max(1);
        if let Some(mic) = &self.mic {
            mic.set_smoothing(self.volume_smoothing);
        }
        for audio in self.remote_audio.values_mut() {
            audio.meter = VolumeMeter::new(self.volume_smoothing);
        }
    }

    /// Pegel aller Sprecher; der lokale Nutzer hat eine leere Id
    pub fn volumes(&self) -> (Vec<VolumeInfo>, u32) {
        let mut volumes = Vec::new();
        if let Some(mic) = &self.mic {
            volumes.push(VolumeInfo {
                user_id: String::new(),
                volume: mic.volume(),
            });
        }
        let mut remote: Vec<_> = self
            .remote_audio
            .iter()
            .map(|(user_id, audio)| VolumeInfo {
                user_id: user_id.clone(),
                volume: audio.meter.volume(),
            })
            .collect();
        remote.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        volumes.extend(remote);
        let total = volumes.iter().map(|v| v.volume).max().unwrap_or(0);
        (volumes, total)
    }

    pub fn local_statistics(&self) -> Vec<LocalStatistics> {
        let mut stats = self
            .camera
            .as_ref()
            .map(|c| c.statistics())
            .unwrap_or_default();
        if self.screen.is_active() {
            stats.push(self.sub_variant.statistics());
        }
        stats
    }

    pub fn remote_statistics(&self) -> Vec<RemoteStatistics> {
        let mut stats: Vec<_> = self
            .views
            .iter()
            .filter_map(|(key, view)| {
                let stream = view.subscribed?;
                Some(RemoteStatistics {
                    user_id: key.user_id.clone(),
                    stream,
                    width: view.size.0,
                    height: view.size.1,
                    frames_received: view.frames,
                    audio_frames_received: self
                        .remote_audio
                        .get(&key.user_id)
                        .map(|a| a.frames)
                        .unwrap_or(0),
                })
            })
            .collect();
        stats.sort_by(|a, b| (&a.user_id, a.stream).cmp(&(&b.user_id, b.stream)));
        stats
    }
}

impl std::fmt::Debug for MediaTrackManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaTrackManager")
            .field("camera", &self.camera.is_some())
            .field("mic", &self.mic.is_some())
            .field("screen", &self.screen.state())
            .field("views", &self.views.len())
            .field("uplink", &self.uplink)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::CallbackDispatcher;
    use crate::devices::VirtualDeviceBackend;
    use crate::session::{AppScene, EnterRoomParams};
    use crate::signaling::{ServerMessage, SignalingError, UserInfo};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingLink {
        sent: Mutex<Vec<ClientMessage>>,
    }

    impl RecordingLink {
        fn take(&self) -> Vec<ClientMessage> {
            std::mem::take(&mut *self.sent.lock())
        }
    }

    impl TransportLink for RecordingLink {
        fn send(&self, msg: ClientMessage) -> Result<(), SignalingError> {
            self.sent.lock().push(msg);
            Ok(())
        }
        fn close(&self) {}
        fn is_connected(&self) -> bool {
            true
        }
    }

    struct Fixture {
        _runtime: tokio::runtime::Runtime,
        _dispatcher: CallbackDispatcher,
        session: RoomSession,
        media: MediaTrackManager,
        link: Arc<RecordingLink>,
    }

    fn fixture(users: &[UserInfo]) -> Fixture {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let dispatcher = CallbackDispatcher::new();
        let devices = Arc::new(DeviceManager::new(Arc::new(VirtualDeviceBackend::new())));
        let mut media = MediaTrackManager::new(runtime.handle().clone(), devices, dispatcher.emitter());
        let mut session = RoomSession::new();
        let epoch = session
            .begin_enter(EnterRoomParams::new(1400000001, 1, "alice", "sig"), AppScene::VideoCall)
            .unwrap();
        session.complete_enter(epoch, users).unwrap();
        let link = Arc::new(RecordingLink::default());
        media.attach_link(link.clone(), &mut session);
        link.take();
        Fixture {
            _runtime: runtime,
            _dispatcher: dispatcher,
            session,
            media,
            link,
        }
    }

    fn bob(video: bool, small: bool) -> UserInfo {
        UserInfo {
            user_id: "bob".into(),
            audio: true,
            video,
            small_video: small,
            sub_video: false,
        }
    }

    #[test]
    fn test_resolve_tier() {
        assert_eq!(resolve_tier(StreamType::Big, true, true), Some(StreamType::Big));
        assert_eq!(resolve_tier(StreamType::Small, true, true), Some(StreamType::Small));
        assert_eq!(resolve_tier(StreamType::Small, true, false), Some(StreamType::Big));
        assert_eq!(resolve_tier(StreamType::Big, false, true), Some(StreamType::Small));
        assert_eq!(resolve_tier(StreamType::Big, false, false), None);
    }

    #[test]
    fn test_tier_switch_round_trip() {
        let mut f = fixture(&[bob(true, true)]);
        f.media.start_remote_view(&mut f.session, "bob", false, None);
        assert_eq!(f.media.subscribed_stream("bob", false), Some(StreamType::Big));

        f.media.set_remote_stream_type(&mut f.session, "bob", StreamType::Small).unwrap();
        assert_eq!(f.media.subscribed_stream("bob", false), Some(StreamType::Small));
        f.media.set_remote_stream_type(&mut f.session, "bob", StreamType::Big).unwrap();
        assert_eq!(f.media.subscribed_stream("bob", false), Some(StreamType::Big));
        assert_eq!(f.session.participant("bob").unwrap().stream_tier, Some(StreamType::Big));

        // Erneutes Setzen derselben Stufe sendet nichts
        f.link.take();
        f.media.set_remote_stream_type(&mut f.session, "bob", StreamType::Big).unwrap();
        assert!(f.link.take().is_empty());
    }

    #[test]
    fn test_preferred_small_tier_requested_when_available() {
        let mut f = fixture(&[bob(true, false)]);
        f.media.set_prior_remote_stream_type(&mut f.session, StreamType::Small).unwrap();
        f.media.start_remote_view(&mut f.session, "bob", false, None);
        assert_eq!(f.media.subscribed_stream("bob", false), Some(StreamType::Big));

        let updates = f.session.apply(&ServerMessage::UserAvailability {
            user_id: "bob".into(),
            audio: true,
            video: true,
            small_video: true,
            sub_video: false,
        });
        f.media.on_participant_updates(&mut f.session, &updates);
        assert_eq!(f.media.subscribed_stream("bob", false), Some(StreamType::Small));
    }

    #[test]
    fn test_video_unavailable_keeps_view() {
        let mut f = fixture(&[bob(true, false)]);
        f.media.start_remote_view(&mut f.session, "bob", false, None);
        f.link.take();

        let updates = f.session.apply(&ServerMessage::UserAvailability {
            user_id: "bob".into(),
            audio: true,
            video: false,
            small_video: false,
            sub_video: false,
        });
        f.media.on_participant_updates(&mut f.session, &updates);

        assert!(f.media.has_remote_view("bob", false));
        assert_eq!(f.media.subscribed_stream("bob", false), None);
        assert_eq!(
            f.link.take(),
            vec![ClientMessage::Unsubscribe {
                user_id: "bob".into(),
                stream: StreamType::Big
            }]
        );
    }

    #[test]
    fn test_departure_retires_views() {
        let mut f = fixture(&[bob(true, false)]);
        f.media.start_remote_view(&mut f.session, "bob", false, None);
        let updates = f.session.apply(&ServerMessage::UserExit {
            user_id: "bob".into(),
            reason: 0,
        });
        f.media.on_participant_updates(&mut f.session, &updates);
        assert!(!f.media.has_remote_view("bob", false));
        let retired = f.media.take_retired();
        assert_eq!(retired.len(), 1);
        assert_eq!(retired[0].user_id(), "bob");
    }

    #[test]
    fn test_pending_view_subscribes_on_publish() {
        let mut f = fixture(&[]);
        f.media.start_remote_view(&mut f.session, "bob", false, None);
        assert_eq!(f.media.subscribed_stream("bob", false), None);

        let mut updates = f.session.apply(&ServerMessage::UserEnter { user_id: "bob".into() });
        updates.extend(f.session.apply(&ServerMessage::UserAvailability {
            user_id: "bob".into(),
            audio: false,
            video: true,
            small_video: false,
            sub_video: false,
        }));
        f.media.on_participant_updates(&mut f.session, &updates);
        assert_eq!(f.media.subscribed_stream("bob", false), Some(StreamType::Big));
    }

    #[test]
    fn test_stale_tier_frames_discarded() {
        let mut f = fixture(&[bob(true, true)]);
        f.media.start_remote_view(&mut f.session, "bob", false, None);
        let frame = VideoFrame::test_pattern(8, 8, 0, 0);
        assert!(f.media.on_remote_video("bob", StreamType::Big, &frame).is_some());
        assert!(f.media.on_remote_video("bob", StreamType::Small, &frame).is_none());
        assert!(f.media.on_remote_video("carol", StreamType::Big, &frame).is_none());
    }

    #[test]
    fn test_remote_callback_requires_view() {
        let mut f = fixture(&[bob(true, false)]);
        let err = f
            .media
            .set_remote_video_render_callback("bob", PixelFormat::I420, BufferType::Buffer, None)
            .unwrap_err();
        assert_eq!(err.code(), crate::error::codes::ERR_TRACK_NOT_FOUND);

        f.media.start_remote_view(&mut f.session, "bob", false, None);
        assert!(f
            .media
            .set_remote_video_render_callback("bob", PixelFormat::Unknown, BufferType::Unknown, None)
            .is_ok());
    }

    #[test]
    fn test_mute_all_overrides_single_settings() {
        let mut f = fixture(&[]);
        f.media.mute_remote_audio("bob", true);
        assert!(f.media.is_remote_audio_muted("bob"));
        f.media.mute_all_remote_audio(false);
        assert!(!f.media.is_remote_audio_muted("bob"));
        f.media.mute_all_remote_audio(true);
        f.media.mute_remote_audio("bob", false);
        assert!(!f.media.is_remote_audio_muted("bob"));
        assert!(f.media.is_remote_audio_muted("carol"));
    }

    #[test]
    fn test_dual_stream_aspect_ratio_guard() {
        let mut f = fixture(&[]);
        f.media
            .set_video_encoder_param(VideoEncParam::new(1280, 720, 15, 1200))
            .unwrap();
        assert!(f
            .media
            .enable_small_video_stream(true, VideoEncParam::new(320, 240, 15, 100))
            .is_err());
        assert!(f.media.small_stream_param().is_none());

        f.media
            .enable_small_video_stream(true, VideoEncParam::new(320, 180, 15, 100))
            .unwrap();
        let err = f
            .media
            .set_video_encoder_param(VideoEncParam::new(640, 480, 15, 800))
            .unwrap_err();
        assert_eq!(err.code(), crate::error::codes::ERR_SMALL_STREAM_ASPECT_RATIO);
        assert_eq!(f.media.encoder_param().width, 1280);
    }

    #[test]
    fn test_publish_state_sent_on_change_only() {
        let mut f = fixture(&[]);
        let gen = f.media.begin_mic().unwrap();
        let (_sink, stream) = crate::devices::capture_channel(4);
        assert!(f.media.attach_mic(gen, stream));
        assert_eq!(
            f.link.take(),
            vec![ClientMessage::PublishState {
                audio: true,
                video: false,
                small_video: false,
                sub_video: false
            }]
        );
        f.media.sync_publish();
        assert!(f.link.take().is_empty());

        f.media.mute_local_audio(true);
        assert!(matches!(
            f.link.take().as_slice(),
            [ClientMessage::PublishState { audio: false, .. }]
        ));
    }

    #[test]
    fn test_screen_requires_target() {
        let mut f = fixture(&[]);
        assert_eq!(f.media.begin_screen(), Err(DeviceError::NoScreenTarget));
    }
}
