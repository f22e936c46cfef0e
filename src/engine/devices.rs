//! Geräte, Bildschirmfreigabe, Gerätetests und Speedtest

use super::state::{CameraTest, EngineInner};
use super::engine::RoomEngine;
use crate::callback::{RoomEvent, SpeedTestResult};
use crate::devices::{
    DeviceError, DeviceInfo, DeviceKind, ScreenCaptureTarget, ScreenSource,
};
use crate::error::{codes, EngineError, EngineResult};
use crate::media::{
    RenderSlot, ScreenCaptureState, StreamType, VideoEncParam, VideoRenderer, VolumeMeter,
};
use crate::signaling::{
    ClientMessage, Credentials, ServerMessage, SignalingError, TransportEvent, TransportSession,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::MissedTickBehavior;

/// Untergrenze für Pegel-Intervalle
const MIN_VOLUME_INTERVAL_MS: u64 = 100;

/// Blöcke im Pegel-Mittel beim Mikrofontest
const MIC_TEST_SMOOTHING: usize = 5;

const SPEED_TEST_PROBES: u32 = 3;
const SPEED_TEST_PROBE_BYTES: u32 = 64 * 1024;
const SPEED_TEST_REPLY_TIMEOUT: Duration = Duration::from_secs(5);

impl RoomEngine {
    // ========================================================================
    // DEVICE SELECTION
    // ========================================================================

    pub fn get_devices(&self, kind: DeviceKind) -> Vec<DeviceInfo> {
        self.inner.devices.devices(kind)
    }

    pub fn current_device(&self, kind: DeviceKind) -> Option<DeviceInfo> {
        self.inner.devices.current(kind)
    }

    /// Wählt ein Gerät. Laufende Aufnahme oder Wiedergabe wechselt sofort.
    pub fn set_current_device(&self, kind: DeviceKind, device_id: &str) -> EngineResult<()> {
        self.inner.devices.select(kind, device_id)?;
        tracing::info!("Selected {:?} device {}", kind, device_id);
        match kind {
            DeviceKind::Camera => {
                if self.inner.with_core(|core| core.media.stop_camera()) {
                    self.open_camera();
                }
            }
            DeviceKind::Microphone => {
                if self.inner.with_core(|core| core.media.stop_mic()) {
                    self.open_mic();
                }
            }
            DeviceKind::Speaker => {
                let joined = self
                    .inner
                    .with_core(|core| core.session.is_joined().then(|| core.session.epoch()));
                if let Some(epoch) = joined {
                    self.inner.open_speaker(epoch);
                }
            }
            DeviceKind::Screen => {}
        }
        Ok(())
    }

    /// Lautstärke 0..=100 für Mikrofon oder Lautsprecher
    pub fn set_current_device_volume(&self, kind: DeviceKind, volume: u32) -> EngineResult<()> {
        match kind {
            DeviceKind::Microphone => self.inner.devices.set_mic_volume(volume),
            DeviceKind::Speaker => self.inner.devices.set_speaker_volume(volume),
            _ => {
                return Err(EngineError::invalid(
                    codes::ERR_INVALID_PARAMETER,
                    format!("{kind:?} has no volume"),
                ))
            }
        }
        Ok(())
    }

    pub fn current_device_volume(&self, kind: DeviceKind) -> Option<u32> {
        match kind {
            DeviceKind::Microphone => Some(self.inner.devices.mic_volume()),
            DeviceKind::Speaker => Some(self.inner.devices.speaker_volume()),
            _ => None,
        }
    }

    pub(super) fn watch_devices(&self) {
        let mut changes = self.inner.devices.backend().subscribe_changes();
        let emitter = self.inner.emitter.clone();
        let task = self.inner.runtime.spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(change) => emitter.emit(RoomEvent::DeviceChange {
                        device_id: change.device_id,
                        kind: change.kind,
                        state: change.state,
                    }),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!("Missed {} device change notifications", missed);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        self.inner.with_core(|core| core.device_watch = Some(task));
    }

    // ========================================================================
    // CAPTURE
    // ========================================================================

    pub(super) fn open_camera(&self) {
        let begun = self.inner.with_core(|core| {
            core.media
                .begin_camera()
                .map(|generation| (generation, core.media.camera_capture_params()))
        });
        let Some((generation, (width, height, fps))) = begun else {
            return;
        };

        let inner = self.inner.clone();
        self.inner.runtime.spawn(async move {
            let opened = inner
                .open_device(DeviceKind::Camera, move |devices, id| {
                    devices.backend().open_camera(id, width, height, fps)
                })
                .await;
            inner.with_core(|core| match opened {
                Ok(stream) => {
                    if core.media.attach_camera(generation, stream) {
                        tracing::info!("Camera capture started ({}x{} @ {} fps)", width, height, fps);
                        inner.emit(RoomEvent::CameraDidReady);
                    }
                }
                Err(e) => {
                    if core.media.camera_failed(generation) {
                        tracing::error!("Failed to start camera: {}", e);
                        inner.emit(RoomEvent::Error {
                            code: e.code(),
                            message: e.to_string(),
                        });
                    }
                }
            });
        });
    }

    pub(super) fn open_mic(&self) {
        let Some(generation) = self.inner.with_core(|core| core.media.begin_mic()) else {
            return;
        };

        let inner = self.inner.clone();
        self.inner.runtime.spawn(async move {
            let opened = inner
                .open_device(DeviceKind::Microphone, |devices, id| {
                    devices.backend().open_microphone(id)
                })
                .await;
            inner.with_core(|core| match opened {
                Ok(stream) => {
                    if core.media.attach_mic(generation, stream) {
                        tracing::info!("Microphone capture started");
                        inner.emit(RoomEvent::MicDidReady);
                    }
                }
                Err(e) => {
                    if core.media.mic_failed(generation) {
                        tracing::error!("Failed to start microphone: {}", e);
                        inner.emit(RoomEvent::Error {
                            code: e.code(),
                            message: e.to_string(),
                        });
                    }
                }
            });
        });
    }

    // ========================================================================
    // SCREEN SHARE
    // ========================================================================

    pub fn get_screen_capture_sources(&self) -> Vec<ScreenSource> {
        self.inner.devices.backend().screen_sources()
    }

    /// Wählt Fenster oder Bildschirm. Während einer laufenden Freigabe wird
    /// ohne Unterbrechung auf die neue Quelle umgeschaltet.
    pub fn select_screen_capture_target(&self, target: ScreenCaptureTarget) -> EngineResult<()> {
        let known = self
            .get_screen_capture_sources()
            .iter()
            .any(|source| source.id == target.source.id);
        if !known {
            return Err(DeviceError::NotFound {
                kind: DeviceKind::Screen,
                id: target.source.id.clone(),
            }
            .into());
        }

        let switch = self.inner.with_core(|core| {
            core.media
                .select_screen_target(target.clone())
                .map(|generation| (generation, core.media.sub_stream_param().fps))
        });
        if let Some((generation, fps)) = switch {
            self.open_screen(generation, target, fps, false);
        }
        Ok(())
    }

    /// Startet die Freigabe als Substream. Erfordert ein gewähltes Ziel.
    pub fn start_screen_capture(&self) -> EngineResult<()> {
        let begun = self.inner.with_core(|core| -> Result<_, DeviceError> {
            let Some(generation) = core.media.begin_screen()? else {
                return Ok(None);
            };
            let fps = core.media.sub_stream_param().fps;
            Ok(core
                .media
                .screen_target()
                .cloned()
                .map(|target| (generation, target, fps)))
        })?;
        if let Some((generation, target, fps)) = begun {
            self.open_screen(generation, target, fps, true);
        }
        Ok(())
    }

    fn open_screen(&self, generation: u64, target: ScreenCaptureTarget, fps: u32, announce: bool) {
        let inner = self.inner.clone();
        self.inner.runtime.spawn(async move {
            let devices = inner.devices.clone();
            let opened = tokio::task::spawn_blocking(move || {
                devices.backend().open_screen(&target, fps)
            })
            .await
            .unwrap_or_else(|e| {
                Err(DeviceError::OpenFailed {
                    kind: DeviceKind::Screen,
                    reason: e.to_string(),
                })
            });
            inner.with_core(|core| match opened {
                Ok(stream) => {
                    if core.media.attach_screen(generation, stream) && announce {
                        inner.emit(RoomEvent::ScreenCaptureStarted);
                    }
                }
                Err(e) => {
                    if core.media.screen_failed(generation) {
                        tracing::error!("Failed to start screen capture: {}", e);
                        inner.emit(RoomEvent::Error {
                            code: e.code(),
                            message: e.to_string(),
                        });
                        inner.emit(RoomEvent::ScreenCaptureStopped { reason: 1 });
                    }
                }
            });
        });
    }

    pub fn pause_screen_capture(&self) {
        if self.inner.with_core(|core| core.media.pause_screen()) {
            self.inner.emit(RoomEvent::ScreenCapturePaused);
        }
    }

    pub fn resume_screen_capture(&self) {
        if self.inner.with_core(|core| core.media.resume_screen()) {
            self.inner.emit(RoomEvent::ScreenCaptureResumed);
        }
    }

    pub fn stop_screen_capture(&self) {
        if self.inner.with_core(|core| core.media.stop_screen()) {
            self.inner.emit(RoomEvent::ScreenCaptureStopped { reason: 0 });
        }
    }

    pub fn screen_capture_state(&self) -> ScreenCaptureState {
        self.inner.with_core(|core| core.media.screen_state())
    }

    pub fn set_sub_stream_encoder_param(&self, param: VideoEncParam) -> EngineResult<()> {
        self.inner
            .with_core(|core| core.media.set_sub_stream_encoder_param(param))
    }

    /// Anteil des System-Sounds im Substream, 0..=100
    pub fn set_sub_stream_mix_volume(&self, volume: u32) {
        self.inner
            .with_core(|core| core.media.set_sub_stream_mix_volume(volume));
    }

    // ========================================================================
    // VOLUME EVALUATION
    // ========================================================================

    /// Meldet periodisch `UserVoiceVolume`. `interval_ms == 0` schaltet ab.
    pub fn enable_audio_volume_evaluation(&self, interval_ms: u64, smooth: usize) {
        let previous = self.inner.with_core(|core| {
            core.media.set_volume_smoothing(smooth);
            core.volume_task.take()
        });
        if let Some(task) = previous {
            task.abort();
        }
        if interval_ms == 0 {
            return;
        }

        let period = Duration::from_millis(interval_ms.max(MIN_VOLUME_INTERVAL_MS));
        let inner = self.inner.clone();
        let task = self.inner.runtime.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let (volumes, total) = inner.with_core(|core| core.media.volumes());
                if !volumes.is_empty() {
                    inner.emit(RoomEvent::UserVoiceVolume { volumes, total });
                }
            }
        });
        if let Some(stale) = self.inner.with_core(|core| core.volume_task.replace(task)) {
            stale.abort();
        }
    }

    // ========================================================================
    // DEVICE TESTS
    // ========================================================================

    /// Kamera-Test ohne Raum. Die Bilder gehen nur an `renderer`.
    pub fn start_camera_device_test(&self, renderer: Arc<dyn VideoRenderer>) {
        let slot = RenderSlot::new("", StreamType::Big);
        slot.set_renderer(Some(renderer));
        let (width, height, fps) = self
            .inner
            .with_core(|core| core.media.camera_capture_params());

        let inner = self.inner.clone();
        let target = slot.clone();
        let task = self.inner.runtime.spawn(async move {
            let opened = inner
                .open_device(DeviceKind::Camera, move |devices, id| {
                    devices.backend().open_camera(id, width, height, fps)
                })
                .await;
            let mut stream = match opened {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::warn!("Camera test failed: {}", e);
                    inner.emit(RoomEvent::Error {
                        code: e.code(),
                        message: e.to_string(),
                    });
                    return;
                }
            };
            inner.emit(RoomEvent::CameraDidReady);
            while let Some(frame) = stream.next().await {
                target.deliver(&frame);
            }
        });

        let previous = self
            .inner
            .with_core(|core| core.camera_test.replace(CameraTest { slot, task }));
        if let Some(test) = previous {
            test.task.abort();
            test.slot.deactivate();
        }
    }

    pub fn stop_camera_device_test(&self) {
        if let Some(test) = self.inner.with_core(|core| core.camera_test.take()) {
            test.task.abort();
            test.slot.deactivate();
        }
    }

    /// Mikrofon-Test ohne Raum, meldet `TestMicVolume` alle `interval_ms`
    pub fn start_mic_device_test(&self, interval_ms: u64) {
        let period = Duration::from_millis(interval_ms.max(MIN_VOLUME_INTERVAL_MS));
        let inner = self.inner.clone();
        let task = self.inner.runtime.spawn(async move {
            let opened = inner
                .open_device(DeviceKind::Microphone, |devices, id| {
                    devices.backend().open_microphone(id)
                })
                .await;
            let mut stream = match opened {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::warn!("Microphone test failed: {}", e);
                    inner.emit(RoomEvent::Error {
                        code: e.code(),
                        message: e.to_string(),
                    });
                    return;
                }
            };

            let mut meter = VolumeMeter::new(MIC_TEST_SMOOTHING);
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    frame = stream.next() => match frame {
                        Some(frame) => {
                            let mut frame = frame.normalized();
                            frame.apply_volume(inner.devices.mic_volume());
                            meter.feed(&frame.samples);
                        }
                        None => break,
                    },
                    _ = ticker.tick() => {
                        inner.emit(RoomEvent::TestMicVolume { volume: meter.volume() });
                    }
                }
            }
        });

        if let Some(previous) = self.inner.with_core(|core| core.mic_test.replace(task)) {
            previous.abort();
        }
    }

    pub fn stop_mic_device_test(&self) {
        if let Some(task) = self.inner.with_core(|core| core.mic_test.take()) {
            task.abort();
        }
    }

    // ========================================================================
    // SPEED TEST
    // ========================================================================

    /// Misst die Verbindung zum Relay über eine eigene Probe-Verbindung.
    /// Jede Runde meldet ein `SpeedTest` Event.
    pub fn start_speed_test(&self, sdk_app_id: u32, user_id: &str, user_sig: &str) -> EngineResult<()> {
        if sdk_app_id == 0 {
            return Err(EngineError::invalid(
                codes::ERR_SDK_APPID_INVALID,
                "sdk app id must not be 0",
            ));
        }
        if user_id.is_empty() {
            return Err(EngineError::invalid(codes::ERR_USER_ID_INVALID, "user id is empty"));
        }
        if user_sig.is_empty() {
            return Err(EngineError::invalid(codes::ERR_USER_SIG_INVALID, "user sig is empty"));
        }

        self.stop_speed_test();
        let generation = self.inner.with_core(|core| core.speed_generation);
        let credentials = Credentials::probe(sdk_app_id, user_id, user_sig);
        let inner = self.inner.clone();
        let task = self.inner.runtime.spawn(async move {
            if let Err(e) = run_speed_test(&inner, generation, credentials).await {
                inner.with_core(|core| {
                    if core.speed_generation == generation {
                        tracing::warn!("Speed test failed: {}", e);
                        inner.emit(RoomEvent::Warning {
                            code: e.code(),
                            message: format!("speed test failed: {e}"),
                        });
                    }
                });
            }
            inner.with_core(|core| {
                if core.speed_generation == generation {
                    if let Some(link) = core.speed_link.take() {
                        link.close();
                    }
                }
            });
        });
        self.inner.with_core(|core| {
            if core.speed_generation == generation {
                core.speed_task = Some(task);
            } else {
                task.abort();
            }
        });
        Ok(())
    }

    /// Bricht den Test ab; späte Ergebnisse werden verworfen
    pub fn stop_speed_test(&self) {
        let (task, link) = self.inner.with_core(|core| {
            core.speed_generation += 1;
            (core.speed_task.take(), core.speed_link.take())
        });
        if let Some(link) = link {
            link.close();
        }
        if let Some(task) = task {
            task.abort();
        }
    }
}

async fn run_speed_test(
    inner: &Arc<EngineInner>,
    generation: u64,
    credentials: Credentials,
) -> Result<(), SignalingError> {
    let timeout = inner.config.enter_room_timeout();
    let TransportSession { link, mut events, .. } =
        tokio::time::timeout(timeout, inner.connector.connect(credentials))
            .await
            .map_err(|_| SignalingError::Timeout)??;

    let current = inner.with_core(|core| {
        if core.speed_generation != generation {
            return false;
        }
        core.speed_link = Some(link.clone());
        true
    });
    if !current {
        link.close();
        return Ok(());
    }

    for round in 1..=SPEED_TEST_PROBES {
        link.send(ClientMessage::SpeedTest {
            probe_bytes: SPEED_TEST_PROBE_BYTES * round,
        })?;
        let result = tokio::time::timeout(SPEED_TEST_REPLY_TIMEOUT, next_result(&mut events))
            .await
            .map_err(|_| SignalingError::Timeout)??;
        let delivered = inner.with_core(|core| {
            if core.speed_generation != generation {
                return false;
            }
            inner.emit(RoomEvent::SpeedTest {
                result,
                finished: round,
                total: SPEED_TEST_PROBES,
            });
            true
        });
        if !delivered {
            break;
        }
    }
    Ok(())
}

async fn next_result(
    events: &mut mpsc::UnboundedReceiver<TransportEvent>,
) -> Result<SpeedTestResult, SignalingError> {
    while let Some(event) = events.recv().await {
        match event {
            TransportEvent::Message(ServerMessage::SpeedTestResult {
                ip,
                quality,
                upload_loss,
                download_loss,
                rtt_ms,
            }) => {
                return Ok(SpeedTestResult {
                    ip,
                    quality,
                    upload_loss,
                    download_loss,
                    rtt_ms,
                })
            }
            TransportEvent::Closed { error } => {
                return Err(error.unwrap_or(SignalingError::NotConnected))
            }
            _ => {}
        }
    }
    Err(SignalingError::NotConnected)
}
