//! Room Engine
//!
//! Öffentliche Fassade: Raum-Lebenszyklus, Medien, Custom Messages und CDN.
//! Alle Aufrufe kehren sofort zurück; Ergebnisse langsamer Vorgänge kommen
//! als [`RoomEvent`] über den Callback Dispatcher.

use super::state::{EngineCore, EngineInner};
use crate::callback::{CallbackDispatcher, ExitReason, RoomEvent, RoomObserver, Statistics};
use crate::cdn::{CdnPublishState, CdnRelayCoordinator, PublishCdnParam, TranscodingConfig};
use crate::config::{init_logging, DebugViewMode, EngineConfig, LogCallback, LogLevel};
use crate::devices::{DeviceBackend, DeviceManager};
use crate::error::{codes, EngineError, EngineResult};
use crate::media::{
    render_status, BufferType, FillMode, MediaTrackManager, NetworkQosParam, PixelFormat,
    Rotation, StreamType, VideoEncParam, VideoRenderCallback, VideoRenderer, ViewTransform,
};
use crate::messaging::ChannelStats;
use crate::session::{AppScene, EnterRoomParams, RemoteParticipant, RoomState};
use crate::signaling::{ClientMessage, Credentials, SignalingClient, SignalingError, TransportConnector};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tracing::Instrument;
use uuid::Uuid;

/// Versionsstring der Bibliothek
pub fn sdk_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

// ============================================================================
// ROOM ENGINE
// ============================================================================

/// Engine für eine Raum-Sitzung mit Audio, Video und Nachrichten
pub struct RoomEngine {
    pub(super) inner: Arc<EngineInner>,
    dispatcher: CallbackDispatcher,
}

impl RoomEngine {
    /// Erstellt eine Engine. Muss innerhalb einer Tokio-Runtime aufgerufen werden.
    pub fn new(
        config: EngineConfig,
        connector: Arc<dyn TransportConnector>,
        backend: Arc<dyn DeviceBackend>,
    ) -> EngineResult<Self> {
        config.validate()?;
        let runtime = Handle::try_current().map_err(|_| {
            EngineError::invalid(
                codes::ERR_INVALID_STATE,
                "RoomEngine must be created inside a tokio runtime",
            )
        })?;
        if let Err(e) = init_logging(&config.log) {
            tracing::warn!("Logging setup failed: {}", e);
        }

        let dispatcher = CallbackDispatcher::new();
        let emitter = dispatcher.emitter();
        let devices = Arc::new(DeviceManager::new(backend));
        let media = MediaTrackManager::new(runtime.clone(), devices.clone(), emitter.clone());
        let core = EngineCore::new(&config, media);

        let engine = Self {
            inner: Arc::new(EngineInner {
                config,
                runtime,
                connector,
                devices,
                emitter,
                core: Mutex::new(core),
            }),
            dispatcher,
        };
        engine.watch_devices();
        tracing::info!("RoomEngine {} created", sdk_version());
        Ok(engine)
    }

    /// Engine mit WebSocket-Relay aus `config.server_url`
    pub fn with_websocket(config: EngineConfig, backend: Arc<dyn DeviceBackend>) -> EngineResult<Self> {
        let connector = Arc::new(SignalingClient::from_config(&config));
        Self::new(config, connector, backend)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    // ========================================================================
    // OBSERVERS
    // ========================================================================

    pub fn add_observer(&self, observer: Arc<dyn RoomObserver>) {
        self.dispatcher.add_observer(observer);
    }

    /// Kehrt erst zurück, wenn eine laufende Zustellung an `observer` fertig ist
    pub fn remove_observer(&self, observer: &Arc<dyn RoomObserver>) {
        self.dispatcher.remove_observer(observer);
    }

    /// Async Stream aller Events
    pub fn subscribe(&self) -> broadcast::Receiver<RoomEvent> {
        self.dispatcher.subscribe()
    }

    /// Wartet, bis alle bisher ausgelösten Events zugestellt sind
    pub async fn flush(&self) {
        self.dispatcher.flush().await;
    }

    // ========================================================================
    // ROOM LIFECYCLE
    // ========================================================================

    /// Betritt einen Raum. Das Ergebnis kommt als `EnterRoom` bzw.
    /// `EnterRoomFailed`; ungültige Parameter werden sofort abgelehnt.
    pub fn enter_room(&self, params: EnterRoomParams, scene: AppScene) -> EngineResult<()> {
        let credentials = Credentials::for_room(&params, scene);
        let (room_id, user_id) = (params.room_id, params.user_id.clone());

        let begun = self.inner.with_core(|core| {
            let epoch = core.session.begin_enter(params, scene)?;
            let session_id = Uuid::new_v4();
            core.session_id = Some(session_id);
            core.failure = None;
            core.messages.reset();
            core.cdn.reset();
            Ok::<_, EngineError>((epoch, session_id))
        });
        let (epoch, session_id) = match begun {
            Ok(begun) => begun,
            Err(e) => {
                if !matches!(e, EngineError::AlreadyInRoom) {
                    self.inner.emit(RoomEvent::EnterRoomFailed {
                        code: e.code(),
                        message: e.to_string(),
                    });
                }
                return Err(e);
            }
        };
        tracing::info!(session = %session_id, "Entering room {} as {} ({:?})", room_id, user_id, scene);

        let inner = self.inner.clone();
        let timeout = self.inner.config.enter_room_timeout();
        let span = tracing::info_span!("room", session = %session_id, epoch);
        let task = self.inner.runtime.spawn(
            async move {
                let result = match tokio::time::timeout(timeout, inner.connector.connect(credentials)).await {
                    Ok(result) => result,
                    Err(_) => Err(SignalingError::Timeout),
                };
                inner.finish_enter(epoch, result);
            }
            .instrument(span),
        );
        self.inner.with_core(|core| {
            if core.session.is_current(epoch) {
                core.session_tasks.push(task);
            } else {
                task.abort();
            }
        });
        Ok(())
    }

    /// Verlässt den Raum und gibt alle Sitzungs-Ressourcen frei, auch die
    /// lokale Aufnahme. Außerhalb eines Raums wirkungslos.
    pub fn exit_room(&self) {
        let exited = self.inner.with_core(|core| {
            if core.session.begin_exit().is_err() {
                return false;
            }
            core.abort_session_tasks();
            core.media.teardown();
            if let Some(link) = core.link.take() {
                if let Err(e) = link.send(ClientMessage::ExitRoom) {
                    tracing::debug!("Exit notification not sent: {}", e);
                }
                link.close();
            }
            core.messages.reset();
            core.cdn.reset();
            core.rtt_ms = 0;
            core.session.finish_exit();

            let reason = core.failure.take().unwrap_or(ExitReason::Requested);
            tracing::info!(
                session = %core.session_id.take().unwrap_or_default(),
                "Left room ({:?})",
                reason
            );
            self.inner.emit(RoomEvent::ExitRoom { reason });
            true
        });
        if !exited {
            tracing::warn!("exit_room called while not in a room");
        }
    }

    pub fn room_state(&self) -> RoomState {
        self.inner.with_core(|core| core.session.state())
    }

    pub fn participants(&self) -> Vec<RemoteParticipant> {
        self.inner
            .with_core(|core| core.session.participants().cloned().collect())
    }

    /// Letzte Statistik der laufenden Sitzung
    pub fn statistics(&self) -> Statistics {
        self.inner.with_core(|core| core.statistics())
    }

    // ========================================================================
    // LOCAL VIDEO
    // ========================================================================

    /// Startet Kamera und Vorschau. Läuft die Kamera schon, wird nur der
    /// Renderer getauscht.
    pub fn start_local_preview(&self, renderer: Option<Arc<dyn VideoRenderer>>) {
        self.inner
            .with_core(|core| core.media.set_local_renderer(renderer));
        self.open_camera();
    }

    pub fn stop_local_preview(&self) {
        self.inner.with_core(|core| {
            core.media.stop_camera();
        });
    }

    pub fn is_camera_active(&self) -> bool {
        self.inner.with_core(|core| core.media.camera_active())
    }

    /// Schwarzbild statt Kamera; die Vorschau läuft weiter
    pub fn mute_local_video(&self, mute: bool) {
        self.inner.with_core(|core| core.media.mute_local_video(mute));
    }

    pub fn set_video_encoder_param(&self, param: VideoEncParam) -> EngineResult<()> {
        self.inner
            .with_core(|core| core.media.set_video_encoder_param(param))
    }

    pub fn video_encoder_param(&self) -> VideoEncParam {
        self.inner.with_core(|core| core.media.encoder_param())
    }

    /// Dual-Stream: zusätzlicher kleiner Stream mit gleichem Seitenverhältnis
    pub fn enable_small_video_stream(&self, enable: bool, param: VideoEncParam) -> EngineResult<()> {
        self.inner
            .with_core(|core| core.media.enable_small_video_stream(enable, param))
    }

    pub fn set_network_qos_param(&self, qos: NetworkQosParam) {
        self.inner.with_core(|core| core.media.set_network_qos_param(qos));
    }

    pub fn set_video_encoder_rotation(&self, rotation: Rotation) {
        self.inner
            .with_core(|core| core.media.set_video_encoder_rotation(rotation));
    }

    pub fn set_local_view_fill_mode(&self, mode: FillMode) {
        self.inner.with_core(|core| core.media.set_local_view_fill_mode(mode));
    }

    pub fn set_local_view_rotation(&self, rotation: Rotation) {
        self.inner
            .with_core(|core| core.media.set_local_view_rotation(rotation));
    }

    pub fn set_local_view_mirror(&self, mirror: bool) {
        self.inner.with_core(|core| core.media.set_local_view_mirror(mirror));
    }

    pub fn local_view_transform(&self) -> ViewTransform {
        self.inner.with_core(|core| core.media.local_transform())
    }

    /// Raw-Frames der lokalen Vorschau. 0 bei Erfolg, sonst negativer Code.
    pub fn set_local_video_render_callback(
        &self,
        format: PixelFormat,
        buffer: BufferType,
        callback: Option<Arc<dyn VideoRenderCallback>>,
    ) -> i32 {
        let result = self.inner.with_core(|core| {
            core.media
                .set_local_video_render_callback(format, buffer, callback)
        });
        render_status(&result)
    }

    // ========================================================================
    // LOCAL AUDIO
    // ========================================================================

    pub fn start_local_audio(&self) {
        self.open_mic();
    }

    pub fn stop_local_audio(&self) {
        self.inner.with_core(|core| {
            core.media.stop_mic();
        });
    }

    pub fn is_mic_active(&self) -> bool {
        self.inner.with_core(|core| core.media.mic_active())
    }

    /// Stumm: es wird nichts mehr gesendet, die Aufnahme läuft weiter
    pub fn mute_local_audio(&self, mute: bool) {
        self.inner.with_core(|core| core.media.mute_local_audio(mute));
    }

    // ========================================================================
    // REMOTE VIDEO
    // ========================================================================

    /// Zeigt den Hauptstream eines Nutzers. Der Nutzer muss noch nicht im
    /// Raum sein.
    pub fn start_remote_view(&self, user_id: &str, renderer: Option<Arc<dyn VideoRenderer>>) {
        self.inner.with_core(|core| {
            core.media
                .start_remote_view(&mut core.session, user_id, false, renderer)
        });
    }

    pub fn stop_remote_view(&self, user_id: &str) {
        self.inner.with_core(|core| {
            core.media.stop_remote_view(&mut core.session, user_id, false);
        });
    }

    pub fn start_remote_sub_stream_view(&self, user_id: &str, renderer: Option<Arc<dyn VideoRenderer>>) {
        self.inner.with_core(|core| {
            core.media
                .start_remote_view(&mut core.session, user_id, true, renderer)
        });
    }

    pub fn stop_remote_sub_stream_view(&self, user_id: &str) {
        self.inner.with_core(|core| {
            core.media.stop_remote_view(&mut core.session, user_id, true);
        });
    }

    pub fn stop_all_remote_view(&self) {
        self.inner
            .with_core(|core| core.media.stop_all_remote_view(&mut core.session));
    }

    pub fn has_remote_view(&self, user_id: &str) -> bool {
        self.inner
            .with_core(|core| core.media.has_remote_view(user_id, false))
    }

    /// Aktuell abonnierte Stufe einer Ansicht
    pub fn subscribed_stream(&self, user_id: &str, sub: bool) -> Option<StreamType> {
        self.inner
            .with_core(|core| core.media.subscribed_stream(user_id, sub))
    }

    /// Big oder Small für einen einzelnen Nutzer
    pub fn set_remote_video_stream_type(&self, user_id: &str, stream: StreamType) -> EngineResult<()> {
        self.inner.with_core(|core| {
            core.media
                .set_remote_stream_type(&mut core.session, user_id, stream)
        })
    }

    /// Standard-Stufe für alle Nutzer ohne eigene Einstellung
    pub fn set_prior_remote_video_stream_type(&self, stream: StreamType) -> EngineResult<()> {
        self.inner.with_core(|core| {
            core.media
                .set_prior_remote_stream_type(&mut core.session, stream)
        })
    }

    pub fn set_remote_view_fill_mode(&self, user_id: &str, mode: FillMode) -> EngineResult<()> {
        self.inner
            .with_core(|core| core.media.set_remote_view_fill_mode(user_id, false, mode))
    }

    pub fn set_remote_view_rotation(&self, user_id: &str, rotation: Rotation) -> EngineResult<()> {
        self.inner
            .with_core(|core| core.media.set_remote_view_rotation(user_id, false, rotation))
    }

    pub fn set_remote_sub_stream_view_fill_mode(&self, user_id: &str, mode: FillMode) -> EngineResult<()> {
        self.inner
            .with_core(|core| core.media.set_remote_view_fill_mode(user_id, true, mode))
    }

    pub fn set_remote_sub_stream_view_rotation(&self, user_id: &str, rotation: Rotation) -> EngineResult<()> {
        self.inner
            .with_core(|core| core.media.set_remote_view_rotation(user_id, true, rotation))
    }

    pub fn remote_view_transform(&self, user_id: &str, sub: bool) -> Option<ViewTransform> {
        self.inner
            .with_core(|core| core.media.remote_transform(user_id, sub))
    }

    /// Raw-Frames eines entfernten Hauptstreams. Erfordert eine laufende Ansicht.
    pub fn set_remote_video_render_callback(
        &self,
        user_id: &str,
        format: PixelFormat,
        buffer: BufferType,
        callback: Option<Arc<dyn VideoRenderCallback>>,
    ) -> i32 {
        let result = self.inner.with_core(|core| {
            core.media
                .set_remote_video_render_callback(user_id, format, buffer, callback)
        });
        render_status(&result)
    }

    // ========================================================================
    // REMOTE AUDIO
    // ========================================================================

    pub fn mute_remote_audio(&self, user_id: &str, mute: bool) {
        self.inner
            .with_core(|core| core.media.mute_remote_audio(user_id, mute));
    }

    /// Gilt für alle Nutzer und ersetzt vorherige Einzeleinstellungen
    pub fn mute_all_remote_audio(&self, mute: bool) {
        self.inner
            .with_core(|core| core.media.mute_all_remote_audio(mute));
    }

    pub fn is_remote_audio_muted(&self, user_id: &str) -> bool {
        self.inner
            .with_core(|core| core.media.is_remote_audio_muted(user_id))
    }

    // ========================================================================
    // CUSTOM MESSAGES
    // ========================================================================

    /// Sendet eine Custom Message an alle im Raum
    pub fn try_send_custom_cmd_msg(
        &self,
        cmd_id: u32,
        data: &[u8],
        reliable: bool,
        ordered: bool,
    ) -> EngineResult<()> {
        self.inner.with_core(|core| {
            let link = core.joined_link()?;
            let message =
                core.messages
                    .prepare_send(cmd_id, data, reliable, ordered, Instant::now())?;
            match link.send(message) {
                Ok(()) => Ok(()),
                // Zuverlässige Nachrichten gehen beim nächsten Retransmit raus
                Err(e) if reliable => {
                    tracing::debug!("Custom message queued for retransmit: {}", e);
                    Ok(())
                }
                Err(e) => Err(e.into()),
            }
        })
    }

    /// Wie [`try_send_custom_cmd_msg`](Self::try_send_custom_cmd_msg), nur mit `bool`
    pub fn send_custom_cmd_msg(&self, cmd_id: u32, data: &[u8], reliable: bool, ordered: bool) -> bool {
        match self.try_send_custom_cmd_msg(cmd_id, data, reliable, ordered) {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!("Custom message {} rejected: {}", cmd_id, e);
                false
            }
        }
    }

    pub fn custom_message_stats(&self) -> ChannelStats {
        self.inner.with_core(|core| core.messages.stats())
    }

    // ========================================================================
    // CDN
    // ========================================================================

    pub fn start_publish_cdn_stream(&self, param: PublishCdnParam) -> EngineResult<()> {
        self.inner.with_core(|core| {
            let link = core.joined_link()?;
            let message = core.cdn.start_publish(param)?;
            link.send(message)?;
            Ok(())
        })
    }

    pub fn stop_publish_cdn_stream(&self) -> EngineResult<()> {
        self.inner.with_core(|core| {
            let link = core.joined_link()?;
            link.send(core.cdn.stop_publish())?;
            Ok(())
        })
    }

    /// Setzt das Mix-Layout. `None` oder ein Layout ohne Nutzer beendet das Mixing.
    pub fn set_mix_transcoding_config(&self, config: Option<TranscodingConfig>) -> EngineResult<()> {
        self.inner.with_core(|core| {
            let link = core.joined_link()?;
            let message = core.cdn.set_mix(config)?;
            link.send(message)?;
            Ok(())
        })
    }

    pub fn cdn_publish_state(&self) -> CdnPublishState {
        self.inner.with_core(|core| core.cdn.publish_state())
    }

    /// Stream-Id, unter der das Relay einen Stream direkt weiterleitet
    pub fn cdn_stream_id(&self, user_id: &str, stream: StreamType) -> Option<String> {
        self.inner.with_core(|core| {
            let params = core.session.params()?;
            let custom = if user_id == params.user_id {
                params.stream_id.as_deref()
            } else {
                None
            };
            Some(CdnRelayCoordinator::direct_stream_id(
                params.sdk_app_id,
                params.room_id,
                user_id,
                stream,
                custom,
            ))
        })
    }

    // ========================================================================
    // DIAGNOSTICS
    // ========================================================================

    /// 0 = aus, 1 = Zusammenfassung, 2 = vollständig
    pub fn show_debug_view(&self, level: u8) {
        let mode = DebugViewMode::from_level(level);
        tracing::debug!("Debug view {:?}", mode);
        self.inner.with_core(|core| core.debug_view = mode);
    }

    pub fn debug_view(&self) -> DebugViewMode {
        self.inner.with_core(|core| core.debug_view)
    }

    pub fn set_log_level(level: LogLevel) -> EngineResult<()> {
        crate::config::set_log_level(level)?;
        Ok(())
    }

    pub fn set_log_callback(callback: Option<Arc<dyn LogCallback>>) {
        crate::config::set_log_callback(callback);
    }

    // ========================================================================
    // SHUTDOWN
    // ========================================================================

    fn shutdown(&self) {
        self.exit_room();
        self.stop_speed_test();
        self.stop_camera_device_test();
        self.stop_mic_device_test();
        self.inner.with_core(|core| {
            core.media.teardown();
            for task in [core.volume_task.take(), core.device_watch.take()]
                .into_iter()
                .flatten()
            {
                task.abort();
            }
        });
        tracing::info!("RoomEngine shut down");
    }
}

impl Drop for RoomEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for RoomEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomEngine")
            .field("state", &self.room_state())
            .field("observers", &self.dispatcher.observer_count())
            .finish()
    }
}
