//! Engine-Kern
//!
//! Der gesamte veränderliche Zustand liegt in [`EngineCore`] hinter einem
//! einzigen Lock. Hintergrund-Tasks tragen die Epoche ihres Raum-Versuchs mit
//! und verwerfen ihre Ergebnisse, sobald diese nicht mehr aktuell ist.

use crate::callback::{EventEmitter, ExitReason, RoomEvent, Statistics};
use crate::cdn::CdnRelayCoordinator;
use crate::config::{DebugViewMode, EngineConfig};
use crate::devices::{DeviceError, DeviceKind, DeviceManager};
use crate::error::{codes, EngineError, EngineResult};
use crate::media::{AudioFrame, MediaTrackManager, RenderSlot, VideoFrame};
use crate::messaging::{CustomMessageChannel, Delivery};
use crate::session::{ParticipantUpdate, RoomSession};
use crate::signaling::{
    ClientMessage, ServerMessage, SignalingError, TransportConnector, TransportEvent,
    TransportLink, TransportSession,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::Instrument;
use uuid::Uuid;

// ============================================================================
// CORE STATE
// ============================================================================

/// Kamera-Test außerhalb eines Raums
pub(crate) struct CameraTest {
    pub slot: Arc<RenderSlot>,
    pub task: JoinHandle<()>,
}

pub(crate) struct EngineCore {
    pub session: RoomSession,
    pub media: MediaTrackManager,
    pub messages: CustomMessageChannel,
    pub cdn: CdnRelayCoordinator,
    pub link: Option<Arc<dyn TransportLink>>,
    /// Verbindungsaufbau, Event-Pumpe und Timer des laufenden Versuchs
    pub session_tasks: Vec<JoinHandle<()>>,
    pub session_id: Option<Uuid>,
    /// Warum die Sitzung in `Error` gelandet ist
    pub failure: Option<ExitReason>,
    pub rtt_ms: u32,
    pub debug_view: DebugViewMode,

    pub volume_task: Option<JoinHandle<()>>,
    pub speed_generation: u64,
    pub speed_task: Option<JoinHandle<()>>,
    pub speed_link: Option<Arc<dyn TransportLink>>,
    pub camera_test: Option<CameraTest>,
    pub mic_test: Option<JoinHandle<()>>,
    pub device_watch: Option<JoinHandle<()>>,
}

impl EngineCore {
    pub fn new(config: &EngineConfig, media: MediaTrackManager) -> Self {
        Self {
            session: RoomSession::new(),
            media,
            messages: CustomMessageChannel::new(config.message_channel.clone()),
            cdn: CdnRelayCoordinator::new(),
            link: None,
            session_tasks: Vec::new(),
            session_id: None,
            failure: None,
            rtt_ms: 0,
            debug_view: config.debug_view,
            volume_task: None,
            speed_generation: 0,
            speed_task: None,
            speed_link: None,
            camera_test: None,
            mic_test: None,
            device_watch: None,
        }
    }

    /// Beigetreten und `epoch` ist der laufende Versuch
    pub fn is_live(&self, epoch: u64) -> bool {
        self.session.is_current(epoch) && self.session.is_joined()
    }

    /// Verbindung der beigetretenen Sitzung
    pub fn joined_link(&self) -> EngineResult<Arc<dyn TransportLink>> {
        if !self.session.is_joined() {
            return Err(EngineError::NotInRoom);
        }
        self.link.clone().ok_or(EngineError::NotInRoom)
    }

    pub fn abort_session_tasks(&mut self) {
        for task in self.session_tasks.drain(..) {
            task.abort();
        }
    }

    pub fn statistics(&self) -> Statistics {
        Statistics {
            rtt_ms: self.rtt_ms,
            sent_bytes: self.media.sent_bytes(),
            received_bytes: self.media.received_bytes(),
            local: self.media.local_statistics(),
            remote: self.media.remote_statistics(),
        }
    }

    /// Wendet Teilnehmer-Änderungen auf Medien und Nachrichten an und meldet sie
    pub fn apply_updates(&mut self, emitter: &EventEmitter, updates: Vec<ParticipantUpdate>) {
        self.media.on_participant_updates(&mut self.session, &updates);
        for update in updates {
            if let ParticipantUpdate::Left { user_id, .. } = &update {
                self.messages.remove_user(user_id);
            }
            if let Some(event) = update_event(update) {
                emitter.emit(event);
            }
        }
    }
}

/// Übersetzt eine Teilnehmer-Änderung in ein Event. Der kleine Stream hat keins.
pub(crate) fn update_event(update: ParticipantUpdate) -> Option<RoomEvent> {
    match update {
        ParticipantUpdate::Entered { user_id } => Some(RoomEvent::UserEnter { user_id }),
        ParticipantUpdate::Left { user_id, reason } => Some(RoomEvent::UserExit { user_id, reason }),
        ParticipantUpdate::AudioAvailable { user_id, available } => {
            Some(RoomEvent::UserAudioAvailable { user_id, available })
        }
        ParticipantUpdate::VideoAvailable { user_id, available } => {
            Some(RoomEvent::UserVideoAvailable { user_id, available })
        }
        ParticipantUpdate::SubStreamAvailable { user_id, available } => {
            Some(RoomEvent::UserSubStreamAvailable { user_id, available })
        }
        ParticipantUpdate::SmallVideoAvailable { .. } => None,
    }
}

pub(crate) fn delivery_event(delivery: Delivery) -> RoomEvent {
    match delivery {
        Delivery::Message {
            user_id,
            cmd_id,
            seq,
            data,
        } => RoomEvent::RecvCustomCmdMsg {
            user_id,
            cmd_id,
            seq,
            data,
        },
        Delivery::Missed {
            user_id,
            cmd_id,
            missed,
        } => RoomEvent::MissCustomCmdMsg {
            user_id,
            cmd_id,
            error_code: codes::ERR_CUSTOM_MSG_MISSED,
            missed,
        },
    }
}

pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn log_debug_view(mode: DebugViewMode, stats: &Statistics) {
    match mode {
        DebugViewMode::Hidden => {}
        DebugViewMode::Summary => tracing::info!(
            target: "roomlink::debug_view",
            "rtt {} ms, sent {} B, received {} B, {} local / {} remote streams",
            stats.rtt_ms,
            stats.sent_bytes,
            stats.received_bytes,
            stats.local.len(),
            stats.remote.len()
        ),
        DebugViewMode::Full => match serde_json::to_string(stats) {
            Ok(json) => tracing::info!(target: "roomlink::debug_view", "{}", json),
            Err(e) => tracing::warn!("Failed to serialize statistics: {}", e),
        },
    }
}

// ============================================================================
// ENGINE INNER
// ============================================================================

pub(crate) struct EngineInner {
    pub config: EngineConfig,
    pub runtime: Handle,
    pub connector: Arc<dyn TransportConnector>,
    pub devices: Arc<DeviceManager>,
    pub emitter: EventEmitter,
    pub core: Mutex<EngineCore>,
}

impl EngineInner {
    /// Führt `f` unter dem Engine-Lock aus und deaktiviert danach alle
    /// stillgelegten Render-Slots ohne Lock.
    pub fn with_core<R>(&self, f: impl FnOnce(&mut EngineCore) -> R) -> R {
        let (result, retired) = {
            let mut core = self.core.lock();
            let result = f(&mut core);
            let retired = core.media.take_retired();
            (result, retired)
        };
        for slot in retired {
            slot.deactivate();
        }
        result
    }

    pub fn emit(&self, event: RoomEvent) {
        self.emitter.emit(event);
    }

    /// Öffnet das aktuell gewählte Gerät auf dem Blocking-Pool
    pub async fn open_device<T, F>(&self, kind: DeviceKind, open: F) -> Result<T, DeviceError>
    where
        T: Send + 'static,
        F: FnOnce(&DeviceManager, &str) -> Result<T, DeviceError> + Send + 'static,
    {
        let devices = self.devices.clone();
        tokio::task::spawn_blocking(move || {
            let id = devices.current_id(kind)?;
            open(&devices, &id)
        })
        .await
        .unwrap_or_else(|e| {
            Err(DeviceError::OpenFailed {
                kind,
                reason: e.to_string(),
            })
        })
    }

    // ========================================================================
    // ENTER
    // ========================================================================

    /// Abschluss des Verbindungsaufbaus für Versuch `epoch`
    pub fn finish_enter(
        self: &Arc<Self>,
        epoch: u64,
        result: Result<TransportSession, SignalingError>,
    ) {
        let session = match result {
            Ok(session) => session,
            Err(e) => {
                self.with_core(|core| {
                    if core.session.fail_enter(epoch) {
                        tracing::warn!("Entering room failed: {}", e);
                        core.session_id = None;
                        core.session_tasks.clear();
                        self.emit(RoomEvent::EnterRoomFailed {
                            code: e.code(),
                            message: e.to_string(),
                        });
                    }
                });
                return;
            }
        };

        let TransportSession {
            link,
            events,
            users,
        } = session;
        let accepted = self.with_core(|core| {
            let Some((elapsed, updates)) = core.session.complete_enter(epoch, &users) else {
                return false;
            };
            tracing::info!(
                "Entered room in {} ms with {} remote users",
                elapsed.as_millis(),
                users.len()
            );
            core.link = Some(link.clone());
            core.rtt_ms = 0;
            self.emit(RoomEvent::EnterRoom {
                elapsed_ms: elapsed.as_millis() as u64,
            });
            core.media.attach_link(link.clone(), &mut core.session);
            core.apply_updates(&self.emitter, updates);

            let span = tracing::info_span!(
                "room",
                session = %core.session_id.unwrap_or_default(),
                epoch
            );
            let tasks = [
                self.runtime
                    .spawn(self.clone().pump(epoch, events).instrument(span.clone())),
                self.runtime
                    .spawn(self.clone().message_ticker(epoch).instrument(span.clone())),
                self.runtime
                    .spawn(self.clone().statistics_ticker(epoch).instrument(span)),
            ];
            core.session_tasks.extend(tasks);
            true
        });

        if accepted {
            self.open_speaker(epoch);
        } else {
            tracing::debug!("Discarding stale room connection for epoch {}", epoch);
            link.close();
        }
    }

    /// Öffnet die Wiedergabe für die laufende Sitzung
    pub fn open_speaker(self: &Arc<Self>, epoch: u64) {
        let inner = self.clone();
        let task = self.runtime.spawn(async move {
            let opened = inner
                .open_device(DeviceKind::Speaker, |devices, id| {
                    devices.backend().open_speaker(id)
                })
                .await;
            inner.with_core(|core| {
                if !core.is_live(epoch) {
                    return;
                }
                match opened {
                    Ok(output) => core.media.attach_speaker(output),
                    Err(e) => {
                        tracing::warn!("Failed to open speaker: {}", e);
                        inner.emit(RoomEvent::Error {
                            code: e.code(),
                            message: e.to_string(),
                        });
                    }
                }
            });
        });
        self.with_core(|core| core.session_tasks.push(task));
    }

    // ========================================================================
    // SESSION TASKS
    // ========================================================================

    async fn pump(self: Arc<Self>, epoch: u64, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
        while let Some(event) = events.recv().await {
            if !self.on_transport_event(epoch, event) {
                break;
            }
        }
        tracing::debug!("Room event pump finished");
    }

    async fn message_ticker(self: Arc<Self>, epoch: u64) {
        let mut interval = tokio::time::interval(self.config.message_channel.tick_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let alive = self.with_core(|core| {
                if !core.is_live(epoch) {
                    return false;
                }
                let tick = core.messages.tick(Instant::now());
                if let Some(link) = &core.link {
                    for msg in tick.resend {
                        if let Err(e) = link.send(msg) {
                            tracing::debug!("Retransmit deferred: {}", e);
                        }
                    }
                }
                for (cmd_id, seq) in tick.expired {
                    self.emit(RoomEvent::Warning {
                        code: codes::WARNING_MESSAGE_RETRY_EXHAUSTED,
                        message: format!("custom message {cmd_id}/{seq} was not acknowledged"),
                    });
                }
                for delivery in tick.deliveries {
                    self.emit(delivery_event(delivery));
                }
                true
            });
            if !alive {
                break;
            }
        }
    }

    async fn statistics_ticker(self: Arc<Self>, epoch: u64) {
        let mut interval = tokio::time::interval(self.config.statistics_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval.tick().await;
        loop {
            interval.tick().await;
            let report = self.with_core(|core| {
                if !core.is_live(epoch) {
                    return None;
                }
                if let Some(link) = &core.link {
                    let _ = link.send(ClientMessage::Heartbeat {
                        timestamp: now_ms(),
                    });
                }
                Some((core.statistics(), core.debug_view))
            });
            let Some((stats, view)) = report else {
                break;
            };
            log_debug_view(view, &stats);
            self.emit(RoomEvent::Statistics(stats));
        }
    }

    // ========================================================================
    // TRANSPORT EVENTS
    // ========================================================================

    /// `false` beendet die Event-Pumpe
    fn on_transport_event(&self, epoch: u64, event: TransportEvent) -> bool {
        match event {
            TransportEvent::Message(msg) => {
                self.on_server_message(epoch, msg);
                true
            }
            TransportEvent::ConnectionLost => self.with_core(|core| {
                if !core.is_live(epoch) {
                    return false;
                }
                tracing::warn!("Connection to relay lost");
                self.emit(RoomEvent::ConnectionLost);
                true
            }),
            TransportEvent::Reconnecting { attempt } => self.with_core(|core| {
                if !core.is_live(epoch) {
                    return false;
                }
                self.emit(RoomEvent::TryToReconnect { attempt });
                self.emit(RoomEvent::Warning {
                    code: codes::WARNING_RECONNECTING,
                    message: format!("reconnecting to relay, attempt {attempt}"),
                });
                true
            }),
            TransportEvent::ConnectionRecovered { users } => self.with_core(|core| {
                if !core.is_live(epoch) {
                    return false;
                }
                tracing::info!("Connection recovered, resyncing {} users", users.len());
                let updates = core.session.resync(&users);
                core.apply_updates(&self.emitter, updates);
                core.media.resync(&mut core.session);
                if let Some(link) = &core.link {
                    for msg in core.cdn.resync_messages() {
                        if let Err(e) = link.send(msg) {
                            tracing::warn!("Failed to restore CDN state: {}", e);
                        }
                    }
                }
                self.emit(RoomEvent::ConnectionRecovery);
                true
            }),
            TransportEvent::Closed { error } => {
                self.on_closed(epoch, error);
                false
            }
        }
    }

    fn on_closed(&self, epoch: u64, error: Option<SignalingError>) {
        self.with_core(|core| {
            if !core.is_live(epoch) {
                return;
            }
            let error = error.unwrap_or(SignalingError::NotConnected);
            if !core.session.fail(epoch) {
                return;
            }
            tracing::error!("Room connection closed: {}", error);
            core.failure = Some(if error.code() == codes::ERR_USER_DISPLACED {
                ExitReason::Displaced
            } else {
                ExitReason::ConnectionFailed
            });
            core.link = None;
            core.media.detach();
            core.messages.reset();
            self.emit(RoomEvent::Error {
                code: error.code(),
                message: error.to_string(),
            });
        });
    }

    fn on_server_message(&self, epoch: u64, msg: ServerMessage) {
        match msg {
            ServerMessage::VideoFrame {
                user_id,
                stream,
                frame,
            } => {
                let frame = VideoFrame::from_payload(frame);
                let slot = self.with_core(|core| {
                    if !core.is_live(epoch) {
                        return None;
                    }
                    core.media.on_remote_video(&user_id, stream, &frame)
                });
                if let Some(slot) = slot {
                    slot.deliver(&frame);
                }
            }
            ServerMessage::AudioFrame { user_id, frame } => {
                let frame = AudioFrame::from_payload(&frame);
                self.with_core(|core| {
                    if core.is_live(epoch) {
                        core.media.on_remote_audio(&user_id, frame);
                    }
                });
            }
            msg => self.with_core(|core| {
                if core.is_live(epoch) {
                    self.on_control_message(core, msg);
                }
            }),
        }
    }

    fn on_control_message(&self, core: &mut EngineCore, msg: ServerMessage) {
        match msg {
            ServerMessage::UserEnter { .. }
            | ServerMessage::UserExit { .. }
            | ServerMessage::UserAvailability { .. } => {
                let updates = core.session.apply(&msg);
                core.apply_updates(&self.emitter, updates);
            }
            ServerMessage::CustomCmd {
                user_id,
                cmd_id,
                seq,
                ordered,
                data,
                ..
            } => {
                let deliveries =
                    core.messages
                        .on_message(&user_id, cmd_id, seq, ordered, data, Instant::now());
                for delivery in deliveries {
                    self.emit(delivery_event(delivery));
                }
            }
            ServerMessage::CustomCmdAck { cmd_id, seq } => core.messages.on_ack(cmd_id, seq),
            ServerMessage::NetworkQuality { local, remote } => {
                core.media.on_network_quality(local);
                self.emit(RoomEvent::NetworkQuality { local, remote });
            }
            ServerMessage::CdnPublishResult { code, message } => {
                if let Some(result) = core.cdn.on_publish_result(code, message) {
                    self.emit(RoomEvent::StartPublishCdnStream {
                        code: result.code,
                        message: result.message,
                    });
                }
            }
            ServerMessage::CdnStopResult { code, message } => {
                let result = core.cdn.on_stop_result(code, message);
                self.emit(RoomEvent::StopPublishCdnStream {
                    code: result.code,
                    message: result.message,
                });
            }
            ServerMessage::MixTranscodingResult {
                version,
                code,
                message,
            } => {
                if let Some(result) = core.cdn.on_mix_result(version, code, message) {
                    self.emit(RoomEvent::SetMixTranscodingConfig {
                        code: result.code,
                        message: result.message,
                    });
                }
            }
            ServerMessage::Pong { timestamp } => {
                core.rtt_ms = (now_ms() - timestamp).clamp(0, u32::MAX as i64) as u32;
            }
            ServerMessage::Error { code, message } => {
                tracing::warn!("Relay reported error {}: {}", code, message);
                self.emit(RoomEvent::Error { code, message });
            }
            ServerMessage::RoomEntered { .. }
            | ServerMessage::SpeedTestResult { .. }
            | ServerMessage::VideoFrame { .. }
            | ServerMessage::AudioFrame { .. } => {
                tracing::trace!("Ignoring unexpected relay message");
            }
        }
    }
}
