//! In-Process Relay
//!
//! Implementiert dieselbe Dienst-Semantik wie das WebSocket-Relay, aber ohne
//! Netzwerk: Mitgliedschaft, Verfügbarkeit, Abonnements mit Frame-Weiterleitung,
//! Custom Messages mit Relay-Acks, CDN-Bestätigungen und Speed-Test. Dazu
//! Fehlerinjektion für Tests.
//!
//! Alle Zustellungen passieren unter dem Relay-Lock, daher sieht jeder
//! Empfänger die Nachrichten eines Absenders in Sendereihenfolge.

use super::messages::*;
use super::transport::{
    Credentials, SignalingError, TransportConnector, TransportEvent, TransportLink,
    TransportSession,
};
use crate::error::codes;
use crate::media::StreamType;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

// ============================================================================
// RELAY STATE
// ============================================================================

struct Member {
    conn_id: u64,
    tx: mpsc::UnboundedSender<TransportEvent>,
    connected: Arc<AtomicBool>,
    info: UserInfo,
    subscriptions: HashSet<(String, StreamType)>,
}

#[derive(Default)]
struct Room {
    members: BTreeMap<String, Member>,
}

#[derive(Default)]
struct Faults {
    rejected_sigs: HashSet<String>,
    failing_connects: u32,
    dropped_custom: u32,
    cdn_failure: Option<(i32, String)>,
}

#[derive(Default)]
struct RelayState {
    rooms: HashMap<u32, Room>,
    next_conn_id: u64,
    faults: Faults,
    custom_relayed: u64,
    mix_versions: HashMap<(u32, String), u64>,
    cdn_publishing: HashSet<(u32, String)>,
}

impl RelayState {
    fn room_mut(&mut self, room_id: u32) -> &mut Room {
        self.rooms.entry(room_id).or_default()
    }

    fn is_current(&self, room_id: u32, user_id: &str, conn_id: u64) -> bool {
        self.rooms
            .get(&room_id)
            .and_then(|room| room.members.get(user_id))
            .map(|m| m.conn_id == conn_id)
            .unwrap_or(false)
    }

    fn others<'a>(&'a self, room_id: u32, user_id: &'a str) -> impl Iterator<Item = &'a Member> + 'a {
        self.rooms
            .get(&room_id)
            .into_iter()
            .flat_map(|room| room.members.iter())
            .filter(move |(id, _)| id.as_str() != user_id)
            .map(|(_, member)| member)
    }

    fn reply(&self, room_id: u32, user_id: &str, msg: ServerMessage) {
        if let Some(member) = self
            .rooms
            .get(&room_id)
            .and_then(|room| room.members.get(user_id))
        {
            let _ = member.tx.send(TransportEvent::Message(msg));
        }
    }

    fn broadcast(&self, room_id: u32, from: &str, msg: ServerMessage) {
        for member in self.others(room_id, from) {
            let _ = member.tx.send(TransportEvent::Message(msg.clone()));
        }
    }

    /// Entfernt ein Mitglied und meldet den Austritt an alle anderen
    fn leave(&mut self, room_id: u32, user_id: &str, conn_id: u64, reason: u32) -> Option<Member> {
        if !self.is_current(room_id, user_id, conn_id) {
            return None;
        }
        let room = self.rooms.get_mut(&room_id)?;
        let member = room.members.remove(user_id)?;
        member.connected.store(false, Ordering::Release);

        for other in room.members.values_mut() {
            other.subscriptions.retain(|(owner, _)| owner != user_id);
        }
        if room.members.is_empty() {
            self.rooms.remove(&room_id);
        }
        self.mix_versions.remove(&(room_id, user_id.to_string()));
        self.cdn_publishing.remove(&(room_id, user_id.to_string()));

        self.broadcast(
            room_id,
            user_id,
            ServerMessage::UserExit {
                user_id: user_id.to_string(),
                reason,
            },
        );
        tracing::debug!("Relay: {} left room {}", user_id, room_id);
        Some(member)
    }

    fn snapshot(&self, room_id: u32, except: &str) -> Vec<UserInfo> {
        self.others(room_id, except).map(|m| m.info.clone()).collect()
    }
}

// ============================================================================
// MEMORY RELAY
// ============================================================================

/// In-Process Relay, teilbar zwischen beliebig vielen Engines
#[derive(Clone, Default)]
pub struct MemoryRelay {
    state: Arc<Mutex<RelayState>>,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Nutzer-IDs im Raum, sortiert
    pub fn members(&self, room_id: u32) -> Vec<String> {
        self.state
            .lock()
            .rooms
            .get(&room_id)
            .map(|room| room.members.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Veröffentlichungsstatus eines Mitglieds
    pub fn user_info(&self, room_id: u32, user_id: &str) -> Option<UserInfo> {
        self.state
            .lock()
            .rooms
            .get(&room_id)
            .and_then(|room| room.members.get(user_id))
            .map(|m| m.info.clone())
    }

    /// Abonnements eines Mitglieds als (Besitzer, Stream)
    pub fn subscriptions(&self, room_id: u32, user_id: &str) -> Vec<(String, StreamType)> {
        let state = self.state.lock();
        let mut subs: Vec<_> = state
            .rooms
            .get(&room_id)
            .and_then(|room| room.members.get(user_id))
            .map(|m| m.subscriptions.iter().cloned().collect())
            .unwrap_or_default();
        subs.sort();
        subs
    }

    /// Anzahl weitergeleiteter Custom Messages (ohne Retransmission-Duplikate nicht unterscheidbar)
    pub fn custom_messages_relayed(&self) -> u64 {
        self.state.lock().custom_relayed
    }

    pub fn is_publishing_cdn(&self, room_id: u32, user_id: &str) -> bool {
        self.state
            .lock()
            .cdn_publishing
            .contains(&(room_id, user_id.to_string()))
    }

    /// Zuletzt bestätigte Mix-Version eines Nutzers
    pub fn mix_version(&self, room_id: u32, user_id: &str) -> Option<u64> {
        self.state
            .lock()
            .mix_versions
            .get(&(room_id, user_id.to_string()))
            .copied()
    }

    // ========================================================================
    // FAULT INJECTION
    // ========================================================================

    /// Lehnt Verbindungen mit dieser Signatur ab
    pub fn reject_user_sig(&self, user_sig: impl Into<String>) {
        self.state.lock().faults.rejected_sigs.insert(user_sig.into());
    }

    /// Die nächsten `count` Verbindungsversuche schlagen fehl
    pub fn fail_next_connects(&self, count: u32) {
        self.state.lock().faults.failing_connects = count;
    }

    /// Die nächsten `count` Custom Messages gehen verloren (kein Ack, keine Zustellung)
    pub fn drop_next_custom_messages(&self, count: u32) {
        self.state.lock().faults.dropped_custom = count;
    }

    /// CDN-Anfragen mit diesem Fehler beantworten, `None` = Erfolg
    pub fn set_cdn_failure(&self, failure: Option<(i32, String)>) {
        self.state.lock().faults.cdn_failure = failure;
    }

    /// Simuliert einen kurzen Verbindungsabbruch mit erfolgreichem Reconnect
    pub fn interrupt(&self, room_id: u32, user_id: &str) -> bool {
        let state = self.state.lock();
        let Some(member) = state
            .rooms
            .get(&room_id)
            .and_then(|room| room.members.get(user_id))
        else {
            return false;
        };

        let users = state.snapshot(room_id, user_id);
        let _ = member.tx.send(TransportEvent::ConnectionLost);
        let _ = member.tx.send(TransportEvent::Reconnecting { attempt: 1 });
        let _ = member.tx.send(TransportEvent::ConnectionRecovered { users });
        true
    }

    /// Trennt ein Mitglied endgültig, optional mit Fehler
    pub fn disconnect(&self, room_id: u32, user_id: &str, error: Option<SignalingError>) -> bool {
        let mut state = self.state.lock();
        let Some(conn_id) = state
            .rooms
            .get(&room_id)
            .and_then(|room| room.members.get(user_id))
            .map(|m| m.conn_id)
        else {
            return false;
        };

        match state.leave(room_id, user_id, conn_id, 1) {
            Some(member) => {
                let _ = member.tx.send(TransportEvent::Closed { error });
                true
            }
            None => false,
        }
    }

    /// Stellt einem Mitglied eine beliebige Server-Nachricht zu
    pub fn inject(&self, room_id: u32, user_id: &str, msg: ServerMessage) -> bool {
        let state = self.state.lock();
        match state
            .rooms
            .get(&room_id)
            .and_then(|room| room.members.get(user_id))
        {
            Some(member) => member.tx.send(TransportEvent::Message(msg)).is_ok(),
            None => false,
        }
    }

    /// Meldet einem Mitglied eine Netzqualität
    pub fn set_network_quality(&self, room_id: u32, user_id: &str, quality: Quality) -> bool {
        let remote = self
            .state
            .lock()
            .others(room_id, user_id)
            .map(|m| RemoteQuality {
                user_id: m.info.user_id.clone(),
                quality,
            })
            .collect();

        self.inject(
            room_id,
            user_id,
            ServerMessage::NetworkQuality {
                local: quality,
                remote,
            },
        )
    }

    // ========================================================================
    // MESSAGE HANDLING
    // ========================================================================

    fn handle(&self, room_id: u32, user_id: &str, conn_id: u64, msg: ClientMessage) -> Result<(), SignalingError> {
        let mut state = self.state.lock();
        if !state.is_current(room_id, user_id, conn_id) {
            return Err(SignalingError::NotConnected);
        }

        match msg {
            ClientMessage::EnterRoom { .. } => {
                state.reply(
                    room_id,
                    user_id,
                    ServerMessage::Error {
                        code: codes::ERR_ALREADY_IN_ROOM,
                        message: "connection already entered a room".into(),
                    },
                );
            }

            ClientMessage::ExitRoom => {
                state.leave(room_id, user_id, conn_id, 0);
            }

            ClientMessage::Heartbeat { timestamp } => {
                state.reply(room_id, user_id, ServerMessage::Pong { timestamp });
            }

            ClientMessage::PublishState {
                audio,
                video,
                small_video,
                sub_video,
            } => {
                let room = state.room_mut(room_id);
                if let Some(member) = room.members.get_mut(user_id) {
                    member.info.audio = audio;
                    member.info.video = video;
                    member.info.small_video = small_video;
                    member.info.sub_video = sub_video;
                }
                state.broadcast(
                    room_id,
                    user_id,
                    ServerMessage::UserAvailability {
                        user_id: user_id.to_string(),
                        audio,
                        video,
                        small_video,
                        sub_video,
                    },
                );
            }

            ClientMessage::Subscribe {
                user_id: owner,
                stream,
            } => {
                if let Some(member) = state.room_mut(room_id).members.get_mut(user_id) {
                    member.subscriptions.insert((owner, stream));
                }
            }

            ClientMessage::Unsubscribe {
                user_id: owner,
                stream,
            } => {
                if let Some(member) = state.room_mut(room_id).members.get_mut(user_id) {
                    member.subscriptions.remove(&(owner, stream));
                }
            }

            ClientMessage::VideoPacket { stream, frame } => {
                let publishing = state
                    .rooms
                    .get(&room_id)
                    .and_then(|room| room.members.get(user_id))
                    .map(|m| match stream {
                        StreamType::Big => m.info.video,
                        StreamType::Small => m.info.small_video,
                        StreamType::Sub => m.info.sub_video,
                    })
                    .unwrap_or(false);
                if !publishing {
                    return Ok(());
                }

                let key = (user_id.to_string(), stream);
                for member in state.others(room_id, user_id) {
                    if member.subscriptions.contains(&key) {
                        let _ = member.tx.send(TransportEvent::Message(ServerMessage::VideoFrame {
                            user_id: user_id.to_string(),
                            stream,
                            frame: frame.clone(),
                        }));
                    }
                }
            }

            ClientMessage::AudioPacket { frame } => {
                let publishing = state
                    .rooms
                    .get(&room_id)
                    .and_then(|room| room.members.get(user_id))
                    .map(|m| m.info.audio)
                    .unwrap_or(false);
                if publishing {
                    state.broadcast(
                        room_id,
                        user_id,
                        ServerMessage::AudioFrame {
                            user_id: user_id.to_string(),
                            frame,
                        },
                    );
                }
            }

            ClientMessage::CustomCmd {
                cmd_id,
                seq,
                reliable,
                ordered,
                data,
            } => {
                if state.faults.dropped_custom > 0 {
                    state.faults.dropped_custom -= 1;
                    tracing::debug!("Relay: dropping custom message {}/{}", cmd_id, seq);
                    return Ok(());
                }

                state.custom_relayed += 1;
                state.broadcast(
                    room_id,
                    user_id,
                    ServerMessage::CustomCmd {
                        user_id: user_id.to_string(),
                        cmd_id,
                        seq,
                        reliable,
                        ordered,
                        data,
                    },
                );
                if reliable {
                    state.reply(room_id, user_id, ServerMessage::CustomCmdAck { cmd_id, seq });
                }
            }

            ClientMessage::StartPublishCdn { param } => {
                let (code, message) = state
                    .faults
                    .cdn_failure
                    .clone()
                    .unwrap_or((codes::OK, String::new()));
                if code == codes::OK {
                    tracing::debug!("Relay: {} publishing to CDN app {}", user_id, param.app_id);
                    state.cdn_publishing.insert((room_id, user_id.to_string()));
                }
                state.reply(room_id, user_id, ServerMessage::CdnPublishResult { code, message });
            }

            ClientMessage::StopPublishCdn => {
                state.cdn_publishing.remove(&(room_id, user_id.to_string()));
                state.reply(
                    room_id,
                    user_id,
                    ServerMessage::CdnStopResult {
                        code: codes::OK,
                        message: String::new(),
                    },
                );
            }

            ClientMessage::SetMixTranscoding { version, config } => {
                let (code, message) = state
                    .faults
                    .cdn_failure
                    .clone()
                    .unwrap_or((codes::OK, String::new()));
                if code == codes::OK {
                    let key = (room_id, user_id.to_string());
                    match config {
                        Some(_) => {
                            state.mix_versions.insert(key, version);
                        }
                        None => {
                            state.mix_versions.remove(&key);
                        }
                    }
                }
                state.reply(
                    room_id,
                    user_id,
                    ServerMessage::MixTranscodingResult {
                        version,
                        code,
                        message,
                    },
                );
            }

            ClientMessage::SpeedTest { probe_bytes } => {
                state.reply(room_id, user_id, speed_test_result(probe_bytes));
            }
        }

        Ok(())
    }

    fn close(&self, room_id: u32, user_id: &str, conn_id: u64) {
        let mut state = self.state.lock();
        if let Some(member) = state.leave(room_id, user_id, conn_id, 0) {
            let _ = member.tx.send(TransportEvent::Closed { error: None });
        }
    }
}

fn speed_test_result(probe_bytes: u32) -> ServerMessage {
    ServerMessage::SpeedTestResult {
        ip: "127.0.0.1".into(),
        quality: Quality::Excellent,
        upload_loss: 0.0,
        download_loss: 0.0,
        rtt_ms: 1 + probe_bytes / 1_000_000,
    }
}

impl std::fmt::Debug for MemoryRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MemoryRelay")
            .field("rooms", &state.rooms.len())
            .finish()
    }
}

#[async_trait]
impl TransportConnector for MemoryRelay {
    async fn connect(&self, credentials: Credentials) -> Result<TransportSession, SignalingError> {
        let mut state = self.state.lock();

        if state.faults.failing_connects > 0 {
            state.faults.failing_connects -= 1;
            return Err(SignalingError::ConnectionFailed(
                "relay unreachable".to_string(),
            ));
        }
        if credentials.user_sig.is_empty() || state.faults.rejected_sigs.contains(&credentials.user_sig) {
            return Err(SignalingError::ServerError {
                code: codes::ERR_USER_SIG_INVALID,
                message: "user signature rejected".to_string(),
            });
        }

        state.next_conn_id += 1;
        let conn_id = state.next_conn_id;
        let (tx, events) = mpsc::unbounded_channel();
        let connected = Arc::new(AtomicBool::new(true));

        // Probe-Verbindungen landen in einem privaten Pseudo-Raum
        let room_id = if credentials.probe {
            u32::MAX - (conn_id % 1024) as u32
        } else {
            credentials.room_id
        };

        // Gleicher Nutzer erneut: alte Verbindung wird verdrängt
        let previous = state
            .rooms
            .get(&room_id)
            .and_then(|room| room.members.get(&credentials.user_id))
            .map(|m| m.conn_id);
        if let Some(old_conn) = previous {
            if let Some(old) = state.leave(room_id, &credentials.user_id, old_conn, 2) {
                let _ = old.tx.send(TransportEvent::Closed {
                    error: Some(SignalingError::ServerError {
                        code: codes::ERR_USER_DISPLACED,
                        message: "signed in from another connection".to_string(),
                    }),
                });
            }
        }

        let users = state.snapshot(room_id, &credentials.user_id);
        state.room_mut(room_id).members.insert(
            credentials.user_id.clone(),
            Member {
                conn_id,
                tx,
                connected: Arc::clone(&connected),
                info: UserInfo {
                    user_id: credentials.user_id.clone(),
                    ..Default::default()
                },
                subscriptions: HashSet::new(),
            },
        );
        if !credentials.probe {
            state.broadcast(
                room_id,
                &credentials.user_id,
                ServerMessage::UserEnter {
                    user_id: credentials.user_id.clone(),
                },
            );
        }
        tracing::debug!(
            "Relay: {} entered room {} (conn {})",
            credentials.user_id,
            room_id,
            conn_id
        );

        Ok(TransportSession {
            link: Arc::new(MemoryLink {
                relay: self.clone(),
                room_id,
                user_id: credentials.user_id,
                conn_id,
                connected,
            }),
            events,
            users,
        })
    }
}

// ============================================================================
// LINK
// ============================================================================

struct MemoryLink {
    relay: MemoryRelay,
    room_id: u32,
    user_id: String,
    conn_id: u64,
    connected: Arc<AtomicBool>,
}

impl TransportLink for MemoryLink {
    fn send(&self, msg: ClientMessage) -> Result<(), SignalingError> {
        if !self.connected.load(Ordering::Acquire) {
            return Err(SignalingError::NotConnected);
        }
        self.relay.handle(self.room_id, &self.user_id, self.conn_id, msg)
    }

    fn close(&self) {
        if self.connected.swap(false, Ordering::AcqRel) {
            self.relay.close(self.room_id, &self.user_id, self.conn_id);
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}
