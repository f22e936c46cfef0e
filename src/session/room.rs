//! Room Session State Machine
//!
//! `Idle → Entering → Joined → Exiting → Idle`, plus `Error` aus `Entering`
//! oder `Joined`. Jeder Enter-Versuch bekommt eine neue Epoche; Ergebnisse
//! aus älteren Epochen werden verworfen.

use super::state::{AppScene, EnterRoomParams, ParticipantUpdate, RemoteParticipant, RoomState};
use crate::error::{EngineError, EngineResult};
use crate::signaling::{ServerMessage, UserInfo};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
pub struct RoomSession {
    state: RoomState,
    epoch: u64,
    params: Option<EnterRoomParams>,
    scene: AppScene,
    participants: BTreeMap<String, RemoteParticipant>,
    enter_started: Option<Instant>,
}

impl RoomSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> RoomState {
        self.state
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn params(&self) -> Option<&EnterRoomParams> {
        self.params.as_ref()
    }

    pub fn scene(&self) -> AppScene {
        self.scene
    }

    pub fn is_joined(&self) -> bool {
        self.state == RoomState::Joined
    }

    /// Gehört `epoch` zum laufenden Versuch?
    pub fn is_current(&self, epoch: u64) -> bool {
        self.epoch == epoch && self.state != RoomState::Idle
    }

    pub fn participant(&self, user_id: &str) -> Option<&RemoteParticipant> {
        self.participants.get(user_id)
    }

    pub fn participant_mut(&mut self, user_id: &str) -> Option<&mut RemoteParticipant> {
        self.participants.get_mut(user_id)
    }

    pub fn participants(&self) -> impl Iterator<Item = &RemoteParticipant> {
        self.participants.values()
    }

    // ========================================================================
    // TRANSITIONS
    // ========================================================================

    /// `Idle → Entering`. Liefert die Epoche des Versuchs.
    pub fn begin_enter(&mut self, params: EnterRoomParams, scene: AppScene) -> EngineResult<u64> {
        if self.state != RoomState::Idle {
            return Err(EngineError::AlreadyInRoom);
        }
        params.validate()?;

        self.epoch += 1;
        self.state = RoomState::Entering;
        self.params = Some(params);
        self.scene = scene;
        self.participants.clear();
        self.enter_started = Some(Instant::now());
        tracing::debug!("Room session epoch {} entering", self.epoch);
        Ok(self.epoch)
    }

    /// `Entering → Joined`. `None` wenn der Versuch inzwischen veraltet ist.
    pub fn complete_enter(
        &mut self,
        epoch: u64,
        users: &[UserInfo],
    ) -> Option<(Duration, Vec<ParticipantUpdate>)> {
        if self.epoch != epoch || self.state != RoomState::Entering {
            return None;
        }
        self.state = RoomState::Joined;

        let elapsed = self
            .enter_started
            .take()
            .map(|started| started.elapsed())
            .unwrap_or_default();

        let updates = users.iter().flat_map(|info| self.sync_user(info)).collect();
        Some((elapsed, updates))
    }

    /// `Entering → Idle` nach fehlgeschlagenem Verbindungsaufbau
    pub fn fail_enter(&mut self, epoch: u64) -> bool {
        if self.epoch != epoch || self.state != RoomState::Entering {
            return false;
        }
        self.reset();
        true
    }

    /// `Entering | Joined → Error`
    pub fn fail(&mut self, epoch: u64) -> bool {
        if self.epoch != epoch {
            return false;
        }
        match self.state {
            RoomState::Entering | RoomState::Joined => {
                self.state = RoomState::Error;
                true
            }
            _ => false,
        }
    }

    /// `* → Exiting`. Invalidiert alle laufenden Hintergrund-Arbeiten.
    pub fn begin_exit(&mut self) -> EngineResult<()> {
        if self.state == RoomState::Idle {
            return Err(EngineError::NotInRoom);
        }
        self.epoch += 1;
        self.state = RoomState::Exiting;
        Ok(())
    }

    /// `Exiting → Idle`
    pub fn finish_exit(&mut self) {
        self.reset();
    }

    fn reset(&mut self) {
        self.state = RoomState::Idle;
        self.params = None;
        self.participants.clear();
        self.enter_started = None;
    }

    // ========================================================================
    // MEMBERSHIP
    // ========================================================================

    /// Wendet eine Server-Nachricht auf die Teilnehmerliste an.
    /// Außerhalb von `Joined` wird alles verworfen.
    pub fn apply(&mut self, msg: &ServerMessage) -> Vec<ParticipantUpdate> {
        if self.state != RoomState::Joined {
            return Vec::new();
        }

        match msg {
            ServerMessage::UserEnter { user_id } => self.ensure_participant(user_id),
            ServerMessage::UserExit { user_id, reason } => {
                match self.participants.remove(user_id) {
                    Some(_) => vec![ParticipantUpdate::Left {
                        user_id: user_id.clone(),
                        reason: *reason,
                    }],
                    None => Vec::new(),
                }
            }
            ServerMessage::UserAvailability {
                user_id,
                audio,
                video,
                small_video,
                sub_video,
            } => self.sync_user(&UserInfo {
                user_id: user_id.clone(),
                audio: *audio,
                video: *video,
                small_video: *small_video,
                sub_video: *sub_video,
            }),
            _ => Vec::new(),
        }
    }

    /// Gleicht die Teilnehmerliste nach einem Reconnect mit dem Snapshot ab
    pub fn resync(&mut self, users: &[UserInfo]) -> Vec<ParticipantUpdate> {
        if self.state != RoomState::Joined {
            return Vec::new();
        }

        let gone: Vec<String> = self
            .participants
            .keys()
            .filter(|id| !users.iter().any(|u| &u.user_id == *id))
            .cloned()
            .collect();

        let mut updates = Vec::new();
        for user_id in gone {
            self.participants.remove(&user_id);
            updates.push(ParticipantUpdate::Left { user_id, reason: 0 });
        }
        for info in users {
            updates.extend(self.sync_user(info));
        }
        updates
    }

    fn ensure_participant(&mut self, user_id: &str) -> Vec<ParticipantUpdate> {
        if self.participants.contains_key(user_id) {
            return Vec::new();
        }
        self.participants
            .insert(user_id.to_string(), RemoteParticipant::new(user_id));
        vec![ParticipantUpdate::Entered {
            user_id: user_id.to_string(),
        }]
    }

    fn sync_user(&mut self, info: &UserInfo) -> Vec<ParticipantUpdate> {
        let mut updates = self.ensure_participant(&info.user_id);
        let Some(p) = self.participants.get_mut(&info.user_id) else {
            return updates;
        };
        let user_id = || info.user_id.clone();

        if p.audio_available != info.audio {
            p.audio_available = info.audio;
            updates.push(ParticipantUpdate::AudioAvailable {
                user_id: user_id(),
                available: info.audio,
            });
        }
        if p.video_available != info.video {
            p.video_available = info.video;
            updates.push(ParticipantUpdate::VideoAvailable {
                user_id: user_id(),
                available: info.video,
            });
        }
        if p.small_video_available != info.small_video {
            p.small_video_available = info.small_video;
            updates.push(ParticipantUpdate::SmallVideoAvailable {
                user_id: user_id(),
                available: info.small_video,
            });
        }
        if p.sub_stream_available != info.sub_video {
            p.sub_stream_available = info.sub_video;
            updates.push(ParticipantUpdate::SubStreamAvailable {
                user_id: user_id(),
                available: info.sub_video,
            });
        }
        updates
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::RoomState;

    fn params() -> EnterRoomParams {
        EnterRoomParams::new(1400000001, 42, "alice", "sig")
    }

    fn joined() -> RoomSession {
        let mut session = RoomSession::new();
        let epoch = session.begin_enter(params(), AppScene::VideoCall).unwrap();
        session.complete_enter(epoch, &[]).unwrap();
        session
    }

    #[test]
    fn test_enter_exit_lifecycle() {
        let mut session = RoomSession::new();
        let epoch = session.begin_enter(params(), AppScene::Live).unwrap();
        assert_eq!(session.state(), RoomState::Entering);
        assert_eq!(session.scene(), AppScene::Live);

        assert!(session.complete_enter(epoch, &[]).is_some());
        assert_eq!(session.state(), RoomState::Joined);

        session.begin_exit().unwrap();
        assert_eq!(session.state(), RoomState::Exiting);
        session.finish_exit();
        assert_eq!(session.state(), RoomState::Idle);
        assert!(session.params().is_none());
    }

    #[test]
    fn test_second_enter_rejected() {
        let mut session = joined();
        assert_eq!(
            session.begin_enter(params(), AppScene::VideoCall),
            Err(EngineError::AlreadyInRoom)
        );
    }

    #[test]
    fn test_exit_from_idle_rejected() {
        let mut session = RoomSession::new();
        assert_eq!(session.begin_exit(), Err(EngineError::NotInRoom));
    }

    #[test]
    fn test_stale_completion_discarded() {
        let mut session = RoomSession::new();
        let first = session.begin_enter(params(), AppScene::VideoCall).unwrap();
        session.begin_exit().unwrap();
        session.finish_exit();
        let second = session.begin_enter(params(), AppScene::VideoCall).unwrap();

        assert!(session.complete_enter(first, &[]).is_none());
        assert!(!session.fail_enter(first));
        assert_eq!(session.state(), RoomState::Entering);
        assert!(session.complete_enter(second, &[]).is_some());
    }

    #[test]
    fn test_failed_enter_returns_to_idle() {
        let mut session = RoomSession::new();
        let epoch = session.begin_enter(params(), AppScene::VideoCall).unwrap();
        assert!(session.fail_enter(epoch));
        assert_eq!(session.state(), RoomState::Idle);
    }

    #[test]
    fn test_events_outside_joined_discarded() {
        let mut session = RoomSession::new();
        let _ = session.begin_enter(params(), AppScene::VideoCall).unwrap();
        let updates = session.apply(&ServerMessage::UserEnter {
            user_id: "bob".into(),
        });
        assert!(updates.is_empty());
        assert!(session.participant("bob").is_none());
    }

    #[test]
    fn test_membership_updates() {
        let mut session = joined();
        let updates = session.apply(&ServerMessage::UserAvailability {
            user_id: "bob".into(),
            audio: true,
            video: true,
            small_video: false,
            sub_video: false,
        });
        assert_eq!(
            updates,
            vec![
                ParticipantUpdate::Entered {
                    user_id: "bob".into()
                },
                ParticipantUpdate::AudioAvailable {
                    user_id: "bob".into(),
                    available: true
                },
                ParticipantUpdate::VideoAvailable {
                    user_id: "bob".into(),
                    available: true
                },
            ]
        );

        // Unveränderte Flags erzeugen keine Updates
        let updates = session.apply(&ServerMessage::UserAvailability {
            user_id: "bob".into(),
            audio: true,
            video: true,
            small_video: false,
            sub_video: false,
        });
        assert!(updates.is_empty());

        let updates = session.apply(&ServerMessage::UserExit {
            user_id: "bob".into(),
            reason: 0,
        });
        assert_eq!(updates.len(), 1);
        assert!(session.participant("bob").is_none());
    }

    #[test]
    fn test_resync_removes_missing_users() {
        let mut session = joined();
        session.apply(&ServerMessage::UserEnter {
            user_id: "bob".into(),
        });
        session.apply(&ServerMessage::UserEnter {
            user_id: "carol".into(),
        });

        let updates = session.resync(&[UserInfo {
            user_id: "carol".into(),
            audio: true,
            ..Default::default()
        }]);

        assert!(updates.contains(&ParticipantUpdate::Left {
            user_id: "bob".into(),
            reason: 0
        }));
        assert!(updates.contains(&ParticipantUpdate::AudioAvailable {
            user_id: "carol".into(),
            available: true
        }));
        assert_eq!(session.participants().count(), 1);
    }

    #[test]
    fn test_fail_moves_to_error() {
        let mut session = RoomSession::new();
        let epoch = session.begin_enter(params(), AppScene::VideoCall).unwrap();
        session.complete_enter(epoch, &[]).unwrap();
        assert!(session.fail(epoch));
        assert_eq!(session.state(), RoomState::Error);
        assert!(session.begin_exit().is_ok());
    }
}
