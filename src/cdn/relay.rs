//! CDN Relay Coordinator
//!
//! Hält die aktive Publish- und Mix-Konfiguration. Jede Mix-Änderung bekommt
//! eine neue Version; Antworten zu älteren Versionen werden ignoriert.

use super::{CdnError, PublishCdnParam, TranscodingConfig};
use crate::error::codes;
use crate::media::StreamType;
use crate::signaling::ClientMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CdnPublishState {
    Idle,
    Starting,
    Publishing,
    Stopping,
}

/// Antwort des Relays, bereit für ein Event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CdnResult {
    pub code: i32,
    pub message: String,
}

#[derive(Debug)]
pub struct CdnRelayCoordinator {
    publish: Option<PublishCdnParam>,
    publish_state: CdnPublishState,
    mix: Option<TranscodingConfig>,
    mix_version: u64,
    /// Antworten auf Wiederholungen nach einem Reconnect bleiben still
    silent_publish: bool,
    silent_mix_version: Option<u64>,
}

impl CdnRelayCoordinator {
    pub fn new() -> Self {
        Self {
            publish: None,
            publish_state: CdnPublishState::Idle,
            mix: None,
            mix_version: 0,
            silent_publish: false,
            silent_mix_version: None,
        }
    }

    pub fn publish_state(&self) -> CdnPublishState {
        self.publish_state
    }

    pub fn mix(&self) -> Option<&TranscodingConfig> {
        self.mix.as_ref()
    }

    pub fn mix_version(&self) -> u64 {
        self.mix_version
    }

    /// Startet (oder ersetzt) die Weiterleitung
    pub fn start_publish(&mut self, param: PublishCdnParam) -> Result<ClientMessage, CdnError> {
        param.validate()?;
        tracing::info!("Starting CDN publish to {}", param.url);
        self.publish = Some(param.clone());
        self.publish_state = CdnPublishState::Starting;
        self.silent_publish = false;
        Ok(ClientMessage::StartPublishCdn { param })
    }

    pub fn stop_publish(&mut self) -> ClientMessage {
        tracing::info!("Stopping CDN publish");
        self.publish = None;
        self.publish_state = CdnPublishState::Stopping;
        self.silent_publish = false;
        ClientMessage::StopPublishCdn
    }

    /// Setzt oder beendet (`None` bzw. leere Nutzerliste) das Mixing
    pub fn set_mix(&mut self, config: Option<TranscodingConfig>) -> Result<ClientMessage, CdnError> {
        let config = config.filter(|c| !c.is_cancel());
        if let Some(config) = &config {
            config.validate()?;
        }
        self.mix_version += 1;
        self.silent_mix_version = None;
        match &config {
            Some(c) => tracing::info!(
                "Mix layout v{} with {} users ({}x{})",
                self.mix_version,
                c.mix_users.len(),
                c.video_width,
                c.video_height
            ),
            None => tracing::info!("Mix layout v{} cancels mixing", self.mix_version),
        }
        self.mix = config.clone();
        Ok(ClientMessage::SetMixTranscoding {
            version: self.mix_version,
            config,
        })
    }

    /// `None` wenn die Antwort still verarbeitet wird
    pub fn on_publish_result(&mut self, code: i32, message: String) -> Option<CdnResult> {
        if code == codes::OK {
            if self.publish.is_some() {
                self.publish_state = CdnPublishState::Publishing;
            }
        } else {
            tracing::warn!("CDN publish failed ({}): {}", code, message);
            self.publish = None;
            self.publish_state = CdnPublishState::Idle;
        }
        if std::mem::take(&mut self.silent_publish) && code == codes::OK {
            return None;
        }
        Some(CdnResult { code, message })
    }

    pub fn on_stop_result(&mut self, code: i32, message: String) -> CdnResult {
        if self.publish.is_none() {
            self.publish_state = CdnPublishState::Idle;
        }
        CdnResult { code, message }
    }

    pub fn on_mix_result(&mut self, version: u64, code: i32, message: String) -> Option<CdnResult> {
        if version != self.mix_version {
            tracing::debug!("Ignoring stale mix result v{} (current v{})", version, self.mix_version);
            return None;
        }
        if self.silent_mix_version.take() == Some(version) && code == codes::OK {
            return None;
        }
        if code != codes::OK {
            tracing::warn!("Mix transcoding v{} failed ({}): {}", version, code, message);
        }
        Some(CdnResult { code, message })
    }

    /// Nachrichten, die nach einem Reconnect den Zustand wiederherstellen
    pub fn resync_messages(&mut self) -> Vec<ClientMessage> {
        let mut messages = Vec::new();
        if let Some(param) = &self.publish {
            self.silent_publish = true;
            messages.push(ClientMessage::StartPublishCdn {
                param: param.clone(),
            });
        }
        if let Some(config) = &self.mix {
            self.silent_mix_version = Some(self.mix_version);
            messages.push(ClientMessage::SetMixTranscoding {
                version: self.mix_version,
                config: Some(config.clone()),
            });
        }
        messages
    }

    /// Stream-Id eines direkt weitergeleiteten Streams
    pub fn direct_stream_id(
        sdk_app_id: u32,
        room_id: u32,
        user_id: &str,
        stream: StreamType,
        custom: Option<&str>,
    ) -> String {
        match (custom, stream.is_main()) {
            (Some(custom), true) => custom.to_string(),
            (Some(custom), false) => format!("{custom}_aux"),
            (None, true) => format!("{sdk_app_id}_{room_id}_{user_id}_main"),
            (None, false) => format!("{sdk_app_id}_{room_id}_{user_id}_aux"),
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

impl Default for CdnRelayCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cdn::MixUser;

    fn param() -> PublishCdnParam {
        PublishCdnParam {
            app_id: 1,
            biz_id: 2,
            url: "rtmp://cdn.example.com/live/room".into(),
        }
    }

    fn layout(users: &[&str]) -> TranscodingConfig {
        TranscodingConfig {
            mix_users: users
                .iter()
                .enumerate()
                .map(|(i, id)| MixUser {
                    user_id: id.to_string(),
                    room_id: None,
                    x: i as u32 * 160,
                    y: 0,
                    width: 160,
                    height: 90,
                    z_order: i as u32,
                    stream: StreamType::Big,
                    pure_audio: false,
                })
                .collect(),
            ..TranscodingConfig::default()
        }
    }

    #[test]
    fn test_publish_lifecycle() {
        let mut cdn = CdnRelayCoordinator::new();
        cdn.start_publish(param()).unwrap();
        assert_eq!(cdn.publish_state(), CdnPublishState::Starting);
        assert!(cdn.on_publish_result(codes::OK, String::new()).is_some());
        assert_eq!(cdn.publish_state(), CdnPublishState::Publishing);

        assert_eq!(cdn.stop_publish(), ClientMessage::StopPublishCdn);
        cdn.on_stop_result(codes::OK, String::new());
        assert_eq!(cdn.publish_state(), CdnPublishState::Idle);
    }

    #[test]
    fn test_failed_publish_returns_to_idle() {
        let mut cdn = CdnRelayCoordinator::new();
        cdn.start_publish(param()).unwrap();
        let result = cdn.on_publish_result(-3360, "rejected".into()).unwrap();
        assert_eq!(result.code, -3360);
        assert_eq!(cdn.publish_state(), CdnPublishState::Idle);
        assert!(cdn.resync_messages().is_empty());
    }

    #[test]
    fn test_stale_mix_results_ignored() {
        let mut cdn = CdnRelayCoordinator::new();
        cdn.set_mix(Some(layout(&["a"]))).unwrap();
        cdn.set_mix(Some(layout(&["a", "b"]))).unwrap();
        assert!(cdn.on_mix_result(1, codes::OK, String::new()).is_none());
        assert!(cdn.on_mix_result(2, codes::OK, String::new()).is_some());
        assert_eq!(cdn.mix().unwrap().mix_users.len(), 2);
    }

    #[test]
    fn test_empty_layout_cancels() {
        let mut cdn = CdnRelayCoordinator::new();
        cdn.set_mix(Some(layout(&["a"]))).unwrap();
        let message = cdn.set_mix(Some(layout(&[]))).unwrap();
        assert_eq!(
            message,
            ClientMessage::SetMixTranscoding {
                version: 2,
                config: None
            }
        );
        assert!(cdn.mix().is_none());
    }

    #[test]
    fn test_invalid_layout_keeps_previous() {
        let mut cdn = CdnRelayCoordinator::new();
        cdn.set_mix(Some(layout(&["a"]))).unwrap();
        let mut bad = layout(&["a"]);
        bad.mix_users[0].width = 0;
        assert!(cdn.set_mix(Some(bad)).is_err());
        assert_eq!(cdn.mix_version(), 1);
        assert_eq!(cdn.mix().unwrap().mix_users[0].width, 160);
    }

    #[test]
    fn test_resync_is_silent() {
        let mut cdn = CdnRelayCoordinator::new();
        cdn.start_publish(param()).unwrap();
        cdn.on_publish_result(codes::OK, String::new());
        cdn.set_mix(Some(layout(&["a"]))).unwrap();
        cdn.on_mix_result(1, codes::OK, String::new());

        let messages = cdn.resync_messages();
        assert_eq!(messages.len(), 2);
        assert!(cdn.on_publish_result(codes::OK, String::new()).is_none());
        assert!(cdn.on_mix_result(1, codes::OK, String::new()).is_none());
    }

    #[test]
    fn test_direct_stream_ids() {
        assert_eq!(
            CdnRelayCoordinator::direct_stream_id(1400, 42, "alice", StreamType::Big, None),
            "1400_42_alice_main"
        );
        assert_eq!(
            CdnRelayCoordinator::direct_stream_id(1400, 42, "alice", StreamType::Sub, Some("show")),
            "show_aux"
        );
    }
}
