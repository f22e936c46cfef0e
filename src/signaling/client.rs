//! WebSocket Client für den Relay-Dienst
//!
//! Verwaltet die WebSocket-Verbindung einer Raum-Sitzung:
//! - Authentifizierung über den ersten Frame (`enter_room`)
//! - Heartbeat
//! - Automatische Reconnection mit exponentiellem Backoff
//! - Event-basierte Kommunikation über [`TransportEvent`]

use super::messages::*;
use super::transport::{
    Credentials, SignalingError, TransportConnector, TransportEvent, TransportLink,
    TransportSession,
};
use crate::config::{EngineConfig, RetryConfig};
use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWrite = SplitSink<WsStream, Message>;
type WsRead = SplitStream<WsStream>;

// ============================================================================
// SIGNALING CLIENT
// ============================================================================

/// [`TransportConnector`] über WebSocket
#[derive(Debug, Clone)]
pub struct SignalingClient {
    server_url: String,
    auth_timeout: Duration,
    heartbeat_interval: Duration,
    reconnect: RetryConfig,
}

impl SignalingClient {
    /// Erstellt einen neuen SignalingClient
    pub fn new(server_url: impl Into<String>) -> Self {
        let defaults = EngineConfig::default();
        Self {
            server_url: server_url.into(),
            auth_timeout: defaults.enter_room_timeout(),
            heartbeat_interval: defaults.heartbeat_interval(),
            reconnect: defaults.reconnect,
        }
    }

    /// Übernimmt URL, Timeouts und Retry-Budget aus der Engine-Konfiguration
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            server_url: config.server_url.clone(),
            auth_timeout: config.enter_room_timeout(),
            heartbeat_interval: config.heartbeat_interval(),
            reconnect: config.reconnect.clone(),
        }
    }

    /// WebSocket-URL `<server_url>/ws`, http(s) wird zu ws(s)
    pub fn ws_url(&self) -> Result<Url, SignalingError> {
        let mut url = Url::parse(&self.server_url)
            .map_err(|e| SignalingError::ConnectionFailed(format!("invalid url: {}", e)))?;

        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => {
                return Err(SignalingError::ConnectionFailed(format!(
                    "unsupported scheme: {}",
                    other
                )))
            }
        };
        if url.scheme() != scheme && url.set_scheme(scheme).is_err() {
            return Err(SignalingError::ConnectionFailed(
                "cannot switch url scheme".to_string(),
            ));
        }

        let path = format!("{}/ws", url.path().trim_end_matches('/'));
        url.set_path(&path);
        Ok(url)
    }

    /// Öffnet eine Verbindung und wartet auf `room_entered`
    async fn open(
        &self,
        credentials: &Credentials,
        resume: bool,
    ) -> Result<(WsWrite, WsRead, Vec<UserInfo>), SignalingError> {
        let url = self.ws_url()?;
        tracing::info!("Connecting to relay: {}", url);

        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| SignalingError::ConnectionFailed(e.to_string()))?;
        let (mut write, mut read) = ws_stream.split();

        let enter = serde_json::to_string(&credentials.enter_message(resume))
            .map_err(|e| SignalingError::SendFailed(e.to_string()))?;
        write
            .send(Message::Text(enter))
            .await
            .map_err(|e| SignalingError::SendFailed(e.to_string()))?;

        // Auf die Authentifizierungs-Antwort warten
        let users = tokio::time::timeout(self.auth_timeout, Self::await_entered(&mut read))
            .await
            .map_err(|_| SignalingError::Timeout)??;

        Ok((write, read, users))
    }

    async fn await_entered(read: &mut WsRead) -> Result<Vec<UserInfo>, SignalingError> {
        while let Some(frame) = read.next().await {
            match frame {
                Ok(Message::Text(text)) => match serde_json::from_str::<ServerMessage>(&text) {
                    Ok(ServerMessage::RoomEntered { users }) => return Ok(users),
                    Ok(ServerMessage::Error { code, message }) => {
                        return Err(SignalingError::ServerError { code, message })
                    }
                    Ok(other) => {
                        tracing::debug!("Ignoring message before room_entered: {:?}", other);
                    }
                    Err(e) => tracing::warn!("Unparseable relay frame: {}", e),
                },
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => return Err(SignalingError::ConnectionFailed(e.to_string())),
            }
        }
        Err(SignalingError::ConnectionFailed(
            "connection closed during authentication".to_string(),
        ))
    }
}

#[async_trait]
impl TransportConnector for SignalingClient {
    async fn connect(&self, credentials: Credentials) -> Result<TransportSession, SignalingError> {
        let (write, read, users) = self.open(&credentials, false).await?;
        tracing::info!(
            "Entered room {} as {} ({} users present)",
            credentials.room_id,
            credentials.user_id,
            users.len()
        );

        let (closed_tx, closed_rx) = watch::channel(false);
        let link = Arc::new(WsLink {
            writer: RwLock::new(None),
            connected: AtomicBool::new(true),
            closed: closed_tx,
        });
        link.install_writer(write);

        let (event_tx, events) = mpsc::unbounded_channel();
        tokio::spawn(supervise(
            self.clone(),
            credentials,
            Arc::clone(&link),
            read,
            event_tx,
            closed_rx,
        ));

        Ok(TransportSession {
            link,
            events,
            users,
        })
    }
}

// ============================================================================
// LINK
// ============================================================================

struct WsLink {
    /// Sender zum Write-Task der aktuellen Verbindung
    writer: RwLock<Option<mpsc::UnboundedSender<String>>>,
    connected: AtomicBool,
    closed: watch::Sender<bool>,
}

impl WsLink {
    /// Startet den Write-Task für eine (neue) Verbindung
    fn install_writer(&self, mut write: WsWrite) {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        *self.writer.write() = Some(tx);

        tokio::spawn(async move {
            while let Some(text) = rx.recv().await {
                if let Err(e) = write.send(Message::Text(text)).await {
                    tracing::error!("Failed to send WebSocket message: {}", e);
                    break;
                }
            }
            let _ = write.close().await;
        });
    }

    fn send_text(&self, text: String) -> Result<(), SignalingError> {
        let writer = self.writer.read();
        let tx = writer.as_ref().ok_or(SignalingError::NotConnected)?;
        tx.send(text)
            .map_err(|e| SignalingError::SendFailed(e.to_string()))
    }
}

impl TransportLink for WsLink {
    fn send(&self, msg: ClientMessage) -> Result<(), SignalingError> {
        if !self.connected.load(Ordering::Acquire) {
            return Err(SignalingError::NotConnected);
        }
        let text =
            serde_json::to_string(&msg).map_err(|e| SignalingError::SendFailed(e.to_string()))?;
        self.send_text(text)
    }

    fn close(&self) {
        if self.closed.send_replace(true) {
            return;
        }
        self.connected.store(false, Ordering::Release);
        // Writer droppen beendet den Write-Task und schließt den Socket
        self.writer.write().take();
        tracing::debug!("WebSocket link closed");
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}

// ============================================================================
// SUPERVISOR
// ============================================================================

enum ReadOutcome {
    Lost,
    ClosedLocally,
    ReceiverGone,
}

/// Liest Frames, sendet Heartbeats und verbindet bei Abbruch neu
async fn supervise(
    client: SignalingClient,
    credentials: Credentials,
    link: Arc<WsLink>,
    mut read: WsRead,
    event_tx: mpsc::UnboundedSender<TransportEvent>,
    mut closed_rx: watch::Receiver<bool>,
) {
    loop {
        match read_loop(&client, &link, &mut read, &event_tx, &mut closed_rx).await {
            ReadOutcome::ClosedLocally => {
                let _ = event_tx.send(TransportEvent::Closed { error: None });
                return;
            }
            ReadOutcome::ReceiverGone => {
                link.close();
                return;
            }
            ReadOutcome::Lost => {}
        }

        link.connected.store(false, Ordering::Release);
        link.writer.write().take();
        tracing::warn!("Connection to relay lost, reconnecting");
        let _ = event_tx.send(TransportEvent::ConnectionLost);

        let mut recovered = None;
        for attempt in 1..=client.reconnect.max_attempts {
            let _ = event_tx.send(TransportEvent::Reconnecting { attempt });
            let delay = client.reconnect.delay_for(attempt);

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = closed_rx.changed() => {
                    let _ = event_tx.send(TransportEvent::Closed { error: None });
                    return;
                }
            }

            match client.open(&credentials, true).await {
                Ok(connection) => {
                    recovered = Some(connection);
                    break;
                }
                Err(SignalingError::ServerError { code, message }) => {
                    // Relay lehnt die Sitzung ab, weitere Versuche sind sinnlos
                    tracing::error!("Relay rejected resume: {} {}", code, message);
                    let _ = event_tx.send(TransportEvent::Closed {
                        error: Some(SignalingError::ServerError { code, message }),
                    });
                    return;
                }
                Err(e) => {
                    tracing::warn!("Reconnect attempt {} failed: {}", attempt, e);
                }
            }
        }

        let Some((write, new_read, users)) = recovered else {
            let attempts = client.reconnect.max_attempts;
            tracing::error!("Giving up on relay after {} attempts", attempts);
            let _ = event_tx.send(TransportEvent::Closed {
                error: Some(SignalingError::ReconnectExhausted { attempts }),
            });
            return;
        };

        if *closed_rx.borrow() {
            let _ = event_tx.send(TransportEvent::Closed { error: None });
            return;
        }

        link.install_writer(write);
        link.connected.store(true, Ordering::Release);
        read = new_read;
        tracing::info!("Connection to relay recovered");
        let _ = event_tx.send(TransportEvent::ConnectionRecovered { users });
    }
}

async fn read_loop(
    client: &SignalingClient,
    link: &WsLink,
    read: &mut WsRead,
    event_tx: &mpsc::UnboundedSender<TransportEvent>,
    closed_rx: &mut watch::Receiver<bool>,
) -> ReadOutcome {
    let mut heartbeat = tokio::time::interval(client.heartbeat_interval);
    heartbeat.tick().await;

    loop {
        tokio::select! {
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<ServerMessage>(&text) {
                    Ok(msg) => {
                        if event_tx.send(TransportEvent::Message(msg)).is_err() {
                            return ReadOutcome::ReceiverGone;
                        }
                    }
                    Err(e) => tracing::warn!("Unparseable relay frame: {}", e),
                },
                Some(Ok(Message::Close(_))) | None => {
                    tracing::info!("WebSocket closed by relay");
                    return ReadOutcome::Lost;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::error!("WebSocket error: {}", e);
                    return ReadOutcome::Lost;
                }
            },
            _ = heartbeat.tick() => {
                let ping = ClientMessage::Heartbeat { timestamp: Utc::now().timestamp_millis() };
                if let Err(e) = link.send(ping) {
                    tracing::warn!("Failed to send heartbeat: {}", e);
                }
            }
            _ = closed_rx.changed() => {
                return ReadOutcome::ClosedLocally;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ws_url_from_http() {
        let client = SignalingClient::new("http://relay.example.com");
        assert_eq!(client.ws_url().unwrap().as_str(), "ws://relay.example.com/ws");

        let client = SignalingClient::new("https://relay.example.com/api/");
        assert_eq!(
            client.ws_url().unwrap().as_str(),
            "wss://relay.example.com/api/ws"
        );
    }

    #[test]
    fn test_ws_url_rejects_unknown_scheme() {
        let client = SignalingClient::new("ftp://relay.example.com");
        assert!(matches!(
            client.ws_url(),
            Err(SignalingError::ConnectionFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_connect_to_unreachable_relay_fails() {
        let client = SignalingClient::new("ws://127.0.0.1:1");
        let result = client
            .connect(Credentials::probe(1, "alice", "sig"))
            .await;
        assert!(matches!(result, Err(SignalingError::ConnectionFailed(_))));
    }
}
