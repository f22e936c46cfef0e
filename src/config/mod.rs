//! Konfiguration - Engine-weite Einstellungen
//!
//! Alle prozessweiten Einstellungen (Log-Level, Log-Verzeichnis, Kompression,
//! Debug-Ansicht) werden als ein Konfigurationsobjekt beim Erzeugen der Engine
//! übergeben. Es gibt keinen globalen, veränderlichen Zustand außer dem
//! einmalig installierten Logging-Subscriber.

mod logging;

pub use logging::{
    init_logging, set_log_callback, set_log_level, LogCallback, LogRecord, LoggingHandle,
};

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Invalid configuration value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("Failed to initialize logging: {0}")]
    Logging(String),
}

// ============================================================================
// LOGGING
// ============================================================================

/// Log-Level, entspricht den tracing-Leveln plus "aus"
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Verbose,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
    Fatal,
    None,
}

impl LogLevel {
    /// Filter-Direktive für tracing-subscriber
    pub fn as_directive(&self) -> &'static str {
        match self {
            LogLevel::Verbose => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error | LogLevel::Fatal => "error",
            LogLevel::None => "off",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LogConfig {
    pub level: LogLevel,
    /// Log-Ausgabe zusätzlich auf der Konsole
    pub console_enabled: bool,
    /// Kompakte JSON-Zeilen statt Klartext in der Log-Datei
    pub compress_enabled: bool,
    /// Verzeichnis für Log-Dateien, `None` = Standard-Verzeichnis der Plattform
    pub directory: Option<PathBuf>,
    /// Überhaupt in Dateien loggen
    pub file_enabled: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            console_enabled: false,
            compress_enabled: true,
            directory: None,
            file_enabled: false,
        }
    }
}

impl LogConfig {
    /// Ermittelt das Log-Verzeichnis (konfiguriert oder Plattform-Standard)
    pub fn resolve_directory(&self) -> Option<PathBuf> {
        if let Some(dir) = &self.directory {
            return Some(dir.clone());
        }
        directories::ProjectDirs::from("com", "roomlink", "roomlink")
            .map(|dirs| dirs.data_dir().join("log"))
    }
}

/// Debug-Ansicht: 0 = aus, 1 = Zusammenfassung, 2 = vollständig
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DebugViewMode {
    #[default]
    Hidden,
    Summary,
    Full,
}

impl DebugViewMode {
    pub fn from_level(level: u8) -> Self {
        match level {
            0 => DebugViewMode::Hidden,
            1 => DebugViewMode::Summary,
            _ => DebugViewMode::Full,
        }
    }

    pub fn as_level(&self) -> u8 {
        match self {
            DebugViewMode::Hidden => 0,
            DebugViewMode::Summary => 1,
            DebugViewMode::Full => 2,
        }
    }
}

// ============================================================================
// RETRY
// ============================================================================

/// Retry-Budget für Reconnects
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub use_jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 250,
            max_delay_ms: 8_000,
            backoff_multiplier: 2.0,
            use_jitter: true,
        }
    }
}

impl RetryConfig {
    /// Wartezeit vor dem Versuch `attempt` (1-basiert)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16) as i32;
        let base = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(exponent);
        let capped = base.min(self.max_delay_ms as f64);

        let millis = if self.use_jitter && capped > 1.0 {
            // +/- 20% Jitter
            let jitter = rand::thread_rng().gen_range(0.8..1.2);
            (capped * jitter).min(self.max_delay_ms as f64)
        } else {
            capped
        };

        Duration::from_millis(millis.max(0.0) as u64)
    }
}

// ============================================================================
// CUSTOM MESSAGE CHANNEL
// ============================================================================

/// Limits und Zeitfenster des Custom Message Channels
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MessageChannelConfig {
    /// Maximale Payload pro Nachricht
    pub max_payload_bytes: usize,
    /// Nachrichten pro Sekunde (Summe über alle cmd ids)
    pub max_messages_per_sec: u32,
    /// Bytes pro Sekunde (Summe über alle cmd ids)
    pub max_bytes_per_sec: usize,
    /// Abstand zwischen Retransmissions unbestätigter Nachrichten
    pub retransmit_interval_ms: u64,
    /// Nach diesem Fenster wird eine unbestätigte Nachricht verworfen
    pub retry_window_ms: u64,
    /// Maximal gleichzeitig unbestätigte Nachrichten
    pub max_pending_reliable: usize,
    /// Wartezeit des Empfängers auf fehlende Sequenznummern
    pub reorder_delay_ms: u64,
    /// Takt für Retransmission und Reorder-Flush
    pub tick_interval_ms: u64,
}

impl Default for MessageChannelConfig {
    fn default() -> Self {
        Self {
            max_payload_bytes: 1024,
            max_messages_per_sec: 30,
            max_bytes_per_sec: 8 * 1024,
            retransmit_interval_ms: 100,
            retry_window_ms: 3_000,
            max_pending_reliable: 64,
            reorder_delay_ms: 500,
            tick_interval_ms: 50,
        }
    }
}

impl MessageChannelConfig {
    pub fn retransmit_interval(&self) -> Duration {
        Duration::from_millis(self.retransmit_interval_ms)
    }

    pub fn retry_window(&self) -> Duration {
        Duration::from_millis(self.retry_window_ms)
    }

    pub fn reorder_delay(&self) -> Duration {
        Duration::from_millis(self.reorder_delay_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }
}

// ============================================================================
// ENGINE CONFIG
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineConfig {
    /// Basis-URL des Signaling/Relay-Dienstes (nur für den WebSocket-Transport)
    pub server_url: String,
    pub log: LogConfig,
    pub debug_view: DebugViewMode,
    pub enter_room_timeout_ms: u64,
    pub heartbeat_interval_secs: u64,
    pub statistics_interval_ms: u64,
    pub reconnect: RetryConfig,
    pub message_channel: MessageChannelConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:8787".to_string(),
            log: LogConfig::default(),
            debug_view: DebugViewMode::Hidden,
            enter_room_timeout_ms: 10_000,
            heartbeat_interval_secs: 25,
            statistics_interval_ms: 1_000,
            reconnect: RetryConfig::default(),
            message_channel: MessageChannelConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Lädt eine Konfiguration aus einer JSON-Datei
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config: EngineConfig = serde_json::from_str(&text)?;
        config.validate()?;
        tracing::debug!("Loaded engine config from {}", path.display());
        Ok(config)
    }

    pub fn enter_room_timeout(&self) -> Duration {
        Duration::from_millis(self.enter_room_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    pub fn statistics_interval(&self) -> Duration {
        Duration::from_millis(self.statistics_interval_ms.max(10))
    }

    /// Prüft die Konfiguration auf offensichtliche Fehler
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mc = &self.message_channel;
        if mc.max_payload_bytes == 0 {
            return Err(ConfigError::InvalidValue {
                field: "messageChannel.maxPayloadBytes",
                reason: "must be greater than 0".into(),
            });
        }
        if mc.max_messages_per_sec == 0 || mc.max_bytes_per_sec == 0 {
            return Err(ConfigError::InvalidValue {
                field: "messageChannel",
                reason: "rate limits must be greater than 0".into(),
            });
        }
        if mc.retransmit_interval_ms == 0 || mc.retransmit_interval_ms > mc.retry_window_ms {
            return Err(ConfigError::InvalidValue {
                field: "messageChannel.retransmitIntervalMs",
                reason: "must be in (0, retryWindowMs]".into(),
            });
        }
        if self.enter_room_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "enterRoomTimeoutMs",
                reason: "must be greater than 0".into(),
            });
        }
        if self.reconnect.backoff_multiplier < 1.0 {
            return Err(ConfigError::InvalidValue {
                field: "reconnect.backoffMultiplier",
                reason: "must be at least 1.0".into(),
            });
        }
        Ok(())
    }
}
