//! Prozessweites Logging
//!
//! Installiert einmalig einen tracing-Subscriber mit:
//! - EnvFilter (RUST_LOG überschreibt das konfigurierte Level), zur Laufzeit
//!   über einen Reload-Handle änderbar
//! - optionaler Konsolen-Ausgabe
//! - optionaler Datei-Ausgabe (täglich rotierend, Klartext oder kompaktes JSON)
//! - einem Layer, der jeden Eintrag an einen registrierten [`LogCallback`] reicht

use super::{ConfigError, LogConfig, LogLevel};
use once_cell::sync::{Lazy, OnceCell};
use parking_lot::{Mutex, RwLock};
use std::cell::Cell;
use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, reload, EnvFilter, Layer, Registry};

// ============================================================================
// LOG CALLBACK
// ============================================================================

/// Ein einzelner Log-Eintrag für den [`LogCallback`]
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub level: Level,
    pub target: String,
    pub message: String,
}

/// Empfänger für Log-Einträge der Engine
pub trait LogCallback: Send + Sync {
    fn on_log(&self, record: &LogRecord);
}

static LOG_CALLBACK: Lazy<RwLock<Option<Arc<dyn LogCallback>>>> = Lazy::new(|| RwLock::new(None));

thread_local! {
    static IN_CALLBACK: Cell<bool> = const { Cell::new(false) };
}

/// Setzt (oder entfernt mit `None`) den Log-Callback
pub fn set_log_callback(callback: Option<Arc<dyn LogCallback>>) {
    *LOG_CALLBACK.write() = callback;
}

struct CallbackLayer;

impl<S: Subscriber> Layer<S> for CallbackLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let Some(callback) = LOG_CALLBACK.read().clone() else {
            return;
        };

        // Callbacks die selbst loggen dürfen keine Rekursion auslösen
        if IN_CALLBACK.with(|flag| flag.replace(true)) {
            return;
        }

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        let record = LogRecord {
            level: *event.metadata().level(),
            target: event.metadata().target().to_string(),
            message: visitor.finish(),
        };
        callback.on_log(&record);

        IN_CALLBACK.with(|flag| flag.set(false));
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: String,
}

impl MessageVisitor {
    fn finish(self) -> String {
        if self.fields.is_empty() {
            self.message
        } else {
            format!("{}{}", self.message, self.fields)
        }
    }
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            let _ = write!(self.fields, " {}={}", field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }
}

// ============================================================================
// SUBSCRIBER SETUP
// ============================================================================

/// Handle auf den installierten Subscriber
pub struct LoggingHandle {
    filter: reload::Handle<EnvFilter, Registry>,
    directory: Option<PathBuf>,
    _guard: Mutex<Option<WorkerGuard>>,
}

impl LoggingHandle {
    /// Verzeichnis, in das Log-Dateien geschrieben werden
    pub fn directory(&self) -> Option<&PathBuf> {
        self.directory.as_ref()
    }
}

impl std::fmt::Debug for LoggingHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoggingHandle")
            .field("directory", &self.directory)
            .finish()
    }
}

static LOGGING: OnceCell<LoggingHandle> = OnceCell::new();

/// Installiert den Subscriber. Weitere Aufrufe geben den bestehenden Handle
/// zurück und ignorieren die neue Konfiguration bis auf das Level.
pub fn init_logging(config: &LogConfig) -> Result<&'static LoggingHandle, ConfigError> {
    if let Some(handle) = LOGGING.get() {
        set_log_level(config.level)?;
        return Ok(handle);
    }
    LOGGING.get_or_try_init(|| build_subscriber(config))
}

/// Ändert das Log-Level des installierten Subscribers
pub fn set_log_level(level: LogLevel) -> Result<(), ConfigError> {
    let Some(handle) = LOGGING.get() else {
        return Err(ConfigError::Logging("logging not initialized".into()));
    };
    handle
        .filter
        .reload(EnvFilter::new(level.as_directive()))
        .map_err(|e| ConfigError::Logging(e.to_string()))
}

fn build_subscriber(config: &LogConfig) -> Result<LoggingHandle, ConfigError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_directive()));
    let (filter_layer, filter_handle) = reload::Layer::new(filter);

    let console_layer = config
        .console_enabled
        .then(|| fmt::layer().with_target(true));

    let mut guard = None;
    let mut text_layer = None;
    let mut json_layer = None;
    let mut directory = None;

    if config.file_enabled {
        let dir = config
            .resolve_directory()
            .ok_or_else(|| ConfigError::Logging("no log directory available".into()))?;
        std::fs::create_dir_all(&dir).map_err(|e| ConfigError::Logging(e.to_string()))?;

        let appender = tracing_appender::rolling::daily(&dir, "roomlink.log");
        let (writer, worker_guard) = tracing_appender::non_blocking(appender);
        guard = Some(worker_guard);
        directory = Some(dir);

        if config.compress_enabled {
            json_layer = Some(fmt::layer().json().with_writer(writer));
        } else {
            text_layer = Some(fmt::layer().with_ansi(false).with_writer(writer));
        }
    }

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(console_layer)
        .with(text_layer)
        .with(json_layer)
        .with(CallbackLayer)
        .try_init()
        .map_err(|e| ConfigError::Logging(e.to_string()))?;

    tracing::info!(
        "Logging initialized: level={:?}, console={}, file={:?}",
        config.level,
        config.console_enabled,
        directory
    );

    Ok(LoggingHandle {
        filter: filter_handle,
        directory,
        _guard: Mutex::new(guard),
    })
}
