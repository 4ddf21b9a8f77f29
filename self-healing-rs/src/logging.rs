//! # Structured Logging
//!
//! Subscriber initialisation for hosts that do not install their own, and
//! structured logging of failure events.

use std::sync::atomic::{AtomicBool, Ordering};

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Registry};

use crate::types::{Error, FailureCategory, FailureEvent, Result};

// Flag to track if logging has been initialized
static LOGGING_INITIALIZED: AtomicBool = AtomicBool::new(false);

// Keeps the non-blocking file writer flushing for the life of the process
static FILE_GUARD: OnceCell<WorkerGuard> = OnceCell::new();

/// Configuration for the logging system
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// The log level to use (trace, debug, info, warn, error)
    pub level: String,
    /// The service name, used as the log file prefix
    pub service_name: String,
    /// Whether to use JSON formatting
    pub json_format: bool,
    /// Whether to also write logs to a daily rolling file
    pub file_output: bool,
    /// The directory to store log files in
    pub log_dir: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            service_name: "self-healing".to_string(),
            json_format: false,
            file_output: false,
            log_dir: None,
        }
    }
}

/// Initializes the global tracing subscriber.
///
/// Calling this more than once is a no-op. `RUST_LOG` takes precedence over
/// the configured level.
pub fn init_logging(config: Option<LoggingConfig>) -> Result<()> {
    if LOGGING_INITIALIZED.swap(true, Ordering::SeqCst) {
        return Ok(());
    }

    let config = config.unwrap_or_default();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let json_layer = config.json_format.then(|| {
        fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_target(true)
    });

    let text_layer = (!config.json_format).then(|| fmt::layer().with_target(true));

    let file_layer = match (&config.log_dir, config.file_output) {
        (Some(dir), true) => {
            let appender =
                tracing_appender::rolling::daily(dir, format!("{}.log", config.service_name));
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let _ = FILE_GUARD.set(guard);
            Some(fmt::layer().with_writer(writer).with_ansi(false))
        }
        _ => None,
    };

    let subscriber = Registry::default()
        .with(filter)
        .with(json_layer)
        .with(text_layer)
        .with(file_layer);

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        LOGGING_INITIALIZED.store(false, Ordering::SeqCst);
        return Err(Error::Initialization(format!(
            "Failed to set global subscriber: {}",
            e
        )));
    }

    tracing::info!(
        service = %config.service_name,
        level = %config.level,
        json = %config.json_format,
        "Structured logging initialized"
    );

    Ok(())
}

/// Logs a failure event at a level chosen by its category
pub fn log_failure_event(event: &FailureEvent) {
    use tracing::{error, warn};

    let session = event.session().unwrap_or("unknown");

    match event.category() {
        FailureCategory::RenderBoundary | FailureCategory::RuntimeError => {
            error!(
                event_id = %event.id(),
                category = %event.category(),
                session_id = %session,
                message = %event.message(),
                context = %event.context_map(),
                "Failure reported"
            );
        }
        FailureCategory::RejectedOperation | FailureCategory::DiagnosticOutput => {
            warn!(
                event_id = %event.id(),
                category = %event.category(),
                session_id = %session,
                message = %event.message(),
                "Failure reported"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = LoggingConfig::default();
        assert_eq!(config.level, "info");
        assert!(!config.file_output);
        assert!(config.log_dir.is_none());
    }

    #[test]
    fn test_config_deserializes_partially() {
        let config: LoggingConfig =
            serde_json::from_value(serde_json::json!({ "level": "debug" })).unwrap();
        assert_eq!(config.level, "debug");
        assert_eq!(config.service_name, "self-healing");
    }

    #[test]
    fn test_log_failure_event_without_subscriber() {
        // Must not panic when no subscriber is installed
        let event = FailureEvent::new(FailureCategory::RuntimeError, "boom");
        log_failure_event(&event);
        log_failure_event(&FailureEvent::new(FailureCategory::DiagnosticOutput, "warned"));
    }
}
