//! # Structured Logging
//!
//! Global `tracing` subscriber setup. Output is JSON or human readable text on
//! stdout, optionally mirrored to a daily rolling file.

use std::env;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Serialize, Deserialize};
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Registry};

use crate::types::{Error, ErrorKind, Result};

// Flag to track if logging has been initialized
static LOGGING_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Configuration for the logging system
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// The log level to use (trace, debug, info, warn, error)
    pub level: String,
    /// The service name for identification
    pub service_name: String,
    /// Whether to use JSON formatting
    pub json_format: bool,
    /// Whether to output logs to a file
    pub file_output: bool,
    /// The directory to store log files in
    pub log_dir: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            service_name: "unknown-service".to_string(),
            json_format: true,
            file_output: false,
            log_dir: None,
        }
    }
}

impl LoggingConfig {
    /// Builds a config for `service_name` from `LOG_LEVEL`, `LOG_FORMAT`
    /// (`json` or `text`) and `LOG_DIR`. Setting `LOG_DIR` turns on file output.
    pub fn from_env<S: Into<String>>(service_name: S) -> Self {
        let defaults = Self::default();
        let log_dir = env::var("LOG_DIR").ok().filter(|d| !d.trim().is_empty());

        Self {
            level: env::var("LOG_LEVEL").unwrap_or(defaults.level),
            service_name: service_name.into(),
            json_format: env::var("LOG_FORMAT")
                .map(|f| !f.eq_ignore_ascii_case("text"))
                .unwrap_or(defaults.json_format),
            file_output: log_dir.is_some(),
            log_dir,
        }
    }
}

/// Initializes the structured logging system. Calling it again is a no-op.
pub fn init_logging(config: Option<LoggingConfig>) -> Result<()> {
    if LOGGING_INITIALIZED.load(Ordering::SeqCst) {
        return Ok(());
    }

    let config = config.unwrap_or_default();

    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},hyper=warn,reqwest=warn", config.level)));

    let json_layer = config.json_format.then(|| {
        fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_target(true)
            .with_span_list(true)
    });

    let text_layer = (!config.json_format).then(|| {
        fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
    });

    let file_layer = match (&config.file_output, &config.log_dir) {
        (true, Some(log_dir)) => {
            let file_appender = tracing_appender::rolling::daily(
                log_dir,
                format!("{}.log", config.service_name),
            );
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

            // The guard flushes on drop; it has to live as long as the process
            Box::leak(Box::new(guard));

            Some(fmt::layer().with_writer(non_blocking).with_ansi(false))
        }
        _ => None,
    };

    let subscriber = Registry::default()
        .with(filter)
        .with(json_layer)
        .with(text_layer)
        .with(file_layer);

    tracing::subscriber::set_global_default(subscriber).map_err(|e| {
        Error::new(
            ErrorKind::Initialization,
            format!("Failed to set global subscriber: {}", e),
        )
    })?;

    LOGGING_INITIALIZED.store(true, Ordering::SeqCst);

    tracing::info!(
        service = %config.service_name,
        level = %config.level,
        json = %config.json_format,
        "Structured logging initialized"
    );

    Ok(())
}
