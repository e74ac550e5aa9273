//! Logging initialization
//!
//! Console output plus an optional daily-rolling log file, both filtered by
//! the configured level. File output goes through a non-blocking writer; the
//! returned guard must stay alive for the lifetime of the process or buffered
//! lines are lost on exit.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer,
};

use crate::config::LoggingSection;
use crate::error::ConfigError;

fn level_filter(level: &str) -> Result<EnvFilter, ConfigError> {
    EnvFilter::try_new(level)
        .map_err(|e| ConfigError::Logging(format!("Invalid log level '{}': {}", level, e)))
}

/// Initialize the global subscriber from the logging configuration section
pub fn init_logging(config: &LoggingSection) -> Result<Option<WorkerGuard>, ConfigError> {
    let console_layer = fmt::layer()
        .compact()
        .with_target(true)
        .with_filter(level_filter(&config.level)?);

    let mut file_layer = None;
    let mut guard = None;
    if let Some(file_path) = &config.file {
        let path = Path::new(file_path);
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir)
            .map_err(|e| ConfigError::Logging(format!("Cannot create log directory: {}", e)))?;

        let appender = tracing_appender::rolling::daily(
            dir,
            path.file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("regpoll.log"),
        );
        let (non_blocking, file_guard) = tracing_appender::non_blocking(appender);
        guard = Some(file_guard);

        file_layer = Some(
            fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(true)
                .with_filter(level_filter(&config.level)?),
        );
    }

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| ConfigError::Logging(format!("Failed to initialize logging: {}", e)))?;

    Ok(guard)
}

/// Initialize logging for tests; safe to call repeatedly
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("debug")
        .with_test_writer()
        .try_init();
}
