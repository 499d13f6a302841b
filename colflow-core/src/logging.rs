//! Tracing subscriber setup.
//!
//! Library code only emits `tracing` events; applications call [`init`] once
//! to install a human-readable stderr layer and, optionally, a JSON layer
//! written to a daily rolling file.

use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::config::LoggingConfig;
use crate::error::{ColflowError, Result};

/// Platform data directory for JSON logs (`~/.local/share/colflow/logs` on Linux).
pub fn default_log_dir() -> PathBuf {
    directories::ProjectDirs::from("dev", "colflow", "colflow")
        .map(|d| d.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("logs"))
}

/// Resolve the JSON log directory, if file logging is enabled.
pub fn log_dir(config: &LoggingConfig) -> Option<PathBuf> {
    if !config.json_file {
        return None;
    }
    Some(config.log_dir.clone().unwrap_or_else(default_log_dir))
}

/// Install the global subscriber. Keep the returned guard alive for the life
/// of the process so buffered file output is flushed.
///
/// # Errors
///
/// Fails if the level directive does not parse, the log directory cannot be
/// created, or a global subscriber is already installed.
pub fn init(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_new(&config.level)
        .map_err(|e| ColflowError::config(format!("logging.level '{}': {e}", config.level)))?;

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(filter);

    let (json_layer, guard) = match log_dir(config) {
        Some(dir) => {
            std::fs::create_dir_all(&dir)?;
            let file_appender = tracing_appender::rolling::daily(&dir, "colflow.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_writer(non_blocking)
                .with_filter(EnvFilter::new("debug"));
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .try_init()
        .map_err(|e| ColflowError::config(format!("logging already initialised: {e}")))?;

    tracing::debug!(level = %config.level, json_file = config.json_file, "logging initialised");
    Ok(guard)
}
