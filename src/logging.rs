/*!
 * Logging and tracing initialization
 *
 * The library only emits `tracing` events; installing a subscriber is the
 * embedder's call. `init_logging` is a convenience for embedders that want
 * the stock setup.
 */

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use crate::error::{PrecipiceError, Result};

/// Log level for diagnostic output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    /// Includes per-permit acquire/release events
    Trace,
}

impl LogLevel {
    /// Convert to tracing::Level
    pub fn to_tracing_level(&self) -> Level {
        match self {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }
}

/// Logging section of the configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: LogLevel,

    /// Emit JSON lines instead of compact text
    pub json: bool,

    /// Log file path (None = stdout)
    pub log_file: Option<PathBuf>,
}

/// Default filter directive for a level, overridden by `RUST_LOG`
fn env_filter(level: LogLevel) -> Result<EnvFilter> {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(format!("precipice={}", level.to_tracing_level())))
        .map_err(|e| PrecipiceError::Logging(format!("Failed to create log filter: {}", e)))
}

/// Install a global subscriber based on configuration.
///
/// Fails with [`PrecipiceError::Logging`] if a global subscriber is already set.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let filter = env_filter(config.level)?;

    match config.log_file {
        Some(ref path) => init_file_logging(path, filter),
        None if config.json => init_json_logging(filter),
        None => init_stdout_logging(filter),
    }
}

fn init_stdout_logging(filter: EnvFilter) -> Result<()> {
    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_names(true)
        .with_span_events(FmtSpan::NONE)
        .compact();

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| PrecipiceError::Logging(e.to_string()))
}

fn init_json_logging(filter: EnvFilter) -> Result<()> {
    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_names(true)
        .json();

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| PrecipiceError::Logging(e.to_string()))
}

fn init_file_logging(log_path: &Path, filter: EnvFilter) -> Result<()> {
    let file = File::create(log_path)?;

    let fmt_layer = fmt::layer()
        .with_writer(file)
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true)
        .with_ansi(false) // No ANSI colors in file
        .json();

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| PrecipiceError::Logging(e.to_string()))
}

/// Initialize logging with custom format for testing
#[cfg(test)]
pub(crate) fn init_test_logging() {
    use std::sync::Once;
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("precipice=trace"));

        let fmt_layer = fmt::layer().with_test_writer().with_target(false).compact();

        tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer)
            .try_init()
            .ok(); // Ignore error if already initialized
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_conversion() {
        assert_eq!(LogLevel::Error.to_tracing_level(), Level::ERROR);
        assert_eq!(LogLevel::Warn.to_tracing_level(), Level::WARN);
        assert_eq!(LogLevel::Info.to_tracing_level(), Level::INFO);
        assert_eq!(LogLevel::Debug.to_tracing_level(), Level::DEBUG);
        assert_eq!(LogLevel::Trace.to_tracing_level(), Level::TRACE);
    }

    #[test]
    fn test_config_deserializes() {
        let config: LoggingConfig = toml::from_str("level = \"debug\"\njson = true").unwrap();
        assert_eq!(config.level, LogLevel::Debug);
        assert!(config.json);
        assert_eq!(config.log_file, None);
    }

    #[test]
    fn test_second_init_is_an_error() {
        init_test_logging();
        let err = init_logging(&LoggingConfig::default()).unwrap_err();
        assert!(matches!(err, PrecipiceError::Logging(_)));
    }
}
