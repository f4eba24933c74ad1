/*!
 * Configuration types for Precipice
 *
 * Every section deserializes with defaults for missing keys, so a partial
 * TOML file only needs to name what it changes.
 */

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::error::{PrecipiceError, Result};
use crate::logging::LoggingConfig;
use crate::metrics::RollingConfig;
use crate::rate_limiter::RateLimiterConfig;
use crate::semaphore::SemaphoreConfig;
use crate::timeout::TimeoutServiceConfig;

pub use crate::logging::LogLevel;
pub use crate::metrics::latency::LatencyConfig;

/// Top-level configuration for a guard rail and its components
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PrecipiceConfig {
    /// Shape of the rolling result and rejection metrics
    pub rolling: RollingConfig,

    pub latency: LatencyConfig,

    pub semaphore: SemaphoreConfig,

    pub rate_limiter: RateLimiterConfig,

    pub circuit_breaker: CircuitBreakerConfig,

    pub timeout: TimeoutServiceConfig,

    pub logging: LoggingConfig,
}

impl PrecipiceConfig {
    /// Parse and validate configuration from a TOML string
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: PrecipiceConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// Render as pretty TOML
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Save configuration to a TOML file
    pub fn to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let contents = self.to_toml()?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Check every section, reporting the first invalid value
    pub fn validate(&self) -> Result<()> {
        self.rolling.validate()?;
        self.latency.validate()?;
        self.semaphore.validate()?;
        self.rate_limiter.validate()?;
        self.circuit_breaker.validate()?;
        self.timeout.validate()?;

        let span = self.rolling.span()?;
        if self.circuit_breaker.trailing_period() > span {
            return Err(PrecipiceError::invalid(format!(
                "circuit breaker trailing period ({}ms) exceeds the rolling window span ({}ms)",
                self.circuit_breaker.trailing_period_millis,
                span.as_millis()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config_is_valid() {
        let config = PrecipiceConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.semaphore.max_concurrency, 100);
        assert_eq!(config.logging.level, LogLevel::Info);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let toml_str = r#"
[semaphore]
max_concurrency = 8

[circuit_breaker]
failure_percentage_threshold = 25
backoff_period_millis = 250

[logging]
level = "debug"
"#;
        let config = PrecipiceConfig::from_toml_str(toml_str).unwrap();
        assert_eq!(config.semaphore.max_concurrency, 8);
        assert_eq!(config.circuit_breaker.failure_percentage_threshold, 25);
        assert_eq!(config.circuit_breaker.backoff_period_millis, 250);
        assert_eq!(config.circuit_breaker.sample_size_threshold, 10);
        assert_eq!(config.rate_limiter, RateLimiterConfig::default());
        assert_eq!(config.logging.level, LogLevel::Debug);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = PrecipiceConfig::from_toml_str("[semaphore]\nmax_concurrency = 0").unwrap_err();
        assert!(matches!(err, PrecipiceError::InvalidConfig(_)));

        let err = PrecipiceConfig::from_toml_str(
            "[circuit_breaker]\nfailure_percentage_threshold = 101",
        )
        .unwrap_err();
        assert!(matches!(err, PrecipiceError::InvalidConfig(_)));

        let err = PrecipiceConfig::from_toml_str("[rolling]\nbucket_count = 0").unwrap_err();
        assert!(err.is_programming_error());
    }

    #[test]
    fn test_trailing_period_must_fit_window() {
        let toml_str = r#"
[rolling]
bucket_count = 2
bucket_width_millis = 100

[circuit_breaker]
trailing_period_millis = 1000
"#;
        let err = PrecipiceConfig::from_toml_str(toml_str).unwrap_err();
        assert!(matches!(err, PrecipiceError::InvalidConfig(_)));
    }

    #[test]
    fn test_oversized_rolling_window_is_invalid() {
        let toml_str = r#"
[rolling]
bucket_count = 4000
bucket_width_millis = 9223372036854775807
"#;
        let err = PrecipiceConfig::from_toml_str(toml_str).unwrap_err();
        assert!(matches!(err, PrecipiceError::InvalidConfig(_)));
    }

    #[test]
    fn test_malformed_toml_is_parse_error() {
        let err = PrecipiceConfig::from_toml_str("[semaphore\nmax_concurrency = 1").unwrap_err();
        assert!(matches!(err, PrecipiceError::ConfigParse(_)));
        assert!(!err.is_programming_error());
    }

    #[test]
    fn test_file_round_trip() {
        let mut config = PrecipiceConfig::default();
        config.rate_limiter.allowed_per_period = 42;
        config.timeout.name = "edge-timeouts".to_string();

        let file = NamedTempFile::new().unwrap();
        config.to_file(file.path()).unwrap();
        let loaded = PrecipiceConfig::from_file(file.path()).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_file_errors() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[latency]\nhighest_trackable_nanos = 1").unwrap();
        let err = PrecipiceConfig::from_file(file.path()).unwrap_err();
        assert!(matches!(err, PrecipiceError::InvalidConfig(_)));

        let path = file.path().to_path_buf();
        drop(file);
        let err = PrecipiceConfig::from_file(&path).unwrap_err();
        assert!(matches!(err, PrecipiceError::Io(_)));
    }
}
