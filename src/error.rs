/*!
 * Error types for Precipice
 */

use thiserror::Error;

pub type Result<T> = std::result::Result<T, PrecipiceError>;

/// Errors raised by the admission-control core.
///
/// Admission rejections are not errors: they are returned as values by
/// [`GuardRail::acquire_permits`](crate::GuardRail::acquire_permits) and
/// friends. Failures of the admitted action travel through the promise's
/// error channel. What remains here are programming and setup errors.
#[derive(Debug, Error)]
pub enum PrecipiceError {
    /// A configuration value is out of range
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A timeout was scheduled after the service stopped accepting work
    #[error("Timeout service has been stopped, timeout not scheduled")]
    TimeoutServiceStopped,

    /// The configuration file could not be parsed
    #[error("Failed to parse configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// The configuration could not be rendered as TOML
    #[error("Failed to serialize configuration: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),

    /// I/O error while reading configuration or writing logs
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Logging could not be initialized
    #[error("Logging error: {0}")]
    Logging(String),
}

impl PrecipiceError {
    /// Check if this error indicates a caller bug rather than an environmental failure.
    ///
    /// Programming errors are never retried internally.
    pub fn is_programming_error(&self) -> bool {
        matches!(
            self,
            PrecipiceError::InvalidConfig(_) | PrecipiceError::TimeoutServiceStopped
        )
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        PrecipiceError::InvalidConfig(msg.into())
    }
}
