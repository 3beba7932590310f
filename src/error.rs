//! Error types for trafficgate.

use thiserror::Error;

/// Main error type for trafficgate operations.
///
/// Admission denials are not errors; limiters and breakers report them as
/// plain `false`. This type covers misconfiguration and the I/O of the
/// embedding binary.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Invalid limiter, breaker or gateway configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Layered configuration could not be loaded
    #[error("Configuration source error: {0}")]
    ConfigSource(#[from] config::ConfigError),

    /// HTTP server errors
    #[error("Server error: {0}")]
    Serve(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    pub(crate) fn invalid(field: &str, reason: impl std::fmt::Display) -> Self {
        GatewayError::Config(format!("{field}: {reason}"))
    }
}

/// Result type alias for trafficgate operations.
pub type Result<T> = std::result::Result<T, GatewayError>;
