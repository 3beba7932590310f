//! Configuration management for trafficgate.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::breaker::CircuitBreakerConfig;
use crate::error::{GatewayError, Result};
use crate::middleware::HeaderKey;
use crate::ratelimit::TokenBucketConfig;

/// Prefix of environment variables that override file settings, e.g.
/// `TRAFFICGATE__RATE_LIMIT__CAPACITY=20`.
pub const ENV_PREFIX: &str = "TRAFFICGATE";

/// Main configuration for the gateway.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Rate limiting; absent means every request is admitted
    #[serde(default)]
    pub rate_limit: Option<RateLimitSettings>,

    /// Circuit breaking; absent means the upstream is always called
    #[serde(default)]
    pub circuit_breaker: Option<CircuitBreakerSettings>,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    #[default]
    TokenBucket,
    SlidingWindow,
}

/// Where the rate-limit key of a request comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeySource {
    /// Client IP address
    #[default]
    RemoteAddr,
    /// Value of the header named by `header`
    Header,
    /// One bucket for all callers
    Global,
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSettings {
    #[serde(default)]
    pub algorithm: Algorithm,

    /// Token bucket refill rate in tokens per second
    #[serde(default = "default_rate")]
    pub rate: f64,

    /// Token bucket burst capacity
    #[serde(default = "default_capacity")]
    pub capacity: u32,

    /// Sliding window admissions per window
    #[serde(default = "default_limit")]
    pub limit: u32,

    /// Sliding window length in milliseconds
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,

    #[serde(default)]
    pub key: KeySource,

    /// Header name, required when `key` is `header`
    #[serde(default)]
    pub header: Option<String>,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            algorithm: Algorithm::default(),
            rate: default_rate(),
            capacity: default_capacity(),
            limit: default_limit(),
            window_ms: default_window_ms(),
            key: KeySource::default(),
            header: None,
        }
    }
}

fn default_rate() -> f64 {
    10.0
}

fn default_capacity() -> u32 {
    10
}

fn default_limit() -> u32 {
    100
}

fn default_window_ms() -> u64 {
    1000
}

impl RateLimitSettings {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn token_bucket(&self) -> Result<TokenBucketConfig> {
        TokenBucketConfig::new(self.rate, self.capacity)
    }

    /// The configured header extractor, if `key` is `header`.
    pub fn header_key(&self) -> Result<Option<HeaderKey>> {
        match (self.key, self.header.as_deref()) {
            (KeySource::Header, Some(name)) => HeaderKey::new(name).map(Some),
            (KeySource::Header, None) => Err(GatewayError::invalid(
                "rate_limit.header",
                "required when rate_limit.key is 'header'",
            )),
            _ => Ok(None),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.algorithm == Algorithm::TokenBucket {
            self.token_bucket()?;
        }
        self.header_key()?;
        Ok(())
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerSettings {
    #[serde(default = "default_breaker_name")]
    pub name: String,

    /// Failures that open the circuit
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,

    /// Time the circuit stays open before a trial call is let through
    #[serde(default = "default_reset_timeout_ms")]
    pub reset_timeout_ms: u64,

    #[serde(default = "default_half_open_max_calls")]
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            name: default_breaker_name(),
            max_failures: default_max_failures(),
            reset_timeout_ms: default_reset_timeout_ms(),
            half_open_max_calls: default_half_open_max_calls(),
        }
    }
}

fn default_breaker_name() -> String {
    "upstream".to_string()
}

fn default_max_failures() -> u32 {
    5
}

fn default_reset_timeout_ms() -> u64 {
    30_000
}

fn default_half_open_max_calls() -> u32 {
    1
}

impl CircuitBreakerSettings {
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }

    pub fn breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig::new(self.name.clone())
            .with_max_failures(self.max_failures)
            .with_reset_timeout(self.reset_timeout())
            .with_half_open_max_calls(self.half_open_max_calls)
    }

    pub fn validate(&self) -> Result<()> {
        self.breaker_config().validate()
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl GatewayConfig {
    /// Parse and validate a YAML document.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: GatewayConfig =
            serde_yaml::from_str(yaml).map_err(|e| GatewayError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Layer an optional config file and `TRAFFICGATE__*` environment
    /// variables over the defaults, then validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: GatewayConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(rate_limit) = &self.rate_limit {
            rate_limit.validate()?;
        }
        if let Some(breaker) = &self.circuit_breaker {
            breaker.validate()?;
        }
        Ok(())
    }
}
