//! Composition of the traffic-control layers.

use std::sync::Arc;

use tower::Layer;
use tracing::info;

use crate::breaker::CircuitBreaker;
use crate::config::{Algorithm, GatewayConfig, KeySource, RateLimitSettings};
use crate::error::Result;
use crate::http::HttpService;
use crate::middleware::{CircuitBreakerLayer, Global, RateLimitLayer};
use crate::ratelimit::{RateLimiter, SlidingWindowLimiter, TokenBucketLimiter};

/// The limiter and breaker guarding one upstream.
///
/// Requests pass the rate limiter first, then the circuit breaker, so
/// rejected callers never count against the upstream's health. Either stage
/// may be absent.
#[derive(Clone, Default)]
pub struct TrafficControl {
    rate_limit: Option<RateLimitLayer>,
    circuit_breaker: Option<CircuitBreakerLayer>,
}

impl TrafficControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rate_limit(mut self, layer: RateLimitLayer) -> Self {
        self.rate_limit = Some(layer);
        self
    }

    pub fn with_circuit_breaker(mut self, layer: CircuitBreakerLayer) -> Self {
        self.circuit_breaker = Some(layer);
        self
    }

    /// Build limiter and breaker instances from validated configuration.
    pub fn from_config(config: &GatewayConfig) -> Result<Self> {
        let mut control = Self::new();

        if let Some(settings) = &config.rate_limit {
            control = control.with_rate_limit(rate_limit_layer(settings)?);
        }

        if let Some(settings) = &config.circuit_breaker {
            let breaker = CircuitBreaker::new(settings.breaker_config())?;
            info!(
                name = %settings.name,
                max_failures = settings.max_failures,
                reset_timeout_ms = settings.reset_timeout_ms,
                "Circuit breaker enabled"
            );
            control = control.with_circuit_breaker(CircuitBreakerLayer::new(breaker));
        }

        Ok(control)
    }

    pub fn rate_limit(&self) -> Option<&RateLimitLayer> {
        self.rate_limit.as_ref()
    }

    pub fn circuit_breaker(&self) -> Option<&Arc<CircuitBreaker>> {
        self.circuit_breaker.as_ref().map(CircuitBreakerLayer::breaker)
    }

    /// Wrap `inner` in the configured layers.
    pub fn wrap(&self, inner: HttpService) -> HttpService {
        let mut svc = inner;
        if let Some(layer) = &self.circuit_breaker {
            svc = HttpService::new(layer.layer(svc));
        }
        if let Some(layer) = &self.rate_limit {
            svc = HttpService::new(layer.layer(svc));
        }
        svc
    }
}

impl Layer<HttpService> for TrafficControl {
    type Service = HttpService;

    fn layer(&self, inner: HttpService) -> Self::Service {
        self.wrap(inner)
    }
}

fn rate_limit_layer(settings: &RateLimitSettings) -> Result<RateLimitLayer> {
    let limiter: Arc<dyn RateLimiter> = match settings.algorithm {
        Algorithm::TokenBucket => {
            let config = settings.token_bucket()?;
            info!(
                rate = config.rate(),
                capacity = config.capacity(),
                "Token bucket rate limiting enabled"
            );
            Arc::new(TokenBucketLimiter::new(config))
        }
        Algorithm::SlidingWindow => {
            info!(
                limit = settings.limit,
                window_ms = settings.window_ms,
                "Sliding window rate limiting enabled"
            );
            Arc::new(SlidingWindowLimiter::with_limit(settings.limit, settings.window()))
        }
    };

    let layer = RateLimitLayer::from_shared(limiter);
    let layer = match (settings.key, settings.header_key()?) {
        (_, Some(header)) => layer.key_extractor(header),
        (KeySource::Global, None) => layer.key_extractor(Global),
        _ => layer,
    };
    Ok(layer)
}
