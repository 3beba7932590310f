//! Trafficgate - In-process traffic control for HTTP gateways
//!
//! This crate provides keyed rate limiting (token bucket and sliding window)
//! and circuit breaking, exposed as tower layers that sit in front of any
//! HTTP service. All state is held in memory and every admission decision is
//! made synchronously; denied requests never reach the wrapped service.

pub mod breaker;
pub mod config;
pub mod error;
pub mod gateway;
pub mod http;
pub mod middleware;
pub mod ratelimit;

pub use breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use config::GatewayConfig;
pub use error::{GatewayError, Result};
pub use gateway::TrafficControl;
pub use ratelimit::{RateLimiter, SlidingWindowLimiter, TokenBucketLimiter};
