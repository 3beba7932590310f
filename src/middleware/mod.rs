//! Tower layers that put rate limiting and circuit breaking in front of an
//! HTTP service.
//!
//! Both layers short-circuit on denial: the wrapped service is never called
//! and the configured rejection handler produces the response instead.

mod circuit_breaker;
mod key;
mod rate_limit;
mod rejection;

pub use circuit_breaker::{CircuitBreakerLayer, CircuitBreakerService};
pub use key::{Global, HeaderKey, KeyExtractor, RemoteAddr};
pub use rate_limit::{RateLimitLayer, RateLimitService};
pub use rejection::{
    CircuitOpen, DefaultCircuitOpenRejection, DefaultRateLimitRejection, RateLimited,
    RejectionHandler, CIRCUIT_OPEN, RATE_LIMIT_EXCEEDED,
};
