use std::time::Duration;

use http::header::{HeaderName, HeaderValue, RETRY_AFTER};
use http::{Request, Response, StatusCode};

use crate::breaker::CircuitState;
use crate::http::{json_error, Body};

pub const RATE_LIMIT_EXCEEDED: &str = "rate limit exceeded";
pub const CIRCUIT_OPEN: &str = "circuit breaker is open";

const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Why the rate-limit layer turned a request away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimited {
    pub key: String,
    pub limit: u64,
    pub remaining: u64,
    /// `None` when the key can never be admitted or the wait is unbounded.
    pub retry_after: Option<Duration>,
}

/// Why the circuit-breaker layer turned a request away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitOpen {
    pub name: String,
    pub state: CircuitState,
}

/// Builds the response sent instead of calling the wrapped service.
///
/// Implemented for any `Fn(&Request<Body>, &C) -> Response<Body>`.
pub trait RejectionHandler<C>: Send + Sync + 'static {
    fn reject(&self, req: &Request<Body>, cause: &C) -> Response<Body>;
}

impl<C, F> RejectionHandler<C> for F
where
    F: Fn(&Request<Body>, &C) -> Response<Body> + Send + Sync + 'static,
{
    fn reject(&self, req: &Request<Body>, cause: &C) -> Response<Body> {
        self(req, cause)
    }
}

/// `429 Too Many Requests` with `{"error":"rate limit exceeded"}` and the
/// `X-RateLimit-*` / `Retry-After` headers.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultRateLimitRejection;

impl RejectionHandler<RateLimited> for DefaultRateLimitRejection {
    fn reject(&self, _req: &Request<Body>, cause: &RateLimited) -> Response<Body> {
        let mut response = json_error(StatusCode::TOO_MANY_REQUESTS, RATE_LIMIT_EXCEEDED);
        let headers = response.headers_mut();
        headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(cause.limit));
        headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(cause.remaining));

        if let Some(wait) = cause.retry_after {
            headers.insert(RETRY_AFTER, HeaderValue::from(retry_after_secs(wait)));
            if let Some(reset) = reset_timestamp(wait) {
                if let Ok(value) = HeaderValue::from_str(&reset) {
                    headers.insert(X_RATELIMIT_RESET, value);
                }
            }
        }
        response
    }
}

/// `503 Service Unavailable` with `{"error":"circuit breaker is open"}`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultCircuitOpenRejection;

impl RejectionHandler<CircuitOpen> for DefaultCircuitOpenRejection {
    fn reject(&self, _req: &Request<Body>, _cause: &CircuitOpen) -> Response<Body> {
        json_error(StatusCode::SERVICE_UNAVAILABLE, CIRCUIT_OPEN)
    }
}

/// Whole seconds, rounded up so clients never retry early.
fn retry_after_secs(wait: Duration) -> u64 {
    let secs = wait.as_secs();
    if wait.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs
    }
}

fn reset_timestamp(wait: Duration) -> Option<String> {
    let wait = chrono::Duration::from_std(wait).ok()?;
    let reset = chrono::Utc::now().checked_add_signed(wait)?;
    Some(reset.to_rfc3339_opts(chrono::SecondsFormat::Secs, true))
}
