//! Token bucket rate limiting.

use std::time::{Duration, Instant};

use tracing::{debug, trace};

use super::registry::Registry;
use super::RateLimiter;
use crate::error::{GatewayError, Result};

/// Rate and capacity of a token bucket, fixed for the limiter's lifetime.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenBucketConfig {
    rate: f64,
    capacity: u32,
}

impl TokenBucketConfig {
    /// `rate` is in tokens per second and may be zero (no refill).
    /// A `capacity` of zero is accepted and rejects every request.
    pub fn new(rate: f64, capacity: u32) -> Result<Self> {
        if !rate.is_finite() || rate < 0.0 {
            return Err(GatewayError::invalid(
                "rate",
                format!("must be a finite, non-negative number of tokens per second, got {rate}"),
            ));
        }
        Ok(Self { rate, capacity })
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }
}

/// A single bucket. Refill is computed lazily from the time elapsed since
/// the last observation, so idle buckets cost nothing.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    tokens: f64,
    capacity: u32,
    rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Create a full bucket.
    pub fn new(config: TokenBucketConfig, now: Instant) -> Self {
        Self {
            tokens: f64::from(config.capacity),
            capacity: config.capacity,
            rate: config.rate,
            last_refill: now,
        }
    }

    /// Balance the bucket would hold at `now`, clamped to capacity.
    fn projected(&self, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        (self.tokens + elapsed * self.rate).min(f64::from(self.capacity))
    }

    fn refill(&mut self, now: Instant) {
        self.tokens = self.projected(now);
        // Callers may race with an instant captured before the lock.
        if now > self.last_refill {
            self.last_refill = now;
        }
    }

    /// Refill, then consume one token if available.
    pub fn try_acquire(&mut self, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Restore the bucket to full.
    pub fn reset(&mut self, now: Instant) {
        self.tokens = f64::from(self.capacity);
        self.last_refill = now;
    }

    /// Current fractional balance, as of the last observation.
    pub fn tokens(&self) -> f64 {
        self.tokens
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Whole tokens available at `now`, without consuming any.
    pub fn available(&self, now: Instant) -> u64 {
        self.projected(now).floor() as u64
    }

    /// Time until one token is available, or `None` if that never happens.
    pub fn time_until_available(&self, now: Instant) -> Option<Duration> {
        let tokens = self.projected(now);
        if tokens >= 1.0 {
            return Some(Duration::ZERO);
        }
        if self.capacity == 0 || self.rate <= 0.0 {
            return None;
        }
        Duration::try_from_secs_f64((1.0 - tokens) / self.rate).ok()
    }
}

/// Keyed token-bucket limiter. Each key gets its own bucket, created full on
/// first use.
pub struct TokenBucketLimiter {
    config: TokenBucketConfig,
    buckets: Registry<TokenBucket>,
}

impl TokenBucketLimiter {
    pub fn new(config: TokenBucketConfig) -> Self {
        debug!(
            rate = config.rate,
            capacity = config.capacity,
            "Token bucket limiter configured"
        );
        Self {
            config,
            buckets: Registry::new(),
        }
    }

    /// Shorthand for `TokenBucketLimiter::new(TokenBucketConfig::new(rate, capacity)?)`.
    pub fn with_rate(rate: f64, capacity: u32) -> Result<Self> {
        Ok(Self::new(TokenBucketConfig::new(rate, capacity)?))
    }

    pub fn config(&self) -> TokenBucketConfig {
        self.config
    }

    /// Admission check for `key` evaluated at `now`.
    pub fn allow_at(&self, key: &str, now: Instant) -> bool {
        let config = self.config;
        let bucket = self
            .buckets
            .get_or_create(key, || TokenBucket::new(config, now));
        let allowed = bucket.lock().try_acquire(now);

        trace!(key = %key, allowed, "Token bucket admission");
        allowed
    }

    pub fn reset_at(&self, key: &str, now: Instant) {
        if let Some(bucket) = self.buckets.get(key) {
            bucket.lock().reset(now);
        }
    }

    pub fn remaining_at(&self, key: &str, now: Instant) -> u64 {
        match self.buckets.get(key) {
            Some(bucket) => bucket.lock().available(now),
            None => u64::from(self.config.capacity),
        }
    }

    pub fn retry_after_at(&self, key: &str, now: Instant) -> Option<Duration> {
        match self.buckets.get(key) {
            Some(bucket) => bucket.lock().time_until_available(now),
            None => TokenBucket::new(self.config, now).time_until_available(now),
        }
    }

    /// Number of keys with a bucket.
    pub fn tracked_keys(&self) -> usize {
        self.buckets.len()
    }

    /// Drop the bucket for `key`; the next check starts from a full bucket.
    pub fn forget(&self, key: &str) -> bool {
        self.buckets.remove(key)
    }

    /// Drop every bucket.
    pub fn clear(&self) {
        self.buckets.clear();
    }
}

impl RateLimiter for TokenBucketLimiter {
    fn allow(&self, key: &str) -> bool {
        self.allow_at(key, Instant::now())
    }

    fn reset(&self, key: &str) {
        self.reset_at(key, Instant::now());
    }

    /// The configured refill rate, truncated to whole tokens per second.
    fn limit(&self, _key: &str) -> u64 {
        self.config.rate as u64
    }

    fn remaining(&self, key: &str) -> u64 {
        self.remaining_at(key, Instant::now())
    }

    fn retry_after(&self, key: &str) -> Option<Duration> {
        self.retry_after_at(key, Instant::now())
    }
}
