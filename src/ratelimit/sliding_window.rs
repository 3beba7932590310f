//! Sliding window rate limiting.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use super::registry::Registry;
use super::RateLimiter;

/// Admission limit per trailing window.
///
/// A `limit` of zero rejects every request. A zero `window` keeps only the
/// admissions made at the exact same instant, so up to `limit` requests are
/// admitted per distinct instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlidingWindowConfig {
    limit: u32,
    window: Duration,
}

impl SlidingWindowConfig {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self { limit, window }
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn window(&self) -> Duration {
        self.window
    }
}

/// Admission timestamps of one key, oldest first.
#[derive(Debug, Clone)]
pub struct SlidingWindow {
    events: VecDeque<Instant>,
    limit: u32,
    window: Duration,
}

impl SlidingWindow {
    pub fn new(config: SlidingWindowConfig) -> Self {
        Self {
            events: VecDeque::new(),
            limit: config.limit,
            window: config.window,
        }
    }

    /// Entries strictly before this instant have left the window.
    fn cutoff(&self, now: Instant) -> Option<Instant> {
        now.checked_sub(self.window)
    }

    /// Index of the first entry still inside the window at `now`.
    fn first_live(&self, now: Instant) -> usize {
        match self.cutoff(now) {
            Some(cutoff) => self.events.partition_point(|&t| t < cutoff),
            None => 0,
        }
    }

    fn prune(&mut self, now: Instant) {
        let expired = self.first_live(now);
        self.events.drain(..expired);
    }

    /// Prune expired entries, then record an admission if under the limit.
    pub fn try_acquire(&mut self, now: Instant) -> bool {
        self.prune(now);
        if self.events.len() >= self.limit as usize {
            return false;
        }

        // Keep the deque ordered even if `now` was captured before the lock.
        let stamp = match self.events.back() {
            Some(&last) if last > now => last,
            _ => now,
        };
        self.events.push_back(stamp);
        true
    }

    pub fn reset(&mut self) {
        self.events.clear();
    }

    /// Admissions inside the window at `now`, without pruning.
    pub fn count(&self, now: Instant) -> usize {
        self.events.len() - self.first_live(now)
    }

    /// Admissions still stored, as of the last prune.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Time until another admission would succeed, or `None` if never or if
    /// the blocking entry's expiry cannot be represented as an `Instant`.
    pub fn time_until_available(&self, now: Instant) -> Option<Duration> {
        let limit = self.limit as usize;
        if limit == 0 {
            return None;
        }

        let start = self.first_live(now);
        let live = self.events.len() - start;
        if live < limit {
            return Some(Duration::ZERO);
        }

        // The entry whose expiry brings the count back under the limit.
        let blocking = self.events[start + live - limit];
        let expires = blocking.checked_add(self.window)?;
        // An entry exactly on the cutoff is still inside the window.
        Some(
            expires
                .saturating_duration_since(now)
                .saturating_add(Duration::from_nanos(1)),
        )
    }
}

/// Keyed sliding-window limiter.
pub struct SlidingWindowLimiter {
    config: SlidingWindowConfig,
    windows: Registry<SlidingWindow>,
}

impl SlidingWindowLimiter {
    pub fn new(config: SlidingWindowConfig) -> Self {
        debug!(
            limit = config.limit,
            window_ms = config.window.as_millis() as u64,
            "Sliding window limiter configured"
        );
        Self {
            config,
            windows: Registry::new(),
        }
    }

    /// Shorthand for `SlidingWindowLimiter::new(SlidingWindowConfig::new(limit, window))`.
    pub fn with_limit(limit: u32, window: Duration) -> Self {
        Self::new(SlidingWindowConfig::new(limit, window))
    }

    pub fn config(&self) -> SlidingWindowConfig {
        self.config
    }

    /// Admission check for `key` evaluated at `now`.
    pub fn allow_at(&self, key: &str, now: Instant) -> bool {
        let config = self.config;
        let window = self
            .windows
            .get_or_create(key, || SlidingWindow::new(config));
        let allowed = window.lock().try_acquire(now);

        trace!(key = %key, allowed, "Sliding window admission");
        allowed
    }

    pub fn reset(&self, key: &str) {
        if let Some(window) = self.windows.get(key) {
            window.lock().reset();
        }
    }

    pub fn remaining_at(&self, key: &str, now: Instant) -> u64 {
        let used = self
            .windows
            .get(key)
            .map(|window| window.lock().count(now))
            .unwrap_or(0);
        u64::from(self.config.limit).saturating_sub(used as u64)
    }

    pub fn retry_after_at(&self, key: &str, now: Instant) -> Option<Duration> {
        match self.windows.get(key) {
            Some(window) => window.lock().time_until_available(now),
            None => SlidingWindow::new(self.config).time_until_available(now),
        }
    }

    /// Number of keys with a window.
    pub fn tracked_keys(&self) -> usize {
        self.windows.len()
    }

    pub fn forget(&self, key: &str) -> bool {
        self.windows.remove(key)
    }

    pub fn clear(&self) {
        self.windows.clear();
    }
}

impl RateLimiter for SlidingWindowLimiter {
    fn allow(&self, key: &str) -> bool {
        self.allow_at(key, Instant::now())
    }

    fn reset(&self, key: &str) {
        SlidingWindowLimiter::reset(self, key);
    }

    fn limit(&self, _key: &str) -> u64 {
        u64::from(self.config.limit)
    }

    fn remaining(&self, key: &str) -> u64 {
        self.remaining_at(key, Instant::now())
    }

    fn retry_after(&self, key: &str) -> Option<Duration> {
        self.retry_after_at(key, Instant::now())
    }
}
