//! Rate limiting algorithms and per-key state management.

mod registry;
mod sliding_window;
mod token_bucket;

use std::time::Duration;

pub use registry::{Handle, Registry};
pub use sliding_window::{SlidingWindow, SlidingWindowConfig, SlidingWindowLimiter};
pub use token_bucket::{TokenBucket, TokenBucketConfig, TokenBucketLimiter};

/// Trait for keyed rate limiter implementations.
///
/// This trait abstracts over the token-bucket and sliding-window limiters so
/// the middleware can work with either. Denial is signalled by `false`, never
/// by an error.
pub trait RateLimiter: Send + Sync {
    /// Admission check for `key`. Consumes capacity when it returns `true`.
    fn allow(&self, key: &str) -> bool;

    /// Restore `key` to its fully available state.
    fn reset(&self, key: &str);

    /// The configured limit reported to clients.
    fn limit(&self, key: &str) -> u64;

    /// Admissions currently available to `key`, without consuming any.
    fn remaining(&self, key: &str) -> u64;

    /// How long until `key` could be admitted again; `None` if never.
    fn retry_after(&self, key: &str) -> Option<Duration>;
}
