use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use http::{Request, Response};
use tower::Service;
use tracing::debug;

use super::key::{KeyExtractor, RemoteAddr, UNKNOWN};
use super::rejection::{DefaultRateLimitRejection, RateLimited, RejectionHandler};
use crate::http::{Body, BoxError, HttpService};
use crate::ratelimit::RateLimiter;

/// Tower layer that admits requests through a keyed [`RateLimiter`].
///
/// Each request is keyed by a [`KeyExtractor`] (the caller's IP by default).
/// Denied requests are answered by the rejection handler and never reach the
/// wrapped service. The layer is cheap to clone; clones share the limiter.
///
/// ```rust
/// use trafficgate::middleware::{Global, RateLimitLayer};
/// use trafficgate::ratelimit::TokenBucketLimiter;
///
/// # fn main() -> trafficgate::Result<()> {
/// let layer = RateLimitLayer::new(TokenBucketLimiter::with_rate(100.0, 200)?)
///     .key_extractor(Global);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RateLimitLayer {
    limiter: Arc<dyn RateLimiter>,
    key: Arc<dyn KeyExtractor>,
    reject: Arc<dyn RejectionHandler<RateLimited>>,
}

impl RateLimitLayer {
    pub fn new(limiter: impl RateLimiter + 'static) -> Self {
        Self::from_shared(Arc::new(limiter))
    }

    /// Use a limiter that is also held elsewhere, e.g. for resets.
    pub fn from_shared(limiter: Arc<dyn RateLimiter>) -> Self {
        Self {
            limiter,
            key: Arc::new(RemoteAddr),
            reject: Arc::new(DefaultRateLimitRejection),
        }
    }

    pub fn key_extractor(mut self, key: impl KeyExtractor) -> Self {
        self.key = Arc::new(key);
        self
    }

    /// Replace the default `429` response.
    pub fn rejection_handler(mut self, handler: impl RejectionHandler<RateLimited>) -> Self {
        self.reject = Arc::new(handler);
        self
    }

    pub fn limiter(&self) -> &Arc<dyn RateLimiter> {
        &self.limiter
    }
}

impl tower::Layer<HttpService> for RateLimitLayer {
    type Service = RateLimitService;

    fn layer(&self, inner: HttpService) -> Self::Service {
        RateLimitService {
            inner,
            limiter: self.limiter.clone(),
            key: self.key.clone(),
            reject: self.reject.clone(),
        }
    }
}

pub struct RateLimitService {
    inner: HttpService,
    limiter: Arc<dyn RateLimiter>,
    key: Arc<dyn KeyExtractor>,
    reject: Arc<dyn RejectionHandler<RateLimited>>,
}

impl Service<Request<Body>> for RateLimitService {
    type Response = Response<Body>;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Response<Body>, BoxError>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let mut key = self.key.extract(&req);
        if key.is_empty() {
            key = UNKNOWN.to_string();
        }
        if self.limiter.allow(&key) {
            return self.inner.call(req);
        }

        let cause = RateLimited {
            limit: self.limiter.limit(&key),
            remaining: 0,
            retry_after: self.limiter.retry_after(&key),
            key,
        };
        debug!(key = %cause.key, path = %req.uri().path(), "Rate limit exceeded");
        let resp = self.reject.reject(&req, &cause);
        Box::pin(async move { Ok(resp) })
    }
}
