use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use http::{Request, Response};
use tower::Service;
use tracing::debug;

use super::rejection::{CircuitOpen, DefaultCircuitOpenRejection, RejectionHandler};
use crate::breaker::CircuitBreaker;
use crate::http::{Body, BoxError, HttpService};

type FailurePolicy = Arc<dyn Fn(&Response<Body>) -> bool + Send + Sync>;

/// Tower layer that guards a service with a [`CircuitBreaker`].
///
/// The breaker is consulted before every call. While it refuses, requests
/// are answered by the rejection handler (`503` by default) and the wrapped
/// service is not called. Otherwise the response is classified by the
/// failure policy (any `5xx` by default) and recorded on the breaker; an
/// error from the wrapped service also counts as a failure.
#[derive(Clone)]
pub struct CircuitBreakerLayer {
    breaker: Arc<CircuitBreaker>,
    failure_policy: FailurePolicy,
    reject: Arc<dyn RejectionHandler<CircuitOpen>>,
}

impl CircuitBreakerLayer {
    pub fn new(breaker: CircuitBreaker) -> Self {
        Self::from_shared(Arc::new(breaker))
    }

    pub fn from_shared(breaker: Arc<CircuitBreaker>) -> Self {
        Self {
            breaker,
            failure_policy: Arc::new(|resp| resp.status().is_server_error()),
            reject: Arc::new(DefaultCircuitOpenRejection),
        }
    }

    /// Custom failure detection. Return `true` to count the response as a
    /// failure.
    pub fn failure_policy(
        mut self,
        f: impl Fn(&Response<Body>) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.failure_policy = Arc::new(f);
        self
    }

    /// Replace the default `503` response.
    pub fn rejection_handler(mut self, handler: impl RejectionHandler<CircuitOpen>) -> Self {
        self.reject = Arc::new(handler);
        self
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }
}

impl tower::Layer<HttpService> for CircuitBreakerLayer {
    type Service = CircuitBreakerService;

    fn layer(&self, inner: HttpService) -> Self::Service {
        CircuitBreakerService {
            inner,
            breaker: self.breaker.clone(),
            failure_policy: self.failure_policy.clone(),
            reject: self.reject.clone(),
        }
    }
}

pub struct CircuitBreakerService {
    inner: HttpService,
    breaker: Arc<CircuitBreaker>,
    failure_policy: FailurePolicy,
    reject: Arc<dyn RejectionHandler<CircuitOpen>>,
}

impl Service<Request<Body>> for CircuitBreakerService {
    type Response = Response<Body>;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Response<Body>, BoxError>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        if !self.breaker.allow() {
            let cause = CircuitOpen {
                name: self.breaker.name().to_string(),
                state: self.breaker.state(),
            };
            debug!(name = %cause.name, path = %req.uri().path(), "Circuit open, rejecting");
            let resp = self.reject.reject(&req, &cause);
            return Box::pin(async move { Ok(resp) });
        }

        let breaker = self.breaker.clone();
        let failure_policy = self.failure_policy.clone();
        let fut = self.inner.call(req);

        Box::pin(async move {
            match fut.await {
                Ok(resp) => {
                    if failure_policy(&resp) {
                        breaker.record_failure();
                    } else {
                        breaker.record_success();
                    }
                    Ok(resp)
                }
                Err(e) => {
                    breaker.record_failure();
                    Err(e)
                }
            }
        })
    }
}
