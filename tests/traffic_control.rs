mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use futures::future::join_all;
use http::StatusCode;
use parking_lot::Mutex;
use tower::ServiceExt;
use trafficgate::middleware::{CircuitBreakerLayer, RateLimitLayer};
use trafficgate::{
    CircuitBreaker, CircuitBreakerConfig, CircuitState, GatewayConfig, SlidingWindowLimiter,
    TokenBucketLimiter, TrafficControl,
};

fn breaker(max_failures: u32, reset_timeout: Duration) -> CircuitBreaker {
    CircuitBreaker::new(
        CircuitBreakerConfig::new("upstream")
            .with_max_failures(max_failures)
            .with_reset_timeout(reset_timeout),
    )
    .unwrap()
}

#[tokio::test]
async fn rate_limited_requests_get_429_without_reaching_upstream() {
    let upstream = Upstream::new();
    let control = TrafficControl::new().with_rate_limit(RateLimitLayer::new(
        TokenBucketLimiter::with_rate(1.0, 2).unwrap(),
    ));

    for i in 0..2 {
        let resp = control
            .wrap(upstream.service())
            .oneshot(request_from("203.0.113.7:5000"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK, "request {i} should be admitted");
    }

    let resp = control
        .wrap(upstream.service())
        .oneshot(request_from("203.0.113.7:5001"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(resp.headers()["content-type"], "application/json");
    assert_eq!(resp.headers()["x-ratelimit-limit"], "1");
    assert_eq!(resp.headers()["x-ratelimit-remaining"], "0");
    assert_eq!(resp.headers()["retry-after"], "1");
    assert_eq!(body_string(resp).await, r#"{"error":"rate limit exceeded"}"#);
    assert_eq!(upstream.calls(), 2);

    // A different caller has its own bucket.
    let resp = control
        .wrap(upstream.service())
        .oneshot(request_from("198.51.100.1:5000"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn open_circuit_returns_503_then_recovers() {
    let upstream = Upstream::new();
    let control = TrafficControl::new()
        .with_circuit_breaker(CircuitBreakerLayer::new(breaker(3, Duration::from_millis(50))));

    upstream.respond_with(500);
    for _ in 0..3 {
        let resp = control
            .wrap(upstream.service())
            .oneshot(request_from("10.0.0.1:1"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    let breaker = control.circuit_breaker().unwrap().clone();
    assert_eq!(breaker.state(), CircuitState::Open);

    let resp = control
        .wrap(upstream.service())
        .oneshot(request_from("10.0.0.1:1"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body_string(resp).await, r#"{"error":"circuit breaker is open"}"#);
    assert_eq!(upstream.calls(), 3);

    tokio::time::sleep(Duration::from_millis(80)).await;
    upstream.respond_with(200);

    let resp = control
        .wrap(upstream.service())
        .oneshot(request_from("10.0.0.1:1"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(breaker.state(), CircuitState::Closed);
    assert_eq!(breaker.failure_count(), 0);
}

#[tokio::test]
async fn failed_trial_call_reopens_circuit() {
    let upstream = Upstream::new();
    let control = TrafficControl::new()
        .with_circuit_breaker(CircuitBreakerLayer::new(breaker(2, Duration::from_millis(30))));
    let breaker = control.circuit_breaker().unwrap().clone();

    upstream.respond_with(502);
    for _ in 0..2 {
        control
            .wrap(upstream.service())
            .oneshot(request_from("10.0.0.1:1"))
            .await
            .unwrap();
    }
    assert_eq!(breaker.state(), CircuitState::Open);

    tokio::time::sleep(Duration::from_millis(50)).await;
    let resp = control
        .wrap(upstream.service())
        .oneshot(request_from("10.0.0.1:1"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(breaker.state(), CircuitState::Open);

    let resp = control
        .wrap(upstream.service())
        .oneshot(request_from("10.0.0.1:1"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(upstream.calls(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_callers_share_a_single_token() {
    let upstream = Upstream::new();
    let control = TrafficControl::new().with_rate_limit(RateLimitLayer::new(
        TokenBucketLimiter::with_rate(0.0, 1).unwrap(),
    ));

    let handles: Vec<_> = (0..64)
        .map(|_| {
            let svc = control.wrap(upstream.service());
            tokio::spawn(send(svc, request_from("10.9.9.9:1")))
        })
        .collect();

    let statuses: Vec<StatusCode> = join_all(handles)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().status())
        .collect();

    let admitted = statuses.iter().filter(|s| **s == StatusCode::OK).count();
    let rejected = statuses
        .iter()
        .filter(|s| **s == StatusCode::TOO_MANY_REQUESTS)
        .count();
    assert_eq!(admitted, 1);
    assert_eq!(rejected, 63);
    assert_eq!(upstream.calls(), 1);
}

#[tokio::test]
async fn rejected_requests_do_not_touch_breaker() {
    let upstream = Upstream::new();
    upstream.respond_with(500);
    let control = TrafficControl::new()
        .with_rate_limit(RateLimitLayer::new(SlidingWindowLimiter::with_limit(
            1,
            Duration::from_secs(60),
        )))
        .with_circuit_breaker(CircuitBreakerLayer::new(breaker(2, Duration::from_secs(60))));

    for _ in 0..5 {
        control
            .wrap(upstream.service())
            .oneshot(request_from("10.0.0.1:1"))
            .await
            .unwrap();
    }

    let breaker = control.circuit_breaker().unwrap();
    assert_eq!(breaker.failure_count(), 1);
    assert_eq!(breaker.state(), CircuitState::Closed);
    assert_eq!(upstream.calls(), 1);
}

#[tokio::test]
async fn state_change_hook_sees_every_transition() {
    let transitions = Arc::new(Mutex::new(Vec::new()));
    let sink = transitions.clone();
    let breaker = breaker(1, Duration::from_millis(20)).with_state_change_hook(
        move |name: &str, from: CircuitState, to: CircuitState| {
            sink.lock().push(format!("{name}: {from} -> {to}"));
        },
    );

    let upstream = Upstream::new();
    let control = TrafficControl::new().with_circuit_breaker(CircuitBreakerLayer::new(breaker));

    upstream.respond_with(500);
    control
        .wrap(upstream.service())
        .oneshot(request_from("10.0.0.1:1"))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(40)).await;
    upstream.respond_with(204);
    control
        .wrap(upstream.service())
        .oneshot(request_from("10.0.0.1:1"))
        .await
        .unwrap();

    assert_eq!(
        *transitions.lock(),
        vec![
            "upstream: CLOSED -> OPEN".to_string(),
            "upstream: OPEN -> HALF_OPEN".to_string(),
            "upstream: HALF_OPEN -> CLOSED".to_string(),
        ]
    );
}

#[test]
fn config_driven_stack_applies_header_keys() {
    let config = GatewayConfig::from_yaml(
        r#"
rate_limit:
  algorithm: sliding_window
  limit: 1
  window_ms: 60000
  key: header
  header: x-api-key
"#,
    )
    .unwrap();
    let control = TrafficControl::from_config(&config).unwrap();
    let upstream = Upstream::new();

    let call = |api_key: &'static str| {
        let mut req = request_from("10.0.0.1:1");
        req.headers_mut().insert("x-api-key", api_key.parse().unwrap());
        let svc = control.wrap(upstream.service());
        tokio_test::block_on(svc.oneshot(req)).unwrap().status()
    };

    assert_eq!(call("alpha"), StatusCode::OK);
    assert_eq!(call("beta"), StatusCode::OK);
    assert_eq!(call("alpha"), StatusCode::TOO_MANY_REQUESTS);
}
