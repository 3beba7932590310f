//! Circuit breaker.
//!
//! A three-state machine guarding one protected resource. Transitions happen
//! only inside [`CircuitBreaker::allow`], [`CircuitBreaker::record_success`]
//! and [`CircuitBreaker::record_failure`]; the Open to HalfOpen timeout is
//! evaluated lazily against the caller's clock, so no background timer runs.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use crate::error::{GatewayError, Result};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CircuitState {
    /// Normal operation, every call is admitted.
    Closed,
    /// Recovery is being tested.
    HalfOpen,
    /// Calls are rejected without reaching the protected resource.
    Open,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::HalfOpen => "HALF_OPEN",
            CircuitState::Open => "OPEN",
        };
        f.write_str(name)
    }
}

/// Called synchronously with `(name, from, to)` on every state transition,
/// after the breaker's lock has been released. Calls are delivered one at a
/// time in transition order.
///
/// The hook may read [`CircuitBreaker::state`] and
/// [`CircuitBreaker::failure_count`], but must not call `allow` or `record_*`
/// on the same breaker: a transition made from inside the hook would wait on
/// the hook's own delivery.
pub type StateChangeHook = Arc<dyn Fn(&str, CircuitState, CircuitState) + Send + Sync>;

/// Configuration for a circuit breaker.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub name: String,
    /// Failures that open the circuit.
    pub max_failures: u32,
    /// How long the circuit stays open after the latest failure.
    pub reset_timeout: Duration,
    /// Calls admitted concurrently while half-open.
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            max_failures: 5,
            reset_timeout: Duration::from_secs(30),
            half_open_max_calls: 1,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_max_failures(mut self, max_failures: u32) -> Self {
        self.max_failures = max_failures;
        self
    }

    pub fn with_reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout = timeout;
        self
    }

    pub fn with_half_open_max_calls(mut self, calls: u32) -> Self {
        self.half_open_max_calls = calls;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_failures == 0 {
            return Err(GatewayError::invalid("max_failures", "must be at least 1"));
        }
        if self.half_open_max_calls == 0 {
            return Err(GatewayError::invalid("half_open_max_calls", "must be at least 1"));
        }
        Ok(())
    }
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
    trials_in_flight: u32,
    last_trial: Option<Instant>,
    /// Transitions made so far; numbers hook deliveries.
    transitions: u64,
}

/// `(from, to, sequence number)` of a transition made under the lock.
type Transition = Option<(CircuitState, CircuitState, u64)>;

impl Inner {
    fn transition(&mut self, to: CircuitState) -> Transition {
        if self.state == to {
            return None;
        }
        let from = self.state;
        self.state = to;
        self.trials_in_flight = 0;
        self.transitions += 1;
        Some((from, to, self.transitions))
    }

    fn admit_trial(&mut self, now: Instant) {
        self.trials_in_flight += 1;
        self.last_trial = Some(now);
    }
}

/// A circuit breaker for a single protected resource.
///
/// `failure_count` is incremented on every recorded failure, whatever the
/// state, and cleared by any recorded success. Failures recorded while open
/// therefore keep counting and push the reopening deadline out.
pub struct CircuitBreaker {
    name: String,
    max_failures: u32,
    reset_timeout: Duration,
    half_open_max_calls: u32,
    inner: Mutex<Inner>,
    on_state_change: Option<StateChangeHook>,
    /// Sequence number of the last transition whose notification finished.
    delivered: Mutex<u64>,
    next_turn: Condvar,
}

/// Marks a notification as delivered when dropped, so a panicking hook
/// does not stall later notifications.
struct Delivery<'a> {
    breaker: &'a CircuitBreaker,
    seq: u64,
}

impl Drop for Delivery<'_> {
    fn drop(&mut self) {
        *self.breaker.delivered.lock() = self.seq;
        self.breaker.next_turn.notify_all();
    }
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            name: config.name,
            max_failures: config.max_failures,
            reset_timeout: config.reset_timeout,
            half_open_max_calls: config.half_open_max_calls,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure: None,
                trials_in_flight: 0,
                last_trial: None,
                transitions: 0,
            }),
            on_state_change: None,
            delivered: Mutex::new(0),
            next_turn: Condvar::new(),
        })
    }

    /// Install the state-change notification hook.
    pub fn with_state_change_hook(
        mut self,
        hook: impl Fn(&str, CircuitState, CircuitState) + Send + Sync + 'static,
    ) -> Self {
        self.on_state_change = Some(Arc::new(hook));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn max_failures(&self) -> u32 {
        self.max_failures
    }

    pub fn reset_timeout(&self) -> Duration {
        self.reset_timeout
    }

    /// Current state, as of the last call. Does not evaluate the timeout.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.inner.lock().failure_count
    }

    pub fn allow(&self) -> bool {
        self.allow_at(Instant::now())
    }

    /// Admission check evaluated at `now`.
    ///
    /// An open circuit whose latest failure is older than `reset_timeout`
    /// moves to half-open and admits this call as a trial. A half-open
    /// circuit admits up to `half_open_max_calls` calls; a trial call that has
    /// reported nothing for `reset_timeout` frees its slot.
    pub fn allow_at(&self, now: Instant) -> bool {
        let (allowed, transition) = {
            let mut inner = self.inner.lock();
            match inner.state {
                CircuitState::Closed => (true, None),
                CircuitState::Open => {
                    let expired = inner
                        .last_failure
                        .map_or(true, |at| now.saturating_duration_since(at) > self.reset_timeout);
                    if expired {
                        let transition = inner.transition(CircuitState::HalfOpen);
                        inner.admit_trial(now);
                        (true, transition)
                    } else {
                        (false, None)
                    }
                }
                CircuitState::HalfOpen => {
                    let stale = inner
                        .last_trial
                        .map_or(true, |at| now.saturating_duration_since(at) > self.reset_timeout);
                    if inner.trials_in_flight < self.half_open_max_calls {
                        inner.admit_trial(now);
                        (true, None)
                    } else if stale {
                        debug!(breaker = %self.name, "Replacing unanswered half-open trial call");
                        inner.last_trial = Some(now);
                        (true, None)
                    } else {
                        (false, None)
                    }
                }
            }
        };

        self.notify(transition);
        allowed
    }

    /// Record a successful call. Closes a half-open circuit and clears the
    /// failure tally in every state.
    pub fn record_success(&self) {
        let transition = {
            let mut inner = self.inner.lock();
            inner.failure_count = 0;
            match inner.state {
                CircuitState::HalfOpen => inner.transition(CircuitState::Closed),
                _ => None,
            }
        };
        self.notify(transition);
    }

    pub fn record_failure(&self) {
        self.record_failure_at(Instant::now());
    }

    /// Record a failed call observed at `now`.
    ///
    /// Opens the circuit once the tally reaches `max_failures`, from any
    /// state. A half-open failure below the threshold leaves the circuit
    /// half-open and frees the slot the failed call held.
    pub fn record_failure_at(&self, now: Instant) {
        let transition = {
            let mut inner = self.inner.lock();
            inner.failure_count = inner.failure_count.saturating_add(1);
            inner.last_failure = Some(now);

            if inner.failure_count >= self.max_failures {
                inner.transition(CircuitState::Open)
            } else {
                if inner.state == CircuitState::HalfOpen {
                    inner.trials_in_flight = inner.trials_in_flight.saturating_sub(1);
                }
                None
            }
        };
        self.notify(transition);
    }

    /// Logs a transition and runs the hook once every earlier transition
    /// has been delivered.
    fn notify(&self, transition: Transition) {
        let Some((from, to, seq)) = transition else {
            return;
        };

        let mut delivered = self.delivered.lock();
        while *delivered + 1 < seq {
            self.next_turn.wait(&mut delivered);
        }
        drop(delivered);
        let _delivery = Delivery { breaker: self, seq };

        match to {
            CircuitState::Open => {
                warn!(breaker = %self.name, from = %from, to = %to, "Circuit breaker opened")
            }
            _ => info!(
                breaker = %self.name,
                from = %from,
                to = %to,
                "Circuit breaker state changed"
            ),
        }

        if let Some(hook) = &self.on_state_change {
            hook(&self.name, from, to);
        }
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &inner.state)
            .field("failure_count", &inner.failure_count)
            .field("max_failures", &self.max_failures)
            .field("reset_timeout", &self.reset_timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(max_failures: u32, reset_timeout: Duration) -> CircuitBreaker {
        CircuitBreaker::new(
            CircuitBreakerConfig::new("test")
                .with_max_failures(max_failures)
                .with_reset_timeout(reset_timeout),
        )
        .unwrap()
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn recording_hook() -> (
        Arc<Mutex<Vec<(String, CircuitState, CircuitState)>>>,
        impl Fn(&str, CircuitState, CircuitState) + Send + Sync + 'static,
    ) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let hook = move |name: &str, from: CircuitState, to: CircuitState| {
            sink.lock().push((name.to_string(), from, to))
        };
        (events, hook)
    }

    #[test]
    fn test_config_validation() {
        assert!(CircuitBreaker::new(CircuitBreakerConfig::new("x").with_max_failures(0)).is_err());
        assert!(
            CircuitBreaker::new(CircuitBreakerConfig::new("x").with_half_open_max_calls(0)).is_err()
        );
        assert!(CircuitBreaker::new(CircuitBreakerConfig::default()).is_ok());
    }

    #[test]
    fn test_initial_state() {
        let cb = breaker(3, ms(500));
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.failure_count(), 0);
        assert!(cb.allow());
    }

    #[test]
    fn test_opens_on_threshold_not_before() {
        let cb = breaker(3, ms(500));
        let t0 = Instant::now();

        for i in 0..2 {
            assert!(cb.allow_at(t0));
            cb.record_failure_at(t0);
            assert_eq!(cb.state(), CircuitState::Closed, "failure {i} should not trip");
        }
        assert!(cb.allow_at(t0));
        cb.record_failure_at(t0);
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.allow_at(t0));
    }

    #[test]
    fn test_open_half_open_closed_cycle() {
        let cb = breaker(3, ms(500));
        let t0 = Instant::now();
        for _ in 0..3 {
            cb.record_failure_at(t0);
        }
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.allow_at(t0));

        assert!(cb.allow_at(t0 + ms(600)));
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.failure_count(), 0);
    }

    #[test]
    fn test_failed_trial_call_reopens() {
        let cb = breaker(3, ms(500));
        let t0 = Instant::now();
        for _ in 0..3 {
            cb.record_failure_at(t0);
        }
        assert!(cb.allow_at(t0 + ms(600)));
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        cb.record_failure_at(t0 + ms(610));
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(cb.failure_count() >= 3);
        assert!(!cb.allow_at(t0 + ms(700)));
        assert!(cb.allow_at(t0 + ms(1200)));
    }

    #[test]
    fn test_half_open_failure_below_threshold_stays_half_open() {
        let cb = breaker(3, ms(500));
        let t0 = Instant::now();
        for _ in 0..3 {
            cb.record_failure_at(t0);
        }
        // A late success clears the tally but leaves the circuit open.
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.failure_count(), 0);

        assert!(cb.allow_at(t0 + ms(600)));
        assert!(!cb.allow_at(t0 + ms(600)));
        cb.record_failure_at(t0 + ms(610));
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert_eq!(cb.failure_count(), 1);

        // The failed call's slot is free again.
        assert!(cb.allow_at(t0 + ms(620)));
        assert!(!cb.allow_at(t0 + ms(620)));
    }

    #[test]
    fn test_stays_open_for_reset_timeout() {
        let cb = breaker(1, ms(500));
        let t0 = Instant::now();
        cb.record_failure_at(t0);

        for elapsed in [0, 100, 250, 499, 500] {
            assert!(!cb.allow_at(t0 + ms(elapsed)), "should be open at {elapsed}ms");
        }
        assert!(cb.allow_at(t0 + ms(501)));
    }

    #[test]
    fn test_failures_while_open_extend_the_timeout() {
        let cb = breaker(2, ms(500));
        let t0 = Instant::now();
        cb.record_failure_at(t0);
        cb.record_failure_at(t0);
        cb.record_failure_at(t0 + ms(400));

        assert_eq!(cb.failure_count(), 3);
        assert!(!cb.allow_at(t0 + ms(600)));
        assert!(cb.allow_at(t0 + ms(901)));
    }

    #[test]
    fn test_success_always_clears_failures() {
        let cb = breaker(10, ms(500));
        for _ in 0..7 {
            cb.record_failure();
        }
        assert_eq!(cb.failure_count(), 7);
        cb.record_success();
        assert_eq!(cb.failure_count(), 0);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_limits_trial_calls() {
        let cb = breaker(1, ms(500));
        let t0 = Instant::now();
        cb.record_failure_at(t0);

        let trial_at = t0 + ms(600);
        assert!(cb.allow_at(trial_at));
        assert!(!cb.allow_at(trial_at));
        assert!(!cb.allow_at(trial_at + ms(100)));

        // A trial call that never reports frees its slot after the timeout.
        assert!(cb.allow_at(trial_at + ms(501)));
        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn test_multiple_half_open_calls() {
        let cb = CircuitBreaker::new(
            CircuitBreakerConfig::new("multi")
                .with_max_failures(1)
                .with_reset_timeout(ms(100))
                .with_half_open_max_calls(3),
        )
        .unwrap();
        let t0 = Instant::now();
        cb.record_failure_at(t0);

        let later = t0 + ms(200);
        assert!(cb.allow_at(later));
        assert!(cb.allow_at(later));
        assert!(cb.allow_at(later));
        assert!(!cb.allow_at(later));
    }

    #[test]
    fn test_hook_fires_on_transitions_only() {
        let (events, hook) = recording_hook();
        let cb = breaker(2, ms(500)).with_state_change_hook(hook);
        let t0 = Instant::now();

        cb.record_success();
        cb.record_failure_at(t0);
        assert!(events.lock().is_empty());

        cb.record_failure_at(t0);
        cb.record_failure_at(t0);
        assert!(cb.allow_at(t0 + ms(600)));
        cb.record_success();
        cb.record_success();

        let events = events.lock();
        assert_eq!(
            *events,
            vec![
                ("test".to_string(), CircuitState::Closed, CircuitState::Open),
                ("test".to_string(), CircuitState::Open, CircuitState::HalfOpen),
                ("test".to_string(), CircuitState::HalfOpen, CircuitState::Closed),
            ]
        );
    }

    #[test]
    fn test_hook_may_query_breaker() {
        let cb = Arc::new_cyclic(|weak: &std::sync::Weak<CircuitBreaker>| {
            let weak = weak.clone();
            breaker(1, ms(500)).with_state_change_hook(move |_, _, to| {
                if let Some(cb) = weak.upgrade() {
                    assert_eq!(cb.state(), to);
                }
            })
        });
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn test_hook_calls_follow_transition_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let cb = Arc::new(breaker(1, Duration::ZERO).with_state_change_hook(
            move |_, from, to| {
                if to == CircuitState::Open {
                    std::thread::sleep(ms(50));
                }
                sink.lock().push((from, to));
            },
        ));

        let failing = {
            let cb = Arc::clone(&cb);
            std::thread::spawn(move || cb.record_failure())
        };
        while cb.state() != CircuitState::Open {
            std::thread::yield_now();
        }
        // The Open hook is still sleeping; this transition's hook must wait.
        assert!(cb.allow_at(Instant::now() + ms(1)));
        failing.join().unwrap();

        let seen = seen.lock();
        assert_eq!(
            *seen,
            vec![
                (CircuitState::Closed, CircuitState::Open),
                (CircuitState::Open, CircuitState::HalfOpen),
            ]
        );
        assert_eq!(seen.last().map(|(_, to)| *to), Some(cb.state()));
    }

    #[test]
    fn test_state_display() {
        assert_eq!(CircuitState::Closed.to_string(), "CLOSED");
        assert_eq!(CircuitState::HalfOpen.to_string(), "HALF_OPEN");
        assert_eq!(CircuitState::Open.to_string(), "OPEN");
    }
}
