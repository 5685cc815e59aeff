//! Circuit breaker pattern for failure detection and recovery.
//!
//! Each breaker guards one resource. While CLOSED, calls flow and are
//! measured; once the failure criteria are met the breaker OPENs and rejects
//! calls. The OPEN -> HALF_OPEN transition is checked lazily on the next call
//! after `reset_timeout`, then a single probe at a time is admitted until
//! `success_threshold` consecutive probes succeed (CLOSED) or one fails
//! (OPEN again, restarting the timer).
//!
//! All state lives behind one mutex per breaker, so concurrent calls never
//! lose metric updates.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::domain::errors::{RuntimeError, RuntimeResult};
use crate::domain::models::circuit::{
    CircuitBreakerConfig, CircuitMetrics, CircuitState, CircuitStateChanged, StateChange,
};
use crate::domain::ports::clock::{elapsed_between, to_chrono, Clock};
use crate::domain::ports::handler::CallContext;

/// Counters for the current closed-state window. Reset whenever the breaker
/// (re)enters CLOSED.
#[derive(Debug, Default, Clone, Copy)]
struct Window {
    requests: u64,
    failures: u64,
    slow: u64,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    /// Bumped on every transition and reset. Calls admitted under an older
    /// generation only update the totals when they finish.
    generation: u64,
    last_state_change: DateTime<Utc>,
    half_open_probe_in_flight: bool,
    /// Rate criteria are ignored until this instant after a recovery.
    cooldown_until: Option<DateTime<Utc>>,
    window: Window,
    metrics: CircuitMetrics,
}

/// Admitted call: the generation it was let in under, and whether it holds
/// the half-open probe slot.
#[derive(Debug, Clone, Copy)]
struct Ticket {
    generation: u64,
    probe: bool,
}

enum Admission {
    Admitted(Ticket),
    Rejected(RuntimeError),
}

/// Outcome of one measured invocation.
enum Outcome<'a> {
    Success,
    Failure(&'a RuntimeError),
    /// Refused on the caller's side; says nothing about the resource.
    Ignored,
}

/// Three-state circuit breaker guarding one named resource.
/// 
/// Closed calls feed a sliding window; the breaker opens on consecutive
/// failures or on failure and slow-call rates once the window holds
/// `request_volume_threshold` calls. After `reset_timeout` a single trial call
/// is admitted in HALF_OPEN.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<BreakerState>,
    event_sender: Option<mpsc::Sender<CircuitStateChanged>>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

/// Clears the half-open probe slot if the probe future is dropped before it
/// reports an outcome.
struct ProbeGuard<'a> {
    breaker: &'a CircuitBreaker,
    ticket: Ticket,
    armed: bool,
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        if self.armed && self.ticket.probe {
            let mut s = self.breaker.lock();
            if s.generation == self.ticket.generation {
                s.half_open_probe_in_flight = false;
            }
        }
    }
}

impl CircuitBreaker {
    /// Create a closed breaker.
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        Self {
            name: name.into(),
            config,
            clock,
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                generation: 0,
                last_state_change: now,
                half_open_probe_in_flight: false,
                cooldown_until: None,
                window: Window::default(),
                metrics: CircuitMetrics::default(),
            }),
            event_sender: None,
        }
    }

    /// Set the channel receiving state-change notifications.
    pub fn with_event_sender(mut self, sender: mpsc::Sender<CircuitStateChanged>) -> Self {
        self.event_sender = Some(sender);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current state. Does not perform the lazy OPEN -> HALF_OPEN check.
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Snapshot of counters, state and transition history.
    pub fn metrics(&self) -> CircuitMetrics {
        self.lock().metrics.clone()
    }

    /// When the breaker last changed state, or was created.
    pub fn last_state_change(&self) -> DateTime<Utc> {
        self.lock().last_state_change
    }

    fn transition(&self, s: &mut BreakerState, to: CircuitState, reason: impl Into<String>) {
        let now = self.clock.now();
        let change = StateChange {
            from: s.state,
            to,
            timestamp: now,
            reason: reason.into(),
        };

        match to {
            CircuitState::Closed => {
                tracing::info!(breaker = %self.name, from = %s.state, reason = %change.reason, "Circuit closed");
                s.window = Window::default();
                s.metrics.consecutive_failures = 0;
            }
            CircuitState::Open => {
                tracing::warn!(breaker = %self.name, from = %s.state, reason = %change.reason, "Circuit opened");
                s.metrics.consecutive_successes = 0;
                s.cooldown_until = None;
            }
            CircuitState::HalfOpen => {
                tracing::info!(breaker = %self.name, reason = %change.reason, "Circuit half-open, admitting probe");
                s.metrics.consecutive_successes = 0;
            }
        }

        s.state = to;
        s.generation += 1;
        s.last_state_change = now;
        s.half_open_probe_in_flight = false;
        s.metrics.state = to;
        s.metrics.state_changes.push(change.clone());

        if let Some(ref sender) = self.event_sender {
            let _ = sender.try_send(CircuitStateChanged {
                breaker: self.name.clone(),
                change,
            });
        }
    }

    fn open_error(&self, s: &BreakerState, retry_after: Option<Duration>) -> RuntimeError {
        RuntimeError::CircuitOpen {
            breaker: self.name.clone(),
            state: s.state,
            retry_after,
            metrics: Box::new(s.metrics.clone()),
        }
    }

    fn admit(&self) -> Admission {
        let mut s = self.lock();
        s.metrics.total_requests += 1;

        let state = s.state;
        let probe = match state {
            CircuitState::Closed => Ok(false),
            CircuitState::Open => {
                let elapsed = elapsed_between(s.last_state_change, self.clock.now());
                let reset_timeout = self.config.reset_timeout();
                if elapsed >= reset_timeout {
                    self.transition(&mut s, CircuitState::HalfOpen, "reset timeout elapsed");
                    s.half_open_probe_in_flight = true;
                    Ok(true)
                } else {
                    Err(self.open_error(&s, Some(reset_timeout - elapsed)))
                }
            }
            CircuitState::HalfOpen => {
                if s.half_open_probe_in_flight {
                    Err(self.open_error(&s, None))
                } else {
                    s.half_open_probe_in_flight = true;
                    Ok(true)
                }
            }
        };

        match probe {
            Ok(probe) => Admission::Admitted(Ticket {
                generation: s.generation,
                probe,
            }),
            Err(err) => {
                s.metrics.rejected_requests += 1;
                tracing::debug!(breaker = %self.name, state = %s.state, "Call rejected by circuit breaker");
                Admission::Rejected(err)
            }
        }
    }

    fn record(&self, ticket: Ticket, outcome: Outcome<'_>, elapsed: Duration) {
        let mut s = self.lock();
        let now = self.clock.now();
        let current = s.generation == ticket.generation;

        if let Outcome::Ignored = outcome {
            s.metrics.total_requests = s.metrics.total_requests.saturating_sub(1);
            if current && ticket.probe {
                s.half_open_probe_in_flight = false;
            }
            return;
        }

        let completed = s.metrics.successful_requests + s.metrics.failed_requests + 1;
        let elapsed_ms = elapsed.as_secs_f64() * 1000.0;
        s.metrics.average_response_time_ms +=
            (elapsed_ms - s.metrics.average_response_time_ms) / completed as f64;

        let slow = elapsed > self.config.slow_call_duration_threshold();
        if slow {
            s.metrics.slow_requests += 1;
        }
        match outcome {
            Outcome::Success => s.metrics.successful_requests += 1,
            _ => s.metrics.failed_requests += 1,
        }

        if !current {
            tracing::debug!(breaker = %self.name, state = %s.state, "Late result from an earlier breaker state");
            return;
        }

        let state = s.state;
        match state {
            CircuitState::Closed => {
                s.window.requests += 1;
                if slow {
                    s.window.slow += 1;
                }
                match outcome {
                    Outcome::Success => {
                        s.metrics.consecutive_successes += 1;
                        s.metrics.consecutive_failures = 0;
                    }
                    _ => {
                        s.window.failures += 1;
                        s.metrics.consecutive_failures += 1;
                        s.metrics.consecutive_successes = 0;
                    }
                }
                if let Some(reason) = self.trip_reason(&s, now) {
                    self.transition(&mut s, CircuitState::Open, reason);
                }
            }
            CircuitState::HalfOpen if ticket.probe => {
                s.half_open_probe_in_flight = false;
                match outcome {
                    Outcome::Failure(err) => {
                        s.metrics.consecutive_failures += 1;
                        s.metrics.consecutive_successes = 0;
                        self.transition(&mut s, CircuitState::Open, format!("probe failed: {}", err.code()));
                    }
                    _ => {
                        s.metrics.consecutive_successes += 1;
                        s.metrics.consecutive_failures = 0;
                        if s.metrics.consecutive_successes >= self.config.success_threshold {
                            let reason = format!(
                                "{} consecutive probe successes",
                                s.metrics.consecutive_successes
                            );
                            self.transition(&mut s, CircuitState::Closed, reason);
                            s.cooldown_until = Some(now + to_chrono(self.config.cooldown_period()));
                        }
                    }
                }
            }
            CircuitState::HalfOpen | CircuitState::Open => {}
        }
    }

    fn trip_reason(&self, s: &BreakerState, now: DateTime<Utc>) -> Option<String> {
        let window = s.window;
        if window.requests < self.config.request_volume_threshold {
            return None;
        }
        if s.metrics.consecutive_failures >= self.config.failure_threshold {
            return Some(format!(
                "{} consecutive failures",
                s.metrics.consecutive_failures
            ));
        }

        let cooling_down = s.cooldown_until.is_some_and(|until| now < until);
        if cooling_down || window.requests == 0 {
            return None;
        }

        let failure_rate = window.failures as f64 / window.requests as f64;
        if failure_rate >= self.config.failure_rate_threshold {
            return Some(format!("failure rate {failure_rate:.2} over {} requests", window.requests));
        }
        let slow_rate = window.slow as f64 / window.requests as f64;
        if slow_rate >= self.config.slow_call_rate_threshold {
            return Some(format!("slow call rate {slow_rate:.2} over {} requests", window.requests));
        }
        None
    }

    async fn rejected<T: DeserializeOwned>(
        &self,
        err: RuntimeError,
        ctx: &CallContext,
    ) -> RuntimeResult<T> {
        let Some(ref fallback) = self.config.fallback else {
            return Err(err);
        };
        tracing::debug!(breaker = %self.name, strategy = fallback.strategy(), "Serving fallback");
        let value = fallback.invoke(&err, ctx).await?;
        serde_json::from_value(value).map_err(|e| RuntimeError::FallbackFailed {
            resource: self.name.clone(),
            reason: e.to_string(),
        })
    }

    /// Run `f` under the breaker.
    ///
    /// Rejected calls go to the configured fallback, or fail with
    /// `CIRCUIT_OPEN`. Admitted calls race `f` against the configured
    /// timeout; a timeout counts as a failure.
    pub async fn execute<T, F, Fut>(&self, ctx: &CallContext, f: F) -> RuntimeResult<T>
    where
        T: DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = RuntimeResult<T>>,
    {
        if !self.config.enabled {
            return f().await;
        }

        let ticket = match self.admit() {
            Admission::Rejected(err) => return self.rejected(err, ctx).await,
            Admission::Admitted(ticket) => ticket,
        };
        let mut guard = ProbeGuard {
            breaker: self,
            ticket,
            armed: true,
        };

        let started = Instant::now();
        let result = match tokio::time::timeout(self.config.timeout(), f()).await {
            Ok(result) => result,
            Err(_) => Err(RuntimeError::TimeoutExceeded {
                operation: self.name.clone(),
                timeout_ms: self.config.timeout_ms,
            }),
        };
        let elapsed = started.elapsed();

        let outcome = match result {
            Ok(_) => Outcome::Success,
            Err(ref err) if err.is_caller_side() => Outcome::Ignored,
            Err(ref err) => Outcome::Failure(err),
        };
        self.record(ticket, outcome, elapsed);
        guard.armed = false;
        result
    }

    /// Manually open the breaker. Restarts the reset timeout.
    pub fn force_open(&self, reason: impl Into<String>) -> CircuitMetrics {
        let mut s = self.lock();
        let reason = format!("forced open: {}", reason.into());
        if s.state == CircuitState::Open {
            s.last_state_change = self.clock.now();
            tracing::warn!(breaker = %self.name, %reason, "Circuit already open, timer restarted");
        } else {
            self.transition(&mut s, CircuitState::Open, reason);
        }
        s.metrics.clone()
    }

    /// Manually close the breaker.
    pub fn force_closed(&self, reason: impl Into<String>) -> CircuitMetrics {
        let mut s = self.lock();
        let reason = format!("forced closed: {}", reason.into());
        if s.state != CircuitState::Closed {
            self.transition(&mut s, CircuitState::Closed, reason);
        }
        s.cooldown_until = None;
        s.metrics.clone()
    }

    /// Close the breaker and zero its counters. The state-change log is kept.
    pub fn reset(&self) {
        let mut s = self.lock();
        if s.state != CircuitState::Closed {
            self.transition(&mut s, CircuitState::Closed, "manual reset");
        }
        let history = std::mem::take(&mut s.metrics.state_changes);
        s.metrics = CircuitMetrics {
            state_changes: history,
            ..CircuitMetrics::default()
        };
        s.window = Window::default();
        s.cooldown_until = None;
        s.half_open_probe_in_flight = false;
        s.generation += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::clock::ManualClock;
    use serde_json::{json, Value};

    fn breaker(config: CircuitBreakerConfig) -> (CircuitBreaker, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        (CircuitBreaker::new("tool:search", config, clock.clone()), clock)
    }

    fn threshold_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 3,
            request_volume_threshold: 1,
            success_threshold: 2,
            reset_timeout_ms: 1_000,
            ..Default::default()
        }
        .without_rate_tripping()
    }

    async fn fail(b: &CircuitBreaker) -> RuntimeResult<Value> {
        b.execute(&CallContext::new("tool:search"), || async {
            Err::<Value, _>(RuntimeError::handler("boom"))
        })
        .await
    }

    async fn succeed(b: &CircuitBreaker) -> RuntimeResult<Value> {
        b.execute(&CallContext::new("tool:search"), || async { Ok::<_, RuntimeError>(json!("ok")) })
            .await
    }

    #[tokio::test]
    async fn test_opens_after_consecutive_failures() {
        let (b, _) = breaker(threshold_config());
        for _ in 0..2 {
            assert!(fail(&b).await.is_err());
            assert_eq!(b.state(), CircuitState::Closed);
        }
        assert!(fail(&b).await.is_err());
        assert_eq!(b.state(), CircuitState::Open);
        assert_eq!(b.metrics().state_changes.len(), 1);
    }

    #[tokio::test]
    async fn test_volume_threshold_gates_tripping() {
        let (b, _) = breaker(CircuitBreakerConfig {
            failure_threshold: 1,
            request_volume_threshold: 3,
            ..Default::default()
        });
        assert!(fail(&b).await.is_err());
        assert!(fail(&b).await.is_err());
        assert_eq!(b.state(), CircuitState::Closed);
        assert!(fail(&b).await.is_err());
        assert_eq!(b.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_failure_rate_trips() {
        let (b, _) = breaker(CircuitBreakerConfig {
            failure_threshold: 100,
            request_volume_threshold: 4,
            failure_rate_threshold: 0.5,
            ..Default::default()
        });
        succeed(&b).await.unwrap();
        assert!(fail(&b).await.is_err());
        succeed(&b).await.unwrap();
        assert_eq!(b.state(), CircuitState::Closed);
        assert!(fail(&b).await.is_err());
        assert_eq!(b.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_open_rejects_with_metrics_and_retry_after() {
        let (b, clock) = breaker(threshold_config());
        for _ in 0..3 {
            let _ = fail(&b).await;
        }
        clock.advance(Duration::from_millis(400));

        let err = succeed(&b).await.unwrap_err();
        match err {
            RuntimeError::CircuitOpen {
                state,
                retry_after,
                metrics,
                ..
            } => {
                assert_eq!(state, CircuitState::Open);
                assert_eq!(retry_after, Some(Duration::from_millis(600)));
                assert_eq!(metrics.failed_requests, 3);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(b.metrics().rejected_requests, 1);
    }

    #[tokio::test]
    async fn test_half_open_after_reset_timeout_and_recovery() {
        let (b, clock) = breaker(threshold_config());
        for _ in 0..3 {
            let _ = fail(&b).await;
        }
        clock.advance(Duration::from_millis(1_000));

        succeed(&b).await.unwrap();
        assert_eq!(b.state(), CircuitState::HalfOpen);
        succeed(&b).await.unwrap();
        assert_eq!(b.state(), CircuitState::Closed);

        let states: Vec<CircuitState> = b.metrics().state_changes.iter().map(|c| c.to).collect();
        assert_eq!(
            states,
            vec![CircuitState::Open, CircuitState::HalfOpen, CircuitState::Closed]
        );
    }

    #[tokio::test]
    async fn test_probe_failure_reopens_and_restarts_timer() {
        let (b, clock) = breaker(threshold_config());
        for _ in 0..3 {
            let _ = fail(&b).await;
        }
        clock.advance(Duration::from_millis(1_000));
        assert!(matches!(fail(&b).await, Err(RuntimeError::Handler(_))));
        assert_eq!(b.state(), CircuitState::Open);

        clock.advance(Duration::from_millis(999));
        assert!(matches!(
            succeed(&b).await,
            Err(RuntimeError::CircuitOpen { .. })
        ));
        clock.advance(Duration::from_millis(1));
        succeed(&b).await.unwrap();
        assert_eq!(b.state(), CircuitState::HalfOpen);
    }

    #[tokio::test]
    async fn test_dropped_probe_releases_slot() {
        let (b, clock) = breaker(threshold_config());
        for _ in 0..3 {
            let _ = fail(&b).await;
        }
        clock.advance(Duration::from_millis(1_000));

        let ctx = CallContext::new("tool:search");
        {
            let probe = b.execute(&ctx, || async {
                std::future::pending::<RuntimeResult<Value>>().await
            });
            tokio::pin!(probe);
            assert!(futures::poll!(probe.as_mut()).is_pending());
            assert!(matches!(
                succeed(&b).await,
                Err(RuntimeError::CircuitOpen { .. })
            ));
        }

        succeed(&b).await.unwrap();
    }

    #[tokio::test]
    async fn test_fallback_served_when_open() {
        #[derive(Debug)]
        struct Canned;

        #[async_trait::async_trait]
        impl crate::domain::ports::fallback::Fallback for Canned {
            fn strategy(&self) -> &'static str {
                "canned"
            }

            async fn invoke(&self, _cause: &RuntimeError, _ctx: &CallContext) -> RuntimeResult<Value> {
                Ok(json!("cached"))
            }
        }

        let (b, _) = breaker(threshold_config().with_fallback(Arc::new(Canned)));
        b.force_open("maintenance");
        let value: Value = succeed(&b).await.unwrap();
        assert_eq!(value, json!("cached"));
        assert_eq!(b.metrics().rejected_requests, 1);
    }

    #[tokio::test]
    async fn test_force_and_reset() {
        let (b, _) = breaker(threshold_config());
        b.force_open("maintenance");
        assert_eq!(b.state(), CircuitState::Open);
        b.force_closed("done");
        assert_eq!(b.state(), CircuitState::Closed);

        let _ = fail(&b).await;
        b.reset();
        let metrics = b.metrics();
        assert_eq!(metrics.failed_requests, 0);
        assert_eq!(metrics.state_changes.len(), 2);
        assert!(metrics.state_changes[0].reason.contains("maintenance"));
    }

    #[tokio::test]
    async fn test_caller_side_refusals_are_not_failures() {
        let (b, _) = breaker(threshold_config());
        let ctx = CallContext::new("tool:search");
        for _ in 0..5 {
            let result: RuntimeResult<Value> = b
                .execute(&ctx, || async { Err(RuntimeError::validation("missing field")) })
                .await;
            assert!(matches!(result, Err(RuntimeError::Validation(_))));
            let result: RuntimeResult<Value> = b
                .execute(&ctx, || async {
                    Err(RuntimeError::ConcurrencyLimitReached {
                        key: "tool:search".to_string(),
                        limit: 1,
                    })
                })
                .await;
            assert!(result.is_err());
        }

        assert_eq!(b.state(), CircuitState::Closed);
        let metrics = b.metrics();
        assert_eq!(metrics.total_requests, 0);
        assert_eq!(metrics.failed_requests, 0);
        assert_eq!(metrics.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_caller_side_refusal_frees_half_open_slot() {
        let (b, clock) = breaker(threshold_config());
        for _ in 0..3 {
            let _ = fail(&b).await;
        }
        clock.advance(Duration::from_millis(1_000));

        let refused: RuntimeResult<Value> = b
            .execute(&CallContext::new("tool:search"), || async {
                Err(RuntimeError::validation("missing field"))
            })
            .await;
        assert!(refused.is_err());
        assert_eq!(b.state(), CircuitState::HalfOpen);

        succeed(&b).await.unwrap();
        succeed(&b).await.unwrap();
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_means_strictly_over_threshold() {
        let (b, _) = breaker(CircuitBreakerConfig {
            slow_call_duration_threshold_ms: 0,
            ..threshold_config()
        });
        let ctx = CallContext::new("tool:search");

        succeed(&b).await.unwrap();
        assert_eq!(b.metrics().slow_requests, 0);

        let _: Value = b
            .execute(&ctx, || async {
                tokio::time::sleep(Duration::from_millis(1)).await;
                Ok(json!("ok"))
            })
            .await
            .unwrap();
        assert_eq!(b.metrics().slow_requests, 1);
    }

    #[tokio::test]
    async fn test_disabled_passes_through() {
        let (b, _) = breaker(CircuitBreakerConfig {
            enabled: false,
            failure_threshold: 1,
            request_volume_threshold: 1,
            ..Default::default()
        });
        for _ in 0..5 {
            assert!(matches!(fail(&b).await, Err(RuntimeError::Handler(_))));
        }
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_state_change_notifications() {
        let (tx, mut rx) = mpsc::channel(8);
        let clock = Arc::new(ManualClock::new());
        let b = CircuitBreaker::new("agent:planner", threshold_config(), clock).with_event_sender(tx);
        b.force_open("test");

        let event = rx.try_recv().unwrap();
        assert_eq!(event.breaker, "agent:planner");
        assert_eq!(event.change.to, CircuitState::Open);
    }
}
