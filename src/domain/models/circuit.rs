//! Circuit breaker configuration, state and metrics models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::domain::ports::fallback::Fallback;

/// State of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Circuit is closed, requests flow normally and are measured.
    Closed,
    /// Circuit is open, requests are rejected or routed to a fallback.
    Open,
    /// Circuit is testing if the resource has recovered.
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "CLOSED",
            Self::Open => "OPEN",
            Self::HalfOpen => "HALF_OPEN",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration for circuit breakers.
///
/// Durations are expressed in milliseconds so the struct maps directly onto
/// the YAML configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening the circuit.
    pub failure_threshold: u32,
    /// Failure ratio (0.0-1.0) over the closed window that opens the circuit.
    pub failure_rate_threshold: f64,
    /// Minimum requests in the closed window before any tripping rule applies.
    pub request_volume_threshold: u64,
    /// Per-call time budget.
    pub timeout_ms: u64,
    /// How long to stay open before letting a probe through.
    pub reset_timeout_ms: u64,
    /// Grace period after recovery during which rate rules are not evaluated.
    pub cooldown_period_ms: u64,
    /// Consecutive probe successes needed to close from half-open.
    pub success_threshold: u32,
    /// Calls slower than this are counted as slow.
    pub slow_call_duration_threshold_ms: u64,
    /// Slow-call ratio (0.0-1.0) over the closed window that opens the circuit.
    pub slow_call_rate_threshold: f64,
    /// Whether to enable the breaker at all.
    pub enabled: bool,
    /// Invoked instead of failing when a call is rejected.
    #[serde(skip)]
    pub fallback: Option<Arc<dyn Fallback>>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_rate_threshold: 0.5,
            request_volume_threshold: 10,
            timeout_ms: 5_000,
            reset_timeout_ms: 30_000,
            cooldown_period_ms: 10_000,
            success_threshold: 3,
            slow_call_duration_threshold_ms: 3_000,
            slow_call_rate_threshold: 0.5,
            enabled: true,
            fallback: None,
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a more sensitive circuit breaker.
    pub fn sensitive() -> Self {
        Self {
            failure_threshold: 3,
            request_volume_threshold: 5,
            reset_timeout_ms: 15_000,
            success_threshold: 1,
            ..Default::default()
        }
    }

    /// Create a more resilient circuit breaker.
    pub fn resilient() -> Self {
        Self {
            failure_threshold: 10,
            failure_rate_threshold: 0.75,
            request_volume_threshold: 20,
            reset_timeout_ms: 60_000,
            success_threshold: 5,
            ..Default::default()
        }
    }

    /// Only trip on consecutive failures. Ratios never exceed 1.0, so an
    /// infinite threshold can never be reached.
    pub fn without_rate_tripping(mut self) -> Self {
        self.failure_rate_threshold = f64::INFINITY;
        self.slow_call_rate_threshold = f64::INFINITY;
        self
    }

    pub fn with_fallback(mut self, fallback: Arc<dyn Fallback>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }

    pub fn cooldown_period(&self) -> Duration {
        Duration::from_millis(self.cooldown_period_ms)
    }

    pub fn slow_call_duration_threshold(&self) -> Duration {
        Duration::from_millis(self.slow_call_duration_threshold_ms)
    }
}

/// Per-breaker overrides merged over the manager's defaults. Each `Some`
/// field replaces the matching [`CircuitBreakerConfig`] field.
#[derive(Debug, Clone, Default)]
pub struct CircuitBreakerOverrides {
    pub failure_threshold: Option<u32>,
    pub failure_rate_threshold: Option<f64>,
    pub request_volume_threshold: Option<u64>,
    pub timeout_ms: Option<u64>,
    pub reset_timeout_ms: Option<u64>,
    pub cooldown_period_ms: Option<u64>,
    pub success_threshold: Option<u32>,
    pub slow_call_duration_threshold_ms: Option<u64>,
    pub slow_call_rate_threshold: Option<f64>,
    pub enabled: Option<bool>,
    pub fallback: Option<Arc<dyn Fallback>>,
}

impl CircuitBreakerOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failure_threshold(mut self, value: u32) -> Self {
        self.failure_threshold = Some(value);
        self
    }

    pub fn failure_rate_threshold(mut self, value: f64) -> Self {
        self.failure_rate_threshold = Some(value);
        self
    }

    pub fn request_volume_threshold(mut self, value: u64) -> Self {
        self.request_volume_threshold = Some(value);
        self
    }

    pub fn timeout_ms(mut self, value: u64) -> Self {
        self.timeout_ms = Some(value);
        self
    }

    pub fn reset_timeout_ms(mut self, value: u64) -> Self {
        self.reset_timeout_ms = Some(value);
        self
    }

    pub fn success_threshold(mut self, value: u32) -> Self {
        self.success_threshold = Some(value);
        self
    }

    pub fn fallback(mut self, fallback: Arc<dyn Fallback>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    /// Merge these overrides over `base`.
    pub fn apply(self, base: &CircuitBreakerConfig) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold.unwrap_or(base.failure_threshold),
            failure_rate_threshold: self
                .failure_rate_threshold
                .unwrap_or(base.failure_rate_threshold),
            request_volume_threshold: self
                .request_volume_threshold
                .unwrap_or(base.request_volume_threshold),
            timeout_ms: self.timeout_ms.unwrap_or(base.timeout_ms),
            reset_timeout_ms: self.reset_timeout_ms.unwrap_or(base.reset_timeout_ms),
            cooldown_period_ms: self.cooldown_period_ms.unwrap_or(base.cooldown_period_ms),
            success_threshold: self.success_threshold.unwrap_or(base.success_threshold),
            slow_call_duration_threshold_ms: self
                .slow_call_duration_threshold_ms
                .unwrap_or(base.slow_call_duration_threshold_ms),
            slow_call_rate_threshold: self
                .slow_call_rate_threshold
                .unwrap_or(base.slow_call_rate_threshold),
            enabled: self.enabled.unwrap_or(base.enabled),
            fallback: self.fallback.or_else(|| base.fallback.clone()),
        }
    }
}

/// One entry in a breaker's state-change log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateChange {
    pub from: CircuitState,
    pub to: CircuitState,
    pub timestamp: DateTime<Utc>,
    pub reason: String,
}

/// Counters and state for one breaker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitMetrics {
    /// Calls that reached the breaker, rejected ones included. Caller-side
    /// refusals are not counted.
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    /// Calls refused with `CIRCUIT_OPEN`.
    pub rejected_requests: u64,
    /// Completed calls that took longer than the slow-call threshold.
    pub slow_requests: u64,
    /// Running mean of completed call durations, in milliseconds.
    pub average_response_time_ms: f64,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub state: CircuitState,
    /// Every transition since creation, oldest first. Kept across resets.
    pub state_changes: Vec<StateChange>,
}

impl Default for CircuitMetrics {
    fn default() -> Self {
        Self {
            total_requests: 0,
            successful_requests: 0,
            failed_requests: 0,
            rejected_requests: 0,
            slow_requests: 0,
            average_response_time_ms: 0.0,
            consecutive_failures: 0,
            consecutive_successes: 0,
            state: CircuitState::Closed,
            state_changes: Vec::new(),
        }
    }
}

/// Aggregate health across all registered breakers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    /// True when no breaker is open.
    pub healthy: bool,
    pub total: usize,
    pub closed: usize,
    pub open: usize,
    pub half_open: usize,
    pub breakers: BTreeMap<String, CircuitMetrics>,
}

impl HealthStatus {
    /// Tally breakers by state.
    pub fn from_metrics(breakers: BTreeMap<String, CircuitMetrics>) -> Self {
        let count = |state: CircuitState| breakers.values().filter(|m| m.state == state).count();
        let open = count(CircuitState::Open);
        Self {
            healthy: open == 0,
            total: breakers.len(),
            closed: count(CircuitState::Closed),
            open,
            half_open: count(CircuitState::HalfOpen),
            breakers,
        }
    }
}

/// Emitted whenever a breaker changes state.
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitStateChanged {
    pub breaker: String,
    pub change: StateChange,
}
