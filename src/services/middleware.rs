//! Handler middleware: validate -> timeout -> retry -> concurrency -> handler.
//!
//! A [`Pipeline`] is built per handler registration. Validation runs before
//! the handler's circuit breaker is consulted; the remaining stages run
//! inside it, so timeouts and exhausted retries count toward the breaker's
//! statistics while malformed payloads do not.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use serde_json::Value;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

use crate::domain::errors::{RuntimeError, RuntimeResult};
use crate::domain::models::config::{BackpressurePolicy, RetryConfig, ValidationMode};
use crate::domain::models::event::Event;
use crate::domain::ports::clock::Clock;
use crate::domain::ports::handler::{CallContext, EventHandler};

/// Exponential backoff with jitter, capped at `max_delay`.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Cap applied before jitter.
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Uniform perturbation, as a fraction of the nominal delay.
    pub jitter_ratio: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    /// Policy from the `retry` config section.
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.base_retry_delay_ms),
            max_delay: Duration::from_millis(config.max_retry_delay_ms),
            backoff_multiplier: config.backoff_multiplier,
            jitter_ratio: config.jitter_ratio,
        }
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter_ratio = 0.0;
        self
    }

    /// `base_delay * backoff_multiplier^attempt`, capped at `max_delay`.
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.base_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs.max(0.0))
    }

    /// Jittered delay before retry number `attempt` (zero-based). Never
    /// exceeds `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let nominal = self.nominal_delay(attempt);
        if self.jitter_ratio <= 0.0 {
            return nominal;
        }
        let mut backoff = ExponentialBackoff {
            current_interval: nominal,
            initial_interval: nominal,
            randomization_factor: self.jitter_ratio.min(1.0),
            multiplier: self.backoff_multiplier,
            max_interval: self.max_delay,
            max_elapsed_time: None,
            ..ExponentialBackoff::default()
        };
        backoff
            .next_backoff()
            .unwrap_or(nominal)
            .min(self.max_delay)
    }
}

/// Payload check run before the handler sees an event.
pub trait Validator: Send + Sync {
    fn validate(&self, event: &Event) -> Result<(), String>;
}

/// Requires the payload to be an object carrying the named fields.
#[derive(Debug, Clone, Default)]
pub struct PayloadSchema {
    required: Vec<String>,
}

impl PayloadSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Require `field` to be present and non-null.
    pub fn require(mut self, field: impl Into<String>) -> Self {
        self.required.push(field.into());
        self
    }
}

impl Validator for PayloadSchema {
    fn validate(&self, event: &Event) -> Result<(), String> {
        let Some(object) = event.data.as_object() else {
            return Err(format!("payload of {} must be an object", event.event_type));
        };
        let missing: Vec<&str> = self
            .required
            .iter()
            .filter(|field| object.get(field.as_str()).is_none_or(Value::is_null))
            .map(String::as_str)
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(format!("missing required fields: {}", missing.join(", ")))
        }
    }
}

/// Per-key cap on in-flight invocations.
#[derive(Debug)]
pub struct ConcurrencyLimiter {
    limit: usize,
    policy: BackpressurePolicy,
    semaphores: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl ConcurrencyLimiter {
    /// Allow `limit` concurrent calls per key. `policy` decides whether callers
    /// over the limit wait or fail with `CONCURRENCY_LIMIT`.
    pub fn new(limit: usize, policy: BackpressurePolicy) -> Self {
        Self {
            limit: limit.clamp(1, Semaphore::MAX_PERMITS),
            policy,
            semaphores: Mutex::new(HashMap::new()),
        }
    }

    fn semaphore(&self, key: &str) -> Arc<Semaphore> {
        let mut semaphores = self.semaphores.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            semaphores
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(self.limit))),
        )
    }

    pub async fn acquire(&self, key: &str) -> RuntimeResult<OwnedSemaphorePermit> {
        let semaphore = self.semaphore(key);
        let limit_reached = || RuntimeError::ConcurrencyLimitReached {
            key: key.to_string(),
            limit: self.limit,
        };
        match self.policy {
            BackpressurePolicy::Drop => semaphore.try_acquire_owned().map_err(|e| match e {
                TryAcquireError::NoPermits | TryAcquireError::Closed => limit_reached(),
            }),
            BackpressurePolicy::Wait => semaphore
                .acquire_owned()
                .await
                .map_err(|_| limit_reached()),
        }
    }

    pub fn in_flight(&self, key: &str) -> usize {
        self.limit - self.semaphore(key).available_permits()
    }
}

/// Middleware settings for one handler.
#[derive(Clone)]
pub struct PipelineConfig {
    /// Per-attempt deadline for the handler.
    pub timeout: Duration,
    /// In-place retries of transient failures. `None` leaves redelivery to
    /// the processor.
    pub retry: Option<RetryPolicy>,
    pub validator: Option<Arc<dyn Validator>>,
    pub validation_mode: ValidationMode,
    /// Shared limiter, keyed by handler name.
    pub concurrency: Option<Arc<ConcurrencyLimiter>>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(30_000),
            retry: None,
            validator: None,
            validation_mode: ValidationMode::Reject,
            concurrency: None,
        }
    }
}

impl PipelineConfig {
    pub fn from_config(config: &crate::domain::models::config::MiddlewareConfig) -> Self {
        Self {
            timeout: Duration::from_millis(config.timeout_ms),
            retry: None,
            validator: None,
            validation_mode: config.validation_mode,
            concurrency: config
                .concurrency_limit
                .map(|limit| Arc::new(ConcurrencyLimiter::new(limit, config.concurrency_policy))),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_validator(mut self, validator: Arc<dyn Validator>, mode: ValidationMode) -> Self {
        self.validator = Some(validator);
        self.validation_mode = mode;
        self
    }

    pub fn with_concurrency(mut self, limiter: Arc<ConcurrencyLimiter>) -> Self {
        self.concurrency = Some(limiter);
        self
    }
}

/// Middleware around one handler: validation, then timeout, retry and the
/// concurrency limit.
pub struct Pipeline {
    config: PipelineConfig,
    clock: Arc<dyn Clock>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, clock: Arc<dyn Clock>) -> Self {
        Self { config, clock }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Validate, then invoke. For callers that do not need the two stages
    /// apart.
    pub async fn run(
        &self,
        handler: &dyn EventHandler,
        event: &Event,
        ctx: &CallContext,
    ) -> RuntimeResult<Value> {
        if !self.admit(event)? {
            return Ok(Value::Null);
        }
        self.invoke(handler, event, ctx).await
    }

    /// Validation stage. `Ok(false)` means the event was dropped and the
    /// handler must not run.
    pub fn admit(&self, event: &Event) -> RuntimeResult<bool> {
        let Some(ref validator) = self.config.validator else {
            return Ok(true);
        };
        let Err(reason) = validator.validate(event) else {
            return Ok(true);
        };
        match self.config.validation_mode {
            ValidationMode::Reject => Err(RuntimeError::Validation(reason)),
            ValidationMode::Drop => {
                tracing::debug!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    %reason,
                    "Dropped invalid event"
                );
                Ok(false)
            }
        }
    }

    /// Timeout, retry and concurrency stages around an already validated
    /// event.
    pub async fn invoke(
        &self,
        handler: &dyn EventHandler,
        event: &Event,
        ctx: &CallContext,
    ) -> RuntimeResult<Value> {
        match tokio::time::timeout(self.config.timeout, self.with_retry(handler, event, ctx)).await {
            Ok(result) => result,
            Err(_) => Err(RuntimeError::TimeoutExceeded {
                operation: handler.name().to_string(),
                timeout_ms: u64::try_from(self.config.timeout.as_millis()).unwrap_or(u64::MAX),
            }),
        }
    }

    async fn with_retry(
        &self,
        handler: &dyn EventHandler,
        event: &Event,
        ctx: &CallContext,
    ) -> RuntimeResult<Value> {
        let Some(ref policy) = self.config.retry else {
            return self.limited(handler, event, ctx).await;
        };

        let mut attempt = 0u32;
        loop {
            match self.limited(handler, event, ctx).await {
                Ok(value) => return Ok(value),
                Err(err) if !err.is_transient() => return Err(err),
                Err(err) if attempt >= policy.max_retries => {
                    return Err(RuntimeError::RetryExhausted {
                        attempts: attempt + 1,
                        last_error: err.describe(),
                    });
                }
                Err(err) => {
                    let delay = policy.delay_for(attempt);
                    tracing::debug!(
                        handler = handler.name(),
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %err,
                        "Retrying transient failure"
                    );
                    self.clock.sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn limited(
        &self,
        handler: &dyn EventHandler,
        event: &Event,
        ctx: &CallContext,
    ) -> RuntimeResult<Value> {
        match self.config.concurrency {
            Some(ref limiter) => {
                let _permit = limiter.acquire(&ctx.resource).await?;
                handler.handle(event, ctx).await
            }
            None => handler.handle(event, ctx).await,
        }
    }
}
