//! Registry of circuit breakers keyed by resource name.
//!
//! Breakers are created lazily on first use with the manager defaults merged
//! with any per-resource overrides. Creation is idempotent: later overrides
//! for an existing breaker are ignored.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use tokio::sync::{mpsc, RwLock};

use crate::domain::errors::{RuntimeError, RuntimeResult};
use crate::domain::models::circuit::{
    CircuitBreakerConfig, CircuitBreakerOverrides, CircuitMetrics, CircuitStateChanged,
    HealthStatus,
};
use crate::domain::ports::clock::Clock;
use crate::domain::ports::handler::CallContext;

use super::circuit_breaker::CircuitBreaker;

/// Service for managing circuit breakers.
pub struct CircuitBreakerManager {
    defaults: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    event_sender: Option<mpsc::Sender<CircuitStateChanged>>,
}

impl CircuitBreakerManager {
    /// Create an empty manager. Breakers created later start from `defaults`.
    pub fn new(defaults: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            defaults,
            clock,
            breakers: RwLock::new(HashMap::new()),
            event_sender: None,
        }
    }

    /// Set the channel receiving state changes from every breaker created
    /// afterwards.
    pub fn with_event_sender(mut self, sender: mpsc::Sender<CircuitStateChanged>) -> Self {
        self.event_sender = Some(sender);
        self
    }

    pub fn defaults(&self) -> &CircuitBreakerConfig {
        &self.defaults
    }

    /// Get the breaker for `name`, creating it if needed.
    pub async fn get_breaker(
        &self,
        name: &str,
        overrides: Option<CircuitBreakerOverrides>,
    ) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.read().await.get(name) {
            return Arc::clone(existing);
        }

        let mut breakers = self.breakers.write().await;
        let breaker = breakers.entry(name.to_string()).or_insert_with(|| {
            let config = match overrides {
                Some(overrides) => overrides.apply(&self.defaults),
                None => self.defaults.clone(),
            };
            let mut breaker = CircuitBreaker::new(name, config, Arc::clone(&self.clock));
            if let Some(ref sender) = self.event_sender {
                breaker = breaker.with_event_sender(sender.clone());
            }
            tracing::debug!(breaker = name, "Created circuit breaker");
            Arc::new(breaker)
        });
        Arc::clone(breaker)
    }

    /// Existing breaker, without creating one.
    pub async fn find(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.read().await.get(name).cloned()
    }

    async fn require(&self, name: &str) -> RuntimeResult<Arc<CircuitBreaker>> {
        self.find(name)
            .await
            .ok_or_else(|| RuntimeError::not_found("circuit breaker", name))
    }

    /// Execute `f` under the breaker for `name`, creating it if needed.
    pub async fn execute_with_breaker<T, F, Fut>(
        &self,
        name: &str,
        ctx: &CallContext,
        f: F,
    ) -> RuntimeResult<T>
    where
        T: DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = RuntimeResult<T>>,
    {
        let breaker = self.get_breaker(name, None).await;
        breaker.execute(ctx, f).await
    }

    /// Sorted names of every registered breaker.
    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.breakers.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Metrics keyed by breaker name.
    pub async fn get_all_metrics(&self) -> BTreeMap<String, CircuitMetrics> {
        self.breakers
            .read()
            .await
            .iter()
            .map(|(name, breaker)| (name.clone(), breaker.metrics()))
            .collect()
    }

    /// Aggregate health; healthy when no breaker is open.
    pub async fn health(&self) -> HealthStatus {
        HealthStatus::from_metrics(self.get_all_metrics().await)
    }

    /// Reset one breaker to CLOSED with cleared counters.
    /// 
    /// Fails with `NOT_FOUND` for an unknown name.
    pub async fn reset_breaker(&self, name: &str) -> RuntimeResult<()> {
        self.require(name).await?.reset();
        tracing::info!(breaker = name, "Circuit breaker reset");
        Ok(())
    }

    /// Reset every registered breaker.
    pub async fn reset_all(&self) {
        let breakers = self.breakers.read().await;
        for breaker in breakers.values() {
            breaker.reset();
        }
        tracing::info!(count = breakers.len(), "All circuit breakers reset");
    }

    /// Manually open a breaker, creating it if needed.
    pub async fn force_open(&self, name: &str, reason: &str) -> CircuitMetrics {
        self.get_breaker(name, None).await.force_open(reason)
    }

    /// Manually close a breaker, creating it if needed.
    pub async fn force_closed(&self, name: &str, reason: &str) -> CircuitMetrics {
        self.get_breaker(name, None).await.force_closed(reason)
    }

    /// Drop a breaker. Returns whether it existed.
    pub async fn remove_breaker(&self, name: &str) -> bool {
        self.breakers.write().await.remove(name).is_some()
    }

    /// Drop every breaker.
    pub async fn dispose(&self) {
        let mut breakers = self.breakers.write().await;
        let count = breakers.len();
        breakers.clear();
        tracing::debug!(count, "Circuit breaker manager disposed");
    }
}
