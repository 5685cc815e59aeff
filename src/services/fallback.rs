//! Fallback strategies and the pattern-keyed registry that selects them.
//!
//! [`ResilientCaller`] runs a call through the breaker manager and, when the
//! breaker rejects it, serves the most specific registered strategy.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde_json::Value;

use crate::domain::errors::{RuntimeError, RuntimeResult};
use crate::domain::models::pattern::{best_match, NamePattern};
use crate::domain::ports::clock::{elapsed_between, Clock};
use crate::domain::ports::fallback::Fallback;
use crate::domain::ports::handler::CallContext;

use super::circuit_breaker_manager::CircuitBreakerManager;

/// Answer with a fixed value.
#[derive(Debug, Clone)]
pub struct DefaultMessage {
    value: Value,
}

impl DefaultMessage {
    pub fn new(value: Value) -> Self {
        Self { value }
    }

    /// A fixed string answer.
    pub fn text(message: impl Into<String>) -> Self {
        Self::new(Value::String(message.into()))
    }
}

#[async_trait]
impl Fallback for DefaultMessage {
    fn strategy(&self) -> &'static str {
        "default_message"
    }

    async fn invoke(&self, _cause: &RuntimeError, _ctx: &CallContext) -> RuntimeResult<Value> {
        Ok(self.value.clone())
    }
}

/// Answer with the last successful result for the call's cache key.
#[derive(Debug)]
pub struct CachedValue {
    clock: Arc<dyn Clock>,
    ttl: Option<Duration>,
    entries: Mutex<HashMap<String, (Value, DateTime<Utc>)>>,
}

impl CachedValue {
    /// Create an empty cache without expiry.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            ttl: None,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Ignore cached values older than `ttl`.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn store(&self, key: impl Into<String>, value: Value) {
        let now = self.clock.now();
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.into(), (value, now));
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let (value, stored_at) = entries.get(key)?;
        match self.ttl {
            Some(ttl) if elapsed_between(*stored_at, self.clock.now()) > ttl => None,
            _ => Some(value.clone()),
        }
    }
}

#[async_trait]
impl Fallback for CachedValue {
    fn strategy(&self) -> &'static str {
        "cached_value"
    }

    async fn invoke(&self, _cause: &RuntimeError, ctx: &CallContext) -> RuntimeResult<Value> {
        self.get(ctx.cache_key())
            .ok_or_else(|| RuntimeError::FallbackFailed {
                resource: ctx.resource.clone(),
                reason: format!("no cached value for {}", ctx.cache_key()),
            })
    }

    fn observe_success(&self, ctx: &CallContext, value: &Value) {
        self.store(ctx.cache_key(), value.clone());
    }
}

type AlternateCall = dyn Fn(CallContext) -> BoxFuture<'static, RuntimeResult<Value>> + Send + Sync;

/// Route the call to another resource, guarded by that resource's breaker.
pub struct AlternateResource {
    target: String,
    breakers: Arc<CircuitBreakerManager>,
    call: Arc<AlternateCall>,
}

impl AlternateResource {
    /// Send failed calls to `target` through `call`, under the breaker named
    /// `target`.
    pub fn new<F>(target: impl Into<String>, breakers: Arc<CircuitBreakerManager>, call: F) -> Self
    where
        F: Fn(CallContext) -> BoxFuture<'static, RuntimeResult<Value>> + Send + Sync + 'static,
    {
        Self {
            target: target.into(),
            breakers,
            call: Arc::new(call),
        }
    }
}

impl std::fmt::Debug for AlternateResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlternateResource")
            .field("target", &self.target)
            .finish()
    }
}

#[async_trait]
impl Fallback for AlternateResource {
    fn strategy(&self) -> &'static str {
        "alternate_resource"
    }

    async fn invoke(&self, _cause: &RuntimeError, ctx: &CallContext) -> RuntimeResult<Value> {
        let alternate_ctx = CallContext {
            resource: self.target.clone(),
            ..ctx.clone()
        };
        let call = Arc::clone(&self.call);
        let forwarded = alternate_ctx.clone();
        self.breakers
            .execute_with_breaker(&self.target, &alternate_ctx, move || call(forwarded))
            .await
    }
}

/// Fallback strategies keyed by resource name pattern.
#[derive(Default)]
pub struct FallbackRegistry {
    entries: RwLock<Vec<(NamePattern, Arc<dyn Fallback>)>>,
}

impl FallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a strategy, replacing any previous one for the same pattern.
    pub fn register(&self, pattern: impl Into<NamePattern>, fallback: Arc<dyn Fallback>) {
        let pattern = pattern.into();
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.retain(|(existing, _)| *existing != pattern);
        tracing::debug!(%pattern, strategy = fallback.strategy(), "Registered fallback");
        entries.push((pattern, fallback));
    }

    pub fn unregister(&self, pattern: impl Into<NamePattern>) -> bool {
        let pattern = pattern.into();
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|(existing, _)| *existing != pattern);
        entries.len() != before
    }

    /// Most specific strategy for `resource`: exact name, then longest prefix.
    pub fn resolve(&self, resource: &str) -> Option<Arc<dyn Fallback>> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        best_match(entries.iter(), resource).cloned()
    }

    pub fn patterns(&self) -> Vec<NamePattern> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(pattern, _)| pattern.clone())
            .collect()
    }
}

/// Breaker-guarded calls with registry fallbacks on `CIRCUIT_OPEN`.
#[derive(Clone)]
pub struct ResilientCaller {
    breakers: Arc<CircuitBreakerManager>,
    fallbacks: Arc<FallbackRegistry>,
}

impl ResilientCaller {
    /// Caller backed by `breakers`, falling back through `fallbacks`.
    pub fn new(breakers: Arc<CircuitBreakerManager>, fallbacks: Arc<FallbackRegistry>) -> Self {
        Self {
            breakers,
            fallbacks,
        }
    }

    pub async fn call<F, Fut>(&self, ctx: &CallContext, f: F) -> RuntimeResult<Value>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = RuntimeResult<Value>>,
    {
        let resource = ctx.resource.as_str();
        let fallback = self.fallbacks.resolve(resource);

        match self.breakers.execute_with_breaker(resource, ctx, f).await {
            Ok(value) => {
                if let Some(ref fallback) = fallback {
                    fallback.observe_success(ctx, &value);
                }
                Ok(value)
            }
            Err(err @ RuntimeError::CircuitOpen { .. }) => {
                let Some(fallback) = fallback else {
                    return Err(err);
                };
                tracing::info!(
                    resource,
                    strategy = fallback.strategy(),
                    "Circuit open, serving fallback"
                );
                fallback.invoke(&err, ctx).await.map_err(|e| match e {
                    failed @ RuntimeError::FallbackFailed { .. } => failed,
                    other => RuntimeError::FallbackFailed {
                        resource: resource.to_string(),
                        reason: other.to_string(),
                    },
                })
            }
            Err(err) => Err(err),
        }
    }
}
