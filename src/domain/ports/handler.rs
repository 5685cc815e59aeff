use std::future::Future;
use std::marker::PhantomData;

use async_trait::async_trait;
use serde_json::Value;

use crate::domain::errors::RuntimeError;
use crate::domain::models::event::{Event, EventId};

/// Context passed alongside every guarded invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallContext {
    /// Breaker / resource name the call is attributed to (`tool:search`).
    pub resource: String,
    pub event_id: Option<EventId>,
    pub thread_id: Option<String>,
    /// Key for cached-value fallbacks; defaults to the resource name.
    pub cache_key: Option<String>,
}

impl CallContext {
    pub fn new(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            ..Default::default()
        }
    }

    /// Context for handling `event`, attributed to `resource`.
    pub fn for_event(resource: impl Into<String>, event: &Event) -> Self {
        Self {
            resource: resource.into(),
            event_id: Some(event.id),
            thread_id: Some(event.thread_id.clone()),
            cache_key: None,
        }
    }

    pub fn with_cache_key(mut self, key: impl Into<String>) -> Self {
        self.cache_key = Some(key.into());
        self
    }

    pub fn cache_key(&self) -> &str {
        self.cache_key.as_deref().unwrap_or(&self.resource)
    }
}

/// Port for event handlers dispatched by the processor.
#[async_trait]
pub trait EventHandler: Send + Sync {
    fn name(&self) -> &str;

    async fn handle(&self, event: &Event, ctx: &CallContext) -> Result<Value, RuntimeError>;
}

/// Adapts an async closure into an [`EventHandler`].
pub struct FnHandler<F, Fut> {
    name: String,
    f: F,
    _marker: PhantomData<fn() -> Fut>,
}

/// Build a handler from a closure taking an owned event.
pub fn handler_fn<F, Fut>(name: impl Into<String>, f: F) -> FnHandler<F, Fut>
where
    F: Fn(Event) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, RuntimeError>> + Send,
{
    FnHandler {
        name: name.into(),
        f,
        _marker: PhantomData,
    }
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F, Fut>
where
    F: Fn(Event) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, RuntimeError>> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, event: &Event, _ctx: &CallContext) -> Result<Value, RuntimeError> {
        (self.f)(event.clone()).await
    }
}
