use async_trait::async_trait;
use serde_json::Value;

use super::handler::CallContext;
use crate::domain::errors::RuntimeError;

/// Capability invoked in place of a rejected or failed call.
///
/// `cause` is the error that triggered the fallback, normally
/// [`RuntimeError::CircuitOpen`].
#[async_trait]
pub trait Fallback: Send + Sync + std::fmt::Debug {
    /// Short strategy name used in logs.
    fn strategy(&self) -> &'static str;

    async fn invoke(&self, cause: &RuntimeError, ctx: &CallContext) -> Result<Value, RuntimeError>;

    /// Called with every successful result of the guarded resource.
    fn observe_success(&self, _ctx: &CallContext, _value: &Value) {}
}
