//! Administrative operations over the circuit breakers.
//!
//! Reachable directly or by dispatching `circuit.status`, `circuit.reset`,
//! `circuit.forceOpen` and `circuit.forceClosed` events whose payload
//! carries `{breakerName?, reason?}`.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::errors::{RuntimeError, RuntimeResult};
use crate::domain::models::circuit::{CircuitMetrics, CircuitState, HealthStatus};
use crate::domain::models::event::Event;
use crate::domain::ports::handler::{CallContext, EventHandler};

use super::circuit_breaker_manager::CircuitBreakerManager;

/// Event type prefix routed to the control service.
pub const CONTROL_EVENT_PREFIX: &str = "circuit.";

/// Operator command carried by a `circuit.*` event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    Status { breaker: Option<String> },
    Reset { breaker: Option<String> },
    ForceOpen { breaker: String, reason: Option<String> },
    ForceClosed { breaker: String, reason: Option<String> },
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ControlPayload {
    breaker_name: Option<String>,
    reason: Option<String>,
}

impl ControlCommand {
    /// Parse a control command from a `circuit.*` event.
    pub fn from_event(event: &Event) -> RuntimeResult<Self> {
        let payload: ControlPayload = if event.data.is_null() {
            ControlPayload::default()
        } else {
            serde_json::from_value(event.data.clone()).map_err(|e| {
                RuntimeError::validation(format!("invalid control payload: {e}"))
            })?
        };

        let operation = event
            .event_type
            .strip_prefix(CONTROL_EVENT_PREFIX)
            .unwrap_or(&event.event_type);
        let required = |name: Option<String>| {
            name.ok_or_else(|| {
                RuntimeError::validation(format!("{} requires breakerName", event.event_type))
            })
        };

        match operation {
            "status" => Ok(Self::Status {
                breaker: payload.breaker_name,
            }),
            "reset" => Ok(Self::Reset {
                breaker: payload.breaker_name,
            }),
            "forceOpen" => Ok(Self::ForceOpen {
                breaker: required(payload.breaker_name)?,
                reason: payload.reason,
            }),
            "forceClosed" => Ok(Self::ForceClosed {
                breaker: required(payload.breaker_name)?,
                reason: payload.reason,
            }),
            other => Err(RuntimeError::validation(format!(
                "unknown control operation: {other}"
            ))),
        }
    }
}

/// Reply to a [`ControlCommand`], serialized as the handler result.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum ControlResponse {
    #[serde(rename_all = "camelCase")]
    Breaker {
        breaker_name: String,
        state: CircuitState,
        metrics: CircuitMetrics,
    },
    Health(HealthStatus),
    Reset {
        reset: Vec<String>,
    },
}

/// Executes control commands against a [`CircuitBreakerManager`].
pub struct ControlService {
    breakers: Arc<CircuitBreakerManager>,
}

impl ControlService {
    pub fn new(breakers: Arc<CircuitBreakerManager>) -> Self {
        Self { breakers }
    }

    fn breaker_response(name: &str, metrics: CircuitMetrics) -> ControlResponse {
        ControlResponse::Breaker {
            breaker_name: name.to_string(),
            state: metrics.state,
            metrics,
        }
    }

    /// State and metrics of one breaker, or overall health when `breaker`
    /// is `None`. An unknown breaker name is `NOT_FOUND`.
    pub async fn status(&self, breaker: Option<&str>) -> RuntimeResult<ControlResponse> {
        match breaker {
            Some(name) => {
                let breaker = self
                    .breakers
                    .find(name)
                    .await
                    .ok_or_else(|| RuntimeError::not_found("circuit breaker", name))?;
                Ok(Self::breaker_response(name, breaker.metrics()))
            }
            None => Ok(ControlResponse::Health(self.breakers.health().await)),
        }
    }

    /// Reset one breaker, or all of them. Reports the names that were reset.
    pub async fn reset(&self, breaker: Option<&str>) -> RuntimeResult<ControlResponse> {
        let reset = match breaker {
            Some(name) => {
                self.breakers.reset_breaker(name).await?;
                vec![name.to_string()]
            }
            None => {
                self.breakers.reset_all().await;
                self.breakers.names().await
            }
        };
        Ok(ControlResponse::Reset { reset })
    }

    /// Hold `breaker` open until a reset or forced close.
    pub async fn force_open(&self, breaker: &str, reason: Option<&str>) -> ControlResponse {
        let metrics = self
            .breakers
            .force_open(breaker, reason.unwrap_or("operator request"))
            .await;
        Self::breaker_response(breaker, metrics)
    }

    pub async fn force_closed(&self, breaker: &str, reason: Option<&str>) -> ControlResponse {
        let metrics = self
            .breakers
            .force_closed(breaker, reason.unwrap_or("operator request"))
            .await;
        Self::breaker_response(breaker, metrics)
    }

    /// Run a parsed command.
    pub async fn execute(&self, command: ControlCommand) -> RuntimeResult<ControlResponse> {
        tracing::info!(command = ?command, "Control command");
        match command {
            ControlCommand::Status { breaker } => self.status(breaker.as_deref()).await,
            ControlCommand::Reset { breaker } => self.reset(breaker.as_deref()).await,
            ControlCommand::ForceOpen { breaker, reason } => {
                Ok(self.force_open(&breaker, reason.as_deref()).await)
            }
            ControlCommand::ForceClosed { breaker, reason } => {
                Ok(self.force_closed(&breaker, reason.as_deref()).await)
            }
        }
    }
}

#[async_trait]
impl EventHandler for ControlService {
    fn name(&self) -> &str {
        "control"
    }

    async fn handle(&self, event: &Event, _ctx: &CallContext) -> Result<Value, RuntimeError> {
        let command = ControlCommand::from_event(event)?;
        let response = self.execute(command).await?;
        serde_json::to_value(response).map_err(|e| RuntimeError::handler(e.to_string()))
    }
}
