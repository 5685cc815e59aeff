//! Error taxonomy for the Bulwark runtime.

use std::time::Duration;

use thiserror::Error;

use super::models::circuit::{CircuitMetrics, CircuitState};

/// Stable machine-readable error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    TimeoutExceeded,
    ValidationError,
    CircuitOpen,
    QueueFull,
    RetryExhausted,
    PersistenceFailure,
    HandlerFailed,
    NoHandler,
    QueueClosed,
    NotFound,
    FallbackFailed,
    ConcurrencyLimitReached,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TimeoutExceeded => "TIMEOUT_EXCEEDED",
            Self::ValidationError => "VALIDATION_ERROR",
            Self::CircuitOpen => "CIRCUIT_OPEN",
            Self::QueueFull => "QUEUE_FULL",
            Self::RetryExhausted => "RETRY_EXHAUSTED",
            Self::PersistenceFailure => "PERSISTENCE_FAILURE",
            Self::HandlerFailed => "HANDLER_FAILED",
            Self::NoHandler => "NO_HANDLER",
            Self::QueueClosed => "QUEUE_CLOSED",
            Self::NotFound => "NOT_FOUND",
            Self::FallbackFailed => "FALLBACK_FAILED",
            Self::ConcurrencyLimitReached => "CONCURRENCY_LIMIT",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors surfaced by the queue, breaker, middleware and processor.
#[derive(Debug, Clone, Error)]
pub enum RuntimeError {
    #[error("{operation} exceeded timeout of {timeout_ms}ms")]
    TimeoutExceeded { operation: String, timeout_ms: u64 },

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Circuit breaker {breaker} is {state}")]
    CircuitOpen {
        breaker: String,
        state: CircuitState,
        /// Time left until the breaker will admit a probe.
        retry_after: Option<Duration>,
        metrics: Box<CircuitMetrics>,
    },

    #[error("Queue full: depth {depth} reached limit {max_depth}")]
    QueueFull { depth: usize, max_depth: usize },

    #[error("Concurrency limit {limit} reached for {key}")]
    ConcurrencyLimitReached { key: String, limit: usize },

    #[error("Retries exhausted after {attempts} attempts: {last_error}")]
    RetryExhausted { attempts: u32, last_error: String },

    #[error("Persistence failure: {0}")]
    Persistence(String),

    #[error("Handler failed: {0}")]
    Handler(String),

    #[error("No handler registered for event type {0}")]
    NoHandler(String),

    #[error("Queue is closed")]
    QueueClosed,

    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    #[error("Fallback for {resource} failed: {reason}")]
    FallbackFailed { resource: String, reason: String },
}

/// Result alias for runtime operations.
pub type RuntimeResult<T> = Result<T, RuntimeError>;

impl RuntimeError {
    pub fn handler(message: impl Into<String>) -> Self {
        Self::Handler(message.into())
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn not_found(entity: impl Into<String>, id: impl ToString) -> Self {
        Self::NotFound {
            entity: entity.into(),
            id: id.to_string(),
        }
    }

    /// Stable code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::TimeoutExceeded { .. } => ErrorCode::TimeoutExceeded,
            Self::Validation(_) => ErrorCode::ValidationError,
            Self::CircuitOpen { .. } => ErrorCode::CircuitOpen,
            Self::QueueFull { .. } => ErrorCode::QueueFull,
            Self::ConcurrencyLimitReached { .. } => ErrorCode::ConcurrencyLimitReached,
            Self::RetryExhausted { .. } => ErrorCode::RetryExhausted,
            Self::Persistence(_) => ErrorCode::PersistenceFailure,
            Self::Handler(_) => ErrorCode::HandlerFailed,
            Self::NoHandler(_) => ErrorCode::NoHandler,
            Self::QueueClosed => ErrorCode::QueueClosed,
            Self::NotFound { .. } => ErrorCode::NotFound,
            Self::FallbackFailed { .. } => ErrorCode::FallbackFailed,
        }
    }

    /// Failures worth retrying in place, inside a single delivery.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TimeoutExceeded { .. } | Self::Handler(_))
    }

    /// Failures after which the event may be redelivered later.
    pub fn is_retryable(&self) -> bool {
        self.is_transient()
            || matches!(
                self,
                Self::CircuitOpen { .. } | Self::ConcurrencyLimitReached { .. }
            )
    }

    /// Refusals raised before the guarded resource did any work. Breakers
    /// count these as neither success nor failure.
    pub fn is_caller_side(&self) -> bool {
        matches!(
            self,
            Self::Validation(_) | Self::ConcurrencyLimitReached { .. }
        )
    }

    /// Minimum wait before another delivery makes sense.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::CircuitOpen { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// `CODE: message`, the form recorded in failure histories.
    pub fn describe(&self) -> String {
        format!("{}: {}", self.code(), self)
    }
}

/// Errors from the persistence ports.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Database(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

impl From<StoreError> for RuntimeError {
    fn from(err: StoreError) -> Self {
        RuntimeError::Persistence(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes() {
        assert_eq!(
            RuntimeError::QueueFull {
                depth: 5,
                max_depth: 5
            }
            .code()
            .as_str(),
            "QUEUE_FULL"
        );
        assert_eq!(RuntimeError::QueueClosed.code(), ErrorCode::QueueClosed);
        assert_eq!(
            RuntimeError::Persistence("disk".into()).code().as_str(),
            "PERSISTENCE_FAILURE"
        );
    }

    #[test]
    fn test_retry_classification() {
        assert!(RuntimeError::handler("boom").is_transient());
        assert!(RuntimeError::TimeoutExceeded {
            operation: "handler".into(),
            timeout_ms: 10
        }
        .is_transient());
        assert!(!RuntimeError::validation("bad").is_retryable());
        assert!(!RuntimeError::NoHandler("x".into()).is_retryable());

        let open = RuntimeError::CircuitOpen {
            breaker: "tool:search".into(),
            state: CircuitState::Open,
            retry_after: Some(Duration::from_secs(3)),
            metrics: Box::default(),
        };
        assert!(!open.is_transient());
        assert!(open.is_retryable());
        assert_eq!(open.retry_after(), Some(Duration::from_secs(3)));
    }

    #[test]
    fn test_describe_prefixes_code() {
        let err = RuntimeError::validation("missing field `agent`");
        assert_eq!(
            err.describe(),
            "VALIDATION_ERROR: Validation failed: missing field `agent`"
        );
    }

    #[test]
    fn test_store_error_converts_to_persistence() {
        let err: RuntimeError = StoreError::Unavailable("locked".into()).into();
        assert_eq!(err.code(), ErrorCode::PersistenceFailure);
    }
}
