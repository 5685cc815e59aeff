pub mod circuit;
pub mod config;
pub mod dead_letter;
pub mod event;
pub mod pattern;

pub use circuit::{
    CircuitBreakerConfig, CircuitBreakerOverrides, CircuitMetrics, CircuitState,
    CircuitStateChanged, HealthStatus, StateChange,
};
pub use config::{
    BackpressurePolicy, Config, DatabaseConfig, DeadLetterConfig, LoggingConfig,
    MiddlewareConfig, ProcessorConfig, QueueConfig, RetryConfig, ValidationMode,
};
pub use dead_letter::{DeadLetterAlert, DeadLetterFilter, DeadLetterItem, FailureRecord};
pub use event::{Event, EventId, Priority, QueueItem, QueueReceipt};
pub use pattern::NamePattern;
