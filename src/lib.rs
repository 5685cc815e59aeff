//! Bulwark - fault-tolerant event processing runtime
//!
//! Events flow through a bounded priority queue into a processor that runs
//! each handler behind a circuit breaker and a middleware pipeline. Failures
//! are redelivered with exponential backoff and, once exhausted, parked in a
//! dead letter queue. Critical events are persisted until acknowledged so a
//! restart redelivers them.
//!
//! # Architecture
//!
//! - **Domain Layer** (`domain`): models, error taxonomy and port traits
//! - **Service Layer** (`services`): queues, breakers, fallbacks, middleware, processor
//! - **Adapters** (`adapters`): SQLite and in-memory stores
//! - **Application Layer** (`application`): the [`EventRuntime`] composition root
//! - **Infrastructure Layer** (`infrastructure`): configuration and logging
//! - **CLI Layer** (`cli`): operator commands
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use bulwark::{Config, Event, EventRuntime, HandlerOptions};
//! use bulwark::domain::ports::handler::handler_fn;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let runtime = EventRuntime::open(Config::default()).await?;
//!     runtime.register_handler(
//!         "agent.*",
//!         Arc::new(handler_fn("agent", |event| async move { Ok(event.data) })),
//!         HandlerOptions::new(),
//!     );
//!     runtime.init().await?;
//!     runtime.start().await;
//!     runtime.publish(Event::new("agent.start", "thread-1", serde_json::json!({})), None).await?;
//!     runtime.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod adapters;
pub mod application;
pub mod cli;
pub mod domain;
pub mod infrastructure;
pub mod services;

pub use application::{EventRuntime, InitReport};
pub use domain::errors::{ErrorCode, RuntimeError, RuntimeResult, StoreError};
pub use domain::models::{
    CircuitBreakerConfig, CircuitMetrics, CircuitState, Config, DeadLetterItem, Event, EventId,
    HealthStatus, Priority, QueueItem,
};
pub use domain::ports::{Clock, EventHandler, EventQueueService, Fallback};
pub use infrastructure::config::{ConfigError, ConfigLoader};
pub use services::{
    CircuitBreaker, CircuitBreakerManager, DeadLetterQueue, DurableEventQueue, EventProcessor,
    EventQueue, FallbackRegistry, HandlerOptions, ResilientCaller,
};
