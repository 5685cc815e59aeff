pub mod circuit_breaker;
pub mod circuit_breaker_manager;
pub mod control;
pub mod dead_letter_queue;
pub mod durable_queue;
pub mod event_processor;
pub mod event_queue;
pub mod fallback;
pub mod middleware;

pub use circuit_breaker::CircuitBreaker;
pub use circuit_breaker_manager::CircuitBreakerManager;
pub use control::{ControlCommand, ControlResponse, ControlService, CONTROL_EVENT_PREFIX};
pub use dead_letter_queue::{DeadLetterQueue, DeadLetterQueueConfig, DeadLetterStats};
pub use durable_queue::{DurableEventQueue, RecoveryReport};
pub use event_processor::{
    BatchReport, EventProcessor, EventProcessorConfig, HandlerOptions, ItemOutcome,
    ProcessorStats,
};
pub use event_queue::{EventQueue, EventQueueConfig};
pub use fallback::{AlternateResource, CachedValue, DefaultMessage, FallbackRegistry, ResilientCaller};
pub use middleware::{
    ConcurrencyLimiter, PayloadSchema, Pipeline, PipelineConfig, RetryPolicy, Validator,
};
