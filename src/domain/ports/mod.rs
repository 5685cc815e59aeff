//! Port trait definitions (Hexagonal Architecture)
//!
//! This module defines the async trait interfaces the runtime depends on:
//! - Clock: injectable time source
//! - EventHandler: handlers dispatched by the processor
//! - Fallback: capability invoked when a guarded call is rejected
//! - EventQueueService: live queue, plain or durable
//! - PendingEventStore / DeadLetterStore: persistence adapters

pub mod clock;
pub mod event_queue;
pub mod fallback;
pub mod handler;
pub mod stores;

pub use clock::{Clock, ManualClock, SystemClock};
pub use event_queue::{EventQueueService, QueueStats};
pub use fallback::Fallback;
pub use handler::{handler_fn, CallContext, EventHandler, FnHandler};
pub use stores::{DeadLetterStore, PendingEventStore};
