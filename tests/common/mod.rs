//! Common test utilities for integration tests
//!
//! Shared fixtures for building queues, breakers and processors on a
//! manual clock, plus scripted handlers.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tempfile::TempDir;

use bulwark::domain::models::circuit::CircuitBreakerConfig;
use bulwark::domain::ports::clock::ManualClock;
use bulwark::domain::ports::handler::{handler_fn, EventHandler};
use bulwark::services::{
    CircuitBreakerManager, DeadLetterQueue, DeadLetterQueueConfig, EventProcessor,
    EventProcessorConfig, EventQueue, EventQueueConfig, RetryPolicy,
};
use bulwark::{EventQueueService, RuntimeError};

/// Create a temporary test database
///
/// Returns the path to a SQLite database file in a temporary directory.
/// The TempDir must be kept alive for the duration of the test.
pub fn temp_db_path() -> (TempDir, PathBuf) {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let db_path = dir.path().join("bulwark.db");
    (dir, db_path)
}

/// Setup test logging
///
/// Initializes a tracing subscriber writing to the test harness.
pub fn setup_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// Breaker config that trips only on consecutive failures.
pub fn threshold_breaker(failure_threshold: u32) -> CircuitBreakerConfig {
    CircuitBreakerConfig {
        failure_threshold,
        request_volume_threshold: 1,
        ..CircuitBreakerConfig::default()
    }
    .without_rate_tripping()
}

/// Retry schedule of 100ms, 200ms, 400ms... capped at 1s, without jitter.
pub fn fast_retry(max_retries: u32) -> RetryPolicy {
    RetryPolicy {
        max_retries,
        base_delay: Duration::from_millis(100),
        max_delay: Duration::from_secs(1),
        backoff_multiplier: 2.0,
        jitter_ratio: 0.0,
    }
}

/// A processor wired to an in-memory queue and DLQ on a manual clock.
pub struct Pipeline {
    pub clock: Arc<ManualClock>,
    pub queue: Arc<EventQueue>,
    pub dlq: Arc<DeadLetterQueue>,
    pub breakers: Arc<CircuitBreakerManager>,
    pub processor: Arc<EventProcessor>,
}

pub fn pipeline(max_retries: u32, breaker: CircuitBreakerConfig) -> Pipeline {
    let clock = Arc::new(ManualClock::new());
    let queue = Arc::new(EventQueue::new(
        EventQueueConfig::default().with_max_retries(max_retries),
        clock.clone(),
    ));
    let dlq = Arc::new(DeadLetterQueue::new(
        DeadLetterQueueConfig::default(),
        clock.clone(),
    ));
    let breakers = Arc::new(CircuitBreakerManager::new(breaker, clock.clone()));
    let processor = Arc::new(EventProcessor::new(
        EventProcessorConfig {
            retry: fast_retry(max_retries),
            poll_interval: Duration::from_millis(10),
            ..EventProcessorConfig::default()
        },
        queue.clone() as Arc<dyn EventQueueService>,
        dlq.clone(),
        breakers.clone(),
        clock.clone(),
    ));
    Pipeline {
        clock,
        queue,
        dlq,
        breakers,
        processor,
    }
}

/// Handler that fails its first `failures` calls, then succeeds. Returns
/// the handler and its call counter.
pub fn flaky_handler(name: &str, failures: u32) -> (Arc<dyn EventHandler>, Arc<AtomicU32>) {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let handler: Arc<dyn EventHandler> = Arc::new(handler_fn(name, move |event| {
        let counter = counter.clone();
        async move {
            let call = counter.fetch_add(1, Ordering::SeqCst);
            if call < failures {
                Err(RuntimeError::handler(format!("failure {}", call + 1)))
            } else {
                Ok::<Value, RuntimeError>(json!({ "handled": event.event_type }))
            }
        }
    }));
    (handler, calls)
}

/// Handler that always fails with a transient error.
pub fn failing_handler(name: &str) -> (Arc<dyn EventHandler>, Arc<AtomicU32>) {
    flaky_handler(name, u32::MAX)
}
