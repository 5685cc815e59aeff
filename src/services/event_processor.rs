//! Event processor: dequeue, dispatch, retry or dead-letter.
//!
//! Batches are pulled from the queue and split into chunks. Chunks run one
//! after another; events inside a chunk are dispatched concurrently up to
//! `max_concurrent`. Every dispatch validates the event, then runs the rest
//! of the handler's middleware pipeline inside its circuit breaker. Failures either schedule a delayed redelivery
//! through `requeue` or park the event in the dead letter queue.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio::task::JoinHandle;

use crate::domain::errors::{RuntimeError, RuntimeResult};
use crate::domain::models::circuit::CircuitBreakerOverrides;
use crate::domain::models::config::Config;
use crate::domain::models::dead_letter::FailureRecord;
use crate::domain::models::event::{Event, QueueItem};
use crate::domain::models::pattern::{best_match, NamePattern};
use crate::domain::ports::clock::Clock;
use crate::domain::ports::event_queue::EventQueueService;
use crate::domain::ports::handler::{CallContext, EventHandler};

use super::circuit_breaker_manager::CircuitBreakerManager;
use super::dead_letter_queue::DeadLetterQueue;
use super::middleware::{Pipeline, PipelineConfig, RetryPolicy};

/// Configuration for the event processor.
#[derive(Debug, Clone)]
pub struct EventProcessorConfig {
    /// Items taken from the queue per batch.
    pub batch_size: usize,
    /// Items dispatched together within a batch.
    pub chunk_size: usize,
    /// Upper bound on concurrent dispatches in a chunk.
    pub max_concurrent: usize,
    /// How long the loop waits for events before re-checking shutdown.
    pub poll_interval: Duration,
    /// Redelivery schedule for failed events.
    pub retry: RetryPolicy,
}

impl Default for EventProcessorConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl EventProcessorConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            batch_size: config.processor.batch_size.max(1),
            chunk_size: config.processor.chunk_size.max(1),
            max_concurrent: config.processor.max_concurrent.max(1),
            poll_interval: Duration::from_millis(config.processor.poll_interval_ms),
            retry: RetryPolicy::from_config(&config.retry),
        }
    }
}

/// How a handler is guarded.
#[derive(Clone, Default)]
pub struct HandlerOptions {
    breaker: Option<String>,
    unguarded: bool,
    overrides: Option<CircuitBreakerOverrides>,
    pipeline: Option<PipelineConfig>,
}

impl HandlerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attribute calls to the named breaker instead of `handler:<name>`.
    pub fn breaker(mut self, name: impl Into<String>) -> Self {
        self.breaker = Some(name.into());
        self
    }

    pub fn breaker_overrides(mut self, overrides: CircuitBreakerOverrides) -> Self {
        self.overrides = Some(overrides);
        self
    }

    /// Dispatch without a circuit breaker.
    pub fn without_breaker(mut self) -> Self {
        self.unguarded = true;
        self
    }

    pub fn pipeline(mut self, config: PipelineConfig) -> Self {
        self.pipeline = Some(config);
        self
    }
}

struct Registration {
    handler: Arc<dyn EventHandler>,
    /// Breaker name; `None` for unguarded handlers.
    resource: Option<String>,
    overrides: Option<CircuitBreakerOverrides>,
    pipeline: Pipeline,
}

/// What happened to one dequeued event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemOutcome {
    Succeeded,
    RetryScheduled,
    DeadLettered,
    /// Dead-lettering failed; the event stays unacknowledged.
    Stranded,
}

/// Tally of one [`EventProcessor::process_batch`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchReport {
    pub dequeued: usize,
    pub succeeded: usize,
    pub retried: usize,
    pub dead_lettered: usize,
    pub stranded: usize,
}

impl BatchReport {
    fn record(&mut self, outcome: ItemOutcome) {
        match outcome {
            ItemOutcome::Succeeded => self.succeeded += 1,
            ItemOutcome::RetryScheduled => self.retried += 1,
            ItemOutcome::DeadLettered => self.dead_lettered += 1,
            ItemOutcome::Stranded => self.stranded += 1,
        }
    }
}

/// Cumulative processor counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessorStats {
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub stranded: u64,
    /// Redeliveries dropped because the queue closed first.
    pub abandoned: u64,
    /// Redeliveries currently waiting out their backoff.
    pub pending_retries: usize,
}

#[derive(Debug, Default)]
struct Counters {
    processed: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
    stranded: AtomicU64,
    abandoned: AtomicU64,
    pending_retries: AtomicUsize,
}

/// Shared pieces needed by detached retry tasks.
#[derive(Clone)]
struct Sink {
    queue: Arc<dyn EventQueueService>,
    dlq: Arc<DeadLetterQueue>,
    counters: Arc<Counters>,
}

impl Sink {
    async fn dead_letter(&self, item: &QueueItem, reason: String) -> ItemOutcome {
        match self.dlq.push_item(item, reason).await {
            Ok(_) => {
                if let Err(err) = self.queue.ack(item).await {
                    tracing::warn!(event_id = %item.id(), error = %err, "Failed to acknowledge dead-lettered event");
                }
                self.counters.dead_lettered.fetch_add(1, Ordering::Relaxed);
                ItemOutcome::DeadLettered
            }
            Err(err) => {
                tracing::error!(
                    event_id = %item.id(),
                    event_type = %item.event.event_type,
                    error = %err,
                    "Failed to dead-letter event, leaving it unacknowledged"
                );
                self.counters.stranded.fetch_add(1, Ordering::Relaxed);
                ItemOutcome::Stranded
            }
        }
    }
}

/// Dequeues events, routes them to registered handlers and decides what
/// happens to failures: redelivery with backoff or the dead-letter queue.
pub struct EventProcessor {
    config: EventProcessorConfig,
    default_pipeline: PipelineConfig,
    breakers: Arc<CircuitBreakerManager>,
    clock: Arc<dyn Clock>,
    registrations: RwLock<Vec<(NamePattern, Arc<Registration>)>>,
    sink: Sink,
    running: Arc<AtomicBool>,
}

impl EventProcessor {
    /// Create a processor with no handlers. Failed events go to `dlq` once
    /// their retry budget is spent.
    pub fn new(
        config: EventProcessorConfig,
        queue: Arc<dyn EventQueueService>,
        dlq: Arc<DeadLetterQueue>,
        breakers: Arc<CircuitBreakerManager>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            default_pipeline: PipelineConfig::default(),
            breakers,
            clock,
            registrations: RwLock::new(Vec::new()),
            sink: Sink {
                queue,
                dlq,
                counters: Arc::new(Counters::default()),
            },
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Pipeline settings for handlers registered without their own.
    pub fn with_default_pipeline(mut self, pipeline: PipelineConfig) -> Self {
        self.default_pipeline = pipeline;
        self
    }

    pub fn config(&self) -> &EventProcessorConfig {
        &self.config
    }

    /// Route event types matching `pattern` to `handler`. Re-registering a
    /// pattern replaces the previous handler.
    pub fn register(
        &self,
        pattern: impl Into<NamePattern>,
        handler: Arc<dyn EventHandler>,
        options: HandlerOptions,
    ) {
        let pattern = pattern.into();
        let resource = if options.unguarded {
            None
        } else {
            Some(
                options
                    .breaker
                    .unwrap_or_else(|| format!("handler:{}", handler.name())),
            )
        };
        let pipeline = Pipeline::new(
            options
                .pipeline
                .unwrap_or_else(|| self.default_pipeline.clone()),
            Arc::clone(&self.clock),
        );
        tracing::debug!(%pattern, handler = handler.name(), breaker = ?resource, "Registered handler");

        let registration = Arc::new(Registration {
            handler,
            resource,
            overrides: options.overrides,
            pipeline,
        });
        let mut registrations = self
            .registrations
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        registrations.retain(|(existing, _)| *existing != pattern);
        registrations.push((pattern, registration));
    }

    /// Remove the handler registered for `pattern`. Returns whether one existed.
    pub fn unregister(&self, pattern: impl Into<NamePattern>) -> bool {
        let pattern = pattern.into();
        let mut registrations = self
            .registrations
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = registrations.len();
        registrations.retain(|(existing, _)| *existing != pattern);
        registrations.len() != before
    }

    fn resolve(&self, event_type: &str) -> Option<Arc<Registration>> {
        let registrations = self
            .registrations
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        best_match(registrations.iter(), event_type).cloned()
    }

    /// Run one event through its handler, breaker and middleware, without
    /// touching the queue. Validation happens before the breaker is
    /// consulted, so malformed payloads never count against the resource.
    pub async fn dispatch(&self, event: &Event) -> RuntimeResult<serde_json::Value> {
        let registration = self
            .resolve(&event.event_type)
            .ok_or_else(|| RuntimeError::NoHandler(event.event_type.clone()))?;

        let pipeline = &registration.pipeline;
        if !pipeline.admit(event)? {
            return Ok(serde_json::Value::Null);
        }

        let Some(ref resource) = registration.resource else {
            let ctx = CallContext::for_event(registration.handler.name(), event);
            return pipeline
                .invoke(registration.handler.as_ref(), event, &ctx)
                .await;
        };

        let ctx = CallContext::for_event(resource.clone(), event);
        let breaker = self
            .breakers
            .get_breaker(resource, registration.overrides.clone())
            .await;
        breaker
            .execute(&ctx, || {
                pipeline.invoke(registration.handler.as_ref(), event, &ctx)
            })
            .await
    }

    async fn process_item(&self, item: QueueItem) -> ItemOutcome {
        let counters = &self.sink.counters;
        counters.processed.fetch_add(1, Ordering::Relaxed);

        match self.dispatch(&item.event).await {
            Ok(_) => {
                if let Err(err) = self.sink.queue.ack(&item).await {
                    tracing::warn!(event_id = %item.id(), error = %err, "Failed to acknowledge event");
                }
                counters.succeeded.fetch_add(1, Ordering::Relaxed);
                ItemOutcome::Succeeded
            }
            Err(err) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                self.handle_failure(item, err).await
            }
        }
    }

    async fn handle_failure(&self, mut item: QueueItem, err: RuntimeError) -> ItemOutcome {
        item.record_failure(FailureRecord::at(self.clock.now(), err.describe()));

        if !err.is_retryable() {
            tracing::warn!(
                event_id = %item.id(),
                event_type = %item.event.event_type,
                code = %err.code(),
                "Non-retryable failure"
            );
            return self.sink.dead_letter(&item, err.describe()).await;
        }

        if item.is_exhausted() {
            let exhausted = RuntimeError::RetryExhausted {
                attempts: item.attempts,
                last_error: err.describe(),
            };
            return self.sink.dead_letter(&item, exhausted.describe()).await;
        }

        let backoff = self
            .config
            .retry
            .delay_for(item.attempts.saturating_sub(1));
        let delay = err.retry_after().map_or(backoff, |after| after.max(backoff));
        self.schedule_retry(item, delay);
        ItemOutcome::RetryScheduled
    }

    fn schedule_retry(&self, item: QueueItem, delay: Duration) {
        let sink = self.sink.clone();
        let clock = Arc::clone(&self.clock);
        sink.counters.retried.fetch_add(1, Ordering::Relaxed);
        sink.counters.pending_retries.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(
            event_id = %item.id(),
            attempts = item.attempts,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "Scheduled redelivery"
        );

        tokio::spawn(async move {
            clock.sleep(delay).await;
            match sink.queue.requeue(item.clone()).await {
                Ok(()) => {}
                // Shutting down: leave the event unacknowledged so a
                // persisted copy is redelivered by the next recovery.
                Err(RuntimeError::QueueClosed) => {
                    sink.counters.abandoned.fetch_add(1, Ordering::Relaxed);
                    tracing::info!(
                        event_id = %item.id(),
                        event_type = %item.event.event_type,
                        attempts = item.attempts,
                        "Queue closed before redelivery, leaving event for recovery"
                    );
                }
                Err(err) => {
                    tracing::warn!(event_id = %item.id(), error = %err, "Redelivery rejected, dead-lettering");
                    sink.dead_letter(&item, err.describe()).await;
                }
            }
            sink.counters.pending_retries.fetch_sub(1, Ordering::SeqCst);
        });
    }

    /// Dequeue and process one batch.
    pub async fn process_batch(&self) -> BatchReport {
        let items = self.sink.queue.dequeue_batch(self.config.batch_size).await;
        let mut report = BatchReport {
            dequeued: items.len(),
            ..BatchReport::default()
        };

        let mut items = items.into_iter();
        loop {
            let chunk: Vec<QueueItem> = items.by_ref().take(self.config.chunk_size).collect();
            if chunk.is_empty() {
                break;
            }
            let outcomes: Vec<ItemOutcome> = stream::iter(chunk)
                .map(|item| self.process_item(item))
                .buffer_unordered(self.config.max_concurrent)
                .collect()
                .await;
            for outcome in outcomes {
                report.record(outcome);
            }
        }

        if report.dequeued > 0 {
            tracing::debug!(
                dequeued = report.dequeued,
                succeeded = report.succeeded,
                retried = report.retried,
                dead_lettered = report.dead_lettered,
                "Processed batch"
            );
        }
        report
    }

    /// Process until the queue is empty and no redelivery is pending.
    pub async fn run_until_idle(&self) {
        loop {
            self.process_batch().await;
            if self.sink.queue.is_empty() && self.pending_retries() == 0 {
                break;
            }
            if !self.sink.queue.wait_for_items(self.config.poll_interval).await {
                tokio::task::yield_now().await;
            }
        }
    }

    /// Start the processing loop.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        self.running.store(true, Ordering::SeqCst);
        let processor = Arc::clone(self);
        tracing::info!(
            batch_size = self.config.batch_size,
            chunk_size = self.config.chunk_size,
            max_concurrent = self.config.max_concurrent,
            "Event processor started"
        );

        tokio::spawn(async move {
            while processor.running.load(Ordering::SeqCst) {
                if !processor
                    .sink
                    .queue
                    .wait_for_items(processor.config.poll_interval)
                    .await
                {
                    continue;
                }
                processor.process_batch().await;
            }
            tracing::info!("Event processor stopped");
        })
    }

    /// Ask the loop to exit after the current batch.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn pending_retries(&self) -> usize {
        self.sink.counters.pending_retries.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> ProcessorStats {
        let c = &self.sink.counters;
        ProcessorStats {
            processed: c.processed.load(Ordering::Relaxed),
            succeeded: c.succeeded.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            retried: c.retried.load(Ordering::Relaxed),
            dead_lettered: c.dead_lettered.load(Ordering::Relaxed),
            stranded: c.stranded.load(Ordering::Relaxed),
            abandoned: c.abandoned.load(Ordering::Relaxed),
            pending_retries: c.pending_retries.load(Ordering::SeqCst),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::circuit::CircuitBreakerConfig;
    use crate::domain::models::dead_letter::DeadLetterFilter;
    use crate::domain::ports::clock::ManualClock;
    use crate::domain::ports::handler::handler_fn;
    use crate::services::dead_letter_queue::DeadLetterQueueConfig;
    use crate::services::event_queue::{EventQueue, EventQueueConfig};
    use serde_json::json;
    use std::sync::atomic::AtomicU32;

    struct Harness {
        queue: Arc<EventQueue>,
        dlq: Arc<DeadLetterQueue>,
        processor: Arc<EventProcessor>,
        clock: Arc<ManualClock>,
    }

    fn harness(max_retries: u32) -> Harness {
        let clock = Arc::new(ManualClock::new());
        let queue = Arc::new(EventQueue::new(
            EventQueueConfig::default().with_max_retries(max_retries),
            clock.clone(),
        ));
        let dlq = Arc::new(DeadLetterQueue::new(
            DeadLetterQueueConfig::default(),
            clock.clone(),
        ));
        let breakers = Arc::new(CircuitBreakerManager::new(
            CircuitBreakerConfig::default(),
            clock.clone(),
        ));
        let config = EventProcessorConfig {
            retry: RetryPolicy {
                max_retries,
                base_delay: Duration::from_millis(100),
                max_delay: Duration::from_millis(1_000),
                backoff_multiplier: 2.0,
                jitter_ratio: 0.0,
            },
            poll_interval: Duration::from_millis(10),
            ..EventProcessorConfig::default()
        };
        let processor = Arc::new(EventProcessor::new(
            config,
            queue.clone(),
            dlq.clone(),
            breakers,
            clock.clone(),
        ));
        Harness {
            queue,
            dlq,
            processor,
            clock,
        }
    }

    #[tokio::test]
    async fn test_success_is_acknowledged() {
        let h = harness(3);
        h.processor.register(
            "agent.*",
            Arc::new(handler_fn("agent", |event| async move {
                Ok::<_, RuntimeError>(json!({ "echo": event.data }))
            })),
            HandlerOptions::new(),
        );
        h.queue
            .enqueue(Event::new("agent.start", "t", json!({"x": 1})), None)
            .await
            .unwrap();

        let report = h.processor.process_batch().await;
        assert_eq!(report.dequeued, 1);
        assert_eq!(report.succeeded, 1);
        assert!(h.queue.is_empty());
        assert!(h.dlq.is_empty());
    }

    #[tokio::test]
    async fn test_exhausted_retries_go_to_dlq() {
        let h = harness(3);
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        h.processor.register(
            "tool.invoke",
            Arc::new(handler_fn("tool", move |_event| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<serde_json::Value, _>(RuntimeError::handler("tool down"))
                }
            })),
            HandlerOptions::new().without_breaker(),
        );
        let event = Event::new("tool.invoke", "t", json!({}));
        let id = event.id;
        h.queue.enqueue(event, None).await.unwrap();

        h.processor.run_until_idle().await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            h.clock.sleeps(),
            vec![Duration::from_millis(100), Duration::from_millis(200)]
        );
        let parked = h.dlq.get(id).unwrap();
        assert_eq!(parked.attempts, 3);
        assert_eq!(parked.failure_history.len(), 3);
        assert!(parked.failure_reason.starts_with("RETRY_EXHAUSTED"));
        assert!(!h.queue.contains(id));
    }

    #[tokio::test]
    async fn test_non_retryable_goes_straight_to_dlq() {
        let h = harness(3);
        h.processor.register(
            "agent.start",
            Arc::new(handler_fn("agent", |_event| async {
                Err::<serde_json::Value, _>(RuntimeError::validation("bad input"))
            })),
            HandlerOptions::new(),
        );
        h.queue
            .enqueue(Event::new("agent.start", "t", json!({})), None)
            .await
            .unwrap();

        let report = h.processor.process_batch().await;
        assert_eq!(report.dead_lettered, 1);
        let parked = h.dlq.list(&DeadLetterFilter::new());
        assert_eq!(parked[0].attempts, 1);
        assert!(parked[0].failure_reason.starts_with("VALIDATION_ERROR"));
    }

    #[tokio::test]
    async fn test_invalid_payloads_leave_breaker_closed() {
        use crate::domain::models::circuit::CircuitState;
        use crate::domain::models::config::ValidationMode;
        use crate::services::middleware::{PayloadSchema, Validator};

        let h = harness(3);
        let schema: Arc<dyn Validator> = Arc::new(PayloadSchema::new().require("agent"));
        h.processor.register(
            "agent.*",
            Arc::new(handler_fn("planner", |_event| async {
                Ok::<_, RuntimeError>(json!("planned"))
            })),
            HandlerOptions::new()
                .pipeline(PipelineConfig::default().with_validator(schema, ValidationMode::Reject)),
        );

        for _ in 0..10 {
            let err = h
                .processor
                .dispatch(&Event::new("agent.start", "t", json!({})))
                .await
                .unwrap_err();
            assert!(matches!(err, RuntimeError::Validation(_)));
        }

        let value = h
            .processor
            .dispatch(&Event::new("agent.start", "t", json!({ "agent": "planner" })))
            .await
            .unwrap();
        assert_eq!(value, json!("planned"));

        let breaker = h.processor.breakers.find("handler:planner").await.unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
        let metrics = breaker.metrics();
        assert_eq!(metrics.failed_requests, 0);
        assert_eq!(metrics.total_requests, 1);
    }

    #[tokio::test]
    async fn test_unrouted_event_is_dead_lettered() {
        let h = harness(3);
        h.queue
            .enqueue(Event::new("unknown.type", "t", json!({})), None)
            .await
            .unwrap();

        let report = h.processor.process_batch().await;
        assert_eq!(report.dead_lettered, 1);
        assert!(h.dlq.list(&DeadLetterFilter::new())[0]
            .failure_reason
            .starts_with("NO_HANDLER"));
    }

    #[tokio::test]
    async fn test_exact_registration_beats_prefix() {
        let h = harness(3);
        h.processor.register(
            "agent.*",
            Arc::new(handler_fn("generic", |_event| async {
                Ok::<_, RuntimeError>(json!("generic"))
            })),
            HandlerOptions::new(),
        );
        h.processor.register(
            "agent.start",
            Arc::new(handler_fn("specific", |_event| async {
                Ok::<_, RuntimeError>(json!("specific"))
            })),
            HandlerOptions::new(),
        );

        let value = h
            .processor
            .dispatch(&Event::new("agent.start", "t", json!({})))
            .await
            .unwrap();
        assert_eq!(value, json!("specific"));
    }

    #[tokio::test]
    async fn test_breaker_named_after_handler() {
        let h = harness(3);
        h.processor.register(
            "agent.*",
            Arc::new(handler_fn("planner", |_event| async {
                Ok::<_, RuntimeError>(json!(1))
            })),
            HandlerOptions::new(),
        );
        h.processor
            .dispatch(&Event::new("agent.start", "t", json!({})))
            .await
            .unwrap();

        let metrics = h.processor.breakers.get_all_metrics().await;
        assert_eq!(metrics["handler:planner"].successful_requests, 1);
    }

    #[tokio::test]
    async fn test_chunks_respect_max_concurrent() {
        let clock = Arc::new(ManualClock::new());
        let queue = Arc::new(EventQueue::new(EventQueueConfig::default(), clock.clone()));
        let dlq = Arc::new(DeadLetterQueue::new(DeadLetterQueueConfig::default(), clock.clone()));
        let breakers = Arc::new(CircuitBreakerManager::new(
            CircuitBreakerConfig::default(),
            clock.clone(),
        ));
        let processor = EventProcessor::new(
            EventProcessorConfig {
                batch_size: 8,
                chunk_size: 4,
                max_concurrent: 2,
                ..EventProcessorConfig::default()
            },
            queue.clone(),
            dlq,
            breakers,
            clock,
        );

        let active = Arc::new(AtomicU32::new(0));
        let peak = Arc::new(AtomicU32::new(0));
        let (a, p) = (active.clone(), peak.clone());
        processor.register(
            "work",
            Arc::new(handler_fn("work", move |_event| {
                let (a, p) = (a.clone(), p.clone());
                async move {
                    let now = a.fetch_add(1, Ordering::SeqCst) + 1;
                    p.fetch_max(now, Ordering::SeqCst);
                    tokio::task::yield_now().await;
                    a.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, RuntimeError>(json!(null))
                }
            })),
            HandlerOptions::new().without_breaker(),
        );
        for n in 0..8 {
            queue
                .enqueue(Event::new("work", "t", json!({ "n": n })), None)
                .await
                .unwrap();
        }

        let report = processor.process_batch().await;
        assert_eq!(report.succeeded, 8);
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }
}
