//! Composition root wiring queue, dead letter queue, breakers and processor.
//!
//! Nothing here is global: every registry is owned by the runtime and handed
//! to collaborators by `Arc`. Build with [`EventRuntime::builder`] for custom
//! stores and clocks, or [`EventRuntime::open`] for the SQLite-backed setup
//! described by the configuration.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::adapters::sqlite::{initialize_from_config, SqliteDeadLetterStore, SqlitePendingEventStore};
use crate::domain::errors::RuntimeResult;
use crate::domain::models::circuit::CircuitStateChanged;
use crate::domain::models::config::Config;
use crate::domain::models::dead_letter::DeadLetterAlert;
use crate::domain::models::event::{Event, EventId, QueueReceipt};
use crate::domain::models::pattern::NamePattern;
use crate::domain::ports::clock::{Clock, SystemClock};
use crate::domain::ports::event_queue::{EventQueueService, QueueStats};
use crate::domain::ports::handler::EventHandler;
use crate::domain::ports::stores::{DeadLetterStore, PendingEventStore};
use crate::services::{
    CircuitBreakerManager, ControlService, DeadLetterQueue, DeadLetterQueueConfig,
    DeadLetterStats, DurableEventQueue, EventProcessor, EventProcessorConfig, EventQueue,
    EventQueueConfig, FallbackRegistry, HandlerOptions, PipelineConfig, ProcessorStats,
    RecoveryReport, ResilientCaller, CONTROL_EVENT_PREFIX,
};

/// Result of [`EventRuntime::init`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitReport {
    /// Durable queue recovery, when a pending-event store is configured.
    pub recovery: Option<RecoveryReport>,
    /// Dead letters reloaded from the store.
    pub dead_letters_loaded: usize,
}

/// Point-in-time view of the runtime.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeSnapshot {
    pub queue: QueueStats,
    pub dead_letters: DeadLetterStats,
    pub processor: ProcessorStats,
    pub running: bool,
}

pub struct EventRuntimeBuilder {
    config: Config,
    clock: Arc<dyn Clock>,
    pending_store: Option<Arc<dyn PendingEventStore>>,
    dead_letter_store: Option<Arc<dyn DeadLetterStore>>,
    alert_sender: Option<mpsc::Sender<DeadLetterAlert>>,
    state_sender: Option<mpsc::Sender<CircuitStateChanged>>,
}

impl EventRuntimeBuilder {
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Persist critical events through `store`. Without a store the queue is
    /// purely in-memory.
    pub fn pending_store(mut self, store: Arc<dyn PendingEventStore>) -> Self {
        self.pending_store = Some(store);
        self
    }

    pub fn dead_letter_store(mut self, store: Arc<dyn DeadLetterStore>) -> Self {
        self.dead_letter_store = Some(store);
        self
    }

    pub fn alert_sender(mut self, sender: mpsc::Sender<DeadLetterAlert>) -> Self {
        self.alert_sender = Some(sender);
        self
    }

    pub fn state_sender(mut self, sender: mpsc::Sender<CircuitStateChanged>) -> Self {
        self.state_sender = Some(sender);
        self
    }

    pub fn build(self) -> EventRuntime {
        let config = self.config;
        let clock = self.clock;

        let queue = Arc::new(EventQueue::new(
            EventQueueConfig::from_config(&config),
            Arc::clone(&clock),
        ));
        let durable = self.pending_store.map(|store| {
            Arc::new(DurableEventQueue::new(
                Arc::clone(&queue),
                store,
                config.queue.critical_event_prefixes.clone(),
            ))
        });
        let ingress: Arc<dyn EventQueueService> = match durable {
            Some(ref durable) => Arc::clone(durable) as Arc<dyn EventQueueService>,
            None => Arc::clone(&queue) as Arc<dyn EventQueueService>,
        };

        let mut dlq = DeadLetterQueue::new(
            DeadLetterQueueConfig::from_config(&config),
            Arc::clone(&clock),
        );
        if let Some(store) = self.dead_letter_store {
            dlq = dlq.with_store(store);
        }
        if let Some(sender) = self.alert_sender {
            dlq = dlq.with_alert_sender(sender);
        }
        let dlq = Arc::new(dlq);

        let mut breakers =
            CircuitBreakerManager::new(config.circuit_breaker.clone(), Arc::clone(&clock));
        if let Some(sender) = self.state_sender {
            breakers = breakers.with_event_sender(sender);
        }
        let breakers = Arc::new(breakers);
        let fallbacks = Arc::new(FallbackRegistry::new());
        let control = Arc::new(ControlService::new(Arc::clone(&breakers)));

        let processor = EventProcessor::new(
            EventProcessorConfig::from_config(&config),
            Arc::clone(&ingress),
            Arc::clone(&dlq),
            Arc::clone(&breakers),
            Arc::clone(&clock),
        )
        .with_default_pipeline(PipelineConfig::from_config(&config.middleware));
        processor.register(
            format!("{CONTROL_EVENT_PREFIX}*"),
            Arc::clone(&control) as Arc<dyn EventHandler>,
            HandlerOptions::new().without_breaker(),
        );

        EventRuntime {
            config,
            clock,
            queue,
            durable,
            ingress,
            dlq,
            breakers,
            fallbacks,
            control,
            processor: Arc::new(processor),
            loop_handle: Mutex::new(None),
            initialized: AtomicBool::new(false),
        }
    }
}

pub struct EventRuntime {
    config: Config,
    clock: Arc<dyn Clock>,
    queue: Arc<EventQueue>,
    durable: Option<Arc<DurableEventQueue>>,
    ingress: Arc<dyn EventQueueService>,
    dlq: Arc<DeadLetterQueue>,
    breakers: Arc<CircuitBreakerManager>,
    fallbacks: Arc<FallbackRegistry>,
    control: Arc<ControlService>,
    processor: Arc<EventProcessor>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
    initialized: AtomicBool,
}

impl EventRuntime {
    pub fn builder(config: Config) -> EventRuntimeBuilder {
        EventRuntimeBuilder {
            config,
            clock: Arc::new(SystemClock),
            pending_store: None,
            dead_letter_store: None,
            alert_sender: None,
            state_sender: None,
        }
    }

    /// In-memory runtime using the system clock.
    pub fn new(config: Config) -> Self {
        Self::builder(config).build()
    }

    /// Runtime backed by the SQLite database from `config.database`.
    pub async fn open(config: Config) -> Result<Self> {
        let pool = initialize_from_config(&config.database)
            .await
            .with_context(|| format!("Failed to open database at {}", config.database.path))?;
        Ok(Self::builder(config)
            .pending_store(Arc::new(SqlitePendingEventStore::new(pool.clone())))
            .dead_letter_store(Arc::new(SqliteDeadLetterStore::new(pool)))
            .build())
    }

    /// Recover persisted critical events and reload dead letters. Runs once;
    /// later calls return an empty report.
    pub async fn init(&self) -> RuntimeResult<InitReport> {
        if self.initialized.swap(true, Ordering::SeqCst) {
            return Ok(InitReport::default());
        }

        let dead_letters_loaded = self.dlq.load().await?;
        let recovery = match self.durable {
            Some(ref durable) => Some(durable.recover().await?),
            None => None,
        };
        tracing::info!(
            dead_letters_loaded,
            recovered = recovery.map_or(0, |r| r.recovered),
            "Event runtime initialized"
        );
        Ok(InitReport {
            recovery,
            dead_letters_loaded,
        })
    }

    pub fn register_handler(
        &self,
        pattern: impl Into<NamePattern>,
        handler: Arc<dyn EventHandler>,
        options: HandlerOptions,
    ) {
        self.processor.register(pattern, handler, options);
    }

    /// Admit an event. Critical events are persisted first when a pending
    /// store is configured.
    pub async fn publish(&self, event: Event, priority: Option<u8>) -> RuntimeResult<QueueReceipt> {
        self.ingress.enqueue(event, priority).await
    }

    /// Move a dead letter back onto the queue.
    pub async fn replay_dead_letter(&self, id: EventId) -> RuntimeResult<Event> {
        self.dlq.replay(id, self.ingress.as_ref()).await
    }

    /// Start the processing loop. Starting twice is a no-op.
    pub async fn start(&self) {
        let mut handle = self.loop_handle.lock().await;
        if handle.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        *handle = Some(self.processor.start());
    }

    /// Close every breaker and clear its metrics.
    pub async fn reset_all(&self) {
        self.breakers.reset_all().await;
    }

    /// Stop intake and the processing loop. Unprocessed in-memory events are
    /// dropped; critical ones stay persisted for the next `init`.
    pub async fn shutdown(&self) {
        self.processor.stop();
        self.ingress.close();
        let handle = self.loop_handle.lock().await.take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                tracing::error!(error = %err, "Event processor task failed");
            }
        }

        let remaining = self.queue.len();
        if remaining > 0 {
            tracing::warn!(remaining, "Shut down with undelivered events");
        }
        tracing::info!("Event runtime shut down");
    }

    /// Shut down and release every breaker.
    pub async fn dispose(&self) {
        self.shutdown().await;
        self.breakers.dispose().await;
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn queue(&self) -> &Arc<dyn EventQueueService> {
        &self.ingress
    }

    pub fn durable_queue(&self) -> Option<&Arc<DurableEventQueue>> {
        self.durable.as_ref()
    }

    pub fn dead_letters(&self) -> &Arc<DeadLetterQueue> {
        &self.dlq
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerManager> {
        &self.breakers
    }

    pub fn fallbacks(&self) -> &Arc<FallbackRegistry> {
        &self.fallbacks
    }

    pub fn control(&self) -> &Arc<ControlService> {
        &self.control
    }

    pub fn processor(&self) -> &Arc<EventProcessor> {
        &self.processor
    }

    /// Breaker-guarded caller that consults the fallback registry.
    pub fn caller(&self) -> ResilientCaller {
        ResilientCaller::new(Arc::clone(&self.breakers), Arc::clone(&self.fallbacks))
    }

    pub fn snapshot(&self) -> RuntimeSnapshot {
        RuntimeSnapshot {
            queue: self.ingress.stats(),
            dead_letters: self.dlq.stats(),
            processor: self.processor.stats(),
            running: self.processor.is_running(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::{InMemoryDeadLetterStore, InMemoryPendingEventStore};
    use crate::domain::errors::RuntimeError;
    use crate::domain::models::circuit::CircuitState;
    use crate::domain::ports::clock::ManualClock;
    use crate::domain::ports::handler::handler_fn;
    use serde_json::json;

    #[tokio::test]
    async fn test_control_events_are_routed() {
        let runtime = EventRuntime::builder(Config::default())
            .clock(Arc::new(ManualClock::new()))
            .build();

        runtime
            .publish(
                Event::new(
                    "circuit.forceOpen",
                    "ops",
                    json!({"breakerName": "tool:search", "reason": "maintenance"}),
                ),
                None,
            )
            .await
            .unwrap();
        runtime.processor().run_until_idle().await;

        let breaker = runtime.breakers().find("tool:search").await.unwrap();
        assert_eq!(breaker.state(), CircuitState::Open);

        runtime.reset_all().await;
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_init_recovers_and_loads() {
        let mut config = Config::default();
        config.queue.critical_event_prefixes = vec!["agent.".to_string()];
        let pending = Arc::new(InMemoryPendingEventStore::new());
        let parked = Arc::new(InMemoryDeadLetterStore::new());

        let first = EventRuntime::builder(config.clone())
            .pending_store(pending.clone())
            .dead_letter_store(parked.clone())
            .build();
        first
            .publish(Event::new("agent.start", "t", json!({})), None)
            .await
            .unwrap();
        first
            .publish(Event::new("log.line", "t", json!({})), None)
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        first.shutdown().await;

        let second = EventRuntime::builder(config)
            .pending_store(pending.clone())
            .dead_letter_store(parked)
            .build();
        let report = second.init().await.unwrap();
        assert_eq!(report.recovery.unwrap().recovered, 1);
        assert_eq!(second.queue().len(), 1);
        assert_eq!(second.init().await.unwrap(), InitReport::default());
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let runtime = EventRuntime::new(Config::default());
        runtime.register_handler(
            "agent.*",
            Arc::new(handler_fn("agent", |_event| async {
                Ok::<_, RuntimeError>(json!(null))
            })),
            HandlerOptions::new(),
        );
        runtime.start().await;
        runtime.start().await;
        assert!(runtime.snapshot().running);

        runtime
            .publish(Event::new("agent.start", "t", json!({})), None)
            .await
            .unwrap();
        for _ in 0..100 {
            if runtime.processor().stats().succeeded == 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(runtime.processor().stats().succeeded, 1);

        runtime.dispose().await;
        assert!(!runtime.snapshot().running);
        assert!(matches!(
            runtime
                .publish(Event::new("agent.start", "t", json!({})), None)
                .await,
            Err(RuntimeError::QueueClosed)
        ));
    }
}
