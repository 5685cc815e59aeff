//! Dead letter queue for events that exhausted their retries.
//!
//! Entries are kept in failure order, optionally mirrored to a
//! [`DeadLetterStore`], expire after the retention period, and are bounded
//! by `max_size` with FIFO eviction. Eviction is data loss: it is logged at
//! error level, counted, and reported on the alert channel.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;

use crate::domain::errors::{RuntimeError, RuntimeResult};
use crate::domain::models::config::Config;
use crate::domain::models::dead_letter::{
    DeadLetterAlert, DeadLetterFilter, DeadLetterItem, FailureRecord,
};
use crate::domain::models::event::{Event, EventId, QueueItem};
use crate::domain::ports::clock::{to_chrono, Clock};
use crate::domain::ports::event_queue::EventQueueService;
use crate::domain::ports::stores::DeadLetterStore;

/// Capacity, retention and alerting for the dead-letter queue.
#[derive(Debug, Clone)]
pub struct DeadLetterQueueConfig {
    /// Entries kept before the oldest is evicted.
    pub max_size: usize,
    /// Age after which [`DeadLetterQueue::sweep`] removes an entry.
    pub retention: Duration,
    /// Size at which a threshold alert is raised. Zero disables it.
    pub alert_threshold: usize,
}

impl DeadLetterQueueConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_size: config.dead_letter.max_dlq_size,
            retention: Duration::from_secs(
                u64::from(config.dead_letter.max_retention_days) * 24 * 60 * 60,
            ),
            alert_threshold: config.dead_letter.alert_threshold,
        }
    }
}

impl Default for DeadLetterQueueConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Counters reported by [`DeadLetterQueue::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterStats {
    pub size: usize,
    pub pushed: u64,
    pub evicted: u64,
    pub replayed: u64,
    pub swept: u64,
}

/// Bounded, oldest-first store of events that exhausted their retries.
/// 
/// Entries are kept in memory and mirrored to a [`DeadLetterStore`] when one
/// is configured.
pub struct DeadLetterQueue {
    config: DeadLetterQueueConfig,
    clock: Arc<dyn Clock>,
    entries: Mutex<VecDeque<DeadLetterItem>>,
    store: Option<Arc<dyn DeadLetterStore>>,
    alert_sender: Option<mpsc::Sender<DeadLetterAlert>>,
    pushed: AtomicU64,
    evicted: AtomicU64,
    replayed: AtomicU64,
    swept: AtomicU64,
}

impl DeadLetterQueue {
    /// Create an empty, memory-only queue.
    pub fn new(config: DeadLetterQueueConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            entries: Mutex::new(VecDeque::new()),
            store: None,
            alert_sender: None,
            pushed: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
            replayed: AtomicU64::new(0),
            swept: AtomicU64::new(0),
        }
    }

    /// Mirror entries to `store`. Call [`DeadLetterQueue::load`] to pick up
    /// entries persisted by an earlier run.
    pub fn with_store(mut self, store: Arc<dyn DeadLetterStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the channel receiving threshold and eviction alerts.
    pub fn with_alert_sender(mut self, sender: mpsc::Sender<DeadLetterAlert>) -> Self {
        self.alert_sender = Some(sender);
        self
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, VecDeque<DeadLetterItem>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn alert(&self, alert: DeadLetterAlert) {
        if let Some(ref sender) = self.alert_sender {
            let _ = sender.try_send(alert);
        }
    }

    /// Park an event. The store write, when configured, happens first; if it
    /// fails nothing is recorded and the caller keeps ownership of the event.
    pub async fn push(
        &self,
        event: Event,
        reason: impl Into<String>,
        history: Vec<FailureRecord>,
        attempts: u32,
    ) -> RuntimeResult<DeadLetterItem> {
        let now = self.clock.now();
        let first_failed_at = history.first().map(|f| f.timestamp).unwrap_or(now);
        let item = DeadLetterItem {
            event,
            failure_reason: reason.into(),
            failure_history: history,
            first_failed_at,
            expires_at: now + to_chrono(self.config.retention),
            attempts,
        };

        if let Some(ref store) = self.store {
            store.save(&item).await?;
        }

        let (previous, size, evicted) = {
            let mut entries = self.entries();
            let previous = entries.len();
            entries.retain(|existing| existing.id() != item.id());
            entries.push_back(item.clone());
            let mut evicted = Vec::new();
            while entries.len() > self.config.max_size {
                match entries.pop_front() {
                    Some(oldest) => evicted.push(oldest),
                    None => break,
                }
            }
            (previous, entries.len(), evicted)
        };

        self.pushed.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(
            event_id = %item.id(),
            event_type = %item.event.event_type,
            attempts = item.attempts,
            reason = %item.failure_reason,
            size,
            "Event dead-lettered"
        );

        for lost in evicted {
            self.evicted.fetch_add(1, Ordering::Relaxed);
            tracing::error!(
                event_id = %lost.id(),
                event_type = %lost.event.event_type,
                max_size = self.config.max_size,
                "Dead letter queue full, evicted oldest entry"
            );
            if let Some(ref store) = self.store {
                if let Err(err) = store.delete(lost.id()).await {
                    tracing::warn!(event_id = %lost.id(), error = %err, "Failed to delete evicted entry");
                }
            }
            self.alert(DeadLetterAlert::Evicted {
                event_id: lost.id(),
                event_type: lost.event.event_type,
            });
        }

        let threshold = self.config.alert_threshold;
        if previous < threshold && size >= threshold {
            tracing::warn!(size, threshold, "Dead letter queue crossed alert threshold");
            self.alert(DeadLetterAlert::ThresholdExceeded { size, threshold });
        }

        Ok(item)
    }

    /// Park a queue item, carrying over its attempts and failure history.
    pub async fn push_item(
        &self,
        item: &QueueItem,
        reason: impl Into<String>,
    ) -> RuntimeResult<DeadLetterItem> {
        self.push(
            item.event.clone(),
            reason,
            item.failures.clone(),
            item.attempts,
        )
        .await
    }

    /// Entry for `id`, if parked.
    pub fn get(&self, id: EventId) -> Option<DeadLetterItem> {
        self.entries().iter().find(|e| e.id() == id).cloned()
    }

    pub fn contains(&self, id: EventId) -> bool {
        self.entries().iter().any(|e| e.id() == id)
    }

    /// Entries matching `filter`, oldest first.
    pub fn list(&self, filter: &DeadLetterFilter) -> Vec<DeadLetterItem> {
        let entries = self.entries();
        let matching = entries.iter().filter(|e| filter.matches(e)).cloned();
        match filter.limit {
            Some(limit) => matching.take(limit).collect(),
            None => matching.collect(),
        }
    }

    /// Re-enqueue a parked event with a fresh retry budget and drop it from
    /// the DLQ. The entry stays parked if the queue refuses it.
    ///
    /// The entry leaves the DLQ before the enqueue, so a replayed event that
    /// fails again straight away is parked anew rather than removed.
    pub async fn replay(&self, id: EventId, queue: &dyn EventQueueService) -> RuntimeResult<Event> {
        let (position, entry) = {
            let mut entries = self.entries();
            let position = entries
                .iter()
                .position(|e| e.id() == id)
                .ok_or_else(|| RuntimeError::not_found("dead letter", id))?;
            match entries.remove(position) {
                Some(entry) => (position, entry),
                None => return Err(RuntimeError::not_found("dead letter", id)),
            }
        };

        if let Some(ref store) = self.store {
            if let Err(err) = store.delete(id).await {
                self.restore(position, entry);
                return Err(err.into());
            }
        }

        if let Err(err) = queue.enqueue(entry.event.clone(), None).await {
            tracing::warn!(event_id = %id, error = %err, "Replay rejected, keeping dead letter");
            if let Some(ref store) = self.store {
                if let Err(store_err) = store.save(&entry).await {
                    tracing::error!(
                        event_id = %id,
                        error = %store_err,
                        "Failed to re-persist dead letter after rejected replay"
                    );
                }
            }
            self.restore(position, entry);
            return Err(err);
        }

        self.replayed.fetch_add(1, Ordering::Relaxed);
        tracing::info!(event_id = %id, event_type = %entry.event.event_type, "Dead letter replayed");
        Ok(entry.event)
    }

    /// Put an entry taken out by `replay` back where it was, unless the event
    /// was parked again in the meantime.
    fn restore(&self, position: usize, entry: DeadLetterItem) {
        let mut entries = self.entries();
        if entries.iter().any(|e| e.id() == entry.id()) {
            return;
        }
        let position = position.min(entries.len());
        entries.insert(position, entry);
    }

    /// Remove entries past their retention. Returns how many were removed.
    pub async fn sweep(&self) -> RuntimeResult<usize> {
        let now = self.clock.now();
        let expired: Vec<EventId> = {
            let mut entries = self.entries();
            let expired = entries
                .iter()
                .filter(|e| e.is_expired(now))
                .map(DeadLetterItem::id)
                .collect();
            entries.retain(|e| !e.is_expired(now));
            expired
        };

        if let Some(ref store) = self.store {
            for id in &expired {
                store.delete(*id).await?;
            }
        }

        if !expired.is_empty() {
            self.swept
                .fetch_add(expired.len() as u64, Ordering::Relaxed);
            tracing::info!(removed = expired.len(), "Swept expired dead letters");
        }
        Ok(expired.len())
    }

    /// Remove every entry. Returns how many were removed.
    pub async fn purge(&self) -> RuntimeResult<usize> {
        let removed = {
            let mut entries = self.entries();
            let removed = entries.len();
            entries.clear();
            removed
        };
        if let Some(ref store) = self.store {
            store.purge().await?;
        }
        tracing::info!(removed, "Purged dead letter queue");
        Ok(removed)
    }

    /// Load persisted entries, keeping the newest `max_size`.
    pub async fn load(&self) -> RuntimeResult<usize> {
        let Some(ref store) = self.store else {
            return Ok(0);
        };
        let mut loaded = store.load_all().await?;
        loaded.sort_by_key(|e| e.first_failed_at);
        if loaded.len() > self.config.max_size {
            let excess = loaded.len() - self.config.max_size;
            tracing::warn!(
                excess,
                max_size = self.config.max_size,
                "Persisted dead letters exceed capacity, keeping newest"
            );
            loaded.drain(..excess);
        }

        let count = loaded.len();
        let mut entries = self.entries();
        entries.retain(|e| !loaded.iter().any(|l| l.id() == e.id()));
        entries.extend(loaded);
        while entries.len() > self.config.max_size {
            entries.pop_front();
        }
        Ok(count)
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> DeadLetterStats {
        DeadLetterStats {
            size: self.len(),
            pushed: self.pushed.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
            replayed: self.replayed.load(Ordering::Relaxed),
            swept: self.swept.load(Ordering::Relaxed),
        }
    }
}
