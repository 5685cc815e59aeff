//! Event queue decorator persisting critical events until acknowledged.
//!
//! An event is critical when its type starts with one of the configured
//! prefixes. Critical items are written to the [`PendingEventStore`] before
//! the enqueue returns and removed once the processor acknowledges them, so
//! a restart followed by [`DurableEventQueue::recover`] redelivers anything
//! that was admitted but never finished.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::domain::errors::{RuntimeError, RuntimeResult};
use crate::domain::models::event::{Event, EventId, QueueItem, QueueReceipt};
use crate::domain::ports::event_queue::{EventQueueService, QueueStats};
use crate::domain::ports::stores::PendingEventStore;

use super::event_queue::EventQueue;

/// Outcome of [`DurableEventQueue::recover`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryReport {
    /// Items reloaded into the live queue.
    pub recovered: usize,
    /// Items skipped because they were already queued or in flight.
    pub duplicates: usize,
    /// Items that did not fit and remain persisted for a later attempt.
    pub deferred: usize,
}

/// Event queue that persists critical events until they are acknowledged.
/// 
/// An event is critical when its type starts with one of the configured
/// prefixes. Other events pass straight through to the in-memory queue.
pub struct DurableEventQueue {
    inner: Arc<EventQueue>,
    store: Arc<dyn PendingEventStore>,
    critical_prefixes: Vec<String>,
    in_flight: Mutex<HashSet<EventId>>,
}

impl DurableEventQueue {
    /// Wrap `inner`, persisting events whose type matches `critical_prefixes`.
    pub fn new(
        inner: Arc<EventQueue>,
        store: Arc<dyn PendingEventStore>,
        critical_prefixes: Vec<String>,
    ) -> Self {
        Self {
            inner,
            store,
            critical_prefixes,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn inner(&self) -> &Arc<EventQueue> {
        &self.inner
    }

    pub fn is_critical(&self, event: &Event) -> bool {
        event.matches_prefix(&self.critical_prefixes)
    }

    fn in_flight(&self) -> std::sync::MutexGuard<'_, HashSet<EventId>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of dequeued items awaiting acknowledgement.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight().len()
    }

    /// Enqueue an event, persisting it first when critical. A persisted copy
    /// is removed again if the queue refuses the event.
    pub async fn enqueue(&self, event: Event, priority: Option<u8>) -> RuntimeResult<QueueReceipt> {
        let item = self.inner.new_item(event, priority);
        if !self.is_critical(&item.event) {
            return self.inner.enqueue_item(item).await;
        }

        let event_id = item.id();
        if let Err(err) = self.store.save(&item).await {
            tracing::error!(%event_id, error = %err, "Failed to persist critical event");
            return Err(RuntimeError::from(err));
        }

        match self.inner.enqueue_item(item).await {
            Ok(receipt) => Ok(QueueReceipt {
                durable: true,
                ..receipt
            }),
            Err(err) => {
                if let Err(cleanup) = self.store.delete(event_id).await {
                    tracing::warn!(
                        %event_id,
                        error = %cleanup,
                        "Failed to remove persisted copy of rejected event"
                    );
                }
                Err(err)
            }
        }
    }

    /// Put a failed item back for redelivery, refreshing its persisted copy.
    pub async fn requeue(&self, item: QueueItem) -> RuntimeResult<()> {
        let event_id = item.id();
        if self.is_critical(&item.event) {
            self.store.save(&item).await?;
        }
        self.in_flight().remove(&event_id);
        self.inner.requeue(item).await
    }

    /// Dequeue up to `max` items and mark them in flight.
    pub fn dequeue_batch(&self, max: usize) -> Vec<QueueItem> {
        let batch = self.inner.dequeue_batch(max);
        let mut in_flight = self.in_flight();
        in_flight.extend(batch.iter().map(QueueItem::id));
        batch
    }

    /// Finish an item. Deletes the persisted copy of a critical event.
    pub async fn ack(&self, item: &QueueItem) -> RuntimeResult<()> {
        self.in_flight().remove(&item.id());
        if self.is_critical(&item.event) {
            self.store.delete(item.id()).await?;
        }
        Ok(())
    }

    /// Reload persisted-but-unacknowledged items into the live queue.
    ///
    /// Safe to call repeatedly: items already queued or in flight are
    /// skipped, and items that do not fit stay persisted.
    pub async fn recover(&self) -> RuntimeResult<RecoveryReport> {
        let persisted = self.store.load_all().await?;
        let mut report = RecoveryReport::default();

        for item in persisted {
            let event_id = item.id();
            if self.inner.contains(event_id) || self.in_flight().contains(&event_id) {
                report.duplicates += 1;
                continue;
            }
            match self.inner.try_push(item) {
                Ok(_) => report.recovered += 1,
                Err(RuntimeError::QueueFull { .. }) => report.deferred += 1,
                Err(RuntimeError::Validation(_)) => report.duplicates += 1,
                Err(err) => return Err(err),
            }
        }

        tracing::info!(
            recovered = report.recovered,
            duplicates = report.duplicates,
            deferred = report.deferred,
            "Recovered persisted events"
        );
        Ok(report)
    }
}

#[async_trait]
impl EventQueueService for DurableEventQueue {
    async fn enqueue(&self, event: Event, priority: Option<u8>) -> RuntimeResult<QueueReceipt> {
        DurableEventQueue::enqueue(self, event, priority).await
    }

    async fn requeue(&self, item: QueueItem) -> RuntimeResult<()> {
        DurableEventQueue::requeue(self, item).await
    }

    async fn dequeue_batch(&self, max: usize) -> Vec<QueueItem> {
        DurableEventQueue::dequeue_batch(self, max)
    }

    async fn ack(&self, item: &QueueItem) -> RuntimeResult<()> {
        DurableEventQueue::ack(self, item).await
    }

    async fn wait_for_items(&self, timeout: Duration) -> bool {
        self.inner.wait_for_items(timeout).await
    }

    fn len(&self) -> usize {
        self.inner.len()
    }

    fn contains(&self, id: EventId) -> bool {
        self.inner.contains(id) || self.in_flight().contains(&id)
    }

    fn stats(&self) -> QueueStats {
        self.inner.stats()
    }

    fn close(&self) {
        self.inner.close()
    }
}
