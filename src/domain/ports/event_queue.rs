use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::domain::errors::RuntimeResult;
use crate::domain::models::event::{Event, EventId, QueueItem, QueueReceipt};

/// Point-in-time queue counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub depth: usize,
    pub max_depth: usize,
    pub enqueued: u64,
    pub dequeued: u64,
    /// Pushes refused by backpressure or a closed queue.
    pub rejected: u64,
    pub requeued: u64,
    /// Dequeues forced by the starvation bound.
    pub starvation_promotions: u64,
}

/// Port over the live event queue, plain or durable.
///
/// Dequeued items are in flight until they are either acknowledged or handed
/// back with `requeue`.
#[async_trait]
pub trait EventQueueService: Send + Sync {
    /// Admit a new event. `None` uses the queue's default priority.
    async fn enqueue(&self, event: Event, priority: Option<u8>) -> RuntimeResult<QueueReceipt>;

    /// Return an in-flight item, keeping its attempts and history.
    async fn requeue(&self, item: QueueItem) -> RuntimeResult<()>;

    /// Remove up to `max` items in delivery order.
    async fn dequeue_batch(&self, max: usize) -> Vec<QueueItem>;

    /// Mark an in-flight item as finished (handled or dead-lettered).
    async fn ack(&self, item: &QueueItem) -> RuntimeResult<()>;

    /// Wait until at least one item is available, or the timeout elapses.
    /// Returns whether items are available.
    async fn wait_for_items(&self, timeout: Duration) -> bool;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn contains(&self, id: EventId) -> bool;

    fn stats(&self) -> QueueStats;

    /// Reject waiting and future producers with `QUEUE_CLOSED`.
    fn close(&self);
}
