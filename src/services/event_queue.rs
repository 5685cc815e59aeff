//! In-memory priority event queue with bounded depth.
//!
//! Items are delivered highest priority first and FIFO within a priority.
//! Depth is bounded by a semaphore holding one permit per free slot, which
//! gives both backpressure policies: `drop` takes a permit with `try_acquire`
//! and `wait` parks the producer on `acquire` until a dequeue releases one.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Notify, Semaphore, TryAcquireError};

use crate::domain::errors::{RuntimeError, RuntimeResult};
use crate::domain::models::config::{BackpressurePolicy, Config};
use crate::domain::models::event::{Event, EventId, QueueItem, QueueReceipt};
use crate::domain::ports::clock::Clock;
use crate::domain::ports::event_queue::{EventQueueService, QueueStats};

/// Settings for a single queue instance.
#[derive(Debug, Clone)]
pub struct EventQueueConfig {
    /// Items held before backpressure applies.
    pub max_depth: usize,
    /// What a producer gets when the queue is full.
    pub backpressure: BackpressurePolicy,
    /// Priority for events enqueued without one.
    pub default_priority: u8,
    /// Consecutive bypasses of a waiting lower-priority item before the
    /// oldest item is forced out. Zero disables the bound.
    pub starvation_limit: u32,
    /// Retry budget stamped on new items.
    pub max_retries: u32,
}

impl Default for EventQueueConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl EventQueueConfig {
    /// Queue settings from the `queue` and `retry` config sections.
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_depth: config.queue.max_queue_depth,
            backpressure: config.queue.backpressure,
            default_priority: config.queue.default_priority,
            starvation_limit: config.queue.starvation_limit,
            max_retries: config.retry.max_retries,
        }
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn with_backpressure(mut self, policy: BackpressurePolicy) -> Self {
        self.backpressure = policy;
        self
    }

    pub fn with_starvation_limit(mut self, limit: u32) -> Self {
        self.starvation_limit = limit;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

/// Queued item plus its admission sequence number.
#[derive(Debug)]
struct Slot {
    seq: u64,
    item: QueueItem,
}

#[derive(Debug, Default)]
struct QueueState {
    levels: BTreeMap<u8, VecDeque<Slot>>,
    ids: HashSet<EventId>,
    next_seq: u64,
    /// Consecutive dequeues that skipped a waiting lower-priority item.
    bypassed: u32,
}

impl QueueState {
    fn len(&self) -> usize {
        self.ids.len()
    }

    fn insert(&mut self, item: QueueItem) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.ids.insert(item.id());
        self.levels
            .entry(item.priority)
            .or_default()
            .push_back(Slot { seq, item });
    }

    /// Pop the next item. Returns the item and whether the starvation bound
    /// forced it out.
    fn pop(&mut self, starvation_limit: u32) -> Option<(QueueItem, bool)> {
        let top = *self.levels.keys().next_back()?;
        let lower_waiting = self.levels.len() > 1;

        let (level, forced) = if lower_waiting
            && starvation_limit > 0
            && self.bypassed >= starvation_limit
        {
            let oldest = self
                .levels
                .iter()
                .filter_map(|(priority, slots)| slots.front().map(|s| (*priority, s.seq)))
                .min_by_key(|(_, seq)| *seq)
                .map(|(priority, _)| priority)
                .unwrap_or(top);
            (oldest, oldest != top)
        } else {
            (top, false)
        };

        let slots = self.levels.get_mut(&level)?;
        let slot = slots.pop_front()?;
        if slots.is_empty() {
            self.levels.remove(&level);
        }
        self.ids.remove(&slot.item.id());

        if forced || !lower_waiting || level != top {
            self.bypassed = 0;
        } else {
            self.bypassed = self.bypassed.saturating_add(1);
        }
        Some((slot.item, forced))
    }
}

/// Priority queue with `drop`/`wait` backpressure.
pub struct EventQueue {
    config: EventQueueConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<QueueState>,
    capacity: Semaphore,
    available: Notify,
    closed: AtomicBool,
    enqueued: AtomicU64,
    dequeued: AtomicU64,
    rejected: AtomicU64,
    requeued: AtomicU64,
    starvation_promotions: AtomicU64,
}

impl EventQueue {
    /// Create an empty, open queue.
    pub fn new(config: EventQueueConfig, clock: Arc<dyn Clock>) -> Self {
        let capacity = config.max_depth.min(Semaphore::MAX_PERMITS);
        Self {
            config,
            clock,
            state: Mutex::new(QueueState::default()),
            capacity: Semaphore::new(capacity),
            available: Notify::new(),
            closed: AtomicBool::new(false),
            enqueued: AtomicU64::new(0),
            dequeued: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            requeued: AtomicU64::new(0),
            starvation_promotions: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &EventQueueConfig {
        &self.config
    }

    /// Wrap an event in a fresh item using this queue's defaults.
    pub fn new_item(&self, event: Event, priority: Option<u8>) -> QueueItem {
        QueueItem::new(
            event,
            priority.unwrap_or(self.config.default_priority),
            self.config.max_retries,
            self.clock.now(),
        )
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn queue_full(&self) -> RuntimeError {
        RuntimeError::QueueFull {
            depth: self.len(),
            max_depth: self.config.max_depth,
        }
    }

    fn try_reserve(&self) -> RuntimeResult<()> {
        match self.capacity.try_acquire() {
            Ok(permit) => {
                permit.forget();
                Ok(())
            }
            Err(TryAcquireError::Closed) => Err(RuntimeError::QueueClosed),
            Err(TryAcquireError::NoPermits) => Err(self.queue_full()),
        }
    }

    async fn reserve(&self) -> RuntimeResult<()> {
        match self.config.backpressure {
            BackpressurePolicy::Drop => self.try_reserve(),
            BackpressurePolicy::Wait => {
                let permit = self
                    .capacity
                    .acquire()
                    .await
                    .map_err(|_| RuntimeError::QueueClosed)?;
                permit.forget();
                Ok(())
            }
        }
    }

    fn release(&self, slots: usize) {
        if slots > 0 && !self.closed.load(Ordering::SeqCst) {
            self.capacity.add_permits(slots);
        }
    }

    /// Insert after a slot has been reserved.
    fn insert_reserved(&self, item: QueueItem) -> RuntimeResult<usize> {
        let id = item.id();
        let mut state = self.lock();
        if self.closed.load(Ordering::SeqCst) {
            drop(state);
            return Err(RuntimeError::QueueClosed);
        }
        if state.ids.contains(&id) {
            drop(state);
            self.release(1);
            return Err(RuntimeError::validation(format!(
                "event {id} is already queued"
            )));
        }
        state.insert(item);
        let depth = state.len();
        drop(state);
        self.available.notify_one();
        Ok(depth)
    }

    fn record_rejection(&self, item: &QueueItem, err: &RuntimeError) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(
            event_id = %item.id(),
            event_type = %item.event.event_type,
            code = %err.code(),
            "Event rejected by queue"
        );
    }

    /// Admit an item under the configured backpressure policy.
    pub async fn push(&self, item: QueueItem) -> RuntimeResult<usize> {
        if let Err(err) = self.reserve().await {
            self.record_rejection(&item, &err);
            return Err(err);
        }
        self.insert_reserved(item)
    }

    /// Admit an item only if a slot is free right now.
    pub fn try_push(&self, item: QueueItem) -> RuntimeResult<usize> {
        if let Err(err) = self.try_reserve() {
            self.record_rejection(&item, &err);
            return Err(err);
        }
        self.insert_reserved(item)
    }

    /// Admit a new event and return its receipt.
    pub async fn enqueue(&self, event: Event, priority: Option<u8>) -> RuntimeResult<QueueReceipt> {
        let item = self.new_item(event, priority);
        self.enqueue_item(item).await
    }

    /// Admit a prepared item, e.g. one reloaded from persistence.
    pub async fn enqueue_item(&self, item: QueueItem) -> RuntimeResult<QueueReceipt> {
        let event_id = item.id();
        let event_type = item.event.event_type.clone();
        let priority = item.priority;
        let depth = self.push(item).await?;
        self.enqueued.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(%event_id, %event_type, priority, depth, "Event enqueued");
        Ok(QueueReceipt {
            event_id,
            depth,
            durable: false,
        })
    }

    /// Put a failed item back. Subject to the same backpressure as new events.
    pub async fn requeue(&self, item: QueueItem) -> RuntimeResult<()> {
        let event_id = item.id();
        let attempts = item.attempts;
        let depth = self.push(item).await?;
        self.requeued.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(%event_id, attempts, depth, "Event requeued");
        Ok(())
    }

    /// Remove up to `max` items, highest priority first. Never blocks.
    pub fn dequeue_batch(&self, max: usize) -> Vec<QueueItem> {
        let mut batch = Vec::with_capacity(max.min(self.config.max_depth));
        let mut promotions = 0u64;
        {
            let mut state = self.lock();
            while batch.len() < max {
                match state.pop(self.config.starvation_limit) {
                    Some((item, forced)) => {
                        if forced {
                            promotions += 1;
                        }
                        batch.push(item);
                    }
                    None => break,
                }
            }
        }

        if !batch.is_empty() {
            self.release(batch.len());
            self.dequeued
                .fetch_add(batch.len() as u64, Ordering::Relaxed);
            self.starvation_promotions
                .fetch_add(promotions, Ordering::Relaxed);
            tracing::debug!(count = batch.len(), depth = self.len(), "Dequeued batch");
        }
        batch
    }

    /// Wait up to `timeout` for the queue to become non-empty.
    /// 
    /// Returns `false` straight away once the queue is closed and drained.
    pub async fn wait_for_items(&self, timeout: Duration) -> bool {
        let notified = self.available.notified();
        if !self.is_empty() {
            return true;
        }
        if self.is_closed() {
            return false;
        }
        let _ = tokio::time::timeout(timeout, notified).await;
        !self.is_empty()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether an item with this id is queued.
    pub fn contains(&self, id: EventId) -> bool {
        self.lock().ids.contains(&id)
    }

    /// Snapshot of queued items in delivery order, ignoring the starvation
    /// bound.
    pub fn snapshot(&self) -> Vec<QueueItem> {
        let state = self.lock();
        state
            .levels
            .iter()
            .rev()
            .flat_map(|(_, slots)| slots.iter().map(|s| s.item.clone()))
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Refuse further pushes and wake every waiter. Queued items stay
    /// dequeueable.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.capacity.close();
            self.available.notify_waiters();
            tracing::info!(depth = self.len(), "Event queue closed");
        }
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            depth: self.len(),
            max_depth: self.config.max_depth,
            enqueued: self.enqueued.load(Ordering::Relaxed),
            dequeued: self.dequeued.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
            starvation_promotions: self.starvation_promotions.load(Ordering::Relaxed),
        }
    }
}

#[async_trait]
impl EventQueueService for EventQueue {
    async fn enqueue(&self, event: Event, priority: Option<u8>) -> RuntimeResult<QueueReceipt> {
        EventQueue::enqueue(self, event, priority).await
    }

    async fn requeue(&self, item: QueueItem) -> RuntimeResult<()> {
        EventQueue::requeue(self, item).await
    }

    async fn dequeue_batch(&self, max: usize) -> Vec<QueueItem> {
        EventQueue::dequeue_batch(self, max)
    }

    async fn ack(&self, _item: &QueueItem) -> RuntimeResult<()> {
        Ok(())
    }

    async fn wait_for_items(&self, timeout: Duration) -> bool {
        EventQueue::wait_for_items(self, timeout).await
    }

    fn len(&self) -> usize {
        EventQueue::len(self)
    }

    fn contains(&self, id: EventId) -> bool {
        EventQueue::contains(self, id)
    }

    fn stats(&self) -> QueueStats {
        EventQueue::stats(self)
    }

    fn close(&self) {
        EventQueue::close(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::event::Priority;
    use crate::domain::ports::clock::ManualClock;
    use serde_json::json;

    fn queue(max_depth: usize, policy: BackpressurePolicy) -> Arc<EventQueue> {
        let config = EventQueueConfig::default()
            .with_max_depth(max_depth)
            .with_backpressure(policy);
        Arc::new(EventQueue::new(config, Arc::new(ManualClock::new())))
    }

    fn event(n: usize) -> Event {
        Event::new("agent.step", "thread-1", json!({ "n": n }))
    }

    fn seq_of(item: &QueueItem) -> u64 {
        item.event.data["n"].as_u64().unwrap()
    }

    #[tokio::test]
    async fn test_priority_then_fifo() {
        let q = queue(10, BackpressurePolicy::Drop);
        q.enqueue(event(0), Some(Priority::LOW)).await.unwrap();
        q.enqueue(event(1), Some(Priority::HIGH)).await.unwrap();
        q.enqueue(event(2), Some(Priority::NORMAL)).await.unwrap();
        q.enqueue(event(3), Some(Priority::HIGH)).await.unwrap();

        let order: Vec<u64> = q.dequeue_batch(10).iter().map(seq_of).collect();
        assert_eq!(order, vec![1, 3, 2, 0]);
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn test_drop_policy_rejects_when_full() {
        let q = queue(5, BackpressurePolicy::Drop);
        for n in 0..5 {
            q.enqueue(event(n), None).await.unwrap();
        }

        let err = q.enqueue(event(5), None).await.unwrap_err();
        assert!(matches!(
            err,
            RuntimeError::QueueFull {
                depth: 5,
                max_depth: 5
            }
        ));
        assert_eq!(q.len(), 5);
        assert_eq!(q.stats().rejected, 1);
    }

    #[tokio::test]
    async fn test_wait_policy_blocks_until_dequeue() {
        let q = queue(5, BackpressurePolicy::Wait);
        for n in 0..5 {
            q.enqueue(event(n), None).await.unwrap();
        }

        let producer = {
            let q = Arc::clone(&q);
            tokio::spawn(async move { q.enqueue(event(5), None).await })
        };
        tokio::task::yield_now().await;
        assert!(!producer.is_finished());
        assert_eq!(q.len(), 5);

        assert_eq!(q.dequeue_batch(1).len(), 1);
        producer.await.unwrap().unwrap();
        assert_eq!(q.len(), 5);
    }

    #[tokio::test]
    async fn test_starvation_bound_promotes_oldest() {
        let config = EventQueueConfig::default()
            .with_max_depth(100)
            .with_starvation_limit(2);
        let q = EventQueue::new(config, Arc::new(ManualClock::new()));

        q.enqueue(event(0), Some(Priority::LOW)).await.unwrap();
        for n in 1..=4 {
            q.enqueue(event(n), Some(Priority::HIGH)).await.unwrap();
        }

        let order: Vec<u64> = q.dequeue_batch(5).iter().map(seq_of).collect();
        assert_eq!(order, vec![1, 2, 0, 3, 4]);
        assert_eq!(q.stats().starvation_promotions, 1);
    }

    #[tokio::test]
    async fn test_requeue_keeps_attempts() {
        let q = queue(5, BackpressurePolicy::Drop);
        q.enqueue(event(0), None).await.unwrap();
        let mut item = q.dequeue_batch(1).pop().unwrap();
        item.record_failure(crate::domain::models::FailureRecord::new("boom"));

        q.requeue(item).await.unwrap();
        let again = q.dequeue_batch(1).pop().unwrap();
        assert_eq!(again.attempts, 1);
        assert_eq!(q.stats().requeued, 1);
    }

    #[tokio::test]
    async fn test_close_rejects_waiting_and_new_producers() {
        let q = queue(1, BackpressurePolicy::Wait);
        q.enqueue(event(0), None).await.unwrap();

        let waiting = {
            let q = Arc::clone(&q);
            tokio::spawn(async move { q.enqueue(event(1), None).await })
        };
        tokio::task::yield_now().await;

        q.close();
        assert!(matches!(
            waiting.await.unwrap(),
            Err(RuntimeError::QueueClosed)
        ));
        assert!(matches!(
            q.enqueue(event(2), None).await,
            Err(RuntimeError::QueueClosed)
        ));
        // Already queued items can still be drained.
        assert_eq!(q.dequeue_batch(10).len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected_without_leaking_capacity() {
        let q = queue(2, BackpressurePolicy::Drop);
        let e = event(0);
        q.enqueue(e.clone(), None).await.unwrap();
        assert!(q.contains(e.id));

        assert!(matches!(
            q.enqueue(e, None).await,
            Err(RuntimeError::Validation(_))
        ));
        q.enqueue(event(1), None).await.unwrap();
        assert_eq!(q.len(), 2);
    }

    #[tokio::test]
    async fn test_wait_for_items_times_out_when_empty() {
        let q = queue(2, BackpressurePolicy::Drop);
        assert!(!q.wait_for_items(Duration::from_millis(10)).await);
        q.enqueue(event(0), None).await.unwrap();
        assert!(q.wait_for_items(Duration::from_millis(10)).await);
    }
}
