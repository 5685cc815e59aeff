//! In-memory store adapters for ephemeral runtimes and tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;

use crate::domain::errors::{StoreError, StoreResult};
use crate::domain::models::dead_letter::DeadLetterItem;
use crate::domain::models::event::{EventId, QueueItem};
use crate::domain::ports::stores::{DeadLetterStore, PendingEventStore};

/// Insertion-ordered keyed store shared by both adapters.
#[derive(Debug)]
struct Keyed<T> {
    entries: Mutex<Vec<(EventId, T)>>,
    fail_writes: AtomicBool,
}

impl<T: Clone> Keyed<T> {
    fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            fail_writes: AtomicBool::new(false),
        }
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, Vec<(EventId, T)>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_writable(&self) -> StoreResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("writes disabled".to_string()));
        }
        Ok(())
    }

    fn upsert(&self, id: EventId, value: T) -> StoreResult<()> {
        self.check_writable()?;
        let mut entries = self.entries();
        match entries.iter_mut().find(|(key, _)| *key == id) {
            Some(entry) => entry.1 = value,
            None => entries.push((id, value)),
        }
        Ok(())
    }

    fn delete(&self, id: EventId) -> StoreResult<()> {
        self.check_writable()?;
        self.entries().retain(|(key, _)| *key != id);
        Ok(())
    }

    fn values(&self) -> Vec<T> {
        self.entries().iter().map(|(_, v)| v.clone()).collect()
    }

    fn len(&self) -> usize {
        self.entries().len()
    }
}

#[derive(Debug)]
pub struct InMemoryPendingEventStore {
    inner: Keyed<QueueItem>,
}

impl InMemoryPendingEventStore {
    pub fn new() -> Self {
        Self {
            inner: Keyed::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Make every subsequent write fail with [`StoreError::Unavailable`].
    pub fn fail_writes(&self, fail: bool) {
        self.inner.fail_writes.store(fail, Ordering::SeqCst);
    }
}

impl Default for InMemoryPendingEventStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PendingEventStore for InMemoryPendingEventStore {
    async fn save(&self, item: &QueueItem) -> StoreResult<()> {
        self.inner.upsert(item.id(), item.clone())
    }

    async fn delete(&self, id: EventId) -> StoreResult<()> {
        self.inner.delete(id)
    }

    async fn load_all(&self) -> StoreResult<Vec<QueueItem>> {
        Ok(self.inner.values())
    }
}

#[derive(Debug)]
pub struct InMemoryDeadLetterStore {
    inner: Keyed<DeadLetterItem>,
}

impl InMemoryDeadLetterStore {
    pub fn new() -> Self {
        Self {
            inner: Keyed::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn fail_writes(&self, fail: bool) {
        self.inner.fail_writes.store(fail, Ordering::SeqCst);
    }
}

impl Default for InMemoryDeadLetterStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeadLetterStore for InMemoryDeadLetterStore {
    async fn save(&self, item: &DeadLetterItem) -> StoreResult<()> {
        self.inner.upsert(item.id(), item.clone())
    }

    async fn delete(&self, id: EventId) -> StoreResult<()> {
        self.inner.delete(id)
    }

    async fn load_all(&self) -> StoreResult<Vec<DeadLetterItem>> {
        Ok(self.inner.values())
    }

    async fn purge(&self) -> StoreResult<u64> {
        self.inner.check_writable()?;
        let mut entries = self.inner.entries();
        let removed = entries.len() as u64;
        entries.clear();
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::event::Event;
    use chrono::Utc;
    use serde_json::json;

    #[tokio::test]
    async fn test_pending_store_upserts_in_order() {
        let store = InMemoryPendingEventStore::new();
        let a = QueueItem::new(Event::new("a", "t", json!({})), 5, 3, Utc::now());
        let b = QueueItem::new(Event::new("b", "t", json!({})), 5, 3, Utc::now());
        store.save(&a).await.unwrap();
        store.save(&b).await.unwrap();

        let mut updated = a.clone();
        updated.attempts = 2;
        store.save(&updated).await.unwrap();

        let loaded = store.load_all().await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].id(), a.id());
        assert_eq!(loaded[0].attempts, 2);
    }

    #[tokio::test]
    async fn test_fail_writes() {
        let store = InMemoryPendingEventStore::new();
        store.fail_writes(true);
        let item = QueueItem::new(Event::new("a", "t", json!({})), 5, 3, Utc::now());
        assert!(store.save(&item).await.is_err());
        assert!(store.is_empty());
    }
}
