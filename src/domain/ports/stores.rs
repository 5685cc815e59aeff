//! Persistence ports for pending events and dead letters.
//!
//! Both stores are keyed by event id. Implementations live in
//! `adapters::sqlite` (durable) and `adapters::memory` (ephemeral/tests).

use async_trait::async_trait;

use crate::domain::errors::StoreResult;
use crate::domain::models::dead_letter::DeadLetterItem;
use crate::domain::models::event::{EventId, QueueItem};

/// Keyed store of admitted-but-unacknowledged critical events.
#[async_trait]
pub trait PendingEventStore: Send + Sync {
    /// Insert or overwrite the persisted copy of an item.
    async fn save(&self, item: &QueueItem) -> StoreResult<()>;

    /// Remove the persisted copy. Deleting a missing id is not an error.
    async fn delete(&self, id: EventId) -> StoreResult<()>;

    /// All persisted items, oldest first.
    async fn load_all(&self) -> StoreResult<Vec<QueueItem>>;
}

/// Store backing the dead letter queue across restarts.
#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    async fn save(&self, item: &DeadLetterItem) -> StoreResult<()>;

    async fn delete(&self, id: EventId) -> StoreResult<()>;

    /// All persisted entries, oldest first.
    async fn load_all(&self) -> StoreResult<Vec<DeadLetterItem>>;

    /// Remove every entry, returning how many were removed.
    async fn purge(&self) -> StoreResult<u64>;
}
