//! SQLite implementation of the PendingEventStore port.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::domain::errors::StoreResult;
use crate::domain::models::event::{EventId, QueueItem};
use crate::domain::ports::stores::PendingEventStore;

/// SQLite-backed store of unacknowledged critical events.
#[derive(Clone)]
pub struct SqlitePendingEventStore {
    pool: SqlitePool,
}

impl SqlitePendingEventStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn count(&self) -> StoreResult<u64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM pending_events")
            .fetch_one(&self.pool)
            .await?;
        Ok(u64::try_from(count).unwrap_or(0))
    }
}

#[async_trait]
impl PendingEventStore for SqlitePendingEventStore {
    async fn save(&self, item: &QueueItem) -> StoreResult<()> {
        let item_json = serde_json::to_string(item)?;

        sqlx::query(
            r#"
            INSERT INTO pending_events (id, event_type, thread_id, priority, attempts, enqueued_at, item, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, datetime('now'))
            ON CONFLICT(id) DO UPDATE SET
                priority = excluded.priority,
                attempts = excluded.attempts,
                item = excluded.item,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(item.id().to_string())
        .bind(&item.event.event_type)
        .bind(&item.event.thread_id)
        .bind(i64::from(item.priority))
        .bind(i64::from(item.attempts))
        .bind(item.enqueued_at.to_rfc3339())
        .bind(item_json)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete(&self, id: EventId) -> StoreResult<()> {
        sqlx::query("DELETE FROM pending_events WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn load_all(&self) -> StoreResult<Vec<QueueItem>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT item FROM pending_events ORDER BY enqueued_at ASC, rowid ASC")
                .fetch_all(&self.pool)
                .await?;

        rows.into_iter()
            .map(|(item,)| serde_json::from_str(&item).map_err(Into::into))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::create_migrated_test_pool;
    use crate::domain::models::event::Event;
    use crate::domain::models::dead_letter::FailureRecord;
    use chrono::{Duration, Utc};
    use serde_json::json;

    async fn setup() -> SqlitePendingEventStore {
        SqlitePendingEventStore::new(create_migrated_test_pool().await.unwrap())
    }

    fn item(event_type: &str, offset_secs: i64) -> QueueItem {
        QueueItem::new(
            Event::new(event_type, "thread-1", json!({"k": event_type})),
            5,
            3,
            Utc::now() + Duration::seconds(offset_secs),
        )
    }

    #[tokio::test]
    async fn test_save_and_load_in_admission_order() {
        let store = setup().await;
        let later = item("agent.later", 10);
        let earlier = item("agent.earlier", 0);
        store.save(&later).await.unwrap();
        store.save(&earlier).await.unwrap();

        let loaded = store.load_all().await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].event.event_type, "agent.earlier");
        assert_eq!(loaded[1], later);
    }

    #[tokio::test]
    async fn test_save_overwrites() {
        let store = setup().await;
        let mut pending = item("agent.start", 0);
        store.save(&pending).await.unwrap();

        pending.record_failure(FailureRecord::new("boom"));
        store.save(&pending).await.unwrap();

        let loaded = store.load_all().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].attempts, 1);
        assert_eq!(loaded[0].last_error(), Some("boom"));
    }

    #[tokio::test]
    async fn test_delete() {
        let store = setup().await;
        let pending = item("agent.start", 0);
        store.save(&pending).await.unwrap();

        store.delete(pending.id()).await.unwrap();
        store.delete(pending.id()).await.unwrap();
        assert_eq!(store.count().await.unwrap(), 0);
    }
}
