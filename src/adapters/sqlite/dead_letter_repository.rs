//! SQLite implementation of the DeadLetterStore port.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::domain::errors::StoreResult;
use crate::domain::models::dead_letter::DeadLetterItem;
use crate::domain::models::event::EventId;
use crate::domain::ports::stores::DeadLetterStore;

/// SQLite-backed dead letter store.
#[derive(Clone)]
pub struct SqliteDeadLetterStore {
    pool: SqlitePool,
}

impl SqliteDeadLetterStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DeadLetterStore for SqliteDeadLetterStore {
    async fn save(&self, item: &DeadLetterItem) -> StoreResult<()> {
        let item_json = serde_json::to_string(item)?;

        sqlx::query(
            r#"
            INSERT INTO dead_letters (id, event_type, thread_id, failure_reason, attempts, first_failed_at, expires_at, item)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                failure_reason = excluded.failure_reason,
                attempts = excluded.attempts,
                expires_at = excluded.expires_at,
                item = excluded.item
            "#,
        )
        .bind(item.id().to_string())
        .bind(&item.event.event_type)
        .bind(&item.event.thread_id)
        .bind(&item.failure_reason)
        .bind(i64::from(item.attempts))
        .bind(item.first_failed_at.to_rfc3339())
        .bind(item.expires_at.to_rfc3339())
        .bind(item_json)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete(&self, id: EventId) -> StoreResult<()> {
        sqlx::query("DELETE FROM dead_letters WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn load_all(&self) -> StoreResult<Vec<DeadLetterItem>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT item FROM dead_letters ORDER BY first_failed_at ASC, rowid ASC")
                .fetch_all(&self.pool)
                .await?;

        rows.into_iter()
            .map(|(item,)| serde_json::from_str(&item).map_err(Into::into))
            .collect()
    }

    async fn purge(&self) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM dead_letters")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
