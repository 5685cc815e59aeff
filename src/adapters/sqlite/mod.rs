//! SQLite persistence for pending events and dead letters.

pub mod connection;
pub mod dead_letter_repository;
pub mod migrations;
pub mod pending_event_repository;

pub use connection::{
    create_pool, create_test_pool, database_url, verify_connection, ConnectionError, PoolConfig,
};
pub use dead_letter_repository::SqliteDeadLetterStore;
pub use migrations::{all_embedded_migrations, Migration, MigrationError, Migrator};
pub use pending_event_repository::SqlitePendingEventStore;

use sqlx::SqlitePool;

use crate::domain::models::config::DatabaseConfig;

#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),
    #[error("Migration error: {0}")]
    Migration(#[from] MigrationError),
}

/// Open the database at `database_url` and bring its schema up to date.
pub async fn initialize_database(
    database_url: &str,
    config: Option<PoolConfig>,
) -> Result<SqlitePool, DatabaseError> {
    let pool = create_pool(database_url, config).await?;
    Migrator::new(pool.clone())
        .run_embedded_migrations(&all_embedded_migrations())
        .await?;
    Ok(pool)
}

/// Open the database described by the `database` config section.
pub async fn initialize_from_config(config: &DatabaseConfig) -> Result<SqlitePool, DatabaseError> {
    initialize_database(&database_url(&config.path), Some(PoolConfig::from(config))).await
}

/// In-memory pool with all migrations applied.
pub async fn create_migrated_test_pool() -> Result<SqlitePool, DatabaseError> {
    let pool = create_test_pool().await?;
    Migrator::new(pool.clone())
        .run_embedded_migrations(&all_embedded_migrations())
        .await?;
    Ok(pool)
}
