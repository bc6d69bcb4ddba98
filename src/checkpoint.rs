//! Durable subscription checkpoints.
//!
//! One row per subscription group holding the global position of the
//! last processed event. Loaded once at startup per group, written
//! by the catch-up runner after each checkpoint interval and at
//! batch end.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::event::StreamPosition;

/// Name of one independent catch-up consumer, e.g.
/// `delivery-read-model`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionGroup(String);

impl SubscriptionGroup {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SubscriptionGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Stored checkpoint for group {group} is corrupt: {stored}")]
    Corrupt { group: String, stored: i64 },
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// The last processed position, or `None` if the group has never
    /// checkpointed (start from the beginning).
    async fn load(&self, group: &SubscriptionGroup)
    -> Result<Option<StreamPosition>, CheckpointError>;

    async fn save(
        &self,
        group: &SubscriptionGroup,
        position: StreamPosition,
    ) -> Result<(), CheckpointError>;
}

/// SQLite-backed checkpoint store.
#[derive(Debug, Clone)]
pub struct SqliteCheckpointStore {
    pool: SqlitePool,
}

impl SqliteCheckpointStore {
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Run the embedded migrations. Call once at process startup.
    pub async fn migrate(pool: &SqlitePool) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!().run(pool).await
    }
}

#[async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    async fn load(
        &self,
        group: &SubscriptionGroup,
    ) -> Result<Option<StreamPosition>, CheckpointError> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT position FROM checkpoints WHERE group_name = ?1")
                .bind(group.as_str())
                .fetch_optional(&self.pool)
                .await?;

        let Some((stored,)) = row else {
            return Ok(None);
        };

        let position = u64::try_from(stored).map_err(|_| CheckpointError::Corrupt {
            group: group.to_string(),
            stored,
        })?;

        Ok(Some(StreamPosition(position)))
    }

    async fn save(
        &self,
        group: &SubscriptionGroup,
        position: StreamPosition,
    ) -> Result<(), CheckpointError> {
        let stored = i64::try_from(position.0).map_err(|_| CheckpointError::Corrupt {
            group: group.to_string(),
            stored: i64::MAX,
        })?;

        sqlx::query(
            r#"
            INSERT INTO checkpoints (group_name, position, updated_at)
            VALUES (?1, ?2, CURRENT_TIMESTAMP)
            ON CONFLICT(group_name) DO UPDATE
            SET position = excluded.position, updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(group.as_str())
        .bind(stored)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
