//! `ObjectIdInterface`: file-id/stream-id to object-store key mapping
//! (spec §4.6, §6 "Object-id map").

use async_trait::async_trait;
use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use tracing::instrument;

use crate::error::Result;

/// External contract mapping `(file_id, stream_id)` to an object-store key.
/// A missing mapping on load means "new, empty file" (spec §6).
#[async_trait]
pub trait ObjectIdInterface: Send + Sync {
    async fn load_object_id(&self, file_id: i64, stream_id: i32) -> Result<Option<String>>;
    async fn save_object_id(&self, file_id: i64, stream_id: i32, object_id: &str) -> Result<()>;
    async fn delete_object_id(&self, file_id: i64, stream_id: i32) -> Result<()>;
}

/// `SQLite`-backed reference implementation of [`ObjectIdInterface`].
#[derive(Debug, Clone)]
pub struct SqliteObjectIdStore {
    pool: SqlitePool,
}

impl SqliteObjectIdStore {
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ObjectIdInterface for SqliteObjectIdStore {
    #[instrument(skip(self))]
    async fn load_object_id(&self, file_id: i64, stream_id: i32) -> Result<Option<String>> {
        let row = sqlx::query(
            r"SELECT object_id FROM object_ids WHERE file_id = ? AND stream_id = ?",
        )
        .bind(file_id)
        .bind(stream_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.get("object_id")))
    }

    #[instrument(skip(self, object_id))]
    async fn save_object_id(&self, file_id: i64, stream_id: i32, object_id: &str) -> Result<()> {
        sqlx::query(
            r"INSERT INTO object_ids (file_id, stream_id, object_id, updated_at)
              VALUES (?, ?, ?, datetime('now'))
              ON CONFLICT (file_id, stream_id)
              DO UPDATE SET object_id = excluded.object_id, updated_at = excluded.updated_at",
        )
        .bind(file_id)
        .bind(stream_id)
        .bind(object_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_object_id(&self, file_id: i64, stream_id: i32) -> Result<()> {
        sqlx::query(r"DELETE FROM object_ids WHERE file_id = ? AND stream_id = ?")
            .bind(file_id)
            .bind(stream_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    async fn store() -> SqliteObjectIdStore {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        SqliteObjectIdStore::new(pool)
    }

    #[tokio::test]
    async fn missing_mapping_is_none() {
        let store = store().await;
        assert_eq!(store.load_object_id(1, 0).await.unwrap(), None);
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let store = store().await;
        store.save_object_id(1, 0, "obj-abc").await.unwrap();
        assert_eq!(store.load_object_id(1, 0).await.unwrap(), Some("obj-abc".to_string()));
    }

    #[tokio::test]
    async fn save_again_overwrites() {
        let store = store().await;
        store.save_object_id(1, 0, "obj-abc").await.unwrap();
        store.save_object_id(1, 0, "obj-xyz").await.unwrap();
        assert_eq!(store.load_object_id(1, 0).await.unwrap(), Some("obj-xyz".to_string()));
    }

    #[tokio::test]
    async fn delete_then_load_is_none() {
        let store = store().await;
        store.save_object_id(1, 0, "obj-abc").await.unwrap();
        store.delete_object_id(1, 0).await.unwrap();
        assert_eq!(store.load_object_id(1, 0).await.unwrap(), None);
    }
}
