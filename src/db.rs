//! Database connection and schema management for the durable request queue
//! and object-id map (spec §4.6).
//!
//! Ships WAL mode and a busy timeout the same way the teacher's `Database`
//! wrapper does, since `SQLite`'s file-level locking makes both load-bearing
//! once more than one worker pool hits the same file concurrently.

use std::path::Path;

use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use tracing::instrument;

use crate::error::{CoreError, Result};
use crate::request::{ObjectIdInterface, SqliteObjectIdStore, SqliteQueueStore};

/// Maximum pool connections. Kept low — `SQLite` serializes writers anyway.
const DEFAULT_MAX_CONNECTIONS: u32 = 5;
/// How long a connection waits before returning `SQLITE_BUSY`.
const BUSY_TIMEOUT_MS: u32 = 5000;

/// Owns the connection pool backing both [`SqliteQueueStore`] and
/// [`SqliteObjectIdStore`] reference implementations.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Opens (creating if absent) the database at `path`, enables WAL mode,
    /// and runs pending migrations.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Internal`] if connecting or migrating fails.
    #[instrument(skip(path), fields(path = %path.display()))]
    pub async fn open(path: &Path) -> Result<Self> {
        let db_url = format!("sqlite:{}?mode=rwc", path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(DEFAULT_MAX_CONNECTIONS)
            .connect(&db_url)
            .await?;

        sqlx::query("PRAGMA journal_mode=WAL").execute(&pool).await?;
        sqlx::query(&format!("PRAGMA busy_timeout={BUSY_TIMEOUT_MS}"))
            .execute(&pool)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    /// Opens an in-memory database, for tests and the `MemoryLoader` path.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Internal`] if connecting or migrating fails.
    #[instrument]
    pub async fn open_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    #[must_use]
    pub fn queue_store(&self) -> SqliteQueueStore {
        SqliteQueueStore::new(self.pool.clone())
    }

    #[must_use]
    pub fn object_id_store(&self) -> SqliteObjectIdStore {
        SqliteObjectIdStore::new(self.pool.clone())
    }

    /// Cheap liveness probe used by the online-check loop (spec §6
    /// `OnlineCheckInterval`).
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Internal`] if the store is unreachable.
    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await.map(|_| ()).map_err(CoreError::from)
    }

    pub async fn close(self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_in_memory_runs_migrations() {
        let db = Database::open_in_memory().await.unwrap();
        let store = db.object_id_store();
        assert_eq!(store.load_object_id(1, 0).await.unwrap(), None);
    }

    #[tokio::test]
    async fn open_at_path_enables_wal() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(&dir.path().join("core.db")).await.unwrap();
        let (mode,): (String,) = sqlx::query_as("PRAGMA journal_mode")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
    }

    #[tokio::test]
    async fn ping_succeeds_on_open_pool() {
        let db = Database::open_in_memory().await.unwrap();
        db.ping().await.unwrap();
    }
}
