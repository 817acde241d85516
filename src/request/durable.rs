//! `DBQueueInterface`: durable persistence for queued requests (spec §4.6).
//!
//! The core only *consumes* this contract — a real deployment's metadata
//! layer can supply any implementation. [`SqliteQueueStore`] is the
//! reference implementation shipped with the crate, the same role the
//! teacher's `Queue` plays over its own `download` table.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use tracing::instrument;

use crate::error::Result;
use crate::request::types::{
    DeleteFileRequest, FileRequest, MultipleFileRequest, RequestAttr, RequestKind,
    SingleFileRequest,
};

fn attrs_to_json(attrs: &[RequestAttr]) -> Option<String> {
    if attrs.is_empty() {
        return None;
    }
    serde_json::to_string(attrs).ok()
}

fn attrs_from_json(raw: Option<&str>) -> Vec<RequestAttr> {
    raw.and_then(|s| serde_json::from_str(s).ok()).unwrap_or_default()
}

/// External contract for durably persisting queued requests (spec §4.6).
///
/// # Errors
///
/// Every method returns [`crate::error::CoreError::Internal`] on a store
/// failure; callers (the background workers) are responsible for
/// classifying and requeuing, never for unwrapping this directly.
#[async_trait]
pub trait DBQueueInterface: Send + Sync {
    /// Persists `req`, returning the assigned monotonic sequence number.
    async fn queue_file_request(&self, req: &FileRequest) -> Result<i64>;

    /// Removes the durable record for `(file_id, stream_id, kind)`. A no-op
    /// if already absent (spec §8 idempotence law).
    async fn delete_file_request(&self, file_id: i64, stream_id: i32, kind: RequestKind)
        -> Result<()>;

    /// Loads up to `limit` requests of `kind` with `sequence_no > after_seq`,
    /// in ascending sequence order (spec §4.4 "never load records with
    /// seq ≤ last_seq_no").
    async fn load_file_requests(
        &self,
        after_seq: i64,
        kind: RequestKind,
        limit: i64,
    ) -> Result<Vec<FileRequest>>;

    /// Loads every row sharing `tran_id`, in transaction-ordinal order.
    async fn load_transaction_request(&self, tran_id: i64) -> Result<Option<MultipleFileRequest>>;

    /// Startup GC: removes any temp sub-directory/file under `temp_dir`
    /// whose basename starts with one of `prefixes` and has no
    /// corresponding durable request, returning the Save/TransSave requests
    /// whose temp file *was* preserved so they can be re-enqueued
    /// (spec §6 "Startup cleanup").
    async fn perform_queue_cleanup(
        &self,
        temp_dir: &Path,
        prefixes: &[&str],
    ) -> Result<Vec<FileRequest>>;
}

/// `SQLite`-backed reference implementation of [`DBQueueInterface`].
#[derive(Debug, Clone)]
pub struct SqliteQueueStore {
    pool: SqlitePool,
}

impl SqliteQueueStore {
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_single(
        kind: i32,
        file_id: i64,
        stream_id: i32,
        virtual_path: String,
        temp_path: String,
        attrs: Option<String>,
        seq_no: i64,
    ) -> SingleFileRequest {
        SingleFileRequest {
            kind: RequestKind::from_i32(kind).unwrap_or(RequestKind::Save),
            file_id,
            stream_id,
            temp_path: PathBuf::from(temp_path),
            virtual_path: PathBuf::from(virtual_path),
            seq_no,
            thread_id: None,
            file_state_ref: None,
            attrs: attrs_from_json(attrs.as_deref()),
        }
    }
}

#[async_trait]
impl DBQueueInterface for SqliteQueueStore {
    #[instrument(skip(self, req))]
    async fn queue_file_request(&self, req: &FileRequest) -> Result<i64> {
        match req {
            FileRequest::Single(r) => {
                let row = sqlx::query(
                    r"INSERT INTO queue_requests
                        (kind, file_id, stream_id, virtual_path, temp_path, attrs)
                      VALUES (?, ?, ?, ?, ?, ?)
                      RETURNING sequence_no",
                )
                .bind(r.kind.as_i32())
                .bind(r.file_id)
                .bind(r.stream_id)
                .bind(r.virtual_path.to_string_lossy().into_owned())
                .bind(r.temp_path.to_string_lossy().into_owned())
                .bind(attrs_to_json(&r.attrs))
                .fetch_one(&self.pool)
                .await?;
                Ok(row.get("sequence_no"))
            }
            FileRequest::Multiple(r) => {
                let mut tx = self.pool.begin().await?;
                let mut last_seq = 0;
                let count = r.files.len();
                for (ordinal, file) in r.files.iter().enumerate() {
                    let is_last = ordinal + 1 == count;
                    let row = sqlx::query(
                        r"INSERT INTO queue_requests
                            (kind, file_id, stream_id, virtual_path, temp_path, tran_id,
                             tran_ordinal, tran_is_last, attrs)
                          VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                          RETURNING sequence_no",
                    )
                    .bind(RequestKind::TransSave.as_i32())
                    .bind(file.file_id)
                    .bind(file.stream_id)
                    .bind(file.virtual_path.to_string_lossy().into_owned())
                    .bind(file.temp_path.to_string_lossy().into_owned())
                    .bind(r.tran_id)
                    .bind(i64::try_from(ordinal).unwrap_or(i64::MAX))
                    .bind(is_last)
                    .bind(attrs_to_json(&file.attrs))
                    .fetch_one(&mut *tx)
                    .await?;
                    last_seq = row.get("sequence_no");
                }
                tx.commit().await?;
                Ok(last_seq)
            }
            FileRequest::Delete(r) => {
                let row = sqlx::query(
                    r"INSERT INTO queue_requests
                        (kind, file_id, stream_id, virtual_path, temp_path)
                      VALUES (?, ?, ?, ?, ?)
                      RETURNING sequence_no",
                )
                .bind(RequestKind::Save.as_i32())
                .bind(r.file_id)
                .bind(r.stream_id)
                .bind(r.virtual_path.to_string_lossy().into_owned())
                .bind(r.temp_path.to_string_lossy().into_owned())
                .fetch_one(&self.pool)
                .await?;
                Ok(row.get("sequence_no"))
            }
        }
    }

    #[instrument(skip(self))]
    async fn delete_file_request(
        &self,
        file_id: i64,
        stream_id: i32,
        kind: RequestKind,
    ) -> Result<()> {
        sqlx::query(
            r"DELETE FROM queue_requests WHERE file_id = ? AND stream_id = ? AND kind = ?",
        )
        .bind(file_id)
        .bind(stream_id)
        .bind(kind.as_i32())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn load_file_requests(
        &self,
        after_seq: i64,
        kind: RequestKind,
        limit: i64,
    ) -> Result<Vec<FileRequest>> {
        let rows = sqlx::query(
            r"SELECT sequence_no, kind, file_id, stream_id, virtual_path, temp_path, attrs
              FROM queue_requests
              WHERE kind = ? AND sequence_no > ? AND tran_id IS NULL
              ORDER BY sequence_no ASC
              LIMIT ?",
        )
        .bind(kind.as_i32())
        .bind(after_seq)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| {
                FileRequest::Single(Self::row_to_single(
                    row.get("kind"),
                    row.get("file_id"),
                    row.get("stream_id"),
                    row.get("virtual_path"),
                    row.get("temp_path"),
                    row.get("attrs"),
                    row.get("sequence_no"),
                ))
            })
            .collect())
    }

    #[instrument(skip(self))]
    async fn load_transaction_request(&self, tran_id: i64) -> Result<Option<MultipleFileRequest>> {
        let rows = sqlx::query(
            r"SELECT sequence_no, kind, file_id, stream_id, virtual_path, temp_path, attrs
              FROM queue_requests
              WHERE tran_id = ?
              ORDER BY tran_ordinal ASC",
        )
        .bind(tran_id)
        .fetch_all(&self.pool)
        .await?;

        if rows.is_empty() {
            return Ok(None);
        }

        let files = rows
            .into_iter()
            .map(|row| {
                Self::row_to_single(
                    row.get("kind"),
                    row.get("file_id"),
                    row.get("stream_id"),
                    row.get("virtual_path"),
                    row.get("temp_path"),
                    row.get("attrs"),
                    row.get("sequence_no"),
                )
            })
            .collect();

        Ok(Some(MultipleFileRequest { tran_id, files }))
    }

    #[instrument(skip(self))]
    async fn perform_queue_cleanup(
        &self,
        temp_dir: &Path,
        prefixes: &[&str],
    ) -> Result<Vec<FileRequest>> {
        let preserved_paths: Vec<String> = sqlx::query(
            r"SELECT DISTINCT temp_path FROM queue_requests WHERE kind IN (2, 3)",
        )
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(|row| row.get("temp_path"))
        .collect();

        let mut recovered = Vec::new();
        let mut entries = tokio::fs::read_dir(temp_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !prefixes.iter().any(|p| name.starts_with(p)) {
                continue;
            }
            let path_str = path.to_string_lossy().into_owned();
            if preserved_paths.contains(&path_str) {
                continue;
            }
            if path.is_dir() {
                let _ = tokio::fs::remove_dir_all(&path).await;
            } else {
                let _ = tokio::fs::remove_file(&path).await;
            }
        }

        for temp_path in &preserved_paths {
            if let Some(req) = self.load_by_temp_path(temp_path).await? {
                recovered.push(req);
            }
        }
        Ok(recovered)
    }
}

impl SqliteQueueStore {
    async fn load_by_temp_path(&self, temp_path: &str) -> Result<Option<FileRequest>> {
        let row = sqlx::query(
            r"SELECT sequence_no, kind, file_id, stream_id, virtual_path, temp_path, attrs
              FROM queue_requests WHERE temp_path = ? AND tran_id IS NULL
              ORDER BY sequence_no ASC LIMIT 1",
        )
        .bind(temp_path)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| {
            FileRequest::Single(Self::row_to_single(
                row.get("kind"),
                row.get("file_id"),
                row.get("stream_id"),
                row.get("virtual_path"),
                row.get("temp_path"),
                row.get("attrs"),
                row.get("sequence_no"),
            ))
        }))
    }
}
