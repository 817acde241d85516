//! Rolling temp-file directory layout and startup cleanup (spec §6).
//!
//! Mirrors the teacher's filesystem-layout helpers (`download/filename.rs`
//! picking a safe on-disk name) but for the cache's own `ldrN` tree instead
//! of user-downloaded filenames.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use tracing::{info, instrument};

use crate::error::Result;
use crate::request::{DBQueueInterface, FileRequest};

/// Prefix every `ldrN` sub-directory carries, used by the cleanup scan to
/// recognize the cache's own directories among whatever else lives under
/// `temp_dir`.
pub const LDR_DIR_PREFIX: &str = "ldr";
/// Prefix every cached temp file carries.
pub const LDR_FILE_PREFIX: &str = "ldr_";

/// Assigns rolling `ldrN` sub-directories under `temp_dir`, rolling over to
/// a fresh one once the current directory holds `max_files_per_directory`
/// entries (spec §6).
pub struct TempStore {
    root: PathBuf,
    max_files_per_directory: u32,
    current_dir_index: AtomicU32,
    current_dir_count: AtomicU32,
}

impl TempStore {
    #[must_use]
    pub fn new(root: PathBuf, max_files_per_directory: u32) -> Self {
        Self {
            root,
            max_files_per_directory,
            current_dir_index: AtomicU32::new(0),
            current_dir_count: AtomicU32::new(0),
        }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Names the temp path for `(file_id, stream_id)` in the currently
    /// active `ldrN` directory, rolling to the next one if full.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::CoreError::Internal`] if the directory
    /// cannot be created.
    pub fn path_for(&self, file_id: i64, stream_id: i32) -> Result<PathBuf> {
        let count = self.current_dir_count.fetch_add(1, Ordering::SeqCst);
        let index = if count >= self.max_files_per_directory {
            self.current_dir_count.store(1, Ordering::SeqCst);
            self.current_dir_index.fetch_add(1, Ordering::SeqCst) + 1
        } else {
            self.current_dir_index.load(Ordering::SeqCst)
        };

        let dir = self.root.join(format!("{LDR_DIR_PREFIX}{index}"));
        std::fs::create_dir_all(&dir)?;

        let name = if stream_id == 0 {
            format!("{LDR_FILE_PREFIX}{file_id}.tmp")
        } else {
            format!("{LDR_FILE_PREFIX}{file_id}_{stream_id}.tmp")
        };
        Ok(dir.join(name))
    }

    /// Startup recovery scan (spec §6): deletes any `ldrN` directory/file
    /// with no corresponding durable Save/TransSave request, and returns
    /// the requests recovered for files that *were* preserved so the
    /// caller can re-enqueue them.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::CoreError::Internal`] if the scan's
    /// directory reads or the durable lookup fail.
    #[instrument(skip(self, queue))]
    pub async fn recover(&self, queue: &dyn DBQueueInterface) -> Result<Vec<FileRequest>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let recovered = queue
            .perform_queue_cleanup(&self.root, &[LDR_DIR_PREFIX, LDR_FILE_PREFIX])
            .await?;
        info!(recovered = recovered.len(), "temp store recovery scan complete");
        Ok(recovered)
    }
}

/// Monotonic request-sequence tracking used by a `QueueLoader` to avoid
/// reprocessing already-seen durable records (spec §4.4 "never load records
/// with seq ≤ last_seq_no unless a reset occurred").
pub struct SeqWatermark(AtomicU64);

impl SeqWatermark {
    #[must_use]
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    #[must_use]
    pub fn get(&self) -> i64 {
        i64::try_from(self.0.load(Ordering::SeqCst)).unwrap_or(i64::MAX)
    }

    /// Advances the watermark to `seq` if it is higher than the current
    /// value. No-op otherwise.
    pub fn advance(&self, seq: i64) {
        let seq = u64::try_from(seq).unwrap_or(0);
        self.0.fetch_max(seq, Ordering::SeqCst);
    }

    /// Resets the watermark to zero, re-enabling replay of already-seen
    /// records (spec §4.4 "unless a reset occurred due to an error").
    pub fn reset(&self) {
        self.0.store(0, Ordering::SeqCst);
    }
}

impl Default for SeqWatermark {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn path_for_rolls_over_after_max_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = TempStore::new(dir.path().to_path_buf(), 2);
        let p1 = store.path_for(1, 0).unwrap();
        let p2 = store.path_for(2, 0).unwrap();
        let p3 = store.path_for(3, 0).unwrap();

        assert!(p1.to_string_lossy().contains("ldr0"));
        assert!(p2.to_string_lossy().contains("ldr0"));
        assert!(p3.to_string_lossy().contains("ldr1"), "third file should roll to ldr1: {p3:?}");
    }

    #[test]
    fn path_for_names_unnamed_stream_without_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let store = TempStore::new(dir.path().to_path_buf(), 500);
        let path = store.path_for(42, 0).unwrap();
        assert_eq!(path.file_name().unwrap().to_str().unwrap(), "ldr_42.tmp");
    }

    #[test]
    fn path_for_names_named_stream_with_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let store = TempStore::new(dir.path().to_path_buf(), 500);
        let path = store.path_for(42, 3).unwrap();
        assert_eq!(path.file_name().unwrap().to_str().unwrap(), "ldr_42_3.tmp");
    }

    #[test]
    fn seq_watermark_only_advances_forward() {
        let wm = SeqWatermark::new();
        wm.advance(10);
        wm.advance(5);
        assert_eq!(wm.get(), 10);
        wm.advance(20);
        assert_eq!(wm.get(), 20);
    }

    #[test]
    fn seq_watermark_reset_allows_replay() {
        let wm = SeqWatermark::new();
        wm.advance(10);
        wm.reset();
        assert_eq!(wm.get(), 0);
    }
}
