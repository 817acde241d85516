//! `FileSegment`: a thin, per-open-handle façade over a shared
//! [`SegmentInfo`] plus an open temp-file handle (spec §3, §4.1).

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{instrument, warn};

use crate::error::{CoreError, InternalErrorKind, Result};
use crate::segment::info::{SegmentInfo, SegmentState};

/// Backpressure / capacity signal returned by [`FileSegment::write_bytes`].
///
/// Mirrors spec §4.1's `SaveableStatus` for the temp-file-backed segment
/// variant. This core only ever materializes a temp-file-backed segment;
/// the in-memory-buffered variant's `MaxBuffers`/`BufferOverflow`
/// backpressure paths are modeled at the `CachedNetworkFile` layer instead
/// (see its write-buffer wait loop).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveableStatus {
    /// Write buffered locally; no save needed yet.
    Buffering,
    /// Enough has changed that a save should be scheduled.
    Saveable,
}

/// Thin façade a single open handle uses over a shared [`SegmentInfo`].
///
/// Multiple `FileSegment`s may share one `SegmentInfo` (spec §3); each
/// holds its own `std::fs::File` handle and write-permission flag.
pub struct FileSegment {
    info: Arc<SegmentInfo>,
    handle: Mutex<Option<File>>,
    writable: bool,
    last_read: Mutex<Option<(i64, i64)>>,
}

impl FileSegment {
    /// Builds a façade over `info`. Does not open the temp file yet —
    /// callers open lazily via [`FileSegment::open`].
    #[must_use]
    pub fn new(info: Arc<SegmentInfo>, writable: bool) -> Self {
        Self {
            info,
            handle: Mutex::new(None),
            writable,
            last_read: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn info(&self) -> &Arc<SegmentInfo> {
        &self.info
    }

    #[must_use]
    pub fn writable(&self) -> bool {
        self.writable
    }

    /// Idempotently creates the backing temp file if it does not exist yet.
    /// Fails only on a genuine I/O error (spec §4.1).
    #[instrument(skip(self))]
    pub fn create_temporary_file(&self) -> Result<()> {
        if let Some(parent) = self.info.temp_path().parent() {
            std::fs::create_dir_all(parent)?;
        }
        OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .read(true)
            .open(self.info.temp_path())?;
        Ok(())
    }

    /// Opens (or reuses) the temp-file handle for this façade.
    #[instrument(skip(self))]
    pub fn open(&self) -> Result<()> {
        let mut guard = self.lock_handle();
        if guard.is_some() {
            return Ok(());
        }
        let file = OpenOptions::new()
            .read(true)
            .write(self.writable)
            .create(self.writable)
            .open(self.info.temp_path())?;
        *guard = Some(file);
        Ok(())
    }

    /// Closes this façade's handle. Safe to call repeatedly; the shared
    /// temp file itself is only deleted once every `FileSegment` sharing
    /// the `SegmentInfo` has closed (reference-counted by the owning
    /// `FileState`, spec §4.2/§5).
    pub fn close(&self) {
        *self.lock_handle() = None;
    }

    fn lock_handle(&self) -> std::sync::MutexGuard<'_, Option<File>> {
        self.handle.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Reopens the handle, used as a one-time defensive retry after an
    /// unexpected short read (spec §4.3 step 4).
    fn reopen(&self) -> Result<()> {
        self.close();
        self.open()
    }

    /// Reads up to `len` bytes at `file_off` into `buf`, returning the
    /// number of bytes actually read. Blocks only the calling thread for
    /// local disk I/O — callers must have already established via
    /// [`SegmentInfo::has_data_for`] that the range is available; this
    /// method never waits for a load to complete (spec §4.1).
    #[instrument(skip(self, buf))]
    pub fn read_bytes(&self, buf: &mut [u8], len: usize, file_off: i64) -> Result<usize> {
        let len = len.min(buf.len());
        let mut guard = self.lock_handle();
        let file = guard.as_ref().ok_or_else(|| CoreError::Internal {
            kind: InternalErrorKind::Io,
            message: "segment handle not open".to_string(),
        })?;
        let read = match file.read_at(&mut buf[..len], u64::try_from(file_off).unwrap_or(0)) {
            Ok(n) => n,
            Err(e) => return Err(e.into()),
        };
        drop(guard);

        if read == 0 && len > 0 {
            // Defensive: reopen once and retry against stale FD state (spec §4.3 step 4).
            warn!(file_off, len, "short read returned 0 bytes, reopening handle");
            self.reopen()?;
            guard = self.lock_handle();
            let file = guard.as_ref().ok_or_else(|| CoreError::Internal {
                kind: InternalErrorKind::Io,
                message: "segment handle not open after reopen".to_string(),
            })?;
            return Ok(file.read_at(&mut buf[..len], u64::try_from(file_off).unwrap_or(0))?);
        }
        Ok(read)
    }

    /// Writes `len` bytes from `buf` at `file_off`, returning the
    /// [`SaveableStatus`] verdict for whether a save should now be
    /// scheduled.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::AccessDenied`] if this façade was opened
    /// read-only.
    #[instrument(skip(self, buf))]
    pub fn write_bytes(&self, buf: &[u8], len: usize, file_off: i64) -> Result<SaveableStatus> {
        if !self.writable {
            return Err(CoreError::AccessDenied(
                "write attempted on a read-only segment handle".to_string(),
            ));
        }
        let len = len.min(buf.len());
        let guard = self.lock_handle();
        let file = guard.as_ref().ok_or_else(|| CoreError::Internal {
            kind: InternalErrorKind::Io,
            message: "segment handle not open".to_string(),
        })?;
        file.write_at(&buf[..len], u64::try_from(file_off).unwrap_or(0))?;
        drop(guard);

        self.info.mark_updated();
        let new_end = file_off + i64::try_from(len).unwrap_or(0);
        if new_end > self.info.file_length() {
            self.info.set_file_length(new_end);
        }
        Ok(SaveableStatus::Saveable)
    }

    /// Truncates the backing temp file to `size` bytes. Idempotent (spec §8).
    #[instrument(skip(self))]
    pub fn truncate(&self, size: i64) -> Result<()> {
        let guard = self.lock_handle();
        let file = guard.as_ref().ok_or_else(|| CoreError::Internal {
            kind: InternalErrorKind::Io,
            message: "segment handle not open".to_string(),
        })?;
        file.set_len(u64::try_from(size).unwrap_or(0))?;
        drop(guard);
        self.info.set_file_length(size);
        self.info.set_readable_length(size.max(0));
        self.info.mark_updated();
        Ok(())
    }

    /// Parks on the data-available condvar until signalled or `timeout`
    /// elapses, whichever comes first. Spurious wakeups and timeouts are
    /// treated identically — callers re-check their predicate after every
    /// wake (spec §9, "exceptions-as-control-flow").
    pub async fn wait_for_data(&self, timeout: Duration) {
        let notified = self.info.data_available.notified();
        let _ = tokio::time::timeout(timeout, notified).await;
    }

    /// Records a sequential-vs-random read classification hint for the
    /// caller (spec §4.3 step 2). Returns `true` if this read is sequential
    /// relative to the last one observed through this façade.
    pub fn classify_sequential(&self, file_off: i64, len: i64) -> bool {
        let mut last = self.last_read.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let sequential = matches!(*last, Some((off, l)) if off + l == file_off);
        *last = Some((file_off, len));
        sequential
    }
}

/// Bounded wait helper shared by the read and write backpressure loops:
/// runs `predicate` in a tight poll against `poll_sleep`, bailing out once
/// `total_wait` exceeds `bound`.
pub(crate) struct WaitBudget {
    bound: Duration,
    start: Instant,
}

impl WaitBudget {
    pub(crate) fn new(bound: Duration) -> Self {
        Self {
            bound,
            start: Instant::now(),
        }
    }

    pub(crate) fn exhausted(&self) -> bool {
        self.start.elapsed() >= self.bound
    }

    pub(crate) fn remaining(&self) -> Duration {
        self.bound.saturating_sub(self.start.elapsed())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn temp_path(dir: &tempfile::TempDir, name: &str) -> PathBuf {
        dir.path().join(name)
    }

    #[test]
    fn create_and_write_then_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = temp_path(&dir, "ldr_1.tmp");
        let info = Arc::new(SegmentInfo::new(path, 0));
        let seg = FileSegment::new(Arc::clone(&info), true);
        seg.create_temporary_file().unwrap();
        seg.open().unwrap();

        let payload = b"hello cache world";
        let status = seg.write_bytes(payload, payload.len(), 0).unwrap();
        assert_eq!(status, SaveableStatus::Saveable);

        let mut buf = vec![0u8; payload.len()];
        let n = seg.read_bytes(&mut buf, payload.len(), 0).unwrap();
        assert_eq!(n, payload.len());
        assert_eq!(&buf, payload);
    }

    #[test]
    fn truncate_is_idempotent_and_subsequent_read_returns_zero() {
        let dir = tempfile::tempdir().unwrap();
        let path = temp_path(&dir, "ldr_2.tmp");
        let info = Arc::new(SegmentInfo::new(path, 0));
        let seg = FileSegment::new(Arc::clone(&info), true);
        seg.create_temporary_file().unwrap();
        seg.open().unwrap();
        seg.write_bytes(b"0123456789", 10, 0).unwrap();

        seg.truncate(4).unwrap();
        seg.truncate(4).unwrap(); // idempotent
        assert_eq!(info.file_length(), 4);

        let mut buf = vec![0u8; 8];
        let n = seg.read_bytes(&mut buf, 8, 4).unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn write_on_read_only_segment_is_denied() {
        let dir = tempfile::tempdir().unwrap();
        let path = temp_path(&dir, "ldr_3.tmp");
        let info = Arc::new(SegmentInfo::new(path, 0));
        let seg = FileSegment::new(info, false);
        seg.create_temporary_file().unwrap();
        seg.open().unwrap();

        let result = seg.write_bytes(b"x", 1, 0);
        assert!(matches!(result, Err(CoreError::AccessDenied(_))));
    }

    #[test]
    fn classify_sequential_detects_contiguous_reads() {
        let dir = tempfile::tempdir().unwrap();
        let path = temp_path(&dir, "ldr_4.tmp");
        let info = Arc::new(SegmentInfo::new(path, 0));
        let seg = FileSegment::new(info, true);

        assert!(!seg.classify_sequential(0, 100));
        assert!(seg.classify_sequential(100, 50));
        assert!(!seg.classify_sequential(1000, 50));
    }

    #[tokio::test]
    async fn wait_for_data_returns_on_signal() {
        let dir = tempfile::tempdir().unwrap();
        let path = temp_path(&dir, "ldr_5.tmp");
        let info = Arc::new(SegmentInfo::new(path, 0));
        let seg = FileSegment::new(Arc::clone(&info), true);

        let signal_info = Arc::clone(&info);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            signal_info.signal_data_available();
        });

        let start = Instant::now();
        seg.wait_for_data(Duration::from_secs(5)).await;
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn wait_for_data_returns_on_timeout_without_signal() {
        let dir = tempfile::tempdir().unwrap();
        let path = temp_path(&dir, "ldr_6.tmp");
        let info = Arc::new(SegmentInfo::new(path, 0));
        let seg = FileSegment::new(info, true);

        let start = Instant::now();
        seg.wait_for_data(Duration::from_millis(30)).await;
        assert!(start.elapsed() >= Duration::from_millis(30));
    }
}
