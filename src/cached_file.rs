//! `CachedNetworkFile`: per-open-handle read/write/seek/truncate/close
//! orchestration over a [`crate::segment::FileSegment`] (spec §4.3, "the
//! hardest algorithm").

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, instrument, warn};

use crate::config::SEQUENTIAL_EXPIRE_COOLDOWN;
use crate::context::FileCacheContext;
use crate::error::{CoreError, Result};
use crate::segment::{FileSegment, SaveableStatus, SegmentState, READABLE_LENGTH_WHOLE_FILE};
use crate::state::{AccessToken, FileState};

/// Speculative-read slack (spec §4.3 step 5): once `readable_length` is
/// within this many bytes of covering a requested range, attempt the read
/// instead of waiting for the next watermark tick — the writer may be
/// mid-flush on the trailing block.
const READ_SLACK_BYTES: i64 = 64 * 1024;

/// One open handle on a cached network file. Built by
/// [`FileCacheContext::open`] plus a [`FileSegment`] façade; released by
/// [`CachedNetworkFile::close`].
pub struct CachedNetworkFile {
    ctx: Arc<FileCacheContext>,
    state: Arc<FileState>,
    segment: FileSegment,
    token: Mutex<Option<AccessToken>>,
    write_count: AtomicU64,
}

impl CachedNetworkFile {
    /// Opens `virtual_path` for the access described by `params`, resolving
    /// sharing-mode arbitration and attaching a segment (spec §4.2, §4.3).
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::SharingViolation`] if `params` conflicts with an
    /// existing open.
    #[instrument(skip(ctx))]
    pub async fn open(
        ctx: Arc<FileCacheContext>,
        virtual_path: &std::path::Path,
        params: crate::state::FileOpenParams,
    ) -> Result<Self> {
        let (state, token) = ctx.open(virtual_path, params).await?;
        let segment_info = state.segment().ok_or_else(|| CoreError::Internal {
            kind: crate::error::InternalErrorKind::Other,
            message: "state_for always attaches a segment".to_string(),
        })?;
        let segment = FileSegment::new(segment_info, params.desired_access.write);
        Ok(Self {
            ctx,
            state,
            segment,
            token: Mutex::new(Some(token)),
            write_count: AtomicU64::new(0),
        })
    }

    #[must_use]
    pub fn state(&self) -> &Arc<FileState> {
        &self.state
    }

    /// Reads up to `len` bytes at `file_off` into `buf` (spec §4.3 steps 1-6).
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::FileOffline`] if the segment carries a sticky
    /// load error, or if data does not become available within
    /// `config.data_load_wait`.
    #[instrument(skip(self, buf))]
    pub async fn read(&self, buf: &mut [u8], len: usize, file_off: i64) -> Result<usize> {
        let info = Arc::clone(self.segment.info());
        let len = len.min(buf.len());
        let want = i64::try_from(len).unwrap_or(i64::MAX);

        // Step 1: sticky load error is terminal until the file state expires
        // and resets the segment.
        if info.state() == SegmentState::Error {
            return Err(CoreError::FileOffline(format!(
                "{} carries a sticky load error",
                self.state.path().display()
            )));
        }

        // Step 2: classify sequential-vs-random (hint only, feeds close-time
        // cooldown selection).
        let sequential = self.segment.classify_sequential(file_off, want);
        self.state.set_sequential_only(sequential);

        // Step 3: kick off a Load if nothing has ever been queued for this
        // segment.
        if info.state() == SegmentState::Initial && !info.queued() {
            self.segment.create_temporary_file()?;
            if info.mark_queued() {
                info.transition(SegmentState::LoadWait)?;
                self.enqueue_load().await?;
            }
        }
        self.segment.open()?;

        // Step 4: fast path — already covered, no waiting needed.
        if info.has_data_for(file_off, want) {
            return Ok(self.segment.read_bytes(buf, len, file_off)?);
        }

        // Step 5: bounded wait loop, polling the readable-length watermark
        // and speculatively reading once within slack of the requested range.
        let budget = crate::segment::WaitBudget::new(self.ctx.config.data_load_wait);
        loop {
            if info.load_error() || info.state() == SegmentState::Error {
                return Err(CoreError::FileOffline(format!(
                    "load failed for {}",
                    self.state.path().display()
                )));
            }

            if info.state().is_available() {
                // Terminal: the load/save is done, so whatever is on disk
                // now is all there will ever be. A range starting at or
                // extending past EOF legitimately reads fewer bytes than
                // requested instead of waiting out the whole budget (spec
                // §8: `truncate(n); read(k, n)` must return 0 bytes, not
                // time out with `FileOffline`).
                return Ok(self.segment.read_bytes(buf, len, file_off)?);
            }

            let readable = info.readable_length();
            let within_slack = readable == READABLE_LENGTH_WHOLE_FILE
                || readable + READ_SLACK_BYTES >= file_off + want;
            if within_slack {
                let n = self.segment.read_bytes(buf, len, file_off)?;
                if n >= len || info.has_data_for(file_off, want) {
                    return Ok(n);
                }
            }
            if budget.exhausted() {
                break;
            }
            let sleep_for = self.ctx.config.data_poll_sleep.min(budget.remaining());
            self.segment.wait_for_data(sleep_for).await;
        }

        // Step 6: budget exhausted without reaching coverage — sticky error
        // and fail the caller.
        warn!(
            path = %self.state.path().display(),
            file_off,
            len,
            "timed out waiting for segment data"
        );
        info.set_load_error(true);
        let _ = info.transition(SegmentState::Error);
        Err(CoreError::FileOffline(format!(
            "timed out waiting for data at offset {file_off} in {}",
            self.state.path().display()
        )))
    }

    /// Writes `len` bytes from `buf` at `file_off` (spec §4.3 write path).
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::AccessDenied`] if this handle was opened
    /// read-only.
    #[instrument(skip(self, buf))]
    pub async fn write(&self, buf: &[u8], len: usize, file_off: i64) -> Result<usize> {
        if !self.segment.writable() {
            return Err(CoreError::AccessDenied(format!(
                "write attempted on a read-only handle for {}",
                self.state.path().display()
            )));
        }
        let written = len.min(buf.len());
        self.segment.create_temporary_file()?;
        self.segment.open()?;
        let status = self.segment.write_bytes(buf, written, file_off)?;
        self.write_count.fetch_add(1, Ordering::Relaxed);

        if status == SaveableStatus::Saveable {
            self.schedule_persist().await?;
        }
        Ok(written)
    }

    /// Truncates the backing file to `size` bytes, scheduling a save the
    /// same way a write does (spec §4.3).
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::AccessDenied`] if this handle was opened
    /// read-only.
    #[instrument(skip(self))]
    pub async fn truncate(&self, size: i64) -> Result<()> {
        if !self.segment.writable() {
            return Err(CoreError::AccessDenied(format!(
                "truncate attempted on a read-only handle for {}",
                self.state.path().display()
            )));
        }
        self.segment.create_temporary_file()?;
        self.segment.open()?;
        self.segment.truncate(size)?;
        self.write_count.fetch_add(1, Ordering::Relaxed);
        self.schedule_persist().await
    }

    /// Schedules a Save if nothing is currently queued for this segment, or
    /// a Load (so the worker's post-load chaining picks up the pending
    /// write once it completes) if the segment has never been loaded at
    /// all. If a request is already in flight, this is a no-op — the write
    /// is already reflected in `segment.updated()`, and the worker that
    /// eventually clears the in-flight request checks that flag and chains
    /// the follow-up itself (spec §3 at-most-one-outstanding invariant).
    async fn schedule_persist(&self) -> Result<()> {
        let info = Arc::clone(self.segment.info());
        if !info.mark_queued() {
            debug!(path = %self.state.path().display(), "save deferred: request already in flight");
            return Ok(());
        }
        match info.state() {
            SegmentState::Available | SegmentState::Saved => {
                info.transition(SegmentState::SaveWait)?;
                self.enqueue_save().await?;
            }
            _ => {
                // Never loaded (brand-new file written before any read).
                // Queue the load instead; `updated()` stays true across it,
                // so the worker chains the pending save once it lands.
                info.transition(SegmentState::LoadWait)?;
                self.enqueue_load().await?;
            }
        }
        Ok(())
    }

    async fn enqueue_load(&self) -> Result<()> {
        let info = self.segment.info();
        let req = self.ctx.load_request(
            &self.state,
            info.stream_id(),
            info.temp_path().to_path_buf(),
            self.state.path().to_path_buf(),
        );
        self.ctx.enqueue(req).await?;
        Ok(())
    }

    async fn enqueue_save(&self) -> Result<()> {
        let info = self.segment.info();
        let req = self.ctx.save_request(
            &self.state,
            info.stream_id(),
            info.temp_path().to_path_buf(),
            self.state.path().to_path_buf(),
        );
        self.ctx.enqueue(req).await?;
        Ok(())
    }

    /// Flushes any pending write and releases the access token (spec §4.3
    /// close path). Consumes `self` — a closed handle cannot be reused.
    ///
    /// # Errors
    ///
    /// Returns an error only if a final save could not be durably queued.
    #[instrument(skip(self))]
    pub async fn close(self) -> Result<()> {
        let info = Arc::clone(self.segment.info());
        if self.write_count.load(Ordering::Relaxed) > 0 && info.updated() {
            self.schedule_persist().await?;
        }
        self.segment.close();

        let token = self.token.lock().unwrap_or_else(std::sync::PoisonError::into_inner).take();
        if let Some(token) = token {
            self.ctx
                .state_cache
                .release_file_access(&self.state, token, SEQUENTIAL_EXPIRE_COOLDOWN);
        }
        Ok(())
    }
}
