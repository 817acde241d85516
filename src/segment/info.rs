//! `SegmentInfo`: per-file shared metadata for the local temp-file cache of
//! a remote object (spec §3, §4.1).

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tokio::sync::Notify;
use tracing::{instrument, trace};

use crate::error::{CoreError, Result};

/// States a segment moves through, per the diagram in spec §4.1.
///
/// Monotonic except `Available -> SaveWait`, which is the only
/// backward-looking edge (a loaded file being reused for writes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentState {
    /// No temp file populated yet, nothing queued.
    Initial,
    /// A `Load` request has been queued but not yet picked up.
    LoadWait,
    /// A read-worker is actively populating the temp file.
    Loading,
    /// The full file is present and readable.
    Available,
    /// Writes occurred; a `Save` request has been queued but not picked up.
    SaveWait,
    /// A write-worker is actively persisting the temp file.
    Saving,
    /// The save completed; behaves identically to `Available`.
    Saved,
    /// Sticky failure state. Only `reset_to_initial` (driven by file-state
    /// expiry) may clear it.
    Error,
}

impl SegmentState {
    /// Whether this state behaves as "loaded and readable" for the purposes
    /// of `has_data_for`/`readable_length` checks.
    #[must_use]
    pub fn is_available(self) -> bool {
        matches!(self, Self::Available | Self::Saved)
    }

    fn is_valid_transition(self, to: Self) -> bool {
        use SegmentState::{Available, Error, Initial, LoadWait, Loading, SaveWait, Saved, Saving};
        match (self, to) {
            (Initial, LoadWait)
            | (LoadWait, Loading)
            | (LoadWait, Error)
            | (Loading, Available)
            | (Loading, Error)
            | (Available, SaveWait)
            | (Available, Available)
            | (Saved, SaveWait)
            | (SaveWait, Saving)
            | (SaveWait, Error)
            | (Saving, Saved)
            | (Saving, Error) => true,
            // Reset-to-initial is only reachable via `reset_to_initial`, not
            // via ordinary `transition`, so it is intentionally excluded here.
            _ => false,
        }
    }
}

/// -1 sentinel meaning "the whole file is loadable as one shot" (spec §3).
pub const READABLE_LENGTH_WHOLE_FILE: i64 = -1;

struct Inner {
    state: SegmentState,
    /// A Load/Save/TransSave request currently sits in a queue for this
    /// segment (in-memory or durable). At most one may be outstanding.
    queued: bool,
    /// Writes occurred since the last successful save.
    updated: bool,
    /// Highest offset confirmed readable by an in-progress loader, or
    /// [`READABLE_LENGTH_WHOLE_FILE`].
    readable_length: i64,
    /// Total length of the backing temp file, once known.
    file_length: i64,
    load_error: bool,
    save_error: bool,
}

/// Per-file shared metadata: path of the backing temp file, load/save
/// state, the readable-length watermark, and the two condition variables
/// readers and writers park on.
///
/// Multiple [`crate::segment::FileSegment`] handles may share one
/// `SegmentInfo` (spec §3).
pub struct SegmentInfo {
    temp_path: PathBuf,
    stream_id: i32,
    inner: Mutex<Inner>,
    /// Signalled whenever new data becomes readable or a load fails.
    pub(crate) data_available: Notify,
    /// Signalled whenever buffered writes drain (backpressure release).
    pub(crate) write_buffer: Notify,
}

impl SegmentInfo {
    /// Creates a segment bound to `temp_path`, immutable once set (spec §3).
    #[must_use]
    pub fn new(temp_path: PathBuf, stream_id: i32) -> Self {
        Self {
            temp_path,
            stream_id,
            inner: Mutex::new(Inner {
                state: SegmentState::Initial,
                queued: false,
                updated: false,
                readable_length: 0,
                file_length: 0,
                load_error: false,
                save_error: false,
            }),
            data_available: Notify::new(),
            write_buffer: Notify::new(),
        }
    }

    /// Path of the backing temp file. Immutable once the segment is built.
    #[must_use]
    pub fn temp_path(&self) -> &Path {
        &self.temp_path
    }

    /// NTFS-stream id this segment caches (0 = unnamed data stream).
    #[must_use]
    pub fn stream_id(&self) -> i32 {
        self.stream_id
    }

    #[must_use]
    pub fn state(&self) -> SegmentState {
        self.lock().state
    }

    #[must_use]
    pub fn queued(&self) -> bool {
        self.lock().queued
    }

    #[must_use]
    pub fn updated(&self) -> bool {
        self.lock().updated
    }

    #[must_use]
    pub fn readable_length(&self) -> i64 {
        self.lock().readable_length
    }

    #[must_use]
    pub fn file_length(&self) -> i64 {
        self.lock().file_length
    }

    #[must_use]
    pub fn load_error(&self) -> bool {
        self.lock().load_error
    }

    #[must_use]
    pub fn save_error(&self) -> bool {
        self.lock().save_error
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Advances the segment's state, enforcing the monotonicity invariant
    /// from spec §4.1. Illegal transitions are a programming error turned
    /// into a recoverable `CoreError` rather than a silent no-op.
    #[instrument(skip(self), fields(temp_path = %self.temp_path.display()))]
    pub fn transition(&self, to: SegmentState) -> Result<()> {
        let mut inner = self.lock();
        if !inner.state.is_valid_transition(to) {
            return Err(CoreError::Internal {
                kind: crate::error::InternalErrorKind::Other,
                message: format!("illegal segment transition {:?} -> {:?}", inner.state, to),
            });
        }
        trace!(from = ?inner.state, to = ?to, "segment state transition");
        inner.state = to;
        Ok(())
    }

    /// Marks a `Load`/`Save`/`TransSave` request as queued. Enforces the
    /// at-most-one-outstanding invariant (spec §3, testable property #1):
    /// returns `false` if a request is already queued, so the caller does
    /// not enqueue a duplicate.
    #[must_use]
    pub fn mark_queued(&self) -> bool {
        let mut inner = self.lock();
        if inner.queued {
            return false;
        }
        inner.queued = true;
        true
    }

    /// Clears the queued flag once a worker has finished processing the
    /// request (terminal Success/Error; a `Requeue` keeps it set).
    pub fn clear_queued(&self) {
        self.lock().queued = false;
    }

    /// Reverts an in-progress `Loading`/`Saving` segment back to
    /// `LoadWait`/`SaveWait` after a worker reports `Requeue` for the
    /// attempt (spec §4.4, §7: "persistent failures leave the durable
    /// record in place" rather than becoming terminal after one retry).
    ///
    /// This is the worker-level retry edge, not part of spec §4.1's
    /// forward-only diagram, so it bypasses `transition`'s validation —
    /// it only ever fires from the exact in-progress state a worker just
    /// set, never from an arbitrary state. Returns `false` (a no-op) if
    /// the segment is not in the expected in-progress state.
    pub fn requeue_from(&self, in_progress: SegmentState) -> bool {
        let mut inner = self.lock();
        let waiting = match in_progress {
            SegmentState::Loading => SegmentState::LoadWait,
            SegmentState::Saving => SegmentState::SaveWait,
            _ => return false,
        };
        if inner.state != in_progress {
            return false;
        }
        inner.state = waiting;
        true
    }

    pub fn mark_updated(&self) {
        self.lock().updated = true;
    }

    pub fn clear_updated(&self) {
        self.lock().updated = false;
    }

    /// Sets the readable-length watermark. Enforces the monotonic-non-decreasing
    /// invariant (spec §8, testable property #2) except via `reset_to_initial`.
    pub fn set_readable_length(&self, value: i64) {
        let mut inner = self.lock();
        if value == READABLE_LENGTH_WHOLE_FILE || value >= inner.readable_length {
            inner.readable_length = value;
        }
    }

    pub fn set_file_length(&self, value: i64) {
        self.lock().file_length = value;
    }

    pub fn set_load_error(&self, value: bool) {
        self.lock().load_error = value;
    }

    pub fn set_save_error(&self, value: bool) {
        self.lock().save_error = value;
    }

    /// Whether the byte range `[offset, offset+len)` is confirmed available
    /// without blocking.
    #[must_use]
    pub fn has_data_for(&self, offset: i64, len: i64) -> bool {
        let inner = self.lock();
        if !inner.state.is_available() {
            return false;
        }
        inner.readable_length == READABLE_LENGTH_WHOLE_FILE
            || inner.readable_length >= offset + len
    }

    /// Wakes any task parked in `wait_for_data`.
    pub fn signal_data_available(&self) {
        self.data_available.notify_waiters();
    }

    /// Wakes any task parked on write-buffer backpressure.
    pub fn signal_write_buffer_drained(&self) {
        self.write_buffer.notify_waiters();
    }

    /// Resets the segment back to `Initial`, clearing sticky errors and the
    /// readable-length watermark. Only the file-state cache's expiry path
    /// may call this (spec §9: "only reset-to-Initial ... may clear it").
    pub fn reset_to_initial(&self) {
        let mut inner = self.lock();
        inner.state = SegmentState::Initial;
        inner.queued = false;
        inner.updated = false;
        inner.readable_length = 0;
        inner.load_error = false;
        inner.save_error = false;
    }
}

impl std::fmt::Debug for SegmentInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("SegmentInfo")
            .field("temp_path", &self.temp_path)
            .field("stream_id", &self.stream_id)
            .field("state", &inner.state)
            .field("queued", &inner.queued)
            .field("readable_length", &inner.readable_length)
            .finish()
    }
}
