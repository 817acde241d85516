//! `FileState`: the keyed cache entry for a single virtual path (spec §3, §4.2).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde_json::Value as JsonValue;

use crate::segment::SegmentInfo;
use crate::state::access::{AccessToken, FileOpenParams};

/// Existence status of the virtual path this state caches (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathStatus {
    Unknown,
    NotExist,
    FileExists,
    DirectoryExists,
}

/// A byte-range lock record. Opaque to the core (spec §3: "lock_set, opaque
/// to the core") — the protocol front-end owns lock semantics; this just
/// tracks enough to report `LockConflict` on overlap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRangeLock {
    pub owner: u64,
    pub offset: i64,
    pub len: i64,
}

impl ByteRangeLock {
    #[must_use]
    fn overlaps(&self, other_offset: i64, other_len: i64) -> bool {
        self.offset < other_offset + other_len && other_offset < self.offset + self.len
    }
}

struct Inner {
    status: PathStatus,
    open_count: u64,
    tokens: Vec<AccessToken>,
    /// Generic attribute bag (spec §3: `FileInformation`, stream-list, etc).
    /// `SegmentInfo` itself is a dedicated field below, since every
    /// `FileState` this core manages has exactly one.
    attributes: HashMap<String, JsonValue>,
    segment: Option<std::sync::Arc<SegmentInfo>>,
    /// `None` means `NoTimeout` (pinned, spec §3 invariant:
    /// `open_count > 0 => expiry_at = NoTimeout`).
    expiry_at: Option<Instant>,
    locks: Vec<ByteRangeLock>,
    next_token_id: u64,
    /// Hint set by `CachedNetworkFile` when every read/write on this state
    /// has been sequential — used to pick the short 3s cooldown vs. the
    /// cache's default expire interval on close (spec §4.3).
    sequential_only: bool,
}

/// One entry in the [`crate::state::FileStateCache`], keyed by normalized
/// virtual path (spec §3).
pub struct FileState {
    path: PathBuf,
    pub file_id: i64,
    inner: Mutex<Inner>,
}

impl FileState {
    #[must_use]
    pub(crate) fn new(path: PathBuf, file_id: i64) -> Self {
        Self {
            path,
            file_id,
            inner: Mutex::new(Inner {
                status: PathStatus::Unknown,
                open_count: 0,
                tokens: Vec::new(),
                attributes: HashMap::new(),
                segment: None,
                expiry_at: None,
                locks: Vec::new(),
                next_token_id: 1,
                sequential_only: true,
            }),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    #[must_use]
    pub fn status(&self) -> PathStatus {
        self.lock().status
    }

    pub fn set_status(&self, status: PathStatus) {
        self.lock().status = status;
    }

    #[must_use]
    pub fn open_count(&self) -> u64 {
        self.lock().open_count
    }

    #[must_use]
    pub fn is_pinned(&self) -> bool {
        self.lock().expiry_at.is_none()
    }

    /// Whether this state is eligible for eviction right now: `open_count =
    /// 0` and no `SegmentInfo.queued` (spec §3 invariant, testable property
    /// #4). Evaluated against an externally supplied `segment_queued`
    /// lookup so the cache sweep does not need to reach into the segment's
    /// own lock while holding this state's lock (lock order: cache -> state
    /// -> segment, spec §5).
    #[must_use]
    pub fn is_evictable(&self, now: Instant) -> bool {
        let inner = self.lock();
        if inner.open_count != 0 {
            return false;
        }
        let Some(expiry) = inner.expiry_at else {
            return false;
        };
        if expiry > now {
            return false;
        }
        inner.segment.as_ref().is_none_or(|s| !s.queued())
    }

    pub fn attach_segment(&self, segment: std::sync::Arc<SegmentInfo>) {
        self.lock().segment = Some(segment);
    }

    #[must_use]
    pub fn segment(&self) -> Option<std::sync::Arc<SegmentInfo>> {
        self.lock().segment.clone()
    }

    pub fn set_attribute(&self, name: impl Into<String>, value: JsonValue) {
        self.lock().attributes.insert(name.into(), value);
    }

    #[must_use]
    pub fn attribute(&self, name: &str) -> Option<JsonValue> {
        self.lock().attributes.get(name).cloned()
    }

    /// Grants access per `can_grant`'s arbitration and records the new
    /// token. The caller (`FileStateCache::grant_file_access`) is
    /// responsible for the arbitration check itself; this just does the
    /// bookkeeping once a grant decision has been made, under this state's
    /// own lock.
    pub(crate) fn record_grant(&self, params: FileOpenParams) -> AccessToken {
        let mut inner = self.lock();
        let id = inner.next_token_id;
        inner.next_token_id += 1;
        let token = AccessToken::new(id, params);
        inner.tokens.push(token);
        inner.open_count += 1;
        inner.expiry_at = None; // open_count > 0 => NoTimeout
        token
    }

    #[must_use]
    pub(crate) fn tokens(&self) -> Vec<AccessToken> {
        self.lock().tokens.clone()
    }

    /// Releases `token`, decrementing `open_count`. Returns the remaining
    /// count. If it reaches zero, sets `expiry_at` per `cooldown`.
    pub(crate) fn release(&self, token_id: u64, cooldown: Duration) -> u64 {
        let mut inner = self.lock();
        inner.tokens.retain(|t| t.id() != token_id);
        inner.open_count = inner.open_count.saturating_sub(1);
        if inner.open_count == 0 {
            inner.expiry_at = Some(Instant::now() + cooldown);
        }
        inner.open_count
    }

    pub fn set_sequential_only(&self, value: bool) {
        let mut inner = self.lock();
        inner.sequential_only = inner.sequential_only && value;
    }

    #[must_use]
    pub fn sequential_only(&self) -> bool {
        self.lock().sequential_only
    }

    /// Pins this state (`NoTimeout`) regardless of `open_count`, used while
    /// a request referencing it is queued (spec §4.4 step 4: "set the
    /// attached FileState's `expiry_at` to `now + RequestProcessedExpire`"
    /// implies a finite, not infinite, pin — see `set_expiry`).
    pub fn pin(&self) {
        self.lock().expiry_at = None;
    }

    pub fn set_expiry(&self, ttl: Duration) {
        self.lock().expiry_at = Some(Instant::now() + ttl);
    }

    pub fn add_lock(&self, lock: ByteRangeLock) -> Result<(), ()> {
        let mut inner = self.lock();
        if inner.locks.iter().any(|l| l.overlaps(lock.offset, lock.len)) {
            return Err(());
        }
        inner.locks.push(lock);
        Ok(())
    }

    pub fn remove_lock(&self, owner: u64, offset: i64, len: i64) {
        self.lock()
            .locks
            .retain(|l| !(l.owner == owner && l.offset == offset && l.len == len));
    }
}
