//! `FileStateCache`: path -> `FileState` map with expiry, listener
//! callbacks, and sharing-mode arbitration (spec §4.2).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tracing::{debug, info, instrument};

use crate::error::{CoreError, Result};
use crate::state::access::{can_grant, AccessToken, FileOpenParams};
use crate::state::file_state::FileState;

/// Hooks the cache invokes around a state's lifecycle, implemented by
/// whatever owns temp-file cleanup (spec §4.2, §4.5 — `FileLoader` is also
/// a `FileStateListener`).
pub trait FileStateListener: Send + Sync {
    /// Called before evicting an expired, zero-open-count state. Return
    /// `true` to veto the eviction and keep the state cached.
    fn file_state_expired(&self, state: &Arc<FileState>) -> bool;

    /// Called once a state's `open_count` reaches zero, i.e. no handle
    /// remains open. Typically used to delete the backing temp file once
    /// any pending save has drained.
    fn file_state_closed(&self, state: &Arc<FileState>);
}

/// Default listener that keeps every expired state and does nothing on
/// close — used where no loader is wired in yet (tests, construction-time
/// defaults), the same role the teacher's `Default` impls play.
pub struct NoopFileStateListener;

impl FileStateListener for NoopFileStateListener {
    fn file_state_expired(&self, _state: &Arc<FileState>) -> bool {
        false
    }

    fn file_state_closed(&self, _state: &Arc<FileState>) {}
}

/// Path -> `FileState` cache (spec §4.2).
///
/// Lock ordering is cache-map lock before any individual state's own lock
/// (spec §5) — every method here either holds only the map lock, or
/// acquires the map lock, clones the `Arc<FileState>` out, drops the map
/// lock, and only then touches the state's own lock.
pub struct FileStateCache {
    map: RwLock<HashMap<PathBuf, Arc<FileState>>>,
    next_file_id: AtomicI64,
    default_expire_interval: Duration,
    listener: Arc<dyn FileStateListener>,
}

impl FileStateCache {
    #[must_use]
    pub fn new(default_expire_interval: Duration, listener: Arc<dyn FileStateListener>) -> Self {
        Self {
            map: RwLock::new(HashMap::new()),
            next_file_id: AtomicI64::new(1),
            default_expire_interval,
            listener,
        }
    }

    #[must_use]
    pub fn default_expire_interval(&self) -> Duration {
        self.default_expire_interval
    }

    /// Finds the state for `path`, creating a fresh `Unknown`-status entry
    /// if `create` is true and none exists yet (spec §3 "Lifecycle").
    #[instrument(skip(self))]
    pub async fn find(&self, path: &Path, create: bool) -> Option<Arc<FileState>> {
        {
            let map = self.map.read().await;
            if let Some(state) = map.get(path) {
                return Some(Arc::clone(state));
            }
        }
        if !create {
            return None;
        }
        let mut map = self.map.write().await;
        if let Some(state) = map.get(path) {
            return Some(Arc::clone(state));
        }
        let file_id = self.next_file_id.fetch_add(1, Ordering::SeqCst);
        let state = Arc::new(FileState::new(path.to_path_buf(), file_id));
        map.insert(path.to_path_buf(), Arc::clone(&state));
        debug!(path = %path.display(), file_id, "created new file state");
        Some(state)
    }

    /// Removes `path`'s entry unconditionally (used by callers who have
    /// already verified eviction is safe, e.g. after a successful delete).
    pub async fn remove(&self, path: &Path) -> Option<Arc<FileState>> {
        self.map.write().await.remove(path)
    }

    /// Moves the cache entry for `old_path` to `new_path` (spec §4.2
    /// `rename`). `is_dir` only affects what the caller does with the
    /// status field; directory hierarchy bookkeeping itself is out of
    /// scope (spec §1).
    pub async fn rename(
        &self,
        old_path: &Path,
        new_path: PathBuf,
        is_dir: bool,
    ) -> Option<Arc<FileState>> {
        let mut map = self.map.write().await;
        let state = map.remove(old_path)?;
        state.set_status(if is_dir {
            crate::state::file_state::PathStatus::DirectoryExists
        } else {
            crate::state::file_state::PathStatus::FileExists
        });
        map.insert(new_path, Arc::clone(&state));
        Some(state)
    }

    /// Grants access to `state` per spec §4.2's arbitration rule.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::SharingViolation`] if any existing token
    /// conflicts with `params`.
    #[instrument(skip(self, state))]
    pub fn grant_file_access(
        &self,
        params: FileOpenParams,
        state: &Arc<FileState>,
    ) -> Result<AccessToken> {
        let existing = state.tokens();
        if !can_grant(&existing, &params) {
            return Err(CoreError::SharingViolation(format!(
                "sharing mode conflict on {}",
                state.path().display()
            )));
        }
        Ok(state.record_grant(params))
    }

    /// Releases `token` on `state`. Returns the remaining open-count. If it
    /// reaches zero, fires [`FileStateListener::file_state_closed`] and
    /// sets the cooldown expiry (short for sequential-only files per spec
    /// §4.3, else the cache's default interval).
    #[instrument(skip(self, state))]
    pub fn release_file_access(
        &self,
        state: &Arc<FileState>,
        token: AccessToken,
        sequential_cooldown: Duration,
    ) -> u64 {
        let cooldown = if state.sequential_only() {
            sequential_cooldown
        } else {
            self.default_expire_interval
        };
        let remaining = state.release(token.id(), cooldown);
        if remaining == 0 {
            self.listener.file_state_closed(state);
        }
        remaining
    }

    /// One sweep pass: evicts every entry whose cooldown has elapsed, has
    /// no open handles, and whose segment (if attached) has nothing
    /// queued (spec §4.2 "Expiry"). Returns the number of entries evicted.
    #[instrument(skip(self))]
    pub async fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let candidates: Vec<(PathBuf, Arc<FileState>)> = {
            let map = self.map.read().await;
            map.iter()
                .filter(|(_, state)| state.is_evictable(now))
                .map(|(path, state)| (path.clone(), Arc::clone(state)))
                .collect()
        };

        let mut evicted = 0;
        for (path, state) in candidates {
            if self.listener.file_state_expired(&state) {
                continue; // listener vetoed eviction
            }
            let mut map = self.map.write().await;
            // Re-check under the write lock: another opener may have
            // reopened this path between the read-lock scan and now.
            if map
                .get(&path)
                .is_some_and(|s| Arc::ptr_eq(s, &state) && state.is_evictable(Instant::now()))
            {
                map.remove(&path);
                evicted += 1;
            }
        }
        if evicted > 0 {
            info!(evicted, "expired file states evicted");
        }
        evicted
    }

    /// Spawns a background sweep task firing every `interval`, running
    /// until `shutdown` is observed. Mirrors the teacher's pattern of
    /// spawning a long-lived `tokio::spawn` loop and joining it on
    /// shutdown (see `BackgroundLoadSave`).
    pub fn spawn_expiry_sweeper(
        self: Arc<Self>,
        interval: Duration,
        shutdown: Arc<std::sync::atomic::AtomicBool>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if shutdown.load(Ordering::Relaxed) {
                    break;
                }
                self.sweep_expired().await;
            }
        })
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.map.read().await.len()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::state::access::{DesiredAccess, SharingMode};

    fn params(read: bool, write: bool, sharing: SharingMode) -> FileOpenParams {
        FileOpenParams {
            desired_access: DesiredAccess {
                read,
                write,
                delete: false,
            },
            sharing_mode: sharing,
        }
    }

    #[tokio::test]
    async fn find_with_create_returns_same_state_on_second_lookup() {
        let cache = FileStateCache::new(Duration::from_secs(30), Arc::new(NoopFileStateListener));
        let path = PathBuf::from("/docs/a.txt");
        let first = cache.find(&path, true).await.unwrap();
        let second = cache.find(&path, true).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn find_without_create_on_unknown_path_returns_none() {
        let cache = FileStateCache::new(Duration::from_secs(30), Arc::new(NoopFileStateListener));
        assert!(cache.find(Path::new("/missing"), false).await.is_none());
    }

    #[tokio::test]
    async fn concurrent_share_read_deny_write_opens_both_succeed_third_denied() {
        let cache = FileStateCache::new(Duration::from_secs(30), Arc::new(NoopFileStateListener));
        let path = PathBuf::from("/docs/shared.txt");
        let state = cache.find(&path, true).await.unwrap();

        let p = params(true, false, SharingMode::deny_write());
        let tok1 = cache.grant_file_access(p, &state).unwrap();
        let tok2 = cache.grant_file_access(p, &state).unwrap();
        assert_eq!(state.open_count(), 2);

        let exclusive = params(true, true, SharingMode::deny_none());
        let result = cache.grant_file_access(exclusive, &state);
        assert!(matches!(result, Err(CoreError::SharingViolation(_))));
        assert_eq!(state.open_count(), 2);

        cache.release_file_access(&state, tok1, Duration::from_secs(3));
        cache.release_file_access(&state, tok2, Duration::from_secs(3));
        assert_eq!(state.open_count(), 0);
    }

    #[tokio::test]
    async fn sweep_does_not_evict_pinned_or_open_states() {
        let cache = FileStateCache::new(Duration::from_millis(5), Arc::new(NoopFileStateListener));
        let path = PathBuf::from("/docs/open.txt");
        let state = cache.find(&path, true).await.unwrap();
        let p = params(true, false, SharingMode::deny_write());
        let _tok = cache.grant_file_access(p, &state).unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        cache.sweep_expired().await;
        assert_eq!(cache.len().await, 1, "open state must not be evicted");
    }

    #[tokio::test]
    async fn sweep_evicts_after_cooldown_once_closed() {
        let cache = FileStateCache::new(Duration::from_millis(5), Arc::new(NoopFileStateListener));
        let path = PathBuf::from("/docs/closed.txt");
        let state = cache.find(&path, true).await.unwrap();
        let p = params(true, false, SharingMode::deny_write());
        let tok = cache.grant_file_access(p, &state).unwrap();
        cache.release_file_access(&state, tok, Duration::from_millis(5));

        tokio::time::sleep(Duration::from_millis(20)).await;
        cache.sweep_expired().await;
        assert_eq!(cache.len().await, 0);
    }

    #[tokio::test]
    async fn sweep_never_evicts_a_queued_segment() {
        let cache = FileStateCache::new(Duration::from_millis(5), Arc::new(NoopFileStateListener));
        let path = PathBuf::from("/docs/queued.txt");
        let state = cache.find(&path, true).await.unwrap();
        let segment = Arc::new(crate::segment::SegmentInfo::new(
            PathBuf::from("/tmp/ldr0/ldr_1.tmp"),
            0,
        ));
        assert!(segment.mark_queued());
        state.attach_segment(segment);

        let p = params(true, false, SharingMode::deny_write());
        let tok = cache.grant_file_access(p, &state).unwrap();
        cache.release_file_access(&state, tok, Duration::from_millis(5));

        tokio::time::sleep(Duration::from_millis(20)).await;
        cache.sweep_expired().await;
        assert_eq!(cache.len().await, 1, "queued segment must pin its state");
    }
}
