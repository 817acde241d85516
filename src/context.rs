//! `FileCacheContext`: the shared handle every open [`crate::cached_file::CachedNetworkFile`]
//! and the background subsystem reach into — the durable queue store, the
//! two in-memory `FileRequestQueue`s, the file-state cache, and config
//! (spec §4.4, §4.6).

use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use tracing::{debug, instrument};

use crate::config::Config;
use crate::error::Result;
use crate::request::{DBQueueInterface, FileRequest, FileRequestQueue, RequestKind, SingleFileRequest};
use crate::segment::SegmentInfo;
use crate::state::{FileOpenParams, FileStateCache, FileStateListener};
use crate::temp_store::TempStore;

/// Wakes a [`crate::background::QueueLoader`] once a request has been
/// durably queued, the "positive indication" half of spec §4.4's refill
/// trigger (the other half is the loader observing an empty queue on its
/// own). Late-bound via [`FileCacheContext::set_read_notifier`]/
/// [`FileCacheContext::set_write_notifier`] since `BackgroundLoadSave` is
/// constructed after the context it wraps.
pub trait QueueRefillNotifier: Send + Sync {
    fn notify_new_record(&self);
}

/// Bundles everything `CachedNetworkFile::open` and the background workers
/// share (spec §4.4's "two `FileRequestQueue`s feeding worker pools, backed
/// by the durable store").
pub struct FileCacheContext {
    pub config: Arc<Config>,
    pub state_cache: Arc<FileStateCache>,
    pub queue_store: Arc<dyn DBQueueInterface>,
    pub temp_store: Arc<TempStore>,
    pub read_queue: Arc<FileRequestQueue<FileRequest>>,
    pub write_queue: Arc<FileRequestQueue<FileRequest>>,
    read_notifier: OnceLock<Arc<dyn QueueRefillNotifier>>,
    write_notifier: OnceLock<Arc<dyn QueueRefillNotifier>>,
}

impl FileCacheContext {
    #[must_use]
    pub fn new(
        config: Arc<Config>,
        queue_store: Arc<dyn DBQueueInterface>,
        listener: Arc<dyn FileStateListener>,
    ) -> Self {
        let state_cache = Arc::new(FileStateCache::new(
            crate::config::REQUEST_PROCESSED_EXPIRE,
            listener,
        ));
        let temp_store = Arc::new(TempStore::new(
            config.temp_directory.clone(),
            config.max_files_per_directory(),
        ));
        Self {
            read_queue: Arc::new(FileRequestQueue::new(config.queue_max_size())),
            write_queue: Arc::new(FileRequestQueue::new(config.queue_max_size())),
            state_cache,
            queue_store,
            temp_store,
            config,
            read_notifier: OnceLock::new(),
            write_notifier: OnceLock::new(),
        }
    }

    /// Binds the read-side [`QueueRefillNotifier`], called once by
    /// `BackgroundLoadSave::new` after it builds its `QueueLoader`s.
    pub fn set_read_notifier(&self, notifier: Arc<dyn QueueRefillNotifier>) {
        let _ = self.read_notifier.set(notifier);
    }

    /// Binds the write-side [`QueueRefillNotifier`].
    pub fn set_write_notifier(&self, notifier: Arc<dyn QueueRefillNotifier>) {
        let _ = self.write_notifier.set(notifier);
    }

    /// Finds or creates the [`crate::state::FileState`] and attaches a fresh
    /// [`SegmentInfo`] the first time a path is seen (spec §3 "Lifecycle").
    #[instrument(skip(self))]
    pub async fn state_for(&self, path: &Path) -> Result<Arc<crate::state::FileState>> {
        let state = self.state_cache.find(path, true).await.ok_or_else(|| crate::error::CoreError::Internal {
            kind: crate::error::InternalErrorKind::Other,
            message: "find(create=true) always returns Some".to_string(),
        })?;
        if state.segment().is_none() {
            let temp_path = self.temp_store.path_for(state.file_id, 0)?;
            state.attach_segment(Arc::new(SegmentInfo::new(temp_path, 0)));
        }
        Ok(state)
    }

    /// Grants access and returns `(state, token)`, the pair `CachedNetworkFile`
    /// needs to construct itself (spec §4.2).
    pub async fn open(
        &self,
        path: &Path,
        params: FileOpenParams,
    ) -> Result<(Arc<crate::state::FileState>, crate::state::AccessToken)> {
        let state = self.state_for(path).await?;
        let token = self.state_cache.grant_file_access(params, &state)?;
        Ok((state, token))
    }

    /// Persists `req` durably, assigns it the returned sequence number, and
    /// pushes it onto the matching in-memory queue. A full in-memory queue
    /// is not an error — the request is already durable and the matching
    /// `QueueLoader` will pick it up on its next low-water-mark refill
    /// (spec §4.4).
    #[instrument(skip(self, req))]
    pub async fn enqueue(&self, mut req: SingleFileRequest) -> Result<i64> {
        let kind = req.kind;
        let placeholder = FileRequest::Single(req.clone());
        let seq = self.queue_store.queue_file_request(&placeholder).await?;
        req.seq_no = seq;

        let (queue, notifier) = match kind {
            RequestKind::Load => (&self.read_queue, &self.read_notifier),
            RequestKind::Save | RequestKind::TransSave => (&self.write_queue, &self.write_notifier),
        };
        if !queue.push(FileRequest::Single(req)) {
            debug!(seq, ?kind, "in-memory queue full, relying on durable backlog");
        }
        if let Some(notifier) = notifier.get() {
            notifier.notify_new_record();
        }
        Ok(seq)
    }

    /// Builds the `SingleFileRequest` for a Load of `(file_id, stream_id)`
    /// backed by `temp_path`/`virtual_path`, pinning `state` for the
    /// duration (spec §4.4 step 1: "pin the referenced `FileState`").
    #[must_use]
    pub fn load_request(
        &self,
        state: &Arc<crate::state::FileState>,
        stream_id: i32,
        temp_path: PathBuf,
        virtual_path: PathBuf,
    ) -> SingleFileRequest {
        state.pin();
        SingleFileRequest {
            kind: RequestKind::Load,
            file_id: state.file_id,
            stream_id,
            temp_path,
            virtual_path,
            seq_no: 0,
            thread_id: None,
            file_state_ref: Some(Arc::clone(state)),
            attrs: Vec::new(),
        }
    }

    /// Builds the `SingleFileRequest` for a Save, carrying the dirty extent
    /// as an attribute for the loader's benefit (spec §3 attrs bag).
    #[must_use]
    pub fn save_request(
        &self,
        state: &Arc<crate::state::FileState>,
        stream_id: i32,
        temp_path: PathBuf,
        virtual_path: PathBuf,
    ) -> SingleFileRequest {
        state.pin();
        SingleFileRequest {
            kind: RequestKind::Save,
            file_id: state.file_id,
            stream_id,
            temp_path,
            virtual_path,
            seq_no: 0,
            thread_id: None,
            file_state_ref: Some(Arc::clone(state)),
            attrs: Vec::new(),
        }
    }
}
