//! `ThreadWorker`: one pool member pulling requests off a
//! [`FileRequestQueue`] and driving them through a [`FileLoader`]
//! (spec §4.4 steps 1-6).

use std::sync::Arc;

use tracing::{debug, error, instrument, warn};

use crate::config::{DEFAULT_REQUEUE_MIN_SIZE, DEFAULT_REQUEUE_WAIT, REQUEST_PROCESSED_EXPIRE};
use crate::context::FileCacheContext;
use crate::loader::{DeviceContext, FileLoader};
use crate::request::{
    DeleteFileRequest, FileRequest, FileRequestQueue, MultipleFileRequest, ObjectIdInterface,
    RequestKind, SingleFileRequest,
};
use crate::segment::{FileSegment, SegmentState};

/// Verdict a worker reaches after attempting one request (spec §4.4 "three
/// outcomes per request: Success, Error, Requeue").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Success,
    Error,
    Requeue,
}

/// Everything a worker needs to process requests off one direction's queue.
pub struct ThreadWorker<L, O, D> {
    ctx: Arc<FileCacheContext>,
    queue: Arc<FileRequestQueue<FileRequest>>,
    loader: Arc<L>,
    object_ids: Arc<O>,
    device: Arc<D>,
}

impl<L, O, D> ThreadWorker<L, O, D>
where
    L: FileLoader + 'static,
    O: ObjectIdInterface + 'static,
    D: DeviceContext + 'static,
{
    #[must_use]
    pub fn new(
        ctx: Arc<FileCacheContext>,
        queue: Arc<FileRequestQueue<FileRequest>>,
        loader: Arc<L>,
        object_ids: Arc<O>,
        device: Arc<D>,
    ) -> Self {
        Self {
            ctx,
            queue,
            loader,
            object_ids,
            device,
        }
    }

    /// Spawns `count` workers pulling from the same queue, returning their
    /// join handles (spec §4.4 "ThreadWorker pools default to 4 each").
    /// Workers exit once [`FileRequestQueue::shutdown`] is called.
    pub fn spawn_pool(self: Arc<Self>, count: usize) -> Vec<tokio::task::JoinHandle<()>> {
        (0..count)
            .map(|id| {
                let worker = Arc::clone(&self);
                tokio::spawn(async move { worker.run(id).await })
            })
            .collect()
    }

    #[instrument(skip(self), fields(worker_id = id))]
    async fn run(&self, id: usize) {
        debug!(worker_id = id, "worker started");
        while let Some(req) = self.queue.pop().await {
            self.process(req).await;
        }
        debug!(worker_id = id, "worker stopped: queue shut down");
    }

    async fn process(&self, req: FileRequest) {
        match req {
            FileRequest::Single(single) => self.process_single(single).await,
            FileRequest::Multiple(multi) => self.process_multiple(multi).await,
            FileRequest::Delete(delete) => self.process_delete(delete).await,
        }
    }

    #[instrument(skip(self, req), fields(file_id = req.file_id, stream_id = req.stream_id, kind = ?req.kind))]
    async fn process_single(&self, req: SingleFileRequest) {
        let outcome = match req.kind {
            RequestKind::Load => self.run_load(&req).await,
            RequestKind::Save | RequestKind::TransSave => self.run_save(&req).await,
        };
        self.finish_single(&req, outcome).await;
    }

    async fn run_load(&self, req: &SingleFileRequest) -> Outcome {
        let Some(state) = &req.file_state_ref else {
            warn!(file_id = req.file_id, "load request missing file_state_ref, dropping");
            return Outcome::Error;
        };
        let Some(info) = state.segment() else {
            return Outcome::Error;
        };
        if info.transition(SegmentState::Loading).is_err() {
            warn!(file_id = req.file_id, "segment not in LoadWait at load time");
            return Outcome::Error;
        }

        let object_id = match self.object_ids.load_object_id(req.file_id, req.stream_id).await {
            Ok(id) => id,
            Err(e) if e.is_retryable_internal() => return Outcome::Requeue,
            Err(e) => {
                error!(error = %e, "object id lookup failed");
                return Outcome::Error;
            }
        };

        let segment = FileSegment::new(Arc::clone(&info), true);
        match self
            .loader
            .load_file_data(req.file_id, req.stream_id, object_id.as_deref(), &segment)
            .await
        {
            Ok(()) => {
                if info.transition(SegmentState::Available).is_err() {
                    return Outcome::Error;
                }
                Outcome::Success
            }
            Err(e) if e.is_retryable_internal() => Outcome::Requeue,
            Err(e) => {
                warn!(error = %e, "load failed");
                info.set_load_error(true);
                Outcome::Error
            }
        }
    }

    async fn run_save(&self, req: &SingleFileRequest) -> Outcome {
        let Some(state) = &req.file_state_ref else {
            warn!(file_id = req.file_id, "save request missing file_state_ref, dropping");
            return Outcome::Error;
        };
        let Some(info) = state.segment() else {
            return Outcome::Error;
        };
        if info.transition(SegmentState::Saving).is_err() {
            warn!(file_id = req.file_id, "segment not in SaveWait at save time");
            return Outcome::Error;
        }

        let segment = FileSegment::new(Arc::clone(&info), false);
        match self.loader.save_file_data(req.file_id, req.stream_id, &segment, &req.attrs).await {
            Ok(object_id) => {
                if let Err(e) = self.object_ids.save_object_id(req.file_id, req.stream_id, &object_id).await {
                    if e.is_retryable_internal() {
                        return Outcome::Requeue;
                    }
                    error!(error = %e, "object id save failed");
                    return Outcome::Error;
                }
                info.clear_updated();
                if info.transition(SegmentState::Saved).is_err() {
                    return Outcome::Error;
                }
                Outcome::Success
            }
            Err(e) if e.is_retryable_internal() => Outcome::Requeue,
            Err(e) => {
                warn!(error = %e, "save failed");
                info.set_save_error(true);
                self.device.return_quota(0).await;
                Outcome::Error
            }
        }
    }

    /// Applies the terminal bookkeeping common to Load and Save: clears the
    /// at-most-one-outstanding flag (unless requeued), sets the short
    /// post-processing expiry, chains a follow-up save if a write landed
    /// during a load, and removes the durable record on a terminal outcome
    /// (spec §4.4 steps 5-6).
    async fn finish_single(&self, req: &SingleFileRequest, outcome: Outcome) {
        let Some(state) = &req.file_state_ref else { return };
        let Some(info) = state.segment() else { return };

        match outcome {
            Outcome::Requeue => {
                // The attempt advanced the segment to Loading/Saving before
                // failing; revert it to the matching *Wait state so the next
                // pop's `transition` call succeeds instead of finding an
                // illegal Loading->Loading/Saving->Saving edge and falling
                // through to a terminal Error (spec §7, §8 scenario 6).
                let in_progress = match req.kind {
                    RequestKind::Load => SegmentState::Loading,
                    RequestKind::Save | RequestKind::TransSave => SegmentState::Saving,
                };
                info.requeue_from(in_progress);
                if self.queue.len() < DEFAULT_REQUEUE_MIN_SIZE {
                    tokio::time::sleep(DEFAULT_REQUEUE_WAIT).await;
                }
                self.queue.push(FileRequest::Single(req.clone()));
                return;
            }
            Outcome::Success | Outcome::Error => {
                info.clear_queued();
                state.set_expiry(REQUEST_PROCESSED_EXPIRE);
                if let Err(e) = self.ctx.queue_store.delete_file_request(req.file_id, req.stream_id, req.kind).await
                {
                    warn!(error = %e, "failed to remove durable request record");
                }
            }
        }

        if outcome == Outcome::Success && req.kind == RequestKind::Load && info.updated() {
            // A write landed on the segment while it was loading. Chain the
            // pending save now that the load slot is free (spec §3
            // at-most-one-outstanding invariant; the writer deferred this).
            if info.mark_queued() && info.transition(SegmentState::SaveWait).is_ok() {
                let save_req = self.ctx.save_request(
                    state,
                    info.stream_id(),
                    info.temp_path().to_path_buf(),
                    state.path().to_path_buf(),
                );
                if let Err(e) = self.ctx.enqueue(save_req).await {
                    warn!(error = %e, "failed to chain follow-up save after load");
                }
            }
        }
    }

    #[instrument(skip(self, req), fields(tran_id = req.tran_id))]
    async fn process_multiple(&self, req: MultipleFileRequest) {
        let mut outcomes = Vec::with_capacity(req.files.len());
        for file in &req.files {
            outcomes.push(self.run_save(file).await);
        }
        // A transactional save is all-or-nothing for requeue purposes: any
        // member needing a retry requeues the whole group (spec §4.4
        // "TransactionQueueLoader groups files sharing a tran_id").
        let verdict = if outcomes.iter().any(|o| *o == Outcome::Requeue) {
            Outcome::Requeue
        } else if outcomes.iter().all(|o| *o == Outcome::Success) {
            Outcome::Success
        } else {
            Outcome::Error
        };

        for file in &req.files {
            self.finish_single(file, verdict).await;
        }
    }

    #[instrument(skip(self, req), fields(file_id = req.file_id, stream_id = req.stream_id))]
    async fn process_delete(&self, req: DeleteFileRequest) {
        let result = self.loader.delete_file(&req.virtual_path, req.file_id, req.stream_id).await;
        match result {
            Ok(()) => {
                let _ = self.object_ids.delete_object_id(req.file_id, req.stream_id).await;
                if let Err(e) = self
                    .ctx
                    .queue_store
                    .delete_file_request(req.file_id, req.stream_id, RequestKind::Save)
                    .await
                {
                    warn!(error = %e, "failed to remove durable delete record");
                }
                if let Some(state) = &req.file_state_ref {
                    if let Some(info) = state.segment() {
                        info.clear_queued();
                    }
                }
            }
            Err(e) if e.is_retryable_internal() => {
                self.device.queue_offline_delete(req).await;
            }
            Err(e) => {
                error!(error = %e, "delete failed permanently");
            }
        }
    }
}
