//! `QueueLoader`: refills an in-memory [`FileRequestQueue`] from the
//! durable store, and `TransactionQueueLoader`: expands queued transaction
//! ids into grouped `MultipleFileRequest`s (spec §4.4).

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, instrument, warn};

use crate::context::{FileCacheContext, QueueRefillNotifier};
use crate::request::{DBQueueInterface, FileRequest, FileRequestQueue, RequestKind};
use crate::temp_store::SeqWatermark;

/// How many records a single refill pass asks the durable store for.
const REFILL_BATCH_SIZE: i64 = 64;
/// Idle poll interval when there is no positive indication to refill
/// (spec §4.4: "a posted new-record notification... or an empty queue").
const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Continuously drains `kind`-typed requests from the durable store into
/// one in-memory [`FileRequestQueue`], one per direction (spec §4.4).
///
/// Refills only when the in-memory queue is below `low_water_mark` *and*
/// there is a positive indication: either its [`QueueRefillNotifier`] was
/// fired, or the queue is currently empty. A monotonic
/// [`SeqWatermark`] ensures already-seen records are never reloaded unless
/// explicitly [`SeqWatermark::reset`].
pub struct QueueLoader {
    ctx: Arc<FileCacheContext>,
    queue: Arc<FileRequestQueue<FileRequest>>,
    store: Arc<dyn DBQueueInterface>,
    kind: RequestKind,
    low_water_mark: usize,
    watermark: SeqWatermark,
    pending_new_record: AtomicBool,
    wake: Notify,
    shutdown: Arc<AtomicBool>,
}

impl QueueLoader {
    #[must_use]
    pub fn new(
        ctx: Arc<FileCacheContext>,
        queue: Arc<FileRequestQueue<FileRequest>>,
        store: Arc<dyn DBQueueInterface>,
        kind: RequestKind,
        low_water_mark: usize,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            ctx,
            queue,
            store,
            kind,
            low_water_mark,
            watermark: SeqWatermark::new(),
            pending_new_record: AtomicBool::new(true), // drain any backlog on startup
            wake: Notify::new(),
            shutdown,
        }
    }

    /// Marks that a request was durably queued and wakes the refill loop,
    /// so it picks the record up on its next pass rather than waiting out
    /// the idle poll interval.
    fn mark_pending_and_wake(&self) {
        self.pending_new_record.store(true, Ordering::Relaxed);
        self.wake.notify_one();
    }

    /// Resets the seq watermark, allowing already-seen records to be
    /// replayed (spec §4.4 "unless a reset occurred due to an error").
    pub fn reset_watermark(&self) {
        self.watermark.reset();
    }

    /// Runs the refill loop until shutdown.
    #[instrument(skip(self), fields(kind = ?self.kind))]
    pub async fn run(&self) {
        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                break;
            }
            let should_refill = self.queue.is_empty()
                || (self.pending_new_record.load(Ordering::Relaxed)
                    && self.queue.is_below_water_mark(self.low_water_mark));
            if !should_refill {
                let _ = tokio::time::timeout(IDLE_POLL_INTERVAL, self.wake.notified()).await;
                continue;
            }
            self.refill_once().await;
        }
        debug!("queue loader stopped");
    }

    async fn refill_once(&self) {
        let loaded = match self
            .store
            .load_file_requests(self.watermark.get(), self.kind, REFILL_BATCH_SIZE)
            .await
        {
            Ok(rows) => rows,
            Err(e) => {
                warn!(error = %e, "queue loader refill failed, backing off");
                tokio::time::sleep(IDLE_POLL_INTERVAL).await;
                return;
            }
        };

        let count = loaded.len();
        for req in loaded {
            if let Err(e) = self.rehydrate_and_push(req).await {
                warn!(error = %e, "failed to rehydrate queued request, skipping");
            }
        }

        // Fewer records than asked for means the backlog is drained; stop
        // treating this as "new records pending" until notified again
        // (spec §4.4 "clear the new-records-pending flag to avoid
        // busy-looping").
        if (count as i64) < REFILL_BATCH_SIZE {
            self.pending_new_record.store(false, Ordering::Relaxed);
        }
    }

    /// Re-attaches (or creates) the `FileState`+`SegmentInfo` for a request
    /// loaded from the durable store, so the worker that eventually
    /// processes it finds the live cached segment rather than a dangling
    /// reference (spec §4.4, §9 "cyclic structures... owned-by-cache
    /// handles plus explicit back-references").
    pub(crate) async fn rehydrate_and_push(&self, req: FileRequest) -> crate::error::Result<()> {
        let FileRequest::Single(mut single) = req else {
            // Multiple/Delete requests loaded individually from
            // `load_file_requests` are not expected on this path; the
            // transaction loader handles `Multiple`, and deletes are
            // rehydrated the same way as a Save would be.
            return Ok(());
        };
        let state = self.ctx.state_for(&single.virtual_path).await?;
        if state.segment().is_none() {
            state.attach_segment(Arc::new(crate::segment::SegmentInfo::new(
                single.temp_path.clone(),
                single.stream_id,
            )));
        }
        let segment = state.segment().ok_or_else(|| crate::error::CoreError::Internal {
            kind: crate::error::InternalErrorKind::Other,
            message: "segment attached immediately above".to_string(),
        })?;
        segment.mark_queued();
        let target_state = match single.kind {
            RequestKind::Load => crate::segment::SegmentState::LoadWait,
            RequestKind::Save | RequestKind::TransSave => crate::segment::SegmentState::SaveWait,
        };
        let _ = segment.transition(target_state);
        state.pin();
        single.file_state_ref = Some(Arc::clone(&state));

        self.watermark.advance(single.seq_no);
        self.queue.push(FileRequest::Single(single));
        Ok(())
    }
}

impl QueueRefillNotifier for QueueLoader {
    fn notify_new_record(&self) {
        self.mark_pending_and_wake();
    }
}

/// Collects transaction ids flushed by the last file of a grouped save and
/// expands each into a `MultipleFileRequest` pushed onto the write queue
/// (spec §4.4 "optional TransactionQueueLoader").
pub struct TransactionQueueLoader {
    queue: Arc<FileRequestQueue<FileRequest>>,
    store: Arc<dyn DBQueueInterface>,
    pending: tokio::sync::Mutex<Vec<i64>>,
    wake: Notify,
    shutdown: Arc<AtomicBool>,
}

impl TransactionQueueLoader {
    #[must_use]
    pub fn new(
        queue: Arc<FileRequestQueue<FileRequest>>,
        store: Arc<dyn DBQueueInterface>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            queue,
            store,
            pending: tokio::sync::Mutex::new(Vec::new()),
            wake: Notify::new(),
            shutdown,
        }
    }

    /// Appends `tran_id` to the pending list, to be expanded and pushed on
    /// the next pass. Called on the last file of a transaction or an
    /// explicit flush (spec §4.4).
    pub async fn flush_transaction(&self, tran_id: i64) {
        self.pending.lock().await.push(tran_id);
        self.wake.notify_one();
    }

    #[instrument(skip(self))]
    pub async fn run(&self) {
        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                break;
            }
            let ids: Vec<i64> = {
                let mut pending = self.pending.lock().await;
                std::mem::take(&mut *pending)
            };
            if ids.is_empty() {
                let _ = tokio::time::timeout(IDLE_POLL_INTERVAL, self.wake.notified()).await;
                continue;
            }
            for tran_id in ids {
                match self.store.load_transaction_request(tran_id).await {
                    Ok(Some(multi)) => {
                        self.queue.push(FileRequest::Multiple(multi));
                    }
                    Ok(None) => {
                        warn!(tran_id, "flushed transaction id has no durable rows");
                    }
                    Err(e) => {
                        warn!(tran_id, error = %e, "failed to load transaction request");
                    }
                }
            }
        }
        debug!("transaction queue loader stopped");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::db::Database;
    use crate::request::{RequestKind, SingleFileRequest};
    use crate::state::NoopFileStateListener;

    async fn ctx_and_store() -> (tempfile::TempDir, Arc<FileCacheContext>, Arc<dyn DBQueueInterface>)
    {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(Config::new(dir.path().to_path_buf()).unwrap());
        let db = Database::open_in_memory().await.unwrap();
        let store: Arc<dyn DBQueueInterface> = Arc::new(db.queue_store());
        let fc = Arc::new(FileCacheContext::new(
            config,
            Arc::clone(&store),
            Arc::new(NoopFileStateListener),
        ));
        (dir, fc, store)
    }

    fn load_request(file_id: i64, seq: i64) -> FileRequest {
        FileRequest::Single(SingleFileRequest {
            kind: RequestKind::Load,
            file_id,
            stream_id: 0,
            temp_path: PathBuf::from(format!("/tmp/ldr0/ldr_{file_id}.tmp")),
            virtual_path: PathBuf::from(format!("/docs/{file_id}.txt")),
            seq_no: seq,
            thread_id: None,
            file_state_ref: None,
            attrs: vec![],
        })
    }

    #[tokio::test]
    async fn refill_once_pulls_backlog_and_advances_watermark() {
        let (_dir, ctx, store) = ctx_and_store().await;
        let seq = store.queue_file_request(&load_request(1, 0)).await.unwrap();

        let queue: Arc<FileRequestQueue<FileRequest>> = Arc::new(FileRequestQueue::new(100));
        let shutdown = Arc::new(AtomicBool::new(false));
        let loader = QueueLoader::new(
            Arc::clone(&ctx),
            Arc::clone(&queue),
            Arc::clone(&store),
            RequestKind::Load,
            50,
            shutdown,
        );

        loader.refill_once().await;
        assert_eq!(queue.len(), 1);
        assert_eq!(loader.watermark.get(), seq);
    }

    #[tokio::test]
    async fn rehydrated_request_carries_a_live_file_state_ref() {
        let (_dir, ctx, store) = ctx_and_store().await;
        store.queue_file_request(&load_request(7, 0)).await.unwrap();

        let queue: Arc<FileRequestQueue<FileRequest>> = Arc::new(FileRequestQueue::new(100));
        let shutdown = Arc::new(AtomicBool::new(false));
        let loader = QueueLoader::new(ctx, Arc::clone(&queue), store, RequestKind::Load, 50, shutdown);
        loader.refill_once().await;

        let FileRequest::Single(req) = queue.try_pop().unwrap() else {
            panic!("expected a single request");
        };
        assert!(req.file_state_ref.is_some());
        assert_eq!(
            req.file_state_ref.unwrap().segment().unwrap().state(),
            crate::segment::SegmentState::LoadWait
        );
    }

    #[tokio::test]
    async fn transaction_loader_expands_flushed_ids_into_multiple_request() {
        let (_dir, _ctx, store) = ctx_and_store().await;
        let multi = FileRequest::Multiple(crate::request::MultipleFileRequest {
            tran_id: 9,
            files: vec![SingleFileRequest {
                kind: RequestKind::TransSave,
                file_id: 1,
                stream_id: 0,
                temp_path: PathBuf::from("/tmp/ldr0/ldr_1.tmp"),
                virtual_path: PathBuf::from("/docs/1.txt"),
                seq_no: 0,
                thread_id: None,
                file_state_ref: None,
                attrs: vec![],
            }],
        });
        store.queue_file_request(&multi).await.unwrap();

        let queue: Arc<FileRequestQueue<FileRequest>> = Arc::new(FileRequestQueue::new(100));
        let shutdown = Arc::new(AtomicBool::new(false));
        let loader = TransactionQueueLoader::new(Arc::clone(&queue), store, shutdown);
        loader.flush_transaction(9).await;

        let handle = tokio::spawn(async move { loader.run().await });
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(queue.len(), 1);
        handle.abort();
    }
}
