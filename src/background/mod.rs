//! `BackgroundLoadSave`: wires the read and write `QueueLoader`s, the
//! optional `TransactionQueueLoader`, and the `ThreadWorker` pools into one
//! handle with a startup recovery pass and a cooperative shutdown (spec
//! §4.4).

mod queue_loader;
mod worker;

pub use queue_loader::{QueueLoader, TransactionQueueLoader};
pub use worker::ThreadWorker;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, instrument, warn};

use crate::context::FileCacheContext;
use crate::loader::{DeviceContext, FileLoader};
use crate::request::{FileRequest, ObjectIdInterface, RequestKind};

/// Owns every background task feeding on `ctx`'s two queues: a read-side
/// `QueueLoader`, a write-side `QueueLoader`, an optional
/// `TransactionQueueLoader`, and the `ThreadWorker` pools draining each
/// queue into `loader` (spec §4.4 "the subsystem as a whole").
///
/// Constructed after `FileCacheContext` so it can bind itself as both
/// queues' [`crate::context::QueueRefillNotifier`] via
/// `FileCacheContext::set_read_notifier`/`set_write_notifier`.
pub struct BackgroundLoadSave<L, O, D> {
    ctx: Arc<FileCacheContext>,
    read_loader: Arc<QueueLoader>,
    write_loader: Arc<QueueLoader>,
    tran_loader: Arc<TransactionQueueLoader>,
    read_workers: Arc<ThreadWorker<L, O, D>>,
    write_workers: Arc<ThreadWorker<L, O, D>>,
    shutdown: Arc<AtomicBool>,
    handles: std::sync::Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl<L, O, D> BackgroundLoadSave<L, O, D>
where
    L: FileLoader + 'static,
    O: ObjectIdInterface + 'static,
    D: DeviceContext + 'static,
{
    /// Builds the subsystem, binds its `QueueLoader`s as `ctx`'s refill
    /// notifiers, and runs the startup recovery scan, but does not spawn
    /// any tasks yet; call [`Self::start`] for that (spec §4.4 "on
    /// startup, scan the temp directory for orphaned loader files before
    /// accepting new requests").
    #[instrument(skip(ctx, loader, object_ids, device))]
    pub async fn new(ctx: Arc<FileCacheContext>, loader: Arc<L>, object_ids: Arc<O>, device: Arc<D>) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));
        let low_water_mark = ctx.config.low_queue_size();

        let read_loader = Arc::new(QueueLoader::new(
            Arc::clone(&ctx),
            Arc::clone(&ctx.read_queue),
            Arc::clone(&ctx.queue_store),
            RequestKind::Load,
            low_water_mark,
            Arc::clone(&shutdown),
        ));
        let write_loader = Arc::new(QueueLoader::new(
            Arc::clone(&ctx),
            Arc::clone(&ctx.write_queue),
            Arc::clone(&ctx.queue_store),
            RequestKind::Save,
            low_water_mark,
            Arc::clone(&shutdown),
        ));
        let tran_loader = Arc::new(TransactionQueueLoader::new(
            Arc::clone(&ctx.write_queue),
            Arc::clone(&ctx.queue_store),
            Arc::clone(&shutdown),
        ));

        ctx.set_read_notifier(Arc::clone(&read_loader) as Arc<dyn crate::context::QueueRefillNotifier>);
        ctx.set_write_notifier(Arc::clone(&write_loader) as Arc<dyn crate::context::QueueRefillNotifier>);

        let read_workers = Arc::new(ThreadWorker::new(
            Arc::clone(&ctx),
            Arc::clone(&ctx.read_queue),
            Arc::clone(&loader),
            Arc::clone(&object_ids),
            Arc::clone(&device),
        ));
        let write_workers = Arc::new(ThreadWorker::new(
            Arc::clone(&ctx),
            Arc::clone(&ctx.write_queue),
            loader,
            object_ids,
            device,
        ));

        let subsystem = Self {
            ctx,
            read_loader,
            write_loader,
            tran_loader,
            read_workers,
            write_workers,
            shutdown,
            handles: std::sync::Mutex::new(Vec::new()),
        };
        subsystem.recover_orphaned_requests().await;
        subsystem
    }

    /// Scans the temp directory for files left behind by a crash and
    /// re-enqueues whatever the durable store still has a record for
    /// (spec §4.4, §6 "recovery on restart").
    async fn recover_orphaned_requests(&self) {
        let recovered = match self.ctx.temp_store.recover(&*self.ctx.queue_store).await {
            Ok(reqs) => reqs,
            Err(e) => {
                warn!(error = %e, "startup recovery scan failed");
                return;
            }
        };
        let count = recovered.len();
        for req in recovered {
            let loader = match &req {
                FileRequest::Single(single) if single.kind == RequestKind::Load => &self.read_loader,
                _ => &self.write_loader,
            };
            if let Err(e) = loader.rehydrate_and_push(req).await {
                warn!(error = %e, "failed to rehydrate an orphaned request during startup recovery");
            }
        }
        if count > 0 {
            debug!(count, "requeued orphaned requests found during startup recovery");
        }
    }

    /// Spawns the queue loaders and worker pools, sized per
    /// `ctx.config.read_workers()`/`write_workers()` (spec §4.4 "worker
    /// pools default to 4 each").
    pub fn start(&self) {
        let mut handles = self.handles.lock().unwrap_or_else(std::sync::PoisonError::into_inner);

        let read_loader = Arc::clone(&self.read_loader);
        handles.push(tokio::spawn(async move { read_loader.run().await }));
        let write_loader = Arc::clone(&self.write_loader);
        handles.push(tokio::spawn(async move { write_loader.run().await }));
        let tran_loader = Arc::clone(&self.tran_loader);
        handles.push(tokio::spawn(async move { tran_loader.run().await }));

        handles.extend(Arc::clone(&self.read_workers).spawn_pool(self.ctx.config.read_workers()));
        handles.extend(Arc::clone(&self.write_workers).spawn_pool(self.ctx.config.write_workers()));
    }

    /// Called on the last file of a grouped transactional save, handing the
    /// id off to the `TransactionQueueLoader` for expansion (spec §4.4
    /// "optional TransactionQueueLoader").
    pub async fn flush_transaction(&self, tran_id: i64) {
        self.tran_loader.flush_transaction(tran_id).await;
    }

    /// Signals every loader/worker to stop after their current item and
    /// waits for them to exit (spec §4.4 "a shutdown flag plus queue
    /// wakeups, not a forced thread interrupt").
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.ctx.read_queue.shutdown();
        self.ctx.write_queue.shutdown();

        let handles = {
            let mut guard = self.handles.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            std::mem::take(&mut *guard)
        };
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "background task panicked during shutdown");
            }
        }
        debug!("background load/save subsystem shut down");
    }
}
