//! Integration contracts the core is built against: `FileLoader` (the
//! object-store glue) and `DeviceContext` (the metadata-layer glue)
//! (spec §4.5, §4.6).

use std::path::Path;

use async_trait::async_trait;

use crate::error::Result;
use crate::request::DeleteFileRequest;
use crate::segment::FileSegment;
use crate::state::FileStateListener;

/// Capability a concrete [`FileLoader`] may advertise (spec §4.5: "loaders
/// that support random loading set a capability flag").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LoaderCapabilities {
    /// Loader can deliver data out of sequential order.
    pub random_load: bool,
    /// Loader can convert an in-memory-buffered segment to a temp-file
    /// backed one on `BufferOverflow` (spec §4.3 "one-time conversion").
    pub convert_to_file_backed: bool,
    /// Loader also maintains a directory hierarchy (`create_directory`,
    /// `rename_file_directory` are implemented, not `NotImplemented`).
    pub directory_ops: bool,
}

/// Glue between `CachedNetworkFile`/`BackgroundLoadSave` and the object
/// store (spec §4.5). A loader is also a [`FileStateListener`] so it can
/// delete the temp file once a state expires or closes.
#[async_trait]
pub trait FileLoader: FileStateListener {
    fn capabilities(&self) -> LoaderCapabilities {
        LoaderCapabilities::default()
    }

    /// Populates `segment`'s temp file from the object store, updating
    /// `readable_length` and calling `signal_data_available()` as data
    /// appears. May deliver in order only unless `capabilities().random_load`.
    async fn load_file_data(
        &self,
        file_id: i64,
        stream_id: i32,
        object_id: Option<&str>,
        segment: &FileSegment,
    ) -> Result<()>;

    /// Persists `segment`'s buffered writes to the object store, returning
    /// the resulting object id.
    async fn save_file_data(
        &self,
        file_id: i64,
        stream_id: i32,
        segment: &FileSegment,
        attrs: &[(String, serde_json::Value)],
    ) -> Result<String>;

    /// Deletes the object-store entry for `virtual_path`.
    async fn delete_file(&self, virtual_path: &Path, file_id: i64, stream_id: i32) -> Result<()>;

    /// Creates a directory in whatever hierarchy the loader maintains.
    /// Out of scope for a pure file-caching loader (spec §1); the default
    /// returns `NotImplemented`.
    async fn create_directory(&self, virtual_path: &Path) -> Result<()> {
        Err(crate::error::CoreError::NotImplemented(format!(
            "create_directory: {}",
            virtual_path.display()
        )))
    }

    /// Renames a file or directory in whatever hierarchy the loader
    /// maintains. Out of scope for a pure file-caching loader (spec §1).
    async fn rename_file_directory(&self, from: &Path, to: &Path) -> Result<()> {
        Err(crate::error::CoreError::NotImplemented(format!(
            "rename_file_directory: {} -> {}",
            from.display(),
            to.display()
        )))
    }
}

/// External orchestrator the core is embedded in (spec §4.6 `DBDeviceContext`):
/// quota accounting and the offline-delete queue used when the metadata
/// store is unreachable. Both are out of scope features (spec §1), but the
/// seam must exist so a real embedder can supply one.
#[async_trait]
pub trait DeviceContext: Send + Sync {
    /// Returns previously allocated quota to the pool after a failed write
    /// (spec §7 "Quota over-allocation during write failure").
    async fn return_quota(&self, bytes: u64);

    /// Queues a delete for replay once the metadata store is back online
    /// (spec §7 "Delete requests made while offline").
    async fn queue_offline_delete(&self, req: DeleteFileRequest);
}

/// Default [`DeviceContext`] that discards quota returns and drops offline
/// deletes — used where no metadata layer is wired in (spec §1 non-goal:
/// quota and offline-delete bookkeeping are out of scope for the core
/// itself, but `BackgroundLoadSave` still needs a concrete context to call).
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopDeviceContext;

#[async_trait]
impl DeviceContext for NoopDeviceContext {
    async fn return_quota(&self, _bytes: u64) {}

    async fn queue_offline_delete(&self, _req: DeleteFileRequest) {}
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn noop_device_context_accepts_calls_without_panicking() {
        let ctx = NoopDeviceContext;
        ctx.return_quota(4096).await;
        ctx.queue_offline_delete(DeleteFileRequest {
            file_id: 1,
            stream_id: 0,
            temp_path: std::path::PathBuf::from("/tmp/ldr0/ldr_1.tmp"),
            virtual_path: std::path::PathBuf::from("/docs/a.txt"),
            file_state_ref: None,
        })
        .await;
    }

    #[test]
    fn default_capabilities_are_all_false() {
        let caps = LoaderCapabilities::default();
        assert!(!caps.random_load);
        assert!(!caps.convert_to_file_backed);
        assert!(!caps.directory_ops);
    }
}
