//! In-crate `FileLoader` fake used by the crate's own tests and by
//! integration tests under `tests/`, gated the way the teacher gates
//! `wiremock` — but since this is in-crate rather than a dev-dependency, it
//! sits behind the `testutil` feature instead of only `cfg(test)`, so
//! `tests/*.rs` binaries can see it too.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::os::unix::fs::FileExt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::loader::{FileLoader, LoaderCapabilities};
use crate::segment::FileSegment;
use crate::state::FileState;
use crate::state::FileStateListener;

/// A fake object store plus a fake `FileLoader`, standing in for a real
/// network-backed loader in tests (the non-HTTP analogue of a `wiremock`
/// fixture).
pub struct MemoryLoader {
    objects: Mutex<HashMap<(i64, i32), Vec<u8>>>,
    /// Bytes delivered per simulated "chunk" of a progressive load. `None`
    /// delivers the whole object in one call.
    chunk_size: Option<usize>,
    chunk_delay: Duration,
    /// If set, `load_file_data` stops delivering after this many bytes and
    /// then parks forever — simulates a stalled network load (spec §8
    /// scenario 3).
    stall_after: Option<usize>,
    load_calls: AtomicUsize,
}

impl Default for MemoryLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLoader {
    #[must_use]
    pub fn new() -> Self {
        Self {
            objects: Mutex::new(HashMap::new()),
            chunk_size: None,
            chunk_delay: Duration::ZERO,
            stall_after: None,
            load_calls: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn with_progressive_delivery(mut self, chunk_size: usize, chunk_delay: Duration) -> Self {
        self.chunk_size = Some(chunk_size);
        self.chunk_delay = chunk_delay;
        self
    }

    #[must_use]
    pub fn with_stall_after(mut self, bytes: usize) -> Self {
        self.stall_after = Some(bytes);
        self
    }

    pub fn put_object(&self, file_id: i64, stream_id: i32, content: Vec<u8>) {
        self.objects.lock().unwrap().insert((file_id, stream_id), content);
    }

    #[must_use]
    pub fn object(&self, file_id: i64, stream_id: i32) -> Option<Vec<u8>> {
        self.objects.lock().unwrap().get(&(file_id, stream_id)).cloned()
    }

    /// Number of times `load_file_data` has been invoked — used to assert
    /// the at-most-one-load invariant (spec §8, testable property #1).
    #[must_use]
    pub fn load_call_count(&self) -> usize {
        self.load_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FileLoader for MemoryLoader {
    fn capabilities(&self) -> LoaderCapabilities {
        LoaderCapabilities {
            random_load: false,
            convert_to_file_backed: true,
            directory_ops: false,
        }
    }

    async fn load_file_data(
        &self,
        file_id: i64,
        stream_id: i32,
        _object_id: Option<&str>,
        segment: &FileSegment,
    ) -> Result<()> {
        self.load_calls.fetch_add(1, Ordering::SeqCst);
        let content = self.object(file_id, stream_id).unwrap_or_default();
        segment.create_temporary_file()?;
        let file = OpenOptions::new().write(true).open(segment.info().temp_path())?;
        segment.info().set_file_length(i64::try_from(content.len()).unwrap_or(i64::MAX));

        let chunk = self.chunk_size.unwrap_or(content.len().max(1));
        let mut delivered = 0usize;
        while delivered < content.len() {
            if let Some(stall_at) = self.stall_after {
                if delivered >= stall_at {
                    // Simulate a stalled network loader: park indefinitely.
                    // The reader's own DataLoadWaitTime bound is what
                    // actually times the test out, not this task.
                    loop {
                        tokio::time::sleep(Duration::from_secs(3600)).await;
                    }
                }
            }
            let end = (delivered + chunk).min(content.len());
            file.write_at(&content[delivered..end], delivered as u64)?;
            delivered = end;
            segment.info().set_readable_length(delivered as i64);
            segment.info().signal_data_available();
            if self.chunk_delay > Duration::ZERO && delivered < content.len() {
                tokio::time::sleep(self.chunk_delay).await;
            }
        }
        segment
            .info()
            .set_readable_length(crate::segment::READABLE_LENGTH_WHOLE_FILE);
        segment.info().signal_data_available();
        Ok(())
    }

    async fn save_file_data(
        &self,
        file_id: i64,
        stream_id: i32,
        segment: &FileSegment,
        _attrs: &[(String, serde_json::Value)],
    ) -> Result<String> {
        let content = std::fs::read(segment.info().temp_path())?;
        self.put_object(file_id, stream_id, content);
        Ok(format!("mem-object-{file_id}-{stream_id}"))
    }

    async fn delete_file(
        &self,
        _virtual_path: &std::path::Path,
        file_id: i64,
        stream_id: i32,
    ) -> Result<()> {
        self.objects.lock().unwrap().remove(&(file_id, stream_id));
        Ok(())
    }
}

impl FileStateListener for MemoryLoader {
    fn file_state_expired(&self, _state: &Arc<FileState>) -> bool {
        false
    }

    fn file_state_closed(&self, state: &Arc<FileState>) {
        if let Some(segment) = state.segment() {
            if !segment.updated() {
                let _ = std::fs::remove_file(segment.temp_path());
            }
        }
    }
}
