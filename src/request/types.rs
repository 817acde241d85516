//! `FileRequest` variants queued between `CachedNetworkFile` and
//! `BackgroundLoadSave` (spec §3, §4.6).

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::state::FileState;

/// What a queued request asks a worker to do (spec §6's durable-queue kinds).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i32)]
pub enum RequestKind {
    Load = 1,
    Save = 2,
    TransSave = 3,
}

impl RequestKind {
    #[must_use]
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    #[must_use]
    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            1 => Some(Self::Load),
            2 => Some(Self::Save),
            3 => Some(Self::TransSave),
            _ => None,
        }
    }
}

/// One `(name, value)` attribute carried alongside a request, e.g. the
/// extent being saved. Opaque to the queue itself.
pub type RequestAttr = (String, serde_json::Value);

/// A single-file Load/Save/TransSave request (spec §3).
#[derive(Debug, Clone)]
pub struct SingleFileRequest {
    pub kind: RequestKind,
    pub file_id: i64,
    pub stream_id: i32,
    pub temp_path: PathBuf,
    pub virtual_path: PathBuf,
    pub seq_no: i64,
    pub thread_id: Option<u64>,
    /// Back-reference to the cached state this request targets, so a
    /// worker can re-pin/expire it without a second cache lookup. Not
    /// persisted — rehydrated by the queue loader on load from the
    /// durable store (spec §9: cyclic structures become owned-by-cache
    /// handles plus explicit back-references).
    pub file_state_ref: Option<Arc<FileState>>,
    pub attrs: Vec<RequestAttr>,
}

/// A grouped save spanning multiple files in one transaction (spec §3, §4.4
/// "TransactionQueueLoader").
#[derive(Debug, Clone)]
pub struct MultipleFileRequest {
    pub tran_id: i64,
    pub files: Vec<SingleFileRequest>,
}

/// A queued delete, processed the same way as a Save but against the
/// object store's delete primitive (spec §4.5 `delete_file`).
#[derive(Debug, Clone)]
pub struct DeleteFileRequest {
    pub file_id: i64,
    pub stream_id: i32,
    pub temp_path: PathBuf,
    pub virtual_path: PathBuf,
    pub file_state_ref: Option<Arc<FileState>>,
}

/// Everything a worker can pop off a queue (spec §3).
#[derive(Debug, Clone)]
pub enum FileRequest {
    Single(SingleFileRequest),
    Multiple(MultipleFileRequest),
    Delete(DeleteFileRequest),
}

impl FileRequest {
    /// The request kind dispatch is keyed on. `Delete` requests are routed
    /// like a `Save` (the worker calls the loader's delete primitive
    /// instead of `store_file`, but shares the same durable-removal and
    /// requeue handling).
    #[must_use]
    pub fn kind(&self) -> RequestKind {
        match self {
            Self::Single(r) => r.kind,
            Self::Multiple(r) => r
                .files
                .first()
                .map_or(RequestKind::TransSave, |f| f.kind),
            Self::Delete(_) => RequestKind::Save,
        }
    }

    #[must_use]
    pub fn file_state_ref(&self) -> Option<Arc<FileState>> {
        match self {
            Self::Single(r) => r.file_state_ref.clone(),
            Self::Multiple(r) => r.files.first().and_then(|f| f.file_state_ref.clone()),
            Self::Delete(r) => r.file_state_ref.clone(),
        }
    }

    /// `(file_id, stream_id)` pairs this request touches, for at-most-one
    /// in-flight bookkeeping at the worker level.
    #[must_use]
    pub fn file_stream_ids(&self) -> Vec<(i64, i32)> {
        match self {
            Self::Single(r) => vec![(r.file_id, r.stream_id)],
            Self::Multiple(r) => r.files.iter().map(|f| (f.file_id, f.stream_id)).collect(),
            Self::Delete(r) => vec![(r.file_id, r.stream_id)],
        }
    }
}
