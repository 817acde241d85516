//! Queued-request types, the in-memory FIFO, and the durable-store
//! contracts the core consumes (spec §3, §4.4, §4.6).

mod durable;
mod object_id;
mod queue;
mod types;

pub use durable::{DBQueueInterface, SqliteQueueStore};
pub use object_id::{ObjectIdInterface, SqliteObjectIdStore};
pub use queue::FileRequestQueue;
pub use types::{
    DeleteFileRequest, FileRequest, MultipleFileRequest, RequestAttr, RequestKind,
    SingleFileRequest,
};
