//! `FileState` / `FileStateCache` — the path-keyed cache of open-file
//! bookkeeping sitting above the segment layer (spec §3, §4.2).

mod access;
mod cache;
mod file_state;

pub use access::{can_grant, AccessToken, DesiredAccess, FileOpenParams, SharingMode};
pub use cache::{FileStateCache, FileStateListener, NoopFileStateListener};
pub use file_state::{ByteRangeLock, FileState, PathStatus};
