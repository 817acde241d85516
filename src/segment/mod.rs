//! `FileSegment` / `SegmentInfo` — the local temp-file cache of a single
//! remote object (spec §3, §4.1).

mod file_segment;
mod info;

pub use file_segment::{FileSegment, SaveableStatus};
pub(crate) use file_segment::WaitBudget;
pub use info::{SegmentInfo, SegmentState, READABLE_LENGTH_WHOLE_FILE};
