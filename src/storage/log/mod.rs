//! Segmented log storage.
//!
//! Every operation (append, truncate, reset) is appended to the active segment as a
//! frame. An in-memory index of the live entries is rebuilt by replaying the
//! segments on open.
//!
//! # Module Structure
//!
//! - `record`: Frame header and the bodies of truncate/reset frames
//! - `index`: In-memory entry index with asqn lookup
//! - `segment`: Log segment file operations
//! - `store`: Multi-segment store with rotation, compaction and caching

mod index;
mod record;
mod segment;
mod store;

pub use index::{EntryIndex, EntryMeta};
pub use record::{FRAME_HEADER_SIZE, FRAME_MAGIC, FrameHeader, FrameKind, ResetRecord, TruncateRecord};
pub use segment::LogSegment;
pub use store::{DEFAULT_MAX_SEGMENT_SIZE, LogStore, LogStoreOptions};
