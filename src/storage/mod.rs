pub mod log;
pub mod meta;

pub use log::{LogStore, LogStoreOptions};
pub use meta::{FileMetaStore, FlushMetaStore, MemoryMetaStore};
