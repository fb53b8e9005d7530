//! Replicated log storage for a raft partition.
//!
//! [`RaftLog`] is an append-only, indexed and durable sequence of entries with
//! truncation, reset and commit tracking. [`RaftLogReader`]s iterate it live, and a
//! [`Flusher`] decides when appends reach the disk.

pub mod config;
pub mod entry;
pub mod error;
pub mod flush;
pub mod raft_log;
pub mod reader;
pub mod storage;

pub use config::RaftLogOptions;
pub use entry::{
    ASQN_IGNORE, ApplicationEntry, ConfigurationEntry, IndexedLogEntry, LogEntry, MemberType,
    PersistedRecord, RaftMember,
};
pub use error::{ErrorHandler, ErrorSeverity, LogError, LogResult};
pub use flush::{
    Cancellable, DelayedFlusher, DirectFlusher, Flusher, Journal, ScheduledTask, Scheduler,
    TokioScheduler,
};
pub use raft_log::{RaftLog, RaftLogBuilder};
pub use reader::{RaftLogReader, ReaderMode};
pub use storage::meta::{FileMetaStore, FlushMetaStore, MemoryMetaStore};
