use std::{
    path::PathBuf,
    sync::{
        Arc, Weak,
        atomic::{AtomicU64, Ordering},
    },
};

use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use crate::{
    config::RaftLogOptions,
    entry::{IndexedLogEntry, LogEntry, PersistedRecord},
    error::{LogError, LogResult},
    flush::{DelayedFlusher, DirectFlusher, Flusher, Journal, TokioScheduler},
    reader::{RaftLogReader, ReaderMode},
    storage::{
        log::LogStore,
        meta::{FileMetaStore, FlushMetaStore},
    },
};

struct RaftLogInner {
    name: String,
    store: Arc<LogStore>,
    journal: Arc<dyn Journal>,
    commit_index: AtomicU64,
    flusher: Arc<dyn Flusher>,
    meta_store: Arc<dyn FlushMetaStore>,
    // one mutation at a time; reads only take the store lock
    write_lock: Mutex<()>,
    /// Cursors of the open readers, moved back when entries below them are discarded.
    readers: Mutex<Vec<Weak<Mutex<u64>>>>,
}

/// The indexed log of one raft partition.
///
/// Cloning is cheap and every clone refers to the same log. Readers keep a clone,
/// so they see appends and truncations as they happen.
#[derive(Clone)]
pub struct RaftLog {
    inner: Arc<RaftLogInner>,
}

impl RaftLog {
    pub fn builder() -> RaftLogBuilder {
        RaftLogBuilder::new()
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub(crate) fn store(&self) -> &LogStore {
        &self.inner.store
    }

    /// Appends `entry` at `last_index + 1` with the given term.
    pub fn append(&self, entry: LogEntry, term: u64) -> LogResult<IndexedLogEntry> {
        let _guard = self.inner.write_lock.lock();
        let index = self.inner.store.last_index() + 1;
        let record = PersistedRecord::from_entry(index, term, &entry).map_err(|e| {
            warn!("Failed to encode entry {} of log {}: {}", index, self.inner.name, e);
            LogError::io(e)
        })?;

        let indexed = self.inner.store.append(record)?;
        self.notify_flusher()?;
        Ok(indexed)
    }

    /// Appends a record persisted elsewhere, keeping its bytes and asqn as they are.
    ///
    /// The record must be the next index of this log.
    pub fn append_record(&self, record: PersistedRecord) -> LogResult<IndexedLogEntry> {
        let _guard = self.inner.write_lock.lock();
        let indexed = self.inner.store.append(record).map_err(|e| {
            if e.is_protocol_violation() {
                warn!("Rejected record for log {}: {}", self.inner.name, e);
            }
            e
        })?;
        self.notify_flusher()?;
        Ok(indexed)
    }

    /// Discards every entry after `index`. Committed entries cannot be discarded.
    pub fn delete_after(&self, index: u64) -> LogResult<()> {
        let _guard = self.inner.write_lock.lock();
        let commit_index = self.commit_index();
        if index < commit_index {
            return Err(LogError::CommittedTruncation {
                index,
                commit_index,
            });
        }
        if index >= self.inner.store.last_index() {
            return Ok(());
        }

        self.inner.store.delete_after(index)?;
        self.rewind_readers(index + 1);
        debug!("Deleted entries of log {} after {}", self.inner.name, index);
        self.notify_flusher()
    }

    /// Drops every entry; the next append gets `next_index`.
    ///
    /// The commit index is lowered to `next_index - 1` if it was beyond it.
    pub fn reset(&self, next_index: u64) -> LogResult<()> {
        let _guard = self.inner.write_lock.lock();
        let next_index = next_index.max(1);
        self.inner.store.reset(next_index)?;
        self.rewind_readers(next_index);
        self.inner
            .commit_index
            .fetch_min(next_index - 1, Ordering::AcqRel);
        self.notify_flusher()
    }

    /// Raises the commit index, clamped to the last index. Lowering it is an error.
    ///
    /// Returns the commit index in effect afterwards.
    pub fn set_commit_index(&self, index: u64) -> LogResult<u64> {
        let _guard = self.inner.write_lock.lock();
        let current = self.commit_index();
        if index < current {
            return Err(LogError::CommitRegression {
                current,
                requested: index,
            });
        }

        let last_index = self.inner.store.last_index();
        let effective = index.min(last_index).max(current);
        if effective < index {
            debug!(
                "Clamped commit index of log {} from {} to last index {}",
                self.inner.name, index, last_index
            );
        }
        self.inner.commit_index.store(effective, Ordering::Release);
        Ok(effective)
    }

    /// Deletes whole segments below `index`, never past the commit index.
    ///
    /// Returns whether anything was deleted; the first index may stay below `index`.
    pub fn compact(&self, index: u64) -> LogResult<bool> {
        let _guard = self.inner.write_lock.lock();
        let bound = index.min(self.commit_index() + 1);
        let compacted = self.inner.store.compact(bound)?;
        if compacted {
            info!(
                "Compacted log {} up to {}, first index is now {}",
                self.inner.name,
                bound,
                self.inner.store.first_index()
            );
        }
        Ok(compacted)
    }

    /// Syncs the log and records the last index as flushed, whatever the flusher.
    pub fn flush(&self) -> LogResult<()> {
        self.inner.store.flush()?;
        self.inner
            .meta_store
            .store_last_flushed_index(self.inner.store.last_index())
    }

    /// Gives a new reader its cursor, starting at `next_index`.
    pub(crate) fn register_reader(&self, next_index: u64) -> Arc<Mutex<u64>> {
        let cursor = Arc::new(Mutex::new(next_index));
        let mut readers = self.inner.readers.lock();
        readers.retain(|reader| reader.strong_count() > 0);
        readers.push(Arc::downgrade(&cursor));
        cursor
    }

    /// Moves every reader positioned after `next_index` back to it.
    fn rewind_readers(&self, next_index: u64) {
        let mut readers = self.inner.readers.lock();
        readers.retain(|reader| match reader.upgrade() {
            Some(cursor) => {
                let mut cursor = cursor.lock();
                if *cursor > next_index {
                    trace!(
                        "Moved reader of log {} from {} back to {}",
                        self.inner.name, *cursor, next_index
                    );
                    *cursor = next_index;
                }
                true
            }
            None => false,
        });
    }

    fn notify_flusher(&self) -> LogResult<()> {
        self.inner
            .flusher
            .flush(&self.inner.journal, &self.inner.meta_store)
    }

    pub fn get(&self, index: u64) -> LogResult<Option<IndexedLogEntry>> {
        self.inner.store.get(index)
    }

    pub fn term(&self, index: u64) -> Option<u64> {
        self.inner.store.term(index)
    }

    pub fn last_entry(&self) -> LogResult<Option<IndexedLogEntry>> {
        self.inner.store.last_entry()
    }

    pub fn first_index(&self) -> u64 {
        self.inner.store.first_index()
    }

    pub fn last_index(&self) -> u64 {
        self.inner.store.last_index()
    }

    pub fn last_term(&self) -> u64 {
        self.inner.store.last_term()
    }

    pub fn commit_index(&self) -> u64 {
        self.inner.commit_index.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.inner.store.is_empty()
    }

    pub fn is_open(&self) -> bool {
        self.inner.store.is_open()
    }

    pub fn flushes_directly(&self) -> bool {
        self.inner.flusher.is_direct()
    }

    pub fn last_flushed_index(&self) -> LogResult<u64> {
        self.inner.meta_store.load_last_flushed_index()
    }

    /// Reader over every entry, committed or not, starting at the first index.
    pub fn open_uncommitted_reader(&self) -> RaftLogReader {
        RaftLogReader::new(self.clone(), ReaderMode::Uncommitted)
    }

    /// Reader that stops at the commit index.
    pub fn open_committed_reader(&self) -> RaftLogReader {
        RaftLogReader::new(self.clone(), ReaderMode::Committed)
    }

    /// Stops the flusher, syncs and records the last index. Later calls are no-ops.
    pub fn close(&self) -> LogResult<()> {
        let _guard = self.inner.write_lock.lock();
        if !self.inner.store.is_open() {
            return Ok(());
        }

        self.inner.flusher.close();
        self.inner.store.flush()?;
        let last_index = self.inner.store.last_index();
        self.inner.meta_store.store_last_flushed_index(last_index)?;
        self.inner.store.close()?;

        info!(
            "Closed raft log {} at last index {}",
            self.inner.name, last_index
        );
        Ok(())
    }
}

pub struct RaftLogBuilder {
    options: RaftLogOptions,
    meta_store: Option<Arc<dyn FlushMetaStore>>,
    flusher: Option<Arc<dyn Flusher>>,
}

impl Default for RaftLogBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RaftLogBuilder {
    pub fn new() -> Self {
        Self {
            options: RaftLogOptions::default(),
            meta_store: None,
            flusher: None,
        }
    }

    pub fn with_options(mut self, options: RaftLogOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_directory<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.options.dir = dir.into();
        self
    }

    pub fn with_name<S: Into<String>>(mut self, name: S) -> Self {
        self.options.name = name.into();
        self
    }

    pub fn with_meta_store(mut self, meta_store: Arc<dyn FlushMetaStore>) -> Self {
        self.meta_store = Some(meta_store);
        self
    }

    pub fn with_flush_explicitly(mut self, flush_explicitly: bool) -> Self {
        self.options.flush_explicitly = flush_explicitly;
        self
    }

    /// Overrides the flusher chosen by `flush_explicitly`.
    pub fn with_flusher(mut self, flusher: Arc<dyn Flusher>) -> Self {
        self.flusher = Some(flusher);
        self
    }

    pub fn with_max_segment_size(mut self, max_segment_size: u64) -> Self {
        self.options.max_segment_size = max_segment_size;
        self
    }

    pub fn with_cache_entries_size(mut self, cache_entries_size: usize) -> Self {
        self.options.cache_entries_size = cache_entries_size;
        self
    }

    /// Opens the log, recovering whatever the directory already holds.
    ///
    /// Delayed flushing without an explicit flusher needs a tokio runtime.
    pub fn build(self) -> LogResult<RaftLog> {
        let options = self.options;
        options.validate()?;

        let flusher: Arc<dyn Flusher> = match self.flusher {
            Some(flusher) => flusher,
            None if options.flush_explicitly => Arc::new(DirectFlusher),
            None => Arc::new(DelayedFlusher::new(
                Arc::new(TokioScheduler::current()?),
                options.flush_delay,
            )),
        };
        let meta_store = self
            .meta_store
            .unwrap_or_else(|| Arc::new(FileMetaStore::new(options.meta_path())));

        let store = Arc::new(LogStore::open(options.store_options())?);
        let last_flushed_index = meta_store.load_last_flushed_index()?;
        if last_flushed_index > store.last_index() {
            debug!(
                "Log {} recorded flushed index {} beyond its last index {}",
                options.name,
                last_flushed_index,
                store.last_index()
            );
        }

        info!(
            "Opened raft log {}: first_index={}, last_index={}, last_flushed_index={}, direct_flush={}",
            options.name,
            store.first_index(),
            store.last_index(),
            last_flushed_index,
            flusher.is_direct()
        );

        let journal: Arc<dyn Journal> = store.clone();
        Ok(RaftLog {
            inner: Arc::new(RaftLogInner {
                name: options.name,
                store,
                journal,
                commit_index: AtomicU64::new(0),
                flusher,
                meta_store,
                write_lock: Mutex::new(()),
                readers: Mutex::new(Vec::new()),
            }),
        })
    }
}
