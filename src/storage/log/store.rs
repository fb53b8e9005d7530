use std::{
    collections::VecDeque,
    fs,
    path::PathBuf,
    sync::atomic::{AtomicBool, Ordering},
};

use anyhow::anyhow;
use parking_lot::RwLock;
use tracing::{debug, error, info, trace, warn};

use crate::{
    entry::{ASQN_IGNORE, IndexedLogEntry, PersistedRecord},
    error::{LogError, LogResult},
    flush::Journal,
};

use super::{
    index::{EntryIndex, EntryMeta},
    segment::{LogSegment, ReplayedFrame},
};

/// Default maximum segment size (64MB)
pub const DEFAULT_MAX_SEGMENT_SIZE: u64 = 64 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct LogStoreOptions {
    /// Directory holding the segment files
    pub dir: PathBuf,
    /// Prefix of every segment file name
    pub name: String,
    /// The active segment is sealed once it grows past this size
    pub max_segment_size: u64,
    /// Number of most recent entries kept decoded in memory
    pub cache_entries_size: usize,
}

impl Default for LogStoreOptions {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./data/raft"),
            name: "raft-partition".to_string(),
            max_segment_size: DEFAULT_MAX_SEGMENT_SIZE,
            cache_entries_size: 1000,
        }
    }
}

pub(crate) struct LogStoreInner {
    /// Read-only segments ordered by id.
    sealed: Vec<LogSegment>,
    /// The only segment written to; its id is greater than every sealed id.
    active: LogSegment,
    index: EntryIndex,
    /// Most recent entries, contiguous and ending at the last index.
    cache: VecDeque<IndexedLogEntry>,
    next_segment_id: u64,
}

impl LogStoreInner {
    fn segment(&self, id: u64) -> Option<&LogSegment> {
        if id == self.active.id() {
            return Some(&self.active);
        }
        self.sealed
            .binary_search_by_key(&id, |s| s.id())
            .ok()
            .map(|pos| &self.sealed[pos])
    }

    fn cached(&self, index: u64) -> Option<&IndexedLogEntry> {
        let first = self.cache.front()?.index();
        if index < first {
            return None;
        }
        self.cache.get((index - first) as usize)
    }

    fn read(&self, meta: &EntryMeta) -> LogResult<IndexedLogEntry> {
        if let Some(entry) = self.cached(meta.index) {
            return Ok(entry.clone());
        }

        let segment = self.segment(meta.segment_id).ok_or_else(|| {
            error!(
                "Segment {} of entry {} is missing",
                meta.segment_id, meta.index
            );
            LogError::Corrupted { index: meta.index }
        })?;
        let record = segment.read_record(meta.offset, meta.size).map_err(|e| {
            warn!("Failed to read entry {}: {}", meta.index, e);
            LogError::io(e)
        })?;
        if record.index != meta.index {
            error!(
                "Entry at offset {} of segment {} has index {}, expected {}",
                meta.offset, meta.segment_id, record.index, meta.index
            );
            return Err(LogError::Corrupted { index: meta.index });
        }
        IndexedLogEntry::from_record(record)
    }
}

/// Append-only, segmented storage of persisted records.
///
/// Truncation and reset are themselves appended as records; replaying the
/// segments in order on open rebuilds the same view of the log.
pub struct LogStore {
    options: LogStoreOptions,
    inner: RwLock<LogStoreInner>,
    open: AtomicBool,
}

impl LogStore {
    pub fn open(options: LogStoreOptions) -> LogResult<Self> {
        fs::create_dir_all(&options.dir).map_err(|e| {
            warn!("Failed to create log directory {:?}: {}", options.dir, e);
            LogError::io(e)
        })?;

        let mut segment_files: Vec<(u64, PathBuf)> = Vec::new();
        for entry in fs::read_dir(&options.dir)?.flatten() {
            let path = entry.path();
            if let Some(id) = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| LogSegment::parse_id(&options.name, n))
            {
                segment_files.push((id, path));
            }
        }
        segment_files.sort_by_key(|(id, _)| *id);

        let mut index = EntryIndex::default();
        let mut segments = Vec::with_capacity(segment_files.len().max(1));
        let segment_count = segment_files.len();

        for (position, (id, path)) in segment_files.into_iter().enumerate() {
            let mut segment = LogSegment::open(path, id).map_err(LogError::io)?;
            let outcome = segment
                .replay(|frame| apply_replayed_frame(&mut index, id, frame))
                .map_err(|e| {
                    error!("Failed to replay segment {}: {}", id, e);
                    LogError::Corrupted {
                        index: index.last_index() + 1,
                    }
                })?;

            if outcome.torn {
                if position + 1 < segment_count {
                    error!(
                        "Sealed segment {} is corrupted after {} bytes",
                        id, outcome.valid_len
                    );
                    return Err(LogError::Corrupted {
                        index: index.last_index() + 1,
                    });
                }
                warn!(
                    "Discarding torn tail of segment {} after {} bytes",
                    id, outcome.valid_len
                );
                segment.truncate_to(outcome.valid_len).map_err(LogError::io)?;
            }
            segments.push(segment);
        }

        let active = match segments.pop() {
            Some(segment) => segment,
            None => LogSegment::create(&options.dir, &options.name, 1).map_err(LogError::io)?,
        };
        let next_segment_id = active.id() + 1;

        info!(
            "Opened log {}: segments={}, first_index={}, last_index={}",
            options.name,
            segments.len() + 1,
            index.first_index(),
            index.last_index()
        );

        Ok(Self {
            options,
            inner: RwLock::new(LogStoreInner {
                sealed: segments,
                active,
                index,
                cache: VecDeque::new(),
                next_segment_id,
            }),
            open: AtomicBool::new(true),
        })
    }

    pub fn options(&self) -> &LogStoreOptions {
        &self.options
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> LogResult<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(LogError::Closed)
        }
    }

    pub fn first_index(&self) -> u64 {
        self.inner.read().index.first_index()
    }

    pub fn last_index(&self) -> u64 {
        self.inner.read().index.last_index()
    }

    /// Term of the last entry, 0 when empty.
    pub fn last_term(&self) -> u64 {
        self.inner.read().index.last().map_or(0, |m| m.term)
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().index.is_empty()
    }

    pub fn segment_count(&self) -> usize {
        self.inner.read().sealed.len() + 1
    }

    /// Term of the entry at `index`, without reading it from disk.
    pub fn term(&self, index: u64) -> Option<u64> {
        self.inner.read().index.get(index).map(|m| m.term)
    }

    pub fn get(&self, index: u64) -> LogResult<Option<IndexedLogEntry>> {
        self.ensure_open()?;
        let inner = self.inner.read();
        match inner.index.get(index) {
            Some(meta) => inner.read(meta).map(Some),
            None => Ok(None),
        }
    }

    pub fn last_entry(&self) -> LogResult<Option<IndexedLogEntry>> {
        self.ensure_open()?;
        let inner = self.inner.read();
        match inner.index.last() {
            Some(meta) => inner.read(meta).map(Some),
            None => Ok(None),
        }
    }

    /// See [`EntryIndex::seek_asqn`].
    pub fn seek_asqn(&self, asqn: i64, upper_index: u64) -> Option<u64> {
        self.inner.read().index.seek_asqn(asqn, upper_index)
    }

    /// Appends a record at `last_index + 1`; the record is written exactly as given.
    pub fn append(&self, record: PersistedRecord) -> LogResult<IndexedLogEntry> {
        self.ensure_open()?;
        let mut guard = self.inner.write();
        let inner = &mut *guard;

        let expected = inner.index.last_index() + 1;
        if record.index != expected {
            return Err(LogError::InvalidIndex {
                expected,
                actual: record.index,
            });
        }
        if record.asqn != ASQN_IGNORE {
            if let Some(previous) = inner.index.last_asqn() {
                if record.asqn < previous {
                    return Err(LogError::AsqnRegression {
                        index: record.index,
                        asqn: record.asqn,
                        previous,
                    });
                }
            }
        }
        let entry = IndexedLogEntry::from_record(record)?;

        self.maybe_rotate(inner)?;
        let segment_id = inner.active.id();
        let (offset, size) = inner
            .active
            .append_record(entry.persisted_record())
            .map_err(LogError::io)?;

        inner.index.push(EntryMeta {
            index: entry.index(),
            term: entry.term(),
            asqn: entry.asqn(),
            segment_id,
            offset,
            size,
        });

        if self.options.cache_entries_size > 0 {
            inner.cache.push_back(entry.clone());
            if inner.cache.len() > self.options.cache_entries_size {
                inner.cache.pop_front();
            }
        }

        trace!(
            "Appended entry: index={}, term={}, asqn={}, segment={}",
            entry.index(),
            entry.term(),
            entry.asqn(),
            segment_id
        );
        Ok(entry)
    }

    fn maybe_rotate(&self, inner: &mut LogStoreInner) -> LogResult<()> {
        let size = inner.active.size();
        if size == 0 || size < self.options.max_segment_size {
            return Ok(());
        }

        inner.active.sync_data().map_err(LogError::io)?;
        let segment_id = inner.next_segment_id;
        let segment = LogSegment::create(&self.options.dir, &self.options.name, segment_id)
            .map_err(LogError::io)?;
        let sealed = std::mem::replace(&mut inner.active, segment);
        let sealed_id = sealed.id();
        inner.sealed.push(sealed);
        inner.next_segment_id += 1;

        info!(
            "Rotated log {} from segment {} to segment {}",
            self.options.name, sealed_id, segment_id
        );
        Ok(())
    }

    /// Discards every entry after `index`.
    pub fn delete_after(&self, index: u64) -> LogResult<()> {
        self.ensure_open()?;
        let mut inner = self.inner.write();
        if index >= inner.index.last_index() {
            return Ok(());
        }

        inner.active.append_truncate(index).map_err(LogError::io)?;
        inner.index.truncate_suffix(index);
        while inner.cache.back().is_some_and(|e| e.index() > index) {
            inner.cache.pop_back();
        }

        debug!(
            "Truncated log {} after index {}",
            self.options.name, index
        );
        Ok(())
    }

    /// Deletes every segment and starts over with `next_index` as the next index.
    pub fn reset(&self, next_index: u64) -> LogResult<()> {
        self.ensure_open()?;
        let mut inner = self.inner.write();

        let segment_id = inner.next_segment_id;
        let mut segment = LogSegment::create(&self.options.dir, &self.options.name, segment_id)
            .map_err(LogError::io)?;
        segment.append_reset(next_index).map_err(LogError::io)?;
        segment.sync_data().map_err(LogError::io)?;

        let old_active = std::mem::replace(&mut inner.active, segment);
        let old_sealed = std::mem::take(&mut inner.sealed);
        inner.next_segment_id += 1;
        inner.index.reset(next_index);
        inner.cache.clear();

        for old in old_sealed.into_iter().chain(std::iter::once(old_active)) {
            old.delete().map_err(LogError::io)?;
        }
        info!(
            "Reset log {} to next index {}",
            self.options.name, next_index
        );
        Ok(())
    }

    /// Deletes sealed segments that only hold entries below `index`.
    ///
    /// Works at segment granularity, so the new first index may stay below `index`.
    /// Returns whether any segment was deleted.
    pub fn compact(&self, index: u64) -> LogResult<bool> {
        self.ensure_open()?;
        let mut inner = self.inner.write();
        if index <= inner.index.first_index() || inner.sealed.is_empty() {
            return Ok(false);
        }

        let keep_from = inner
            .index
            .get(index)
            .map_or(inner.active.id(), |m| m.segment_id);
        let obsolete = inner
            .sealed
            .iter()
            .take_while(|s| s.id() < keep_from)
            .count();
        if obsolete == 0 {
            return Ok(false);
        }

        let new_first = inner
            .index
            .iter()
            .find(|m| m.segment_id >= keep_from)
            .map_or(inner.index.last_index() + 1, |m| m.index);

        let removed: Vec<LogSegment> = inner.sealed.drain(..obsolete).collect();
        inner.index.truncate_prefix(new_first);
        while inner.cache.front().is_some_and(|e| e.index() < new_first) {
            inner.cache.pop_front();
        }

        for segment in removed {
            let id = segment.id();
            segment.delete().map_err(LogError::io)?;
            info!("Deleted compacted segment {} of log {}", id, self.options.name);
        }

        Ok(true)
    }

    /// Syncs the active segment. Sealed segments were synced when they were sealed.
    pub fn flush(&self) -> LogResult<()> {
        self.ensure_open()?;
        self.inner.read().active.sync_data().map_err(LogError::io)
    }

    /// Flushes and closes the store; later calls are no-ops.
    pub fn close(&self) -> LogResult<()> {
        if !self.is_open() {
            return Ok(());
        }
        self.flush()?;
        self.open.store(false, Ordering::Release);
        info!("Closed log {}", self.options.name);
        Ok(())
    }
}

impl Journal for LogStore {
    fn is_open(&self) -> bool {
        LogStore::is_open(self)
    }

    fn last_index(&self) -> u64 {
        LogStore::last_index(self)
    }

    fn flush(&self) -> LogResult<()> {
        LogStore::flush(self)
    }
}

fn apply_replayed_frame(
    index: &mut EntryIndex,
    segment_id: u64,
    frame: ReplayedFrame,
) -> anyhow::Result<()> {
    match frame {
        ReplayedFrame::Entry {
            record,
            offset,
            size,
        } => {
            let expected = index.last_index() + 1;
            if !index.is_empty() && record.index != expected {
                if record.index > expected {
                    return Err(anyhow!(
                        "Gap in segment {}: expected index {}, found {}",
                        segment_id,
                        expected,
                        record.index
                    ));
                }
                warn!(
                    "Entry {} in segment {} overwrites entries without a truncate record",
                    record.index, segment_id
                );
                index.truncate_suffix(record.index - 1);
            }
            index.push(EntryMeta {
                index: record.index,
                term: record.term,
                asqn: record.asqn,
                segment_id,
                offset,
                size,
            });
        }
        ReplayedFrame::TruncateSuffix(truncate) => index.truncate_suffix(truncate.index),
        ReplayedFrame::Reset(reset) => index.reset(reset.next_index),
    }
    Ok(())
}
