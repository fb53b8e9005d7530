use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use crate::{
    entry::IndexedLogEntry,
    error::{LogError, LogResult},
    raft_log::RaftLog,
};

/// Which entries a reader may return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderMode {
    /// Everything up to the last index.
    Uncommitted,
    /// Only entries up to the commit index.
    Committed,
}

/// Cursor over a [`RaftLog`].
///
/// The reader sees the log as it is at every call: entries appended later become
/// visible, truncated entries disappear, and a cursor left below the first index
/// after compaction moves up to it. When the log is truncated or reset behind the
/// cursor, the cursor moves back so the entries written in their place are read.
pub struct RaftLogReader {
    log: RaftLog,
    mode: ReaderMode,
    // shared with the log, which moves it back on truncation
    next_index: Arc<Mutex<u64>>,
    closed: bool,
}

impl RaftLogReader {
    pub(crate) fn new(log: RaftLog, mode: ReaderMode) -> Self {
        let next_index = log.register_reader(log.first_index());
        Self {
            log,
            mode,
            next_index,
            closed: false,
        }
    }

    pub fn mode(&self) -> ReaderMode {
        self.mode
    }

    fn ensure_open(&self) -> LogResult<()> {
        if self.closed || !self.log.is_open() {
            Err(LogError::Closed)
        } else {
            Ok(())
        }
    }

    /// Highest index this reader may return.
    fn upper_bound(&self) -> u64 {
        let last_index = self.log.last_index();
        match self.mode {
            ReaderMode::Uncommitted => last_index,
            ReaderMode::Committed => last_index.min(self.log.commit_index()),
        }
    }

    /// The index the next call to [`RaftLogReader::next_entry`] returns.
    pub fn next_index(&self) -> u64 {
        (*self.next_index.lock()).max(self.log.first_index())
    }

    pub fn has_next(&self) -> bool {
        if self.ensure_open().is_err() {
            return false;
        }
        self.next_index() <= self.upper_bound()
    }

    pub fn next_entry(&mut self) -> LogResult<IndexedLogEntry> {
        self.ensure_open()?;
        // held until the cursor advances, so a truncation lands before or after the read
        let mut next_index = self.next_index.lock();
        let index = (*next_index).max(self.log.first_index());
        if index > self.upper_bound() {
            return Err(LogError::NoNextEntry { index });
        }

        // the tail may have been truncated since the bound was read
        let entry = self
            .log
            .get(index)?
            .ok_or(LogError::NoNextEntry { index })?;
        *next_index = index + 1;
        Ok(entry)
    }

    fn move_to(&self, index: u64) {
        *self.next_index.lock() = index;
    }

    /// Moves the cursor to `index`, clamped to `[first_index, upper_bound + 1]`.
    ///
    /// Returns the index the cursor ended up at.
    pub fn seek(&mut self, index: u64) -> LogResult<u64> {
        self.ensure_open()?;
        let first_index = self.log.first_index();
        let end = (self.upper_bound() + 1).max(first_index);
        let target = index.clamp(first_index, end);
        self.move_to(target);
        trace!(
            "Reader of log {} seeked to {} (requested {})",
            self.log.name(),
            target,
            index
        );
        Ok(target)
    }

    /// Positions the cursor on the last visible entry and returns its index.
    pub fn seek_to_last(&mut self) -> LogResult<u64> {
        self.ensure_open()?;
        let last = self.upper_bound();
        self.move_to(last.max(self.log.first_index()));
        Ok(last)
    }

    /// Positions the cursor on the first application entry with `asqn >= asqn`.
    ///
    /// When every asqn is lower, lands on the entry with the greatest asqn. Without any
    /// application entry the reader is left exhausted.
    pub fn seek_to_asqn(&mut self, asqn: i64) -> LogResult<u64> {
        self.ensure_open()?;
        let bound = self.upper_bound();
        let index = match self.log.store().seek_asqn(asqn, bound) {
            Some(index) => index,
            None => (bound + 1).max(self.log.first_index()),
        };
        self.move_to(index);
        trace!(
            "Reader of log {} seeked to asqn {} at index {}",
            self.log.name(),
            asqn,
            index
        );
        Ok(index)
    }

    /// Moves the cursor back to the first index.
    pub fn reset(&mut self) -> LogResult<u64> {
        self.ensure_open()?;
        let first_index = self.log.first_index();
        self.move_to(first_index);
        Ok(first_index)
    }

    /// Closing a reader leaves the log and other readers untouched.
    pub fn close(&mut self) {
        self.closed = true;
    }
}

impl Iterator for RaftLogReader {
    type Item = LogResult<IndexedLogEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if !self.has_next() {
            return None;
        }
        Some(self.next_entry())
    }
}
