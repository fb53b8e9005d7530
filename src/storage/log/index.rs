use tracing::warn;

use crate::entry::ASQN_IGNORE;

/// Location of one entry frame body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryMeta {
    pub index: u64,
    pub term: u64,
    pub asqn: i64,
    pub segment_id: u64,
    /// Offset of the frame body inside the segment file.
    pub offset: u64,
    pub size: u64,
}

/// In-memory index over the live entries of the log.
///
/// `entries[i]` is the entry at `first_index + i`. Application entries are
/// additionally tracked in `asqns` as `(asqn, index)` pairs in index order.
#[derive(Debug, Clone)]
pub struct EntryIndex {
    first_index: u64,
    entries: Vec<EntryMeta>,
    asqns: Vec<(i64, u64)>,
}

impl Default for EntryIndex {
    fn default() -> Self {
        Self::new(1)
    }
}

impl EntryIndex {
    pub fn new(first_index: u64) -> Self {
        Self {
            first_index,
            entries: Vec::new(),
            asqns: Vec::new(),
        }
    }

    pub fn first_index(&self) -> u64 {
        self.first_index
    }

    /// `first_index - 1` when empty.
    pub fn last_index(&self) -> u64 {
        (self.first_index + self.entries.len() as u64).saturating_sub(1)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_valid_index(&self, index: u64) -> bool {
        index >= self.first_index && index <= self.last_index()
    }

    pub fn get(&self, index: u64) -> Option<&EntryMeta> {
        if !self.is_valid_index(index) {
            return None;
        }
        self.entries.get((index - self.first_index) as usize)
    }

    pub fn last(&self) -> Option<&EntryMeta> {
        self.entries.last()
    }

    /// Asqn of the last application entry.
    pub fn last_asqn(&self) -> Option<i64> {
        self.asqns.last().map(|&(asqn, _)| asqn)
    }

    pub fn iter(&self) -> impl Iterator<Item = &EntryMeta> {
        self.entries.iter()
    }

    /// Adds the next entry. An empty index adopts the entry's index as its first index.
    ///
    /// Asqns are expected to be non-decreasing; appends enforce it, so a decrease can
    /// only come from files written before that check.
    pub fn push(&mut self, meta: EntryMeta) {
        if self.entries.is_empty() {
            self.first_index = meta.index;
        }
        debug_assert_eq!(meta.index, self.last_index() + 1);

        if meta.asqn != ASQN_IGNORE {
            if let Some(&(last_asqn, _)) = self.asqns.last() {
                if meta.asqn < last_asqn {
                    warn!(
                        "Entry {} has asqn {} lower than previous asqn {}",
                        meta.index, meta.asqn, last_asqn
                    );
                }
            }
            self.asqns.push((meta.asqn, meta.index));
        }
        self.entries.push(meta);
    }

    /// Keeps entries up to and including `index`.
    pub fn truncate_suffix(&mut self, index: u64) {
        if index >= self.last_index() {
            return;
        }
        if index < self.first_index {
            self.entries.clear();
            self.asqns.clear();
            return;
        }
        let keep_count = (index - self.first_index + 1) as usize;
        self.entries.truncate(keep_count);
        let keep_asqns = self.asqns.partition_point(|&(_, i)| i <= index);
        self.asqns.truncate(keep_asqns);
    }

    /// Drops entries before `index`; `index` becomes the first index.
    pub fn truncate_prefix(&mut self, index: u64) {
        if index <= self.first_index {
            return;
        }
        if index > self.last_index() {
            self.reset(index);
            return;
        }
        let remove_count = (index - self.first_index) as usize;
        self.entries.drain(0..remove_count);
        let remove_asqns = self.asqns.partition_point(|&(_, i)| i < index);
        self.asqns.drain(0..remove_asqns);
        self.first_index = index;
    }

    pub fn reset(&mut self, next_index: u64) {
        self.entries.clear();
        self.asqns.clear();
        self.first_index = next_index;
    }

    /// Index of the first application entry with `asqn >= target`, looking only at
    /// entries up to `upper_index`. Falls back to the entry with the greatest asqn
    /// when every asqn is lower than the target.
    pub fn seek_asqn(&self, target: i64, upper_index: u64) -> Option<u64> {
        let visible = self.asqns.partition_point(|&(_, i)| i <= upper_index);
        let candidates = &self.asqns[..visible];
        let pos = candidates.partition_point(|&(asqn, _)| asqn < target);
        candidates
            .get(pos)
            .or_else(|| candidates.last())
            .map(|&(_, index)| index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(index: u64, asqn: i64) -> EntryMeta {
        EntryMeta {
            index,
            term: 1,
            asqn,
            segment_id: 1,
            offset: index * 100,
            size: 50,
        }
    }

    fn index_with(first: u64, asqns: &[i64]) -> EntryIndex {
        let mut index = EntryIndex::new(first);
        for (i, asqn) in asqns.iter().enumerate() {
            index.push(meta(first + i as u64, *asqn));
        }
        index
    }

    #[test]
    fn test_empty_index_bounds() {
        let index = EntryIndex::default();
        assert_eq!(index.first_index(), 1);
        assert_eq!(index.last_index(), 0);
        assert!(index.is_empty());
        assert!(index.get(1).is_none());
    }

    #[test]
    fn test_push_adopts_first_index() {
        let mut index = EntryIndex::default();
        index.push(meta(10, ASQN_IGNORE));
        index.push(meta(11, 5));
        assert_eq!(index.first_index(), 10);
        assert_eq!(index.last_index(), 11);
        assert_eq!(index.get(11).unwrap().asqn, 5);
        assert!(!index.is_valid_index(9));
        assert!(!index.is_valid_index(12));
    }

    #[test]
    fn test_truncate_suffix() {
        let mut index = index_with(1, &[2, 4, 6, 8, 10]);
        index.truncate_suffix(3);
        assert_eq!(index.last_index(), 3);
        assert_eq!(index.len(), 3);
        assert_eq!(index.seek_asqn(i64::MAX, u64::MAX), Some(3));

        // no-op beyond the tail
        index.truncate_suffix(10);
        assert_eq!(index.last_index(), 3);

        // everything, first index is kept
        index.truncate_suffix(0);
        assert!(index.is_empty());
        assert_eq!(index.first_index(), 1);
        assert_eq!(index.last_index(), 0);
        assert_eq!(index.seek_asqn(1, u64::MAX), None);
    }

    #[test]
    fn test_truncate_prefix() {
        let mut index = index_with(1, &[2, 4, 6, 8, 10]);
        index.truncate_prefix(3);
        assert_eq!(index.first_index(), 3);
        assert_eq!(index.last_index(), 5);
        assert_eq!(index.seek_asqn(0, u64::MAX), Some(3));

        index.truncate_prefix(2);
        assert_eq!(index.first_index(), 3);

        index.truncate_prefix(9);
        assert!(index.is_empty());
        assert_eq!(index.first_index(), 9);
        assert_eq!(index.last_index(), 8);
    }

    #[test]
    fn test_reset() {
        let mut index = index_with(1, &[2, 4]);
        index.reset(10);
        assert!(index.is_empty());
        assert_eq!(index.first_index(), 10);
        assert_eq!(index.last_index(), 9);
    }

    #[test]
    fn test_seek_asqn_skips_non_application_entries() {
        // entries 1..=5: initial, app(4), config, app(8), app(12)
        let index = index_with(1, &[ASQN_IGNORE, 4, ASQN_IGNORE, 8, 12]);
        assert_eq!(index.seek_asqn(0, u64::MAX), Some(2));
        assert_eq!(index.seek_asqn(4, u64::MAX), Some(2));
        assert_eq!(index.seek_asqn(5, u64::MAX), Some(4));
        assert_eq!(index.seek_asqn(12, u64::MAX), Some(5));
        assert_eq!(index.seek_asqn(i64::MAX, u64::MAX), Some(5));
    }

    #[test]
    fn test_last_asqn_ignores_non_application_entries() {
        let mut index = index_with(1, &[4, ASQN_IGNORE]);
        assert_eq!(index.last_asqn(), Some(4));
        index.truncate_suffix(0);
        assert_eq!(index.last_asqn(), None);
    }

    #[test]
    fn test_seek_asqn_respects_upper_index() {
        let index = index_with(1, &[4, 8, 12]);
        assert_eq!(index.seek_asqn(9, 2), Some(2));
        assert_eq!(index.seek_asqn(i64::MAX, 1), Some(1));
        assert_eq!(index.seek_asqn(0, 0), None);
    }
}
