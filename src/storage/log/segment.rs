use std::{
    fs::{File, OpenOptions},
    os::unix::fs::FileExt,
    path::{Path, PathBuf},
};

use anyhow::{Result, anyhow};
use tracing::{debug, warn};

use crate::entry::PersistedRecord;

use super::record::{
    FRAME_HEADER_SIZE, FrameHeader, FrameKind, ResetRecord, TruncateRecord, encode_frame,
};

const SEGMENT_FILE_EXT: &str = ".log";

/// A frame recovered while replaying a segment.
#[derive(Debug)]
pub enum ReplayedFrame {
    Entry {
        record: PersistedRecord,
        offset: u64,
        size: u64,
    },
    TruncateSuffix(TruncateRecord),
    Reset(ResetRecord),
}

/// Result of scanning a segment from the start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplayOutcome {
    /// Length of the prefix made of complete, valid frames.
    pub valid_len: u64,
    /// Whether bytes after `valid_len` were ignored.
    pub torn: bool,
}

/// One append-only segment file.
pub struct LogSegment {
    pub(crate) id: u64,
    pub(crate) path: PathBuf,
    file: File,
    /// Write position; everything before it is made of whole frames.
    size: u64,
}

impl LogSegment {
    pub fn file_name(name: &str, id: u64) -> String {
        format!("{}-{:010}{}", name, id, SEGMENT_FILE_EXT)
    }

    /// Extracts the segment id from a file name produced by [`LogSegment::file_name`].
    pub fn parse_id(name: &str, file_name: &str) -> Option<u64> {
        file_name
            .strip_prefix(name)?
            .strip_prefix('-')?
            .strip_suffix(SEGMENT_FILE_EXT)?
            .parse()
            .ok()
    }

    pub fn create(dir: &Path, name: &str, id: u64) -> Result<Self> {
        let path = dir.join(Self::file_name(name, id));
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| {
                warn!("Failed to create segment {:?}: {}", path, e);
                e
            })?;

        debug!("Created segment: id={}, path={:?}", id, path);
        Ok(Self {
            id,
            path,
            file,
            size: 0,
        })
    }

    /// Opens an existing segment. The write position is the file length until
    /// [`LogSegment::replay`] proves otherwise.
    pub fn open(path: PathBuf, id: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| {
                warn!("Failed to open segment {:?}: {}", path, e);
                e
            })?;
        let size = file.metadata()?.len();
        Ok(Self {
            id,
            path,
            file,
            size,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Appends one frame and returns the offset of its body.
    pub fn append_frame(&mut self, kind: FrameKind, body: &[u8]) -> Result<u64> {
        let frame = encode_frame(kind, body);
        self.file.write_all_at(&frame, self.size).map_err(|e| {
            warn!("Failed to write frame to segment {}: {}", self.id, e);
            e
        })?;
        let body_offset = self.size + FRAME_HEADER_SIZE;
        self.size += frame.len() as u64;
        Ok(body_offset)
    }

    pub fn append_record(&mut self, record: &PersistedRecord) -> Result<(u64, u64)> {
        let body = record.serialize()?;
        let offset = self.append_frame(FrameKind::Entry, &body)?;
        Ok((offset, body.len() as u64))
    }

    pub fn append_truncate(&mut self, index: u64) -> Result<()> {
        let body = TruncateRecord { index }.serialize()?;
        self.append_frame(FrameKind::TruncateSuffix, &body)?;
        Ok(())
    }

    pub fn append_reset(&mut self, next_index: u64) -> Result<()> {
        let body = ResetRecord { next_index }.serialize()?;
        self.append_frame(FrameKind::Reset, &body)?;
        Ok(())
    }

    pub fn read_record(&self, offset: u64, size: u64) -> Result<PersistedRecord> {
        let mut buf = vec![0u8; size as usize];
        self.file.read_exact_at(&mut buf, offset).map_err(|e| {
            warn!(
                "Failed to read segment {} at offset {}: {}",
                self.id, offset, e
            );
            e
        })?;
        PersistedRecord::deserialize(&buf)
    }

    pub fn sync_data(&self) -> Result<()> {
        self.file.sync_data().map_err(|e| {
            warn!("Failed to sync segment {}: {}", self.id, e);
            e.into()
        })
    }

    /// Cuts the file back to `len` bytes.
    pub fn truncate_to(&mut self, len: u64) -> Result<()> {
        self.file.set_len(len)?;
        self.file.sync_all()?;
        self.size = len;
        Ok(())
    }

    pub fn delete(self) -> Result<()> {
        let path = self.path.clone();
        drop(self.file);
        std::fs::remove_file(&path).map_err(|e| {
            warn!("Failed to delete segment {:?}: {}", path, e);
            anyhow!(e)
        })
    }

    /// Reads every frame from the start of the file and hands it to `visit`.
    ///
    /// Stops at the first incomplete or corrupted frame. The returned outcome
    /// tells how much of the file was valid; the segment itself is left untouched.
    pub fn replay<F>(&self, mut visit: F) -> Result<ReplayOutcome>
    where
        F: FnMut(ReplayedFrame) -> Result<()>,
    {
        let file_size = self.file.metadata()?.len();
        let mut offset = 0u64;
        let mut header_buf = [0u8; FRAME_HEADER_SIZE as usize];

        while offset < file_size {
            if offset + FRAME_HEADER_SIZE > file_size {
                warn!(
                    "Incomplete header at offset {} in segment {}, stopping replay",
                    offset, self.id
                );
                break;
            }
            self.file.read_exact_at(&mut header_buf, offset)?;

            let header = match FrameHeader::deserialize(&header_buf) {
                Ok(header) => header,
                Err(e) => {
                    warn!(
                        "Failed to deserialize header at offset {} in segment {}: {}",
                        offset, self.id, e
                    );
                    break;
                }
            };

            if offset + header.frame_len() > file_size {
                warn!(
                    "Incomplete frame at offset {} in segment {}, stopping replay",
                    offset, self.id
                );
                break;
            }

            let body_offset = offset + FRAME_HEADER_SIZE;
            let mut body = vec![0u8; header.body_len as usize];
            self.file.read_exact_at(&mut body, body_offset)?;
            if !header.matches(&body) {
                warn!(
                    "CRC mismatch at offset {} in segment {}, stopping replay",
                    offset, self.id
                );
                break;
            }

            let frame = match header.kind {
                FrameKind::Entry => ReplayedFrame::Entry {
                    record: PersistedRecord::deserialize(&body)?,
                    offset: body_offset,
                    size: header.body_len as u64,
                },
                FrameKind::TruncateSuffix => {
                    ReplayedFrame::TruncateSuffix(TruncateRecord::deserialize(&body)?)
                }
                FrameKind::Reset => ReplayedFrame::Reset(ResetRecord::deserialize(&body)?),
            };
            visit(frame)?;

            offset += header.frame_len();
        }

        Ok(ReplayOutcome {
            valid_len: offset,
            torn: offset < file_size,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::TempDir;

    use super::*;
    use crate::entry::{ApplicationEntry, LogEntry};

    fn create_test_record(index: u64, term: u64) -> PersistedRecord {
        let entry = LogEntry::Application(
            ApplicationEntry::new(
                index as i64,
                index as i64,
                format!("command_{}", index).into_bytes(),
            )
            .unwrap(),
        );
        PersistedRecord::from_entry(index, term, &entry).unwrap()
    }

    fn replay_all(segment: &LogSegment) -> (Vec<ReplayedFrame>, ReplayOutcome) {
        let mut frames = Vec::new();
        let outcome = segment
            .replay(|frame| {
                frames.push(frame);
                Ok(())
            })
            .unwrap();
        (frames, outcome)
    }

    #[test]
    fn test_segment_file_name() {
        let file_name = LogSegment::file_name("raft-partition-1", 7);
        assert_eq!(file_name, "raft-partition-1-0000000007.log");
        assert_eq!(LogSegment::parse_id("raft-partition-1", &file_name), Some(7));
        assert_eq!(LogSegment::parse_id("raft-partition-2", &file_name), None);
        assert_eq!(LogSegment::parse_id("raft-partition-1", "raft-partition-1.meta"), None);
    }

    #[test]
    fn test_segment_write_and_read_record() {
        let dir = TempDir::new().unwrap();
        let mut segment = LogSegment::create(dir.path(), "test", 1).unwrap();

        let (offset1, size1) = segment.append_record(&create_test_record(1, 1)).unwrap();
        let (offset2, size2) = segment.append_record(&create_test_record(2, 1)).unwrap();
        assert_eq!(offset1, FRAME_HEADER_SIZE);
        assert_eq!(offset2, offset1 + size1 + FRAME_HEADER_SIZE);
        assert_eq!(segment.size(), offset2 + size2);

        let record = segment.read_record(offset2, size2).unwrap();
        assert_eq!(record, create_test_record(2, 1));
    }

    #[test]
    fn test_segment_replay() {
        let dir = TempDir::new().unwrap();
        let mut segment = LogSegment::create(dir.path(), "test", 1).unwrap();
        segment.append_reset(5).unwrap();
        segment.append_record(&create_test_record(5, 1)).unwrap();
        segment.append_record(&create_test_record(6, 2)).unwrap();
        segment.append_truncate(5).unwrap();
        segment.sync_data().unwrap();

        let reopened = LogSegment::open(segment.path.clone(), 1).unwrap();
        let (frames, outcome) = replay_all(&reopened);
        assert_eq!(frames.len(), 4);
        assert!(!outcome.torn);
        assert_eq!(outcome.valid_len, segment.size());
        assert!(matches!(frames[0], ReplayedFrame::Reset(ResetRecord { next_index: 5 })));
        match &frames[2] {
            ReplayedFrame::Entry { record, .. } => {
                assert_eq!(record.index, 6);
                assert_eq!(record.term, 2);
            }
            other => panic!("unexpected frame {:?}", other),
        }
        assert!(matches!(
            frames[3],
            ReplayedFrame::TruncateSuffix(TruncateRecord { index: 5 })
        ));
    }

    #[test]
    fn test_segment_replay_stops_at_torn_tail() {
        let dir = TempDir::new().unwrap();
        let mut segment = LogSegment::create(dir.path(), "test", 1).unwrap();
        segment.append_record(&create_test_record(1, 1)).unwrap();
        let valid_len = segment.size();
        segment.sync_data().unwrap();

        // half-written frame
        let partial = encode_frame(FrameKind::Entry, &create_test_record(2, 1).serialize().unwrap());
        let mut file = OpenOptions::new().append(true).open(&segment.path).unwrap();
        file.write_all(&partial[..partial.len() / 2]).unwrap();
        file.sync_all().unwrap();

        let mut reopened = LogSegment::open(segment.path.clone(), 1).unwrap();
        let (frames, outcome) = replay_all(&reopened);
        assert_eq!(frames.len(), 1);
        assert!(outcome.torn);
        assert_eq!(outcome.valid_len, valid_len);

        reopened.truncate_to(outcome.valid_len).unwrap();
        assert_eq!(reopened.size(), valid_len);
        let (frames, outcome) = replay_all(&reopened);
        assert_eq!(frames.len(), 1);
        assert!(!outcome.torn);
    }

    #[test]
    fn test_segment_replay_stops_at_crc_mismatch() {
        let dir = TempDir::new().unwrap();
        let mut segment = LogSegment::create(dir.path(), "test", 1).unwrap();
        segment.append_record(&create_test_record(1, 1)).unwrap();
        let (offset, _) = segment.append_record(&create_test_record(2, 1)).unwrap();
        segment.sync_data().unwrap();

        // flip a byte in the second body
        let file = OpenOptions::new().write(true).open(&segment.path).unwrap();
        file.write_all_at(&[0xAB], offset + 2).unwrap();
        file.sync_all().unwrap();

        let (frames, outcome) = replay_all(&segment);
        assert_eq!(frames.len(), 1);
        assert!(outcome.torn);
        assert_eq!(outcome.valid_len, offset - FRAME_HEADER_SIZE);
    }

    #[test]
    fn test_segment_replay_empty_file() {
        let dir = TempDir::new().unwrap();
        let segment = LogSegment::create(dir.path(), "test", 1).unwrap();
        let (frames, outcome) = replay_all(&segment);
        assert!(frames.is_empty());
        assert_eq!(outcome.valid_len, 0);
        assert!(!outcome.torn);
    }

    #[test]
    fn test_segment_delete() {
        let dir = TempDir::new().unwrap();
        let segment = LogSegment::create(dir.path(), "test", 3).unwrap();
        let path = segment.path.clone();
        assert!(path.exists());
        segment.delete().unwrap();
        assert!(!path.exists());
    }
}
