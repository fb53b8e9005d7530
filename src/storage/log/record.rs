//! Frame layout of segment files.
//!
//! Every operation is appended to the active segment as a frame:
//!
//! | magic u32 | kind u32 | body_len u32 | crc32(body) u32 | body ... |
//!
//! All integers are little-endian. Truncation and reset are frames too, so a
//! segment is only ever appended to (or cut back to its last valid frame on recovery).

use anyhow::{Result, anyhow};
use bincode::{Decode, Encode};
use tracing::warn;

pub const FRAME_MAGIC: u32 = 0x524C_4F47;
pub const FRAME_HEADER_SIZE: u64 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Entry,
    TruncateSuffix,
    Reset,
}

impl FrameKind {
    fn code(self) -> u32 {
        match self {
            FrameKind::Entry => 1,
            FrameKind::TruncateSuffix => 2,
            FrameKind::Reset => 3,
        }
    }

    fn from_code(code: u32) -> Result<Self> {
        match code {
            1 => Ok(FrameKind::Entry),
            2 => Ok(FrameKind::TruncateSuffix),
            3 => Ok(FrameKind::Reset),
            _ => Err(anyhow!("Invalid frame kind {}", code)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub kind: FrameKind,
    pub body_len: u32,
    pub crc: u32,
}

impl FrameHeader {
    pub fn for_body(kind: FrameKind, body: &[u8]) -> Self {
        Self {
            kind,
            body_len: body.len() as u32,
            crc: crc32fast::hash(body),
        }
    }

    pub fn frame_len(&self) -> u64 {
        FRAME_HEADER_SIZE + self.body_len as u64
    }

    pub fn serialize(&self) -> [u8; FRAME_HEADER_SIZE as usize] {
        let mut buf = [0u8; FRAME_HEADER_SIZE as usize];
        buf[0..4].copy_from_slice(&FRAME_MAGIC.to_le_bytes());
        buf[4..8].copy_from_slice(&self.kind.code().to_le_bytes());
        buf[8..12].copy_from_slice(&self.body_len.to_le_bytes());
        buf[12..16].copy_from_slice(&self.crc.to_le_bytes());
        buf
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        if data.len() < FRAME_HEADER_SIZE as usize {
            return Err(anyhow!("Invalid header length {}", data.len()));
        }

        let read_u32 = |at: usize| {
            let mut bytes = [0u8; 4];
            bytes.copy_from_slice(&data[at..at + 4]);
            u32::from_le_bytes(bytes)
        };

        let magic = read_u32(0);
        if magic != FRAME_MAGIC {
            return Err(anyhow!("Invalid magic number {:#x}", magic));
        }

        Ok(Self {
            kind: FrameKind::from_code(read_u32(4))?,
            body_len: read_u32(8),
            crc: read_u32(12),
        })
    }

    pub fn matches(&self, body: &[u8]) -> bool {
        body.len() == self.body_len as usize && crc32fast::hash(body) == self.crc
    }
}

/// Header followed by body, ready to be written in one call.
pub fn encode_frame(kind: FrameKind, body: &[u8]) -> Vec<u8> {
    let header = FrameHeader::for_body(kind, body);
    let mut buf = Vec::with_capacity(header.frame_len() as usize);
    buf.extend_from_slice(&header.serialize());
    buf.extend_from_slice(body);
    buf
}

/// Everything after `index` was discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub struct TruncateRecord {
    pub index: u64,
}

/// The log was wiped; the next entry has index `next_index`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub struct ResetRecord {
    pub next_index: u64,
}

macro_rules! impl_record_codec {
    ($ty:ty, $name:literal) => {
        impl $ty {
            pub fn serialize(&self) -> Result<Vec<u8>> {
                let config = bincode::config::standard();
                Ok(bincode::encode_to_vec(self, config)?)
            }

            pub fn deserialize(data: &[u8]) -> Result<Self> {
                let config = bincode::config::standard();
                let (record, _) = bincode::decode_from_slice(data, config).map_err(|e| {
                    warn!("Failed to deserialize {}: {}", $name, e);
                    e
                })?;
                Ok(record)
            }
        }
    };
}

impl_record_codec!(TruncateRecord, "truncate record");
impl_record_codec!(ResetRecord, "reset record");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_header_layout() {
        let body = b"payload";
        let frame = encode_frame(FrameKind::TruncateSuffix, body);
        assert_eq!(frame.len() as u64, FRAME_HEADER_SIZE + body.len() as u64);

        let header = FrameHeader::deserialize(&frame).unwrap();
        assert_eq!(header.kind, FrameKind::TruncateSuffix);
        assert_eq!(header.body_len, 7);
        assert!(header.matches(&frame[FRAME_HEADER_SIZE as usize..]));
        assert!(!header.matches(b"payloaD"));
    }

    #[test]
    fn test_frame_header_invalid_length() {
        assert!(FrameHeader::deserialize(&[0u8; 10]).is_err());
    }

    #[test]
    fn test_frame_header_invalid_magic() {
        let mut frame = encode_frame(FrameKind::Entry, b"x");
        frame[0] ^= 0xFF;
        assert!(FrameHeader::deserialize(&frame).is_err());
    }

    #[test]
    fn test_frame_header_invalid_kind() {
        let mut frame = encode_frame(FrameKind::Entry, b"x");
        frame[4..8].copy_from_slice(&9u32.to_le_bytes());
        assert!(FrameHeader::deserialize(&frame).is_err());
    }

    #[test]
    fn test_truncate_and_reset_records() {
        let truncate = TruncateRecord { index: 100 };
        let decoded = TruncateRecord::deserialize(&truncate.serialize().unwrap()).unwrap();
        assert_eq!(decoded, truncate);

        let reset = ResetRecord { next_index: 42 };
        let decoded = ResetRecord::deserialize(&reset.serialize().unwrap()).unwrap();
        assert_eq!(decoded, reset);
    }
}
