//! Log entry envelopes and their indexed/persisted views.

use anyhow::Result;
use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{LogError, LogResult};

/// Asqn of entries that carry no application positions.
pub const ASQN_IGNORE: i64 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Encode, Decode)]
pub enum MemberType {
    Active,
    Passive,
    Promotable,
    Inactive,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct RaftMember {
    pub id: String,
    pub member_type: MemberType,
    /// Millis since epoch of the last change to this member.
    pub updated: u64,
}

/// Cluster membership as of the index the entry is stored at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct ConfigurationEntry {
    pub timestamp: u64,
    pub members: Vec<RaftMember>,
}

/// Opaque application command covering the positions `[lowest_position, highest_position]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct ApplicationEntry {
    lowest_position: i64,
    highest_position: i64,
    data: Vec<u8>,
}

impl ApplicationEntry {
    pub fn new(lowest_position: i64, highest_position: i64, data: Vec<u8>) -> LogResult<Self> {
        if highest_position < lowest_position {
            return Err(LogError::InvalidPositions {
                lowest: lowest_position,
                highest: highest_position,
            });
        }
        Ok(Self {
            lowest_position,
            highest_position,
            data,
        })
    }

    pub fn lowest_position(&self) -> i64 {
        self.lowest_position
    }

    pub fn highest_position(&self) -> i64 {
        self.highest_position
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub enum LogEntry {
    /// Written by a new leader at the start of its term.
    Initial,
    Configuration(ConfigurationEntry),
    Application(ApplicationEntry),
}

impl LogEntry {
    /// Application entries are identified by their highest position; everything else
    /// is ignored by asqn lookups.
    pub fn asqn(&self) -> i64 {
        match self {
            LogEntry::Application(app) => app.highest_position,
            LogEntry::Initial | LogEntry::Configuration(_) => ASQN_IGNORE,
        }
    }

    pub fn is_application(&self) -> bool {
        matches!(self, LogEntry::Application(_))
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self, LogEntry::Configuration(_))
    }

    pub fn as_application(&self) -> Option<&ApplicationEntry> {
        match self {
            LogEntry::Application(app) => Some(app),
            _ => None,
        }
    }

    pub fn as_configuration(&self) -> Option<&ConfigurationEntry> {
        match self {
            LogEntry::Configuration(config) => Some(config),
            _ => None,
        }
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        let config = bincode::config::standard();
        Ok(bincode::encode_to_vec(self, config)?)
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        let config = bincode::config::standard();
        let (entry, _) = bincode::decode_from_slice(data, config).map_err(|e| {
            warn!("Failed to deserialize log entry: {}", e);
            e
        })?;
        Ok(entry)
    }
}

/// The stored form of an entry, shipped as-is to followers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct PersistedRecord {
    pub index: u64,
    pub term: u64,
    pub asqn: i64,
    /// crc32 of `data`.
    pub checksum: u32,
    /// Serialized [`LogEntry`].
    pub data: Vec<u8>,
}

impl PersistedRecord {
    pub(crate) fn from_entry(index: u64, term: u64, entry: &LogEntry) -> Result<Self> {
        let data = entry.serialize()?;
        Ok(Self {
            index,
            term,
            asqn: entry.asqn(),
            checksum: crc32fast::hash(&data),
            data,
        })
    }

    pub fn is_valid_checksum(&self) -> bool {
        crc32fast::hash(&self.data) == self.checksum
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        let config = bincode::config::standard();
        Ok(bincode::encode_to_vec(self, config)?)
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        let config = bincode::config::standard();
        let (record, _) = bincode::decode_from_slice(data, config).map_err(|e| {
            warn!("Failed to deserialize persisted record: {}", e);
            e
        })?;
        Ok(record)
    }
}

/// An entry as stored in the log. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexedLogEntry {
    entry: LogEntry,
    record: PersistedRecord,
}

impl IndexedLogEntry {
    /// Decodes the envelope of a record, rejecting records whose bytes do not match
    /// their checksum or whose application positions are inverted.
    pub(crate) fn from_record(record: PersistedRecord) -> LogResult<Self> {
        if !record.is_valid_checksum() {
            return Err(LogError::InvalidChecksum {
                index: record.index,
            });
        }
        let entry = LogEntry::deserialize(&record.data).map_err(|e| {
            warn!("Failed to decode entry at index {}: {}", record.index, e);
            LogError::Corrupted {
                index: record.index,
            }
        })?;
        if let LogEntry::Application(app) = &entry {
            if app.highest_position < app.lowest_position {
                warn!(
                    "Entry at index {} has positions [{}, {}]",
                    record.index, app.lowest_position, app.highest_position
                );
                return Err(LogError::InvalidPositions {
                    lowest: app.lowest_position,
                    highest: app.highest_position,
                });
            }
        }
        Ok(Self { entry, record })
    }

    pub fn index(&self) -> u64 {
        self.record.index
    }

    pub fn term(&self) -> u64 {
        self.record.term
    }

    pub fn asqn(&self) -> i64 {
        self.record.asqn
    }

    pub fn entry(&self) -> &LogEntry {
        &self.entry
    }

    pub fn is_application(&self) -> bool {
        self.entry.is_application()
    }

    pub fn application_entry(&self) -> Option<&ApplicationEntry> {
        self.entry.as_application()
    }

    pub fn persisted_record(&self) -> &PersistedRecord {
        &self.record
    }

    pub fn into_persisted_record(self) -> PersistedRecord {
        self.record
    }
}
