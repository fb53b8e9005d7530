use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    error::{LogError, LogResult},
    flush::DEFAULT_FLUSH_DELAY,
    storage::log::{DEFAULT_MAX_SEGMENT_SIZE, LogStoreOptions},
};

/// Configuration of a [`crate::RaftLog`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftLogOptions {
    /// Directory holding the segments and the flush meta file
    pub dir: PathBuf,

    /// Name of the log, prefix of every file name (default: raft-partition)
    pub name: String,

    /// Maximum segment size in bytes before rotation (default: 64MB)
    pub max_segment_size: u64,

    /// Sync on every mutation instead of on a timer
    pub flush_explicitly: bool,

    /// Interval of the delayed flusher (default: 5s)
    pub flush_delay: Duration,

    /// Cache size for recent log entries
    pub cache_entries_size: usize,
}

impl Default for RaftLogOptions {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./data/raft"),
            name: "raft-partition".to_string(),
            max_segment_size: DEFAULT_MAX_SEGMENT_SIZE,
            flush_explicitly: true,
            flush_delay: DEFAULT_FLUSH_DELAY,
            cache_entries_size: 1000,
        }
    }
}

impl RaftLogOptions {
    pub fn with_dir<P: Into<PathBuf>>(dir: P) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    /// Path of the default flush meta file.
    pub fn meta_path(&self) -> PathBuf {
        self.dir.join(format!("{}.meta", self.name))
    }

    pub fn validate(&self) -> LogResult<()> {
        if self.name.is_empty() {
            return Err(LogError::InvalidConfig("log name is empty".to_string()));
        }
        if self.name.contains(std::path::is_separator) {
            return Err(LogError::InvalidConfig(format!(
                "log name {:?} contains a path separator",
                self.name
            )));
        }
        if self.max_segment_size == 0 {
            return Err(LogError::InvalidConfig(
                "max_segment_size must be positive".to_string(),
            ));
        }
        if !self.flush_explicitly && self.flush_delay.is_zero() {
            return Err(LogError::InvalidConfig(
                "flush_delay must be positive for delayed flushing".to_string(),
            ));
        }
        Ok(())
    }

    pub(crate) fn store_options(&self) -> LogStoreOptions {
        LogStoreOptions {
            dir: self.dir.clone(),
            name: self.name.clone(),
            max_segment_size: self.max_segment_size,
            cache_entries_size: self.cache_entries_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let options = RaftLogOptions::default();
        assert_eq!(options.name, "raft-partition");
        assert_eq!(options.max_segment_size, 64 * 1024 * 1024);
        assert!(options.flush_explicitly);
        assert_eq!(options.flush_delay, Duration::from_secs(5));
        assert_eq!(options.meta_path(), PathBuf::from("./data/raft/raft-partition.meta"));
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_invalid_options() {
        let options = RaftLogOptions {
            name: String::new(),
            ..Default::default()
        };
        assert!(matches!(options.validate(), Err(LogError::InvalidConfig(_))));

        let options = RaftLogOptions {
            name: "a/b".to_string(),
            ..Default::default()
        };
        assert!(options.validate().is_err());

        let options = RaftLogOptions {
            flush_explicitly: false,
            flush_delay: Duration::ZERO,
            ..Default::default()
        };
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_options_from_partial_json() {
        let options: RaftLogOptions =
            serde_json::from_str(r#"{"name": "partition-3", "flush_explicitly": false}"#).unwrap();
        assert_eq!(options.name, "partition-3");
        assert!(!options.flush_explicitly);
        assert_eq!(options.cache_entries_size, 1000);
    }
}
