use std::{
    fs::{self, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{LogError, LogResult};

/// Durable record of how far the log is known to be on disk.
pub trait FlushMetaStore: Send + Sync {
    fn store_last_flushed_index(&self, index: u64) -> LogResult<()>;

    /// 0 when nothing was stored yet.
    fn load_last_flushed_index(&self) -> LogResult<u64>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
struct FlushMeta {
    last_flushed_index: u64,
}

/// Keeps the last flushed index in a small JSON file next to the segments.
///
/// Every store writes a temporary file, syncs it and renames it over the previous one.
pub struct FileMetaStore {
    path: PathBuf,
    // serializes writers of the temporary file
    write_lock: Mutex<()>,
}

impl FileMetaStore {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl FlushMetaStore for FileMetaStore {
    fn store_last_flushed_index(&self, index: u64) -> LogResult<()> {
        let _guard = self.write_lock.lock();

        let json = serde_json::to_vec(&FlushMeta {
            last_flushed_index: index,
        })
        .map_err(LogError::io)?;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                warn!("Failed to create meta directory {:?}: {}", parent, e);
                LogError::io(e)
            })?;
        }

        let tmp_path = self.path.with_extension("meta.tmp");
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)
            .map_err(|e| {
                warn!("Failed to create temp meta file {:?}: {}", tmp_path, e);
                LogError::io(e)
            })?;
        file.write_all(&json).map_err(|e| {
            warn!("Failed to write meta file {:?}: {}", tmp_path, e);
            LogError::io(e)
        })?;
        file.sync_all().map_err(LogError::io)?;

        fs::rename(&tmp_path, &self.path).map_err(|e| {
            warn!("Failed to rename meta file {:?}: {}", tmp_path, e);
            LogError::io(e)
        })?;

        debug!("Stored last flushed index {} in {:?}", index, self.path);
        Ok(())
    }

    fn load_last_flushed_index(&self) -> LogResult<u64> {
        if !self.path.exists() {
            return Ok(0);
        }
        let content = fs::read(&self.path).map_err(|e| {
            warn!("Failed to read meta file {:?}: {}", self.path, e);
            LogError::io(e)
        })?;
        let meta: FlushMeta = serde_json::from_slice(&content).map_err(|e| {
            warn!("Failed to parse meta file {:?}: {}", self.path, e);
            LogError::io(e)
        })?;
        Ok(meta.last_flushed_index)
    }
}

/// Volatile meta store, for tests and logs that do not need a checkpoint.
#[derive(Debug, Default)]
pub struct MemoryMetaStore {
    last_flushed_index: AtomicU64,
}

impl MemoryMetaStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl FlushMetaStore for MemoryMetaStore {
    fn store_last_flushed_index(&self, index: u64) -> LogResult<()> {
        self.last_flushed_index.store(index, Ordering::Release);
        Ok(())
    }

    fn load_last_flushed_index(&self) -> LogResult<u64> {
        Ok(self.last_flushed_index.load(Ordering::Acquire))
    }
}
