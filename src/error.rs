use std::sync::Arc;

use thiserror::Error;

pub type LogResult<T> = Result<T, LogError>;

/// Errors surfaced by the log, its readers and the flushers.
#[derive(Debug, Clone, Error)]
pub enum LogError {
    #[error("IO error: {0}")]
    Io(Arc<anyhow::Error>),

    #[error("Corrupted data at index {index}")]
    Corrupted { index: u64 },

    #[error("Expected to append entry at index {expected}, but got index {actual}")]
    InvalidIndex { expected: u64, actual: u64 },

    #[error("Checksum of the record at index {index} does not match its data")]
    InvalidChecksum { index: u64 },

    #[error("Cannot truncate after index {index}: entries up to commit index {commit_index} are committed")]
    CommittedTruncation { index: u64, commit_index: u64 },

    #[error("Commit index cannot go backwards (current {current}, requested {requested})")]
    CommitRegression { current: u64, requested: u64 },

    #[error("Entry {index} has asqn {asqn}, lower than the previous asqn {previous}")]
    AsqnRegression { index: u64, asqn: i64, previous: i64 },

    #[error("Invalid application positions: highest {highest} is lower than lowest {lowest}")]
    InvalidPositions { lowest: i64, highest: i64 },

    #[error("No entry to read at index {index}")]
    NoNextEntry { index: u64 },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Resource already closed")]
    Closed,
}

impl LogError {
    pub(crate) fn io<E: Into<anyhow::Error>>(err: E) -> Self {
        LogError::Io(Arc::new(err.into()))
    }

    /// Errors that indicate a broken consensus invariant rather than a storage failure.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            LogError::InvalidIndex { .. }
                | LogError::InvalidChecksum { .. }
                | LogError::CommittedTruncation { .. }
                | LogError::CommitRegression { .. }
                | LogError::AsqnRegression { .. }
                | LogError::InvalidPositions { .. }
        )
    }
}

impl From<std::io::Error> for LogError {
    fn from(err: std::io::Error) -> Self {
        LogError::io(err)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// The partition must stop using this log.
    Fatal,
    /// The caller may retry or take a different path.
    Recoverable,
    /// Only worth a log line.
    Ignorable,
}

pub trait ErrorHandler {
    fn severity(&self) -> ErrorSeverity;
    fn context(&self) -> String;
}

impl ErrorHandler for LogError {
    fn severity(&self) -> ErrorSeverity {
        match self {
            LogError::Io(_) => ErrorSeverity::Fatal,
            LogError::Corrupted { .. } => ErrorSeverity::Fatal,
            LogError::InvalidIndex { .. } => ErrorSeverity::Fatal,
            LogError::CommittedTruncation { .. } => ErrorSeverity::Fatal,
            LogError::CommitRegression { .. } => ErrorSeverity::Fatal,
            LogError::InvalidChecksum { .. } => ErrorSeverity::Recoverable,
            LogError::AsqnRegression { .. } => ErrorSeverity::Recoverable,
            LogError::InvalidPositions { .. } => ErrorSeverity::Recoverable,
            LogError::InvalidConfig(_) => ErrorSeverity::Recoverable,
            LogError::NoNextEntry { .. } => ErrorSeverity::Ignorable,
            LogError::Closed => ErrorSeverity::Ignorable,
        }
    }

    fn context(&self) -> String {
        match self {
            LogError::Io(e) => format!("IO error: {}", e),
            LogError::Corrupted { index } => format!("Data corruption at index {}", index),
            LogError::InvalidIndex { expected, actual } => {
                format!("Out of order append: expected {}, got {}", expected, actual)
            }
            LogError::InvalidChecksum { index } => format!("Checksum mismatch at index {}", index),
            LogError::CommittedTruncation {
                index,
                commit_index,
            } => format!(
                "Truncation after {} would discard committed entries up to {}",
                index, commit_index
            ),
            LogError::CommitRegression { current, requested } => {
                format!("Commit index regression from {} to {}", current, requested)
            }
            LogError::AsqnRegression {
                index,
                asqn,
                previous,
            } => format!(
                "Asqn regression at index {}: {} after {}",
                index, asqn, previous
            ),
            LogError::InvalidPositions { lowest, highest } => {
                format!("Invalid positions [{}, {}]", lowest, highest)
            }
            LogError::NoNextEntry { index } => format!("No entry at index {}", index),
            LogError::InvalidConfig(msg) => format!("Invalid configuration: {}", msg),
            LogError::Closed => "Resource already closed".to_string(),
        }
    }
}
