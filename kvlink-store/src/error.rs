//! Storage error types.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while opening or operating a store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("store is closed")]
    Closed,

    #[error("record corrupted at offset {offset}: CRC mismatch (expected {expected:#x}, got {actual:#x})")]
    CorruptedRecord {
        offset: u64,
        expected: u32,
        actual: u32,
    },

    #[error("invalid record at offset {offset}: {reason}")]
    InvalidRecord { offset: u64, reason: String },

    #[error("record too large: {size} bytes (max {max})")]
    RecordTooLarge { size: usize, max: usize },

    #[error("store does not exist: {}", .0.display())]
    NotFound(PathBuf),

    #[error("store already exists: {}", .0.display())]
    AlreadyExists(PathBuf),
}

impl StoreError {
    /// Returns whether the operation may succeed if retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Io(_))
    }

    /// Returns whether the log is damaged beyond automatic repair.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            StoreError::CorruptedRecord { .. } | StoreError::InvalidRecord { .. }
        )
    }
}
