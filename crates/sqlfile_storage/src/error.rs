//! Error types for storage operations.

use std::io;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Attempted to read beyond the end of storage.
    #[error("read beyond end of storage: offset {offset}, len {len}, size {size}")]
    ReadPastEnd {
        /// The requested read offset.
        offset: u64,
        /// The requested read length.
        len: usize,
        /// The current storage size.
        size: u64,
    },

    /// The platform cannot perform the requested operation.
    #[error("unsupported on this platform: {0}")]
    Unsupported(&'static str),

    /// A kernel lock table line could not be parsed.
    #[error("malformed lock table entry: {0}")]
    MalformedLockTable(String),
}

impl StorageError {
    /// Returns the underlying I/O error kind, if this is an I/O error.
    #[must_use]
    pub fn io_kind(&self) -> Option<io::ErrorKind> {
        match self {
            Self::Io(e) => Some(e.kind()),
            _ => None,
        }
    }
}

impl From<StorageError> for io::Error {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Io(e) => e,
            StorageError::ReadPastEnd { .. } => {
                io::Error::new(io::ErrorKind::UnexpectedEof, err.to_string())
            }
            StorageError::Unsupported(_) => io::Error::new(io::ErrorKind::Unsupported, err.to_string()),
            StorageError::MalformedLockTable(_) => {
                io::Error::new(io::ErrorKind::InvalidData, err.to_string())
            }
        }
    }
}
