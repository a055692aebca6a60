//! Error types for sqlfile core.

use std::fmt;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in sqlfile core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] sqlfile_storage::StorageError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The file does not carry the database header signature.
    #[error("file is not a database: {}", path.display())]
    NotADatabase {
        /// Path of the offending file.
        path: PathBuf,
    },

    /// A database, journal or WAL structure is malformed.
    #[error("database corruption: {message}")]
    Corrupt {
        /// Description of the corruption.
        message: String,
    },

    /// A lock could not be obtained before the busy handler gave up.
    #[error("database is locked")]
    Busy,

    /// Write attempted through a read-only connection or descriptor.
    #[error("attempt to write a read-only database")]
    ReadOnly,

    /// A row payload does not fit in a single page.
    #[error("row {rowid} payload of {len} bytes exceeds the {max} byte limit for this page size")]
    RowTooLarge {
        /// Row identifier.
        rowid: i64,
        /// Payload length.
        len: usize,
        /// Largest payload a page can hold.
        max: usize,
    },

    /// Caller supplied an invalid argument.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Description of the problem.
        message: String,
    },

    /// The snapshot no longer describes the database.
    #[error("snapshot is stale: the database was reset or replaced")]
    SnapshotStale,
}

impl CoreError {
    /// Creates a corruption error.
    pub fn corrupt(message: impl Into<String>) -> Self {
        Self::Corrupt {
            message: message.into(),
        }
    }

    /// Creates an invalid argument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Creates a not-a-database error.
    pub fn not_a_database(path: impl Into<PathBuf>) -> Self {
        Self::NotADatabase { path: path.into() }
    }
}

/// A crash-ordered step of a truncate or replace.
///
/// Steps complete in declaration order (skipping those that do not apply),
/// and every prefix leaves the files in a state a reader can open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MutationStep {
    /// Committed WAL frames were copied into the main file.
    WalCheckpointed,
    /// The WAL was cut to zero length.
    WalTruncated,
    /// Pre-images of the destination were written to the rollback journal.
    JournalWritten,
    /// The main file was cut to zero length.
    MainTruncated,
    /// The main file was rewritten as an empty database.
    MainInitialized,
    /// Replacement pages were written to the main file.
    MainWritten,
    /// The rollback journal was deleted.
    JournalRemoved,
    /// The shared-memory index header was invalidated.
    ShmScrambled,
}

impl fmt::Display for MutationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::WalCheckpointed => "WAL checkpointed",
            Self::WalTruncated => "WAL truncated",
            Self::JournalWritten => "journal written",
            Self::MainTruncated => "main file truncated",
            Self::MainInitialized => "main file initialized",
            Self::MainWritten => "main file written",
            Self::JournalRemoved => "journal removed",
            Self::ShmScrambled => "shared memory scrambled",
        };
        f.write_str(name)
    }
}

fn describe_progress(step: &Option<MutationStep>) -> String {
    match step {
        None => "nothing changed".to_string(),
        Some(step) => format!("completed up to: {step}"),
    }
}

/// Failure of a truncate request.
#[derive(Debug, Error)]
pub enum TruncateError {
    /// Another connection holds the file and `force` was not set.
    /// Nothing was changed.
    #[error("exclusive lock unavailable")]
    LockUnavailable,

    /// Options were rejected before any I/O.
    #[error("invalid truncate options: {reason}")]
    InvalidOptions {
        /// Why the options were rejected.
        reason: String,
    },

    /// A step failed.
    #[error("I/O failure ({}): {source}", describe_progress(.last_completed))]
    IoFailure {
        /// Last step that completed, `None` if nothing changed.
        last_completed: Option<MutationStep>,
        /// Underlying error.
        #[source]
        source: CoreError,
    },
}

impl TruncateError {
    /// Creates an invalid options error.
    pub fn invalid_options(reason: impl Into<String>) -> Self {
        Self::InvalidOptions {
            reason: reason.into(),
        }
    }

    /// Returns true if retrying the same call may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::LockUnavailable)
    }

    /// Returns the last completed step, `None` when the files are untouched.
    #[must_use]
    pub fn last_completed(&self) -> Option<MutationStep> {
        match self {
            Self::IoFailure { last_completed, .. } => *last_completed,
            _ => None,
        }
    }
}

/// Failure of a replace request.
#[derive(Debug, Error)]
pub enum ReplaceError {
    /// Another connection holds the destination. Nothing was changed.
    #[error("exclusive lock unavailable on destination")]
    LockUnavailable,

    /// The request was rejected before any I/O.
    #[error("invalid replace request: {reason}")]
    InvalidOptions {
        /// Why the request was rejected.
        reason: String,
    },

    /// The source could not be read consistently. Nothing was changed.
    #[error("source database unreadable: {reason}")]
    SourceUnreadable {
        /// What went wrong reading the source.
        reason: String,
    },

    /// A step failed.
    #[error("I/O failure ({}): {source}", describe_progress(.last_completed))]
    IoFailure {
        /// Last step that completed, `None` if nothing changed.
        last_completed: Option<MutationStep>,
        /// Underlying error.
        #[source]
        source: CoreError,
    },
}

impl ReplaceError {
    /// Creates an invalid options error.
    pub fn invalid_options(reason: impl Into<String>) -> Self {
        Self::InvalidOptions {
            reason: reason.into(),
        }
    }

    /// Creates a source unreadable error.
    pub fn source_unreadable(reason: impl Into<String>) -> Self {
        Self::SourceUnreadable {
            reason: reason.into(),
        }
    }

    /// Returns true if retrying the same call may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::LockUnavailable)
    }

    /// Returns the last completed step, `None` when the destination is untouched.
    #[must_use]
    pub fn last_completed(&self) -> Option<MutationStep> {
        match self {
            Self::IoFailure { last_completed, .. } => *last_completed,
            _ => None,
        }
    }
}

/// Failure of a [`crate::Connection::file_control`] command.
#[derive(Debug, Error)]
pub enum FileControlError {
    /// Truncate failed.
    #[error(transparent)]
    Truncate(#[from] TruncateError),

    /// Replace failed.
    #[error(transparent)]
    Replace(#[from] ReplaceError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_lock_unavailable_is_retryable() {
        assert!(TruncateError::LockUnavailable.is_retryable());
        assert!(!TruncateError::invalid_options("page size").is_retryable());
        assert!(ReplaceError::LockUnavailable.is_retryable());
        assert!(!ReplaceError::source_unreadable("changed").is_retryable());
    }

    #[test]
    fn io_failure_reports_progress() {
        let err = TruncateError::IoFailure {
            last_completed: Some(MutationStep::WalTruncated),
            source: CoreError::Io(io::Error::new(io::ErrorKind::Other, "disk full")),
        };
        assert_eq!(err.last_completed(), Some(MutationStep::WalTruncated));
        let text = err.to_string();
        assert!(text.contains("WAL truncated"), "{text}");
        assert!(text.contains("disk full"), "{text}");

        let untouched = ReplaceError::IoFailure {
            last_completed: None,
            source: CoreError::Busy,
        };
        assert!(untouched.to_string().contains("nothing changed"));
    }

    #[test]
    fn steps_are_ordered() {
        assert!(MutationStep::WalTruncated < MutationStep::MainTruncated);
        assert!(MutationStep::MainWritten < MutationStep::JournalRemoved);
        assert!(MutationStep::JournalRemoved < MutationStep::ShmScrambled);
    }
}
