//! Small value types shared across the crate.

use std::fmt;

/// Row identifier in the row heap.
pub type RowId = i64;

/// Result of a lock probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockState {
    /// No active lock matches the process filter.
    Unlocked,
    /// An active lock matches the process filter.
    LockedByTarget,
    /// The file is non-empty and does not carry the database signature.
    NotADatabase,
    /// The path could not be inspected, or ownership could not be decided.
    Error,
}

impl LockState {
    /// Returns the numeric code used by the file-control interface.
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::Unlocked => 0,
            Self::LockedByTarget => 1,
            Self::NotADatabase => 2,
            Self::Error => -1,
        }
    }

    /// Returns a short lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unlocked => "unlocked",
            Self::LockedByTarget => "locked",
            Self::NotADatabase => "not-a-database",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for LockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which process a probe is asking about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ProcessFilter {
    /// Any process, including the caller.
    #[default]
    AnyProcess,
    /// One specific process.
    Pid(u32),
}

impl ProcessFilter {
    /// Builds a filter from the raw file-control argument, where any
    /// negative value means "any process".
    #[must_use]
    pub fn from_raw(raw: i64) -> Self {
        match u32::try_from(raw) {
            Ok(pid) => Self::Pid(pid),
            Err(_) => Self::AnyProcess,
        }
    }

    /// Returns true if a lock owned by `pid` satisfies the filter.
    #[must_use]
    pub fn matches(self, pid: u32) -> bool {
        match self {
            Self::AnyProcess => true,
            Self::Pid(want) => want == pid,
        }
    }
}

/// How the database records uncommitted changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum JournalMode {
    /// Rollback journal (`<db>-journal`).
    #[default]
    Rollback,
    /// Write-ahead log (`<db>-wal`).
    Wal,
}

impl JournalMode {
    /// File format read/write version byte for this mode.
    #[must_use]
    pub const fn format_version(self) -> u8 {
        match self {
            Self::Rollback => 1,
            Self::Wal => 2,
        }
    }

    /// Interprets a header read/write version byte.
    #[must_use]
    pub const fn from_format_version(version: u8) -> Self {
        if version == 2 {
            Self::Wal
        } else {
            Self::Rollback
        }
    }
}

impl fmt::Display for JournalMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Rollback => "rollback",
            Self::Wal => "wal",
        })
    }
}

/// Auto-vacuum policy recorded in the database header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AutoVacuum {
    /// Freed pages stay in the file.
    #[default]
    Off,
    /// The file shrinks on every commit.
    Full,
    /// The file shrinks on request.
    Incremental,
}

impl fmt::Display for AutoVacuum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Off => "off",
            Self::Full => "full",
            Self::Incremental => "incremental",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_raw_pid_means_any_process() {
        assert_eq!(ProcessFilter::from_raw(-1), ProcessFilter::AnyProcess);
        assert_eq!(ProcessFilter::from_raw(42), ProcessFilter::Pid(42));
        assert!(ProcessFilter::AnyProcess.matches(7));
        assert!(!ProcessFilter::Pid(8).matches(7));
    }

    #[test]
    fn lock_state_codes() {
        assert_eq!(LockState::Unlocked.code(), 0);
        assert_eq!(LockState::LockedByTarget.code(), 1);
        assert_eq!(LockState::NotADatabase.code(), 2);
        assert_eq!(LockState::Error.code(), -1);
    }

    #[test]
    fn journal_mode_version_bytes() {
        assert_eq!(JournalMode::Wal.format_version(), 2);
        assert_eq!(JournalMode::from_format_version(1), JournalMode::Rollback);
        assert_eq!(JournalMode::from_format_version(2), JournalMode::Wal);
    }
}
