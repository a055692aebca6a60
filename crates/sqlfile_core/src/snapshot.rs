//! Version stamps and snapshot handles.
//!
//! A [`FileVersion`] is what a reader knows about the files at one moment.
//! Two stamps taken around a read that compare equal prove nobody changed
//! the database in between. A [`Snapshot`] keeps a stamp so it can later
//! tell whether the history it points into still exists.

use crate::inode::FileKey;
use crate::types::JournalMode;

/// Position in the write-ahead log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WalMark {
    /// Salts of the log header; they change whenever the log restarts.
    pub salt: [u32; 2],
    /// Committed frames.
    pub frames: u32,
}

/// State of a database's files at one moment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileVersion {
    /// Changes made through this process.
    pub generation: u64,
    /// Truncates and replaces made through this process.
    pub reset_epoch: u64,
    /// Change counter of the main file header, 0 when absent.
    pub change_counter: u32,
    /// Length of the main file.
    pub main_len: u64,
    /// Log position, when a valid log exists.
    pub wal: Option<WalMark>,
}

/// A historical read position in a database.
///
/// Truncating or replacing the database, from any connection in any
/// process, makes the snapshot unusable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    key: FileKey,
    journal_mode: JournalMode,
    version: FileVersion,
}

impl Snapshot {
    pub(crate) fn new(key: FileKey, journal_mode: JournalMode, version: FileVersion) -> Self {
        Self {
            key,
            journal_mode,
            version,
        }
    }

    /// File the snapshot was taken on.
    #[must_use]
    pub fn key(&self) -> &FileKey {
        &self.key
    }

    /// Stamp taken with the snapshot.
    #[must_use]
    pub fn version(&self) -> FileVersion {
        self.version
    }

    /// Returns true if `current` no longer contains the snapshot's history.
    ///
    /// A rollback journal keeps no history, so any committed change makes a
    /// rollback-mode snapshot stale. In WAL mode, appended frames are fine
    /// but a restarted or removed log is not.
    #[must_use]
    pub fn is_stale(&self, current: &FileVersion) -> bool {
        let then = &self.version;
        if current.reset_epoch != then.reset_epoch {
            return true;
        }
        match self.journal_mode {
            JournalMode::Rollback => {
                current.change_counter != then.change_counter || current.main_len != then.main_len
            }
            JournalMode::Wal => match (then.wal, current.wal) {
                (Some(a), Some(b)) => a.salt != b.salt || b.frames < a.frames,
                (Some(_), None) => true,
                (None, _) => {
                    current.change_counter != then.change_counter
                        || (then.main_len > 0 && current.main_len == 0)
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn version(change_counter: u32, wal: Option<WalMark>) -> FileVersion {
        FileVersion {
            generation: 3,
            reset_epoch: 0,
            change_counter,
            main_len: 4096,
            wal,
        }
    }

    fn snapshot(mode: JournalMode, v: FileVersion) -> Snapshot {
        Snapshot::new(FileKey::Inode { dev: 1, ino: 2 }, mode, v)
    }

    #[test]
    fn rollback_snapshot_dies_on_commit() {
        let snap = snapshot(JournalMode::Rollback, version(5, None));
        assert!(!snap.is_stale(&version(5, None)));
        assert!(snap.is_stale(&version(6, None)));
    }

    #[test]
    fn wal_snapshot_survives_appends_only() {
        let mark = WalMark {
            salt: [1, 2],
            frames: 4,
        };
        let snap = snapshot(JournalMode::Wal, version(5, Some(mark)));
        assert!(!snap.is_stale(&version(5, Some(WalMark { frames: 9, ..mark }))));
        assert!(snap.is_stale(&version(5, Some(WalMark { salt: [1, 3], ..mark }))));
        assert!(snap.is_stale(&version(5, Some(WalMark { frames: 1, ..mark }))));
        assert!(snap.is_stale(&version(5, None)));
    }

    #[test]
    fn reset_in_this_process_always_stales() {
        let snap = snapshot(JournalMode::Wal, version(5, None));
        let mut current = version(5, None);
        current.reset_epoch = 1;
        assert!(snap.is_stale(&current));
    }
}
