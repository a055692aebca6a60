//! The physical files behind one logical database.
//!
//! ```text
//! <db>            main file
//! <db>-journal    rollback journal (rollback mode, during a write)
//! <db>-wal        write-ahead log (WAL mode)
//! <db>-shm        shared-memory WAL index (WAL mode)
//! ```
//!
//! Journal and WAL normally exclude each other, but a crash during a mode
//! switch can leave both, and nothing here assumes otherwise.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// Suffix of the rollback journal.
pub const JOURNAL_SUFFIX: &str = "-journal";

/// Suffix of the write-ahead log.
pub const WAL_SUFFIX: &str = "-wal";

/// Suffix of the shared-memory index.
pub const SHM_SUFFIX: &str = "-shm";

fn with_suffix(main: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(main.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

/// Path of the rollback journal for `main`.
#[must_use]
pub fn journal_path(main: &Path) -> PathBuf {
    with_suffix(main, JOURNAL_SUFFIX)
}

/// Path of the write-ahead log for `main`.
#[must_use]
pub fn wal_path(main: &Path) -> PathBuf {
    with_suffix(main, WAL_SUFFIX)
}

/// Path of the shared-memory index for `main`.
#[must_use]
pub fn shm_path(main: &Path) -> PathBuf {
    with_suffix(main, SHM_SUFFIX)
}

/// Main file plus whichever auxiliary files currently exist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseFileSet {
    main: PathBuf,
    journal: Option<PathBuf>,
    wal: Option<PathBuf>,
    shm: Option<PathBuf>,
}

impl DatabaseFileSet {
    /// Looks on disk for the auxiliary files of `main`.
    #[must_use]
    pub fn discover(main: &Path) -> Self {
        let present = |path: PathBuf| path.is_file().then_some(path);
        Self {
            main: main.to_path_buf(),
            journal: present(journal_path(main)),
            wal: present(wal_path(main)),
            shm: present(shm_path(main)),
        }
    }

    /// Main database file.
    #[must_use]
    pub fn main(&self) -> &Path {
        &self.main
    }

    /// Rollback journal, if present.
    #[must_use]
    pub fn journal(&self) -> Option<&Path> {
        self.journal.as_deref()
    }

    /// Write-ahead log, if present.
    #[must_use]
    pub fn wal(&self) -> Option<&Path> {
        self.wal.as_deref()
    }

    /// Shared-memory index, if present.
    #[must_use]
    pub fn shm(&self) -> Option<&Path> {
        self.shm.as_deref()
    }

    /// Returns true if both a journal and a WAL exist.
    #[must_use]
    pub fn is_mid_mode_switch(&self) -> bool {
        self.journal.is_some() && self.wal.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn suffixes_append_to_full_name() {
        let main = Path::new("/data/app.db");
        assert_eq!(journal_path(main), Path::new("/data/app.db-journal"));
        assert_eq!(wal_path(main), Path::new("/data/app.db-wal"));
        assert_eq!(shm_path(main), Path::new("/data/app.db-shm"));
    }

    #[test]
    fn discover_reports_only_existing_files() {
        let dir = tempdir().unwrap();
        let main = dir.path().join("x.db");
        std::fs::write(&main, b"").unwrap();
        std::fs::write(wal_path(&main), b"").unwrap();

        let set = DatabaseFileSet::discover(&main);
        assert_eq!(set.main(), main.as_path());
        assert!(set.journal().is_none());
        assert_eq!(set.wal(), Some(wal_path(&main).as_path()));
        assert!(set.shm().is_none());
        assert!(!set.is_mid_mode_switch());

        std::fs::write(journal_path(&main), b"j").unwrap();
        assert!(DatabaseFileSet::discover(&main).is_mid_mode_switch());
    }
}
