//! Lock-state probes.
//!
//! A probe answers "does process P (or anyone) hold an engine lock on this
//! database right now?" without taking any lock. It asks the kernel which
//! lock bytes conflict (`F_GETLK`), which reports other processes only, and
//! consults the file's [`InodeEntry`] for handles in this process.
//!
//! The kernel names at most one holder per query. When a specific process
//! is asked about and the first holder is someone else, the Linux lock
//! table settles it. If no source can name the holders, the answer is
//! [`LockState::Error`] for a specific process and
//! [`LockState::LockedByTarget`] for [`ProcessFilter::AnyProcess`].

use crate::error::CoreResult;
use crate::files;
use crate::format::header;
use crate::format::shm;
use crate::inode::{self, InodeEntry};
use crate::lock::{PENDING_BYTE, RESERVED_BYTE, SHARED_FIRST, SHARED_SIZE};
use crate::types::{LockState, ProcessFilter};
use sqlfile_storage::range_lock::{self, RangeHolder, RangeLockKind};
use sqlfile_storage::{FileBackend, StorageBackend};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// What to probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileLockDescriptor {
    path: PathBuf,
    filter: ProcessFilter,
    may_be_encrypted: bool,
}

impl FileLockDescriptor {
    /// Probes `path` for locks held by any process.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            filter: ProcessFilter::AnyProcess,
            may_be_encrypted: false,
        }
    }

    /// Restricts the probe to one process.
    #[must_use]
    pub fn pid(mut self, pid: u32) -> Self {
        self.filter = ProcessFilter::Pid(pid);
        self
    }

    /// Sets the process filter.
    #[must_use]
    pub fn filter(mut self, filter: ProcessFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Marks the file as possibly encrypted. Encrypted files cannot be
    /// probed; the result is always [`LockState::Error`].
    #[must_use]
    pub fn may_be_encrypted(mut self, value: bool) -> Self {
        self.may_be_encrypted = value;
        self
    }

    /// Path of the main database file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Process filter.
    #[must_use]
    pub fn process_filter(&self) -> ProcessFilter {
        self.filter
    }

    /// Whether the file may be encrypted.
    #[must_use]
    pub fn is_maybe_encrypted(&self) -> bool {
        self.may_be_encrypted
    }
}

/// Classifies the lock state of a database file.
///
/// Never takes a lock and never fails; anything that goes wrong is
/// reported as [`LockState::Error`].
#[must_use]
pub fn probe(desc: &FileLockDescriptor) -> LockState {
    let path = desc.path();
    if desc.may_be_encrypted {
        warn!(path = %path.display(), "cannot probe a possibly encrypted database");
        return LockState::Error;
    }
    match fs::metadata(path) {
        Ok(meta) if meta.is_file() => {}
        Ok(_) => {
            debug!(path = %path.display(), "probe target is not a regular file");
            return LockState::Error;
        }
        Err(e) => {
            debug!(path = %path.display(), error = %e, "probe target unreadable");
            return LockState::Error;
        }
    }
    let entry = match inode::open_for_query(path) {
        Ok(entry) => entry,
        Err(e) => {
            debug!(path = %path.display(), error = %e, "probe could not open target");
            return LockState::Error;
        }
    };
    let state = probe_entry(&entry, desc.filter);
    inode::release_entry(entry);
    state
}

/// Shorthand for [`probe`] on a plain path.
#[must_use]
pub fn probe_path(path: &Path, filter: ProcessFilter) -> LockState {
    probe(&FileLockDescriptor::new(path).filter(filter))
}

/// Probes through an already-registered file, as a connection does.
pub(crate) fn probe_entry(entry: &Arc<InodeEntry>, filter: ProcessFilter) -> LockState {
    match classify(entry, filter) {
        Ok(state) => {
            debug!(path = %entry.path().display(), ?filter, %state, "probed");
            state
        }
        Err(e) => {
            warn!(path = %entry.path().display(), error = %e, "probe failed");
            LockState::Error
        }
    }
}

/// A byte range some other process holds.
#[derive(Debug)]
struct Contended {
    dev_ino: Option<(u64, u64)>,
    start: u64,
    len: u64,
    holder: RangeHolder,
}

fn classify(entry: &Arc<InodeEntry>, filter: ProcessFilter) -> CoreResult<LockState> {
    let main = FileBackend::from_shared(entry.path(), Arc::clone(entry.file()), true);
    let len = main.size()?;
    if len > 0 {
        let prefix = main.read_at(0, len.min(header::MAGIC.len() as u64) as usize)?;
        if !header::has_magic(&prefix) {
            return Ok(LockState::NotADatabase);
        }
    }

    let target = match filter {
        ProcessFilter::AnyProcess => None,
        ProcessFilter::Pid(pid) => Some(pid),
    };
    // Our own engine locks are counted here; the kernel never reports them.
    let own = entry.lock_counts().shared > 0;
    let asks_for_us = match target {
        None => true,
        Some(pid) => pid == std::process::id(),
    };
    if own && asks_for_us {
        return Ok(LockState::LockedByTarget);
    }

    let contended = contended_ranges(entry)?;
    if contended.is_empty() {
        return Ok(LockState::Unlocked);
    }
    let Some(pid) = target else {
        return Ok(LockState::LockedByTarget);
    };
    if contended.iter().any(|c| c.holder.pid == Some(pid)) {
        return Ok(LockState::LockedByTarget);
    }
    owner_from_lock_table(&contended, pid)
}

/// Settles ownership of contended ranges from the kernel lock table.
fn owner_from_lock_table(contended: &[Contended], pid: u32) -> CoreResult<LockState> {
    let mut unnamed = false;
    for range in contended {
        let Some((dev, ino)) = range.dev_ino else {
            unnamed = true;
            continue;
        };
        let holders = match sqlfile_storage::lock_table::holders(dev, ino, range.start, range.len) {
            Ok(holders) => holders,
            Err(e) => {
                warn!(error = %e, pid, "lock owners cannot be listed on this platform");
                return Ok(LockState::Error);
            }
        };
        if holders.iter().any(|h| h.pid == Some(pid)) {
            return Ok(LockState::LockedByTarget);
        }
        unnamed |= holders.iter().any(|h| h.pid.is_none());
    }
    if unnamed {
        warn!(pid, "lock held through an ownerless descriptor; owner undeterminable");
        return Ok(LockState::Error);
    }
    Ok(LockState::Unlocked)
}

/// Main-file ranges: pending, reserved, shared.
const MAIN_RANGES: [(u64, u64); 3] = [
    (PENDING_BYTE, 1),
    (RESERVED_BYTE, 1),
    (SHARED_FIRST, SHARED_SIZE),
];

fn contended_ranges(entry: &Arc<InodeEntry>) -> CoreResult<Vec<Contended>> {
    let mut out = Vec::new();

    #[cfg(not(unix))]
    if entry.holds_locks() {
        // Whole-file emulation cannot tell our own locks from others'.
        return Ok(out);
    }

    query_ranges(entry, &MAIN_RANGES, &mut out)?;

    let shm_path = files::shm_path(entry.path());
    if shm_path.is_file() {
        match inode::open_for_query(&shm_path) {
            Ok(shm_entry) => {
                let slots = [(shm::LOCK_OFFSET, shm::LOCK_SLOTS)];
                let queried = query_ranges(&shm_entry, &slots, &mut out);
                inode::release_entry(shm_entry);
                queried?;
            }
            Err(e) => {
                debug!(path = %shm_path.display(), error = %e, "shared-memory file unreadable");
            }
        }
    }
    Ok(out)
}

fn query_ranges(entry: &InodeEntry, ranges: &[(u64, u64)], out: &mut Vec<Contended>) -> CoreResult<()> {
    for &(start, len) in ranges {
        if let Some(holder) = range_lock::query(entry.file(), RangeLockKind::Write, start, len)? {
            out.push(Contended {
                dev_ino: entry.key().dev_ino(),
                start,
                len,
                holder,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::{LockHandle, LockLevel};
    use tempfile::tempdir;

    fn write(path: &Path, bytes: &[u8]) {
        fs::write(path, bytes).unwrap();
    }

    #[test]
    fn empty_file_is_a_candidate() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("empty.db");
        write(&path, b"");
        assert_eq!(probe_path(&path, ProcessFilter::AnyProcess), LockState::Unlocked);
    }

    #[test]
    fn wrong_magic_is_not_a_database() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        write(&path, b"hello");
        assert_eq!(probe_path(&path, ProcessFilter::AnyProcess), LockState::NotADatabase);
        write(&path, &[0u8; 4096]);
        assert_eq!(probe_path(&path, ProcessFilter::Pid(1)), LockState::NotADatabase);
    }

    #[test]
    fn missing_path_and_directory_are_errors() {
        let dir = tempdir().unwrap();
        assert_eq!(
            probe_path(&dir.path().join("nope.db"), ProcessFilter::AnyProcess),
            LockState::Error
        );
        assert_eq!(probe_path(dir.path(), ProcessFilter::AnyProcess), LockState::Error);
    }

    #[test]
    fn encrypted_files_are_not_touched() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("secret.db");
        write(&path, b"");
        let desc = FileLockDescriptor::new(&path).may_be_encrypted(true);
        assert_eq!(probe(&desc), LockState::Error);
    }

    #[test]
    fn own_process_locks_are_visible() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("own.db");
        write(&path, b"");
        let entry = inode::open(&path, false).unwrap();
        let mut handle = LockHandle::new(Arc::clone(&entry));

        let me = ProcessFilter::Pid(std::process::id());
        assert_eq!(probe_path(&path, me), LockState::Unlocked);

        assert!(handle.try_lock(LockLevel::Shared).unwrap());
        assert_eq!(probe_path(&path, ProcessFilter::AnyProcess), LockState::LockedByTarget);
        assert_eq!(probe_path(&path, me), LockState::LockedByTarget);

        // Probing twice changes nothing, including our own lock.
        assert_eq!(probe_path(&path, me), LockState::LockedByTarget);
        assert_eq!(handle.counts().shared, 1);

        handle.unlock(LockLevel::None).unwrap();
        assert_eq!(probe_path(&path, ProcessFilter::AnyProcess), LockState::Unlocked);
    }

    #[test]
    fn other_pid_is_unlocked_when_only_we_hold() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("mine.db");
        write(&path, b"");
        let entry = inode::open(&path, false).unwrap();
        let mut handle = LockHandle::new(entry);
        assert!(handle.try_lock(LockLevel::Exclusive).unwrap());
        assert_eq!(
            probe_path(&path, ProcessFilter::Pid(std::process::id().wrapping_add(1))),
            LockState::Unlocked
        );
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    #[test]
    fn ownerless_lock_needs_any_process_filter() {
        use std::fs::OpenOptions;

        let dir = tempdir().unwrap();
        let path = dir.path().join("ofd.db");
        write(&path, b"");
        let foreign = OpenOptions::new().read(true).write(true).open(&path).unwrap();
        assert!(range_lock::try_lock_ofd(&foreign, RangeLockKind::Read, SHARED_FIRST, SHARED_SIZE).unwrap());

        assert_eq!(probe_path(&path, ProcessFilter::AnyProcess), LockState::LockedByTarget);
        assert_eq!(probe_path(&path, ProcessFilter::Pid(1)), LockState::Error);
        // The holder may well be this process; that is not knowable either.
        let me = ProcessFilter::Pid(std::process::id());
        assert_eq!(probe_path(&path, me), LockState::Error);

        range_lock::unlock_ofd(&foreign, SHARED_FIRST, SHARED_SIZE).unwrap();
        inode::release_descriptor(foreign);
        assert_eq!(probe_path(&path, ProcessFilter::Pid(1)), LockState::Unlocked);
        assert_eq!(probe_path(&path, me), LockState::Unlocked);
    }

    #[test]
    fn path_query_leaves_no_registered_descriptor() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("idle.db");
        write(&path, b"");
        assert_eq!(probe_path(&path, ProcessFilter::AnyProcess), LockState::Unlocked);
        assert!(inode::lookup(&path).is_none());
    }

    #[cfg(unix)]
    #[test]
    fn read_only_file_can_be_queried() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let path = dir.path().join("ro.db");
        write(&path, b"");
        fs::set_permissions(&path, fs::Permissions::from_mode(0o444)).unwrap();
        assert_eq!(probe_path(&path, ProcessFilter::AnyProcess), LockState::Unlocked);
    }
}
