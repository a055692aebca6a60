//! The main-file lock protocol.
//!
//! Connections coordinate through record locks on bytes just past the first
//! gigabyte of the main file, which no page ever occupies:
//!
//! ```text
//! PENDING_BYTE   0x40000000   writer waiting for readers to drain
//! RESERVED_BYTE  0x40000001   writer intends to commit
//! SHARED range   0x40000002   510 bytes; readers hold it shared,
//!                             the committing writer holds it exclusive
//! ```
//!
//! Levels are climbed one at a time: NONE, SHARED, RESERVED, PENDING,
//! EXCLUSIVE. A new reader must briefly read-lock PENDING, so once a writer
//! holds PENDING no new readers start and the writer eventually gets
//! EXCLUSIVE.
//!
//! Record locks belong to the process, so the kernel only arbitrates
//! between processes. Between handles of one process the same rules are
//! enforced with the counts kept in the file's [`InodeEntry`].

use crate::busy::BusyHandler;
use crate::error::{CoreError, CoreResult};
use crate::inode::{InodeEntry, LockCounts};
use sqlfile_storage::range_lock::{self, RangeLockKind};
use std::fs::File;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Offset of the pending byte.
pub const PENDING_BYTE: u64 = 0x4000_0000;

/// Offset of the reserved byte.
pub const RESERVED_BYTE: u64 = PENDING_BYTE + 1;

/// First byte of the shared range.
pub const SHARED_FIRST: u64 = PENDING_BYTE + 2;

/// Length of the shared range.
pub const SHARED_SIZE: u64 = 510;

/// Lock level held by one handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum LockLevel {
    /// No lock.
    #[default]
    None,
    /// Reading.
    Shared,
    /// Reading, and will write.
    Reserved,
    /// Waiting for readers to drain before writing.
    Pending,
    /// Writing.
    Exclusive,
}

impl LockLevel {
    fn next(self) -> Self {
        match self {
            Self::None => Self::Shared,
            Self::Shared => Self::Reserved,
            Self::Reserved => Self::Pending,
            Self::Pending | Self::Exclusive => Self::Exclusive,
        }
    }
}

// Pending and reserved bytes only exist where record locks do; elsewhere
// the shared range stands for the whole file.

#[cfg(unix)]
fn lock_byte(file: &File, kind: RangeLockKind, offset: u64) -> CoreResult<bool> {
    Ok(range_lock::try_lock(file, kind, offset, 1)?)
}

#[cfg(unix)]
fn unlock_byte(file: &File, offset: u64) -> CoreResult<()> {
    Ok(range_lock::unlock(file, offset, 1)?)
}

#[cfg(unix)]
fn upgrade_shared_range(file: &File) -> CoreResult<bool> {
    Ok(range_lock::try_lock(
        file,
        RangeLockKind::Write,
        SHARED_FIRST,
        SHARED_SIZE,
    )?)
}

#[cfg(unix)]
fn downgrade_shared_range(file: &File) -> CoreResult<()> {
    range_lock::try_lock(file, RangeLockKind::Read, SHARED_FIRST, SHARED_SIZE)?;
    Ok(())
}

#[cfg(not(unix))]
fn lock_byte(_file: &File, _kind: RangeLockKind, _offset: u64) -> CoreResult<bool> {
    Ok(true)
}

#[cfg(not(unix))]
fn unlock_byte(_file: &File, _offset: u64) -> CoreResult<()> {
    Ok(())
}

#[cfg(not(unix))]
fn upgrade_shared_range(file: &File) -> CoreResult<bool> {
    range_lock::unlock(file, SHARED_FIRST, SHARED_SIZE)?;
    if range_lock::try_lock(file, RangeLockKind::Write, SHARED_FIRST, SHARED_SIZE)? {
        return Ok(true);
    }
    range_lock::try_lock(file, RangeLockKind::Read, SHARED_FIRST, SHARED_SIZE)?;
    Ok(false)
}

#[cfg(not(unix))]
fn downgrade_shared_range(file: &File) -> CoreResult<()> {
    range_lock::unlock(file, SHARED_FIRST, SHARED_SIZE)?;
    range_lock::try_lock(file, RangeLockKind::Read, SHARED_FIRST, SHARED_SIZE)?;
    Ok(())
}

fn acquire_shared_range(file: &File) -> CoreResult<bool> {
    if !lock_byte(file, RangeLockKind::Read, PENDING_BYTE)? {
        return Ok(false);
    }
    let got = range_lock::try_lock(file, RangeLockKind::Read, SHARED_FIRST, SHARED_SIZE);
    unlock_byte(file, PENDING_BYTE)?;
    Ok(got?)
}

/// One handle's place in the lock protocol of a file.
///
/// Dropping the handle releases whatever it holds.
#[derive(Debug)]
pub struct LockHandle {
    entry: Arc<InodeEntry>,
    level: LockLevel,
}

impl LockHandle {
    /// Creates an unlocked handle.
    #[must_use]
    pub fn new(entry: Arc<InodeEntry>) -> Self {
        Self {
            entry,
            level: LockLevel::None,
        }
    }

    /// Level currently held.
    #[must_use]
    pub fn level(&self) -> LockLevel {
        self.level
    }

    /// File this handle locks.
    #[must_use]
    pub fn entry(&self) -> &Arc<InodeEntry> {
        &self.entry
    }

    /// Climbs toward `target` without waiting.
    ///
    /// Returns `Ok(false)` on contention. The handle then stays at the
    /// highest level it reached, which for a writer means PENDING keeps new
    /// readers out while it retries.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ReadOnly`] when asking a read-only descriptor for
    /// a write level, or an error if a lock call fails outright.
    pub fn try_lock(&mut self, target: LockLevel) -> CoreResult<bool> {
        while self.level < target {
            let next = self.level.next();
            if !self.step_up(next)? {
                return Ok(false);
            }
            self.level = next;
        }
        Ok(true)
    }

    /// Climbs to `target`, consulting `busy` on contention.
    ///
    /// When the handler gives up, the handle drops back to the level it
    /// started from.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Busy`] when the handler gives up, or any error
    /// from [`Self::try_lock`].
    pub fn lock(
        &mut self,
        target: LockLevel,
        busy: &dyn BusyHandler,
        timeout: Duration,
    ) -> CoreResult<()> {
        let start = self.level;
        let mut attempt = 0;
        loop {
            match self.try_lock(target) {
                Ok(true) => return Ok(()),
                Ok(false) => {}
                Err(e) => {
                    self.fall_back(start);
                    return Err(e);
                }
            }
            if !busy.on_busy(attempt, timeout) {
                debug!(
                    path = %self.entry.path().display(),
                    target = ?target,
                    reached = ?self.level,
                    attempts = attempt + 1,
                    "lock busy"
                );
                self.fall_back(start);
                return Err(CoreError::Busy);
            }
            attempt += 1;
        }
    }

    /// Returns to `level` after a failed climb. The climb's own error is
    /// what the caller reports, so a failure here is only logged.
    fn fall_back(&mut self, level: LockLevel) {
        if let Err(e) = self.unlock(level) {
            warn!(
                path = %self.entry.path().display(),
                level = ?level,
                error = %e,
                "could not restore lock level after failed climb"
            );
        }
    }

    fn step_up(&self, next: LockLevel) -> CoreResult<bool> {
        let file = self.entry.file();
        let mut counts = self.entry.locks.lock();
        match next {
            LockLevel::None => Ok(true),
            LockLevel::Shared => {
                if counts.pending > 0 {
                    return Ok(false);
                }
                if counts.shared == 0 && !acquire_shared_range(file)? {
                    return Ok(false);
                }
                counts.shared += 1;
                Ok(true)
            }
            LockLevel::Reserved => {
                if !self.entry.is_writable() {
                    return Err(CoreError::ReadOnly);
                }
                if counts.reserved > 0 || !lock_byte(file, RangeLockKind::Write, RESERVED_BYTE)? {
                    return Ok(false);
                }
                counts.reserved += 1;
                Ok(true)
            }
            LockLevel::Pending => {
                if !lock_byte(file, RangeLockKind::Write, PENDING_BYTE)? {
                    return Ok(false);
                }
                counts.pending += 1;
                Ok(true)
            }
            LockLevel::Exclusive => {
                if counts.shared > 1 || !upgrade_shared_range(file)? {
                    return Ok(false);
                }
                counts.exclusive += 1;
                Ok(true)
            }
        }
    }

    /// Steps down to `target`. Asking for a level at or above the current
    /// one does nothing.
    ///
    /// # Errors
    ///
    /// Returns an error if an unlock call fails; the in-process counts are
    /// updated regardless.
    pub fn unlock(&mut self, target: LockLevel) -> CoreResult<()> {
        if target >= self.level {
            return Ok(());
        }
        let from = self.level;
        self.level = target;

        let file = self.entry.file();
        let mut counts = self.entry.locks.lock();
        let mut result = Ok(());
        let mut note = |r: CoreResult<()>| {
            if result.is_ok() {
                result = r;
            }
        };

        if from == LockLevel::Exclusive {
            counts.exclusive -= 1;
            if target >= LockLevel::Shared {
                note(downgrade_shared_range(file));
            }
        }
        if from >= LockLevel::Pending && target < LockLevel::Pending {
            counts.pending -= 1;
            note(unlock_byte(file, PENDING_BYTE));
        }
        if from >= LockLevel::Reserved && target < LockLevel::Reserved {
            counts.reserved -= 1;
            note(unlock_byte(file, RESERVED_BYTE));
        }
        if from >= LockLevel::Shared && target == LockLevel::None {
            counts.shared -= 1;
            if counts.shared == 0 {
                note(range_lock::unlock(file, SHARED_FIRST, SHARED_SIZE).map_err(CoreError::from));
                drop(counts);
                self.entry.close_parked();
            }
        }
        result
    }

    /// Returns true if some other handle, in this process or another,
    /// holds RESERVED or above.
    ///
    /// # Errors
    ///
    /// Returns an error if the kernel query fails.
    pub fn reserved_elsewhere(&self) -> CoreResult<bool> {
        let mut in_process = self.entry.lock_counts().reserved;
        if self.level >= LockLevel::Reserved {
            in_process -= 1;
        }
        if in_process > 0 {
            return Ok(true);
        }
        #[cfg(unix)]
        {
            let holder =
                range_lock::query(self.entry.file(), RangeLockKind::Write, RESERVED_BYTE, 1)?;
            Ok(holder.is_some())
        }
        #[cfg(not(unix))]
        {
            Ok(false)
        }
    }

    /// In-process counts for the handle's file.
    #[must_use]
    pub fn counts(&self) -> LockCounts {
        self.entry.lock_counts()
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        if let Err(e) = self.unlock(LockLevel::None) {
            debug!(path = %self.entry.path().display(), error = %e, "unlock on drop failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::busy::NoRetry;
    use crate::inode;
    use tempfile::tempdir;

    fn handles(n: usize) -> (tempfile::TempDir, Vec<LockHandle>) {
        let dir = tempdir().unwrap();
        let entry = inode::open(&dir.path().join("lock.db"), true).unwrap();
        let handles = (0..n).map(|_| LockHandle::new(Arc::clone(&entry))).collect();
        (dir, handles)
    }

    #[test]
    fn readers_share() {
        let (_dir, mut h) = handles(2);
        assert!(h[0].try_lock(LockLevel::Shared).unwrap());
        assert!(h[1].try_lock(LockLevel::Shared).unwrap());
        assert_eq!(h[0].counts().shared, 2);
    }

    #[test]
    fn one_reserved_per_file() {
        let (_dir, mut h) = handles(2);
        assert!(h[0].try_lock(LockLevel::Reserved).unwrap());
        assert!(!h[1].try_lock(LockLevel::Reserved).unwrap());
        assert_eq!(h[1].level(), LockLevel::Shared);
    }

    #[test]
    fn exclusive_waits_for_other_readers() {
        let (_dir, mut h) = handles(2);
        assert!(h[1].try_lock(LockLevel::Shared).unwrap());
        assert!(!h[0].try_lock(LockLevel::Exclusive).unwrap());
        assert_eq!(h[0].level(), LockLevel::Pending);

        // Pending blocks new readers.
        let mut late = LockHandle::new(Arc::clone(h[0].entry()));
        assert!(!late.try_lock(LockLevel::Shared).unwrap());

        h[1].unlock(LockLevel::None).unwrap();
        assert!(h[0].try_lock(LockLevel::Exclusive).unwrap());
        assert_eq!(h[0].counts().exclusive, 1);
    }

    #[test]
    fn busy_failure_restores_start_level() {
        let (_dir, mut h) = handles(2);
        assert!(h[1].try_lock(LockLevel::Shared).unwrap());
        h[0].try_lock(LockLevel::Shared).unwrap();

        let err = h[0]
            .lock(LockLevel::Exclusive, &NoRetry, Duration::ZERO)
            .unwrap_err();
        assert!(matches!(err, CoreError::Busy));
        assert_eq!(h[0].level(), LockLevel::Shared);
        assert_eq!(h[0].counts().pending, 0);
        assert_eq!(h[0].counts().reserved, 0);
    }

    #[test]
    fn climb_error_is_reported_and_start_level_restored() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ro.db");
        std::fs::write(&path, b"").unwrap();
        let entry = inode::open_for_query(&path).unwrap();
        let mut handle = LockHandle::new(Arc::clone(&entry));

        let err = handle
            .lock(LockLevel::Exclusive, &NoRetry, Duration::ZERO)
            .unwrap_err();
        assert!(matches!(err, CoreError::ReadOnly));
        assert_eq!(handle.level(), LockLevel::None);
        assert_eq!(entry.lock_counts().shared, 0);
    }

    #[test]
    fn unlock_steps_down_and_drop_releases() {
        let (_dir, mut h) = handles(1);
        let entry = Arc::clone(h[0].entry());
        assert!(h[0].try_lock(LockLevel::Exclusive).unwrap());
        h[0].unlock(LockLevel::Shared).unwrap();
        assert_eq!(
            entry.lock_counts(),
            LockCounts {
                shared: 1,
                ..LockCounts::default()
            }
        );
        drop(h);
        assert!(!entry.holds_locks());
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    #[test]
    fn kernel_sees_exclusive_from_other_descriptions() {
        let (dir, mut h) = handles(1);
        assert!(h[0].try_lock(LockLevel::Exclusive).unwrap());

        let other = std::fs::File::open(dir.path().join("lock.db")).unwrap();
        assert!(!range_lock::try_lock_ofd(
            &other,
            RangeLockKind::Read,
            SHARED_FIRST,
            SHARED_SIZE
        )
        .unwrap());

        // Closing `other` now would drop the exclusive lock.
        inode::release_descriptor(other);
        let probe = std::fs::File::open(dir.path().join("lock.db")).unwrap();
        assert!(!range_lock::try_lock_ofd(&probe, RangeLockKind::Read, SHARED_FIRST, 1).unwrap());
        inode::release_descriptor(probe);
    }
}
