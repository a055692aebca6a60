//! Advisory byte-range locks.
//!
//! On Unix these are `fcntl` record locks. They are owned by the *process*:
//! a process never conflicts with itself, `F_GETLK` never reports the
//! caller's own locks, and closing any descriptor for a file releases every
//! record lock the process holds on it.
//!
//! On Linux the open-file-description variants (`F_OFD_*`) are also
//! exposed. Those are owned by the open file and conflict with ordinary
//! record locks even inside one process.
//!
//! Other platforms only get whole-file locks through `fs2`; the requested
//! range is ignored there and holders are never identified.

use crate::error::StorageResult;
use std::fs::File;

/// Lock mode for a byte range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RangeLockKind {
    /// Shared (read) lock.
    Read,
    /// Exclusive (write) lock.
    Write,
}

/// A lock found to conflict with a probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeHolder {
    /// Mode of the conflicting lock.
    pub kind: RangeLockKind,
    /// Owning process, when the platform reports one.
    ///
    /// Open-file-description locks report no owner.
    pub pid: Option<u32>,
}

#[cfg(unix)]
mod imp {
    use super::{RangeHolder, RangeLockKind};
    use crate::error::StorageResult;
    use nix::errno::Errno;
    use nix::fcntl::{fcntl, FcntlArg};
    use nix::libc;
    use std::fs::File;

    #[allow(clippy::cast_possible_wrap)]
    pub(super) fn flock(l_type: libc::c_int, start: u64, len: u64) -> libc::flock {
        libc::flock {
            l_type: l_type as libc::c_short,
            l_whence: libc::SEEK_SET as libc::c_short,
            l_start: start as libc::off_t,
            l_len: len as libc::off_t,
            l_pid: 0,
        }
    }

    fn lock_type(kind: RangeLockKind) -> libc::c_int {
        match kind {
            RangeLockKind::Read => libc::F_RDLCK,
            RangeLockKind::Write => libc::F_WRLCK,
        }
    }

    pub(super) fn contended(result: nix::Result<libc::c_int>) -> StorageResult<bool> {
        match result {
            Ok(_) => Ok(true),
            Err(Errno::EACCES | Errno::EAGAIN) => Ok(false),
            Err(e) => Err(std::io::Error::from(e).into()),
        }
    }

    pub fn try_lock(file: &File, kind: RangeLockKind, start: u64, len: u64) -> StorageResult<bool> {
        let fl = flock(lock_type(kind), start, len);
        contended(fcntl(file, FcntlArg::F_SETLK(&fl)))
    }

    pub fn unlock(file: &File, start: u64, len: u64) -> StorageResult<()> {
        let fl = flock(libc::F_UNLCK, start, len);
        fcntl(file, FcntlArg::F_SETLK(&fl)).map_err(std::io::Error::from)?;
        Ok(())
    }

    #[allow(clippy::cast_sign_loss)]
    pub fn query(
        file: &File,
        kind: RangeLockKind,
        start: u64,
        len: u64,
    ) -> StorageResult<Option<RangeHolder>> {
        let mut fl = flock(lock_type(kind), start, len);
        fcntl(file, FcntlArg::F_GETLK(&mut fl)).map_err(std::io::Error::from)?;

        let kind = match libc::c_int::from(fl.l_type) {
            libc::F_UNLCK => return Ok(None),
            libc::F_RDLCK => RangeLockKind::Read,
            _ => RangeLockKind::Write,
        };
        let pid = (fl.l_pid > 0).then_some(fl.l_pid as u32);
        Ok(Some(RangeHolder { kind, pid }))
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    pub fn try_lock_ofd(
        file: &File,
        kind: RangeLockKind,
        start: u64,
        len: u64,
    ) -> StorageResult<bool> {
        let fl = flock(lock_type(kind), start, len);
        contended(fcntl(file, FcntlArg::F_OFD_SETLK(&fl)))
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    pub fn unlock_ofd(file: &File, start: u64, len: u64) -> StorageResult<()> {
        let fl = flock(libc::F_UNLCK, start, len);
        fcntl(file, FcntlArg::F_OFD_SETLK(&fl)).map_err(std::io::Error::from)?;
        Ok(())
    }
}

#[cfg(not(unix))]
mod imp {
    use super::{RangeHolder, RangeLockKind};
    use crate::error::StorageResult;
    use fs2::FileExt;
    use std::fs::File;

    fn is_contention(err: &std::io::Error) -> bool {
        err.kind() == fs2::lock_contended_error().kind()
            || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
    }

    pub fn try_lock(file: &File, kind: RangeLockKind, _start: u64, _len: u64) -> StorageResult<bool> {
        let result = match kind {
            RangeLockKind::Read => FileExt::try_lock_shared(file),
            RangeLockKind::Write => FileExt::try_lock_exclusive(file),
        };
        match result {
            Ok(()) => Ok(true),
            Err(e) if is_contention(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub fn unlock(file: &File, _start: u64, _len: u64) -> StorageResult<()> {
        FileExt::unlock(file)?;
        Ok(())
    }

    pub fn query(
        file: &File,
        kind: RangeLockKind,
        start: u64,
        len: u64,
    ) -> StorageResult<Option<RangeHolder>> {
        if try_lock(file, kind, start, len)? {
            unlock(file, start, len)?;
            Ok(None)
        } else {
            Ok(Some(RangeHolder {
                kind: RangeLockKind::Write,
                pid: None,
            }))
        }
    }
}

/// Attempts to take a lock on `len` bytes at `start` without blocking.
///
/// Returns `Ok(false)` when another owner holds a conflicting lock.
///
/// # Errors
///
/// Returns an error for any failure other than contention.
pub fn try_lock(file: &File, kind: RangeLockKind, start: u64, len: u64) -> StorageResult<bool> {
    imp::try_lock(file, kind, start, len)
}

/// Releases any lock this process holds on the range.
///
/// # Errors
///
/// Returns an error if the unlock call fails.
pub fn unlock(file: &File, start: u64, len: u64) -> StorageResult<()> {
    imp::unlock(file, start, len)
}

/// Asks the kernel whether a lock of `kind` on the range would conflict,
/// without taking it.
///
/// Locks held by the calling process are invisible to this query.
///
/// # Errors
///
/// Returns an error if the query call fails.
pub fn query(
    file: &File,
    kind: RangeLockKind,
    start: u64,
    len: u64,
) -> StorageResult<Option<RangeHolder>> {
    imp::query(file, kind, start, len)
}

/// Takes an open-file-description lock on the range.
///
/// # Errors
///
/// Returns an error for any failure other than contention.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub fn try_lock_ofd(file: &File, kind: RangeLockKind, start: u64, len: u64) -> StorageResult<bool> {
    imp::try_lock_ofd(file, kind, start, len)
}

/// Releases an open-file-description lock on the range.
///
/// # Errors
///
/// Returns an error if the unlock call fails.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub fn unlock_ofd(file: &File, start: u64, len: u64) -> StorageResult<()> {
    imp::unlock_ofd(file, start, len)
}
