//! Locks that the prober attributes to no process of ours.
//!
//! On Linux, open-file-description locks conflict with the record locks a
//! connection takes even inside one process, and `/proc/locks` lists them
//! without a pid. A [`ForeignLockHolder`] therefore stands in for another
//! process that holds the database, without spawning one.

#[cfg(any(target_os = "linux", target_os = "android"))]
pub use imp::ForeignLockHolder;

#[cfg(any(target_os = "linux", target_os = "android"))]
mod imp {
    use sqlfile_core::inode;
    use sqlfile_core::lock::{PENDING_BYTE, RESERVED_BYTE, SHARED_FIRST, SHARED_SIZE};
    use sqlfile_core::LockLevel;
    use sqlfile_storage::range_lock::{self, RangeLockKind};
    use std::fs::{File, OpenOptions};
    use std::path::Path;

    /// Holds open-file-description locks on a database until dropped.
    pub struct ForeignLockHolder {
        file: Option<File>,
        ranges: Vec<(u64, u64)>,
    }

    impl ForeignLockHolder {
        /// Takes the ranges a connection at `level` would hold.
        ///
        /// Panics if any range is already held.
        pub fn acquire(path: &Path, level: LockLevel) -> Self {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .open(path)
                .expect("Failed to open database for foreign lock");
            let wanted: &[(RangeLockKind, u64, u64)] = match level {
                LockLevel::None => &[],
                LockLevel::Shared => &[(RangeLockKind::Read, SHARED_FIRST, SHARED_SIZE)],
                LockLevel::Reserved => &[
                    (RangeLockKind::Read, SHARED_FIRST, SHARED_SIZE),
                    (RangeLockKind::Write, RESERVED_BYTE, 1),
                ],
                LockLevel::Pending | LockLevel::Exclusive => &[
                    (RangeLockKind::Write, PENDING_BYTE, 1),
                    (RangeLockKind::Write, RESERVED_BYTE, 1),
                    (RangeLockKind::Write, SHARED_FIRST, SHARED_SIZE),
                ],
            };

            let mut holder = Self {
                file: None,
                ranges: Vec::with_capacity(wanted.len()),
            };
            for (kind, start, len) in wanted {
                let got = range_lock::try_lock_ofd(&file, *kind, *start, *len)
                    .expect("Failed to take foreign lock");
                assert!(got, "range at {start:#x} is already locked");
                holder.ranges.push((*start, *len));
            }
            holder.file = Some(file);
            holder
        }

        /// Takes a SHARED-equivalent lock.
        pub fn shared(path: &Path) -> Self {
            Self::acquire(path, LockLevel::Shared)
        }

        /// Takes a RESERVED-equivalent lock.
        pub fn reserved(path: &Path) -> Self {
            Self::acquire(path, LockLevel::Reserved)
        }

        /// Takes an EXCLUSIVE-equivalent lock.
        pub fn exclusive(path: &Path) -> Self {
            Self::acquire(path, LockLevel::Exclusive)
        }

        /// Releases the locks now.
        pub fn release(self) {
            drop(self);
        }
    }

    impl Drop for ForeignLockHolder {
        fn drop(&mut self) {
            let Some(file) = self.file.take() else {
                return;
            };
            for (start, len) in self.ranges.drain(..) {
                let _ = range_lock::unlock_ofd(&file, start, len);
            }
            inode::release_descriptor(file);
        }
    }

}
