//! Process-wide table of open database files.
//!
//! Record locks are owned by the process, not by a descriptor, and closing
//! *any* descriptor for a file releases every record lock the process holds
//! on it. Every connection and probe in the process therefore goes through
//! one canonical descriptor per file, registered here by device and inode,
//! together with the count of handles holding each lock level.

use crate::error::{CoreError, CoreResult};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::fs::{self, File, Metadata, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use tracing::debug;

/// Identity of an open file.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FileKey {
    /// Device and inode number.
    Inode {
        /// Device id.
        dev: u64,
        /// Inode number.
        ino: u64,
    },
    /// Canonical path, where the platform has no inode numbers.
    Path(PathBuf),
}

impl FileKey {
    #[cfg(unix)]
    fn of(_path: &Path, meta: &Metadata) -> io::Result<Self> {
        use std::os::unix::fs::MetadataExt;
        Ok(Self::Inode {
            dev: meta.dev(),
            ino: meta.ino(),
        })
    }

    #[cfg(not(unix))]
    fn of(path: &Path, _meta: &Metadata) -> io::Result<Self> {
        Ok(Self::Path(fs::canonicalize(path)?))
    }

    /// Device and inode, where known.
    #[must_use]
    pub fn dev_ino(&self) -> Option<(u64, u64)> {
        match self {
            Self::Inode { dev, ino } => Some((*dev, *ino)),
            Self::Path(_) => None,
        }
    }
}

/// Number of handles in this process holding at least each lock level.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LockCounts {
    /// Handles at SHARED or above.
    pub shared: u32,
    /// Handles at RESERVED or above.
    pub reserved: u32,
    /// Handles at PENDING or above.
    pub pending: u32,
    /// Handles at EXCLUSIVE.
    pub exclusive: u32,
}

/// Shared state for one open database file.
pub struct InodeEntry {
    key: FileKey,
    path: PathBuf,
    file: Arc<File>,
    writable: bool,
    pub(crate) locks: Mutex<LockCounts>,
    generation: AtomicU64,
    resets: AtomicU64,
    parked: Mutex<Vec<File>>,
    detached: bool,
}

impl InodeEntry {
    /// File identity.
    #[must_use]
    pub fn key(&self) -> &FileKey {
        &self.key
    }

    /// Path the file was first opened through.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Canonical descriptor.
    #[must_use]
    pub fn file(&self) -> &Arc<File> {
        &self.file
    }

    /// Returns true if the canonical descriptor was opened for writing.
    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// Counter bumped by every change this process makes to the file.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Counter bumped by every truncate or replace this process performs.
    #[must_use]
    pub fn reset_epoch(&self) -> u64 {
        self.resets.load(Ordering::Acquire)
    }

    pub(crate) fn bump_generation(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn bump_reset_epoch(&self) {
        self.resets.fetch_add(1, Ordering::AcqRel);
        self.bump_generation();
    }

    /// Snapshot of the in-process lock counts.
    #[must_use]
    pub fn lock_counts(&self) -> LockCounts {
        *self.locks.lock()
    }

    /// Returns true if any handle in this process holds a lock on the file.
    #[must_use]
    pub fn holds_locks(&self) -> bool {
        self.locks.lock().shared > 0
    }

    /// Closes descriptors parked by [`release_descriptor`].
    pub(crate) fn close_parked(&self) {
        let parked = std::mem::take(&mut *self.parked.lock());
        if !parked.is_empty() {
            debug!(count = parked.len(), path = %self.path.display(), "closing parked descriptors");
        }
    }
}

impl fmt::Debug for InodeEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InodeEntry")
            .field("key", &self.key)
            .field("path", &self.path)
            .field("writable", &self.writable)
            .field("detached", &self.detached)
            .field("locks", &self.lock_counts())
            .field("generation", &self.generation())
            .finish_non_exhaustive()
    }
}

type Registry = Mutex<HashMap<FileKey, Weak<InodeEntry>>>;

fn registry() -> &'static Registry {
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

fn lookup_key(key: &FileKey) -> Option<Arc<InodeEntry>> {
    registry().lock().get(key).and_then(Weak::upgrade)
}

/// Returns the registered entry for `path`, or registers a new one.
///
/// With `create`, a missing file is created empty.
///
/// # Errors
///
/// Returns an error if the path is missing (and `create` is false), is not
/// a regular file, or cannot be opened.
pub fn open(path: &Path, create: bool) -> CoreResult<Arc<InodeEntry>> {
    let meta = match fs::metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound && create => {
            OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(path)?;
            fs::metadata(path)?
        }
        Err(e) => return Err(e.into()),
    };
    if !meta.is_file() {
        return Err(CoreError::invalid_argument(format!(
            "{} is not a regular file",
            path.display()
        )));
    }
    let key = FileKey::of(path, &meta)?;

    let mut map = registry().lock();
    map.retain(|_, entry| entry.strong_count() > 0);
    if let Some(entry) = map.get(&key).and_then(Weak::upgrade) {
        return Ok(entry);
    }

    let (file, writable) = match OpenOptions::new().read(true).write(true).open(path) {
        Ok(file) => (file, true),
        Err(e) => {
            debug!(path = %path.display(), error = %e, "opening read-only");
            (OpenOptions::new().read(true).open(path)?, false)
        }
    };

    let entry = Arc::new(InodeEntry {
        key: key.clone(),
        path: path.to_path_buf(),
        file: Arc::new(file),
        writable,
        locks: Mutex::new(LockCounts::default()),
        generation: AtomicU64::new(0),
        resets: AtomicU64::new(0),
        parked: Mutex::new(Vec::new()),
        detached: false,
    });
    map.insert(key, Arc::downgrade(&entry));
    Ok(entry)
}

/// Returns the registered entry for `path`, or a read-only entry that is
/// not registered.
///
/// Queries that never lock use this so they do not leave a writable
/// descriptor behind. Pass the result to [`release_entry`] when done.
///
/// # Errors
///
/// Returns an error if the path is missing, is not a regular file, or
/// cannot be opened for reading.
pub fn open_for_query(path: &Path) -> CoreResult<Arc<InodeEntry>> {
    let meta = fs::metadata(path)?;
    if !meta.is_file() {
        return Err(CoreError::invalid_argument(format!(
            "{} is not a regular file",
            path.display()
        )));
    }
    let key = FileKey::of(path, &meta)?;
    if let Some(entry) = lookup_key(&key) {
        return Ok(entry);
    }
    let file = OpenOptions::new().read(true).open(path)?;
    Ok(Arc::new(InodeEntry {
        key,
        path: path.to_path_buf(),
        file: Arc::new(file),
        writable: false,
        locks: Mutex::new(LockCounts::default()),
        generation: AtomicU64::new(0),
        resets: AtomicU64::new(0),
        parked: Mutex::new(Vec::new()),
        detached: true,
    }))
}

/// Drops an entry from [`open_for_query`].
///
/// A detached descriptor is closed through [`release_descriptor`], so a
/// connection registered in the meantime keeps its locks.
pub fn release_entry(entry: Arc<InodeEntry>) {
    if !entry.detached {
        return;
    }
    if let Ok(entry) = Arc::try_unwrap(entry) {
        if let Ok(file) = Arc::try_unwrap(entry.file) {
            release_descriptor(file);
        }
    }
}

/// Returns the registered entry for `path` without opening anything.
#[must_use]
pub fn lookup(path: &Path) -> Option<Arc<InodeEntry>> {
    let meta = fs::metadata(path).ok()?;
    let key = FileKey::of(path, &meta).ok()?;
    lookup_key(&key)
}

/// Closes a descriptor that was opened outside the registry.
///
/// If this process currently holds locks on the same file, closing would
/// release them, so the descriptor is parked until the file's entry goes
/// away.
pub fn release_descriptor(file: File) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        if let Ok(meta) = file.metadata() {
            let key = FileKey::Inode {
                dev: meta.dev(),
                ino: meta.ino(),
            };
            if let Some(entry) = lookup_key(&key) {
                if entry.holds_locks() {
                    entry.parked.lock().push(file);
                    return;
                }
            }
        }
    }
    drop(file);
}
