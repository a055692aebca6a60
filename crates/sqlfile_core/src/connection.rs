//! Connection facade.

use crate::busy::{default_busy_handler, BusyHandler};
use crate::config::Config;
use crate::error::{CoreError, CoreResult, FileControlError, ReplaceError, TruncateError};
use crate::files::DatabaseFileSet;
use crate::format::header::DatabaseHeader;
use crate::hooks::{PreUpdateEvent, PreUpdateHook};
use crate::inode::FileKey;
use crate::lock::LockLevel;
use crate::pager::Pager;
use crate::probe;
use crate::replace;
use crate::reset::{self, TruncateOptions};
use crate::snapshot::Snapshot;
use crate::transaction::Transaction;
use crate::types::{LockState, ProcessFilter, RowId};
use parking_lot::Mutex;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// A command sent through [`Connection::file_control`].
#[derive(Debug, Clone, Copy)]
pub enum FileControl<'a> {
    /// Truncate the database, optionally writing an empty header.
    TruncateDatabase(Option<TruncateOptions>),
    /// Replace the database's content with another connection's.
    ReplaceDatabase(&'a Connection),
    /// Report whether a process holds a lock on the database.
    LockStatePid(ProcessFilter),
}

/// Result of a successful [`Connection::file_control`] command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileControlOutcome {
    /// The command completed.
    Done,
    /// The probed lock state.
    LockState(LockState),
}

/// An open database file.
///
/// A connection is `Send + Sync`; calls from several threads are
/// serialized. Any number of connections, in any number of processes, may
/// share one file.
///
/// ```rust,ignore
/// use sqlfile_core::Connection;
///
/// let conn = Connection::open(Path::new("app.db"))?;
/// conn.transaction(|txn| {
///     txn.insert(b"hello".to_vec())?;
///     Ok(())
/// })?;
/// conn.truncate(None)?;
/// ```
pub struct Connection {
    id: u64,
    path: PathBuf,
    inner: Mutex<Pager>,
    hook: Mutex<Option<PreUpdateHook>>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Opens a database with the default configuration, creating an empty
    /// file if none exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or is not a database.
    pub fn open(path: &Path) -> CoreResult<Self> {
        Self::open_with_config(path, Config::default())
    }

    /// Opens a database with a custom configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, or the file cannot
    /// be opened or is not a database.
    pub fn open_with_config(path: &Path, config: Config) -> CoreResult<Self> {
        Self::open_with_busy_handler(path, config, default_busy_handler())
    }

    /// Opens a database with a custom configuration and busy handler.
    ///
    /// # Errors
    ///
    /// See [`Self::open_with_config`].
    pub fn open_with_busy_handler(
        path: &Path,
        config: Config,
        busy: Arc<dyn BusyHandler>,
    ) -> CoreResult<Self> {
        let pager = Pager::open(path, config, busy)?;
        Ok(Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            path: path.to_path_buf(),
            inner: Mutex::new(pager),
            hook: Mutex::new(None),
        })
    }

    /// Path the connection was opened with.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Identity of the underlying file.
    #[must_use]
    pub fn file_key(&self) -> FileKey {
        self.inner.lock().entry.key().clone()
    }

    /// The connection's configuration.
    #[must_use]
    pub fn config(&self) -> Config {
        self.inner.lock().config.clone()
    }

    /// Returns true if the connection cannot write.
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.inner.lock().is_read_only()
    }

    /// Replaces the busy handler.
    pub fn set_busy_handler(&self, handler: Arc<dyn BusyHandler>) {
        self.inner.lock().busy = handler;
    }

    /// The database's files as they exist now.
    #[must_use]
    pub fn files(&self) -> DatabaseFileSet {
        self.inner.lock().files()
    }

    /// Lock level the connection currently holds.
    #[must_use]
    pub fn lock_level(&self) -> LockLevel {
        self.inner.lock().lock.level()
    }

    /// Takes and keeps a lock until [`Self::release_lock`] or the next
    /// write transaction.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Busy`] if the busy handler gives up.
    pub fn hold_lock(&self, level: LockLevel) -> CoreResult<()> {
        self.inner.lock().acquire(level)
    }

    /// Drops every lock held through [`Self::hold_lock`].
    ///
    /// # Errors
    ///
    /// Returns an error if the unlock call fails.
    pub fn release_lock(&self) -> CoreResult<()> {
        self.inner.lock().lock.unlock(LockLevel::None)
    }

    /// The header a reader sees now.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be read.
    pub fn header(&self) -> CoreResult<DatabaseHeader> {
        self.inner.lock().header()
    }

    /// Every row, in rowid order.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be read.
    pub fn rows(&self) -> CoreResult<Vec<(RowId, Vec<u8>)>> {
        let image = self.inner.lock().read_image()?;
        Ok(image.rows.into_iter().collect())
    }

    /// One row's payload.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be read.
    pub fn get(&self, rowid: RowId) -> CoreResult<Option<Vec<u8>>> {
        let mut image = self.inner.lock().read_image()?;
        Ok(image.rows.remove(&rowid))
    }

    /// Number of rows.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be read.
    pub fn row_count(&self) -> CoreResult<usize> {
        Ok(self.inner.lock().read_image()?.rows.len())
    }

    /// Runs `f` in a write transaction.
    ///
    /// If `f` returns `Ok`, its changes are committed; if it returns `Err`,
    /// they are discarded. The pre-update hook, if any, sees each change as
    /// it is made.
    ///
    /// # Errors
    ///
    /// Returns `f`'s error, [`CoreError::Busy`] if another writer holds the
    /// file, or any error from the commit.
    pub fn transaction<F, T>(&self, f: F) -> CoreResult<T>
    where
        F: FnOnce(&mut Transaction<'_>) -> CoreResult<T>,
    {
        let mut pager = self.inner.lock();
        let mut hook = self.hook.lock();
        let image = pager.begin_write()?;

        let mut txn = Transaction::new(image, hook.as_mut());
        let result = f(&mut txn);
        let (image, changes) = txn.into_parts();

        let outcome = match result {
            Ok(value) if changes > 0 => pager.commit(image).map(|()| value),
            other => other,
        };
        pager.end_write();
        outcome
    }

    /// Copies the WAL into the main file and empties it.
    /// Returns false if the WAL held nothing.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Busy`] if other connections hold the file.
    pub fn checkpoint(&self) -> CoreResult<bool> {
        self.inner.lock().checkpoint()
    }

    /// Captures the current read position.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be read.
    pub fn snapshot(&self) -> CoreResult<Snapshot> {
        let mut pager = self.inner.lock();
        pager.with_lock(LockLevel::Shared, |pager| {
            let (image, version) = pager.load(false)?;
            Ok(Snapshot::new(
                pager.entry.key().clone(),
                image.header.journal_mode(),
                version,
            ))
        })
    }

    /// Checks that `snapshot` still describes this database.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::SnapshotStale`] once the database has been
    /// truncated or replaced (or, in rollback mode, changed at all), and
    /// [`CoreError::InvalidArgument`] for a snapshot of another file.
    pub fn check_snapshot(&self, snapshot: &Snapshot) -> CoreResult<()> {
        let mut pager = self.inner.lock();
        if snapshot.key() != pager.entry.key() {
            return Err(CoreError::invalid_argument(
                "snapshot belongs to a different database file",
            ));
        }
        let current = pager.with_lock(LockLevel::Shared, |pager| pager.current_version())?;
        if snapshot.is_stale(&current) {
            return Err(CoreError::SnapshotStale);
        }
        Ok(())
    }

    /// Installs a callback run before each row change made through this
    /// connection, replacing any previous one.
    ///
    /// The callback must not use this connection.
    pub fn set_preupdate_hook<F>(&self, hook: F)
    where
        F: FnMut(&PreUpdateEvent<'_>) + Send + 'static,
    {
        *self.hook.lock() = Some(Box::new(hook));
    }

    /// Removes the pre-update callback.
    pub fn clear_preupdate_hook(&self) {
        *self.hook.lock() = None;
    }

    /// Returns true if a pre-update callback is installed.
    #[must_use]
    pub fn has_preupdate_hook(&self) -> bool {
        self.hook.lock().is_some()
    }

    /// Reports whether `filter` matches a process holding a lock on this
    /// database, reusing the connection's descriptor.
    #[must_use]
    pub fn lock_state(&self, filter: ProcessFilter) -> LockState {
        let entry = Arc::clone(&self.inner.lock().entry);
        probe::probe_entry(&entry, filter)
    }

    /// Truncates the database; `None` truncates to zero bytes.
    ///
    /// # Errors
    ///
    /// See [`TruncateError`].
    pub fn truncate(&self, options: Option<TruncateOptions>) -> Result<(), TruncateError> {
        let options = options.unwrap_or_default();
        reset::truncate(&mut self.inner.lock(), &options)
    }

    /// Replaces this database's content with `source`'s.
    ///
    /// # Errors
    ///
    /// See [`ReplaceError`].
    pub fn replace(&self, source: &Connection) -> Result<(), ReplaceError> {
        if std::ptr::eq(self, source) {
            return Err(ReplaceError::invalid_options(
                "a connection cannot replace itself",
            ));
        }
        let hooked = self.has_preupdate_hook();
        let (mut dest, mut src) = if self.id < source.id {
            let dest = self.inner.lock();
            (dest, source.inner.lock())
        } else {
            let src = source.inner.lock();
            (self.inner.lock(), src)
        };
        replace::replace(&mut dest, &mut src, hooked)
    }

    /// Runs a file-control command.
    ///
    /// # Errors
    ///
    /// Returns the truncate or replace error of the command.
    pub fn file_control(
        &self,
        command: FileControl<'_>,
    ) -> Result<FileControlOutcome, FileControlError> {
        match command {
            FileControl::TruncateDatabase(options) => {
                self.truncate(options)?;
                Ok(FileControlOutcome::Done)
            }
            FileControl::ReplaceDatabase(source) => {
                self.replace(source)?;
                Ok(FileControlOutcome::Done)
            }
            FileControl::LockStatePid(filter) => {
                Ok(FileControlOutcome::LockState(self.lock_state(filter)))
            }
        }
    }
}
