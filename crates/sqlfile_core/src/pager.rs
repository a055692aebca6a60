//! Page-level access to one database on behalf of one connection.
//!
//! The pager owns the connection's lock handle and page cache. It reads
//! the database as an [`Image`], overlaying committed WAL frames on the
//! main file, and commits images back either through a rollback journal or
//! by appending to the WAL, depending on the journal mode in the header.
//!
//! A rollback-mode commit runs in this order:
//!
//! 1. climb to EXCLUSIVE
//! 2. write the pre-image of every page about to change to `<db>-journal`
//!    and sync it
//! 3. write the new pages, cut the main file to size, sync
//! 4. delete the journal
//!
//! A crash anywhere before step 4 leaves a hot journal, which the next
//! reader rolls back before trusting the main file.

use crate::busy::BusyHandler;
use crate::cache::PageCache;
use crate::config::Config;
use crate::error::{CoreError, CoreResult};
use crate::files::{self, DatabaseFileSet};
use crate::format::header::{self, DatabaseHeader, HEADER_SIZE};
use crate::format::wal::WalIndex;
use crate::format::{journal, shm, wal};
use crate::image::Image;
use crate::inode::{self, InodeEntry};
use crate::lock::{LockHandle, LockLevel};
use crate::snapshot::{FileVersion, WalMark};
use crate::types::{AutoVacuum, JournalMode};
use sqlfile_storage::{FileBackend, StorageBackend};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// What the files say at one moment.
struct View {
    main: FileBackend,
    main_len: u64,
    main_header: Option<DatabaseHeader>,
    wal: Option<(FileBackend, WalIndex)>,
}

impl View {
    fn committed_wal(&self) -> Option<&(FileBackend, WalIndex)> {
        self.wal.as_ref().filter(|(_, index)| index.has_commits())
    }
}

pub(crate) struct Pager {
    path: PathBuf,
    pub(crate) entry: Arc<InodeEntry>,
    pub(crate) lock: LockHandle,
    pub(crate) cache: Arc<PageCache>,
    pub(crate) config: Config,
    pub(crate) busy: Arc<dyn BusyHandler>,
    cache_version: Option<FileVersion>,
}

impl fmt::Debug for Pager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pager")
            .field("path", &self.path)
            .field("lock", &self.lock.level())
            .field("cached_pages", &self.cache.len())
            .finish_non_exhaustive()
    }
}

impl Pager {
    pub(crate) fn open(path: &Path, config: Config, busy: Arc<dyn BusyHandler>) -> CoreResult<Self> {
        config.validate()?;
        let entry = inode::open(path, config.create_if_missing && !config.read_only)?;
        let pager = Self {
            path: path.to_path_buf(),
            lock: LockHandle::new(Arc::clone(&entry)),
            entry,
            cache: PageCache::new(config.cache_capacity),
            config,
            busy,
            cache_version: None,
        };

        let main = pager.main();
        let len = main.size()?;
        if len > 0 {
            let prefix = main.read_at(0, len.min(header::MAGIC.len() as u64) as usize)?;
            if !header::has_magic(&prefix) {
                return Err(CoreError::not_a_database(path));
            }
        }
        Ok(pager)
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn is_read_only(&self) -> bool {
        self.config.read_only || !self.entry.is_writable()
    }

    pub(crate) fn files(&self) -> DatabaseFileSet {
        DatabaseFileSet::discover(&self.path)
    }

    pub(crate) fn main(&self) -> FileBackend {
        FileBackend::from_shared(&self.path, Arc::clone(self.entry.file()), self.is_read_only())
    }

    fn open_aux(&self, path: &Path) -> CoreResult<Option<FileBackend>> {
        if !path.is_file() {
            return Ok(None);
        }
        Ok(Some(FileBackend::open_existing(path, self.is_read_only())?))
    }

    fn create_aux(&self, path: &Path) -> CoreResult<FileBackend> {
        if self.is_read_only() {
            return Err(CoreError::ReadOnly);
        }
        Ok(FileBackend::open(path)?)
    }

    pub(crate) fn acquire(&mut self, target: LockLevel) -> CoreResult<()> {
        self.lock.lock(target, &*self.busy, self.config.busy_timeout)
    }

    /// Runs `f` holding at least `target`, then returns to the prior level.
    pub(crate) fn with_lock<T>(
        &mut self,
        target: LockLevel,
        f: impl FnOnce(&mut Self) -> CoreResult<T>,
    ) -> CoreResult<T> {
        let prev = self.lock.level();
        self.acquire(target)?;
        let result = f(self);
        let restored = self.lock.unlock(prev);
        let value = result?;
        restored?;
        Ok(value)
    }

    /// Forgets everything cached about the files.
    pub(crate) fn invalidate(&mut self) {
        self.cache.clear();
        self.cache_version = None;
    }

    fn view(&self) -> CoreResult<View> {
        let main = self.main();
        let main_len = main.size()?;
        let main_header = if main_len == 0 {
            None
        } else {
            if main_len < HEADER_SIZE as u64 {
                if !header::has_magic(&main.read_at(0, main_len as usize)?) {
                    return Err(CoreError::not_a_database(&self.path));
                }
                return Err(CoreError::corrupt(format!(
                    "main file is {main_len} bytes, shorter than its header"
                )));
            }
            let bytes = main.read_at(0, HEADER_SIZE)?;
            if !header::has_magic(&bytes) {
                return Err(CoreError::not_a_database(&self.path));
            }
            Some(DatabaseHeader::decode(&bytes)?)
        };

        let wal = match self.open_aux(&files::wal_path(&self.path))? {
            Some(backend) => wal::scan(&backend)?
                .filter(|index| {
                    main_header
                        .as_ref()
                        .map_or(true, |h| h.page_size == index.header.page_size)
                })
                .map(|index| (backend, index)),
            None => None,
        };

        Ok(View {
            main,
            main_len,
            main_header,
            wal,
        })
    }

    fn version_of(&self, view: &View) -> FileVersion {
        FileVersion {
            generation: self.entry.generation(),
            reset_epoch: self.entry.reset_epoch(),
            change_counter: view.main_header.as_ref().map_or(0, |h| h.change_counter),
            main_len: view.main_len,
            wal: view.wal.as_ref().map(|(_, index)| WalMark {
                salt: index.header.salt,
                frames: index.frame_count,
            }),
        }
    }

    fn default_header(&self) -> DatabaseHeader {
        DatabaseHeader::new(self.config.page_size, self.config.journal_mode, AutoVacuum::Off)
    }

    fn visible_header(&self, view: &View) -> CoreResult<DatabaseHeader> {
        if let Some((backend, index)) = view.committed_wal() {
            if let Some(page) = wal::read_page(backend, index, 1)? {
                return DatabaseHeader::decode(&page);
            }
        }
        Ok(view
            .main_header
            .clone()
            .unwrap_or_else(|| self.default_header()))
    }

    /// Header as stored in the main file, if it has a valid one.
    pub(crate) fn stored_header(&self) -> Option<DatabaseHeader> {
        let main = self.main();
        let bytes = main.read_at(0, HEADER_SIZE).ok()?;
        DatabaseHeader::decode(&bytes).ok()
    }

    /// Stamp of the files as they are now. Requires at least SHARED to be
    /// meaningful.
    pub(crate) fn current_version(&self) -> CoreResult<FileVersion> {
        let view = self.view()?;
        Ok(self.version_of(&view))
    }

    fn journal_has_magic(&self) -> CoreResult<bool> {
        let path = files::journal_path(&self.path);
        let Some(backend) = self.open_aux(&path)? else {
            return Ok(false);
        };
        let len = backend.size()?.min(journal::JOURNAL_MAGIC.len() as u64);
        Ok(journal::has_magic(&backend.read_at(0, len as usize)?))
    }

    fn hot_journal(&self) -> CoreResult<bool> {
        Ok(self.journal_has_magic()? && !self.lock.reserved_elsewhere()?)
    }

    fn roll_back_journal(&mut self) -> CoreResult<()> {
        let path = files::journal_path(&self.path);
        if let Some(backend) = self.open_aux(&path)? {
            if let Some(journal) = journal::read(&backend)? {
                let page_size = u64::from(journal.header.page_size);
                let original = journal.header.original_page_count;
                let mut main = self.main();
                for (pgno, page) in &journal.records {
                    if *pgno <= original {
                        main.write_at(u64::from(pgno - 1) * page_size, page)?;
                    }
                }
                main.truncate(u64::from(original) * page_size)?;
                main.sync()?;
                info!(
                    path = %self.path.display(),
                    records = journal.records.len(),
                    pages = original,
                    "rolled back hot journal"
                );
            }
        }
        fs::remove_file(&path)?;
        self.invalidate();
        Ok(())
    }

    fn recover(&mut self) -> CoreResult<()> {
        self.with_lock(LockLevel::Exclusive, |pager| {
            if pager.journal_has_magic()? {
                pager.roll_back_journal()?;
            }
            Ok(())
        })
    }

    fn read_page(&self, view: &View, pgno: u32, page_size: u32, pin: bool) -> CoreResult<Arc<[u8]>> {
        if let Some(page) = self.cache.get(pgno) {
            if pin {
                self.cache.insert(pgno, Arc::clone(&page), true);
            }
            return Ok(page);
        }

        let from_wal = match view.committed_wal() {
            Some((backend, index)) => wal::read_page(backend, index, pgno)?,
            None => None,
        };
        let data = match from_wal {
            Some(data) => data,
            None => {
                let offset = u64::from(pgno - 1) * u64::from(page_size);
                if offset + u64::from(page_size) > view.main_len {
                    return Err(CoreError::corrupt(format!(
                        "page {pgno} lies past the end of the main file"
                    )));
                }
                view.main.read_at(offset, page_size as usize)?
            }
        };
        let data: Arc<[u8]> = Arc::from(data);
        self.cache.insert(pgno, Arc::clone(&data), pin);
        Ok(data)
    }

    /// Reads the whole database. Requires at least SHARED.
    ///
    /// A hot journal is rolled back first. With `pin`, every page read
    /// stays pinned in the cache until [`Self::end_write`].
    pub(crate) fn load(&mut self, pin: bool) -> CoreResult<(Image, FileVersion)> {
        debug_assert!(self.lock.level() >= LockLevel::Shared);
        if self.hot_journal()? {
            self.recover()?;
        }

        let view = self.view()?;
        let version = self.version_of(&view);
        if self.cache_version != Some(version) {
            self.cache.clear();
            self.cache_version = Some(version);
        }

        let header = self.visible_header(&view)?;
        let page_count = match view.committed_wal() {
            Some((_, index)) => index.db_size,
            None if view.main_len == 0 => 1,
            None => header.effective_page_count(view.main_len),
        };

        let mut image = Image::with_header(header);
        for pgno in 2..=page_count {
            let page = self.read_page(&view, pgno, image.header.page_size, pin)?;
            image.absorb_page(&page)?;
        }
        Ok((image, version))
    }

    /// Reads the whole database under a temporary SHARED lock.
    pub(crate) fn read_image(&mut self) -> CoreResult<Image> {
        self.with_lock(LockLevel::Shared, |pager| Ok(pager.load(false)?.0))
    }

    /// Header a reader would see now.
    pub(crate) fn header(&mut self) -> CoreResult<DatabaseHeader> {
        self.with_lock(LockLevel::Shared, |pager| {
            if pager.hot_journal()? {
                pager.recover()?;
            }
            let view = pager.view()?;
            pager.visible_header(&view)
        })
    }

    /// Starts a write transaction: SHARED, read with pins, then RESERVED.
    pub(crate) fn begin_write(&mut self) -> CoreResult<Image> {
        if self.is_read_only() {
            return Err(CoreError::ReadOnly);
        }
        self.acquire(LockLevel::Shared)?;
        let loaded = match self.load(true) {
            Ok((image, _)) => self.acquire(LockLevel::Reserved).map(|()| image),
            Err(e) => Err(e),
        };
        if loaded.is_err() {
            self.end_write();
        }
        loaded
    }

    /// Ends a write transaction, committed or not.
    pub(crate) fn end_write(&mut self) {
        self.cache.unpin_all();
        if let Err(e) = self.lock.unlock(LockLevel::None) {
            debug!(path = %self.path.display(), error = %e, "unlock after write failed");
        }
    }

    /// Commits `image`. Requires RESERVED; climbs to EXCLUSIVE.
    pub(crate) fn commit(&mut self, mut image: Image) -> CoreResult<()> {
        debug_assert!(self.lock.level() >= LockLevel::Reserved);
        self.acquire(LockLevel::Exclusive)?;

        let mut view = self.view()?;
        let stored_counter = view.main_header.as_ref().map_or(0, |h| h.change_counter);
        image.header.bump_change_counter(stored_counter);

        match image.header.journal_mode() {
            JournalMode::Rollback => {
                if view.committed_wal().is_some() {
                    self.checkpoint_into_main()?;
                    self.truncate_wal()?;
                    view = self.view()?;
                }
                let pages = image.render()?;
                self.write_journal(&view, &pages)?;
                self.write_main(&pages)?;
                self.remove_journal()?;
            }
            JournalMode::Wal => {
                let pages = image.render()?;
                self.append_to_wal(view, &pages)?;
            }
        }

        self.entry.bump_generation();
        self.invalidate();
        debug!(
            path = %self.path.display(),
            pages = image.header.page_count,
            rows = image.rows.len(),
            change_counter = image.header.change_counter,
            "committed"
        );
        Ok(())
    }

    fn append_to_wal(&mut self, view: View, pages: &[Vec<u8>]) -> CoreResult<()> {
        let page_size = pages.first().map_or(self.config.page_size, |p| p.len() as u32);
        let mut frames: Vec<(u32, &[u8])> = Vec::with_capacity(pages.len());
        for (i, page) in pages.iter().enumerate() {
            let pgno = i as u32 + 1;
            let unchanged = pgno > 1 && self.visible_page(&view, pgno, page_size)?.as_deref() == Some(page.as_slice());
            if !unchanged {
                frames.push((pgno, page.as_slice()));
            }
        }
        let db_size = pages.len() as u32;

        let (mut backend, existing) = match view.wal {
            Some((backend, index)) => (backend, Some(index)),
            None => (self.create_aux(&files::wal_path(&self.path))?, None),
        };
        wal::append_commit(
            &mut backend,
            existing.as_ref(),
            page_size,
            &frames,
            db_size,
            rand::random(),
        )?;
        if self.config.sync_on_commit {
            backend.sync()?;
        }
        Ok(())
    }

    fn visible_page(&self, view: &View, pgno: u32, page_size: u32) -> CoreResult<Option<Vec<u8>>> {
        if let Some((backend, index)) = view.committed_wal() {
            if pgno > index.db_size {
                return Ok(None);
            }
            if let Some(page) = wal::read_page(backend, index, pgno)? {
                return Ok(Some(page));
            }
        }
        let offset = u64::from(pgno - 1) * u64::from(page_size);
        if offset + u64::from(page_size) > view.main_len {
            return Ok(None);
        }
        Ok(Some(view.main.read_at(offset, page_size as usize)?))
    }

    /// Writes the pre-image of every main-file page that writing `pages`
    /// would change or cut off, and syncs the journal. Requires EXCLUSIVE.
    fn write_journal(&self, view: &View, pages: &[Vec<u8>]) -> CoreResult<()> {
        let old_size = view
            .main_header
            .as_ref()
            .map_or(self.config.page_size, |h| h.page_size);
        let old_count = u32::try_from(view.main_len / u64::from(old_size))
            .map_err(|_| CoreError::corrupt("main file too large"))?;
        let same_size = pages.first().map_or(false, |p| p.len() == old_size as usize);

        let mut records = Vec::new();
        for pgno in 1..=old_count {
            let old = view
                .main
                .read_at(u64::from(pgno - 1) * u64::from(old_size), old_size as usize)?;
            let keep = same_size && pages.get(pgno as usize - 1) == Some(&old);
            if !keep {
                records.push((pgno, old));
            }
        }
        let borrowed: Vec<(u32, &[u8])> = records.iter().map(|(p, d)| (*p, d.as_slice())).collect();
        let bytes = journal::encode(rand::random(), old_count, old_size, &borrowed);

        let mut backend = self.create_aux(&files::journal_path(&self.path))?;
        backend.truncate(0)?;
        backend.write_at(0, &bytes)?;
        if self.config.sync_on_commit {
            backend.sync()?;
        }
        debug!(path = %self.path.display(), records = records.len(), "journal written");
        Ok(())
    }

    /// Journals the current main file against `pages`. Requires EXCLUSIVE.
    pub(crate) fn journal_current(&self, pages: &[Vec<u8>]) -> CoreResult<()> {
        let view = self.view()?;
        self.write_journal(&view, pages)
    }

    /// Writes `pages` from the start of the main file and cuts it to fit.
    /// Requires EXCLUSIVE.
    pub(crate) fn write_main(&self, pages: &[Vec<u8>]) -> CoreResult<()> {
        let mut main = self.main();
        let mut offset = 0u64;
        for page in pages {
            main.write_at(offset, page)?;
            offset += page.len() as u64;
        }
        main.truncate(offset)?;
        if self.config.sync_on_commit {
            main.sync()?;
        }
        Ok(())
    }

    /// Deletes the rollback journal. Returns false if there was none.
    pub(crate) fn remove_journal(&self) -> CoreResult<bool> {
        match fs::remove_file(files::journal_path(&self.path)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Copies committed WAL frames into the main file and syncs it.
    /// Returns false if the WAL held no commits. Requires EXCLUSIVE.
    pub(crate) fn checkpoint_into_main(&mut self) -> CoreResult<bool> {
        let view = self.view()?;
        let Some((backend, index)) = view.committed_wal() else {
            return Ok(false);
        };
        let page_size = u64::from(index.header.page_size);
        let mut pgnos: Vec<u32> = index
            .pages
            .keys()
            .copied()
            .filter(|pgno| *pgno <= index.db_size)
            .collect();
        pgnos.sort_unstable();

        let mut main = self.main();
        for pgno in &pgnos {
            let page = wal::read_page(backend, index, *pgno)?
                .ok_or_else(|| CoreError::corrupt(format!("WAL lost page {pgno}")))?;
            main.write_at(u64::from(pgno - 1) * page_size, &page)?;
        }
        main.truncate(u64::from(index.db_size) * page_size)?;
        main.sync()?;
        debug!(path = %self.path.display(), pages = pgnos.len(), "checkpointed WAL");
        self.invalidate();
        Ok(true)
    }

    /// Cuts the WAL to zero length. Returns false if there was none.
    pub(crate) fn truncate_wal(&mut self) -> CoreResult<bool> {
        match self.open_aux(&files::wal_path(&self.path))? {
            Some(mut backend) => {
                backend.truncate(0)?;
                backend.sync()?;
                self.invalidate();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Makes every cached WAL-index header in other connections stale.
    /// Returns false if there is no shared-memory file.
    pub(crate) fn scramble_shm(&self) -> CoreResult<bool> {
        match self.open_aux(&files::shm_path(&self.path))? {
            Some(mut backend) => {
                shm::scramble(&mut backend)?;
                backend.sync()?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Copies the WAL into the main file and empties the WAL.
    pub(crate) fn checkpoint(&mut self) -> CoreResult<bool> {
        if self.is_read_only() {
            return Err(CoreError::ReadOnly);
        }
        self.with_lock(LockLevel::Exclusive, |pager| {
            let copied = pager.checkpoint_into_main()?;
            pager.truncate_wal()?;
            if copied {
                pager.entry.bump_generation();
            }
            Ok(copied)
        })
    }
}
