//! Test fixtures and database helpers.
//!
//! [`TestDatabase`] is a connection to a file in its own temporary
//! directory. The free functions lay out raw files next to a database so
//! tests can start from a hot journal, a WAL or a shared-memory index
//! without going through a connection.

use sqlfile_core::files::{journal_path, shm_path, wal_path};
use sqlfile_core::format::{journal, shm, wal};
use sqlfile_core::{
    AutoVacuum, Config, Connection, DatabaseFileSet, DatabaseHeader, Image, JournalMode, RowId,
};
use sqlfile_storage::{FileBackend, StorageBackend};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// File name used for the main database inside the temporary directory.
pub const DB_NAME: &str = "test.db";

/// Size of a shared-memory file written by [`write_shm`].
pub const SHM_FIXTURE_SIZE: usize = 32 * 1024;

/// Byte the shared-memory header is filled with by [`write_shm`].
pub const SHM_FIXTURE_BYTE: u8 = 0xA5;

/// A test database with automatic cleanup.
pub struct TestDatabase {
    /// The connection.
    pub conn: Connection,
    path: PathBuf,
    /// Kept alive to prevent cleanup.
    temp_dir: TempDir,
}

impl TestDatabase {
    /// Creates an empty database with the default configuration.
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    /// Creates an empty database that initializes at `page_size`.
    pub fn with_page_size(page_size: u32) -> Self {
        Self::with_config(Config::default().page_size(page_size))
    }

    /// Creates an empty database with a custom configuration.
    pub fn with_config(config: Config) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let path = temp_dir.path().join(DB_NAME);
        let conn = Connection::open_with_config(&path, config).expect("Failed to open database");
        Self {
            conn,
            path,
            temp_dir,
        }
    }

    /// Creates a database at `page_size` holding `rows` rows written by
    /// [`insert_rows`].
    pub fn populated(page_size: u32, rows: usize) -> Self {
        let db = Self::with_page_size(page_size);
        insert_rows(&db.conn, rows);
        db
    }

    /// Creates a database whose main file is exactly `pages` pages long.
    ///
    /// The file is written directly, before the connection opens it.
    pub fn with_pages(page_size: u32, pages: u32, journal_mode: JournalMode) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let path = temp_dir.path().join(DB_NAME);
        write_database(&path, &image_with_pages(page_size, pages, journal_mode));
        let conn = Connection::open(&path).expect("Failed to open database");
        Self {
            conn,
            path,
            temp_dir,
        }
    }

    /// Main database path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of another file in the same temporary directory.
    pub fn sibling(&self, name: &str) -> PathBuf {
        self.temp_dir.path().join(name)
    }

    /// Opens a second connection to the same file.
    pub fn open_another(&self) -> Connection {
        Connection::open(&self.path).expect("Failed to open second connection")
    }

    /// Files that currently exist for this database.
    pub fn files(&self) -> DatabaseFileSet {
        DatabaseFileSet::discover(&self.path)
    }

    /// Length of the main file in bytes.
    pub fn main_len(&self) -> u64 {
        file_len(&self.path)
    }
}

impl Default for TestDatabase {
    fn default() -> Self {
        Self::new()
    }
}

impl std::ops::Deref for TestDatabase {
    type Target = Connection;

    fn deref(&self) -> &Self::Target {
        &self.conn
    }
}

/// Deterministic payload for row number `i`.
pub fn row_payload(i: usize) -> Vec<u8> {
    let len = 16 + (i * 37) % 200;
    (0..len).map(|j| (i.wrapping_mul(31) ^ j) as u8).collect()
}

/// Inserts `count` rows of [`row_payload`] in one transaction.
pub fn insert_rows(conn: &Connection, count: usize) -> Vec<RowId> {
    conn.transaction(|tx| {
        (0..count)
            .map(|i| tx.insert(row_payload(i)))
            .collect::<Result<Vec<_>, _>>()
    })
    .expect("Failed to insert rows")
}

/// Builds an image that renders to exactly `pages` pages.
///
/// Every row after page 1 is as large as a page allows, so each one takes
/// a page of its own.
pub fn image_with_pages(page_size: u32, pages: u32, journal_mode: JournalMode) -> Image {
    assert!(pages >= 1, "a database has at least one page");
    let mut image = Image::empty(page_size, journal_mode, AutoVacuum::Off);
    let max = image.max_payload();
    for rowid in 1..i64::from(pages) {
        image.rows.insert(rowid, vec![rowid as u8; max]);
    }
    let rendered = image.clone().render().expect("Failed to render image");
    assert_eq!(rendered.len(), pages as usize, "rows did not map one per page");
    image
}

/// Writes `image` as a complete main database file.
pub fn write_database(path: &Path, image: &Image) {
    let pages = image.clone().render().expect("Failed to render image");
    fs::write(path, pages.concat()).expect("Failed to write database");
}

/// Writes a hot rollback journal holding the current pages of `db`.
///
/// Rolling it back leaves the database unchanged, so its only effect is
/// to be present.
pub fn write_current_journal(db: &Path) -> PathBuf {
    let bytes = fs::read(db).expect("Failed to read database");
    let header = DatabaseHeader::decode(&bytes).expect("Failed to decode header");
    let page_size = header.page_size as usize;
    let pages: Vec<(u32, &[u8])> = bytes
        .chunks(page_size)
        .enumerate()
        .map(|(i, page)| (i as u32 + 1, page))
        .collect();
    let journal = journal::encode(0x5eed_5eed, pages.len() as u32, header.page_size, &pages);
    let path = journal_path(db);
    fs::write(&path, journal).expect("Failed to write journal");
    path
}

/// Writes a WAL next to `db` with one commit of `frames`.
pub fn write_wal(db: &Path, page_size: u32, frames: &[(u32, &[u8])], db_size: u32) -> PathBuf {
    let path = wal_path(db);
    let mut backend = FileBackend::open(&path).expect("Failed to open WAL");
    wal::append_commit(&mut backend, None, page_size, frames, db_size, [0x1111, 0x2222])
        .expect("Failed to write WAL");
    backend.sync().expect("Failed to sync WAL");
    path
}

/// Writes a shared-memory file next to `db` whose header is filled with
/// [`SHM_FIXTURE_BYTE`].
pub fn write_shm(db: &Path) -> PathBuf {
    let mut bytes = vec![0u8; SHM_FIXTURE_SIZE];
    bytes[..shm::HEADER_SIZE].fill(SHM_FIXTURE_BYTE);
    let path = shm_path(db);
    fs::write(&path, bytes).expect("Failed to write shm");
    path
}

/// Header region of the shared-memory file next to `db`.
pub fn shm_header(db: &Path) -> Vec<u8> {
    let bytes = fs::read(shm_path(db)).expect("Failed to read shm");
    bytes[..shm::HEADER_SIZE.min(bytes.len())].to_vec()
}

/// Length of a file, or 0 if it does not exist.
pub fn file_len(path: &Path) -> u64 {
    fs::metadata(path).map_or(0, |m| m.len())
}
