//! The 100-byte database header at the start of page 1.
//!
//! All multi-byte fields are big-endian.
//!
//! ```text
//! offset size  field
//!   0    16    "SQLite format 3\0"
//!  16     2    page size (1 means 65536)
//!  18     1    write version (1 rollback, 2 WAL)
//!  19     1    read version
//!  20     1    reserved bytes per page
//!  21     3    payload fractions 64 / 32 / 32
//!  24     4    file change counter
//!  28     4    database size in pages
//!  32     8    freelist trunk page, freelist page count
//!  40     4    schema cookie
//!  44     4    schema format number
//!  48     4    default page cache size
//!  52     4    largest root b-tree page (non-zero: auto-vacuum)
//!  56     4    text encoding (1 = UTF-8)
//!  60     4    user version
//!  64     4    incremental-vacuum flag
//!  68     4    application id
//!  72    20    reserved, zero
//!  92     4    version-valid-for
//!  96     4    library version number
//! ```

use crate::error::{CoreError, CoreResult};
use crate::types::{AutoVacuum, JournalMode};

/// Header signature.
pub const MAGIC: [u8; 16] = *b"SQLite format 3\0";

/// Size of the header in bytes.
pub const HEADER_SIZE: usize = 100;

/// Smallest legal page size.
pub const MIN_PAGE_SIZE: u32 = 512;

/// Largest legal page size.
pub const MAX_PAGE_SIZE: u32 = 65_536;

/// Schema format number written into new databases.
pub const SCHEMA_FORMAT: u32 = 4;

/// UTF-8 text encoding.
pub const TEXT_ENCODING_UTF8: u32 = 1;

/// Library version number stamped into headers this crate writes.
pub const LIBRARY_VERSION: u32 = 3_046_000;

/// Decoded database header.
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct DatabaseHeader {
    pub page_size: u32,
    pub write_version: u8,
    pub read_version: u8,
    pub reserved_bytes: u8,
    pub change_counter: u32,
    pub page_count: u32,
    pub freelist_trunk: u32,
    pub freelist_count: u32,
    pub schema_cookie: u32,
    pub schema_format: u32,
    pub default_cache_size: u32,
    pub largest_root_page: u32,
    pub text_encoding: u32,
    pub user_version: u32,
    pub incremental_vacuum: u32,
    pub application_id: u32,
    pub version_valid_for: u32,
    pub version_number: u32,
}

/// Returns true if `size` is a legal page size.
#[must_use]
pub fn is_valid_page_size(size: u32) -> bool {
    size.is_power_of_two() && (MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&size)
}

/// Returns true if `bytes` starts with the header signature.
#[must_use]
pub fn has_magic(bytes: &[u8]) -> bool {
    bytes.len() >= MAGIC.len() && bytes[..MAGIC.len()] == MAGIC
}

fn be32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

fn put32(bytes: &mut [u8], offset: usize, value: u32) {
    bytes[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
}

impl DatabaseHeader {
    /// Creates the header of an empty, one-page database.
    #[must_use]
    pub fn new(page_size: u32, journal_mode: JournalMode, auto_vacuum: AutoVacuum) -> Self {
        let mut header = Self {
            page_size,
            write_version: 1,
            read_version: 1,
            reserved_bytes: 0,
            change_counter: 1,
            page_count: 1,
            freelist_trunk: 0,
            freelist_count: 0,
            schema_cookie: 0,
            schema_format: SCHEMA_FORMAT,
            default_cache_size: 0,
            largest_root_page: 0,
            text_encoding: TEXT_ENCODING_UTF8,
            user_version: 0,
            incremental_vacuum: 0,
            application_id: 0,
            version_valid_for: 1,
            version_number: LIBRARY_VERSION,
        };
        header.set_journal_mode(journal_mode);
        header.set_auto_vacuum(auto_vacuum);
        header
    }

    /// Journal mode recorded in the version bytes.
    #[must_use]
    pub fn journal_mode(&self) -> JournalMode {
        JournalMode::from_format_version(self.write_version)
    }

    /// Records `mode` in the version bytes.
    pub fn set_journal_mode(&mut self, mode: JournalMode) {
        self.write_version = mode.format_version();
        self.read_version = mode.format_version();
    }

    /// Auto-vacuum policy.
    #[must_use]
    pub fn auto_vacuum(&self) -> AutoVacuum {
        match (self.largest_root_page, self.incremental_vacuum) {
            (0, _) => AutoVacuum::Off,
            (_, 0) => AutoVacuum::Full,
            _ => AutoVacuum::Incremental,
        }
    }

    /// Records the auto-vacuum policy.
    pub fn set_auto_vacuum(&mut self, mode: AutoVacuum) {
        let (root, incremental) = match mode {
            AutoVacuum::Off => (0, 0),
            AutoVacuum::Full => (1, 0),
            AutoVacuum::Incremental => (1, 1),
        };
        self.largest_root_page = root;
        self.incremental_vacuum = incremental;
    }

    /// Bytes per page available to b-tree content.
    #[must_use]
    pub fn usable_size(&self) -> usize {
        self.page_size as usize - usize::from(self.reserved_bytes)
    }

    /// Returns true if `page_count` can be trusted.
    #[must_use]
    pub fn page_count_is_valid(&self) -> bool {
        self.page_count > 0 && self.version_valid_for == self.change_counter
    }

    /// Database size in pages, falling back to the file length when the
    /// in-header count is stale.
    #[must_use]
    pub fn effective_page_count(&self, file_len: u64) -> u32 {
        if self.page_count_is_valid() {
            self.page_count
        } else {
            u32::try_from(file_len / u64::from(self.page_size)).unwrap_or(u32::MAX)
        }
    }

    /// Advances the change counter past both its current value and `floor`.
    pub fn bump_change_counter(&mut self, floor: u32) {
        let next = self.change_counter.max(floor).wrapping_add(1);
        self.change_counter = next;
        self.version_valid_for = next;
    }

    /// Serializes the header.
    #[must_use]
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[..16].copy_from_slice(&MAGIC);
        let raw_page_size: u16 = if self.page_size == MAX_PAGE_SIZE {
            1
        } else {
            u16::try_from(self.page_size).unwrap_or(1)
        };
        out[16..18].copy_from_slice(&raw_page_size.to_be_bytes());
        out[18] = self.write_version;
        out[19] = self.read_version;
        out[20] = self.reserved_bytes;
        out[21] = 64;
        out[22] = 32;
        out[23] = 32;
        put32(&mut out, 24, self.change_counter);
        put32(&mut out, 28, self.page_count);
        put32(&mut out, 32, self.freelist_trunk);
        put32(&mut out, 36, self.freelist_count);
        put32(&mut out, 40, self.schema_cookie);
        put32(&mut out, 44, self.schema_format);
        put32(&mut out, 48, self.default_cache_size);
        put32(&mut out, 52, self.largest_root_page);
        put32(&mut out, 56, self.text_encoding);
        put32(&mut out, 60, self.user_version);
        put32(&mut out, 64, self.incremental_vacuum);
        put32(&mut out, 68, self.application_id);
        put32(&mut out, 92, self.version_valid_for);
        put32(&mut out, 96, self.version_number);
        out
    }

    /// Parses a header.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Corrupt`] if the buffer is short, the signature is
    /// missing or the page size is illegal.
    pub fn decode(bytes: &[u8]) -> CoreResult<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(CoreError::corrupt(format!(
                "database header truncated: {} bytes",
                bytes.len()
            )));
        }
        if !has_magic(bytes) {
            return Err(CoreError::corrupt("database header signature missing"));
        }

        let raw_page_size = u16::from_be_bytes([bytes[16], bytes[17]]);
        let page_size = if raw_page_size == 1 {
            MAX_PAGE_SIZE
        } else {
            u32::from(raw_page_size)
        };
        if !is_valid_page_size(page_size) {
            return Err(CoreError::corrupt(format!("illegal page size {page_size}")));
        }

        Ok(Self {
            page_size,
            write_version: bytes[18],
            read_version: bytes[19],
            reserved_bytes: bytes[20],
            change_counter: be32(bytes, 24),
            page_count: be32(bytes, 28),
            freelist_trunk: be32(bytes, 32),
            freelist_count: be32(bytes, 36),
            schema_cookie: be32(bytes, 40),
            schema_format: be32(bytes, 44),
            default_cache_size: be32(bytes, 48),
            largest_root_page: be32(bytes, 52),
            text_encoding: be32(bytes, 56),
            user_version: be32(bytes, 60),
            incremental_vacuum: be32(bytes, 64),
            application_id: be32(bytes, 68),
            version_valid_for: be32(bytes, 92),
            version_number: be32(bytes, 96),
        })
    }
}

/// Reads the change counter straight from header bytes.
#[must_use]
pub fn change_counter(bytes: &[u8]) -> Option<u32> {
    (bytes.len() >= 28 && has_magic(bytes)).then(|| be32(bytes, 24))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_header_layout() {
        let header = DatabaseHeader::new(4096, JournalMode::Rollback, AutoVacuum::Off);
        let bytes = header.encode();

        assert!(has_magic(&bytes));
        assert_eq!(&bytes[16..18], &[0x10, 0x00]);
        assert_eq!((bytes[18], bytes[19]), (1, 1));
        assert_eq!(&bytes[21..24], &[64, 32, 32]);
        assert_eq!(be32(&bytes, 28), 1);
        assert_eq!(be32(&bytes, 44), SCHEMA_FORMAT);
        assert_eq!(be32(&bytes, 56), TEXT_ENCODING_UTF8);
        assert_eq!(be32(&bytes, 92), be32(&bytes, 24));
        assert_eq!(DatabaseHeader::decode(&bytes).unwrap(), header);
    }

    #[test]
    fn max_page_size_is_stored_as_one() {
        let header = DatabaseHeader::new(65_536, JournalMode::Wal, AutoVacuum::Incremental);
        let bytes = header.encode();
        assert_eq!(&bytes[16..18], &[0, 1]);
        assert_eq!((bytes[18], bytes[19]), (2, 2));

        let decoded = DatabaseHeader::decode(&bytes).unwrap();
        assert_eq!(decoded.page_size, 65_536);
        assert_eq!(decoded.journal_mode(), JournalMode::Wal);
        assert_eq!(decoded.auto_vacuum(), AutoVacuum::Incremental);
    }

    #[test]
    fn auto_vacuum_modes() {
        let mut header = DatabaseHeader::new(1024, JournalMode::Rollback, AutoVacuum::Full);
        assert_eq!(header.largest_root_page, 1);
        assert_eq!(header.auto_vacuum(), AutoVacuum::Full);
        header.set_auto_vacuum(AutoVacuum::Off);
        assert_eq!(header.auto_vacuum(), AutoVacuum::Off);
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(DatabaseHeader::decode(&[0u8; 40]).is_err());
        assert!(DatabaseHeader::decode(&[b'x'; 100]).is_err());

        let mut bytes = DatabaseHeader::new(4096, JournalMode::Rollback, AutoVacuum::Off).encode();
        bytes[16..18].copy_from_slice(&1000u16.to_be_bytes());
        assert!(DatabaseHeader::decode(&bytes).is_err());
    }

    #[test]
    fn stale_page_count_falls_back_to_length() {
        let mut header = DatabaseHeader::new(1024, JournalMode::Rollback, AutoVacuum::Off);
        header.page_count = 9;
        header.version_valid_for = 0;
        assert_eq!(header.effective_page_count(3 * 1024), 3);
    }

    #[test]
    fn bump_change_counter_passes_floor() {
        let mut header = DatabaseHeader::new(1024, JournalMode::Rollback, AutoVacuum::Off);
        header.bump_change_counter(10);
        assert_eq!(header.change_counter, 11);
        assert_eq!(header.version_valid_for, 11);
        header.bump_change_counter(0);
        assert_eq!(header.change_counter, 12);
    }
}
