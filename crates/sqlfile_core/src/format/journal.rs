//! Rollback journal (`<db>-journal`).
//!
//! ```text
//! sector 0:  magic (8) | record count (4) | checksum nonce (4)
//!            | original page count (4) | sector size (4) | page size (4)
//!            zero padding to the sector size
//! records:   page number (4) | page image | checksum (4)
//! ```
//!
//! A record's checksum is the nonce plus every 200th byte of the page,
//! walking down from `page_size - 200`. The first record with a bad checksum
//! ends the journal.

use crate::error::CoreResult;
use crate::format::header::is_valid_page_size;
use sqlfile_storage::StorageBackend;
use tracing::debug;

/// Journal signature.
pub const JOURNAL_MAGIC: [u8; 8] = [0xd9, 0xd5, 0x05, 0xf9, 0x20, 0xa1, 0x63, 0xd7];

/// Bytes of meaningful header data.
pub const JOURNAL_HEADER_SIZE: usize = 28;

/// Sector size written into new journals.
pub const DEFAULT_SECTOR_SIZE: u32 = 512;

const COUNT_FROM_FILE_SIZE: u32 = 0xffff_ffff;

/// Journal header fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JournalHeader {
    /// Number of page records.
    pub record_count: u32,
    /// Random checksum seed.
    pub nonce: u32,
    /// Database size in pages before the transaction.
    pub original_page_count: u32,
    /// Sector size; the header occupies one sector.
    pub sector_size: u32,
    /// Database page size.
    pub page_size: u32,
}

/// A decoded journal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Journal {
    /// Header.
    pub header: JournalHeader,
    /// Valid `(page number, pre-image)` records in file order.
    pub records: Vec<(u32, Vec<u8>)>,
}

/// Record checksum.
#[must_use]
pub fn checksum(nonce: u32, page: &[u8]) -> u32 {
    let mut sum = nonce;
    let mut i = page.len().saturating_sub(200);
    while i > 0 {
        sum = sum.wrapping_add(u32::from(page[i]));
        i = i.saturating_sub(200);
    }
    sum
}

/// Returns true if `bytes` begins with the journal signature.
#[must_use]
pub fn has_magic(bytes: &[u8]) -> bool {
    bytes.len() >= JOURNAL_MAGIC.len() && bytes[..JOURNAL_MAGIC.len()] == JOURNAL_MAGIC
}

fn be32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

impl JournalHeader {
    /// Serializes the header, padded to one sector.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.sector_size as usize];
        out[..8].copy_from_slice(&JOURNAL_MAGIC);
        out[8..12].copy_from_slice(&self.record_count.to_be_bytes());
        out[12..16].copy_from_slice(&self.nonce.to_be_bytes());
        out[16..20].copy_from_slice(&self.original_page_count.to_be_bytes());
        out[20..24].copy_from_slice(&self.sector_size.to_be_bytes());
        out[24..28].copy_from_slice(&self.page_size.to_be_bytes());
        out
    }

    /// Parses a header, or returns `None` if the bytes are not a usable one.
    #[must_use]
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < JOURNAL_HEADER_SIZE || !has_magic(bytes) {
            return None;
        }
        let header = Self {
            record_count: be32(bytes, 8),
            nonce: be32(bytes, 12),
            original_page_count: be32(bytes, 16),
            sector_size: be32(bytes, 20),
            page_size: be32(bytes, 24),
        };
        let sector_ok = header.sector_size.is_power_of_two()
            && (32..=65_536).contains(&header.sector_size);
        (sector_ok && is_valid_page_size(header.page_size)).then_some(header)
    }

    fn record_size(&self) -> u64 {
        u64::from(self.page_size) + 8
    }
}

/// Serializes a complete journal.
#[must_use]
pub fn encode(
    nonce: u32,
    original_page_count: u32,
    page_size: u32,
    records: &[(u32, &[u8])],
) -> Vec<u8> {
    let header = JournalHeader {
        record_count: u32::try_from(records.len()).unwrap_or(COUNT_FROM_FILE_SIZE),
        nonce,
        original_page_count,
        sector_size: DEFAULT_SECTOR_SIZE,
        page_size,
    };
    let mut out = header.encode();
    out.reserve(records.len() * (page_size as usize + 8));
    for (pgno, page) in records {
        out.extend_from_slice(&pgno.to_be_bytes());
        out.extend_from_slice(page);
        out.extend_from_slice(&checksum(nonce, page).to_be_bytes());
    }
    out
}

/// Reads a journal.
///
/// Returns `Ok(None)` when the store is empty or not a journal.
///
/// # Errors
///
/// Returns an error if the store cannot be read.
pub fn read(backend: &dyn StorageBackend) -> CoreResult<Option<Journal>> {
    let size = backend.size()?;
    if size < JOURNAL_HEADER_SIZE as u64 {
        return Ok(None);
    }
    let Some(header) = JournalHeader::decode(&backend.read_at(0, JOURNAL_HEADER_SIZE)?) else {
        debug!("journal header unusable, ignoring journal");
        return Ok(None);
    };

    let first = u64::from(header.sector_size);
    let record_size = header.record_size();
    let available = size.saturating_sub(first) / record_size;
    let count = if header.record_count == COUNT_FROM_FILE_SIZE {
        available
    } else {
        u64::from(header.record_count).min(available)
    };

    let page_size = header.page_size as usize;
    let mut records = Vec::with_capacity(count as usize);
    for i in 0..count {
        let raw = backend.read_at(first + i * record_size, record_size as usize)?;
        let pgno = be32(&raw, 0);
        let page = &raw[4..4 + page_size];
        let stored = be32(&raw, 4 + page_size);
        if pgno == 0 || stored != checksum(header.nonce, page) {
            debug!(record = i, "journal ends at torn record");
            break;
        }
        records.push((pgno, page.to_vec()));
    }

    Ok(Some(Journal { header, records }))
}
