//! Write-ahead log (`<db>-wal`).
//!
//! ```text
//! header (32 bytes, big-endian fields):
//!    0 magic (0x377f0682: little-endian checksums, 0x377f0683: big-endian)
//!    4 format version 3007000
//!    8 page size
//!   12 checkpoint sequence
//!   16 salt-1, salt-2
//!   24 checksum-1, checksum-2 over bytes 0..24
//! frame (24-byte header + page):
//!    0 page number
//!    4 database size in pages after commit, 0 for non-commit frames
//!    8 salt-1, salt-2 copied from the header
//!   16 checksum-1, checksum-2
//! ```
//!
//! Frame checksums are cumulative: each continues from the previous frame's
//! (the first from the header's) over the first 8 bytes of the frame header
//! followed by the page. A frame whose salts or checksum do not match ends
//! the log, and only frames up to the last commit frame are visible.

use crate::error::CoreResult;
use crate::format::header::is_valid_page_size;
use sqlfile_storage::StorageBackend;
use std::collections::HashMap;

/// Size of the WAL header.
pub const WAL_HEADER_SIZE: usize = 32;

/// Size of a frame header.
pub const FRAME_HEADER_SIZE: usize = 24;

/// Magic for logs with little-endian checksum words.
pub const WAL_MAGIC_LE: u32 = 0x377f_0682;

/// Magic for logs with big-endian checksum words.
pub const WAL_MAGIC_BE: u32 = 0x377f_0683;

/// WAL format version.
pub const WAL_VERSION: u32 = 3_007_000;

fn be32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

/// Rolling checksum over `data`, which must be a multiple of 8 bytes long.
#[must_use]
pub fn checksum(big_endian: bool, data: &[u8], seed: [u32; 2]) -> [u32; 2] {
    let [mut s1, mut s2] = seed;
    for chunk in data.chunks_exact(8) {
        let (a, b) = if big_endian {
            (be32(chunk, 0), be32(chunk, 4))
        } else {
            (
                u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]),
                u32::from_le_bytes([chunk[4], chunk[5], chunk[6], chunk[7]]),
            )
        };
        s1 = s1.wrapping_add(a).wrapping_add(s2);
        s2 = s2.wrapping_add(b).wrapping_add(s1);
    }
    [s1, s2]
}

/// WAL header fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalHeader {
    /// Checksum word order.
    pub big_endian: bool,
    /// Database page size.
    pub page_size: u32,
    /// Checkpoint sequence number.
    pub checkpoint_seq: u32,
    /// Salts every frame must repeat.
    pub salt: [u32; 2],
    /// Header checksum.
    pub checksum: [u32; 2],
}

impl WalHeader {
    /// Creates a header with big-endian checksums.
    #[must_use]
    pub fn new(page_size: u32, checkpoint_seq: u32, salt: [u32; 2]) -> Self {
        let mut header = Self {
            big_endian: true,
            page_size,
            checkpoint_seq,
            salt,
            checksum: [0, 0],
        };
        let bytes = header.encode();
        header.checksum = checksum(true, &bytes[..24], [0, 0]);
        header
    }

    /// Serializes the header.
    #[must_use]
    pub fn encode(&self) -> [u8; WAL_HEADER_SIZE] {
        let magic = if self.big_endian {
            WAL_MAGIC_BE
        } else {
            WAL_MAGIC_LE
        };
        let mut out = [0u8; WAL_HEADER_SIZE];
        for (i, word) in [
            magic,
            WAL_VERSION,
            self.page_size,
            self.checkpoint_seq,
            self.salt[0],
            self.salt[1],
            self.checksum[0],
            self.checksum[1],
        ]
        .into_iter()
        .enumerate()
        {
            out[i * 4..i * 4 + 4].copy_from_slice(&word.to_be_bytes());
        }
        out
    }

    /// Parses and verifies a header.
    #[must_use]
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < WAL_HEADER_SIZE {
            return None;
        }
        let big_endian = match be32(bytes, 0) {
            WAL_MAGIC_BE => true,
            WAL_MAGIC_LE => false,
            _ => return None,
        };
        if be32(bytes, 4) != WAL_VERSION {
            return None;
        }
        let header = Self {
            big_endian,
            page_size: be32(bytes, 8),
            checkpoint_seq: be32(bytes, 12),
            salt: [be32(bytes, 16), be32(bytes, 20)],
            checksum: [be32(bytes, 24), be32(bytes, 28)],
        };
        let valid = is_valid_page_size(header.page_size)
            && checksum(big_endian, &bytes[..24], [0, 0]) == header.checksum;
        valid.then_some(header)
    }

    fn frame_size(&self) -> u64 {
        FRAME_HEADER_SIZE as u64 + u64::from(self.page_size)
    }
}

/// Committed content of a log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalIndex {
    /// Log header.
    pub header: WalHeader,
    /// Offset of the latest committed image of each page.
    pub pages: HashMap<u32, u64>,
    /// Database size in pages after the last commit (0 if none).
    pub db_size: u32,
    /// Frames up to and including the last commit.
    pub frame_count: u32,
    /// Running checksum after the last committed frame.
    pub last_checksum: [u32; 2],
    /// Byte offset just past the last committed frame.
    pub end_offset: u64,
}

impl WalIndex {
    /// Returns true if at least one transaction is committed in the log.
    #[must_use]
    pub fn has_commits(&self) -> bool {
        self.frame_count > 0
    }
}

/// Scans a log and indexes its committed frames.
///
/// Returns `Ok(None)` if the store does not begin with a valid header.
///
/// # Errors
///
/// Returns an error if the store cannot be read.
pub fn scan(backend: &dyn StorageBackend) -> CoreResult<Option<WalIndex>> {
    let size = backend.size()?;
    if size < WAL_HEADER_SIZE as u64 {
        return Ok(None);
    }
    let Some(header) = WalHeader::decode(&backend.read_at(0, WAL_HEADER_SIZE)?) else {
        return Ok(None);
    };

    let mut index = WalIndex {
        header,
        pages: HashMap::new(),
        db_size: 0,
        frame_count: 0,
        last_checksum: header.checksum,
        end_offset: WAL_HEADER_SIZE as u64,
    };

    let frame_size = header.frame_size();
    let mut running = header.checksum;
    let mut uncommitted: Vec<(u32, u64)> = Vec::new();
    let mut offset = WAL_HEADER_SIZE as u64;
    let mut frame_no = 0u32;

    while offset + frame_size <= size {
        let frame = backend.read_at(offset, frame_size as usize)?;
        let pgno = be32(&frame, 0);
        let commit = be32(&frame, 4);
        if pgno == 0 || [be32(&frame, 8), be32(&frame, 12)] != header.salt {
            break;
        }
        running = checksum(header.big_endian, &frame[..8], running);
        running = checksum(header.big_endian, &frame[FRAME_HEADER_SIZE..], running);
        if running != [be32(&frame, 16), be32(&frame, 20)] {
            break;
        }

        frame_no += 1;
        uncommitted.push((pgno, offset + FRAME_HEADER_SIZE as u64));
        offset += frame_size;

        if commit != 0 {
            index.pages.extend(uncommitted.drain(..));
            index.db_size = commit;
            index.frame_count = frame_no;
            index.last_checksum = running;
            index.end_offset = offset;
        }
    }

    Ok(Some(index))
}

/// Reads the committed image of `pgno`, if the log holds one.
///
/// # Errors
///
/// Returns an error if the store cannot be read.
pub fn read_page(
    backend: &dyn StorageBackend,
    index: &WalIndex,
    pgno: u32,
) -> CoreResult<Option<Vec<u8>>> {
    match index.pages.get(&pgno) {
        Some(&offset) => Ok(Some(
            backend.read_at(offset, index.header.page_size as usize)?,
        )),
        None => Ok(None),
    }
}

/// Appends one committed transaction.
///
/// When `existing` is `None`, or records a different page size, the log is
/// restarted with a fresh header using `salt`. Otherwise anything after the
/// last committed frame is discarded before appending.
///
/// # Errors
///
/// Returns an error if the store cannot be written.
pub fn append_commit(
    backend: &mut dyn StorageBackend,
    existing: Option<&WalIndex>,
    page_size: u32,
    frames: &[(u32, &[u8])],
    db_size: u32,
    salt: [u32; 2],
) -> CoreResult<()> {
    let (header, mut running, mut offset) = match existing {
        Some(index) if index.header.page_size == page_size => {
            (index.header, index.last_checksum, index.end_offset)
        }
        _ => {
            let header = WalHeader::new(page_size, 0, salt);
            backend.truncate(0)?;
            backend.write_at(0, &header.encode())?;
            (header, header.checksum, WAL_HEADER_SIZE as u64)
        }
    };
    backend.truncate(offset)?;

    let mut buf = Vec::with_capacity(frames.len() * (FRAME_HEADER_SIZE + page_size as usize));
    for (i, (pgno, page)) in frames.iter().enumerate() {
        let commit = if i + 1 == frames.len() { db_size } else { 0 };
        let mut frame_header = [0u8; FRAME_HEADER_SIZE];
        frame_header[0..4].copy_from_slice(&pgno.to_be_bytes());
        frame_header[4..8].copy_from_slice(&commit.to_be_bytes());
        frame_header[8..12].copy_from_slice(&header.salt[0].to_be_bytes());
        frame_header[12..16].copy_from_slice(&header.salt[1].to_be_bytes());
        running = checksum(header.big_endian, &frame_header[..8], running);
        running = checksum(header.big_endian, page, running);
        frame_header[16..20].copy_from_slice(&running[0].to_be_bytes());
        frame_header[20..24].copy_from_slice(&running[1].to_be_bytes());
        buf.extend_from_slice(&frame_header);
        buf.extend_from_slice(page);
    }
    backend.write_at(offset, &buf)?;
    offset += buf.len() as u64;
    debug_assert_eq!(backend.size().ok(), Some(offset));
    Ok(())
}
