//! Shared-memory WAL index (`<db>-shm`).
//!
//! Only the fixed prefix matters here:
//!
//! ```text
//!   0  WAL-index header, first copy (48 bytes, host byte order)
//!        0 version, 4 unused, 8 change counter, 12 is-initialized, ...
//!  48  WAL-index header, second copy
//!  96  checkpoint info: backfill count, five read marks
//! 120  lock slots: write, checkpoint, recover, read 0..4
//! 128  dead-man switch lock byte
//! ```
//!
//! A connection trusts its cached view only while both header copies agree
//! and the change counter matches what it saw last. Scrambling writes a
//! first copy whose change counter moved and whose initialized flag is
//! clear, with a zeroed second copy, so every reader rebuilds.

use crate::error::CoreResult;
use sqlfile_storage::StorageBackend;

/// Size of one WAL-index header copy.
pub const HEADER_COPY_SIZE: usize = 48;

/// Size of both header copies.
pub const HEADER_SIZE: usize = 2 * HEADER_COPY_SIZE;

/// Offset of the first lock slot.
pub const LOCK_OFFSET: u64 = 120;

/// Number of lock slots.
pub const LOCK_SLOTS: u64 = 8;

/// Writer lock slot.
pub const WRITE_LOCK: u64 = LOCK_OFFSET;

/// Checkpointer lock slot.
pub const CHECKPOINT_LOCK: u64 = LOCK_OFFSET + 1;

/// Recovery lock slot.
pub const RECOVER_LOCK: u64 = LOCK_OFFSET + 2;

/// First of the five reader slots.
pub const READ_LOCK_FIRST: u64 = LOCK_OFFSET + 3;

/// Dead-man switch byte, held shared by every open connection.
pub const DMS_OFFSET: u64 = LOCK_OFFSET + LOCK_SLOTS;

const CHANGE_OFFSET: usize = 8;
const IS_INIT_OFFSET: usize = 12;

/// Reads the change counter of the first header copy.
#[must_use]
pub fn change_counter(header: &[u8]) -> u32 {
    header
        .get(CHANGE_OFFSET..CHANGE_OFFSET + 4)
        .map_or(0, |b| u32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
}

/// Builds a header that mismatches every cached copy of `current`.
#[must_use]
pub fn scrambled_header(current: &[u8]) -> [u8; HEADER_SIZE] {
    let next = match change_counter(current).wrapping_add(1) {
        0 => 1,
        n => n,
    };
    let mut out = [0u8; HEADER_SIZE];
    out[CHANGE_OFFSET..CHANGE_OFFSET + 4].copy_from_slice(&next.to_ne_bytes());
    out[IS_INIT_OFFSET] = 0;
    out
}

/// Overwrites the header copies of a shared-memory file.
///
/// # Errors
///
/// Returns an error if the store cannot be read or written.
pub fn scramble(backend: &mut dyn StorageBackend) -> CoreResult<()> {
    let len = backend.size()?.min(HEADER_SIZE as u64) as usize;
    let current = backend.read_at(0, len)?;
    backend.write_at(0, &scrambled_header(&current))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlfile_storage::InMemoryBackend;

    #[test]
    fn scramble_moves_change_counter_and_clears_init() {
        let mut header = vec![0u8; 136];
        header[CHANGE_OFFSET..CHANGE_OFFSET + 4].copy_from_slice(&41u32.to_ne_bytes());
        header[IS_INIT_OFFSET] = 1;
        let first_copy = header[..48].to_vec();
        header[48..96].copy_from_slice(&first_copy);
        header[120] = 0xaa;

        let mut shm = InMemoryBackend::with_data(header.clone());
        scramble(&mut shm).unwrap();
        let after = shm.data();

        assert_eq!(change_counter(&after), 42);
        assert_eq!(after[IS_INIT_OFFSET], 0);
        assert_ne!(&after[..48], &after[48..96]);
        assert_eq!(after.len(), 136);
        assert_eq!(after[120], 0xaa);
        assert_ne!(&after[..96], &header[..96]);
    }

    #[test]
    fn wrapped_counter_skips_zero() {
        let mut header = [0u8; HEADER_SIZE];
        header[CHANGE_OFFSET..CHANGE_OFFSET + 4].copy_from_slice(&u32::MAX.to_ne_bytes());
        assert_eq!(change_counter(&scrambled_header(&header)), 1);
    }

    #[test]
    fn scramble_alters_zeroed_and_empty_files() {
        let mut zeroed = InMemoryBackend::with_data(vec![0u8; HEADER_SIZE]);
        scramble(&mut zeroed).unwrap();
        assert_ne!(zeroed.data(), vec![0u8; HEADER_SIZE]);

        let mut empty = InMemoryBackend::new();
        scramble(&mut empty).unwrap();
        assert_eq!(change_counter(&empty.data()), 1);
    }
}
