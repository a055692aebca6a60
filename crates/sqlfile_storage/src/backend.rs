//! Storage backend trait definition.

use crate::error::StorageResult;

/// A low-level positional storage backend.
///
/// Storage backends are **opaque byte stores**. They provide simple operations
/// for reading, writing and truncating data. `sqlfile_core` owns
/// all file format interpretation - backends do not understand database
/// headers, journal records, WAL frames or shared-memory indexes.
///
/// # Invariants
///
/// - `write_at` followed by `read_at` at the same offset returns the written bytes
/// - `size` always reflects the current length of the underlying store, including
///   changes made through other handles
/// - `sync` ensures all written data is durable
/// - Backends must be `Send + Sync` for concurrent access
///
/// # Implementors
///
/// - `InMemoryBackend` - For tests, behind the `memory` feature
/// - [`super::FileBackend`] - For persistent storage
pub trait StorageBackend: Send + Sync {
    /// Reads `len` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The read would extend beyond the current size
    /// - An I/O error occurs
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>>;

    /// Writes `data` at `offset`, extending the store if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if an I/O error occurs.
    fn write_at(&mut self, offset: u64, data: &[u8]) -> StorageResult<()>;

    /// Returns the current size of the storage in bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the size cannot be determined.
    fn size(&self) -> StorageResult<u64>;

    /// Syncs all data and metadata to durable storage.
    ///
    /// After this returns successfully, all previously written data is
    /// guaranteed to survive process termination and power loss.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync operation fails.
    fn sync(&mut self) -> StorageResult<()>;

    /// Sets the storage length to `new_size`.
    ///
    /// Shrinking discards everything after `new_size`; growing pads with
    /// zero bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the truncation fails.
    fn truncate(&mut self, new_size: u64) -> StorageResult<()>;
}
