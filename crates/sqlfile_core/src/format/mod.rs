//! On-disk formats.
//!
//! Each submodule encodes and decodes one file of a database: the main file
//! header, its table-leaf pages, the rollback journal, the write-ahead log
//! and the shared-memory index header. Nothing here takes locks or knows
//! about connections.

pub mod header;
pub mod journal;
pub mod page;
pub mod shm;
pub mod wal;

pub use header::DatabaseHeader;
