//! # sqlfile Storage
//!
//! Storage backend trait, implementations and advisory lock primitives for
//! sqlfile.
//!
//! This crate provides the lowest-level storage abstraction. Storage
//! backends are **opaque byte stores** - they do not interpret the data they
//! store.
//!
//! ## Design Principles
//!
//! - Backends are positional byte stores (read, write, truncate, sync)
//! - No knowledge of database, journal, WAL or shared-memory formats
//! - Must be `Send + Sync` for concurrent access
//! - `sqlfile_core` owns all file format interpretation
//!
//! ## Available Backends
//!
//! - [`FileBackend`] - For persistent storage using OS file APIs
//! - `InMemoryBackend` - A test double, enabled by the `memory` feature
//!
//! ## Advisory Locks
//!
//! [`range_lock`] wraps the platform's cooperative byte-range locks
//! (`fcntl` record locks on Unix). [`lock_table`] reads the kernel's table
//! of held locks where the platform exposes one, so callers can learn *who*
//! holds a contended range.
//!
//! ## Example
//!
//! ```rust
//! use sqlfile_storage::{FileBackend, StorageBackend};
//!
//! let dir = tempfile::tempdir().unwrap();
//! let mut backend = FileBackend::open(&dir.path().join("data.bin")).unwrap();
//! backend.write_at(0, b"hello world").unwrap();
//! let data = backend.read_at(6, 5).unwrap();
//! assert_eq!(&data, b"world");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
pub mod lock_table;
#[cfg(any(test, feature = "memory"))]
mod memory;
pub mod range_lock;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
#[cfg(any(test, feature = "memory"))]
pub use memory::InMemoryBackend;
pub use range_lock::{RangeHolder, RangeLockKind};
