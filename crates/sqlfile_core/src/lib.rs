//! # sqlfile Core
//!
//! Lock introspection and whole-file maintenance for SQLite-format
//! database files.
//!
//! This crate provides:
//! - Lock-state probes that never take a lock ([`probe`], [`Connection::lock_state`])
//! - Truncation to an empty file or a fresh empty database ([`Connection::truncate`])
//! - Replacement of one database's content with another's, re-paging as
//!   needed ([`Connection::replace`])
//! - A process-wide page cache purge ([`purge_eligible_page_cache_memory`])
//! - The pieces those need: on-disk formats, the byte-range lock protocol,
//!   a minimal row heap with rollback-journal and WAL commits, snapshots
//!   and the pre-update hook
//!
//! ## Example
//!
//! ```rust,ignore
//! use sqlfile_core::{probe_path, Connection, LockState, ProcessFilter, TruncateOptions};
//!
//! let conn = Connection::open(Path::new("app.db"))?;
//! assert_eq!(probe_path(Path::new("app.db"), ProcessFilter::AnyProcess), LockState::Unlocked);
//! conn.truncate(Some(TruncateOptions::new().page_size(8192)))?;
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod busy;
mod cache;
mod config;
mod connection;
mod error;
pub mod files;
pub mod format;
mod hooks;
mod image;
pub mod inode;
pub mod lock;
mod pager;
mod probe;
mod replace;
mod reset;
mod snapshot;
mod transaction;
mod types;

pub use busy::{default_busy_handler, BackoffBusyHandler, BusyHandler, NoRetry};
pub use cache::{purge_eligible_page_cache_memory, PageCache};
pub use config::Config;
pub use connection::{Connection, FileControl, FileControlOutcome};
pub use error::{
    CoreError, CoreResult, FileControlError, MutationStep, ReplaceError, TruncateError,
};
pub use files::DatabaseFileSet;
pub use format::DatabaseHeader;
pub use hooks::{PreUpdateEvent, PreUpdateHook, PreUpdateOp};
pub use image::Image;
pub use inode::FileKey;
pub use lock::LockLevel;
pub use probe::{probe, probe_path, FileLockDescriptor};
pub use reset::TruncateOptions;
pub use snapshot::{FileVersion, Snapshot, WalMark};
pub use transaction::Transaction;
pub use types::{AutoVacuum, JournalMode, LockState, ProcessFilter, RowId};

/// Truncate flag-word constants, as accepted by
/// [`TruncateOptions::from_flags`].
pub mod truncate_flags {
    pub use crate::reset::{
        AUTO_VACUUM_FULL, AUTO_VACUUM_INCREMENTAL, AUTO_VACUUM_MASK, AUTO_VACUUM_OFF, FORCE,
        INITIALIZE_HEADER_MASK, JOURNAL_MODE_WAL, PAGE_SIZES, PAGE_SIZE_MASK,
    };
}

/// Version of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
