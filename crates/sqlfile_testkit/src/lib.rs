//! # sqlfile Testkit
//!
//! Test utilities for sqlfile.
//!
//! This crate provides:
//! - Temporary databases and helpers that lay out main, journal, WAL and
//!   shared-memory files byte for byte
//! - Property-based test generators using proptest
//! - A lock holder that looks like another process to the prober (Linux)
//!
//! ## Usage
//!
//! ```rust,ignore
//! use sqlfile_testkit::prelude::*;
//!
//! #[test]
//! fn truncate_empties_file() {
//!     let db = TestDatabase::populated(4096, 10);
//!     db.truncate(None).unwrap();
//!     assert_eq!(db.main_len(), 0);
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod foreign;
pub mod generators;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::foreign::*;
    pub use crate::generators::*;
}

pub use fixtures::*;
pub use foreign::*;
pub use generators::*;
