//! Connection configuration.

use crate::error::{CoreError, CoreResult};
use crate::format::header::{MAX_PAGE_SIZE, MIN_PAGE_SIZE};
use crate::types::JournalMode;
use std::time::Duration;

/// Configuration for opening a connection.
#[derive(Debug, Clone)]
pub struct Config {
    /// Whether to create the database file if it doesn't exist.
    pub create_if_missing: bool,

    /// Whether the connection refuses all writes.
    pub read_only: bool,

    /// Page size used when the connection initializes an empty file.
    pub page_size: u32,

    /// Upper bound on time spent retrying a contended lock (zero = one attempt).
    pub busy_timeout: Duration,

    /// Whether to sync files on every commit (safer but slower).
    pub sync_on_commit: bool,

    /// Number of pages the connection's page cache keeps.
    pub cache_capacity: usize,

    /// Journal mode used when the connection initializes an empty file.
    pub journal_mode: JournalMode,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            read_only: false,
            page_size: 4096,
            busy_timeout: Duration::from_secs(5),
            sync_on_commit: true,
            cache_capacity: 256,
            journal_mode: JournalMode::Rollback,
        }
    }
}

impl Config {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether to create the database if missing.
    #[must_use]
    pub const fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    /// Sets whether the connection is read-only.
    #[must_use]
    pub const fn read_only(mut self, value: bool) -> Self {
        self.read_only = value;
        self
    }

    /// Sets the page size for newly initialized databases.
    #[must_use]
    pub const fn page_size(mut self, size: u32) -> Self {
        self.page_size = size;
        self
    }

    /// Sets the busy timeout.
    #[must_use]
    pub const fn busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    /// Sets whether to sync on every commit.
    #[must_use]
    pub const fn sync_on_commit(mut self, value: bool) -> Self {
        self.sync_on_commit = value;
        self
    }

    /// Sets the page cache capacity.
    #[must_use]
    pub const fn cache_capacity(mut self, pages: usize) -> Self {
        self.cache_capacity = pages;
        self
    }

    /// Sets the journal mode for newly initialized databases.
    #[must_use]
    pub const fn journal_mode(mut self, mode: JournalMode) -> Self {
        self.journal_mode = mode;
        self
    }

    /// Checks that the configuration is usable.
    ///
    /// # Errors
    ///
    /// Returns an error if the page size is not a power of two in the
    /// supported range.
    pub fn validate(&self) -> CoreResult<()> {
        if !self.page_size.is_power_of_two()
            || !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&self.page_size)
        {
            return Err(CoreError::invalid_argument(format!(
                "page size {} must be a power of two between {MIN_PAGE_SIZE} and {MAX_PAGE_SIZE}",
                self.page_size
            )));
        }
        Ok(())
    }
}
