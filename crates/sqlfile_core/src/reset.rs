//! Whole-database truncation.
//!
//! Steps run in a fixed order so a crash after any of them leaves files a
//! reader can open:
//!
//! 1. cut the WAL to zero, so no frame outlives the pages it patches
//! 2. cut the main file to zero, optionally writing a fresh page 1
//! 3. delete the rollback journal, so it is never replayed onto the
//!    truncated file
//! 4. scramble the shared-memory index header, so every other connection
//!    rebuilds its view
//!
//! Nothing is undone on failure. The error names the last step that
//! completed.

use crate::cache::purge_eligible_page_cache_memory;
use crate::error::{CoreError, CoreResult, MutationStep, TruncateError};
use crate::format::header::{self, DatabaseHeader};
use crate::image::Image;
use crate::lock::LockLevel;
use crate::pager::Pager;
use crate::types::{AutoVacuum, JournalMode};
use sqlfile_storage::StorageBackend;
use tracing::{debug, info, warn};

/// Header re-initialization bits of the flag word.
pub const INITIALIZE_HEADER_MASK: u32 = 0x7F;
/// Re-initialize in WAL mode.
pub const JOURNAL_MODE_WAL: u32 = 0x01;
/// Auto-vacuum field of the flag word.
pub const AUTO_VACUUM_MASK: u32 = 0x3 << 2;
/// Auto-vacuum off.
pub const AUTO_VACUUM_OFF: u32 = 0x1 << 2;
/// Full auto-vacuum.
pub const AUTO_VACUUM_FULL: u32 = 0x2 << 2;
/// Incremental auto-vacuum.
pub const AUTO_VACUUM_INCREMENTAL: u32 = 0x3 << 2;
/// Page size field of the flag word.
pub const PAGE_SIZE_MASK: u32 = 0x7 << 4;
/// Truncate even if exclusive access cannot be confirmed.
pub const FORCE: u32 = 0x1 << 7;

/// Page sizes a truncate can initialize, in flag order.
pub const PAGE_SIZES: [u32; 4] = [1024, 2048, 4096, 8192];

/// How to truncate.
///
/// The default truncates to zero bytes with no new header. Setting a
/// journal mode, auto-vacuum policy or page size, or calling
/// [`Self::initialize_header`], writes an empty database instead; fields
/// left unset keep the old header's value, falling back to the
/// connection's configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TruncateOptions {
    initialize: bool,
    journal_mode: JournalMode,
    auto_vacuum: Option<AutoVacuum>,
    page_size: Option<u32>,
    force: bool,
}

impl TruncateOptions {
    /// Plain truncation to zero bytes.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes an empty database header after truncating.
    #[must_use]
    pub fn initialize_header(mut self) -> Self {
        self.initialize = true;
        self
    }

    /// Journal mode of the new header.
    #[must_use]
    pub fn journal_mode(mut self, mode: JournalMode) -> Self {
        self.initialize = true;
        self.journal_mode = mode;
        self
    }

    /// Auto-vacuum policy of the new header.
    #[must_use]
    pub fn auto_vacuum(mut self, mode: AutoVacuum) -> Self {
        self.initialize = true;
        self.auto_vacuum = Some(mode);
        self
    }

    /// Page size of the new header; one of [`PAGE_SIZES`].
    #[must_use]
    pub fn page_size(mut self, size: u32) -> Self {
        self.initialize = true;
        self.page_size = Some(size);
        self
    }

    /// Truncates even when another connection holds the file.
    #[must_use]
    pub fn force(mut self, value: bool) -> Self {
        self.force = value;
        self
    }

    /// Whether a new header will be written.
    #[must_use]
    pub fn initializes_header(&self) -> bool {
        self.initialize
    }

    /// Whether contention is ignored.
    #[must_use]
    pub fn is_forced(&self) -> bool {
        self.force
    }

    /// Requested journal mode.
    #[must_use]
    pub fn requested_journal_mode(&self) -> JournalMode {
        self.journal_mode
    }

    /// Requested auto-vacuum policy.
    #[must_use]
    pub fn requested_auto_vacuum(&self) -> Option<AutoVacuum> {
        self.auto_vacuum
    }

    /// Requested page size.
    #[must_use]
    pub fn requested_page_size(&self) -> Option<u32> {
        self.page_size
    }

    /// Parses the flag word.
    ///
    /// # Errors
    ///
    /// Returns [`TruncateError::InvalidOptions`] for unknown bits or a page
    /// size code outside 1..=4.
    pub fn from_flags(flags: u32) -> Result<Self, TruncateError> {
        if flags & !(INITIALIZE_HEADER_MASK | FORCE) != 0 {
            return Err(TruncateError::invalid_options(format!(
                "unknown truncate flags {:#x}",
                flags & !(INITIALIZE_HEADER_MASK | FORCE)
            )));
        }
        let auto_vacuum = match flags & AUTO_VACUUM_MASK {
            0 => None,
            AUTO_VACUUM_OFF => Some(AutoVacuum::Off),
            AUTO_VACUUM_FULL => Some(AutoVacuum::Full),
            _ => Some(AutoVacuum::Incremental),
        };
        let page_size = match (flags & PAGE_SIZE_MASK) >> 4 {
            0 => None,
            code @ 1..=4 => Some(PAGE_SIZES[code as usize - 1]),
            code => {
                return Err(TruncateError::invalid_options(format!(
                    "page size code {code} is not one of 1..=4"
                )))
            }
        };
        Ok(Self {
            initialize: flags & INITIALIZE_HEADER_MASK != 0,
            journal_mode: if flags & JOURNAL_MODE_WAL != 0 {
                JournalMode::Wal
            } else {
                JournalMode::Rollback
            },
            auto_vacuum,
            page_size,
            force: flags & FORCE != 0,
        })
    }

    /// Encodes the options as a flag word.
    ///
    /// A header-initializing request with every field at its default has
    /// no bit of its own; it is encoded with an explicit auto-vacuum of
    /// off.
    ///
    /// # Errors
    ///
    /// Returns [`TruncateError::InvalidOptions`] if the page size has no
    /// flag encoding.
    pub fn to_flags(&self) -> Result<u32, TruncateError> {
        self.validate()?;
        let mut flags = 0;
        if self.initialize {
            if self.journal_mode == JournalMode::Wal {
                flags |= JOURNAL_MODE_WAL;
            }
            flags |= match self.auto_vacuum {
                None => 0,
                Some(AutoVacuum::Off) => AUTO_VACUUM_OFF,
                Some(AutoVacuum::Full) => AUTO_VACUUM_FULL,
                Some(AutoVacuum::Incremental) => AUTO_VACUUM_INCREMENTAL,
            };
            if let Some(size) = self.page_size {
                let code = PAGE_SIZES
                    .iter()
                    .position(|s| *s == size)
                    .map_or(0, |i| i as u32 + 1);
                flags |= code << 4;
            }
            if flags == 0 {
                flags = AUTO_VACUUM_OFF;
            }
        }
        if self.force {
            flags |= FORCE;
        }
        Ok(flags)
    }

    /// Checks the options before any I/O.
    ///
    /// # Errors
    ///
    /// Returns [`TruncateError::InvalidOptions`] if the page size is not
    /// one of [`PAGE_SIZES`].
    pub fn validate(&self) -> Result<(), TruncateError> {
        match self.page_size {
            Some(size) if !PAGE_SIZES.contains(&size) => Err(TruncateError::invalid_options(
                format!("page size {size} is not one of {PAGE_SIZES:?}"),
            )),
            _ => Ok(()),
        }
    }
}

/// Truncates the pager's database.
pub(crate) fn truncate(pager: &mut Pager, options: &TruncateOptions) -> Result<(), TruncateError> {
    options.validate()?;
    if pager.is_read_only() {
        return Err(TruncateError::IoFailure {
            last_completed: None,
            source: CoreError::ReadOnly,
        });
    }
    purge_eligible_page_cache_memory();

    let prev = pager.lock.level();
    let locked = match pager.acquire(LockLevel::Exclusive) {
        Ok(()) => true,
        Err(CoreError::Busy) if options.force => {
            warn!(path = %pager.path().display(), "truncating without exclusive access");
            false
        }
        Err(CoreError::Busy) => return Err(TruncateError::LockUnavailable),
        Err(e) => {
            return Err(TruncateError::IoFailure {
                last_completed: None,
                source: e,
            })
        }
    };

    let old = pager.stored_header();
    let mut last = None;
    let result = run(pager, options, old.as_ref(), &mut last);

    if last.is_some() {
        pager.entry.bump_reset_epoch();
    }
    pager.invalidate();
    let restored = if locked { pager.lock.unlock(prev) } else { Ok(()) };

    match result {
        Ok(()) => {
            info!(
                path = %pager.path().display(),
                initialized = options.initialize,
                forced = !locked,
                last_step = ?last,
                "database truncated"
            );
            if let Err(e) = restored {
                debug!(path = %pager.path().display(), error = %e, "lock release after truncate failed");
            }
            Ok(())
        }
        Err(source) => Err(TruncateError::IoFailure {
            last_completed: last,
            source,
        }),
    }
}

fn run(
    pager: &mut Pager,
    options: &TruncateOptions,
    old: Option<&DatabaseHeader>,
    last: &mut Option<MutationStep>,
) -> CoreResult<()> {
    if pager.truncate_wal()? {
        *last = Some(MutationStep::WalTruncated);
    }

    let mut main = pager.main();
    main.truncate(0)?;
    main.sync()?;
    *last = Some(MutationStep::MainTruncated);

    if options.initialize {
        let page_size = options
            .page_size
            .or(old.map(|h| h.page_size).filter(|s| header::is_valid_page_size(*s)))
            .unwrap_or(pager.config.page_size);
        let auto_vacuum = options
            .auto_vacuum
            .or(old.map(DatabaseHeader::auto_vacuum))
            .unwrap_or_default();
        let mut fresh = DatabaseHeader::new(page_size, options.journal_mode, auto_vacuum);
        fresh.bump_change_counter(old.map_or(0, |h| h.change_counter));
        main.write_at(0, &Image::page_one(&fresh))?;
        main.sync()?;
        *last = Some(MutationStep::MainInitialized);
        debug!(page_size, %auto_vacuum, journal_mode = %options.journal_mode, "wrote empty header");
    }

    if pager.remove_journal()? {
        *last = Some(MutationStep::JournalRemoved);
    }
    if pager.scramble_shm()? {
        *last = Some(MutationStep::ShmScrambled);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn default_options_do_not_initialize() {
        let options = TruncateOptions::default();
        assert!(!options.initializes_header());
        assert!(!options.is_forced());
        assert_eq!(options.to_flags().unwrap(), 0);
        assert_eq!(TruncateOptions::from_flags(0).unwrap(), options);
    }

    #[test]
    fn flag_word_layout() {
        let options = TruncateOptions::from_flags(0x01 | 0x08 | 0x30 | 0x80).unwrap();
        assert!(options.initializes_header());
        assert!(options.is_forced());
        assert_eq!(options.requested_journal_mode(), JournalMode::Wal);
        assert_eq!(options.requested_auto_vacuum(), Some(AutoVacuum::Full));
        assert_eq!(options.requested_page_size(), Some(4096));

        let force_only = TruncateOptions::from_flags(FORCE).unwrap();
        assert!(!force_only.initializes_header());

        // Bit 1 has no field of its own but still asks for a header.
        let bare = TruncateOptions::from_flags(0x02).unwrap();
        assert!(bare.initializes_header());
        assert_eq!(bare.requested_journal_mode(), JournalMode::Rollback);
    }

    #[test]
    fn bad_flags_are_rejected() {
        for code in 5..=7u32 {
            let err = TruncateOptions::from_flags(code << 4).unwrap_err();
            assert!(matches!(err, TruncateError::InvalidOptions { .. }));
        }
        assert!(TruncateOptions::from_flags(0x100).is_err());
        assert!(TruncateOptions::new().page_size(512).validate().is_err());
        assert!(TruncateOptions::new().page_size(16384).to_flags().is_err());
    }

    proptest! {
        #[test]
        fn valid_flag_words_survive_reencoding(
            wal in any::<bool>(),
            av in 0u32..4,
            ps in 0u32..5,
            force in any::<bool>(),
        ) {
            let flags = u32::from(wal) | (av << 2) | (ps << 4) | (u32::from(force) << 7);
            let options = TruncateOptions::from_flags(flags).unwrap();
            let reparsed = TruncateOptions::from_flags(options.to_flags().unwrap()).unwrap();
            prop_assert_eq!(reparsed, options);
        }
    }
}
