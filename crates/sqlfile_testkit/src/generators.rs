//! Property-based test generators using proptest.

use proptest::prelude::*;
use sqlfile_core::truncate_flags::PAGE_SIZES;
use sqlfile_core::{AutoVacuum, JournalMode, RowId, TruncateOptions};
use std::collections::BTreeMap;

/// Strategy for page sizes a truncate may request.
pub fn page_size_strategy() -> impl Strategy<Value = u32> {
    prop::sample::select(PAGE_SIZES.to_vec())
}

/// Strategy for journal modes.
pub fn journal_mode_strategy() -> impl Strategy<Value = JournalMode> {
    prop_oneof![Just(JournalMode::Rollback), Just(JournalMode::Wal)]
}

/// Strategy for auto-vacuum policies.
pub fn auto_vacuum_strategy() -> impl Strategy<Value = AutoVacuum> {
    prop_oneof![
        Just(AutoVacuum::Off),
        Just(AutoVacuum::Full),
        Just(AutoVacuum::Incremental),
    ]
}

/// Strategy for row payloads that fit a page of any size in
/// [`PAGE_SIZES`].
pub fn payload_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..900)
}

/// Strategy for row sets with positive, possibly sparse rowids.
pub fn rows_strategy(max_rows: usize) -> impl Strategy<Value = BTreeMap<RowId, Vec<u8>>> {
    prop::collection::btree_map(1..10_000i64, payload_strategy(), 0..max_rows)
}

/// Strategy for truncate options, with and without header
/// re-initialization.
pub fn truncate_options_strategy() -> impl Strategy<Value = TruncateOptions> {
    (
        any::<bool>(),
        journal_mode_strategy(),
        prop::option::of(auto_vacuum_strategy()),
        prop::option::of(page_size_strategy()),
        any::<bool>(),
    )
        .prop_map(|(initialize, mode, auto_vacuum, page_size, force)| {
            let mut options = TruncateOptions::new().force(force);
            if !initialize {
                return options;
            }
            options = options.journal_mode(mode);
            if let Some(av) = auto_vacuum {
                options = options.auto_vacuum(av);
            }
            if let Some(size) = page_size {
                options = options.page_size(size);
            }
            options
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    proptest! {
        #[test]
        fn generated_page_sizes_are_supported(size in page_size_strategy()) {
            prop_assert!(PAGE_SIZES.contains(&size));
        }

        #[test]
        fn generated_options_validate(options in truncate_options_strategy()) {
            prop_assert!(options.validate().is_ok());
        }

        #[test]
        fn generated_rowids_are_positive(rows in rows_strategy(20)) {
            prop_assert!(rows.keys().all(|id| *id > 0));
        }
    }
}
