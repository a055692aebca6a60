//! Property tests over probe classification, truncate and replace.

use proptest::prelude::*;
use sqlfile_core::format::header::MAGIC;
use sqlfile_core::{probe_path, Config, Connection, JournalMode, LockState, ProcessFilter};
use sqlfile_testkit::prelude::*;
use std::fs;
use std::time::Duration;

fn config(page_size: u32, mode: JournalMode) -> Config {
    Config::default()
        .page_size(page_size)
        .journal_mode(mode)
        .busy_timeout(Duration::ZERO)
        .sync_on_commit(false)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn non_magic_files_are_not_databases(bytes in prop::collection::vec(any::<u8>(), 1..256)) {
        prop_assume!(!bytes.starts_with(&MAGIC[..bytes.len().min(MAGIC.len())]));
        let db = TestDatabase::new();
        let path = db.sibling("junk.bin");
        fs::write(&path, &bytes).unwrap();
        prop_assert_eq!(probe_path(&path, ProcessFilter::AnyProcess), LockState::NotADatabase);
        prop_assert_eq!(fs::read(&path).unwrap(), bytes);
    }

    #[test]
    fn replace_copies_rows_between_any_page_sizes(
        rows in rows_strategy(40),
        source_size in page_size_strategy(),
        dest_size in page_size_strategy(),
        source_mode in journal_mode_strategy(),
        dest_mode in journal_mode_strategy(),
    ) {
        let source = TestDatabase::with_config(config(source_size, source_mode));
        source
            .transaction(|tx| {
                for (rowid, payload) in &rows {
                    tx.put(*rowid, payload.clone())?;
                }
                Ok(())
            })
            .unwrap();
        let dest = TestDatabase::populated(dest_size, 3);
        let expected = source.rows().unwrap();

        dest.replace(&source).unwrap();

        prop_assert_eq!(dest.header().unwrap().page_size, dest_size);
        prop_assert_eq!(dest.rows().unwrap(), expected.clone());
        let reopened = Connection::open(dest.path()).unwrap();
        prop_assert_eq!(reopened.rows().unwrap(), expected);
        prop_assert_eq!(dest.main_len() % u64::from(dest_size), 0);
    }

    #[test]
    fn truncate_leaves_a_consistent_file(
        options in truncate_options_strategy(),
        rows in 0usize..20,
        mode in journal_mode_strategy(),
    ) {
        let db = TestDatabase::with_config(config(4096, mode));
        insert_rows(&db, rows);

        db.truncate(Some(options)).unwrap();

        let files = db.files();
        prop_assert!(files.journal().is_none());
        if let Some(wal) = files.wal() {
            prop_assert_eq!(file_len(wal), 0);
        }
        if options.initializes_header() {
            let reopened = Connection::open(db.path()).unwrap();
            let header = reopened.header().unwrap();
            if let Some(size) = options.requested_page_size() {
                prop_assert_eq!(header.page_size, size);
                prop_assert_eq!(db.main_len(), u64::from(size));
            }
            if let Some(av) = options.requested_auto_vacuum() {
                prop_assert_eq!(header.auto_vacuum(), av);
            }
            prop_assert_eq!(header.journal_mode(), options.requested_journal_mode());
            prop_assert_eq!(reopened.row_count().unwrap(), 0);
        } else {
            prop_assert_eq!(db.main_len(), 0);
        }
    }
}
