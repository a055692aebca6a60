//! End-to-end probe, truncate and replace scenarios.

use sqlfile_core::files::{journal_path, shm_path, wal_path};
use sqlfile_core::{
    probe, probe_path, AutoVacuum, Config, Connection, CoreError, FileControl, FileControlOutcome,
    FileLockDescriptor, JournalMode, LockLevel, LockState, ProcessFilter,
    ReplaceError, TruncateError, TruncateOptions,
};
use sqlfile_testkit::prelude::*;
use std::fs;
use std::time::Duration;

fn impatient() -> Config {
    Config::default()
        .busy_timeout(Duration::ZERO)
        .sync_on_commit(false)
}

#[test]
fn truncate_three_page_database_with_hot_journal() {
    let db = TestDatabase::with_pages(4096, 3, JournalMode::Rollback);
    assert_eq!(db.main_len(), 3 * 4096);
    write_current_journal(db.path());
    write_shm(db.path());
    let shm_before = shm_header(db.path());

    db.truncate(None).unwrap();

    assert_eq!(db.main_len(), 0);
    assert!(!journal_path(db.path()).exists());
    assert_ne!(shm_header(db.path()), shm_before);
    assert_eq!(db.row_count().unwrap(), 0);
}

#[test]
fn replace_small_pages_onto_large_pages() {
    let source = TestDatabase::with_pages(1024, 2, JournalMode::Rollback);
    let dest = TestDatabase::with_pages(4096, 5, JournalMode::Rollback);
    let expected = source.rows().unwrap();
    assert_eq!(expected.len(), 1);

    dest.replace(&source).unwrap();

    assert_eq!(dest.header().unwrap().page_size, 4096);
    assert_eq!(dest.rows().unwrap(), expected);
    assert_eq!(dest.main_len(), 2 * 4096);
    assert!(!journal_path(dest.path()).exists());

    let reopened = Connection::open(dest.path()).unwrap();
    assert_eq!(reopened.rows().unwrap(), expected);
    assert_eq!(source.header().unwrap().page_size, 1024);
}

#[test]
fn replace_large_pages_onto_small_pages() {
    let source = TestDatabase::populated(8192, 30);
    let dest = TestDatabase::populated(1024, 2);

    dest.replace(&source).unwrap();

    assert_eq!(dest.header().unwrap().page_size, 1024);
    assert_eq!(dest.rows().unwrap(), source.rows().unwrap());
}

#[test]
fn replace_rejects_rows_the_destination_cannot_hold() {
    let source = TestDatabase::with_pages(8192, 2, JournalMode::Rollback);
    let dest = TestDatabase::populated(1024, 3);
    let before = fs::read(dest.path()).unwrap();

    let err = dest.replace(&source).unwrap_err();
    assert!(matches!(err, ReplaceError::InvalidOptions { .. }));
    assert!(err.last_completed().is_none());
    assert_eq!(fs::read(dest.path()).unwrap(), before);
}

#[test]
fn default_truncate_empties_wal() {
    let db = TestDatabase::with_config(impatient().journal_mode(JournalMode::Wal));
    insert_rows(&db, 8);
    assert!(file_len(&wal_path(db.path())) > 0);

    db.truncate(None).unwrap();

    assert_eq!(db.main_len(), 0);
    assert_eq!(file_len(&wal_path(db.path())), 0);
    assert!(!journal_path(db.path()).exists());
    assert_eq!(db.row_count().unwrap(), 0);
}

#[test]
fn reinitialized_database_reopens_with_requested_geometry() {
    let db = TestDatabase::populated(4096, 10);
    let options = TruncateOptions::new()
        .page_size(8192)
        .auto_vacuum(AutoVacuum::Incremental)
        .journal_mode(JournalMode::Wal);

    db.truncate(Some(options)).unwrap();
    assert_eq!(db.main_len(), 8192);

    let reopened = Connection::open(db.path()).unwrap();
    let header = reopened.header().unwrap();
    assert_eq!(header.page_size, 8192);
    assert_eq!(header.auto_vacuum(), AutoVacuum::Incremental);
    assert_eq!(header.journal_mode(), JournalMode::Wal);
    assert_eq!(reopened.row_count().unwrap(), 0);

    insert_rows(&reopened, 3);
    assert!(file_len(&wal_path(db.path())) > 0);
    assert_eq!(db.row_count().unwrap(), 3);
}

#[test]
fn invalid_truncate_options_change_nothing() {
    let db = TestDatabase::populated(4096, 4);
    let before = fs::read(db.path()).unwrap();

    let err = db
        .truncate(Some(TruncateOptions::new().page_size(3000)))
        .unwrap_err();
    assert!(matches!(err, TruncateError::InvalidOptions { .. }));
    assert_eq!(fs::read(db.path()).unwrap(), before);
}

#[test]
fn snapshots_go_stale_across_connections() {
    let db = TestDatabase::with_config(impatient().journal_mode(JournalMode::Wal));
    insert_rows(&db, 2);
    let reader = db.open_another();
    let snapshot = reader.snapshot().unwrap();
    reader.check_snapshot(&snapshot).unwrap();

    db.truncate(None).unwrap();

    assert!(matches!(
        reader.check_snapshot(&snapshot),
        Err(CoreError::SnapshotStale)
    ));
}

#[test]
fn probe_is_idempotent_and_leaves_locks_alone() {
    let db = TestDatabase::populated(2048, 3);
    db.hold_lock(LockLevel::Shared).unwrap();

    let desc = FileLockDescriptor::new(db.path());
    let first = probe(&desc);
    let second = probe(&desc);
    assert_eq!(first, LockState::LockedByTarget);
    assert_eq!(first, second);
    assert_eq!(db.lock_level(), LockLevel::Shared);

    db.release_lock().unwrap();
    assert_eq!(probe(&desc), LockState::Unlocked);
    assert_eq!(probe(&desc), LockState::Unlocked);
}

#[test]
fn connection_probe_names_this_process() {
    let db = TestDatabase::populated(1024, 1);
    let me = ProcessFilter::Pid(std::process::id());
    assert_eq!(db.lock_state(me), LockState::Unlocked);

    db.hold_lock(LockLevel::Reserved).unwrap();
    assert_eq!(db.lock_state(me), LockState::LockedByTarget);
    assert_eq!(
        db.file_control(FileControl::LockStatePid(ProcessFilter::AnyProcess))
            .unwrap(),
        FileControlOutcome::LockState(LockState::LockedByTarget)
    );
    db.release_lock().unwrap();
    assert_eq!(db.lock_state(ProcessFilter::AnyProcess), LockState::Unlocked);
}

#[test]
fn encrypted_files_are_not_probed() {
    let db = TestDatabase::populated(1024, 1);
    let desc = FileLockDescriptor::new(db.path()).may_be_encrypted(true);
    assert_eq!(probe(&desc), LockState::Error);
}

#[test]
fn file_control_truncates_and_replaces() {
    let source = TestDatabase::populated(2048, 6);
    let dest = TestDatabase::populated(4096, 1);

    let outcome = dest
        .file_control(FileControl::ReplaceDatabase(&source.conn))
        .unwrap();
    assert_eq!(outcome, FileControlOutcome::Done);
    assert_eq!(dest.row_count().unwrap(), 6);

    dest.file_control(FileControl::TruncateDatabase(None)).unwrap();
    assert_eq!(dest.main_len(), 0);
}

#[test]
fn empty_and_foreign_files() {
    let db = TestDatabase::new();
    let empty = db.sibling("empty.db");
    fs::write(&empty, b"").unwrap();
    assert_eq!(probe_path(&empty, ProcessFilter::AnyProcess), LockState::Unlocked);

    let text = db.sibling("readme.txt");
    fs::write(&text, "plain text, not a database file at all").unwrap();
    assert_eq!(probe_path(&text, ProcessFilter::AnyProcess), LockState::NotADatabase);
    assert!(Connection::open(&text).is_err());
}

#[cfg(any(target_os = "linux", target_os = "android"))]
mod foreign {
    use super::*;

    #[test]
    fn truncate_blocked_by_foreign_exclusive_lock() {
        let db = TestDatabase::with_config(impatient());
        insert_rows(&db, 5);
        let before = fs::read(db.path()).unwrap();

        let holder = ForeignLockHolder::exclusive(db.path());
        assert_eq!(
            db.lock_state(ProcessFilter::AnyProcess),
            LockState::LockedByTarget
        );
        assert_eq!(
            db.lock_state(ProcessFilter::Pid(std::process::id())),
            LockState::Error
        );

        let err = db.truncate(None).unwrap_err();
        assert!(matches!(err, TruncateError::LockUnavailable));
        assert!(err.is_retryable());
        assert_eq!(fs::read(db.path()).unwrap(), before);

        holder.release();
        db.truncate(None).unwrap();
        assert_eq!(db.main_len(), 0);
    }

    #[test]
    fn own_pid_filter_needs_a_named_owner() {
        let db = TestDatabase::with_config(impatient());
        insert_rows(&db, 1);
        let me = ProcessFilter::Pid(std::process::id());

        db.hold_lock(LockLevel::Shared).unwrap();
        assert_eq!(db.lock_state(me), LockState::LockedByTarget);
        assert_eq!(probe_path(db.path(), me), LockState::LockedByTarget);
        db.release_lock().unwrap();
        assert_eq!(db.lock_state(me), LockState::Unlocked);

        // An open-file-description lock has no owning pid, even when it is
        // this process that took it.
        let holder = ForeignLockHolder::shared(db.path());
        assert_eq!(db.lock_state(me), LockState::Error);
        assert_eq!(probe_path(db.path(), me), LockState::Error);
        assert_eq!(
            db.lock_state(ProcessFilter::AnyProcess),
            LockState::LockedByTarget
        );

        holder.release();
        assert_eq!(db.lock_state(me), LockState::Unlocked);
    }

    #[test]
    fn forced_truncate_ignores_foreign_lock() {
        let db = TestDatabase::with_config(impatient());
        insert_rows(&db, 5);
        write_shm(db.path());

        let _holder = ForeignLockHolder::reserved(db.path());
        let options = TruncateOptions::new().force(true);
        db.truncate(Some(options)).unwrap();

        assert_eq!(db.main_len(), 0);
        assert!(shm_path(db.path()).exists());
        let header = shm_header(db.path());
        assert!(header.iter().any(|b| *b != SHM_FIXTURE_BYTE));
    }

    #[test]
    fn replace_blocked_by_foreign_exclusive_lock() {
        let source = TestDatabase::populated(1024, 2);
        let dest = TestDatabase::with_config(impatient());
        insert_rows(&dest, 7);
        let before = fs::read(dest.path()).unwrap();

        let holder = ForeignLockHolder::exclusive(dest.path());
        let err = dest.replace(&source).unwrap_err();
        assert!(matches!(err, ReplaceError::LockUnavailable));
        assert_eq!(fs::read(dest.path()).unwrap(), before);
        drop(holder);

        dest.replace(&source).unwrap();
        assert_eq!(dest.rows().unwrap(), source.rows().unwrap());
    }

    #[test]
    fn replace_from_write_locked_source_is_unreadable() {
        let source = TestDatabase::with_config(impatient());
        insert_rows(&source, 2);
        let dest = TestDatabase::populated(1024, 1);
        let before = fs::read(dest.path()).unwrap();

        let _holder = ForeignLockHolder::exclusive(source.path());
        let err = dest.replace(&source).unwrap_err();
        assert!(matches!(err, ReplaceError::SourceUnreadable { .. }));
        assert_eq!(fs::read(dest.path()).unwrap(), before);
    }
}
