//! Whole-database replacement.
//!
//! The source is read into an [`Image`] under SHARED, then rendered at the
//! destination's page size. Rows are re-packed, never copied as raw pages,
//! so any pair of page sizes works. The destination is rewritten under
//! EXCLUSIVE through a rollback journal:
//!
//! ```text
//! WAL checkpointed -> WAL truncated -> journal written -> main written
//!     -> journal removed -> shm scrambled
//! ```
//!
//! Until the journal is removed a crash rolls the destination back to its
//! old content. Readers wait on the lock, so they see old or new, never a
//! mix.

use crate::cache::purge_eligible_page_cache_memory;
use crate::error::{CoreError, CoreResult, MutationStep, ReplaceError};
use crate::format::header::DatabaseHeader;
use crate::image::Image;
use crate::lock::LockLevel;
use crate::pager::Pager;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Copies `source`'s content over `dest`.
///
/// `hooked` tells whether `dest` has a pre-update hook; no notifications
/// are synthesized for replaced rows.
pub(crate) fn replace(dest: &mut Pager, source: &mut Pager, hooked: bool) -> Result<(), ReplaceError> {
    if Arc::ptr_eq(&dest.entry, &source.entry) {
        return Err(ReplaceError::invalid_options(
            "source and destination are the same database file",
        ));
    }
    if dest.is_read_only() {
        return Err(ReplaceError::IoFailure {
            last_completed: None,
            source: CoreError::ReadOnly,
        });
    }

    let content = read_source(source)?;
    purge_eligible_page_cache_memory();

    let current = match dest.header() {
        Ok(header) => header,
        Err(CoreError::Busy) => return Err(ReplaceError::LockUnavailable),
        Err(e) => {
            return Err(ReplaceError::IoFailure {
                last_completed: None,
                source: e,
            })
        }
    };
    let image = reformat(content, &current)?;
    let pages = render(image.clone())?;

    if hooked {
        warn!(
            path = %dest.path().display(),
            "replace does not report replaced rows to the pre-update hook"
        );
    }

    let prev = dest.lock.level();
    match dest.acquire(LockLevel::Exclusive) {
        Ok(()) => {}
        Err(CoreError::Busy) => return Err(ReplaceError::LockUnavailable),
        Err(e) => {
            return Err(ReplaceError::IoFailure {
                last_completed: None,
                source: e,
            })
        }
    }

    let settled = settle(dest, image, pages, &current);
    let mut last = None;
    let result = match &settled {
        Ok((_, pages)) => run(dest, pages, &mut last),
        Err(_) => Ok(()),
    };
    if last.is_some() {
        dest.entry.bump_reset_epoch();
    }
    dest.invalidate();
    if let Err(e) = dest.lock.unlock(prev) {
        debug!(path = %dest.path().display(), error = %e, "lock release after replace failed");
    }

    let (image, pages) = settled?;
    match result {
        Ok(()) => {
            info!(
                dest = %dest.path().display(),
                source = %source.path().display(),
                rows = image.rows.len(),
                pages = pages.len(),
                page_size = image.header.page_size,
                "database replaced"
            );
            Ok(())
        }
        Err(error) => Err(ReplaceError::IoFailure {
            last_completed: last,
            source: error,
        }),
    }
}

/// Reads the whole source, checking that nothing changed meanwhile.
fn read_source(source: &mut Pager) -> Result<Image, ReplaceError> {
    let read = source.with_lock(LockLevel::Shared, |pager| {
        let (image, before) = pager.load(false)?;
        let after = pager.current_version()?;
        Ok((image, before == after))
    });
    match read {
        Ok((image, true)) => Ok(image),
        Ok((_, false)) => Err(ReplaceError::source_unreadable(
            "source changed while it was being read",
        )),
        Err(CoreError::Busy) => Err(ReplaceError::source_unreadable("source is locked by a writer")),
        Err(e) => Err(ReplaceError::source_unreadable(e.to_string())),
    }
}

/// Checks the destination header again once EXCLUSIVE is held. A writer
/// may have re-initialized the file since it was first read, in which case
/// the rows are rendered again at the new geometry.
fn settle(
    dest: &mut Pager,
    image: Image,
    pages: Vec<Vec<u8>>,
    seen: &DatabaseHeader,
) -> Result<(Image, Vec<Vec<u8>>), ReplaceError> {
    let fresh = dest.header().map_err(|e| ReplaceError::IoFailure {
        last_completed: None,
        source: e,
    })?;
    if same_geometry(&fresh, seen) {
        return Ok((image, pages));
    }
    debug!(
        path = %dest.path().display(),
        was = seen.page_size,
        now = fresh.page_size,
        "destination re-initialized before EXCLUSIVE; rendering again"
    );
    let image = reformat(image, &fresh)?;
    let pages = render(image.clone())?;
    Ok((image, pages))
}

fn same_geometry(a: &DatabaseHeader, b: &DatabaseHeader) -> bool {
    a.page_size == b.page_size
        && a.journal_mode() == b.journal_mode()
        && a.auto_vacuum() == b.auto_vacuum()
}

fn render(mut image: Image) -> Result<Vec<Vec<u8>>, ReplaceError> {
    image.render().map_err(|e| ReplaceError::invalid_options(e.to_string()))
}

/// Moves the source rows under a header with the destination's geometry.
fn reformat(content: Image, current: &DatabaseHeader) -> Result<Image, ReplaceError> {
    let mut header = DatabaseHeader::new(
        current.page_size,
        current.journal_mode(),
        current.auto_vacuum(),
    );
    header.user_version = content.header.user_version;
    header.application_id = content.header.application_id;
    header.bump_change_counter(current.change_counter.max(content.header.change_counter));

    let mut image = Image::with_header(header);
    let max = image.max_payload();
    if let Some((rowid, payload)) = content.rows.iter().find(|(_, p)| p.len() > max) {
        return Err(ReplaceError::invalid_options(format!(
            "row {rowid} holds {} bytes, more than a {}-byte page can take",
            payload.len(),
            current.page_size
        )));
    }
    image.rows = content.rows;
    Ok(image)
}

fn run(dest: &mut Pager, pages: &[Vec<u8>], last: &mut Option<MutationStep>) -> CoreResult<()> {
    if dest.checkpoint_into_main()? {
        *last = Some(MutationStep::WalCheckpointed);
    }
    if dest.truncate_wal()? {
        *last = Some(MutationStep::WalTruncated);
    }
    dest.journal_current(pages)?;
    *last = Some(MutationStep::JournalWritten);
    dest.write_main(pages)?;
    *last = Some(MutationStep::MainWritten);
    if dest.remove_journal()? {
        *last = Some(MutationStep::JournalRemoved);
    }
    if dest.scramble_shm()? {
        *last = Some(MutationStep::ShmScrambled);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AutoVacuum, JournalMode};

    #[test]
    fn reformat_keeps_destination_geometry() {
        let mut source = Image::empty(1024, JournalMode::Rollback, AutoVacuum::Off);
        source.header.user_version = 7;
        source.header.change_counter = 40;
        source.rows.insert(1, vec![1; 300]);
        source.rows.insert(9, vec![9; 10]);

        let dest = DatabaseHeader::new(4096, JournalMode::Wal, AutoVacuum::Full);
        let image = reformat(source.clone(), &dest).unwrap();
        assert_eq!(image.header.page_size, 4096);
        assert_eq!(image.header.journal_mode(), JournalMode::Wal);
        assert_eq!(image.header.auto_vacuum(), AutoVacuum::Full);
        assert_eq!(image.header.user_version, 7);
        assert_eq!(image.header.change_counter, 41);
        assert_eq!(image.rows, source.rows);
    }

    #[test]
    fn geometry_change_under_exclusive_renders_again() {
        use crate::busy::NoRetry;
        use crate::config::Config;
        use std::time::Duration;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dest.db");
        let config = Config::default()
            .page_size(2048)
            .busy_timeout(Duration::ZERO)
            .sync_on_commit(false);
        let mut dest = Pager::open(&path, config, Arc::new(NoRetry)).unwrap();
        let mut seeded = dest.begin_write().unwrap();
        seeded.rows.insert(1, vec![1; 10]);
        let committed = dest.commit(seeded);
        dest.end_write();
        committed.unwrap();

        let seen = DatabaseHeader::new(4096, JournalMode::Rollback, AutoVacuum::Off);
        let mut source = Image::empty(1024, JournalMode::Rollback, AutoVacuum::Off);
        source.rows.insert(5, vec![5; 700]);
        let image = reformat(source.clone(), &seen).unwrap();
        let pages = render(image.clone()).unwrap();
        assert_eq!(pages[0].len(), 4096);

        dest.acquire(LockLevel::Exclusive).unwrap();
        let (image, pages) = settle(&mut dest, image, pages, &seen).unwrap();
        dest.lock.unlock(LockLevel::None).unwrap();

        assert_eq!(image.header.page_size, 2048);
        assert!(pages.iter().all(|page| page.len() == 2048));
        assert_eq!(image.rows, source.rows);
    }

    #[test]
    fn row_too_large_for_destination_is_rejected() {
        let mut source = Image::empty(8192, JournalMode::Rollback, AutoVacuum::Off);
        source.rows.insert(3, vec![0; 4000]);
        let dest = DatabaseHeader::new(1024, JournalMode::Rollback, AutoVacuum::Off);
        let err = reformat(source, &dest).unwrap_err();
        assert!(matches!(err, ReplaceError::InvalidOptions { .. }));
    }
}
