//! Write transactions over the row heap.

use crate::error::{CoreError, CoreResult};
use crate::format::header::DatabaseHeader;
use crate::hooks::{PreUpdateEvent, PreUpdateHook, PreUpdateOp};
use crate::image::Image;
use crate::types::RowId;
use std::fmt;

/// An open write transaction.
///
/// Changes live in memory until the closure passed to
/// [`crate::Connection::transaction`] returns `Ok`, at which point they are
/// committed together. Returning `Err` discards them.
pub struct Transaction<'a> {
    image: Image,
    hook: Option<&'a mut PreUpdateHook>,
    changes: usize,
}

impl fmt::Debug for Transaction<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("rows", &self.image.rows.len())
            .field("changes", &self.changes)
            .field("hooked", &self.hook.is_some())
            .finish()
    }
}

impl<'a> Transaction<'a> {
    pub(crate) fn new(image: Image, hook: Option<&'a mut PreUpdateHook>) -> Self {
        Self {
            image,
            hook,
            changes: 0,
        }
    }

    pub(crate) fn into_parts(self) -> (Image, usize) {
        (self.image, self.changes)
    }

    fn notify(&mut self, op: PreUpdateOp, rowid: RowId, old: Option<&[u8]>, new: Option<&[u8]>) {
        if let Some(hook) = self.hook.as_deref_mut() {
            hook(&PreUpdateEvent { op, rowid, old, new });
        }
    }

    fn check_size(&self, rowid: RowId, payload: &[u8]) -> CoreResult<()> {
        let max = self.image.max_payload();
        if payload.len() > max {
            return Err(CoreError::RowTooLarge {
                rowid,
                len: payload.len(),
                max,
            });
        }
        Ok(())
    }

    /// Header as it will be committed, minus the change counter bump.
    #[must_use]
    pub fn header(&self) -> &DatabaseHeader {
        &self.image.header
    }

    /// Sets the user version stored in the header.
    pub fn set_user_version(&mut self, version: u32) {
        if self.image.header.user_version != version {
            self.image.header.user_version = version;
            self.changes += 1;
        }
    }

    /// Returns a row's payload.
    #[must_use]
    pub fn get(&self, rowid: RowId) -> Option<&[u8]> {
        self.image.rows.get(&rowid).map(Vec::as_slice)
    }

    /// Iterates over rows in rowid order.
    pub fn rows(&self) -> impl Iterator<Item = (RowId, &[u8])> {
        self.image.rows.iter().map(|(id, data)| (*id, data.as_slice()))
    }

    /// Number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.image.rows.len()
    }

    /// Returns true if there are no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.image.rows.is_empty()
    }

    /// Rowid the next [`Self::insert`] will use, or `None` once the largest
    /// rowid is `i64::MAX`.
    #[must_use]
    pub fn next_rowid(&self) -> Option<RowId> {
        match self.image.rows.last_key_value() {
            None => Some(1),
            Some((last, _)) => last.checked_add(1),
        }
    }

    /// Appends a row after the current largest rowid.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::RowTooLarge`] if the payload cannot fit in a page,
    /// and [`CoreError::InvalidArgument`] if no rowid is left above the
    /// largest one.
    pub fn insert(&mut self, payload: Vec<u8>) -> CoreResult<RowId> {
        let rowid = self
            .next_rowid()
            .ok_or_else(|| CoreError::invalid_argument("rowid space exhausted"))?;
        self.put(rowid, payload)?;
        Ok(rowid)
    }

    /// Inserts or replaces a row.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::RowTooLarge`] if the payload cannot fit in a page.
    pub fn put(&mut self, rowid: RowId, payload: Vec<u8>) -> CoreResult<()> {
        self.check_size(rowid, &payload)?;
        let old = self.image.rows.remove(&rowid);
        let op = if old.is_some() {
            PreUpdateOp::Update
        } else {
            PreUpdateOp::Insert
        };
        self.notify(op, rowid, old.as_deref(), Some(&payload));
        self.image.rows.insert(rowid, payload);
        self.changes += 1;
        Ok(())
    }

    /// Removes a row. Returns false if it did not exist.
    pub fn delete(&mut self, rowid: RowId) -> bool {
        match self.image.rows.remove(&rowid) {
            Some(old) => {
                self.notify(PreUpdateOp::Delete, rowid, Some(&old), None);
                self.changes += 1;
                true
            }
            None => false,
        }
    }

    /// Removes every row.
    pub fn clear(&mut self) {
        let ids: Vec<RowId> = self.image.rows.keys().copied().collect();
        for rowid in ids {
            self.delete(rowid);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AutoVacuum, JournalMode};
    use std::sync::{Arc, Mutex};

    fn image() -> Image {
        Image::empty(512, JournalMode::Rollback, AutoVacuum::Off)
    }

    fn boxed(f: impl FnMut(&PreUpdateEvent<'_>) + Send + 'static) -> PreUpdateHook {
        Box::new(f)
    }

    #[test]
    fn insert_assigns_increasing_rowids() {
        let mut txn = Transaction::new(image(), None);
        assert_eq!(txn.next_rowid(), Some(1));
        assert_eq!(txn.insert(b"a".to_vec()).unwrap(), 1);
        txn.put(10, b"b".to_vec()).unwrap();
        assert_eq!(txn.insert(b"c".to_vec()).unwrap(), 11);
        assert_eq!(txn.len(), 3);
        assert_eq!(txn.get(10), Some(&b"b"[..]));
    }

    #[test]
    fn insert_after_max_rowid_fails_without_overwriting() {
        let mut txn = Transaction::new(image(), None);
        txn.put(RowId::MAX, b"first".to_vec()).unwrap();
        assert_eq!(txn.next_rowid(), None);

        let err = txn.insert(b"second".to_vec()).unwrap_err();
        assert!(matches!(err, CoreError::InvalidArgument { .. }));
        assert_eq!(txn.len(), 1);
        assert_eq!(txn.get(RowId::MAX), Some(&b"first"[..]));
    }

    #[test]
    fn oversized_row_is_rejected() {
        let mut txn = Transaction::new(image(), None);
        let max = txn.image.max_payload();
        assert!(txn.put(1, vec![0; max]).is_ok());
        let err = txn.put(2, vec![0; max + 1]).unwrap_err();
        assert!(matches!(err, CoreError::RowTooLarge { rowid: 2, .. }));
        assert_eq!(txn.len(), 1);
    }

    #[test]
    fn hook_sees_every_change_before_it_applies() {
        let seen: Arc<Mutex<Vec<(PreUpdateOp, RowId, Option<Vec<u8>>)>>> = Arc::default();
        let sink = Arc::clone(&seen);
        let mut hook = boxed(move |event| {
            sink.lock()
                .unwrap()
                .push((event.op, event.rowid, event.old.map(<[u8]>::to_vec)));
        });

        let mut txn = Transaction::new(image(), Some(&mut hook));
        txn.put(1, b"one".to_vec()).unwrap();
        txn.put(1, b"uno".to_vec()).unwrap();
        assert!(txn.delete(1));
        assert!(!txn.delete(1));
        let (_, changes) = txn.into_parts();
        assert_eq!(changes, 3);

        let seen = seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![
                (PreUpdateOp::Insert, 1, None),
                (PreUpdateOp::Update, 1, Some(b"one".to_vec())),
                (PreUpdateOp::Delete, 1, Some(b"uno".to_vec())),
            ]
        );
    }
}
