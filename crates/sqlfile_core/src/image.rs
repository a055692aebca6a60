//! Logical content of a database: its header and its rows.
//!
//! Page 1 holds the header and an empty table leaf. Rows live on pages
//! 2..N in ascending rowid order. Two images with equal rows are the same
//! database whatever their page sizes, which is what lets a replace
//! re-page content instead of copying bytes.

use crate::error::{CoreError, CoreResult};
use crate::format::header::{DatabaseHeader, HEADER_SIZE};
use crate::format::page;
use crate::types::{AutoVacuum, JournalMode, RowId};
use std::collections::BTreeMap;

/// Header plus rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    /// Database header.
    pub header: DatabaseHeader,
    /// Rows by rowid.
    pub rows: BTreeMap<RowId, Vec<u8>>,
}

impl Image {
    /// An image with no rows.
    #[must_use]
    pub fn empty(page_size: u32, journal_mode: JournalMode, auto_vacuum: AutoVacuum) -> Self {
        Self::with_header(DatabaseHeader::new(page_size, journal_mode, auto_vacuum))
    }

    /// An image with no rows and the given header.
    #[must_use]
    pub fn with_header(header: DatabaseHeader) -> Self {
        Self {
            header,
            rows: BTreeMap::new(),
        }
    }

    /// Largest row payload this image's page size allows.
    #[must_use]
    pub fn max_payload(&self) -> usize {
        page::max_payload(self.header.usable_size())
    }

    /// Encodes page 1 for `header`.
    #[must_use]
    pub fn page_one(header: &DatabaseHeader) -> Vec<u8> {
        let mut page = vec![0u8; header.page_size as usize];
        page[..HEADER_SIZE].copy_from_slice(&header.encode());
        page::write_leaf(&mut page, HEADER_SIZE, header.usable_size(), &[]);
        page
    }

    /// Lays the image out in pages, recording the resulting page count in
    /// the header first.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::RowTooLarge`] if a row does not fit on a page.
    pub fn render(&mut self) -> CoreResult<Vec<Vec<u8>>> {
        let row_pages = page::pack_rows(
            &self.rows,
            self.header.page_size as usize,
            self.header.usable_size(),
        )?;
        self.header.page_count = u32::try_from(row_pages.len() + 1)
            .map_err(|_| CoreError::invalid_argument("database would exceed 2^32 pages"))?;

        let mut pages = Vec::with_capacity(row_pages.len() + 1);
        pages.push(Self::page_one(&self.header));
        pages.extend(row_pages);
        Ok(pages)
    }

    /// Reads the rows stored on one page other than page 1.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Corrupt`] if the page is not a table leaf.
    pub fn absorb_page(&mut self, page: &[u8]) -> CoreResult<()> {
        for (rowid, payload) in page::read_leaf(page, 0, self.header.usable_size())? {
            self.rows.insert(rowid, payload);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_image_is_one_page() {
        let mut image = Image::empty(1024, JournalMode::Rollback, AutoVacuum::Off);
        let pages = image.render().unwrap();
        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0].len(), 1024);
        assert_eq!(pages[0][HEADER_SIZE], page::LEAF_TABLE);
        assert_eq!(image.header.page_count, 1);
        assert_eq!(DatabaseHeader::decode(&pages[0]).unwrap(), image.header);
    }

    #[test]
    fn rows_survive_rendering() {
        let mut image = Image::empty(512, JournalMode::Wal, AutoVacuum::Full);
        for rowid in 1..=40 {
            image.rows.insert(rowid, vec![rowid as u8; 100]);
        }
        let pages = image.render().unwrap();
        assert!(pages.len() > 2);
        assert_eq!(image.header.page_count as usize, pages.len());

        let mut back = Image::with_header(DatabaseHeader::decode(&pages[0]).unwrap());
        for page in &pages[1..] {
            back.absorb_page(page).unwrap();
        }
        assert_eq!(back.rows, image.rows);
    }

    #[test]
    fn oversized_row_is_rejected() {
        let mut image = Image::empty(512, JournalMode::Rollback, AutoVacuum::Off);
        image.rows.insert(7, vec![0u8; image.max_payload() + 1]);
        assert!(matches!(
            image.render(),
            Err(CoreError::RowTooLarge { rowid: 7, .. })
        ));
    }
}
