//! Table-leaf b-tree pages and the row heap stored in them.
//!
//! Page layout (the 100-byte database header precedes it on page 1):
//!
//! ```text
//! +0  u8   page type (0x0D table leaf)
//! +1  u16  first freeblock (0)
//! +3  u16  cell count
//! +5  u16  start of cell content area (0 means 65536)
//! +7  u8   fragmented free bytes (0)
//! +8  u16  cell pointer array, one per cell
//!     ...  free space
//!     ...  cells, packed against the end of the usable area
//! ```
//!
//! A cell is `varint(payload length) varint(rowid) payload`. Payloads are
//! kept small enough that no overflow pages are needed.

use crate::error::{CoreError, CoreResult};
use crate::types::RowId;
use std::collections::BTreeMap;

/// Table-leaf page type byte.
pub const LEAF_TABLE: u8 = 0x0D;

/// Size of a leaf page header.
pub const LEAF_HEADER_SIZE: usize = 8;

/// Largest row payload a page with `usable` bytes can hold without overflow.
#[must_use]
pub fn max_payload(usable: usize) -> usize {
    usable.saturating_sub(35)
}

/// Appends `value` as a 1 to 9 byte big-endian varint.
pub fn put_varint(out: &mut Vec<u8>, value: u64) {
    if value > 0x00ff_ffff_ffff_ffff {
        let mut buf = [0u8; 9];
        buf[8] = value as u8;
        let mut rest = value >> 8;
        for byte in buf[..8].iter_mut().rev() {
            *byte = (rest as u8 & 0x7f) | 0x80;
            rest >>= 7;
        }
        out.extend_from_slice(&buf);
        return;
    }

    let mut buf = [0u8; 9];
    let mut n = 0;
    let mut rest = value;
    loop {
        buf[n] = (rest as u8 & 0x7f) | 0x80;
        n += 1;
        rest >>= 7;
        if rest == 0 {
            break;
        }
    }
    buf[0] &= 0x7f;
    buf[..n].reverse();
    out.extend_from_slice(&buf[..n]);
}

/// Decodes a varint, returning the value and the number of bytes consumed.
#[must_use]
pub fn get_varint(buf: &[u8]) -> Option<(u64, usize)> {
    let mut value: u64 = 0;
    for i in 0..8 {
        let byte = *buf.get(i)?;
        value = (value << 7) | u64::from(byte & 0x7f);
        if byte & 0x80 == 0 {
            return Some((value, i + 1));
        }
    }
    let last = *buf.get(8)?;
    Some(((value << 8) | u64::from(last), 9))
}

/// Encoded length of `value` as a varint.
#[must_use]
pub fn varint_len(value: u64) -> usize {
    if value > 0x00ff_ffff_ffff_ffff {
        return 9;
    }
    let mut n = 1;
    let mut rest = value >> 7;
    while rest != 0 {
        n += 1;
        rest >>= 7;
    }
    n
}

/// Encoded length of a cell.
#[must_use]
pub fn cell_len(rowid: RowId, payload_len: usize) -> usize {
    varint_len(payload_len as u64) + varint_len(rowid as u64) + payload_len
}

fn be16(page: &[u8], offset: usize) -> usize {
    usize::from(u16::from_be_bytes([page[offset], page[offset + 1]]))
}

fn put16(page: &mut [u8], offset: usize, value: usize) {
    // 65536 wraps to 0, which is how the content-area start encodes it.
    page[offset..offset + 2].copy_from_slice(&(value as u16).to_be_bytes());
}

/// Writes a table-leaf page holding `cells` into `page`.
///
/// The caller guarantees the cells fit; see [`pack_rows`].
pub fn write_leaf(page: &mut [u8], header_offset: usize, usable: usize, cells: &[(RowId, &[u8])]) {
    page[header_offset] = LEAF_TABLE;
    put16(page, header_offset + 1, 0);
    put16(page, header_offset + 3, cells.len());
    page[header_offset + 7] = 0;

    let mut content = usable;
    let mut cell = Vec::new();
    for (i, (rowid, payload)) in cells.iter().enumerate() {
        cell.clear();
        put_varint(&mut cell, payload.len() as u64);
        put_varint(&mut cell, *rowid as u64);
        cell.extend_from_slice(payload);

        content -= cell.len();
        page[content..content + cell.len()].copy_from_slice(&cell);
        put16(page, header_offset + LEAF_HEADER_SIZE + 2 * i, content);
    }
    put16(page, header_offset + 5, content);
}

/// Reads every cell of a table-leaf page.
///
/// # Errors
///
/// Returns [`CoreError::Corrupt`] if the page is not a well-formed table leaf.
pub fn read_leaf(page: &[u8], header_offset: usize, usable: usize) -> CoreResult<Vec<(RowId, Vec<u8>)>> {
    if usable > page.len() || header_offset + LEAF_HEADER_SIZE > usable {
        return Err(CoreError::corrupt("page smaller than its header"));
    }
    if page[header_offset] != LEAF_TABLE {
        return Err(CoreError::corrupt(format!(
            "unexpected page type {:#04x}",
            page[header_offset]
        )));
    }

    let count = be16(page, header_offset + 3);
    let pointers_end = header_offset + LEAF_HEADER_SIZE + 2 * count;
    if pointers_end > usable {
        return Err(CoreError::corrupt(format!("cell count {count} overflows page")));
    }

    let mut cells = Vec::with_capacity(count);
    for i in 0..count {
        let ptr = be16(page, header_offset + LEAF_HEADER_SIZE + 2 * i);
        if ptr < pointers_end || ptr >= usable {
            return Err(CoreError::corrupt(format!("cell pointer {ptr} out of range")));
        }
        let area = &page[ptr..usable];
        let (len, a) = get_varint(area).ok_or_else(|| CoreError::corrupt("truncated cell"))?;
        let (rowid, b) =
            get_varint(&area[a..]).ok_or_else(|| CoreError::corrupt("truncated cell"))?;
        let len = usize::try_from(len).map_err(|_| CoreError::corrupt("cell length overflow"))?;
        if len > max_payload(usable) {
            return Err(CoreError::corrupt(format!(
                "payload of {len} bytes needs overflow pages"
            )));
        }
        let start = a + b;
        let payload = area
            .get(start..start + len)
            .ok_or_else(|| CoreError::corrupt("cell runs past page end"))?;
        cells.push((rowid as RowId, payload.to_vec()));
    }
    Ok(cells)
}

/// Lays rows out on as few table-leaf pages as a greedy fill allows, in
/// ascending rowid order. Each returned page is `page_size` bytes.
///
/// # Errors
///
/// Returns [`CoreError::RowTooLarge`] if a payload cannot fit on one page.
pub fn pack_rows(
    rows: &BTreeMap<RowId, Vec<u8>>,
    page_size: usize,
    usable: usize,
) -> CoreResult<Vec<Vec<u8>>> {
    let capacity = usable - LEAF_HEADER_SIZE;
    let max = max_payload(usable);

    let mut pages = Vec::new();
    let mut pending: Vec<(RowId, &[u8])> = Vec::new();
    let mut used = 0usize;

    let mut flush = |pending: &mut Vec<(RowId, &[u8])>| {
        let mut page = vec![0u8; page_size];
        write_leaf(&mut page, 0, usable, pending);
        pages.push(page);
        pending.clear();
    };

    for (rowid, payload) in rows {
        if payload.len() > max {
            return Err(CoreError::RowTooLarge {
                rowid: *rowid,
                len: payload.len(),
                max,
            });
        }
        let need = 2 + cell_len(*rowid, payload.len());
        if used + need > capacity {
            flush(&mut pending);
            used = 0;
        }
        pending.push((*rowid, payload.as_slice()));
        used += need;
    }
    if !pending.is_empty() {
        flush(&mut pending);
    }
    Ok(pages)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn varint_boundaries() {
        for (value, len) in [
            (0u64, 1usize),
            (127, 1),
            (128, 2),
            (16_383, 2),
            (16_384, 3),
            (0x00ff_ffff_ffff_ffff, 8),
            (0x0100_0000_0000_0000, 9),
            (u64::MAX, 9),
        ] {
            let mut buf = Vec::new();
            put_varint(&mut buf, value);
            assert_eq!(buf.len(), len, "value {value:#x}");
            assert_eq!(varint_len(value), len);
            assert_eq!(get_varint(&buf), Some((value, len)));
        }
    }

    #[test]
    fn known_varint_bytes() {
        let mut buf = Vec::new();
        put_varint(&mut buf, 300);
        assert_eq!(buf, vec![0x82, 0x2c]);
    }

    #[test]
    fn empty_leaf_with_max_page_encodes_content_start_as_zero() {
        let mut page = vec![0u8; 65_536];
        write_leaf(&mut page, 100, 65_536, &[]);
        assert_eq!(page[100], LEAF_TABLE);
        assert_eq!(&page[105..107], &[0, 0]);
        assert!(read_leaf(&page, 100, 65_536).unwrap().is_empty());
    }

    #[test]
    fn leaf_round_trip_keeps_order() {
        let mut page = vec![0u8; 1024];
        let cells: Vec<(RowId, &[u8])> = vec![(1, &b"one"[..]), (2, &b""[..]), (-5, &b"neg"[..])];
        write_leaf(&mut page, 0, 1024, &cells);
        let read = read_leaf(&page, 0, 1024).unwrap();
        assert_eq!(read.len(), 3);
        assert_eq!(read[0], (1, b"one".to_vec()));
        assert_eq!(read[2], (-5, b"neg".to_vec()));
    }

    #[test]
    fn read_leaf_rejects_wrong_type() {
        let page = vec![0u8; 512];
        assert!(matches!(
            read_leaf(&page, 0, 512),
            Err(CoreError::Corrupt { .. })
        ));
    }

    #[test]
    fn oversized_row_is_rejected() {
        let mut rows = BTreeMap::new();
        rows.insert(1, vec![0u8; 512 - 34]);
        assert!(matches!(
            pack_rows(&rows, 512, 512),
            Err(CoreError::RowTooLarge { rowid: 1, max: 477, .. })
        ));
    }

    #[test]
    fn smaller_pages_need_more_of_them() {
        // 104 bytes per row with its pointer: 39 fit in 4096, 9 in 1024.
        let rows: BTreeMap<RowId, Vec<u8>> = (0..30).map(|i| (i, vec![i as u8; 100])).collect();
        let big = pack_rows(&rows, 4096, 4096).unwrap();
        let small = pack_rows(&rows, 1024, 1024).unwrap();
        assert_eq!(big.len(), 1);
        assert_eq!(small.len(), 4);
    }

    proptest! {
        #[test]
        fn packed_rows_read_back_in_order(
            rows in proptest::collection::btree_map(
                any::<i64>(),
                proptest::collection::vec(any::<u8>(), 0..400),
                0..60,
            ),
            shift in 0u32..4,
        ) {
            let page_size = 1024usize << shift;
            let pages = pack_rows(&rows, page_size, page_size).unwrap();
            let mut back = Vec::new();
            for page in &pages {
                prop_assert_eq!(page.len(), page_size);
                back.extend(read_leaf(page, 0, page_size).unwrap());
            }
            let expected: Vec<(RowId, Vec<u8>)> = rows.into_iter().collect();
            prop_assert_eq!(back, expected);
        }
    }
}
