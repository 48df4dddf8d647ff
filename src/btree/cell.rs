//! Build and parse the four cell shapes.
//!
//! Cell formats, in order of appearance on the page:
//!
//! Table B-Tree Leaf Cell (page type 0x0d):
//!   varint payload size ‖ varint rowid ‖ inline payload ‖ 4-byte first
//!   overflow page, omitted when the whole payload is inline.
//!
//! Table B-Tree Interior Cell (0x05):
//!   4-byte left child page ‖ varint rowid key.
//!
//! Index B-Tree Leaf Cell (0x0a):
//!   varint payload size ‖ inline payload ‖ optional overflow pointer.
//!
//! Index B-Tree Interior Cell (0x02):
//!   4-byte left child page ‖ varint payload size ‖ inline payload ‖
//!   optional overflow pointer.

use byteorder::{BigEndian, ByteOrder};

use crate::error::{Error, Result};
use crate::pager::PageNum;
use crate::varint;

use super::page::PageType;

/// Largest payload stored fully inline for a cell on a page of `usable`
/// bytes. Table leaves use U-35; index cells use ((U-12)*64/255)-23.
pub fn max_local(usable: usize, is_index: bool) -> usize {
    if is_index {
        (usable - 12) * 64 / 255 - 23
    } else {
        usable - 35
    }
}

/// Smallest inline portion of a spilled payload: ((U-12)*32/255)-23.
pub fn min_local(usable: usize) -> usize {
    (usable - 12) * 32 / 255 - 23
}

/// How many payload bytes stay inline for a payload of `payload_len`.
///
/// Returns `(inline_len, spills)`. Under the threshold everything is
/// inline; over it, the inline portion is m + ((payload − m) mod (U − 4)),
/// falling back to m when that lands past the threshold, so overflow pages
/// are filled completely.
pub fn local_payload(usable: usize, payload_len: usize, is_index: bool) -> (usize, bool) {
    let x = max_local(usable, is_index);
    if payload_len <= x {
        return (payload_len, false);
    }
    let m = min_local(usable);
    let k = m + (payload_len - m) % (usable - 4);
    if k <= x {
        (k, true)
    } else {
        (m, true)
    }
}

#[derive(Debug, PartialEq)]
pub struct TableLeafCell<'a> {
    pub rowid: i64,
    pub payload_len: usize,
    pub inline: &'a [u8],
    pub overflow: Option<PageNum>,
}

#[derive(Debug, PartialEq, Eq)]
pub struct TableInteriorCell {
    pub left_child: PageNum,
    pub key: i64,
}

#[derive(Debug, PartialEq)]
pub struct IndexLeafCell<'a> {
    pub payload_len: usize,
    pub inline: &'a [u8],
    pub overflow: Option<PageNum>,
}

#[derive(Debug, PartialEq)]
pub struct IndexInteriorCell<'a> {
    pub left_child: PageNum,
    pub payload_len: usize,
    pub inline: &'a [u8],
    pub overflow: Option<PageNum>,
}

/// Builds a table leaf cell. `inline_len` comes from [`local_payload`];
/// when it is shorter than the payload, `overflow` must name the first
/// chain page.
pub fn build_table_leaf(
    rowid: i64,
    payload: &[u8],
    inline_len: usize,
    overflow: Option<PageNum>,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(inline_len + 22);
    varint::push_varint(&mut out, payload.len() as i64);
    varint::push_varint(&mut out, rowid);
    out.extend_from_slice(&payload[..inline_len]);
    if let Some(pgnum) = overflow {
        let mut ptr = [0u8; 4];
        BigEndian::write_u32(&mut ptr, pgnum as u32);
        out.extend_from_slice(&ptr);
    }
    out
}

pub fn build_table_interior(left_child: PageNum, key: i64) -> Vec<u8> {
    let mut out = Vec::with_capacity(13);
    let mut ptr = [0u8; 4];
    BigEndian::write_u32(&mut ptr, left_child as u32);
    out.extend_from_slice(&ptr);
    varint::push_varint(&mut out, key);
    out
}

pub fn build_index_leaf(payload: &[u8], inline_len: usize, overflow: Option<PageNum>) -> Vec<u8> {
    let mut out = Vec::with_capacity(inline_len + 13);
    varint::push_varint(&mut out, payload.len() as i64);
    out.extend_from_slice(&payload[..inline_len]);
    if let Some(pgnum) = overflow {
        let mut ptr = [0u8; 4];
        BigEndian::write_u32(&mut ptr, pgnum as u32);
        out.extend_from_slice(&ptr);
    }
    out
}

pub fn build_index_interior(
    left_child: PageNum,
    payload: &[u8],
    inline_len: usize,
    overflow: Option<PageNum>,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(inline_len + 17);
    let mut ptr = [0u8; 4];
    BigEndian::write_u32(&mut ptr, left_child as u32);
    out.extend_from_slice(&ptr);
    varint::push_varint(&mut out, payload.len() as i64);
    out.extend_from_slice(&payload[..inline_len]);
    if let Some(pgnum) = overflow {
        let mut ptr = [0u8; 4];
        BigEndian::write_u32(&mut ptr, pgnum as u32);
        out.extend_from_slice(&ptr);
    }
    out
}

pub fn parse_table_leaf(cell: &[u8], usable: usize) -> Result<TableLeafCell<'_>> {
    let (payload_len, n1) = varint::read_varint(cell);
    let (rowid, n2) = varint::read_varint(&cell[n1..]);
    let payload_len = payload_len as usize;
    let (inline_len, spills) = local_payload(usable, payload_len, false);
    let start = n1 + n2;
    if cell.len() < start + inline_len + if spills { 4 } else { 0 } {
        return Err(Error::corrupt(0, "table leaf cell truncated"));
    }
    let inline = &cell[start..start + inline_len];
    let overflow = if spills {
        Some(BigEndian::read_u32(&cell[start + inline_len..]) as PageNum)
    } else {
        None
    };
    Ok(TableLeafCell {
        rowid,
        payload_len,
        inline,
        overflow,
    })
}

pub fn parse_table_interior(cell: &[u8]) -> Result<TableInteriorCell> {
    if cell.len() < 5 {
        return Err(Error::corrupt(0, "table interior cell truncated"));
    }
    let left_child = BigEndian::read_u32(cell) as PageNum;
    let (key, _) = varint::read_varint(&cell[4..]);
    Ok(TableInteriorCell { left_child, key })
}

pub fn parse_index_leaf(cell: &[u8], usable: usize) -> Result<IndexLeafCell<'_>> {
    let (payload_len, n1) = varint::read_varint(cell);
    let payload_len = payload_len as usize;
    let (inline_len, spills) = local_payload(usable, payload_len, true);
    if cell.len() < n1 + inline_len + if spills { 4 } else { 0 } {
        return Err(Error::corrupt(0, "index leaf cell truncated"));
    }
    let inline = &cell[n1..n1 + inline_len];
    let overflow = if spills {
        Some(BigEndian::read_u32(&cell[n1 + inline_len..]) as PageNum)
    } else {
        None
    };
    Ok(IndexLeafCell {
        payload_len,
        inline,
        overflow,
    })
}

pub fn parse_index_interior(cell: &[u8], usable: usize) -> Result<IndexInteriorCell<'_>> {
    if cell.len() < 5 {
        return Err(Error::corrupt(0, "index interior cell truncated"));
    }
    let left_child = BigEndian::read_u32(cell) as PageNum;
    let (payload_len, n1) = varint::read_varint(&cell[4..]);
    let payload_len = payload_len as usize;
    let (inline_len, spills) = local_payload(usable, payload_len, true);
    let start = 4 + n1;
    if cell.len() < start + inline_len + if spills { 4 } else { 0 } {
        return Err(Error::corrupt(0, "index interior cell truncated"));
    }
    let inline = &cell[start..start + inline_len];
    let overflow = if spills {
        Some(BigEndian::read_u32(&cell[start + inline_len..]) as PageNum)
    } else {
        None
    };
    Ok(IndexInteriorCell {
        left_child,
        payload_len,
        inline,
        overflow,
    })
}

/// Total on-page size of the cell starting at `cell[0]`.
pub fn cell_total_size(cell: &[u8], page_type: PageType, usable: usize) -> Result<usize> {
    match page_type {
        PageType::TableInterior => {
            if cell.len() < 5 {
                return Err(Error::corrupt(0, "table interior cell truncated"));
            }
            let (_, n) = varint::read_varint(&cell[4..]);
            Ok(4 + n)
        }
        PageType::TableLeaf => {
            let (payload_len, n1) = varint::read_varint(cell);
            let (_, n2) = varint::read_varint(&cell[n1..]);
            let (inline_len, spills) = local_payload(usable, payload_len as usize, false);
            Ok(n1 + n2 + inline_len + if spills { 4 } else { 0 })
        }
        PageType::IndexLeaf => {
            let (payload_len, n1) = varint::read_varint(cell);
            let (inline_len, spills) = local_payload(usable, payload_len as usize, true);
            Ok(n1 + inline_len + if spills { 4 } else { 0 })
        }
        PageType::IndexInterior => {
            if cell.len() < 5 {
                return Err(Error::corrupt(0, "index interior cell truncated"));
            }
            let (payload_len, n1) = varint::read_varint(&cell[4..]);
            let (inline_len, spills) = local_payload(usable, payload_len as usize, true);
            Ok(4 + n1 + inline_len + if spills { 4 } else { 0 })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const USABLE: usize = 4096;

    #[test]
    fn test_table_leaf_round_trip() {
        let payload = vec![0xabu8; 100];
        let cell = build_table_leaf(42, &payload, 100, None);
        let parsed = parse_table_leaf(&cell, USABLE).unwrap();
        assert_eq!(parsed.rowid, 42);
        assert_eq!(parsed.payload_len, 100);
        assert_eq!(parsed.inline, &payload[..]);
        assert_eq!(parsed.overflow, None);
        assert_eq!(cell_total_size(&cell, PageType::TableLeaf, USABLE).unwrap(), cell.len());
    }

    #[test]
    fn test_table_leaf_with_overflow_pointer() {
        // A payload past the threshold ends with a 4-byte next-page pointer.
        let payload = vec![0x5au8; USABLE];
        let (inline_len, spills) = local_payload(USABLE, payload.len(), false);
        assert!(spills);
        let cell = build_table_leaf(7, &payload, inline_len, Some(99));
        let parsed = parse_table_leaf(&cell, USABLE).unwrap();
        assert_eq!(parsed.payload_len, USABLE);
        assert_eq!(parsed.inline.len(), inline_len);
        assert_eq!(parsed.overflow, Some(99));
        assert_eq!(&cell[cell.len() - 4..], &[0, 0, 0, 99]);
    }

    #[test]
    fn test_table_interior_round_trip() {
        let cell = build_table_interior(12, 1_000_000);
        let parsed = parse_table_interior(&cell).unwrap();
        assert_eq!(parsed, TableInteriorCell { left_child: 12, key: 1_000_000 });
        assert_eq!(cell_total_size(&cell, PageType::TableInterior, USABLE).unwrap(), cell.len());
    }

    #[test]
    fn test_index_cells_round_trip() {
        let payload = b"name_0100\x01\x65".to_vec();
        let leaf = build_index_leaf(&payload, payload.len(), None);
        let parsed = parse_index_leaf(&leaf, USABLE).unwrap();
        assert_eq!(parsed.inline, &payload[..]);
        assert_eq!(parsed.overflow, None);

        let interior = build_index_interior(5, &payload, payload.len(), None);
        let parsed = parse_index_interior(&interior, USABLE).unwrap();
        assert_eq!(parsed.left_child, 5);
        assert_eq!(parsed.inline, &payload[..]);
        assert_eq!(
            cell_total_size(&interior, PageType::IndexInterior, USABLE).unwrap(),
            interior.len()
        );
    }

    #[test]
    fn test_threshold_math_4096() {
        // For usable = 4096: table leaf spills past 4061, index past 1002.
        assert_eq!(max_local(4096, false), 4061);
        assert_eq!(max_local(4096, true), 1002);
        assert_eq!(min_local(4096), 489);
        assert_eq!(local_payload(4096, 4061, false), (4061, false));
        let (inline, spills) = local_payload(4096, 4100, false);
        assert!(spills);
        assert!(inline <= 4061 && inline >= 489);
        // Everything not inline must fit one overflow page for the write cap.
        assert!(4100 - inline <= 4096 - 4);
    }
}
