//! Layout of a single b-tree page.
//!
//! A b-tree page is divided into regions in the following order
//! 1. The 100-byte database file header (found on page 1 only)
//! 2. The 8 or 12 byte b-tree page header
//! 3. The cell pointer array
//! 4. Unallocated space
//! 5. The cell content area
//! 6. The reserved region
//!
//! The cell pointer array grows upward from the header; cells are packed
//! downward from the end of the usable area. The free space of a page is
//! the unallocated gap plus the freeblock chain plus the fragment counter,
//! and defragmentation folds the latter two back into the gap without
//! reordering cell pointers.

use byteorder::{BigEndian, ByteOrder};

use crate::error::{Error, Result};
use crate::pager::PageNum;

use super::cell;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageType {
    IndexInterior,
    TableInterior,
    IndexLeaf,
    TableLeaf,
}

impl PageType {
    pub fn from_flag(pgnum: PageNum, flag: u8) -> Result<PageType> {
        match flag {
            0x02 => Ok(PageType::IndexInterior),
            0x05 => Ok(PageType::TableInterior),
            0x0a => Ok(PageType::IndexLeaf),
            0x0d => Ok(PageType::TableLeaf),
            _ => Err(Error::corrupt(pgnum, "invalid b-tree page type flag")),
        }
    }

    pub fn flag(&self) -> u8 {
        match self {
            PageType::IndexInterior => 0x02,
            PageType::TableInterior => 0x05,
            PageType::IndexLeaf => 0x0a,
            PageType::TableLeaf => 0x0d,
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, PageType::IndexLeaf | PageType::TableLeaf)
    }

    pub fn is_table(&self) -> bool {
        matches!(self, PageType::TableInterior | PageType::TableLeaf)
    }

    pub fn is_index(&self) -> bool {
        !self.is_table()
    }

    /// 8 bytes on leaves, 12 on interior pages (right-most child pointer).
    pub fn header_len(&self) -> usize {
        if self.is_leaf() {
            8
        } else {
            12
        }
    }
}

/// The page-1 file header occupies the first 100 bytes; the b-tree header
/// of every other page starts at offset 0.
pub fn btree_start_offset(pgnum: PageNum) -> usize {
    match pgnum {
        1 => 100,
        _ => 0,
    }
}

/// The b-tree page header.
#[derive(Debug, Clone)]
pub struct PageHeader {
    pub page_type: PageType,
    pub first_freeblock: usize,
    pub ncells: usize,
    pub content_start: usize,
    pub fragmented_bytes: u8,
    pub rightmost: Option<PageNum>,
}

pub fn parse_page_header(page: &[u8], pgnum: PageNum) -> Result<PageHeader> {
    let off = btree_start_offset(pgnum);
    if page.len() < off + 8 {
        return Err(Error::corrupt(pgnum, "page too small for b-tree header"));
    }
    // Offset	Size	Description
    // 0	1	Page type flag.
    let page_type = PageType::from_flag(pgnum, page[off])?;
    // 1	2	Start of the first freeblock, or zero.
    let first_freeblock = BigEndian::read_u16(&page[off + 1..]) as usize;
    // 3	2	Number of cells on the page.
    let ncells = BigEndian::read_u16(&page[off + 3..]) as usize;
    // 5	2	Start of the cell content area; zero encodes 65536.
    let content_start = match BigEndian::read_u16(&page[off + 5..]) {
        0 => 65536,
        x => x as usize,
    };
    // 7	1	Number of fragmented free bytes in the content area.
    let fragmented_bytes = page[off + 7];
    // 8	4	Right-most child pointer, interior pages only.
    let rightmost = if page_type.is_leaf() {
        None
    } else {
        if page.len() < off + 12 {
            return Err(Error::corrupt(pgnum, "interior page too small for header"));
        }
        Some(BigEndian::read_u32(&page[off + 8..]) as PageNum)
    };
    Ok(PageHeader {
        page_type,
        first_freeblock,
        ncells,
        content_start,
        fragmented_bytes,
        rightmost,
    })
}

pub fn write_page_header(page: &mut [u8], pgnum: PageNum, hdr: &PageHeader) {
    let off = btree_start_offset(pgnum);
    page[off] = hdr.page_type.flag();
    BigEndian::write_u16(&mut page[off + 1..], hdr.first_freeblock as u16);
    BigEndian::write_u16(&mut page[off + 3..], hdr.ncells as u16);
    let cs = if hdr.content_start == 65536 { 0 } else { hdr.content_start as u16 };
    BigEndian::write_u16(&mut page[off + 5..], cs);
    page[off + 7] = hdr.fragmented_bytes;
    if let Some(rm) = hdr.rightmost {
        BigEndian::write_u32(&mut page[off + 8..], rm as u32);
    }
}

/// Formats `page` as a fresh, empty b-tree page of the given type.
/// On page 1 the leading 100 header bytes are left untouched.
pub fn init_page(page: &mut [u8], pgnum: PageNum, page_type: PageType, usable: usize) {
    let off = btree_start_offset(pgnum);
    page[off..].iter_mut().for_each(|b| *b = 0);
    write_page_header(
        page,
        pgnum,
        &PageHeader {
            page_type,
            first_freeblock: 0,
            ncells: 0,
            content_start: usable,
            fragmented_bytes: 0,
            rightmost: if page_type.is_leaf() { None } else { Some(0) },
        },
    );
}

/// End of the cell pointer array for a page holding `ncells` cells.
fn pointer_array_end(pgnum: PageNum, page_type: PageType, ncells: usize) -> usize {
    btree_start_offset(pgnum) + page_type.header_len() + 2 * ncells
}

/// Reads the `i`th entry of the cell pointer array.
pub fn cell_pointer(page: &[u8], pgnum: PageNum, hdr: &PageHeader, i: usize) -> Result<usize> {
    if i >= hdr.ncells {
        return Err(Error::corrupt(pgnum, "cell index out of range"));
    }
    let base = btree_start_offset(pgnum) + hdr.page_type.header_len();
    let ptr = BigEndian::read_u16(&page[base + 2 * i..]) as usize;
    if ptr < pointer_array_end(pgnum, hdr.page_type, hdr.ncells) || ptr >= page.len() {
        return Err(Error::corrupt(pgnum, "cell pointer out of bounds"));
    }
    Ok(ptr)
}

/// Total bytes in the freeblock chain.
fn freeblock_total(page: &[u8], pgnum: PageNum, hdr: &PageHeader) -> Result<usize> {
    let mut total = 0;
    let mut off = hdr.first_freeblock;
    let mut hops = 0;
    while off != 0 {
        if off + 4 > page.len() || hops > page.len() / 4 {
            return Err(Error::corrupt(pgnum, "broken freeblock chain"));
        }
        total += BigEndian::read_u16(&page[off + 2..]) as usize;
        off = BigEndian::read_u16(&page[off..]) as usize;
        hops += 1;
    }
    Ok(total)
}

/// Free space available on the page: the unallocated gap between the
/// pointer array and the content area, plus fragments, plus freeblocks.
pub fn free_space(page: &[u8], pgnum: PageNum, hdr: &PageHeader) -> Result<usize> {
    let gap = hdr
        .content_start
        .saturating_sub(pointer_array_end(pgnum, hdr.page_type, hdr.ncells));
    Ok(gap + hdr.fragmented_bytes as usize + freeblock_total(page, pgnum, hdr)?)
}

/// Inserts `cell_bytes` as cell `idx`, defragmenting first when the
/// contiguous gap is too small but total free space suffices.
///
/// Returns `Ok(false)` when the page cannot hold the cell at all (the
/// caller splits), `Ok(true)` on success.
pub fn insert_cell(
    page: &mut [u8],
    pgnum: PageNum,
    usable: usize,
    idx: usize,
    cell_bytes: &[u8],
) -> Result<bool> {
    let mut hdr = parse_page_header(page, pgnum)?;
    let need = cell_bytes.len() + 2;
    if free_space(page, pgnum, &hdr)? < need {
        return Ok(false);
    }
    let ptr_end_after = pointer_array_end(pgnum, hdr.page_type, hdr.ncells + 1);
    if hdr.content_start < ptr_end_after || hdr.content_start - ptr_end_after < cell_bytes.len() {
        defragment(page, pgnum, usable)?;
        hdr = parse_page_header(page, pgnum)?;
        if hdr.content_start < ptr_end_after || hdr.content_start - ptr_end_after < cell_bytes.len()
        {
            return Ok(false);
        }
    }
    let offset = hdr.content_start - cell_bytes.len();
    page[offset..offset + cell_bytes.len()].copy_from_slice(cell_bytes);
    // Shift pointer entries idx.. right by one slot.
    let base = btree_start_offset(pgnum) + hdr.page_type.header_len();
    let tail_start = base + 2 * idx;
    let tail_end = base + 2 * hdr.ncells;
    page.copy_within(tail_start..tail_end, tail_start + 2);
    BigEndian::write_u16(&mut page[tail_start..], offset as u16);
    hdr.ncells += 1;
    hdr.content_start = offset;
    write_page_header(page, pgnum, &hdr);
    Ok(true)
}

/// Removes cell `idx`, releasing its bytes into the freeblock chain (or
/// the gap, when the cell sat at the lowest content offset).
pub fn remove_cell(page: &mut [u8], pgnum: PageNum, usable: usize, idx: usize) -> Result<()> {
    let mut hdr = parse_page_header(page, pgnum)?;
    let offset = cell_pointer(page, pgnum, &hdr, idx)?;
    let size = cell::cell_total_size(&page[offset..], hdr.page_type, usable)?;
    // Drop the pointer entry.
    let base = btree_start_offset(pgnum) + hdr.page_type.header_len();
    let tail_start = base + 2 * (idx + 1);
    let tail_end = base + 2 * hdr.ncells;
    page.copy_within(tail_start..tail_end, tail_start - 2);
    hdr.ncells -= 1;
    if offset == hdr.content_start {
        hdr.content_start += size;
    } else if size < 4 {
        hdr.fragmented_bytes = hdr.fragmented_bytes.saturating_add(size as u8);
    } else {
        // Chain a freeblock, keeping the chain sorted by offset.
        let mut prev: Option<usize> = None;
        let mut next = hdr.first_freeblock;
        while next != 0 && next < offset {
            prev = Some(next);
            next = BigEndian::read_u16(&page[next..]) as usize;
        }
        BigEndian::write_u16(&mut page[offset..], next as u16);
        BigEndian::write_u16(&mut page[offset + 2..], size as u16);
        match prev {
            Some(p) => BigEndian::write_u16(&mut page[p..], offset as u16),
            None => hdr.first_freeblock = offset,
        }
    }
    write_page_header(page, pgnum, &hdr);
    Ok(())
}

/// Rebuilds the cell content area so all free space is contiguous.
///
/// Cells are copied into a scratch page from the high end downward in
/// pointer order, pointers are rewritten, and the fragment counter and
/// freeblock chain are cleared. Cell pointer order, and every cell's
/// bytes, are preserved. On page 1 the leading 100 bytes are untouched.
pub fn defragment(page: &mut [u8], pgnum: PageNum, usable: usize) -> Result<()> {
    let mut hdr = parse_page_header(page, pgnum)?;
    log::trace!("defragmenting page {} ({} cells)", pgnum, hdr.ncells);
    let mut scratch = vec![0u8; usable];
    let mut new_offsets = Vec::with_capacity(hdr.ncells);
    let mut top = usable;
    for i in 0..hdr.ncells {
        let offset = cell_pointer(page, pgnum, &hdr, i)?;
        let size = cell::cell_total_size(&page[offset..], hdr.page_type, usable)?;
        if size > top {
            return Err(Error::corrupt(pgnum, "cells overflow usable area during defragmentation"));
        }
        top -= size;
        scratch[top..top + size].copy_from_slice(&page[offset..offset + size]);
        new_offsets.push(top);
    }
    page[top..usable].copy_from_slice(&scratch[top..usable]);
    let base = btree_start_offset(pgnum) + hdr.page_type.header_len();
    for (i, off) in new_offsets.iter().enumerate() {
        BigEndian::write_u16(&mut page[base + 2 * i..], *off as u16);
    }
    hdr.content_start = top;
    hdr.first_freeblock = 0;
    hdr.fragmented_bytes = 0;
    write_page_header(page, pgnum, &hdr);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::encode_record;
    use crate::sql_value::SqlValue;

    const USABLE: usize = 512;

    fn leaf_cell(rowid: i64, text: &str) -> Vec<u8> {
        let payload = encode_record(&[SqlValue::Text(text.to_string())]);
        cell::build_table_leaf(rowid, &payload, payload.len(), None)
    }

    #[test]
    fn test_init_and_parse_round_trip() {
        let mut page = vec![0u8; USABLE];
        init_page(&mut page, 2, PageType::TableLeaf, USABLE);
        let hdr = parse_page_header(&page, 2).unwrap();
        assert_eq!(hdr.page_type, PageType::TableLeaf);
        assert_eq!(hdr.ncells, 0);
        assert_eq!(hdr.content_start, USABLE);
        assert_eq!(hdr.fragmented_bytes, 0);
        assert!(hdr.rightmost.is_none());
    }

    #[test]
    fn test_insert_keeps_pointer_order() {
        let mut page = vec![0u8; USABLE];
        init_page(&mut page, 2, PageType::TableLeaf, USABLE);
        // Insert rows 1 and 3, then 2 in between.
        assert!(insert_cell(&mut page, 2, USABLE, 0, &leaf_cell(1, "one")).unwrap());
        assert!(insert_cell(&mut page, 2, USABLE, 1, &leaf_cell(3, "three")).unwrap());
        assert!(insert_cell(&mut page, 2, USABLE, 1, &leaf_cell(2, "two")).unwrap());
        let hdr = parse_page_header(&page, 2).unwrap();
        assert_eq!(hdr.ncells, 3);
        let rowids: Vec<i64> = (0..3)
            .map(|i| {
                let off = cell_pointer(&page, 2, &hdr, i).unwrap();
                cell::parse_table_leaf(&page[off..], USABLE).unwrap().rowid
            })
            .collect();
        assert_eq!(rowids, vec![1, 2, 3]);
    }

    #[test]
    fn test_insert_reports_full_page() {
        let mut page = vec![0u8; USABLE];
        init_page(&mut page, 2, PageType::TableLeaf, USABLE);
        let mut i = 0;
        loop {
            let cell = leaf_cell(i as i64 + 1, "xxxxxxxxxxxxxxxx");
            if !insert_cell(&mut page, 2, USABLE, i, &cell).unwrap() {
                break;
            }
            i += 1;
        }
        assert!(i > 10, "expected to fit several cells, fit {}", i);
        let hdr = parse_page_header(&page, 2).unwrap();
        assert_eq!(hdr.ncells, i);
    }

    #[test]
    fn test_remove_then_defragment_restores_space() {
        let mut page = vec![0u8; USABLE];
        init_page(&mut page, 2, PageType::TableLeaf, USABLE);
        for i in 0..8 {
            assert!(insert_cell(&mut page, 2, USABLE, i, &leaf_cell(i as i64 + 1, "payload")).unwrap());
        }
        let hdr = parse_page_header(&page, 2).unwrap();
        let free_before = free_space(&page, 2, &hdr).unwrap();

        // Remove two interior cells (not at the content start) and one at it.
        remove_cell(&mut page, 2, USABLE, 3).unwrap();
        remove_cell(&mut page, 2, USABLE, 1).unwrap();
        remove_cell(&mut page, 2, USABLE, 4).unwrap();
        let hdr = parse_page_header(&page, 2).unwrap();
        assert_eq!(hdr.ncells, 5);
        let freed = free_space(&page, 2, &hdr).unwrap();
        assert!(freed > free_before);

        // Snapshot surviving cells, then defragment.
        let before: Vec<(i64, Vec<u8>)> = (0..5)
            .map(|i| {
                let off = cell_pointer(&page, 2, &hdr, i).unwrap();
                let size = cell::cell_total_size(&page[off..], hdr.page_type, USABLE).unwrap();
                let c = cell::parse_table_leaf(&page[off..], USABLE).unwrap();
                (c.rowid, page[off..off + size].to_vec())
            })
            .collect();
        defragment(&mut page, 2, USABLE).unwrap();
        let hdr = parse_page_header(&page, 2).unwrap();
        assert_eq!(hdr.fragmented_bytes, 0);
        assert_eq!(hdr.first_freeblock, 0);
        // All free space is now the contiguous gap.
        let base = btree_start_offset(2) + hdr.page_type.header_len();
        assert_eq!(
            free_space(&page, 2, &hdr).unwrap(),
            hdr.content_start - (base + 2 * hdr.ncells)
        );
        assert_eq!(free_space(&page, 2, &hdr).unwrap(), freed);
        // Cell order and bytes unchanged.
        let after: Vec<(i64, Vec<u8>)> = (0..5)
            .map(|i| {
                let off = cell_pointer(&page, 2, &hdr, i).unwrap();
                let size = cell::cell_total_size(&page[off..], hdr.page_type, USABLE).unwrap();
                let c = cell::parse_table_leaf(&page[off..], USABLE).unwrap();
                (c.rowid, page[off..off + size].to_vec())
            })
            .collect();
        assert_eq!(before, after);
    }

    #[test]
    fn test_page_one_header_preserved_by_defragment() {
        let mut page = vec![0u8; 1024];
        crate::dbheader::write_header(&mut page, &crate::dbheader::fresh_header(1024));
        init_page(&mut page, 1, PageType::TableLeaf, 1024);
        for i in 0..4 {
            assert!(insert_cell(&mut page, 1, 1024, i, &leaf_cell(i as i64 + 1, "row")).unwrap());
        }
        remove_cell(&mut page, 1, 1024, 1).unwrap();
        let header_before = page[..100].to_vec();
        defragment(&mut page, 1, 1024).unwrap();
        assert_eq!(&page[..100], &header_before[..]);
    }
}
