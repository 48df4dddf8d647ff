//! Forward-only, seek-capable cursor over one b-tree.
//!
//! The cursor captures a snapshot of the page source's `data_version` at
//! construction and on `reset`. It never auto-invalidates: a concurrent
//! commit only flips `is_stale`, and the caller decides whether to reset.
//!
//! During sequential traversal the current leaf page is held in
//! `cached_leaf` keyed by `cached_leaf_pgnum`, so only leaf transitions
//! and seeks touch the page source. The leaf is fetched with
//! `PageSource::get_page`: a zero-copy borrow of the resident image on
//! memory-backed sources, one materialized copy elsewhere.

use std::rc::Rc;

use byteorder::{BigEndian, ByteOrder};

use crate::error::{Error, Result};
use crate::pager::{PageBytes, PageNum, PageSource};
use crate::record;
use crate::sql_value::SqlValue;
use crate::varint;

use super::cell;
use super::page::{self, PageType};
use super::{RowId, TreeKind};

/// One interior level of the descent. `next_child` counts 0..=ncells,
/// with `ncells` standing for the right-most pointer. On index trees the
/// interior cells are entries themselves: `emit_divider` flags that the
/// divider left of `next_child` is the next row in key order.
struct Frame {
    pgnum: PageNum,
    next_child: usize,
    ncells: usize,
    emit_divider: bool,
}

/// Location of the current cell within the cached leaf.
#[derive(Default, Clone, Copy)]
struct CellPos {
    payload_len: usize,
    inline_start: usize,
    inline_len: usize,
    overflow: PageNum, // 0 = fully inline
}

pub struct Cursor {
    source: Rc<dyn PageSource>,
    root: PageNum,
    kind: TreeKind,
    usable: usize,
    snapshot_version: u64,
    stack: Vec<Frame>,
    started: bool,
    cached_leaf: PageBytes,
    cached_leaf_pgnum: PageNum, // 0 = no leaf cached
    leaf_next_cell: usize,
    leaf_ncells: usize,
    page_buf: Vec<u8>,
    payload_buf: Vec<u8>,
    row_id: RowId,
    at_row: bool,
    cell: CellPos,
    /// The current entry came from an interior index cell and is already
    /// materialized in `payload_buf`.
    interior_entry: bool,
}

impl Cursor {
    pub fn new(source: Rc<dyn PageSource>, root: PageNum, kind: TreeKind, usable: usize) -> Cursor {
        let page_size = source.page_size();
        let snapshot_version = source.data_version();
        Cursor {
            source,
            root,
            kind,
            usable,
            snapshot_version,
            stack: vec![],
            started: false,
            cached_leaf: PageBytes::zeroed(0),
            cached_leaf_pgnum: 0,
            leaf_next_cell: 0,
            leaf_ncells: 0,
            page_buf: vec![0u8; page_size],
            payload_buf: vec![],
            row_id: 0,
            at_row: false,
            cell: CellPos::default(),
            interior_entry: false,
        }
    }

    /// True when a commit has advanced the source's `data_version` past
    /// this cursor's snapshot. Untracked sources (version 0) never go
    /// stale, and neither does a cursor whose own snapshot is 0.
    pub fn is_stale(&self) -> bool {
        let current = self.source.data_version();
        if current == 0 || self.snapshot_version == 0 {
            return false;
        }
        current != self.snapshot_version
    }

    /// Returns the cursor to the start of the tree and refreshes its
    /// snapshot, dropping the cached leaf.
    pub fn reset(&mut self) {
        self.stack.clear();
        self.started = false;
        self.cached_leaf_pgnum = 0;
        self.leaf_next_cell = 0;
        self.leaf_ncells = 0;
        self.at_row = false;
        self.snapshot_version = self.source.data_version();
    }

    /// Rowid of the current row. Meaningful on table trees after a
    /// successful `move_next` or `seek`.
    pub fn row_id(&self) -> RowId {
        self.row_id
    }

    pub fn is_valid(&self) -> bool {
        self.at_row
    }

    fn read_scratch(&mut self, pgnum: PageNum) -> Result<()> {
        let mut buf = std::mem::take(&mut self.page_buf);
        let res = self.source.read_page(pgnum, &mut buf);
        self.page_buf = buf;
        res
    }

    /// Child pointer `i` (0..=ncells) of an interior page.
    fn child_in(
        page: &[u8],
        pgnum: PageNum,
        hdr: &page::PageHeader,
        i: usize,
        usable: usize,
    ) -> Result<PageNum> {
        if i == hdr.ncells {
            return hdr
                .rightmost
                .ok_or_else(|| Error::corrupt(pgnum, "interior page missing right-most pointer"));
        }
        let off = page::cell_pointer(page, pgnum, hdr, i)?;
        match hdr.page_type {
            PageType::TableInterior => Ok(cell::parse_table_interior(&page[off..])?.left_child),
            PageType::IndexInterior => {
                Ok(cell::parse_index_interior(&page[off..], usable)?.left_child)
            }
            _ => Err(Error::corrupt(pgnum, "leaf page on interior path")),
        }
    }

    /// Descends to the left-most leaf under `pgnum`, pushing interior
    /// frames as it goes.
    fn descend_leftmost(&mut self, pgnum: PageNum) -> Result<()> {
        let mut next = pgnum;
        loop {
            if self.stack.len() > 64 {
                return Err(Error::corrupt(next, "b-tree deeper than 64 levels"));
            }
            let page = self.source.get_page(next)?;
            let hdr = page::parse_page_header(&page, next)?;
            if hdr.page_type.is_leaf() {
                self.cached_leaf = page;
                self.cached_leaf_pgnum = next;
                self.leaf_next_cell = 0;
                self.leaf_ncells = hdr.ncells;
                return Ok(());
            }
            let child = Self::child_in(&page, next, &hdr, 0, self.usable)?;
            self.stack.push(Frame {
                pgnum: next,
                next_child: 1,
                ncells: hdr.ncells,
                emit_divider: false,
            });
            next = child;
        }
    }

    /// Materializes the interior index cell `idx` of `pgnum` as the
    /// current entry.
    fn load_interior_entry(&mut self, pgnum: PageNum, idx: usize) -> Result<()> {
        let page = self.source.get_page(pgnum)?;
        let hdr = page::parse_page_header(&page, pgnum)?;
        let off = page::cell_pointer(&page, pgnum, &hdr, idx)?;
        let c = cell::parse_index_interior(&page[off..], self.usable)?;
        let payload_len = c.payload_len;
        let inline_len = c.inline.len();
        let mut next = c.overflow.unwrap_or(0);
        self.payload_buf.clear();
        let start = off + 4 + varint::varint_len(payload_len as i64);
        self.payload_buf.extend_from_slice(&page[start..start + inline_len]);
        let mut remaining = payload_len - inline_len;
        while remaining > 0 {
            if next == 0 {
                return Err(Error::corrupt(pgnum, "overflow chain ends early"));
            }
            self.read_scratch(next)?;
            let this_page = next;
            next = BigEndian::read_u32(&self.page_buf[..4]) as PageNum;
            let take = remaining.min(self.usable - 4);
            if 4 + take > self.page_buf.len() {
                return Err(Error::corrupt(this_page, "overflow page shorter than chunk"));
            }
            self.payload_buf.extend_from_slice(&self.page_buf[4..4 + take]);
            remaining -= take;
        }
        self.interior_entry = true;
        self.at_row = true;
        Ok(())
    }

    /// Parses the leaf cell at `idx` into `self.cell` and `self.row_id`.
    fn load_cell(&mut self, idx: usize) -> Result<()> {
        let pgnum = self.cached_leaf_pgnum;
        let hdr = page::parse_page_header(&self.cached_leaf, pgnum)?;
        let off = page::cell_pointer(&self.cached_leaf, pgnum, &hdr, idx)?;
        let buf = &self.cached_leaf[off..];
        let (payload_len, n1) = varint::read_varint(buf);
        let n2 = match self.kind {
            TreeKind::Table => {
                let (rowid, n2) = varint::read_varint(&buf[n1..]);
                self.row_id = rowid;
                n2
            }
            TreeKind::Index => 0,
        };
        let payload_len = payload_len as usize;
        let (inline_len, spills) =
            cell::local_payload(self.usable, payload_len, self.kind == TreeKind::Index);
        let header_len = n1 + n2;
        let tail = if spills { 4 } else { 0 };
        if off + header_len + inline_len + tail > self.cached_leaf.len() {
            return Err(Error::corrupt(pgnum, "leaf cell runs past end of page"));
        }
        let overflow = if spills {
            BigEndian::read_u32(&buf[header_len + inline_len..]) as PageNum
        } else {
            0
        };
        self.cell = CellPos {
            payload_len,
            inline_start: off + header_len,
            inline_len,
            overflow,
        };
        self.interior_entry = false;
        Ok(())
    }

    /// Advances to the next entry in key order. Returns false at the end
    /// of the tree. Index trees visit interior cells in order between
    /// their child subtrees; table interior cells are pure routing and are
    /// never emitted.
    pub fn move_next(&mut self) -> Result<bool> {
        if !self.started {
            self.started = true;
            self.descend_leftmost(self.root)?;
        }
        let is_index = self.kind == TreeKind::Index;
        loop {
            if self.cached_leaf_pgnum != 0 {
                if self.leaf_next_cell < self.leaf_ncells {
                    let idx = self.leaf_next_cell;
                    self.leaf_next_cell += 1;
                    self.load_cell(idx)?;
                    self.at_row = true;
                    return Ok(true);
                }
                self.cached_leaf_pgnum = 0;
                if is_index {
                    if let Some(f) = self.stack.last_mut() {
                        f.emit_divider = true;
                    }
                }
            }
            let frame = match self.stack.last_mut() {
                None => {
                    self.at_row = false;
                    return Ok(false);
                }
                Some(f) => f,
            };
            if frame.emit_divider {
                frame.emit_divider = false;
                let divider = frame.next_child - 1;
                if divider < frame.ncells {
                    let pgnum = frame.pgnum;
                    self.load_interior_entry(pgnum, divider)?;
                    return Ok(true);
                }
            }
            if frame.next_child > frame.ncells {
                self.stack.pop();
                if is_index {
                    if let Some(f) = self.stack.last_mut() {
                        f.emit_divider = true;
                    }
                }
                continue;
            }
            let (pgnum, child_idx) = (frame.pgnum, frame.next_child);
            frame.next_child += 1;
            let page = self.source.get_page(pgnum)?;
            let hdr = page::parse_page_header(&page, pgnum)?;
            let child = Self::child_in(&page, pgnum, &hdr, child_idx, self.usable)?;
            self.descend_leftmost(child)?;
        }
    }

    /// The current row's full payload. Fully-inline payloads borrow the
    /// cached leaf; spilled payloads are materialized into a contiguous
    /// buffer by following the overflow chain.
    pub fn payload(&mut self) -> Result<&[u8]> {
        if !self.at_row {
            return Err(Error::corrupt(self.root, "cursor is not positioned on a row"));
        }
        if self.interior_entry {
            return Ok(&self.payload_buf);
        }
        let cell = self.cell;
        if cell.overflow == 0 {
            return Ok(&self.cached_leaf[cell.inline_start..cell.inline_start + cell.inline_len]);
        }
        self.payload_buf.clear();
        self.payload_buf
            .extend_from_slice(&self.cached_leaf[cell.inline_start..cell.inline_start + cell.inline_len]);
        let mut next = cell.overflow;
        let mut remaining = cell.payload_len - cell.inline_len;
        while remaining > 0 {
            if next == 0 {
                return Err(Error::corrupt(self.cached_leaf_pgnum, "overflow chain ends early"));
            }
            self.read_scratch(next)?;
            let this_page = next;
            next = BigEndian::read_u32(&self.page_buf[..4]) as PageNum;
            let take = remaining.min(self.usable - 4);
            if 4 + take > self.page_buf.len() {
                return Err(Error::corrupt(this_page, "overflow page shorter than chunk"));
            }
            self.payload_buf.extend_from_slice(&self.page_buf[4..4 + take]);
            remaining -= take;
        }
        Ok(&self.payload_buf)
    }

    /// Positions at `rowid` on a table tree. An exact hit returns true;
    /// a miss leaves the cursor on the successor row (if any) and returns
    /// false. The snapshot is refreshed, like `reset`.
    pub fn seek(&mut self, rowid: RowId) -> Result<bool> {
        debug_assert_eq!(self.kind, TreeKind::Table);
        self.reset();
        self.started = true;
        let mut next = self.root;
        loop {
            let page = self.source.get_page(next)?;
            let hdr = page::parse_page_header(&page, next)?;
            match hdr.page_type {
                PageType::TableLeaf => {
                    // First cell with rowid >= target.
                    let mut lo = 0;
                    let mut hi = hdr.ncells;
                    while lo < hi {
                        let mid = (lo + hi) / 2;
                        let off = page::cell_pointer(&page, next, &hdr, mid)?;
                        let c = cell::parse_table_leaf(&page[off..], self.usable)?;
                        if c.rowid < rowid {
                            lo = mid + 1;
                        } else {
                            hi = mid;
                        }
                    }
                    self.cached_leaf = page;
                    self.cached_leaf_pgnum = next;
                    self.leaf_ncells = hdr.ncells;
                    self.leaf_next_cell = lo;
                    let advanced = self.move_next()?;
                    return Ok(advanced && self.row_id == rowid);
                }
                PageType::TableInterior => {
                    // First divider with key >= target; its left child
                    // holds every rowid <= key.
                    let mut lo = 0;
                    let mut hi = hdr.ncells;
                    while lo < hi {
                        let mid = (lo + hi) / 2;
                        let off = page::cell_pointer(&page, next, &hdr, mid)?;
                        let c = cell::parse_table_interior(&page[off..])?;
                        if c.key < rowid {
                            lo = mid + 1;
                        } else {
                            hi = mid;
                        }
                    }
                    let child = Self::child_in(&page, next, &hdr, lo, self.usable)?;
                    self.stack.push(Frame {
                        pgnum: next,
                        next_child: lo + 1,
                        ncells: hdr.ncells,
                        emit_divider: false,
                    });
                    next = child;
                }
                _ => return Err(Error::corrupt(next, "index page in table tree")),
            }
        }
    }

    /// Positions at the first index entry whose key columns are >= `key`
    /// in record order. Exact prefix match returns true.
    pub fn seek_record(&mut self, key: &[SqlValue]) -> Result<bool> {
        debug_assert_eq!(self.kind, TreeKind::Index);
        self.reset();
        self.started = true;
        let mut next = self.root;
        loop {
            let page = self.source.get_page(next)?;
            let hdr = page::parse_page_header(&page, next)?;
            match hdr.page_type {
                PageType::IndexLeaf => {
                    let mut lo = 0;
                    let mut hi = hdr.ncells;
                    while lo < hi {
                        let mid = (lo + hi) / 2;
                        let off = page::cell_pointer(&page, next, &hdr, mid)?;
                        let c = cell::parse_index_leaf(&page[off..], self.usable)?;
                        if record::compare_with_values(c.inline, key)? == std::cmp::Ordering::Less {
                            lo = mid + 1;
                        } else {
                            hi = mid;
                        }
                    }
                    self.cached_leaf = page;
                    self.cached_leaf_pgnum = next;
                    self.leaf_ncells = hdr.ncells;
                    self.leaf_next_cell = lo;
                    if !self.move_next()? {
                        return Ok(false);
                    }
                    let payload = self.payload()?;
                    return Ok(record::compare_with_values(payload, key)? == std::cmp::Ordering::Equal);
                }
                PageType::IndexInterior => {
                    let mut lo = 0;
                    let mut hi = hdr.ncells;
                    while lo < hi {
                        let mid = (lo + hi) / 2;
                        let off = page::cell_pointer(&page, next, &hdr, mid)?;
                        let c = cell::parse_index_interior(&page[off..], self.usable)?;
                        if record::compare_with_values(c.inline, key)? == std::cmp::Ordering::Less {
                            lo = mid + 1;
                        } else {
                            hi = mid;
                        }
                    }
                    let child = Self::child_in(&page, next, &hdr, lo, self.usable)?;
                    self.stack.push(Frame {
                        pgnum: next,
                        next_child: lo + 1,
                        ncells: hdr.ncells,
                        emit_divider: false,
                    });
                    next = child;
                }
                _ => return Err(Error::corrupt(next, "table page in index tree")),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::page::{init_page, insert_cell};
    use crate::pager::MemoryPageSource;
    use crate::record::encode_record;

    const PS: usize = 512;

    /// Builds a two-level table tree on a fresh memory source:
    /// page 2 = root interior, pages 3/4/5 = leaves with the given rowids.
    fn build_two_level(rows_per_leaf: &[Vec<i64>]) -> Rc<MemoryPageSource> {
        let src = Rc::new(MemoryPageSource::new(PS));
        let mut page = vec![0u8; PS];
        // Page 1 placeholder so numbering starts at 2.
        src.write_page(1, &page).unwrap();

        let mut leaf_pages = vec![];
        for (i, rowids) in rows_per_leaf.iter().enumerate() {
            let pgnum = 3 + i;
            init_page(&mut page, pgnum, PageType::TableLeaf, PS);
            for (j, rowid) in rowids.iter().enumerate() {
                let payload = encode_record(&[SqlValue::Int(*rowid * 10)]);
                let cell = cell::build_table_leaf(*rowid, &payload, payload.len(), None);
                assert!(insert_cell(&mut page, pgnum, PS, j, &cell).unwrap());
            }
            src.write_page(pgnum, &page).unwrap();
            leaf_pages.push((pgnum, *rowids.last().unwrap()));
        }

        init_page(&mut page, 2, PageType::TableInterior, PS);
        let (last_leaf, _) = leaf_pages[leaf_pages.len() - 1];
        for (i, (pgnum, max_rowid)) in leaf_pages[..leaf_pages.len() - 1].iter().enumerate() {
            let cell = cell::build_table_interior(*pgnum, *max_rowid);
            assert!(insert_cell(&mut page, 2, PS, i, &cell).unwrap());
        }
        let mut hdr = page::parse_page_header(&page, 2).unwrap();
        hdr.rightmost = Some(last_leaf);
        page::write_page_header(&mut page, 2, &hdr);
        src.write_page(2, &page).unwrap();
        src
    }

    #[test]
    fn test_scan_two_level_tree() {
        let src = build_two_level(&[vec![1, 2, 3], vec![5, 6], vec![9]]);
        let mut cursor = Cursor::new(src, 2, TreeKind::Table, PS);
        let mut seen = vec![];
        while cursor.move_next().unwrap() {
            seen.push(cursor.row_id());
            let payload = cursor.payload().unwrap().to_vec();
            let values = crate::record::decode_record(&payload).unwrap();
            assert_eq!(values, vec![SqlValue::Int(cursor.row_id() * 10)]);
        }
        assert_eq!(seen, vec![1, 2, 3, 5, 6, 9]);
        assert!(!cursor.move_next().unwrap());
    }

    #[test]
    fn test_seek_exact_and_successor() {
        let src = build_two_level(&[vec![1, 2, 3], vec![5, 6], vec![9]]);
        let mut cursor = Cursor::new(src, 2, TreeKind::Table, PS);
        assert!(cursor.seek(5).unwrap());
        assert_eq!(cursor.row_id(), 5);
        // Scan continues from the seek position.
        assert!(cursor.move_next().unwrap());
        assert_eq!(cursor.row_id(), 6);
        assert!(cursor.move_next().unwrap());
        assert_eq!(cursor.row_id(), 9);

        // Missing key positions at the successor and returns false.
        assert!(!cursor.seek(4).unwrap());
        assert_eq!(cursor.row_id(), 5);
        // Past the last rowid there is no successor.
        assert!(!cursor.seek(100).unwrap());
        assert!(!cursor.is_valid());
    }

    #[test]
    fn test_cached_leaf_borrows_memory_pages() {
        let src = build_two_level(&[vec![1, 2]]);
        let mut cursor = Cursor::new(src.clone(), 2, TreeKind::Table, PS);
        assert!(cursor.move_next().unwrap());
        // The first leaf is page 3; the cursor's payload must point into
        // the source's resident image, not a private copy.
        let resident = src.get_page_memory(3).unwrap();
        let payload_ptr = cursor.payload().unwrap().as_ptr();
        assert!(
            resident.as_ptr_range().contains(&payload_ptr),
            "cached leaf should be a zero-copy borrow on memory sources"
        );
    }

    #[test]
    fn test_staleness_signal_and_reset() {
        let src = build_two_level(&[vec![1, 2]]);
        let mut cursor = Cursor::new(src.clone(), 2, TreeKind::Table, PS);
        assert!(!cursor.is_stale());
        // Any write to the source advances its version.
        let page = vec![0u8; PS];
        src.write_page(6, &page).unwrap();
        assert!(cursor.is_stale());
        cursor.reset();
        assert!(!cursor.is_stale());
    }

    #[test]
    fn test_payload_across_overflow_chain() {
        let src = Rc::new(MemoryPageSource::new(PS));
        let filler = vec![0u8; PS];
        src.write_page(1, &filler).unwrap();

        // A payload too large for one leaf spills onto pages 3 and 4.
        let big = (0..900).map(|i| (i % 251) as u8).collect::<Vec<u8>>();
        let payload = encode_record(&[SqlValue::Blob(big.clone())]);
        let (inline_len, spills) = cell::local_payload(PS, payload.len(), false);
        assert!(spills);

        let mut chain_page = vec![0u8; PS];
        let mut rest = &payload[inline_len..];
        let chunk = PS - 4;
        let first = &rest[..rest.len().min(chunk)];
        byteorder::BigEndian::write_u32(&mut chain_page[..4], if rest.len() > chunk { 4 } else { 0 });
        chain_page[4..4 + first.len()].copy_from_slice(first);
        src.write_page(3, &chain_page).unwrap();
        if rest.len() > chunk {
            rest = &rest[chunk..];
            chain_page.iter_mut().for_each(|b| *b = 0);
            chain_page[4..4 + rest.len()].copy_from_slice(rest);
            src.write_page(4, &chain_page).unwrap();
        }

        let mut leaf = vec![0u8; PS];
        init_page(&mut leaf, 2, PageType::TableLeaf, PS);
        let cell_bytes = cell::build_table_leaf(1, &payload, inline_len, Some(3));
        assert!(insert_cell(&mut leaf, 2, PS, 0, &cell_bytes).unwrap());
        src.write_page(2, &leaf).unwrap();

        let mut cursor = Cursor::new(src, 2, TreeKind::Table, PS);
        assert!(cursor.move_next().unwrap());
        let got = cursor.payload().unwrap();
        assert_eq!(got, &payload[..]);
    }
}
