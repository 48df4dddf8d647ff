//! The freelist: pages no longer in active use, kept for reuse.
//!
//! A database file might contain one or more pages that are not in active
//! use, for example when information is deleted. Unused pages are stored
//! on the freelist and are reused when additional pages are required.
//!
//! The freelist is organized as a linked list of trunk pages, each
//! holding page numbers for zero or more leaf pages. A trunk page is an
//! array of 4-byte big-endian integers: the first is the page number of
//! the next trunk (zero terminates the list), the second is the number of
//! leaf pointers that follow. Leaf pages carry no content, and the engine
//! avoids reading or writing them.
//!
//! The manager owns the two freelist fields of the file header (first
//! trunk, total count); the commit path writes them back.

use byteorder::{BigEndian, ByteOrder};
use log::trace;

use crate::error::Result;
use crate::pager::PageNum;

/// Page access the freelist needs from its owner — in practice, the write
/// path's per-transaction dirty-page map.
pub trait FreelistPages {
    fn load(&mut self, pgnum: PageNum) -> Result<Vec<u8>>;
    fn store(&mut self, pgnum: PageNum, page: Vec<u8>, dirty: bool);
}

/// Leaf pointers one trunk page can hold: (U - 8) / 4.
pub fn trunk_capacity(usable: usize) -> usize {
    (usable - 8) / 4
}

#[derive(Default)]
pub struct Freelist {
    /// Page number of the first trunk, 0 when the list is empty.
    pub trunk: PageNum,
    /// Total freelist pages, trunks included.
    pub count: u32,
    usable: usize,
}

impl Freelist {
    pub fn new(trunk: PageNum, count: u32, usable: usize) -> Freelist {
        Freelist {
            trunk,
            count,
            usable,
        }
    }

    /// Pops the last leaf of the current trunk, or the trunk page itself
    /// once its leaf count reaches zero, advancing to the next trunk.
    pub fn pop(&mut self, pages: &mut dyn FreelistPages) -> Result<Option<PageNum>> {
        if self.trunk == 0 {
            return Ok(None);
        }
        let trunk_pgnum = self.trunk;
        let mut trunk = pages.load(trunk_pgnum)?;
        let leaf_count = BigEndian::read_u32(&trunk[4..]) as usize;
        if leaf_count == 0 {
            let next = BigEndian::read_u32(&trunk[..4]) as PageNum;
            pages.store(trunk_pgnum, trunk, false);
            self.trunk = next;
            self.count = self.count.saturating_sub(1);
            trace!("freelist pop hands out trunk page {}", trunk_pgnum);
            return Ok(Some(trunk_pgnum));
        }
        let last = BigEndian::read_u32(&trunk[8 + 4 * (leaf_count - 1)..]) as PageNum;
        BigEndian::write_u32(&mut trunk[4..], (leaf_count - 1) as u32);
        pages.store(trunk_pgnum, trunk, true);
        self.count = self.count.saturating_sub(1);
        Ok(Some(last))
    }

    /// Appends `pgnum` to the current trunk while it has capacity;
    /// otherwise the pushed page becomes a new trunk pointing at the
    /// previous one.
    pub fn push(&mut self, pgnum: PageNum, pages: &mut dyn FreelistPages) -> Result<()> {
        if self.trunk != 0 {
            let trunk_pgnum = self.trunk;
            let mut trunk = pages.load(trunk_pgnum)?;
            let leaf_count = BigEndian::read_u32(&trunk[4..]) as usize;
            if leaf_count < trunk_capacity(self.usable) {
                BigEndian::write_u32(&mut trunk[8 + 4 * leaf_count..], pgnum as u32);
                BigEndian::write_u32(&mut trunk[4..], (leaf_count + 1) as u32);
                pages.store(trunk_pgnum, trunk, true);
                self.count += 1;
                return Ok(());
            }
            pages.store(trunk_pgnum, trunk, false);
        }
        let mut trunk = pages.load(pgnum)?;
        trunk.iter_mut().for_each(|b| *b = 0);
        BigEndian::write_u32(&mut trunk[..4], self.trunk as u32);
        BigEndian::write_u32(&mut trunk[4..], 0);
        pages.store(pgnum, trunk, true);
        trace!("page {} becomes a new freelist trunk", pgnum);
        self.trunk = pgnum;
        self.count += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const PS: usize = 64;

    struct TestPages {
        pages: HashMap<PageNum, Vec<u8>>,
    }

    impl TestPages {
        fn new() -> TestPages {
            TestPages {
                pages: HashMap::new(),
            }
        }
    }

    impl FreelistPages for TestPages {
        fn load(&mut self, pgnum: PageNum) -> Result<Vec<u8>> {
            Ok(self.pages.remove(&pgnum).unwrap_or_else(|| vec![0u8; PS]))
        }

        fn store(&mut self, pgnum: PageNum, page: Vec<u8>, _dirty: bool) {
            self.pages.insert(pgnum, page);
        }
    }

    #[test]
    fn test_push_pop_round_trip_within_one_trunk() {
        let mut pages = TestPages::new();
        let mut fl = Freelist::new(0, 0, PS);
        for p in [5usize, 7, 9] {
            fl.push(p, &mut pages).unwrap();
        }
        assert_eq!(fl.count, 3);
        // Page 5 became the trunk; the leaves pop last-in first-out,
        // then the trunk itself.
        assert_eq!(fl.pop(&mut pages).unwrap(), Some(9));
        assert_eq!(fl.pop(&mut pages).unwrap(), Some(7));
        assert_eq!(fl.pop(&mut pages).unwrap(), Some(5));
        assert_eq!(fl.pop(&mut pages).unwrap(), None);
        assert_eq!(fl.count, 0);
        assert_eq!(fl.trunk, 0);
    }

    #[test]
    fn test_trunk_overflow_chains_a_second_trunk() {
        let mut pages = TestPages::new();
        let mut fl = Freelist::new(0, 0, PS);
        let capacity = trunk_capacity(PS);
        // One trunk plus a full load of leaves, then one more page.
        for p in 0..capacity + 2 {
            fl.push(100 + p, &mut pages).unwrap();
        }
        assert_eq!(fl.count as usize, capacity + 2);
        // The overflowing page became a second trunk pointing at the
        // first.
        let second_trunk = 100 + capacity + 1;
        assert_eq!(fl.trunk, second_trunk);
        assert_eq!(
            BigEndian::read_u32(&pages.pages[&second_trunk][..4]) as usize,
            100
        );
        // Draining pops every page exactly once.
        let mut drained = vec![];
        while let Some(p) = fl.pop(&mut pages).unwrap() {
            drained.push(p);
        }
        drained.sort_unstable();
        assert_eq!(drained, (100..100 + capacity + 2).collect::<Vec<usize>>());
    }

    #[test]
    fn test_trunk_layout_bytes() {
        let mut pages = TestPages::new();
        let mut fl = Freelist::new(0, 0, PS);
        fl.push(3, &mut pages).unwrap();
        fl.push(8, &mut pages).unwrap();
        let trunk = &pages.pages[&3];
        // next-trunk pointer, leaf count, then the leaf page numbers.
        assert_eq!(BigEndian::read_u32(&trunk[..4]), 0);
        assert_eq!(BigEndian::read_u32(&trunk[4..]), 1);
        assert_eq!(BigEndian::read_u32(&trunk[8..]), 8);
    }
}
