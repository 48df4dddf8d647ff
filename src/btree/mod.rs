//! B-trees come in two types: tables, keyed by 64-bit rowid, and indexes,
//! keyed by record-ordered tuples. Pages are either leaves or interior
//! pages, and each of the 4 combinations has its own cell format.
//!
//! Organization of btree submodules:
//! *  `page` defines page headers, the cell pointer array and free-space
//!    bookkeeping, including defragmentation.
//! *  `cell` builds and parses the four cell shapes.
//! *  `cursor` walks one btree for reads: ordered scans and seeks.
//! *  `mutator` owns the write path of one transaction: inserts, deletes,
//!    updates, splits and overflow chains.

pub mod cell;
pub mod cursor;
pub mod mutator;
pub mod page;

/// Rowids are 64-bit integers.
pub type RowId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeKind {
    Table,
    Index,
}
