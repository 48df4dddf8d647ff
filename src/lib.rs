//! stratadb is an embedded, single-file storage and query engine that is
//! read- and write-compatible with the SQLite3 file format
//! (https://www.sqlite.org/fileformat.html): big-endian fields,
//! varint-encoded records, and paged b-tree organization.
//!
//! The layers, bottom up:
//! * `varint`, `serial_type`, `sql_value` — primitive codecs.
//! * `pager` — the `PageSource` trait and its file, memory, cached,
//!   shadow and transform sources.
//! * `dbheader`, `btree::page`, `btree::cell` — the on-disk page formats.
//! * `freelist` — the trunk/leaf list of reusable pages.
//! * `btree::cursor`, `btree::mutator` — ordered reads and the write path
//!   (splits, defragmentation, freelist, overflow chains).
//! * `wal`, `transaction` — durability: shadow paging, rollback journal,
//!   write-ahead log.
//! * `schema`, `tokenizer`, `parser`, `filter`, `exec` — the catalog and
//!   the query surface.
//! * `db` — the `Database` handle tying the stack together.

pub mod ast;
pub mod btree;
pub mod db;
pub mod dbheader;
pub mod error;
pub mod exec;
pub mod filter;
pub mod freelist;
pub mod pager;
pub mod parser;
pub mod record;
pub mod schema;
pub mod serial_type;
pub mod sql_type;
pub mod sql_value;
pub mod tokenizer;
pub mod transaction;
pub mod varint;
pub mod wal;

pub use db::{Database, JournalMode, OpenOptions};
pub use error::{Error, Result};
pub use exec::{QueryOutput, Reader};
pub use pager::{PageBytes, PageSource, PageTransform};
pub use sql_type::SqlType;
pub use sql_value::SqlValue;
pub use transaction::Transaction;

/// Opens an existing database file read-only.
pub fn open(path: &str) -> Result<Database> {
    Database::open(path, OpenOptions::default())
}

/// Opens an existing database file for reading and writing.
pub fn open_writable(path: &str) -> Result<Database> {
    Database::open(path, OpenOptions::default().writable(true))
}

/// Creates a fresh database file, truncating any existing one.
pub fn create(path: &str) -> Result<Database> {
    Database::create(path, OpenOptions::default())
}

/// A fresh, writable in-memory database.
pub fn create_memory() -> Result<Database> {
    Database::create_memory()
}
