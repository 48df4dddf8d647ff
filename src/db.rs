//! The `Database` handle: owns the page-source stack, the catalog cache,
//! the writer slot and the buffer pool for one open database.
//!
//! Source stacks by backing store:
//!   file, rollback journal:  cache ( transforms? ( file ) )
//!   file, write-ahead log:   cache ( transforms? ( wal ( file ) ) )
//!   memory:                  transforms? ( memory )
//! Commits always write pre-encoded pages to the raw bottom source (or
//! log), so the stack stays coherent with what lands on disk.

use std::cell::{Cell, RefCell};
use std::io::{Read, Write};
use std::rc::Rc;

use byteorder::{BigEndian, ByteOrder};
use log::debug;

use crate::ast;
use crate::btree::page as btree_page;
use crate::btree::page::PageType;
use crate::dbheader::{self, DbHeader, TextEncoding};
use crate::error::{Error, Result};
use crate::exec::{self, ExecContext, QueryOutput, Reader};
use crate::filter;
use crate::pager::{
    BufferPool, CachedPageSource, FilePageSource, MemoryPageSource, PageNum, PageSource,
    PageTransform, ShadowPageSource, TransformPageSource,
};
use crate::parser;
use crate::schema::{self, Schema};
use crate::sql_value::SqlValue;
use crate::transaction::{CommitPages, Transaction};
use crate::wal::{WalFile, WalPageSource};

const JOURNAL_MAGIC: &[u8; 8] = b"strjrnl\0";
const DEFAULT_READ_CACHE_PAGES: u32 = 2000;
const DEFAULT_WRITE_CACHE_PAGES: u32 = 16;
pub const DEFAULT_PAGE_SIZE: u32 = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalMode {
    Rollback,
    Wal,
}

/// Open-time configuration.
pub struct OpenOptions {
    pub writable: bool,
    /// LRU ceiling in pages; defaults to 2000 for read-only handles and
    /// 16 for writable ones.
    pub page_cache_size: Option<u32>,
    pub journal: JournalMode,
    /// Optional transparent page transform chain, applied outermost-last
    /// on write (compress, then encrypt).
    pub transforms: Vec<Box<dyn PageTransform>>,
}

impl Default for OpenOptions {
    fn default() -> OpenOptions {
        OpenOptions {
            writable: false,
            page_cache_size: None,
            journal: JournalMode::Rollback,
            transforms: vec![],
        }
    }
}

impl OpenOptions {
    pub fn writable(mut self, writable: bool) -> OpenOptions {
        self.writable = writable;
        self
    }

    pub fn journal(mut self, journal: JournalMode) -> OpenOptions {
        self.journal = journal;
        self
    }

    pub fn page_cache_size(mut self, pages: u32) -> OpenOptions {
        self.page_cache_size = Some(pages);
        self
    }

    pub fn transform(mut self, t: Box<dyn PageTransform>) -> OpenOptions {
        self.transforms.push(t);
        self
    }

    fn cache_pages(&self) -> usize {
        self.page_cache_size
            .unwrap_or(if self.writable { DEFAULT_WRITE_CACHE_PAGES } else { DEFAULT_READ_CACHE_PAGES })
            as usize
    }
}

enum Backend {
    Memory {
        mem: Rc<MemoryPageSource>,
    },
    File {
        file: Rc<FilePageSource>,
        journal_path: String,
    },
    Wal {
        wal: Rc<WalPageSource>,
        file: Rc<FilePageSource>,
    },
}

pub struct Database {
    backend: Backend,
    /// The stack readers go through.
    source: Rc<dyn PageSource>,
    cached: Option<Rc<CachedPageSource>>,
    transforms: Option<Rc<TransformPageSource>>,
    pool: Rc<BufferPool>,
    header: RefCell<DbHeader>,
    schema_cache: RefCell<Option<Rc<Schema>>>,
    writer_active: Cell<bool>,
    writable: bool,
}

/// Writes a fresh header plus empty schema leaf into page 1 bytes.
fn bootstrap_page_one(page_size: u32) -> Vec<u8> {
    let mut page = vec![0u8; page_size as usize];
    let header = dbheader::fresh_header(page_size);
    dbheader::write_header(&mut page, &header);
    btree_page::init_page(&mut page, 1, PageType::TableLeaf, page_size as usize);
    page
}

impl Database {
    // ---- construction --------------------------------------------------

    /// Opens an existing database file.
    pub fn open(path: &str, options: OpenOptions) -> Result<Database> {
        // The header is parsed from the raw file first: the page size is
        // needed before any source exists (page 1 bypasses transforms).
        let mut first = [0u8; dbheader::DB_HEADER_BYTES];
        {
            let mut f = std::fs::File::open(path)?;
            f.read_exact(&mut first)?;
        }
        let header = dbheader::parse_header(&first)?;
        if header.text_encoding != TextEncoding::Utf8 {
            return Err(Error::UnsupportedFeature("UTF-16 text encodings"));
        }
        let page_size = header.page_size as usize;

        let journal_path = format!("{}-journal", path);
        let wal_path = format!("{}-wal", path);
        if options.writable && std::path::Path::new(&journal_path).exists() {
            replay_journal(path, &journal_path, page_size)?;
        }

        let file = Rc::new(FilePageSource::open(path, page_size, options.writable)?);
        let wal_exists = std::path::Path::new(&wal_path).exists();
        let use_wal = options.journal == JournalMode::Wal || wal_exists;
        let backend = if use_wal {
            let wal_file = if wal_exists {
                WalFile::open(&wal_path, page_size)?
            } else {
                WalFile::create(&wal_path, page_size)?
            };
            let wal = Rc::new(WalPageSource::new(file.clone() as Rc<dyn PageSource>, wal_file));
            Backend::Wal { wal, file }
        } else {
            Backend::File {
                file,
                journal_path,
            }
        };
        Database::finish_open(backend, options, page_size)
    }

    /// Creates a new database file, truncating any existing one.
    pub fn create(path: &str, options: OpenOptions) -> Result<Database> {
        let file = Rc::new(FilePageSource::create(path, DEFAULT_PAGE_SIZE as usize)?);
        file.write_page(1, &bootstrap_page_one(DEFAULT_PAGE_SIZE))?;
        file.sync()?;
        drop(file);
        let mut options = options;
        options.writable = true;
        Database::open(path, options)
    }

    /// Opens a database image held in memory.
    pub fn open_memory(bytes: Vec<u8>, options: OpenOptions) -> Result<Database> {
        let header = dbheader::parse_header(&bytes)?;
        if header.text_encoding != TextEncoding::Utf8 {
            return Err(Error::UnsupportedFeature("UTF-16 text encodings"));
        }
        let page_size = header.page_size as usize;
        let mem = Rc::new(MemoryPageSource::from_bytes(bytes, page_size));
        Database::finish_open(Backend::Memory { mem }, options, page_size)
    }

    /// A fresh, writable, empty in-memory database.
    pub fn create_memory() -> Result<Database> {
        let bytes = bootstrap_page_one(DEFAULT_PAGE_SIZE);
        let options = OpenOptions::default().writable(true);
        Database::open_memory(bytes, options)
    }

    fn finish_open(backend: Backend, options: OpenOptions, page_size: usize) -> Result<Database> {
        let pool = Rc::new(BufferPool::new(page_size));
        let cache_pages = options.cache_pages();
        let writable = options.writable;
        let raw: Rc<dyn PageSource> = match &backend {
            Backend::Memory { mem } => mem.clone(),
            Backend::File { file, .. } => file.clone(),
            Backend::Wal { wal, .. } => wal.clone(),
        };
        let transforms = if options.transforms.is_empty() {
            None
        } else {
            Some(Rc::new(TransformPageSource::new(raw.clone(), options.transforms)))
        };
        let mid: Rc<dyn PageSource> = match &transforms {
            Some(t) => t.clone(),
            None => raw,
        };
        let (source, cached): (Rc<dyn PageSource>, Option<Rc<CachedPageSource>>) = match &backend {
            Backend::Memory { .. } => (mid, None),
            _ => {
                let cached = Rc::new(CachedPageSource::new(mid, pool.clone(), cache_pages));
                (cached.clone(), Some(cached))
            }
        };

        // Re-read the header through the stack: the log may carry a newer
        // page 1 than the base file.
        let mut page1 = vec![0u8; page_size];
        source.read_page(1, &mut page1)?;
        let header = dbheader::parse_header(&page1)?;
        debug!(
            "database open: {} pages of {} bytes, change counter {}",
            header.page_count, header.page_size, header.change_counter
        );
        Ok(Database {
            backend,
            source,
            cached,
            transforms,
            pool,
            header: RefCell::new(header),
            schema_cache: RefCell::new(None),
            writer_active: Cell::new(false),
            writable,
        })
    }

    // ---- accessors -----------------------------------------------------

    pub fn header(&self) -> DbHeader {
        self.header.borrow().clone()
    }

    pub fn usable(&self) -> usize {
        self.header.borrow().usable_size()
    }

    pub fn data_version(&self) -> u64 {
        self.source.data_version()
    }

    pub fn page_source(&self) -> Rc<dyn PageSource> {
        self.source.clone()
    }

    /// The page-buffer pool shared by this handle's cache and cursors.
    pub fn buffer_pool(&self) -> Rc<BufferPool> {
        self.pool.clone()
    }

    /// The catalog, loaded lazily and cached until the next DDL commit.
    pub fn schema(&self) -> Result<Rc<Schema>> {
        if let Some(schema) = self.schema_cache.borrow().as_ref() {
            return Ok(schema.clone());
        }
        let schema = Rc::new(schema::load_schema(self.source.clone(), self.usable())?);
        *self.schema_cache.borrow_mut() = Some(schema.clone());
        Ok(schema)
    }

    // ---- readers and queries -------------------------------------------

    /// A streaming reader over one table, optionally filtered by a WHERE
    /// expression compiled against the raw record bytes.
    pub fn create_reader(
        &self,
        table: &str,
        projection: Option<&[&str]>,
        filter_expr: Option<&str>,
    ) -> Result<Reader> {
        self.create_reader_with(table, projection, filter_expr, &[])
    }

    pub fn create_reader_with(
        &self,
        table: &str,
        projection: Option<&[&str]>,
        filter_expr: Option<&str>,
        params: &[(String, SqlValue)],
    ) -> Result<Reader> {
        let schema = self.schema()?;
        let info = if table.eq_ignore_ascii_case(schema::SCHEMA_TABLE_NAME) {
            schema::builtin_schema_table()?
        } else {
            schema.table(table)?.clone()
        };
        if let Some(cols) = projection {
            for col in cols {
                info.column(col)?;
            }
        }
        let compiled = match filter_expr {
            None => None,
            Some(src) => {
                let mut p = parser::Parser::new(src)?;
                let expr = p.expr()?;
                Some(filter::compile_filter(&expr, &info, params)?)
            }
        };
        Ok(Reader::new(self.source.clone(), self.usable(), info, compiled))
    }

    /// Runs a SELECT (or, for convenience, any statement) and returns the
    /// materialized result.
    pub fn query(&self, sql: &str, params: &[(String, SqlValue)]) -> Result<QueryOutput> {
        let stmt = parser::parse_statement(sql)?;
        match stmt {
            ast::Statement::Select(select) => {
                let schema = self.schema()?;
                let cx = ExecContext {
                    schema: schema.as_ref(),
                    source: self.source.clone(),
                    usable: self.usable(),
                };
                exec::run_select(&cx, &select, params)
            }
            other => {
                let affected = self.execute_statement(other, sql, params)?;
                Ok(QueryOutput {
                    columns: vec!["affected".to_string()],
                    rows: vec![vec![SqlValue::Int(affected as i64)]],
                })
            }
        }
    }

    /// Executes a DDL or DML statement inside its own transaction and
    /// returns the affected row count.
    pub fn execute(&self, sql: &str, params: &[(String, SqlValue)]) -> Result<usize> {
        let stmt = parser::parse_statement(sql)?;
        match stmt {
            ast::Statement::Select(_) => Ok(self.query(sql, params)?.rows.len()),
            other => self.execute_statement(other, sql, params),
        }
    }

    fn execute_statement(
        &self,
        stmt: ast::Statement,
        sql: &str,
        params: &[(String, SqlValue)],
    ) -> Result<usize> {
        let mut tx = self.begin_transaction()?;
        let affected = match &stmt {
            ast::Statement::CreateTable(ct) => {
                tx.create_table(ct, sql)?;
                0
            }
            ast::Statement::CreateIndex(ci) => {
                tx.create_index(ci, sql)?;
                0
            }
            ast::Statement::AlterAddColumn { table, column } => {
                tx.alter_add_column(table, column)?;
                0
            }
            ast::Statement::AlterRename { table, new_name } => {
                tx.alter_rename(table, new_name)?;
                0
            }
            ast::Statement::Drop { kind, name, if_exists } => {
                tx.drop_object(*kind, name, *if_exists)?;
                0
            }
            ast::Statement::Insert(ins) => {
                let schema = tx.schema();
                let info = schema.table(&ins.table)?;
                let mut n = 0;
                for row_exprs in &ins.rows {
                    let mut values = vec![SqlValue::Null(); info.columns.len()];
                    match &ins.columns {
                        None => {
                            if row_exprs.len() != info.columns.len() {
                                return Err(Error::SchemaNotFound(format!(
                                    "table {} expects {} values",
                                    info.name,
                                    info.columns.len()
                                )));
                            }
                            for (i, e) in row_exprs.iter().enumerate() {
                                values[i] = exec::eval_with_row(e, &[], &[], params)?;
                            }
                        }
                        Some(cols) => {
                            for (col, e) in cols.iter().zip(row_exprs.iter()) {
                                let ordinal = info.column(col)?.ordinal;
                                values[ordinal] = exec::eval_with_row(e, &[], &[], params)?;
                            }
                        }
                    }
                    tx.insert(&ins.table, values)?;
                    n += 1;
                }
                n
            }
            ast::Statement::Update(up) => {
                let matches = self.collect_matching_rows(&mut tx, &up.table, &up.filter, params)?;
                let schema = tx.schema();
                let info = schema.table(&up.table)?.clone();
                let columns: Vec<String> = info.columns.iter().map(|c| c.name.clone()).collect();
                let mut n = 0;
                for (rowid, row) in matches {
                    let mut new_row = row.clone();
                    for (col, e) in &up.assignments {
                        let ordinal = info.column(col)?.ordinal;
                        new_row[ordinal] = exec::eval_with_row(e, &columns, &row, params)?;
                    }
                    if tx.update(&up.table, rowid, new_row)? {
                        n += 1;
                    }
                }
                n
            }
            ast::Statement::Delete(del) => {
                let matches = self.collect_matching_rows(&mut tx, &del.table, &del.filter, params)?;
                let mut n = 0;
                for (rowid, _) in matches {
                    if tx.delete(&del.table, rowid)? {
                        n += 1;
                    }
                }
                n
            }
            ast::Statement::Select(_) => 0,
        };
        tx.commit()?;
        Ok(affected)
    }

    /// Rows of `table` matching a WHERE expression, read through the
    /// transaction's own uncommitted state.
    fn collect_matching_rows(
        &self,
        tx: &mut Transaction,
        table: &str,
        filter_expr: &Option<ast::Expr>,
        params: &[(String, SqlValue)],
    ) -> Result<Vec<(i64, Vec<SqlValue>)>> {
        let schema = tx.schema();
        let info = schema.table(table)?.clone();
        let columns: Vec<String> = info.columns.iter().map(|c| c.name.clone()).collect();
        let mut reader = tx.reader(table)?;
        let mut out = vec![];
        while reader.read()? {
            let rowid = reader.row_id();
            let row = reader.logical_row()?;
            if let Some(expr) = filter_expr {
                let v = exec::eval_with_row(expr, &columns, &row, params)?;
                if !matches!(v, SqlValue::Int(i) if i != 0) {
                    continue;
                }
            }
            out.push((rowid, row));
        }
        Ok(out)
    }

    // ---- transactions --------------------------------------------------

    pub fn begin_transaction(&self) -> Result<Transaction<'_>> {
        if !self.writable {
            return Err(Error::ReadOnly);
        }
        if self.writer_active.get() {
            return Err(Error::TransactionAlreadyActive);
        }
        self.writer_active.set(true);
        let shadow = Rc::new(ShadowPageSource::new(self.source.clone()));
        let schema = match self.schema() {
            Ok(s) => s,
            Err(e) => {
                self.writer_active.set(false);
                return Err(e);
            }
        };
        Ok(Transaction::new(self, shadow, schema))
    }

    pub(crate) fn release_writer(&self) {
        self.writer_active.set(false);
    }

    /// Applies one committed transaction's pages to durable storage.
    pub(crate) fn apply_commit(&self, overlay: CommitPages, page_count: u32, ddl: bool) -> Result<()> {
        // Serialize through the transform chain first; page 1 passes
        // through unchanged.
        let mut pages = overlay;
        if let Some(t) = &self.transforms {
            for (pgnum, page) in pages.iter_mut() {
                t.encode_page(*pgnum, page)?;
            }
        }

        match &self.backend {
            Backend::Memory { mem } => {
                for (pgnum, page) in &pages {
                    mem.write_page(*pgnum, page)?;
                }
            }
            Backend::File { file, journal_path } => {
                write_journal(file.as_ref(), journal_path, &pages)?;
                let result = (|| -> Result<()> {
                    for (pgnum, page) in &pages {
                        file.write_page(*pgnum, page)?;
                    }
                    file.sync()?;
                    Ok(())
                })();
                match result {
                    Ok(()) => {
                        let _ = std::fs::remove_file(journal_path);
                    }
                    Err(e) => return Err(e),
                }
            }
            Backend::Wal { wal, .. } => {
                wal.commit_pages(&pages, page_count)?;
            }
        }

        // Drop stale cached copies and refresh the in-memory header.
        if let Some(cached) = &self.cached {
            for (pgnum, _) in &pages {
                cached.invalidate(*pgnum);
            }
        }
        let mut page1 = vec![0u8; self.header.borrow().page_size as usize];
        self.source.read_page(1, &mut page1)?;
        *self.header.borrow_mut() = dbheader::parse_header(&page1)?;
        if ddl {
            *self.schema_cache.borrow_mut() = None;
        }
        debug!("commit applied: {} pages, db size {} pages", pages.len(), page_count);
        Ok(())
    }

    /// Merges committed log frames back into the main file. A no-op for
    /// databases without a write-ahead log.
    pub fn checkpoint(&self) -> Result<usize> {
        match &self.backend {
            Backend::Wal { wal, file } => {
                let moved = wal.checkpoint()?;
                file.sync()?;
                if let Some(cached) = &self.cached {
                    for pgnum in 1..=self.header.borrow().page_count as PageNum {
                        cached.invalidate(pgnum);
                    }
                }
                Ok(moved)
            }
            _ => Ok(0),
        }
    }
}

// ---- rollback journal ----------------------------------------------------

/// Journal layout: magic, page size, original page count, then
/// (page number, original image) pairs for every page about to change.
fn write_journal(file: &FilePageSource, journal_path: &str, pages: &CommitPages) -> Result<()> {
    let page_size = file.page_size();
    let original_count = file.page_count();
    let mut out = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(journal_path)?;
    out.write_all(JOURNAL_MAGIC)?;
    let mut word = [0u8; 4];
    BigEndian::write_u32(&mut word, page_size as u32);
    out.write_all(&word)?;
    BigEndian::write_u32(&mut word, original_count as u32);
    out.write_all(&word)?;
    let mut original = vec![0u8; page_size];
    for (pgnum, _) in pages {
        if *pgnum > original_count {
            continue; // freshly grown page; nothing to restore
        }
        file.read_page(*pgnum, &mut original)?;
        BigEndian::write_u32(&mut word, *pgnum as u32);
        out.write_all(&word)?;
        out.write_all(&original)?;
    }
    out.sync_data()?;
    Ok(())
}

/// Restores original page images from a hot journal left by a crashed
/// commit, then removes it.
fn replay_journal(db_path: &str, journal_path: &str, page_size: usize) -> Result<()> {
    debug!("replaying hot journal {}", journal_path);
    let mut journal = std::fs::File::open(journal_path)?;
    let mut magic = [0u8; 8];
    if journal.read(&mut magic)? < 8 || &magic != JOURNAL_MAGIC {
        // An empty or foreign journal is discarded rather than replayed.
        drop(journal);
        let _ = std::fs::remove_file(journal_path);
        return Ok(());
    }
    let mut word = [0u8; 4];
    journal.read_exact(&mut word)?;
    let journal_page_size = BigEndian::read_u32(&word) as usize;
    journal.read_exact(&mut word)?;
    let original_count = BigEndian::read_u32(&word) as u64;
    if journal_page_size != page_size {
        return Err(Error::InvalidFileFormat("journal page size differs from database"));
    }
    let file = FilePageSource::open(db_path, page_size, true)?;
    let mut page = vec![0u8; page_size];
    loop {
        match journal.read_exact(&mut word) {
            Ok(()) => {}
            Err(_) => break,
        }
        let pgnum = BigEndian::read_u32(&word) as PageNum;
        if journal.read_exact(&mut page).is_err() {
            break; // torn tail: the pages already replayed are intact
        }
        file.write_page(pgnum, &page)?;
    }
    file.sync()?;
    // Trim pages the aborted transaction appended.
    let f = std::fs::OpenOptions::new().write(true).open(db_path)?;
    f.set_len(original_count * page_size as u64)?;
    f.sync_data()?;
    drop(journal);
    let _ = std::fs::remove_file(journal_path);
    Ok(())
}
