//! Transactions: the single writer slot, the copy-on-write shadow, and
//! the commit/rollback paths.
//!
//! A transaction owns a shadow page source over the database's base
//! source and a lazily built mutator. Row and schema changes accumulate in
//! the shadow; commit serializes the dirty pages through the transform
//! chain and applies them through the journal or write-ahead log, then
//! patches the file header in place. Rollback discards the shadow.

use std::rc::Rc;

use log::debug;

use crate::ast;
use crate::btree::mutator::Mutator;
use crate::btree::page::PageType;
use crate::btree::RowId;
use crate::dbheader;
use crate::db::Database;
use crate::error::{Error, Result};
use crate::exec::Reader;
use crate::pager::{PageNum, PageSource, ShadowPageSource};
use crate::schema::{self, ColumnKind, IndexInfo, ObjectKind, Schema, TableInfo};
use crate::sql_value::SqlValue;

pub struct Transaction<'db> {
    db: &'db Database,
    shadow: Rc<ShadowPageSource>,
    mutator: Option<Mutator>,
    schema: Rc<Schema>,
    ddl: bool,
    done: bool,
}

impl<'db> Transaction<'db> {
    pub(crate) fn new(db: &'db Database, shadow: Rc<ShadowPageSource>, schema: Rc<Schema>) -> Transaction<'db> {
        Transaction {
            db,
            shadow,
            mutator: None,
            schema,
            ddl: false,
            done: false,
        }
    }

    fn check_open(&self) -> Result<()> {
        if self.done {
            Err(Error::TransactionCompleted)
        } else {
            Ok(())
        }
    }

    fn mutator(&mut self) -> Result<&mut Mutator> {
        if self.mutator.is_none() {
            let m = Mutator::new(self.shadow.clone() as Rc<dyn PageSource>, self.db.usable())?;
            self.mutator = Some(m);
        }
        Ok(self.mutator.as_mut().expect("mutator was just built"))
    }

    /// Re-reads the catalog from the shadow after a DDL change.
    fn reload_schema(&mut self) -> Result<()> {
        self.flush()?;
        self.schema = Rc::new(schema::load_schema(
            self.shadow.clone() as Rc<dyn PageSource>,
            self.db.usable(),
        )?);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if let Some(m) = self.mutator.as_mut() {
            m.flush()?;
        }
        Ok(())
    }

    pub fn schema(&self) -> Rc<Schema> {
        self.schema.clone()
    }

    /// A reader over this transaction's own uncommitted state.
    pub fn reader(&mut self, table: &str) -> Result<Reader> {
        self.check_open()?;
        self.flush()?;
        let info = if table.eq_ignore_ascii_case(schema::SCHEMA_TABLE_NAME) {
            schema::builtin_schema_table()?
        } else {
            self.schema.table(table)?.clone()
        };
        Ok(Reader::new(
            self.shadow.clone() as Rc<dyn PageSource>,
            self.db.usable(),
            info,
            None,
        ))
    }

    // ---- row operations ------------------------------------------------

    /// The value an index entry stores for one logical column.
    fn index_key_values(
        table: &TableInfo,
        index: &IndexInfo,
        logical: &[SqlValue],
        rowid: RowId,
    ) -> Result<Vec<SqlValue>> {
        let mut entry = vec![];
        for col_name in &index.columns {
            let col = table.column(col_name)?;
            if Some(col.ordinal) == table.rowid_alias {
                entry.push(SqlValue::Int(rowid));
                continue;
            }
            match col.kind {
                ColumnKind::Scalar => entry.push(logical[col.ordinal].clone()),
                _ => {
                    // 128-bit columns index both physical halves.
                    let mut expanded = vec![];
                    schema::expand_merged(logical.to_vec(), table)?
                        .drain(..)
                        .enumerate()
                        .for_each(|(i, v)| {
                            if col.merged_physical_ordinals.contains(&i) {
                                expanded.push(v);
                            }
                        });
                    entry.extend(expanded);
                }
            }
        }
        entry.push(SqlValue::Int(rowid));
        Ok(entry)
    }

    /// Inserts one logical row, returning the rowid it landed on.
    pub fn insert(&mut self, table: &str, values: Vec<SqlValue>) -> Result<RowId> {
        self.check_open()?;
        let info = self.schema.table(table)?.clone();
        if values.len() != info.columns.len() {
            return Err(Error::SchemaNotFound(format!(
                "table {} expects {} values, got {}",
                info.name,
                info.columns.len(),
                values.len()
            )));
        }
        // Pick the rowid: an INTEGER PRIMARY KEY value wins, otherwise
        // allocate past the current maximum.
        let rowid = match info.rowid_alias {
            Some(alias) => match &values[alias] {
                SqlValue::Int(i) => *i,
                SqlValue::Null() => self.mutator()?.get_max_row_id(info.root_page)? + 1,
                _ => {
                    return Err(Error::SchemaNotFound(format!(
                        "primary key of {} must be an integer",
                        info.name
                    )))
                }
            },
            None => self.mutator()?.get_max_row_id(info.root_page)? + 1,
        };
        let mut logical = values;
        if let Some(alias) = info.rowid_alias {
            // The alias column stores NULL; the rowid carries the value.
            logical[alias] = SqlValue::Null();
        }
        let physical = schema::expand_merged(logical.clone(), &info)?;
        let payload = crate::record::encode_record(&physical);
        self.mutator()?.insert(info.root_page, rowid, &payload)?;
        if let Some(alias) = info.rowid_alias {
            logical[alias] = SqlValue::Int(rowid);
        }
        for index in &info.indexes {
            let entry = Self::index_key_values(&info, index, &logical, rowid)?;
            self.mutator()?.insert_index(index.root_page, &entry)?;
        }
        self.flush()?;
        Ok(rowid)
    }

    /// Reads the current logical row, for index maintenance.
    fn current_row(&mut self, info: &TableInfo, rowid: RowId) -> Result<Option<Vec<SqlValue>>> {
        let mut reader = self.reader(&info.name)?;
        if !reader.seek(rowid)? {
            return Ok(None);
        }
        Ok(Some(reader.logical_row()?))
    }

    pub fn update(&mut self, table: &str, rowid: RowId, values: Vec<SqlValue>) -> Result<bool> {
        self.check_open()?;
        let info = self.schema.table(table)?.clone();
        let old = match self.current_row(&info, rowid)? {
            Some(row) => row,
            None => return Ok(false),
        };
        for index in &info.indexes {
            let entry = Self::index_key_values(&info, index, &old, rowid)?;
            self.mutator()?.delete_index(index.root_page, &entry)?;
        }
        let mut logical = values;
        if let Some(alias) = info.rowid_alias {
            logical[alias] = SqlValue::Null();
        }
        let physical = schema::expand_merged(logical.clone(), &info)?;
        let payload = crate::record::encode_record(&physical);
        let (found, _) = self.mutator()?.update(info.root_page, rowid, &payload)?;
        if let Some(alias) = info.rowid_alias {
            logical[alias] = SqlValue::Int(rowid);
        }
        for index in &info.indexes {
            let entry = Self::index_key_values(&info, index, &logical, rowid)?;
            self.mutator()?.insert_index(index.root_page, &entry)?;
        }
        self.flush()?;
        Ok(found)
    }

    pub fn delete(&mut self, table: &str, rowid: RowId) -> Result<bool> {
        self.check_open()?;
        let info = self.schema.table(table)?.clone();
        let old = match self.current_row(&info, rowid)? {
            Some(row) => row,
            None => return Ok(false),
        };
        for index in &info.indexes {
            let entry = Self::index_key_values(&info, index, &old, rowid)?;
            self.mutator()?.delete_index(index.root_page, &entry)?;
        }
        let (found, _) = self.mutator()?.delete(info.root_page, rowid)?;
        self.flush()?;
        Ok(found)
    }

    // ---- schema operations ---------------------------------------------

    fn schema_row_id(&mut self, name: &str) -> Result<Option<RowId>> {
        let mut reader = self.reader(schema::SCHEMA_TABLE_NAME)?;
        while reader.read()? {
            if let Some(row_name) = reader.get_utf8_span(1)? {
                if row_name.eq_ignore_ascii_case(name) {
                    return Ok(Some(reader.row_id()));
                }
            }
        }
        Ok(None)
    }

    fn insert_schema_row(&mut self, row: Vec<SqlValue>) -> Result<()> {
        let rowid = self.mutator()?.get_max_row_id(schema::SCHEMA_ROOT_PAGE)? + 1;
        let payload = crate::record::encode_record(&row);
        self.mutator()?.insert(schema::SCHEMA_ROOT_PAGE, rowid, &payload)?;
        self.ddl = true;
        Ok(())
    }

    pub fn create_table(&mut self, stmt: &ast::CreateTableStatement, sql: &str) -> Result<()> {
        self.check_open()?;
        if self.schema.table(&stmt.name).is_ok() {
            if stmt.if_not_exists {
                return Ok(());
            }
            return Err(Error::SchemaNotFound(format!("table {} already exists", stmt.name)));
        }
        let root = self.mutator()?.create_tree(PageType::TableLeaf)?;
        debug!("creating table {} rooted at page {}", stmt.name, root);
        self.insert_schema_row(schema::schema_row(
            ObjectKind::Table,
            &stmt.name,
            &stmt.name,
            root,
            sql,
        ))?;
        self.reload_schema()
    }

    pub fn create_index(&mut self, stmt: &ast::CreateIndexStatement, sql: &str) -> Result<()> {
        self.check_open()?;
        if self.schema.index(&stmt.name).is_ok() {
            if stmt.if_not_exists {
                return Ok(());
            }
            return Err(Error::SchemaNotFound(format!("index {} already exists", stmt.name)));
        }
        let table = self.schema.table(&stmt.table)?.clone();
        for col in &stmt.columns {
            table.column(col)?;
        }
        let root = self.mutator()?.create_tree(PageType::IndexLeaf)?;
        debug!("creating index {} rooted at page {}", stmt.name, root);
        self.insert_schema_row(schema::schema_row(
            ObjectKind::Index,
            &stmt.name,
            &stmt.table,
            root,
            sql,
        ))?;
        // Bulk build over the existing rows.
        let index = IndexInfo {
            name: stmt.name.clone(),
            table: stmt.table.clone(),
            root_page: root,
            columns: stmt.columns.clone(),
            unique: stmt.unique,
            sql: sql.to_string(),
        };
        self.flush()?;
        let mut entries = vec![];
        {
            let mut reader = self.reader(&table.name)?;
            while reader.read()? {
                let rowid = reader.row_id();
                let row = reader.logical_row()?;
                entries.push(Self::index_key_values(&table, &index, &row, rowid)?);
            }
        }
        for entry in entries {
            self.mutator()?.insert_index(root, &entry)?;
        }
        self.reload_schema()
    }

    /// Regenerates the canonical CREATE TABLE text after an ALTER.
    fn render_create_table(name: &str, columns: &[ast::ColumnDef]) -> String {
        use itertools::Itertools;
        let cols = columns
            .iter()
            .map(|c| {
                let mut s = c.name.clone();
                if !c.declared_type.is_empty() {
                    s.push(' ');
                    s.push_str(&c.declared_type);
                }
                if c.is_primary_key {
                    s.push_str(" PRIMARY KEY");
                }
                if c.is_not_null {
                    s.push_str(" NOT NULL");
                }
                if c.is_unique {
                    s.push_str(" UNIQUE");
                }
                s
            })
            .join(", ");
        format!("CREATE TABLE {} ({})", name, cols)
    }

    fn rewrite_schema_row(&mut self, rowid: RowId, row: Vec<SqlValue>) -> Result<()> {
        let payload = crate::record::encode_record(&row);
        self.mutator()?.update(schema::SCHEMA_ROOT_PAGE, rowid, &payload)?;
        self.ddl = true;
        Ok(())
    }

    pub fn alter_add_column(&mut self, table: &str, column: &ast::ColumnDef) -> Result<()> {
        self.check_open()?;
        let info = self.schema.table(table)?.clone();
        let rowid = self
            .schema_row_id(&info.name)?
            .ok_or_else(|| Error::SchemaNotFound(info.name.clone()))?;
        let mut defs: Vec<ast::ColumnDef> = match crate::parser::parse_statement(&info.sql)? {
            ast::Statement::CreateTable(ct) => ct.columns,
            _ => return Err(Error::SchemaNotFound(info.name.clone())),
        };
        defs.push(column.clone());
        let sql = Self::render_create_table(&info.name, &defs);
        self.rewrite_schema_row(
            rowid,
            schema::schema_row(ObjectKind::Table, &info.name, &info.name, info.root_page, &sql),
        )?;
        self.reload_schema()
    }

    pub fn alter_rename(&mut self, table: &str, new_name: &str) -> Result<()> {
        self.check_open()?;
        let info = self.schema.table(table)?.clone();
        let rowid = self
            .schema_row_id(&info.name)?
            .ok_or_else(|| Error::SchemaNotFound(info.name.clone()))?;
        let defs = match crate::parser::parse_statement(&info.sql)? {
            ast::Statement::CreateTable(ct) => ct.columns,
            _ => return Err(Error::SchemaNotFound(info.name.clone())),
        };
        let sql = Self::render_create_table(new_name, &defs);
        self.rewrite_schema_row(
            rowid,
            schema::schema_row(ObjectKind::Table, new_name, new_name, info.root_page, &sql),
        )?;
        // Indexes keep their names but follow the table.
        for index in &info.indexes {
            if let Some(idx_rowid) = self.schema_row_id(&index.name)? {
                self.rewrite_schema_row(
                    idx_rowid,
                    schema::schema_row(
                        ObjectKind::Index,
                        &index.name,
                        new_name,
                        index.root_page,
                        &index.sql,
                    ),
                )?;
            }
        }
        self.reload_schema()
    }

    pub fn drop_object(&mut self, kind: ast::DropKind, name: &str, if_exists: bool) -> Result<()> {
        self.check_open()?;
        let (roots, names) = match kind {
            ast::DropKind::Table => match self.schema.table(name) {
                Ok(info) => {
                    let mut roots = vec![info.root_page];
                    let mut names = vec![info.name.clone()];
                    for index in &info.indexes {
                        roots.push(index.root_page);
                        names.push(index.name.clone());
                    }
                    (roots, names)
                }
                Err(_) if if_exists => return Ok(()),
                Err(e) => return Err(e),
            },
            ast::DropKind::Index => match self.schema.index(name) {
                Ok(info) => (vec![info.root_page], vec![info.name.clone()]),
                Err(_) if if_exists => return Ok(()),
                Err(e) => return Err(e),
            },
            ast::DropKind::View => {
                let exists = self.schema.views.iter().any(|v| v.name.eq_ignore_ascii_case(name));
                if !exists {
                    return if if_exists {
                        Ok(())
                    } else {
                        Err(Error::SchemaNotFound(name.to_string()))
                    };
                }
                (vec![], vec![name.to_string()])
            }
        };
        for root in roots {
            self.mutator()?.free_tree(root)?;
        }
        for object_name in names {
            if let Some(rowid) = self.schema_row_id(&object_name)? {
                self.mutator()?.delete(schema::SCHEMA_ROOT_PAGE, rowid)?;
            }
        }
        self.ddl = true;
        self.reload_schema()
    }

    // ---- commit and rollback -------------------------------------------

    pub fn commit(mut self) -> Result<()> {
        self.check_open()?;
        self.flush()?;
        if !self.shadow.is_dirty() {
            self.done = true;
            self.db.release_writer();
            return Ok(());
        }

        // Patch the header fields the commit owns, in place on page 1.
        let page_size = self.shadow.page_size();
        let mut page1 = vec![0u8; page_size];
        self.shadow.read_page(1, &mut page1)?;
        let old = dbheader::parse_header(&page1)?;
        let (page_count, freelist_trunk, freelist_count) = match self.mutator.as_ref() {
            Some(m) => (m.page_count() as u32, m.freelist_trunk() as u32, m.freelist_count()),
            None => (
                self.shadow.page_count() as u32,
                old.freelist_trunk,
                old.freelist_count,
            ),
        };
        let cookie = if self.ddl { Some(old.schema_cookie + 1) } else { None };
        dbheader::patch_commit_fields(
            &mut page1,
            old.change_counter.wrapping_add(1),
            page_count,
            freelist_trunk,
            freelist_count,
            cookie,
        );
        self.shadow.write_page(1, &page1)?;

        let overlay = self.shadow.take_overlay();
        debug!("committing {} dirty pages", overlay.len());
        self.db.apply_commit(overlay, page_count, self.ddl)?;
        self.done = true;
        self.db.release_writer();
        Ok(())
    }

    pub fn rollback(mut self) -> Result<()> {
        self.check_open()?;
        debug!("rolling back transaction");
        self.shadow.discard();
        self.mutator = None;
        self.done = true;
        self.db.release_writer();
        Ok(())
    }
}

impl<'db> Drop for Transaction<'db> {
    fn drop(&mut self) {
        if !self.done {
            self.shadow.discard();
            self.db.release_writer();
        }
    }
}

pub(crate) type CommitPages = Vec<(PageNum, Vec<u8>)>;
