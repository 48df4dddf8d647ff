//! The system schema: one row per object in the b-tree rooted at page 1,
//! shaped (type, name, tbl_name, rootpage, sql).
//!
//! Table metadata is recovered by re-parsing each object's CREATE
//! statement with this crate's own parser. Declared 128-bit columns (UUID
//! and fixed-decimal) exist only logically: on disk they are two adjacent
//! integer columns `<col>__hi` / `<col>__lo`, recorded here as merged
//! physical ordinals and reassembled at the accessor boundary.

use std::rc::Rc;

use crate::ast;
use crate::btree::cursor::Cursor;
use crate::btree::TreeKind;
use crate::error::{Error, Result};
use crate::pager::{PageNum, PageSource};
use crate::parser;
use crate::record;
use crate::sql_type::{affinity_of_declared_type, SqlType};
use crate::sql_value::{split_i128, split_u128, SqlValue};

pub const SCHEMA_TABLE_NAME: &str = "sqlite_schema";
pub const SCHEMA_ROOT_PAGE: PageNum = 1;
pub const SCHEMA_TABLE_SQL: &str =
    "CREATE TABLE sqlite_schema (type TEXT, name TEXT, tbl_name TEXT, rootpage INT, sql TEXT)";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Table,
    Index,
    View,
    Trigger,
}

impl ObjectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::Table => "table",
            ObjectKind::Index => "index",
            ObjectKind::View => "view",
            ObjectKind::Trigger => "trigger",
        }
    }

    fn from_str(s: &str) -> Option<ObjectKind> {
        match s {
            "table" => Some(ObjectKind::Table),
            "index" => Some(ObjectKind::Index),
            "view" => Some(ObjectKind::View),
            "trigger" => Some(ObjectKind::Trigger),
            _ => None,
        }
    }
}

/// How a logical column maps onto physical record columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Scalar,
    Uuid,
    Decimal { scale: u32 },
}

#[derive(Debug, Clone)]
pub struct ColumnInfo {
    pub name: String,
    pub declared_type: String,
    pub affinity: SqlType,
    pub is_primary_key: bool,
    pub is_not_null: bool,
    /// Logical position within the declared column list.
    pub ordinal: usize,
    pub kind: ColumnKind,
    /// Physical record ordinals this column occupies: one entry for
    /// scalars, two (`__hi`, `__lo`) for 128-bit columns.
    pub merged_physical_ordinals: Vec<usize>,
}

#[derive(Debug, Clone)]
pub struct TableInfo {
    pub name: String,
    pub root_page: PageNum,
    pub columns: Vec<ColumnInfo>,
    /// Logical ordinal of an INTEGER PRIMARY KEY column, which aliases the
    /// rowid and is stored as NULL in the record body.
    pub rowid_alias: Option<usize>,
    pub sql: String,
    pub indexes: Vec<IndexInfo>,
}

#[derive(Debug, Clone)]
pub struct IndexInfo {
    pub name: String,
    pub table: String,
    pub root_page: PageNum,
    pub columns: Vec<String>,
    pub unique: bool,
    pub sql: String,
}

#[derive(Debug, Clone)]
pub struct ViewInfo {
    pub name: String,
    pub sql: String,
}

#[derive(Debug, Clone)]
pub struct Schema {
    pub tables: Vec<TableInfo>,
    pub indexes: Vec<IndexInfo>,
    pub views: Vec<ViewInfo>,
}

impl TableInfo {
    pub fn column(&self, name: &str) -> Result<&ColumnInfo> {
        self.columns
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| Error::SchemaNotFound(format!("{}.{}", self.name, name)))
    }

    /// Count of physical record columns.
    pub fn physical_column_count(&self) -> usize {
        self.columns.iter().map(|c| c.merged_physical_ordinals.len()).sum()
    }

    pub fn has_merged_columns(&self) -> bool {
        self.columns.iter().any(|c| c.kind != ColumnKind::Scalar)
    }
}

impl Schema {
    pub fn empty() -> Schema {
        Schema {
            tables: vec![],
            indexes: vec![],
            views: vec![],
        }
    }

    pub fn table(&self, name: &str) -> Result<&TableInfo> {
        self.tables
            .iter()
            .find(|t| t.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| Error::SchemaNotFound(name.to_string()))
    }

    pub fn index(&self, name: &str) -> Result<&IndexInfo> {
        self.indexes
            .iter()
            .find(|i| i.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| Error::SchemaNotFound(name.to_string()))
    }
}

fn column_kind(declared: &str) -> ColumnKind {
    let upper = declared.to_uppercase();
    if upper == "UUID" {
        return ColumnKind::Uuid;
    }
    if let Some(rest) = upper.strip_prefix("DECIMAL") {
        let scale = rest
            .trim_start_matches('(')
            .trim_end_matches(')')
            .split(',')
            .nth(1)
            .and_then(|s| s.trim().parse::<u32>().ok())
            .unwrap_or(0);
        return ColumnKind::Decimal { scale };
    }
    ColumnKind::Scalar
}

/// Builds a table description from its parsed CREATE statement.
pub fn table_from_create(
    stmt: &ast::CreateTableStatement,
    root_page: PageNum,
    sql: String,
) -> TableInfo {
    let mut columns = vec![];
    let mut physical = 0;
    let mut rowid_alias = None;
    for (ordinal, def) in stmt.columns.iter().enumerate() {
        let kind = column_kind(&def.declared_type);
        let affinity = match kind {
            ColumnKind::Scalar => affinity_of_declared_type(&def.declared_type),
            ColumnKind::Uuid | ColumnKind::Decimal { .. } => SqlType::Numeric,
        };
        let width = if kind == ColumnKind::Scalar { 1 } else { 2 };
        let merged_physical_ordinals: Vec<usize> = (physical..physical + width).collect();
        physical += width;
        if def.is_primary_key
            && kind == ColumnKind::Scalar
            && def.declared_type.eq_ignore_ascii_case("INTEGER")
        {
            rowid_alias = Some(ordinal);
        }
        columns.push(ColumnInfo {
            name: def.name.clone(),
            declared_type: def.declared_type.clone(),
            affinity,
            is_primary_key: def.is_primary_key,
            is_not_null: def.is_not_null,
            ordinal,
            kind,
            merged_physical_ordinals,
        });
    }
    TableInfo {
        name: stmt.name.clone(),
        root_page,
        columns,
        rowid_alias,
        sql,
        indexes: vec![],
    }
}

/// The schema table's own description, usable like any other table.
pub fn builtin_schema_table() -> Result<TableInfo> {
    let stmt = parser::parse_statement(SCHEMA_TABLE_SQL)?;
    match stmt {
        ast::Statement::CreateTable(ct) => Ok(table_from_create(
            &ct,
            SCHEMA_ROOT_PAGE,
            SCHEMA_TABLE_SQL.to_string(),
        )),
        _ => Err(Error::SchemaNotFound(SCHEMA_TABLE_NAME.to_string())),
    }
}

/// The record stored in the schema table for one object.
pub fn schema_row(kind: ObjectKind, name: &str, tbl_name: &str, root_page: PageNum, sql: &str) -> Vec<SqlValue> {
    vec![
        SqlValue::Text(kind.as_str().to_string()),
        SqlValue::Text(name.to_string()),
        SqlValue::Text(tbl_name.to_string()),
        SqlValue::Int(root_page as i64),
        SqlValue::Text(sql.to_string()),
    ]
}

/// Scans the schema b-tree and assembles the full catalog.
pub fn load_schema(source: Rc<dyn PageSource>, usable: usize) -> Result<Schema> {
    let mut schema = Schema::empty();
    let mut cursor = Cursor::new(source, SCHEMA_ROOT_PAGE, TreeKind::Table, usable);
    while cursor.move_next()? {
        let payload = cursor.payload()?;
        let row = record::decode_record(payload)?;
        if row.len() < 5 {
            return Err(Error::corrupt(SCHEMA_ROOT_PAGE, "schema row is too narrow"));
        }
        let kind = match &row[0] {
            SqlValue::Text(t) => ObjectKind::from_str(t),
            _ => None,
        };
        let kind = match kind {
            Some(k) => k,
            None => continue,
        };
        let name = match &row[1] {
            SqlValue::Text(t) => t.clone(),
            _ => continue,
        };
        let tbl_name = match &row[2] {
            SqlValue::Text(t) => t.clone(),
            _ => String::new(),
        };
        let root_page = match &row[3] {
            SqlValue::Int(i) => *i as PageNum,
            _ => 0,
        };
        let sql = match &row[4] {
            SqlValue::Text(t) => t.clone(),
            _ => String::new(),
        };
        match kind {
            ObjectKind::Table => {
                let stmt = parser::parse_statement(&sql)?;
                if let ast::Statement::CreateTable(ct) = stmt {
                    schema.tables.push(table_from_create(&ct, root_page, sql));
                }
            }
            ObjectKind::Index => {
                let stmt = parser::parse_statement(&sql)?;
                if let ast::Statement::CreateIndex(ci) = stmt {
                    schema.indexes.push(IndexInfo {
                        name,
                        table: tbl_name,
                        root_page,
                        columns: ci.columns,
                        unique: ci.unique,
                        sql,
                    });
                }
            }
            ObjectKind::View => schema.views.push(ViewInfo { name, sql }),
            ObjectKind::Trigger => {}
        }
    }
    // Attach each index to its owning table.
    for index in &schema.indexes {
        if let Some(table) = schema
            .tables
            .iter_mut()
            .find(|t| t.name.eq_ignore_ascii_case(&index.table))
        {
            table.indexes.push(index.clone());
        }
    }
    Ok(schema)
}

/// Parses the canonical `xxxxxxxx-xxxx-xxxx-xxxx-xxxxxxxxxxxx` form.
pub fn parse_uuid(text: &str) -> Option<u128> {
    let mut value: u128 = 0;
    let mut digits = 0;
    for (i, c) in text.chars().enumerate() {
        if c == '-' {
            if !matches!(i, 8 | 13 | 18 | 23) {
                return None;
            }
            continue;
        }
        let d = c.to_digit(16)? as u128;
        value = (value << 4) | d;
        digits += 1;
    }
    if digits == 32 {
        Some(value)
    } else {
        None
    }
}

/// Parses a decimal string into a mantissa scaled by `scale` digits.
pub fn parse_decimal(text: &str, scale: u32) -> Option<i128> {
    let text = text.trim();
    let (negative, digits) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text.strip_prefix('+').unwrap_or(text)),
    };
    let (int_part, frac_part) = match digits.split_once('.') {
        Some((i, f)) => (i, f),
        None => (digits, ""),
    };
    if int_part.is_empty() && frac_part.is_empty() {
        return None;
    }
    let mut mantissa: i128 = 0;
    for c in int_part.chars() {
        mantissa = mantissa.checked_mul(10)?.checked_add(c.to_digit(10)? as i128)?;
    }
    for i in 0..scale as usize {
        let digit = frac_part.chars().nth(i).map_or(Some(0), |c| c.to_digit(10))?;
        mantissa = mantissa.checked_mul(10)?.checked_add(digit as i128)?;
    }
    // Digits past the declared scale must be zero rather than silently
    // truncated.
    if frac_part.len() > scale as usize
        && frac_part[scale as usize..].chars().any(|c| c != '0')
    {
        return None;
    }
    Some(if negative { -mantissa } else { mantissa })
}

fn expand_one(column: &ColumnInfo, value: &SqlValue, out: &mut Vec<SqlValue>) -> Result<()> {
    match column.kind {
        ColumnKind::Scalar => {
            out.push(value.clone());
            Ok(())
        }
        ColumnKind::Uuid => {
            let v = match value {
                SqlValue::Null() => {
                    out.push(SqlValue::Null());
                    out.push(SqlValue::Null());
                    return Ok(());
                }
                SqlValue::Text(t) => parse_uuid(t)
                    .ok_or_else(|| Error::SchemaNotFound(format!("malformed UUID for {}", column.name)))?,
                SqlValue::Blob(b) if b.len() == 16 => {
                    let mut raw = [0u8; 16];
                    raw.copy_from_slice(b);
                    u128::from_be_bytes(raw)
                }
                _ => {
                    return Err(Error::SchemaNotFound(format!(
                        "column {} expects a UUID text or 16-byte blob",
                        column.name
                    )))
                }
            };
            let (hi, lo) = split_u128(v);
            out.push(SqlValue::Int(hi));
            out.push(SqlValue::Int(lo));
            Ok(())
        }
        ColumnKind::Decimal { scale } => {
            let mantissa = match value {
                SqlValue::Null() => {
                    out.push(SqlValue::Null());
                    out.push(SqlValue::Null());
                    return Ok(());
                }
                SqlValue::Int(i) => (*i as i128).checked_mul(10i128.pow(scale)).ok_or_else(|| {
                    Error::SchemaNotFound(format!("decimal overflow in {}", column.name))
                })?,
                SqlValue::Text(t) => parse_decimal(t, scale).ok_or_else(|| {
                    Error::SchemaNotFound(format!("malformed decimal for {}", column.name))
                })?,
                _ => {
                    return Err(Error::SchemaNotFound(format!(
                        "column {} expects an integer or decimal text",
                        column.name
                    )))
                }
            };
            let (hi, lo) = split_i128(mantissa);
            out.push(SqlValue::Int(hi));
            out.push(SqlValue::Int(lo));
            Ok(())
        }
    }
}

/// Expands one logical row into its physical record values. The fast path
/// returns the input untouched when the table has no merged columns.
pub fn expand_merged(values: Vec<SqlValue>, table: &TableInfo) -> Result<Vec<SqlValue>> {
    if values.len() != table.columns.len() {
        return Err(Error::SchemaNotFound(format!(
            "table {} expects {} values, got {}",
            table.name,
            table.columns.len(),
            values.len()
        )));
    }
    if !table.has_merged_columns() {
        return Ok(values);
    }
    let mut out = Vec::with_capacity(table.physical_column_count());
    for (column, value) in table.columns.iter().zip(values.iter()) {
        expand_one(column, value, &mut out)?;
    }
    Ok(out)
}
