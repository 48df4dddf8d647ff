//! Query execution: the streaming reader and the SELECT pipeline.
//!
//! The reader is the zero-allocation hot path: it borrows payload bytes
//! from the cursor, scans the record header once per row, and decodes only
//! what the typed accessors ask for. The SELECT pipeline on top of it
//! materializes rows for projection, ordering (bounded top-K when LIMIT is
//! present), set operations over 64-bit fingerprints, and streaming
//! aggregation.

use std::cmp::Ordering;
use std::collections::hash_map::Entry;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::rc::Rc;

use crate::ast::*;
use crate::btree::cursor::Cursor;
use crate::btree::TreeKind;
use crate::error::{Error, Result};
use crate::filter::{self, CompiledFilter};
use crate::pager::PageSource;
use crate::record;
use crate::schema::{ColumnKind, Schema, TableInfo};
use crate::serial_type;
use crate::sql_value::{join_i128, join_u128, SqlValue};

// ---- streaming reader ----------------------------------------------------

/// Streaming row reader over one table b-tree.
///
/// `read` advances to the next row that passes the filter; the typed
/// accessors address columns by their logical ordinal and only then touch
/// the payload bytes.
pub struct Reader {
    cursor: Cursor,
    table: TableInfo,
    filter: Option<CompiledFilter>,
    serials: Vec<i64>,
    offsets: Vec<i32>,
}

impl Reader {
    pub fn new(
        source: Rc<dyn PageSource>,
        usable: usize,
        table: TableInfo,
        filter: Option<CompiledFilter>,
    ) -> Reader {
        let cursor = Cursor::new(source, table.root_page, TreeKind::Table, usable);
        Reader {
            cursor,
            table,
            filter,
            serials: vec![],
            offsets: vec![],
        }
    }

    pub fn table(&self) -> &TableInfo {
        &self.table
    }

    pub fn row_id(&self) -> i64 {
        self.cursor.row_id()
    }

    pub fn is_stale(&self) -> bool {
        self.cursor.is_stale()
    }

    pub fn reset(&mut self) {
        self.cursor.reset();
    }

    fn scan_current_header(&mut self) -> Result<()> {
        let mut serials = std::mem::take(&mut self.serials);
        let mut offsets = std::mem::take(&mut self.offsets);
        let res = {
            let payload = self.cursor.payload()?;
            record::scan_header(payload, &mut serials, &mut offsets)
        };
        self.serials = serials;
        self.offsets = offsets;
        res
    }

    fn passes_filter(&mut self) -> Result<bool> {
        let row_id = self.cursor.row_id();
        match &self.filter {
            None => Ok(true),
            Some(f) => {
                let payload = self.cursor.payload()?;
                Ok((f.predicate)(payload, &self.serials, &self.offsets, row_id))
            }
        }
    }

    /// Advances to the next matching row. Returns false at the end.
    pub fn read(&mut self) -> Result<bool> {
        while self.cursor.move_next()? {
            self.scan_current_header()?;
            if self.passes_filter()? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Positions on the row with `rowid`. A miss leaves the reader on the
    /// successor and returns false, like the cursor seek.
    pub fn seek(&mut self, rowid: i64) -> Result<bool> {
        let found = self.cursor.seek(rowid)?;
        if self.cursor.is_valid() {
            self.scan_current_header()?;
        }
        Ok(found)
    }

    fn column(&self, ordinal: usize) -> Result<&crate::schema::ColumnInfo> {
        self.table
            .columns
            .get(ordinal)
            .ok_or_else(|| Error::SchemaNotFound(format!("column ordinal {}", ordinal)))
    }

    fn physical_slot(&mut self, phys: usize) -> Result<(i64, std::ops::Range<usize>)> {
        if phys >= self.serials.len() {
            // Rows written before an ALTER ... ADD COLUMN are narrower;
            // missing trailing columns read as NULL.
            return Ok((0, 0..0));
        }
        let serial = self.serials[phys];
        let start = self.offsets[phys] as usize;
        let len = serial_type::serial_type_len(serial)?;
        Ok((serial, start..start + len))
    }

    pub fn is_null(&mut self, ordinal: usize) -> Result<bool> {
        let col = self.column(ordinal)?.clone();
        if Some(ordinal) == self.table.rowid_alias {
            return Ok(false);
        }
        let (serial, _) = self.physical_slot(col.merged_physical_ordinals[0])?;
        Ok(serial == 0)
    }

    pub fn get_i64(&mut self, ordinal: usize) -> Result<Option<i64>> {
        if Some(ordinal) == self.table.rowid_alias {
            return Ok(Some(self.cursor.row_id()));
        }
        let col = self.column(ordinal)?.clone();
        let (serial, range) = self.physical_slot(col.merged_physical_ordinals[0])?;
        let payload = self.cursor.payload()?;
        Ok(serial_type::read_int(serial, &payload[range]))
    }

    pub fn get_f64(&mut self, ordinal: usize) -> Result<Option<f64>> {
        if Some(ordinal) == self.table.rowid_alias {
            return Ok(Some(self.cursor.row_id() as f64));
        }
        let col = self.column(ordinal)?.clone();
        let (serial, range) = self.physical_slot(col.merged_physical_ordinals[0])?;
        let payload = self.cursor.payload()?;
        Ok(serial_type::read_real(serial, &payload[range]))
    }

    /// Borrowed UTF-8 span of a text column; no allocation.
    pub fn get_utf8_span(&mut self, ordinal: usize) -> Result<Option<&str>> {
        let col = self.column(ordinal)?.clone();
        let (serial, range) = self.physical_slot(col.merged_physical_ordinals[0])?;
        if serial < 13 || serial % 2 == 0 {
            return Ok(None);
        }
        let payload = self.cursor.payload()?;
        let text = std::str::from_utf8(&payload[range])
            .map_err(|_| Error::UnsupportedFeature("non-UTF-8 text payload"))?;
        Ok(Some(text))
    }

    /// Borrowed blob span; no allocation.
    pub fn get_blob_span(&mut self, ordinal: usize) -> Result<Option<&[u8]>> {
        let col = self.column(ordinal)?.clone();
        let (serial, range) = self.physical_slot(col.merged_physical_ordinals[0])?;
        if serial < 12 || serial % 2 == 1 {
            return Ok(None);
        }
        let payload = self.cursor.payload()?;
        Ok(Some(&payload[range]))
    }

    /// Reassembles a UUID column from its two physical halves.
    pub fn get_uuid(&mut self, ordinal: usize) -> Result<Option<u128>> {
        let col = self.column(ordinal)?.clone();
        if col.kind != ColumnKind::Uuid {
            return Err(Error::SchemaNotFound(format!("{} is not a UUID column", col.name)));
        }
        match self.merged_halves(&col.merged_physical_ordinals)? {
            Some((hi, lo)) => Ok(Some(join_u128(hi, lo))),
            None => Ok(None),
        }
    }

    /// Reassembles a fixed-decimal column as `(mantissa, scale)`.
    pub fn get_decimal(&mut self, ordinal: usize) -> Result<Option<(i128, u32)>> {
        let col = self.column(ordinal)?.clone();
        let scale = match col.kind {
            ColumnKind::Decimal { scale } => scale,
            _ => {
                return Err(Error::SchemaNotFound(format!(
                    "{} is not a decimal column",
                    col.name
                )))
            }
        };
        match self.merged_halves(&col.merged_physical_ordinals)? {
            Some((hi, lo)) => Ok(Some((join_i128(hi, lo), scale))),
            None => Ok(None),
        }
    }

    fn merged_halves(&mut self, ordinals: &[usize]) -> Result<Option<(i64, i64)>> {
        let (hs, hr) = self.physical_slot(ordinals[0])?;
        let (ls, lr) = self.physical_slot(ordinals[1])?;
        let payload = self.cursor.payload()?;
        let hi = serial_type::read_int(hs, &payload[hr]);
        let lo = serial_type::read_int(ls, &payload[lr]);
        match (hi, lo) {
            (Some(hi), Some(lo)) => Ok(Some((hi, lo))),
            _ => Ok(None),
        }
    }

    /// Owned value of one logical column; the only accessor that
    /// allocates. UUID and decimal columns come back in text form.
    pub fn value(&mut self, ordinal: usize) -> Result<SqlValue> {
        let col = self.column(ordinal)?.clone();
        if Some(ordinal) == self.table.rowid_alias {
            return Ok(SqlValue::Int(self.cursor.row_id()));
        }
        match col.kind {
            ColumnKind::Uuid => Ok(match self.get_uuid(ordinal)? {
                Some(v) => SqlValue::Text(format_uuid(v)),
                None => SqlValue::Null(),
            }),
            ColumnKind::Decimal { scale } => Ok(match self.get_decimal(ordinal)? {
                Some((mantissa, _)) => SqlValue::Text(format_decimal(mantissa, scale)),
                None => SqlValue::Null(),
            }),
            ColumnKind::Scalar => {
                let (serial, range) = self.physical_slot(col.merged_physical_ordinals[0])?;
                let payload = self.cursor.payload()?;
                serial_type::to_sql_value(serial, &payload[range])
            }
        }
    }

    /// The full logical row, decoded.
    pub fn logical_row(&mut self) -> Result<Vec<SqlValue>> {
        (0..self.table.columns.len()).map(|i| self.value(i)).collect()
    }
}

pub fn format_uuid(v: u128) -> String {
    let b = v.to_be_bytes();
    format!(
        "{:02x}{:02x}{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
        b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7], b[8], b[9], b[10], b[11], b[12], b[13], b[14], b[15]
    )
}

pub fn format_decimal(mantissa: i128, scale: u32) -> String {
    if scale == 0 {
        return mantissa.to_string();
    }
    let negative = mantissa < 0;
    let abs = mantissa.unsigned_abs();
    let divisor = 10u128.pow(scale);
    let int_part = abs / divisor;
    let frac_part = abs % divisor;
    format!(
        "{}{}.{:0width$}",
        if negative { "-" } else { "" },
        int_part,
        frac_part,
        width = scale as usize
    )
}

// ---- fingerprints --------------------------------------------------------

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

fn fnv1a(hash: u64, bytes: &[u8]) -> u64 {
    let mut h = hash;
    for b in bytes {
        h ^= *b as u64;
        h = h.wrapping_mul(FNV_PRIME);
    }
    h
}

/// 64-bit FNV-1a fingerprint over (storage-class tag ‖ content bytes) of
/// each value. Rows compare equal for set operations iff their
/// fingerprints do.
pub fn row_fingerprint(row: &[SqlValue]) -> u64 {
    let mut h = FNV_OFFSET;
    for v in row {
        match v {
            SqlValue::Null() => h = fnv1a(h, &[0]),
            SqlValue::Int(i) => {
                h = fnv1a(h, &[1]);
                h = fnv1a(h, &i.to_be_bytes());
            }
            SqlValue::Real(r) => {
                h = fnv1a(h, &[2]);
                h = fnv1a(h, &r.to_bits().to_be_bytes());
            }
            SqlValue::Text(t) => {
                h = fnv1a(h, &[3]);
                h = fnv1a(h, t.as_bytes());
            }
            SqlValue::Blob(b) => {
                h = fnv1a(h, &[4]);
                h = fnv1a(h, b);
            }
        }
    }
    h
}

// ---- query output --------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct QueryOutput {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<SqlValue>>,
}

// ---- expression evaluation over materialized rows ------------------------

struct RowEnv<'a> {
    columns: &'a [String],
    values: &'a [SqlValue],
    params: &'a [(String, SqlValue)],
}

fn truthy(v: &SqlValue) -> bool {
    match v {
        SqlValue::Int(i) => *i != 0,
        SqlValue::Real(r) => *r != 0.0,
        _ => false,
    }
}

fn numeric_pair(a: &SqlValue, b: &SqlValue) -> Option<(f64, f64, bool)> {
    match (a, b) {
        (SqlValue::Int(x), SqlValue::Int(y)) => Some((*x as f64, *y as f64, true)),
        (SqlValue::Int(x), SqlValue::Real(y)) => Some((*x as f64, *y, false)),
        (SqlValue::Real(x), SqlValue::Int(y)) => Some((*x, *y as f64, false)),
        (SqlValue::Real(x), SqlValue::Real(y)) => Some((*x, *y, false)),
        _ => None,
    }
}

/// Evaluates an expression against one named row; the DML paths use this
/// for VALUES lists and SET assignments.
pub(crate) fn eval_with_row(
    expr: &Expr,
    columns: &[String],
    values: &[SqlValue],
    params: &[(String, SqlValue)],
) -> Result<SqlValue> {
    eval_expr(
        expr,
        &RowEnv {
            columns,
            values,
            params,
        },
    )
}

fn eval_expr(expr: &Expr, env: &RowEnv) -> Result<SqlValue> {
    match expr {
        Expr::Constant(c) => Ok(match c {
            Constant::Int(i) => SqlValue::Int(*i),
            Constant::Real(r) => SqlValue::Real(*r),
            Constant::String(s) => SqlValue::Text(s.clone()),
            Constant::Blob(b) => SqlValue::Blob(b.clone()),
            Constant::Bool(b) => SqlValue::Int(*b as i64),
            Constant::Null() => SqlValue::Null(),
        }),
        Expr::Param(name) => env
            .params
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.clone())
            .ok_or_else(|| Error::SchemaNotFound(format!("unbound parameter ${}", name))),
        Expr::Column(col) => {
            let idx = env
                .columns
                .iter()
                .position(|c| c.eq_ignore_ascii_case(&col.name))
                .ok_or_else(|| Error::SchemaNotFound(col.name.clone()))?;
            Ok(env.values[idx].clone())
        }
        Expr::Unary { op: UnOp::Neg, expr } => match eval_expr(expr, env)? {
            SqlValue::Int(i) => Ok(SqlValue::Int(-i)),
            SqlValue::Real(r) => Ok(SqlValue::Real(-r)),
            SqlValue::Null() => Ok(SqlValue::Null()),
            _ => Err(Error::UnsupportedFeature("negation of a non-numeric value")),
        },
        Expr::Unary { op: UnOp::Not, expr } => match eval_expr(expr, env)? {
            SqlValue::Null() => Ok(SqlValue::Null()),
            v => Ok(SqlValue::Int((!truthy(&v)) as i64)),
        },
        Expr::BinOp { lhs, op, rhs } => {
            let a = eval_expr(lhs, env)?;
            let b = eval_expr(rhs, env)?;
            eval_binop(&a, *op, &b)
        }
        Expr::IsNull { expr, negated } => {
            let v = eval_expr(expr, env)?;
            let is_null = matches!(v, SqlValue::Null());
            Ok(SqlValue::Int((is_null != *negated) as i64))
        }
        Expr::InList { expr, list, negated } => {
            let v = eval_expr(expr, env)?;
            if matches!(v, SqlValue::Null()) {
                return Ok(SqlValue::Null());
            }
            let mut hit = false;
            for item in list {
                let w = eval_expr(item, env)?;
                if v.record_cmp(&w) == Ordering::Equal {
                    hit = true;
                    break;
                }
            }
            Ok(SqlValue::Int((hit != *negated) as i64))
        }
        Expr::Between { expr, low, high, negated } => {
            let v = eval_expr(expr, env)?;
            let lo = eval_expr(low, env)?;
            let hi = eval_expr(high, env)?;
            if matches!(v, SqlValue::Null())
                || matches!(lo, SqlValue::Null())
                || matches!(hi, SqlValue::Null())
            {
                return Ok(SqlValue::Null());
            }
            let hit =
                v.record_cmp(&lo) != Ordering::Less && v.record_cmp(&hi) != Ordering::Greater;
            Ok(SqlValue::Int((hit != *negated) as i64))
        }
        Expr::Like { expr, pattern, negated } => {
            let v = eval_expr(expr, env)?;
            let p = eval_expr(pattern, env)?;
            match (v, p) {
                (SqlValue::Text(t), SqlValue::Text(p)) => {
                    let hit = filter::like_match(p.as_bytes(), t.as_bytes());
                    Ok(SqlValue::Int((hit != *negated) as i64))
                }
                _ => Ok(SqlValue::Null()),
            }
        }
        Expr::Cast { expr, type_name } => {
            let v = eval_expr(expr, env)?;
            cast_value(v, type_name)
        }
        Expr::Case { .. } => Err(Error::UnsupportedFeature("CASE is parsed but not executed")),
        Expr::Call { .. } => Err(Error::UnsupportedFeature(
            "aggregate used outside an aggregation context",
        )),
    }
}

fn eval_binop(a: &SqlValue, op: Op, b: &SqlValue) -> Result<SqlValue> {
    use SqlValue::*;
    if matches!(a, Null()) || matches!(b, Null()) {
        return Ok(Null());
    }
    match op {
        Op::And => Ok(Int((truthy(a) && truthy(b)) as i64)),
        Op::Or => Ok(Int((truthy(a) || truthy(b)) as i64)),
        Op::Eq | Op::Ne | Op::Lt | Op::Le | Op::Gt | Op::Ge => {
            let ord = a.record_cmp(b);
            let hit = match op {
                Op::Eq => ord == Ordering::Equal,
                Op::Ne => ord != Ordering::Equal,
                Op::Lt => ord == Ordering::Less,
                Op::Le => ord != Ordering::Greater,
                Op::Gt => ord == Ordering::Greater,
                Op::Ge => ord != Ordering::Less,
                _ => unreachable!(),
            };
            Ok(Int(hit as i64))
        }
        Op::Add | Op::Subtract | Op::Multiply | Op::Divide | Op::Modulo => {
            let (x, y, both_int) = numeric_pair(a, b)
                .ok_or(Error::UnsupportedFeature("arithmetic on non-numeric values"))?;
            if matches!(op, Op::Divide | Op::Modulo) && y == 0.0 {
                return Ok(Null());
            }
            let r = match op {
                Op::Add => x + y,
                Op::Subtract => x - y,
                Op::Multiply => x * y,
                Op::Divide => x / y,
                Op::Modulo => x % y,
                _ => unreachable!(),
            };
            if both_int && !matches!(op, Op::Divide) {
                Ok(Int(r as i64))
            } else if both_int && r.fract() == 0.0 {
                Ok(Int(r as i64))
            } else {
                Ok(Real(r))
            }
        }
    }
}

fn cast_value(v: SqlValue, type_name: &str) -> Result<SqlValue> {
    use crate::sql_type::{affinity_of_declared_type, SqlType};
    if matches!(v, SqlValue::Null()) {
        return Ok(SqlValue::Null());
    }
    match affinity_of_declared_type(type_name) {
        SqlType::Text => Ok(SqlValue::Text(v.to_string())),
        SqlType::Int => Ok(match v {
            SqlValue::Int(i) => SqlValue::Int(i),
            SqlValue::Real(r) => SqlValue::Int(r as i64),
            SqlValue::Text(t) => SqlValue::Int(t.trim().parse::<i64>().unwrap_or(0)),
            other => other,
        }),
        SqlType::Real | SqlType::Numeric => Ok(match v {
            SqlValue::Int(i) => SqlValue::Real(i as f64),
            SqlValue::Real(r) => SqlValue::Real(r),
            SqlValue::Text(t) => SqlValue::Real(t.trim().parse::<f64>().unwrap_or(0.0)),
            other => other,
        }),
        SqlType::Blob => Ok(match v {
            SqlValue::Text(t) => SqlValue::Blob(t.into_bytes()),
            other => other,
        }),
    }
}

// ---- ordering ------------------------------------------------------------

#[derive(Clone)]
struct SortSpec {
    /// (descending, nulls_first) per key.
    keys: Vec<(bool, bool)>,
}

impl SortSpec {
    fn from_order(order: &[OrderKey]) -> SortSpec {
        SortSpec {
            keys: order
                .iter()
                .map(|k| {
                    // Default placement: NULLs first ascending, last
                    // descending.
                    let nulls_first = k.nulls_first.unwrap_or(!k.descending);
                    (k.descending, nulls_first)
                })
                .collect(),
        }
    }

    fn compare(&self, a: &[SqlValue], b: &[SqlValue]) -> Ordering {
        for (i, (descending, nulls_first)) in self.keys.iter().enumerate() {
            let (x, y) = (&a[i], &b[i]);
            let x_null = matches!(x, SqlValue::Null());
            let y_null = matches!(y, SqlValue::Null());
            let ord = match (x_null, y_null) {
                (true, true) => Ordering::Equal,
                (true, false) => {
                    if *nulls_first {
                        Ordering::Less
                    } else {
                        Ordering::Greater
                    }
                }
                (false, true) => {
                    if *nulls_first {
                        Ordering::Greater
                    } else {
                        Ordering::Less
                    }
                }
                (false, false) => {
                    let o = x.record_cmp(y);
                    if *descending {
                        o.reverse()
                    } else {
                        o
                    }
                }
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }
}

struct HeapEntry {
    keys: Vec<SqlValue>,
    row: Vec<SqlValue>,
    spec: Rc<SortSpec>,
    seq: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}
impl Eq for HeapEntry {}
impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap on sort order, ties broken by arrival for stability.
        self.spec
            .compare(&self.keys, &other.keys)
            .then(self.seq.cmp(&other.seq))
    }
}

/// Streaming ORDER BY + LIMIT: a heap bounded at `limit` entries keeps
/// memory O(k) no matter the scan size.
struct TopK {
    spec: Rc<SortSpec>,
    limit: usize,
    heap: BinaryHeap<HeapEntry>,
    seq: usize,
}

impl TopK {
    fn new(spec: SortSpec, limit: usize) -> TopK {
        TopK {
            spec: Rc::new(spec),
            limit,
            heap: BinaryHeap::new(),
            seq: 0,
        }
    }

    fn push(&mut self, keys: Vec<SqlValue>, row: Vec<SqlValue>) {
        if self.limit == 0 {
            return;
        }
        let entry = HeapEntry {
            keys,
            row,
            spec: self.spec.clone(),
            seq: self.seq,
        };
        self.seq += 1;
        if self.heap.len() < self.limit {
            self.heap.push(entry);
        } else if let Some(worst) = self.heap.peek() {
            if entry.cmp(worst) == Ordering::Less {
                self.heap.pop();
                self.heap.push(entry);
            }
        }
    }

    fn into_sorted_rows(self) -> Vec<Vec<SqlValue>> {
        let mut entries = self.heap.into_vec();
        entries.sort_by(|a, b| a.cmp(b));
        entries.into_iter().map(|e| e.row).collect()
    }
}

// ---- select pipeline -----------------------------------------------------

/// Everything a SELECT needs from the database handle.
pub struct ExecContext<'a> {
    pub schema: &'a Schema,
    pub source: Rc<dyn PageSource>,
    pub usable: usize,
}

pub fn run_select(
    cx: &ExecContext,
    stmt: &SelectStatement,
    params: &[(String, SqlValue)],
) -> Result<QueryOutput> {
    let mut env: HashMap<String, QueryOutput> = HashMap::new();
    for cte in &stmt.ctes {
        let out = run_select_with_env(cx, &cte.select, params, &env)?;
        env.insert(cte.name.to_lowercase(), out);
    }
    run_select_inner(cx, stmt, params, &env)
}

fn run_select_with_env(
    cx: &ExecContext,
    stmt: &SelectStatement,
    params: &[(String, SqlValue)],
    outer: &HashMap<String, QueryOutput>,
) -> Result<QueryOutput> {
    let mut env = outer.clone();
    for cte in &stmt.ctes {
        let out = run_select_with_env(cx, &cte.select, params, &env)?;
        env.insert(cte.name.to_lowercase(), out);
    }
    run_select_inner(cx, stmt, params, &env)
}

fn run_select_inner(
    cx: &ExecContext,
    stmt: &SelectStatement,
    params: &[(String, SqlValue)],
    env: &HashMap<String, QueryOutput>,
) -> Result<QueryOutput> {
    let limit = match &stmt.limit {
        None => None,
        Some(e) => Some(eval_scalar_int(e, params)? as usize),
    };
    let offset = match &stmt.offset {
        None => 0,
        Some(e) => eval_scalar_int(e, params)? as usize,
    };

    match &stmt.body {
        SelectBody::Simple(core) => run_core(cx, core, params, env, &stmt.order_by, limit, offset),
        SelectBody::Compound { .. } => {
            let mut out = run_body(cx, &stmt.body, params, env)?;
            sort_and_window(&mut out, &stmt.order_by, limit, offset)?;
            Ok(out)
        }
    }
}

fn run_body(
    cx: &ExecContext,
    body: &SelectBody,
    params: &[(String, SqlValue)],
    env: &HashMap<String, QueryOutput>,
) -> Result<QueryOutput> {
    match body {
        SelectBody::Simple(core) => run_core(cx, core, params, env, &[], None, 0),
        SelectBody::Compound { op, all, left, right } => {
            let left_out = run_body(cx, left, params, env)?;
            let right_out = run_body(cx, right, params, env)?;
            if left_out.columns.len() != right_out.columns.len() {
                return Err(Error::UnsupportedFeature(
                    "compound selects need matching column counts",
                ));
            }
            let mut rows = vec![];
            match op {
                CompoundOp::Union => {
                    if *all {
                        rows.extend(left_out.rows);
                        rows.extend(right_out.rows);
                    } else {
                        let mut seen: HashSet<u64> = HashSet::new();
                        for row in left_out.rows.into_iter().chain(right_out.rows) {
                            if seen.insert(row_fingerprint(&row)) {
                                rows.push(row);
                            }
                        }
                    }
                }
                CompoundOp::Intersect => {
                    let right_set: HashSet<u64> =
                        right_out.rows.iter().map(|r| row_fingerprint(r)).collect();
                    let mut seen: HashSet<u64> = HashSet::new();
                    for row in left_out.rows {
                        let fp = row_fingerprint(&row);
                        if right_set.contains(&fp) && seen.insert(fp) {
                            rows.push(row);
                        }
                    }
                }
                CompoundOp::Except => {
                    let right_set: HashSet<u64> =
                        right_out.rows.iter().map(|r| row_fingerprint(r)).collect();
                    let mut seen: HashSet<u64> = HashSet::new();
                    for row in left_out.rows {
                        let fp = row_fingerprint(&row);
                        if !right_set.contains(&fp) && seen.insert(fp) {
                            rows.push(row);
                        }
                    }
                }
            }
            Ok(QueryOutput {
                columns: left_out.columns,
                rows,
            })
        }
    }
}

fn eval_scalar_int(expr: &Expr, params: &[(String, SqlValue)]) -> Result<i64> {
    let env = RowEnv {
        columns: &[],
        values: &[],
        params,
    };
    match eval_expr(expr, &env)? {
        SqlValue::Int(i) if i >= 0 => Ok(i),
        _ => Err(Error::UnsupportedFeature("LIMIT and OFFSET take non-negative integers")),
    }
}

fn display_name(item: &SelItem, position: usize) -> String {
    match item {
        SelItem::Star => "*".to_string(),
        SelItem::Expr { alias: Some(a), .. } => a.clone(),
        SelItem::Expr { expr, .. } => match expr {
            Expr::Column(c) => c.name.clone(),
            Expr::Call { name, star, .. } => {
                if *star {
                    format!("{}(*)", name.to_uppercase())
                } else {
                    format!("{}()", name.to_uppercase())
                }
            }
            _ => format!("column{}", position + 1),
        },
    }
}

fn expr_has_aggregate(expr: &Expr) -> bool {
    match expr {
        Expr::Call { name, .. } => {
            matches!(name.to_uppercase().as_str(), "COUNT" | "SUM" | "AVG" | "MIN" | "MAX")
        }
        Expr::BinOp { lhs, rhs, .. } => expr_has_aggregate(lhs) || expr_has_aggregate(rhs),
        Expr::Unary { expr, .. } => expr_has_aggregate(expr),
        _ => false,
    }
}

/// The materialized source rows a core select reads from.
/// `filter_applied` reports whether the WHERE clause was already pushed
/// down into the reader as a compiled byte-level predicate.
struct SourceRows {
    columns: Vec<String>,
    rows: Vec<Vec<SqlValue>>,
    filter_applied: bool,
}

fn materialize_source(
    cx: &ExecContext,
    core: &SelectCore,
    params: &[(String, SqlValue)],
    env: &HashMap<String, QueryOutput>,
) -> Result<SourceRows> {
    if !core.joins.is_empty() {
        return Err(Error::UnsupportedFeature("join execution"));
    }
    match &core.from {
        None => Ok(SourceRows {
            columns: vec![],
            rows: vec![vec![]],
            filter_applied: false,
        }),
        Some(FromSource::Traverse { .. }) => {
            Err(Error::UnsupportedFeature("graph traversal execution"))
        }
        Some(FromSource::Subquery { select, .. }) => {
            let inner = run_select_with_env(cx, select, params, env)?;
            Ok(SourceRows {
                columns: inner.columns,
                rows: inner.rows,
                filter_applied: false,
            })
        }
        Some(FromSource::Table { name, .. }) => {
            if let Some(cte) = env.get(&name.to_lowercase()) {
                return Ok(SourceRows {
                    columns: cte.columns.clone(),
                    rows: cte.rows.clone(),
                    filter_applied: false,
                });
            }
            let table = if name.eq_ignore_ascii_case(crate::schema::SCHEMA_TABLE_NAME) {
                crate::schema::builtin_schema_table()?
            } else {
                cx.schema.table(name)?.clone()
            };
            // Filter shapes the closure compiler cannot express (column
            // arithmetic, CASE) fall back to per-row evaluation.
            let (compiled, filter_applied) = match &core.filter {
                None => (None, true),
                Some(f) => match filter::compile_filter(f, &table, params) {
                    Ok(c) => (Some(c), true),
                    Err(Error::UnsupportedFeature(_)) => (None, false),
                    Err(e) => return Err(e),
                },
            };
            let columns: Vec<String> = table.columns.iter().map(|c| c.name.clone()).collect();
            let mut reader = Reader::new(cx.source.clone(), cx.usable, table, compiled);
            let mut rows = vec![];
            while reader.read()? {
                rows.push(reader.logical_row()?);
            }
            Ok(SourceRows {
                columns,
                rows,
                filter_applied,
            })
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn run_core(
    cx: &ExecContext,
    core: &SelectCore,
    params: &[(String, SqlValue)],
    env: &HashMap<String, QueryOutput>,
    order_by: &[OrderKey],
    limit: Option<usize>,
    offset: usize,
) -> Result<QueryOutput> {
    let source = materialize_source(cx, core, params, env)?;
    let pushed_down = source.filter_applied;

    let has_aggregates = !core.group_by.is_empty()
        || core.items.iter().any(|i| match i {
            SelItem::Expr { expr, .. } => expr_has_aggregate(expr),
            SelItem::Star => false,
        });
    if has_aggregates {
        let mut out = run_aggregation(core, &source, params, pushed_down)?;
        sort_and_window(&mut out, order_by, limit, offset)?;
        return Ok(out);
    }

    // Projection column names.
    let mut columns = vec![];
    for (i, item) in core.items.iter().enumerate() {
        match item {
            SelItem::Star => columns.extend(source.columns.iter().cloned()),
            item => columns.push(display_name(item, i)),
        }
    }

    let mut distinct_seen: HashSet<u64> = HashSet::new();
    // A LIMIT with ORDER BY streams through a bounded heap; everything
    // else materializes and sorts after the scan.
    let mut top_k = match limit {
        Some(l) if !order_by.is_empty() => {
            Some(TopK::new(SortSpec::from_order(order_by), l + offset))
        }
        _ => None,
    };
    let mut rows = vec![];

    for source_row in &source.rows {
        let row_env = RowEnv {
            columns: &source.columns,
            values: source_row,
            params,
        };
        if !pushed_down {
            if let Some(f) = &core.filter {
                if !truthy(&eval_expr(f, &row_env)?) {
                    continue;
                }
            }
        }
        let mut out_row = vec![];
        for item in &core.items {
            match item {
                SelItem::Star => out_row.extend(source_row.iter().cloned()),
                SelItem::Expr { expr, .. } => out_row.push(eval_expr(expr, &row_env)?),
            }
        }
        if core.distinct && !distinct_seen.insert(row_fingerprint(&out_row)) {
            continue;
        }
        match &mut top_k {
            Some(heap) => {
                let keys = order_keys(order_by, &columns, &out_row, &row_env)?;
                heap.push(keys, out_row);
            }
            None => rows.push(out_row),
        }
    }

    let mut out = match top_k {
        Some(heap) => QueryOutput {
            columns,
            rows: heap.into_sorted_rows(),
        },
        None => {
            let mut out = QueryOutput { columns, rows };
            if !order_by.is_empty() {
                sort_full(&mut out, order_by, params)?;
            }
            out
        }
    };
    apply_window(&mut out, limit, offset);
    Ok(out)
}

fn order_keys(
    order_by: &[OrderKey],
    out_columns: &[String],
    out_row: &[SqlValue],
    row_env: &RowEnv,
) -> Result<Vec<SqlValue>> {
    order_by
        .iter()
        .map(|k| match &k.expr {
            // ORDER BY n addresses the n-th output column.
            Expr::Constant(Constant::Int(n)) if *n >= 1 && (*n as usize) <= out_row.len() => {
                Ok(out_row[*n as usize - 1].clone())
            }
            Expr::Column(c) => {
                if let Some(i) = out_columns.iter().position(|x| x.eq_ignore_ascii_case(&c.name)) {
                    Ok(out_row[i].clone())
                } else {
                    eval_expr(&k.expr, row_env)
                }
            }
            _ => eval_expr(&k.expr, row_env),
        })
        .collect()
}

fn sort_full(out: &mut QueryOutput, order_by: &[OrderKey], params: &[(String, SqlValue)]) -> Result<()> {
    let spec = SortSpec::from_order(order_by);
    let mut keyed: Vec<(Vec<SqlValue>, Vec<SqlValue>)> = vec![];
    for row in out.rows.drain(..) {
        let env = RowEnv {
            columns: &out.columns,
            values: &row,
            params,
        };
        let keys = order_keys(order_by, &out.columns, &row, &env)?;
        keyed.push((keys, row));
    }
    keyed.sort_by(|a, b| spec.compare(&a.0, &b.0));
    out.rows = keyed.into_iter().map(|(_, r)| r).collect();
    Ok(())
}

fn apply_window(out: &mut QueryOutput, limit: Option<usize>, offset: usize) {
    if offset > 0 {
        out.rows.drain(..offset.min(out.rows.len()));
    }
    if let Some(l) = limit {
        out.rows.truncate(l);
    }
}

fn sort_and_window(out: &mut QueryOutput, order_by: &[OrderKey], limit: Option<usize>, offset: usize) -> Result<()> {
    if !order_by.is_empty() {
        sort_full(out, order_by, &[])?;
    }
    apply_window(out, limit, offset);
    Ok(())
}

// ---- aggregation ---------------------------------------------------------

#[derive(Clone)]
enum Accumulator {
    CountStar(i64),
    Count(i64),
    Sum { total: f64, all_int: bool, seen: bool },
    Avg { total: f64, n: i64 },
    Min(Option<SqlValue>),
    Max(Option<SqlValue>),
    /// A bare group-key column: first value wins.
    First(Option<SqlValue>),
}

impl Accumulator {
    fn update(&mut self, v: Option<SqlValue>) {
        match self {
            Accumulator::CountStar(n) => *n += 1,
            Accumulator::Count(n) => {
                if matches!(v, Some(ref x) if !matches!(x, SqlValue::Null())) {
                    *n += 1;
                }
            }
            Accumulator::Sum { total, all_int, seen } => match v {
                Some(SqlValue::Int(i)) => {
                    *total += i as f64;
                    *seen = true;
                }
                Some(SqlValue::Real(r)) => {
                    *total += r;
                    *all_int = false;
                    *seen = true;
                }
                _ => {}
            },
            Accumulator::Avg { total, n } => match v {
                Some(SqlValue::Int(i)) => {
                    *total += i as f64;
                    *n += 1;
                }
                Some(SqlValue::Real(r)) => {
                    *total += r;
                    *n += 1;
                }
                _ => {}
            },
            Accumulator::Min(best) => {
                if let Some(x) = v {
                    if !matches!(x, SqlValue::Null()) {
                        let replace = match best {
                            None => true,
                            Some(b) => x.record_cmp(b) == Ordering::Less,
                        };
                        if replace {
                            *best = Some(x);
                        }
                    }
                }
            }
            Accumulator::Max(best) => {
                if let Some(x) = v {
                    if !matches!(x, SqlValue::Null()) {
                        let replace = match best {
                            None => true,
                            Some(b) => x.record_cmp(b) == Ordering::Greater,
                        };
                        if replace {
                            *best = Some(x);
                        }
                    }
                }
            }
            Accumulator::First(slot) => {
                if slot.is_none() {
                    *slot = v;
                }
            }
        }
    }

    fn finish(self) -> SqlValue {
        match self {
            Accumulator::CountStar(n) | Accumulator::Count(n) => SqlValue::Int(n),
            Accumulator::Sum { total, all_int, seen } => {
                if !seen {
                    SqlValue::Null()
                } else if all_int {
                    SqlValue::Int(total as i64)
                } else {
                    SqlValue::Real(total)
                }
            }
            Accumulator::Avg { total, n } => {
                if n == 0 {
                    SqlValue::Null()
                } else {
                    SqlValue::Real(total / n as f64)
                }
            }
            Accumulator::Min(v) | Accumulator::Max(v) | Accumulator::First(v) => {
                v.unwrap_or(SqlValue::Null())
            }
        }
    }
}

fn make_accumulator(expr: &Expr) -> Result<(Accumulator, Option<Expr>)> {
    match expr {
        Expr::Call { name, args, star, .. } => {
            let upper = name.to_uppercase();
            match (upper.as_str(), star, args.len()) {
                ("COUNT", true, _) => Ok((Accumulator::CountStar(0), None)),
                ("COUNT", false, 1) => Ok((Accumulator::Count(0), Some(args[0].clone()))),
                ("SUM", false, 1) => Ok((
                    Accumulator::Sum { total: 0.0, all_int: true, seen: false },
                    Some(args[0].clone()),
                )),
                ("AVG", false, 1) => {
                    Ok((Accumulator::Avg { total: 0.0, n: 0 }, Some(args[0].clone())))
                }
                ("MIN", false, 1) => Ok((Accumulator::Min(None), Some(args[0].clone()))),
                ("MAX", false, 1) => Ok((Accumulator::Max(None), Some(args[0].clone()))),
                _ => Err(Error::UnsupportedFeature("unknown aggregate function")),
            }
        }
        other => Ok((Accumulator::First(None), Some(other.clone()))),
    }
}

fn run_aggregation(
    core: &SelectCore,
    source: &SourceRows,
    params: &[(String, SqlValue)],
    pushed_down: bool,
) -> Result<QueryOutput> {
    let mut columns = vec![];
    let mut templates = vec![];
    for (i, item) in core.items.iter().enumerate() {
        let expr = match item {
            SelItem::Star => return Err(Error::UnsupportedFeature("* in an aggregate projection")),
            SelItem::Expr { expr, .. } => expr,
        };
        columns.push(display_name(item, i));
        templates.push(make_accumulator(expr)?);
    }

    // One running entry per group key, streamed in one pass.
    let mut groups: HashMap<u64, (Vec<SqlValue>, Vec<Accumulator>)> = HashMap::new();
    let mut group_order: Vec<u64> = vec![];
    for source_row in &source.rows {
        let env = RowEnv {
            columns: &source.columns,
            values: source_row,
            params,
        };
        if !pushed_down {
            if let Some(f) = &core.filter {
                if !truthy(&eval_expr(f, &env)?) {
                    continue;
                }
            }
        }
        let key: Vec<SqlValue> = core
            .group_by
            .iter()
            .map(|e| eval_expr(e, &env))
            .collect::<Result<Vec<_>>>()?;
        let fp = row_fingerprint(&key);
        let entry = match groups.entry(fp) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(e) => {
                group_order.push(fp);
                e.insert((key, templates.iter().map(|(a, _)| a.clone()).collect()))
            }
        };
        for (slot, (_, arg)) in entry.1.iter_mut().zip(templates.iter()) {
            let v = match arg {
                None => None,
                Some(expr) => Some(eval_expr(expr, &env)?),
            };
            slot.update(v);
        }
    }
    // A scalar aggregate over zero rows still yields one output row.
    if groups.is_empty() && core.group_by.is_empty() {
        let fp = 0;
        group_order.push(fp);
        groups.insert(fp, (vec![], templates.iter().map(|(a, _)| a.clone()).collect()));
    }

    let mut rows = vec![];
    for fp in group_order {
        let (key, accs) = match groups.remove(&fp) {
            Some(g) => g,
            None => continue,
        };
        let row: Vec<SqlValue> = accs.into_iter().map(|a| a.finish()).collect();
        if let Some(having) = &core.having {
            let env = RowEnv {
                columns: &columns,
                values: &row,
                params,
            };
            let keep = match eval_expr(having, &env) {
                Ok(v) => truthy(&v),
                // HAVING may reference bare group columns that are not
                // projected; fall back to the group key env.
                Err(_) => {
                    let key_env = RowEnv {
                        columns: &source.columns,
                        values: &key,
                        params,
                    };
                    truthy(&eval_expr(having, &key_env)?)
                }
            };
            if !keep {
                continue;
            }
        }
        rows.push(row);
    }
    Ok(QueryOutput { columns, rows })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_uuid_and_decimal() {
        assert_eq!(
            format_uuid(0x00112233_4455_6677_8899_aabbccddeeffu128),
            "00112233-4455-6677-8899-aabbccddeeff"
        );
        assert_eq!(format_decimal(12_500_000, 6), "12.500000");
        assert_eq!(format_decimal(-1050, 2), "-10.50");
        assert_eq!(format_decimal(7, 0), "7");
        assert_eq!(format_decimal(5, 3), "0.005");
    }

    #[test]
    fn test_row_fingerprint_distinguishes_classes() {
        // The tag byte keeps 1 (integer) apart from "1" (text) and from
        // a one-byte blob.
        let a = row_fingerprint(&[SqlValue::Int(1)]);
        let b = row_fingerprint(&[SqlValue::Text("1".into())]);
        let c = row_fingerprint(&[SqlValue::Blob(vec![1])]);
        let d = row_fingerprint(&[SqlValue::Null()]);
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_ne!(b, c);
        assert_ne!(a, d);
        assert_eq!(a, row_fingerprint(&[SqlValue::Int(1)]));
    }

    #[test]
    fn test_top_k_keeps_best_rows_bounded() {
        let spec = SortSpec::from_order(&[OrderKey {
            expr: Expr::Constant(Constant::Int(1)),
            descending: false,
            nulls_first: None,
        }]);
        let mut heap = TopK::new(spec, 3);
        for v in [9i64, 1, 7, 3, 8, 2, 6] {
            heap.push(vec![SqlValue::Int(v)], vec![SqlValue::Int(v)]);
            assert!(heap.heap.len() <= 3, "heap exceeded its bound");
        }
        let rows = heap.into_sorted_rows();
        assert_eq!(
            rows,
            vec![
                vec![SqlValue::Int(1)],
                vec![SqlValue::Int(2)],
                vec![SqlValue::Int(3)]
            ]
        );
    }

    #[test]
    fn test_sort_spec_null_placement() {
        let asc = SortSpec { keys: vec![(false, true)] };
        assert_eq!(
            asc.compare(&[SqlValue::Null()], &[SqlValue::Int(0)]),
            Ordering::Less
        );
        let desc_nulls_last = SortSpec { keys: vec![(true, false)] };
        assert_eq!(
            desc_nulls_last.compare(&[SqlValue::Null()], &[SqlValue::Int(0)]),
            Ordering::Greater
        );
        assert_eq!(
            desc_nulls_last.compare(&[SqlValue::Int(5)], &[SqlValue::Int(2)]),
            Ordering::Less
        );
    }

    #[test]
    fn test_eval_binop_null_propagation() {
        use SqlValue::*;
        assert_eq!(eval_binop(&Null(), Op::Eq, &Int(1)).unwrap(), Null());
        assert_eq!(eval_binop(&Int(2), Op::Add, &Int(3)).unwrap(), Int(5));
        assert_eq!(eval_binop(&Int(7), Op::Divide, &Int(2)).unwrap(), Real(3.5));
        assert_eq!(eval_binop(&Int(1), Op::Divide, &Int(0)).unwrap(), Null());
        assert_eq!(eval_binop(&Int(3), Op::Lt, &Real(3.5)).unwrap(), Int(1));
    }
}
