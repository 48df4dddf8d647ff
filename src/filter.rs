//! Compiles a WHERE tree into one specialized per-row predicate closure.
//!
//! The contract: `fn(payload, serial_types, offsets, row_id) -> bool`,
//! where `serial_types` and `offsets` come from a single header scan the
//! executor performs before invoking the closure. No predicate re-parses
//! the record header, nested boolean trees flatten into closure
//! composition (no per-predicate dispatch through an AST at row time), and
//! comparisons are NULL-safe: a NULL operand makes the comparison false.

use std::cmp::Ordering;

use crate::ast::{ColumnRef, Constant, Expr, Op, UnOp};
use crate::error::{Error, Result};
use crate::schema::{self, ColumnKind, TableInfo};
use crate::serial_type;
use crate::sql_value::{join_i128, join_u128, SqlValue};

pub type RowPredicate = Box<dyn Fn(&[u8], &[i64], &[i32], i64) -> bool>;

/// A compiled filter plus the physical columns it references (already
/// hoisted, so the executor knows how much of the header matters).
pub struct CompiledFilter {
    pub predicate: RowPredicate,
    pub referenced: Vec<usize>,
}

/// One side of a comparison, bound to physical storage at compile time.
#[derive(Clone)]
enum Operand {
    /// Physical record ordinal.
    Col(usize),
    /// The rowid stands in for an INTEGER PRIMARY KEY column.
    RowId,
    /// A 128-bit logical column split over two physical ordinals.
    Merged { hi: usize, lo: usize, kind: ColumnKind },
    /// Literal or pre-bound parameter.
    Const(SqlValue),
}

pub struct FilterCompiler<'a> {
    table: &'a TableInfo,
    params: &'a [(String, SqlValue)],
    referenced: Vec<usize>,
}

/// Binds `expr` against `table` and produces the row predicate.
/// Parameters are substituted as constants at compile time.
pub fn compile_filter(
    expr: &Expr,
    table: &TableInfo,
    params: &[(String, SqlValue)],
) -> Result<CompiledFilter> {
    let mut compiler = FilterCompiler {
        table,
        params,
        referenced: vec![],
    };
    let predicate = compiler.compile(expr)?;
    let mut referenced = compiler.referenced;
    referenced.sort_unstable();
    referenced.dedup();
    Ok(CompiledFilter {
        predicate,
        referenced,
    })
}

impl<'a> FilterCompiler<'a> {
    fn compile(&mut self, expr: &Expr) -> Result<RowPredicate> {
        match expr {
            Expr::BinOp { lhs, op: Op::And, rhs } => {
                let l = self.compile(lhs)?;
                let r = self.compile(rhs)?;
                Ok(Box::new(move |p, s, o, rid| l(p, s, o, rid) && r(p, s, o, rid)))
            }
            Expr::BinOp { lhs, op: Op::Or, rhs } => {
                let l = self.compile(lhs)?;
                let r = self.compile(rhs)?;
                Ok(Box::new(move |p, s, o, rid| l(p, s, o, rid) || r(p, s, o, rid)))
            }
            Expr::Unary { op: UnOp::Not, expr } => {
                let inner = self.compile(expr)?;
                Ok(Box::new(move |p, s, o, rid| !inner(p, s, o, rid)))
            }
            Expr::BinOp { lhs, op, rhs }
                if matches!(op, Op::Eq | Op::Ne | Op::Lt | Op::Le | Op::Gt | Op::Ge) =>
            {
                let l = self.operand(lhs)?;
                let r = self.operand(rhs)?;
                let op = *op;
                Ok(Box::new(move |p, s, o, rid| {
                    match compare_operands(&l, &r, p, s, o, rid) {
                        None => false,
                        Some(ord) => match op {
                            Op::Eq => ord == Ordering::Equal,
                            Op::Ne => ord != Ordering::Equal,
                            Op::Lt => ord == Ordering::Less,
                            Op::Le => ord != Ordering::Greater,
                            Op::Gt => ord == Ordering::Greater,
                            Op::Ge => ord != Ordering::Less,
                            _ => false,
                        },
                    }
                }))
            }
            Expr::IsNull { expr, negated } => {
                let operand = self.operand(expr)?;
                let negated = *negated;
                Ok(Box::new(move |p, s, o, rid| {
                    let is_null = operand_is_null(&operand, p, s, o, rid);
                    is_null != negated
                }))
            }
            Expr::InList { expr, list, negated } => {
                let operand = self.operand(expr)?;
                let mut consts = Vec::with_capacity(list.len());
                for item in list {
                    consts.push(Operand::Const(self.constant(item)?));
                }
                let negated = *negated;
                Ok(Box::new(move |p, s, o, rid| {
                    if operand_is_null(&operand, p, s, o, rid) {
                        return false;
                    }
                    let hit = consts.iter().any(|k| {
                        compare_operands(&operand, k, p, s, o, rid) == Some(Ordering::Equal)
                    });
                    hit != negated
                }))
            }
            Expr::Between { expr, low, high, negated } => {
                let operand = self.operand(expr)?;
                let low = self.operand(low)?;
                let high = self.operand(high)?;
                let negated = *negated;
                Ok(Box::new(move |p, s, o, rid| {
                    let above = compare_operands(&operand, &low, p, s, o, rid);
                    let below = compare_operands(&operand, &high, p, s, o, rid);
                    let hit = match (above, below) {
                        (Some(a), Some(b)) => a != Ordering::Less && b != Ordering::Greater,
                        _ => return false,
                    };
                    hit != negated
                }))
            }
            Expr::Like { expr, pattern, negated } => {
                let operand = self.operand(expr)?;
                let pattern = match self.constant(pattern)? {
                    SqlValue::Text(t) => t.into_bytes(),
                    _ => return Err(Error::UnsupportedFeature("LIKE needs a text pattern")),
                };
                let negated = *negated;
                Ok(Box::new(move |p, s, o, rid| {
                    let hit = match text_of(&operand, p, s, o, rid) {
                        Some(text) => like_match(&pattern, text),
                        None => return false,
                    };
                    hit != negated
                }))
            }
            Expr::Constant(_) | Expr::Param(_) => {
                let truth = match self.constant(expr)? {
                    SqlValue::Int(i) => i != 0,
                    SqlValue::Real(r) => r != 0.0,
                    _ => false,
                };
                Ok(Box::new(move |_, _, _, _| truth))
            }
            Expr::Case { .. } => Err(Error::UnsupportedFeature("CASE is parsed but not executed")),
            Expr::Cast { .. } => Err(Error::UnsupportedFeature("CAST in filters")),
            Expr::Call { .. } => Err(Error::UnsupportedFeature("function calls in filters")),
            _ => Err(Error::UnsupportedFeature("unsupported filter expression")),
        }
    }

    /// Folds an expression that must be constant at compile time.
    fn constant(&self, expr: &Expr) -> Result<SqlValue> {
        match expr {
            Expr::Constant(c) => Ok(match c {
                Constant::Int(i) => SqlValue::Int(*i),
                Constant::Real(r) => SqlValue::Real(*r),
                Constant::String(s) => SqlValue::Text(s.clone()),
                Constant::Blob(b) => SqlValue::Blob(b.clone()),
                Constant::Bool(b) => SqlValue::Int(*b as i64),
                Constant::Null() => SqlValue::Null(),
            }),
            Expr::Param(name) => self
                .params
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, v)| v.clone())
                .ok_or_else(|| Error::SchemaNotFound(format!("unbound parameter ${}", name))),
            Expr::Unary { op: UnOp::Neg, expr } => match self.constant(expr)? {
                SqlValue::Int(i) => Ok(SqlValue::Int(-i)),
                SqlValue::Real(r) => Ok(SqlValue::Real(-r)),
                _ => Err(Error::UnsupportedFeature("negation of a non-numeric constant")),
            },
            _ => Err(Error::UnsupportedFeature("expression is not constant")),
        }
    }

    fn operand(&mut self, expr: &Expr) -> Result<Operand> {
        match expr {
            Expr::Column(col) => self.column_operand(col),
            _ => Ok(Operand::Const(self.constant(expr)?)),
        }
    }

    fn column_operand(&mut self, col: &ColumnRef) -> Result<Operand> {
        if col.name.eq_ignore_ascii_case("rowid") {
            return Ok(Operand::RowId);
        }
        let info = self.table.column(&col.name)?;
        if Some(info.ordinal) == self.table.rowid_alias {
            return Ok(Operand::RowId);
        }
        match info.kind {
            ColumnKind::Scalar => {
                let ord = info.merged_physical_ordinals[0];
                self.referenced.push(ord);
                Ok(Operand::Col(ord))
            }
            kind => {
                let hi = info.merged_physical_ordinals[0];
                let lo = info.merged_physical_ordinals[1];
                self.referenced.push(hi);
                self.referenced.push(lo);
                Ok(Operand::Merged { hi, lo, kind })
            }
        }
    }
}

fn col_slice<'p>(ord: usize, payload: &'p [u8], serials: &[i64], offsets: &[i32]) -> Option<(i64, &'p [u8])> {
    if ord >= serials.len() {
        return None;
    }
    let serial = serials[ord];
    let start = offsets[ord] as usize;
    let len = serial_type::serial_type_len(serial).ok()?;
    if start + len > payload.len() {
        return None;
    }
    Some((serial, &payload[start..start + len]))
}

fn operand_is_null(operand: &Operand, payload: &[u8], serials: &[i64], offsets: &[i32], _row_id: i64) -> bool {
    match operand {
        Operand::RowId => false,
        Operand::Const(v) => matches!(v, SqlValue::Null()),
        Operand::Col(ord) => matches!(col_slice(*ord, payload, serials, offsets), Some((0, _)) | None),
        Operand::Merged { hi, .. } => {
            matches!(col_slice(*hi, payload, serials, offsets), Some((0, _)) | None)
        }
    }
}

fn text_of<'p>(
    operand: &'p Operand,
    payload: &'p [u8],
    serials: &[i64],
    offsets: &[i32],
    _row_id: i64,
) -> Option<&'p [u8]> {
    match operand {
        Operand::Const(SqlValue::Text(t)) => Some(t.as_bytes()),
        Operand::Col(ord) => {
            let (serial, bytes) = col_slice(*ord, payload, serials, offsets)?;
            if serial >= 13 && serial % 2 == 1 {
                Some(bytes)
            } else {
                None
            }
        }
        _ => None,
    }
}

/// 128-bit value of a merged pair, when both halves are integers.
fn merged_value(
    hi: usize,
    lo: usize,
    payload: &[u8],
    serials: &[i64],
    offsets: &[i32],
) -> Option<(i64, i64)> {
    let (hs, hb) = col_slice(hi, payload, serials, offsets)?;
    let (ls, lb) = col_slice(lo, payload, serials, offsets)?;
    Some((serial_type::read_int(hs, hb)?, serial_type::read_int(ls, lb)?))
}

/// Storage-class ranking used for cross-class comparisons.
fn class_of_serial(serial: i64) -> u8 {
    match serial {
        0 => 0,
        1..=9 => 1,
        x if x >= 13 && x % 2 == 1 => 2,
        _ => 3,
    }
}

fn compare_operands(
    lhs: &Operand,
    rhs: &Operand,
    payload: &[u8],
    serials: &[i64],
    offsets: &[i32],
    row_id: i64,
) -> Option<Ordering> {
    // Merged 128-bit columns compare against UUID/decimal constants (and
    // each other) through the joined value.
    if let Operand::Merged { hi, lo, kind } = lhs {
        let (h, l) = merged_value(*hi, *lo, payload, serials, offsets)?;
        return compare_merged(*kind, h, l, rhs, payload, serials, offsets);
    }
    if let Operand::Merged { .. } = rhs {
        return compare_operands(rhs, lhs, payload, serials, offsets, row_id).map(Ordering::reverse);
    }

    let lv = scalar_value(lhs, payload, serials, offsets, row_id)?;
    let rv = scalar_value(rhs, payload, serials, offsets, row_id)?;
    match (lv, rv) {
        (Scalar::Int(a), Scalar::Int(b)) => Some(a.cmp(&b)),
        (Scalar::Int(a), Scalar::Real(b)) => (a as f64).partial_cmp(&b),
        (Scalar::Real(a), Scalar::Int(b)) => a.partial_cmp(&(b as f64)),
        (Scalar::Real(a), Scalar::Real(b)) => a.partial_cmp(&b),
        (Scalar::Bytes(class_a, a), Scalar::Bytes(class_b, b)) => {
            if class_a != class_b {
                Some(class_a.cmp(&class_b))
            } else {
                Some(a.cmp(b))
            }
        }
        (Scalar::Int(_) | Scalar::Real(_), Scalar::Bytes(..)) => Some(Ordering::Less),
        (Scalar::Bytes(..), Scalar::Int(_) | Scalar::Real(_)) => Some(Ordering::Greater),
    }
}

fn compare_merged(
    kind: ColumnKind,
    hi: i64,
    lo: i64,
    rhs: &Operand,
    payload: &[u8],
    serials: &[i64],
    offsets: &[i32],
) -> Option<Ordering> {
    match rhs {
        Operand::Merged { hi: rh, lo: rl, kind: _ } => {
            let (h2, l2) = merged_value(*rh, *rl, payload, serials, offsets)?;
            match kind {
                ColumnKind::Uuid => Some(join_u128(hi, lo).cmp(&join_u128(h2, l2))),
                _ => Some(join_i128(hi, lo).cmp(&join_i128(h2, l2))),
            }
        }
        Operand::Const(SqlValue::Null()) => None,
        Operand::Const(v) => match kind {
            ColumnKind::Uuid => {
                let want = match v {
                    SqlValue::Text(t) => schema::parse_uuid(t)?,
                    SqlValue::Blob(b) if b.len() == 16 => {
                        let mut raw = [0u8; 16];
                        raw.copy_from_slice(b);
                        u128::from_be_bytes(raw)
                    }
                    _ => return None,
                };
                Some(join_u128(hi, lo).cmp(&want))
            }
            ColumnKind::Decimal { scale } => {
                let want = match v {
                    SqlValue::Int(i) => (*i as i128).checked_mul(10i128.pow(scale))?,
                    SqlValue::Text(t) => schema::parse_decimal(t, scale)?,
                    _ => return None,
                };
                Some(join_i128(hi, lo).cmp(&want))
            }
            ColumnKind::Scalar => None,
        },
        _ => None,
    }
}

/// A scalar operand value loaded for one row; byte forms keep their
/// storage class so text and blob order correctly.
enum Scalar<'p> {
    Int(i64),
    Real(f64),
    Bytes(u8, &'p [u8]),
}

fn scalar_value<'p>(
    operand: &'p Operand,
    payload: &'p [u8],
    serials: &[i64],
    offsets: &[i32],
    row_id: i64,
) -> Option<Scalar<'p>> {
    match operand {
        Operand::RowId => Some(Scalar::Int(row_id)),
        Operand::Const(v) => match v {
            SqlValue::Null() => None,
            SqlValue::Int(i) => Some(Scalar::Int(*i)),
            SqlValue::Real(r) => Some(Scalar::Real(*r)),
            SqlValue::Text(t) => Some(Scalar::Bytes(2, t.as_bytes())),
            SqlValue::Blob(b) => Some(Scalar::Bytes(3, b)),
        },
        Operand::Col(ord) => {
            let (serial, bytes) = col_slice(*ord, payload, serials, offsets)?;
            match class_of_serial(serial) {
                0 => None,
                1 => {
                    if serial == 7 {
                        Some(Scalar::Real(serial_type::read_real(serial, bytes)?))
                    } else {
                        Some(Scalar::Int(serial_type::read_int(serial, bytes)?))
                    }
                }
                class => Some(Scalar::Bytes(class, bytes)),
            }
        }
        Operand::Merged { .. } => None,
    }
}

/// ASCII case-insensitive LIKE with `%` and `_` wildcards.
pub(crate) fn like_match(pattern: &[u8], text: &[u8]) -> bool {
    fn eq(a: u8, b: u8) -> bool {
        a.eq_ignore_ascii_case(&b)
    }
    fn inner(p: &[u8], t: &[u8]) -> bool {
        match p.first() {
            None => t.is_empty(),
            Some(b'%') => {
                for skip in 0..=t.len() {
                    if inner(&p[1..], &t[skip..]) {
                        return true;
                    }
                }
                false
            }
            Some(b'_') => !t.is_empty() && inner(&p[1..], &t[1..]),
            Some(&c) => !t.is_empty() && eq(c, t[0]) && inner(&p[1..], &t[1..]),
        }
    }
    inner(pattern, text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Statement;
    use crate::parser;
    use crate::record::{encode_record, scan_header};
    use crate::schema::table_from_create;

    fn table() -> TableInfo {
        let stmt = parser::parse_statement(
            "CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT, score REAL, tag UUID)",
        )
        .unwrap();
        match stmt {
            Statement::CreateTable(ct) => table_from_create(&ct, 2, "sql".into()),
            _ => unreachable!(),
        }
    }

    fn where_clause(src: &str) -> Expr {
        let stmt = parser::parse_statement(&format!("SELECT * FROM t WHERE {}", src)).unwrap();
        match stmt {
            Statement::Select(s) => s.body.as_simple().unwrap().filter.clone().unwrap(),
            _ => unreachable!(),
        }
    }

    /// Runs a filter against one physical row.
    fn eval(filter: &CompiledFilter, row: &[SqlValue], row_id: i64) -> bool {
        let payload = encode_record(row);
        let mut serials = vec![];
        let mut offsets = vec![];
        scan_header(&payload, &mut serials, &mut offsets).unwrap();
        (filter.predicate)(&payload, &serials, &offsets, row_id)
    }

    fn physical_row(name: &str, score: f64, tag_hi: i64, tag_lo: i64) -> Vec<SqlValue> {
        vec![
            SqlValue::Null(), // rowid alias column
            SqlValue::Text(name.into()),
            SqlValue::Real(score),
            SqlValue::Int(tag_hi),
            SqlValue::Int(tag_lo),
        ]
    }

    #[test]
    fn test_rowid_alias_and_flattened_booleans() {
        let t = table();
        let f = compile_filter(&where_clause("id = 2 OR (name = 'Bob' AND score > 1)"), &t, &[]).unwrap();
        assert!(eval(&f, &physical_row("Alice", 0.0, 0, 0), 2));
        assert!(eval(&f, &physical_row("Bob", 1.5, 0, 0), 7));
        assert!(!eval(&f, &physical_row("Bob", 0.5, 0, 0), 7));
        assert!(!eval(&f, &physical_row("Alice", 9.0, 0, 0), 1));
    }

    #[test]
    fn test_referenced_columns_are_hoisted() {
        let t = table();
        let f = compile_filter(&where_clause("name = 'x' AND score < 2"), &t, &[]).unwrap();
        assert_eq!(f.referenced, vec![1, 2]);
        // The rowid alias reads from the rowid argument, not the record.
        let f = compile_filter(&where_clause("id = 1"), &t, &[]).unwrap();
        assert!(f.referenced.is_empty());
    }

    #[test]
    fn test_null_comparisons_are_false() {
        let t = table();
        let f = compile_filter(&where_clause("name = 'Alice'"), &t, &[]).unwrap();
        let row = vec![
            SqlValue::Null(),
            SqlValue::Null(),
            SqlValue::Real(1.0),
            SqlValue::Int(0),
            SqlValue::Int(0),
        ];
        assert!(!eval(&f, &row, 1));
        let f = compile_filter(&where_clause("name <> 'Alice'"), &t, &[]).unwrap();
        assert!(!eval(&f, &row, 1), "NULL <> x must be false, not true");
        let f = compile_filter(&where_clause("name IS NULL"), &t, &[]).unwrap();
        assert!(eval(&f, &row, 1));
        let f = compile_filter(&where_clause("name IS NOT NULL"), &t, &[]).unwrap();
        assert!(!eval(&f, &row, 1));
    }

    #[test]
    fn test_in_between_like() {
        let t = table();
        let f = compile_filter(&where_clause("name IN ('Alice', 'Bob')"), &t, &[]).unwrap();
        assert!(eval(&f, &physical_row("Bob", 0.0, 0, 0), 1));
        assert!(!eval(&f, &physical_row("Carol", 0.0, 0, 0), 1));

        let f = compile_filter(&where_clause("score BETWEEN 1 AND 2"), &t, &[]).unwrap();
        assert!(eval(&f, &physical_row("x", 1.0, 0, 0), 1));
        assert!(eval(&f, &physical_row("x", 2.0, 0, 0), 1));
        assert!(!eval(&f, &physical_row("x", 2.5, 0, 0), 1));

        let f = compile_filter(&where_clause("name LIKE 'al%e'"), &t, &[]).unwrap();
        assert!(eval(&f, &physical_row("Alice", 0.0, 0, 0), 1));
        assert!(!eval(&f, &physical_row("Bob", 0.0, 0, 0), 1));

        let f = compile_filter(&where_clause("name LIKE '_ob'"), &t, &[]).unwrap();
        assert!(eval(&f, &physical_row("Bob", 0.0, 0, 0), 1));
    }

    #[test]
    fn test_parameters_compile_to_constants() {
        let t = table();
        let params = vec![("who".to_string(), SqlValue::Text("Bob".into()))];
        let f = compile_filter(&where_clause("name = $who"), &t, &params).unwrap();
        assert!(eval(&f, &physical_row("Bob", 0.0, 0, 0), 1));
        assert!(!eval(&f, &physical_row("Alice", 0.0, 0, 0), 1));
        // Unbound parameters fail at compile time, not per row.
        assert!(compile_filter(&where_clause("name = $nope"), &t, &[]).is_err());
    }

    #[test]
    fn test_merged_uuid_comparison() {
        let t = table();
        let f = compile_filter(
            &where_clause("tag = '00000000-0000-0000-0000-0000000000ff'"),
            &t,
            &[],
        )
        .unwrap();
        assert_eq!(f.referenced, vec![3, 4]);
        assert!(eval(&f, &physical_row("x", 0.0, 0, 0xff), 1));
        assert!(!eval(&f, &physical_row("x", 0.0, 0, 0xfe), 1));
        assert!(!eval(&f, &physical_row("x", 0.0, 1, 0xff), 1));
    }

    #[test]
    fn test_case_rejected_at_compile_time() {
        let t = table();
        let err = compile_filter(
            &where_clause("CASE WHEN score > 1 THEN 1 ELSE 0 END = 1"),
            &t,
            &[],
        );
        assert!(matches!(err, Err(Error::UnsupportedFeature(_))));
    }
}
