//! Btree cells hold records, which contain SQL rows.
//!
//! A record is a header and a body. The header begins with a varint giving
//! the total header length (its own bytes included), followed by one serial
//! type varint per column; the body is the concatenated value bytes.
//! Each field's serial type is not the column's SQL type but varies with
//! the stored value.

use crate::error::{Error, Result};
use crate::serial_type;
use crate::sql_value::SqlValue;
use crate::varint;

/// Iterator over the serial type codes in a record's header.
pub struct HeaderIterator<'a> {
    data: &'a [u8],
    offset: usize,
    hdr_len: usize,
}

impl<'a> HeaderIterator<'a> {
    /// Creates an iterator over a slice of bytes in record format.
    ///
    /// # Arguments
    ///
    /// * `s` - A byte slice, borrowed for the lifetime of the iterator.
    ///         Begins with the record header length varint and ends with
    ///         the last byte of the record body.
    pub fn new(s: &'a [u8]) -> HeaderIterator<'a> {
        let (hdr_len, hdr_len_len) = varint::read_varint(s);
        HeaderIterator {
            data: s,
            offset: hdr_len_len,
            hdr_len: hdr_len as usize,
        }
    }
}

impl<'a> Iterator for HeaderIterator<'a> {
    type Item = i64;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.hdr_len.min(self.data.len()) {
            return None;
        }
        let (serial_type, bytes_read) = varint::read_varint(&self.data[self.offset..]);
        self.offset += bytes_read;
        Some(serial_type)
    }
}

/// Iterator over `(serial_type, value_bytes)` pairs of a record.
pub struct ValueIterator<'a> {
    data: &'a [u8],
    hdr_offset: usize,
    hdr_len: usize,
    value_offset: usize,
}

impl<'a> ValueIterator<'a> {
    /// Creates an iterator over a slice of bytes in record format.
    ///
    /// Produces tuples `(t, bs)` where `t` is a serial type code and `bs`
    /// is a byte slice holding the value, valid for the lifetime of the
    /// borrowed record.
    pub fn new(s: &'a [u8]) -> ValueIterator<'a> {
        let (hdr_len, hdr_len_len) = varint::read_varint(s);
        ValueIterator {
            data: s,
            hdr_offset: hdr_len_len,
            hdr_len: hdr_len as usize,
            value_offset: hdr_len as usize,
        }
    }
}

impl<'a> Iterator for ValueIterator<'a> {
    type Item = (i64, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        if self.hdr_offset >= self.hdr_len.min(self.data.len()) {
            return None;
        }
        let (serial_type, bytes_read) = varint::read_varint(&self.data[self.hdr_offset..]);
        self.hdr_offset += bytes_read;
        let value_len = serial_type::serial_type_len(serial_type).ok()?;
        if self.value_offset + value_len > self.data.len() {
            return None;
        }
        let start = self.value_offset;
        self.value_offset += value_len;
        Some((serial_type, &self.data[start..start + value_len]))
    }
}

/// Scans a record header once, appending each column's serial type to
/// `serials` and its absolute body offset within `record` to `offsets`.
///
/// This is the per-row precomputation the filter and projection layers use
/// so that no predicate re-parses the header. O(K) in the column count.
pub fn scan_header(record: &[u8], serials: &mut Vec<i64>, offsets: &mut Vec<i32>) -> Result<()> {
    serials.clear();
    offsets.clear();
    let (hdr_len, hdr_len_len) = varint::read_varint(record);
    let hdr_len = (hdr_len as usize).min(record.len());
    let mut hdr_offset = hdr_len_len;
    let mut value_offset = hdr_len as i32;
    while hdr_offset < hdr_len {
        let (serial_type, bytes_read) = varint::read_varint(&record[hdr_offset..]);
        hdr_offset += bytes_read;
        serials.push(serial_type);
        offsets.push(value_offset);
        value_offset += serial_type::serial_type_len(serial_type)? as i32;
    }
    Ok(())
}

/// Encodes a row of values into record format.
pub fn encode_record(values: &[SqlValue]) -> Vec<u8> {
    let serial_types: Vec<i64> = values.iter().map(serial_type::serial_type_for_value).collect();
    let types_len: usize = serial_types.iter().map(|t| varint::varint_len(*t)).sum();
    // The header length varint counts itself; one byte almost always
    // suffices, but grow it until the length is self-consistent.
    let mut hdr_len = types_len + 1;
    while varint::varint_len(hdr_len as i64) + types_len != hdr_len {
        hdr_len = varint::varint_len(hdr_len as i64) + types_len;
    }
    let mut out = Vec::with_capacity(hdr_len + 16);
    varint::push_varint(&mut out, hdr_len as i64);
    for t in &serial_types {
        varint::push_varint(&mut out, *t);
    }
    for v in values {
        serial_type::encode_value(v, &mut out);
    }
    out
}

/// Compares a stored record against a sequence of key values, column by
/// column, in record order: NULL first, then numerics (cross-class), then
/// text in byte order, then blobs. Only the first `key.len()` columns of
/// the record participate; a full prefix match is `Equal`.
///
/// Works directly over the record bytes so seeks do not allocate.
pub fn compare_with_values(record: &[u8], key: &[SqlValue]) -> Result<std::cmp::Ordering> {
    use std::cmp::Ordering;
    fn storage_class(serial_type: i64) -> u8 {
        match serial_type {
            0 => 0,
            1..=9 => 1,
            x if x >= 13 && x % 2 == 1 => 2,
            _ => 3,
        }
    }
    fn value_class(v: &SqlValue) -> u8 {
        match v {
            SqlValue::Null() => 0,
            SqlValue::Int(_) | SqlValue::Real(_) => 1,
            SqlValue::Text(_) => 2,
            SqlValue::Blob(_) => 3,
        }
    }
    let mut vi = ValueIterator::new(record);
    for want in key {
        let (serial_type, bytes) = match vi.next() {
            Some(x) => x,
            None => return Ok(Ordering::Less),
        };
        let cls = storage_class(serial_type);
        let want_cls = value_class(want);
        if cls != want_cls {
            return Ok(cls.cmp(&want_cls));
        }
        let ord = match want {
            SqlValue::Null() => Ordering::Equal,
            SqlValue::Int(k) => {
                if serial_type == 7 {
                    let have = serial_type::read_real(serial_type, bytes)
                        .ok_or(Error::InvalidFileFormat("bad numeric serial type"))?;
                    have.partial_cmp(&(*k as f64)).unwrap_or(Ordering::Equal)
                } else {
                    let have = serial_type::read_int(serial_type, bytes)
                        .ok_or(Error::InvalidFileFormat("bad numeric serial type"))?;
                    have.cmp(k)
                }
            }
            SqlValue::Real(k) => {
                let have = serial_type::read_real(serial_type, bytes)
                    .ok_or(Error::InvalidFileFormat("bad numeric serial type"))?;
                have.partial_cmp(k).unwrap_or(Ordering::Equal)
            }
            SqlValue::Text(k) => bytes.cmp(k.as_bytes()),
            SqlValue::Blob(k) => bytes.cmp(&k[..]),
        };
        if ord != Ordering::Equal {
            return Ok(ord);
        }
    }
    Ok(Ordering::Equal)
}

/// Decodes every column of a record.
pub fn decode_record(record: &[u8]) -> Result<Vec<SqlValue>> {
    let mut out = vec![];
    for (serial_type, bytes) in ValueIterator::new(record) {
        out.push(serial_type::to_sql_value(serial_type, bytes)?);
    }
    Ok(out)
}
