//! Serial Types are how the file format stores values in records.
//!
//! A serial type code encodes both the storage class and the byte width of
//! one column value. This module classifies codes, decodes value bytes into
//! [`SqlValue`]s and encodes values back into (code, bytes) pairs using the
//! minimal-size rule.

use byteorder::{BigEndian, ByteOrder};

use crate::error::{Error, Result};
use crate::sql_value::SqlValue;

/// Content length in bytes for a serial type code.
///
/// Reserved codes 10 and 11 never appear in a well-formed database file and
/// are rejected, as are negative codes.
pub fn serial_type_len(serial_type: i64) -> Result<usize> {
    match serial_type {
        // Serial Type	Content Size	Meaning
        // 0	        0	            Value is a NULL.
        0 => Ok(0),
        // 1..=6	    1,2,3,4,6,8	    Big-endian twos-complement integer.
        1 => Ok(1),
        2 => Ok(2),
        3 => Ok(3),
        4 => Ok(4),
        5 => Ok(6),
        // 6	        8	            64-bit integer.
        // 7	        8	            IEEE 754-2008 64-bit float.
        6 | 7 => Ok(8),
        // 8,9	        0	            Literal integers 0 and 1.
        8 | 9 => Ok(0),
        // 10,11	    reserved	    Never valid on disk.
        10 | 11 => Err(Error::UnsupportedFeature("reserved serial type 10/11")),
        // N>=12 even	(N-12)/2	    BLOB.
        // N>=13 odd	(N-13)/2	    TEXT.
        x if x >= 12 => Ok((x as usize - 12 - (x % 2) as usize) / 2),
        _ => Err(Error::InvalidFileFormat("negative serial type code")),
    }
}

/// Reads a big-endian twos-complement integer of 1..=8 bytes, sign extended
/// to i64.
fn read_be_int(data: &[u8]) -> i64 {
    let mut v: i64 = if data[0] & 0x80 != 0 { -1 } else { 0 };
    for &b in data {
        v = (v << 8) | b as i64;
    }
    v
}

/// Deserialize bytes in serial-type format into a [`SqlValue`].
///
/// `data` must hold exactly [`serial_type_len`] bytes; record decoding
/// guarantees this by construction.
pub fn to_sql_value(serial_type: i64, data: &[u8]) -> Result<SqlValue> {
    use SqlValue::*;
    match serial_type {
        0 => Ok(Null()),
        1..=6 => Ok(Int(read_be_int(data))),
        7 => Ok(Real(BigEndian::read_f64(data))),
        8 => Ok(Int(0)),
        9 => Ok(Int(1)),
        10 | 11 => Err(Error::UnsupportedFeature("reserved serial type 10/11")),
        x if x >= 12 => {
            if x % 2 == 0 {
                Ok(Blob(data.to_vec()))
            } else {
                let s = std::str::from_utf8(data)
                    .map_err(|_| Error::UnsupportedFeature("non-UTF-8 text payload"))?;
                Ok(Text(s.to_string()))
            }
        }
        _ => Err(Error::InvalidFileFormat("negative serial type code")),
    }
}

/// Reads an integer-classed value without allocating. Returns `None` for
/// non-integer storage classes.
pub fn read_int(serial_type: i64, data: &[u8]) -> Option<i64> {
    match serial_type {
        1..=6 => Some(read_be_int(data)),
        8 => Some(0),
        9 => Some(1),
        _ => None,
    }
}

/// Reads a numeric value (integer or real) as f64 without allocating.
pub fn read_real(serial_type: i64, data: &[u8]) -> Option<f64> {
    match serial_type {
        7 => Some(BigEndian::read_f64(data)),
        _ => read_int(serial_type, data).map(|i| i as f64),
    }
}

/// The serial type code `v` encodes as, following the minimal-size rule:
/// 0 and 1 use the literal codes, other integers the smallest width that
/// holds them.
pub fn serial_type_for_value(v: &SqlValue) -> i64 {
    match v {
        SqlValue::Null() => 0,
        SqlValue::Int(0) => 8,
        SqlValue::Int(1) => 9,
        SqlValue::Int(i) => match i {
            -128..=127 => 1,
            -32768..=32767 => 2,
            -8388608..=8388607 => 3,
            -2147483648..=2147483647 => 4,
            -140737488355328..=140737488355327 => 5,
            _ => 6,
        },
        SqlValue::Real(_) => 7,
        SqlValue::Blob(b) => 12 + 2 * b.len() as i64,
        SqlValue::Text(s) => 13 + 2 * s.len() as i64,
    }
}

/// Appends the body bytes of `v` to `out`, matching the code returned by
/// [`serial_type_for_value`].
pub fn encode_value(v: &SqlValue, out: &mut Vec<u8>) {
    match v {
        SqlValue::Null() | SqlValue::Int(0) | SqlValue::Int(1) => {}
        SqlValue::Int(i) => {
            let len = serial_type_len(serial_type_for_value(v)).unwrap_or(8);
            let be = i.to_be_bytes();
            out.extend_from_slice(&be[8 - len..]);
        }
        SqlValue::Real(r) => {
            let mut buf = [0u8; 8];
            BigEndian::write_f64(&mut buf, *r);
            out.extend_from_slice(&buf);
        }
        SqlValue::Text(s) => out.extend_from_slice(s.as_bytes()),
        SqlValue::Blob(b) => out.extend_from_slice(b),
    }
}
