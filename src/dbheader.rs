//! dbheader reads and writes the 100-byte header at the start of a
//! database file.
//!
//! The commit path patches exactly five fields in place (change counter,
//! page count, the two freelist fields, and the schema cookie); every
//! other byte of the header is preserved verbatim across structural
//! mutations of page 1.

use byteorder::{BigEndian, ByteOrder};

use crate::error::{Error, Result};

pub const DB_HEADER_BYTES: usize = 100;
pub const MAGIC_STRING: &[u8] = &[
    0x53, 0x51, 0x4c, 0x69, 0x74, 0x65, 0x20, 0x66, 0x6f, 0x72, 0x6d, 0x61, 0x74, 0x20, 0x33, 0x00,
];
const ENGINE_VERSION_NUMBER: u32 = 3037000;

// Header field offsets patched by the commit path.
pub const OFFSET_CHANGE_COUNTER: usize = 24;
pub const OFFSET_PAGE_COUNT: usize = 28;
pub const OFFSET_FREELIST_TRUNK: usize = 32;
pub const OFFSET_FREELIST_COUNT: usize = 36;
pub const OFFSET_SCHEMA_COOKIE: usize = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextEncoding {
    Utf8,
    Utf16Le,
    Utf16Be,
}

/// The database file header.
#[derive(Debug, Clone)]
pub struct DbHeader {
    pub page_size: u32,
    pub reserved_per_page: u8,
    pub change_counter: u32,
    pub page_count: u32,
    pub freelist_trunk: u32,
    pub freelist_count: u32,
    pub schema_cookie: u32,
    pub schema_format: u32,
    pub default_page_cache: u32,
    pub auto_vacuum_root: u32,
    pub text_encoding: TextEncoding,
    pub user_version: u32,
    pub incremental_vacuum: u32,
    pub application_id: u32,
    pub version_valid_for: u32,
    pub engine_version: u32,
}

impl DbHeader {
    /// Usable bytes per page: page size less the reserved region.
    pub fn usable_size(&self) -> usize {
        self.page_size as usize - self.reserved_per_page as usize
    }
}

/// Parses and validates the header from the first bytes of page 1.
pub fn parse_header(buf: &[u8]) -> Result<DbHeader> {
    if buf.len() < DB_HEADER_BYTES {
        return Err(Error::InvalidFileFormat("file shorter than the 100-byte header"));
    }
    // Offset	Size	Description
    // 0        16	    The header string: "SQLite format 3\000"
    if &buf[0..16] != MAGIC_STRING {
        return Err(Error::InvalidFileFormat("bad magic string"));
    }
    // 16	    2	    Page size. Power of two in 512..=32768, or 1 for 65536.
    let page_size = match BigEndian::read_u16(&buf[16..]) {
        1 => 65536,
        x @ (512 | 1024 | 2048 | 4096 | 8192 | 16384 | 32768) => x as u32,
        _ => return Err(Error::InvalidFileFormat("unsupported page size")),
    };
    // 18	    1	    File format write version. 1 for legacy; 2 for WAL.
    // 19	    1	    File format read version. 1 for legacy; 2 for WAL.
    if buf[18] > 2 || buf[19] > 2 {
        return Err(Error::InvalidFileFormat("unknown file format version"));
    }
    // 20	    1	    Bytes of unused "reserved" space at the end of each page.
    let reserved_per_page = buf[20];
    // 21	    1	    Maximum embedded payload fraction. Must be 64.
    // 22	    1	    Minimum embedded payload fraction. Must be 32.
    // 23	    1	    Leaf payload fraction. Must be 32.
    if buf[21] != 64 || buf[22] != 32 || buf[23] != 32 {
        return Err(Error::InvalidFileFormat("bad payload fraction constants"));
    }
    // 24	    4	    File change counter.
    // 28	    4	    Size of the database file in pages.
    let change_counter = BigEndian::read_u32(&buf[OFFSET_CHANGE_COUNTER..]);
    let page_count = BigEndian::read_u32(&buf[OFFSET_PAGE_COUNT..]);
    // 32	    4	    Page number of the first freelist trunk page.
    // 36	    4	    Total number of freelist pages.
    let freelist_trunk = BigEndian::read_u32(&buf[OFFSET_FREELIST_TRUNK..]);
    let freelist_count = BigEndian::read_u32(&buf[OFFSET_FREELIST_COUNT..]);
    // 40	    4	    The schema cookie.
    // 44	    4	    The schema format number. Must be 1..=4.
    let schema_cookie = BigEndian::read_u32(&buf[OFFSET_SCHEMA_COOKIE..]);
    let schema_format = BigEndian::read_u32(&buf[44..]);
    if !(1..=4).contains(&schema_format) {
        return Err(Error::InvalidFileFormat("schema format out of range"));
    }
    // 48	    4	    Default page cache size.
    // 52	    4	    Largest root page when vacuuming, or zero.
    let default_page_cache = BigEndian::read_u32(&buf[48..]);
    let auto_vacuum_root = BigEndian::read_u32(&buf[52..]);
    // 56	    4	    Text encoding. 1 UTF-8, 2 UTF-16le, 3 UTF-16be.
    let text_encoding = match BigEndian::read_u32(&buf[56..]) {
        1 => TextEncoding::Utf8,
        2 => TextEncoding::Utf16Le,
        3 => TextEncoding::Utf16Be,
        _ => return Err(Error::InvalidFileFormat("unknown text encoding")),
    };
    // 60	    4	    User version.
    // 64	    4	    Non-zero for incremental-vacuum mode.
    // 68	    4	    Application ID.
    let user_version = BigEndian::read_u32(&buf[60..]);
    let incremental_vacuum = BigEndian::read_u32(&buf[64..]);
    let application_id = BigEndian::read_u32(&buf[68..]);
    // 72	    20	    Reserved for expansion. Must be zero.
    if buf[72..92].iter().any(|b| *b != 0) {
        return Err(Error::InvalidFileFormat("reserved header bytes non-zero"));
    }
    // 92	    4	    The version-valid-for number.
    // 96	    4	    Engine version number.
    let version_valid_for = BigEndian::read_u32(&buf[92..]);
    let engine_version = BigEndian::read_u32(&buf[96..]);

    Ok(DbHeader {
        page_size,
        reserved_per_page,
        change_counter,
        page_count,
        freelist_trunk,
        freelist_count,
        schema_cookie,
        schema_format,
        default_page_cache,
        auto_vacuum_root,
        text_encoding,
        user_version,
        incremental_vacuum,
        application_id,
        version_valid_for,
        engine_version,
    })
}

/// Serializes a complete header into the first 100 bytes of `page`.
/// Used when bootstrapping a fresh database file.
pub fn write_header(page: &mut [u8], h: &DbHeader) {
    page[..16].copy_from_slice(MAGIC_STRING);
    let size_field = if h.page_size == 65536 { 1 } else { h.page_size as u16 };
    BigEndian::write_u16(&mut page[16..], size_field);
    page[18] = 1;
    page[19] = 1;
    page[20] = h.reserved_per_page;
    page[21] = 64;
    page[22] = 32;
    page[23] = 32;
    BigEndian::write_u32(&mut page[OFFSET_CHANGE_COUNTER..], h.change_counter);
    BigEndian::write_u32(&mut page[OFFSET_PAGE_COUNT..], h.page_count);
    BigEndian::write_u32(&mut page[OFFSET_FREELIST_TRUNK..], h.freelist_trunk);
    BigEndian::write_u32(&mut page[OFFSET_FREELIST_COUNT..], h.freelist_count);
    BigEndian::write_u32(&mut page[OFFSET_SCHEMA_COOKIE..], h.schema_cookie);
    BigEndian::write_u32(&mut page[44..], h.schema_format);
    BigEndian::write_u32(&mut page[48..], h.default_page_cache);
    BigEndian::write_u32(&mut page[52..], h.auto_vacuum_root);
    let enc = match h.text_encoding {
        TextEncoding::Utf8 => 1,
        TextEncoding::Utf16Le => 2,
        TextEncoding::Utf16Be => 3,
    };
    BigEndian::write_u32(&mut page[56..], enc);
    BigEndian::write_u32(&mut page[60..], h.user_version);
    BigEndian::write_u32(&mut page[64..], h.incremental_vacuum);
    BigEndian::write_u32(&mut page[68..], h.application_id);
    page[72..92].fill(0);
    BigEndian::write_u32(&mut page[92..], h.version_valid_for);
    BigEndian::write_u32(&mut page[96..], h.engine_version);
}

/// A header for a brand new database with the given page size.
pub fn fresh_header(page_size: u32) -> DbHeader {
    DbHeader {
        page_size,
        reserved_per_page: 0,
        change_counter: 1,
        page_count: 1,
        freelist_trunk: 0,
        freelist_count: 0,
        schema_cookie: 1,
        schema_format: 4,
        default_page_cache: 0,
        auto_vacuum_root: 0,
        text_encoding: TextEncoding::Utf8,
        user_version: 0,
        incremental_vacuum: 0,
        application_id: 0,
        version_valid_for: 1,
        engine_version: ENGINE_VERSION_NUMBER,
    }
}

/// Patches the five commit-path fields in place, leaving every other
/// header byte untouched.
pub fn patch_commit_fields(
    page: &mut [u8],
    change_counter: u32,
    page_count: u32,
    freelist_trunk: u32,
    freelist_count: u32,
    schema_cookie: Option<u32>,
) {
    BigEndian::write_u32(&mut page[OFFSET_CHANGE_COUNTER..], change_counter);
    BigEndian::write_u32(&mut page[OFFSET_PAGE_COUNT..], page_count);
    BigEndian::write_u32(&mut page[OFFSET_FREELIST_TRUNK..], freelist_trunk);
    BigEndian::write_u32(&mut page[OFFSET_FREELIST_COUNT..], freelist_count);
    if let Some(cookie) = schema_cookie {
        BigEndian::write_u32(&mut page[OFFSET_SCHEMA_COOKIE..], cookie);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_header_round_trip() {
        let mut page = vec![0u8; 512];
        let h = fresh_header(4096);
        write_header(&mut page, &h);
        let parsed = parse_header(&page).unwrap();
        assert_eq!(parsed.page_size, 4096);
        assert_eq!(parsed.page_count, 1);
        assert_eq!(parsed.schema_format, 4);
        assert_eq!(parsed.text_encoding, TextEncoding::Utf8);
    }

    #[test]
    fn test_page_size_one_means_64k() {
        let mut page = vec![0u8; DB_HEADER_BYTES];
        write_header(&mut page, &fresh_header(65536));
        assert_eq!(BigEndian::read_u16(&page[16..]), 1);
        assert_eq!(parse_header(&page).unwrap().page_size, 65536);
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut page = vec![0u8; DB_HEADER_BYTES];
        write_header(&mut page, &fresh_header(4096));
        page[0] = b'X';
        assert!(matches!(parse_header(&page), Err(crate::error::Error::InvalidFileFormat(_))));
    }

    #[test]
    fn test_reserved_bytes_must_be_zero() {
        let mut page = vec![0u8; DB_HEADER_BYTES];
        write_header(&mut page, &fresh_header(4096));
        page[80] = 1;
        assert!(parse_header(&page).is_err());
    }

    #[test]
    fn test_patch_touches_only_commit_fields() {
        let mut page = vec![0u8; DB_HEADER_BYTES];
        write_header(&mut page, &fresh_header(4096));
        let before = page.clone();
        patch_commit_fields(&mut page, 7, 12, 9, 2, Some(3));
        for (i, (a, b)) in before.iter().zip(page.iter()).enumerate() {
            let patched = (OFFSET_CHANGE_COUNTER..OFFSET_SCHEMA_COOKIE + 4).contains(&i);
            if !patched {
                assert_eq!(a, b, "byte {} changed unexpectedly", i);
            }
        }
        let h = parse_header(&page).unwrap();
        assert_eq!(h.change_counter, 7);
        assert_eq!(h.page_count, 12);
        assert_eq!(h.freelist_trunk, 9);
        assert_eq!(h.freelist_count, 2);
        assert_eq!(h.schema_cookie, 3);
    }
}
