//! Parses the 100-byte SQLite file header that prefixes page 1. Builds on
//! the teacher's `dbheader.rs`, generalized from a single hardcoded page
//! size to the full 512..=65536 power-of-two range and relaxed to accept
//! any schema format 1..=4 (format 1/2 are still rejected later, by the
//! schema reader, as `UnsupportedFeature`).

use byteorder::{BigEndian, ReadBytesExt};
use std::io::{Read, Seek, SeekFrom};

use crate::error::{Error, Result};

pub const HEADER_BYTES: usize = 100;

const MAGIC: &[u8; 16] = b"SQLite format 3\0";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    pub page_size: u32,
    pub reserved_bytes: u8,
    pub schema_format: u32,
    pub text_encoding: u32,
    pub page_count: u32,
    pub schema_cookie: u32,
    /// The header's own "file change counter" -- not the in-memory
    /// `data_version` a writable page source increments; see spec §3.
    pub data_version: u32,
    /// 1 = legacy (rollback journal), 2 = WAL. Read from the file-format
    /// read-version byte at offset 19.
    pub read_write_version: u8,
}

impl FileHeader {
    /// Parses the header from the first 100 bytes of `r`, leaving the
    /// stream position at the start of the header (not after it) so the
    /// caller can re-read page 1 in full afterwards.
    pub fn read<R: Read + Seek>(r: &mut R) -> Result<Self> {
        r.seek(SeekFrom::Start(0))?;
        let mut magic = [0u8; 16];
        r.read_exact(&mut magic)
            .map_err(|_| Error::InvalidDatabase("file shorter than 100-byte header".to_string()))?;
        if &magic != MAGIC {
            return Err(Error::InvalidDatabase("bad magic string".to_string()));
        }

        let raw_page_size = r.read_u16::<BigEndian>()?;
        let page_size: u32 = match raw_page_size {
            1 => 65536,
            n if n.is_power_of_two() && (512..=32768).contains(&n) => n as u32,
            n => {
                return Err(Error::InvalidDatabase(format!(
                    "page size {n} is not a power of two in 512..=65536"
                )))
            }
        };

        let write_version = r.read_u8()?;
        let read_version = r.read_u8()?;
        if !(1..=2).contains(&write_version) || !(1..=2).contains(&read_version) {
            return Err(Error::InvalidDatabase(
                "file format read/write version must be 1 or 2".to_string(),
            ));
        }

        let reserved_bytes = r.read_u8()?;
        let max_payload_fraction = r.read_u8()?;
        let min_payload_fraction = r.read_u8()?;
        let leaf_payload_fraction = r.read_u8()?;
        if max_payload_fraction != 64 || min_payload_fraction != 32 || leaf_payload_fraction != 32 {
            return Err(Error::InvalidDatabase(
                "payload fraction bytes must be 64/32/32".to_string(),
            ));
        }

        let data_version = r.read_u32::<BigEndian>()?;
        let page_count = r.read_u32::<BigEndian>()?;
        if page_count == 0 {
            return Err(Error::InvalidDatabase(
                "page count must be positive".to_string(),
            ));
        }

        let _freelist_trunk = r.read_u32::<BigEndian>()?;
        let _freelist_count = r.read_u32::<BigEndian>()?;
        let schema_cookie = r.read_u32::<BigEndian>()?;
        let schema_format = r.read_u32::<BigEndian>()?;
        if !(1..=4).contains(&schema_format) {
            return Err(Error::InvalidDatabase(format!(
                "schema format {schema_format} outside 1..=4"
            )));
        }

        let _default_cache_size = r.read_u32::<BigEndian>()?;
        let _largest_root_page = r.read_u32::<BigEndian>()?;
        let text_encoding = r.read_u32::<BigEndian>()?;
        if !(1..=3).contains(&text_encoding) {
            return Err(Error::InvalidDatabase(format!(
                "text encoding {text_encoding} outside 1..=3"
            )));
        }
        let _user_version = r.read_u32::<BigEndian>()?;
        let _incremental_vacuum = r.read_u32::<BigEndian>()?;
        let _application_id = r.read_u32::<BigEndian>()?;

        let mut reserved = [0u8; 20];
        r.read_exact(&mut reserved)?;

        let _version_valid_for = r.read_u32::<BigEndian>()?;
        let _sqlite_version_number = r.read_u32::<BigEndian>()?;

        Ok(FileHeader {
            page_size,
            reserved_bytes,
            schema_format,
            text_encoding,
            page_count,
            schema_cookie,
            data_version,
            read_write_version: read_version,
        })
    }

    /// Usable size of each page: the raw page size minus the reserved
    /// tail (spec §3 "Page").
    pub fn usable_page_size(&self) -> u32 {
        self.page_size - self.reserved_bytes as u32
    }

    pub fn is_wal_mode(&self) -> bool {
        self.read_write_version == 2
    }

    /// Serializes a header for tests that synthesize whole database
    /// images; mirrors the field layout `read` parses. Not used by the
    /// core reader itself (the core never writes).
    #[cfg(test)]
    pub fn to_bytes(&self) -> Vec<u8> {
        use byteorder::WriteBytesExt;
        let mut v = Vec::with_capacity(HEADER_BYTES);
        v.extend_from_slice(MAGIC);
        let raw_page_size: u16 = if self.page_size == 65536 {
            1
        } else {
            self.page_size as u16
        };
        v.write_u16::<BigEndian>(raw_page_size).unwrap();
        v.write_u8(self.read_write_version).unwrap();
        v.write_u8(self.read_write_version).unwrap();
        v.write_u8(self.reserved_bytes).unwrap();
        v.write_u8(64).unwrap();
        v.write_u8(32).unwrap();
        v.write_u8(32).unwrap();
        v.write_u32::<BigEndian>(self.data_version).unwrap();
        v.write_u32::<BigEndian>(self.page_count).unwrap();
        v.write_u32::<BigEndian>(0).unwrap(); // freelist trunk
        v.write_u32::<BigEndian>(0).unwrap(); // freelist count
        v.write_u32::<BigEndian>(self.schema_cookie).unwrap();
        v.write_u32::<BigEndian>(self.schema_format).unwrap();
        v.write_u32::<BigEndian>(0).unwrap(); // default cache size
        v.write_u32::<BigEndian>(0).unwrap(); // largest root page
        v.write_u32::<BigEndian>(self.text_encoding).unwrap();
        v.write_u32::<BigEndian>(0).unwrap(); // user version
        v.write_u32::<BigEndian>(0).unwrap(); // incremental vacuum
        v.write_u32::<BigEndian>(0).unwrap(); // application id
        v.extend_from_slice(&[0u8; 20]);
        v.write_u32::<BigEndian>(1).unwrap(); // version-valid-for
        v.write_u32::<BigEndian>(3_037_000).unwrap(); // sqlite_version_number
        assert_eq!(v.len(), HEADER_BYTES);
        v
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn header(page_size: u32, page_count: u32) -> FileHeader {
        FileHeader {
            page_size,
            reserved_bytes: 0,
            schema_format: 4,
            text_encoding: 1,
            page_count,
            schema_cookie: 0,
            data_version: 1,
            read_write_version: 1,
        }
    }

    #[test]
    fn roundtrip() {
        let h = header(4096, 3);
        let bytes = h.to_bytes();
        let parsed = FileHeader::read(&mut Cursor::new(bytes)).unwrap();
        assert_eq!(parsed, h);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut bytes = header(4096, 1).to_bytes();
        bytes[0] = b'X';
        assert!(FileHeader::read(&mut Cursor::new(bytes)).is_err());
    }

    #[test]
    fn rejects_non_power_of_two_page_size() {
        let mut bytes = header(4096, 1).to_bytes();
        bytes[16..18].copy_from_slice(&3000u16.to_be_bytes());
        assert!(FileHeader::read(&mut Cursor::new(bytes)).is_err());
    }

    #[test]
    fn rejects_zero_page_count() {
        let mut bytes = header(4096, 1).to_bytes();
        bytes[28..32].copy_from_slice(&0u32.to_be_bytes());
        assert!(FileHeader::read(&mut Cursor::new(bytes)).is_err());
    }

    #[test]
    fn page_size_one_means_65536() {
        let h = header(65536, 1);
        let bytes = h.to_bytes();
        let parsed = FileHeader::read(&mut Cursor::new(bytes)).unwrap();
        assert_eq!(parsed.page_size, 65536);
    }

    #[test]
    fn empty_file_is_invalid_database() {
        let mut c = Cursor::new(Vec::<u8>::new());
        assert!(FileHeader::read(&mut c).is_err());
    }

    #[test]
    fn wal_mode_detected_from_read_write_version() {
        let mut h = header(4096, 1);
        h.read_write_version = 2;
        let parsed = FileHeader::read(&mut Cursor::new(h.to_bytes())).unwrap();
        assert!(parsed.is_wal_mode());
    }
}
