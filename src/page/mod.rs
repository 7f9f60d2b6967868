//! L1: page sources. A page source delivers a fixed-size page by 1-based
//! page number from some backing store -- a file, an in-memory buffer, or
//! (see `crate::wal`) a WAL-overlaid file. See spec §4.1.

pub mod cache;
pub mod transform;

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};

use log::trace;

use crate::error::{Error, Result};

/// Page numbers are 1-based, matching SQLite's own numbering.
pub type PageNum = u32;

/// L1 contract: deliver whole pages by number, report page size/count, and
/// expose a monotonic `data_version` writers can bump to invalidate
/// readers' cached leaf-range state (spec §3 "Snapshot/version token").
///
/// The slice returned by `get_page` is only valid until the next call to
/// `get_page` on the same source -- implementations are free to recycle a
/// single scratch buffer.
pub trait PageSource {
    fn page_size(&self) -> u32;
    fn page_count(&self) -> u32;
    fn data_version(&self) -> u64;
    fn get_page(&mut self, page_number: PageNum) -> Result<&[u8]>;
}

fn check_page_number(pn: PageNum, page_count: u32) -> Result<()> {
    if pn == 0 || pn > page_count {
        return Err(Error::OutOfRange(format!(
            "page {pn} outside 1..={page_count}"
        )));
    }
    Ok(())
}

/// A page source backed by an open file, read with positional random
/// access. Pages are read fresh from disk on every `get_page` call -- wrap
/// in `cache::CachingPageSource` for bounded in-memory reuse.
pub struct FilePageSource {
    file: File,
    page_size: u32,
    page_count: u32,
    buf: Vec<u8>,
}

impl FilePageSource {
    /// Opens `path` and reads just enough of page 1 to learn the page size
    /// and page count; does not eagerly read the rest of the file.
    pub fn open(path: &str) -> Result<Self> {
        let mut file = std::fs::OpenOptions::new()
            .read(true)
            .write(false)
            .create(false)
            .open(path)?;
        let header = crate::header::FileHeader::read(&mut file)?;
        let file_len = file.metadata()?.len();
        let expected_len = header.page_size as u64 * header.page_count as u64;
        if file_len < expected_len {
            return Err(Error::InvalidDatabase(format!(
                "file is {file_len} bytes but header declares {} pages of {} bytes ({expected_len} bytes)",
                header.page_count, header.page_size
            )));
        }
        Ok(FilePageSource {
            file,
            page_size: header.page_size,
            page_count: header.page_count,
            buf: vec![0u8; header.page_size as usize],
        })
    }

    /// Duplicates the underlying file descriptor so a cursor can have its
    /// own read position and scratch buffer independent of other cursors on
    /// the same `Database` (see `pipeline::RawSource`). Fallible, unlike
    /// `std::clone::Clone`, since duplicating a descriptor is a syscall.
    pub fn try_clone(&self) -> Result<Self> {
        Ok(FilePageSource {
            file: self.file.try_clone()?,
            page_size: self.page_size,
            page_count: self.page_count,
            buf: vec![0u8; self.page_size as usize],
        })
    }
}

impl PageSource for FilePageSource {
    fn page_size(&self) -> u32 {
        self.page_size
    }

    fn page_count(&self) -> u32 {
        self.page_count
    }

    fn data_version(&self) -> u64 {
        0 // read-only file source: the version never changes.
    }

    fn get_page(&mut self, page_number: PageNum) -> Result<&[u8]> {
        check_page_number(page_number, self.page_count)?;
        trace!("file page source: reading page {page_number} from disk");
        let offset = (page_number as u64 - 1) * self.page_size as u64;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(&mut self.buf)?;
        Ok(&self.buf)
    }
}

/// A page source backed by an in-memory byte buffer. `get_page(n)` is an
/// O(1) slice of `(n-1)*page_size .. n*page_size`. Used for tests and for
/// hosts (WASM, embedded) that already have the whole file resident.
///
/// `data` is `Rc`-shared so a `Database` can cheaply clone this source once
/// per cursor (see `pipeline::RawSource`) instead of duplicating the buffer.
#[derive(Clone)]
pub struct MemoryPageSource {
    data: std::rc::Rc<Vec<u8>>,
    page_size: u32,
    page_count: u32,
}

impl MemoryPageSource {
    pub fn new(data: Vec<u8>) -> Result<Self> {
        let header = crate::header::FileHeader::read(&mut std::io::Cursor::new(&data))?;
        let expected_len = header.page_size as usize * header.page_count as usize;
        if data.len() < expected_len {
            return Err(Error::InvalidDatabase(format!(
                "buffer is {} bytes but header declares {expected_len} bytes",
                data.len()
            )));
        }
        Ok(MemoryPageSource {
            data: std::rc::Rc::new(data),
            page_size: header.page_size,
            page_count: header.page_count,
        })
    }
}

impl PageSource for MemoryPageSource {
    fn page_size(&self) -> u32 {
        self.page_size
    }

    fn page_count(&self) -> u32 {
        self.page_count
    }

    fn data_version(&self) -> u64 {
        0
    }

    fn get_page(&mut self, page_number: PageNum) -> Result<&[u8]> {
        check_page_number(page_number, self.page_count)?;
        let start = (page_number as usize - 1) * self.page_size as usize;
        let end = start + self.page_size as usize;
        Ok(&self.data[start..end])
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use test_support::header_bytes;

    fn one_page_leaf_image(page_size: u32) -> Vec<u8> {
        let mut buf = header_bytes(page_size, 1);
        buf.resize(page_size as usize, 0);
        // Empty table leaf b-tree header at offset 100 (page 1).
        buf[100] = 0x0d; // table leaf
        buf[101..103].copy_from_slice(&0u16.to_be_bytes()); // no freeblocks
        buf[103..105].copy_from_slice(&0u16.to_be_bytes()); // 0 cells
        buf[105..107].copy_from_slice(&(page_size as u16).to_be_bytes()); // cell content start
        buf[107] = 0; // fragmented free bytes
        buf
    }

    #[test]
    fn memory_source_reports_header_fields() {
        let data = one_page_leaf_image(512);
        let mut src = MemoryPageSource::new(data).unwrap();
        assert_eq!(src.page_size(), 512);
        assert_eq!(src.page_count(), 1);
        assert_eq!(src.get_page(1).unwrap().len(), 512);
    }

    #[test]
    fn out_of_range_page_number_errors() {
        let data = one_page_leaf_image(512);
        let mut src = MemoryPageSource::new(data).unwrap();
        assert!(src.get_page(0).is_err());
        assert!(src.get_page(2).is_err());
    }

    #[test]
    fn file_shorter_than_declared_is_invalid() {
        let mut data = one_page_leaf_image(512);
        data.truncate(256);
        assert!(MemoryPageSource::new(data).is_err());
    }
}
