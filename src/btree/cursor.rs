//! The b-tree cursor: descent, sequential scan, seek, and reuse. Supersedes
//! the teacher's `btree/leaf.rs` + `btree/interior.rs` + `btree/table.rs`
//! iterator trio -- those were plain `Iterator`s with no seek and no reset,
//! which can't express spec §4.4's seek fast paths or §4.4's "prepared
//! reader" reuse without an explicit state machine. This module is the
//! spec's FSM (Fresh / Positioned / BetweenPages / Exhausted / Disposed)
//! plus the ancestor-frame stack described in spec §3 and §9.

use log::trace;

use crate::btree::cell::{self, PayloadLocation};
use crate::btree::header::PageHeader;
use crate::btree::{PageKind, RowId};
use crate::error::{Error, Result};
use crate::page::{PageNum, PageSource};
use crate::record::{self, ColumnSlot};
use crate::value::Value;

/// Inline capacity of the ancestor-frame stack. Spec §3/§9: "8-16 is
/// sufficient for any practical dataset"; deeper trees spill to the heap.
const INLINE_FRAMES: usize = 16;

#[derive(Debug, Clone, Copy)]
struct Frame {
    page: PageNum,
    /// -1 before any cell on this page has been visited. The "virtual"
    /// slot at index `cell_count` stands for the right-child pointer on an
    /// interior page, visited last (spec §4.4 "Sequential MoveNext").
    last_cell_visited: i32,
    cell_count: u16,
    right_child: Option<PageNum>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Fresh,
    Positioned,
    BetweenPages,
    Exhausted,
    Disposed,
}

/// A seek/scan key: rowid for table b-trees, a byte string for index
/// b-trees (spec §4.4 "WITHOUT-ROWID and index B-trees use lexicographic
/// byte-string comparison").
#[derive(Debug, Clone)]
pub enum Key<'a> {
    RowId(RowId),
    Bytes(&'a [u8]),
}

struct PositionedRow {
    page: PageNum,
    rowid: RowId,
    payload: PayloadLocation,
    /// Set once the payload has been fully assembled (local bytes plus any
    /// overflow chain); cleared whenever the cursor moves.
    assembled: Vec<u8>,
    /// The record header walked once, at positioning time, so `column()`
    /// can decode straight from this table instead of re-walking the header
    /// on every call (spec §4.3 "lazy mode" defers column *decoding*, not
    /// re-parsing the header).
    columns: Vec<ColumnSlot>,
    leaf_min_rowid: RowId,
    leaf_max_rowid: RowId,
}

/// Stateful reader over one table (or index) b-tree. Created via
/// `Database::open_cursor`/`prepare_reader`; never constructed directly by
/// callers outside this crate.
pub struct Cursor<S> {
    source: S,
    root_page: PageNum,
    is_table_btree: bool,
    usable_page_size: u32,
    state: State,
    stack: Vec<Frame>,
    current: Option<PositionedRow>,
    /// `data_version` seen when the cursor last (re)descended; a mismatch
    /// against `source.data_version()` forces a full descent on the next
    /// seek fast path (spec §4.4, §5 "Ordering guarantees").
    snapshot_version: u64,
    last_seek_rowid: Option<RowId>,
    /// Scratch buffer for overflow-payload assembly, reused across rows so a
    /// prepared reader doing repeated point lookups doesn't allocate a fresh
    /// `Vec` per row (spec §4.4/§5 "Prepared-reader pool", property 9).
    payload_scratch: Vec<u8>,
}

impl<S: PageSource> Cursor<S> {
    pub fn new(source: S, root_page: PageNum, is_table_btree: bool) -> Self {
        let usable_page_size = source.page_size();
        let snapshot_version = source.data_version();
        Cursor {
            source,
            root_page,
            is_table_btree,
            usable_page_size,
            state: State::Fresh,
            stack: Vec::with_capacity(INLINE_FRAMES),
            current: None,
            snapshot_version,
            last_seek_rowid: None,
            payload_scratch: Vec::new(),
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.state == State::Disposed
    }

    fn require_positioned(&self) -> Result<&PositionedRow> {
        match (&self.state, &self.current) {
            (State::Disposed, _) => Err(Error::InvalidState("cursor is disposed".to_string())),
            (State::Positioned, Some(row)) => Ok(row),
            _ => Err(Error::InvalidState(
                "column accessor called while cursor is not positioned".to_string(),
            )),
        }
    }

    pub fn rowid(&self) -> Result<RowId> {
        Ok(self.require_positioned()?.rowid)
    }

    pub fn column(&self, i: usize) -> Result<Value<'_>> {
        let row = self.require_positioned()?;
        record::decode_column(&row.assembled, &row.columns, i, row.page)
    }

    pub fn column_count(&self) -> Result<usize> {
        Ok(self.require_positioned()?.columns.len())
    }

    /// Releases cursor resources. Idempotent; safe to call more than once
    /// (spec §7 "Disposal: close() is idempotent and never fails").
    pub fn close(&mut self) {
        self.state = State::Disposed;
        self.current = None;
        self.stack.clear();
    }

    /// Resets the cursor to `Fresh` without deallocating the ancestor stack
    /// or the overflow-assembly buffer -- the mechanism behind
    /// `Database::prepare_reader`'s zero-allocation steady state (spec
    /// §4.4 "Cursor reuse", §5 "Prepared-reader pool").
    pub fn reset(&mut self) {
        self.stack.clear();
        if let Some(row) = self.current.take() {
            self.payload_scratch = row.assembled;
        }
        self.state = State::Fresh;
        self.last_seek_rowid = None;
    }

    fn check_stale_snapshot(&mut self) {
        let current_version = self.source.data_version();
        if current_version != self.snapshot_version {
            trace!("cursor: data_version changed, invalidating leaf-range cache");
            self.current = None;
            self.last_seek_rowid = None;
            self.snapshot_version = current_version;
        }
    }

    fn load_header(&mut self, page_number: PageNum) -> Result<PageHeader> {
        let page = self.source.get_page(page_number)?;
        let page_start = if page_number == 1 { crate::header::HEADER_BYTES } else { 0 };
        PageHeader::parse(page, page_start, page_number)
    }

    /// Descends from `self.root_page` toward the leaf containing `key`,
    /// populating the ancestor stack along the way (spec §4.4 "Descent").
    /// On landing at a leaf, positions at the matching cell (exact seek) or
    /// the next-greater cell (near seek), or leaves the cursor
    /// between-pages if nothing in this leaf qualifies.
    fn descend(&mut self, key: &Key<'_>, exact: bool) -> Result<bool> {
        self.stack.clear();
        let mut page_number = self.root_page;
        loop {
            let header = self.load_header(page_number)?;
            self.stack.push(Frame {
                page: page_number,
                last_cell_visited: -1,
                cell_count: header.cell_count,
                right_child: header.right_child,
            });

            if header.kind.is_leaf() {
                return self.seek_within_leaf(page_number, &header, key, exact);
            }

            let child = self.find_interior_child(page_number, &header, key)?;
            page_number = child;
        }
    }

    fn find_interior_child(&mut self, page_number: PageNum, header: &PageHeader, key: &Key<'_>) -> Result<PageNum> {
        let page_start = if page_number == 1 { crate::header::HEADER_BYTES } else { 0 };
        let array_start = header.cell_pointer_array_start(page_start);
        let page = self.source.get_page(page_number)?;
        let mut lo: u16 = 0;
        let mut hi: u16 = header.cell_count;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let off = cell::read_cell_pointer(page, array_start, mid, page_number)?;
            let ge = match (self.is_table_btree, key) {
                (true, Key::RowId(k)) => {
                    let c = cell::parse_table_interior_cell(page, off, page_number)?;
                    c.key >= *k
                }
                (false, Key::Bytes(k)) => {
                    let c = cell::parse_index_interior_cell(page, off, self.usable_page_size, page_number)?;
                    let local = &page[c.payload.local_range.0..c.payload.local_range.1];
                    local >= *k
                }
                _ => return Err(Error::OutOfRange("seek key type does not match b-tree variant".to_string())),
            };
            if ge {
                hi = mid;
            } else {
                lo = mid + 1;
            }
        }
        if lo < header.cell_count {
            let off = cell::read_cell_pointer(page, array_start, lo, page_number)?;
            let child_page = if self.is_table_btree {
                cell::parse_table_interior_cell(page, off, page_number)?.child_page
            } else {
                cell::parse_index_interior_cell(page, off, self.usable_page_size, page_number)?.child_page
            };
            if let Some(frame) = self.stack.last_mut() {
                frame.last_cell_visited = lo as i32;
            }
            Ok(child_page)
        } else {
            if let Some(frame) = self.stack.last_mut() {
                frame.last_cell_visited = header.cell_count as i32;
            }
            header.right_child.ok_or_else(|| Error::CorruptPage {
                page: page_number,
                reason: "interior page missing right child pointer".to_string(),
            })
        }
    }

    fn seek_within_leaf(&mut self, page_number: PageNum, header: &PageHeader, key: &Key<'_>, exact: bool) -> Result<bool> {
        let page_start = if page_number == 1 { crate::header::HEADER_BYTES } else { 0 };
        let array_start = header.cell_pointer_array_start(page_start);
        let cell_count = header.cell_count;
        if cell_count == 0 {
            self.state = State::Exhausted;
            self.current = None;
            return Ok(false);
        }
        let page = self.source.get_page(page_number)?;
        let mut lo: u16 = 0;
        let mut hi: u16 = cell_count;
        let mut exact_hit = false;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let off = cell::read_cell_pointer(page, array_start, mid, page_number)?;
            let cmp = match (self.is_table_btree, key) {
                (true, Key::RowId(k)) => {
                    let c = cell::parse_table_leaf_cell(page, off, self.usable_page_size, page_number)?;
                    if exact && c.rowid == *k {
                        exact_hit = true;
                    }
                    c.rowid.cmp(k)
                }
                (false, Key::Bytes(k)) => {
                    let c = cell::parse_index_leaf_cell(page, off, self.usable_page_size, page_number)?;
                    let local = &page[c.payload.local_range.0..c.payload.local_range.1];
                    if exact && local == *k && c.payload.overflow_page.is_none() {
                        exact_hit = true;
                    }
                    local.cmp(k)
                }
                _ => return Err(Error::OutOfRange("seek key type does not match b-tree variant".to_string())),
            };
            if cmp == std::cmp::Ordering::Less {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }

        if exact && !exact_hit {
            if let Some(frame) = self.stack.last_mut() {
                frame.last_cell_visited = lo as i32 - 1;
            }
            self.state = State::BetweenPages;
            self.current = None;
            // `lo` is the leftmost cell whose key is > the seek key (or
            // `cell_count` if none qualifies); advance onto it the same way
            // a near seek does, so a miss still lands on the next-greater
            // row instead of leaving the caller to call move_next() itself.
            return self.advance_to_next_cell().map(|_| false);
        }
        if lo >= cell_count {
            if let Some(frame) = self.stack.last_mut() {
                frame.last_cell_visited = lo as i32 - 1;
            }
            self.state = State::BetweenPages;
            self.current = None;
            // Sequential advance will cross to the next leaf, per spec
            // "Seek before/past" edge cases.
            return self.advance_to_next_cell().map(|_| false);
        }
        self.position_at_cell(page_number, header, lo)?;
        Ok(exact_hit)
    }

    fn position_at_cell(&mut self, page_number: PageNum, header: &PageHeader, cell_index: u16) -> Result<()> {
        let page_start = if page_number == 1 { crate::header::HEADER_BYTES } else { 0 };
        let array_start = header.cell_pointer_array_start(page_start);
        let off = {
            let page = self.source.get_page(page_number)?;
            cell::read_cell_pointer(page, array_start, cell_index, page_number)?
        };
        let rowid;
        let payload;
        {
            let page = self.source.get_page(page_number)?;
            if self.is_table_btree {
                let c = cell::parse_table_leaf_cell(page, off, self.usable_page_size, page_number)?;
                rowid = c.rowid;
                payload = c.payload;
            } else {
                let c = cell::parse_index_leaf_cell(page, off, self.usable_page_size, page_number)?;
                rowid = 0;
                payload = c.payload;
            }
        }
        // Reclaim the outgoing row's assembled-payload buffer as scratch
        // before building the new one, so a prepared reader doing repeated
        // point lookups reuses the same heap allocation row after row.
        if let Some(old) = self.current.take() {
            self.payload_scratch = old.assembled;
        }
        let assembled = self.assemble_payload(page_number, &payload)?;
        let columns = record::parse_header(&assembled, page_number)?;
        let (leaf_min_rowid, leaf_max_rowid) = self.leaf_rowid_range(page_number, header)?;
        if let Some(frame) = self.stack.last_mut() {
            frame.last_cell_visited = cell_index as i32;
        }
        self.current = Some(PositionedRow {
            page: page_number,
            rowid,
            payload,
            assembled,
            columns,
            leaf_min_rowid,
            leaf_max_rowid,
        });
        self.state = State::Positioned;
        Ok(())
    }

    fn leaf_rowid_range(&mut self, page_number: PageNum, header: &PageHeader) -> Result<(RowId, RowId)> {
        if !self.is_table_btree || header.cell_count == 0 {
            return Ok((RowId::MIN, RowId::MAX));
        }
        let page_start = if page_number == 1 { crate::header::HEADER_BYTES } else { 0 };
        let array_start = header.cell_pointer_array_start(page_start);
        let page = self.source.get_page(page_number)?;
        let first_off = cell::read_cell_pointer(page, array_start, 0, page_number)?;
        let last_off = cell::read_cell_pointer(page, array_start, header.cell_count - 1, page_number)?;
        let first = cell::parse_table_leaf_cell(page, first_off, self.usable_page_size, page_number)?;
        let last = cell::parse_table_leaf_cell(page, last_off, self.usable_page_size, page_number)?;
        Ok((first.rowid, last.rowid))
    }

    /// Fills a reused scratch buffer with the cell's full logical payload
    /// (local bytes plus, if any, its overflow chain), rather than
    /// allocating a fresh `Vec` per row.
    fn assemble_payload(&mut self, page_number: PageNum, payload: &PayloadLocation) -> Result<Vec<u8>> {
        let mut buf = std::mem::take(&mut self.payload_scratch);
        buf.clear();
        {
            let page = self.source.get_page(page_number)?;
            buf.extend_from_slice(&page[payload.local_range.0..payload.local_range.1]);
        }
        if payload.overflow_page.is_some() {
            let usable_page_size = self.usable_page_size;
            let source = &mut self.source;
            cell::assemble_overflow_payload(&mut buf, payload, usable_page_size, |pn| source.get_page(pn))?;
        }
        Ok(buf)
    }

    /// Implements spec §4.4's three-tier seek: same-rowid, same-leaf-range,
    /// full descent. Only meaningful for table b-trees; index b-trees seek
    /// via `seek_bytes`.
    pub fn seek(&mut self, rowid: RowId) -> Result<bool> {
        if !self.is_table_btree {
            return Err(Error::OutOfRange("seek(rowid) called on an index b-tree".to_string()));
        }
        if self.state == State::Disposed {
            return Err(Error::InvalidState("cursor is disposed".to_string()));
        }
        self.check_stale_snapshot();

        if self.last_seek_rowid == Some(rowid) {
            if let Some(row) = &self.current {
                if row.rowid == rowid && self.state == State::Positioned {
                    trace!("cursor seek: same-rowid fast path for {rowid}");
                    return Ok(true);
                }
            }
        }

        if let Some(row) = &self.current {
            if rowid >= row.leaf_min_rowid && rowid <= row.leaf_max_rowid {
                trace!("cursor seek: same-leaf fast path for {rowid}");
                let page_number = row.page;
                let header = self.load_header(page_number)?;
                let found = self.seek_within_leaf(page_number, &header, &Key::RowId(rowid), true)?;
                self.last_seek_rowid = Some(rowid);
                return Ok(found);
            }
        }

        trace!("cursor seek: full descent for {rowid}");
        let found = self.descend(&Key::RowId(rowid), true)?;
        self.last_seek_rowid = Some(rowid);
        Ok(found)
    }

    pub fn seek_bytes(&mut self, key: &[u8]) -> Result<bool> {
        if self.is_table_btree {
            return Err(Error::OutOfRange("seek_bytes called on a table b-tree".to_string()));
        }
        if self.state == State::Disposed {
            return Err(Error::InvalidState("cursor is disposed".to_string()));
        }
        self.check_stale_snapshot();
        self.descend(&Key::Bytes(key), true)
    }

    /// Advances to the next cell, crossing leaf boundaries via the ancestor
    /// stack as needed (spec §4.4 "Sequential MoveNext").
    pub fn move_next(&mut self) -> Result<bool> {
        if self.state == State::Disposed {
            return Err(Error::InvalidState("cursor is disposed".to_string()));
        }
        self.check_stale_snapshot();

        match self.state {
            State::Fresh => {
                let any_rows = self.descend_to_first_leaf()?;
                if !any_rows {
                    self.state = State::Exhausted;
                    return Ok(false);
                }
                Ok(true)
            }
            State::Exhausted => Ok(false),
            State::Positioned | State::BetweenPages => self.advance_to_next_cell(),
        }
    }

    fn descend_to_first_leaf(&mut self) -> Result<bool> {
        self.stack.clear();
        let mut page_number = self.root_page;
        loop {
            let header = self.load_header(page_number)?;
            self.stack.push(Frame {
                page: page_number,
                last_cell_visited: -1,
                cell_count: header.cell_count,
                right_child: header.right_child,
            });
            if header.kind.is_leaf() {
                if header.cell_count == 0 {
                    return Ok(false);
                }
                self.position_at_cell(page_number, &header, 0)?;
                return Ok(true);
            }
            page_number = self.leftmost_child(page_number, &header)?;
        }
    }

    fn leftmost_child(&mut self, page_number: PageNum, header: &PageHeader) -> Result<PageNum> {
        if header.cell_count == 0 {
            if let Some(frame) = self.stack.last_mut() {
                frame.last_cell_visited = 0;
            }
            return header.right_child.ok_or_else(|| Error::CorruptPage {
                page: page_number,
                reason: "interior page with no cells and no right child".to_string(),
            });
        }
        let page_start = if page_number == 1 { crate::header::HEADER_BYTES } else { 0 };
        let array_start = header.cell_pointer_array_start(page_start);
        let off = {
            let page = self.source.get_page(page_number)?;
            cell::read_cell_pointer(page, array_start, 0, page_number)?
        };
        let page = self.source.get_page(page_number)?;
        let child = if self.is_table_btree {
            cell::parse_table_interior_cell(page, off, page_number)?.child_page
        } else {
            cell::parse_index_interior_cell(page, off, self.usable_page_size, page_number)?.child_page
        };
        if let Some(frame) = self.stack.last_mut() {
            frame.last_cell_visited = 0;
        }
        Ok(child)
    }

    fn advance_to_next_cell(&mut self) -> Result<bool> {
        let page_number = match self.stack.last() {
            Some(frame) => frame.page,
            None => {
                self.state = State::Exhausted;
                self.current = None;
                return Ok(false);
            }
        };
        let header = self.load_header(page_number)?;
        let current_index = self.stack.last().unwrap().last_cell_visited;
        let next_index = current_index + 1;
        if next_index < header.cell_count as i32 {
            self.position_at_cell(page_number, &header, next_index as u16)?;
            return Ok(true);
        }

        // This leaf (or this page's cell list) is exhausted. Walk back up
        // the ancestor stack looking for a frame with an unvisited child
        // (spec §4.4: "walk back up... until last_visited + 1 <= cell_count
        // (including the right-child slot)").
        loop {
            self.stack.pop();
            let Some(frame) = self.stack.last_mut() else {
                self.state = State::Exhausted;
                self.current = None;
                return Ok(false);
            };
            let next = frame.last_cell_visited + 1;
            if next <= frame.cell_count as i32 {
                let parent_page = frame.page;
                let parent_header = self.load_header(parent_page)?;
                let child = if next == frame.cell_count as i32 {
                    frame.last_cell_visited = next;
                    frame.right_child.ok_or_else(|| Error::CorruptPage {
                        page: parent_page,
                        reason: "interior page missing right child pointer".to_string(),
                    })?
                } else {
                    let page_start = if parent_page == 1 { crate::header::HEADER_BYTES } else { 0 };
                    let array_start = parent_header.cell_pointer_array_start(page_start);
                    let off = {
                        let page = self.source.get_page(parent_page)?;
                        cell::read_cell_pointer(page, array_start, next as u16, parent_page)?
                    };
                    frame.last_cell_visited = next;
                    let page = self.source.get_page(parent_page)?;
                    if self.is_table_btree {
                        cell::parse_table_interior_cell(page, off, parent_page)?.child_page
                    } else {
                        cell::parse_index_interior_cell(page, off, self.usable_page_size, parent_page)?.child_page
                    }
                };
                return self.descend_leftmost_from(child);
            }
        }
    }

    fn descend_leftmost_from(&mut self, mut page_number: PageNum) -> Result<bool> {
        loop {
            let header = self.load_header(page_number)?;
            self.stack.push(Frame {
                page: page_number,
                last_cell_visited: -1,
                cell_count: header.cell_count,
                right_child: header.right_child,
            });
            if header.kind.is_leaf() {
                if header.cell_count == 0 {
                    return self.advance_to_next_cell();
                }
                self.position_at_cell(page_number, &header, 0)?;
                return Ok(true);
            }
            page_number = self.leftmost_child(page_number, &header)?;
        }
    }
}
