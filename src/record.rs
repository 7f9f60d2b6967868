//! The record decoder: header-length varint, per-column serial-type
//! varints, and the column byte offsets they imply. Grounded on the
//! teacher's `record.rs` (`HeaderIterator`/`ValueIterator`), replaced with a
//! single lazy `Record` that remembers each column's byte offset on first
//! parse and only decodes a column's bytes when an accessor actually asks
//! for it (spec §4.3 "lazy mode").

use crate::error::{Error, Result};
use crate::page::PageNum;
use crate::serial_type;
use crate::value::Value;
use crate::varint;

/// One column's serial type and payload offset/length, as found while
/// walking the record header. Cheap to cache: `Copy`, no borrowed data.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ColumnSlot {
    serial_type: i64,
    offset: usize,
    len: usize,
}

/// Walks the record header (header-length varint, then one serial-type
/// varint per column) and returns the offset/length table it implies. Split
/// out from `Record` so a cursor can compute this once per row and cache
/// the result on `PositionedRow`, instead of re-walking the header on every
/// column access (spec §4.3 "lazy mode" only defers *decoding*, not the
/// header walk itself).
pub(crate) fn parse_header(payload: &[u8], page_number: PageNum) -> Result<Vec<ColumnSlot>> {
    let corrupt = |reason: String| Error::CorruptPage {
        page: page_number,
        reason,
    };
    let (header_len, n) = varint::read(payload).map_err(|_| corrupt("truncated record header length varint".to_string()))?;
    if header_len < 0 || header_len as usize > payload.len() {
        return Err(corrupt("record header length runs past payload".to_string()));
    }
    let header_len = header_len as usize;
    let mut columns = Vec::new();
    let mut cursor = n;
    let mut body_offset = header_len;
    while cursor < header_len {
        let slice = payload
            .get(cursor..)
            .ok_or_else(|| corrupt("serial type varint past header end".to_string()))?;
        let (serial_type, consumed) = varint::read(slice).map_err(|_| corrupt("truncated serial type varint".to_string()))?;
        let size = serial_type::content_size(serial_type)
            .map_err(|e| corrupt(format!("bad serial type in record header: {e}")))?;
        if body_offset + size > payload.len() {
            return Err(corrupt("column body runs past end of payload".to_string()));
        }
        columns.push(ColumnSlot {
            serial_type,
            offset: body_offset,
            len: size,
        });
        body_offset += size;
        cursor += consumed;
    }
    if cursor != header_len {
        return Err(corrupt("serial type list did not exactly fill header length".to_string()));
    }
    Ok(columns)
}

/// Decodes column `i` of a record whose header has already been walked into
/// `columns` (via `parse_header`). A request past the stored column count
/// yields `Value::Null` -- spec §4.3 point 4, "missing trailing columns are
/// reported as NULL". A request at a negative or absurd index is the
/// caller's bug and is rejected as `OutOfRange` by the cursor layer before
/// it reaches here.
pub(crate) fn decode_column<'a>(payload: &'a [u8], columns: &[ColumnSlot], i: usize, page_number: PageNum) -> Result<Value<'a>> {
    match columns.get(i) {
        None => Ok(Value::Null),
        Some(slot) => {
            let bytes = payload.get(slot.offset..slot.offset + slot.len).ok_or_else(|| Error::CorruptPage {
                page: page_number,
                reason: "column slot out of bounds (internal invariant violated)".to_string(),
            })?;
            serial_type::decode(slot.serial_type, bytes).map_err(|e| Error::CorruptPage {
                page: page_number,
                reason: e.to_string(),
            })
        }
    }
}

/// A parsed record header: one serial type and payload offset/length per
/// column, plus the payload slice the offsets are relative to. Convenience
/// wrapper around `parse_header`/`decode_column` for one-shot callers that
/// don't need to cache the column table across repeated accesses.
pub struct Record<'a> {
    payload: &'a [u8],
    columns: Vec<ColumnSlot>,
}

impl<'a> Record<'a> {
    /// Parses the record header out of `payload` (the full, already
    /// overflow-assembled row body). `page_number` is only used to label
    /// errors; `payload` need not literally live on that page once overflow
    /// assembly has copied bytes out.
    pub fn parse(payload: &'a [u8], page_number: PageNum) -> Result<Self> {
        let columns = parse_header(payload, page_number)?;
        Ok(Record { payload, columns })
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn column(&self, i: usize, page_number: PageNum) -> Result<Value<'a>> {
        decode_column(self.payload, &self.columns, i, page_number)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::varint::write as vwrite;

    fn build_record(values: &[(i64, Vec<u8>)]) -> Vec<u8> {
        // values: (serial_type, body bytes)
        let mut header = Vec::new();
        let mut body = Vec::new();
        for (st, bytes) in values {
            header.extend(vwrite(*st));
            body.extend_from_slice(bytes);
        }
        let header_len_field_guess = header.len() + 1; // +1 for the header-length varint itself, assuming 1 byte
        let mut record = Vec::new();
        record.extend(vwrite(header_len_field_guess as i64));
        record.extend(header);
        record.extend(body);
        record
    }

    #[test]
    fn parses_int_and_text_columns() {
        let record = build_record(&[(1, vec![42]), (19, b"Ten".to_vec())]);
        let r = Record::parse(&record, 1).unwrap();
        assert_eq!(r.column_count(), 2);
        assert_eq!(r.column(0, 1).unwrap(), Value::Int(42));
        match r.column(1, 1).unwrap() {
            Value::Text(t) => assert_eq!(t, b"Ten"),
            other => panic!("expected text, got {other:?}"),
        }
    }

    #[test]
    fn missing_trailing_column_is_null() {
        let record = build_record(&[(1, vec![7])]);
        let r = Record::parse(&record, 1).unwrap();
        assert_eq!(r.column(5, 1).unwrap(), Value::Null);
    }

    #[test]
    fn truncated_header_length_errors() {
        assert!(Record::parse(&[0x80, 0x80], 1).is_err());
    }

    #[test]
    fn bad_serial_type_is_corrupt_page_with_page_number() {
        // header_len=2 (self + one serial type byte), serial type = 10 (reserved)
        let record = vec![2u8, 10];
        let err = Record::parse(&record, 9).unwrap_err();
        match err {
            Error::CorruptPage { page, .. } => assert_eq!(page, 9),
            other => panic!("expected CorruptPage, got {other:?}"),
        }
    }
}
