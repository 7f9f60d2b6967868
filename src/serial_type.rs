//! Serial types are how SQLite tags the storage class and byte width of a
//! single column value inside a record body. See
//! <https://www.sqlite.org/fileformat.html#record_format>.

use byteorder::{BigEndian, ReadBytesExt};
use std::io::Cursor;

use crate::error::{Error, Result};
use crate::value::Value;

/// Number of payload bytes a serial type occupies, independent of the
/// bytes themselves. Serial types 8 and 9 ("literal 0"/"literal 1") and 0
/// (NULL) consume zero bytes -- the value is implicit in the type code.
pub fn content_size(serial_type: i64) -> Result<usize> {
    Ok(match serial_type {
        0 => 0,
        1 => 1,
        2 => 2,
        3 => 3,
        4 => 4,
        5 => 6,
        6 | 7 => 8,
        8 | 9 => 0,
        10 | 11 => {
            return Err(Error::InvalidState(
                "reserved serial type 10/11 in record".to_string(),
            ))
        }
        x if x >= 12 && x % 2 == 0 => ((x - 12) / 2) as usize,
        x if x >= 13 => ((x - 13) / 2) as usize,
        _ => {
            return Err(Error::InvalidState(format!(
                "negative serial type {serial_type}"
            )))
        }
    })
}

/// Decodes the value for `serial_type` out of `data`, which must be at
/// least `content_size(serial_type)` bytes long. `Text`/`Blob` values
/// borrow `data` directly -- no copy is made here.
///
/// `text_encoding` selects how TEXT bytes are interpreted; only UTF-8 is
/// decoded to a checked string by callers -- this function just hands back
/// the raw bytes and lets the caller decide, since column accessors return
/// borrowed byte slices rather than owned `String`s (see `value::Value`).
pub fn decode<'a>(serial_type: i64, data: &'a [u8]) -> Result<Value<'a>> {
    let size = content_size(serial_type)?;
    if data.len() < size {
        return Err(Error::InvalidState(
            "serial type content runs past payload".to_string(),
        ));
    }
    let mut c = Cursor::new(&data[..size]);
    Ok(match serial_type {
        0 => Value::Null,
        1 => Value::Int(c.read_i8()? as i64),
        2 => Value::Int(c.read_i16::<BigEndian>()? as i64),
        3 => Value::Int(read_i24(&mut c)?),
        4 => Value::Int(c.read_i32::<BigEndian>()? as i64),
        5 => Value::Int(read_i48(&mut c)?),
        6 => Value::Int(c.read_i64::<BigEndian>()?),
        7 => Value::Real(c.read_f64::<BigEndian>()?),
        8 => Value::Int(0),
        9 => Value::Int(1),
        x if x >= 12 && x % 2 == 0 => Value::Blob(&data[..size]),
        x if x >= 13 => Value::Text(&data[..size]),
        _ => unreachable!("content_size would have rejected this serial type"),
    })
}

fn read_i24<R: std::io::Read>(r: &mut R) -> Result<i64> {
    let mut bytes = [0u8; 4];
    r.read_exact(&mut bytes[1..])?;
    bytes[0] = if bytes[1] & 0x80 != 0 { 0xff } else { 0x00 };
    Ok(i32::from_be_bytes(bytes) as i64)
}

fn read_i48<R: std::io::Read>(r: &mut R) -> Result<i64> {
    let mut bytes = [0u8; 8];
    r.read_exact(&mut bytes[2..])?;
    bytes[0] = if bytes[2] & 0x80 != 0 { 0xff } else { 0x00 };
    bytes[1] = bytes[0];
    Ok(i64::from_be_bytes(bytes))
}
