//! SQLite's variable-length integer: 1-9 bytes, big-endian, signed 64-bit.
//!
//! Bytes 1-8 use the top bit as a continuation flag and carry 7 data bits
//! each; byte 9, if reached, contributes all 8 bits. See
//! <https://www.sqlite.org/fileformat.html#varint>.

use crate::error::{Error, Result};

/// Decodes a varint from the start of `data`.
///
/// Returns `(value, bytes_consumed)` with `1 <= bytes_consumed <= 9`.
/// Fails with `CorruptPage`-shaped truncation when `data` runs out before
/// the varint's continuation bits say it should.
pub fn read(data: &[u8]) -> Result<(i64, usize)> {
    let mut result: u64 = 0;
    for i in 0..8 {
        let byte = *data
            .get(i)
            .ok_or_else(|| Error::InvalidState("truncated varint".to_string()))?;
        result = (result << 7) | (byte & 0x7f) as u64;
        if byte & 0x80 == 0 {
            return Ok((result as i64, i + 1));
        }
    }
    // Ninth byte: all 8 bits contribute.
    let byte = *data
        .get(8)
        .ok_or_else(|| Error::InvalidState("truncated varint".to_string()))?;
    result = (result << 8) | byte as u64;
    Ok((result as i64, 9))
}

/// Encodes `value` as a varint. Used only by tests and by callers building
/// synthetic pages -- the core reader never writes.
pub fn write(value: i64) -> Vec<u8> {
    let v = value as u64;
    let len = varint_len(v);
    let mut out = Vec::with_capacity(len);
    if len == 9 {
        let high = v >> 8; // top 56 bits
        for i in (0..8).rev() {
            out.push((((high >> (7 * i)) & 0x7f) as u8) | 0x80);
        }
        out.push((v & 0xff) as u8);
    } else {
        for i in (0..len).rev() {
            let byte = ((v >> (7 * i)) & 0x7f) as u8;
            out.push(if i == 0 { byte } else { byte | 0x80 });
        }
    }
    out
}

fn varint_len(v: u64) -> usize {
    for len in 1..=8 {
        if v < (1u64 << (7 * len)) {
            return len;
        }
    }
    9
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_byte_roundtrip() {
        for x in [0_i64, 1, 63, 127] {
            let enc = write(x);
            assert!(enc.len() <= 9);
            let (val, n) = read(&enc).unwrap();
            assert_eq!(val, x);
            assert_eq!(n, enc.len());
        }
    }

    #[test]
    fn multi_byte_roundtrip() {
        for x in [128_i64, 300, 16384, 1 << 20, 1 << 40, i64::MAX, i64::MIN, -1, -128] {
            let enc = write(x);
            let (val, n) = read(&enc).unwrap();
            assert_eq!(val, x, "value {x} encoded as {enc:?}");
            assert_eq!(n, enc.len());
            assert!((1..=9).contains(&n));
        }
    }

    #[test]
    fn known_encoding_literal_one() {
        // A single-byte varint encoding decimal 9 (as used by a record
        // header's serial-type list for `literal 1`).
        let (val, n) = read(&[0x09]).unwrap();
        assert_eq!(val, 9);
        assert_eq!(n, 1);
    }

    #[test]
    fn nine_byte_form() {
        let bytes = [0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff];
        let (val, n) = read(&bytes).unwrap();
        assert_eq!(n, 9);
        assert_eq!(val, -1_i64);
    }

    #[test]
    fn truncated_varint_errors() {
        // Every byte says "continue" but the slice ends early.
        assert!(read(&[0x80, 0x80]).is_err());
        assert!(read(&[]).is_err());
    }
}
