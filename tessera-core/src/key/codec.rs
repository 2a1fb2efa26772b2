//! Order-preserving encoding of key dimensions
//!
//! Each dimension is encoded as a presence marker followed by a payload:
//!
//! - nil: `0x00` and no payload
//! - int32: `0x01`, big-endian `u32` with the sign bit flipped
//! - int64 / datetime: `0x01`, big-endian `u64` with the sign bit flipped
//!   (datetimes as microseconds since the Unix epoch)
//! - utf8: `0x01`, raw bytes with `0x00` escaped as `0x00 0xFF`, then `0x00 0x00`
//!
//! Every part is prefix-free, so complementing all bytes of a part reverses
//! its order. That is how descending dimensions are stored.

use crate::schema::{DimensionDesc, KeyType, SortOrder};
use crate::types::datetime_from_micros;
use crate::{Datum, Result, TesseraError};

const MARKER_NIL: u8 = 0x00;
const MARKER_VALUE: u8 = 0x01;

const ESCAPE: u8 = 0x00;
const ESCAPED_ZERO: u8 = 0xFF;
const TERMINATOR: u8 = 0x00;

/// Append the encoding of `value` for one dimension
pub fn encode_part(buf: &mut Vec<u8>, desc: &DimensionDesc, value: &Datum) -> Result<()> {
    let start = buf.len();

    if value.is_nil() {
        buf.push(MARKER_NIL);
    } else {
        buf.push(MARKER_VALUE);
        match desc.key_type {
            KeyType::Int32 => {
                let v = value
                    .as_i64()
                    .and_then(|v| i32::try_from(v).ok())
                    .ok_or_else(|| invalid(desc, value))?;
                buf.extend_from_slice(&((v as u32) ^ (1u32 << 31)).to_be_bytes());
            }
            KeyType::Int64 => {
                let v = value.as_i64().ok_or_else(|| invalid(desc, value))?;
                encode_i64(buf, v);
            }
            KeyType::DateTime => {
                let dt = value.as_datetime().ok_or_else(|| invalid(desc, value))?;
                encode_i64(buf, dt.timestamp_micros());
            }
            KeyType::Utf8 | KeyType::ListUtf8 => {
                let s = match value {
                    Datum::String(s) => s.clone(),
                    Datum::Int32(_) | Datum::Int64(_) | Datum::BigInt(_) => value.to_string(),
                    _ => return Err(invalid(desc, value)),
                };
                for &b in s.as_bytes() {
                    if b == ESCAPE {
                        buf.extend_from_slice(&[ESCAPE, ESCAPED_ZERO]);
                    } else {
                        buf.push(b);
                    }
                }
                buf.extend_from_slice(&[ESCAPE, TERMINATOR]);
            }
        }
    }

    if desc.sort == SortOrder::Descending {
        for b in &mut buf[start..] {
            *b = !*b;
        }
    }
    Ok(())
}

fn encode_i64(buf: &mut Vec<u8>, v: i64) {
    buf.extend_from_slice(&((v as u64) ^ (1u64 << 63)).to_be_bytes());
}

fn invalid(desc: &DimensionDesc, value: &Datum) -> TesseraError {
    TesseraError::InvalidKey(format!(
        "{:?} value cannot be used as a {} key",
        value.basic_type(),
        desc.key_type
    ))
}

/// Decode one dimension starting at `pos`. Returns the value and the
/// position just past the part.
pub fn decode_part(bytes: &[u8], pos: usize, desc: &DimensionDesc) -> Result<(Datum, usize)> {
    let flip = if desc.sort == SortOrder::Descending { 0xFF } else { 0x00 };
    let byte_at = |i: usize| -> Result<u8> {
        bytes
            .get(i)
            .map(|b| b ^ flip)
            .ok_or_else(|| TesseraError::InvalidKey("truncated key".into()))
    };

    match byte_at(pos)? {
        MARKER_NIL => return Ok((Datum::Nil, pos + 1)),
        MARKER_VALUE => {}
        other => {
            return Err(TesseraError::InvalidKey(format!(
                "invalid presence marker {:#04x}",
                other
            )))
        }
    }

    let mut pos = pos + 1;
    match desc.key_type {
        KeyType::Int32 => {
            let mut raw = [0u8; 4];
            for (i, b) in raw.iter_mut().enumerate() {
                *b = byte_at(pos + i)?;
            }
            let v = (u32::from_be_bytes(raw) ^ (1u32 << 31)) as i32;
            Ok((Datum::Int32(v), pos + 4))
        }
        KeyType::Int64 | KeyType::DateTime => {
            let mut raw = [0u8; 8];
            for (i, b) in raw.iter_mut().enumerate() {
                *b = byte_at(pos + i)?;
            }
            let v = (u64::from_be_bytes(raw) ^ (1u64 << 63)) as i64;
            if desc.key_type == KeyType::Int64 {
                Ok((Datum::Int64(v), pos + 8))
            } else {
                let dt = datetime_from_micros(v)
                    .ok_or_else(|| TesseraError::InvalidKey(format!("datetime out of range: {}", v)))?;
                Ok((Datum::DateTime(dt), pos + 8))
            }
        }
        KeyType::Utf8 | KeyType::ListUtf8 => {
            let mut out = Vec::new();
            loop {
                let b = byte_at(pos)?;
                pos += 1;
                if b != ESCAPE {
                    out.push(b);
                    continue;
                }
                match byte_at(pos)? {
                    TERMINATOR => {
                        pos += 1;
                        break;
                    }
                    ESCAPED_ZERO => {
                        out.push(0);
                        pos += 1;
                    }
                    other => {
                        return Err(TesseraError::InvalidKey(format!(
                            "invalid string escape {:#04x}",
                            other
                        )))
                    }
                }
            }
            let s = String::from_utf8(out)
                .map_err(|e| TesseraError::InvalidKey(format!("key is not utf8: {}", e)))?;
            Ok((Datum::String(s), pos))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(desc: DimensionDesc, value: Datum) -> Vec<u8> {
        let mut buf = Vec::new();
        encode_part(&mut buf, &desc, &value).unwrap();
        buf
    }

    #[test]
    fn test_integer_order() {
        let desc = DimensionDesc::new(KeyType::Int32);
        let values = [i32::MIN, -5, -1, 0, 1, 42, i32::MAX];
        let encoded: Vec<_> = values.iter().map(|v| encode(desc, Datum::Int32(*v))).collect();
        assert!(encoded.windows(2).all(|w| w[0] < w[1]));

        let desc = DimensionDesc::new(KeyType::Int64);
        assert!(encode(desc, Datum::Int64(-1)) < encode(desc, Datum::Int64(0)));
        assert!(encode(desc, Datum::Nil) < encode(desc, Datum::Int64(i64::MIN)));
    }

    #[test]
    fn test_string_order_and_escaping() {
        let desc = DimensionDesc::new(KeyType::Utf8);
        let values = ["", "a", "a\0", "a\0b", "ab", "b"];
        let encoded: Vec<_> = values.iter().map(|v| encode(desc, Datum::from(*v))).collect();
        assert!(encoded.windows(2).all(|w| w[0] < w[1]));

        for (value, bytes) in values.iter().zip(&encoded) {
            let (decoded, end) = decode_part(bytes, 0, &desc).unwrap();
            assert_eq!(decoded, Datum::from(*value));
            assert_eq!(end, bytes.len());
        }
    }

    #[test]
    fn test_descending_reverses_order() {
        let desc = DimensionDesc::descending(KeyType::Utf8);
        assert!(encode(desc, Datum::from("b")) < encode(desc, Datum::from("a")));
        assert!(encode(desc, Datum::from("ab")) < encode(desc, Datum::from("a")));

        let desc = DimensionDesc::descending(KeyType::Int32);
        let bytes = encode(desc, Datum::Int32(-7));
        assert_eq!(decode_part(&bytes, 0, &desc).unwrap().0, Datum::Int32(-7));
        assert!(encode(desc, Datum::Int32(10)) < encode(desc, Datum::Int32(9)));
    }

    #[test]
    fn test_datetime() {
        let desc = DimensionDesc::new(KeyType::DateTime);
        let dt = Datum::from("2024-03-01T12:00:00.000250Z").as_datetime().unwrap();
        let bytes = encode(desc, Datum::DateTime(dt));
        assert_eq!(bytes.len(), 9);
        assert_eq!(decode_part(&bytes, 0, &desc).unwrap().0, Datum::DateTime(dt));
    }

    #[test]
    fn test_rejects_wrong_types() {
        let mut buf = Vec::new();
        let int32 = DimensionDesc::new(KeyType::Int32);
        assert!(encode_part(&mut buf, &int32, &Datum::from("x")).is_err());
        assert!(encode_part(&mut buf, &int32, &Datum::Int64(1 << 40)).is_err());
        assert!(decode_part(&[0x01, 0x80], 0, &int32).is_err());
        assert!(decode_part(&[0x07], 0, &int32).is_err());
    }
}
