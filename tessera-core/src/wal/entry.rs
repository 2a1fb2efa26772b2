//! Insert log records

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::RowId;

/// One logged insert
///
/// Format:
/// - 4 bytes: key length
/// - N bytes: encoded row key
/// - 4 bytes: value length (row id plus serialized value)
/// - 8 bytes: row id
/// - N bytes: serialized value (empty for a delete)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub key: Vec<u8>,
    pub row_id: RowId,
    pub value: Bytes,
}

impl LogRecord {
    pub fn new(key: &[u8], value: &[u8], row_id: RowId) -> Self {
        Self {
            key: key.to_vec(),
            row_id,
            value: Bytes::copy_from_slice(value),
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(16 + self.key.len() + self.value.len());
        buf.put_u32_le(self.key.len() as u32);
        buf.put_slice(&self.key);
        buf.put_u32_le((self.value.len() + 8) as u32);
        buf.put_u64_le(self.row_id);
        buf.put_slice(&self.value);
        buf.freeze()
    }

    /// Decode the record at the start of `data`. Returns `None` when the
    /// data ends before the record does.
    pub fn decode(data: &[u8]) -> Option<(Self, usize)> {
        let mut cursor = data;
        if cursor.remaining() < 4 {
            return None;
        }
        let key_len = cursor.get_u32_le() as usize;
        if cursor.remaining() < key_len + 4 {
            return None;
        }
        let key = cursor[..key_len].to_vec();
        cursor.advance(key_len);

        let value_len = cursor.get_u32_le() as usize;
        if value_len < 8 || cursor.remaining() < value_len {
            return None;
        }
        let row_id = cursor.get_u64_le();
        let value = Bytes::copy_from_slice(&cursor[..value_len - 8]);

        Some((Self { key, row_id, value }, 8 + key_len + value_len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_layout() {
        let record = LogRecord::new(b"key", b"value", 0x1122);
        let encoded = record.encode();
        assert_eq!(encoded.len(), 4 + 3 + 4 + 8 + 5);
        assert_eq!(&encoded[7..11], &13u32.to_le_bytes());

        let (decoded, used) = LogRecord::decode(&encoded).unwrap();
        assert_eq!(decoded, record);
        assert_eq!(used, encoded.len());
    }

    #[test]
    fn test_incomplete_record() {
        let encoded = LogRecord::new(b"key", b"value", 1).encode();
        for cut in [0, 3, 6, 10, encoded.len() - 1] {
            assert!(LogRecord::decode(&encoded[..cut]).is_none(), "cut at {}", cut);
        }
    }
}
