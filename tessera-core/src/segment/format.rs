//! On-disk segment layout
//!
//! ```text
//! +----------------------+  offset 0
//! | header (64 bytes)    |
//! +----------------------+
//! | block 0              |
//! | block 1              |
//! | ...                  |
//! +----------------------+  index_offset
//! | index entries        |  16 bytes each
//! | first keys           |  len u32 + bytes, one per block
//! +----------------------+  index_offset + index_size
//! ```
//!
//! A block is `size u32, row_count u32`, then one entry per row
//! (`key_offset u32, value_offset u32` and `row_id u64` when the segment
//! stores row ids), then the keys and the values, each `len u32` + bytes.
//! Offsets inside a block are relative to the block start. All integers
//! are little-endian.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{Result, RowId, TesseraError};

/// Segment file signature, `AEOS`
pub const SIGNATURE: u32 = u32::from_le_bytes(*b"AEOS");

/// Current segment format version
pub const FORMAT_VERSION: u32 = 1;

pub const HEADER_SIZE: usize = 64;
pub const INDEX_ENTRY_SIZE: usize = 16;
pub const BLOCK_HEADER_SIZE: usize = 8;

/// The segment belongs to a secondary view
pub const FLAG_SECONDARY_VIEW: u32 = 0x0000_0001;
/// Block entries carry a row id
pub const FLAG_HAS_ROW_ID: u32 = 0x0000_0002;

/// Segment file header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SegmentHeader {
    pub version: u32,
    pub sequence: u64,
    pub index_count: u32,
    pub index_offset: u32,
    pub index_size: u32,
    pub row_count: u32,
    pub view_id: u32,
    pub flags: u32,
}

impl SegmentHeader {
    pub fn has_row_id(&self) -> bool {
        self.flags & FLAG_HAS_ROW_ID != 0
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE);
        buf.put_u32_le(SIGNATURE);
        buf.put_u32_le(self.version);
        buf.put_u64_le(self.sequence);
        buf.put_u32_le(self.index_count);
        buf.put_u32_le(self.index_offset);
        buf.put_u32_le(self.index_size);
        buf.put_u32_le(self.row_count);
        buf.put_u32_le(self.view_id);
        buf.put_u32_le(self.flags);
        buf.put_bytes(0, HEADER_SIZE - buf.len());
        buf.freeze()
    }

    pub fn decode(mut data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(TesseraError::corruption("segment header truncated"));
        }
        if data.get_u32_le() != SIGNATURE {
            return Err(TesseraError::corruption("invalid segment signature"));
        }
        let version = data.get_u32_le();
        if version != FORMAT_VERSION {
            return Err(TesseraError::InvalidFormat(format!(
                "unsupported segment version: {}",
                version
            )));
        }
        Ok(Self {
            version,
            sequence: data.get_u64_le(),
            index_count: data.get_u32_le(),
            index_offset: data.get_u32_le(),
            index_size: data.get_u32_le(),
            row_count: data.get_u32_le(),
            view_id: data.get_u32_le(),
            flags: data.get_u32_le(),
        })
    }
}

/// Block index entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    /// Offset of the block's first key (from start of file)
    pub key_offset: u32,
    /// Offset of the block (from start of file)
    pub block_offset: u32,
    pub block_size: u32,
    pub row_count: u32,
}

impl IndexEntry {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.key_offset);
        buf.put_u32_le(self.block_offset);
        buf.put_u32_le(self.block_size);
        buf.put_u32_le(self.row_count);
    }

    pub fn decode(data: &mut &[u8]) -> Self {
        Self {
            key_offset: data.get_u32_le(),
            block_offset: data.get_u32_le(),
            block_size: data.get_u32_le(),
            row_count: data.get_u32_le(),
        }
    }
}

/// One row as written into a block
pub struct BlockRow<'a> {
    pub key: &'a [u8],
    pub value: &'a [u8],
    pub row_id: RowId,
}

/// Bytes one row adds to a block
pub fn row_footprint(key_len: usize, value_len: usize, has_row_id: bool) -> usize {
    let entry = if has_row_id { 16 } else { 8 };
    entry + 4 + key_len + 4 + value_len
}

/// Size a block of these rows will occupy
pub fn block_size(rows: &[BlockRow<'_>], has_row_id: bool) -> usize {
    BLOCK_HEADER_SIZE
        + rows
            .iter()
            .map(|r| row_footprint(r.key.len(), r.value.len(), has_row_id))
            .sum::<usize>()
}

/// Serialize rows into a block
pub fn encode_block(rows: &[BlockRow<'_>], has_row_id: bool) -> Result<Bytes> {
    let size = block_size(rows, has_row_id);
    let size32 = u32::try_from(size)
        .map_err(|_| TesseraError::InvalidFormat(format!("block too large: {} bytes", size)))?;
    let entry = if has_row_id { 16 } else { 8 };

    let mut buf = BytesMut::with_capacity(size);
    buf.put_u32_le(size32);
    buf.put_u32_le(rows.len() as u32);

    let keys_start = BLOCK_HEADER_SIZE + rows.len() * entry;
    let values_start = keys_start + rows.iter().map(|r| 4 + r.key.len()).sum::<usize>();
    let mut key_offset = keys_start;
    let mut value_offset = values_start;
    for row in rows {
        buf.put_u32_le(key_offset as u32);
        buf.put_u32_le(value_offset as u32);
        if has_row_id {
            buf.put_u64_le(row.row_id);
        }
        key_offset += 4 + row.key.len();
        value_offset += 4 + row.value.len();
    }
    for row in rows {
        buf.put_u32_le(row.key.len() as u32);
        buf.put_slice(row.key);
    }
    for row in rows {
        buf.put_u32_le(row.value.len() as u32);
        buf.put_slice(row.value);
    }
    debug_assert_eq!(buf.len(), size);
    Ok(buf.freeze())
}

/// A loaded block with validated random access
#[derive(Debug, Clone)]
pub struct Block {
    data: Bytes,
    row_count: usize,
    has_row_id: bool,
}

impl Block {
    /// Wrap block bytes, checking the header against the expected shape
    pub fn parse(data: Bytes, expected_rows: u32, has_row_id: bool) -> Result<Self> {
        if data.len() < BLOCK_HEADER_SIZE {
            return Err(TesseraError::corruption("block shorter than its header"));
        }
        let mut header = &data[..BLOCK_HEADER_SIZE];
        let size = header.get_u32_le() as usize;
        let row_count = header.get_u32_le();
        if size != data.len() || row_count != expected_rows {
            return Err(TesseraError::corruption(format!(
                "block header mismatch: size {} (expected {}), rows {} (expected {})",
                size,
                data.len(),
                row_count,
                expected_rows
            )));
        }
        let entry = if has_row_id { 16 } else { 8 };
        if BLOCK_HEADER_SIZE + row_count as usize * entry > data.len() {
            return Err(TesseraError::corruption("block index exceeds block"));
        }
        Ok(Self {
            data,
            row_count: row_count as usize,
            has_row_id,
        })
    }

    pub fn row_count(&self) -> usize {
        self.row_count
    }

    fn entry(&self, index: usize) -> Result<&[u8]> {
        if index >= self.row_count {
            return Err(TesseraError::Internal(format!("block row {} out of range", index)));
        }
        let width = if self.has_row_id { 16 } else { 8 };
        let start = BLOCK_HEADER_SIZE + index * width;
        Ok(&self.data[start..start + width])
    }

    /// Length-prefixed item at `offset` inside the block
    fn item(&self, offset: usize) -> Result<Bytes> {
        let len_end = offset
            .checked_add(4)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| TesseraError::corruption(format!("block offset {} out of range", offset)))?;
        let len = (&self.data[offset..len_end]).get_u32_le() as usize;
        let end = len_end
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| TesseraError::corruption(format!("block item at {} overruns block", offset)))?;
        Ok(self.data.slice(len_end..end))
    }

    pub fn key(&self, index: usize) -> Result<Bytes> {
        let offset = (&self.entry(index)?[0..4]).get_u32_le() as usize;
        self.item(offset)
    }

    pub fn value(&self, index: usize) -> Result<Bytes> {
        let offset = (&self.entry(index)?[4..8]).get_u32_le() as usize;
        self.item(offset)
    }

    pub fn row_id(&self, index: usize) -> Result<RowId> {
        let entry = self.entry(index)?;
        if self.has_row_id {
            Ok((&entry[8..16]).get_u64_le())
        } else {
            Ok(0)
        }
    }

    /// Index of the first key `>= key` within the block
    pub fn lower_bound(&self, key: &[u8]) -> Result<usize> {
        let (mut lo, mut hi) = (0, self.row_count);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.key(mid)?.as_ref() < key {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        Ok(lo)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let header = SegmentHeader {
            version: FORMAT_VERSION,
            sequence: 0x0102_0304_0506_0708,
            index_count: 3,
            index_offset: 4096,
            index_size: 120,
            row_count: 77,
            view_id: 2,
            flags: FLAG_SECONDARY_VIEW | FLAG_HAS_ROW_ID,
        };
        let bytes = header.encode();
        assert_eq!(bytes.len(), HEADER_SIZE);
        assert_eq!(&bytes[0..4], b"AEOS");
        assert_eq!(&bytes[8..16], &0x0102_0304_0506_0708u64.to_le_bytes());
        assert_eq!(SegmentHeader::decode(&bytes).unwrap(), header);

        let mut bad = bytes.to_vec();
        bad[0] = b'X';
        assert!(SegmentHeader::decode(&bad).unwrap_err().is_corruption());
    }

    #[test]
    fn test_block_access() {
        let rows = [
            BlockRow { key: b"a", value: b"one", row_id: 10 },
            BlockRow { key: b"c", value: b"", row_id: 11 },
            BlockRow { key: b"e", value: b"three", row_id: 12 },
        ];
        let data = encode_block(&rows, true).unwrap();
        assert_eq!(data.len(), block_size(&rows, true));

        let block = Block::parse(data, 3, true).unwrap();
        assert_eq!(block.key(2).unwrap().as_ref(), b"e");
        assert_eq!(block.value(0).unwrap().as_ref(), b"one");
        assert!(block.value(1).unwrap().is_empty());
        assert_eq!(block.row_id(1).unwrap(), 11);
        assert_eq!(block.lower_bound(b"b").unwrap(), 1);
        assert_eq!(block.lower_bound(b"f").unwrap(), 3);
    }

    #[test]
    fn test_block_offsets_are_validated() {
        let rows = [BlockRow { key: b"k", value: b"v", row_id: 0 }];
        let mut data = encode_block(&rows, false).unwrap().to_vec();
        // point the key offset past the end of the block
        data[8..12].copy_from_slice(&1000u32.to_le_bytes());
        let block = Block::parse(Bytes::from(data), 1, false).unwrap();
        assert!(block.key(0).unwrap_err().is_corruption());

        let data = encode_block(&rows, false).unwrap();
        assert!(Block::parse(data.slice(..10), 1, false).is_err());
        assert!(Block::parse(data, 2, false).is_err());
    }
}
