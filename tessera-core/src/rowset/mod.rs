//! Ordered row sets
//!
//! Everything the row iterator can read implements [`OrderedRowSet`]: the
//! in-memory [`RowArray`] and on-disk segments. Rows are sorted by encoded
//! key and addressed by position.

mod array;

pub use array::RowArray;

use bytes::{BufMut, Bytes, BytesMut};
use std::io::Write;

use crate::key::RowKey;
use crate::{Datum, Result, RowId};

/// One row of an ordered row set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowEntry {
    pub key: RowKey,
    /// Serialized value; empty for a deleted row
    pub value: Bytes,
    pub row_id: RowId,
}

impl RowEntry {
    pub fn new(key: RowKey, value: Bytes, row_id: RowId) -> Self {
        Self { key, value, row_id }
    }

    /// True if this row is a deletion marker
    pub fn is_nil(&self) -> bool {
        self.value.is_empty()
    }

    /// Deserialize the value
    pub fn datum(&self) -> Result<Datum> {
        Datum::from_bytes(&self.value)
    }

    /// Bytes the row occupies when serialized
    pub fn size(&self) -> usize {
        self.key.len() + self.value.len() + std::mem::size_of::<RowId>()
    }
}

/// Read access to rows sorted by key
pub trait OrderedRowSet: Send + Sync {
    /// Number of rows
    fn count(&self) -> usize;

    /// Row at `index` in key order
    fn row(&self, index: usize) -> Result<RowEntry>;

    /// Index of the first row whose key is `>= key`
    fn lower_bound(&self, key: &[u8]) -> Result<usize>;

    fn key_bytes(&self, index: usize) -> Result<Vec<u8>> {
        Ok(self.row(index)?.key.into_bytes())
    }

    fn value_bytes(&self, index: usize) -> Result<Bytes> {
        Ok(self.row(index)?.value)
    }

    fn row_id(&self, index: usize) -> Result<RowId> {
        Ok(self.row(index)?.row_id)
    }

    fn row_size(&self, index: usize) -> Result<usize> {
        Ok(self.row(index)?.size())
    }

    /// Index of the row with exactly this key
    fn find_key(&self, key: &[u8]) -> Result<Option<usize>> {
        let index = self.lower_bound(key)?;
        if index < self.count() && self.key_bytes(index)? == key {
            Ok(Some(index))
        } else {
            Ok(None)
        }
    }

    /// Value and row id stored under this key
    fn find_data(&self, key: &[u8]) -> Result<Option<(Bytes, RowId)>> {
        match self.find_key(key)? {
            Some(index) => {
                let row = self.row(index)?;
                Ok(Some((row.value, row.row_id)))
            }
            None => Ok(None),
        }
    }

    /// Write the row as a length-prefixed record:
    /// `keyLen u32, key, valueLen u32, rowId u64, value` (little-endian)
    fn write_row(&self, out: &mut dyn Write, index: usize) -> Result<()> {
        let row = self.row(index)?;
        let mut buf = BytesMut::with_capacity(row.size() + 8);
        buf.put_u32_le(row.key.len() as u32);
        buf.put_slice(row.key.as_bytes());
        buf.put_u32_le((row.value.len() + 8) as u32);
        buf.put_u64_le(row.row_id);
        buf.put_slice(&row.value);
        out.write_all(&buf)?;
        Ok(())
    }
}
