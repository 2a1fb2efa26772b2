//! Composite row keys
//!
//! A [`RowKey`] is the concatenation of one encoded part per dimension (see
//! [`codec`]). Byte order equals logical order, so keys compare with a plain
//! byte comparison and a key with fewer dimensions is a byte prefix of every
//! full key below it.

pub mod codec;
mod path;

use std::cmp::Ordering;
use std::fmt;

use crate::schema::Dimensions;
use crate::{Datum, Result, RowId, TesseraError};

/// An encoded, immutable row key
#[derive(Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RowKey {
    bytes: Vec<u8>,
    dims: usize,
}

impl RowKey {
    /// The empty key, a prefix of every key
    pub fn empty() -> Self {
        Self::default()
    }

    /// Encode values for the leading dimensions of `dims`. Fewer values than
    /// dimensions produce a partial key.
    pub fn encode(dims: &Dimensions, values: &[Datum]) -> Result<Self> {
        if values.len() > dims.len() {
            return Err(TesseraError::InvalidKey(format!(
                "key has {} values but only {} dimensions",
                values.len(),
                dims.len()
            )));
        }
        let mut bytes = Vec::with_capacity(values.len() * 9);
        for (desc, value) in dims.iter().zip(values) {
            codec::encode_part(&mut bytes, desc, value)?;
        }
        Ok(Self {
            bytes,
            dims: values.len(),
        })
    }

    /// Encode values followed by a row-id in the trailing int64 dimension
    pub fn encode_with_row_id(dims: &Dimensions, values: &[Datum], row_id: RowId) -> Result<Self> {
        if values.len() + 1 != dims.len() {
            return Err(TesseraError::InvalidKey(format!(
                "expected {} values before the row id, got {}",
                dims.len() - 1,
                values.len()
            )));
        }
        let row_id = i64::try_from(row_id)
            .map_err(|_| TesseraError::InvalidKey(format!("row id out of range: {}", row_id)))?;
        let mut all = values.to_vec();
        all.push(Datum::Int64(row_id));
        Self::encode(dims, &all)
    }

    /// Wrap stored bytes, validating them against the schema
    pub fn from_bytes(dims: &Dimensions, bytes: &[u8]) -> Result<Self> {
        let mut pos = 0;
        let mut count = 0;
        while pos < bytes.len() {
            let desc = dims.get(count).ok_or_else(|| {
                TesseraError::InvalidKey("key has more parts than dimensions".into())
            })?;
            pos = codec::decode_part(bytes, pos, desc)?.1;
            count += 1;
        }
        Ok(Self {
            bytes: bytes.to_vec(),
            dims: count,
        })
    }

    /// Wrap bytes that are already known to be a valid key
    pub(crate) fn from_trusted(bytes: Vec<u8>, dims: usize) -> Self {
        Self { bytes, dims }
    }

    /// Parse a user-supplied key: an array of values (one per leading
    /// dimension), a single value for the first dimension, or nil for the
    /// empty key.
    pub fn parse(dims: &Dimensions, key: &Datum) -> Result<Self> {
        match key {
            Datum::Nil => Ok(Self::empty()),
            Datum::Array(values) => Self::encode(dims, values),
            single => Self::encode(dims, std::slice::from_ref(single)),
        }
    }

    /// Decode all present dimensions
    pub fn decode(&self, dims: &Dimensions) -> Result<Vec<Datum>> {
        let mut values = Vec::with_capacity(self.dims);
        let mut pos = 0;
        for desc in dims.iter().take(self.dims) {
            let (value, next) = codec::decode_part(&self.bytes, pos, desc)?;
            values.push(value);
            pos = next;
        }
        Ok(values)
    }

    /// Decode into a user-facing value: an array of dimension values
    pub fn to_datum(&self, dims: &Dimensions) -> Result<Datum> {
        Ok(Datum::Array(self.decode(dims)?))
    }

    /// Byte offset where each present dimension ends
    pub fn part_ends(&self, dims: &Dimensions) -> Result<Vec<usize>> {
        let mut ends = Vec::with_capacity(self.dims);
        let mut pos = 0;
        for desc in dims.iter().take(self.dims) {
            pos = codec::decode_part(&self.bytes, pos, desc)?.1;
            ends.push(pos);
        }
        Ok(ends)
    }

    /// The key truncated to its first `n` dimensions
    pub fn prefix(&self, dims: &Dimensions, n: usize) -> Result<Self> {
        if n >= self.dims {
            return Ok(self.clone());
        }
        let end = if n == 0 { 0 } else { self.part_ends(dims)?[n - 1] };
        Ok(Self {
            bytes: self.bytes[..end].to_vec(),
            dims: n,
        })
    }

    /// Compare only the dimensions present in `self` against a full key
    pub fn compare_partial(&self, full: &RowKey) -> Ordering {
        let n = self.bytes.len().min(full.bytes.len());
        match self.bytes[..n].cmp(&full.bytes[..n]) {
            Ordering::Equal if self.bytes.len() > full.bytes.len() => Ordering::Greater,
            Ordering::Equal => Ordering::Equal,
            other => other,
        }
    }

    /// True if `self` is a byte prefix of `other`
    pub fn is_prefix_of(&self, other: &[u8]) -> bool {
        other.starts_with(&self.bytes)
    }

    /// True if any present dimension is nil
    pub fn has_null_dimensions(&self, dims: &Dimensions) -> Result<bool> {
        Ok(self.decode(dims)?.iter().any(Datum::is_nil))
    }

    /// Render the key as a `/`-delimited path
    pub fn to_path(&self, dims: &Dimensions) -> Result<String> {
        path::key_to_path(self, dims)
    }

    /// Parse a `/`-delimited path. A trailing `/` or fewer components than
    /// dimensions produce a partial key.
    pub fn from_path(dims: &Dimensions, path: &str) -> Result<Self> {
        path::path_to_key(dims, path)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    /// Number of encoded dimensions
    pub fn dimension_count(&self) -> usize {
        self.dims
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Smallest byte string greater than every string starting with `prefix`,
/// or `None` when no such string exists.
pub fn prefix_successor(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut out = prefix.to_vec();
    while let Some(last) = out.pop() {
        if last != 0xFF {
            out.push(last + 1);
            return Some(out);
        }
    }
    None
}

impl fmt::Debug for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RowKey({}:", self.dims)?;
        for b in &self.bytes {
            write!(f, "{:02x}", b)?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{DimensionDesc, KeyType};

    fn fruit_dims() -> Dimensions {
        Dimensions::new(vec![
            DimensionDesc::new(KeyType::Utf8),
            DimensionDesc::new(KeyType::Int32),
        ])
        .unwrap()
    }

    fn key(dims: &Dimensions, name: &str, n: i32) -> RowKey {
        RowKey::encode(dims, &[Datum::from(name), Datum::Int32(n)]).unwrap()
    }

    #[test]
    fn test_round_trip() {
        let dims = Dimensions::new(vec![
            DimensionDesc::new(KeyType::Utf8),
            DimensionDesc::descending(KeyType::Int64),
            DimensionDesc::new(KeyType::DateTime),
        ])
        .unwrap();
        let values = vec![
            Datum::from("a/b%c"),
            Datum::Int64(-12),
            Datum::from("2023-01-02T03:04:05Z").as_datetime().map(Datum::DateTime).unwrap(),
        ];
        let key = RowKey::encode(&dims, &values).unwrap();
        assert_eq!(key.decode(&dims).unwrap(), values);

        let reparsed = RowKey::from_bytes(&dims, key.as_bytes()).unwrap();
        assert_eq!(reparsed, key);
        assert_eq!(reparsed.dimension_count(), 3);
    }

    #[test]
    fn test_byte_order_matches_value_order() {
        let dims = fruit_dims();
        let ordered = [
            key(&dims, "apple", -3),
            key(&dims, "apple", 1),
            key(&dims, "apple", 2),
            key(&dims, "apples", 0),
            key(&dims, "banana", 1),
        ];
        assert!(ordered.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_partial_keys() {
        let dims = fruit_dims();
        let partial = RowKey::encode(&dims, &[Datum::from("apple")]).unwrap();
        let full = key(&dims, "apple", 2);

        assert!(partial.is_prefix_of(full.as_bytes()));
        assert_eq!(partial.compare_partial(&full), Ordering::Equal);
        assert_eq!(partial.compare_partial(&key(&dims, "banana", 0)), Ordering::Less);
        assert_eq!(full.prefix(&dims, 1).unwrap(), partial);
        assert!(!partial.is_prefix_of(key(&dims, "apples", 1).as_bytes()));
    }

    #[test]
    fn test_row_id_suffix() {
        let dims = Dimensions::secondary(&[DimensionDesc::new(KeyType::Utf8)]).unwrap();
        let a = RowKey::encode_with_row_id(&dims, &[Datum::from("red")], 9).unwrap();
        let b = RowKey::encode_with_row_id(&dims, &[Datum::from("red")], 10).unwrap();
        assert!(a < b);
        assert_eq!(a.decode(&dims).unwrap()[1], Datum::Int64(9));
        assert!(RowKey::encode_with_row_id(&dims, &[], 1).is_err());
    }

    #[test]
    fn test_null_dimensions() {
        let dims = fruit_dims();
        let with_nil = RowKey::encode(&dims, &[Datum::Nil, Datum::Int32(1)]).unwrap();
        assert!(with_nil.has_null_dimensions(&dims).unwrap());
        assert!(!key(&dims, "x", 1).has_null_dimensions(&dims).unwrap());
    }

    #[test]
    fn test_parse_user_key() {
        let dims = fruit_dims();
        let parsed = RowKey::parse(&dims, &Datum::Array(vec![Datum::from("apple"), Datum::Int64(1)])).unwrap();
        assert_eq!(parsed, key(&dims, "apple", 1));
        assert_eq!(RowKey::parse(&dims, &Datum::from("apple")).unwrap().dimension_count(), 1);
        assert!(RowKey::parse(&dims, &Datum::Nil).unwrap().is_empty());
        assert!(RowKey::encode(&dims, &[Datum::Nil, Datum::Nil, Datum::Nil]).is_err());
    }

    #[test]
    fn test_prefix_successor() {
        assert_eq!(prefix_successor(&[0x01, 0x02]), Some(vec![0x01, 0x03]));
        assert_eq!(prefix_successor(&[0x01, 0xFF]), Some(vec![0x02]));
        assert_eq!(prefix_successor(&[0xFF, 0xFF]), None);
    }
}
