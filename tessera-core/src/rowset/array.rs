//! In-memory row array
//!
//! Rows are kept in insertion order with a separate permutation sorted by
//! key, so inserts only shift indices and never move row payloads.

use bytes::Bytes;

use super::{OrderedRowSet, RowEntry};
use crate::key::RowKey;
use crate::{Result, RowId, TesseraError};

/// Per-row bookkeeping overhead counted in `memory_used`
const ROW_OVERHEAD: usize = 32;

/// Mutable, sorted in-memory row set
#[derive(Debug, Clone, Default)]
pub struct RowArray {
    rows: Vec<RowEntry>,
    order: Vec<usize>,
    memory_used: usize,
    update_count: usize,
}

impl RowArray {
    /// Create an empty row array
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the row under `key`. Returns the replaced row.
    pub fn insert(&mut self, key: RowKey, value: Bytes, row_id: RowId) -> Option<RowEntry> {
        let entry = RowEntry::new(key, value, row_id);
        let added = Self::footprint(&entry);
        self.update_count += 1;

        match self.search(entry.key.as_bytes()) {
            Ok(pos) => {
                let slot = &mut self.rows[self.order[pos]];
                let previous = std::mem::replace(slot, entry);
                self.memory_used = self.memory_used + added - Self::footprint(&previous);
                Some(previous)
            }
            Err(pos) => {
                self.rows.push(entry);
                self.order.insert(pos, self.rows.len() - 1);
                self.memory_used += added;
                None
            }
        }
    }

    /// Remove the row under `key`, returning it
    pub fn remove(&mut self, key: &[u8]) -> Option<RowEntry> {
        let pos = self.search(key).ok()?;
        let index = self.order.remove(pos);
        let last = self.rows.len() - 1;
        let removed = self.rows.swap_remove(index);
        if index != last {
            // the former last row now lives at `index`
            if let Some(slot) = self.order.iter_mut().find(|i| **i == last) {
                *slot = index;
            }
        }
        self.memory_used -= Self::footprint(&removed);
        Some(removed)
    }

    /// Undo an insert: put back the replaced row, or drop the key
    pub fn restore(&mut self, key: &RowKey, previous: Option<RowEntry>) {
        match previous {
            Some(prev) => {
                self.insert(prev.key, prev.value, prev.row_id);
            }
            None => {
                self.remove(key.as_bytes());
            }
        }
    }

    /// Approximate bytes held by the array
    pub fn memory_used(&self) -> usize {
        self.memory_used
    }

    /// Number of inserts since the array was created
    pub fn update_count(&self) -> usize {
        self.update_count
    }

    /// Highest row id present
    pub fn max_row_id(&self) -> Option<RowId> {
        self.rows.iter().map(|r| r.row_id).max()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Rows in key order
    pub fn iter(&self) -> impl Iterator<Item = &RowEntry> {
        self.order.iter().map(move |&i| &self.rows[i])
    }

    fn footprint(entry: &RowEntry) -> usize {
        entry.size() + ROW_OVERHEAD
    }

    fn search(&self, key: &[u8]) -> std::result::Result<usize, usize> {
        self.order
            .binary_search_by(|&i| self.rows[i].key.as_bytes().cmp(key))
    }

    fn entry(&self, index: usize) -> Result<&RowEntry> {
        self.order
            .get(index)
            .map(|&i| &self.rows[i])
            .ok_or_else(|| TesseraError::Internal(format!("row index {} out of range", index)))
    }
}

impl OrderedRowSet for RowArray {
    fn count(&self) -> usize {
        self.rows.len()
    }

    fn row(&self, index: usize) -> Result<RowEntry> {
        self.entry(index).cloned()
    }

    fn lower_bound(&self, key: &[u8]) -> Result<usize> {
        Ok(self.order.partition_point(|&i| self.rows[i].key.as_bytes() < key))
    }

    fn key_bytes(&self, index: usize) -> Result<Vec<u8>> {
        Ok(self.entry(index)?.key.as_bytes().to_vec())
    }

    fn row_id(&self, index: usize) -> Result<RowId> {
        Ok(self.entry(index)?.row_id)
    }

    fn row_size(&self, index: usize) -> Result<usize> {
        Ok(self.entry(index)?.size())
    }

    fn find_key(&self, key: &[u8]) -> Result<Option<usize>> {
        Ok(self.search(key).ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{DimensionDesc, Dimensions, KeyType};
    use crate::Datum;
    use rand::seq::SliceRandom;

    fn dims() -> Dimensions {
        Dimensions::new(vec![DimensionDesc::new(KeyType::Int32)]).unwrap()
    }

    fn key(n: i32) -> RowKey {
        RowKey::encode(&dims(), &[Datum::Int32(n)]).unwrap()
    }

    #[test]
    fn test_sorted_after_shuffled_inserts() {
        let mut values: Vec<i32> = (0..500).map(|i| i * 3 - 700).collect();
        values.shuffle(&mut rand::thread_rng());

        let mut array = RowArray::new();
        for (row_id, v) in values.iter().enumerate() {
            array.insert(key(*v), Bytes::from(v.to_le_bytes().to_vec()), row_id as u64);
        }

        assert_eq!(array.count(), 500);
        let keys: Vec<_> = (0..array.count()).map(|i| array.key_bytes(i).unwrap()).collect();
        assert!(keys.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_find_key_matches_linear_scan() {
        let mut array = RowArray::new();
        for v in [5, -2, 9, 0, 14] {
            array.insert(key(v), Bytes::from_static(b"x"), 1);
        }
        for wanted in -3..16 {
            let k = key(wanted);
            let linear = (0..array.count()).find(|&i| array.key_bytes(i).unwrap() == k.as_bytes());
            assert_eq!(array.find_key(k.as_bytes()).unwrap(), linear);
        }
    }

    #[test]
    fn test_replace_tracks_memory() {
        let mut array = RowArray::new();
        assert!(array.insert(key(1), Bytes::from_static(b"short"), 1).is_none());
        let before = array.memory_used();

        let previous = array.insert(key(1), Bytes::from_static(b"a much longer value"), 2);
        assert_eq!(previous.unwrap().value, Bytes::from_static(b"short"));
        assert_eq!(array.count(), 1);
        assert_eq!(array.memory_used(), before + 14);
        assert_eq!(array.update_count(), 2);
        assert_eq!(array.find_data(key(1).as_bytes()).unwrap().unwrap().1, 2);
    }

    #[test]
    fn test_restore_undoes_insert() {
        let mut array = RowArray::new();
        for v in 0..10 {
            array.insert(key(v), Bytes::from_static(b"v"), v as u64);
        }

        let previous = array.insert(key(3), Bytes::from_static(b"new"), 99);
        array.restore(&key(3), previous);
        assert_eq!(array.find_data(key(3).as_bytes()).unwrap().unwrap().1, 3);

        let previous = array.insert(key(42), Bytes::from_static(b"new"), 100);
        array.restore(&key(42), previous);
        assert_eq!(array.count(), 10);
        assert!(array.find_key(key(42).as_bytes()).unwrap().is_none());

        // removal keeps the permutation consistent
        array.remove(key(0).as_bytes());
        let ids: Vec<_> = array.iter().map(|r| r.row_id).collect();
        assert_eq!(ids, (1..10).collect::<Vec<u64>>());
    }

    #[test]
    fn test_write_row_record() {
        let mut array = RowArray::new();
        array.insert(key(7), Bytes::from_static(b"val"), 0x0102);

        let mut out = Vec::new();
        array.write_row(&mut out, 0).unwrap();
        let key_len = key(7).len();
        assert_eq!(out.len(), 4 + key_len + 4 + 8 + 3);
        assert_eq!(u32::from_le_bytes(out[0..4].try_into().unwrap()) as usize, key_len);
        assert_eq!(&out[out.len() - 3..], b"val");
    }
}
