//! Immutable sorted segment files
//!
//! A segment is a snapshot of a view's rows at a sequence number. Segments
//! are never modified after creation. Deleting one only marks it; the file is
//! unlinked when the last handle is dropped, so iterators still reading it
//! can finish.

mod builder;
mod cache;
pub mod format;

pub use builder::{Budget, SegmentWriter};
pub use cache::{BlockCache, BlockRef, CacheStats};

use bytes::{Buf, Bytes};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::warn;

use format::{Block, IndexEntry, SegmentHeader, HEADER_SIZE, INDEX_ENTRY_SIZE};

use crate::key::RowKey;
use crate::rowset::{OrderedRowSet, RowEntry};
use crate::schema::Dimensions;
use crate::{Datum, Result, RowId, TesseraError};

/// Summary read from a segment header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentInfo {
    pub sequence: u64,
    pub row_count: u32,
    pub view_id: u32,
    pub flags: u32,
}

/// An open segment file
pub struct Segment {
    path: PathBuf,
    dims: Dimensions,
    header: SegmentHeader,
    index: Vec<IndexEntry>,
    first_keys: Vec<Vec<u8>>,
    /// Global index of the first row of each block, plus the total row count
    first_rows: Vec<usize>,
    cache: BlockCache,
    marked_for_delete: AtomicBool,
}

impl Segment {
    /// Open a segment, loading its header and block index
    pub fn open(path: &Path, dims: Dimensions, cache_size: usize) -> Result<Self> {
        let cache = BlockCache::open(path, cache_size)?;
        let file_size = cache.file_size();

        let mut file = File::open(path)?;
        let mut raw = [0u8; HEADER_SIZE];
        file.read_exact(&mut raw)
            .map_err(|_| TesseraError::corruption(format!("{:?}: segment header truncated", path)))?;
        let header = SegmentHeader::decode(&raw)?;

        let index_end = header.index_offset as u64 + header.index_size as u64;
        if (header.index_offset as usize) < HEADER_SIZE || index_end > file_size {
            return Err(TesseraError::corruption(format!(
                "{:?}: index {}..{} outside file of {} bytes",
                path, header.index_offset, index_end, file_size
            )));
        }
        let entries_size = header.index_count as usize * INDEX_ENTRY_SIZE;
        if entries_size > header.index_size as usize {
            return Err(TesseraError::corruption(format!(
                "{:?}: {} index entries do not fit in {} bytes",
                path, header.index_count, header.index_size
            )));
        }

        let index_data = {
            let block = cache.load(header.index_offset, header.index_size)?;
            block.bytes()
        };

        let mut cursor = &index_data[..entries_size];
        let mut index = Vec::with_capacity(header.index_count as usize);
        let mut first_keys = Vec::with_capacity(header.index_count as usize);
        let mut first_rows = Vec::with_capacity(header.index_count as usize + 1);
        let mut total = 0usize;
        for _ in 0..header.index_count {
            let entry = IndexEntry::decode(&mut cursor);
            if entry.block_offset < HEADER_SIZE as u32
                || entry.block_offset as u64 + entry.block_size as u64 > header.index_offset as u64
            {
                return Err(TesseraError::corruption(format!(
                    "{:?}: block at {} overlaps the index",
                    path, entry.block_offset
                )));
            }
            first_keys.push(Self::read_first_key(&index_data, &header, &entry, path)?);
            first_rows.push(total);
            total += entry.row_count as usize;
            index.push(entry);
        }
        first_rows.push(total);

        if total != header.row_count as usize {
            return Err(TesseraError::corruption(format!(
                "{:?}: blocks hold {} rows but header says {}",
                path, total, header.row_count
            )));
        }

        Ok(Self {
            path: path.to_path_buf(),
            dims,
            header,
            index,
            first_keys,
            first_rows,
            cache,
            marked_for_delete: AtomicBool::new(false),
        })
    }

    fn read_first_key(
        index_data: &Bytes,
        header: &SegmentHeader,
        entry: &IndexEntry,
        path: &Path,
    ) -> Result<Vec<u8>> {
        let corrupt = || TesseraError::corruption(format!("{:?}: bad first key offset {}", path, entry.key_offset));
        let start = (entry.key_offset as usize)
            .checked_sub(header.index_offset as usize)
            .ok_or_else(corrupt)?;
        let mut len_bytes = index_data.get(start..start + 4).ok_or_else(corrupt)?;
        let len = len_bytes.get_u32_le() as usize;
        index_data
            .get(start + 4..start + 4 + len)
            .map(<[u8]>::to_vec)
            .ok_or_else(corrupt)
    }

    /// Read only the header of a segment file
    pub fn info(path: &Path) -> Result<SegmentInfo> {
        let mut file = File::open(path)?;
        let mut raw = [0u8; HEADER_SIZE];
        file.read_exact(&mut raw)
            .map_err(|_| TesseraError::corruption(format!("{:?}: segment header truncated", path)))?;
        let header = SegmentHeader::decode(&raw)?;
        Ok(SegmentInfo {
            sequence: header.sequence,
            row_count: header.row_count,
            view_id: header.view_id,
            flags: header.flags,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn sequence(&self) -> u64 {
        self.header.sequence
    }

    pub fn view_id(&self) -> u32 {
        self.header.view_id
    }

    pub fn flags(&self) -> u32 {
        self.header.flags
    }

    pub fn file_size(&self) -> u64 {
        self.cache.file_size()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Unlink the file once the last handle is dropped
    pub fn mark_for_delete(&self) {
        self.marked_for_delete.store(true, Ordering::Release);
    }

    pub fn is_marked_for_delete(&self) -> bool {
        self.marked_for_delete.load(Ordering::Acquire)
    }

    pub fn block_count(&self) -> usize {
        self.index.len()
    }

    /// Global row indexes held by a block; empty past the last block
    pub fn block_rows(&self, block: usize) -> std::ops::Range<usize> {
        match (self.first_rows.get(block), self.first_rows.get(block + 1)) {
            (Some(&start), Some(&end)) => start..end,
            _ => self.count()..self.count(),
        }
    }

    /// Describe the segment: header fields and every block
    pub fn debug_dump(&self) -> Result<Datum> {
        let mut blocks = Vec::with_capacity(self.index.len());
        for (entry, first_key) in self.index.iter().zip(&self.first_keys) {
            let key = RowKey::from_bytes(&self.dims, first_key)?;
            blocks.push(Datum::structure([
                ("offset", Datum::Int64(entry.block_offset as i64)),
                ("size", Datum::Int64(entry.block_size as i64)),
                ("rows", Datum::Int64(entry.row_count as i64)),
                ("firstKey", Datum::String(key.to_path(&self.dims)?)),
            ]));
        }
        Ok(Datum::structure([
            ("path", Datum::String(self.path.display().to_string())),
            ("sequence", Datum::BigInt(self.header.sequence as i128)),
            ("viewId", Datum::Int64(self.header.view_id as i64)),
            ("flags", Datum::Int64(self.header.flags as i64)),
            ("rowCount", Datum::Int64(self.header.row_count as i64)),
            ("fileSize", Datum::BigInt(self.file_size() as i128)),
            ("blocks", Datum::Array(blocks)),
        ]))
    }

    /// Block holding global row `index`, and the row's position in it
    fn locate(&self, index: usize) -> Result<(usize, usize)> {
        if index >= self.count() {
            return Err(TesseraError::Internal(format!(
                "row {} out of range for segment of {} rows",
                index,
                self.count()
            )));
        }
        let block = self.first_rows.partition_point(|&first| first <= index) - 1;
        Ok((block, index - self.first_rows[block]))
    }

    fn with_block<T>(&self, block: usize, f: impl FnOnce(&Block) -> Result<T>) -> Result<T> {
        let entry = &self.index[block];
        let pinned = self.cache.load(entry.block_offset, entry.block_size)?;
        let parsed = Block::parse(pinned.bytes(), entry.row_count, self.header.has_row_id())?;
        f(&parsed)
    }
}

impl OrderedRowSet for Segment {
    fn count(&self) -> usize {
        self.header.row_count as usize
    }

    fn row(&self, index: usize) -> Result<RowEntry> {
        let (block, local) = self.locate(index)?;
        let dims = self.dims.len();
        self.with_block(block, |b| {
            Ok(RowEntry::new(
                RowKey::from_trusted(b.key(local)?.to_vec(), dims),
                b.value(local)?,
                b.row_id(local)?,
            ))
        })
    }

    fn lower_bound(&self, key: &[u8]) -> Result<usize> {
        // last block whose first key is <= key
        let candidate = self.first_keys.partition_point(|first| first.as_slice() <= key);
        if candidate == 0 {
            return Ok(0);
        }
        let block = candidate - 1;
        let local = self.with_block(block, |b| b.lower_bound(key))?;
        Ok(self.first_rows[block] + local)
    }

    fn key_bytes(&self, index: usize) -> Result<Vec<u8>> {
        let (block, local) = self.locate(index)?;
        self.with_block(block, |b| Ok(b.key(local)?.to_vec()))
    }

    fn value_bytes(&self, index: usize) -> Result<Bytes> {
        let (block, local) = self.locate(index)?;
        self.with_block(block, |b| b.value(local))
    }

    fn row_id(&self, index: usize) -> Result<RowId> {
        let (block, local) = self.locate(index)?;
        self.with_block(block, |b| b.row_id(local))
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        if self.is_marked_for_delete() {
            if let Err(e) = std::fs::remove_file(&self.path) {
                warn!("Failed to delete segment {:?}: {}", self.path, e);
            }
        }
    }
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("path", &self.path)
            .field("sequence", &self.header.sequence)
            .field("rows", &self.header.row_count)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iterator::RowIterator;
    use crate::rowset::RowArray;
    use crate::schema::{DimensionDesc, KeyType};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn dims() -> Dimensions {
        Dimensions::new(vec![
            DimensionDesc::new(KeyType::Utf8),
            DimensionDesc::new(KeyType::Int32),
        ])
        .unwrap()
    }

    fn key(a: &str, n: i32) -> RowKey {
        RowKey::encode(&dims(), &[Datum::from(a), Datum::Int32(n)]).unwrap()
    }

    fn build(dir: &Path, name: &str, rows: &[(&str, i32, &str)], seq: u64, block_size: usize) -> PathBuf {
        let mut array = RowArray::new();
        for (i, (a, n, v)) in rows.iter().enumerate() {
            array.insert(key(a, *n), Bytes::copy_from_slice(v.as_bytes()), i as u64 + 1);
        }
        let mut it = RowIterator::new(dims());
        it.set_include_nil(true);
        it.add_set(Arc::new(array));
        let path = dir.join(name);
        SegmentWriter::create(&path, seq, 0, format::FLAG_HAS_ROW_ID, it, block_size)
            .unwrap()
            .finish()
            .unwrap();
        path
    }

    fn many_rows() -> Vec<(String, i32, String)> {
        (0..300)
            .map(|i| (format!("k{:03}", i / 7), i % 7, format!("v{}", i)))
            .collect()
    }

    #[test]
    fn test_find_key_agrees_with_linear_scan() {
        let dir = TempDir::new().unwrap();
        let owned = many_rows();
        let rows: Vec<_> = owned.iter().map(|(a, n, v)| (a.as_str(), *n, v.as_str())).collect();
        let path = build(dir.path(), "a.seg", &rows, 3, 200);
        let segment = Segment::open(&path, dims(), 4096).unwrap();
        assert!(segment.index.len() > 5);
        assert_eq!(segment.count(), 300);

        let keys: Vec<_> = (0..segment.count()).map(|i| segment.key_bytes(i).unwrap()).collect();
        assert!(keys.windows(2).all(|w| w[0] < w[1]));

        for wanted in ["k000", "k010", "k042", "k099"] {
            for n in [-1, 0, 3, 6, 7] {
                let k = key(wanted, n);
                let linear = keys.iter().position(|stored| stored.as_slice() == k.as_bytes());
                assert_eq!(segment.find_key(k.as_bytes()).unwrap(), linear, "{} {}", wanted, n);
                let lower = keys.iter().position(|stored| stored.as_slice() >= k.as_bytes()).unwrap_or(keys.len());
                assert_eq!(segment.lower_bound(k.as_bytes()).unwrap(), lower);
            }
        }

        let (value, row_id) = segment.find_data(key("k001", 2).as_bytes()).unwrap().unwrap();
        assert_eq!(value, Bytes::from("v9"));
        assert_eq!(row_id, 10);

        // blocks tile the rows without gaps
        let mut next = 0;
        for block in 0..segment.block_count() {
            let rows = segment.block_rows(block);
            assert_eq!(rows.start, next);
            assert!(rows.end > rows.start);
            next = rows.end;
        }
        assert_eq!(next, 300);
        assert!(segment.block_rows(segment.block_count()).is_empty());
    }

    #[test]
    fn test_merging_twice_writes_identical_files() {
        let dir = TempDir::new().unwrap();
        let older = build(dir.path(), "1.seg", &[("apple", 1, "X"), ("banana", 1, "Y"), ("cherry", 1, "Z")], 1, 64);
        let newer = build(dir.path(), "2.seg", &[("banana", 1, "B"), ("cherry", 1, ""), ("date", 1, "D")], 2, 64);
        let older = Arc::new(Segment::open(&older, dims(), 4096).unwrap());
        let newer = Arc::new(Segment::open(&newer, dims(), 4096).unwrap());

        let merge = |name: &str| {
            let mut it = RowIterator::new(dims());
            it.set_include_nil(true);
            it.add_set(older.clone());
            it.add_set(newer.clone());
            let path = dir.path().join(name);
            SegmentWriter::create(&path, 2, 0, format::FLAG_HAS_ROW_ID, it, 64)
                .unwrap()
                .finish()
                .unwrap();
            path
        };
        let first = merge("m1.seg");
        let second = merge("m2.seg");
        assert_eq!(std::fs::read(&first).unwrap(), std::fs::read(&second).unwrap());

        let merged = Segment::open(&first, dims(), 4096).unwrap();
        assert_eq!(merged.count(), 4);
        assert_eq!(merged.find_data(key("banana", 1).as_bytes()).unwrap().unwrap().0, Bytes::from("B"));
        // the tombstone survives a merge that keeps nil rows
        assert!(merged.find_data(key("cherry", 1).as_bytes()).unwrap().unwrap().0.is_empty());
    }

    #[test]
    fn test_info_and_dump() {
        let dir = TempDir::new().unwrap();
        let path = build(dir.path(), "b.seg", &[("apple", 1, "X"), ("apple", 2, "Y"), ("banana", 1, "Z")], 42, 4096);
        let info = Segment::info(&path).unwrap();
        assert_eq!(info.sequence, 42);
        assert_eq!(info.row_count, 3);

        let segment = Segment::open(&path, dims(), 4096).unwrap();
        let dump = segment.debug_dump().unwrap();
        assert_eq!(dump.field("rowCount"), Some(&Datum::Int64(3)));
        let blocks = dump.field("blocks").unwrap();
        assert_eq!(blocks.count(), 1);
        assert_eq!(
            blocks.element(0).unwrap().field("firstKey"),
            Some(&Datum::from("apple/1"))
        );
    }

    #[test]
    fn test_empty_segment() {
        let dir = TempDir::new().unwrap();
        let path = build(dir.path(), "e.seg", &[], 1, 4096);
        let segment = Segment::open(&path, dims(), 4096).unwrap();
        assert_eq!(segment.count(), 0);
        assert_eq!(segment.lower_bound(key("a", 1).as_bytes()).unwrap(), 0);
        assert!(segment.find_key(key("a", 1).as_bytes()).unwrap().is_none());
    }

    #[test]
    fn test_corrupt_files_are_rejected() {
        let dir = TempDir::new().unwrap();
        let path = build(dir.path(), "c.seg", &[("apple", 1, "X"), ("pear", 2, "Y")], 1, 4096);

        let data = std::fs::read(&path).unwrap();
        let truncated = dir.path().join("t.seg");
        std::fs::write(&truncated, &data[..data.len() - 10]).unwrap();
        assert!(Segment::open(&truncated, dims(), 4096).unwrap_err().is_corruption());

        let short = dir.path().join("s.seg");
        std::fs::write(&short, &data[..20]).unwrap();
        assert!(Segment::open(&short, dims(), 4096).unwrap_err().is_corruption());
    }

    #[test]
    fn test_marked_segment_is_removed_on_drop() {
        let dir = TempDir::new().unwrap();
        let path = build(dir.path(), "d.seg", &[("apple", 1, "X")], 1, 4096);
        let segment = Arc::new(Segment::open(&path, dims(), 4096).unwrap());
        let reader = segment.clone();

        segment.mark_for_delete();
        drop(segment);
        assert!(path.exists());
        assert_eq!(reader.row(0).unwrap().value, Bytes::from("X"));
        drop(reader);
        assert!(!path.exists());
    }
}
