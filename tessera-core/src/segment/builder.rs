//! Streaming segment writer
//!
//! A segment is written sequentially: a header placeholder, the blocks, the
//! block index, and finally the real header. The file is written under a
//! temporary name and renamed into place only when complete, so a partial
//! segment is never visible.

use bytes::BytesMut;
use std::fs::{self, File};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::debug;

use super::format::{
    encode_block, row_footprint, BlockRow, IndexEntry, SegmentHeader, FLAG_HAS_ROW_ID,
    FORMAT_VERSION, HEADER_SIZE, INDEX_ENTRY_SIZE,
};
use crate::iterator::RowIterator;
use crate::rowset::RowEntry;
use crate::{Result, TesseraError};

/// Bound on the work one housekeeping step may do
#[derive(Debug, Clone, Copy, Default)]
pub struct Budget {
    deadline: Option<Instant>,
    blocks: Option<usize>,
}

impl Budget {
    /// No limit
    pub fn unlimited() -> Self {
        Self::default()
    }

    /// At most `n` blocks
    pub fn blocks(n: usize) -> Self {
        Self {
            deadline: None,
            blocks: Some(n),
        }
    }

    /// Until `timeout` has elapsed
    pub fn time(timeout: Duration) -> Self {
        Self {
            deadline: Some(Instant::now() + timeout),
            blocks: None,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.blocks == Some(0) || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    pub(crate) fn charge_block(&mut self) {
        if let Some(n) = self.blocks.as_mut() {
            *n = n.saturating_sub(1);
        }
    }
}

/// Writes rows from an iterator into a new segment file
pub struct SegmentWriter {
    path: PathBuf,
    temp_path: PathBuf,
    file: Option<BufWriter<File>>,
    header: SegmentHeader,
    rows: RowIterator,
    block_size: usize,
    pending: Option<RowEntry>,
    index: Vec<IndexEntry>,
    first_keys: Vec<Vec<u8>>,
    offset: u64,
    row_count: u64,
}

impl SegmentWriter {
    /// Start a segment at `path`
    pub fn create(
        path: &Path,
        sequence: u64,
        view_id: u32,
        flags: u32,
        rows: RowIterator,
        block_size: usize,
    ) -> Result<Self> {
        let temp_path = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4().simple()));
        let mut file = BufWriter::new(File::create(&temp_path)?);
        file.write_all(&[0u8; HEADER_SIZE])?;

        Ok(Self {
            path: path.to_path_buf(),
            temp_path,
            file: Some(file),
            header: SegmentHeader {
                version: FORMAT_VERSION,
                sequence,
                view_id,
                flags,
                ..Default::default()
            },
            rows,
            block_size: block_size.max(1),
            pending: None,
            index: Vec::new(),
            first_keys: Vec::new(),
            offset: HEADER_SIZE as u64,
            row_count: 0,
        })
    }

    /// Write blocks until the rows run out or the budget is spent.
    /// Returns `true` once every row has been written.
    pub fn write_blocks(&mut self, budget: &mut Budget) -> Result<bool> {
        loop {
            let block = self.next_block()?;
            if block.is_empty() {
                return Ok(true);
            }
            self.write_block(&block)?;
            budget.charge_block();
            if budget.is_exhausted() {
                let done = self.pending.is_none() && !self.rows.has_more()?;
                return Ok(done);
            }
        }
    }

    /// Collect the rows of the next block. A block always holds at least one
    /// row and stops before the row that would push it past the block size.
    fn next_block(&mut self) -> Result<Vec<RowEntry>> {
        let has_row_id = self.header.has_row_id();
        let mut rows = Vec::new();
        let mut size = 0;
        loop {
            let row = match self.pending.take() {
                Some(row) => row,
                None => match self.rows.next() {
                    Some(row) => row?,
                    None => break,
                },
            };
            let footprint = row_footprint(row.key.len(), row.value.len(), has_row_id);
            if !rows.is_empty() && size + footprint > self.block_size {
                self.pending = Some(row);
                break;
            }
            size += footprint;
            rows.push(row);
        }
        Ok(rows)
    }

    fn write_block(&mut self, rows: &[RowEntry]) -> Result<()> {
        let block_rows: Vec<BlockRow<'_>> = rows
            .iter()
            .map(|r| BlockRow {
                key: r.key.as_bytes(),
                value: &r.value,
                row_id: r.row_id,
            })
            .collect();
        let data = encode_block(&block_rows, self.header.flags & FLAG_HAS_ROW_ID != 0)?;

        self.index.push(IndexEntry {
            key_offset: 0,
            block_offset: to_u32(self.offset)?,
            block_size: to_u32(data.len() as u64)?,
            row_count: rows.len() as u32,
        });
        self.first_keys.push(rows[0].key.as_bytes().to_vec());

        self.writer()?.write_all(&data)?;
        self.offset += data.len() as u64;
        self.row_count += rows.len() as u64;
        Ok(())
    }

    fn writer(&mut self) -> Result<&mut BufWriter<File>> {
        self.file
            .as_mut()
            .ok_or_else(|| TesseraError::Internal("segment writer already finished".into()))
    }

    /// Write any remaining rows, the index and the header, then move the file
    /// into place. Returns the number of rows written.
    pub fn finish(mut self) -> Result<u64> {
        self.write_blocks(&mut Budget::unlimited())?;

        let index_offset = self.offset;
        let keys_start = index_offset + (self.index.len() * INDEX_ENTRY_SIZE) as u64;
        let mut keys = BytesMut::new();
        for (entry, key) in self.index.iter_mut().zip(&self.first_keys) {
            entry.key_offset = to_u32(keys_start + keys.len() as u64)?;
            keys.extend_from_slice(&(key.len() as u32).to_le_bytes());
            keys.extend_from_slice(key);
        }
        let mut index = BytesMut::with_capacity(self.index.len() * INDEX_ENTRY_SIZE + keys.len());
        for entry in &self.index {
            entry.encode(&mut index);
        }
        index.extend_from_slice(&keys);

        self.header.index_count = self.index.len() as u32;
        self.header.index_offset = to_u32(index_offset)?;
        self.header.index_size = to_u32(index.len() as u64)?;
        self.header.row_count = to_u32(self.row_count)?;
        to_u32(index_offset + index.len() as u64)?;

        let header = self.header.encode();
        let file = self
            .file
            .take()
            .ok_or_else(|| TesseraError::Internal("segment writer already finished".into()))?;
        let result = (|| {
            let mut file = file;
            file.write_all(&index)?;
            file.flush()?;
            let mut file = file.into_inner().map_err(|e| TesseraError::Io(e.into_error()))?;
            file.seek(SeekFrom::Start(0))?;
            file.write_all(&header)?;
            file.sync_all()?;
            drop(file);
            fs::rename(&self.temp_path, &self.path)?;
            Ok::<_, TesseraError>(())
        })();
        if let Err(e) = result {
            // the file is already taken, so Drop would leave it behind
            let _ = fs::remove_file(&self.temp_path);
            return Err(e);
        }
        debug!(
            "Wrote segment {:?}: {} rows in {} blocks",
            self.path,
            self.row_count,
            self.index.len()
        );
        Ok(self.row_count)
    }

    pub fn rows_written(&self) -> u64 {
        self.row_count
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SegmentWriter {
    fn drop(&mut self) {
        // unfinished writers leave nothing behind
        if self.file.take().is_some() {
            let _ = fs::remove_file(&self.temp_path);
        }
    }
}

fn to_u32(value: u64) -> Result<u32> {
    u32::try_from(value)
        .map_err(|_| TesseraError::InvalidFormat(format!("segment exceeds 4 GiB ({} bytes)", value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::RowKey;
    use crate::rowset::{OrderedRowSet, RowArray};
    use crate::schema::{DimensionDesc, Dimensions, KeyType};
    use crate::segment::Segment;
    use crate::Datum;
    use bytes::Bytes;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn dims() -> Dimensions {
        Dimensions::new(vec![DimensionDesc::new(KeyType::Int64)]).unwrap()
    }

    fn rows(n: i64) -> RowIterator {
        let mut array = RowArray::new();
        for i in 0..n {
            let key = RowKey::encode(&dims(), &[Datum::Int64(i)]).unwrap();
            array.insert(key, Bytes::from(format!("value-{}", i)), i as u64 + 1);
        }
        let mut it = RowIterator::new(dims());
        it.add_set(Arc::new(array));
        it
    }

    #[test]
    fn test_resumable_write() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("s.seg");
        let mut writer = SegmentWriter::create(&path, 7, 0, FLAG_HAS_ROW_ID, rows(200), 256).unwrap();

        let mut steps = 0;
        while !writer.write_blocks(&mut Budget::blocks(2)).unwrap() {
            steps += 1;
            assert!(!path.exists());
        }
        assert!(steps > 1);
        assert_eq!(writer.finish().unwrap(), 200);

        let segment = Segment::open(&path, dims(), 1 << 20).unwrap();
        assert_eq!(segment.sequence(), 7);
        assert_eq!(segment.count(), 200);
        assert_eq!(segment.row_id(150).unwrap(), 151);
    }

    #[test]
    fn test_dropped_writer_leaves_no_files() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("s.seg");
        let mut writer = SegmentWriter::create(&path, 1, 0, 0, rows(50), 64).unwrap();
        writer.write_blocks(&mut Budget::blocks(1)).unwrap();
        drop(writer);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_failed_finish_removes_temp_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("s.seg");
        // a non-empty directory in the way makes the final rename fail
        fs::create_dir(&path).unwrap();
        fs::write(path.join("occupied"), b"x").unwrap();

        let writer = SegmentWriter::create(&path, 1, 0, 0, rows(50), 64).unwrap();
        assert!(writer.finish().is_err());
        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["s.seg"]);
        assert!(path.is_dir());
    }

    #[test]
    fn test_budget() {
        let mut budget = Budget::blocks(1);
        assert!(!budget.is_exhausted());
        budget.charge_block();
        assert!(budget.is_exhausted());
        assert!(!Budget::unlimited().is_exhausted());
        assert!(Budget::time(Duration::ZERO).is_exhausted());
    }
}
