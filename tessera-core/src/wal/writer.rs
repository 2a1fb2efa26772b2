//! Insert log writer

use bytes::{BufMut, BytesMut};
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::debug;

use super::reader::replay;
use super::{InsertLogConfig, LogRecord, SyncPolicy, LOG_HEADER_SIZE, LOG_SIGNATURE, LOG_VERSION};
use crate::key::RowKey;
use crate::rowset::{OrderedRowSet, RowArray};
use crate::schema::Dimensions;
use crate::{Result, RowId, TesseraError};

/// Append-only log of inserts into one view
pub struct InsertLog {
    path: PathBuf,
    config: InsertLogConfig,
    inner: Mutex<InsertLogInner>,
}

struct InsertLogInner {
    file: BufWriter<File>,
    len: u64,
    writes_since_sync: usize,
    last_sync: Instant,
}

impl InsertLog {
    /// Create an empty log, replacing any existing file
    pub fn create(path: &Path, config: InsertLogConfig) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        let log = Self::with_file(path, config, file, 0);
        log.reset()?;
        Ok(log)
    }

    /// Open an existing log and replay it into `rows`. Returns the log, the
    /// number of records recovered and the highest row id seen.
    ///
    /// A trailing record that is incomplete or undecodable marks the end of
    /// the log and is cut off.
    pub fn open(
        path: &Path,
        dims: &Dimensions,
        config: InsertLogConfig,
        rows: &mut RowArray,
    ) -> Result<(Self, usize, Option<RowId>)> {
        let recovery = replay(path, dims, rows)?;
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let log = Self::with_file(path, config, file, recovery.valid_len);
        if recovery.valid_len == 0 {
            log.reset()?;
        } else {
            log.rollback_to(recovery.valid_len)?;
        }
        Ok((log, recovery.records, recovery.max_row_id))
    }

    fn with_file(path: &Path, config: InsertLogConfig, file: File, len: u64) -> Self {
        Self {
            path: path.to_path_buf(),
            config,
            inner: Mutex::new(InsertLogInner {
                file: BufWriter::new(file),
                len,
                writes_since_sync: 0,
                last_sync: Instant::now(),
            }),
        }
    }

    /// Append an insert. `value` is the serialized value, empty for a delete.
    pub fn insert(&self, key: &RowKey, value: &[u8], row_id: RowId) -> Result<()> {
        let record = LogRecord::new(key.as_bytes(), value, row_id).encode();
        let mut inner = self.inner.lock();
        inner.file.write_all(&record)?;
        inner.len += record.len() as u64;
        inner.writes_since_sync += 1;

        if self.should_sync(&inner) {
            Self::sync_inner(&mut inner)?;
        }
        Ok(())
    }

    /// Current end of the log, for a later [`rollback_to`](Self::rollback_to)
    pub fn position(&self) -> u64 {
        self.inner.lock().len
    }

    /// Discard everything appended after `position`
    pub fn rollback_to(&self, position: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.file.flush()?;
        let file = inner.file.get_mut();
        file.set_len(position)?;
        file.seek(SeekFrom::Start(position))?;
        inner.len = position;
        Self::sync_inner(&mut inner)
    }

    /// Truncate the log to just its header
    pub fn reset(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.file.flush()?;
        let file = inner.file.get_mut();
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&header())?;
        inner.len = LOG_HEADER_SIZE;
        Self::sync_inner(&mut inner)?;
        debug!("Reset insert log {:?}", self.path);
        Ok(())
    }

    /// Replace the log with one holding exactly the rows of `rows`. The new
    /// log is written under a temporary name and renamed over the old one.
    pub fn rewrite(&self, rows: &dyn OrderedRowSet) -> Result<()> {
        let temp_path = self.path.with_extension("log.tmp");
        let mut writer = BufWriter::new(File::create(&temp_path)?);
        writer.write_all(&header())?;
        for i in 0..rows.count() {
            rows.write_row(&mut writer, i)?;
        }
        writer.flush()?;
        let file = writer.into_inner().map_err(|e| TesseraError::Io(e.into_error()))?;
        file.sync_all()?;
        let len = file.metadata()?.len();
        drop(file);

        let mut inner = self.inner.lock();
        inner.file.flush()?;
        fs::rename(&temp_path, &self.path)?;
        let mut file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        file.seek(SeekFrom::End(0))?;
        inner.file = BufWriter::new(file);
        inner.len = len;
        inner.writes_since_sync = 0;
        debug!("Rewrote insert log {:?} with {} rows", self.path, rows.count());
        Ok(())
    }

    /// Force sync to disk
    pub fn sync(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        Self::sync_inner(&mut inner)
    }

    /// Size of the log file in bytes
    pub fn len(&self) -> u64 {
        self.inner.lock().len
    }

    /// True if the log holds no records
    pub fn is_empty(&self) -> bool {
        self.len() <= LOG_HEADER_SIZE
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Close the log and delete its file
    pub fn delete(self) -> Result<()> {
        let path = self.path.clone();
        drop(self);
        fs::remove_file(path)?;
        Ok(())
    }

    fn should_sync(&self, inner: &InsertLogInner) -> bool {
        match self.config.sync_policy {
            SyncPolicy::Immediate => true,
            SyncPolicy::EveryN(n) => inner.writes_since_sync >= n,
            SyncPolicy::Interval { millis } => {
                inner.last_sync.elapsed().as_millis() >= millis as u128
            }
            SyncPolicy::None => false,
        }
    }

    fn sync_inner(inner: &mut InsertLogInner) -> Result<()> {
        inner.file.flush()?;
        inner.file.get_ref().sync_all()?;
        inner.writes_since_sync = 0;
        inner.last_sync = Instant::now();
        Ok(())
    }
}

fn header() -> BytesMut {
    let mut header = BytesMut::with_capacity(LOG_HEADER_SIZE as usize);
    header.put_u32_le(LOG_SIGNATURE);
    header.put_u32_le(LOG_VERSION);
    header
}
