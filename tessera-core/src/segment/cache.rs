//! Reference-counted block cache of one segment file

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::ops::Deref;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::{Result, TesseraError};

struct CacheEntry {
    data: Bytes,
    ref_count: usize,
    last_access: u64,
}

struct CacheInner {
    file: File,
    blocks: HashMap<u32, CacheEntry>,
    bytes: usize,
    tick: u64,
}

/// Cache statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub cached_blocks: usize,
    pub cached_bytes: usize,
}

/// Loads blocks of a file by `(offset, size)` and keeps recently used ones in
/// memory. A checked-out block is pinned until its [`BlockRef`] is dropped.
pub struct BlockCache {
    inner: Mutex<CacheInner>,
    file_size: u64,
    capacity: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

/// A pinned block. Dropping it releases the reference.
pub struct BlockRef<'a> {
    cache: &'a BlockCache,
    offset: u32,
    data: Bytes,
}

impl BlockCache {
    /// Open the file and create a cache holding up to `capacity` bytes of
    /// unreferenced blocks
    pub fn open(path: &Path, capacity: usize) -> Result<Self> {
        let file = File::open(path)?;
        let file_size = file.metadata()?.len();
        Ok(Self {
            inner: Mutex::new(CacheInner {
                file,
                blocks: HashMap::new(),
                bytes: 0,
                tick: 0,
            }),
            file_size,
            capacity,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        })
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Check out the block at `offset`, loading it on first use
    pub fn load(&self, offset: u32, size: u32) -> Result<BlockRef<'_>> {
        let mut inner = self.inner.lock();
        inner.tick += 1;
        let tick = inner.tick;

        if let Some(entry) = inner.blocks.get_mut(&offset) {
            if entry.data.len() != size as usize {
                return Err(TesseraError::corruption(format!(
                    "block at {} requested with size {} but cached with size {}",
                    offset,
                    size,
                    entry.data.len()
                )));
            }
            entry.ref_count += 1;
            entry.last_access = tick;
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(BlockRef {
                cache: self,
                offset,
                data: entry.data.clone(),
            });
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let end = offset as u64 + size as u64;
        if end > self.file_size {
            return Err(TesseraError::corruption(format!(
                "block {}..{} beyond end of file ({} bytes)",
                offset, end, self.file_size
            )));
        }
        let mut buf = vec![0u8; size as usize];
        inner.file.seek(SeekFrom::Start(offset as u64))?;
        inner.file.read_exact(&mut buf)?;
        let data = Bytes::from(buf);

        inner.bytes += data.len();
        inner.blocks.insert(
            offset,
            CacheEntry {
                data: data.clone(),
                ref_count: 1,
                last_access: tick,
            },
        );
        self.evict(&mut inner);

        Ok(BlockRef {
            cache: self,
            offset,
            data,
        })
    }

    /// Evict least recently used unreferenced blocks while over capacity
    fn evict(&self, inner: &mut CacheInner) {
        while inner.bytes > self.capacity {
            let victim = inner
                .blocks
                .iter()
                .filter(|(_, e)| e.ref_count == 0)
                .min_by_key(|(_, e)| e.last_access)
                .map(|(offset, _)| *offset);
            let Some(offset) = victim else { break };
            if let Some(entry) = inner.blocks.remove(&offset) {
                inner.bytes -= entry.data.len();
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn release(&self, offset: u32) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.blocks.get_mut(&offset) {
            entry.ref_count = entry.ref_count.saturating_sub(1);
        }
        self.evict(&mut inner);
    }

    /// Number of live references to the block at `offset`
    pub fn ref_count(&self, offset: u32) -> usize {
        self.inner
            .lock()
            .blocks
            .get(&offset)
            .map(|e| e.ref_count)
            .unwrap_or(0)
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            cached_blocks: inner.blocks.len(),
            cached_bytes: inner.bytes,
        }
    }
}

impl BlockRef<'_> {
    /// Shared handle to the block bytes, usable after the reference is released
    pub fn bytes(&self) -> Bytes {
        self.data.clone()
    }
}

impl Deref for BlockRef<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl Drop for BlockRef<'_> {
    fn drop(&mut self) {
        self.cache.release(self.offset);
    }
}
