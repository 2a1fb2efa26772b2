//! Tessera Core - Multi-Dimensional Segment-Structured Storage Engine
//!
//! Tables are sets of rows addressed by multi-dimensional keys. Each key
//! encodes to bytes whose order matches the logical order of its dimension
//! values, so any key prefix selects a contiguous range of rows.
//!
//! # Architecture
//!
//! - **Insert log**: every write is appended to a per-view log before it is
//!   applied, and replayed on open
//! - **Row array**: in-memory sorted rows, shared copy-on-write with readers
//! - **Segments**: immutable sorted files of fixed-size blocks behind a
//!   per-file block cache
//! - **Views**: the primary view of a table plus secondary views derived
//!   from its rows, each with its own log and segments
//! - **Housekeeping**: incremental flushing, segment merging, secondary view
//!   updates and backups, one bounded step at a time

pub mod compaction;
pub mod iterator;
pub mod key;
pub mod rowset;
pub mod schema;
pub mod segment;
pub mod storage;
pub mod view;
pub mod wal;

mod error;
mod types;

pub use error::{Result, TesseraError};
pub use types::*;

/// Tessera version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod config {
    /// Segment block size (4KB)
    pub const BLOCK_SIZE: usize = 4 * 1024;

    /// Unreferenced blocks each segment keeps cached (1MB)
    pub const BLOCK_CACHE_SIZE: usize = 1024 * 1024;

    /// In-memory rows of a view before it is flushed (16MB)
    pub const FLUSH_MEMORY_THRESHOLD: usize = 16 * 1024 * 1024;

    /// Inserts into a view before it is flushed
    pub const FLUSH_UPDATE_THRESHOLD: usize = 100_000;

    /// Segments per view before adjacent segments are merged
    pub const MAX_SEGMENTS: usize = 8;

    /// Segments smaller than this share of the target size get merged
    pub const MIN_FILL_RATIO: f64 = 0.25;

    /// Size segments are merged towards (64MB)
    pub const TARGET_SEGMENT_SIZE: u64 = 64 * 1024 * 1024;

    /// Unflushed bytes across all views of a table before flushes are forced (256MB)
    pub const MAX_MEMORY: usize = 256 * 1024 * 1024;

    /// Blocks one housekeeping step writes before yielding
    pub const BLOCKS_PER_STEP: usize = 64;
}
