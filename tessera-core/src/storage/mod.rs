//! Storage engine - tables, their volumes and housekeeping

mod descriptor;
mod engine;
mod table;
mod volume;

pub use descriptor::{validate_table_name, SecondaryViewDesc, TableDescriptor, TableType, DESCRIPTOR_FILE};
pub use engine::{Engine, EngineStats};
pub use table::{RowsFlags, Table, TableStats};
pub use volume::{copy_volume, file_checksum, validate_volume, CopyStats};

use crate::compaction::CompactionConfig;
use crate::wal::InsertLogConfig;
use std::path::PathBuf;

/// Segment configuration
#[derive(Debug, Clone)]
pub struct SegmentConfig {
    /// Target block size in bytes
    pub block_size: usize,
    /// Bytes of unreferenced blocks each segment keeps cached
    pub cache_size: usize,
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self {
            block_size: crate::config::BLOCK_SIZE,
            cache_size: crate::config::BLOCK_CACHE_SIZE,
        }
    }
}

/// Per-table configuration
#[derive(Debug, Clone)]
pub struct TableConfig {
    pub segment: SegmentConfig,
    pub log: InsertLogConfig,
    pub compaction: CompactionConfig,
    /// Blocks one housekeeping step may write before yielding
    pub blocks_per_step: usize,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            segment: SegmentConfig::default(),
            log: InsertLogConfig::default(),
            compaction: CompactionConfig::default(),
            blocks_per_step: crate::config::BLOCKS_PER_STEP,
        }
    }
}

/// Storage engine configuration
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Primary volume: one directory per table
    pub data_dir: PathBuf,
    /// Backup volume, if any
    pub backup_dir: Option<PathBuf>,
    /// Worker threads used for housekeeping
    pub housekeeping_threads: usize,
    /// Unflushed bytes all tables may hold before flushes are forced
    pub max_memory: usize,
    pub table: TableConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            backup_dir: None,
            housekeeping_threads: 2,
            max_memory: crate::config::MAX_MEMORY,
            table: TableConfig::default(),
        }
    }
}
