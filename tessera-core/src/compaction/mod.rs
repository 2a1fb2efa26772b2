//! Flush and merge policy
//!
//! Views call into this module to decide when the in-memory rows should be
//! written to a segment and which adjacent pair of segments to merge next.
//! The merge itself is performed by the view through a [`RowIterator`]
//! over both inputs feeding a [`SegmentWriter`].
//!
//! [`RowIterator`]: crate::iterator::RowIterator
//! [`SegmentWriter`]: crate::segment::SegmentWriter

use crate::config;

/// Compaction configuration
#[derive(Debug, Clone)]
pub struct CompactionConfig {
    /// Flush the row array once it uses this many bytes
    pub flush_memory_threshold: usize,
    /// Flush the row array after this many inserts
    pub flush_update_threshold: usize,
    /// Merge once a view has more segments than this
    pub max_segments: usize,
    /// Segments smaller than this fraction of the target size get merged
    pub min_fill_ratio: f64,
    /// Target segment file size in bytes
    pub target_segment_size: u64,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            flush_memory_threshold: config::FLUSH_MEMORY_THRESHOLD,
            flush_update_threshold: config::FLUSH_UPDATE_THRESHOLD,
            max_segments: config::MAX_SEGMENTS,
            min_fill_ratio: config::MIN_FILL_RATIO,
            target_segment_size: config::TARGET_SEGMENT_SIZE,
        }
    }
}

/// What the policy needs to know about one segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentSummary {
    pub sequence: u64,
    pub file_size: u64,
}

/// A merge of two adjacent segments
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergePlan {
    /// Index of the older input; the newer input is at `older + 1`
    pub older: usize,
    /// Sequence number the merged segment takes over
    pub sequence: u64,
    /// Deleted rows can be discarded because nothing older remains
    pub drop_tombstones: bool,
}

impl CompactionConfig {
    /// True if a row array of this size should be written to a segment
    pub fn should_flush(&self, memory_used: usize, update_count: usize) -> bool {
        (memory_used > 0 && memory_used >= self.flush_memory_threshold)
            || (update_count > 0 && update_count >= self.flush_update_threshold)
    }

    /// Pick the next pair of segments to merge. `segments` must be ordered
    /// by ascending sequence number.
    ///
    /// Over `max_segments`, the adjacent pair with the smallest combined size
    /// is merged. Otherwise a segment below the minimum fill size is merged
    /// with its smaller neighbour.
    pub fn segments_to_merge(&self, segments: &[SegmentSummary]) -> Option<MergePlan> {
        if segments.len() < 2 {
            return None;
        }

        let older = if segments.len() > self.max_segments {
            (0..segments.len() - 1).min_by_key(|&i| segments[i].file_size + segments[i + 1].file_size)?
        } else {
            let min_size = (self.target_segment_size as f64 * self.min_fill_ratio) as u64;
            let (smallest, summary) = segments
                .iter()
                .enumerate()
                .min_by_key(|(_, s)| s.file_size)?;
            if summary.file_size >= min_size {
                return None;
            }
            if smallest == 0 {
                0
            } else if smallest == segments.len() - 1 {
                smallest - 1
            } else if segments[smallest - 1].file_size <= segments[smallest + 1].file_size {
                smallest - 1
            } else {
                smallest
            }
        };

        Some(MergePlan {
            older,
            sequence: segments[older + 1].sequence,
            drop_tombstones: older == 0,
        })
    }
}
