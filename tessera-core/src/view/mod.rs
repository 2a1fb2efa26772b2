//! Views
//!
//! A view holds the rows of a table under one key schema: an in-memory
//! [`RowArray`] backed by an [`InsertLog`], plus immutable [`Segment`]s
//! ordered by sequence number. The primary view (id 0) holds the rows as
//! inserted; secondary views hold rows derived from them.
//!
//! Rows in memory are always newer than rows in segments, and newer
//! segments win over older ones.

mod secondary;

pub use secondary::{
    ColumnEvaluator, ComputedColumns, DerivedRow, EvaluatorRegistry, KeyField, SecondaryViewSpec,
    COMPUTED_FIELD, PRIMARY_KEY_FIELD,
};

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::compaction::SegmentSummary;
use crate::iterator::RowIterator;
use crate::key::RowKey;
use crate::rowset::{OrderedRowSet, RowArray, RowEntry};
use crate::schema::Dimensions;
use crate::segment::format::{FLAG_HAS_ROW_ID, FLAG_SECONDARY_VIEW};
use crate::segment::{Budget, Segment, SegmentWriter};
use crate::storage::TableConfig;
use crate::wal::InsertLog;
use crate::{Datum, Result, RowId, TesseraError};

/// Id of the primary view of every table
pub const PRIMARY_VIEW_ID: u32 = 0;

const SEGMENT_DIR: &str = "segments";
const LOG_DIR: &str = "logs";

/// What a view or table is busy with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum HousekeepingState {
    #[default]
    Ready,
    CreatingSegment,
    MergingSegments,
    BackingUp,
    Restoring,
    UpdatingSecondaryView,
}

impl fmt::Display for HousekeepingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HousekeepingState::Ready => "ready",
            HousekeepingState::CreatingSegment => "creating segment",
            HousekeepingState::MergingSegments => "merging segments",
            HousekeepingState::BackingUp => "backing up",
            HousekeepingState::Restoring => "restoring",
            HousekeepingState::UpdatingSecondaryView => "updating secondary view",
        };
        f.write_str(name)
    }
}

/// Which rows an iterator reads
#[derive(Debug, Clone, Copy, Default)]
pub struct IteratorOptions {
    pub exclude_memory_rows: bool,
    pub exclude_segments: bool,
    /// Also return deleted rows
    pub include_nil: bool,
}

/// Snapshot of a view's bookkeeping
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewStatus {
    pub id: u32,
    pub name: String,
    pub state: HousekeepingState,
    pub up_to_date: bool,
    pub updated_through: u64,
    pub segment_count: usize,
    pub segment_rows: usize,
    pub segment_bytes: u64,
    pub memory_rows: usize,
    pub memory_used: usize,
    pub update_count: usize,
}

/// Rows and high-water mark recovered when a view is opened
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ViewRecovery {
    pub rows_recovered: usize,
    /// Highest segment sequence or row id seen
    pub max_sequence: u64,
}

/// Everything needed to undo one insert
#[derive(Debug)]
pub struct InsertUndo {
    key: RowKey,
    previous: Option<RowEntry>,
    log_position: u64,
    log_generation: u64,
}

/// Rows being written to a segment, and the log that still covers them
struct FrozenRows {
    rows: Arc<RowArray>,
    log_path: PathBuf,
}

enum Job {
    Flush(SegmentWriter),
    Merge {
        writer: SegmentWriter,
        inputs: [Arc<Segment>; 2],
    },
}

impl Job {
    fn writer(&mut self) -> &mut SegmentWriter {
        match self {
            Job::Flush(writer) | Job::Merge { writer, .. } => writer,
        }
    }
}

struct ViewInner {
    rows: Arc<RowArray>,
    frozen: Option<FrozenRows>,
    /// Ascending by sequence
    segments: Vec<Arc<Segment>>,
    log: InsertLog,
    log_generation: u64,
    state: HousekeepingState,
    job: Option<Job>,
    up_to_date: bool,
    updated_through: u64,
}

/// One key schema over a table's rows
pub struct View {
    id: u32,
    name: String,
    dims: Dimensions,
    secondary: Option<SecondaryViewSpec>,
    segment_dir: PathBuf,
    log_dir: PathBuf,
    config: TableConfig,
    inner: Mutex<ViewInner>,
}

struct Snapshot {
    rows: Arc<RowArray>,
    frozen: Option<Arc<RowArray>>,
    segments: Vec<Arc<Segment>>,
}

impl View {
    /// Create an empty view under the table directory `dir`
    pub fn create(
        dir: &Path,
        id: u32,
        name: &str,
        dims: Dimensions,
        secondary: Option<SecondaryViewSpec>,
        config: TableConfig,
    ) -> Result<Self> {
        let segment_dir = dir.join(SEGMENT_DIR);
        let log_dir = dir.join(LOG_DIR);
        fs::create_dir_all(&segment_dir)?;
        fs::create_dir_all(&log_dir)?;

        let log = InsertLog::create(&log_dir.join(log_file_name(id, 0)), config.log.clone())?;
        debug!("Created view {} ({}) in {:?}", id, name, dir);
        Ok(Self::assemble(
            id,
            name,
            dims,
            secondary,
            segment_dir,
            log_dir,
            config,
            ViewInner::new(Arc::default(), Vec::new(), log, 0),
        ))
    }

    /// Open a view, loading its segments and replaying its insert logs.
    /// Segments that fail to open are skipped.
    pub fn open(
        dir: &Path,
        id: u32,
        name: &str,
        dims: Dimensions,
        secondary: Option<SecondaryViewSpec>,
        config: TableConfig,
    ) -> Result<(Self, ViewRecovery)> {
        let segment_dir = dir.join(SEGMENT_DIR);
        let log_dir = dir.join(LOG_DIR);
        fs::create_dir_all(&segment_dir)?;
        fs::create_dir_all(&log_dir)?;

        let segments = open_segments(&segment_dir, id, &dims, config.segment.cache_size)?;

        let mut generations: Vec<(u64, PathBuf)> = list_files(&log_dir)?
            .into_iter()
            .filter_map(|path| {
                let (view, generation) = parse_log_file_name(file_name(&path)?)?;
                (view == id).then_some((generation, path))
            })
            .collect();
        generations.sort();

        let mut rows = RowArray::new();
        let mut recovery = ViewRecovery::default();
        let mut merge_row_id = |records: usize, max_row_id: Option<RowId>| {
            recovery.rows_recovered += records;
            recovery.max_sequence = recovery.max_sequence.max(max_row_id.unwrap_or(0));
        };

        let (log, log_generation) = match generations.as_slice() {
            [] => (
                InsertLog::create(&log_dir.join(log_file_name(id, 0)), config.log.clone())?,
                0,
            ),
            [(generation, path)] => {
                let (log, records, max_row_id) = InsertLog::open(path, &dims, config.log.clone(), &mut rows)?;
                merge_row_id(records, max_row_id);
                (log, *generation)
            }
            [.., (last, _)] => {
                // fold every generation into one fresh log
                for (_, path) in &generations {
                    let (_, records, max_row_id) = InsertLog::open(path, &dims, config.log.clone(), &mut rows)?;
                    merge_row_id(records, max_row_id);
                }
                let generation = last + 1;
                let log = InsertLog::create(&log_dir.join(log_file_name(id, generation)), config.log.clone())?;
                log.rewrite(&rows)?;
                for (_, path) in &generations {
                    fs::remove_file(path)?;
                }
                (log, generation)
            }
        };

        for segment in &segments {
            recovery.max_sequence = recovery.max_sequence.max(segment.sequence());
        }
        info!(
            "Opened view {} ({}): {} segments, {} rows recovered",
            id,
            name,
            segments.len(),
            recovery.rows_recovered
        );

        let view = Self::assemble(
            id,
            name,
            dims,
            secondary,
            segment_dir,
            log_dir,
            config,
            ViewInner::new(Arc::new(rows), segments, log, log_generation),
        );
        Ok((view, recovery))
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble(
        id: u32,
        name: &str,
        dims: Dimensions,
        secondary: Option<SecondaryViewSpec>,
        segment_dir: PathBuf,
        log_dir: PathBuf,
        config: TableConfig,
        inner: ViewInner,
    ) -> Self {
        Self {
            id,
            name: name.to_string(),
            dims,
            secondary,
            segment_dir,
            log_dir,
            config,
            inner: Mutex::new(inner),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dims(&self) -> &Dimensions {
        &self.dims
    }

    /// Derivation rules, for secondary views
    pub fn secondary(&self) -> Option<&SecondaryViewSpec> {
        self.secondary.as_ref()
    }

    pub fn is_secondary(&self) -> bool {
        self.secondary.is_some()
    }

    /// Append a row to the insert log and then to the in-memory rows. A
    /// nil (empty) value deletes the row.
    pub fn insert(&self, key: RowKey, value: Bytes, row_id: RowId) -> Result<InsertUndo> {
        let mut inner = self.inner.lock();
        let log_position = inner.log.position();
        if let Err(e) = inner.log.insert(&key, &value, row_id) {
            if let Err(undo) = inner.log.rollback_to(log_position) {
                warn!("Failed to truncate insert log of view {}: {}", self.id, undo);
            }
            return Err(e);
        }
        let previous = Arc::make_mut(&mut inner.rows).insert(key.clone(), value, row_id);
        Ok(InsertUndo {
            key,
            previous,
            log_position,
            log_generation: inner.log_generation,
        })
    }

    /// Undo an insert. Undo records must be rolled back newest first.
    pub fn rollback(&self, undo: InsertUndo) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.log_generation != undo.log_generation {
            return Err(TesseraError::Internal(format!(
                "insert log of view {} rotated before rollback",
                self.id
            )));
        }
        Arc::make_mut(&mut inner.rows).restore(&undo.key, undo.previous);
        inner.log.rollback_to(undo.log_position)
    }

    /// Value and row id stored under a full key. Deleted rows are `None`.
    pub fn get(&self, key: &[u8]) -> Result<Option<(Bytes, RowId)>> {
        let snapshot = self.snapshot();
        let mut sets: Vec<Arc<dyn OrderedRowSet>> = vec![snapshot.rows as Arc<dyn OrderedRowSet>];
        if let Some(frozen) = snapshot.frozen {
            sets.push(frozen);
        }
        sets.extend(snapshot.segments.into_iter().rev().map(|s| s as Arc<dyn OrderedRowSet>));

        for set in sets {
            if let Some((value, row_id)) = set.find_data(key)? {
                return Ok((!value.is_empty()).then_some((value, row_id)));
            }
        }
        Ok(None)
    }

    /// Iterator over a snapshot of the view
    pub fn iterator(&self, options: IteratorOptions) -> RowIterator {
        let snapshot = self.snapshot();
        let mut rows = RowIterator::new(self.dims.clone());
        if !options.exclude_segments {
            for segment in snapshot.segments {
                rows.add_set(segment);
            }
        }
        if !options.exclude_memory_rows {
            if let Some(frozen) = snapshot.frozen {
                rows.add_set(frozen);
            }
            rows.add_set(snapshot.rows);
        }
        rows.set_include_nil(options.include_nil);
        rows
    }

    fn snapshot(&self) -> Snapshot {
        let inner = self.inner.lock();
        Snapshot {
            rows: inner.rows.clone(),
            frozen: inner.frozen.as_ref().map(|f| f.rows.clone()),
            segments: inner.segments.clone(),
        }
    }

    /// Segments, oldest first
    pub fn segments(&self) -> Vec<Arc<Segment>> {
        self.inner.lock().segments.clone()
    }

    /// Bytes held by in-memory rows, including rows being flushed
    pub fn memory_used(&self) -> usize {
        let inner = self.inner.lock();
        inner.rows.memory_used() + inner.frozen.as_ref().map_or(0, |f| f.rows.memory_used())
    }

    /// True if the in-memory rows crossed a flush threshold
    pub fn needs_flush(&self) -> bool {
        let inner = self.inner.lock();
        self.config
            .compaction
            .should_flush(inner.rows.memory_used(), inner.rows.update_count())
    }

    pub fn has_unsaved_rows(&self) -> bool {
        let inner = self.inner.lock();
        !inner.rows.is_empty() || inner.frozen.is_some()
    }

    pub fn state(&self) -> HousekeepingState {
        self.inner.lock().state
    }

    /// True while a segment write is in progress
    pub fn has_job(&self) -> bool {
        let inner = self.inner.lock();
        inner.job.is_some() || inner.state != HousekeepingState::Ready
    }

    pub fn is_up_to_date(&self) -> bool {
        self.inner.lock().up_to_date
    }

    /// Highest primary segment sequence already derived into this view
    pub fn updated_through(&self) -> u64 {
        self.inner.lock().updated_through
    }

    /// Record how far a secondary view has been derived
    pub fn set_update_state(&self, up_to_date: bool, updated_through: u64) {
        let mut inner = self.inner.lock();
        inner.up_to_date = up_to_date;
        inner.updated_through = updated_through;
    }

    /// Push buffered insert log records to disk
    pub fn sync_log(&self) -> Result<()> {
        self.inner.lock().log.sync()
    }

    pub(crate) fn set_state(&self, state: HousekeepingState) {
        self.inner.lock().state = state;
    }

    pub fn status(&self) -> ViewStatus {
        let inner = self.inner.lock();
        let frozen = inner.frozen.as_ref().map(|f| f.rows.clone());
        ViewStatus {
            id: self.id,
            name: self.name.clone(),
            state: inner.state,
            up_to_date: inner.up_to_date,
            updated_through: inner.updated_through,
            segment_count: inner.segments.len(),
            segment_rows: inner.segments.iter().map(|s| s.count()).sum(),
            segment_bytes: inner.segments.iter().map(|s| s.file_size()).sum(),
            memory_rows: inner.rows.len() + frozen.as_ref().map_or(0, |f| f.len()),
            memory_used: inner.rows.memory_used() + frozen.as_ref().map_or(0, |f| f.memory_used()),
            update_count: inner.rows.update_count(),
        }
    }

    /// Freeze the in-memory rows and start writing them to a segment.
    /// Inserts continue into a fresh row array and a new log generation.
    /// Resumes a flush whose earlier write failed. Returns `false` when
    /// there is nothing to flush or another job is running.
    pub fn begin_flush(&self, sequence: u64) -> Result<bool> {
        let mut inner = self.inner.lock();
        if inner.job.is_some() || inner.state != HousekeepingState::Ready {
            return Ok(false);
        }
        let sequence = next_segment_sequence(&inner, sequence);

        if let Some(frozen) = &inner.frozen {
            let writer = self.new_writer(sequence, vec![frozen.rows.clone() as Arc<dyn OrderedRowSet>], true)?;
            inner.job = Some(Job::Flush(writer));
            inner.state = HousekeepingState::CreatingSegment;
            return Ok(true);
        }
        if inner.rows.is_empty() {
            return Ok(false);
        }

        let rows = inner.rows.clone();
        let writer = self.new_writer(sequence, vec![rows.clone() as Arc<dyn OrderedRowSet>], true)?;
        let generation = inner.log_generation + 1;
        let log = InsertLog::create(&self.log_dir.join(log_file_name(self.id, generation)), self.config.log.clone())?;

        let old_log = std::mem::replace(&mut inner.log, log);
        inner.log_generation = generation;
        inner.rows = Arc::default();
        inner.frozen = Some(FrozenRows {
            rows,
            log_path: old_log.path().to_path_buf(),
        });
        inner.job = Some(Job::Flush(writer));
        inner.state = HousekeepingState::CreatingSegment;
        Ok(true)
    }

    /// Start merging the next pair of segments the compaction policy picks
    pub fn begin_merge(&self) -> Result<bool> {
        let mut inner = self.inner.lock();
        if inner.job.is_some() || inner.state != HousekeepingState::Ready {
            return Ok(false);
        }
        let summaries: Vec<SegmentSummary> = inner
            .segments
            .iter()
            .map(|s| SegmentSummary {
                sequence: s.sequence(),
                file_size: s.file_size(),
            })
            .collect();
        let Some(plan) = self.config.compaction.segments_to_merge(&summaries) else {
            return Ok(false);
        };

        let inputs = [
            inner.segments[plan.older].clone(),
            inner.segments[plan.older + 1].clone(),
        ];
        let writer = self.new_writer(
            plan.sequence,
            inputs.iter().map(|s| s.clone() as Arc<dyn OrderedRowSet>).collect(),
            !plan.drop_tombstones,
        )?;
        debug!(
            "Merging segments {:?} and {:?} of view {}",
            inputs[0].path(),
            inputs[1].path(),
            self.id
        );
        inner.job = Some(Job::Merge { writer, inputs });
        inner.state = HousekeepingState::MergingSegments;
        Ok(true)
    }

    /// Continue the current segment write within `budget`, installing the
    /// segment once complete. Returns `true` when no job remains.
    ///
    /// The write runs without holding the view lock.
    pub fn continue_job(&self, budget: &mut Budget) -> Result<bool> {
        let job = self.inner.lock().job.take();
        let Some(mut job) = job else {
            return Ok(true);
        };

        match job.writer().write_blocks(budget) {
            Ok(true) => {}
            Ok(false) => {
                self.inner.lock().job = Some(job);
                return Ok(false);
            }
            Err(e) => {
                self.abandon(job);
                return Err(e);
            }
        }

        match job {
            Job::Flush(writer) => {
                let result = self.finish_segment(writer);
                let mut inner = self.inner.lock();
                inner.state = HousekeepingState::Ready;
                let segment = result?;
                let rows = segment.count();
                install_segment(&mut inner, segment.clone());
                if let Some(frozen) = inner.frozen.take() {
                    if let Err(e) = fs::remove_file(&frozen.log_path) {
                        warn!("Failed to delete insert log {:?}: {}", frozen.log_path, e);
                    }
                }
                info!(
                    "Flushed {} rows of view {} to {:?}",
                    rows,
                    self.id,
                    segment.path()
                );
            }
            Job::Merge { writer, inputs } => {
                let result = self.finish_segment(writer);
                let mut inner = self.inner.lock();
                inner.state = HousekeepingState::Ready;
                let merged = result?;
                let position = |s: &Arc<Segment>| inner.segments.iter().position(|x| Arc::ptr_eq(x, s));
                match (position(&inputs[0]), position(&inputs[1])) {
                    (Some(older), Some(newer)) => {
                        inner.segments[older] = merged.clone();
                        inner.segments.remove(newer);
                        for input in &inputs {
                            input.mark_for_delete();
                        }
                        info!(
                            "Merged segments of view {} into {:?} ({} rows)",
                            self.id,
                            merged.path(),
                            merged.count()
                        );
                    }
                    _ => merged.mark_for_delete(),
                }
            }
        }
        Ok(true)
    }

    fn abandon(&self, job: Job) {
        let mut inner = self.inner.lock();
        inner.state = HousekeepingState::Ready;
        // frozen rows stay in place and the next flush retries them
        drop(job);
    }

    fn finish_segment(&self, writer: SegmentWriter) -> Result<Arc<Segment>> {
        let path = writer.path().to_path_buf();
        writer.finish()?;
        Ok(Arc::new(Segment::open(
            &path,
            self.dims.clone(),
            self.config.segment.cache_size,
        )?))
    }

    fn new_writer(
        &self,
        sequence: u64,
        sets: Vec<Arc<dyn OrderedRowSet>>,
        include_nil: bool,
    ) -> Result<SegmentWriter> {
        let mut rows = RowIterator::new(self.dims.clone());
        for set in sets {
            rows.add_set(set);
        }
        rows.set_include_nil(include_nil);
        let flags = if self.is_secondary() {
            FLAG_SECONDARY_VIEW
        } else {
            FLAG_HAS_ROW_ID
        };
        let path = self.segment_dir.join(segment_file_name(self.id, sequence));
        SegmentWriter::create(&path, sequence, self.id, flags, rows, self.config.segment.block_size)
    }

    /// Write every in-memory row to a segment now, under the view lock, then
    /// reset the insert log. Returns `true` if any segment was installed.
    pub fn flush_now(&self, sequence: u64) -> Result<bool> {
        let mut installed = self.inner.lock().job.is_some();
        self.continue_job(&mut Budget::unlimited())?;
        if self.inner.lock().frozen.is_some() && self.begin_flush(sequence)? {
            self.continue_job(&mut Budget::unlimited())?;
            installed = true;
        }

        let mut inner = self.inner.lock();
        if inner.rows.is_empty() {
            return Ok(installed);
        }
        let sequence = next_segment_sequence(&inner, sequence);
        let writer = self.new_writer(sequence, vec![inner.rows.clone() as Arc<dyn OrderedRowSet>], true)?;
        let segment = self.finish_segment(writer)?;
        info!(
            "Flushed {} rows of view {} to {:?}",
            segment.count(),
            self.id,
            segment.path()
        );
        install_segment(&mut inner, segment);
        inner.log.reset()?;
        inner.rows = Arc::default();
        Ok(true)
    }

    /// Mark every segment for deletion and remove the insert logs
    pub fn delete_files(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.job = None;
        for segment in &inner.segments {
            segment.mark_for_delete();
        }
        inner.segments.clear();
        inner.frozen = None;
        inner.rows = Arc::default();
        for path in list_files(&self.log_dir)? {
            if file_name(&path)
                .and_then(parse_log_file_name)
                .is_some_and(|(view, _)| view == self.id)
            {
                fs::remove_file(&path)?;
            }
        }
        Ok(())
    }

    /// Describe the view and its segments
    pub fn debug_dump(&self) -> Result<Datum> {
        let status = self.status();
        let mut segments = Vec::new();
        for segment in self.segments() {
            segments.push(segment.debug_dump()?);
        }
        Ok(Datum::structure([
            ("id", Datum::Int64(self.id as i64)),
            ("name", Datum::from(self.name.as_str())),
            ("state", Datum::String(status.state.to_string())),
            ("upToDate", Datum::Bool(status.up_to_date)),
            ("memoryRows", Datum::Int64(status.memory_rows as i64)),
            ("memoryUsed", Datum::Int64(status.memory_used as i64)),
            ("segments", Datum::Array(segments)),
        ]))
    }
}

impl fmt::Debug for View {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("View")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("dims", &self.dims)
            .finish()
    }
}

impl ViewInner {
    fn new(rows: Arc<RowArray>, segments: Vec<Arc<Segment>>, log: InsertLog, log_generation: u64) -> Self {
        Self {
            rows,
            frozen: None,
            segments,
            log,
            log_generation,
            state: HousekeepingState::Ready,
            job: None,
            up_to_date: true,
            updated_through: 0,
        }
    }
}

/// A new segment must sort after every existing one
fn next_segment_sequence(inner: &ViewInner, sequence: u64) -> u64 {
    match inner.segments.last() {
        Some(newest) => sequence.max(newest.sequence() + 1),
        None => sequence,
    }
}

fn install_segment(inner: &mut ViewInner, segment: Arc<Segment>) {
    let position = inner
        .segments
        .partition_point(|s| s.sequence() <= segment.sequence());
    inner.segments.insert(position, segment);
}

fn open_segments(dir: &Path, view_id: u32, dims: &Dimensions, cache_size: usize) -> Result<Vec<Arc<Segment>>> {
    let mut segments = Vec::new();
    for path in list_files(dir)? {
        let Some(name) = file_name(&path) else { continue };
        if name.contains(".tmp-") && name.starts_with(&format!("v{}_", view_id)) {
            // left over from an interrupted write
            let _ = fs::remove_file(&path);
            continue;
        }
        match parse_segment_file_name(name) {
            Some((view, _)) if view == view_id => {}
            _ => continue,
        }
        match Segment::open(&path, dims.clone(), cache_size) {
            Ok(segment) => segments.push(Arc::new(segment)),
            Err(e) => warn!("Skipping segment {:?}: {}", path, e),
        }
    }
    segments.sort_by(|a, b| a.sequence().cmp(&b.sequence()).then_with(|| a.path().cmp(b.path())));
    Ok(segments)
}

fn list_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}

fn file_name(path: &Path) -> Option<&str> {
    path.file_name().and_then(|n| n.to_str())
}

fn segment_file_name(view_id: u32, sequence: u64) -> String {
    format!("v{}_s{:016x}_{}.seg", view_id, sequence, uuid::Uuid::new_v4().simple())
}

/// `(view id, sequence)` of a segment file name
fn parse_segment_file_name(name: &str) -> Option<(u32, u64)> {
    let stem = name.strip_suffix(".seg")?;
    let (view, rest) = stem.strip_prefix('v')?.split_once("_s")?;
    let (sequence, _) = rest.split_once('_')?;
    Some((view.parse().ok()?, u64::from_str_radix(sequence, 16).ok()?))
}

fn log_file_name(view_id: u32, generation: u64) -> String {
    format!("v{}_{:08}.log", view_id, generation)
}

/// `(view id, generation)` of an insert log file name
fn parse_log_file_name(name: &str) -> Option<(u32, u64)> {
    let stem = name.strip_suffix(".log")?;
    let (view, generation) = stem.strip_prefix('v')?.split_once('_')?;
    Some((view.parse().ok()?, generation.parse().ok()?))
}
