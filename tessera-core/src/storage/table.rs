//! Tables
//!
//! A table owns a primary view (id 0) and any number of secondary views.
//! Inserts allocate the next sequence number as the row id, go to the
//! primary view and are fanned out to every up-to-date secondary view; the
//! whole fan-out is applied or rolled back as one.

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::descriptor::{SecondaryViewDesc, TableDescriptor, TableType, DESCRIPTOR_FILE};
use super::volume::{copy_volume, validate_volume};
use super::TableConfig;
use crate::iterator::RowIterator;
use crate::key::{prefix_successor, RowKey};
use crate::rowset::OrderedRowSet;
use crate::schema::Dimensions;
use crate::segment::{Budget, Segment};
use crate::view::{
    DerivedRow, EvaluatorRegistry, HousekeepingState, InsertUndo, IteratorOptions, SecondaryViewSpec, View,
    ViewStatus, PRIMARY_VIEW_ID,
};
use crate::{Datum, Result, RowId, TesseraError};

/// Name of the primary view
pub const PRIMARY_VIEW_NAME: &str = "primary";

/// Flags for [`Table::get_rows`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RowsFlags(u32);

impl RowsFlags {
    /// Start with the first row after the given key (or subtree)
    pub const MORE_ROWS: RowsFlags = RowsFlags(0x0000_0001);
    /// Return each row as `[dim0, .., value]` instead of interleaving keys
    pub const INCLUDE_KEY: RowsFlags = RowsFlags(0x0000_0002);
    /// Return only the values
    pub const NO_KEY: RowsFlags = RowsFlags(0x0000_0004);

    pub fn empty() -> Self {
        Self(0)
    }

    pub fn bits(&self) -> u32 {
        self.0
    }

    pub fn from_bits(bits: u32) -> Self {
        Self(bits & 0x7)
    }

    pub fn contains(&self, other: RowsFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for RowsFlags {
    type Output = RowsFlags;

    fn bitor(self, rhs: RowsFlags) -> RowsFlags {
        RowsFlags(self.0 | rhs.0)
    }
}

/// Table statistics
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TableStats {
    pub name: String,
    pub sequence: u64,
    pub state: HousekeepingState,
    pub rows_recovered: usize,
    pub primary_lost: bool,
    pub backup_needed: bool,
    pub views: Vec<ViewStatus>,
}

enum InsertMode<'a> {
    Replace,
    New,
    Expect(&'a Datum),
}

struct TableInner {
    descriptor: TableDescriptor,
    views: BTreeMap<u32, Arc<View>>,
    sequence: u64,
    primary: PathBuf,
    backup: Option<PathBuf>,
    primary_lost: bool,
    backup_needed: bool,
    state: HousekeepingState,
    deleted: bool,
}

/// Where housekeeping left off
#[derive(Default)]
struct HousekeepingCursor {
    /// View the next pass starts with
    next_view: usize,
    /// Stale secondary view -> (primary segment being derived, next block)
    secondary: HashMap<u32, (u64, usize)>,
}

/// A table and its views
pub struct Table {
    name: String,
    dims: Dimensions,
    config: TableConfig,
    evaluators: EvaluatorRegistry,
    inner: Mutex<TableInner>,
    /// Serializes housekeeping
    housekeeping: Mutex<HousekeepingCursor>,
    rows_recovered: usize,
}

impl Table {
    /// Create a new table in `primary` (the table's own directory), with an
    /// optional backup directory
    pub fn create(
        descriptor: TableDescriptor,
        primary: PathBuf,
        backup: Option<PathBuf>,
        config: TableConfig,
        evaluators: EvaluatorRegistry,
    ) -> Result<Self> {
        descriptor.validate()?;
        for view in &descriptor.secondary_views {
            view.spec.validate(&evaluators)?;
        }
        if primary.join(DESCRIPTOR_FILE).exists() {
            return Err(TesseraError::AlreadyExists(format!("table {}", descriptor.name)));
        }
        fs::create_dir_all(&primary)?;

        let mut descriptor = descriptor;
        for view in &mut descriptor.secondary_views {
            view.up_to_date = true;
            view.updated_through = 0;
        }
        descriptor.save(&primary.join(DESCRIPTOR_FILE))?;

        let mut views = BTreeMap::new();
        views.insert(
            PRIMARY_VIEW_ID,
            Arc::new(View::create(
                &primary,
                PRIMARY_VIEW_ID,
                PRIMARY_VIEW_NAME,
                descriptor.dimensions.clone(),
                None,
                config.clone(),
            )?),
        );
        for view in &descriptor.secondary_views {
            views.insert(
                view.id,
                Arc::new(View::create(
                    &primary,
                    view.id,
                    &view.spec.name,
                    view.spec.dimensions()?,
                    Some(view.spec.clone()),
                    config.clone(),
                )?),
            );
        }

        info!("Created table {} in {:?}", descriptor.name, primary);
        let backup_needed = backup.is_some();
        Ok(Self::assemble(descriptor, views, 0, primary, backup, backup_needed, config, evaluators, 0))
    }

    /// Open a table. If the primary volume is missing or unreadable and a
    /// valid backup exists, the primary is restored from the backup first.
    pub fn open(
        primary: PathBuf,
        backup: Option<PathBuf>,
        config: TableConfig,
        evaluators: EvaluatorRegistry,
    ) -> Result<Self> {
        let descriptor = match validate_volume(&primary) {
            Ok(descriptor) => descriptor,
            Err(e) => {
                let Some(backup_dir) = &backup else { return Err(e) };
                warn!("Primary volume {:?} unusable ({}), restoring from backup", primary, e);
                validate_volume(backup_dir)?;
                copy_volume(backup_dir, &primary)?;
                validate_volume(&primary)?
            }
        };
        let backup_needed = match &backup {
            Some(dir) => validate_volume(dir).is_err(),
            None => false,
        };

        let (views, sequence, rows_recovered) = load_views(&primary, &descriptor, &config)?;
        info!(
            "Opened table {}: {} views, sequence {}, {} rows recovered",
            descriptor.name,
            views.len(),
            sequence,
            rows_recovered
        );
        Ok(Self::assemble(
            descriptor,
            views,
            sequence,
            primary,
            backup,
            backup_needed,
            config,
            evaluators,
            rows_recovered,
        ))
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble(
        descriptor: TableDescriptor,
        views: BTreeMap<u32, Arc<View>>,
        sequence: u64,
        primary: PathBuf,
        backup: Option<PathBuf>,
        backup_needed: bool,
        config: TableConfig,
        evaluators: EvaluatorRegistry,
        rows_recovered: usize,
    ) -> Self {
        Self {
            name: descriptor.name.clone(),
            dims: descriptor.dimensions.clone(),
            config,
            evaluators,
            inner: Mutex::new(TableInner {
                descriptor,
                views,
                sequence,
                primary,
                backup,
                primary_lost: false,
                backup_needed,
                state: HousekeepingState::Ready,
                deleted: false,
            }),
            housekeeping: Mutex::new(HousekeepingCursor::default()),
            rows_recovered,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn table_type(&self) -> TableType {
        self.inner.lock().descriptor.table_type
    }

    /// Primary key dimensions
    pub fn dims(&self) -> &Dimensions {
        &self.dims
    }

    /// Last allocated row id
    pub fn sequence(&self) -> u64 {
        self.inner.lock().sequence
    }

    pub fn rows_recovered(&self) -> usize {
        self.rows_recovered
    }

    pub fn descriptor(&self) -> TableDescriptor {
        self.inner.lock().descriptor.clone()
    }

    /// Insert or replace a row. A nil value deletes the row.
    pub fn insert(&self, key: &RowKey, value: &Datum) -> Result<RowId> {
        self.write_row(key, value, InsertMode::Replace)
    }

    /// Insert a row that must not exist yet
    pub fn insert_new(&self, key: &RowKey, value: &Datum) -> Result<RowId> {
        self.write_row(key, value, InsertMode::New)
    }

    /// Replace a row only if its current value equals `expected` (nil for
    /// a row that must not exist)
    pub fn mutate(&self, key: &RowKey, value: &Datum, expected: &Datum) -> Result<RowId> {
        self.write_row(key, value, InsertMode::Expect(expected))
    }

    fn write_row(&self, key: &RowKey, value: &Datum, mode: InsertMode<'_>) -> Result<RowId> {
        if key.dimension_count() != self.dims.len() {
            return Err(TesseraError::InvalidKey(format!(
                "table {} needs a key of {} dimensions, got {}",
                self.name,
                self.dims.len(),
                key.dimension_count()
            )));
        }
        if key.has_null_dimensions(&self.dims)? {
            return Err(TesseraError::InvalidKey("primary keys cannot contain nil".into()));
        }

        let mut inner = self.inner.lock();
        inner.check_writable(&self.name)?;
        let primary = inner.view(PRIMARY_VIEW_ID)?;

        let previous = match primary.get(key.as_bytes())? {
            Some((bytes, row_id)) => Some((Datum::from_bytes(&bytes)?, row_id)),
            None => None,
        };
        match (&mode, &previous) {
            (InsertMode::New, Some(_)) => {
                return Err(TesseraError::AlreadyExists(format!(
                    "row {} in table {}",
                    key.to_path(&self.dims)?,
                    self.name
                )));
            }
            (InsertMode::Expect(expected), current) => {
                let current = current.as_ref().map(|(d, _)| d).unwrap_or(&Datum::Nil);
                if current.compare(expected).is_ne() {
                    return Err(TesseraError::Conflict(format!(
                        "row {} in table {} has changed",
                        key.to_path(&self.dims)?,
                        self.name
                    )));
                }
            }
            _ => {}
        }

        let row_id = inner.sequence + 1;
        let value_bytes = Bytes::from(value.to_bytes()?);

        // derive everything before the first mutation
        let mut fanout: Vec<(Arc<View>, Vec<DerivedRow>)> = Vec::new();
        for view in inner.views.values().filter(|v| v.is_secondary()) {
            let Some(spec) = view.secondary() else { continue };
            if !view.is_up_to_date() {
                continue;
            }
            let mut rows = match &previous {
                Some((data, old_row_id)) => spec.derive_tombstones(view.dims(), data, *old_row_id)?,
                None => Vec::new(),
            };
            if !value.is_nil() {
                rows.extend(spec.derive_rows(view.dims(), &self.evaluators, &self.dims, key, value, row_id)?);
            }
            fanout.push((view.clone(), rows));
        }

        let mut undo: Vec<(Arc<View>, InsertUndo)> = Vec::new();
        if let Err(e) = apply(&primary, key, value_bytes, row_id, fanout, &mut undo) {
            for (view, record) in undo.into_iter().rev() {
                if let Err(rollback) = view.rollback(record) {
                    warn!("Rollback of view {} in table {} failed: {}", view.id(), self.name, rollback);
                }
            }
            return Err(e);
        }

        inner.sequence = row_id;
        Ok(row_id)
    }

    /// Value and row id stored under a full key of a view
    pub fn get_data(&self, view_id: u32, key: &RowKey) -> Result<Option<(Datum, RowId)>> {
        let view = self.inner.lock().view(view_id)?;
        if key.dimension_count() != view.dims().len() {
            return Err(TesseraError::InvalidKey(format!(
                "view {} needs a key of {} dimensions, got {}",
                view.name(),
                view.dims().len(),
                key.dimension_count()
            )));
        }
        match view.get(key.as_bytes())? {
            Some((bytes, row_id)) => Ok(Some((Datum::from_bytes(&bytes)?, row_id))),
            None => Ok(None),
        }
    }

    /// Iterator over a snapshot of a view
    pub fn iterator(&self, view_id: u32) -> Result<RowIterator> {
        let view = self.inner.lock().view(view_id)?;
        Ok(view.iterator(IteratorOptions::default()))
    }

    /// Read up to `count` rows of a view starting at `start` (or at the
    /// beginning), with optional per-dimension limits.
    ///
    /// By default the result interleaves keys and values:
    /// `[key, value, key, value, ..]`, where each key is the array of its
    /// dimension values.
    pub fn get_rows(
        &self,
        view_id: u32,
        start: Option<&RowKey>,
        count: usize,
        limits: &[Option<usize>],
        flags: RowsFlags,
    ) -> Result<Datum> {
        let view = self.inner.lock().view(view_id)?;
        if !view.is_up_to_date() {
            return Err(TesseraError::Conflict(format!("view {} is being updated", view.name())));
        }
        let dims = view.dims().clone();
        let mut rows = view.iterator(IteratorOptions::default());
        if !limits.is_empty() {
            rows.set_limits(limits.to_vec());
        }
        match start {
            Some(key) if flags.contains(RowsFlags::MORE_ROWS) => match prefix_successor(key.as_bytes()) {
                Some(next) => rows.select_key(&RowKey::from_trusted(next, key.dimension_count()))?,
                None => return Ok(Datum::Array(Vec::new())),
            },
            Some(key) => rows.select_key(key)?,
            None => {}
        }

        let mut result = Vec::new();
        for row in rows.take(count) {
            let row = row?;
            let value = row.datum()?;
            if flags.contains(RowsFlags::NO_KEY) {
                result.push(value);
            } else if flags.contains(RowsFlags::INCLUDE_KEY) {
                let mut item = row.key.decode(&dims)?;
                item.push(value);
                result.push(Datum::Array(item));
            } else {
                result.push(row.key.to_datum(&dims)?);
                result.push(value);
            }
        }
        Ok(Datum::Array(result))
    }

    /// First and last key among the first `count` rows of a view (every
    /// row when `count` is 0), as `[firstKey, lastKey]`. An empty view
    /// gives an empty array.
    pub fn get_key_range(&self, view_id: u32, count: usize) -> Result<Datum> {
        let view = self.inner.lock().view(view_id)?;
        if !view.is_up_to_date() {
            return Err(TesseraError::Conflict(format!("view {} is being updated", view.name())));
        }
        let limit = if count == 0 { usize::MAX } else { count };
        let mut range: Option<(RowKey, RowKey)> = None;
        for row in view.iterator(IteratorOptions::default()).take(limit) {
            let key = row?.key;
            range = match range {
                Some((first, _)) => Some((first, key)),
                None => Some((key.clone(), key)),
            };
        }
        match range {
            Some((first, last)) => Ok(Datum::Array(vec![
                first.to_datum(view.dims())?,
                last.to_datum(view.dims())?,
            ])),
            None => Ok(Datum::Array(Vec::new())),
        }
    }

    /// Key dimensions of a view
    pub fn view_dims(&self, view_id: u32) -> Result<Dimensions> {
        Ok(self.inner.lock().view(view_id)?.dims().clone())
    }

    pub fn view_status(&self, view_id: u32) -> Result<ViewStatus> {
        Ok(self.inner.lock().view(view_id)?.status())
    }

    /// Id of the view with this name. The primary view answers to
    /// `"primary"` and the empty name.
    pub fn find_view(&self, name: &str) -> Option<u32> {
        if name.is_empty() || name == PRIMARY_VIEW_NAME {
            return Some(PRIMARY_VIEW_ID);
        }
        self.inner
            .lock()
            .views
            .values()
            .find(|v| v.name() == name)
            .map(|v| v.id())
    }

    /// Describe a view and its segments
    pub fn debug_dump_view(&self, view_id: u32) -> Result<Datum> {
        self.inner.lock().view(view_id)?.debug_dump()
    }

    /// Add a secondary view. When the table already holds rows the view
    /// starts out stale and is filled in by housekeeping.
    pub fn add_secondary_view(&self, spec: SecondaryViewSpec) -> Result<u32> {
        spec.validate(&self.evaluators)?;
        let dims = spec.dimensions()?;

        let mut inner = self.inner.lock();
        inner.check_writable(&self.name)?;
        if spec.name == PRIMARY_VIEW_NAME || inner.views.values().any(|v| v.name() == spec.name) {
            return Err(TesseraError::AlreadyExists(format!("view {} in table {}", spec.name, self.name)));
        }

        let primary = inner.view(PRIMARY_VIEW_ID)?;
        let has_rows = primary.has_unsaved_rows() || !primary.segments().is_empty();
        let id = inner.descriptor.next_view_id();
        let view = View::create(&inner.primary, id, &spec.name, dims, Some(spec.clone()), self.config.clone())?;
        view.set_update_state(!has_rows, 0);

        inner.descriptor.secondary_views.push(SecondaryViewDesc {
            id,
            spec,
            up_to_date: !has_rows,
            updated_through: 0,
        });
        inner.views.insert(id, Arc::new(view));
        inner.save_descriptor()?;
        inner.backup_needed |= inner.backup.is_some();
        info!("Added view {} to table {}", id, self.name);
        Ok(id)
    }

    /// Remove a secondary view and its files
    pub fn delete_view(&self, view_id: u32) -> Result<()> {
        if view_id == PRIMARY_VIEW_ID {
            return Err(TesseraError::Schema("the primary view cannot be deleted".into()));
        }
        let mut cursor = self.housekeeping.lock();
        cursor.secondary.remove(&view_id);
        let mut inner = self.inner.lock();
        let view = inner
            .views
            .remove(&view_id)
            .ok_or_else(|| TesseraError::ViewNotFound(format!("{} in table {}", view_id, self.name)))?;
        inner.descriptor.secondary_views.retain(|v| v.id != view_id);
        inner.save_descriptor()?;
        inner.backup_needed |= inner.backup.is_some();
        view.delete_files()?;
        info!("Deleted view {} of table {}", view_id, self.name);
        Ok(())
    }

    /// Delete the table and every volume it lives on
    pub fn delete(&self) -> Result<()> {
        let _housekeeping = self.housekeeping.lock();
        let mut inner = self.inner.lock();
        inner.deleted = true;
        for view in inner.views.values() {
            view.delete_files()?;
        }
        inner.views.clear();
        if inner.primary.exists() {
            fs::remove_dir_all(&inner.primary)?;
        }
        if let Some(backup) = inner.backup.as_ref().filter(|b| b.exists()) {
            fs::remove_dir_all(backup)?;
        }
        info!("Deleted table {}", self.name);
        Ok(())
    }

    /// Write the in-memory rows of every view to segments
    pub fn flush(&self) -> Result<()> {
        let _housekeeping = self.housekeeping.lock();
        let mut inner = self.inner.lock();
        inner.check_writable(&self.name)?;
        let mut installed = false;
        let mut result = Ok(());
        for view in inner.views.values() {
            match view.flush_now(inner.sequence) {
                Ok(did) => installed |= did,
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }
        if installed {
            inner.backup_needed |= inner.backup.is_some();
        }
        result
    }

    pub fn stats(&self) -> TableStats {
        let inner = self.inner.lock();
        TableStats {
            name: self.name.clone(),
            sequence: inner.sequence,
            state: inner.state,
            rows_recovered: self.rows_recovered,
            primary_lost: inner.primary_lost,
            backup_needed: inner.backup_needed,
            views: inner.views.values().map(|v| v.status()).collect(),
        }
    }

    /// Bytes of rows not yet written to segments
    pub fn memory_used(&self) -> usize {
        self.inner.lock().views.values().map(|v| v.memory_used()).sum()
    }

    /// Record that a volume is gone. A lost primary blocks writes until
    /// [`repair_from_backup`](Self::repair_from_backup); a lost backup is
    /// recreated by housekeeping.
    pub fn mark_volume_lost(&self, primary: bool) {
        let mut inner = self.inner.lock();
        if primary {
            warn!("Primary volume of table {} lost", self.name);
            inner.primary_lost = true;
        } else if inner.backup.is_some() {
            warn!("Backup volume of table {} lost", self.name);
            inner.backup_needed = true;
        }
    }

    /// Copy the backup over the primary volume and reopen every view
    pub fn repair_from_backup(&self) -> Result<()> {
        let mut cursor = self.housekeeping.lock();
        cursor.secondary.clear();
        let mut inner = self.inner.lock();
        let backup = inner
            .backup
            .clone()
            .ok_or_else(|| TesseraError::Config(format!("table {} has no backup volume", self.name)))?;
        validate_volume(&backup)?;

        inner.state = HousekeepingState::Restoring;
        let result = (|| {
            copy_volume(&backup, &inner.primary)?;
            let descriptor = validate_volume(&inner.primary)?;
            let (views, sequence, _) = load_views(&inner.primary, &descriptor, &self.config)?;
            Ok::<_, TesseraError>((descriptor, views, sequence))
        })();
        inner.state = HousekeepingState::Ready;

        let (descriptor, views, sequence) = result?;
        inner.descriptor = descriptor;
        inner.views = views;
        inner.sequence = inner.sequence.max(sequence);
        inner.primary_lost = false;
        info!("Restored table {} from {:?}", self.name, backup);
        Ok(())
    }

    /// Do at most one unit of work per view: continue a segment write, fill
    /// in a stale secondary view, flush rows, or merge segments. Flushes
    /// wait until a view crosses its own thresholds or the table holds more
    /// than `max_memory` unflushed bytes (0 disables the ceiling).
    ///
    /// Returns `true` if anything was done.
    pub fn housekeeping(&self, max_memory: usize) -> Result<bool> {
        let over_memory = max_memory > 0 && self.memory_used() > max_memory;
        self.housekeeping_step(over_memory)
    }

    /// One housekeeping pass. `over_memory` forces every view holding
    /// unflushed rows to flush, for callers that enforce a memory ceiling
    /// across several tables.
    pub fn housekeeping_step(&self, over_memory: bool) -> Result<bool> {
        let Some(mut cursor) = self.housekeeping.try_lock() else {
            return Ok(false);
        };

        let (views, backup_needed) = {
            let inner = self.inner.lock();
            if inner.deleted || inner.primary_lost {
                return Ok(false);
            }
            (inner.views.values().cloned().collect::<Vec<_>>(), inner.backup_needed)
        };

        if backup_needed {
            self.backup()?;
            return Ok(true);
        }

        // stale views track primary segments by sequence, so primary merges wait
        let catching_up = views.iter().any(|v| v.is_secondary() && !v.is_up_to_date());
        let mut worked = false;
        let start = cursor.next_view % views.len().max(1);
        for view in views.iter().cycle().skip(start).take(views.len()) {
            let may_merge = !(catching_up && view.id() == PRIMARY_VIEW_ID);
            match self.view_step(view, over_memory, may_merge, &mut cursor.secondary) {
                Ok(did) => worked |= did,
                Err(e) => warn!("Housekeeping of view {} in table {} failed: {}", view.id(), self.name, e),
            }
        }
        cursor.next_view = start + 1;
        Ok(worked)
    }

    fn view_step(
        &self,
        view: &Arc<View>,
        over_memory: bool,
        may_merge: bool,
        progress: &mut HashMap<u32, (u64, usize)>,
    ) -> Result<bool> {
        let mut budget = Budget::blocks(self.config.blocks_per_step);
        if view.is_secondary() && !view.is_up_to_date() && !view.has_job() {
            self.update_secondary_view(view, &mut budget, progress)?;
            return Ok(true);
        }

        let mut started = view.has_job();
        if !started && (view.needs_flush() || (over_memory && view.has_unsaved_rows())) {
            let inner = self.inner.lock();
            started = view.begin_flush(inner.sequence)?;
        }
        if !started && may_merge {
            started = view.begin_merge()?;
        }
        if !started {
            return Ok(false);
        }
        if view.continue_job(&mut budget)? {
            let mut inner = self.inner.lock();
            inner.backup_needed |= inner.backup.is_some();
        }
        Ok(true)
    }

    /// Derive the next blocks of the oldest primary segment a stale
    /// secondary view has not seen. Once every segment is done, derive the
    /// in-memory rows and mark the view up to date.
    fn update_secondary_view(
        &self,
        view: &Arc<View>,
        budget: &mut Budget,
        progress: &mut HashMap<u32, (u64, usize)>,
    ) -> Result<()> {
        let Some(spec) = view.secondary() else {
            return Ok(());
        };
        let before = (view.is_up_to_date(), view.updated_through());
        view.set_state(HousekeepingState::UpdatingSecondaryView);
        let result = self.update_secondary_step(view, spec, budget, progress);
        view.set_state(HousekeepingState::Ready);
        result?;

        let (up_to_date, updated_through) = (view.is_up_to_date(), view.updated_through());
        if (up_to_date, updated_through) == before {
            return Ok(());
        }
        let mut inner = self.inner.lock();
        if let Some(desc) = inner.descriptor.secondary_views.iter_mut().find(|v| v.id == view.id()) {
            desc.up_to_date = up_to_date;
            desc.updated_through = updated_through;
        }
        inner.save_descriptor()
    }

    fn update_secondary_step(
        &self,
        view: &Arc<View>,
        spec: &SecondaryViewSpec,
        budget: &mut Budget,
        progress: &mut HashMap<u32, (u64, usize)>,
    ) -> Result<()> {
        let primary = self.inner.lock().view(PRIMARY_VIEW_ID)?;
        let through = view.updated_through();
        let segments = primary.segments();

        if let Some(segment) = segments.iter().find(|s| s.sequence() > through) {
            let older: Vec<Arc<Segment>> = segments
                .iter()
                .filter(|s| s.sequence() < segment.sequence())
                .cloned()
                .collect();
            let mut block = match progress.get(&view.id()) {
                Some(&(sequence, block)) if sequence == segment.sequence() => block,
                _ => 0,
            };
            // at least one block per step
            while block < segment.block_count() {
                for i in segment.block_rows(block) {
                    let row = segment.row(i)?;
                    self.derive_into(view, spec, &older, &row.key, &row.value, row.row_id)?;
                }
                block += 1;
                progress.insert(view.id(), (segment.sequence(), block));
                budget.charge_block();
                if budget.is_exhausted() {
                    break;
                }
            }
            if block < segment.block_count() {
                debug!(
                    "View {} of table {} derived {} of {} blocks of segment {}",
                    view.id(),
                    self.name,
                    block,
                    segment.block_count(),
                    segment.sequence()
                );
                return Ok(());
            }

            progress.remove(&view.id());
            view.set_update_state(false, segment.sequence());
            info!(
                "View {} of table {} updated through sequence {}",
                view.id(),
                self.name,
                segment.sequence()
            );
            return Ok(());
        }

        // block inserts while the in-memory rows are derived
        let _inner = self.inner.lock();
        let rows = primary.iterator(IteratorOptions {
            exclude_segments: true,
            include_nil: true,
            ..Default::default()
        });
        for row in rows {
            let row = row?;
            self.derive_into(view, spec, &segments, &row.key, &row.value, row.row_id)?;
        }
        progress.remove(&view.id());
        view.set_update_state(true, through);
        info!("View {} of table {} is up to date", view.id(), self.name);
        Ok(())
    }

    /// Write the rows one source row derives, tombstoning what its previous
    /// version (the newest one in `older`) derived
    fn derive_into(
        &self,
        view: &View,
        spec: &SecondaryViewSpec,
        older: &[Arc<Segment>],
        key: &RowKey,
        value: &Bytes,
        row_id: RowId,
    ) -> Result<()> {
        let mut rows = Vec::new();
        for segment in older.iter().rev() {
            if let Some((previous, previous_id)) = segment.find_data(key.as_bytes())? {
                if !previous.is_empty() {
                    rows.extend(spec.derive_tombstones(view.dims(), &Datum::from_bytes(&previous)?, previous_id)?);
                }
                break;
            }
        }
        if !value.is_empty() {
            let data = Datum::from_bytes(value)?;
            rows.extend(spec.derive_rows(view.dims(), &self.evaluators, &self.dims, key, &data, row_id)?);
        }
        for row in rows {
            view.insert(row.key, row.value, row_id)?;
        }
        Ok(())
    }

    /// Copy the primary volume to the backup volume
    fn backup(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        let Some(backup) = inner.backup.clone() else {
            inner.backup_needed = false;
            return Ok(());
        };
        inner.state = HousekeepingState::BackingUp;
        let result = inner
            .views
            .values()
            .try_for_each(|view| view.sync_log())
            .and_then(|_| copy_volume(&inner.primary, &backup));
        inner.state = HousekeepingState::Ready;
        let stats = result?;
        inner.backup_needed = false;
        info!(
            "Backed up table {} to {:?}: {} files, {} bytes",
            self.name, backup, stats.files, stats.bytes
        );
        Ok(())
    }
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table")
            .field("name", &self.name)
            .field("dims", &self.dims)
            .finish()
    }
}

impl TableInner {
    fn view(&self, view_id: u32) -> Result<Arc<View>> {
        self.views
            .get(&view_id)
            .cloned()
            .ok_or_else(|| TesseraError::ViewNotFound(format!("{} in table {}", view_id, self.descriptor.name)))
    }

    fn check_writable(&self, name: &str) -> Result<()> {
        if self.deleted {
            return Err(TesseraError::TableNotFound(name.to_string()));
        }
        if self.primary_lost {
            return Err(TesseraError::Internal(format!("primary volume of table {} is lost", name)));
        }
        Ok(())
    }

    fn save_descriptor(&self) -> Result<()> {
        self.descriptor.save(&self.primary.join(DESCRIPTOR_FILE))
    }
}

/// Apply a primary insert and its fan-out, recording undo information for
/// every write that succeeded
fn apply(
    primary: &Arc<View>,
    key: &RowKey,
    value: Bytes,
    row_id: RowId,
    fanout: Vec<(Arc<View>, Vec<DerivedRow>)>,
    undo: &mut Vec<(Arc<View>, InsertUndo)>,
) -> Result<()> {
    undo.push((primary.clone(), primary.insert(key.clone(), value, row_id)?));
    for (view, rows) in fanout {
        for row in rows {
            let record = view.insert(row.key, row.value, row_id)?;
            undo.push((view.clone(), record));
        }
    }
    Ok(())
}

/// Open every view of a table. Returns the views, the recovered sequence
/// number and the number of log records replayed.
fn load_views(
    dir: &Path,
    descriptor: &TableDescriptor,
    config: &TableConfig,
) -> Result<(BTreeMap<u32, Arc<View>>, u64, usize)> {
    let mut views = BTreeMap::new();
    let mut sequence = 0;
    let mut recovered = 0;

    let (primary, recovery) = View::open(
        dir,
        PRIMARY_VIEW_ID,
        PRIMARY_VIEW_NAME,
        descriptor.dimensions.clone(),
        None,
        config.clone(),
    )?;
    sequence = sequence.max(recovery.max_sequence);
    recovered += recovery.rows_recovered;
    views.insert(PRIMARY_VIEW_ID, Arc::new(primary));

    for desc in &descriptor.secondary_views {
        let (view, recovery) = View::open(
            dir,
            desc.id,
            &desc.spec.name,
            desc.spec.dimensions()?,
            Some(desc.spec.clone()),
            config.clone(),
        )?;
        view.set_update_state(desc.up_to_date, desc.updated_through);
        sequence = sequence.max(recovery.max_sequence);
        recovered += recovery.rows_recovered;
        views.insert(desc.id, Arc::new(view));
    }
    Ok((views, sequence, recovered))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{DimensionDesc, KeyType};
    use crate::storage::SegmentConfig;
    use crate::view::KeyField;
    use crate::wal::{InsertLogConfig, SyncPolicy};
    use tempfile::TempDir;

    fn descriptor() -> TableDescriptor {
        TableDescriptor::new(
            "Fruit",
            Dimensions::new(vec![DimensionDesc::new(KeyType::Utf8)]).unwrap(),
        )
    }

    fn by_color() -> SecondaryViewSpec {
        SecondaryViewSpec {
            name: "byColor".into(),
            key_fields: vec![KeyField::new("color", DimensionDesc::new(KeyType::Utf8))],
            columns: vec!["price".into()],
            computed: None,
            exclude_nil_keys: true,
        }
    }

    fn create(dir: &TempDir) -> Table {
        Table::create(
            descriptor(),
            dir.path().join("Fruit"),
            None,
            TableConfig::default(),
            EvaluatorRegistry::new(),
        )
        .unwrap()
    }

    fn with_backup(dir: &TempDir, config: TableConfig) -> (Table, PathBuf, PathBuf) {
        let primary = dir.path().join("data").join("Fruit");
        let backup = dir.path().join("backup").join("Fruit");
        let table = Table::create(
            descriptor(),
            primary.clone(),
            Some(backup.clone()),
            config,
            EvaluatorRegistry::new(),
        )
        .unwrap();
        (table, primary, backup)
    }

    fn key(table: &Table, name: &str) -> RowKey {
        RowKey::encode(table.dims(), &[Datum::from(name)]).unwrap()
    }

    fn fruit(color: &str, price: i64) -> Datum {
        Datum::structure([("color", Datum::from(color)), ("price", Datum::Int64(price))])
    }

    fn colors(table: &Table, view: u32) -> Vec<String> {
        let rows = table
            .get_rows(view, None, 100, &[], RowsFlags::INCLUDE_KEY)
            .unwrap();
        (0..rows.count())
            .map(|i| rows.element(i).unwrap().element(0).unwrap().to_string())
            .collect()
    }

    #[test]
    fn test_insert_modes() {
        let dir = TempDir::new().unwrap();
        let table = create(&dir);
        let apple = key(&table, "apple");

        assert_eq!(table.insert(&apple, &fruit("red", 3)).unwrap(), 1);
        assert!(matches!(
            table.insert_new(&apple, &fruit("green", 2)),
            Err(TesseraError::AlreadyExists(_))
        ));
        assert!(matches!(
            table.mutate(&apple, &fruit("green", 2), &fruit("red", 4)),
            Err(TesseraError::Conflict(_))
        ));
        assert_eq!(table.mutate(&apple, &fruit("green", 2), &fruit("red", 3)).unwrap(), 2);

        let (value, row_id) = table.get_data(PRIMARY_VIEW_ID, &apple).unwrap().unwrap();
        assert_eq!(value, fruit("green", 2));
        assert_eq!(row_id, 2);
        assert_eq!(table.sequence(), 2);

        let partial = RowKey::empty();
        assert!(matches!(table.insert(&partial, &fruit("x", 1)), Err(TesseraError::InvalidKey(_))));
        assert_eq!(table.sequence(), 2);
    }

    #[test]
    fn test_secondary_fanout_and_update() {
        let dir = TempDir::new().unwrap();
        let table = create(&dir);
        let view = table.add_secondary_view(by_color()).unwrap();
        assert!(table.view_status(view).unwrap().up_to_date);

        table.insert(&key(&table, "apple"), &fruit("red", 3)).unwrap();
        table.insert(&key(&table, "banana"), &fruit("yellow", 1)).unwrap();
        table.insert(&key(&table, "cherry"), &fruit("red", 9)).unwrap();
        assert_eq!(colors(&table, view), vec!["red", "red", "yellow"]);

        // an update moves the derived row
        table.insert(&key(&table, "apple"), &fruit("green", 3)).unwrap();
        assert_eq!(colors(&table, view), vec!["green", "red", "yellow"]);

        // a delete removes it
        table.insert(&key(&table, "banana"), &Datum::Nil).unwrap();
        assert_eq!(colors(&table, view), vec!["green", "red"]);
        assert_eq!(table.find_view("byColor"), Some(view));
    }

    #[test]
    fn test_stale_view_catches_up() {
        let dir = TempDir::new().unwrap();
        let table = create(&dir);
        table.insert(&key(&table, "apple"), &fruit("red", 3)).unwrap();
        table.insert(&key(&table, "banana"), &fruit("yellow", 1)).unwrap();
        table.flush().unwrap();
        table.insert(&key(&table, "apple"), &fruit("green", 3)).unwrap();

        let view = table.add_secondary_view(by_color()).unwrap();
        assert!(!table.view_status(view).unwrap().up_to_date);
        assert!(matches!(
            table.get_rows(view, None, 10, &[], RowsFlags::empty()),
            Err(TesseraError::Conflict(_))
        ));

        // live inserts skip the stale view and are picked up from memory
        table.insert(&key(&table, "cherry"), &fruit("red", 9)).unwrap();
        for _ in 0..4 {
            table.housekeeping(0).unwrap();
        }
        assert!(table.view_status(view).unwrap().up_to_date);
        assert_eq!(colors(&table, view), vec!["green", "red", "yellow"]);

        let desc = table.descriptor();
        assert!(desc.secondary_views[0].up_to_date);
    }

    #[test]
    fn test_catch_up_is_spread_over_steps() {
        let dir = TempDir::new().unwrap();
        let config = TableConfig {
            segment: SegmentConfig {
                block_size: 128,
                ..Default::default()
            },
            blocks_per_step: 1,
            ..Default::default()
        };
        let table = Table::create(
            descriptor(),
            dir.path().join("Fruit"),
            None,
            config,
            EvaluatorRegistry::new(),
        )
        .unwrap();
        let palette = ["red", "green", "yellow"];
        for i in 0..40 {
            table
                .insert(&key(&table, &format!("fruit{:02}", i)), &fruit(palette[i % 3], i as i64))
                .unwrap();
        }
        table.flush().unwrap();
        let blocks = table.inner.lock().view(PRIMARY_VIEW_ID).unwrap().segments()[0].block_count();
        assert!(blocks > 3);

        let view = table.add_secondary_view(by_color()).unwrap();
        let mut steps = 0;
        while !table.view_status(view).unwrap().up_to_date {
            assert!(table.housekeeping(0).unwrap());
            steps += 1;
            if steps < blocks {
                assert_eq!(table.descriptor().secondary_views[0].updated_through, 0);
            }
            assert!(steps <= blocks + 1);
        }
        // one block per step, then one step for the in-memory rows
        assert_eq!(steps, blocks + 1);

        let derived = colors(&table, view);
        assert_eq!(derived.len(), 40);
        assert!(derived.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_key_range() {
        let dir = TempDir::new().unwrap();
        let table = create(&dir);
        assert_eq!(table.get_key_range(PRIMARY_VIEW_ID, 0).unwrap(), Datum::Array(Vec::new()));

        for name in ["d", "a", "c", "b"] {
            table.insert(&key(&table, name), &Datum::from(name)).unwrap();
        }
        table.flush().unwrap();
        table.insert(&key(&table, "e"), &Datum::from("e")).unwrap();

        let path = |name: &str| Datum::Array(vec![Datum::from(name)]);
        assert_eq!(
            table.get_key_range(PRIMARY_VIEW_ID, 0).unwrap(),
            Datum::Array(vec![path("a"), path("e")])
        );
        assert_eq!(
            table.get_key_range(PRIMARY_VIEW_ID, 2).unwrap(),
            Datum::Array(vec![path("a"), path("b")])
        );

        // deleted rows are not part of the range
        table.insert(&key(&table, "e"), &Datum::Nil).unwrap();
        table.insert(&key(&table, "a"), &Datum::Nil).unwrap();
        assert_eq!(
            table.get_key_range(PRIMARY_VIEW_ID, 0).unwrap(),
            Datum::Array(vec![path("b"), path("d")])
        );
        assert!(matches!(table.get_key_range(7, 0), Err(TesseraError::ViewNotFound(_))));
    }

    #[test]
    fn test_failed_fanout_rolls_back() {
        let dir = TempDir::new().unwrap();
        let table = create(&dir);
        let view = table.add_secondary_view(by_color()).unwrap();
        table.insert(&key(&table, "apple"), &fruit("red", 3)).unwrap();

        // a color that cannot be a utf8 key fails derivation before any write
        let bad = Datum::structure([("color", Datum::Double(1.5))]);
        assert!(table.insert(&key(&table, "apple"), &bad).is_err());
        assert_eq!(table.sequence(), 1);
        assert_eq!(
            table.get_data(PRIMARY_VIEW_ID, &key(&table, "apple")).unwrap().unwrap().0,
            fruit("red", 3)
        );
        assert_eq!(colors(&table, view), vec!["red"]);
    }

    #[test]
    fn test_get_rows_paging() {
        let dir = TempDir::new().unwrap();
        let table = create(&dir);
        for name in ["a", "b", "c", "d", "e"] {
            table.insert(&key(&table, name), &Datum::from(name)).unwrap();
        }

        let page = table.get_rows(PRIMARY_VIEW_ID, None, 2, &[], RowsFlags::empty()).unwrap();
        assert_eq!(page.count(), 4);
        assert_eq!(page.element(0), Some(&Datum::Array(vec![Datum::from("a")])));
        assert_eq!(page.element(1), Some(&Datum::from("a")));

        let next = table
            .get_rows(PRIMARY_VIEW_ID, Some(&key(&table, "b")), 2, &[], RowsFlags::MORE_ROWS | RowsFlags::NO_KEY)
            .unwrap();
        assert_eq!(next, Datum::Array(vec![Datum::from("c"), Datum::from("d")]));

        let from = table
            .get_rows(PRIMARY_VIEW_ID, Some(&key(&table, "d")), 10, &[], RowsFlags::NO_KEY)
            .unwrap();
        assert_eq!(from.count(), 2);
    }

    #[test]
    fn test_backup_and_repair() {
        let dir = TempDir::new().unwrap();
        let (table, primary, backup) = with_backup(&dir, TableConfig::default());
        table.insert(&key(&table, "apple"), &fruit("red", 3)).unwrap();
        table.flush().unwrap();
        assert!(table.stats().backup_needed);
        assert!(table.housekeeping(0).unwrap());
        assert!(!table.stats().backup_needed);
        assert!(validate_volume(&backup).is_ok());

        table.mark_volume_lost(true);
        assert!(table.insert(&key(&table, "pear"), &fruit("green", 1)).is_err());
        fs::remove_dir_all(&primary).unwrap();
        table.repair_from_backup().unwrap();
        assert_eq!(
            table.get_data(PRIMARY_VIEW_ID, &key(&table, "apple")).unwrap().unwrap().0,
            fruit("red", 3)
        );
        table.insert(&key(&table, "pear"), &fruit("green", 1)).unwrap();
    }

    #[test]
    fn test_new_segments_refresh_the_backup() {
        let dir = TempDir::new().unwrap();
        let (table, primary, _backup) = with_backup(&dir, TableConfig::default());
        table.insert(&key(&table, "apple"), &fruit("red", 3)).unwrap();
        table.flush().unwrap();
        assert!(table.housekeeping(0).unwrap());
        assert!(!table.stats().backup_needed);

        // an explicit flush makes the backup stale
        table.insert(&key(&table, "pear"), &fruit("green", 1)).unwrap();
        table.flush().unwrap();
        assert!(table.stats().backup_needed);
        for _ in 0..5 {
            table.housekeeping(0).unwrap();
        }
        assert!(!table.stats().backup_needed);

        // so does a flush housekeeping starts on its own
        table.insert(&key(&table, "kiwi"), &fruit("brown", 2)).unwrap();
        assert!(table.housekeeping(1).unwrap());
        assert_eq!(table.memory_used(), 0);
        assert!(table.stats().backup_needed);
        assert!(table.housekeeping(0).unwrap());
        assert!(!table.stats().backup_needed);

        // flushing nothing leaves the backup alone
        table.flush().unwrap();
        assert!(!table.stats().backup_needed);

        table.mark_volume_lost(true);
        fs::remove_dir_all(&primary).unwrap();
        table.repair_from_backup().unwrap();
        for (name, color) in [("apple", "red"), ("pear", "green"), ("kiwi", "brown")] {
            let (value, _) = table.get_data(PRIMARY_VIEW_ID, &key(&table, name)).unwrap().unwrap();
            assert_eq!(value.field("color"), Some(&Datum::from(color)));
        }
    }

    #[test]
    fn test_backup_includes_buffered_log_records() {
        let dir = TempDir::new().unwrap();
        let config = TableConfig {
            log: InsertLogConfig {
                sync_policy: SyncPolicy::None,
            },
            ..Default::default()
        };
        let (table, primary, _backup) = with_backup(&dir, config);
        table.insert(&key(&table, "apple"), &fruit("red", 3)).unwrap();
        assert!(table.housekeeping(0).unwrap());
        assert!(!table.stats().backup_needed);

        table.mark_volume_lost(true);
        fs::remove_dir_all(&primary).unwrap();
        table.repair_from_backup().unwrap();
        assert_eq!(
            table.get_data(PRIMARY_VIEW_ID, &key(&table, "apple")).unwrap().unwrap().0,
            fruit("red", 3)
        );
    }

    #[test]
    fn test_delete_view_and_table() {
        let dir = TempDir::new().unwrap();
        let table = create(&dir);
        let view = table.add_secondary_view(by_color()).unwrap();
        assert!(table.add_secondary_view(by_color()).is_err());
        assert!(table.delete_view(PRIMARY_VIEW_ID).is_err());
        table.delete_view(view).unwrap();
        assert!(table.view_status(view).is_err());
        assert_eq!(table.find_view("byColor"), None);

        table.delete().unwrap();
        assert!(!dir.path().join("Fruit").exists());
        assert!(matches!(
            table.insert(&key(&table, "apple"), &fruit("red", 1)),
            Err(TesseraError::TableNotFound(_))
        ));
    }
}
