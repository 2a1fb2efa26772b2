//! Merging row iterator
//!
//! Merges any number of ordered row sets into one ordered, deduplicated
//! stream. Sets added later take priority: when several sets hold the same
//! key only the row from the latest set is returned. Views add their segments
//! oldest first and the in-memory rows last, so the newest write wins.

use std::sync::Arc;

use crate::key::{prefix_successor, RowKey};
use crate::rowset::{OrderedRowSet, RowEntry};
use crate::schema::Dimensions;
use crate::Result;

struct Cursor {
    set: Arc<dyn OrderedRowSet>,
    pos: usize,
    current: Option<RowEntry>,
}

impl Cursor {
    fn load(&mut self) -> Result<()> {
        self.current = if self.pos < self.set.count() {
            Some(self.set.row(self.pos)?)
        } else {
            None
        };
        Ok(())
    }

    fn seek(&mut self, key: &[u8]) -> Result<()> {
        self.pos = self.set.lower_bound(key)?;
        self.load()
    }

    fn advance(&mut self) -> Result<()> {
        self.pos += 1;
        self.load()
    }

    fn exhaust(&mut self) {
        self.pos = self.set.count();
        self.current = None;
    }
}

/// Key of the last emitted row and how many distinct values each dimension
/// has produced under its current parent
#[derive(Default)]
struct LimitState {
    prev: Option<(Vec<u8>, Vec<usize>)>,
    counts: Vec<usize>,
}

enum LimitCheck {
    Emit(Vec<usize>, Vec<usize>),
    SkipParent(Vec<u8>),
    Finished,
}

/// Ordered, deduplicated stream over several row sets
pub struct RowIterator {
    dims: Dimensions,
    cursors: Vec<Cursor>,
    include_nil: bool,
    limits: Vec<Option<usize>>,
    limit_state: LimitState,
    start: Option<Vec<u8>>,
    started: bool,
    done: bool,
}

impl RowIterator {
    /// Create an iterator over keys of the given schema
    pub fn new(dims: Dimensions) -> Self {
        Self {
            dims,
            cursors: Vec::new(),
            include_nil: false,
            limits: Vec::new(),
            limit_state: LimitState::default(),
            start: None,
            started: false,
            done: false,
        }
    }

    /// Add a set with higher priority than every set added before it
    pub fn add_set(&mut self, set: Arc<dyn OrderedRowSet>) {
        self.cursors.push(Cursor {
            set,
            pos: 0,
            current: None,
        });
        self.started = false;
    }

    /// Also return deleted (nil) rows
    pub fn set_include_nil(&mut self, include_nil: bool) {
        self.include_nil = include_nil;
    }

    /// Limit how many distinct values each dimension may produce under the
    /// same parent. `None` means unlimited. Exceeding the limit of the first
    /// dimension ends the iteration.
    pub fn set_limits(&mut self, limits: Vec<Option<usize>>) {
        self.limits = limits;
        self.limit_state = LimitState::default();
    }

    /// Position every set at the first key `>= key`. A partial key selects
    /// the start of its subtree.
    pub fn select_key(&mut self, key: &RowKey) -> Result<()> {
        self.start = Some(key.as_bytes().to_vec());
        self.restart()
    }

    /// Start over from the beginning (or from the selected key)
    pub fn reset(&mut self) -> Result<()> {
        self.restart()
    }

    /// True if any set still has rows to visit
    pub fn has_more(&mut self) -> Result<bool> {
        self.ensure_started()?;
        Ok(!self.done && self.cursors.iter().any(|c| c.current.is_some()))
    }

    fn ensure_started(&mut self) -> Result<()> {
        if !self.started {
            self.restart()?;
        }
        Ok(())
    }

    fn restart(&mut self) -> Result<()> {
        let start = self.start.clone().unwrap_or_default();
        for cursor in &mut self.cursors {
            cursor.seek(&start)?;
        }
        self.limit_state = LimitState::default();
        self.started = true;
        self.done = false;
        Ok(())
    }

    fn seek_all(&mut self, key: Option<&[u8]>) -> Result<()> {
        for cursor in &mut self.cursors {
            match key {
                Some(key) => cursor.seek(key)?,
                None => cursor.exhaust(),
            }
        }
        Ok(())
    }

    /// Take the smallest key across all cursors, preferring the latest set on
    /// ties, and advance every cursor positioned on that key.
    fn next_merged(&mut self) -> Result<Option<RowEntry>> {
        let mut best: Option<usize> = None;
        for (i, cursor) in self.cursors.iter().enumerate() {
            let Some(row) = &cursor.current else { continue };
            best = match best {
                Some(b) => {
                    let best_key = self.cursors[b].current.as_ref().map(|r| r.key.as_bytes());
                    if Some(row.key.as_bytes()) <= best_key {
                        Some(i)
                    } else {
                        Some(b)
                    }
                }
                None => Some(i),
            };
        }

        let Some(best) = best else { return Ok(None) };
        let winner = self.cursors[best].current.clone();
        if let Some(row) = &winner {
            let key = row.key.as_bytes().to_vec();
            for cursor in &mut self.cursors {
                if cursor.current.as_ref().map(|r| r.key.as_bytes()) == Some(key.as_slice()) {
                    cursor.advance()?;
                }
            }
        }
        Ok(winner)
    }

    fn check_limits(&self, row: &RowEntry) -> Result<LimitCheck> {
        let key = row.key.as_bytes();
        let ends = row.key.part_ends(&self.dims)?;

        // first dimension whose value differs from the previous row
        let depth = match &self.limit_state.prev {
            None => 0,
            Some((prev, prev_ends)) => (0..ends.len())
                .find(|&d| prev_ends.get(d).map(|&e| &prev[..e]) != Some(&key[..ends[d]]))
                .unwrap_or(ends.len()),
        };

        let mut counts = self.limit_state.counts.clone();
        counts.resize(ends.len(), 0);
        for (d, count) in counts.iter_mut().enumerate().skip(depth) {
            *count = if d == depth { *count + 1 } else { 1 };
        }

        let exceeded = (depth..counts.len())
            .find(|&d| matches!(self.limits.get(d), Some(Some(limit)) if counts[d] > *limit));
        match exceeded {
            None => Ok(LimitCheck::Emit(counts, ends)),
            Some(0) => Ok(LimitCheck::Finished),
            Some(d) => match prefix_successor(&key[..ends[d - 1]]) {
                Some(next) => Ok(LimitCheck::SkipParent(next)),
                None => Ok(LimitCheck::Finished),
            },
        }
    }

    fn next_row(&mut self) -> Result<Option<RowEntry>> {
        self.ensure_started()?;
        loop {
            if self.done {
                return Ok(None);
            }
            let Some(row) = self.next_merged()? else {
                self.done = true;
                return Ok(None);
            };
            if row.is_nil() && !self.include_nil {
                continue;
            }
            if self.limits.iter().all(Option::is_none) {
                return Ok(Some(row));
            }
            match self.check_limits(&row)? {
                LimitCheck::Emit(counts, ends) => {
                    self.limit_state.counts = counts;
                    self.limit_state.prev = Some((row.key.as_bytes().to_vec(), ends));
                    return Ok(Some(row));
                }
                LimitCheck::SkipParent(next) => self.seek_all(Some(&next))?,
                LimitCheck::Finished => {
                    self.seek_all(None)?;
                    self.done = true;
                }
            }
        }
    }
}

impl Iterator for RowIterator {
    type Item = Result<RowEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_row() {
            Ok(row) => row.map(Ok),
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
