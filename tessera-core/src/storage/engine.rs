//! Storage engine - table registry and housekeeping coordinator

use super::descriptor::{validate_table_name, TableDescriptor};
use super::table::{Table, TableStats};
use super::StorageConfig;
use crate::view::EvaluatorRegistry;
use crate::{Result, TesseraError};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Tessera storage engine
pub struct Engine {
    config: StorageConfig,
    evaluators: EvaluatorRegistry,
    tables: RwLock<HashMap<String, Arc<Table>>>,
}

impl Engine {
    /// Open the engine, loading every table found on the data or backup
    /// volume
    pub fn open(config: StorageConfig) -> Result<Self> {
        Self::with_evaluators(config, EvaluatorRegistry::new())
    }

    /// Open the engine with computed-column evaluators
    pub fn with_evaluators(config: StorageConfig, evaluators: EvaluatorRegistry) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;
        if let Some(backup) = &config.backup_dir {
            std::fs::create_dir_all(backup)?;
        }

        let engine = Self {
            config,
            evaluators,
            tables: RwLock::new(HashMap::new()),
        };
        engine.load_tables()?;
        Ok(engine)
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// Create a new table
    pub fn create_table(&self, descriptor: TableDescriptor) -> Result<Arc<Table>> {
        let mut tables = self.tables.write();
        if tables.contains_key(&descriptor.name) {
            return Err(TesseraError::AlreadyExists(format!("table {}", descriptor.name)));
        }

        let name = descriptor.name.clone();
        let table = Table::create(
            descriptor,
            self.config.data_dir.join(&name),
            self.config.backup_dir.as_ref().map(|b| b.join(&name)),
            self.config.table.clone(),
            self.evaluators.clone(),
        )?;
        let table = Arc::new(table);
        tables.insert(name.clone(), table.clone());
        Ok(table)
    }

    /// Get a table by name
    pub fn get_table(&self, name: &str) -> Option<Arc<Table>> {
        self.tables.read().get(name).cloned()
    }

    /// Get a table by name, failing if it does not exist
    pub fn table(&self, name: &str) -> Result<Arc<Table>> {
        self.get_table(name)
            .ok_or_else(|| TesseraError::TableNotFound(name.to_string()))
    }

    /// Drop a table and delete its files
    pub fn drop_table(&self, name: &str) -> Result<()> {
        let table = self
            .tables
            .write()
            .remove(name)
            .ok_or_else(|| TesseraError::TableNotFound(name.to_string()))?;
        table.delete()?;
        info!("Dropped table: {}", name);
        Ok(())
    }

    /// Names of all tables, sorted
    pub fn list_tables(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tables.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Flush all tables
    pub fn flush_all(&self) -> Result<()> {
        let tables: Vec<_> = self.tables.read().values().cloned().collect();
        for table in tables {
            table.flush()?;
        }
        Ok(())
    }

    /// Run one housekeeping pass over every table on a pool of worker
    /// threads. Returns the number of tables that did some work.
    ///
    /// `max_memory` bounds the unflushed bytes of all tables together; once
    /// the total crosses it every table flushes what it holds.
    pub fn housekeeping(&self) -> usize {
        let tables: Vec<_> = self.tables.read().values().cloned().collect();
        if tables.is_empty() {
            return 0;
        }
        let memory_used: usize = tables.iter().map(|t| t.memory_used()).sum();
        let over_memory = self.config.max_memory > 0 && memory_used > self.config.max_memory;
        if over_memory {
            debug!(
                "{} unflushed bytes across {} tables exceed {}, flushing",
                memory_used,
                tables.len(),
                self.config.max_memory
            );
        }

        let worked = AtomicUsize::new(0);
        let workers = self.config.housekeeping_threads.clamp(1, tables.len());
        let (tx, rx) = crossbeam_channel::unbounded::<Arc<Table>>();
        for table in tables {
            // the receiver outlives every send
            let _ = tx.send(table);
        }
        drop(tx);

        std::thread::scope(|scope| {
            for _ in 0..workers {
                let rx = rx.clone();
                let worked = &worked;
                scope.spawn(move || {
                    for table in rx.iter() {
                        match table.housekeeping_step(over_memory) {
                            Ok(true) => {
                                worked.fetch_add(1, Ordering::Relaxed);
                            }
                            Ok(false) => {}
                            Err(e) => warn!("Housekeeping of table {} failed: {}", table.name(), e),
                        }
                    }
                });
            }
        });
        worked.into_inner()
    }

    /// Get engine statistics
    pub fn stats(&self) -> EngineStats {
        let tables = self.tables.read();
        let mut table_stats: Vec<TableStats> = tables.values().map(|t| t.stats()).collect();
        table_stats.sort_by(|a, b| a.name.cmp(&b.name));

        EngineStats {
            table_count: tables.len(),
            memory_used: tables.values().map(|t| t.memory_used()).sum(),
            segment_bytes: table_stats
                .iter()
                .flat_map(|t| &t.views)
                .map(|v| v.segment_bytes)
                .sum(),
            tables: table_stats,
        }
    }

    fn load_tables(&self) -> Result<()> {
        let mut names = table_dirs(&self.config.data_dir)?;
        if let Some(backup) = &self.config.backup_dir {
            names.extend(table_dirs(backup)?);
        }

        for name in names {
            match Table::open(
                self.config.data_dir.join(&name),
                self.config.backup_dir.as_ref().map(|b| b.join(&name)),
                self.config.table.clone(),
                self.evaluators.clone(),
            ) {
                Ok(table) => {
                    self.tables.write().insert(name.clone(), Arc::new(table));
                    info!("Loaded table: {}", name);
                }
                Err(e) => {
                    warn!("Failed to load table {}: {}", name, e);
                }
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("data_dir", &self.config.data_dir)
            .field("tables", &self.list_tables())
            .finish()
    }
}

/// Directory names under `dir` that are valid table names
fn table_dirs(dir: &Path) -> Result<BTreeSet<String>> {
    let mut names = BTreeSet::new();
    if !dir.exists() {
        return Ok(names);
    }
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        // leftovers of an interrupted volume copy
        if name.ends_with(".copying") || name.ends_with(".old") {
            continue;
        }
        if validate_table_name(&name).is_ok() {
            names.insert(name);
        }
    }
    Ok(names)
}

/// Storage engine statistics
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStats {
    pub table_count: usize,
    pub memory_used: usize,
    pub segment_bytes: u64,
    pub tables: Vec<TableStats>,
}
