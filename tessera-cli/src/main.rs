//! Tessera console - inspect and drive a storage engine from the shell

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tessera_core::key::RowKey;
use tessera_core::schema::{DimensionDesc, Dimensions, KeyType, SortOrder};
use tessera_core::storage::{Engine, RowsFlags, StorageConfig, TableDescriptor, TableType};
use tessera_core::view::SecondaryViewSpec;
use tessera_core::Datum;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "tessera", version, about = "Tessera storage engine console")]
struct Cli {
    /// Primary data directory
    #[arg(long, default_value = "data")]
    data_dir: PathBuf,

    /// Backup directory
    #[arg(long)]
    backup_dir: Option<PathBuf>,

    /// Housekeeping worker threads
    #[arg(long, default_value_t = 2)]
    threads: usize,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create a table. Dimensions are key types such as `utf8` or `int64:desc`.
    Create {
        name: String,
        #[arg(required_unless_present = "file")]
        dims: Vec<String>,
        /// Create a file table keyed by path
        #[arg(long)]
        file: bool,
    },
    /// Add a secondary view from a JSON definition
    AddView { table: String, spec: String },
    /// Insert a JSON value under a key path (`null` deletes)
    Insert { table: String, path: String, value: String },
    /// Print the value stored under a key path
    Get {
        table: String,
        path: String,
        #[arg(long, default_value = "primary")]
        view: String,
    },
    /// Print rows in key order
    Rows {
        table: String,
        /// Start at this key path (a trailing `/` selects a subtree)
        #[arg(long)]
        start: Option<String>,
        /// Start after the given key instead of at it
        #[arg(long)]
        after: bool,
        #[arg(long, default_value_t = 20)]
        count: usize,
        /// Distinct values per dimension, e.g. `--limits 10,2`
        #[arg(long, value_delimiter = ',')]
        limits: Vec<usize>,
        #[arg(long, default_value = "primary")]
        view: String,
    },
    /// Print the first and last key of a view
    KeyRange {
        table: String,
        /// Only consider the first `count` rows (0 for all)
        #[arg(long, default_value_t = 0)]
        count: usize,
        #[arg(long, default_value = "primary")]
        view: String,
    },
    /// Write all in-memory rows to segments
    Flush,
    /// Run housekeeping until there is nothing left to do
    Housekeep,
    /// Run housekeeping periodically until interrupted
    Run {
        #[arg(long, default_value_t = 1000)]
        interval_ms: u64,
    },
    /// List tables and their statistics
    Tables,
    /// Describe a view and its segments
    Dump {
        table: String,
        #[arg(long, default_value = "primary")]
        view: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = StorageConfig {
        data_dir: cli.data_dir.clone(),
        backup_dir: cli.backup_dir.clone(),
        housekeeping_threads: cli.threads,
        ..Default::default()
    };
    info!("Data directory: {:?}", config.data_dir);
    let engine = Engine::open(config)?;

    match cli.command {
        Command::Create { name, dims, file } => {
            let descriptor = if file {
                TableDescriptor {
                    table_type: TableType::File,
                    ..TableDescriptor::new(name, Dimensions::from_single(DimensionDesc::new(KeyType::Utf8)))
                }
            } else {
                let dims = dims.iter().map(|d| parse_dimension(d)).collect::<anyhow::Result<Vec<_>>>()?;
                TableDescriptor::new(name, Dimensions::primary(dims)?)
            };
            let table = engine.create_table(descriptor)?;
            println!("created {}", table.name());
        }
        Command::AddView { table, spec } => {
            let spec: SecondaryViewSpec = serde_json::from_str(&spec).context("invalid view definition")?;
            let id = engine.table(&table)?.add_secondary_view(spec)?;
            println!("view {}", id);
        }
        Command::Insert { table, path, value } => {
            let table = engine.table(&table)?;
            let key = RowKey::from_path(table.dims(), &path)?;
            let value: serde_json::Value = serde_json::from_str(&value).context("invalid JSON value")?;
            let row_id = table.insert(&key, &Datum::from_json(&value))?;
            println!("row {}", row_id);
        }
        Command::Get { table, path, view } => {
            let table = engine.table(&table)?;
            let view_id = table.find_view(&view).with_context(|| format!("no view {}", view))?;
            let dims = table.view_dims(view_id)?;
            let key = RowKey::from_path(&dims, &path)?;
            match table.get_data(view_id, &key)? {
                Some((value, row_id)) => println!("{} (row {})", value.to_json(), row_id),
                None => println!("null"),
            }
        }
        Command::Rows { table, start, after, count, limits, view } => {
            let table = engine.table(&table)?;
            let view_id = table.find_view(&view).with_context(|| format!("no view {}", view))?;
            let dims = table.view_dims(view_id)?;
            let start = start.map(|p| RowKey::from_path(&dims, &p)).transpose()?;
            let limits: Vec<Option<usize>> = limits.into_iter().map(|l| (l > 0).then_some(l)).collect();
            let flags = if after {
                RowsFlags::INCLUDE_KEY | RowsFlags::MORE_ROWS
            } else {
                RowsFlags::INCLUDE_KEY
            };
            let rows = table.get_rows(view_id, start.as_ref(), count, &limits, flags)?;
            if let Datum::Array(rows) = rows {
                for row in rows {
                    println!("{}", row.to_json());
                }
            }
        }
        Command::KeyRange { table, count, view } => {
            let table = engine.table(&table)?;
            let view_id = table.find_view(&view).with_context(|| format!("no view {}", view))?;
            println!("{}", table.get_key_range(view_id, count)?.to_json());
        }
        Command::Flush => {
            engine.flush_all()?;
            println!("flushed {} tables", engine.list_tables().len());
        }
        Command::Housekeep => {
            let mut passes = 0;
            while engine.housekeeping() > 0 {
                passes += 1;
            }
            println!("{} housekeeping passes", passes);
        }
        Command::Run { interval_ms } => {
            let mut interval = tokio::time::interval(Duration::from_millis(interval_ms.max(1)));
            info!("Running housekeeping every {}ms, Ctrl-C to stop", interval_ms);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let worked = engine.housekeeping();
                        if worked > 0 {
                            info!("Housekeeping did work on {} tables", worked);
                        }
                    }
                    _ = tokio::signal::ctrl_c() => break,
                }
            }
            engine.flush_all()?;
            info!("Shutting down");
        }
        Command::Tables => {
            println!("{}", serde_json::to_string_pretty(&engine.stats())?);
        }
        Command::Dump { table, view } => {
            let table = engine.table(&table)?;
            let view_id = table.find_view(&view).with_context(|| format!("no view {}", view))?;
            println!("{}", serde_json::to_string_pretty(&table.debug_dump_view(view_id)?.to_json())?);
        }
    }
    Ok(())
}

/// Parse `type[:asc|:desc]`
fn parse_dimension(text: &str) -> anyhow::Result<DimensionDesc> {
    let (name, order) = text.split_once(':').unwrap_or((text, "asc"));
    let key_type: KeyType = serde_json::from_value(serde_json::Value::String(name.to_string()))
        .with_context(|| format!("unknown key type {}", name))?;
    let sort = match order {
        "asc" => SortOrder::Ascending,
        "desc" => SortOrder::Descending,
        other => bail!("unknown sort order {}", other),
    };
    Ok(DimensionDesc { key_type, sort })
}
