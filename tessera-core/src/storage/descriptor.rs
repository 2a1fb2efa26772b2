//! Table descriptor, persisted as `table.json` in every volume

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::schema::{DimensionDesc, Dimensions, KeyType};
use crate::view::SecondaryViewSpec;
use crate::{Result, TesseraError};

/// Name of the descriptor file inside a table directory
pub const DESCRIPTOR_FILE: &str = "table.json";

const TABLE_NAME_PATTERN: &str = r"^[A-Za-z_][A-Za-z0-9_.\-]*$";

/// Kind of table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TableType {
    #[default]
    Standard,
    /// Rows are files keyed by path
    File,
}

/// A secondary view as stored in the descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecondaryViewDesc {
    pub id: u32,
    #[serde(flatten)]
    pub spec: SecondaryViewSpec,
    #[serde(default = "default_true")]
    pub up_to_date: bool,
    #[serde(default)]
    pub updated_through: u64,
}

fn default_true() -> bool {
    true
}

/// Everything needed to reopen a table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableDescriptor {
    pub name: String,
    #[serde(rename = "type", default)]
    pub table_type: TableType,
    /// Primary key dimensions; file tables are keyed by a single path
    #[serde(default = "file_dimensions")]
    pub dimensions: Dimensions,
    #[serde(default)]
    pub secondary_views: Vec<SecondaryViewDesc>,
}

fn file_dimensions() -> Dimensions {
    Dimensions::from_single(DimensionDesc::new(KeyType::Utf8))
}

impl TableDescriptor {
    /// Descriptor of a standard table without secondary views
    pub fn new(name: impl Into<String>, dimensions: Dimensions) -> Self {
        Self {
            name: name.into(),
            table_type: TableType::Standard,
            dimensions,
            secondary_views: Vec::new(),
        }
    }

    /// Check everything that can be checked without touching disk
    pub fn validate(&self) -> Result<()> {
        validate_table_name(&self.name)?;
        Dimensions::primary(self.dimensions.as_slice().to_vec())?;
        if self.table_type == TableType::File && self.dimensions != file_dimensions() {
            return Err(TesseraError::Schema(
                "file tables are keyed by a single utf8 path".into(),
            ));
        }
        for (i, view) in self.secondary_views.iter().enumerate() {
            view.spec.dimensions()?;
            if self.secondary_views[..i]
                .iter()
                .any(|v| v.id == view.id || v.spec.name == view.spec.name)
            {
                return Err(TesseraError::AlreadyExists(format!("view {}", view.spec.name)));
            }
        }
        Ok(())
    }

    /// Next unused view id
    pub fn next_view_id(&self) -> u32 {
        self.secondary_views.iter().map(|v| v.id + 1).max().unwrap_or(1)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read(path)?;
        let desc: Self = serde_json::from_slice(&data)?;
        desc.validate()?;
        Ok(desc)
    }

    /// Write the descriptor atomically
    pub fn save(&self, path: &Path) -> Result<()> {
        let temp = path.with_extension("json.tmp");
        fs::write(&temp, serde_json::to_vec_pretty(self)?)?;
        fs::File::open(&temp)?.sync_all()?;
        fs::rename(&temp, path)?;
        Ok(())
    }
}

/// Table names start with a letter or underscore and contain only letters,
/// digits, `_`, `.` and `-`
pub fn validate_table_name(name: &str) -> Result<()> {
    let pattern = Regex::new(TABLE_NAME_PATTERN)
        .map_err(|e| TesseraError::Internal(format!("table name pattern: {}", e)))?;
    if pattern.is_match(name) {
        Ok(())
    } else {
        Err(TesseraError::Schema(format!("invalid table name: {:?}", name)))
    }
}
