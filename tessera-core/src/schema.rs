//! Dimension schema of a table or view

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{Result, TesseraError};

/// Maximum number of key dimensions of any view
pub const DIM_COUNT: usize = 3;

/// Type of one key dimension
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum KeyType {
    Int32,
    Int64,
    Utf8,
    DateTime,
    /// A list of strings; each element produces its own derived row.
    /// Only valid in secondary views.
    ListUtf8,
}

/// Sort order of one key dimension
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SortOrder {
    #[default]
    Ascending,
    Descending,
}

/// Descriptor of one key dimension
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DimensionDesc {
    pub key_type: KeyType,
    #[serde(default)]
    pub sort: SortOrder,
}

impl DimensionDesc {
    pub fn new(key_type: KeyType) -> Self {
        Self {
            key_type,
            sort: SortOrder::Ascending,
        }
    }

    pub fn descending(key_type: KeyType) -> Self {
        Self {
            key_type,
            sort: SortOrder::Descending,
        }
    }
}

/// Ordered list of key dimensions. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "Vec<DimensionDesc>", into = "Vec<DimensionDesc>")]
pub struct Dimensions(Vec<DimensionDesc>);

impl Dimensions {
    /// Create a schema of 1 to `DIM_COUNT` dimensions
    pub fn new(dims: Vec<DimensionDesc>) -> Result<Self> {
        if dims.is_empty() || dims.len() > DIM_COUNT {
            return Err(TesseraError::Schema(format!(
                "a key needs 1 to {} dimensions, got {}",
                DIM_COUNT,
                dims.len()
            )));
        }
        Ok(Self(dims))
    }

    /// Schema of exactly one dimension
    pub fn from_single(desc: DimensionDesc) -> Self {
        Self(vec![desc])
    }

    /// Create a schema for a primary view, where list dimensions are not allowed
    pub fn primary(dims: Vec<DimensionDesc>) -> Result<Self> {
        if dims.iter().any(|d| d.key_type == KeyType::ListUtf8) {
            return Err(TesseraError::Schema(
                "list dimensions are only allowed in secondary views".into(),
            ));
        }
        Self::new(dims)
    }

    /// Schema of a secondary view: the declared dimensions plus a trailing
    /// ascending int64 row-id dimension that keeps derived keys unique.
    pub fn secondary(declared: &[DimensionDesc]) -> Result<Self> {
        if declared.is_empty() || declared.len() >= DIM_COUNT {
            return Err(TesseraError::Schema(format!(
                "a secondary view needs 1 to {} key fields, got {}",
                DIM_COUNT - 1,
                declared.len()
            )));
        }
        let mut dims = declared.to_vec();
        dims.push(DimensionDesc::new(KeyType::Int64));
        Ok(Self(dims))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&DimensionDesc> {
        self.0.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &DimensionDesc> {
        self.0.iter()
    }

    pub fn as_slice(&self) -> &[DimensionDesc] {
        &self.0
    }

    pub fn has_list_dimension(&self) -> bool {
        self.0.iter().any(|d| d.key_type == KeyType::ListUtf8)
    }
}

impl TryFrom<Vec<DimensionDesc>> for Dimensions {
    type Error = TesseraError;

    fn try_from(dims: Vec<DimensionDesc>) -> Result<Self> {
        Self::new(dims)
    }
}

impl From<Dimensions> for Vec<DimensionDesc> {
    fn from(dims: Dimensions) -> Self {
        dims.0
    }
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            KeyType::Int32 => "int32",
            KeyType::Int64 => "int64",
            KeyType::Utf8 => "utf8",
            KeyType::DateTime => "dateTime",
            KeyType::ListUtf8 => "listUtf8",
        };
        f.write_str(name)
    }
}
