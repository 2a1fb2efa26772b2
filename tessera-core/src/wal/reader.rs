//! Insert log replay

use bytes::{Buf, Bytes};
use std::fs;
use std::path::Path;
use tracing::{info, warn};

use super::{LogRecord, LOG_HEADER_SIZE, LOG_SIGNATURE, LOG_VERSION};
use crate::key::RowKey;
use crate::rowset::{OrderedRowSet, RowArray};
use crate::schema::Dimensions;
use crate::{Datum, Result, RowId, TesseraError};

/// Outcome of replaying a log file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct Recovery {
    /// Records replayed
    pub records: usize,
    /// Length of the valid prefix of the file; 0 if the header is missing
    pub valid_len: u64,
    pub max_row_id: Option<RowId>,
}

/// Replay every complete record of the log at `path` into `rows`.
///
/// Replay stops at the first record that is incomplete or does not decode,
/// since that can only be the tail of a write interrupted by a crash.
pub(super) fn replay(path: &Path, dims: &Dimensions, rows: &mut RowArray) -> Result<Recovery> {
    let data = fs::read(path)?;
    if (data.len() as u64) < LOG_HEADER_SIZE {
        return Ok(Recovery {
            records: 0,
            valid_len: 0,
            max_row_id: None,
        });
    }

    let mut header = &data[..LOG_HEADER_SIZE as usize];
    if header.get_u32_le() != LOG_SIGNATURE {
        return Err(TesseraError::corruption(format!(
            "{:?}: invalid insert log signature",
            path
        )));
    }
    let version = header.get_u32_le();
    if version != LOG_VERSION {
        return Err(TesseraError::InvalidFormat(format!(
            "{:?}: unsupported insert log version {}",
            path, version
        )));
    }

    let mut offset = LOG_HEADER_SIZE as usize;
    let mut records = 0;
    let mut max_row_id = None;
    while offset < data.len() {
        let Some((record, used)) = LogRecord::decode(&data[offset..]) else {
            warn!(
                "Incomplete record at offset {} in {:?}, truncating",
                offset, path
            );
            break;
        };
        let key = match validate(dims, &record) {
            Ok(key) => key,
            Err(e) => {
                warn!(
                    "Undecodable record at offset {} in {:?} ({}), truncating",
                    offset, path, e
                );
                break;
            }
        };

        let newer_exists = rows
            .find_data(key.as_bytes())?
            .is_some_and(|(_, existing)| existing > record.row_id);
        if !newer_exists {
            rows.insert(key, Bytes::clone(&record.value), record.row_id);
        }
        max_row_id = max_row_id.max(Some(record.row_id));
        records += 1;
        offset += used;
    }

    if records > 0 {
        info!("Recovered {} records from {:?}", records, path);
    }
    Ok(Recovery {
        records,
        valid_len: offset as u64,
        max_row_id,
    })
}

fn validate(dims: &Dimensions, record: &LogRecord) -> Result<RowKey> {
    let key = RowKey::from_bytes(dims, &record.key)?;
    if key.dimension_count() != dims.len() {
        return Err(TesseraError::InvalidKey("partial key in log record".into()));
    }
    Datum::from_bytes(&record.value)?;
    Ok(key)
}
