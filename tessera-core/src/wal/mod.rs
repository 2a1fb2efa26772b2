//! Insert log (write-ahead log)
//!
//! Every row written to a view is appended to its insert log before the
//! in-memory row array changes. After a crash the log is replayed into a
//! fresh row array. Once the rows are folded into a segment the log is reset.

mod entry;
mod reader;
mod writer;

pub use entry::LogRecord;
pub use writer::InsertLog;

/// Insert log signature, `AEOL`
pub const LOG_SIGNATURE: u32 = u32::from_le_bytes(*b"AEOL");

/// Current insert log version
pub const LOG_VERSION: u32 = 1;

/// Size of the `{signature, version}` header
pub const LOG_HEADER_SIZE: u64 = 8;

/// Insert log sync policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncPolicy {
    /// Sync after every write (safest, slowest)
    #[default]
    Immediate,
    /// Sync after N writes
    EveryN(usize),
    /// Sync on interval (trades durability for performance)
    Interval { millis: u64 },
    /// Never sync (OS decides, fastest, least safe)
    None,
}

/// Insert log configuration
#[derive(Debug, Clone, Default)]
pub struct InsertLogConfig {
    /// Sync policy
    pub sync_policy: SyncPolicy,
}
