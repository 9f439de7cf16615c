//! Error types for the storage core.

use std::io;
use thiserror::Error;

/// Errors surfaced by the public `Store` API.
///
/// `SegmentOverflow` and `SegmentReadOnly` are deliberately absent here:
/// per the propagation policy they are recovered locally inside the
/// data-array write loop (one rotation + retry) and never escape as
/// `StoreError` unless the retry itself fails, in which case they show
/// up wrapped as `IOError`.
#[derive(Error, Debug)]
pub enum StoreError {
    /// An operation was attempted on a store that has already been closed.
    #[error("store is closed")]
    StoreClosed,

    /// An index passed to `get`/`set`/`delete` is outside `[0, capacity)`.
    #[error("index {index} out of range [0, {capacity})")]
    IndexOutOfRange { index: u64, capacity: u64 },

    /// The segment id space `[0, MAX_SEGMENTS)` is exhausted.
    #[error("no free segment id available")]
    OutOfSegments,

    /// A checksum mismatch was detected while reading a checked-mode record.
    #[error("data corrupted at index {index}: checksum mismatch")]
    DataCorrupted { index: u64 },

    /// A redo-entry file failed CRC or header validation during recovery.
    #[error("redo log corrupted: {0}")]
    RedoCorrupted(String),

    /// On-disk `indexes.dat` length disagrees with the configured capacity.
    #[error("capacity mismatch: indexes.dat has length {on_disk}, config requests {configured}")]
    CapacityMismatch { on_disk: u64, configured: u64 },

    /// `saveHWMark` was asked to retreat the watermarks but
    /// `StoreConfig::allow_watermark_rollback` is `false`.
    #[error("watermark rollback to scn {scn} is disabled (lwm is {lwm})")]
    WatermarkRollbackDisabled { scn: u64, lwm: u64 },

    /// A wrapped OS-level I/O error.
    #[error("io error: {0}")]
    IOError(#[from] io::Error),
}

/// Result type alias used throughout the storage core.
pub type Result<T> = std::result::Result<T, StoreError>;
