//! Store configuration recognized by the core (spec §6).

use std::path::{Path, PathBuf};

/// Which `Segment` backend realization new segments are created with.
///
/// `Channel` and `Mapped` are accepted for config compatibility but are
/// currently realized via the same write-buffered file backend as
/// `WriteBuffer` — the spec requires two *interchangeable* byte layouts
/// (memory-backed, file-backed), not four distinct I/O strategies, and
/// all three file-backed variants produce identical on-disk bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SegmentFactoryKind {
    /// Entire segment mirrored in a heap buffer, flushed to disk on force.
    Memory,
    /// Writes go through a bounded write buffer then to the OS file.
    #[default]
    WriteBuffer,
    /// Accepted alias of `WriteBuffer`.
    Channel,
    /// Accepted alias of `WriteBuffer`.
    Mapped,
}

/// Complete store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Directory the store's files live under (`indexes.dat`, `*.redo`,
    /// `segs/`).
    pub home_dir: PathBuf,

    /// Fixed length of the address array (number of indices addressable).
    pub capacity: u64,

    /// Size of each segment file, in megabytes.
    pub segment_file_size_mb: u64,

    /// Maximum number of redo records per batch before rotation.
    pub batch_size: usize,

    /// Maximum number of sealed-but-unapplied redo batches before an
    /// apply-and-prune pass runs.
    pub max_entries: usize,

    /// Live-ratio threshold below which a segment becomes a compaction
    /// candidate (Open Question ii in spec §9).
    pub segment_compact_factor: f64,

    /// Minimum load factor before a segment is considered for compaction
    /// at all (Open Question ii in spec §9).
    pub segment_compact_trigger: f64,

    /// When `true`, records carry a trailing Adler-32 checksum and reads
    /// validate it (`CheckedDataArray`).
    pub checked: bool,

    /// Backend used to realize new segments.
    pub segment_factory_kind: SegmentFactoryKind,

    /// Gates whether `saveHWMark` is allowed to retreat the watermarks
    /// (Open Question i in spec §9). Default `false`: this is a testing
    /// rollback hook, not a normal operation.
    pub allow_watermark_rollback: bool,

    /// When `true`, a `*.redo` file that fails CRC/header validation
    /// during recovery is discarded (instead of aborting `open`) if its
    /// filename-encoded scn range lies entirely above the persisted LWM
    /// — i.e. it represents no durably-merged data. Default `false`:
    /// corruption aborts `open` with `StoreError::RedoCorrupted`.
    pub discard_corrupt_redo_above_lwm: bool,
}

impl StoreConfig {
    /// A config with the spec's stated defaults, given a required
    /// `capacity` and `home_dir`.
    pub fn new<P: AsRef<Path>>(home_dir: P, capacity: u64) -> Self {
        Self {
            home_dir: home_dir.as_ref().to_path_buf(),
            capacity,
            segment_file_size_mb: 256,
            batch_size: 10_000,
            max_entries: 5,
            segment_compact_factor: 0.5,
            segment_compact_trigger: 0.1,
            checked: false,
            segment_factory_kind: SegmentFactoryKind::default(),
            allow_watermark_rollback: false,
            discard_corrupt_redo_above_lwm: false,
        }
    }

    /// A config tuned for fast, small-scale tests: small segments, tight
    /// batches, no watermark-rollback hazard.
    pub fn test_config<P: AsRef<Path>>(home_dir: P, capacity: u64) -> Self {
        Self {
            segment_file_size_mb: 1,
            batch_size: 8,
            max_entries: 2,
            ..Self::new(home_dir, capacity)
        }
    }

    pub fn segment_file_size_bytes(&self) -> u64 {
        self.segment_file_size_mb * 1024 * 1024
    }

    /// Display summary used in `log` lines at `Store::open`.
    pub fn summary(&self) -> String {
        format!(
            "StoreConfig: home_dir={}, capacity={}, segment_file_size_mb={}, batch_size={}, \
             max_entries={}, segment_compact_factor={}, segment_compact_trigger={}, checked={}, \
             segment_factory_kind={:?}, allow_watermark_rollback={}, discard_corrupt_redo_above_lwm={}",
            self.home_dir.display(),
            self.capacity,
            self.segment_file_size_mb,
            self.batch_size,
            self.max_entries,
            self.segment_compact_factor,
            self.segment_compact_trigger,
            self.checked,
            self.segment_factory_kind,
            self.allow_watermark_rollback,
            self.discard_corrupt_redo_above_lwm,
        )
    }
}
