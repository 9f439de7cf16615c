//! Store statistics snapshot.

use std::fmt;

/// Point-in-time statistics about a [`crate::store::Store`].
#[derive(Debug, Clone, Default)]
pub struct StoreStats {
    /// Fixed length of the address array.
    pub capacity: u64,
    /// Number of segment files on disk.
    pub num_segments: usize,
    /// Id of the currently writable segment.
    pub active_segment_id: u32,
    /// Total bytes written across all segments (live + garbage).
    pub total_bytes: u64,
    /// Bytes still referenced by a live address.
    pub live_bytes: u64,
    /// Highest SCN accepted in memory.
    pub hw_mark: u64,
    /// Highest SCN durably merged into `indexes.dat`.
    pub lw_mark: u64,
    /// Sealed-but-unapplied redo batches awaiting apply-and-prune.
    pub pending_redo_batches: usize,
}

impl StoreStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn total_mb(&self) -> f64 {
        self.total_bytes as f64 / (1024.0 * 1024.0)
    }

    /// Fraction of written bytes across the store that are still live.
    pub fn overall_live_ratio(&self) -> f64 {
        if self.total_bytes == 0 {
            1.0
        } else {
            self.live_bytes as f64 / self.total_bytes as f64
        }
    }
}

impl fmt::Display for StoreStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Store Statistics:")?;
        writeln!(f, "  Capacity: {}", self.capacity)?;
        writeln!(
            f,
            "  Segments: {} (active: {})",
            self.num_segments, self.active_segment_id
        )?;
        writeln!(f, "  Total size: {:.2} MB", self.total_mb())?;
        writeln!(f, "  Live ratio: {:.1}%", self.overall_live_ratio() * 100.0)?;
        writeln!(f, "  HWM / LWM: {} / {}", self.hw_mark, self.lw_mark)?;
        write!(f, "  Pending redo batches: {}", self.pending_redo_batches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn displays_expected_fields() {
        let stats = StoreStats {
            capacity: 4096,
            num_segments: 3,
            active_segment_id: 2,
            total_bytes: 1024 * 1024 * 2,
            live_bytes: 1024 * 1024,
            hw_mark: 42,
            lw_mark: 40,
            pending_redo_batches: 1,
        };

        let display = format!("{}", stats);
        assert!(display.contains("Capacity: 4096"));
        assert!(display.contains("Segments: 3"));
        assert!(display.contains("2.00 MB"));
        assert!(display.contains("50.0%"));
        assert!(display.contains("42 / 40"));
    }

    #[test]
    fn empty_store_reports_full_live_ratio() {
        let stats = StoreStats::new();
        assert_eq!(stats.overall_live_ratio(), 1.0);
    }
}
