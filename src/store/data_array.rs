//! Data Array: the glue between [`AddressArray`] indices and segment
//! bytes (spec §4.3).
//!
//! Realizes both the plain and checked record layouts described in the
//! spec as a single type parameterized on `checked`, rather than two
//! distinct wrapper types — the encode/decode paths are isolated in
//! their own functions so the checked-mode behavior reads as a drop-in
//! layer around the plain one (documented in `DESIGN.md`).

use crate::store::address::Address;
use crate::store::address_array::AddressArray;
use crate::store::config::StoreConfig;
use crate::store::error::{Result, StoreError};
use crate::store::segment::{SegmentError, SegmentManager};
use std::collections::HashMap;
use std::io;

/// Trailing checksum width used in checked mode.
const ADLER_TRAILER_LEN: usize = 4;

pub struct DataArray {
    segments: SegmentManager,
    /// Live (non-superseded) bytes currently attributed to each segment,
    /// including each record's length prefix. Drives compaction
    /// candidate selection.
    live_bytes: HashMap<u32, u64>,
    checked: bool,
}

impl DataArray {
    /// Opens the segment directory and rebuilds live-byte accounting by
    /// walking every address currently held in `address_array` — called
    /// once `address_array` itself has finished recovery.
    pub fn open(config: &StoreConfig, address_array: &AddressArray) -> Result<Self> {
        let segments = SegmentManager::open(
            &config.home_dir,
            config.segment_file_size_bytes(),
            config.segment_factory_kind,
        )?;
        let mut array = Self {
            segments,
            live_bytes: HashMap::new(),
            checked: config.checked,
        };
        for index in 0..address_array.capacity() {
            let addr = address_array.get(index)?;
            if !addr.is_none() {
                array.account_insert(addr);
            }
        }
        Ok(array)
    }

    fn account_insert(&mut self, addr: Address) {
        let on_disk = 4u64 + addr.length() as u64;
        *self.live_bytes.entry(addr.seg_id() as u32).or_insert(0) += on_disk;
    }

    fn account_remove(&mut self, addr: Address) {
        if addr.is_none() {
            return;
        }
        let on_disk = 4u64 + addr.length() as u64;
        if let Some(live) = self.live_bytes.get_mut(&(addr.seg_id() as u32)) {
            *live = live.saturating_sub(on_disk);
        }
    }

    /// Reads the payload stored at `index`, or `None` if the index holds
    /// no data. In checked mode, validates and strips the Adler-32
    /// trailer, returning `DataCorrupted` on mismatch.
    pub fn get_data(&self, address_array: &AddressArray, index: u64) -> Result<Option<Vec<u8>>> {
        let addr = address_array.get(index)?;
        if addr.is_none() {
            return Ok(None);
        }
        let seg = self
            .segments
            .get(addr.seg_id() as u32)
            .ok_or_else(|| StoreError::IOError(io::Error::other("dangling segment reference")))?;
        let raw = seg
            .read(addr.offset(), addr.length())
            .map_err(StoreError::from)?;

        if self.checked {
            decode_checked(&raw, index)
        } else {
            Ok(Some(raw))
        }
    }

    /// Writes `payload` for `index` at scn, updating the address array
    /// and live-byte accounting. Overflowing the current segment
    /// triggers exactly one rotation-then-retry per the §7 propagation
    /// policy.
    pub fn set_data(
        &mut self,
        address_array: &mut AddressArray,
        index: u64,
        payload: &[u8],
        scn: u64,
    ) -> Result<()> {
        let bytes = if self.checked {
            encode_checked(payload)?
        } else {
            payload.to_vec()
        };
        if bytes.len() > u16::MAX as usize {
            return Err(StoreError::IOError(io::Error::other(
                "record too large to address (exceeds 64KiB)",
            )));
        }

        let (seg_id, offset) = self.append_with_rotation(&bytes)?;
        let new_address = Address::new(seg_id as u16, offset, bytes.len() as u16);

        let old_address = address_array.get(index)?;
        address_array.set(index, new_address, scn)?;
        self.account_remove(old_address);
        self.account_insert(new_address);
        Ok(())
    }

    /// Clears `index`'s entry (no data written), matching delete
    /// semantics: a subsequent `get` observes `None`, and the
    /// superseded record's bytes become reclaimable garbage.
    pub fn delete_data(&mut self, address_array: &mut AddressArray, index: u64, scn: u64) -> Result<()> {
        let old_address = address_array.get(index)?;
        address_array.set(index, Address::NONE, scn)?;
        self.account_remove(old_address);
        Ok(())
    }

    fn append_with_rotation(&mut self, bytes: &[u8]) -> Result<(u32, u32)> {
        let current_id = self.segments.current_id();
        match self.segments.current_mut().append(bytes) {
            Ok(offset) => Ok((current_id, offset)),
            Err(SegmentError::Overflow) => {
                self.segments.next_segment()?;
                let new_id = self.segments.current_id();
                let offset = self
                    .segments
                    .current_mut()
                    .append(bytes)
                    .map_err(StoreError::from)?;
                Ok((new_id, offset))
            }
            Err(e) => Err(StoreError::from(e)),
        }
    }

    /// Forces the current segment's writes durably to disk. Sealed
    /// segments are already force-written at rotation time, so only the
    /// writable segment needs an explicit force here.
    pub fn sync(&mut self) -> Result<()> {
        self.segments
            .current_mut()
            .force()
            .map_err(StoreError::from)
    }

    /// Forces the current segment only, without advancing any watermark
    /// — distinguishes it from `Store::sync`, which also syncs the
    /// address array.
    pub fn persist(&mut self) -> Result<()> {
        self.sync()
    }

    pub fn segment_ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.segments.ids()
    }

    pub fn current_segment_id(&self) -> u32 {
        self.segments.current_id()
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Fraction of a segment's capacity that has been written to at all
    /// (live or dead). `None` if the segment doesn't exist.
    pub fn segment_load_factor(&self, seg_id: u32) -> Option<f64> {
        self.segments.get(seg_id).map(|s| s.load_factor())
    }

    /// Fraction of a segment's *used* bytes that are still live (not
    /// superseded by a later write or delete). `None` if the segment
    /// doesn't exist or has never been written to.
    pub fn segment_live_ratio(&self, seg_id: u32) -> Option<f64> {
        let seg = self.segments.get(seg_id)?;
        let used = seg.load_size();
        if used == 0 {
            return None;
        }
        let live = self.live_bytes.get(&seg_id).copied().unwrap_or(0);
        Some(live as f64 / used as f64)
    }

    pub fn total_live_bytes(&self, seg_id: u32) -> u64 {
        self.live_bytes.get(&seg_id).copied().unwrap_or(0)
    }

    /// Raw read for the compactor's scan-and-copy pass; bypasses the
    /// address array entirely.
    pub fn raw_read(&self, seg_id: u32, offset: u32, length: u16) -> Result<Vec<u8>> {
        let seg = self
            .segments
            .get(seg_id)
            .ok_or_else(|| StoreError::IOError(io::Error::other("unknown segment")))?;
        seg.read(offset, length).map_err(StoreError::from)
    }

    /// Raw append into `seg_id` for the compactor's scan-and-copy pass.
    pub fn raw_append(&mut self, seg_id: u32, bytes: &[u8]) -> Result<u32> {
        let seg = self
            .segments
            .get_mut(seg_id)
            .ok_or_else(|| StoreError::IOError(io::Error::other("unknown segment")))?;
        let pos = seg.append(bytes).map_err(StoreError::from)?;
        Ok(pos)
    }

    pub fn allocate_compaction_target(&mut self) -> Result<u32> {
        self.segments.allocate_compaction_target()
    }

    /// Moves byte accounting from `from_seg` to `to_seg` after the
    /// compactor copies a still-live record verbatim.
    pub fn record_copy(&mut self, from_seg: u32, to_seg: u32, on_disk_len: u64) {
        if let Some(live) = self.live_bytes.get_mut(&from_seg) {
            *live = live.saturating_sub(on_disk_len);
        }
        *self.live_bytes.entry(to_seg).or_insert(0) += on_disk_len;
    }

    pub fn free_segment(&mut self, seg_id: u32) -> Result<()> {
        self.live_bytes.remove(&seg_id);
        self.segments.free_segment(seg_id)
    }
}

fn encode_checked(payload: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(payload.len() + ADLER_TRAILER_LEN);
    out.extend_from_slice(payload);
    let checksum = adler32::adler32(payload)?;
    out.extend_from_slice(&checksum.to_be_bytes());
    Ok(out)
}

fn decode_checked(raw: &[u8], index: u64) -> Result<Option<Vec<u8>>> {
    if raw.len() < ADLER_TRAILER_LEN {
        return Err(StoreError::DataCorrupted { index });
    }
    let split = raw.len() - ADLER_TRAILER_LEN;
    let (payload, trailer) = raw.split_at(split);
    let expected = u32::from_be_bytes(trailer.try_into().unwrap());
    let computed = adler32::adler32(payload)?;
    if computed != expected {
        return Err(StoreError::DataCorrupted { index });
    }
    Ok(Some(payload.to_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn set_then_get_roundtrips() {
        let dir = tempdir().unwrap();
        let cfg = StoreConfig::test_config(dir.path(), 8);
        let mut addrs = AddressArray::open(&cfg).unwrap();
        let mut data = DataArray::open(&cfg, &addrs).unwrap();

        data.set_data(&mut addrs, 0, b"alpha", 1).unwrap();
        data.set_data(&mut addrs, 1, b"beta", 2).unwrap();

        assert_eq!(data.get_data(&addrs, 0).unwrap(), Some(b"alpha".to_vec()));
        assert_eq!(data.get_data(&addrs, 1).unwrap(), Some(b"beta".to_vec()));
    }

    #[test]
    fn missing_index_returns_none() {
        let dir = tempdir().unwrap();
        let cfg = StoreConfig::test_config(dir.path(), 8);
        let addrs = AddressArray::open(&cfg).unwrap();
        let data = DataArray::open(&cfg, &addrs).unwrap();
        assert_eq!(data.get_data(&addrs, 3).unwrap(), None);
    }

    #[test]
    fn overwrite_is_last_write_wins_and_decrements_old_live_bytes() {
        let dir = tempdir().unwrap();
        let cfg = StoreConfig::test_config(dir.path(), 8);
        let mut addrs = AddressArray::open(&cfg).unwrap();
        let mut data = DataArray::open(&cfg, &addrs).unwrap();

        data.set_data(&mut addrs, 0, b"v1", 1).unwrap();
        let seg = data.current_segment_id();
        let live_after_first = data.total_live_bytes(seg);

        data.set_data(&mut addrs, 0, b"v2-longer", 2).unwrap();
        assert_eq!(data.get_data(&addrs, 0).unwrap(), Some(b"v2-longer".to_vec()));
        // first write's bytes are no longer live; second write's are.
        assert_eq!(
            data.total_live_bytes(seg),
            live_after_first - (4 + 2) + (4 + 9)
        );
    }

    #[test]
    fn delete_clears_the_address_and_decrements_live_bytes() {
        let dir = tempdir().unwrap();
        let cfg = StoreConfig::test_config(dir.path(), 8);
        let mut addrs = AddressArray::open(&cfg).unwrap();
        let mut data = DataArray::open(&cfg, &addrs).unwrap();

        data.set_data(&mut addrs, 0, b"gone-soon", 1).unwrap();
        data.delete_data(&mut addrs, 0, 2).unwrap();
        assert_eq!(data.get_data(&addrs, 0).unwrap(), None);
    }

    #[test]
    fn overflow_rotates_to_a_fresh_segment_and_retries() {
        let dir = tempdir().unwrap();
        let mut cfg = StoreConfig::test_config(dir.path(), 64);
        cfg.segment_file_size_mb = 1;
        let mut addrs = AddressArray::open(&cfg).unwrap();
        let mut data = DataArray::open(&cfg, &addrs).unwrap();

        let payload = vec![0xABu8; 64 * 1024];
        for i in 0..20u64 {
            data.set_data(&mut addrs, i, &payload, i + 1).unwrap();
        }
        assert!(data.segment_count() >= 2, "expected at least one rotation");
    }

    #[test]
    fn checked_mode_detects_corruption() {
        let dir = tempdir().unwrap();
        let mut cfg = StoreConfig::test_config(dir.path(), 8);
        cfg.checked = true;
        let mut addrs = AddressArray::open(&cfg).unwrap();
        let mut data = DataArray::open(&cfg, &addrs).unwrap();

        data.set_data(&mut addrs, 0, b"trustworthy", 1).unwrap();
        data.set_data(&mut addrs, 1, b"also-fine", 2).unwrap();
        assert_eq!(data.get_data(&addrs, 0).unwrap(), Some(b"trustworthy".to_vec()));

        // flip one payload byte on disk directly, leaving index 1 alone.
        let seg_path = dir.path().join("segs").join("0.seg");
        let mut bytes = std::fs::read(&seg_path).unwrap();
        let payload_start = crate::store::segment::DATA_START_POSITION as usize + 4;
        bytes[payload_start] ^= 0xFF;
        std::fs::write(&seg_path, bytes).unwrap();

        match data.get_data(&addrs, 0) {
            Err(StoreError::DataCorrupted { index: 0 }) => {}
            other => panic!("expected DataCorrupted, got {other:?}"),
        }
        assert_eq!(data.get_data(&addrs, 1).unwrap(), Some(b"also-fine".to_vec()));
    }
}
