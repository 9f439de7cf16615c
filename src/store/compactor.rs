//! Compactor: drains low-load segments by copying live blobs into a
//! fresh segment and rewriting their addresses (spec §4.4).

use crate::store::address::Address;
use crate::store::address_array::AddressArray;
use crate::store::data_array::DataArray;
use crate::store::error::Result;

/// One compaction pass over a single candidate segment. The caller
/// (`Store`) is responsible for serializing this against concurrent
/// writer mutations, per the single-writer contract in §5.
pub struct Compactor {
    segment_compact_trigger: f64,
    segment_compact_factor: f64,
}

/// A segment whose reclaim is pending LWM advancing past `min_lwm`.
pub struct PendingReclaim {
    pub segment_id: u32,
    pub min_lwm: u64,
}

/// Result of one `compact_segment` pass.
pub enum CompactionOutcome {
    /// No address pointed into the candidate; it was freed immediately
    /// (no redo entries were appended, so no LWM gate applies).
    ReclaimedEmpty,
    /// At least one record was migrated; `source` is reclaimable once
    /// LWM reaches the enclosed `min_lwm`.
    Migrated(PendingReclaim),
    /// Every record found in the initial scan had already been
    /// superseded by the time it was about to be copied — only possible
    /// if the single-writer contract is violated. Nothing changed.
    NoOp,
}

impl Compactor {
    pub fn new(segment_compact_trigger: f64, segment_compact_factor: f64) -> Self {
        Self {
            segment_compact_trigger,
            segment_compact_factor,
        }
    }

    /// Picks the read-only segment with the lowest live ratio among
    /// those whose load factor clears `segment_compact_trigger` and
    /// whose live ratio falls under `segment_compact_factor`. Never
    /// picks the writer's current segment or one already in `excluded`
    /// (segments already compacted and awaiting LWM-gated reclaim —
    /// re-picking them would allocate another empty target every pass).
    pub fn pick_candidate(&self, data: &DataArray, excluded: &[u32]) -> Option<u32> {
        let current = data.current_segment_id();
        data.segment_ids()
            .filter(|&id| id != current && !excluded.contains(&id))
            .filter_map(|id| {
                let load_factor = data.segment_load_factor(id)?;
                let live_ratio = data.segment_live_ratio(id)?;
                if load_factor > self.segment_compact_trigger
                    && live_ratio < self.segment_compact_factor
                {
                    Some((id, live_ratio))
                } else {
                    None
                }
            })
            .min_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap())
            .map(|(id, _)| id)
    }

    /// Runs one compaction pass over `source`. A first pass over the
    /// address array determines whether anything still lives there; a
    /// target segment is allocated only once that is known, so a
    /// segment with zero live records never leaks an empty target.
    pub fn compact_segment(
        &self,
        source: u32,
        address_array: &mut AddressArray,
        data: &mut DataArray,
    ) -> Result<CompactionOutcome> {
        let mut live = Vec::new();
        for index in 0..address_array.capacity() {
            let addr = address_array.get(index)?;
            if !addr.is_none() && addr.seg_id() as u32 == source {
                live.push((index, addr));
            }
        }

        if live.is_empty() {
            data.free_segment(source)?;
            log::info!(
                "compaction: segment {} held no live records, reclaimed directly",
                source
            );
            return Ok(CompactionOutcome::ReclaimedEmpty);
        }

        let target = data.allocate_compaction_target()?;
        log::info!("compaction: migrating segment {} -> {}", source, target);

        let mut max_scn = address_array.lw_mark();
        let mut copied = 0u64;

        for (index, addr) in live {
            // Re-check immediately before copying: between the scan
            // start and this point nothing else may have mutated the
            // array under the single-writer contract, but the check
            // keeps the logic correct even if that contract is loosened
            // later to interleaved batches.
            let current = address_array.get(index)?;
            if current != addr {
                continue;
            }

            let payload = data.raw_read(source, addr.offset(), addr.length())?;
            let new_offset = data.raw_append(target, &payload)?;
            let new_address = Address::new(target as u16, new_offset, addr.length());

            let scn_next = address_array.hw_mark() + 1;
            address_array.set_compaction_address(index, new_address, scn_next)?;
            data.record_copy(source, target, 4 + addr.length() as u64);

            max_scn = max_scn.max(scn_next);
            copied += 1;
        }

        if copied == 0 {
            data.free_segment(target)?;
            log::warn!(
                "compaction: every candidate record in segment {} was superseded before copy, no-op",
                source
            );
            return Ok(CompactionOutcome::NoOp);
        }

        log::info!(
            "compaction: segment {} scan complete, {} record(s) migrated, pending reclaim at lwm>={}",
            source,
            copied,
            max_scn
        );

        Ok(CompactionOutcome::Migrated(PendingReclaim {
            segment_id: source,
            min_lwm: max_scn,
        }))
    }

    /// Frees every pending reclaim whose `min_lwm` has been reached,
    /// returning the ones still waiting.
    pub fn reclaim_ready(
        &self,
        pending: Vec<PendingReclaim>,
        address_array: &AddressArray,
        data: &mut DataArray,
    ) -> Result<Vec<PendingReclaim>> {
        let lwm = address_array.lw_mark();
        let mut still_pending = Vec::new();
        for reclaim in pending {
            if lwm >= reclaim.min_lwm {
                data.free_segment(reclaim.segment_id)?;
                log::info!("compaction: reclaimed segment {}", reclaim.segment_id);
            } else {
                still_pending.push(reclaim);
            }
        }
        Ok(still_pending)
    }
}
