//! Block data service: tentative block allocation over a virtual device with
//! commit-on-journal-ack semantics.
//!
//! Allocation state is in-memory; a block becomes durable only once
//! `commit_blk` runs, which the replication layer does after the journal
//! append completes. Uncommitted allocations simply vanish on restart and are
//! re-created by journal replay.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use crate::checkpoint::{Cp, CpCallbacks, CpContext};
use crate::device::blkid::{BlkId, MultiBlkId};
use crate::device::virtual_dev::VirtualDev;
use crate::error::{HsError, HsResult};
use crate::superblk::Bitmap;

/// Placement hints the upper layer passes into an allocation.
#[derive(Debug, Clone, Copy, Default)]
pub struct BlkAllocHints {
    pub preferred_chunk: Option<u32>,
}

struct ChunkAlloc {
    chunk_id: u32,
    nblks: u32,
    allocated: Bitmap,
    committed: Bitmap,
}

impl ChunkAlloc {
    /// Longest free run starting search at bit 0, capped at `max_len`.
    fn best_free_run(&self, max_len: u32) -> Option<(u32, u32)> {
        let mut best: Option<(u32, u32)> = None;
        let mut run_start = 0u32;
        let mut run_len = 0u32;
        for bit in 0..self.nblks {
            if self.allocated.is_set(bit) {
                run_len = 0;
                run_start = bit + 1;
                continue;
            }
            run_len += 1;
            if best.map(|(_, l)| run_len > l).unwrap_or(true) {
                best = Some((run_start, run_len));
            }
            if run_len >= max_len {
                break;
            }
        }
        best.map(|(s, l)| (s, l.min(max_len)))
    }
}

struct AllocState {
    chunks: Vec<ChunkAlloc>,
    by_id: HashMap<u32, usize>,
}

/// Data-path service over one virtual device.
pub struct BlkDataService {
    vdev: Arc<VirtualDev>,
    blk_size: u32,
    state: Mutex<AllocState>,
    rr: AtomicUsize,
}

impl BlkDataService {
    pub fn new(vdev: Arc<VirtualDev>) -> Arc<Self> {
        let blk_size = vdev.blk_size();
        let mut chunks = Vec::new();
        let mut by_id = HashMap::new();
        for chunk in vdev.primary_chunks() {
            let nblks = vdev.blks_in_chunk(&chunk);
            by_id.insert(chunk.chunk_id(), chunks.len());
            chunks.push(ChunkAlloc {
                chunk_id: chunk.chunk_id(),
                nblks,
                allocated: Bitmap::new(nblks),
                committed: Bitmap::new(nblks),
            });
        }
        Arc::new(Self {
            vdev,
            blk_size,
            state: Mutex::new(AllocState { chunks, by_id }),
            rr: AtomicUsize::new(0),
        })
    }

    pub fn blk_size(&self) -> u32 {
        self.blk_size
    }

    pub fn vdev(&self) -> &Arc<VirtualDev> {
        &self.vdev
    }

    /// Allocates blocks for `size` bytes, contiguous where possible and split
    /// across chunks when fragmented. The allocation is tentative until
    /// `commit_blk`.
    pub fn alloc_blks(&self, size: u64, hints: &BlkAllocHints) -> HsResult<MultiBlkId> {
        assert!(size > 0, "allocation of zero bytes");
        let mut remaining = size.div_ceil(u64::from(self.blk_size)) as u32;

        let mut state = self.state.lock();
        let nchunks = state.chunks.len();
        if nchunks == 0 {
            return Err(HsError::NoSpace("data vdev has no chunks".into()));
        }

        // Visit the hinted chunk first, then round-robin over the rest.
        let start = hints
            .preferred_chunk
            .and_then(|id| state.by_id.get(&id).copied())
            .unwrap_or_else(|| self.rr.fetch_add(1, Ordering::Relaxed) % nchunks);

        let mut blkid = MultiBlkId::new();
        for i in 0..nchunks {
            if remaining == 0 {
                break;
            }
            let chunk = &mut state.chunks[(start + i) % nchunks];
            loop {
                let cap = remaining.min(u32::from(u16::MAX));
                // Prefer a single contiguous run; fall back to the best run
                // the chunk still has.
                let run = chunk
                    .allocated
                    .find_contiguous_reset(cap)
                    .map(|s| (s, cap))
                    .or_else(|| chunk.best_free_run(cap));
                let Some((run_start, run_len)) = run else {
                    break;
                };
                chunk.allocated.set_bits(run_start, run_len);
                blkid.add(BlkId::new(chunk.chunk_id, run_start, run_len as u16));
                remaining -= run_len;
                if remaining == 0 {
                    break;
                }
            }
        }

        if remaining > 0 {
            // Roll the partial allocation back before reporting exhaustion.
            for piece in blkid.pieces() {
                let idx = state.by_id[&piece.chunk_id];
                state.chunks[idx]
                    .allocated
                    .reset_bits(piece.blk_num, u32::from(piece.nblks));
            }
            return Err(HsError::NoSpace(format!(
                "data vdev cannot allocate {size} bytes"
            )));
        }
        Ok(blkid)
    }

    /// Makes an allocation durable to the allocator. Idempotent, and also
    /// valid for allocations this incarnation never made (journal replay).
    pub fn commit_blk(&self, blkid: &MultiBlkId) {
        let mut state = self.state.lock();
        for piece in blkid.pieces() {
            let Some(&idx) = state.by_id.get(&piece.chunk_id) else {
                debug!(chunk_id = piece.chunk_id, "commit for unknown chunk ignored");
                continue;
            };
            let chunk = &mut state.chunks[idx];
            chunk.allocated.set_bits(piece.blk_num, u32::from(piece.nblks));
            chunk.committed.set_bits(piece.blk_num, u32::from(piece.nblks));
        }
    }

    pub fn is_committed(&self, blkid: &MultiBlkId) -> bool {
        let state = self.state.lock();
        blkid.pieces().iter().all(|piece| {
            state.by_id.get(&piece.chunk_id).is_some_and(|&idx| {
                (0..u32::from(piece.nblks))
                    .all(|i| state.chunks[idx].committed.is_set(piece.blk_num + i))
            })
        })
    }

    pub async fn async_write(&self, value: Vec<u8>, blkid: &MultiBlkId) -> HsResult<()> {
        self.vdev.async_write(value, blkid).await
    }

    pub async fn async_read(&self, blkid: &MultiBlkId, size: usize) -> HsResult<Vec<u8>> {
        self.vdev.async_read(blkid, size).await
    }

    pub async fn async_free_blk(&self, blkid: MultiBlkId) -> HsResult<()> {
        let mut state = self.state.lock();
        for piece in blkid.pieces() {
            let idx = *state.by_id.get(&piece.chunk_id).ok_or_else(|| {
                HsError::invalid_state(format!("free of unknown chunk {}", piece.chunk_id))
            })?;
            let chunk = &mut state.chunks[idx];
            chunk.allocated.reset_bits(piece.blk_num, u32::from(piece.nblks));
            chunk.committed.reset_bits(piece.blk_num, u32::from(piece.nblks));
        }
        Ok(())
    }
}

/// The data service participates in checkpoints so the flush fan-out covers
/// it; allocator persistence itself lives behind the allocator seam.
#[async_trait]
impl CpCallbacks for BlkDataService {
    fn on_switchover_cp(&self, _cur_cp: Option<&Cp>, _new_cp: &Cp) -> Option<CpContext> {
        None
    }

    async fn cp_flush(&self, _cp: Arc<Cp>) {}

    fn cp_cleanup(&self, _cp: &Cp) {}

    fn cp_progress_percent(&self) -> u32 {
        100
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::superblk::VdevInfo;

    // Allocator-only tests drive the bitmap logic without any backing files.
    fn svc_with_chunks(nblks_per_chunk: u32, nchunks: u32) -> Arc<BlkDataService> {
        let info = VdevInfo {
            vdev_size: u64::from(nblks_per_chunk) * u64::from(nchunks) * 4096,
            vdev_id: 0,
            blk_size: 4096,
            num_primary_chunks: nchunks,
            slot_allocated: true,
            ..Default::default()
        };
        let vdev = VirtualDev::new(info);
        let mut chunks = Vec::new();
        let mut by_id = HashMap::new();
        for c in 0..nchunks {
            by_id.insert(c, chunks.len());
            chunks.push(ChunkAlloc {
                chunk_id: c,
                nblks: nblks_per_chunk,
                allocated: Bitmap::new(nblks_per_chunk),
                committed: Bitmap::new(nblks_per_chunk),
            });
        }
        Arc::new(BlkDataService {
            vdev,
            blk_size: 4096,
            state: Mutex::new(AllocState { chunks, by_id }),
            rr: AtomicUsize::new(0),
        })
    }

    #[test]
    fn alloc_commit_free_cycle() {
        let svc = svc_with_chunks(64, 1);
        let blkid = svc.alloc_blks(2 * 4096, &BlkAllocHints::default()).unwrap();
        assert_eq!(blkid.num_blks(), 2);
        assert!(!svc.is_committed(&blkid));

        svc.commit_blk(&blkid);
        assert!(svc.is_committed(&blkid));

        futures::executor::block_on(svc.async_free_blk(blkid.clone())).unwrap();
        assert!(!svc.is_committed(&blkid));
    }

    #[test]
    fn alloc_spills_across_chunks() {
        let svc = svc_with_chunks(8, 2);
        // 12 blocks cannot fit one 8-block chunk.
        let blkid = svc.alloc_blks(12 * 4096, &BlkAllocHints::default()).unwrap();
        assert_eq!(blkid.num_blks(), 12);
        assert!(blkid.pieces().len() >= 2);
        let chunk_ids: std::collections::HashSet<u32> =
            blkid.pieces().iter().map(|p| p.chunk_id).collect();
        assert!(chunk_ids.len() >= 2);
    }

    #[test]
    fn exhaustion_rolls_back() {
        let svc = svc_with_chunks(8, 1);
        let first = svc.alloc_blks(6 * 4096, &BlkAllocHints::default()).unwrap();
        assert!(matches!(
            svc.alloc_blks(4 * 4096, &BlkAllocHints::default()),
            Err(HsError::NoSpace(_))
        ));
        // The failed allocation must not leak blocks: the 2 remaining ones
        // are still available.
        let rest = svc.alloc_blks(2 * 4096, &BlkAllocHints::default()).unwrap();
        assert_eq!(rest.num_blks(), 2);
        drop(first);
    }

    #[test]
    fn hint_steers_placement() {
        let svc = svc_with_chunks(8, 4);
        let hints = BlkAllocHints {
            preferred_chunk: Some(2),
        };
        let blkid = svc.alloc_blks(4096, &hints).unwrap();
        assert_eq!(blkid.pieces()[0].chunk_id, 2);
    }

    #[test]
    fn replay_commit_of_unseen_allocation() {
        let svc = svc_with_chunks(16, 1);
        // Recovery calls commit_blk for blocks this incarnation never
        // allocated; the allocator must adopt them.
        let mut blkid = MultiBlkId::new();
        blkid.add(BlkId::new(0, 5, 3));
        svc.commit_blk(&blkid);
        assert!(svc.is_committed(&blkid));

        // And those blocks are no longer allocatable.
        let fresh = svc.alloc_blks(14 * 4096, &BlkAllocHints::default());
        assert!(matches!(fresh, Err(HsError::NoSpace(_))));
    }
}
