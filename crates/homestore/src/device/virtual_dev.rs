//! Virtual device: a set of chunks across physical devices presented as one
//! logical block device.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::task::spawn_blocking;

use crate::error::{HsError, HsResult};
use crate::superblk::{HsDevType, MultiPdevOpts, VdevInfo, INVALID_CHUNK_ID};

use super::blkid::MultiBlkId;
use super::chunk::Chunk;
use super::physical_dev::PhysicalDev;

/// Block-allocator flavour recorded in the vdev slot. The allocator itself
/// lives behind the data-service seam; the id is opaque to this layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum BlkAllocatorType {
    FixedBlk = 1,
}

/// Chunk-selection strategy recorded in the vdev slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ChunkSelectorType {
    RoundRobin = 1,
}

/// Parameters for creating a virtual device.
#[derive(Debug, Clone)]
pub struct VdevParams {
    pub vdev_name: String,
    pub vdev_size: u64,
    pub num_chunks: u32,
    /// Atomic write unit exposed to clients of this vdev.
    pub blk_size: u32,
    pub dev_type: HsDevType,
    pub multi_pdev_opts: MultiPdevOpts,
    pub alloc_type: BlkAllocatorType,
    pub chunk_sel_type: ChunkSelectorType,
    pub context_data: Vec<u8>,
}

struct VdevState {
    /// Primary chunks in attach order.
    primaries: Vec<Arc<Chunk>>,
    /// Every chunk of this vdev with the pdev it lives on.
    by_id: HashMap<u32, (Arc<Chunk>, Arc<PhysicalDev>)>,
    /// Primary chunk id -> its mirror chunks.
    mirrors: HashMap<u32, Vec<Arc<Chunk>>>,
}

/// A collection of chunks presented as one logical block device. Write
/// placement is fully determined by the chunk id inside the `MultiBlkId`.
pub struct VirtualDev {
    info: VdevInfo,
    state: RwLock<VdevState>,
}

impl std::fmt::Debug for VirtualDev {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualDev")
            .field("vdev_id", &self.info.vdev_id)
            .finish()
    }
}

impl VirtualDev {
    pub fn new(info: VdevInfo) -> Arc<Self> {
        Arc::new(Self {
            info,
            state: RwLock::new(VdevState {
                primaries: Vec::new(),
                by_id: HashMap::new(),
                mirrors: HashMap::new(),
            }),
        })
    }

    pub fn vdev_id(&self) -> u32 {
        self.info.vdev_id
    }

    pub fn info(&self) -> &VdevInfo {
        &self.info
    }

    pub fn blk_size(&self) -> u32 {
        self.info.blk_size
    }

    pub fn size(&self) -> u64 {
        self.info.vdev_size
    }

    pub fn name(&self) -> String {
        self.info.name()
    }

    /// Attaches a chunk, fresh at create time or re-attached at load.
    pub fn add_chunk(&self, chunk: Arc<Chunk>, pdev: Arc<PhysicalDev>, _fresh_chunk: bool) {
        debug_assert_eq!(chunk.vdev_id(), self.info.vdev_id);
        let mut state = self.state.write();
        state.by_id.insert(chunk.chunk_id(), (chunk.clone(), pdev));
        if chunk.primary_chunk_id() == INVALID_CHUNK_ID {
            state.primaries.push(chunk);
        } else {
            state
                .mirrors
                .entry(chunk.primary_chunk_id())
                .or_default()
                .push(chunk);
        }
    }

    pub fn num_chunks(&self) -> usize {
        self.state.read().by_id.len()
    }

    pub fn primary_chunks(&self) -> Vec<Arc<Chunk>> {
        self.state.read().primaries.clone()
    }

    /// Blocks a chunk can hold at this vdev's block size.
    pub fn blks_in_chunk(&self, chunk: &Chunk) -> u32 {
        (chunk.size() / u64::from(self.info.blk_size)) as u32
    }

    fn piece_target(&self, chunk_id: u32) -> HsResult<(Arc<Chunk>, Arc<PhysicalDev>, Vec<(Arc<Chunk>, Arc<PhysicalDev>)>)> {
        let state = self.state.read();
        let (chunk, pdev) = state
            .by_id
            .get(&chunk_id)
            .cloned()
            .ok_or_else(|| HsError::invalid_state(format!("chunk {chunk_id} not on this vdev")))?;
        let mirrors = state
            .mirrors
            .get(&chunk_id)
            .map(|v| {
                v.iter()
                    .filter_map(|m| state.by_id.get(&m.chunk_id()).cloned())
                    .collect()
            })
            .unwrap_or_default();
        Ok((chunk, pdev, mirrors))
    }

    /// Writes `buf` to the blocks named by `blkid`, mirror copies included.
    /// The future resolves once the data is down on every target device.
    pub async fn async_write(&self, buf: Vec<u8>, blkid: &MultiBlkId) -> HsResult<()> {
        let blk_size = u64::from(self.info.blk_size);
        let capacity = u64::from(blkid.num_blks()) * blk_size;
        assert!(
            buf.len() as u64 <= capacity,
            "write of {} bytes into {capacity}-byte allocation",
            buf.len()
        );

        let mut ops: Vec<(Arc<PhysicalDev>, u64, Vec<u8>)> = Vec::new();
        let mut cursor = 0usize;
        for piece in blkid.pieces() {
            if cursor >= buf.len() {
                break;
            }
            let (chunk, pdev, mirrors) = self.piece_target(piece.chunk_id)?;
            let piece_cap = (u64::from(piece.nblks) * blk_size) as usize;
            let len = piece_cap.min(buf.len() - cursor);
            let data = buf[cursor..cursor + len].to_vec();
            cursor += len;

            let off_in_chunk = u64::from(piece.blk_num) * blk_size;
            debug_assert!(off_in_chunk + len as u64 <= chunk.size());
            for (mchunk, mpdev) in mirrors {
                ops.push((mpdev, mchunk.start_offset() + off_in_chunk, data.clone()));
            }
            ops.push((pdev, chunk.start_offset() + off_in_chunk, data));
        }

        spawn_blocking(move || -> HsResult<()> {
            for (pdev, offset, data) in &ops {
                pdev.write_data(data, *offset)?;
            }
            for (pdev, _, _) in &ops {
                pdev.sync_data()?;
            }
            Ok(())
        })
        .await
        .expect("vdev write task panicked")
    }

    /// Reads `size` bytes from the blocks named by `blkid` (primary copies).
    pub async fn async_read(&self, blkid: &MultiBlkId, size: usize) -> HsResult<Vec<u8>> {
        let blk_size = u64::from(self.info.blk_size);
        assert!(size as u64 <= u64::from(blkid.num_blks()) * blk_size);

        let mut ops: Vec<(Arc<PhysicalDev>, u64, usize, usize)> = Vec::new();
        let mut cursor = 0usize;
        for piece in blkid.pieces() {
            if cursor >= size {
                break;
            }
            let (chunk, pdev, _mirrors) = self.piece_target(piece.chunk_id)?;
            let piece_cap = (u64::from(piece.nblks) * blk_size) as usize;
            let len = piece_cap.min(size - cursor);
            let off_in_chunk = u64::from(piece.blk_num) * blk_size;
            ops.push((pdev, chunk.start_offset() + off_in_chunk, cursor, len));
            cursor += len;
        }

        spawn_blocking(move || -> HsResult<Vec<u8>> {
            let mut out = vec![0u8; size];
            for (pdev, offset, at, len) in &ops {
                pdev.read_data(&mut out[*at..*at + *len], *offset)?;
            }
            Ok(out)
        })
        .await
        .expect("vdev read task panicked")
    }
}
