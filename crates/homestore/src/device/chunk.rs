//! In-memory chunk handle.
//!
//! A chunk is a contiguous byte range on one physical device, the unit of
//! allocation for virtual devices. Neighbour and mirror relations are stable
//! numeric ids resolved through the registry, never pointers.

use crate::superblk::{ChunkInfo, INVALID_CHUNK_ID, INVALID_VDEV_ID};

/// Immutable snapshot of a persisted chunk slot. Geometry never changes while
/// the chunk is busy; free/merge transitions happen inside the owning
/// physical device's chunk table and produce fresh handles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    chunk_id: u32,
    pdev_id: u32,
    vdev_id: u32,
    start_offset: u64,
    size: u64,
    primary_chunk_id: u32,
    is_sb_chunk: bool,
}

impl Chunk {
    pub(crate) fn from_info(info: &ChunkInfo) -> Self {
        Self {
            chunk_id: info.chunk_id,
            pdev_id: info.pdev_id,
            vdev_id: info.vdev_id,
            start_offset: info.chunk_start_offset,
            size: info.chunk_size,
            primary_chunk_id: info.primary_chunk_id,
            is_sb_chunk: info.is_sb_chunk,
        }
    }

    pub fn chunk_id(&self) -> u32 {
        self.chunk_id
    }

    pub fn pdev_id(&self) -> u32 {
        self.pdev_id
    }

    pub fn vdev_id(&self) -> u32 {
        self.vdev_id
    }

    pub fn start_offset(&self) -> u64 {
        self.start_offset
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Id of the chunk this one mirrors, `INVALID_CHUNK_ID` for primaries.
    pub fn primary_chunk_id(&self) -> u32 {
        self.primary_chunk_id
    }

    pub fn is_primary(&self) -> bool {
        self.primary_chunk_id == INVALID_CHUNK_ID
    }

    pub fn is_busy(&self) -> bool {
        self.vdev_id != INVALID_VDEV_ID || self.is_sb_chunk
    }
}

impl std::fmt::Display for Chunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "chunk_id={} pdev_id={} vdev_id={} start_offset={} size={} busy={}",
            self.chunk_id, self.pdev_id, self.vdev_id, self.start_offset, self.size,
            self.is_busy()
        )
    }
}
