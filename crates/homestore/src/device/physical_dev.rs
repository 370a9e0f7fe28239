//! Physical device: raw device/file access, aligned superblock-region I/O and
//! the persisted per-device chunk table.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::IoMode;
use crate::error::{HsError, HsResult};
use crate::superblk::{
    hs_super_blk, round_up, Bitmap, ChunkInfo, DevAttr, FirstBlock, HsDevType, PdevInfoHeader,
    FIRST_BLOCK_REGION, INVALID_CHUNK_ID, INVALID_PDEV_ID,
};

use super::chunk::Chunk;

/// Rotational vs solid-state media. Files default to `Ssd`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DriveKind {
    Ssd,
    Hdd,
}

/// One device (or file) handed to the device manager.
#[derive(Debug, Clone)]
pub struct DevInfo {
    pub dev_name: PathBuf,
    pub dev_type: HsDevType,
    pub drive_kind: DriveKind,
    /// Zero means "discover from the file metadata".
    pub dev_size: u64,
}

impl DevInfo {
    pub fn new(dev_name: impl Into<PathBuf>, dev_type: HsDevType) -> Self {
        Self {
            dev_name: dev_name.into(),
            dev_type,
            drive_kind: DriveKind::Ssd,
            dev_size: 0,
        }
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.dev_size = size;
        self
    }

    pub fn with_drive_kind(mut self, kind: DriveKind) -> Self {
        self.drive_kind = kind;
        self
    }

    pub fn is_hdd(&self) -> bool {
        self.drive_kind == DriveKind::Hdd
    }

    /// Device size from the info if given, else from the file metadata.
    pub fn resolved_size(&self) -> HsResult<u64> {
        if self.dev_size != 0 {
            return Ok(self.dev_size);
        }
        Ok(std::fs::metadata(&self.dev_name)?.len())
    }
}

/// Geometry a freshly formatted file-backed device advertises.
pub(crate) fn default_dev_attr(num_streams: u32) -> DevAttr {
    DevAttr {
        align_size: 512,
        atomic_page_size: 4096,
        optimal_page_size: 4096,
        num_streams,
    }
}

fn open_device(path: &Path, mode: IoMode, hdd: bool) -> HsResult<File> {
    let mut opts = OpenOptions::new();
    match mode {
        IoMode::ReadOnly => {
            opts.read(true);
        }
        IoMode::Buffered => {
            opts.read(true).write(true).create(true);
        }
        IoMode::Direct => {
            opts.read(true).write(true).create(true);
            // Direct I/O buys nothing on rotational media here; downgrade.
            if !hdd {
                opts.custom_flags(libc::O_DIRECT);
            }
        }
    }
    Ok(opts.open(path)?)
}

/// Heap buffer aligned for direct-I/O superblock transfers.
pub(crate) struct AlignedBuf {
    ptr: NonNull<u8>,
    len: usize,
    layout: Layout,
}

unsafe impl Send for AlignedBuf {}

impl AlignedBuf {
    pub(crate) fn new(len: usize, align: usize) -> Self {
        let layout = Layout::from_size_align(len, align).expect("aligned buf layout");
        let ptr = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).expect("aligned buf allocation failed");
        Self { ptr, len, layout }
    }

    pub(crate) fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub(crate) fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for AlignedBuf {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

/// Computes the persistent header of a device being formatted.
pub(crate) fn build_pdev_info(
    dinfo: &DevInfo,
    attr: DevAttr,
    pdev_id: u32,
    system_uuid: [u8; 16],
    min_chunk_size: u64,
) -> HsResult<PdevInfoHeader> {
    let dev_size = dinfo.resolved_size()?;
    let max_pdev_chunks = hs_super_blk::max_chunks_in_pdev(dev_size, min_chunk_size);
    let data_offset = round_up(
        hs_super_blk::total_size(max_pdev_chunks),
        u64::from(attr.optimal_page_size),
    );
    let hdd = dinfo.is_hdd();
    let reserved = data_offset + if hdd { data_offset } else { 0 };
    if dev_size <= reserved {
        return Err(HsError::NoSpace(format!(
            "device {} of size {dev_size} cannot hold a {reserved}-byte superblock region",
            dinfo.dev_name.display()
        )));
    }
    Ok(PdevInfoHeader {
        pdev_id,
        mirror_super_block: if hdd { 1 } else { 0 },
        max_pdev_chunks,
        data_offset,
        size: dev_size - reserved,
        dev_attr: attr,
        system_uuid,
    })
}

/// Reads and validates the leading block of a device.
///
/// An absent magic yields `is_valid() == false` rather than an error: the
/// device is simply unformatted. On HDDs the tail mirror is consulted as
/// well; when both copies validate, the higher generation number wins.
pub(crate) fn read_first_block(
    dinfo: &DevInfo,
    mode: IoMode,
    min_chunk_size: u64,
) -> HsResult<FirstBlock> {
    let file = open_device(&dinfo.dev_name, mode, dinfo.is_hdd())?;
    let dev_size = dinfo.resolved_size()?;

    let primary = read_block_at(&file, hs_super_blk::first_block_offset());
    if !dinfo.is_hdd() {
        return primary;
    }

    let max_chunks = hs_super_blk::max_chunks_in_pdev(dev_size, min_chunk_size);
    let attr = default_dev_attr(1);
    let data_offset = round_up(
        hs_super_blk::total_size(max_chunks),
        u64::from(attr.optimal_page_size),
    );
    let mirror = if dev_size > data_offset {
        read_block_at(&file, dev_size - data_offset)
    } else {
        primary.as_ref().map(|fb| fb.clone()).map_err(|_| HsError::corrupt("no mirror region"))
    };

    match (primary, mirror) {
        (Ok(p), Ok(m)) => {
            if p.is_valid() && m.is_valid() {
                Ok(if p.hdr.gen_number >= m.hdr.gen_number { p } else { m })
            } else if p.is_valid() {
                Ok(p)
            } else {
                Ok(m)
            }
        }
        (Ok(p), Err(_)) => Ok(p),
        (Err(_), Ok(m)) if m.is_valid() => Ok(m),
        (Err(e), _) => Err(e),
    }
}

fn read_block_at(file: &File, offset: u64) -> HsResult<FirstBlock> {
    let mut buf = AlignedBuf::new(FIRST_BLOCK_REGION, FIRST_BLOCK_REGION);
    read_zero_extended(file, buf.as_mut_slice(), offset)?;
    FirstBlock::decode_from(buf.as_slice())
}

/// Positional read that zero-fills past EOF, so probing a fresh file sees an
/// unformatted block instead of a short-read error.
fn read_zero_extended(file: &File, buf: &mut [u8], offset: u64) -> HsResult<()> {
    let mut done = 0usize;
    while done < buf.len() {
        let n = file.read_at(&mut buf[done..], offset + done as u64)?;
        if n == 0 {
            buf[done..].fill(0);
            break;
        }
        done += n;
    }
    Ok(())
}

/// Result of scanning a persisted chunk table.
pub(crate) struct LoadedChunks {
    pub busy: Vec<Arc<Chunk>>,
    pub free_ids: Vec<u32>,
}

/// The per-device chunk table: slot bitmap, fixed slot array and the
/// offset-ordered intrusive list threaded through prev/next chunk ids.
#[derive(Clone)]
struct ChunkTable {
    max_chunks: u32,
    bitmap: Bitmap,
    slots: Vec<ChunkInfo>,
    by_id: HashMap<u32, usize>,
    head: u32,
}

impl ChunkTable {
    fn empty(max_chunks: u32) -> Self {
        Self {
            max_chunks,
            bitmap: Bitmap::new(max_chunks),
            slots: vec![ChunkInfo::default(); max_chunks as usize],
            by_id: HashMap::new(),
            head: INVALID_CHUNK_ID,
        }
    }

    fn slot_of(&self, chunk_id: u32) -> HsResult<usize> {
        self.by_id.get(&chunk_id).copied().ok_or_else(|| {
            HsError::invalid_state(format!("chunk id {chunk_id} not present in chunk table"))
        })
    }

    fn info(&self, chunk_id: u32) -> HsResult<ChunkInfo> {
        Ok(self.slots[self.slot_of(chunk_id)?])
    }

    /// Re-stamps `old_id` as `new_id`, fixing every link that names it.
    fn rename(&mut self, old_id: u32, new_id: u32) -> HsResult<()> {
        let idx = self.slot_of(old_id)?;
        let (prev, next) = (self.slots[idx].prev_chunk_id, self.slots[idx].next_chunk_id);
        self.slots[idx].chunk_id = new_id;
        self.by_id.remove(&old_id);
        self.by_id.insert(new_id, idx);
        if prev != INVALID_CHUNK_ID {
            let p = self.slot_of(prev)?;
            self.slots[p].next_chunk_id = new_id;
        }
        if next != INVALID_CHUNK_ID {
            let n = self.slot_of(next)?;
            self.slots[n].prev_chunk_id = new_id;
        }
        if self.head == old_id {
            self.head = new_id;
        }
        Ok(())
    }

    /// Unlinks and releases the slot of `chunk_id`.
    fn remove(&mut self, chunk_id: u32) -> HsResult<()> {
        let idx = self.slot_of(chunk_id)?;
        let (prev, next) = (self.slots[idx].prev_chunk_id, self.slots[idx].next_chunk_id);
        if prev != INVALID_CHUNK_ID {
            let p = self.slot_of(prev)?;
            self.slots[p].next_chunk_id = next;
        }
        if next != INVALID_CHUNK_ID {
            let n = self.slot_of(next)?;
            self.slots[n].prev_chunk_id = prev;
        }
        if self.head == chunk_id {
            self.head = next;
        }
        self.bitmap.reset_bit(idx as u32);
        self.slots[idx] = ChunkInfo::default();
        self.by_id.remove(&chunk_id);
        Ok(())
    }

    /// Smallest free chunk that fits `req_size`; ties broken by lower offset.
    fn find_best_fit_free(&self, req_size: u64) -> Option<u32> {
        let mut best: Option<(u64, u64, u32)> = None;
        let mut id = self.head;
        while id != INVALID_CHUNK_ID {
            let info = &self.slots[self.by_id[&id]];
            if !info.is_busy() && info.chunk_size >= req_size {
                let key = (info.chunk_size, info.chunk_start_offset, id);
                if best.map(|b| key < (b.0, b.1, b.2)).unwrap_or(true) {
                    best = Some(key);
                }
            }
            id = info.next_chunk_id;
        }
        best.map(|b| b.2)
    }

    fn allocated_ids_by_offset(&self) -> Vec<u32> {
        let mut ids = Vec::new();
        let mut id = self.head;
        while id != INVALID_CHUNK_ID {
            ids.push(id);
            id = self.slots[self.by_id[&id]].next_chunk_id;
        }
        ids
    }

    /// Marks `chunk_id` free and coalesces it with free neighbours. Returns
    /// the ids absorbed into the surviving chunk.
    fn free_and_merge(&mut self, chunk_id: u32) -> HsResult<Vec<u32>> {
        let idx = self.slot_of(chunk_id)?;
        self.slots[idx].set_free();

        let mut absorbed = Vec::new();
        let mut cur_id = chunk_id;

        let prev_id = self.slots[idx].prev_chunk_id;
        if prev_id != INVALID_CHUNK_ID {
            let p = self.slot_of(prev_id)?;
            if !self.slots[p].is_busy() {
                let cur_size = self.slots[self.slot_of(cur_id)?].chunk_size;
                self.slots[p].chunk_size += cur_size;
                self.remove(cur_id)?;
                absorbed.push(cur_id);
                cur_id = prev_id;
            }
        }

        let next_id = self.slots[self.slot_of(cur_id)?].next_chunk_id;
        if next_id != INVALID_CHUNK_ID {
            let n = self.slot_of(next_id)?;
            if !self.slots[n].is_busy() {
                let next_size = self.slots[n].chunk_size;
                let c = self.slot_of(cur_id)?;
                self.slots[c].chunk_size += next_size;
                self.remove(next_id)?;
                absorbed.push(next_id);
            }
        }
        Ok(absorbed)
    }
}

/// One open block device or file participating in the store.
pub struct PhysicalDev {
    dev_name: PathBuf,
    file: File,
    hdr: PdevInfoHeader,
    dev_size: u64,
    table: Mutex<Option<ChunkTable>>,
}

impl PhysicalDev {
    pub(crate) fn open(dinfo: &DevInfo, mode: IoMode, hdr: PdevInfoHeader) -> HsResult<Arc<Self>> {
        assert!(hdr.dev_attr.align_size > 0, "align size must be known");
        assert!(
            hdr.dev_attr.atomic_page_size as usize >= crate::superblk::ATOMIC_FB_SIZE,
            "atomic page size below the first-block write unit"
        );
        assert_ne!(hdr.pdev_id, INVALID_PDEV_ID);

        let file = open_device(&dinfo.dev_name, mode, dinfo.is_hdd())?;
        let dev_size = dinfo.resolved_size()?;
        Ok(Arc::new(Self {
            dev_name: dinfo.dev_name.clone(),
            file,
            hdr,
            dev_size,
            table: Mutex::new(None),
        }))
    }

    pub fn pdev_id(&self) -> u32 {
        self.hdr.pdev_id
    }

    pub fn dev_name(&self) -> &Path {
        &self.dev_name
    }

    pub fn attrs(&self) -> DevAttr {
        self.hdr.dev_attr
    }

    pub fn num_streams(&self) -> u32 {
        self.hdr.dev_attr.num_streams
    }

    pub fn data_offset(&self) -> u64 {
        self.hdr.data_offset
    }

    pub fn data_size(&self) -> u64 {
        self.hdr.size
    }

    pub fn max_pdev_chunks(&self) -> u32 {
        self.hdr.max_pdev_chunks
    }

    /// Grows a file-backed device to its advertised size.
    pub(crate) fn ensure_size(&self) -> HsResult<()> {
        if self.file.metadata()?.len() < self.dev_size {
            self.file.set_len(self.dev_size)?;
        }
        Ok(())
    }

    fn mirror_base(&self) -> u64 {
        self.dev_size - self.hdr.data_offset
    }

    /// Aligned synchronous read from the superblock region.
    pub fn read_super_block(&self, buf: &mut [u8], offset: u64) -> HsResult<()> {
        let align = self.hdr.dev_attr.align_size as usize;
        let len = round_up(buf.len() as u64, align as u64) as usize;
        let mut scratch = AlignedBuf::new(len, align);
        read_zero_extended(&self.file, scratch.as_mut_slice(), offset)?;
        buf.copy_from_slice(&scratch.as_slice()[..buf.len()]);
        Ok(())
    }

    /// Aligned synchronous write to the superblock region, duplicated to the
    /// tail mirror on devices that carry one.
    pub fn write_super_block(&self, buf: &[u8], offset: u64) -> HsResult<()> {
        let align = self.hdr.dev_attr.align_size as usize;
        let len = round_up(buf.len() as u64, align as u64) as usize;
        let mut scratch = AlignedBuf::new(len, align);
        scratch.as_mut_slice()[..buf.len()].copy_from_slice(buf);

        self.file.write_all_at(scratch.as_slice(), offset)?;
        if self.hdr.mirror_super_block != 0 {
            self.file
                .write_all_at(scratch.as_slice(), self.mirror_base() + offset)?;
        }
        self.file.sync_data()?;
        Ok(())
    }

    /// Unchecked data-region read used by the virtual-device I/O path.
    pub(crate) fn read_data(&self, buf: &mut [u8], offset: u64) -> HsResult<()> {
        debug_assert!(offset >= self.hdr.data_offset);
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    pub(crate) fn write_data(&self, buf: &[u8], offset: u64) -> HsResult<()> {
        debug_assert!(offset >= self.hdr.data_offset);
        debug_assert!(offset + buf.len() as u64 <= self.hdr.data_offset + self.hdr.size);
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    pub(crate) fn sync_data(&self) -> HsResult<()> {
        self.file.sync_data()?;
        Ok(())
    }

    /// Initialises the on-disk chunk table: every slot free, the whole data
    /// region covered by one seed free chunk owning `seed_chunk_id`.
    pub(crate) fn format_chunks(&self, seed_chunk_id: u32) -> HsResult<()> {
        let mut tbl = ChunkTable::empty(self.hdr.max_pdev_chunks);
        tbl.slots[0] = ChunkInfo {
            chunk_start_offset: self.hdr.data_offset,
            chunk_size: self.hdr.size,
            chunk_id: seed_chunk_id,
            pdev_id: self.hdr.pdev_id,
            slot_allocated: true,
            ..Default::default()
        };
        tbl.bitmap.set_bit(0);
        tbl.by_id.insert(seed_chunk_id, 0);
        tbl.head = seed_chunk_id;

        self.persist_table(&tbl)?;
        *self.table.lock() = Some(tbl);
        debug!(pdev_id = self.hdr.pdev_id, seed_chunk_id, "formatted chunk table");
        Ok(())
    }

    /// Creates one busy chunk per requested id, carving space from the free
    /// chunks of this device (best fit, lower offset on ties). Exact-fit
    /// allocations re-stamp the free chunk; its old id is returned so the
    /// registry can release it. `primaries`, when given, pairs each new chunk
    /// with the chunk id it mirrors.
    pub(crate) fn create_chunks(
        &self,
        chunk_ids: &[u32],
        vdev_id: u32,
        chunk_size: u64,
        primaries: Option<&[u32]>,
    ) -> HsResult<(Vec<Arc<Chunk>>, Vec<u32>)> {
        if let Some(p) = primaries {
            assert_eq!(p.len(), chunk_ids.len());
        }
        let mut guard = self.table.lock();
        let tbl = guard
            .as_ref()
            .ok_or_else(|| HsError::invalid_state("chunk table not loaded"))?;
        let mut work = tbl.clone();

        let req_size = round_up(chunk_size, u64::from(self.hdr.dev_attr.optimal_page_size));
        let mut created = Vec::with_capacity(chunk_ids.len());
        let mut released = Vec::new();

        for (i, &new_id) in chunk_ids.iter().enumerate() {
            let free_id = work.find_best_fit_free(req_size).ok_or_else(|| {
                HsError::NoSpace(format!(
                    "pdev {} has no free chunk of {req_size} bytes",
                    self.hdr.pdev_id
                ))
            })?;
            let free_idx = work.slot_of(free_id)?;
            let primary = primaries.map(|p| p[i]).unwrap_or(INVALID_CHUNK_ID);

            let idx = if work.slots[free_idx].chunk_size == req_size {
                work.rename(free_id, new_id)?;
                released.push(free_id);
                work.slot_of(new_id)?
            } else {
                // Carve the request off the front; the residue keeps its id.
                let slot = work.bitmap.find_first_reset().ok_or_else(|| {
                    HsError::OutOfRoom(format!(
                        "pdev {} chunk table has no free slot",
                        self.hdr.pdev_id
                    ))
                })? as usize;
                let free = work.slots[free_idx];
                work.slots[slot] = ChunkInfo {
                    chunk_start_offset: free.chunk_start_offset,
                    chunk_id: new_id,
                    pdev_id: self.hdr.pdev_id,
                    prev_chunk_id: free.prev_chunk_id,
                    next_chunk_id: free_id,
                    slot_allocated: true,
                    ..Default::default()
                };
                work.bitmap.set_bit(slot as u32);
                work.by_id.insert(new_id, slot);
                if free.prev_chunk_id != INVALID_CHUNK_ID {
                    let p = work.slot_of(free.prev_chunk_id)?;
                    work.slots[p].next_chunk_id = new_id;
                }
                work.slots[free_idx].prev_chunk_id = new_id;
                work.slots[free_idx].chunk_start_offset += req_size;
                work.slots[free_idx].chunk_size -= req_size;
                if work.head == free_id {
                    work.head = new_id;
                }
                slot
            };

            work.slots[idx].chunk_size = req_size;
            work.slots[idx].vdev_id = vdev_id;
            work.slots[idx].primary_chunk_id = primary;
            created.push(Arc::new(Chunk::from_info(&work.slots[idx])));
        }

        self.persist_table(&work)?;
        *guard = Some(work);
        Ok((created, released))
    }

    /// Frees a chunk and coalesces it with free neighbours. Returns the ids
    /// absorbed into the surviving free chunk.
    pub(crate) fn free_chunk(&self, chunk_id: u32) -> HsResult<Vec<u32>> {
        let mut guard = self.table.lock();
        let tbl = guard
            .as_mut()
            .ok_or_else(|| HsError::invalid_state("chunk table not loaded"))?;
        let absorbed = tbl.free_and_merge(chunk_id)?;
        let snapshot = tbl.clone();
        self.persist_table(&snapshot)?;
        Ok(absorbed)
    }

    /// Reads the persisted chunk table and rebuilds in-memory state. Busy
    /// chunks failing `filter` are orphans from a crashed vdev create: they
    /// are not added to the result and their slots are left on disk exactly
    /// as found, with a warning so the upper layer retries the create.
    pub(crate) fn load_chunks(
        &self,
        mut filter: impl FnMut(&Chunk) -> bool,
    ) -> HsResult<LoadedChunks> {
        let max_chunks = self.hdr.max_pdev_chunks;
        let bitmap_len = Bitmap::serialized_size(max_chunks);
        let region_off = hs_super_blk::chunk_bitmap_offset();
        let region_len = (hs_super_blk::total_size(max_chunks) - region_off) as usize;
        let mut buf = vec![0u8; region_len];
        self.read_super_block(&mut buf, region_off)?;

        let bitmap = Bitmap::read_from(&buf[..bitmap_len], max_chunks);
        let slots_off = (hs_super_blk::chunk_info_offset(max_chunks) - region_off) as usize;

        let mut tbl = ChunkTable::empty(max_chunks);
        tbl.bitmap = bitmap;
        for idx in 0..max_chunks as usize {
            if !tbl.bitmap.is_set(idx as u32) {
                continue;
            }
            let off = slots_off + idx * crate::superblk::CHUNK_INFO_SIZE;
            let info = ChunkInfo::read_from(&buf[off..off + crate::superblk::CHUNK_INFO_SIZE]);
            if !info.slot_allocated {
                return Err(HsError::corrupt(format!(
                    "pdev {} chunk slot {idx} set in bitmap but not allocated",
                    self.hdr.pdev_id
                )));
            }
            tbl.slots[idx] = info;
            tbl.by_id.insert(info.chunk_id, idx);
            if info.prev_chunk_id == INVALID_CHUNK_ID {
                tbl.head = info.chunk_id;
            }
        }

        let mut busy = Vec::new();
        for id in tbl.allocated_ids_by_offset() {
            let info = tbl.info(id)?;
            if !info.is_busy() {
                continue;
            }
            let chunk = Arc::new(Chunk::from_info(&info));
            if filter(&chunk) {
                busy.push(chunk);
            } else {
                // The slot keeps its id and owner, untouched, until the
                // upper layer retries the create.
                warn!(
                    pdev_id = self.hdr.pdev_id,
                    chunk_id = id,
                    vdev_id = info.vdev_id,
                    "chunk belongs to a missing vdev, likely a crash before \
                     the vdev record was written; upper layer must retry vdev \
                     create"
                );
            }
        }

        let free_ids: Vec<u32> = tbl
            .allocated_ids_by_offset()
            .into_iter()
            .filter(|&id| !tbl.info(id).map(|i| i.is_busy()).unwrap_or(true))
            .collect();

        *self.table.lock() = Some(tbl);
        Ok(LoadedChunks { busy, free_ids })
    }

    fn persist_table(&self, tbl: &ChunkTable) -> HsResult<()> {
        let region_off = hs_super_blk::chunk_bitmap_offset();
        let region_len = (hs_super_blk::total_size(tbl.max_chunks) - region_off) as usize;
        let mut buf = vec![0u8; region_len];

        let bitmap_len = Bitmap::serialized_size(tbl.max_chunks);
        tbl.bitmap.write_into(&mut buf[..bitmap_len]);
        let slots_off = (hs_super_blk::chunk_info_offset(tbl.max_chunks) - region_off) as usize;
        for (idx, slot) in tbl.slots.iter().enumerate() {
            let off = slots_off + idx * crate::superblk::CHUNK_INFO_SIZE;
            slot.write_into(&mut buf[off..off + crate::superblk::CHUNK_INFO_SIZE]);
        }
        self.write_super_block(&buf, region_off)
    }

    /// Offset-ordered `(chunk_id, start, size, busy)` view for tests and
    /// diagnostics.
    pub fn chunk_list_snapshot(&self) -> Vec<(u32, u64, u64, bool)> {
        let guard = self.table.lock();
        let Some(tbl) = guard.as_ref() else {
            return Vec::new();
        };
        tbl.allocated_ids_by_offset()
            .into_iter()
            .map(|id| {
                let info = tbl.slots[tbl.by_id[&id]];
                (id, info.chunk_start_offset, info.chunk_size, info.is_busy())
            })
            .collect()
    }
}
