//! Device manager: decides first-boot vs load, owns the pdev registry, the
//! system-wide vdev/chunk id spaces and the vdev create/load orchestration.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rand::Rng;
use tracing::{info, warn};

use crate::config::{HsConfig, IoMode};
use crate::error::{HsError, HsResult};
use crate::superblk::{
    hs_super_blk, round_up, Bitmap, FirstBlock, FirstBlockHeader, HsDevType, MultiPdevOpts,
    VdevInfo, FIRST_BLOCK_REGION, HOMESTORE_MAGIC, MAX_CHUNKS_IN_SYSTEM, MAX_VDEVS_IN_SYSTEM,
    SUPERBLOCK_VERSION, VDEV_INFO_SIZE,
};

use super::chunk::Chunk;
use super::physical_dev::{
    build_pdev_info, default_dev_attr, read_first_block, DevInfo, PhysicalDev,
};
use super::virtual_dev::{VdevParams, VirtualDev};

/// Upper-layer hook instantiating a concrete `VirtualDev` from a finalized
/// vdev record, both at create time and at load.
pub type VdevCreateCb = Box<dyn Fn(&VdevInfo, bool) -> Arc<VirtualDev> + Send + Sync>;

struct DmState {
    vdev_id_bm: Bitmap,
    chunk_id_bm: Bitmap,
    vdevs: HashMap<u32, Arc<VirtualDev>>,
    chunks: HashMap<u32, Arc<Chunk>>,
}

impl DmState {
    fn alloc_chunk_ids(&mut self, count: u32) -> HsResult<Vec<u32>> {
        let mut ids = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let Some(id) = self.chunk_id_bm.find_first_reset() else {
                for &id in &ids {
                    self.chunk_id_bm.reset_bit(id);
                }
                return Err(HsError::OutOfRoom(
                    "system has no room for additional chunks".into(),
                ));
            };
            self.chunk_id_bm.set_bit(id);
            ids.push(id);
        }
        Ok(ids)
    }

    fn release_chunk_ids(&mut self, ids: &[u32]) {
        for &id in ids {
            self.chunk_id_bm.reset_bit(id);
        }
    }
}

/// Creates chunks on one pdev, handing the freshly allocated ids back to the
/// bitmap when the pdev cannot satisfy the request.
fn create_chunks_or_release(
    state: &mut DmState,
    pdev: &Arc<PhysicalDev>,
    ids: &[u32],
    vdev_id: u32,
    chunk_size: u64,
    primaries: Option<&[u32]>,
) -> HsResult<(Vec<Arc<Chunk>>, Vec<u32>)> {
    match pdev.create_chunks(ids, vdev_id, chunk_size, primaries) {
        Ok(result) => Ok(result),
        Err(e) => {
            state.release_chunk_ids(ids);
            Err(e)
        }
    }
}

/// Orchestrates physical devices, chunks and virtual devices, and their
/// on-disk metadata.
pub struct DeviceManager {
    dev_infos: Vec<DevInfo>,
    cfg: HsConfig,
    vdev_create_cb: VdevCreateCb,
    first_time_boot: bool,
    authoritative_hdr: FirstBlockHeader,
    pdevs: RwLock<HashMap<u32, Arc<PhysicalDev>>>,
    pdevs_by_type: RwLock<HashMap<HsDevType, Vec<u32>>>,
    state: Mutex<DmState>,
}

impl DeviceManager {
    /// Probes every device's first block. None valid means first-time boot;
    /// otherwise the header with the highest generation number is
    /// authoritative for the subsequent `load_devices`.
    pub fn new(devs: Vec<DevInfo>, vdev_create_cb: VdevCreateCb, cfg: HsConfig) -> HsResult<Self> {
        assert!(!devs.is_empty(), "at least one device is required");

        let mut authoritative = FirstBlockHeader::default();
        let mut first_time_boot = true;
        for d in &devs {
            let fblk = match read_first_block(d, cfg.open_mode, cfg.min_chunk_size) {
                Ok(fb) => fb,
                Err(HsError::CorruptSuperblock(msg)) => {
                    // Tolerable at probe time; the device reads as unformatted.
                    warn!(dev = %d.dev_name.display(), %msg, "corrupt first block at probe");
                    continue;
                }
                Err(e) => return Err(e),
            };
            if fblk.is_valid() {
                if fblk.hdr.gen_number > authoritative.gen_number {
                    authoritative = fblk.hdr.clone();
                }
                first_time_boot = false;
            }
        }

        Ok(Self {
            dev_infos: devs,
            cfg,
            vdev_create_cb,
            first_time_boot,
            authoritative_hdr: authoritative,
            pdevs: RwLock::new(HashMap::new()),
            pdevs_by_type: RwLock::new(HashMap::new()),
            state: Mutex::new(DmState {
                vdev_id_bm: Bitmap::new(MAX_VDEVS_IN_SYSTEM),
                chunk_id_bm: Bitmap::new(MAX_CHUNKS_IN_SYSTEM),
                vdevs: HashMap::new(),
                chunks: HashMap::new(),
            }),
        })
    }

    pub fn is_first_time_boot(&self) -> bool {
        self.first_time_boot
    }

    /// Stamps every device with a fresh first block (one generation up from
    /// anything previously seen), zeroes the vdev table and formats the chunk
    /// tables.
    pub fn format_devices(&mut self) -> HsResult<()> {
        assert_ne!(self.cfg.open_mode, IoMode::ReadOnly);

        let mut hdr = self.authoritative_hdr.clone();
        hdr.version = SUPERBLOCK_VERSION;
        hdr.gen_number += 1;
        hdr.set_product_name();
        hdr.num_pdevs = self.dev_infos.len() as u32;
        hdr.max_vdevs = MAX_VDEVS_IN_SYSTEM;
        hdr.max_system_chunks = MAX_CHUNKS_IN_SYSTEM;
        hdr.system_uuid = *uuid::Uuid::new_v4().as_bytes();
        self.authoritative_hdr = hdr.clone();

        for (idx, dinfo) in self.dev_infos.iter().enumerate() {
            let attr = default_dev_attr(self.cfg.streams_per_pdev);
            let pinfo = build_pdev_info(
                dinfo,
                attr,
                idx as u32,
                hdr.system_uuid,
                self.cfg.min_chunk_size,
            )?;

            let pdev = PhysicalDev::open(dinfo, self.cfg.open_mode, pinfo.clone())?;
            pdev.ensure_size()?;

            let fblk = FirstBlock {
                magic: HOMESTORE_MAGIC,
                checksum: 0,
                hdr: hdr.clone(),
                this_pdev_hdr: pinfo.clone(),
            };
            let mut buf = vec![0u8; FIRST_BLOCK_REGION];
            fblk.encode_into(&mut buf);
            info!(
                dev = %dinfo.dev_name.display(),
                pdev_id = pinfo.pdev_id,
                gen_number = hdr.gen_number,
                data_offset = pinfo.data_offset,
                "formatting device"
            );
            pdev.write_super_block(&buf, hs_super_blk::first_block_offset())?;

            // A reformat must not resurrect vdevs from a previous life.
            let zeroes = vec![0u8; hs_super_blk::vdev_super_block_size() as usize];
            pdev.write_super_block(&zeroes, hs_super_blk::vdev_sb_offset())?;

            let seed_id = self.state.lock().alloc_chunk_ids(1)?[0];
            pdev.format_chunks(seed_id)?;

            self.register_pdev(dinfo.dev_type, pdev);
        }
        Ok(())
    }

    /// Opens every device of a previously formatted system, enforcing the
    /// version, device-count and system-uuid invariants, then reloads vdevs
    /// and chunks.
    pub fn load_devices(&mut self) -> HsResult<()> {
        if self.authoritative_hdr.version != SUPERBLOCK_VERSION {
            return Err(HsError::VersionMismatch {
                found: self.authoritative_hdr.version,
                supported: SUPERBLOCK_VERSION,
            });
        }
        if self.authoritative_hdr.num_pdevs != self.dev_infos.len() as u32 {
            return Err(HsError::NumDevicesMismatch {
                formatted: self.authoritative_hdr.num_pdevs,
                given: self.dev_infos.len() as u32,
            });
        }

        for dinfo in &self.dev_infos {
            let fblk = read_first_block(dinfo, self.cfg.open_mode, self.cfg.min_chunk_size)?;
            if !fblk.is_valid() {
                return Err(HsError::corrupt(format!(
                    "device {} has no valid first block in a formatted system",
                    dinfo.dev_name.display()
                )));
            }
            let pinfo = fblk.this_pdev_hdr;
            if pinfo.system_uuid != self.authoritative_hdr.system_uuid {
                return Err(HsError::SystemUuidMismatch {
                    dev: dinfo.dev_name.clone(),
                });
            }
            info!(
                dev = %dinfo.dev_name.display(),
                pdev_id = pinfo.pdev_id,
                gen_number = fblk.hdr.gen_number,
                "loading device"
            );
            let pdev = PhysicalDev::open(dinfo, self.cfg.open_mode, pinfo)?;
            self.register_pdev(dinfo.dev_type, pdev);
        }

        self.load_vdevs()
    }

    fn register_pdev(&self, dev_type: HsDevType, pdev: Arc<PhysicalDev>) {
        let id = pdev.pdev_id();
        self.pdevs.write().insert(id, pdev);
        self.pdevs_by_type.write().entry(dev_type).or_default().push(id);
    }

    fn pdevs_by_type_internal(&self, dtype: HsDevType) -> Vec<Arc<PhysicalDev>> {
        let by_type = self.pdevs_by_type.read();
        let ids = by_type
            .get(&dtype)
            .filter(|v| !v.is_empty())
            .or_else(|| by_type.get(&HsDevType::Data))
            .cloned()
            .unwrap_or_default();
        let pdevs = self.pdevs.read();
        ids.iter().filter_map(|id| pdevs.get(id).cloned()).collect()
    }

    /// Creates a virtual device per the placement policy: id allocation,
    /// chunk fan-out across the chosen pdevs, and a vdev record written on
    /// each of them.
    pub fn create_vdev(&self, params: VdevParams) -> HsResult<Arc<VirtualDev>> {
        assert_ne!(self.cfg.open_mode, IoMode::ReadOnly);
        assert!(params.num_chunks > 0 && params.blk_size > 0);

        let mut state = self.state.lock();

        let vdev_id = state.vdev_id_bm.find_first_reset().ok_or_else(|| {
            HsError::OutOfRoom("system has no room for additional vdevs".into())
        })?;
        state.vdev_id_bm.set_bit(vdev_id);

        let mut created_chunks = Vec::new();
        match self.create_vdev_internal(&mut state, vdev_id, params, &mut created_chunks) {
            Ok(vdev) => Ok(vdev),
            Err(e) => {
                // Undo everything this call did: release the vdev id and hand
                // the chunks created on the pdevs that succeeded back to
                // their free lists, so a retry starts from a clean slate.
                state.vdev_id_bm.reset_bit(vdev_id);
                state.vdevs.remove(&vdev_id);
                self.rollback_created_chunks(&mut state, &created_chunks);
                Err(e)
            }
        }
    }

    fn rollback_created_chunks(&self, state: &mut DmState, chunks: &[Arc<Chunk>]) {
        for chunk in chunks {
            state.chunks.remove(&chunk.chunk_id());
            let pdev = self.pdevs.read().get(&chunk.pdev_id()).cloned();
            let Some(pdev) = pdev else {
                continue;
            };
            match pdev.free_chunk(chunk.chunk_id()) {
                Ok(absorbed) => state.release_chunk_ids(&absorbed),
                Err(e) => {
                    warn!(
                        chunk_id = chunk.chunk_id(),
                        pdev_id = chunk.pdev_id(),
                        %e,
                        "failed to free a chunk while unwinding vdev create; \
                         it will surface as an orphan at the next load"
                    );
                }
            }
        }
    }

    fn create_vdev_internal(
        &self,
        state: &mut DmState,
        vdev_id: u32,
        mut vparam: VdevParams,
        created_chunks: &mut Vec<Arc<Chunk>>,
    ) -> HsResult<Arc<VirtualDev>> {
        let mut pdevs = self.pdevs_by_type_internal(vparam.dev_type);
        assert!(!pdevs.is_empty(), "no pdevs available for any tier");

        // Round the chunk count per the placement policy.
        match vparam.multi_pdev_opts {
            MultiPdevOpts::AllPdevStriped => {
                let total_streams: u32 = pdevs.iter().map(|p| p.num_streams()).sum();
                vparam.num_chunks = round_up(u64::from(vparam.num_chunks), u64::from(total_streams)) as u32;
            }
            MultiPdevOpts::AllPdevMirrored => {
                vparam.num_chunks = round_up(
                    u64::from(vparam.num_chunks),
                    u64::from(pdevs[0].num_streams()),
                ) as u32
                    * pdevs.len() as u32;
            }
            MultiPdevOpts::SingleFirstPdev => {
                pdevs.truncate(1);
            }
            MultiPdevOpts::SingleRandomPdev => {
                let pick = rand::thread_rng().gen_range(0..pdevs.len());
                pdevs = vec![pdevs[pick].clone()];
            }
        }

        let max_num_chunks: u32 = pdevs.iter().map(|p| p.max_pdev_chunks()).sum();
        let input_num_chunks = vparam.num_chunks;
        vparam.num_chunks = vparam.num_chunks.min(max_num_chunks);
        if input_num_chunks != vparam.num_chunks {
            info!(
                vdev = %vparam.vdev_name,
                input_num_chunks,
                adjusted_num_chunks = vparam.num_chunks,
                "adjusted chunk count to fit the chunk tables"
            );
        }

        let input_vdev_size = vparam.vdev_size;
        vparam.vdev_size = round_up(
            vparam.vdev_size,
            u64::from(vparam.num_chunks) * u64::from(vparam.blk_size),
        );
        if input_vdev_size != vparam.vdev_size {
            info!(
                vdev = %vparam.vdev_name,
                input_vdev_size,
                adjusted_vdev_size = vparam.vdev_size,
                "rounded vdev size up to a chunk multiple"
            );
        }

        let chunk_size = vparam.vdev_size / u64::from(vparam.num_chunks);
        let num_mirrors = if vparam.multi_pdev_opts == MultiPdevOpts::AllPdevMirrored {
            pdevs.len() as u32
        } else {
            0
        };
        info!(
            vdev = %vparam.vdev_name,
            vdev_id,
            vdev_size = vparam.vdev_size,
            num_pdevs = pdevs.len(),
            num_chunks = vparam.num_chunks,
            chunk_size,
            opts = ?vparam.multi_pdev_opts,
            "creating virtual device"
        );

        let vinfo = populate_vdev_info(&vparam, vdev_id, num_mirrors);

        // Upper layer instantiates the concrete vdev from the final record.
        let vdev = (self.vdev_create_cb)(&vinfo, false);
        state.vdevs.insert(vdev_id, vdev.clone());

        if vparam.multi_pdev_opts == MultiPdevOpts::AllPdevMirrored {
            let per_pdev = vparam.num_chunks / pdevs.len() as u32;
            let primary_ids = state.alloc_chunk_ids(per_pdev)?;
            let (primary_chunks, released) = create_chunks_or_release(
                state,
                &pdevs[0],
                &primary_ids,
                vdev_id,
                chunk_size,
                None,
            )?;
            state.release_chunk_ids(&released);
            for chunk in &primary_chunks {
                state.chunks.insert(chunk.chunk_id(), chunk.clone());
                created_chunks.push(chunk.clone());
                vdev.add_chunk(chunk.clone(), pdevs[0].clone(), true);
            }
            for pdev in pdevs.iter().skip(1) {
                let mirror_ids = state.alloc_chunk_ids(per_pdev)?;
                let (mirror_chunks, released) = create_chunks_or_release(
                    state,
                    pdev,
                    &mirror_ids,
                    vdev_id,
                    chunk_size,
                    Some(&primary_ids),
                )?;
                state.release_chunk_ids(&released);
                for chunk in &mirror_chunks {
                    state.chunks.insert(chunk.chunk_id(), chunk.clone());
                    created_chunks.push(chunk.clone());
                    vdev.add_chunk(chunk.clone(), pdev.clone(), true);
                }
            }
        } else {
            let npdevs = pdevs.len() as u32;
            for (i, pdev) in pdevs.iter().enumerate() {
                let mut count = vparam.num_chunks / npdevs;
                if (i as u32) < vparam.num_chunks % npdevs {
                    count += 1;
                }
                if count == 0 {
                    continue;
                }
                let ids = state.alloc_chunk_ids(count)?;
                let (chunks, released) =
                    create_chunks_or_release(state, pdev, &ids, vdev_id, chunk_size, None)?;
                state.release_chunk_ids(&released);
                for chunk in &chunks {
                    state.chunks.insert(chunk.chunk_id(), chunk.clone());
                    created_chunks.push(chunk.clone());
                    vdev.add_chunk(chunk.clone(), pdev.clone(), true);
                }
            }
        }

        // Persist the vdev record on every participating pdev.
        let mut buf = vec![0u8; VDEV_INFO_SIZE];
        vinfo.encode_into(&mut buf);
        let offset = hs_super_blk::vdev_sb_offset() + u64::from(vdev_id) * VDEV_INFO_SIZE as u64;
        for pdev in &pdevs {
            pdev.write_super_block(&buf, offset)?;
        }

        info!(vdev = %vparam.vdev_name, vdev_id, "virtual device created");
        Ok(vdev)
    }

    /// Reads the vdev table from every pdev, reconstructs the vdevs through
    /// the upper-layer callback and re-attaches their chunks. Chunks whose
    /// vdev record is missing are orphans from a crash mid-create; their
    /// space is reclaimed with a warning and the upper layer must retry.
    fn load_vdevs(&self) -> HsResult<()> {
        let mut state = self.state.lock();

        let pdevs: Vec<Arc<PhysicalDev>> = self.pdevs.read().values().cloned().collect();
        let mut seen_slots: HashSet<u32> = HashSet::new();
        for pdev in &pdevs {
            let mut buf = vec![0u8; hs_super_blk::vdev_super_block_size() as usize];
            pdev.read_super_block(&mut buf, hs_super_blk::vdev_sb_offset())?;

            for slot in 0..MAX_VDEVS_IN_SYSTEM {
                let off = slot as usize * VDEV_INFO_SIZE;
                let vinfo = VdevInfo::decode_from(&buf[off..off + VDEV_INFO_SIZE], slot)?;
                if !vinfo.slot_allocated || !seen_slots.insert(slot) {
                    continue;
                }
                info!(vdev_id = vinfo.vdev_id, name = %vinfo.name(), "loading virtual device");
                state.vdev_id_bm.set_bit(vinfo.vdev_id);
                let vdev = (self.vdev_create_cb)(&vinfo, true);
                state.vdevs.insert(vinfo.vdev_id, vdev);
            }
        }

        let vdev_ids: HashSet<u32> = state.vdevs.keys().copied().collect();
        for pdev in &pdevs {
            let loaded = pdev.load_chunks(|chunk| vdev_ids.contains(&chunk.vdev_id()))?;
            for chunk in loaded.busy {
                state.chunk_id_bm.set_bit(chunk.chunk_id());
                state.chunks.insert(chunk.chunk_id(), chunk.clone());
                state.vdevs[&chunk.vdev_id()].add_chunk(chunk, pdev.clone(), false);
            }
            for id in loaded.free_ids {
                state.chunk_id_bm.set_bit(id);
            }
        }
        Ok(())
    }

    /// Frees a chunk back to its pdev, merging with free neighbours and
    /// releasing absorbed chunk ids.
    pub fn free_chunk(&self, chunk_id: u32) -> HsResult<()> {
        let mut state = self.state.lock();
        let chunk = state
            .chunks
            .remove(&chunk_id)
            .ok_or_else(|| HsError::invalid_state(format!("unknown chunk {chunk_id}")))?;
        let pdev = self
            .pdevs
            .read()
            .get(&chunk.pdev_id())
            .cloned()
            .ok_or_else(|| HsError::invalid_state(format!("unknown pdev {}", chunk.pdev_id())))?;
        for absorbed in pdev.free_chunk(chunk_id)? {
            state.chunk_id_bm.reset_bit(absorbed);
        }
        Ok(())
    }

    pub fn get_vdev(&self, vdev_id: u32) -> Option<Arc<VirtualDev>> {
        self.state.lock().vdevs.get(&vdev_id).cloned()
    }

    pub fn get_vdevs(&self) -> Vec<Arc<VirtualDev>> {
        self.state.lock().vdevs.values().cloned().collect()
    }

    pub fn get_chunk(&self, chunk_id: u32) -> Option<Arc<Chunk>> {
        self.state.lock().chunks.get(&chunk_id).cloned()
    }

    pub fn get_pdevs(&self) -> Vec<Arc<PhysicalDev>> {
        self.pdevs.read().values().cloned().collect()
    }

    pub fn total_capacity(&self) -> u64 {
        self.pdevs.read().values().map(|p| p.data_size()).sum()
    }

    pub fn atomic_page_size(&self, dtype: HsDevType) -> u32 {
        self.pdevs_by_type_internal(dtype)
            .first()
            .map(|p| p.attrs().atomic_page_size)
            .expect("no pdevs of any tier")
    }

    pub fn system_uuid(&self) -> [u8; 16] {
        self.authoritative_hdr.system_uuid
    }
}

fn populate_vdev_info(vparam: &VdevParams, vdev_id: u32, num_mirrors: u32) -> VdevInfo {
    let mut vinfo = VdevInfo {
        vdev_size: vparam.vdev_size,
        vdev_id,
        num_mirrors,
        blk_size: vparam.blk_size,
        num_primary_chunks: if num_mirrors > 0 {
            vparam.num_chunks / num_mirrors
        } else {
            vparam.num_chunks
        },
        slot_allocated: true,
        alloc_type: vparam.alloc_type as u8,
        chunk_sel_type: vparam.chunk_sel_type as u8,
        dev_type: vparam.dev_type as u8,
        pdev_choice: vparam.multi_pdev_opts as u8,
        ..Default::default()
    };
    vinfo.set_name(&vparam.vdev_name);
    vinfo.set_user_private(&vparam.context_data);
    vinfo
}
