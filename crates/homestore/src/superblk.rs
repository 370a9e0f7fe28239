//! On-disk metadata codec: first block, physical-device header, chunk and
//! vdev records, plus the layout calculator for the per-device superblock
//! region.
//!
//! All records are packed little-endian with zero padding. The first block is
//! protected by CRC32-IEEE over its leading atomic-write-sized range; vdev
//! slots carry a CRC-16 T10-DIF each.

use byteorder::{ByteOrder, LittleEndian};
use crc::{Crc, CRC_16_T10_DIF};
use serde::{Deserialize, Serialize};

use crate::error::{HsError, HsResult};

/// Magic tag stamped on every formatted device.
pub const HOMESTORE_MAGIC: u64 = 0xCEED_DEEB_CEED_DEEB;
/// Version of the first-block layout. Mismatch is a fatal boot error.
pub const SUPERBLOCK_VERSION: u32 = 1;
/// Product name recorded in the first block.
pub const PRODUCT_NAME: &str = "HomeStore";

/// Checksummed prefix of the first block. Must not exceed the smallest
/// atomic-write granularity any supported device advertises.
pub const ATOMIC_FB_SIZE: usize = 512;
/// On-disk footprint reserved for the first block.
pub const FIRST_BLOCK_REGION: usize = 4096;

pub const MAX_VDEVS_IN_SYSTEM: u32 = 16;
pub const MAX_CHUNKS_IN_SYSTEM: u32 = 2048;

pub const VDEV_INFO_SIZE: usize = 512;
pub const CHUNK_INFO_SIZE: usize = 64;
pub const VDEV_NAME_SIZE: usize = 64;
pub const VDEV_USER_PRIVATE_SIZE: usize = 256;
const PRODUCT_NAME_SIZE: usize = 64;

pub const INVALID_PDEV_ID: u32 = u32::MAX;
pub const INVALID_VDEV_ID: u32 = u32::MAX;
pub const INVALID_CHUNK_ID: u32 = u32::MAX;

const FB_HDR_OFFSET: usize = 16;
const PDEV_HDR_OFFSET: usize = 120;

const CHUNK_FLAG_SLOT_ALLOCATED: u8 = 0x01;
const CHUNK_FLAG_SB_CHUNK: u8 = 0x02;
const VDEV_FLAG_SLOT_ALLOCATED: u8 = 0x01;

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_T10_DIF);

/// CRC32-IEEE over a byte range.
pub fn crc32_ieee(bytes: &[u8]) -> u32 {
    crc32fast::hash(bytes)
}

/// CRC-16 T10-DIF over a byte range.
pub fn crc16_t10dif(bytes: &[u8]) -> u16 {
    CRC16.checksum(bytes)
}

/// Rounds `value` up to the next multiple of `align`.
pub fn round_up(value: u64, align: u64) -> u64 {
    debug_assert!(align > 0);
    value.div_ceil(align) * align
}

/// Tier of a physical device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum HsDevType {
    Data = 0,
    Fast = 1,
}

impl TryFrom<u8> for HsDevType {
    type Error = HsError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(HsDevType::Data),
            1 => Ok(HsDevType::Fast),
            other => Err(HsError::corrupt(format!("unknown dev type: {other}"))),
        }
    }
}

/// Placement policy of a virtual device across physical devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MultiPdevOpts {
    AllPdevStriped = 0,
    AllPdevMirrored = 1,
    SingleFirstPdev = 2,
    SingleRandomPdev = 3,
}

impl TryFrom<u8> for MultiPdevOpts {
    type Error = HsError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MultiPdevOpts::AllPdevStriped),
            1 => Ok(MultiPdevOpts::AllPdevMirrored),
            2 => Ok(MultiPdevOpts::SingleFirstPdev),
            3 => Ok(MultiPdevOpts::SingleRandomPdev),
            other => Err(HsError::corrupt(format!("unknown pdev choice: {other}"))),
        }
    }
}

/// I/O geometry advertised by a device at open time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DevAttr {
    /// Required alignment of superblock-region I/O.
    pub align_size: u32,
    /// Largest power-of-two write the device guarantees to be torn-free.
    pub atomic_page_size: u32,
    /// Preferred I/O unit.
    pub optimal_page_size: u32,
    /// Allocation streams this device supports.
    pub num_streams: u32,
}

impl DevAttr {
    const SIZE: usize = 16;

    fn write_into(&self, dst: &mut [u8]) {
        LittleEndian::write_u32(&mut dst[0..4], self.align_size);
        LittleEndian::write_u32(&mut dst[4..8], self.atomic_page_size);
        LittleEndian::write_u32(&mut dst[8..12], self.optimal_page_size);
        LittleEndian::write_u32(&mut dst[12..16], self.num_streams);
    }

    fn read_from(src: &[u8]) -> Self {
        Self {
            align_size: LittleEndian::read_u32(&src[0..4]),
            atomic_page_size: LittleEndian::read_u32(&src[4..8]),
            optimal_page_size: LittleEndian::read_u32(&src[8..12]),
            num_streams: LittleEndian::read_u32(&src[12..16]),
        }
    }
}

/// System-wide portion of the first block, identical on every device of one
/// formatted system except that the highest `gen_number` wins at load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirstBlockHeader {
    pub version: u32,
    /// Monotonic across reformats of the same device set.
    pub gen_number: u64,
    pub product_name: [u8; PRODUCT_NAME_SIZE],
    pub num_pdevs: u32,
    pub max_vdevs: u32,
    pub max_system_chunks: u32,
    pub system_uuid: [u8; 16],
}

impl Default for FirstBlockHeader {
    fn default() -> Self {
        Self {
            version: 0,
            gen_number: 0,
            product_name: [0u8; PRODUCT_NAME_SIZE],
            num_pdevs: 0,
            max_vdevs: MAX_VDEVS_IN_SYSTEM,
            max_system_chunks: MAX_CHUNKS_IN_SYSTEM,
            system_uuid: [0u8; 16],
        }
    }
}

impl FirstBlockHeader {
    const SIZE: usize = 104;

    pub fn set_product_name(&mut self) {
        let bytes = PRODUCT_NAME.as_bytes();
        self.product_name[..bytes.len()].copy_from_slice(bytes);
    }

    fn write_into(&self, dst: &mut [u8]) {
        LittleEndian::write_u32(&mut dst[0..4], self.version);
        LittleEndian::write_u64(&mut dst[4..12], self.gen_number);
        dst[12..76].copy_from_slice(&self.product_name);
        LittleEndian::write_u32(&mut dst[76..80], self.num_pdevs);
        LittleEndian::write_u32(&mut dst[80..84], self.max_vdevs);
        LittleEndian::write_u32(&mut dst[84..88], self.max_system_chunks);
        dst[88..104].copy_from_slice(&self.system_uuid);
    }

    fn read_from(src: &[u8]) -> Self {
        let mut product_name = [0u8; PRODUCT_NAME_SIZE];
        product_name.copy_from_slice(&src[12..76]);
        let mut system_uuid = [0u8; 16];
        system_uuid.copy_from_slice(&src[88..104]);
        Self {
            version: LittleEndian::read_u32(&src[0..4]),
            gen_number: LittleEndian::read_u64(&src[4..12]),
            product_name,
            num_pdevs: LittleEndian::read_u32(&src[76..80]),
            max_vdevs: LittleEndian::read_u32(&src[80..84]),
            max_system_chunks: LittleEndian::read_u32(&src[84..88]),
            system_uuid,
        }
    }
}

/// Per-device portion of the first block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PdevInfoHeader {
    pub pdev_id: u32,
    /// Nonzero when a mirrored copy of the superblock region sits at the
    /// device tail (HDD path).
    pub mirror_super_block: u8,
    pub max_pdev_chunks: u32,
    /// Start of the chunk data region, relative to the device start.
    pub data_offset: u64,
    /// Usable data bytes past `data_offset`.
    pub size: u64,
    pub dev_attr: DevAttr,
    pub system_uuid: [u8; 16],
}

impl PdevInfoHeader {
    const SIZE: usize = 60;

    fn write_into(&self, dst: &mut [u8]) {
        LittleEndian::write_u32(&mut dst[0..4], self.pdev_id);
        dst[4] = self.mirror_super_block;
        dst[5..8].fill(0);
        LittleEndian::write_u32(&mut dst[8..12], self.max_pdev_chunks);
        LittleEndian::write_u64(&mut dst[12..20], self.data_offset);
        LittleEndian::write_u64(&mut dst[20..28], self.size);
        self.dev_attr.write_into(&mut dst[28..28 + DevAttr::SIZE]);
        dst[44..60].copy_from_slice(&self.system_uuid);
    }

    fn read_from(src: &[u8]) -> Self {
        let mut system_uuid = [0u8; 16];
        system_uuid.copy_from_slice(&src[44..60]);
        Self {
            pdev_id: LittleEndian::read_u32(&src[0..4]),
            mirror_super_block: src[4],
            max_pdev_chunks: LittleEndian::read_u32(&src[8..12]),
            data_offset: LittleEndian::read_u64(&src[12..20]),
            size: LittleEndian::read_u64(&src[20..28]),
            dev_attr: DevAttr::read_from(&src[28..28 + DevAttr::SIZE]),
            system_uuid,
        }
    }
}

/// The leading block of every formatted device. Written atomically inside the
/// first `ATOMIC_FB_SIZE` bytes.
#[derive(Debug, Clone)]
pub struct FirstBlock {
    pub magic: u64,
    pub checksum: u32,
    pub hdr: FirstBlockHeader,
    pub this_pdev_hdr: PdevInfoHeader,
}

impl FirstBlock {
    /// A device without the magic tag is simply unformatted, not corrupt.
    pub fn is_valid(&self) -> bool {
        self.magic == HOMESTORE_MAGIC
    }

    /// Encodes into `dst` (at least `ATOMIC_FB_SIZE` bytes) and stamps the
    /// checksum computed with the checksum field zeroed.
    pub fn encode_into(&self, dst: &mut [u8]) {
        assert!(dst.len() >= ATOMIC_FB_SIZE);
        dst[..ATOMIC_FB_SIZE].fill(0);
        LittleEndian::write_u64(&mut dst[0..8], self.magic);
        LittleEndian::write_u32(&mut dst[8..12], 0);
        self.hdr
            .write_into(&mut dst[FB_HDR_OFFSET..FB_HDR_OFFSET + FirstBlockHeader::SIZE]);
        self.this_pdev_hdr
            .write_into(&mut dst[PDEV_HDR_OFFSET..PDEV_HDR_OFFSET + PdevInfoHeader::SIZE]);
        let checksum = crc32_ieee(&dst[..ATOMIC_FB_SIZE]);
        LittleEndian::write_u32(&mut dst[8..12], checksum);
    }

    /// Decodes the leading block of a device.
    ///
    /// Returns a block with `is_valid() == false` when no magic is present.
    /// A present magic with a failing checksum is `CorruptSuperblock`.
    pub fn decode_from(src: &[u8]) -> HsResult<Self> {
        assert!(src.len() >= ATOMIC_FB_SIZE);
        let magic = LittleEndian::read_u64(&src[0..8]);
        let checksum = LittleEndian::read_u32(&src[8..12]);
        let hdr = FirstBlockHeader::read_from(&src[FB_HDR_OFFSET..FB_HDR_OFFSET + FirstBlockHeader::SIZE]);
        let this_pdev_hdr =
            PdevInfoHeader::read_from(&src[PDEV_HDR_OFFSET..PDEV_HDR_OFFSET + PdevInfoHeader::SIZE]);
        let fb = Self {
            magic,
            checksum,
            hdr,
            this_pdev_hdr,
        };
        if !fb.is_valid() {
            return Ok(fb);
        }

        let mut scratch = [0u8; ATOMIC_FB_SIZE];
        scratch.copy_from_slice(&src[..ATOMIC_FB_SIZE]);
        LittleEndian::write_u32(&mut scratch[8..12], 0);
        let expected = crc32_ieee(&scratch);
        if expected != checksum {
            return Err(HsError::corrupt(format!(
                "first block checksum mismatch: stored {checksum:#x}, computed {expected:#x}"
            )));
        }
        Ok(fb)
    }
}

/// One slot of the per-device chunk table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkInfo {
    /// Start offset of the chunk within its pdev.
    pub chunk_start_offset: u64,
    pub chunk_size: u64,
    /// Chunk id in system-wide scope.
    pub chunk_id: u32,
    pub pdev_id: u32,
    /// Owning vdev, `INVALID_VDEV_ID` if the chunk is free.
    pub vdev_id: u32,
    /// Prev neighbour by start offset in the pdev chunk list.
    pub prev_chunk_id: u32,
    /// Next neighbour by start offset in the pdev chunk list.
    pub next_chunk_id: u32,
    /// Chunk this one mirrors, `INVALID_CHUNK_ID` if it is a primary.
    pub primary_chunk_id: u32,
    pub slot_allocated: bool,
    pub is_sb_chunk: bool,
}

impl Default for ChunkInfo {
    fn default() -> Self {
        Self {
            chunk_start_offset: 0,
            chunk_size: 0,
            chunk_id: INVALID_CHUNK_ID,
            pdev_id: INVALID_PDEV_ID,
            vdev_id: INVALID_VDEV_ID,
            prev_chunk_id: INVALID_CHUNK_ID,
            next_chunk_id: INVALID_CHUNK_ID,
            primary_chunk_id: INVALID_CHUNK_ID,
            slot_allocated: false,
            is_sb_chunk: false,
        }
    }
}

impl ChunkInfo {
    pub fn is_busy(&self) -> bool {
        self.vdev_id != INVALID_VDEV_ID || self.is_sb_chunk
    }

    pub fn set_free(&mut self) {
        self.vdev_id = INVALID_VDEV_ID;
        self.primary_chunk_id = INVALID_CHUNK_ID;
        self.is_sb_chunk = false;
    }

    pub fn write_into(&self, dst: &mut [u8]) {
        assert!(dst.len() >= CHUNK_INFO_SIZE);
        dst[..CHUNK_INFO_SIZE].fill(0);
        LittleEndian::write_u64(&mut dst[0..8], self.chunk_start_offset);
        LittleEndian::write_u64(&mut dst[8..16], self.chunk_size);
        LittleEndian::write_u32(&mut dst[16..20], self.chunk_id);
        LittleEndian::write_u32(&mut dst[20..24], self.pdev_id);
        LittleEndian::write_u32(&mut dst[24..28], self.vdev_id);
        LittleEndian::write_u32(&mut dst[28..32], self.prev_chunk_id);
        LittleEndian::write_u32(&mut dst[32..36], self.next_chunk_id);
        LittleEndian::write_u32(&mut dst[36..40], self.primary_chunk_id);
        let mut flags = 0u8;
        if self.slot_allocated {
            flags |= CHUNK_FLAG_SLOT_ALLOCATED;
        }
        if self.is_sb_chunk {
            flags |= CHUNK_FLAG_SB_CHUNK;
        }
        dst[40] = flags;
    }

    pub fn read_from(src: &[u8]) -> Self {
        assert!(src.len() >= CHUNK_INFO_SIZE);
        let flags = src[40];
        Self {
            chunk_start_offset: LittleEndian::read_u64(&src[0..8]),
            chunk_size: LittleEndian::read_u64(&src[8..16]),
            chunk_id: LittleEndian::read_u32(&src[16..20]),
            pdev_id: LittleEndian::read_u32(&src[20..24]),
            vdev_id: LittleEndian::read_u32(&src[24..28]),
            prev_chunk_id: LittleEndian::read_u32(&src[28..32]),
            next_chunk_id: LittleEndian::read_u32(&src[32..36]),
            primary_chunk_id: LittleEndian::read_u32(&src[36..40]),
            slot_allocated: flags & CHUNK_FLAG_SLOT_ALLOCATED != 0,
            is_sb_chunk: flags & CHUNK_FLAG_SB_CHUNK != 0,
        }
    }
}

/// One slot of the vdev table, replicated on every pdev the vdev spans.
/// Fixed 512 bytes, CRC-16 T10-DIF protected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VdevInfo {
    pub vdev_size: u64,
    pub vdev_id: u32,
    pub num_mirrors: u32,
    pub blk_size: u32,
    pub num_primary_chunks: u32,
    pub slot_allocated: bool,
    pub alloc_type: u8,
    pub chunk_sel_type: u8,
    pub dev_type: u8,
    pub pdev_choice: u8,
    pub name: [u8; VDEV_NAME_SIZE],
    pub checksum: u16,
    pub user_private: [u8; VDEV_USER_PRIVATE_SIZE],
}

impl Default for VdevInfo {
    fn default() -> Self {
        Self {
            vdev_size: 0,
            vdev_id: INVALID_VDEV_ID,
            num_mirrors: 0,
            blk_size: 0,
            num_primary_chunks: 0,
            slot_allocated: false,
            alloc_type: 0,
            chunk_sel_type: 0,
            dev_type: HsDevType::Data as u8,
            pdev_choice: 0,
            name: [0u8; VDEV_NAME_SIZE],
            checksum: 0,
            user_private: [0u8; VDEV_USER_PRIVATE_SIZE],
        }
    }
}

impl VdevInfo {
    pub fn set_name(&mut self, name: &str) {
        self.name.fill(0);
        let bytes = name.as_bytes();
        let len = bytes.len().min(VDEV_NAME_SIZE - 1);
        self.name[..len].copy_from_slice(&bytes[..len]);
    }

    pub fn name(&self) -> String {
        let end = self.name.iter().position(|&b| b == 0).unwrap_or(VDEV_NAME_SIZE);
        String::from_utf8_lossy(&self.name[..end]).into_owned()
    }

    pub fn set_user_private(&mut self, data: &[u8]) {
        assert!(data.len() <= VDEV_USER_PRIVATE_SIZE);
        self.user_private.fill(0);
        self.user_private[..data.len()].copy_from_slice(data);
    }

    fn write_fields(&self, dst: &mut [u8]) {
        dst[..VDEV_INFO_SIZE].fill(0);
        LittleEndian::write_u64(&mut dst[0..8], self.vdev_size);
        LittleEndian::write_u32(&mut dst[8..12], self.vdev_id);
        LittleEndian::write_u32(&mut dst[12..16], self.num_mirrors);
        LittleEndian::write_u32(&mut dst[16..20], self.blk_size);
        LittleEndian::write_u32(&mut dst[20..24], self.num_primary_chunks);
        dst[24] = if self.slot_allocated { VDEV_FLAG_SLOT_ALLOCATED } else { 0 };
        dst[25] = self.alloc_type;
        dst[26] = self.chunk_sel_type;
        dst[27] = self.dev_type;
        dst[28] = self.pdev_choice;
        dst[32..96].copy_from_slice(&self.name);
        dst[128..384].copy_from_slice(&self.user_private);
    }

    /// Encodes into `dst` (at least `VDEV_INFO_SIZE` bytes) with the checksum
    /// computed over the record with the checksum field zeroed.
    pub fn encode_into(&self, dst: &mut [u8]) {
        assert!(dst.len() >= VDEV_INFO_SIZE);
        self.write_fields(dst);
        let checksum = crc16_t10dif(&dst[..VDEV_INFO_SIZE]);
        LittleEndian::write_u16(&mut dst[96..98], checksum);
    }

    /// Decodes a vdev slot, verifying the CRC when one is present.
    pub fn decode_from(src: &[u8], slot: u32) -> HsResult<Self> {
        assert!(src.len() >= VDEV_INFO_SIZE);
        let checksum = LittleEndian::read_u16(&src[96..98]);
        if checksum != 0 {
            let mut scratch = [0u8; VDEV_INFO_SIZE];
            scratch.copy_from_slice(&src[..VDEV_INFO_SIZE]);
            LittleEndian::write_u16(&mut scratch[96..98], 0);
            let expected = crc16_t10dif(&scratch);
            if expected != checksum {
                return Err(HsError::corrupt(format!(
                    "vdev slot {slot} crc mismatch: stored {checksum:#x}, computed {expected:#x}"
                )));
            }
        }

        let mut name = [0u8; VDEV_NAME_SIZE];
        name.copy_from_slice(&src[32..96]);
        let mut user_private = [0u8; VDEV_USER_PRIVATE_SIZE];
        user_private.copy_from_slice(&src[128..384]);
        Ok(Self {
            vdev_size: LittleEndian::read_u64(&src[0..8]),
            vdev_id: LittleEndian::read_u32(&src[8..12]),
            num_mirrors: LittleEndian::read_u32(&src[12..16]),
            blk_size: LittleEndian::read_u32(&src[16..20]),
            num_primary_chunks: LittleEndian::read_u32(&src[20..24]),
            slot_allocated: src[24] & VDEV_FLAG_SLOT_ALLOCATED != 0,
            alloc_type: src[25],
            chunk_sel_type: src[26],
            dev_type: src[27],
            pdev_choice: src[28],
            name,
            checksum,
            user_private,
        })
    }
}

/// Dense bitmap backing id spaces and on-disk chunk-slot allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitmap {
    nbits: u32,
    words: Vec<u64>,
}

impl Bitmap {
    pub fn new(nbits: u32) -> Self {
        Self {
            nbits,
            words: vec![0u64; nbits.div_ceil(64) as usize],
        }
    }

    pub fn nbits(&self) -> u32 {
        self.nbits
    }

    pub fn serialized_size(nbits: u32) -> usize {
        nbits.div_ceil(64) as usize * 8
    }

    pub fn set_bit(&mut self, bit: u32) {
        assert!(bit < self.nbits);
        self.words[(bit / 64) as usize] |= 1u64 << (bit % 64);
    }

    pub fn reset_bit(&mut self, bit: u32) {
        assert!(bit < self.nbits);
        self.words[(bit / 64) as usize] &= !(1u64 << (bit % 64));
    }

    pub fn is_set(&self, bit: u32) -> bool {
        assert!(bit < self.nbits);
        self.words[(bit / 64) as usize] & (1u64 << (bit % 64)) != 0
    }

    /// Lowest clear bit, if any.
    pub fn find_first_reset(&self) -> Option<u32> {
        for (w, word) in self.words.iter().enumerate() {
            if *word != u64::MAX {
                let bit = (w as u32) * 64 + word.trailing_ones();
                if bit < self.nbits {
                    return Some(bit);
                }
            }
        }
        None
    }

    /// Lowest run of `n` contiguous clear bits, if any.
    pub fn find_contiguous_reset(&self, n: u32) -> Option<u32> {
        if n == 0 || n > self.nbits {
            return None;
        }
        let mut run_start = 0u32;
        let mut run_len = 0u32;
        for bit in 0..self.nbits {
            if self.is_set(bit) {
                run_len = 0;
                run_start = bit + 1;
            } else {
                run_len += 1;
                if run_len == n {
                    return Some(run_start);
                }
            }
        }
        None
    }

    pub fn set_bits(&mut self, start: u32, n: u32) {
        for bit in start..start + n {
            self.set_bit(bit);
        }
    }

    pub fn reset_bits(&mut self, start: u32, n: u32) {
        for bit in start..start + n {
            self.reset_bit(bit);
        }
    }

    pub fn count_set(&self) -> u32 {
        self.words.iter().map(|w| w.count_ones()).sum()
    }

    pub fn write_into(&self, dst: &mut [u8]) {
        assert!(dst.len() >= self.words.len() * 8);
        for (w, word) in self.words.iter().enumerate() {
            LittleEndian::write_u64(&mut dst[w * 8..w * 8 + 8], *word);
        }
    }

    pub fn read_from(src: &[u8], nbits: u32) -> Self {
        let nwords = nbits.div_ceil(64) as usize;
        assert!(src.len() >= nwords * 8);
        let mut words = vec![0u64; nwords];
        for (w, word) in words.iter_mut().enumerate() {
            *word = LittleEndian::read_u64(&src[w * 8..w * 8 + 8]);
        }
        Self { nbits, words }
    }
}

/// Layout calculator for the per-device superblock region.
///
/// ```text
/// 0                    first_block (FIRST_BLOCK_REGION bytes)
/// vdev_sb_offset       vdev slots  (MAX_VDEVS_IN_SYSTEM x VDEV_INFO_SIZE)
/// chunk_bitmap_offset  chunk slot bitmap
/// chunk_info_offset    chunk slots (max_pdev_chunks x CHUNK_INFO_SIZE)
/// data_offset          chunk data regions
/// (HDD tail)           mirrored copy of [0, total_size)
/// ```
pub mod hs_super_blk {
    use super::*;

    pub fn first_block_offset() -> u64 {
        0
    }

    pub fn vdev_sb_offset() -> u64 {
        FIRST_BLOCK_REGION as u64
    }

    pub fn vdev_super_block_size() -> u64 {
        u64::from(MAX_VDEVS_IN_SYSTEM) * VDEV_INFO_SIZE as u64
    }

    pub fn chunk_bitmap_offset() -> u64 {
        vdev_sb_offset() + vdev_super_block_size()
    }

    pub fn chunk_info_offset(max_pdev_chunks: u32) -> u64 {
        let bitmap_end = chunk_bitmap_offset() + Bitmap::serialized_size(max_pdev_chunks) as u64;
        round_up(bitmap_end, ATOMIC_FB_SIZE as u64)
    }

    /// Total superblock-region bytes for a device with this many chunk slots.
    pub fn total_size(max_pdev_chunks: u32) -> u64 {
        chunk_info_offset(max_pdev_chunks)
            + u64::from(max_pdev_chunks) * CHUNK_INFO_SIZE as u64
    }

    /// Number of chunk slots a device of this size gets.
    pub fn max_chunks_in_pdev(dev_size: u64, min_chunk_size: u64) -> u32 {
        let slots = (dev_size / min_chunk_size).max(1);
        (slots.min(u64::from(MAX_CHUNKS_IN_SYSTEM))) as u32
    }
}
