//! Block identifiers used by the data path and serialized inside journal
//! entries.

use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

use crate::error::{HsError, HsResult};

/// One contiguous run of blocks inside a single chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlkId {
    pub chunk_id: u32,
    /// First block number within the chunk.
    pub blk_num: u32,
    /// Number of blocks in the run.
    pub nblks: u16,
}

const BLKID_WIRE_SIZE: usize = 10;

impl BlkId {
    pub fn new(chunk_id: u32, blk_num: u32, nblks: u16) -> Self {
        Self {
            chunk_id,
            blk_num,
            nblks,
        }
    }

    fn write_into(&self, dst: &mut [u8]) {
        LittleEndian::write_u32(&mut dst[0..4], self.chunk_id);
        LittleEndian::write_u32(&mut dst[4..8], self.blk_num);
        LittleEndian::write_u16(&mut dst[8..10], self.nblks);
    }

    fn read_from(src: &[u8]) -> Self {
        Self {
            chunk_id: LittleEndian::read_u32(&src[0..4]),
            blk_num: LittleEndian::read_u32(&src[4..8]),
            nblks: LittleEndian::read_u16(&src[8..10]),
        }
    }
}

/// A block allocation possibly spanning several runs. The common case is a
/// single contiguous piece; fragmentation produces more.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MultiBlkId {
    pieces: Vec<BlkId>,
}

impl MultiBlkId {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, piece: BlkId) {
        self.pieces.push(piece);
    }

    pub fn pieces(&self) -> &[BlkId] {
        &self.pieces
    }

    pub fn is_empty(&self) -> bool {
        self.pieces.is_empty()
    }

    pub fn num_blks(&self) -> u32 {
        self.pieces.iter().map(|p| u32::from(p.nblks)).sum()
    }

    pub fn serialized_size(&self) -> usize {
        2 + self.pieces.len() * BLKID_WIRE_SIZE
    }

    /// Wire format: `count u16` followed by `count` fixed-size pieces.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = vec![0u8; self.serialized_size()];
        LittleEndian::write_u16(&mut buf[0..2], self.pieces.len() as u16);
        for (i, piece) in self.pieces.iter().enumerate() {
            let off = 2 + i * BLKID_WIRE_SIZE;
            piece.write_into(&mut buf[off..off + BLKID_WIRE_SIZE]);
        }
        buf
    }

    pub fn deserialize(src: &[u8]) -> HsResult<Self> {
        if src.len() < 2 {
            return Err(HsError::JournalDecodeError(
                "blkid shorter than piece count".into(),
            ));
        }
        let count = LittleEndian::read_u16(&src[0..2]) as usize;
        let needed = 2 + count * BLKID_WIRE_SIZE;
        if src.len() < needed {
            return Err(HsError::JournalDecodeError(format!(
                "blkid truncated: {} pieces need {needed} bytes, have {}",
                count,
                src.len()
            )));
        }
        let mut pieces = Vec::with_capacity(count);
        for i in 0..count {
            let off = 2 + i * BLKID_WIRE_SIZE;
            pieces.push(BlkId::read_from(&src[off..off + BLKID_WIRE_SIZE]));
        }
        Ok(Self { pieces })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multi_blkid_round_trip() {
        let mut blkid = MultiBlkId::new();
        blkid.add(BlkId::new(3, 128, 2));
        blkid.add(BlkId::new(5, 0, 16));

        let wire = blkid.serialize();
        assert_eq!(wire.len(), blkid.serialized_size());
        let decoded = MultiBlkId::deserialize(&wire).expect("deserialize");
        assert_eq!(decoded, blkid);
        assert_eq!(decoded.num_blks(), 18);
    }

    #[test]
    fn truncated_blkid_rejected() {
        let mut blkid = MultiBlkId::new();
        blkid.add(BlkId::new(1, 0, 4));
        let wire = blkid.serialize();
        assert!(matches!(
            MultiBlkId::deserialize(&wire[..wire.len() - 1]),
            Err(HsError::JournalDecodeError(_))
        ));
    }
}
