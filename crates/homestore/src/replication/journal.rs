//! Wire codec of replicated-write journal entries.
//!
//! ```text
//! u8  major_version
//! u8  code            (HS_LARGE_DATA = 1, others reserved)
//! u16 user_header_size
//! u16 key_size
//! u16 reserved
//! [user_header][key][serialized MultiBlkId when a value was written]
//! ```

use byteorder::{ByteOrder, LittleEndian};

use crate::device::blkid::MultiBlkId;
use crate::error::{HsError, HsResult};

pub const JOURNAL_ENTRY_MAJOR: u8 = 1;
pub const REPL_JOURNAL_ENTRY_LEN: usize = 8;

/// Kind of a journal entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum JournalType {
    HsLargeData = 1,
}

pub fn encode_journal_entry(header: &[u8], key: &[u8], blkid: Option<&MultiBlkId>) -> Vec<u8> {
    assert!(header.len() <= u16::MAX as usize);
    assert!(key.len() <= u16::MAX as usize);

    let blkid_len = blkid.map_or(0, |b| b.serialized_size());
    let mut buf =
        Vec::with_capacity(REPL_JOURNAL_ENTRY_LEN + header.len() + key.len() + blkid_len);
    buf.resize(REPL_JOURNAL_ENTRY_LEN, 0);
    buf[0] = JOURNAL_ENTRY_MAJOR;
    buf[1] = JournalType::HsLargeData as u8;
    LittleEndian::write_u16(&mut buf[2..4], header.len() as u16);
    LittleEndian::write_u16(&mut buf[4..6], key.len() as u16);

    buf.extend_from_slice(header);
    buf.extend_from_slice(key);
    if let Some(blkid) = blkid {
        buf.extend_from_slice(&blkid.serialize());
    }
    buf
}

/// Borrowed view of a decoded journal entry. The blkid, when present, is
/// copied out of the buffer.
pub struct DecodedJournalEntry<'a> {
    pub header: &'a [u8],
    pub key: &'a [u8],
    pub blkid: Option<MultiBlkId>,
}

pub fn decode_journal_entry(buf: &[u8]) -> HsResult<DecodedJournalEntry<'_>> {
    if buf.len() < REPL_JOURNAL_ENTRY_LEN {
        return Err(HsError::JournalDecodeError(
            "journal entry shorter than its fixed header".into(),
        ));
    }
    if buf[0] != JOURNAL_ENTRY_MAJOR {
        return Err(HsError::JournalDecodeError(format!(
            "mismatched journal entry version: {}",
            buf[0]
        )));
    }
    if buf[1] != JournalType::HsLargeData as u8 {
        return Err(HsError::JournalDecodeError(format!(
            "journal entry code {} is not a data entry",
            buf[1]
        )));
    }
    let header_size = LittleEndian::read_u16(&buf[2..4]) as usize;
    let key_size = LittleEndian::read_u16(&buf[4..6]) as usize;

    let mut remain = &buf[REPL_JOURNAL_ENTRY_LEN..];
    if remain.len() < header_size {
        return Err(HsError::JournalDecodeError(
            "journal entry header size exceeds the record".into(),
        ));
    }
    let (header, rest) = remain.split_at(header_size);
    remain = rest;
    if remain.len() < key_size {
        return Err(HsError::JournalDecodeError(
            "journal entry key size exceeds the record".into(),
        ));
    }
    let (key, rest) = remain.split_at(key_size);

    let blkid = if rest.is_empty() {
        None
    } else {
        Some(MultiBlkId::deserialize(rest)?)
    };
    Ok(DecodedJournalEntry { header, key, blkid })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::blkid::BlkId;

    #[test]
    fn entry_round_trip_with_blkid() {
        let mut blkid = MultiBlkId::new();
        blkid.add(BlkId::new(4, 100, 2));
        let wire = encode_journal_entry(b"hdr-bytes", b"key", Some(&blkid));

        let decoded = decode_journal_entry(&wire).expect("decode");
        assert_eq!(decoded.header, b"hdr-bytes");
        assert_eq!(decoded.key, b"key");
        assert_eq!(decoded.blkid, Some(blkid));
    }

    #[test]
    fn header_only_entry_has_no_blkid() {
        let wire = encode_journal_entry(b"h", b"", None);
        let decoded = decode_journal_entry(&wire).expect("decode");
        assert_eq!(decoded.header, b"h");
        assert!(decoded.key.is_empty());
        assert!(decoded.blkid.is_none());
    }

    #[test]
    fn bad_version_is_rejected() {
        let mut wire = encode_journal_entry(b"h", b"k", None);
        wire[0] = 9;
        assert!(matches!(
            decode_journal_entry(&wire),
            Err(HsError::JournalDecodeError(_))
        ));
    }

    #[test]
    fn oversized_header_is_rejected() {
        let mut wire = encode_journal_entry(b"hdr", b"k", None);
        wire[2] = 0xFF;
        wire[3] = 0xFF;
        assert!(matches!(
            decode_journal_entry(&wire),
            Err(HsError::JournalDecodeError(_))
        ));
    }
}
