//! Minimal persistent key -> record registry for service superblocks (the
//! checkpoint superblock, the repl-dev superblock).
//!
//! Each key maps to one CRC-framed file; writes go through a tmp file and an
//! atomic rename so a record is never observed half-written.

use std::fs;
use std::path::PathBuf;

use byteorder::{ByteOrder, LittleEndian};
use parking_lot::Mutex;
use tracing::debug;

use crate::error::{HsError, HsResult};
use crate::superblk::crc32_ieee;

const META_MAGIC: u64 = 0x4D45_5441_424C_4B31; // "METABLK1"
const META_VERSION: u32 = 1;
const META_HDR_LEN: usize = 20;

/// File-backed record store keyed by string.
pub struct MetaRegistry {
    dir: PathBuf,
    write_mtx: Mutex<()>,
}

impl MetaRegistry {
    pub fn new(dir: impl Into<PathBuf>) -> HsResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            write_mtx: Mutex::new(()),
        })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.meta"))
    }

    /// Writes (or overwrites) the record for `key`.
    pub fn write(&self, key: &str, payload: &[u8]) -> HsResult<()> {
        let mut buf = vec![0u8; META_HDR_LEN + payload.len()];
        LittleEndian::write_u64(&mut buf[0..8], META_MAGIC);
        LittleEndian::write_u32(&mut buf[8..12], META_VERSION);
        LittleEndian::write_u32(&mut buf[12..16], crc32_ieee(payload));
        LittleEndian::write_u32(&mut buf[16..20], payload.len() as u32);
        buf[META_HDR_LEN..].copy_from_slice(payload);

        let _lk = self.write_mtx.lock();
        let tmp = self.dir.join(format!("{key}.meta.tmp"));
        let path = self.path_for(key);
        fs::write(&tmp, &buf)?;
        let f = fs::File::open(&tmp)?;
        f.sync_all()?;
        fs::rename(&tmp, &path)?;
        debug!(key, len = payload.len(), "meta record persisted");
        Ok(())
    }

    /// Reads the record for `key`, `None` when it was never created.
    pub fn read(&self, key: &str) -> HsResult<Option<Vec<u8>>> {
        let path = self.path_for(key);
        let buf = match fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if buf.len() < META_HDR_LEN {
            return Err(HsError::corrupt(format!("meta record {key} truncated")));
        }
        let magic = LittleEndian::read_u64(&buf[0..8]);
        if magic != META_MAGIC {
            return Err(HsError::corrupt(format!("meta record {key} bad magic")));
        }
        let version = LittleEndian::read_u32(&buf[8..12]);
        if version != META_VERSION {
            return Err(HsError::VersionMismatch {
                found: version,
                supported: META_VERSION,
            });
        }
        let crc = LittleEndian::read_u32(&buf[12..16]);
        let len = LittleEndian::read_u32(&buf[16..20]) as usize;
        if buf.len() < META_HDR_LEN + len {
            return Err(HsError::corrupt(format!("meta record {key} short payload")));
        }
        let payload = &buf[META_HDR_LEN..META_HDR_LEN + len];
        let computed = crc32_ieee(payload);
        if computed != crc {
            return Err(HsError::corrupt(format!(
                "meta record {key} crc mismatch: stored {crc:#x}, computed {computed:#x}"
            )));
        }
        Ok(Some(payload.to_vec()))
    }

    pub fn exists(&self, key: &str) -> bool {
        self.path_for(key).exists()
    }
}
