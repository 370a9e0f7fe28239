//! Single-member replicated data device: couples block allocation with the
//! append-only data journal so "write data, then commit" is atomic under
//! crash.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use byteorder::{ByteOrder, LittleEndian};
use parking_lot::Mutex;
use tokio::task::spawn_blocking;
use tracing::{debug, info};
use uuid::Uuid;

use crate::blkdata::{BlkAllocHints, BlkDataService};
use crate::checkpoint::{Cp, CpCallbacks, CpContext, CpManager};
use crate::device::blkid::MultiBlkId;
use crate::error::{HsError, HsResult};
use crate::logdev::{LogDev, LogStore};
use crate::meta::MetaRegistry;

use super::journal::{decode_journal_entry, encode_journal_entry};

/// Meta-registry key of the repl-dev superblock.
pub const REPL_DEV_SB_KEY: &str = "ReplDevSuperBlock";

const RD_SB_MAGIC: u64 = 0x5245_504C_CEED_0001;
const RD_SB_VERSION: u32 = 1;
const RD_SB_LEN: usize = 56;

#[derive(Debug, Clone, Copy)]
struct ReplDevSuperblk {
    group_id: [u8; 16],
    data_journal_id: u64,
    commit_lsn: i64,
    checkpoint_lsn: i64,
}

impl ReplDevSuperblk {
    fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; RD_SB_LEN];
        LittleEndian::write_u64(&mut buf[0..8], RD_SB_MAGIC);
        LittleEndian::write_u32(&mut buf[8..12], RD_SB_VERSION);
        buf[16..32].copy_from_slice(&self.group_id);
        LittleEndian::write_u64(&mut buf[32..40], self.data_journal_id);
        LittleEndian::write_i64(&mut buf[40..48], self.commit_lsn);
        LittleEndian::write_i64(&mut buf[48..56], self.checkpoint_lsn);
        buf
    }

    fn decode(buf: &[u8]) -> HsResult<Self> {
        if buf.len() < RD_SB_LEN {
            return Err(HsError::corrupt("repl-dev superblock truncated"));
        }
        if LittleEndian::read_u64(&buf[0..8]) != RD_SB_MAGIC {
            return Err(HsError::corrupt("invalid repl-dev superblock magic"));
        }
        let version = LittleEndian::read_u32(&buf[8..12]);
        if version != RD_SB_VERSION {
            return Err(HsError::VersionMismatch {
                found: version,
                supported: RD_SB_VERSION,
            });
        }
        let mut group_id = [0u8; 16];
        group_id.copy_from_slice(&buf[16..32]);
        Ok(Self {
            group_id,
            data_journal_id: LittleEndian::read_u64(&buf[32..40]),
            commit_lsn: LittleEndian::read_i64(&buf[40..48]),
            checkpoint_lsn: LittleEndian::read_i64(&buf[48..56]),
        })
    }
}

/// One in-flight replicated write.
pub struct ReplReq {
    pub header: Vec<u8>,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    local_blkid: Mutex<MultiBlkId>,
    lsn: AtomicI64,
}

impl ReplReq {
    pub fn new(header: Vec<u8>, key: Vec<u8>, value: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            header,
            key,
            value,
            local_blkid: Mutex::new(MultiBlkId::new()),
            lsn: AtomicI64::new(-1),
        })
    }

    pub fn lsn(&self) -> i64 {
        self.lsn.load(Ordering::Acquire)
    }

    pub fn blkid(&self) -> MultiBlkId {
        self.local_blkid.lock().clone()
    }

    fn set_blkid(&self, blkid: MultiBlkId) {
        *self.local_blkid.lock() = blkid;
    }

    fn set_lsn(&self, lsn: i64) {
        self.lsn.store(lsn, Ordering::Release);
    }
}

/// Commit notifications a client of the repl-dev receives. During recovery
/// replay the request argument is absent; implementations must tolerate it.
pub trait ReplDevListener: Send + Sync {
    fn get_blk_alloc_hints(&self, _header: &[u8], _data_size: u64) -> BlkAllocHints {
        BlkAllocHints::default()
    }

    /// Runs after the journal append is durable, before the commit point.
    fn on_pre_commit(&self, lsn: i64, header: &[u8], key: &[u8], req: Option<&Arc<ReplReq>>);

    /// The write is fully committed: journaled, commit-upto advanced and the
    /// allocation made durable.
    fn on_commit(
        &self,
        lsn: i64,
        header: &[u8],
        key: &[u8],
        blkid: &MultiBlkId,
        req: Option<&Arc<ReplReq>>,
    );
}

/// Single-member replicated device over one data journal and one data vdev.
pub struct SoloReplDev {
    sb: Mutex<ReplDevSuperblk>,
    meta: Arc<MetaRegistry>,
    journal: Arc<LogStore>,
    data_svc: Arc<BlkDataService>,
    cp_mgr: Arc<CpManager>,
    listener: Arc<dyn ReplDevListener>,
    commit_upto: AtomicI64,
}

impl SoloReplDev {
    /// Creates a fresh repl-dev with a new group id and journal.
    pub fn create(
        meta: Arc<MetaRegistry>,
        logdev: &LogDev,
        data_svc: Arc<BlkDataService>,
        cp_mgr: Arc<CpManager>,
        listener: Arc<dyn ReplDevListener>,
    ) -> HsResult<Arc<Self>> {
        let journal = logdev.create_log_store()?;
        let sb = ReplDevSuperblk {
            group_id: *Uuid::new_v4().as_bytes(),
            data_journal_id: journal.store_id(),
            commit_lsn: -1,
            checkpoint_lsn: -1,
        };
        meta.write(REPL_DEV_SB_KEY, &sb.encode())?;
        info!(
            group_id = %Uuid::from_bytes(sb.group_id),
            data_journal_id = sb.data_journal_id,
            "created solo repl dev"
        );
        Ok(Arc::new(Self {
            sb: Mutex::new(sb),
            meta,
            journal,
            data_svc,
            cp_mgr,
            listener,
            commit_upto: AtomicI64::new(-1),
        }))
    }

    /// Loads an existing repl-dev, replaying the journal: every intact record
    /// re-runs the pre-commit / commit sequence with no request attached.
    pub fn load(
        meta: Arc<MetaRegistry>,
        logdev: &LogDev,
        data_svc: Arc<BlkDataService>,
        cp_mgr: Arc<CpManager>,
        listener: Arc<dyn ReplDevListener>,
    ) -> HsResult<Arc<Self>> {
        let buf = meta
            .read(REPL_DEV_SB_KEY)?
            .ok_or_else(|| HsError::corrupt("repl-dev superblock missing at load"))?;
        let sb = ReplDevSuperblk::decode(&buf)?;

        let commit_upto = AtomicI64::new(-1);
        let journal = logdev.open_log_store(sb.data_journal_id, |lsn, body| {
            replay_entry(&listener, &data_svc, &commit_upto, lsn, body)
        })?;
        info!(
            group_id = %Uuid::from_bytes(sb.group_id),
            data_journal_id = sb.data_journal_id,
            replayed_upto = commit_upto.load(Ordering::Acquire),
            "loaded solo repl dev"
        );
        Ok(Arc::new(Self {
            sb: Mutex::new(sb),
            meta,
            journal,
            data_svc,
            cp_mgr,
            listener,
            commit_upto,
        }))
    }

    pub fn group_id(&self) -> Uuid {
        Uuid::from_bytes(self.sb.lock().group_id)
    }

    pub fn blk_size(&self) -> u32 {
        self.data_svc.blk_size()
    }

    /// Highest LSN whose commit callback has run.
    pub fn commit_upto(&self) -> i64 {
        self.commit_upto.load(Ordering::Acquire)
    }

    /// Allocates space for the value, writes it, then journals the
    /// `{header, key, blkid}` record. Once the append is durable the listener
    /// sees pre-commit, the commit point advances, the allocation is
    /// committed and the listener sees commit.
    ///
    /// The whole pipeline holds a checkpoint guard, so a concurrent
    /// checkpoint flush cannot start under a half-committed write.
    pub async fn async_alloc_write(self: &Arc<Self>, rreq: Arc<ReplReq>) -> HsResult<()> {
        let cp_guard = self.cp_mgr.cp_guard();

        if !rreq.value.is_empty() {
            let hints = self
                .listener
                .get_blk_alloc_hints(&rreq.header, rreq.value.len() as u64);
            let blkid = self
                .data_svc
                .alloc_blks(rreq.value.len() as u64, &hints)
                .expect("block allocation for a replicated write failed");
            rreq.set_blkid(blkid);

            self.data_svc
                .async_write(rreq.value.clone(), &rreq.blkid())
                .await
                .expect("data write for a replicated write failed");
        }

        let entry_blkid = rreq.blkid();
        let entry = encode_journal_entry(
            &rreq.header,
            &rreq.key,
            if rreq.value.is_empty() {
                None
            } else {
                Some(&entry_blkid)
            },
        );

        let this = self.clone();
        self.journal.append_async(entry, move |lsn| {
            rreq.set_lsn(lsn);
            this.listener
                .on_pre_commit(lsn, &rreq.header, &rreq.key, Some(&rreq));

            store_max(&this.commit_upto, lsn);

            let blkid = rreq.blkid();
            this.data_svc.commit_blk(&blkid);
            this.listener
                .on_commit(lsn, &rreq.header, &rreq.key, &blkid, Some(&rreq));
            drop(cp_guard);
        });
        Ok(())
    }

    pub async fn async_read(&self, blkid: &MultiBlkId, size: usize) -> HsResult<Vec<u8>> {
        self.data_svc.async_read(blkid, size).await
    }

    pub async fn async_free_blks(&self, _lsn: i64, blkid: MultiBlkId) -> HsResult<()> {
        self.data_svc.async_free_blk(blkid).await
    }
}

fn store_max(cell: &AtomicI64, value: i64) {
    let mut current = cell.load(Ordering::Acquire);
    while current < value {
        match cell.compare_exchange(current, value, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => break,
            Err(observed) => current = observed,
        }
    }
}

fn replay_entry(
    listener: &Arc<dyn ReplDevListener>,
    data_svc: &Arc<BlkDataService>,
    commit_upto: &AtomicI64,
    lsn: i64,
    buf: &[u8],
) -> HsResult<()> {
    let entry = decode_journal_entry(buf)?;
    listener.on_pre_commit(lsn, entry.header, entry.key, None);
    store_max(commit_upto, lsn);
    let blkid = entry.blkid.unwrap_or_default();
    data_svc.commit_blk(&blkid);
    listener.on_commit(lsn, entry.header, entry.key, &blkid, None);
    Ok(())
}

#[async_trait]
impl CpCallbacks for SoloReplDev {
    fn on_switchover_cp(&self, _cur_cp: Option<&Cp>, _new_cp: &Cp) -> Option<CpContext> {
        None
    }

    /// Snapshots the commit point into the superblock and persists it.
    async fn cp_flush(&self, cp: Arc<Cp>) {
        let lsn = self.commit_upto.load(Ordering::Acquire);
        let payload = {
            let mut sb = self.sb.lock();
            sb.commit_lsn = lsn;
            sb.checkpoint_lsn = lsn;
            sb.encode()
        };
        debug!(cp_id = cp.id(), commit_lsn = lsn, "repl dev cp flush");

        let meta = self.meta.clone();
        spawn_blocking(move || {
            meta.write(REPL_DEV_SB_KEY, &payload)
                .expect("repl-dev superblock write failed");
        })
        .await
        .expect("repl-dev superblock task panicked");
    }

    fn cp_cleanup(&self, _cp: &Cp) {
        // Journal truncation up to checkpoint_lsn stays a reserved hook; the
        // journal keeps its full history for now.
    }

    fn cp_progress_percent(&self) -> u32 {
        100
    }
}
