//! Append-only journal store.
//!
//! Each store is one strictly appended file of CRC-framed records with
//! monotonically assigned LSNs. Appends are handed to a dedicated writer
//! thread; the completion callback runs once the record is durable.
//! Completion order may differ from LSN order, LSNs never do.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use byteorder::{ByteOrder, LittleEndian};
use crossbeam::channel::{unbounded, Sender};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::{HsError, HsResult};
use crate::superblk::crc32_ieee;

/// Record frame: payload length, payload crc32, lsn.
const LOG_RECORD_HDR_LEN: usize = 16;
/// Upper bound a sane journal record can have; anything larger reads as a
/// torn tail.
const MAX_LOG_RECORD_LEN: u32 = 16 * 1024 * 1024;

type AppendComplete = Box<dyn FnOnce(i64) + Send>;

enum LogCmd {
    Append {
        lsn: i64,
        buf: Vec<u8>,
        on_complete: AppendComplete,
    },
    Shutdown,
}

struct LogInner {
    path: PathBuf,
    file: File,
    tail: AtomicU64,
    next_lsn: AtomicI64,
    /// Reserved truncation hook; records below this LSN may be reclaimed by a
    /// future compaction pass. Nothing consumes it yet.
    truncate_upto: AtomicI64,
}

/// One append-only journal.
pub struct LogStore {
    store_id: u64,
    inner: Arc<LogInner>,
    tx: Sender<LogCmd>,
    /// Makes LSN assignment and queue insertion one step, so on-disk order
    /// always equals LSN order.
    append_mtx: Mutex<()>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl LogStore {
    fn start(store_id: u64, inner: Arc<LogInner>) -> Self {
        let (tx, rx) = unbounded::<LogCmd>();
        let worker_inner = inner.clone();
        let worker = std::thread::Builder::new()
            .name(format!("logdev-{store_id}"))
            .spawn(move || {
                while let Ok(cmd) = rx.recv() {
                    match cmd {
                        LogCmd::Append {
                            lsn,
                            buf,
                            on_complete,
                        } => {
                            worker_inner.append_record(lsn, &buf);
                            on_complete(lsn);
                        }
                        LogCmd::Shutdown => break,
                    }
                }
            })
            .expect("failed to spawn logdev writer");
        Self {
            store_id,
            inner,
            tx,
            append_mtx: Mutex::new(()),
            worker: Mutex::new(Some(worker)),
        }
    }

    pub fn store_id(&self) -> u64 {
        self.store_id
    }

    /// Assigns the next LSN and queues the record for the writer thread.
    /// `on_complete` runs after the record is durable on disk.
    pub fn append_async(&self, buf: Vec<u8>, on_complete: impl FnOnce(i64) + Send + 'static) -> i64 {
        let _lk = self.append_mtx.lock();
        let lsn = self.inner.next_lsn.fetch_add(1, Ordering::AcqRel);
        self.tx
            .send(LogCmd::Append {
                lsn,
                buf,
                on_complete: Box::new(on_complete),
            })
            .expect("logdev writer is gone");
        lsn
    }

    /// Highest assigned LSN plus one.
    pub fn next_lsn(&self) -> i64 {
        self.inner.next_lsn.load(Ordering::Acquire)
    }

    /// Marks records up to `upto_lsn` reclaimable. Space reclaim itself is a
    /// reserved hook; the journal keeps its contents for now.
    pub fn truncate(&self, upto_lsn: i64) {
        self.inner.truncate_upto.store(upto_lsn, Ordering::Release);
        debug!(
            store_id = self.store_id,
            upto_lsn, "journal truncation watermark recorded"
        );
    }

    pub fn truncation_watermark(&self) -> i64 {
        self.inner.truncate_upto.load(Ordering::Acquire)
    }
}

impl Drop for LogStore {
    fn drop(&mut self) {
        let _ = self.tx.send(LogCmd::Shutdown);
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }
    }
}

impl LogInner {
    fn append_record(&self, lsn: i64, payload: &[u8]) {
        let mut buf = vec![0u8; LOG_RECORD_HDR_LEN + payload.len()];
        LittleEndian::write_u32(&mut buf[0..4], payload.len() as u32);
        LittleEndian::write_u32(&mut buf[4..8], crc32_ieee(payload));
        LittleEndian::write_u64(&mut buf[8..16], lsn as u64);
        buf[LOG_RECORD_HDR_LEN..].copy_from_slice(payload);

        let offset = self
            .tail
            .fetch_add(buf.len() as u64, Ordering::AcqRel);
        // Journal durability is load-bearing for the commit contract; a
        // failed append has no recovery path at this layer.
        self.file
            .write_all_at(&buf, offset)
            .unwrap_or_else(|e| panic!("journal {} append failed: {e}", self.path.display()));
        self.file
            .sync_data()
            .unwrap_or_else(|e| panic!("journal {} sync failed: {e}", self.path.display()));
    }
}

/// Factory and directory owner for journal stores.
pub struct LogDev {
    dir: PathBuf,
    next_store_id: AtomicU64,
}

impl LogDev {
    pub fn new(dir: impl Into<PathBuf>) -> HsResult<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        let mut max_id = None;
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            if let Some(id) = parse_store_file_name(&entry.path()) {
                max_id = Some(max_id.map_or(id, |m: u64| m.max(id)));
            }
        }
        Ok(Self {
            dir,
            next_store_id: AtomicU64::new(max_id.map_or(0, |m| m + 1)),
        })
    }

    fn store_path(&self, store_id: u64) -> PathBuf {
        self.dir.join(format!("{store_id:020}.jrnl"))
    }

    /// Creates a fresh, empty journal store.
    pub fn create_log_store(&self) -> HsResult<Arc<LogStore>> {
        let store_id = self.next_store_id.fetch_add(1, Ordering::AcqRel);
        let path = self.store_path(store_id);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        info!(store_id, path = %path.display(), "created journal store");
        let inner = Arc::new(LogInner {
            path,
            file,
            tail: AtomicU64::new(0),
            next_lsn: AtomicI64::new(0),
            truncate_upto: AtomicI64::new(-1),
        });
        Ok(Arc::new(LogStore::start(store_id, inner)))
    }

    /// Opens an existing journal store, replaying every intact record in LSN
    /// order through `on_log_found`. A torn record at the tail is a crash
    /// artifact and is discarded; corruption before the tail is fatal.
    pub fn open_log_store(
        &self,
        store_id: u64,
        mut on_log_found: impl FnMut(i64, &[u8]) -> HsResult<()>,
    ) -> HsResult<Arc<LogStore>> {
        let path = self.store_path(store_id);
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let contents = {
            let len = file.metadata()?.len() as usize;
            let mut buf = vec![0u8; len];
            file.read_exact_at(&mut buf, 0)?;
            buf
        };

        let mut offset = 0usize;
        let mut expected_lsn = 0i64;
        loop {
            let remaining = contents.len() - offset;
            if remaining == 0 {
                break;
            }
            if remaining < LOG_RECORD_HDR_LEN {
                warn!(store_id, offset, "torn record header at journal tail");
                break;
            }
            let hdr = &contents[offset..offset + LOG_RECORD_HDR_LEN];
            let len = LittleEndian::read_u32(&hdr[0..4]);
            let crc = LittleEndian::read_u32(&hdr[4..8]);
            let lsn = LittleEndian::read_u64(&hdr[8..16]) as i64;

            if len > MAX_LOG_RECORD_LEN
                || remaining < LOG_RECORD_HDR_LEN + len as usize
            {
                warn!(store_id, offset, len, "torn record body at journal tail");
                break;
            }
            let body_start = offset + LOG_RECORD_HDR_LEN;
            let body = &contents[body_start..body_start + len as usize];
            let record_end = body_start + len as usize;

            if crc32_ieee(body) != crc || lsn != expected_lsn {
                if record_end == contents.len() {
                    warn!(store_id, offset, lsn, "torn record at journal tail");
                    break;
                }
                return Err(HsError::JournalDecodeError(format!(
                    "journal {store_id} record at offset {offset} is corrupt before the tail"
                )));
            }

            on_log_found(lsn, body)?;
            expected_lsn = lsn + 1;
            offset = record_end;
        }

        if offset < contents.len() {
            // Drop the torn tail so new appends start on a clean boundary.
            file.set_len(offset as u64)?;
            file.sync_data()?;
        }

        info!(
            store_id,
            replayed = expected_lsn,
            tail = offset,
            "journal store opened"
        );
        let inner = Arc::new(LogInner {
            path,
            file,
            tail: AtomicU64::new(offset as u64),
            next_lsn: AtomicI64::new(expected_lsn),
            truncate_upto: AtomicI64::new(-1),
        });
        Ok(Arc::new(LogStore::start(store_id, inner)))
    }
}

fn parse_store_file_name(path: &Path) -> Option<u64> {
    let name = path.file_name()?.to_str()?;
    let id = name.strip_suffix(".jrnl")?;
    id.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use tempfile::TempDir;

    fn append_and_wait(store: &LogStore, payload: &[u8]) -> i64 {
        let (tx, rx) = mpsc::channel();
        let assigned = store.append_async(payload.to_vec(), move |lsn| {
            tx.send(lsn).unwrap();
        });
        let completed = rx.recv().unwrap();
        assert_eq!(assigned, completed);
        completed
    }

    #[test]
    fn append_then_replay() {
        let dir = TempDir::new().unwrap();
        let logdev = LogDev::new(dir.path()).unwrap();
        let store = logdev.create_log_store().unwrap();
        let store_id = store.store_id();

        for i in 0..5u8 {
            let lsn = append_and_wait(&store, &[i; 32]);
            assert_eq!(lsn, i64::from(i));
        }
        drop(store);

        let mut seen = Vec::new();
        let reopened = logdev
            .open_log_store(store_id, |lsn, body| {
                seen.push((lsn, body.to_vec()));
                Ok(())
            })
            .unwrap();
        assert_eq!(seen.len(), 5);
        for (i, (lsn, body)) in seen.iter().enumerate() {
            assert_eq!(*lsn, i as i64);
            assert_eq!(body, &vec![i as u8; 32]);
        }
        assert_eq!(reopened.next_lsn(), 5);
    }

    #[test]
    fn torn_tail_is_discarded() {
        let dir = TempDir::new().unwrap();
        let logdev = LogDev::new(dir.path()).unwrap();
        let store = logdev.create_log_store().unwrap();
        let store_id = store.store_id();
        append_and_wait(&store, b"intact record");
        drop(store);

        // Simulate a crash mid-append: half a record at the tail.
        let path = dir.path().join(format!("{store_id:020}.jrnl"));
        let mut raw = std::fs::read(&path).unwrap();
        raw.extend_from_slice(&[0xAA; LOG_RECORD_HDR_LEN + 3]);
        std::fs::write(&path, &raw).unwrap();

        let mut seen = 0;
        let reopened = logdev
            .open_log_store(store_id, |_, _| {
                seen += 1;
                Ok(())
            })
            .unwrap();
        assert_eq!(seen, 1);
        assert_eq!(reopened.next_lsn(), 1);

        // A new append lands cleanly after the truncated tail.
        append_and_wait(&reopened, b"post-recovery record");
        assert_eq!(reopened.next_lsn(), 2);
    }

    #[test]
    fn corruption_before_tail_is_fatal() {
        let dir = TempDir::new().unwrap();
        let logdev = LogDev::new(dir.path()).unwrap();
        let store = logdev.create_log_store().unwrap();
        let store_id = store.store_id();
        append_and_wait(&store, &[1u8; 64]);
        append_and_wait(&store, &[2u8; 64]);
        drop(store);

        // Flip a payload bit of the first record.
        let path = dir.path().join(format!("{store_id:020}.jrnl"));
        let mut raw = std::fs::read(&path).unwrap();
        raw[LOG_RECORD_HDR_LEN + 5] ^= 0x10;
        std::fs::write(&path, &raw).unwrap();

        let result = logdev.open_log_store(store_id, |_, _| Ok(()));
        assert!(matches!(result, Err(HsError::JournalDecodeError(_))));
    }

    #[test]
    fn store_ids_resume_after_restart() {
        let dir = TempDir::new().unwrap();
        let logdev = LogDev::new(dir.path()).unwrap();
        let s0 = logdev.create_log_store().unwrap();
        let s1 = logdev.create_log_store().unwrap();
        assert_eq!(s0.store_id(), 0);
        assert_eq!(s1.store_id(), 1);
        drop((s0, s1));

        let logdev = LogDev::new(dir.path()).unwrap();
        let s2 = logdev.create_log_store().unwrap();
        assert_eq!(s2.store_id(), 2);
    }
}
