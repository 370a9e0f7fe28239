//! Checkpoint state-machine scenarios: trigger serialization, guard/flush
//! interplay, back-to-back forcing and the slow-flush watchdog.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use homestore::checkpoint::{Cp, CpCallbacks, CpConsumerId, CpContext, CpManager};
use homestore::{HsConfig, MetaRegistry};
use parking_lot::Mutex;
use tempfile::TempDir;
use tokio::runtime::Handle;
use tokio::sync::Semaphore;

fn test_config() -> HsConfig {
    let mut cfg = HsConfig::default();
    // Keep the periodic machinery out of the way unless a test wants it.
    cfg.cp_timer = Duration::from_secs(3600);
    cfg.cp_watchdog_timer = Duration::from_secs(3600);
    cfg
}

struct TestConsumer {
    switchovers: AtomicU64,
    flushes: AtomicU64,
    cleanups: AtomicU64,
    repairs: AtomicU64,
    progress: AtomicU32,
    stall: AtomicBool,
    gate: Semaphore,
    /// Brackets still open per cp id, maintained by the test body; a flush
    /// observing a nonzero count is a linearizability violation.
    open_brackets: Mutex<HashMap<u64, i64>>,
}

impl TestConsumer {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            switchovers: AtomicU64::new(0),
            flushes: AtomicU64::new(0),
            cleanups: AtomicU64::new(0),
            repairs: AtomicU64::new(0),
            progress: AtomicU32::new(100),
            stall: AtomicBool::new(false),
            gate: Semaphore::new(0),
            open_brackets: Mutex::new(HashMap::new()),
        })
    }

    fn flushes(&self) -> u64 {
        self.flushes.load(Ordering::Acquire)
    }
}

#[async_trait]
impl CpCallbacks for TestConsumer {
    fn on_switchover_cp(&self, _cur_cp: Option<&Cp>, _new_cp: &Cp) -> Option<CpContext> {
        self.switchovers.fetch_add(1, Ordering::AcqRel);
        None
    }

    async fn cp_flush(&self, cp: Arc<Cp>) {
        let open = self
            .open_brackets
            .lock()
            .get(&cp.id())
            .copied()
            .unwrap_or(0);
        assert_eq!(open, 0, "cp {} flushed with open writer brackets", cp.id());

        if self.stall.load(Ordering::Acquire) {
            let permit = self.gate.acquire().await.expect("gate closed");
            permit.forget();
        }
        self.flushes.fetch_add(1, Ordering::AcqRel);
    }

    fn cp_cleanup(&self, _cp: &Cp) {
        self.cleanups.fetch_add(1, Ordering::AcqRel);
    }

    fn cp_progress_percent(&self) -> u32 {
        self.progress.load(Ordering::Acquire)
    }

    fn repair_slow_cp(&self) {
        self.repairs.fetch_add(1, Ordering::AcqRel);
    }
}

fn start_cp_mgr(dir: &TempDir, cfg: HsConfig) -> (Arc<CpManager>, Arc<MetaRegistry>) {
    let meta = Arc::new(MetaRegistry::new(dir.path().join("meta")).unwrap());
    let cp_mgr = CpManager::new(Handle::current(), meta.clone(), cfg);
    cp_mgr.start(true).expect("cp manager start");
    (cp_mgr, meta)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn trigger_flush_completes_and_persists() {
    let dir = TempDir::new().unwrap();
    let (cp_mgr, _meta) = start_cp_mgr(&dir, test_config());
    let consumer = TestConsumer::new();
    cp_mgr.register_consumer(CpConsumerId::HsClient, consumer.clone());

    assert_eq!(cp_mgr.last_flushed_cp(), 0);
    assert!(cp_mgr.trigger_cp_flush(false).await);
    assert_eq!(cp_mgr.last_flushed_cp(), 1);
    assert_eq!(consumer.flushes(), 1);
    assert_eq!(consumer.cleanups.load(Ordering::Acquire), 1);
    // One switchover at registration, one at trigger.
    assert_eq!(consumer.switchovers.load(Ordering::Acquire), 2);

    cp_mgr.shutdown().await.expect("shutdown");
    assert_eq!(cp_mgr.last_flushed_cp(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn nonforced_trigger_during_flush_returns_false() {
    let dir = TempDir::new().unwrap();
    let (cp_mgr, _meta) = start_cp_mgr(&dir, test_config());
    let consumer = TestConsumer::new();
    consumer.stall.store(true, Ordering::Release);
    cp_mgr.register_consumer(CpConsumerId::HsClient, consumer.clone());

    let first = cp_mgr.trigger_cp_flush(false);
    // The flush phase is claimed synchronously, so this cannot race.
    assert!(!cp_mgr.trigger_cp_flush(false).await);

    consumer.stall.store(false, Ordering::Release);
    consumer.gate.add_permits(1);
    assert!(first.await);
    assert_eq!(cp_mgr.last_flushed_cp(), 1);

    cp_mgr.shutdown().await.expect("shutdown");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn forced_triggers_share_one_back_to_back_cp() {
    let dir = TempDir::new().unwrap();
    let (cp_mgr, _meta) = start_cp_mgr(&dir, test_config());
    let consumer = TestConsumer::new();
    consumer.stall.store(true, Ordering::Release);
    cp_mgr.register_consumer(CpConsumerId::HsClient, consumer.clone());

    // First CP starts flushing and stalls on the gate.
    let first = cp_mgr.trigger_cp_flush(false);

    // Two forced triggers while the flush runs: both arm the same
    // back-to-back CP and both resolve with its completion.
    let forced_a = cp_mgr.trigger_cp_flush(true);
    let forced_b = cp_mgr.trigger_cp_flush(true);

    consumer.stall.store(false, Ordering::Release);
    consumer.gate.add_permits(2);

    assert!(first.await);
    assert!(forced_a.await);
    assert!(forced_b.await);

    // Exactly two CPs were flushed and persisted.
    assert_eq!(cp_mgr.last_flushed_cp(), 2);
    assert_eq!(consumer.flushes(), 2);

    cp_mgr.shutdown().await.expect("shutdown");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn open_guard_holds_back_the_flush() {
    let dir = TempDir::new().unwrap();
    let (cp_mgr, _meta) = start_cp_mgr(&dir, test_config());
    let consumer = TestConsumer::new();
    cp_mgr.register_consumer(CpConsumerId::HsClient, consumer.clone());

    let guard = cp_mgr.cp_guard();
    let guard_cp_id = guard.cp().id();
    let trigger = cp_mgr.trigger_cp_flush(false);

    // The switchover has happened, but the flush must not start while the
    // writer bracket is open.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(consumer.flushes(), 0);
    assert_eq!(cp_mgr.last_flushed_cp(), 0);

    // New work lands in the next CP while the old one drains.
    let next = cp_mgr.cp_guard();
    assert_eq!(next.cp().id(), guard_cp_id + 1);
    drop(next);

    drop(guard);
    assert!(trigger.await);
    assert_eq!(consumer.flushes(), 1);
    assert_eq!(cp_mgr.last_flushed_cp(), 1);

    cp_mgr.shutdown().await.expect("shutdown");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cloned_guards_share_the_cp_without_rereading() {
    let dir = TempDir::new().unwrap();
    let (cp_mgr, _meta) = start_cp_mgr(&dir, test_config());
    let consumer = TestConsumer::new();
    cp_mgr.register_consumer(CpConsumerId::HsClient, consumer.clone());

    let outer = cp_mgr.cp_guard();
    let inner = outer.clone();
    assert!(Arc::ptr_eq(outer.cp(), inner.cp()));
    assert_eq!(outer.cp().enter_count(), 2);

    let trigger = cp_mgr.trigger_cp_flush(false);
    drop(inner);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(consumer.flushes(), 0, "one bracket is still open");
    drop(outer);
    assert!(trigger.await);

    cp_mgr.shutdown().await.expect("shutdown");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn every_bracket_lands_in_exactly_one_cp() {
    let dir = TempDir::new().unwrap();
    let (cp_mgr, _meta) = start_cp_mgr(&dir, test_config());
    let consumer = TestConsumer::new();
    cp_mgr.register_consumer(CpConsumerId::HsClient, consumer.clone());

    let mut writers = Vec::new();
    for _ in 0..8 {
        let cp_mgr = cp_mgr.clone();
        let consumer = consumer.clone();
        writers.push(tokio::spawn(async move {
            for _ in 0..25 {
                let guard = cp_mgr.cp_guard();
                let cp_id = guard.cp().id();
                *consumer.open_brackets.lock().entry(cp_id).or_insert(0) += 1;
                tokio::time::sleep(Duration::from_millis(1)).await;
                // Close the bracket before the guard drops so a starting
                // flush always observes zero open brackets.
                *consumer.open_brackets.lock().get_mut(&cp_id).unwrap() -= 1;
                drop(guard);
            }
        }));
    }

    let trigger_task = {
        let cp_mgr = cp_mgr.clone();
        tokio::spawn(async move {
            for _ in 0..10 {
                let _ = cp_mgr.trigger_cp_flush(true).await;
            }
        })
    };

    for writer in writers {
        writer.await.unwrap();
    }
    trigger_task.await.unwrap();

    // The consumer asserted quiescence inside every cp_flush; nothing left
    // open at the end either.
    assert!(consumer
        .open_brackets
        .lock()
        .values()
        .all(|&count| count == 0));

    cp_mgr.shutdown().await.expect("shutdown");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn watchdog_repairs_a_stalled_flush() {
    let dir = TempDir::new().unwrap();
    let mut cfg = test_config();
    cfg.cp_watchdog_timer = Duration::from_millis(20);
    let (cp_mgr, _meta) = start_cp_mgr(&dir, cfg);

    let consumer = TestConsumer::new();
    consumer.stall.store(true, Ordering::Release);
    consumer.progress.store(10, Ordering::Release);
    cp_mgr.register_consumer(CpConsumerId::HsClient, consumer.clone());

    let trigger = cp_mgr.trigger_cp_flush(false);

    // No progress for 12 watchdog ticks earns a repair attempt.
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while consumer.repairs.load(Ordering::Acquire) == 0 {
        assert!(
            std::time::Instant::now() < deadline,
            "watchdog never attempted repair"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // Unstick the consumer before the post-repair window expires.
    consumer.stall.store(false, Ordering::Release);
    consumer.progress.store(100, Ordering::Release);
    consumer.gate.add_permits(4);
    assert!(trigger.await);

    cp_mgr.shutdown().await.expect("shutdown");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn superblock_survives_restart() {
    let dir = TempDir::new().unwrap();
    let (cp_mgr, meta) = start_cp_mgr(&dir, test_config());
    let consumer = TestConsumer::new();
    cp_mgr.register_consumer(CpConsumerId::HsClient, consumer.clone());

    assert!(cp_mgr.trigger_cp_flush(false).await);
    assert!(cp_mgr.trigger_cp_flush(false).await);
    cp_mgr.shutdown().await.expect("shutdown");
    let flushed_before = cp_mgr.last_flushed_cp();
    assert_eq!(flushed_before, 3);

    // A fresh manager over the same meta store resumes the cp id sequence.
    let cp_mgr2 = CpManager::new(Handle::current(), meta, test_config());
    cp_mgr2.start(false).expect("restart");
    assert_eq!(cp_mgr2.last_flushed_cp(), flushed_before);
    let guard = cp_mgr2.cp_guard();
    assert_eq!(guard.cp().id(), flushed_before + 1);
    drop(guard);

    cp_mgr2.shutdown().await.expect("shutdown");
}
