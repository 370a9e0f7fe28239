//! Checkpoint entity, consumer seam and the scoped I/O guard.

use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use super::cp_mgr::CpManager;

/// Slots in the consumer table. Registration order is also flush fan-out
/// order.
pub const MAX_CP_CONSUMERS: usize = 4;

/// Well-known consumer slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum CpConsumerId {
    HsClient = 0,
    Index = 1,
    BlkData = 2,
    ReplSvc = 3,
}

/// Life stages of a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CpStatus {
    IoReady = 0,
    Trigger = 1,
    FlushPrepare = 2,
    Flushing = 3,
    FlushDone = 4,
    Cleaning = 5,
}

impl CpStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => CpStatus::IoReady,
            1 => CpStatus::Trigger,
            2 => CpStatus::FlushPrepare,
            3 => CpStatus::Flushing,
            4 => CpStatus::FlushDone,
            5 => CpStatus::Cleaning,
            other => unreachable!("invalid cp status {other}"),
        }
    }
}

/// Per-consumer scratch state attached to a checkpoint at switchover.
pub type CpContext = Box<dyn Any + Send>;

/// One globally-serialized flush epoch. At most two exist at a time: the
/// current one accepting I/O and the previous one draining or flushing.
pub struct Cp {
    id: u64,
    status: AtomicU8,
    enter_cnt: AtomicU64,
    waiting_to_trigger: AtomicBool,
    waiters: Mutex<Vec<oneshot::Sender<bool>>>,
    contexts: Mutex<Vec<Option<CpContext>>>,
}

impl Cp {
    pub(crate) fn new(id: u64) -> Arc<Self> {
        let mut contexts = Vec::with_capacity(MAX_CP_CONSUMERS);
        contexts.resize_with(MAX_CP_CONSUMERS, || None);
        Arc::new(Self {
            id,
            status: AtomicU8::new(CpStatus::IoReady as u8),
            enter_cnt: AtomicU64::new(0),
            waiting_to_trigger: AtomicBool::new(false),
            waiters: Mutex::new(Vec::new()),
            contexts: Mutex::new(contexts),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn status(&self) -> CpStatus {
        CpStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub(crate) fn set_status(&self, status: CpStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    pub(crate) fn transition_status(&self, from: CpStatus, to: CpStatus) -> bool {
        self.status
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn enter_count(&self) -> u64 {
        self.enter_cnt.load(Ordering::Acquire)
    }

    pub(crate) fn enter(&self) -> u64 {
        self.enter_cnt.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Returns true when this exit was the last one out.
    pub(crate) fn exit(&self) -> bool {
        let prev = self.enter_cnt.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "cp exit without a matching enter");
        prev == 1
    }

    pub(crate) fn waiting_to_trigger(&self) -> bool {
        self.waiting_to_trigger.load(Ordering::Acquire)
    }

    pub(crate) fn set_waiting_to_trigger(&self) {
        self.waiting_to_trigger.store(true, Ordering::Release);
    }

    /// Registers interest in this checkpoint's completion.
    pub(crate) fn add_waiter(&self) -> oneshot::Receiver<bool> {
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().push(tx);
        rx
    }

    pub(crate) fn take_waiters(&self) -> Vec<oneshot::Sender<bool>> {
        std::mem::take(&mut *self.waiters.lock())
    }

    /// Access the per-consumer context attached at switchover.
    pub fn with_context<R>(
        &self,
        consumer: CpConsumerId,
        f: impl FnOnce(&mut Option<CpContext>) -> R,
    ) -> R {
        f(&mut self.contexts.lock()[consumer as usize])
    }

    pub(crate) fn set_context(&self, idx: usize, ctx: Option<CpContext>) {
        self.contexts.lock()[idx] = ctx;
    }
}

impl std::fmt::Display for Cp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "cp_id={} status={:?} enter_cnt={}",
            self.id,
            self.status(),
            self.enter_count()
        )
    }
}

/// Flush-participation capabilities a subsystem registers with the
/// checkpoint manager.
#[async_trait]
pub trait CpCallbacks: Send + Sync {
    /// Called under the switchover critical section; returns the context the
    /// consumer wants attached to `new_cp`.
    fn on_switchover_cp(&self, cur_cp: Option<&Cp>, new_cp: &Cp) -> Option<CpContext>;

    /// Flush everything dirty under `cp`. Failures here are fatal; there is
    /// no error path back into the checkpoint state machine.
    async fn cp_flush(&self, cp: Arc<Cp>);

    /// Reclaim resources of a fully flushed checkpoint.
    fn cp_cleanup(&self, cp: &Cp);

    /// Flush progress in percent, 100 when idle.
    fn cp_progress_percent(&self) -> u32;

    /// Last-resort nudge for a consumer whose flush is stuck.
    fn repair_slow_cp(&self) {}
}

/// Scoped entry into the current checkpoint.
///
/// Creation pins the current CP and bumps its entry count; drop releases it
/// on every exit path. Cloning bumps the count without re-reading the
/// current-CP pointer, which is how nested sections share one CP. When the
/// last guard of a CP in flush-prepare drops, the flush starts.
pub struct CpGuard {
    cp: Arc<Cp>,
    mgr: Arc<CpManager>,
}

impl CpGuard {
    pub(crate) fn new(cp: Arc<Cp>, mgr: Arc<CpManager>) -> Self {
        Self { cp, mgr }
    }

    pub fn cp(&self) -> &Arc<Cp> {
        &self.cp
    }
}

impl Clone for CpGuard {
    fn clone(&self) -> Self {
        self.mgr.cp_ref(&self.cp);
        Self {
            cp: self.cp.clone(),
            mgr: self.mgr.clone(),
        }
    }
}

impl std::ops::Deref for CpGuard {
    type Target = Cp;

    fn deref(&self) -> &Cp {
        &self.cp
    }
}

impl Drop for CpGuard {
    fn drop(&mut self) {
        self.mgr.cp_io_exit(&self.cp);
    }
}
