//! Checkpoint manager: serialises global checkpoints, drives the
//! multi-consumer flush fan-out and persists the checkpoint superblock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use byteorder::{ByteOrder, LittleEndian};
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use tokio::runtime::Handle;
use tokio::task::spawn_blocking;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::HsConfig;
use crate::error::{HsError, HsResult};
use crate::meta::MetaRegistry;

use super::cp::{Cp, CpCallbacks, CpConsumerId, CpGuard, CpStatus, MAX_CP_CONSUMERS};
use super::watchdog::CpWatchdog;

/// Meta-registry key of the checkpoint superblock.
pub const CP_SB_KEY: &str = "CPSuperBlock";

const CP_SB_MAGIC: u64 = 0x4350_5342_CEED_0001;
const CP_SB_VERSION: u32 = 1;
const CP_SB_LEN: usize = 20;

/// Persistent record of the highest fully flushed checkpoint.
#[derive(Debug, Clone, Copy)]
struct CpSuperBlock {
    last_flushed_cp: u64,
}

impl CpSuperBlock {
    fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; CP_SB_LEN];
        LittleEndian::write_u64(&mut buf[0..8], CP_SB_MAGIC);
        LittleEndian::write_u32(&mut buf[8..12], CP_SB_VERSION);
        LittleEndian::write_u64(&mut buf[12..20], self.last_flushed_cp);
        buf
    }

    fn decode(buf: &[u8]) -> HsResult<Self> {
        if buf.len() < CP_SB_LEN {
            return Err(HsError::corrupt("checkpoint superblock truncated"));
        }
        let magic = LittleEndian::read_u64(&buf[0..8]);
        if magic != CP_SB_MAGIC {
            return Err(HsError::corrupt("invalid checkpoint superblock magic"));
        }
        let version = LittleEndian::read_u32(&buf[8..12]);
        if version != CP_SB_VERSION {
            return Err(HsError::VersionMismatch {
                found: version,
                supported: CP_SB_VERSION,
            });
        }
        Ok(Self {
            last_flushed_cp: LittleEndian::read_u64(&buf[12..20]),
        })
    }
}

/// Globally-serialized checkpoint driver.
///
/// The current checkpoint is published through an atomic pointer; entry takes
/// a lock-free fast path (load, bump the entry count, revalidate the pointer)
/// so writers never contend with the switchover mutex.
pub struct CpManager {
    handle: Handle,
    meta: Arc<MetaRegistry>,
    cfg: HsConfig,
    cur_cp: ArcSwapOption<Cp>,
    in_flush_phase: AtomicBool,
    trigger_cp_mtx: Mutex<()>,
    consumers: RwLock<Vec<Option<Arc<dyn CpCallbacks>>>>,
    sb: Mutex<CpSuperBlock>,
    shutdown_initiated: AtomicBool,
    cancel: CancellationToken,
    watchdog: CpWatchdog,
}

impl CpManager {
    pub fn new(handle: Handle, meta: Arc<MetaRegistry>, cfg: HsConfig) -> Arc<Self> {
        let mut consumers = Vec::with_capacity(MAX_CP_CONSUMERS);
        consumers.resize_with(MAX_CP_CONSUMERS, || None);
        let watchdog = CpWatchdog::new(cfg.cp_watchdog_timer);
        Arc::new(Self {
            handle,
            meta,
            cfg,
            cur_cp: ArcSwapOption::from(None),
            in_flush_phase: AtomicBool::new(false),
            trigger_cp_mtx: Mutex::new(()),
            consumers: RwLock::new(consumers),
            sb: Mutex::new(CpSuperBlock { last_flushed_cp: 0 }),
            shutdown_initiated: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            watchdog,
        })
    }

    /// Creates or loads the checkpoint superblock, publishes the first CP and
    /// starts the periodic trigger and watchdog timers.
    pub fn start(self: &Arc<Self>, first_time_boot: bool) -> HsResult<()> {
        if first_time_boot {
            let sb = *self.sb.lock();
            self.meta.write(CP_SB_KEY, &sb.encode())?;
        } else {
            let buf = self
                .meta
                .read(CP_SB_KEY)?
                .ok_or_else(|| HsError::corrupt("checkpoint superblock missing at load"))?;
            *self.sb.lock() = CpSuperBlock::decode(&buf)?;
        }

        let first_id = self.sb.lock().last_flushed_cp + 1;
        let cp = Cp::new(first_id);
        cp.set_status(CpStatus::IoReady);
        self.cur_cp.store(Some(cp));
        info!(
            first_cp_id = first_id,
            cp_timer_ms = self.cfg.cp_timer.as_millis() as u64,
            "checkpoint manager started"
        );

        self.start_timers();
        Ok(())
    }

    fn start_timers(self: &Arc<Self>) {
        let this = self.clone();
        let token = self.cancel.clone();
        self.handle.spawn(async move {
            let mut intv = tokio::time::interval(this.cfg.cp_timer);
            intv.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            intv.tick().await; // the first tick is immediate
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = intv.tick() => {
                        let _ = this.trigger_cp_flush(false);
                    }
                }
            }
        });

        let this = self.clone();
        let token = self.cancel.clone();
        self.handle.spawn(async move {
            let mut intv = tokio::time::interval(this.cfg.cp_watchdog_timer);
            intv.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            intv.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = intv.tick() => {
                        let consumers = this.consumer_snapshot();
                        if let Err(e) = this.watchdog.tick(&consumers) {
                            error!(%e, "checkpoint watchdog gave up");
                            panic!("{e}");
                        }
                    }
                }
            }
        });
    }

    /// Registers a flush participant and hands it a context on the current CP.
    pub fn register_consumer(self: &Arc<Self>, id: CpConsumerId, cbs: Arc<dyn CpCallbacks>) {
        let idx = id as usize;
        let cur = self.cp_guard();
        let ctx = cbs.on_switchover_cp(None, cur.cp());
        cur.cp().set_context(idx, ctx);
        self.consumers.write()[idx] = Some(cbs);
    }

    fn consumer_snapshot(&self) -> Vec<Arc<dyn CpCallbacks>> {
        self.consumers.read().iter().flatten().cloned().collect()
    }

    /// Enters the current checkpoint. Lock-free: the entry count is bumped
    /// after loading the pointer and the load is revalidated, so a racing
    /// switchover never strands a writer in a flushing CP.
    pub fn cp_guard(self: &Arc<Self>) -> CpGuard {
        loop {
            let cp = self
                .cur_cp
                .load_full()
                .expect("cp_guard() after shutdown");
            cp.enter();
            let recheck = self.cur_cp.load();
            let still_current = recheck
                .as_ref()
                .map(|cur| Arc::ptr_eq(cur, &cp))
                .unwrap_or(false);
            if still_current {
                debug_assert!(matches!(
                    cp.status(),
                    CpStatus::IoReady | CpStatus::Trigger | CpStatus::FlushPrepare
                ));
                return CpGuard::new(cp, self.clone());
            }
            // Raced with a switchover; undo the stale entry and retry.
            self.cp_io_exit(&cp);
        }
    }

    pub(crate) fn cp_ref(&self, cp: &Arc<Cp>) {
        cp.enter();
    }

    pub(crate) fn cp_io_exit(self: &Arc<Self>, cp: &Arc<Cp>) {
        // A zero-crossing on an already-flushing CP (a stale entry undone by
        // the guard revalidation) is harmless: the transition CAS in
        // cp_start_flush fires at most once.
        if cp.exit() && cp.status() == CpStatus::FlushPrepare {
            self.cp_start_flush(cp.clone());
        }
    }

    /// Hook for dirty-buffer pressure from the resource layer.
    pub fn dirty_buf_pressure(self: &Arc<Self>) {
        let _ = self.trigger_cp_flush(false);
    }

    /// Switches the current checkpoint out for flushing.
    ///
    /// Returns a future resolving `true` once the checkpoint completes. While
    /// a flush is already running, a non-forced trigger resolves `false`
    /// immediately; a forced one arms a back-to-back checkpoint and resolves
    /// with *that* checkpoint's completion.
    pub fn trigger_cp_flush(self: &Arc<Self>, force: bool) -> BoxFuture<'static, bool> {
        if self
            .in_flush_phase
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            if !force {
                return futures::future::ready(false).boxed();
            }
            let _lk = self.trigger_cp_mtx.lock();
            let cur = self.cp_guard();
            debug_assert!(cur.status() != CpStatus::FlushPrepare);
            // Everyone forcing during the same flush shares the completion of
            // the one back-to-back checkpoint.
            cur.set_waiting_to_trigger();
            let rx = cur.add_waiter();
            return async move { rx.await.unwrap_or(false) }.boxed();
        }

        let ret_fut;
        {
            let cur = self.cp_guard();
            cur.set_status(CpStatus::Trigger);
            info!(cp = %cur.cp(), "triggering flush of the current checkpoint");

            let new_cp = Cp::new(cur.id() + 1);
            {
                let _lk = self.trigger_cp_mtx.lock();
                debug!(new_cp_id = new_cp.id(), "created new checkpoint session");

                let consumers = self.consumers.read();
                for (idx, consumer) in consumers.iter().enumerate() {
                    if let Some(consumer) = consumer {
                        let ctx = consumer.on_switchover_cp(Some(cur.cp()), &new_cp);
                        new_cp.set_context(idx, ctx);
                    }
                }
                drop(consumers);

                if cur.waiting_to_trigger() {
                    // This is the armed back-to-back trigger; the original
                    // waiters stay attached to the checkpoint itself.
                    ret_fut = futures::future::ready(true).boxed();
                } else {
                    let rx = cur.add_waiter();
                    ret_fut = async move { rx.await.unwrap_or(false) }.boxed();
                }

                self.watchdog.set_cp(cur.cp().clone());
                cur.set_status(CpStatus::FlushPrepare);
                new_cp.set_status(CpStatus::IoReady);
                self.cur_cp.store(Some(new_cp));
            }
            // Dropping the guard is the last exit of this path; if no other
            // writer holds the old CP, it starts the flush right here.
        }
        ret_fut
    }

    pub(crate) fn cp_start_flush(self: &Arc<Self>, cp: Arc<Cp>) {
        // Exactly one zero-crossing may start the flush.
        if !cp.transition_status(CpStatus::FlushPrepare, CpStatus::Flushing) {
            return;
        }
        info!(cp_id = cp.id(), "starting checkpoint flush");

        let consumers = self.consumer_snapshot();
        let futs: Vec<_> = consumers
            .into_iter()
            .map(|consumer| {
                let cp = cp.clone();
                async move { consumer.cp_flush(cp).await }
            })
            .collect();

        let this = self.clone();
        self.handle.spawn(async move {
            futures::future::join_all(futs).await;
            this.on_cp_flush_done(cp).await;
        });
    }

    async fn on_cp_flush_done(self: Arc<Self>, cp: Arc<Cp>) {
        debug_assert_eq!(cp.status(), CpStatus::Flushing);
        cp.set_status(CpStatus::FlushDone);

        // Superblock persistence is blocking I/O; hop off the async workers.
        let this = self.clone();
        spawn_blocking(move || {
            let mut sb = this.sb.lock();
            sb.last_flushed_cp += 1;
            this.meta
                .write(CP_SB_KEY, &sb.encode())
                .expect("checkpoint superblock write failed");
        })
        .await
        .expect("checkpoint superblock task panicked");

        cp.set_status(CpStatus::Cleaning);
        for consumer in self.consumer_snapshot() {
            consumer.cp_cleanup(&cp);
        }

        let shutdown_initiated = self.shutdown_initiated.load(Ordering::Acquire);
        self.watchdog.reset_cp();
        info!(cp_id = cp.id(), "checkpoint flush done");

        for waiter in cp.take_waiters() {
            let _ = waiter.send(true);
        }

        if shutdown_initiated {
            // No periodic checkpoints past this point, but an armed
            // back-to-back trigger is the final forced flush shutdown is
            // waiting on; it must still run.
            if let Some(cur) = self.cur_cp.load_full() {
                if cur.waiting_to_trigger() {
                    self.in_flush_phase.store(false, Ordering::Release);
                    info!("triggering final back-to-back checkpoint");
                    let _ = self.trigger_cp_flush(false);
                }
            }
            return;
        }
        self.in_flush_phase.store(false, Ordering::Release);

        let cur = self.cp_guard();
        if cur.waiting_to_trigger() {
            info!("triggering back-to-back checkpoint");
            let _ = self.trigger_cp_flush(false);
        }
    }

    /// Highest checkpoint id persisted as fully flushed.
    pub fn last_flushed_cp(&self) -> u64 {
        self.sb.lock().last_flushed_cp
    }

    /// Cancels the timers, forces one final flush and retires the current CP.
    pub async fn shutdown(self: &Arc<Self>) -> HsResult<()> {
        info!("stopping cp timer");
        self.cancel.cancel();
        self.shutdown_initiated.store(true, Ordering::Release);

        info!("triggering final cp flush");
        let flushed = self.trigger_cp_flush(true).await;
        if !flushed {
            return Err(HsError::invalid_state("final checkpoint flush failed"));
        }
        info!("final cp flush done");

        self.cur_cp.store(None);
        Ok(())
    }
}
