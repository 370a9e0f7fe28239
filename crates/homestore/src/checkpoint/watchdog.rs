//! Stuck-checkpoint watchdog.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::{info, warn};

use crate::error::{HsError, HsResult};

use super::cp::{Cp, CpCallbacks, CpStatus};

/// A checkpoint showing no progress for this many watchdog ticks gets one
/// repair attempt; a further stalled cycle is fatal.
const MAX_TIME_MULTIPLIER: u32 = 12;

struct WdState {
    cp: Option<Arc<Cp>>,
    progress_pct: u32,
    last_progress_time: Instant,
    repair_attempted: bool,
}

/// Tracks the checkpoint currently being flushed and aborts the process when
/// its consumers stop making progress despite a repair attempt.
pub(crate) struct CpWatchdog {
    timer: Duration,
    state: RwLock<WdState>,
}

impl CpWatchdog {
    pub(crate) fn new(timer: Duration) -> Self {
        info!(timer_ms = timer.as_millis() as u64, "cp watchdog armed");
        Self {
            timer,
            state: RwLock::new(WdState {
                cp: None,
                progress_pct: 0,
                last_progress_time: Instant::now(),
                repair_attempted: false,
            }),
        }
    }

    pub(crate) fn set_cp(&self, cp: Arc<Cp>) {
        let mut state = self.state.write();
        state.cp = Some(cp);
        state.progress_pct = 0;
        state.last_progress_time = Instant::now();
        state.repair_attempted = false;
    }

    pub(crate) fn reset_cp(&self) {
        let mut state = self.state.write();
        state.cp = None;
        state.progress_pct = 0;
        state.repair_attempted = false;
    }

    /// One watchdog cycle. Progress is an increase of the averaged
    /// per-consumer flush percentage; `CpStuck` after a fruitless repair
    /// round is fatal to the caller.
    pub(crate) fn tick(&self, consumers: &[Arc<dyn CpCallbacks>]) -> HsResult<()> {
        let mut state = self.state.write();
        let Some(cp) = state.cp.clone() else {
            return Ok(());
        };
        let status = cp.status();
        if status != CpStatus::FlushPrepare && status != CpStatus::Flushing {
            return Ok(());
        }
        if consumers.is_empty() {
            return Ok(());
        }

        let cum_pct: u32 = consumers.iter().map(|c| c.cp_progress_percent()).sum();
        let avg_pct = cum_pct / consumers.len() as u32;
        if avg_pct > state.progress_pct {
            state.progress_pct = avg_pct;
            state.last_progress_time = Instant::now();
            state.repair_attempted = false;
            return Ok(());
        }

        let elapsed = state.last_progress_time.elapsed();
        if elapsed >= self.timer {
            info!(
                progress_pct = state.progress_pct,
                elapsed_ms = elapsed.as_millis() as u64,
                cp = %cp,
                "cp flush progress has not changed"
            );
        }

        if elapsed < self.timer * MAX_TIME_MULTIPLIER {
            return Ok(());
        }

        if !state.repair_attempted {
            let mut repaired = 0u32;
            for consumer in consumers {
                if consumer.cp_progress_percent() < 100 {
                    consumer.repair_slow_cp();
                    repaired += 1;
                }
            }
            warn!(repaired, cp = %cp, "attempted repair of a slow cp");
            state.repair_attempted = true;
            // Give the repair a full detection window of its own.
            state.last_progress_time = Instant::now();
            return Ok(());
        }

        Err(HsError::CpStuck(format!(
            "cp seems to be stuck; state [{cp}], elapsed {} ms since last progress",
            elapsed.as_millis()
        )))
    }
}
