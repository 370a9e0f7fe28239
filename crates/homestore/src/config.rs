use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default interval between periodic checkpoint triggers.
const DEFAULT_CP_TIMER_SECS: u64 = 60;

/// Default watchdog tick interval; a checkpoint showing no flush progress for
/// 12 ticks is repaired, then aborted.
const DEFAULT_CP_WATCHDOG_TIMER_SECS: u64 = 15;

/// Default smallest chunk a physical device is carved into. Determines the
/// width of the per-device chunk table.
const DEFAULT_MIN_CHUNK_SIZE: u64 = 16 * 1024 * 1024; // 16 MiB

/// Default number of allocation streams advertised per physical device.
const DEFAULT_STREAMS_PER_PDEV: u32 = 2;

/// How device files are opened for I/O.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IoMode {
    /// Page-cache buffered reads and writes.
    Buffered,
    /// `O_DIRECT` where the device supports it; HDDs downgrade to buffered.
    Direct,
    /// Open read-only; format and create paths are unavailable.
    ReadOnly,
}

/// Top-level options for the storage-engine core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HsConfig {
    /// Interval between periodic checkpoint triggers.
    pub cp_timer: Duration,
    /// Watchdog tick interval for stuck-checkpoint detection.
    pub cp_watchdog_timer: Duration,
    /// How device files are opened.
    pub open_mode: IoMode,
    /// Smallest chunk unit; sets the per-device chunk-table width.
    pub min_chunk_size: u64,
    /// Allocation streams advertised per physical device. Striped vdevs round
    /// their chunk count up to the stream total across chosen devices.
    pub streams_per_pdev: u32,
}

impl Default for HsConfig {
    fn default() -> Self {
        Self {
            cp_timer: Duration::from_secs(DEFAULT_CP_TIMER_SECS),
            cp_watchdog_timer: Duration::from_secs(DEFAULT_CP_WATCHDOG_TIMER_SECS),
            open_mode: IoMode::Buffered,
            min_chunk_size: DEFAULT_MIN_CHUNK_SIZE,
            streams_per_pdev: DEFAULT_STREAMS_PER_PDEV,
        }
    }
}

impl HsConfig {
    pub fn with_cp_timer(mut self, timer: Duration) -> Self {
        self.cp_timer = timer;
        self
    }

    pub fn with_open_mode(mut self, mode: IoMode) -> Self {
        self.open_mode = mode;
        self
    }

    pub fn with_min_chunk_size(mut self, size: u64) -> Self {
        self.min_chunk_size = size;
        self
    }
}
