//! HomeStore: the storage-engine core of a block-oriented, log-structured
//! data store.
//!
//! Three tightly coupled subsystems make up the core:
//!
//! - **Device layout** ([`device`]): raw devices carved into chunks, grouped
//!   into virtual devices, with CRC-protected on-disk registries that decide
//!   first-boot vs load across restarts.
//! - **Checkpoints** ([`checkpoint`]): globally-serialized flush epochs with
//!   a lock-free current-CP read path, multi-consumer flush fan-out,
//!   back-to-back triggering and a stuck-flush watchdog.
//! - **Solo replication** ([`replication`]): an append-only data journal
//!   coupled to block allocation, giving atomic write-data-then-commit
//!   semantics under crash with ordered commit-upto tracking.
//!
//! Process-scoped services (the device manager, checkpoint manager, meta
//! registry, journal factory) are constructed at start and passed around as
//! explicit handles.

pub mod blkdata;
pub mod checkpoint;
pub mod config;
pub mod device;
pub mod error;
pub mod logdev;
pub mod meta;
pub mod replication;
pub mod superblk;

pub use blkdata::{BlkAllocHints, BlkDataService};
pub use checkpoint::{Cp, CpCallbacks, CpConsumerId, CpGuard, CpManager, CpStatus};
pub use config::{HsConfig, IoMode};
pub use device::{
    BlkId, DevInfo, DeviceManager, DriveKind, MultiBlkId, PhysicalDev, VdevParams, VirtualDev,
};
pub use error::{HsError, HsResult};
pub use logdev::{LogDev, LogStore};
pub use meta::MetaRegistry;
pub use replication::{ReplDevListener, ReplReq, SoloReplDev};
pub use superblk::{HsDevType, MultiPdevOpts};
