//! Device layout: physical devices, chunks and virtual devices, plus their
//! on-disk registries.

pub mod blkid;
pub mod chunk;
pub mod device_manager;
pub mod physical_dev;
pub mod virtual_dev;

pub use blkid::{BlkId, MultiBlkId};
pub use chunk::Chunk;
pub use device_manager::{DeviceManager, VdevCreateCb};
pub use physical_dev::{DevInfo, DriveKind, PhysicalDev};
pub use virtual_dev::{BlkAllocatorType, ChunkSelectorType, VdevParams, VirtualDev};
