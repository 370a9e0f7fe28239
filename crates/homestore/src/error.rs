use std::fmt::Display;
use std::path::PathBuf;

/// A specialized error type for storage-engine operations.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum HsError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Magic or checksum mismatch in a persisted metadata record.
    #[error("corrupt superblock: {0}")]
    CorruptSuperblock(String),
    /// Persisted superblock version differs from the running version.
    #[error("superblock version mismatch: on-disk {found}, supported {supported}")]
    VersionMismatch { found: u32, supported: u32 },
    /// A device carries the uuid stamp of a different formatted system.
    #[error("system uuid mismatch on device {dev}")]
    SystemUuidMismatch { dev: PathBuf },
    /// The set of devices differs from the set the system was formatted with.
    #[error("formatted with {formatted} devices, restarted with {given}; dynamic add/remove is unsupported")]
    NumDevicesMismatch { formatted: u32, given: u32 },
    /// No free slot left in an id bitmap (vdev ids, chunk ids).
    #[error("out of room: {0}")]
    OutOfRoom(String),
    /// Insufficient contiguous free space to satisfy an allocation.
    #[error("no space: {0}")]
    NoSpace(String),
    /// A journal record failed to decode during recovery.
    #[error("journal decode error: {0}")]
    JournalDecodeError(String),
    /// The watchdog observed a checkpoint making no flush progress.
    #[error("checkpoint stuck: {0}")]
    CpStuck(String),
    /// Invalid state transition or operation.
    #[error("invalid state: {0}")]
    InvalidState(String),
}

impl HsError {
    /// Create a corrupt-superblock error from a displayable value.
    pub fn corrupt<T>(msg: T) -> Self
    where
        T: Display,
    {
        Self::CorruptSuperblock(msg.to_string())
    }

    /// Create an invalid-state error from a displayable value.
    pub fn invalid_state<T>(msg: T) -> Self
    where
        T: Display,
    {
        Self::InvalidState(msg.to_string())
    }
}

/// A Result type alias for storage-engine operations.
pub type HsResult<T> = Result<T, HsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn corrupt_helper() {
        let err = HsError::corrupt("bad magic");
        assert!(matches!(err, HsError::CorruptSuperblock(msg) if msg == "bad magic"));
    }
}
