//! Block devices: driver trait, registry, write-back cache and an in-memory disk.

pub mod cache;
pub mod ramdisk;
pub mod registry;

pub use cache::{BlockCache, CacheStats, SharedCache};
pub use ramdisk::RamDisk;
pub use registry::{BlockDevice, BlockRegistry, DeviceId};

use core::fmt;
use cupid_api_types::Errno;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockError {
    NoDevice,
    OutOfRange,
    BufferTooSmall,
    /// The device reported an error for the command.
    Io,
    Timeout,
    RegistryFull,
    InvalidName,
    /// The device sector size differs from the cache block size.
    UnsupportedSectorSize,
}

impl fmt::Display for BlockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            BlockError::NoDevice => "no such block device",
            BlockError::OutOfRange => "sector out of range",
            BlockError::BufferTooSmall => "buffer too small",
            BlockError::Io => "device error",
            BlockError::Timeout => "device timeout",
            BlockError::RegistryFull => "block registry full",
            BlockError::InvalidName => "invalid device name",
            BlockError::UnsupportedSectorSize => "unsupported sector size",
        };
        f.write_str(msg)
    }
}

impl From<BlockError> for Errno {
    fn from(e: BlockError) -> Self {
        match e {
            BlockError::NoDevice => Errno::NotFound,
            BlockError::OutOfRange | BlockError::BufferTooSmall | BlockError::InvalidName => {
                Errno::InvalidArgument
            }
            BlockError::RegistryFull => Errno::NoSpace,
            BlockError::UnsupportedSectorSize => Errno::NotSupported,
            BlockError::Io | BlockError::Timeout => Errno::Io,
        }
    }
}

/// A sector-addressed storage device.
///
/// `buf` holds exactly `count * sector_size()` bytes for the transfer; the registry
/// checks ranges and buffer sizes before calling the driver.
pub trait BlockDriver: Send {
    fn sector_count(&self) -> u64;

    fn sector_size(&self) -> usize {
        crate::consts::BLOCK_SIZE
    }

    fn read(&mut self, lba: u64, count: usize, buf: &mut [u8]) -> Result<(), BlockError>;

    fn write(&mut self, lba: u64, count: usize, buf: &[u8]) -> Result<(), BlockError>;
}
