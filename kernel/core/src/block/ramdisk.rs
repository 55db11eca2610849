use super::{BlockDriver, BlockError};
use crate::consts::BLOCK_SIZE;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};

/// Backing bytes of a RAM disk. Cloning shares the same storage, so an image can
/// outlive the kernel instance that used it.
pub type DiskImage = Arc<spin::Mutex<Vec<u8>>>;

#[derive(Debug, Default)]
pub struct RamDiskCounters {
    pub reads: AtomicUsize,
    pub writes: AtomicUsize,
}

/// A block device held in memory.
pub struct RamDisk {
    image: DiskImage,
    sectors: u64,
    counters: Arc<RamDiskCounters>,
}

impl RamDisk {
    pub fn new(sectors: u64) -> Self {
        Self::from_image(Arc::new(spin::Mutex::new(vec![0; sectors as usize * BLOCK_SIZE])))
    }

    /// Wraps existing storage; a trailing partial sector is ignored.
    pub fn from_image(image: DiskImage) -> Self {
        let sectors = (image.lock().len() / BLOCK_SIZE) as u64;
        Self { image, sectors, counters: Arc::default() }
    }

    pub fn image(&self) -> DiskImage {
        self.image.clone()
    }

    /// Per-command transfer counters (one per `read`/`write` call).
    pub fn counters(&self) -> Arc<RamDiskCounters> {
        self.counters.clone()
    }

    fn range(&self, lba: u64, count: usize) -> Result<core::ops::Range<usize>, BlockError> {
        if lba + count as u64 > self.sectors {
            return Err(BlockError::OutOfRange);
        }
        let start = lba as usize * BLOCK_SIZE;
        Ok(start..start + count * BLOCK_SIZE)
    }
}

impl BlockDriver for RamDisk {
    fn sector_count(&self) -> u64 {
        self.sectors
    }

    fn read(&mut self, lba: u64, count: usize, buf: &mut [u8]) -> Result<(), BlockError> {
        let range = self.range(lba, count)?;
        buf[..range.len()].copy_from_slice(&self.image.lock()[range]);
        self.counters.reads.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn write(&mut self, lba: u64, count: usize, buf: &[u8]) -> Result<(), BlockError> {
        let range = self.range(lba, count)?;
        let len = range.len();
        self.image.lock()[range].copy_from_slice(&buf[..len]);
        self.counters.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
