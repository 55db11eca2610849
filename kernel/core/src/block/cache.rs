//! Write-back LRU cache of 512-byte blocks shared by every file system.
//!
//! A dirty slot always holds data newer than the device copy; it reaches the device
//! on eviction or on `flush`. Failing to write a dirty block back is fatal: the data
//! has nowhere else to live.

use super::{BlockError, BlockRegistry, DeviceId};
use crate::consts::{BLOCK_SIZE, CACHE_SLOTS};
use alloc::sync::Arc;
use alloc::vec::Vec;

pub type SharedCache = Arc<spin::Mutex<BlockCache>>;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub write_backs: u64,
}

struct Slot {
    device: DeviceId,
    lba: u64,
    valid: bool,
    dirty: bool,
    last_access: u64,
    data: [u8; BLOCK_SIZE],
}

impl Slot {
    const EMPTY: Slot = Slot {
        device: DeviceId(0),
        lba: 0,
        valid: false,
        dirty: false,
        last_access: 0,
        data: [0; BLOCK_SIZE],
    };

    fn holds(&self, device: DeviceId, lba: u64) -> bool {
        self.valid && self.device == device && self.lba == lba
    }
}

pub struct BlockCache {
    devices: BlockRegistry,
    slots: Vec<Slot>,
    /// Monotonic access counter used as the LRU clock.
    clock: u64,
    stats: CacheStats,
}

impl BlockCache {
    pub fn new(devices: BlockRegistry) -> Self {
        Self::with_slots(devices, CACHE_SLOTS)
    }

    pub fn with_slots(devices: BlockRegistry, slots: usize) -> Self {
        assert!(slots > 0, "block cache needs at least one slot");
        let mut table = Vec::with_capacity(slots);
        table.resize_with(slots, || Slot::EMPTY);
        Self { devices, slots: table, clock: 0, stats: CacheStats::default() }
    }

    pub fn into_shared(self) -> SharedCache {
        Arc::new(spin::Mutex::new(self))
    }

    pub fn devices(&self) -> &BlockRegistry {
        &self.devices
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    pub fn dirty_count(&self) -> usize {
        self.slots.iter().filter(|s| s.valid && s.dirty).count()
    }

    /// Returns the cached contents of `(device, lba)`, reading it on a miss.
    pub fn read_block(&mut self, device: DeviceId, lba: u64) -> Result<&[u8; BLOCK_SIZE], BlockError> {
        let idx = self.load(device, lba, true)?;
        Ok(&self.slots[idx].data)
    }

    /// Replaces the whole block and marks it dirty. No device read is needed.
    pub fn write_block(&mut self, device: DeviceId, lba: u64, data: &[u8]) -> Result<(), BlockError> {
        if data.len() != BLOCK_SIZE {
            return Err(BlockError::BufferTooSmall);
        }
        let idx = self.load(device, lba, false)?;
        let slot = &mut self.slots[idx];
        slot.data.copy_from_slice(data);
        slot.dirty = true;
        Ok(())
    }

    /// Read-modify-write of part of a block.
    pub fn modify_block<R>(
        &mut self,
        device: DeviceId,
        lba: u64,
        f: impl FnOnce(&mut [u8; BLOCK_SIZE]) -> R,
    ) -> Result<R, BlockError> {
        let idx = self.load(device, lba, true)?;
        let slot = &mut self.slots[idx];
        slot.dirty = true;
        Ok(f(&mut slot.data))
    }

    /// Writes every dirty block of `device` back. Returns the number written.
    pub fn flush(&mut self, device: DeviceId) -> Result<usize, BlockError> {
        if self.devices.get(device).is_none() {
            return Err(BlockError::NoDevice);
        }
        let mut written = 0;
        for idx in 0..self.slots.len() {
            let slot = &self.slots[idx];
            if slot.valid && slot.dirty && slot.device == device {
                self.write_back(idx);
                written += 1;
            }
        }
        log::debug!("cache: flushed {written} blocks of device {}", device.0);
        Ok(written)
    }

    pub fn flush_all(&mut self) -> usize {
        let mut written = 0;
        for idx in 0..self.slots.len() {
            if self.slots[idx].valid && self.slots[idx].dirty {
                self.write_back(idx);
                written += 1;
            }
        }
        written
    }

    /// Drops every cached block of `device`. Dirty blocks are discarded, not written.
    pub fn invalidate(&mut self, device: DeviceId) {
        let mut discarded = 0;
        for slot in self.slots.iter_mut().filter(|s| s.valid && s.device == device) {
            discarded += usize::from(slot.dirty);
            slot.valid = false;
            slot.dirty = false;
        }
        if discarded > 0 {
            log::warn!("cache: invalidate discarded {discarded} dirty blocks of device {}", device.0);
        }
    }

    /// Finds or fills the slot for `(device, lba)` and returns its index.
    fn load(&mut self, device: DeviceId, lba: u64, fetch: bool) -> Result<usize, BlockError> {
        self.clock += 1;
        if let Some(idx) = self.slots.iter().position(|s| s.holds(device, lba)) {
            self.stats.hits += 1;
            self.slots[idx].last_access = self.clock;
            return Ok(idx);
        }

        let dev = self.devices.get(device).ok_or(BlockError::NoDevice)?;
        if dev.sector_size() != BLOCK_SIZE {
            return Err(BlockError::UnsupportedSectorSize);
        }
        if lba >= dev.sector_count() {
            return Err(BlockError::OutOfRange);
        }

        self.stats.misses += 1;
        let idx = self.victim();
        if self.slots[idx].valid {
            self.stats.evictions += 1;
            log::trace!(
                "cache: evict dev {} lba {}",
                self.slots[idx].device.0,
                self.slots[idx].lba
            );
            if self.slots[idx].dirty {
                self.write_back(idx);
            }
            self.slots[idx].valid = false;
        }

        let slot = &mut self.slots[idx];
        if fetch {
            self.devices.read(device, lba, 1, &mut slot.data)?;
        }
        slot.device = device;
        slot.lba = lba;
        slot.valid = true;
        slot.dirty = false;
        slot.last_access = self.clock;
        Ok(idx)
    }

    /// An empty slot if one exists, otherwise the least recently used one.
    fn victim(&self) -> usize {
        if let Some(idx) = self.slots.iter().position(|s| !s.valid) {
            return idx;
        }
        self.slots
            .iter()
            .enumerate()
            .min_by_key(|(_, s)| s.last_access)
            .map_or(0, |(idx, _)| idx)
    }

    fn write_back(&mut self, idx: usize) {
        let slot = &mut self.slots[idx];
        if let Err(e) = self.devices.write(slot.device, slot.lba, 1, &slot.data) {
            log::error!("cache: write-back of dev {} lba {} failed: {e}", slot.device.0, slot.lba);
            panic!("block cache: write-back failed ({e})");
        }
        slot.dirty = false;
        self.stats.write_backs += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{BlockDriver, RamDisk};
    use alloc::boxed::Box;
    use core::sync::atomic::Ordering;

    fn cache_over(sectors: u64, slots: usize) -> (BlockCache, DeviceId, RamDisk) {
        let disk = RamDisk::new(sectors);
        let handle = RamDisk::from_image(disk.image());
        let mut registry = BlockRegistry::new();
        let id = registry.register("ram0", Box::new(disk)).unwrap();
        (BlockCache::with_slots(registry, slots), id, handle)
    }

    #[test]
    fn repeated_reads_hit() {
        let (mut cache, dev, _) = cache_over(16, 4);
        cache.read_block(dev, 3).unwrap();
        cache.read_block(dev, 3).unwrap();
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses), (1, 1));
    }

    #[test]
    fn least_recently_used_block_is_evicted() {
        const N: u64 = 4;
        let disk = RamDisk::new(16);
        let counters = disk.counters();
        let mut registry = BlockRegistry::new();
        let dev = registry.register("ram0", Box::new(disk)).unwrap();
        let mut cache = BlockCache::with_slots(registry, N as usize);

        for lba in 1..=N + 1 {
            cache.read_block(dev, lba).unwrap();
        }
        let before = counters.reads.load(Ordering::Relaxed);
        cache.read_block(dev, 2).unwrap();
        assert_eq!(counters.reads.load(Ordering::Relaxed), before);
        cache.read_block(dev, 1).unwrap();
        assert_eq!(counters.reads.load(Ordering::Relaxed), before + 1);
    }

    #[test]
    fn writes_stay_in_cache_until_flush() {
        let (mut cache, dev, mut disk) = cache_over(16, 4);
        cache.write_block(dev, 5, &[7u8; BLOCK_SIZE]).unwrap();
        cache.modify_block(dev, 5, |b| b[0] = 9).unwrap();

        let mut raw = [0u8; BLOCK_SIZE];
        disk.read(5, 1, &mut raw).unwrap();
        assert_eq!(raw, [0u8; BLOCK_SIZE]);
        assert_eq!(cache.dirty_count(), 1);

        assert_eq!(cache.flush(dev).unwrap(), 1);
        disk.read(5, 1, &mut raw).unwrap();
        assert_eq!(raw[0], 9);
        assert!(raw[1..].iter().all(|&b| b == 7));
        assert_eq!(cache.dirty_count(), 0);
    }

    #[test]
    fn dirty_victim_is_written_back() {
        let (mut cache, dev, mut disk) = cache_over(16, 2);
        cache.write_block(dev, 0, &[1u8; BLOCK_SIZE]).unwrap();
        cache.read_block(dev, 1).unwrap();
        cache.read_block(dev, 2).unwrap();
        let mut raw = [0u8; BLOCK_SIZE];
        disk.read(0, 1, &mut raw).unwrap();
        assert_eq!(raw, [1u8; BLOCK_SIZE]);
        assert_eq!(cache.stats().write_backs, 1);
    }

    #[test]
    fn invalidate_discards_dirty_data() {
        let (mut cache, dev, mut disk) = cache_over(16, 4);
        cache.write_block(dev, 2, &[3u8; BLOCK_SIZE]).unwrap();
        cache.invalidate(dev);
        assert_eq!(cache.read_block(dev, 2).unwrap(), &[0u8; BLOCK_SIZE]);
        let mut raw = [0u8; BLOCK_SIZE];
        disk.read(2, 1, &mut raw).unwrap();
        assert_eq!(raw, [0u8; BLOCK_SIZE]);
    }

    #[test]
    fn out_of_range_is_an_error() {
        let (mut cache, dev, _) = cache_over(4, 2);
        assert_eq!(cache.read_block(dev, 4).unwrap_err(), BlockError::OutOfRange);
        assert_eq!(cache.read_block(DeviceId(7), 0).unwrap_err(), BlockError::NoDevice);
    }

    struct ReadOnlyDisk;

    impl BlockDriver for ReadOnlyDisk {
        fn sector_count(&self) -> u64 {
            8
        }

        fn read(&mut self, _lba: u64, _count: usize, buf: &mut [u8]) -> Result<(), BlockError> {
            buf.fill(0);
            Ok(())
        }

        fn write(&mut self, _lba: u64, _count: usize, _buf: &[u8]) -> Result<(), BlockError> {
            Err(BlockError::Io)
        }
    }

    #[test]
    #[should_panic(expected = "write-back failed")]
    fn failed_write_back_is_fatal() {
        let mut registry = BlockRegistry::new();
        let dev = registry.register("ro", Box::new(ReadOnlyDisk)).unwrap();
        let mut cache = BlockCache::with_slots(registry, 1);
        cache.write_block(dev, 0, &[1u8; BLOCK_SIZE]).unwrap();
        cache.read_block(dev, 1).unwrap();
    }
}
