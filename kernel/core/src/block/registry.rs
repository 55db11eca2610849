use super::{BlockDriver, BlockError};
use crate::consts::{MAX_BLOCK_DEVICES, MAX_DEVICE_NAME};
use alloc::boxed::Box;
use heapless::String;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceId(pub usize);

/// A registered device. The descriptor is immutable once registered.
pub struct BlockDevice {
    name: String<MAX_DEVICE_NAME>,
    sector_count: u64,
    sector_size: usize,
    driver: Box<dyn BlockDriver>,
}

impl BlockDevice {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sector_count(&self) -> u64 {
        self.sector_count
    }

    pub fn sector_size(&self) -> usize {
        self.sector_size
    }
}

/// Fixed-capacity table of block devices, addressed by registration index.
#[derive(Default)]
pub struct BlockRegistry {
    devices: heapless::Vec<BlockDevice, MAX_BLOCK_DEVICES>,
}

impl BlockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        name: &str,
        driver: Box<dyn BlockDriver>,
    ) -> Result<DeviceId, BlockError> {
        let mut owned = String::new();
        owned.push_str(name).map_err(|_| BlockError::InvalidName)?;
        let device = BlockDevice {
            name: owned,
            sector_count: driver.sector_count(),
            sector_size: driver.sector_size(),
            driver,
        };
        let id = DeviceId(self.devices.len());
        self.devices.push(device).map_err(|_| BlockError::RegistryFull)?;
        log::info!(
            "block: registered {name} as device {} ({} sectors)",
            id.0,
            self.devices[id.0].sector_count
        );
        Ok(id)
    }

    pub fn get(&self, id: DeviceId) -> Option<&BlockDevice> {
        self.devices.get(id.0)
    }

    pub fn find(&self, name: &str) -> Option<DeviceId> {
        self.devices.iter().position(|d| d.name == name).map(DeviceId)
    }

    pub fn count(&self) -> usize {
        self.devices.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (DeviceId, &BlockDevice)> {
        self.devices.iter().enumerate().map(|(i, d)| (DeviceId(i), d))
    }

    pub fn read(
        &mut self,
        id: DeviceId,
        lba: u64,
        count: usize,
        buf: &mut [u8],
    ) -> Result<(), BlockError> {
        let device = self.devices.get_mut(id.0).ok_or(BlockError::NoDevice)?;
        let len = device.check(lba, count, buf.len())?;
        device.driver.read(lba, count, &mut buf[..len])
    }

    pub fn write(
        &mut self,
        id: DeviceId,
        lba: u64,
        count: usize,
        buf: &[u8],
    ) -> Result<(), BlockError> {
        let device = self.devices.get_mut(id.0).ok_or(BlockError::NoDevice)?;
        let len = device.check(lba, count, buf.len())?;
        device.driver.write(lba, count, &buf[..len])
    }
}

impl BlockDevice {
    /// Validates a transfer and returns the number of bytes it covers.
    fn check(&self, lba: u64, count: usize, buf_len: usize) -> Result<usize, BlockError> {
        let end = lba.checked_add(count as u64).ok_or(BlockError::OutOfRange)?;
        if count == 0 || end > self.sector_count {
            return Err(BlockError::OutOfRange);
        }
        let len = count * self.sector_size;
        if buf_len < len {
            return Err(BlockError::BufferTooSmall);
        }
        Ok(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::RamDisk;
    use alloc::boxed::Box;

    #[test]
    fn register_and_transfer() {
        let mut registry = BlockRegistry::new();
        let id = registry.register("ram0", Box::new(RamDisk::new(8))).unwrap();
        assert_eq!(registry.count(), 1);
        assert_eq!(registry.get(id).unwrap().sector_count(), 8);
        assert_eq!(registry.find("ram0"), Some(id));

        let data = [0xA5u8; 1024];
        registry.write(id, 6, 2, &data).unwrap();
        let mut back = [0u8; 1024];
        registry.read(id, 6, 2, &mut back).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn rejects_out_of_range_and_short_buffers() {
        let mut registry = BlockRegistry::new();
        let id = registry.register("ram0", Box::new(RamDisk::new(4))).unwrap();
        let mut buf = [0u8; 512];
        assert_eq!(registry.read(id, 4, 1, &mut buf), Err(BlockError::OutOfRange));
        assert_eq!(registry.read(id, 0, 2, &mut buf), Err(BlockError::BufferTooSmall));
        assert_eq!(registry.read(DeviceId(3), 0, 1, &mut buf), Err(BlockError::NoDevice));
    }

    #[test]
    fn registry_is_bounded() {
        let mut registry = BlockRegistry::new();
        for _ in 0..MAX_BLOCK_DEVICES {
            registry.register("ram", Box::new(RamDisk::new(1))).unwrap();
        }
        assert_eq!(
            registry.register("ram", Box::new(RamDisk::new(1))).unwrap_err(),
            BlockError::RegistryFull
        );
    }
}
