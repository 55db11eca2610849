use crate::consts::{CACHE_SLOTS, DEFAULT_TIMER_HZ};
use crate::fs::fat16::FatClock;
use log::LevelFilter;

/// Runtime knobs for [`crate::boot::boot`].
#[derive(Clone, Debug)]
pub struct BootConfig {
    pub timer_hz: u32,
    pub log_level: LevelFilter,
    pub cache_slots: usize,
    /// Directories created in the root ramfs.
    pub ramfs_dirs: &'static [&'static str],
    /// Write `/bin/hello.cc` at boot.
    pub populate_bin: bool,
    /// Index (registration order) of the block device holding the FAT16 volume.
    pub fat_device: Option<usize>,
    pub fat_mount: &'static str,
    /// Lay out a fresh FAT16 volume when the device has no boot sector.
    pub format_blank_fat: bool,
    pub fat_clock: FatClock,
}

impl Default for BootConfig {
    fn default() -> Self {
        Self {
            timer_hz: DEFAULT_TIMER_HZ,
            log_level: LevelFilter::Info,
            cache_slots: CACHE_SLOTS,
            ramfs_dirs: &["/bin", "/tmp", "/home"],
            populate_bin: true,
            fat_device: Some(0),
            fat_mount: "/home",
            format_blank_fat: true,
            fat_clock: default_clock(),
        }
    }
}

#[cfg(target_os = "none")]
fn default_clock() -> FatClock {
    crate::time::rtc::rtc_clock
}

#[cfg(not(target_os = "none"))]
fn default_clock() -> FatClock {
    crate::fs::fat16::epoch_clock
}
