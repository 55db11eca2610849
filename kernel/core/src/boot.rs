//! Boot sequence and the kernel context that owns every subsystem.

use crate::block::{BlockCache, BlockDriver, BlockRegistry, DeviceId, SharedCache};
use crate::config::BootConfig;
use crate::consts::BLOCK_SIZE;
use crate::exec::SourceCompiler;
use crate::fs::{Fat16, Ramfs, Vfs, fat16};
use crate::input::InputQueue;
use crate::task::{JitPrograms, Scheduler};
use crate::time::Timer;
use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use cupid_api_types::{Errno, FsResult};

const HELLO_PATH: &str = "/bin/hello.cc";
const HELLO_SOURCE: &str = "int main() {\n    print(\"hello, world\\n\");\n    return 0;\n}\n";
const VOLUME_LABEL: &str = "CUPID";

pub struct Kernel {
    pub config: BootConfig,
    pub timer: Arc<Timer>,
    pub input: Arc<InputQueue>,
    pub cache: SharedCache,
    pub vfs: Vfs,
    pub scheduler: Arc<Scheduler>,
    pub programs: JitPrograms,
    pub compiler: Option<Box<dyn SourceCompiler>>,
    /// Device behind the FAT16 mount, if it mounted.
    pub fat_device: Option<DeviceId>,
}

/// Brings the core up over `devices`, registered in order.
///
/// Order: timer, block registry, block cache, ramfs root, FAT16, `/bin`
/// population, scheduler. A FAT16 volume that fails to mount is logged and skipped.
pub fn boot(config: BootConfig, devices: Vec<(&str, Box<dyn BlockDriver>)>) -> FsResult<Kernel> {
    let timer = Arc::new(Timer::new(config.timer_hz));
    log::info!("boot: timer at {} Hz", timer.hz());

    let mut registry = BlockRegistry::new();
    for (name, driver) in devices {
        registry.register(name, driver)?;
    }
    let cache = BlockCache::with_slots(registry, config.cache_slots).into_shared();

    let mut vfs = Vfs::new();
    vfs.mount("/", Box::new(Ramfs::new()))?;
    for dir in config.ramfs_dirs {
        vfs.mkdir(dir)?;
    }

    let fat_device = match config.fat_device.map(DeviceId) {
        Some(device) => match mount_fat(&mut vfs, &cache, device, &config) {
            Ok(()) => Some(device),
            Err(e) => {
                log::warn!("boot: FAT16 on device {} not mounted at {}: {e}", device.0, config.fat_mount);
                None
            }
        },
        None => None,
    };

    if config.populate_bin {
        vfs.write_all(HELLO_PATH, HELLO_SOURCE.as_bytes(), false)?;
    }

    let scheduler = Scheduler::new("shell");
    log::info!("boot: {} mounts, shell is pid 1", vfs.list_mounts().len());

    Ok(Kernel {
        config,
        timer,
        input: Arc::new(InputQueue::new()),
        cache,
        vfs,
        scheduler,
        programs: JitPrograms::new(),
        compiler: None,
        fat_device,
    })
}

fn has_boot_signature(cache: &SharedCache, device: DeviceId) -> FsResult<bool> {
    let mut cache = cache.lock();
    let sector = cache.read_block(device, 0)?;
    Ok(sector[BLOCK_SIZE - 2..] == [0x55, 0xAA])
}

fn mount_fat(vfs: &mut Vfs, cache: &SharedCache, device: DeviceId, config: &BootConfig) -> FsResult<()> {
    if !has_boot_signature(cache, device)? {
        if !config.format_blank_fat {
            return Err(Errno::InvalidArgument);
        }
        log::info!("boot: device {} is blank, formatting FAT16", device.0);
        fat16::format(&mut cache.lock(), device, VOLUME_LABEL)?;
    }
    let fs = Fat16::new(cache.clone(), device).with_clock(config.fat_clock);
    vfs.mount(config.fat_mount, Box::new(fs))?;
    Ok(())
}

impl Kernel {
    pub fn with_compiler(mut self, compiler: Box<dyn SourceCompiler>) -> Self {
        self.compiler = Some(compiler);
        self
    }

    /// Flushes every file system and every dirty cache block.
    pub fn sync(&mut self) -> FsResult<()> {
        let result = self.vfs.sync();
        let written = self.cache.lock().flush_all();
        log::debug!("boot: sync wrote {written} blocks");
        result
    }

    /// Syncs and unmounts everything. The block devices hold all persistent state
    /// afterwards.
    pub fn shutdown(mut self) -> FsResult<()> {
        self.sync()?;
        let mut points: Vec<_> = self.vfs.list_mounts().into_iter().map(|m| m.point).collect();
        // Deepest first so no mount outlives one below it.
        points.sort_by_key(|p| core::cmp::Reverse(p.len()));
        for point in points {
            self.vfs.unmount(&point)?;
        }
        log::info!("boot: shut down");
        Ok(())
    }
}
