//! In-kernel test suite, run under QEMU with the `kernel_test` feature. Results go
//! to the serial log and the exit code to QEMU's `isa-debug-exit` device.

use crate::consts::{BLOCK_SIZE, DEFAULT_STACK_SIZE};
use crate::memory::LockedHeap;
use crate::shell::Shell;
use crate::time::Timer;
use alloc::boxed::Box;
use alloc::format;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

/// What the tests get to poke at.
pub struct TestBed {
    pub shell: Shell,
    pub heap: &'static LockedHeap,
}

pub trait KernelTest: Sync {
    fn name(&self) -> &'static str;
    fn run(&self, bed: &mut TestBed) -> TestResult;
}

impl<F> KernelTest for F
where
    F: Fn(&mut TestBed) -> TestResult + Sync,
{
    fn name(&self) -> &'static str {
        core::any::type_name::<F>()
    }

    fn run(&self, bed: &mut TestBed) -> TestResult {
        self(bed)
    }
}

#[derive(Debug)]
pub enum TestResult {
    Ok,
    Failed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestGroup {
    Memory,
    Disk,
    Fs,
    Scheduler,
    Interrupts,
    Shell,
}

pub struct TestEntry {
    pub group: TestGroup,
    pub test: &'static dyn KernelTest,
}

/// Reads `test_suite=<group>` from the kernel command line.
pub fn parse_test_group(cmdline: &str) -> Option<TestGroup> {
    let prefix = "test_suite=";
    let pos = cmdline.find(prefix)?;
    let value = cmdline[pos + prefix.len()..].split_whitespace().next()?;
    match value {
        "mem" => Some(TestGroup::Memory),
        "disk" => Some(TestGroup::Disk),
        "fs" => Some(TestGroup::Fs),
        "sched" => Some(TestGroup::Scheduler),
        "interrupts" => Some(TestGroup::Interrupts),
        "shell" => Some(TestGroup::Shell),
        _ => None,
    }
}

pub fn tests() -> &'static [TestEntry] {
    &[
        TestEntry { group: TestGroup::Memory, test: &heap_returns_every_block },
        TestEntry { group: TestGroup::Memory, test: &heap_serves_page_alignment },
        TestEntry { group: TestGroup::Disk, test: &boot_sector_is_signed },
        TestEntry { group: TestGroup::Disk, test: &cache_write_back_reaches_disk },
        TestEntry { group: TestGroup::Fs, test: &fat_file_survives_cache_invalidation },
        TestEntry { group: TestGroup::Scheduler, test: &two_processes_interleave },
        TestEntry { group: TestGroup::Interrupts, test: &timer_interrupt_fires },
        TestEntry { group: TestGroup::Shell, test: &redirect_and_cat },
    ]
}

pub fn run_tests(bed: &mut TestBed, filter: Option<TestGroup>) -> ! {
    let filtered: Vec<&TestEntry> = tests().iter().filter(|e| filter.is_none_or(|g| e.group == g)).collect();
    match filter {
        Some(group) => log::info!("Running {group:?} tests ({} total)", filtered.len()),
        None => log::info!("Running all {} kernel tests", filtered.len()),
    }

    let mut failed = 0;
    for entry in &filtered {
        log::info!("{} ...", entry.test.name());
        match entry.test.run(bed) {
            TestResult::Ok => log::info!("[ok]"),
            TestResult::Failed(msg) => {
                log::error!("[failed] - {msg}");
                failed += 1;
            }
        }
    }

    if failed == 0 {
        log::info!("All tests passed!");
        exit_qemu(QemuExitCode::Success);
    } else {
        log::error!("{failed} test(s) failed");
        exit_qemu(QemuExitCode::Failed);
    }
    crate::hlt_loop();
}

pub fn test_panic_handler(info: &core::panic::PanicInfo) -> ! {
    log::error!("[failed]");
    log::error!("Error: {info}\n");
    exit_qemu(QemuExitCode::Failed);
    crate::hlt_loop();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum QemuExitCode {
    Success = 0x10,
    Failed = 0x11,
}

pub fn exit_qemu(exit_code: QemuExitCode) {
    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    unsafe {
        x86::io::outl(0xf4, exit_code as u32);
    }
}

fn heap_returns_every_block(bed: &mut TestBed) -> TestResult {
    let before = bed.heap.stats();
    {
        let numbers: Vec<u64> = (0..512).collect();
        let text = format!("{numbers:?}");
        let boxed = Box::new([0u8; 3000]);
        if text.is_empty() || boxed.len() != 3000 {
            return TestResult::Failed("allocation lost its contents".into());
        }
    }
    let after = bed.heap.stats();
    if after.used != before.used {
        return TestResult::Failed(format!("used {} before, {} after", before.used, after.used));
    }
    TestResult::Ok
}

fn heap_serves_page_alignment(bed: &mut TestBed) -> TestResult {
    use core::alloc::{GlobalAlloc, Layout};
    let Ok(layout) = Layout::from_size_align(64, 4096) else {
        return TestResult::Failed("bad layout".into());
    };
    let before = bed.heap.stats().used;
    let ptr = unsafe { bed.heap.alloc(layout) };
    if ptr.is_null() {
        return TestResult::Failed("page-aligned request was refused".into());
    }
    let misaligned = ptr as usize % 4096 != 0;
    unsafe { bed.heap.dealloc(ptr, layout) };
    if misaligned {
        return TestResult::Failed(format!("{ptr:p} is not page aligned"));
    }
    if bed.heap.stats().used != before {
        return TestResult::Failed("padded block was not returned".into());
    }
    TestResult::Ok
}

fn boot_sector_is_signed(bed: &mut TestBed) -> TestResult {
    let kernel = bed.shell.kernel();
    let Some(device) = kernel.fat_device else {
        return TestResult::Failed("no FAT16 device mounted".into());
    };
    let mut cache = kernel.cache.lock();
    match cache.read_block(device, 0) {
        Ok(sector) if sector[BLOCK_SIZE - 2..] == [0x55, 0xAA] => TestResult::Ok,
        Ok(_) => TestResult::Failed("sector 0 lacks 0x55AA".into()),
        Err(e) => TestResult::Failed(format!("read failed: {e}")),
    }
}

fn cache_write_back_reaches_disk(bed: &mut TestBed) -> TestResult {
    let kernel = bed.shell.kernel();
    let Some(device) = kernel.fat_device else {
        return TestResult::Failed("no FAT16 device mounted".into());
    };
    let mut cache = kernel.cache.lock();
    let Some(last) = cache.devices().get(device).map(|d| d.sector_count() - 1) else {
        return TestResult::Failed("device vanished".into());
    };
    let original = match cache.read_block(device, last) {
        Ok(sector) => *sector,
        Err(e) => return TestResult::Failed(format!("read failed: {e}")),
    };
    let pattern = [0xA5u8; BLOCK_SIZE];
    if let Err(e) = cache.write_block(device, last, &pattern) {
        return TestResult::Failed(format!("write failed: {e}"));
    }
    if let Err(e) = cache.flush(device) {
        return TestResult::Failed(format!("flush failed: {e}"));
    }
    cache.invalidate(device);
    let result = match cache.read_block(device, last) {
        Ok(sector) if sector[..] == pattern[..] => TestResult::Ok,
        Ok(_) => TestResult::Failed("read back different bytes".into()),
        Err(e) => TestResult::Failed(format!("read failed: {e}")),
    };
    // Put the sector back; it may belong to a file.
    if cache.write_block(device, last, &original).and_then(|()| cache.flush(device)).is_err() {
        log::warn!("self_test: could not restore sector {last}");
    }
    result
}

fn fat_file_survives_cache_invalidation(bed: &mut TestBed) -> TestResult {
    let kernel = bed.shell.kernel_mut();
    let Some(device) = kernel.fat_device else {
        return TestResult::Failed("no FAT16 device mounted".into());
    };
    let data: Vec<u8> = (0..5000u32).map(|i| i as u8).collect();
    if let Err(e) = kernel.vfs.write_all("/home/selftest.bin", &data, false) {
        return TestResult::Failed(format!("write failed: {e}"));
    }
    if let Err(e) = kernel.sync() {
        return TestResult::Failed(format!("sync failed: {e}"));
    }
    kernel.cache.lock().invalidate(device);
    let result = match kernel.vfs.read_all("/home/selftest.bin") {
        Ok(read) if read == data => TestResult::Ok,
        Ok(read) => TestResult::Failed(format!("read {} bytes back, contents differ", read.len())),
        Err(e) => TestResult::Failed(format!("read failed: {e}")),
    };
    let _ = kernel.vfs.unlink("/home/selftest.bin");
    result
}

fn two_processes_interleave(bed: &mut TestBed) -> TestResult {
    let scheduler = bed.shell.kernel().scheduler.clone();
    let seen = Arc::new(Mutex::new(String::new()));
    for name in ["A", "B"] {
        let seen = seen.clone();
        let spawned = scheduler.create(name, DEFAULT_STACK_SIZE, move |ctx| {
            for _ in 0..3 {
                seen.lock().push_str(name);
                ctx.yield_now();
            }
        });
        if let Err(e) = spawned {
            return TestResult::Failed(format!("create {name}: {e}"));
        }
    }
    scheduler.run_until_idle();
    let seen = seen.lock();
    let (a, b) = (seen.matches('A').count(), seen.matches('B').count());
    if a != 3 || b != 3 || seen.contains("AA") || seen.contains("BB") {
        return TestResult::Failed(format!("output was {:?}", seen.as_str()));
    }
    TestResult::Ok
}

fn timer_interrupt_fires(bed: &mut TestBed) -> TestResult {
    let timer: Arc<Timer> = bed.shell.kernel().timer.clone();
    let start = timer.ticks();
    for _ in 0..1000 {
        if timer.ticks() >= start + 3 {
            return TestResult::Ok;
        }
        crate::arch::wait_for_interrupt();
    }
    TestResult::Failed(format!("ticks stuck at {}", timer.ticks()))
}

fn redirect_and_cat(bed: &mut TestBed) -> TestResult {
    let mut out = String::new();
    let status = bed.shell.run("echo hi > /home/log && echo bye >> /home/log && cat /home/log", &mut out);
    let _ = bed.shell.run("rm /home/log", &mut String::new());
    if status != 0 || out != "hi\nbye\n" {
        return TestResult::Failed(format!("status {status}, output {out:?}"));
    }
    TestResult::Ok
}
