#![cfg_attr(target_os = "none", no_std, no_main)]

#[cfg(not(target_os = "none"))]
fn main() {
    hosted::run();
}

/// The freestanding i386 image, entered from a multiboot loader.
#[cfg(target_os = "none")]
mod image {
    extern crate alloc;

    use alloc::boxed::Box;
    use alloc::vec::Vec;
    use core::fmt::{self, Write};
    use cupid_kernel::arch::{self, X86Ports};
    use cupid_kernel::block::BlockDriver;
    use cupid_kernel::boot;
    use cupid_kernel::config::BootConfig;
    use cupid_kernel::console::{PANIC_ATTRIBUTE, TextConsole, VgaBuffer};
    use cupid_kernel::consts::DEFAULT_HEAP_SIZE;
    use cupid_kernel::drivers::disk::{self, DriveSelect};
    use cupid_kernel::memory::LockedHeap;
    use cupid_kernel::panic::{OutputMode, PANIC_CONTEXT};
    use cupid_kernel::shell::Shell;
    use cupid_kernel::time::pit;
    use cupid_kernel::{hlt_loop, logger, project_version};

    #[global_allocator]
    static HEAP: LockedHeap = LockedHeap::empty();

    static CONSOLE: spin::Mutex<Option<TextConsole<VgaBuffer>>> = spin::Mutex::new(None);

    const MULTIBOOT_BOOTLOADER_MAGIC: u32 = 0x2BAD_B002;
    const MULTIBOOT_INFO_MEMORY: u32 = 1 << 0;
    #[cfg_attr(not(feature = "kernel_test"), allow(dead_code))]
    const MULTIBOOT_INFO_CMDLINE: u32 = 1 << 2;

    // Multiboot v1 header (page-aligned modules, memory info) and the entry stub.
    core::arch::global_asm!(
        ".section .multiboot, \"a\"",
        ".align 4",
        ".long 0x1BADB002",
        ".long 0x00000003",
        ".long 0xE4524FFB",
        ".section .bss",
        ".align 16",
        "boot_stack_bottom:",
        ".skip 65536",
        "boot_stack_top:",
        ".section .text",
        ".global _start",
        "_start:",
        "mov esp, offset boot_stack_top",
        "push ebx",
        "push eax",
        "call kernel_main",
        "halt_forever:",
        "cli",
        "hlt",
        "jmp halt_forever",
    );

    unsafe extern "C" {
        static __kernel_end: u8;
    }

    #[repr(C)]
    struct MultibootInfo {
        flags: u32,
        mem_lower: u32,
        /// KiB of memory above 1 MiB.
        mem_upper: u32,
        boot_device: u32,
        cmdline: u32,
    }

    /// The heap starts at the first page after the image and is capped by the
    /// memory the loader reported.
    fn heap_region(info: &MultibootInfo) -> (*mut u8, usize) {
        let end = unsafe { &raw const __kernel_end } as usize;
        let base = end.next_multiple_of(4096);
        let mut size = DEFAULT_HEAP_SIZE;
        if info.flags & MULTIBOOT_INFO_MEMORY != 0 {
            let top = 0x10_0000 + info.mem_upper as usize * 1024;
            size = size.min(top.saturating_sub(base));
        }
        (base as *mut u8, size)
    }

    #[cfg(feature = "kernel_test")]
    fn cmdline(info: &MultibootInfo) -> &'static str {
        if info.flags & MULTIBOOT_INFO_CMDLINE == 0 || info.cmdline == 0 {
            return "";
        }
        // Safety: the loader left a NUL-terminated string in identity-mapped memory.
        let raw = unsafe { core::ffi::CStr::from_ptr(info.cmdline as usize as *const core::ffi::c_char) };
        raw.to_str().unwrap_or("")
    }

    /// Shell output: the VGA console. Serial carries the log.
    struct Screen;

    impl Write for Screen {
        fn write_str(&mut self, s: &str) -> fmt::Result {
            if let Some(console) = CONSOLE.lock().as_mut() {
                console.write_str(s)?;
            }
            Ok(())
        }
    }

    #[unsafe(no_mangle)]
    extern "C" fn kernel_main(magic: u32, info: *const MultibootInfo) -> ! {
        if magic != MULTIBOOT_BOOTLOADER_MAGIC {
            hlt_loop();
        }
        // Safety: a multiboot loader passes a valid info block in EBX.
        let info = unsafe { &*info };
        let (heap_base, heap_size) = heap_region(info);
        unsafe { HEAP.init(heap_base, heap_size) };

        let config = BootConfig::default();
        let _ = logger::init(config.log_level);
        log::info!("Welcome to CupidOS core v{}", project_version());
        log::info!("heap: {heap_size} bytes at {heap_base:p}");

        *CONSOLE.lock() = Some(TextConsole::new(unsafe { VgaBuffer::new() }));
        PANIC_CONTEXT.set_output_mode(OutputMode::Gui);

        let divisor = pit::program(&mut X86Ports, config.timer_hz);
        log::info!("pit: divisor {divisor} for {} Hz", config.timer_hz);

        let devices: Vec<(&str, Box<dyn BlockDriver>)> = disk::probe(X86Ports)
            .into_iter()
            .map(|drive| {
                let name = match drive.drive() {
                    DriveSelect::Master => "hda",
                    DriveSelect::Slave => "hdb",
                };
                (name, Box::new(drive) as Box<dyn BlockDriver>)
            })
            .collect();

        let kernel = match boot::boot(config, devices) {
            Ok(kernel) => kernel,
            Err(e) => {
                log::error!("boot failed: {e}");
                hlt_loop();
            }
        };
        arch::interrupts::install(kernel.timer.clone(), kernel.input.clone());
        let mut shell = Shell::new(kernel);

        #[cfg(feature = "kernel_test")]
        {
            use cupid_kernel::self_test::{TestBed, parse_test_group, run_tests};
            let filter = parse_test_group(cmdline(info));
            run_tests(&mut TestBed { shell, heap: &HEAP }, filter);
        }

        #[cfg(not(feature = "kernel_test"))]
        {
            let _ = write!(Screen, "CupidOS core {}\n\n{}", project_version(), shell.prompt());
            loop {
                shell.pump_input(&mut Screen);
                let timer = shell.kernel().timer.clone();
                shell.kernel().scheduler.check_point(&timer);
                arch::wait_for_interrupt();
            }
        }
    }

    #[cfg(feature = "kernel_test")]
    #[panic_handler]
    fn rust_panic(info: &core::panic::PanicInfo) -> ! {
        cupid_kernel::self_test::test_panic_handler(info)
    }

    #[cfg(not(feature = "kernel_test"))]
    #[panic_handler]
    fn rust_panic(info: &core::panic::PanicInfo) -> ! {
        use core::sync::atomic::{AtomicBool, Ordering};
        static DID_PANIC: AtomicBool = AtomicBool::new(false);

        if !DID_PANIC.swap(true, Ordering::Relaxed) {
            let report = PANIC_CONTEXT.report(info);
            logger::write_raw(format_args!("{report}"));
            if PANIC_CONTEXT.output_mode() == OutputMode::Gui {
                // The panicking code may hold the console.
                let mut console = match CONSOLE.try_lock() {
                    Some(console) => console,
                    None => {
                        unsafe { CONSOLE.force_unlock() };
                        CONSOLE.lock()
                    }
                };
                if let Some(console) = console.as_mut() {
                    console.set_attribute(PANIC_ATTRIBUTE);
                    console.clear();
                    let _ = write!(console, "KERNEL PANIC\n\n{report}");
                }
            }
        }
        hlt_loop();
    }
}

/// Runs the kernel core as an ordinary process over a RAM disk, with stdin lines as
/// keyboard input. Handy for poking at the shell and file systems without QEMU.
#[cfg(not(target_os = "none"))]
mod hosted {
    use cupid_kernel::block::{BlockDriver, RamDisk};
    use cupid_kernel::boot;
    use cupid_kernel::config::BootConfig;
    use cupid_kernel::shell::Shell;
    use cupid_kernel::logger::write_record;
    use log::Log;
    use std::io::{BufRead, Write};

    const DISK_SECTORS: u64 = 16 * 1024;

    struct StderrLogger;

    impl Log for StderrLogger {
        fn enabled(&self, metadata: &log::Metadata) -> bool {
            metadata.level() <= log::max_level()
        }

        fn log(&self, record: &log::Record) {
            let mut line = String::new();
            if write_record(&mut line, record).is_ok() {
                eprint!("{line}");
            }
        }

        fn flush(&self) {}
    }

    static LOGGER: StderrLogger = StderrLogger;

    pub fn run() {
        let config = BootConfig::default();
        if log::set_logger(&LOGGER).is_ok() {
            log::set_max_level(config.log_level);
        }
        let devices = vec![("hda", Box::new(RamDisk::new(DISK_SECTORS)) as Box<dyn BlockDriver>)];
        let kernel = match boot::boot(config, devices) {
            Ok(kernel) => kernel,
            Err(e) => {
                log::error!("boot failed: {e}");
                std::process::exit(1);
            }
        };
        let mut shell = Shell::new(kernel);

        let stdout = std::io::stdout();
        let mut stdout = stdout.lock();
        let mut out = String::new();
        let _ = write!(stdout, "{}", shell.prompt());
        let _ = stdout.flush();
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else {
                break;
            };
            if line.trim() == "exit" {
                break;
            }
            shell.submit(&line, &mut out);
            let _ = write!(stdout, "{out}{}", shell.prompt());
            let _ = stdout.flush();
            out.clear();
        }

        if let Err(e) = shell.into_kernel().shutdown() {
            log::error!("shutdown failed: {e}");
        }
    }
}
