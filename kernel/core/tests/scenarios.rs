//! End-to-end runs of the booted core over RAM disks.

use cupid_api_types::elf::CODE_BASE;
use cupid_api_types::fs::OpenFlags;
use cupid_kernel::block::{BlockDriver, RamDisk};
use cupid_kernel::boot::{Kernel, boot};
use cupid_kernel::config::BootConfig;
use cupid_kernel::exec;
use cupid_kernel::shell::Shell;
use cupid_kernel::shell::path::resolve_path;

const DISK_SECTORS: u64 = 16 * 1024;

fn boot_on(disk: RamDisk) -> Kernel {
    boot(BootConfig::default(), vec![("hda", Box::new(disk) as Box<dyn BlockDriver>)]).unwrap()
}

fn run(shell: &mut Shell, line: &str) -> (i32, String) {
    let mut out = String::new();
    let status = shell.run(line, &mut out);
    (status, out)
}

#[test]
fn fat_files_survive_a_reboot() {
    let disk = RamDisk::new(DISK_SECTORS);
    let image = disk.image();
    let mut shell = Shell::new(boot_on(disk));
    assert_eq!(run(&mut shell, "mkdir /home/foo").0, 0);
    assert_eq!(run(&mut shell, "echo abc > /home/foo/x").0, 0);
    shell.into_kernel().shutdown().unwrap();

    let mut shell = Shell::new(boot_on(RamDisk::from_image(image)));
    assert_eq!(run(&mut shell, "cat /home/foo/x"), (0, "abc\n".into()));
    // The ramfs side starts over.
    assert_eq!(run(&mut shell, "ls /tmp"), (0, String::new()));
}

#[test]
fn bin_listing_ignores_trailing_slash() {
    let mut shell = Shell::new(boot_on(RamDisk::new(DISK_SECTORS)));
    let (status, plain) = run(&mut shell, "ls /bin");
    assert_eq!(status, 0);
    assert_eq!(plain.matches("hello.cc").count(), 1);
    assert_eq!(run(&mut shell, "ls /bin/").1, plain);
}

#[test]
fn chunked_ramfs_writes_add_up() {
    let mut kernel = boot_on(RamDisk::new(DISK_SECTORS));
    let data: Vec<u8> = (0..12_000u32).map(|i| (i % 251) as u8).collect();
    let fd = kernel.vfs.open("/tmp/big", OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE).unwrap();
    for chunk in data.chunks(4000) {
        assert_eq!(kernel.vfs.write(fd, chunk).unwrap(), 4000);
    }
    kernel.vfs.close(fd).unwrap();

    assert_eq!(kernel.vfs.stat("/tmp/big").unwrap().size, 12_000);
    let fd = kernel.vfs.open("/tmp/big", OpenFlags::READ).unwrap();
    let mut read = vec![0u8; 12_000];
    let mut filled = 0;
    while filled < read.len() {
        let n = kernel.vfs.read(fd, &mut read[filled..]).unwrap();
        assert!(n > 0);
        filled += n;
    }
    kernel.vfs.close(fd).unwrap();
    assert_eq!(read, data);
}

#[test]
fn single_hlt_program_loads_at_code_base() {
    let elf = exec::write(&[0xF4], &[], 0).unwrap();
    let image = exec::load(&elf).unwrap();
    assert_eq!(image.entry(), 0x0040_0000);
    assert_eq!(image.entry(), CODE_BASE);
    assert_eq!(image.read(CODE_BASE, 1), Some(&[0xF4][..]));
}

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
#[test]
fn yielding_processes_interleave() {
    use std::sync::{Arc, Mutex};

    let kernel = boot_on(RamDisk::new(DISK_SECTORS));
    let seen = Arc::new(Mutex::new(String::new()));
    for name in ["A", "B"] {
        let seen = seen.clone();
        kernel
            .scheduler
            .create(name, cupid_kernel::consts::DEFAULT_STACK_SIZE, move |ctx| {
                for _ in 0..3 {
                    seen.lock().unwrap().push_str(name);
                    ctx.yield_now();
                }
            })
            .unwrap();
    }
    kernel.scheduler.run_until_idle();

    let seen = seen.lock().unwrap();
    assert_eq!(seen.matches('A').count(), 3);
    assert_eq!(seen.matches('B').count(), 3);
    assert!(!seen.contains("AA") && !seen.contains("BB"), "{seen}");
}

#[test]
fn log_on_fat_collects_both_lines() {
    let mut shell = Shell::new(boot_on(RamDisk::new(DISK_SECTORS)));
    let line = "echo hi > /home/log && echo bye >> /home/log && cat /home/log";
    assert_eq!(run(&mut shell, line), (0, "hi\nbye\n".into()));
}

#[test]
fn paths_normalise_against_cwd() {
    assert_eq!(resolve_path("a/../b/./c", "/x/y").unwrap().as_str(), "/x/y/b/c");
    assert_eq!(resolve_path("/../../a", "/").unwrap().as_str(), "/a");
    assert_eq!(resolve_path("/", "/x").unwrap().as_str(), "/");
}

#[test]
fn redirection_truncates_then_appends() {
    let mut shell = Shell::new(boot_on(RamDisk::new(DISK_SECTORS)));
    assert_eq!(run(&mut shell, "echo hello > /tmp/t && cat /tmp/t"), (0, "hello\n".into()));
    assert_eq!(run(&mut shell, "echo hello >> /tmp/t && cat /tmp/t"), (0, "hello\nhello\n".into()));
    assert_eq!(run(&mut shell, "echo again > /tmp/t && cat /tmp/t"), (0, "again\n".into()));
}
