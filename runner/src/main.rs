//! Boots a kernel image under `qemu-system-i386`.
//!
//! ```text
//! runner <kernel.elf> [disk.img] [test_suite=<group>]
//! ```
//!
//! The disk image is created blank when missing; the kernel lays out FAT16 on it.

use std::fs;
use std::path::PathBuf;
use std::process::{self, Command};

const DEFAULT_DISK: &str = "target/hda.img";
const DISK_BYTES: u64 = 8 * 1024 * 1024;

/// `isa-debug-exit` reports `(code << 1) | 1`.
const QEMU_TEST_SUCCESS: i32 = (0x10 << 1) | 1;

fn main() {
    let mut args = std::env::args().skip(1);
    let Some(kernel) = args.next() else {
        eprintln!("usage: runner <kernel.elf> [disk.img] [test_suite=<group>]");
        process::exit(2);
    };
    let mut disk = PathBuf::from(DEFAULT_DISK);
    let mut cmdline = String::new();
    for arg in args {
        if arg.starts_with("test_suite=") {
            cmdline = arg;
        } else {
            disk = PathBuf::from(arg);
        }
    }

    if !disk.exists() {
        if let Some(parent) = disk.parent() {
            fs::create_dir_all(parent).expect("Failed to create the disk image directory");
        }
        let file = fs::File::create(&disk).expect("Failed to create the disk image");
        file.set_len(DISK_BYTES).expect("Failed to size the disk image");
    }

    let mut qemu = Command::new("qemu-system-i386");
    qemu.arg("-kernel").arg(&kernel);
    qemu.arg("-drive").arg(format!("file={},format=raw,index=0,media=disk", disk.display()));
    if !cmdline.is_empty() {
        qemu.arg("-append").arg(&cmdline);
    }
    qemu.arg("--no-reboot");
    qemu.arg("-serial").arg("stdio");
    qemu.arg("-device").arg("isa-debug-exit,iobase=0xf4,iosize=0x04");
    if cfg!(feature = "kernel_test") {
        qemu.arg("-display").arg("none");
    }

    let exit_status = qemu.status().expect("Failed to run QEMU");
    let code = exit_status.code().unwrap_or(1);
    if cfg!(feature = "kernel_test") {
        process::exit(if code == QEMU_TEST_SUCCESS { 0 } else { 1 });
    }
    process::exit(code);
}
