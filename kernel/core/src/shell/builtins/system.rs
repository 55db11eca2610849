use super::{BUILTINS, fail, usage};
use crate::fs::Fat16;
use crate::shell::Shell;
use alloc::boxed::Box;
use core::fmt::Write;
use cupid_api_types::Errno;

pub fn help(_shell: &mut Shell, _args: &[&str], out: &mut dyn Write) -> i32 {
    for builtin in &BUILTINS {
        let _ = writeln!(out, "  {}", builtin.usage);
    }
    let _ = writeln!(out, "Other names run programs from /bin and /home/bin.");
    0
}

pub fn sync(shell: &mut Shell, _args: &[&str], out: &mut dyn Write) -> i32 {
    match shell.kernel.sync() {
        Ok(()) => 0,
        Err(e) => {
            let _ = writeln!(out, "sync: {e}");
            1
        }
    }
}

pub fn mount(shell: &mut Shell, args: &[&str], out: &mut dyn Write) -> i32 {
    match args {
        [] => {
            for mount in shell.kernel.vfs.list_mounts() {
                let _ = writeln!(out, "{:<12} {}", mount.point.as_str(), mount.fs_name);
            }
            0
        }
        [device, point] => {
            let target = match shell.resolve_path(point) {
                Ok(target) => target,
                Err(e) => return fail(out, "mount", point, e),
            };
            let kernel = &mut shell.kernel;
            let Some(id) = kernel.cache.lock().devices().find(device) else {
                return fail(out, "mount", device, Errno::NotFound);
            };
            let fs = Fat16::new(kernel.cache.clone(), id).with_clock(kernel.config.fat_clock);
            match kernel.vfs.mount(&target, Box::new(fs)) {
                Ok(_) => 0,
                Err(e) => fail(out, "mount", point, e),
            }
        }
        _ => usage(out, "mount"),
    }
}

pub fn umount(shell: &mut Shell, args: &[&str], out: &mut dyn Write) -> i32 {
    let [point] = args else {
        return usage(out, "umount");
    };
    let result = shell.resolve_path(point).and_then(|target| shell.kernel.vfs.unmount(&target));
    match result {
        Ok(()) => {
            shell.kernel.cache.lock().flush_all();
            0
        }
        Err(e) => fail(out, "umount", point, e),
    }
}

pub fn history(shell: &mut Shell, _args: &[&str], out: &mut dyn Write) -> i32 {
    for (i, line) in shell.editor.history().iter().enumerate() {
        let _ = writeln!(out, "{:>5}  {line}", i + 1);
    }
    0
}

pub fn uptime(shell: &mut Shell, _args: &[&str], out: &mut dyn Write) -> i32 {
    let timer = &shell.kernel.timer;
    let ms = timer.uptime_ms();
    let _ = writeln!(out, "up {}.{:03}s, {} ticks at {} Hz", ms / 1000, ms % 1000, timer.ticks(), timer.hz());
    0
}

#[cfg(test)]
mod tests {
    use crate::block::{BlockDriver, RamDisk};
    use crate::boot::boot;
    use crate::config::BootConfig;
    use crate::fs::fat16;
    use crate::shell::Shell;
    use alloc::boxed::Box;
    use alloc::string::String;
    use alloc::vec;

    fn run(shell: &mut Shell, line: &str) -> (i32, String) {
        let mut out = String::new();
        let status = shell.run(line, &mut out);
        (status, out)
    }

    fn two_disk_shell() -> Shell {
        let spare = RamDisk::new(8 * 1024);
        let devices = vec![
            ("hda", Box::new(RamDisk::new(8 * 1024)) as Box<dyn BlockDriver>),
            ("hdb", Box::new(spare) as Box<dyn BlockDriver>),
        ];
        let shell = Shell::new(boot(BootConfig::default(), devices).unwrap());
        let cache = shell.kernel().cache.clone();
        fat16::format(&mut cache.lock(), crate::block::DeviceId(1), "SPARE").unwrap();
        shell
    }

    #[test]
    fn mount_lists_and_mounts_devices() {
        let mut shell = two_disk_shell();
        assert_eq!(run(&mut shell, "mount").1, "/            ramfs\n/home        fat16\n");
        assert_eq!(run(&mut shell, "mkdir /mnt && mount hdb /mnt").0, 0);
        run(&mut shell, "echo spare > /mnt/f.txt");
        assert_eq!(run(&mut shell, "cat /mnt/f.txt").1, "spare\n");
        assert_eq!(run(&mut shell, "umount /mnt").0, 0);
        assert_eq!(run(&mut shell, "ls /mnt").1, "");
        assert_eq!(run(&mut shell, "mount hdz /mnt"), (1, "mount: hdz: no such file or directory\n".into()));
        assert_eq!(run(&mut shell, "mount hdb").0, 1);
    }

    #[test]
    fn help_lists_every_builtin() {
        let mut shell = two_disk_shell();
        let out = run(&mut shell, "help").1;
        for builtin in &super::BUILTINS {
            assert!(out.contains(builtin.usage));
        }
    }

    #[test]
    fn uptime_reports_ticks() {
        let mut shell = two_disk_shell();
        for _ in 0..150 {
            shell.kernel().timer.on_tick();
        }
        assert_eq!(run(&mut shell, "uptime").1, "up 1.500s, 150 ticks at 100 Hz\n");
    }
}
