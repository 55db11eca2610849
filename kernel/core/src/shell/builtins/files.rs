use super::{fail, usage};
use crate::shell::Shell;
use alloc::string::String;
use core::fmt::Write;
use cupid_api_types::FsResult;
use cupid_api_types::fs::FileType;

/// Runs `op` on every resolved path argument, reporting failures. The status is 1
/// if any of them failed.
fn each_path(
    shell: &mut Shell,
    command: &str,
    args: &[&str],
    out: &mut dyn Write,
    mut op: impl FnMut(&mut Shell, &str, &str, &mut dyn Write) -> FsResult<()>,
) -> i32 {
    if args.is_empty() {
        return usage(out, command);
    }
    let mut status = 0;
    for &arg in args {
        let result = match shell.resolve_path(arg) {
            Ok(path) => op(shell, arg, &path, out),
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            status = fail(out, command, arg, e);
        }
    }
    status
}

pub fn ls(shell: &mut Shell, args: &[&str], out: &mut dyn Write) -> i32 {
    let args = if args.is_empty() { &["."][..] } else { args };
    each_path(shell, "ls", args, out, |shell, arg, path, out| {
        let vfs = &mut shell.kernel.vfs;
        if !vfs.stat(path)?.is_dir() {
            let _ = writeln!(out, "{arg}");
            return Ok(());
        }
        let mut entries = vfs.list_dir(path)?;
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        for entry in entries {
            let _ = writeln!(out, "{}{}", entry.name, if entry.is_dir() { "/" } else { "" });
        }
        Ok(())
    })
}

pub fn cd(shell: &mut Shell, args: &[&str], out: &mut dyn Write) -> i32 {
    let target = args.first().copied().unwrap_or("/");
    match shell.set_cwd(target) {
        Ok(()) => 0,
        Err(e) => fail(out, "cd", target, e),
    }
}

pub fn pwd(shell: &mut Shell, _args: &[&str], out: &mut dyn Write) -> i32 {
    let _ = writeln!(out, "{}", shell.cwd());
    0
}

pub fn cat(shell: &mut Shell, args: &[&str], out: &mut dyn Write) -> i32 {
    each_path(shell, "cat", args, out, |shell, _, path, out| {
        let bytes = shell.kernel.vfs.read_all(path)?;
        let _ = out.write_str(&String::from_utf8_lossy(&bytes));
        Ok(())
    })
}

pub fn echo(_shell: &mut Shell, args: &[&str], out: &mut dyn Write) -> i32 {
    let _ = writeln!(out, "{}", args.join(" "));
    0
}

pub fn mkdir(shell: &mut Shell, args: &[&str], out: &mut dyn Write) -> i32 {
    each_path(shell, "mkdir", args, out, |shell, _, path, _| shell.kernel.vfs.mkdir(path))
}

pub fn rm(shell: &mut Shell, args: &[&str], out: &mut dyn Write) -> i32 {
    each_path(shell, "rm", args, out, |shell, _, path, _| shell.kernel.vfs.unlink(path))
}

pub fn touch(shell: &mut Shell, args: &[&str], out: &mut dyn Write) -> i32 {
    // Appending nothing creates a missing file and leaves an existing one alone.
    each_path(shell, "touch", args, out, |shell, _, path, _| {
        shell.kernel.vfs.write_all(path, &[], true)
    })
}

pub fn stat(shell: &mut Shell, args: &[&str], out: &mut dyn Write) -> i32 {
    each_path(shell, "stat", args, out, |shell, _, path, out| {
        let stat = shell.kernel.vfs.stat(path)?;
        let kind = match stat.file_type {
            FileType::File => "file",
            FileType::Directory => "directory",
        };
        let _ = writeln!(out, "{path}: {kind}, {} bytes", stat.size);
        Ok(())
    })
}
