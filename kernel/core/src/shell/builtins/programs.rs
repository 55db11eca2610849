use super::{fail, usage};
use crate::consts::SOURCE_EXTENSION;
use crate::shell::Shell;
use crate::task::{Pid, ProcessState};
use core::fmt::Write;
use cupid_api_types::Errno;

pub fn exec(shell: &mut Shell, args: &[&str], out: &mut dyn Write) -> i32 {
    let Some((&program, rest)) = args.split_first() else {
        return usage(out, "exec");
    };
    let path = match shell.resolve_path(program) {
        Ok(path) => path,
        Err(e) => return fail(out, "exec", program, e),
    };
    match shell.kernel.vfs.stat(&path) {
        Ok(stat) if stat.is_dir() => fail(out, "exec", program, Errno::IsADirectory),
        Ok(_) => shell.run_file(&path, rest, out),
        Err(e) => fail(out, "exec", program, e),
    }
}

fn state_name(state: &ProcessState) -> &'static str {
    match state {
        ProcessState::Running => "running",
        ProcessState::Runnable => "runnable",
        ProcessState::Blocked => "blocked",
        ProcessState::Zombie => "zombie",
    }
}

pub fn ps(shell: &mut Shell, _args: &[&str], out: &mut dyn Write) -> i32 {
    let _ = writeln!(out, "  PID  STATE      NAME");
    for info in shell.kernel.scheduler.processes() {
        let killed = if info.kill_requested { " (killed)" } else { "" };
        let _ = writeln!(out, "{:>5}  {:<9}  {}{killed}", info.pid.0, state_name(&info.state), info.name.as_str());
    }
    let programs = &shell.kernel.programs;
    if let Some(program) = programs.foreground() {
        let _ = writeln!(out, "    %  {:<9}  {}", "minimised", program.name.as_str());
    }
    for program in programs.suspended().iter().rev() {
        let _ = writeln!(out, "    %  {:<9}  {}", "suspended", program.name());
    }
    0
}

/// `kill <pid>` stops a process; `kill %` stops the minimised program.
pub fn kill(shell: &mut Shell, args: &[&str], out: &mut dyn Write) -> i32 {
    let result = match args {
        ["%"] => shell.kernel.programs.kill_foreground(),
        [pid] => match pid.parse() {
            Ok(pid) => shell.kernel.scheduler.kill(Pid(pid)),
            Err(_) => Err(Errno::InvalidArgument),
        },
        _ => return usage(out, "kill"),
    };
    match result {
        Ok(()) => 0,
        Err(e) => fail(out, "kill", args[0], e),
    }
}

/// Compiles a source file into an ELF executable next to it (or at `output`).
pub fn cc(shell: &mut Shell, args: &[&str], out: &mut dyn Write) -> i32 {
    let (source_arg, output_arg) = match args {
        [source] => (*source, source.strip_suffix(SOURCE_EXTENSION).unwrap_or(*source)),
        [source, output] => (*source, *output),
        _ => return usage(out, "cc"),
    };
    if output_arg == source_arg {
        return fail(out, "cc", output_arg, Errno::AlreadyExists);
    }
    let (source_path, output_path) = match (shell.resolve_path(source_arg), shell.resolve_path(output_arg)) {
        (Ok(source), Ok(output)) => (source, output),
        (Err(e), _) => return fail(out, "cc", source_arg, e),
        (_, Err(e)) => return fail(out, "cc", output_arg, e),
    };
    let kernel = &mut shell.kernel;
    let Some(compiler) = kernel.compiler.as_mut() else {
        let _ = writeln!(out, "cc: no compiler available");
        return 1;
    };
    let source = match kernel.vfs.read_all(&source_path) {
        Ok(source) => source,
        Err(e) => return fail(out, "cc", source_arg, e),
    };
    let Ok(text) = core::str::from_utf8(&source) else {
        return fail(out, "cc", source_arg, Errno::InvalidArgument);
    };
    let program = match compiler.compile(text) {
        Ok(program) => program,
        Err(e) => return fail(out, "cc", source_arg, e),
    };
    let elf = match program.to_elf() {
        Ok(elf) => elf,
        Err(e) => return fail(out, "cc", source_arg, e),
    };
    if let Err(e) = kernel.vfs.write_all(&output_path, &elf, false) {
        return fail(out, "cc", output_arg, e);
    }
    log::info!("shell: compiled {source_path} to {output_path} ({} bytes)", elf.len());
    let _ = writeln!(out, "{output_path}: {} bytes", elf.len());
    0
}

/// Brings back the minimised program, or failing that the most recently suspended
/// one.
pub fn resume(shell: &mut Shell, _args: &[&str], out: &mut dyn Write) -> i32 {
    let killed = match shell.kernel.programs.resume() {
        Ok(program) => program.killed,
        Err(e) => {
            let _ = writeln!(out, "resume: {e}");
            return 1;
        }
    };
    if killed {
        if let Some(program) = shell.kernel.programs.finish() {
            let _ = writeln!(out, "[{} killed]", program.name);
        }
        return 1;
    }
    shell.run_foreground(&[], out)
}
