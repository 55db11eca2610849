//! Built-in commands, grouped by what they touch.

mod files;
mod programs;
mod system;

use super::Shell;
use core::fmt::{Display, Write};

pub type CommandFn = fn(&mut Shell, &[&str], &mut dyn Write) -> i32;

pub struct Builtin {
    pub name: &'static str,
    pub usage: &'static str,
    /// Arguments are paths, so tab completion offers directory entries.
    pub takes_paths: bool,
    handler: CommandFn,
}

impl Builtin {
    const fn new(name: &'static str, usage: &'static str, takes_paths: bool, handler: CommandFn) -> Self {
        Self { name, usage, takes_paths, handler }
    }

    pub fn run(&self, shell: &mut Shell, args: &[&str], out: &mut dyn Write) -> i32 {
        (self.handler)(shell, args, out)
    }
}

pub static BUILTINS: [Builtin; 20] = [
    Builtin::new("help", "help", false, system::help),
    Builtin::new("ls", "ls [path...]", true, files::ls),
    Builtin::new("cd", "cd [dir]", true, files::cd),
    Builtin::new("pwd", "pwd", false, files::pwd),
    Builtin::new("cat", "cat path...", true, files::cat),
    Builtin::new("echo", "echo [text...]", false, files::echo),
    Builtin::new("mkdir", "mkdir dir...", true, files::mkdir),
    Builtin::new("rm", "rm path...", true, files::rm),
    Builtin::new("touch", "touch path...", true, files::touch),
    Builtin::new("stat", "stat path...", true, files::stat),
    Builtin::new("sync", "sync", false, system::sync),
    Builtin::new("mount", "mount [device dir]", true, system::mount),
    Builtin::new("umount", "umount dir", true, system::umount),
    Builtin::new("history", "history", false, system::history),
    Builtin::new("exec", "exec path [args...]", true, programs::exec),
    Builtin::new("ps", "ps", false, programs::ps),
    Builtin::new("kill", "kill pid | kill %", false, programs::kill),
    Builtin::new("cc", "cc source.cc [output]", true, programs::cc),
    Builtin::new("resume", "resume", false, programs::resume),
    Builtin::new("uptime", "uptime", false, system::uptime),
];

pub fn find(name: &str) -> Option<&'static Builtin> {
    BUILTINS.iter().find(|b| b.name == name)
}

/// Prints `command: subject: error` and returns the failure status.
fn fail(out: &mut dyn Write, command: &str, subject: &str, error: impl Display) -> i32 {
    let _ = writeln!(out, "{command}: {subject}: {error}");
    1
}

fn usage(out: &mut dyn Write, command: &str) -> i32 {
    let usage = find(command).map_or(command, |b| b.usage);
    let _ = writeln!(out, "usage: {usage}");
    1
}
