//! The kernel shell: runs command lines against the VFS, the program loaders and
//! the scheduler.

pub mod builtins;
pub mod editor;
pub mod path;
pub mod redirect;
pub mod tokenize;

pub use editor::{Completion, EditorEvent, History, LineEditor};
pub use redirect::CaptureBuffer;
pub use tokenize::{Command, Connector, Redirect, RedirectMode, ShellError};

use crate::boot::Kernel;
use crate::consts::{DEFAULT_STACK_SIZE, SEARCH_DIRS, SOURCE_EXTENSION};
use crate::exec::{self, ExecOutcome};
use crate::fs::path::{PathBuf, split_last};
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt::Write;
use cupid_api_types::FsResult;
use cupid_api_types::input::KeyEvent;

/// Exit status of a command that could not be found.
pub const STATUS_NOT_FOUND: i32 = 127;
/// Exit status of a line that failed to parse.
pub const STATUS_SYNTAX: i32 = 2;

pub struct Shell {
    kernel: Kernel,
    cwd: PathBuf,
    last_status: i32,
    editor: LineEditor,
}

impl Shell {
    pub fn new(kernel: Kernel) -> Self {
        let mut cwd = PathBuf::new();
        let _ = cwd.push('/');
        Self { kernel, cwd, last_status: 0, editor: LineEditor::new() }
    }

    pub fn kernel(&self) -> &Kernel {
        &self.kernel
    }

    pub fn kernel_mut(&mut self) -> &mut Kernel {
        &mut self.kernel
    }

    pub fn into_kernel(self) -> Kernel {
        self.kernel
    }

    pub fn cwd(&self) -> &str {
        &self.cwd
    }

    pub fn last_status(&self) -> i32 {
        self.last_status
    }

    pub fn editor(&self) -> &LineEditor {
        &self.editor
    }

    pub fn prompt(&self) -> String {
        alloc::format!("{}$ ", self.cwd)
    }

    pub fn resolve_path(&self, input: &str) -> FsResult<PathBuf> {
        path::resolve_path(input, &self.cwd)
    }

    /// Changes the working directory. The target must exist and be a directory.
    pub fn set_cwd(&mut self, input: &str) -> FsResult<()> {
        let target = self.resolve_path(input)?;
        if !self.kernel.vfs.stat(&target)?.is_dir() {
            return Err(cupid_api_types::Errno::NotADirectory);
        }
        self.cwd = target;
        Ok(())
    }

    /// Runs one command line and returns the status of the last command that ran.
    pub fn run(&mut self, line: &str, out: &mut dyn Write) -> i32 {
        let pieces = match tokenize::split_chain(line) {
            Ok(pieces) => pieces,
            Err(e) => {
                let _ = writeln!(out, "shell: {e}");
                self.last_status = STATUS_SYNTAX;
                return self.last_status;
            }
        };
        for (connector, piece) in pieces {
            if connector == Connector::OnSuccess && self.last_status != 0 {
                continue;
            }
            self.last_status = match tokenize::parse_command(piece, self.last_status) {
                Ok(command) if command.argv.is_empty() && command.redirect.is_none() => continue,
                Ok(command) => self.execute(&command, out),
                Err(e) => {
                    let _ = writeln!(out, "shell: {e}");
                    STATUS_SYNTAX
                }
            };
        }
        self.last_status
    }

    /// Records `line` in the history and runs it. For callers that already have
    /// whole lines and bypass the line editor.
    pub fn submit(&mut self, line: &str, out: &mut dyn Write) -> i32 {
        self.editor.history_mut().push(line);
        self.run(line, out)
    }

    fn execute(&mut self, command: &Command, out: &mut dyn Write) -> i32 {
        let argv: Vec<&str> = command.argv.iter().map(|t| t.as_str()).collect();
        let Some(redirect) = &command.redirect else {
            return self.dispatch(&argv, out);
        };
        let target = match self.resolve_path(&redirect.target) {
            Ok(target) => target,
            Err(e) => {
                let _ = writeln!(out, "shell: {}: {e}", redirect.target);
                return 1;
            }
        };
        let mut capture = CaptureBuffer::new();
        let status = self.dispatch(&argv, &mut capture);
        if let Err(e) = capture.commit(&mut self.kernel.vfs, &target, redirect.mode) {
            let _ = writeln!(out, "shell: {target}: {e}");
            return 1;
        }
        status
    }

    fn dispatch(&mut self, argv: &[&str], out: &mut dyn Write) -> i32 {
        let Some((&name, args)) = argv.split_first() else {
            return 0;
        };
        if let Some(builtin) = builtins::find(name) {
            return builtin.run(self, args, out);
        }
        match self.locate(name) {
            Some(path) => self.run_file(&path, args, out),
            None if name.contains('/') => {
                let _ = writeln!(out, "{name}: no such file or directory");
                STATUS_NOT_FOUND
            }
            None => {
                let _ = writeln!(out, "{name}: command not found");
                STATUS_NOT_FOUND
            }
        }
    }

    fn is_file(&mut self, path: &str) -> bool {
        self.kernel.vfs.stat(path).is_ok_and(|stat| !stat.is_dir())
    }

    /// Finds the file a command name refers to. Names with a slash or a source
    /// extension are paths; other names are searched for in `SEARCH_DIRS`, bare and
    /// with the source extension.
    fn locate(&mut self, name: &str) -> Option<PathBuf> {
        if name.contains('/') || name.ends_with(SOURCE_EXTENSION) {
            let path = self.resolve_path(name).ok()?;
            return self.is_file(&path).then_some(path);
        }
        for dir in SEARCH_DIRS {
            for extension in ["", SOURCE_EXTENSION] {
                let mut candidate = PathBuf::new();
                if write!(candidate, "{dir}/{name}{extension}").is_err() {
                    continue;
                }
                if self.is_file(&candidate) {
                    return Some(candidate);
                }
            }
        }
        None
    }

    /// Runs an executable file: sources go to the compiler, anything else to the ELF
    /// loader.
    pub(crate) fn run_file(&mut self, path: &str, args: &[&str], out: &mut dyn Write) -> i32 {
        if path.ends_with(SOURCE_EXTENSION) {
            self.run_source(path, args, out)
        } else {
            self.run_elf(path, out)
        }
    }

    fn run_source(&mut self, path: &str, args: &[&str], out: &mut dyn Write) -> i32 {
        let Kernel { vfs, compiler, programs, .. } = &mut self.kernel;
        let Some(compiler) = compiler.as_mut() else {
            let _ = writeln!(out, "{path}: no compiler available");
            return 1;
        };
        let source = match vfs.read_all(path) {
            Ok(source) => source,
            Err(e) => {
                let _ = writeln!(out, "{path}: {e}");
                return 1;
            }
        };
        let Ok(source) = core::str::from_utf8(&source) else {
            let _ = writeln!(out, "{path}: not a text file");
            return 1;
        };
        let program = match compiler.compile(source) {
            Ok(program) => program,
            Err(e) => {
                let _ = writeln!(out, "{path}: {e}");
                return 1;
            }
        };
        if let Err(e) = programs.launch(file_name(path), &program) {
            let _ = writeln!(out, "{path}: {e}");
            return 1;
        }
        self.run_foreground(args, out)
    }

    /// Runs the foreground compiled program until it exits or minimises itself.
    pub(crate) fn run_foreground(&mut self, args: &[&str], out: &mut dyn Write) -> i32 {
        let Kernel { compiler, programs, .. } = &mut self.kernel;
        let Some(compiler) = compiler.as_mut() else {
            return 1;
        };
        match compiler.execute(programs.region_mut(), args, out) {
            ExecOutcome::Exited(code) => {
                programs.finish();
                code
            }
            ExecOutcome::Minimised => {
                if let Some(program) = programs.foreground() {
                    let _ = writeln!(out, "[{} minimised]", program.name);
                }
                0
            }
        }
    }

    fn run_elf(&mut self, path: &str, out: &mut dyn Write) -> i32 {
        let image = match exec::load_path(&mut self.kernel.vfs, path) {
            Ok(image) => image,
            Err(e) => {
                let _ = writeln!(out, "{path}: {e}");
                return 1;
            }
        };
        let scheduler = self.kernel.scheduler.clone();
        match scheduler.create_image(file_name(path), DEFAULT_STACK_SIZE, image) {
            Ok(pid) => {
                log::info!("shell: started {path} as pid {pid}");
                scheduler.run_until_idle();
                0
            }
            Err(e) => {
                let _ = writeln!(out, "{path}: {e}");
                1
            }
        }
    }

    /// Feeds one key to the line editor, running the line on Enter. Returns the
    /// status when a line ran.
    pub fn handle_key(&mut self, event: KeyEvent, out: &mut dyn Write) -> Option<i32> {
        match self.editor.handle(event, out) {
            EditorEvent::None => None,
            EditorEvent::Submit(line) => {
                let status = self.run(&line, out);
                let _ = out.write_str(&self.prompt());
                Some(status)
            }
            EditorEvent::Complete => {
                let candidates = self.completions();
                let prompt = self.prompt();
                self.editor.complete(&candidates, out, &prompt);
                None
            }
        }
    }

    /// Drains the keyboard queue through [`Shell::handle_key`]. Returns the number of
    /// events handled.
    pub fn pump_input(&mut self, out: &mut dyn Write) -> usize {
        let input = self.kernel.input.clone();
        let mut handled = 0;
        while let Some(event) = input.pop() {
            self.handle_key(event, out);
            handled += 1;
        }
        handled
    }

    /// Completion candidates for the word under the cursor.
    pub fn completions(&mut self) -> Vec<Completion> {
        let line = String::from(self.editor.line());
        let start = self.editor.word_start();
        let word = &line[start..];
        let head = line[..start].trim();
        let candidates = if head.is_empty() && !word.contains('/') {
            self.complete_command(word)
        } else {
            let command = head.split_whitespace().next().unwrap_or("");
            // Programs take paths; so do the built-ins that say so.
            if builtins::find(command).is_none_or(|b| b.takes_paths) {
                self.complete_path(word)
            } else {
                Vec::new()
            }
        };
        editor::normalise(candidates)
    }

    fn complete_command(&mut self, word: &str) -> Vec<Completion> {
        let mut candidates: Vec<Completion> = builtins::BUILTINS
            .iter()
            .filter(|b| b.name.starts_with(word))
            .map(|b| Completion { text: b.name.into(), display: b.name.into(), is_dir: false })
            .collect();
        if let Ok(entries) = self.kernel.vfs.list_dir("/bin") {
            for entry in entries.iter().filter(|e| !e.is_dir()) {
                let name = entry.name.strip_suffix(SOURCE_EXTENSION).unwrap_or(&entry.name);
                if name.starts_with(word) {
                    candidates.push(Completion { text: name.into(), display: name.into(), is_dir: false });
                }
            }
        }
        candidates
    }

    fn complete_path(&mut self, word: &str) -> Vec<Completion> {
        let (dir_part, partial) = match word.rfind('/') {
            Some(i) => word.split_at(i + 1),
            None => ("", word),
        };
        let Ok(dir) = self.resolve_path(if dir_part.is_empty() { "." } else { dir_part }) else {
            return Vec::new();
        };
        let Ok(entries) = self.kernel.vfs.list_dir(&dir) else {
            return Vec::new();
        };
        entries
            .iter()
            .filter(|e| e.name.starts_with(partial))
            .map(|e| {
                let mut text = String::from(dir_part);
                text.push_str(&e.name);
                if e.is_dir() {
                    text.push('/');
                }
                Completion { text, display: e.name.as_str().into(), is_dir: e.is_dir() }
            })
            .collect()
    }
}

fn file_name(path: &str) -> &str {
    split_last(path).map_or(path, |(_, name)| name)
}
