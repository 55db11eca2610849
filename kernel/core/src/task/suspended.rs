//! Foreground programs sharing the fixed JIT code/data region.
//!
//! Only one program owns the region at a time. Launching a program while another is
//! in the foreground moves the old one's code and data into a [`SuspendedProgram`]
//! on a bounded stack; `resume` moves the topmost entry back into the region.

use super::process::ProcessName;
use crate::consts::{JIT_CODE_SIZE, JIT_DATA_SIZE, SUSPEND_DEPTH};
use crate::exec::CompiledProgram;
use alloc::boxed::Box;
use alloc::vec;
use cupid_api_types::{Errno, FsResult};

/// The fixed-address region compiled programs run from.
pub struct ProgramRegion {
    code: Box<[u8]>,
    data: Box<[u8]>,
    code_len: usize,
    data_len: usize,
    entry_offset: u32,
}

impl Default for ProgramRegion {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgramRegion {
    pub fn new() -> Self {
        Self::with_capacity(JIT_CODE_SIZE, JIT_DATA_SIZE)
    }

    pub fn with_capacity(code: usize, data: usize) -> Self {
        Self {
            code: vec![0; code].into_boxed_slice(),
            data: vec![0; data].into_boxed_slice(),
            code_len: 0,
            data_len: 0,
            entry_offset: 0,
        }
    }

    fn fits(&self, program: &CompiledProgram) -> bool {
        program.code.len() <= self.code.len() && program.data.len() <= self.data.len()
    }

    /// Copies `program` into the region, replacing whatever was there.
    pub fn install(&mut self, program: &CompiledProgram) -> FsResult<()> {
        if !self.fits(program) {
            return Err(Errno::NoSpace);
        }
        if program.entry_offset as usize >= program.code.len() {
            return Err(Errno::InvalidArgument);
        }
        self.load(&program.code, &program.data, program.entry_offset);
        Ok(())
    }

    fn load(&mut self, code: &[u8], data: &[u8], entry_offset: u32) {
        self.code[..code.len()].copy_from_slice(code);
        self.code[code.len()..self.code_len.max(code.len())].fill(0);
        self.data[..data.len()].copy_from_slice(data);
        self.data[data.len()..self.data_len.max(data.len())].fill(0);
        self.code_len = code.len();
        self.data_len = data.len();
        self.entry_offset = entry_offset;
    }

    pub fn code(&self) -> &[u8] {
        &self.code[..self.code_len]
    }

    pub fn data(&self) -> &[u8] {
        &self.data[..self.data_len]
    }

    /// The program's data, writable while it runs.
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data[..self.data_len]
    }

    pub fn entry_offset(&self) -> u32 {
        self.entry_offset
    }

    fn snapshot(&self) -> SavedImage {
        SavedImage {
            code: self.code().into(),
            data: self.data().into(),
            entry_offset: self.entry_offset,
        }
    }

    fn restore(&mut self, image: SavedImage) {
        self.load(&image.code, &image.data, image.entry_offset);
    }
}

struct SavedImage {
    code: Box<[u8]>,
    data: Box<[u8]>,
    entry_offset: u32,
}

/// A program moved out of the region. Its saved image is reachable only by
/// restoring it.
pub struct SuspendedProgram {
    name: ProcessName,
    running: bool,
    killed: bool,
    image: SavedImage,
}

impl SuspendedProgram {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn running(&self) -> bool {
        self.running
    }

    pub fn killed(&self) -> bool {
        self.killed
    }

    pub fn code_len(&self) -> usize {
        self.image.code.len()
    }
}

#[derive(Default)]
pub struct SuspendedStack {
    entries: heapless::Vec<SuspendedProgram, SUSPEND_DEPTH>,
}

impl SuspendedStack {
    pub const fn new() -> Self {
        Self { entries: heapless::Vec::new() }
    }

    /// Hands `program` back when the stack is full.
    pub fn push(&mut self, program: SuspendedProgram) -> Result<(), SuspendedProgram> {
        self.entries.push(program)
    }

    pub fn pop(&mut self) -> Option<SuspendedProgram> {
        self.entries.pop()
    }

    pub fn top(&self) -> Option<&SuspendedProgram> {
        self.entries.last()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.is_full()
    }

    /// Bottom to top.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &SuspendedProgram> {
        self.entries.iter()
    }
}

/// The program currently owning the region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForegroundProgram {
    pub name: ProcessName,
    /// Still alive. A minimised program stays running.
    pub running: bool,
    pub killed: bool,
}

#[derive(Default)]
pub struct JitPrograms {
    region: ProgramRegion,
    foreground: Option<ForegroundProgram>,
    suspended: SuspendedStack,
}

impl JitPrograms {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_region(region: ProgramRegion) -> Self {
        Self { region, foreground: None, suspended: SuspendedStack::new() }
    }

    /// Installs `program` as the foreground program, suspending the current one.
    ///
    /// Fails without changing anything when the program does not fit or the suspended
    /// stack is full.
    pub fn launch(&mut self, name: &str, program: &CompiledProgram) -> FsResult<()> {
        let name = ProcessName::try_from(name).map_err(|_| Errno::InvalidArgument)?;
        if !self.region.fits(program) {
            return Err(Errno::NoSpace);
        }
        if program.entry_offset as usize >= program.code.len() {
            return Err(Errno::InvalidArgument);
        }
        if let Some(current) = self.foreground.take() {
            let entry = SuspendedProgram {
                name: current.name,
                running: current.running,
                killed: current.killed,
                image: self.region.snapshot(),
            };
            if let Err(entry) = self.suspended.push(entry) {
                log::warn!("exec: suspended stack full, cannot launch {name}");
                self.foreground = Some(ForegroundProgram {
                    name: entry.name,
                    running: entry.running,
                    killed: entry.killed,
                });
                return Err(Errno::NoSpace);
            }
            log::debug!("exec: {name} launched over a suspended program (depth {})", self.suspended.len());
        }
        self.region.install(program)?;
        self.foreground = Some(ForegroundProgram { name, running: true, killed: false });
        Ok(())
    }

    /// The foreground program has exited; the region is free.
    pub fn finish(&mut self) -> Option<ForegroundProgram> {
        self.foreground.take()
    }

    pub fn kill_foreground(&mut self) -> FsResult<()> {
        let foreground = self.foreground.as_mut().ok_or(Errno::NotFound)?;
        foreground.killed = true;
        Ok(())
    }

    /// Brings a program back to the foreground: the minimised foreground program if
    /// there is one, otherwise the topmost suspended program, whose image is restored
    /// into the region.
    pub fn resume(&mut self) -> FsResult<&ForegroundProgram> {
        if self.foreground.is_none() {
            let entry = self.suspended.pop().ok_or(Errno::NotFound)?;
            self.region.restore(entry.image);
            log::debug!("exec: resumed {} (depth {})", entry.name, self.suspended.len());
            self.foreground = Some(ForegroundProgram {
                name: entry.name,
                running: entry.running,
                killed: entry.killed,
            });
        }
        self.foreground.as_ref().ok_or(Errno::NotFound)
    }

    pub fn foreground(&self) -> Option<&ForegroundProgram> {
        self.foreground.as_ref()
    }

    pub fn suspended(&self) -> &SuspendedStack {
        &self.suspended
    }

    pub fn region(&self) -> &ProgramRegion {
        &self.region
    }

    pub fn region_mut(&mut self) -> &mut ProgramRegion {
        &mut self.region
    }
}
