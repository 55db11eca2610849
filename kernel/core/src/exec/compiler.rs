//! Seam for the just-in-time compiler that turns `.cc` sources into programs.
//!
//! The compiler itself lives outside the core; the kernel only places its output in
//! the fixed program region and asks it to run.

use super::loader::ElfError;
use super::writer;
use crate::task::ProgramRegion;
use alloc::vec::Vec;
use core::fmt;
use heapless::String;

/// Machine code and initial data produced by a compiler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledProgram {
    pub code: Vec<u8>,
    pub data: Vec<u8>,
    /// Offset of the first instruction within `code`.
    pub entry_offset: u32,
}

impl CompiledProgram {
    /// Serialises the program as an ELF32 executable.
    pub fn to_elf(&self) -> Result<Vec<u8>, ElfError> {
        writer::write(&self.code, &self.data, self.entry_offset)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileError {
    pub line: u32,
    pub message: String<64>,
}

impl CompileError {
    /// `message` is cut at 64 bytes.
    pub fn new(line: u32, message: &str) -> Self {
        let mut out = String::new();
        for c in message.chars() {
            if out.push(c).is_err() {
                break;
            }
        }
        Self { line, message: out }
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}: {}", self.line, self.message)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecOutcome {
    Exited(i32),
    /// The program was sent to the background and can be resumed later.
    Minimised,
}

pub trait SourceCompiler: Send {
    fn compile(&mut self, source: &str) -> Result<CompiledProgram, CompileError>;

    /// Runs (or continues) the program currently installed in `region`.
    fn execute(&mut self, region: &mut ProgramRegion, args: &[&str], out: &mut dyn fmt::Write) -> ExecOutcome;
}
