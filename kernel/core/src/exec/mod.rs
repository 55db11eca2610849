//! Program images: ELF32 loading and writing, and the source-compiler seam used by
//! the shell's `.cc` programs.

pub mod compiler;
pub mod image;
pub mod loader;
pub mod writer;

pub use compiler::{CompileError, CompiledProgram, ExecOutcome, SourceCompiler};
pub use image::{ElfSegmentFlags, ProgramImage, Segment};
pub use loader::{ElfError, load, load_path};
pub use writer::write;
