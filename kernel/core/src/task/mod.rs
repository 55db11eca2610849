//! Processes, the cooperative scheduler, and the foreground programs that share the
//! JIT region.

pub mod process;
pub mod scheduler;
pub mod suspended;

pub use process::{Pid, ProcessInfo, ProcessState, SpawnError};
pub use scheduler::{ProcessBody, ProcessContext, Scheduler};
pub use suspended::{ForegroundProgram, JitPrograms, ProgramRegion, SuspendedProgram, SuspendedStack};
