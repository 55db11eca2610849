use crate::consts::{MAX_PROCESS_NAME, STACK_CANARY};
use crate::exec::ProgramImage;
use alloc::boxed::Box;
use alloc::sync::Arc;
use atomic_enum::atomic_enum;
use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};
use cupid_api_types::Errno;
use heapless::String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pid(pub u32);

impl Pid {
    /// The boot context, which becomes the shell. Never killed.
    pub const INIT: Pid = Pid(1);
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[atomic_enum]
#[derive(PartialEq, Eq)]
pub enum ProcessState {
    Running,
    Runnable,
    Blocked,
    Zombie,
}

pub type ProcessName = String<MAX_PROCESS_NAME>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnError {
    TableFull,
    OutOfMemory,
    BadStackSize,
    NameTooLong,
}

impl fmt::Display for SpawnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SpawnError::TableFull => "process table full",
            SpawnError::OutOfMemory => "out of memory for process stack",
            SpawnError::BadStackSize => "stack size too small",
            SpawnError::NameTooLong => "process name too long",
        })
    }
}

impl From<SpawnError> for Errno {
    fn from(value: SpawnError) -> Self {
        match value {
            SpawnError::TableFull | SpawnError::OutOfMemory => Errno::NoSpace,
            SpawnError::BadStackSize | SpawnError::NameTooLong => Errno::InvalidArgument,
        }
    }
}

/// Snapshot of a process for `ps`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: Pid,
    pub name: ProcessName,
    pub state: ProcessState,
    pub kill_requested: bool,
    /// Times the process has been switched to.
    pub switches: u64,
    /// Entry point, for processes created from a program image.
    pub entry: Option<u32>,
}

/// A kernel stack with a canary word at its lowest address.
pub(crate) struct ProcessStack {
    memory: Box<[u8]>,
}

impl ProcessStack {
    pub(crate) fn new(size: usize) -> Result<Self, SpawnError> {
        let mut memory = alloc::vec::Vec::new();
        memory.try_reserve_exact(size).map_err(|_| SpawnError::OutOfMemory)?;
        memory.resize(size, 0);
        memory[..8].copy_from_slice(&STACK_CANARY.to_ne_bytes());
        Ok(Self { memory: memory.into_boxed_slice() })
    }

    pub(crate) fn memory_mut(&mut self) -> &mut [u8] {
        &mut self.memory
    }

    pub(crate) fn canary_intact(&self) -> bool {
        self.memory[..8] == STACK_CANARY.to_ne_bytes()
    }

    #[cfg(test)]
    pub(crate) fn smash(&mut self) {
        self.memory[0] ^= 0xFF;
    }
}

pub(crate) struct Process {
    pub(crate) pid: Pid,
    pub(crate) name: ProcessName,
    pub(crate) state: AtomicProcessState,
    pub(crate) kill_requested: AtomicBool,
    /// `None` for the boot context, which runs on the boot stack.
    pub(crate) stack: Option<ProcessStack>,
    pub(crate) saved_sp: usize,
    pub(crate) switches: u64,
    pub(crate) image: Option<Arc<ProgramImage>>,
}

impl Process {
    pub(crate) fn state(&self) -> ProcessState {
        self.state.load(Ordering::Relaxed)
    }

    pub(crate) fn set_state(&self, state: ProcessState) {
        self.state.store(state, Ordering::Relaxed);
    }

    pub(crate) fn is_schedulable(&self) -> bool {
        matches!(self.state(), ProcessState::Running | ProcessState::Runnable)
    }

    pub(crate) fn info(&self) -> ProcessInfo {
        ProcessInfo {
            pid: self.pid,
            name: self.name.clone(),
            state: self.state(),
            kill_requested: self.kill_requested.load(Ordering::Relaxed),
            switches: self.switches,
            entry: self.image.as_ref().map(|image| image.entry()),
        }
    }
}
