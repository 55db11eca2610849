//! What a panic report needs to know: where output goes, which process was running
//! and the last timer tick. All of it is IRQ-safe atomics.

use atomic_enum::atomic_enum;
use core::fmt;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

#[atomic_enum]
#[derive(PartialEq, Eq)]
pub enum OutputMode {
    Serial,
    Gui,
}

pub struct PanicContext {
    pid: AtomicU32,
    tick: AtomicU64,
    output: AtomicOutputMode,
}

pub static PANIC_CONTEXT: PanicContext = PanicContext::new();

impl PanicContext {
    pub const fn new() -> Self {
        Self {
            pid: AtomicU32::new(0),
            tick: AtomicU64::new(0),
            output: AtomicOutputMode::new(OutputMode::Serial),
        }
    }

    pub fn record_pid(&self, pid: u32) {
        self.pid.store(pid, Ordering::Relaxed);
    }

    pub fn record_tick(&self, tick: u64) {
        self.tick.store(tick, Ordering::Relaxed);
    }

    pub fn pid(&self) -> u32 {
        self.pid.load(Ordering::Relaxed)
    }

    pub fn tick(&self) -> u64 {
        self.tick.load(Ordering::Relaxed)
    }

    pub fn output_mode(&self) -> OutputMode {
        self.output.load(Ordering::Relaxed)
    }

    pub fn set_output_mode(&self, mode: OutputMode) {
        self.output.store(mode, Ordering::Relaxed);
    }

    pub fn report<'a>(&self, info: &'a core::panic::PanicInfo<'a>) -> PanicReport<'a> {
        PanicReport { info, pid: self.pid(), tick: self.tick() }
    }
}

impl Default for PanicContext {
    fn default() -> Self {
        Self::new()
    }
}

/// `KERNEL PANIC (pid N, tick T) at file:line: message`
pub struct PanicReport<'a> {
    info: &'a core::panic::PanicInfo<'a>,
    pid: u32,
    tick: u64,
}

impl fmt::Display for PanicReport<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KERNEL PANIC (pid {}, tick {})", self.pid, self.tick)?;
        if let Some(location) = self.info.location() {
            write!(f, " at {}:{}", location.file(), location.line())?;
        }
        write!(f, ": {}", self.info.message())
    }
}
