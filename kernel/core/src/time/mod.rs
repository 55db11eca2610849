//! Tick counter advanced by the timer IRQ.
//!
//! Everything here is lock-free: `on_tick` runs in interrupt context and only touches
//! atomics.

pub mod pit;
pub mod rtc;

use crate::consts::DEFAULT_TIMER_HZ;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

#[derive(Debug)]
pub struct Timer {
    ticks: AtomicU64,
    hz: AtomicU32,
    reschedule_requested: AtomicBool,
}

impl Default for Timer {
    fn default() -> Self {
        Self::new(DEFAULT_TIMER_HZ)
    }
}

impl Timer {
    pub const fn new(hz: u32) -> Self {
        Self {
            ticks: AtomicU64::new(0),
            hz: AtomicU32::new(if hz == 0 { 1 } else { hz }),
            reschedule_requested: AtomicBool::new(false),
        }
    }

    /// Timer IRQ entry: advance the clock and ask the running process to yield.
    pub fn on_tick(&self) {
        let ticks = self.ticks.fetch_add(1, Ordering::Relaxed) + 1;
        self.reschedule_requested.store(true, Ordering::Release);
        crate::panic::PANIC_CONTEXT.record_tick(ticks);
    }

    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    pub fn hz(&self) -> u32 {
        self.hz.load(Ordering::Relaxed)
    }

    /// Changes the nominal tick rate; the caller reprograms the hardware.
    pub fn set_hz(&self, hz: u32) {
        self.hz.store(hz.max(1), Ordering::Relaxed);
    }

    pub fn uptime_ms(&self) -> u64 {
        self.ticks() * 1000 / u64::from(self.hz())
    }

    pub fn reschedule_requested(&self) -> bool {
        self.reschedule_requested.load(Ordering::Acquire)
    }

    /// Clears the reschedule flag, returning whether it was set.
    pub fn take_reschedule(&self) -> bool {
        self.reschedule_requested.swap(false, Ordering::AcqRel)
    }
}
