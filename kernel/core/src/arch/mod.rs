pub mod context;
pub mod interrupts;
pub mod port;

pub use port::PortIo;
#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
pub use port::X86Ports;

/// Parks the CPU until the next interrupt.
pub fn wait_for_interrupt() {
    #[cfg(target_os = "none")]
    unsafe {
        x86::irq::enable();
        x86::halt();
    }
    #[cfg(not(target_os = "none"))]
    core::hint::spin_loop();
}

pub fn hlt_loop() -> ! {
    loop {
        #[cfg(target_os = "none")]
        unsafe {
            x86::irq::disable();
            x86::halt();
        }
        #[cfg(not(target_os = "none"))]
        core::hint::spin_loop();
    }
}
