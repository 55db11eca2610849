//! x86 port I/O behind a trait so drivers can run against simulated hardware.

pub trait PortIo: Send {
    /// # Safety
    /// Reading a port can have device side effects.
    unsafe fn read_u8(&mut self, port: u16) -> u8;
    /// # Safety
    /// Writing a port can have arbitrary device side effects.
    unsafe fn write_u8(&mut self, port: u16, value: u8);
    /// # Safety
    /// See [`PortIo::read_u8`].
    unsafe fn read_u16(&mut self, port: u16) -> u16;
    /// # Safety
    /// See [`PortIo::write_u8`].
    unsafe fn write_u16(&mut self, port: u16, value: u16);
}

/// The real I/O port space.
#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
#[derive(Debug, Default, Clone, Copy)]
pub struct X86Ports;

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
impl PortIo for X86Ports {
    unsafe fn read_u8(&mut self, port: u16) -> u8 {
        unsafe { x86::io::inb(port) }
    }

    unsafe fn write_u8(&mut self, port: u16, value: u8) {
        unsafe { x86::io::outb(port, value) }
    }

    unsafe fn read_u16(&mut self, port: u16) -> u16 {
        unsafe { x86::io::inw(port) }
    }

    unsafe fn write_u16(&mut self, port: u16, value: u16) {
        unsafe { x86::io::outw(port, value) }
    }
}
