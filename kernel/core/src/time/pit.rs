use crate::arch::PortIo;
use crate::consts::PIT_BASE_FREQUENCY;

const PIT_CH0: u16 = 0x40;
const PIT_CMD: u16 = 0x43;
/// Channel 0 | lobyte/hibyte | mode 3 (square wave) | binary
const PIT_MODE_SQUARE_WAVE: u8 = 0b0011_0110;

/// Reload value for `hz`; 0 stands for 65536, the slowest rate.
pub fn divisor(hz: u32) -> u16 {
    match PIT_BASE_FREQUENCY / hz.max(1) {
        0 | 1 => 1,
        d if d >= 0x1_0000 => 0,
        d => d as u16,
    }
}

/// Programs channel 0 to fire IRQ0 at roughly `hz`. Returns the divisor used.
pub fn program(ports: &mut impl PortIo, hz: u32) -> u16 {
    let divisor = divisor(hz);
    let [lo, hi] = divisor.to_le_bytes();
    unsafe {
        ports.write_u8(PIT_CMD, PIT_MODE_SQUARE_WAVE);
        ports.write_u8(PIT_CH0, lo);
        ports.write_u8(PIT_CH0, hi);
    }
    log::debug!("pit: channel 0 at {hz} Hz (divisor {divisor})");
    divisor
}
