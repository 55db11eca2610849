//! CMOS real-time clock, the source of file-system timestamps on real hardware.

use crate::arch::PortIo;
use crate::fs::fat16::FatTimestamp;

const CMOS_INDEX: u16 = 0x70;
const CMOS_DATA: u16 = 0x71;

const REG_SECONDS: u8 = 0x00;
const REG_MINUTES: u8 = 0x02;
const REG_HOURS: u8 = 0x04;
const REG_DAY: u8 = 0x07;
const REG_MONTH: u8 = 0x08;
const REG_YEAR: u8 = 0x09;
const REG_STATUS_A: u8 = 0x0A;
const REG_STATUS_B: u8 = 0x0B;

const UPDATE_IN_PROGRESS: u8 = 0x80;
const STATUS_B_BINARY: u8 = 0x04;
const STATUS_B_24_HOUR: u8 = 0x02;
const HOUR_PM: u8 = 0x80;

fn read_register(ports: &mut impl PortIo, register: u8) -> u8 {
    unsafe {
        ports.write_u8(CMOS_INDEX, register);
        ports.read_u8(CMOS_DATA)
    }
}

fn from_bcd(value: u8) -> u8 {
    (value & 0x0F) + (value >> 4) * 10
}

#[derive(Clone, Copy, PartialEq, Eq)]
struct Raw([u8; 6]);

fn read_raw(ports: &mut impl PortIo) -> Raw {
    // Bounded: a stuck update flag must not hang the caller.
    for _ in 0..10_000 {
        if read_register(ports, REG_STATUS_A) & UPDATE_IN_PROGRESS == 0 {
            break;
        }
        core::hint::spin_loop();
    }
    Raw([REG_SECONDS, REG_MINUTES, REG_HOURS, REG_DAY, REG_MONTH, REG_YEAR].map(|r| read_register(ports, r)))
}

/// Reads the current date and time, re-reading until two samples agree.
pub fn read_datetime(ports: &mut impl PortIo) -> FatTimestamp {
    let mut raw = read_raw(ports);
    for _ in 0..4 {
        let again = read_raw(ports);
        if again == raw {
            break;
        }
        raw = again;
    }
    let status_b = read_register(ports, REG_STATUS_B);
    let [mut second, mut minute, hour_raw, mut day, mut month, mut year] = raw.0;
    let pm = hour_raw & HOUR_PM != 0;
    let mut hour = hour_raw & !HOUR_PM;

    if status_b & STATUS_B_BINARY == 0 {
        second = from_bcd(second);
        minute = from_bcd(minute);
        hour = from_bcd(hour);
        day = from_bcd(day);
        month = from_bcd(month);
        year = from_bcd(year);
    }
    if status_b & STATUS_B_24_HOUR == 0 {
        hour %= 12;
        if pm {
            hour += 12;
        }
    }

    FatTimestamp {
        year: 2000 + u16::from(year),
        month,
        day,
        hour,
        minute,
        second,
    }
}

/// File-system clock backed by the CMOS RTC.
#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
pub fn rtc_clock() -> FatTimestamp {
    read_datetime(&mut crate::arch::X86Ports)
}
