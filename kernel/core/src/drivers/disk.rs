//! ATA PIO driver for the primary IDE channel, LBA28.
//!
//! No IRQs are used; every operation polls BSY/DRQ with a bounded number of status
//! reads, so a missing or wedged drive surfaces as [`BlockError::Timeout`].

use crate::arch::PortIo;
use crate::block::{BlockDriver, BlockError};
use crate::consts::{ATA_MAX_SECTORS_PER_COMMAND, ATA_POLL_LIMIT, ATA_PRIMARY_CONTROL, ATA_PRIMARY_IO, BLOCK_SIZE};
use alloc::vec::Vec;
use heapless::String;

// Register offsets from the I/O base
const DATA: u16 = 0;
const SECTOR_COUNT: u16 = 2;
const LBA_LO: u16 = 3;
const LBA_MID: u16 = 4;
const LBA_HI: u16 = 5;
const DRIVE_HEAD: u16 = 6;
const STATUS_CMD: u16 = 7; // write = command, read = status

// Status bits
const BSY: u8 = 0x80;
const DRQ: u8 = 0x08;
const ERR: u8 = 0x01;

// ATA commands
const CMD_IDENTIFY: u8 = 0xEC;
const CMD_READ_SECTORS: u8 = 0x20;
const CMD_WRITE_SECTORS: u8 = 0x30;
const CMD_CACHE_FLUSH: u8 = 0xE7;

const LBA28_LIMIT: u64 = 1 << 28;
const WORDS_PER_SECTOR: usize = BLOCK_SIZE / 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DriveSelect {
    Master,
    Slave,
}

impl DriveSelect {
    const fn bit(self) -> u8 {
        match self {
            DriveSelect::Master => 0,
            DriveSelect::Slave => 1 << 4,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            DriveSelect::Master => "ata0",
            DriveSelect::Slave => "ata1",
        }
    }
}

/// One ATA drive on the primary channel.
pub struct AtaDisk<P: PortIo> {
    ports: P,
    drive: DriveSelect,
    sectors: u64,
    model: String<40>,
}

impl<P: PortIo> AtaDisk<P> {
    /// Runs IDENTIFY DEVICE. Fails with `NoDevice` when nothing (or a non-ATA device)
    /// answers on `drive`.
    pub fn identify(mut ports: P, drive: DriveSelect) -> Result<Self, BlockError> {
        let words = unsafe {
            ports.write_u8(ATA_PRIMARY_IO + DRIVE_HEAD, 0xA0 | drive.bit());
            io_delay(&mut ports);
            ports.write_u8(ATA_PRIMARY_IO + SECTOR_COUNT, 0);
            ports.write_u8(ATA_PRIMARY_IO + LBA_LO, 0);
            ports.write_u8(ATA_PRIMARY_IO + LBA_MID, 0);
            ports.write_u8(ATA_PRIMARY_IO + LBA_HI, 0);
            ports.write_u8(ATA_PRIMARY_IO + STATUS_CMD, CMD_IDENTIFY);
            io_delay(&mut ports);

            if ports.read_u8(ATA_PRIMARY_IO + STATUS_CMD) == 0 {
                log::info!("ata: no drive on {}", drive.name());
                return Err(BlockError::NoDevice);
            }
            wait_not_busy(&mut ports)?;
            // ATAPI and SATA bridges leave a signature in the LBA registers
            if ports.read_u8(ATA_PRIMARY_IO + LBA_MID) != 0 || ports.read_u8(ATA_PRIMARY_IO + LBA_HI) != 0 {
                log::warn!("ata: {} is not a plain ATA drive", drive.name());
                return Err(BlockError::NoDevice);
            }
            wait_drq(&mut ports).map_err(|e| match e {
                BlockError::Io => BlockError::NoDevice,
                e => e,
            })?;

            let mut words = [0u16; WORDS_PER_SECTOR];
            for w in words.iter_mut() {
                *w = ports.read_u16(ATA_PRIMARY_IO + DATA);
            }
            words
        };

        // Words 60-61: 28-bit LBA sector count
        let sectors = (u64::from(words[61]) << 16) | u64::from(words[60]);
        if sectors == 0 {
            log::warn!("ata: {} does not support LBA28", drive.name());
            return Err(BlockError::NoDevice);
        }
        let model = parse_model(&words[27..47]);
        log::info!(
            "ata: {} \"{}\", {} sectors ({} MB)",
            drive.name(),
            model,
            sectors,
            sectors / 2048
        );
        Ok(Self { ports, drive, sectors, model })
    }

    pub fn drive(&self) -> DriveSelect {
        self.drive
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Read `count` sectors starting at `lba` into `buf`.
    pub fn read_sectors(&mut self, lba: u64, count: usize, buf: &mut [u8]) -> Result<(), BlockError> {
        self.check(lba, count, buf.len())?;
        for (chunk_idx, chunk) in buf[..count * BLOCK_SIZE]
            .chunks_mut(ATA_MAX_SECTORS_PER_COMMAND * BLOCK_SIZE)
            .enumerate()
        {
            let chunk_lba = lba + (chunk_idx * ATA_MAX_SECTORS_PER_COMMAND) as u64;
            let n = chunk.len() / BLOCK_SIZE;
            unsafe {
                self.issue(chunk_lba, n, CMD_READ_SECTORS)?;
                for sector in chunk.chunks_exact_mut(BLOCK_SIZE) {
                    wait_drq(&mut self.ports)?;
                    for pair in sector.chunks_exact_mut(2) {
                        let word = self.ports.read_u16(ATA_PRIMARY_IO + DATA);
                        pair.copy_from_slice(&word.to_le_bytes());
                    }
                }
            }
        }
        Ok(())
    }

    /// Write `count` sectors starting at `lba` from `buf`, then flush the drive cache.
    pub fn write_sectors(&mut self, lba: u64, count: usize, buf: &[u8]) -> Result<(), BlockError> {
        self.check(lba, count, buf.len())?;
        for (chunk_idx, chunk) in buf[..count * BLOCK_SIZE]
            .chunks(ATA_MAX_SECTORS_PER_COMMAND * BLOCK_SIZE)
            .enumerate()
        {
            let chunk_lba = lba + (chunk_idx * ATA_MAX_SECTORS_PER_COMMAND) as u64;
            let n = chunk.len() / BLOCK_SIZE;
            unsafe {
                self.issue(chunk_lba, n, CMD_WRITE_SECTORS)?;
                for sector in chunk.chunks_exact(BLOCK_SIZE) {
                    wait_drq(&mut self.ports)?;
                    for pair in sector.chunks_exact(2) {
                        self.ports
                            .write_u16(ATA_PRIMARY_IO + DATA, u16::from_le_bytes([pair[0], pair[1]]));
                    }
                }
                self.ports.write_u8(ATA_PRIMARY_IO + STATUS_CMD, CMD_CACHE_FLUSH);
                let status = wait_not_busy(&mut self.ports)?;
                if status & ERR != 0 {
                    return Err(BlockError::Io);
                }
            }
        }
        Ok(())
    }

    fn check(&self, lba: u64, count: usize, buf_len: usize) -> Result<(), BlockError> {
        let end = lba.checked_add(count as u64).ok_or(BlockError::OutOfRange)?;
        if count == 0 || end > self.sectors || end > LBA28_LIMIT {
            return Err(BlockError::OutOfRange);
        }
        if buf_len < count * BLOCK_SIZE {
            return Err(BlockError::BufferTooSmall);
        }
        Ok(())
    }

    /// Selects the drive, programs the LBA28 address and issues `command`.
    unsafe fn issue(&mut self, lba: u64, count: usize, command: u8) -> Result<(), BlockError> {
        let ports = &mut self.ports;
        unsafe {
            ports.write_u8(
                ATA_PRIMARY_IO + DRIVE_HEAD,
                0xE0 | self.drive.bit() | ((lba >> 24) & 0x0F) as u8,
            );
            io_delay(ports);
            wait_not_busy(ports)?;

            // A count of 0 means 256 sectors.
            ports.write_u8(ATA_PRIMARY_IO + SECTOR_COUNT, (count % 256) as u8);
            ports.write_u8(ATA_PRIMARY_IO + LBA_LO, (lba & 0xFF) as u8);
            ports.write_u8(ATA_PRIMARY_IO + LBA_MID, ((lba >> 8) & 0xFF) as u8);
            ports.write_u8(ATA_PRIMARY_IO + LBA_HI, ((lba >> 16) & 0xFF) as u8);
            ports.write_u8(ATA_PRIMARY_IO + STATUS_CMD, command);
        }
        Ok(())
    }
}

impl<P: PortIo> BlockDriver for AtaDisk<P> {
    fn sector_count(&self) -> u64 {
        self.sectors
    }

    fn read(&mut self, lba: u64, count: usize, buf: &mut [u8]) -> Result<(), BlockError> {
        self.read_sectors(lba, count, buf)
    }

    fn write(&mut self, lba: u64, count: usize, buf: &[u8]) -> Result<(), BlockError> {
        self.write_sectors(lba, count, buf)
    }
}

/// Identifies the master and slave drives of the primary channel.
pub fn probe<P: PortIo + Clone>(ports: P) -> Vec<AtaDisk<P>> {
    [DriveSelect::Master, DriveSelect::Slave]
        .into_iter()
        .filter_map(|drive| AtaDisk::identify(ports.clone(), drive).ok())
        .collect()
}

/// Read the alternate status 4 times (~400 ns).
unsafe fn io_delay<P: PortIo>(ports: &mut P) {
    for _ in 0..4 {
        unsafe {
            let _ = ports.read_u8(ATA_PRIMARY_CONTROL);
        }
    }
}

/// Poll until BSY clears and return the status byte.
unsafe fn wait_not_busy<P: PortIo>(ports: &mut P) -> Result<u8, BlockError> {
    for _ in 0..ATA_POLL_LIMIT {
        let status = unsafe { ports.read_u8(ATA_PRIMARY_IO + STATUS_CMD) };
        if status & BSY == 0 {
            return Ok(status);
        }
        core::hint::spin_loop();
    }
    log::warn!("ata: timed out waiting for BSY to clear");
    Err(BlockError::Timeout)
}

/// Poll until the drive asks for a data transfer.
unsafe fn wait_drq<P: PortIo>(ports: &mut P) -> Result<(), BlockError> {
    for _ in 0..ATA_POLL_LIMIT {
        let status = unsafe { ports.read_u8(ATA_PRIMARY_IO + STATUS_CMD) };
        if status & BSY == 0 {
            if status & ERR != 0 {
                return Err(BlockError::Io);
            }
            if status & DRQ != 0 {
                return Ok(());
            }
        }
        core::hint::spin_loop();
    }
    log::warn!("ata: timed out waiting for DRQ");
    Err(BlockError::Timeout)
}

/// IDENTIFY strings store two characters per word, high byte first.
fn parse_model(words: &[u16]) -> String<40> {
    let mut model = String::new();
    for &w in words {
        for b in w.to_be_bytes() {
            let _ = model.push(if b.is_ascii_graphic() { b as char } else { ' ' });
        }
    }
    while model.ends_with(' ') {
        model.pop();
    }
    model
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::collections::VecDeque;
    use alloc::sync::Arc;
    use alloc::vec;
    use std::vec::Vec;

    #[derive(Default)]
    enum Phase {
        #[default]
        Idle,
        DataIn(VecDeque<u16>),
        DataOut { lba: usize, words: Vec<u16>, expected: usize },
        Error,
    }

    /// Register-level model of an IDE channel with up to two drives.
    #[derive(Default)]
    struct Controller {
        disks: [Option<Vec<u8>>; 2],
        selected: usize,
        sector_count: u8,
        lba: [u8; 3],
        drive_head: u8,
        phase: Phase,
        stuck_busy: bool,
        alt_status_reads: usize,
        flushes: usize,
    }

    impl Controller {
        fn status(&self) -> u8 {
            if self.disks[self.selected].is_none() {
                return 0;
            }
            if self.stuck_busy {
                return BSY;
            }
            match self.phase {
                Phase::Idle => 0x40,
                Phase::DataIn(_) | Phase::DataOut { .. } => 0x40 | DRQ,
                Phase::Error => 0x40 | ERR,
            }
        }

        fn lba28(&self) -> usize {
            (usize::from(self.drive_head & 0x0F) << 24)
                | (usize::from(self.lba[2]) << 16)
                | (usize::from(self.lba[1]) << 8)
                | usize::from(self.lba[0])
        }

        fn count(&self) -> usize {
            if self.sector_count == 0 { 256 } else { usize::from(self.sector_count) }
        }

        fn command(&mut self, cmd: u8) {
            let Some(disk) = self.disks[self.selected].as_ref() else {
                return;
            };
            let (lba, count) = (self.lba28(), self.count());
            let in_range = (lba + count) * BLOCK_SIZE <= disk.len();
            self.phase = match cmd {
                CMD_IDENTIFY => {
                    let mut words = vec![0u16; WORDS_PER_SECTOR];
                    let sectors = disk.len() / BLOCK_SIZE;
                    words[60] = sectors as u16;
                    words[61] = (sectors >> 16) as u16;
                    for (i, pair) in b"SIMULATED DISK  ".chunks(2).enumerate() {
                        words[27 + i] = u16::from_be_bytes([pair[0], pair[1]]);
                    }
                    Phase::DataIn(words.into())
                }
                CMD_READ_SECTORS if in_range => {
                    let bytes = &disk[lba * BLOCK_SIZE..(lba + count) * BLOCK_SIZE];
                    Phase::DataIn(bytes.chunks(2).map(|p| u16::from_le_bytes([p[0], p[1]])).collect())
                }
                CMD_WRITE_SECTORS if in_range => {
                    Phase::DataOut { lba, words: Vec::new(), expected: count * WORDS_PER_SECTOR }
                }
                CMD_CACHE_FLUSH => {
                    self.flushes += 1;
                    Phase::Idle
                }
                _ => Phase::Error,
            };
        }
    }

    #[derive(Clone, Default)]
    struct SimPorts(Arc<spin::Mutex<Controller>>);

    impl PortIo for SimPorts {
        unsafe fn read_u8(&mut self, port: u16) -> u8 {
            let mut c = self.0.lock();
            match port {
                ATA_PRIMARY_CONTROL => {
                    c.alt_status_reads += 1;
                    c.status()
                }
                p if p == ATA_PRIMARY_IO + STATUS_CMD => c.status(),
                _ => 0,
            }
        }

        unsafe fn write_u8(&mut self, port: u16, value: u8) {
            let mut c = self.0.lock();
            match port - ATA_PRIMARY_IO {
                SECTOR_COUNT => c.sector_count = value,
                LBA_LO => c.lba[0] = value,
                LBA_MID => c.lba[1] = value,
                LBA_HI => c.lba[2] = value,
                DRIVE_HEAD => {
                    c.drive_head = value;
                    c.selected = usize::from(value & 0x10 != 0);
                }
                STATUS_CMD => c.command(value),
                _ => {}
            }
        }

        unsafe fn read_u16(&mut self, _port: u16) -> u16 {
            let mut c = self.0.lock();
            let Phase::DataIn(words) = &mut c.phase else {
                return 0;
            };
            let word = words.pop_front().unwrap_or(0);
            if words.is_empty() {
                c.phase = Phase::Idle;
            }
            word
        }

        unsafe fn write_u16(&mut self, _port: u16, value: u16) {
            let mut c = self.0.lock();
            let selected = c.selected;
            let Phase::DataOut { lba, words, expected } = &mut c.phase else {
                return;
            };
            words.push(value);
            if words.len() == *expected {
                let (lba, words) = (*lba, core::mem::take(words));
                let disk = c.disks[selected].as_mut().unwrap();
                for (i, w) in words.iter().enumerate() {
                    let at = lba * BLOCK_SIZE + i * 2;
                    disk[at..at + 2].copy_from_slice(&w.to_le_bytes());
                }
                c.phase = Phase::Idle;
            }
        }
    }

    fn channel(master_sectors: usize) -> SimPorts {
        let ports = SimPorts::default();
        ports.0.lock().disks[0] = Some(vec![0u8; master_sectors * BLOCK_SIZE]);
        ports
    }

    #[test]
    fn identify_reports_size_and_model() {
        let ports = channel(2048);
        let disk = AtaDisk::identify(ports.clone(), DriveSelect::Master).unwrap();
        assert_eq!(disk.sector_count(), 2048);
        assert_eq!(disk.model(), "SIMULATED DISK");
        // IDENTIFY waits ~400 ns after selecting and after the command
        assert!(ports.0.lock().alt_status_reads >= 8);
    }

    #[test]
    fn missing_drive_is_not_identified() {
        let ports = channel(16);
        assert_eq!(
            AtaDisk::identify(ports, DriveSelect::Slave).err(),
            Some(BlockError::NoDevice)
        );
    }

    #[test]
    fn probe_finds_only_present_drives() {
        let ports = channel(16);
        let found = probe(ports);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].drive(), DriveSelect::Master);
    }

    #[test]
    fn write_then_read_round_trips_through_the_controller() {
        let ports = channel(64);
        let mut disk = AtaDisk::identify(ports.clone(), DriveSelect::Master).unwrap();
        let data: Vec<u8> = (0..3 * BLOCK_SIZE).map(|i| (i % 251) as u8).collect();
        disk.write_sectors(10, 3, &data).unwrap();
        assert_eq!(ports.0.lock().flushes, 1);

        let mut back = vec![0u8; 3 * BLOCK_SIZE];
        disk.read_sectors(10, 3, &mut back).unwrap();
        assert_eq!(back, data);

        let raw = ports.0.lock().disks[0].clone().unwrap();
        assert_eq!(&raw[10 * BLOCK_SIZE..13 * BLOCK_SIZE], &data[..]);
    }

    #[test]
    fn large_transfers_are_split_into_256_sector_commands() {
        let ports = channel(600);
        let mut disk = AtaDisk::identify(ports.clone(), DriveSelect::Master).unwrap();
        let data = vec![0x5Au8; 300 * BLOCK_SIZE];
        disk.write_sectors(0, 300, &data).unwrap();
        assert_eq!(ports.0.lock().flushes, 2);
        let mut back = vec![0u8; 300 * BLOCK_SIZE];
        disk.read_sectors(0, 300, &mut back).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn busy_drive_times_out() {
        let ports = channel(16);
        let mut disk = AtaDisk::identify(ports.clone(), DriveSelect::Master).unwrap();
        ports.0.lock().stuck_busy = true;
        let mut buf = [0u8; BLOCK_SIZE];
        assert_eq!(disk.read_sectors(0, 1, &mut buf), Err(BlockError::Timeout));
    }

    #[test]
    fn out_of_range_is_rejected_before_touching_the_bus() {
        let ports = channel(16);
        let mut disk = AtaDisk::identify(ports, DriveSelect::Master).unwrap();
        let mut buf = [0u8; BLOCK_SIZE];
        assert_eq!(disk.read_sectors(16, 1, &mut buf), Err(BlockError::OutOfRange));
    }
}
