//! ELF32 executable loader.
//!
//! Validation happens in full before anything is handed out: a rejected file leaves no
//! trace, because the image being built is simply dropped.

use super::image::{ElfSegmentFlags, ProgramImage, Segment};
use crate::fs::Vfs;
use alloc::vec::Vec;
use core::fmt;
use cupid_api_types::elf::{
    EHDR_SIZE, ELF_MAGIC, ELFCLASS32, ELFDATA2LSB, EM_386, ET_EXEC, PT_LOAD, USER_BASE, USER_LIMIT,
};
use cupid_api_types::{Errno, FsResult};
use elf::ElfBytes;
use elf::endian::LittleEndian;
use nodit::interval::ie;
use nodit::{Interval, NoditSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElfError {
    Truncated,
    BadMagic,
    NotElf32,
    NotLittleEndian,
    NotExecutable,
    WrongMachine,
    Malformed,
    NoLoadableSegments,
    /// A segment's file range runs past the end of the file.
    SegmentOutsideFile,
    BelowUserBase,
    /// A segment ends past the user window.
    OutsideUserWindow,
    MemszBelowFilesz,
    Overlap,
    EntryOutsideImage,
    /// Code or data too large for its load window (writer).
    TooLarge,
    NoMemory,
}

impl fmt::Display for ElfError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            ElfError::Truncated => "file too short for an ELF header",
            ElfError::BadMagic => "bad ELF magic",
            ElfError::NotElf32 => "not a 32-bit ELF",
            ElfError::NotLittleEndian => "not little-endian",
            ElfError::NotExecutable => "not an executable",
            ElfError::WrongMachine => "not an x86 executable",
            ElfError::Malformed => "malformed headers",
            ElfError::NoLoadableSegments => "no loadable segments",
            ElfError::SegmentOutsideFile => "segment extends past end of file",
            ElfError::BelowUserBase => "segment below user base",
            ElfError::OutsideUserWindow => "segment outside user window",
            ElfError::MemszBelowFilesz => "segment memory size smaller than file size",
            ElfError::Overlap => "segments overlap",
            ElfError::EntryOutsideImage => "entry point outside loaded segments",
            ElfError::TooLarge => "program too large",
            ElfError::NoMemory => "out of memory",
        };
        f.write_str(msg)
    }
}

impl From<ElfError> for Errno {
    fn from(value: ElfError) -> Self {
        match value {
            ElfError::NoMemory | ElfError::TooLarge => Errno::NoSpace,
            _ => Errno::InvalidArgument,
        }
    }
}

fn check_ident(bytes: &[u8]) -> Result<(), ElfError> {
    if bytes.len() < EHDR_SIZE {
        return Err(ElfError::Truncated);
    }
    if bytes[..4] != ELF_MAGIC {
        return Err(ElfError::BadMagic);
    }
    if bytes[4] != ELFCLASS32 {
        return Err(ElfError::NotElf32);
    }
    if bytes[5] != ELFDATA2LSB {
        return Err(ElfError::NotLittleEndian);
    }
    Ok(())
}

/// Validates `bytes` as an i386 executable and builds its memory image.
pub fn load(bytes: &[u8]) -> Result<ProgramImage, ElfError> {
    check_ident(bytes)?;
    let elf = ElfBytes::<LittleEndian>::minimal_parse(bytes).map_err(|_| ElfError::Malformed)?;
    if elf.ehdr.e_type != ET_EXEC {
        return Err(ElfError::NotExecutable);
    }
    if elf.ehdr.e_machine != EM_386 {
        return Err(ElfError::WrongMachine);
    }
    let entry = u32::try_from(elf.ehdr.e_entry).map_err(|_| ElfError::Malformed)?;

    let mut image = ProgramImage::new(entry);
    let mut mapped: NoditSet<u64, Interval<u64>> = NoditSet::default();
    let segments = elf.segments().ok_or(ElfError::NoLoadableSegments)?;

    for segment in segments {
        if segment.p_type != PT_LOAD {
            continue;
        }
        let file_end = segment.p_offset.checked_add(segment.p_filesz).ok_or(ElfError::Malformed)?;
        if file_end > bytes.len() as u64 {
            return Err(ElfError::SegmentOutsideFile);
        }
        if segment.p_memsz < segment.p_filesz {
            return Err(ElfError::MemszBelowFilesz);
        }
        if segment.p_vaddr < u64::from(USER_BASE) {
            return Err(ElfError::BelowUserBase);
        }
        let mem_end = segment.p_vaddr.checked_add(segment.p_memsz).ok_or(ElfError::Malformed)?;
        if mem_end > u64::from(USER_LIMIT) {
            return Err(ElfError::OutsideUserWindow);
        }
        if segment.p_memsz == 0 {
            continue;
        }
        mapped
            .insert_merge_touching(ie(segment.p_vaddr, mem_end))
            .map_err(|_| ElfError::Overlap)?;

        let mut memory = Vec::new();
        memory
            .try_reserve_exact(segment.p_memsz as usize)
            .map_err(|_| ElfError::NoMemory)?;
        memory.extend_from_slice(&bytes[segment.p_offset as usize..file_end as usize]);
        memory.resize(segment.p_memsz as usize, 0);

        image.map(Segment {
            vaddr: segment.p_vaddr as u32,
            flags: ElfSegmentFlags::from(segment),
            bytes: memory,
        });
    }

    if image.segments().is_empty() {
        return Err(ElfError::NoLoadableSegments);
    }
    if image.read(entry, 1).is_none() {
        return Err(ElfError::EntryOutsideImage);
    }
    log::debug!(
        "exec: loaded {} segment(s), {} bytes, entry {entry:#x}",
        image.segments().len(),
        image.memory_size()
    );
    Ok(image)
}

/// Reads `path` through the VFS and loads it.
pub fn load_path(vfs: &mut Vfs, path: &str) -> FsResult<ProgramImage> {
    let bytes = vfs.read_all(path)?;
    load(&bytes).map_err(|e| {
        log::warn!("exec: {path}: {e}");
        Errno::from(e)
    })
}
