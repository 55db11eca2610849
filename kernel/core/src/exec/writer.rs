//! ELF32 writer for compiled programs: one R|X code segment at `CODE_BASE` and one
//! R|W data segment at `DATA_BASE`.
//!
//! File layout: ELF header at 0, code program header at 0x34, data program header at
//! 0x54, code at 0x80, data after the code at the next 4-byte boundary.

use super::loader::ElfError;
use alloc::vec::Vec;
use cupid_api_types::elf::{
    CODE_BASE, CODE_FILE_OFFSET, DATA_BASE, EHDR_SIZE, ELF_MAGIC, ELFCLASS32, ELFDATA2LSB, EM_386,
    ET_EXEC, EV_CURRENT, PF_R, PF_W, PF_X, PHDR_CODE_OFFSET, PHDR_DATA_OFFSET, PHDR_SIZE, PT_LOAD,
    SEGMENT_ALIGN, USER_LIMIT,
};

const SHDR_SIZE: u16 = 40;

struct ProgramHeader {
    offset: u32,
    vaddr: u32,
    size: u32,
    flags: u32,
}

impl ProgramHeader {
    fn encode(&self, out: &mut [u8]) {
        let fields = [
            PT_LOAD,
            self.offset,
            self.vaddr,
            self.vaddr, // p_paddr
            self.size,  // p_filesz
            self.size,  // p_memsz
            self.flags,
            SEGMENT_ALIGN,
        ];
        for (i, field) in fields.iter().enumerate() {
            out[i * 4..i * 4 + 4].copy_from_slice(&field.to_le_bytes());
        }
    }
}

/// Emits an executable whose entry point is `CODE_BASE + entry_offset`.
pub fn write(code: &[u8], data: &[u8], entry_offset: u32) -> Result<Vec<u8>, ElfError> {
    if entry_offset as usize >= code.len() {
        return Err(ElfError::EntryOutsideImage);
    }
    if code.len() > (DATA_BASE - CODE_BASE) as usize || data.len() > (USER_LIMIT - DATA_BASE) as usize {
        return Err(ElfError::TooLarge);
    }

    let data_offset = (CODE_FILE_OFFSET + code.len()).next_multiple_of(SEGMENT_ALIGN as usize);
    let total = data_offset + data.len();
    let mut file = Vec::new();
    file.try_reserve_exact(total).map_err(|_| ElfError::NoMemory)?;
    file.resize(total, 0);

    let ehdr = &mut file[..EHDR_SIZE];
    ehdr[..4].copy_from_slice(&ELF_MAGIC);
    ehdr[4] = ELFCLASS32;
    ehdr[5] = ELFDATA2LSB;
    ehdr[6] = EV_CURRENT;
    ehdr[16..18].copy_from_slice(&ET_EXEC.to_le_bytes());
    ehdr[18..20].copy_from_slice(&EM_386.to_le_bytes());
    ehdr[20..24].copy_from_slice(&u32::from(EV_CURRENT).to_le_bytes());
    ehdr[24..28].copy_from_slice(&(CODE_BASE + entry_offset).to_le_bytes());
    ehdr[28..32].copy_from_slice(&(PHDR_CODE_OFFSET as u32).to_le_bytes()); // e_phoff
    ehdr[40..42].copy_from_slice(&(EHDR_SIZE as u16).to_le_bytes());
    ehdr[42..44].copy_from_slice(&(PHDR_SIZE as u16).to_le_bytes());
    ehdr[44..46].copy_from_slice(&2u16.to_le_bytes()); // e_phnum
    ehdr[46..48].copy_from_slice(&SHDR_SIZE.to_le_bytes());

    ProgramHeader {
        offset: CODE_FILE_OFFSET as u32,
        vaddr: CODE_BASE,
        size: code.len() as u32,
        flags: PF_R | PF_X,
    }
    .encode(&mut file[PHDR_CODE_OFFSET..PHDR_CODE_OFFSET + PHDR_SIZE]);
    ProgramHeader {
        offset: data_offset as u32,
        vaddr: DATA_BASE,
        size: data.len() as u32,
        flags: PF_R | PF_W,
    }
    .encode(&mut file[PHDR_DATA_OFFSET..PHDR_DATA_OFFSET + PHDR_SIZE]);

    file[CODE_FILE_OFFSET..CODE_FILE_OFFSET + code.len()].copy_from_slice(code);
    file[data_offset..].copy_from_slice(data);
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn u32_at(file: &[u8], offset: usize) -> u32 {
        u32::from_le_bytes(file[offset..offset + 4].try_into().unwrap())
    }

    fn u16_at(file: &[u8], offset: usize) -> u16 {
        u16::from_le_bytes(file[offset..offset + 2].try_into().unwrap())
    }

    #[test]
    fn header_fields() {
        let file = write(&[0x90, 0x90, 0xF4], b"xy", 2).unwrap();
        assert_eq!(&file[..4], b"\x7FELF");
        assert_eq!(u16_at(&file, 16), 2);
        assert_eq!(u16_at(&file, 18), 3);
        assert_eq!(u32_at(&file, 24), 0x0040_0002);
        assert_eq!(u32_at(&file, 28), 52);
        assert_eq!(u16_at(&file, 40), 52);
        assert_eq!(u16_at(&file, 42), 32);
        assert_eq!(u16_at(&file, 44), 2);
    }

    #[test]
    fn segment_layout() {
        let code = [0xAAu8; 5];
        let file = write(&code, b"data", 0).unwrap();
        // Code program header.
        assert_eq!(u32_at(&file, 0x34), PT_LOAD);
        assert_eq!(u32_at(&file, 0x34 + 4), 0x80);
        assert_eq!(u32_at(&file, 0x34 + 8), 0x0040_0000);
        assert_eq!(u32_at(&file, 0x34 + 24), 5); // R|X
        assert_eq!(u32_at(&file, 0x34 + 28), 4);
        // Data program header: code ends at 0x85, data is aligned to 0x88.
        assert_eq!(u32_at(&file, 0x54 + 4), 0x88);
        assert_eq!(u32_at(&file, 0x54 + 8), DATA_BASE);
        assert_eq!(u32_at(&file, 0x54 + 24), 6); // R|W
        assert_eq!(&file[0x80..0x85], &code);
        assert_eq!(&file[0x88..], b"data");
    }

    #[test]
    fn rejects_bad_input() {
        assert_eq!(write(&[], &[], 0), Err(ElfError::EntryOutsideImage));
        assert_eq!(write(&[0xF4], &[], 1), Err(ElfError::EntryOutsideImage));
        let too_big = alloc::vec![0u8; (DATA_BASE - CODE_BASE) as usize + 1];
        assert_eq!(write(&too_big, &[], 0), Err(ElfError::TooLarge));
    }
}
