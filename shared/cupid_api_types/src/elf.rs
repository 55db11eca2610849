//! Layout of the ELF32 executables produced by the compiler and accepted by the loader.

/// Lowest address a loadable segment may occupy.
pub const USER_BASE: u32 = 0x0040_0000;
/// One past the highest address of the user image window.
pub const USER_LIMIT: u32 = 0x0080_0000;

/// Load address of the code segment emitted by the writer.
pub const CODE_BASE: u32 = USER_BASE;
/// Load address of the data segment emitted by the writer.
pub const DATA_BASE: u32 = 0x0060_0000;

pub const EHDR_SIZE: usize = 52;
pub const PHDR_SIZE: usize = 32;
pub const PHDR_CODE_OFFSET: usize = 0x34;
pub const PHDR_DATA_OFFSET: usize = 0x54;
pub const CODE_FILE_OFFSET: usize = 0x80;
pub const SEGMENT_ALIGN: u32 = 4;

pub const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];
pub const ELFCLASS32: u8 = 1;
pub const ELFDATA2LSB: u8 = 1;
pub const EV_CURRENT: u8 = 1;
pub const ET_EXEC: u16 = 2;
pub const EM_386: u16 = 3;
pub const PT_LOAD: u32 = 1;

pub const PF_X: u32 = 1 << 0;
pub const PF_W: u32 = 1 << 1;
pub const PF_R: u32 = 1 << 2;
