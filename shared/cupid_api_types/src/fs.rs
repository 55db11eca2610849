use crate::MAX_NAME;
use bitflags::bitflags;
use heapless::String;

bitflags! {
    /// Flags accepted by `open`. At least one of `READ` / `WRITE` must be set.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const CREATE = 1 << 2;
        const TRUNCATE = 1 << 3;
        const APPEND = 1 << 4;
        /// With `CREATE`: fail if the file already exists.
        const EXCLUSIVE = 1 << 5;
    }
}

impl OpenFlags {
    pub const READ_WRITE: Self = Self::READ.union(Self::WRITE);

    /// Rejects combinations no driver can honour.
    pub fn is_valid(self) -> bool {
        if !self.intersects(Self::READ_WRITE) {
            return false;
        }
        if self.intersects(Self::TRUNCATE | Self::APPEND) && !self.contains(Self::WRITE) {
            return false;
        }
        !(self.contains(Self::EXCLUSIVE) && !self.contains(Self::CREATE))
    }
}

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Whence {
    Set = 0,
    Current = 1,
    End = 2,
}

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileType {
    File = 0,
    Directory = 1,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Stat {
    pub size: u64,
    pub file_type: FileType,
}

impl Stat {
    pub const fn is_dir(&self) -> bool {
        matches!(self.file_type, FileType::Directory)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String<MAX_NAME>,
    pub size: u64,
    pub file_type: FileType,
}

impl DirEntry {
    /// Builds an entry, returning `None` when `name` exceeds `MAX_NAME`.
    pub fn new(name: &str, size: u64, file_type: FileType) -> Option<Self> {
        let mut owned = String::new();
        owned.push_str(name).ok()?;
        Some(Self { name: owned, size, file_type })
    }

    pub const fn is_dir(&self) -> bool {
        matches!(self.file_type, FileType::Directory)
    }
}

/// Computes the target of a seek, rejecting positions before the start of the file.
pub fn seek_target(current: u64, size: u64, offset: i64, whence: Whence) -> Option<u64> {
    let base = match whence {
        Whence::Set => 0,
        Whence::Current => current,
        Whence::End => size,
    };
    base.checked_add_signed(offset)
}
