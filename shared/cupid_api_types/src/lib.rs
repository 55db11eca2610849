#![no_std]

#[cfg(test)]
extern crate std;

pub mod elf;
pub mod fs;
pub mod input;

use core::fmt;
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Longest absolute path accepted anywhere in the kernel, in bytes.
pub const MAX_PATH: usize = 256;
/// Longest single path component, in bytes.
pub const MAX_NAME: usize = 64;

/// Kernel-wide error code. Values are stable: they cross the program/kernel boundary.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
pub enum Errno {
    NotFound = 1,
    AlreadyExists = 2,
    NotADirectory = 3,
    IsADirectory = 4,
    NoSpace = 5,
    Io = 6,
    InvalidArgument = 7,
    /// The driver does not implement the requested capability.
    NotSupported = 8,
    Busy = 9,
    BadDescriptor = 10,
    NotEmpty = 11,
}

impl Errno {
    pub const fn message(self) -> &'static str {
        match self {
            Errno::NotFound => "no such file or directory",
            Errno::AlreadyExists => "file exists",
            Errno::NotADirectory => "not a directory",
            Errno::IsADirectory => "is a directory",
            Errno::NoSpace => "no space left",
            Errno::Io => "input/output error",
            Errno::InvalidArgument => "invalid argument",
            Errno::NotSupported => "operation not supported",
            Errno::Busy => "resource busy",
            Errno::BadDescriptor => "bad file descriptor",
            Errno::NotEmpty => "directory not empty",
        }
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

pub type FsResult<T> = Result<T, Errno>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_crosses_abi_as_u32() {
        let raw: u32 = Errno::IsADirectory.into();
        assert_eq!(raw, 4);
        assert_eq!(Errno::try_from(9u32), Ok(Errno::Busy));
        assert!(Errno::try_from(0u32).is_err());
    }

    #[test]
    fn errno_display_uses_message() {
        use std::string::ToString;
        assert_eq!(Errno::NotFound.to_string(), "no such file or directory");
    }
}
