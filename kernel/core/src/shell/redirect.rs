use super::tokenize::RedirectMode;
use crate::consts::REDIRECT_CAP;
use crate::fs::Vfs;
use alloc::vec::Vec;
use core::fmt;
use cupid_api_types::FsResult;

/// Bounded capture of a redirected command's output. Output past the bound is
/// dropped.
pub struct CaptureBuffer {
    data: Vec<u8>,
    capacity: usize,
    overflowed: bool,
}

impl Default for CaptureBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureBuffer {
    pub fn new() -> Self {
        Self::with_capacity(REDIRECT_CAP)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self { data: Vec::new(), capacity, overflowed: false }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn overflowed(&self) -> bool {
        self.overflowed
    }

    /// Writes the captured bytes to `target`, truncating or appending.
    pub fn commit(&self, vfs: &mut Vfs, target: &str, mode: RedirectMode) -> FsResult<()> {
        if self.overflowed {
            log::warn!("shell: output to {target} truncated at {} bytes", self.capacity);
        }
        vfs.write_all(target, &self.data, mode == RedirectMode::Append)
    }
}

impl fmt::Write for CaptureBuffer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let room = self.capacity - self.data.len();
        if s.len() > room {
            self.overflowed = true;
        }
        self.data.extend_from_slice(&s.as_bytes()[..s.len().min(room)]);
        Ok(())
    }
}
