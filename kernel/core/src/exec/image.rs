use alloc::vec::Vec;
use bitflags::bitflags;
use cupid_api_types::elf::{PF_R, PF_W, PF_X, USER_BASE};
use elf::segment::ProgramHeader;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ElfSegmentFlags: u32 {
        const EXECUTABLE = PF_X;
        const WRITABLE = PF_W;
        const READABLE = PF_R;

        // The source may set any bits
        const _ = !0;
    }
}

impl From<ProgramHeader> for ElfSegmentFlags {
    fn from(value: ProgramHeader) -> Self {
        Self::from_bits_retain(value.p_flags)
    }
}

/// One loaded segment: `bytes.len()` is the segment's memory size, with the part past
/// the file size already zeroed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub vaddr: u32,
    pub flags: ElfSegmentFlags,
    pub bytes: Vec<u8>,
}

impl Segment {
    pub fn end(&self) -> u32 {
        self.vaddr + self.bytes.len() as u32
    }

    fn contains(&self, vaddr: u32) -> bool {
        (self.vaddr..self.end()).contains(&vaddr)
    }
}

/// The user-window memory of a loaded program, ready to be installed and entered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramImage {
    entry: u32,
    segments: Vec<Segment>,
}

impl ProgramImage {
    pub(crate) fn new(entry: u32) -> Self {
        Self { entry, segments: Vec::new() }
    }

    pub fn entry(&self) -> u32 {
        self.entry
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Places a segment in the image.
    ///
    /// # Panics
    /// If the segment starts below the user window: the loader rejects such files,
    /// so reaching this is a kernel bug.
    pub(crate) fn map(&mut self, segment: Segment) {
        if segment.vaddr < USER_BASE {
            panic!(
                "exec: mapping segment at {:#x} below user base {USER_BASE:#x}",
                segment.vaddr
            );
        }
        self.segments.push(segment);
    }

    /// `len` bytes of the memory image starting at `vaddr`, if one segment holds them all.
    pub fn read(&self, vaddr: u32, len: usize) -> Option<&[u8]> {
        let segment = self.segments.iter().find(|s| s.contains(vaddr))?;
        let start = (vaddr - segment.vaddr) as usize;
        segment.bytes.get(start..start.checked_add(len)?)
    }

    pub fn memory_size(&self) -> usize {
        self.segments.iter().map(|s| s.bytes.len()).sum()
    }

    /// Copies every segment to its load address.
    ///
    /// # Safety
    /// The user window must be identity mapped, writable and not in use by anything
    /// else.
    #[cfg(target_os = "none")]
    pub unsafe fn install(&self) {
        for segment in &self.segments {
            let dst = segment.vaddr as usize as *mut u8;
            unsafe { core::ptr::copy_nonoverlapping(segment.bytes.as_ptr(), dst, segment.bytes.len()) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    fn segment(vaddr: u32, bytes: Vec<u8>) -> Segment {
        Segment { vaddr, flags: ElfSegmentFlags::READABLE, bytes }
    }

    #[test]
    fn read_within_one_segment() {
        let mut image = ProgramImage::new(USER_BASE);
        image.map(segment(USER_BASE, vec![1, 2, 3, 4]));
        image.map(segment(0x60_0000, vec![9; 8]));
        assert_eq!(image.read(USER_BASE + 1, 2), Some(&[2, 3][..]));
        assert_eq!(image.read(0x60_0004, 4), Some(&[9; 4][..]));
        assert_eq!(image.read(USER_BASE + 3, 2), None);
        assert_eq!(image.read(0x50_0000, 1), None);
        assert_eq!(image.memory_size(), 12);
    }

    #[test]
    #[should_panic(expected = "below user base")]
    fn mapping_below_user_base_is_fatal() {
        let mut image = ProgramImage::new(0);
        image.map(segment(0x1000, vec![0x90]));
    }
}
