//! First-fit kernel heap over a single contiguous region.
//!
//! Every block starts with a [`BlockHeader`]; headers form a singly linked list in
//! address order covering the whole region. Adjacent free blocks are merged on `free`,
//! so no two neighbours are ever both free.

use crate::consts::HEAP_ALIGN;
use core::mem::size_of;
use core::ptr::NonNull;

#[repr(C)]
struct BlockHeader {
    /// Payload bytes following the header.
    size: usize,
    free: bool,
    next: Option<NonNull<BlockHeader>>,
}

pub const HEADER_SIZE: usize = size_of::<BlockHeader>().next_multiple_of(HEAP_ALIGN);
/// Smallest payload worth splitting off into its own free block.
const MIN_SPLIT_PAYLOAD: usize = HEAP_ALIGN * 2;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HeapStats {
    /// Payload bytes currently handed out.
    pub used: usize,
    /// Payload bytes in free blocks.
    pub free: usize,
    /// Highest `used` ever observed.
    pub peak: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockInfo {
    pub addr: usize,
    pub size: usize,
    pub free: bool,
}

pub struct Heap {
    start: usize,
    size: usize,
    head: Option<NonNull<BlockHeader>>,
    used: usize,
    peak: usize,
}

// The heap exclusively owns the region it was initialised with.
unsafe impl Send for Heap {}

impl Heap {
    pub const fn empty() -> Self {
        Self { start: 0, size: 0, head: None, used: 0, peak: 0 }
    }

    /// Takes ownership of `[base, base + size)` and turns it into one free block.
    ///
    /// # Safety
    /// The region must be valid for reads and writes, unused by anything else, and live
    /// for as long as the heap.
    pub unsafe fn init(&mut self, base: *mut u8, size: usize) {
        let start = (base as usize).next_multiple_of(HEAP_ALIGN);
        let lost = start - base as usize;
        let size = size.saturating_sub(lost) & !(HEAP_ALIGN - 1);
        assert!(
            size >= HEADER_SIZE + MIN_SPLIT_PAYLOAD,
            "heap::init: region of {size} bytes is too small"
        );

        let head = start as *mut BlockHeader;
        unsafe {
            head.write(BlockHeader { size: size - HEADER_SIZE, free: true, next: None });
        }
        self.start = start;
        self.size = size;
        self.head = NonNull::new(head);
        self.used = 0;
        self.peak = 0;
        log::debug!("heap: {size} bytes at {start:#x}");
    }

    /// Start address and length of the managed region.
    pub fn region(&self) -> (usize, usize) {
        (self.start, self.size)
    }

    /// First-fit allocation of `bytes` (rounded up to the heap alignment).
    /// Returns `None` when no free block is large enough.
    pub fn alloc(&mut self, bytes: usize) -> Option<NonNull<u8>> {
        let wanted = bytes.max(1).checked_next_multiple_of(HEAP_ALIGN)?;
        let mut cursor = self.head;
        while let Some(mut block) = cursor {
            let header = unsafe { block.as_mut() };
            if header.free && header.size >= wanted {
                if header.size - wanted >= HEADER_SIZE + MIN_SPLIT_PAYLOAD {
                    let rest_addr = block.as_ptr() as usize + HEADER_SIZE + wanted;
                    let rest = rest_addr as *mut BlockHeader;
                    unsafe {
                        rest.write(BlockHeader {
                            size: header.size - wanted - HEADER_SIZE,
                            free: true,
                            next: header.next,
                        });
                    }
                    header.size = wanted;
                    header.next = NonNull::new(rest);
                }
                header.free = false;
                self.used += header.size;
                self.peak = self.peak.max(self.used);
                let payload = block.as_ptr() as usize + HEADER_SIZE;
                return NonNull::new(payload as *mut u8);
            }
            cursor = header.next;
        }
        log::trace!("heap: no block for {bytes} bytes");
        None
    }

    /// Returns the block whose payload starts at `ptr` to the free list.
    ///
    /// Pointers outside the heap, pointers that are not a payload start, and double
    /// frees are invariant violations: the heap is dumped and the kernel panics.
    pub fn free(&mut self, ptr: NonNull<u8>) {
        let addr = ptr.as_ptr() as usize;
        if addr < self.start + HEADER_SIZE || addr >= self.start + self.size {
            self.dump();
            panic!("heap::free: pointer {addr:#x} outside heap");
        }
        let target = addr - HEADER_SIZE;

        let mut prev: Option<NonNull<BlockHeader>> = None;
        let mut cursor = self.head;
        while let Some(mut block) = cursor {
            if block.as_ptr() as usize == target {
                let header = unsafe { block.as_mut() };
                if header.free {
                    self.dump();
                    panic!("heap::free: double free of {addr:#x}");
                }
                header.free = true;
                self.used -= header.size;
                self.coalesce(prev, block);
                return;
            }
            if block.as_ptr() as usize > target {
                break;
            }
            prev = cursor;
            cursor = unsafe { block.as_ref() }.next;
        }
        self.dump();
        panic!("heap::free: {addr:#x} is not the start of a block");
    }

    fn coalesce(&mut self, prev: Option<NonNull<BlockHeader>>, mut block: NonNull<BlockHeader>) {
        let header = unsafe { block.as_mut() };
        if let Some(next) = header.next {
            let next = unsafe { next.as_ref() };
            if next.free {
                header.size += HEADER_SIZE + next.size;
                header.next = next.next;
            }
        }
        if let Some(mut prev) = prev {
            let prev = unsafe { prev.as_mut() };
            if prev.free {
                prev.size += HEADER_SIZE + header.size;
                prev.next = header.next;
            }
        }
    }

    pub fn stats(&self) -> HeapStats {
        let free = self.blocks().filter(|b| b.free).map(|b| b.size).sum();
        HeapStats { used: self.used, free, peak: self.peak }
    }

    /// Walks the block list in address order.
    pub fn blocks(&self) -> Blocks<'_> {
        Blocks { cursor: self.head, _heap: self }
    }

    /// Logs every block. Called before panicking on a corrupted heap.
    pub fn dump(&self) {
        log::error!("heap dump: region {:#x}+{:#x}", self.start, self.size);
        for block in self.blocks() {
            log::error!(
                "  {:#010x} {:>8} {}",
                block.addr,
                block.size,
                if block.free { "free" } else { "used" }
            );
        }
    }
}

pub struct Blocks<'a> {
    cursor: Option<NonNull<BlockHeader>>,
    _heap: &'a Heap,
}

impl Iterator for Blocks<'_> {
    type Item = BlockInfo;

    fn next(&mut self) -> Option<BlockInfo> {
        let block = self.cursor?;
        let header = unsafe { block.as_ref() };
        self.cursor = header.next;
        Some(BlockInfo {
            addr: block.as_ptr() as usize,
            size: header.size,
            free: header.free,
        })
    }
}
