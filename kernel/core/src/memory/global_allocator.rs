use crate::consts::HEAP_ALIGN;
use crate::memory::heap::{Heap, HeapStats};
use core::alloc::{GlobalAlloc, Layout};
use core::ptr::{self, NonNull};

const STASH: usize = size_of::<usize>();

/// The kernel heap behind a spin lock, usable as `#[global_allocator]`.
pub struct LockedHeap(spin::Mutex<Heap>);

impl LockedHeap {
    pub const fn empty() -> Self {
        Self(spin::Mutex::new(Heap::empty()))
    }

    /// # Safety
    /// Same contract as [`Heap::init`]; must be called once, before the first allocation.
    pub unsafe fn init(&self, base: *mut u8, size: usize) {
        unsafe { self.0.lock().init(base, size) };
    }

    pub fn stats(&self) -> HeapStats {
        self.0.lock().stats()
    }

    pub fn dump(&self) {
        self.0.lock().dump();
    }
}

/// Blocks are only HEAP_ALIGN-aligned. Stricter layouts get `align` extra bytes; the
/// returned pointer is aligned inside the block and the block's own address is
/// stashed in the word just below it.
unsafe impl GlobalAlloc for LockedHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() <= HEAP_ALIGN {
            return self.0.lock().alloc(layout.size()).map_or(ptr::null_mut(), NonNull::as_ptr);
        }
        let Some(padded) = layout.size().checked_add(layout.align()) else {
            return ptr::null_mut();
        };
        let Some(block) = self.0.lock().alloc(padded) else {
            return ptr::null_mut();
        };
        let raw = block.as_ptr();
        let offset = (raw as usize + STASH).next_multiple_of(layout.align()) - raw as usize;
        unsafe {
            let aligned = raw.add(offset);
            aligned.cast::<usize>().sub(1).write(raw as usize);
            aligned
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        let block = if layout.align() > HEAP_ALIGN && !ptr.is_null() {
            unsafe { ptr.cast::<usize>().sub(1).read() as *mut u8 }
        } else {
            ptr
        };
        if let Some(block) = NonNull::new(block) {
            self.0.lock().free(block);
        }
    }
}
