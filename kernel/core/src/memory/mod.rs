pub mod global_allocator;
pub mod heap;

pub use global_allocator::LockedHeap;
pub use heap::{Heap, HeapStats};
