//! Page-granular memory for the stage loader
//!
//! The loader never owns memory by itself; every buffer (decoded sections,
//! image buffers, scratch space, the hand-off stack) comes from a
//! [`PageAllocator`] capability injected by the platform.

pub mod allocator;

pub use allocator::{BumpPageAllocator, PageAllocator, PageRegion};

/// Allocation granule
pub const PAGE_SIZE: usize = 0x1000;

/// Number of pages needed to hold `bytes`
pub const fn pages_for(bytes: usize) -> usize {
    bytes.div_ceil(PAGE_SIZE)
}
