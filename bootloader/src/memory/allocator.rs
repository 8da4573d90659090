//! Page allocator capability and a bump reference implementation
//!
//! [`BumpPageAllocator`] hands out page runs from one arena, front to back.
//! Runs are returned in reverse allocation order only; a run that is not the
//! most recent one stays allocated.

use arrayvec::ArrayVec;
use spin::Mutex;
use uefi_raw::table::boot::MemoryType;

use super::{PAGE_SIZE, pages_for};
use crate::error::{LoaderError, Result};
use crate::utils::mem_util::align_up_u64;

/// A run of pages handed out by a [`PageAllocator`]
#[derive(Debug, PartialEq, Eq)]
pub struct PageRegion {
    address: u64,
    pages: usize,
}

impl PageRegion {
    /// Wrap a raw page run
    ///
    /// # Safety
    /// `[address, address + pages * PAGE_SIZE)` must be writable memory that
    /// nothing else references for the rest of boot.
    pub unsafe fn from_raw(address: u64, pages: usize) -> Self {
        Self { address, pages }
    }

    /// Physical address of the first byte
    pub fn address(&self) -> u64 {
        self.address
    }

    /// Number of pages
    pub fn pages(&self) -> usize {
        self.pages
    }

    /// Size in bytes
    pub fn size(&self) -> usize {
        self.pages * PAGE_SIZE
    }

    /// Turn the region into a byte slice that lives until hand-off
    pub fn into_slice(self) -> &'static mut [u8] {
        // SAFETY: `from_raw` requires exclusive, writable backing memory.
        unsafe { core::slice::from_raw_parts_mut(self.address as *mut u8, self.size()) }
    }
}

/// Page allocator consumed by the resolver, the stage loader and the
/// hand-off manager
pub trait PageAllocator {
    /// Allocate `pages` contiguous pages tagged with `memory_type`
    fn allocate_pages(&self, pages: usize, memory_type: MemoryType) -> Result<PageRegion>;

    /// Allocate `pages` contiguous pages whose start is `alignment` aligned
    fn allocate_aligned_pages(
        &self,
        pages: usize,
        alignment: usize,
        memory_type: MemoryType,
    ) -> Result<PageRegion>;

    /// Return pages; allocators that cannot reclaim ignore this
    fn free_pages(&self, _address: u64, _pages: usize) {}

    /// Allocate room for `bytes`, rounded up to whole pages
    fn allocate_bytes(&self, bytes: usize, memory_type: MemoryType) -> Result<PageRegion> {
        self.allocate_pages(pages_for(bytes), memory_type)
    }
}

/// Allocations that can still be rewound
const REWIND_DEPTH: usize = 16;

struct BumpState {
    next: u64,
    end: u64,
    /// `(start, cursor before the allocation)` of the latest runs
    rewind: ArrayVec<(u64, u64), REWIND_DEPTH>,
    allocations: usize,
}

/// Front-to-back page allocator over a single arena
pub struct BumpPageAllocator {
    state: Mutex<BumpState>,
}

impl BumpPageAllocator {
    /// Create an allocator over `[base, base + size)`
    ///
    /// # Safety
    /// The range must be writable memory owned exclusively by this allocator
    /// for the rest of boot.
    pub unsafe fn new(base: u64, size: usize) -> Self {
        Self {
            state: Mutex::new(BumpState {
                next: base,
                end: base.saturating_add(size as u64),
                rewind: ArrayVec::new(),
                allocations: 0,
            }),
        }
    }

    /// Create an allocator over a leaked or static arena
    pub fn from_static(arena: &'static mut [u8]) -> Self {
        let base = arena.as_mut_ptr() as u64;
        // SAFETY: the exclusive 'static borrow is consumed here.
        unsafe { Self::new(base, arena.len()) }
    }

    /// Bytes still available past the allocation cursor
    pub fn remaining(&self) -> usize {
        let state = self.state.lock();
        (state.end - state.next) as usize
    }

    /// Number of live allocations
    pub fn allocation_count(&self) -> usize {
        self.state.lock().allocations
    }

    fn carve(&self, pages: usize, alignment: usize) -> Result<PageRegion> {
        if pages == 0 || !alignment.is_power_of_two() {
            return Err(LoaderError::InvalidParameter);
        }

        let alignment = alignment.max(PAGE_SIZE) as u64;
        let size = (pages as u64)
            .checked_mul(PAGE_SIZE as u64)
            .ok_or(LoaderError::OutOfResources)?;

        let mut state = self.state.lock();
        let start = align_up_u64(state.next, alignment).ok_or(LoaderError::OutOfResources)?;
        let end = start.checked_add(size).ok_or(LoaderError::OutOfResources)?;
        if end > state.end {
            log::warn!(
                "page allocator exhausted: {} pages requested, {:#x} bytes left",
                pages,
                state.end - state.next
            );
            return Err(LoaderError::OutOfResources);
        }

        if state.rewind.is_full() {
            state.rewind.remove(0);
        }
        let previous = state.next;
        state.rewind.push((start, previous));
        state.next = end;
        state.allocations += 1;

        // SAFETY: the arena is owned by this allocator and the cursor only
        // moves forward, so the run is handed out once.
        Ok(unsafe { PageRegion::from_raw(start, pages) })
    }
}

impl PageAllocator for BumpPageAllocator {
    fn allocate_pages(&self, pages: usize, _memory_type: MemoryType) -> Result<PageRegion> {
        self.carve(pages, PAGE_SIZE)
    }

    fn allocate_aligned_pages(
        &self,
        pages: usize,
        alignment: usize,
        _memory_type: MemoryType,
    ) -> Result<PageRegion> {
        self.carve(pages, alignment)
    }

    fn free_pages(&self, address: u64, pages: usize) {
        let mut state = self.state.lock();
        let end = address.saturating_add((pages * PAGE_SIZE) as u64);
        if let Some(&(start, previous)) = state.rewind.last() {
            if start == address && state.next == end {
                state.rewind.pop();
                state.next = previous;
                state.allocations -= 1;
            }
        }
    }
}
