//! Stack handed to the next stage

use uefi_raw::table::boot::MemoryType;

use crate::error::{LoaderError, Result};
use crate::memory::{PAGE_SIZE, PageAllocator};

/// Bytes kept free above the initial stack pointer
pub const STACK_RESERVED_WORD: usize = 8;

/// Alignment the initial stack pointer is rounded down to at transfer
pub const STACK_ALIGNMENT: u64 = 16;

/// Upper bound on the stack size handed over
pub const MAX_STACK_SIZE: usize = 16 * 1024 * 1024;

/// A freshly allocated stack region
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootStack {
    base: u64,
    top: u64,
    size: usize,
}

impl BootStack {
    /// Describe an existing region; `top` leaves one reserved word free
    pub fn new(base: u64, size: usize) -> Self {
        Self {
            base,
            top: base + (size - size.min(STACK_RESERVED_WORD)) as u64,
            size,
        }
    }

    /// Allocate `pages` pages of boot-services data for the stack
    pub fn allocate(allocator: &dyn PageAllocator, pages: usize) -> Result<Self> {
        if pages == 0 || pages * PAGE_SIZE > MAX_STACK_SIZE {
            return Err(LoaderError::InvalidParameter);
        }

        let region = allocator.allocate_pages(pages, MemoryType::BOOT_SERVICES_DATA)?;
        let base = region.address();
        let bytes = region.into_slice();
        let size = bytes.len();
        bytes[size - STACK_RESERVED_WORD..].fill(0);

        let stack = Self::new(base, size);
        log::debug!(
            "stage stack {:#x}..{:#x}, initial sp {:#x}",
            stack.base,
            stack.base + size as u64,
            stack.top
        );
        Ok(stack)
    }

    /// Initial stack pointer, one reserved word below the top
    pub fn pointer(&self) -> u64 {
        self.top
    }

    /// Lowest address of the region
    pub fn base(&self) -> u64 {
        self.base
    }

    /// Region size in bytes
    pub fn size(&self) -> usize {
        self.size
    }

    /// `addr` lies inside the region
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.base && addr < self.base + self.size as u64
    }

    /// Large enough for the reserved word and within [`MAX_STACK_SIZE`]
    pub fn is_valid(&self) -> bool {
        self.size > STACK_RESERVED_WORD && self.size <= MAX_STACK_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pointer_leaves_reserved_word() {
        let stack = BootStack::new(0x10_0000, 0x2_0000);
        assert_eq!(stack.pointer(), 0x10_0000 + 0x2_0000 - 8);
        assert!(stack.contains(stack.pointer()));
        assert!(!stack.contains(0x10_0000 + 0x2_0000));
        assert!(stack.is_valid());
    }

    #[test]
    fn test_tiny_stack_is_invalid() {
        assert!(!BootStack::new(0x1000, 8).is_valid());
        assert!(!BootStack::new(0x1000, MAX_STACK_SIZE + PAGE_SIZE).is_valid());
    }
}
