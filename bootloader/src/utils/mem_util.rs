//! Alignment helpers shared by the stream parsers and the allocators
//!
//! `align` is always a power of two; the `checked` forms return `None` when
//! rounding up would overflow.

/// Align an address up to a boundary
pub const fn align_up_u64(addr: u64, align: u64) -> Option<u64> {
    match addr.checked_add(align - 1) {
        Some(value) => Some(value & !(align - 1)),
        None => None,
    }
}

/// Align a buffer offset up to a boundary
pub const fn align_up(offset: usize, align: usize) -> Option<usize> {
    match offset.checked_add(align - 1) {
        Some(value) => Some(value & !(align - 1)),
        None => None,
    }
}

/// Align an address down to a boundary
pub const fn align_down(addr: u64, align: u64) -> u64 {
    addr & !(align - 1)
}

/// Check if address is aligned
pub const fn is_aligned(addr: u64, align: u64) -> bool {
    (addr & (align - 1)) == 0
}
