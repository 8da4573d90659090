//! Bounds-checked byte cursor
//!
//! Volume, section, relocation and record streams are all walked through
//! [`ByteCursor`]. Every read checks the remaining length before the
//! position moves, so a truncated stream surfaces as [`OutOfBounds`]
//! instead of a wild read.

use uefi_raw::Guid;

use crate::error::LoaderError;

/// A read or write would cross the end of the underlying bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutOfBounds;

impl From<OutOfBounds> for LoaderError {
    fn from(_: OutOfBounds) -> Self {
        LoaderError::VolumeCorrupted
    }
}

/// Cursor result
pub type CursorResult<T> = core::result::Result<T, OutOfBounds>;

/// Forward-only reader over a byte arena
#[derive(Clone, Copy, Debug)]
pub struct ByteCursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteCursor<'a> {
    /// Start reading at offset zero
    pub const fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Start reading at `pos`
    pub fn at(data: &'a [u8], pos: usize) -> CursorResult<Self> {
        if pos > data.len() {
            return Err(OutOfBounds);
        }
        Ok(Self { data, pos })
    }

    /// Current offset into the arena
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bytes left past the cursor
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// True once the cursor reached the end of the arena
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// The whole arena
    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    /// Bytes from the cursor to the end, without advancing
    pub fn rest(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }

    /// Advance by `count` bytes
    pub fn skip(&mut self, count: usize) -> CursorResult<()> {
        self.read_bytes(count).map(|_| ())
    }

    /// Advance to the next multiple of `align`, stopping at the end of the arena
    pub fn align_to(&mut self, align: usize) {
        let aligned = super::mem_util::align_up(self.pos, align).unwrap_or(usize::MAX);
        self.pos = aligned.min(self.data.len());
    }

    /// Borrow `count` bytes and advance past them
    pub fn read_bytes(&mut self, count: usize) -> CursorResult<&'a [u8]> {
        let end = self.pos.checked_add(count).ok_or(OutOfBounds)?;
        let bytes = self.data.get(self.pos..end).ok_or(OutOfBounds)?;
        self.pos = end;
        Ok(bytes)
    }

    /// Borrow `count` bytes without advancing
    pub fn peek_bytes(&self, count: usize) -> CursorResult<&'a [u8]> {
        let end = self.pos.checked_add(count).ok_or(OutOfBounds)?;
        self.data.get(self.pos..end).ok_or(OutOfBounds)
    }

    fn read_array<const N: usize>(&mut self) -> CursorResult<[u8; N]> {
        let bytes = self.read_bytes(N)?;
        let mut array = [0u8; N];
        array.copy_from_slice(bytes);
        Ok(array)
    }

    pub fn read_u8(&mut self) -> CursorResult<u8> {
        Ok(self.read_array::<1>()?[0])
    }

    pub fn read_u16(&mut self) -> CursorResult<u16> {
        self.read_array().map(u16::from_le_bytes)
    }

    /// Read a 24-bit little-endian length field
    pub fn read_u24(&mut self) -> CursorResult<u32> {
        let [a, b, c] = self.read_array::<3>()?;
        Ok(u32::from_le_bytes([a, b, c, 0]))
    }

    pub fn read_u32(&mut self) -> CursorResult<u32> {
        self.read_array().map(u32::from_le_bytes)
    }

    pub fn read_u64(&mut self) -> CursorResult<u64> {
        self.read_array().map(u64::from_le_bytes)
    }

    pub fn read_guid(&mut self) -> CursorResult<Guid> {
        self.read_array().map(Guid::from_bytes)
    }
}

/// Read a `u16` at `offset`
pub fn read_u16_at(data: &[u8], offset: usize) -> CursorResult<u16> {
    ByteCursor::at(data, offset)?.read_u16()
}

/// Read a `u32` at `offset`
pub fn read_u32_at(data: &[u8], offset: usize) -> CursorResult<u32> {
    ByteCursor::at(data, offset)?.read_u32()
}

/// Read a `u64` at `offset`
pub fn read_u64_at(data: &[u8], offset: usize) -> CursorResult<u64> {
    ByteCursor::at(data, offset)?.read_u64()
}

fn slot<'a>(data: &'a mut [u8], offset: usize, len: usize) -> CursorResult<&'a mut [u8]> {
    let end = offset.checked_add(len).ok_or(OutOfBounds)?;
    data.get_mut(offset..end).ok_or(OutOfBounds)
}

/// Write a `u16` at `offset`
pub fn write_u16_at(data: &mut [u8], offset: usize, value: u16) -> CursorResult<()> {
    slot(data, offset, 2)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

/// Write a `u32` at `offset`
pub fn write_u32_at(data: &mut [u8], offset: usize, value: u32) -> CursorResult<()> {
    slot(data, offset, 4)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

/// Write a `u64` at `offset`
pub fn write_u64_at(data: &mut [u8], offset: usize, value: u64) -> CursorResult<()> {
    slot(data, offset, 8)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reads_advance() {
        let data = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07];
        let mut cursor = ByteCursor::new(&data);
        assert_eq!(cursor.read_u16(), Ok(0x0201));
        assert_eq!(cursor.read_u24(), Ok(0x050403));
        assert_eq!(cursor.position(), 5);
        assert_eq!(cursor.remaining(), 2);
    }

    #[test]
    fn test_truncated_read_does_not_advance() {
        let data = [0xAA, 0xBB, 0xCC];
        let mut cursor = ByteCursor::new(&data);
        cursor.skip(1).unwrap();
        assert_eq!(cursor.read_u32(), Err(OutOfBounds));
        assert_eq!(cursor.position(), 1);
    }

    #[test]
    fn test_align_saturates_at_end() {
        let data = [0u8; 10];
        let mut cursor = ByteCursor::new(&data);
        cursor.skip(9).unwrap();
        cursor.align_to(8);
        assert!(cursor.is_empty());
    }

    #[test]
    fn test_offset_helpers_check_bounds() {
        let mut data = [0u8; 8];
        assert!(write_u32_at(&mut data, 4, 0xDEADBEEF).is_ok());
        assert_eq!(read_u32_at(&data, 4), Ok(0xDEADBEEF));
        assert_eq!(write_u64_at(&mut data, 1, 0), Err(OutOfBounds));
        assert_eq!(read_u16_at(&data, usize::MAX), Err(OutOfBounds));
    }

    #[test]
    fn test_out_of_bounds_maps_to_volume_corrupted() {
        assert_eq!(LoaderError::from(OutOfBounds), LoaderError::VolumeCorrupted);
    }
}
