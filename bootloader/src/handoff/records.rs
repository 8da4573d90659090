//! Hand-off record list
//!
//! One contiguous region laid out the way the next stage expects it:
//!
//! ```text
//! memory_bottom                                                 memory_top
//! | info | record | record | ... | end | free ... | allocated pages ... |
//!                                       ^free_bottom ^free_top
//! ```
//!
//! The info record at the start owns the cursors. Records grow upward from
//! `free_bottom`, page allocations grow downward from `free_top`, and the
//! list always ends with an end-of-list record right below `free_bottom`.
//! Every record starts with an 8-byte header whose `length` covers the
//! header, so a reader can skip kinds it does not know.

use core::mem;

use bitflags::bitflags;
use static_assertions::{assert_eq_size, const_assert_eq};
use uefi_raw::Guid;
use uefi_raw::table::boot::MemoryType;

use crate::error::{LoaderError, Result};
use crate::firmware::guids::MEMORY_ALLOCATION_MODULE;
use crate::memory::PAGE_SIZE;
use crate::utils::cursor::{read_u16_at, read_u32_at, read_u64_at, write_u16_at, write_u32_at, write_u64_at};
use crate::utils::mem_util::{align_down, align_up};

/// Version written into the info record
pub const HANDOFF_VERSION: u32 = 0x0009;

/// Record alignment and padding granule
pub const RECORD_ALIGNMENT: usize = 8;

/// Size of a record header
pub const RECORD_HEADER_SIZE: usize = 8;

/// Size of the info record, header included
pub const INFO_RECORD_SIZE: usize = 56;

const VERSION_OFFSET: usize = 8;
const BOOT_MODE_OFFSET: usize = 12;
const MEMORY_TOP_OFFSET: usize = 16;
const MEMORY_BOTTOM_OFFSET: usize = 24;
const FREE_TOP_OFFSET: usize = 32;
const FREE_BOTTOM_OFFSET: usize = 40;
const END_OF_LIST_OFFSET: usize = 48;

const_assert_eq!(END_OF_LIST_OFFSET + 8, INFO_RECORD_SIZE);
const_assert_eq!(INFO_RECORD_SIZE % RECORD_ALIGNMENT, 0);

/// Payload sizes of the fixed-layout records
pub const RESOURCE_DESCRIPTOR_SIZE: usize = 40;
pub const MEMORY_ALLOCATION_SIZE: usize = 40;
pub const MODULE_SIZE: usize = MEMORY_ALLOCATION_SIZE + 24;
pub const FIRMWARE_VOLUME_SIZE: usize = 16;
pub const CPU_SIZE: usize = 8;

/// Record kind tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecordKind(pub u16);

impl RecordKind {
    pub const HANDOFF: Self = Self(0x0001);
    pub const MEMORY_ALLOCATION: Self = Self(0x0002);
    pub const RESOURCE_DESCRIPTOR: Self = Self(0x0003);
    pub const GUID_EXTENSION: Self = Self(0x0004);
    pub const FIRMWARE_VOLUME: Self = Self(0x0005);
    pub const CPU: Self = Self(0x0006);
    pub const MEMORY_POOL: Self = Self(0x0007);
    pub const UNUSED: Self = Self(0xFFFE);
    pub const END_OF_LIST: Self = Self(0xFFFF);
}

/// Boot path reported to the next stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BootMode(pub u32);

impl BootMode {
    pub const FULL_CONFIGURATION: Self = Self(0x00);
    pub const MINIMAL_CONFIGURATION: Self = Self(0x01);
    pub const ASSUMING_NO_CHANGES: Self = Self(0x02);
    pub const WITH_DIAGNOSTICS: Self = Self(0x03);
    pub const DEFAULT_SETTINGS: Self = Self(0x04);
    pub const S3_RESUME: Self = Self(0x11);
    pub const FLASH_UPDATE: Self = Self(0x12);
    pub const RECOVERY: Self = Self(0x20);
}

/// Resource descriptor type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceType(pub u32);

impl ResourceType {
    pub const SYSTEM_MEMORY: Self = Self(0x00);
    pub const MEMORY_MAPPED_IO: Self = Self(0x01);
    pub const IO: Self = Self(0x02);
    pub const FIRMWARE_DEVICE: Self = Self(0x03);
    pub const MEMORY_MAPPED_IO_PORT: Self = Self(0x04);
    pub const MEMORY_RESERVED: Self = Self(0x05);
    pub const IO_RESERVED: Self = Self(0x06);
}

bitflags! {
    /// Resource descriptor attributes
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ResourceAttributes: u32 {
        const PRESENT = 0x0000_0001;
        const INITIALIZED = 0x0000_0002;
        const TESTED = 0x0000_0004;
        const UNCACHEABLE = 0x0000_0400;
        const WRITE_COMBINEABLE = 0x0000_0800;
        const WRITE_THROUGH_CACHEABLE = 0x0000_1000;
        const WRITE_BACK_CACHEABLE = 0x0000_2000;
    }
}

/// Common header of every record
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub kind: RecordKind,
    /// Total record length, header included
    pub length: u16,
    pub reserved: u32,
}

assert_eq_size!(RecordHeader, [u8; RECORD_HEADER_SIZE]);

impl RecordHeader {
    fn read(memory: &[u8], offset: usize) -> Result<Self> {
        Ok(Self {
            kind: RecordKind(read_u16_at(memory, offset)?),
            length: read_u16_at(memory, offset + 2)?,
            reserved: read_u32_at(memory, offset + 4)?,
        })
    }

    fn write(&self, memory: &mut [u8], offset: usize) -> Result<()> {
        write_u16_at(memory, offset, self.kind.0)?;
        write_u16_at(memory, offset + 2, self.length)?;
        write_u32_at(memory, offset + 4, self.reserved)?;
        Ok(())
    }

    const fn end_of_list() -> Self {
        Self {
            kind: RecordKind::END_OF_LIST,
            length: RECORD_HEADER_SIZE as u16,
            reserved: 0,
        }
    }
}

/// Location of an appended record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHandle {
    pub address: u64,
    pub kind: RecordKind,
    pub length: u16,
}

/// Borrowed view of one record
#[derive(Debug, Clone, Copy)]
pub struct RecordView<'a> {
    pub address: u64,
    pub header: RecordHeader,
    pub payload: &'a [u8],
}

impl RecordView<'_> {
    pub fn kind(&self) -> RecordKind {
        self.header.kind
    }

    /// Name GUID of a GUID-extension or memory-allocation record
    pub fn name(&self) -> Option<Guid> {
        match self.header.kind {
            RecordKind::GUID_EXTENSION | RecordKind::MEMORY_ALLOCATION => {
                let bytes: [u8; 16] = self.payload.get(..16)?.try_into().ok()?;
                Some(Guid::from_bytes(bytes))
            }
            _ => None,
        }
    }
}

/// Cursor values held by the info record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandoffInfo {
    pub version: u32,
    pub boot_mode: BootMode,
    pub memory_top: u64,
    pub memory_bottom: u64,
    pub free_top: u64,
    pub free_bottom: u64,
    pub end_of_list: u64,
}

/// Append-only hand-off record list
pub struct HandoffRecordList<'m> {
    /// `[memory_bottom, free_top)`; carved pages are split off the top
    memory: &'m mut [u8],
    base: u64,
}

impl<'m> HandoffRecordList<'m> {
    /// Build a fresh list covering `memory`
    pub fn create(memory: &'m mut [u8], boot_mode: BootMode) -> Result<Self> {
        let base = memory.as_ptr() as u64;
        if base % RECORD_ALIGNMENT as u64 != 0 || memory.len() < INFO_RECORD_SIZE + RECORD_HEADER_SIZE {
            log::error!(
                "hand-off region {:#x} ({:#x} bytes) cannot hold a record list",
                base,
                memory.len()
            );
            return Err(LoaderError::InvalidParameter);
        }

        let top = base + memory.len() as u64;
        let end_of_list = base + INFO_RECORD_SIZE as u64;
        memory[..INFO_RECORD_SIZE + RECORD_HEADER_SIZE].fill(0);

        let mut list = Self { memory, base };
        RecordHeader {
            kind: RecordKind::HANDOFF,
            length: INFO_RECORD_SIZE as u16,
            reserved: 0,
        }
        .write(list.memory, 0)?;
        write_u32_at(list.memory, VERSION_OFFSET, HANDOFF_VERSION)?;
        write_u32_at(list.memory, BOOT_MODE_OFFSET, boot_mode.0)?;
        write_u64_at(list.memory, MEMORY_TOP_OFFSET, top)?;
        write_u64_at(list.memory, MEMORY_BOTTOM_OFFSET, base)?;
        write_u64_at(list.memory, FREE_TOP_OFFSET, top)?;
        list.write_end(end_of_list)?;

        log::info!("hand-off record list at {:#x}..{:#x}", base, top);
        Ok(list)
    }

    /// Re-attach to a list built earlier in `memory`
    ///
    /// Pages already carved from the top are split off and not touched.
    pub fn open(memory: &'m mut [u8]) -> Result<Self> {
        let base = memory.as_ptr() as u64;
        let mut list = Self { memory, base };
        let info = list.info().map_err(|_| LoaderError::InvalidParameter)?;
        let header = RecordHeader::read(list.memory, 0).map_err(|_| LoaderError::InvalidParameter)?;

        let region_top = base + list.memory.len() as u64;
        let consistent = header.kind == RecordKind::HANDOFF
            && header.length as usize == INFO_RECORD_SIZE
            && info.memory_bottom == base
            && info.memory_top <= region_top
            && info.free_top <= info.memory_top
            && info.free_bottom <= info.free_top
            && info.end_of_list >= base + INFO_RECORD_SIZE as u64
            && info.end_of_list.checked_add(RECORD_HEADER_SIZE as u64) == Some(info.free_bottom)
            && (info.end_of_list - base) % RECORD_ALIGNMENT as u64 == 0;
        if !consistent {
            log::warn!("no valid hand-off record list at {:#x}", base);
            return Err(LoaderError::InvalidParameter);
        }

        let end = list
            .read_header_at(info.end_of_list)
            .map_err(|_| LoaderError::InvalidParameter)?;
        if end.kind != RecordKind::END_OF_LIST {
            log::warn!("hand-off record list at {:#x} has no end marker", base);
            return Err(LoaderError::InvalidParameter);
        }

        let keep = (info.free_top - base) as usize;
        let memory = mem::take(&mut list.memory);
        list.memory = &mut memory[..keep];
        Ok(list)
    }

    /// Address of the info record; this is what the next stage receives
    pub fn base(&self) -> u64 {
        self.base
    }

    /// Current cursor values
    pub fn info(&self) -> Result<HandoffInfo> {
        Ok(HandoffInfo {
            version: read_u32_at(self.memory, VERSION_OFFSET)?,
            boot_mode: BootMode(read_u32_at(self.memory, BOOT_MODE_OFFSET)?),
            memory_top: read_u64_at(self.memory, MEMORY_TOP_OFFSET)?,
            memory_bottom: read_u64_at(self.memory, MEMORY_BOTTOM_OFFSET)?,
            free_top: read_u64_at(self.memory, FREE_TOP_OFFSET)?,
            free_bottom: read_u64_at(self.memory, FREE_BOTTOM_OFFSET)?,
            end_of_list: read_u64_at(self.memory, END_OF_LIST_OFFSET)?,
        })
    }

    pub fn free_bottom(&self) -> Result<u64> {
        Ok(read_u64_at(self.memory, FREE_BOTTOM_OFFSET)?)
    }

    pub fn free_top(&self) -> Result<u64> {
        Ok(read_u64_at(self.memory, FREE_TOP_OFFSET)?)
    }

    /// Bytes still available between the cursors
    pub fn free_space(&self) -> Result<usize> {
        Ok((self.free_top()? - self.free_bottom()?) as usize)
    }

    pub fn boot_mode(&self) -> Result<BootMode> {
        Ok(BootMode(read_u32_at(self.memory, BOOT_MODE_OFFSET)?))
    }

    pub fn set_boot_mode(&mut self, mode: BootMode) -> Result<()> {
        write_u32_at(self.memory, BOOT_MODE_OFFSET, mode.0)?;
        Ok(())
    }

    /// Append one record with `payload`, padded to the record alignment
    pub fn append_record(&mut self, kind: RecordKind, payload: &[u8]) -> Result<RecordHandle> {
        let length = Self::record_length(kind, payload.len())?;
        let free_bottom = self.free_bottom()?;
        if free_bottom + length as u64 > self.free_top()? {
            log::warn!(
                "hand-off list full: {:#x} bytes requested, {:#x} free",
                length,
                self.free_space()?
            );
            return Err(LoaderError::OutOfSpace);
        }
        self.write_record(kind, payload, length)
    }

    /// Append every record of `batch`, or none of them
    pub fn append_all(&mut self, batch: &[(RecordKind, &[u8])]) -> Result<()> {
        let mut total = 0u64;
        for (kind, payload) in batch {
            total += Self::record_length(*kind, payload.len())? as u64;
        }
        if self.free_bottom()? + total > self.free_top()? {
            log::warn!(
                "hand-off list full: batch of {} records needs {:#x} bytes",
                batch.len(),
                total
            );
            return Err(LoaderError::OutOfSpace);
        }

        for (kind, payload) in batch {
            let length = Self::record_length(*kind, payload.len())?;
            self.write_record(*kind, payload, length)?;
        }
        Ok(())
    }

    /// Payload bytes of an appended record, for producers that fill it later
    pub fn payload_mut(&mut self, handle: &RecordHandle) -> Result<&mut [u8]> {
        let start = self.offset_of(handle.address)? + RECORD_HEADER_SIZE;
        let len = (handle.length as usize)
            .checked_sub(RECORD_HEADER_SIZE)
            .ok_or(LoaderError::InvalidParameter)?;
        let end = start + len;
        if end > self.offset_of(self.free_bottom()?)? {
            return Err(LoaderError::InvalidParameter);
        }
        Ok(&mut self.memory[start..end])
    }

    /// Describe a physical resource range
    pub fn add_resource_descriptor(
        &mut self,
        owner: Guid,
        resource_type: ResourceType,
        attributes: ResourceAttributes,
        start: u64,
        length: u64,
    ) -> Result<RecordHandle> {
        let mut payload = [0u8; RESOURCE_DESCRIPTOR_SIZE];
        payload[..16].copy_from_slice(&owner.to_bytes());
        payload[16..20].copy_from_slice(&resource_type.0.to_le_bytes());
        payload[20..24].copy_from_slice(&attributes.bits().to_le_bytes());
        payload[24..32].copy_from_slice(&start.to_le_bytes());
        payload[32..40].copy_from_slice(&length.to_le_bytes());
        self.append_record(RecordKind::RESOURCE_DESCRIPTOR, &payload)
    }

    /// Record a memory allocation named `name` (all zero for anonymous pages)
    pub fn add_memory_allocation(
        &mut self,
        name: Guid,
        base: u64,
        length: u64,
        memory_type: MemoryType,
    ) -> Result<RecordHandle> {
        let payload = Self::allocation_descriptor(name, base, length, memory_type);
        self.append_record(RecordKind::MEMORY_ALLOCATION, &payload)
    }

    /// Record a loaded module
    pub fn add_module(
        &mut self,
        module_name: Guid,
        base: u64,
        length: u64,
        entry_point: u64,
        memory_type: MemoryType,
    ) -> Result<RecordHandle> {
        let mut payload = [0u8; MODULE_SIZE];
        payload[..MEMORY_ALLOCATION_SIZE].copy_from_slice(&Self::allocation_descriptor(
            MEMORY_ALLOCATION_MODULE,
            base,
            length,
            memory_type,
        ));
        payload[40..56].copy_from_slice(&module_name.to_bytes());
        payload[56..64].copy_from_slice(&entry_point.to_le_bytes());
        self.append_record(RecordKind::MEMORY_ALLOCATION, &payload)
    }

    /// Publish a firmware volume to the next stage
    pub fn add_firmware_volume(&mut self, base: u64, length: u64) -> Result<RecordHandle> {
        let mut payload = [0u8; FIRMWARE_VOLUME_SIZE];
        payload[..8].copy_from_slice(&base.to_le_bytes());
        payload[8..].copy_from_slice(&length.to_le_bytes());
        self.append_record(RecordKind::FIRMWARE_VOLUME, &payload)
    }

    /// Record the processor's address space widths
    pub fn add_cpu(&mut self, memory_space_bits: u8, io_space_bits: u8) -> Result<RecordHandle> {
        let mut payload = [0u8; CPU_SIZE];
        payload[0] = memory_space_bits;
        payload[1] = io_space_bits;
        self.append_record(RecordKind::CPU, &payload)
    }

    /// Append opaque data tagged with `guid`
    pub fn add_guid_data(&mut self, guid: Guid, data: &[u8]) -> Result<RecordHandle> {
        let length = Self::record_length(RecordKind::GUID_EXTENSION, 16 + data.len())?;
        let free_bottom = self.free_bottom()?;
        if free_bottom + length as u64 > self.free_top()? {
            log::warn!("hand-off list full: no room for {:#x} bytes of GUID data", data.len());
            return Err(LoaderError::OutOfSpace);
        }

        let handle = self.write_record(RecordKind::GUID_EXTENSION, &guid.to_bytes(), length)?;
        let payload = self.payload_mut(&handle)?;
        payload[16..16 + data.len()].copy_from_slice(data);
        Ok(handle)
    }

    /// Carve `pages` page-aligned pages from the free top and record them
    pub fn allocate_pages(&mut self, pages: usize, memory_type: MemoryType) -> Result<&'m mut [u8]> {
        let size = pages.checked_mul(PAGE_SIZE).ok_or(LoaderError::InvalidParameter)?;
        if size == 0 {
            return Err(LoaderError::InvalidParameter);
        }

        let free_top = self.free_top()?;
        let free_bottom = self.free_bottom()?;
        let record = MEMORY_ALLOCATION_SIZE as u64 + RECORD_HEADER_SIZE as u64;
        let new_top = free_top
            .checked_sub(size as u64)
            .map(|top| align_down(top, PAGE_SIZE as u64))
            .filter(|top| *top >= free_bottom + record)
            .ok_or_else(|| {
                log::warn!(
                    "hand-off region cannot supply {} pages ({:#x}..{:#x} free)",
                    pages,
                    free_bottom,
                    free_top
                );
                LoaderError::OutOfResources
            })?;

        self.add_memory_allocation(Guid::ZERO, new_top, size as u64, memory_type)?;
        write_u64_at(self.memory, FREE_TOP_OFFSET, new_top)?;

        let split = (new_top - self.base) as usize;
        let memory = mem::take(&mut self.memory);
        let (low, high) = memory.split_at_mut(split);
        self.memory = low;
        log::debug!("hand-off region supplied {} pages at {:#x}", pages, new_top);
        Ok(&mut high[..size])
    }

    /// Walk every record from the info record up to the end marker
    pub fn records(&self) -> Records<'_> {
        Records {
            memory: self.memory,
            base: self.base,
            offset: 0,
            done: false,
        }
    }

    fn record_length(kind: RecordKind, payload_len: usize) -> Result<usize> {
        if kind == RecordKind::END_OF_LIST || kind == RecordKind::HANDOFF {
            return Err(LoaderError::InvalidParameter);
        }
        let length = align_up(RECORD_HEADER_SIZE + payload_len, RECORD_ALIGNMENT)
            .ok_or(LoaderError::InvalidParameter)?;
        if length > u16::MAX as usize {
            return Err(LoaderError::InvalidParameter);
        }
        Ok(length)
    }

    fn allocation_descriptor(
        name: Guid,
        base: u64,
        length: u64,
        memory_type: MemoryType,
    ) -> [u8; MEMORY_ALLOCATION_SIZE] {
        let mut payload = [0u8; MEMORY_ALLOCATION_SIZE];
        payload[..16].copy_from_slice(&name.to_bytes());
        payload[16..24].copy_from_slice(&base.to_le_bytes());
        payload[24..32].copy_from_slice(&length.to_le_bytes());
        payload[32..36].copy_from_slice(&memory_type.0.to_le_bytes());
        payload
    }

    /// Write a record over the current end marker; space was checked
    fn write_record(&mut self, kind: RecordKind, payload: &[u8], length: usize) -> Result<RecordHandle> {
        let address = read_u64_at(self.memory, END_OF_LIST_OFFSET)?;
        let offset = self.offset_of(address)?;
        let record = self
            .memory
            .get_mut(offset..offset + length)
            .ok_or(LoaderError::OutOfSpace)?;

        record.fill(0);
        record[RECORD_HEADER_SIZE..RECORD_HEADER_SIZE + payload.len()].copy_from_slice(payload);
        let header = RecordHeader {
            kind,
            length: length as u16,
            reserved: 0,
        };
        header.write(record, 0)?;
        self.write_end(address + length as u64)?;

        log::debug!("hand-off record {:#06x} at {:#x} ({} bytes)", kind.0, address, length);
        Ok(RecordHandle {
            address,
            kind,
            length: length as u16,
        })
    }

    fn write_end(&mut self, address: u64) -> Result<()> {
        let offset = self.offset_of(address)?;
        RecordHeader::end_of_list().write(self.memory, offset)?;
        write_u64_at(self.memory, END_OF_LIST_OFFSET, address)?;
        write_u64_at(self.memory, FREE_BOTTOM_OFFSET, address + RECORD_HEADER_SIZE as u64)?;
        Ok(())
    }

    fn read_header_at(&self, address: u64) -> Result<RecordHeader> {
        RecordHeader::read(self.memory, self.offset_of(address)?)
    }

    fn offset_of(&self, address: u64) -> Result<usize> {
        address
            .checked_sub(self.base)
            .map(|offset| offset as usize)
            .filter(|offset| *offset <= self.memory.len())
            .ok_or(LoaderError::InvalidParameter)
    }
}

impl core::fmt::Debug for HandoffRecordList<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HandoffRecordList")
            .field("base", &format_args!("{:#x}", self.base))
            .field("info", &self.info().ok())
            .finish()
    }
}

/// Iterator over the records of a list
pub struct Records<'a> {
    memory: &'a [u8],
    base: u64,
    offset: usize,
    done: bool,
}

impl<'a> Iterator for Records<'a> {
    type Item = Result<RecordView<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let header = match RecordHeader::read(self.memory, self.offset) {
            Ok(header) => header,
            Err(error) => {
                self.done = true;
                return Some(Err(error));
            }
        };
        if header.kind == RecordKind::END_OF_LIST {
            self.done = true;
            return None;
        }

        let length = header.length as usize;
        let end = self.offset + length;
        if length < RECORD_HEADER_SIZE || length % RECORD_ALIGNMENT != 0 || end > self.memory.len() {
            log::warn!(
                "malformed hand-off record at {:#x}",
                self.base + self.offset as u64
            );
            self.done = true;
            return Some(Err(LoaderError::InvalidParameter));
        }

        let view = RecordView {
            address: self.base + self.offset as u64,
            header,
            payload: &self.memory[self.offset + RECORD_HEADER_SIZE..end],
        };
        self.offset = end;
        Some(Ok(view))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;
    use alloc::vec::Vec;

    /// 8-byte aligned backing store
    fn region(bytes: usize) -> Vec<u64> {
        vec![0u64; bytes / 8]
    }

    fn as_bytes(words: &mut [u64]) -> &mut [u8] {
        let len = words.len() * 8;
        // SAFETY: u64 storage reinterpreted as bytes of the same length.
        unsafe { core::slice::from_raw_parts_mut(words.as_mut_ptr().cast::<u8>(), len) }
    }

    #[test]
    fn test_create_initializes_cursors() {
        let mut words = region(0x200);
        let memory = as_bytes(&mut words);
        let list = HandoffRecordList::create(memory, BootMode::FULL_CONFIGURATION).unwrap();
        let info = list.info().unwrap();

        assert_eq!(info.version, HANDOFF_VERSION);
        assert_eq!(info.memory_bottom, list.base());
        assert_eq!(info.memory_top, list.base() + 0x200);
        assert_eq!(info.free_top, info.memory_top);
        assert_eq!(info.end_of_list, list.base() + INFO_RECORD_SIZE as u64);
        assert_eq!(info.free_bottom, info.end_of_list + 8);
    }

    #[test]
    fn test_append_pads_and_moves_end_marker() {
        let mut words = region(0x200);
        let mut list = HandoffRecordList::create(as_bytes(&mut words), BootMode::FULL_CONFIGURATION).unwrap();
        let before = list.info().unwrap();

        let handle = list.append_record(RecordKind::UNUSED, &[1, 2, 3]).unwrap();
        assert_eq!(handle.address, before.end_of_list);
        assert_eq!(handle.length, 16);

        let after = list.info().unwrap();
        assert_eq!(after.end_of_list, before.end_of_list + 16);
        assert_eq!(after.free_bottom, before.free_bottom + 16);
    }

    #[test]
    fn test_out_of_space_keeps_cursors() {
        let mut words = region(0x80);
        let mut list = HandoffRecordList::create(as_bytes(&mut words), BootMode::FULL_CONFIGURATION).unwrap();
        let before = list.free_bottom().unwrap();

        assert_eq!(
            list.append_record(RecordKind::UNUSED, &[0u8; 0x40]),
            Err(LoaderError::OutOfSpace)
        );
        assert_eq!(list.free_bottom().unwrap(), before);
    }

    #[test]
    fn test_reserved_kinds_rejected() {
        let mut words = region(0x100);
        let mut list = HandoffRecordList::create(as_bytes(&mut words), BootMode::FULL_CONFIGURATION).unwrap();
        assert_eq!(
            list.append_record(RecordKind::END_OF_LIST, &[]),
            Err(LoaderError::InvalidParameter)
        );
        assert_eq!(
            list.append_record(RecordKind::HANDOFF, &[]),
            Err(LoaderError::InvalidParameter)
        );
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let mut words = region(0x100);
        let mut list = HandoffRecordList::create(as_bytes(&mut words), BootMode::FULL_CONFIGURATION).unwrap();
        let payload = vec![0u8; u16::MAX as usize];
        assert_eq!(
            list.append_record(RecordKind::UNUSED, &payload),
            Err(LoaderError::InvalidParameter)
        );
    }

    #[test]
    fn test_boot_mode_round_trip() {
        let mut words = region(0x100);
        let mut list = HandoffRecordList::create(as_bytes(&mut words), BootMode::FULL_CONFIGURATION).unwrap();
        list.set_boot_mode(BootMode::RECOVERY).unwrap();
        assert_eq!(list.boot_mode().unwrap(), BootMode::RECOVERY);
    }

    #[test]
    fn test_payload_of_short_handle_rejected() {
        let mut words = region(0x100);
        let mut list = HandoffRecordList::create(as_bytes(&mut words), BootMode::FULL_CONFIGURATION).unwrap();
        let handle = list.append_record(RecordKind::UNUSED, &[1, 2, 3]).unwrap();
        assert_eq!(list.payload_mut(&handle).unwrap().len(), 8);

        let short = RecordHandle { length: 4, ..handle };
        assert_eq!(list.payload_mut(&short).err(), Some(LoaderError::InvalidParameter));
    }

    #[test]
    fn test_open_rejects_wrapping_end_of_list() {
        let mut words = region(0x100);
        {
            let mut list =
                HandoffRecordList::create(as_bytes(&mut words), BootMode::FULL_CONFIGURATION).unwrap();
            list.append_record(RecordKind::UNUSED, &[7; 8]).unwrap();
        }
        assert!(HandoffRecordList::open(as_bytes(&mut words)).is_ok());

        words[END_OF_LIST_OFFSET / 8] = u64::MAX - 3;
        assert_eq!(
            HandoffRecordList::open(as_bytes(&mut words)).err(),
            Some(LoaderError::InvalidParameter)
        );
    }

    #[test]
    fn test_misaligned_region_rejected() {
        let mut words = region(0x100);
        let memory = as_bytes(&mut words);
        assert_eq!(
            HandoffRecordList::create(&mut memory[4..], BootMode::FULL_CONFIGURATION).err(),
            Some(LoaderError::InvalidParameter)
        );
    }
}
