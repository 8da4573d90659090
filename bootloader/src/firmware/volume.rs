//! Firmware volume and FFS file parsing
//!
//! A [`FirmwareVolume`] borrows the volume bytes in place; nothing is copied
//! until a section needs decoding or realignment.

use bitflags::bitflags;
use uefi_raw::Guid;

use super::guids::{FFS2_FILE_SYSTEM, FFS3_FILE_SYSTEM};
use crate::error::{LoaderError, Result};
use crate::utils::cursor::{ByteCursor, read_u32_at};

/// `_FVH`
pub const FVH_SIGNATURE: u32 = u32::from_le_bytes(*b"_FVH");

/// Offset of the signature inside the volume header
pub const FVH_SIGNATURE_OFFSET: usize = 40;

/// Fixed part of the volume header, without the block map
pub const FVH_FIXED_SIZE: usize = 56;

/// FFS files start on 8-byte boundaries
pub const FFS_FILE_ALIGNMENT: usize = 8;

const FFS_HEADER_SIZE: usize = 24;
const FFS_LARGE_HEADER_SIZE: usize = 32;
const FFS_STATE_OFFSET: usize = 23;
const FFS_FILE_CHECKSUM_OFFSET: usize = 17;

bitflags! {
    /// Volume attributes (FVB2 encoding)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VolumeAttributes: u32 {
        const READ_STATUS = 0x0000_0004;
        const WRITE_STATUS = 0x0000_0020;
        const MEMORY_MAPPED = 0x0000_0200;
        const ERASE_POLARITY = 0x0000_0800;
        const WEAK_ALIGNMENT = 0x8000_0000;
    }
}

const ALIGNMENT_MASK: u32 = 0x001F_0000;
const ALIGNMENT_SHIFT: u32 = 16;

bitflags! {
    /// FFS file attributes
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FileAttributes: u8 {
        const LARGE_FILE = 0x01;
        const DATA_ALIGNMENT_2 = 0x02;
        const FIXED = 0x04;
        const DATA_ALIGNMENT = 0x38;
        const CHECKSUM = 0x40;
    }
}

bitflags! {
    /// FFS file state bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FileState: u8 {
        const HEADER_CONSTRUCTION = 0x01;
        const HEADER_VALID = 0x02;
        const DATA_VALID = 0x04;
        const MARKED_FOR_UPDATE = 0x08;
        const DELETED = 0x10;
        const HEADER_INVALID = 0x20;
    }
}

impl FileState {
    /// Highest set state bit, which decides how the file is treated
    pub fn effective(self) -> FileState {
        match self.bits() {
            0 => FileState::empty(),
            bits => FileState::from_bits_truncate(1 << (7 - bits.leading_zeros())),
        }
    }
}

/// FFS file type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    /// Search wildcard; never stored in a volume
    All,
    Raw,
    Freeform,
    SecurityCore,
    PeiCore,
    DxeCore,
    Peim,
    Driver,
    CombinedPeimDriver,
    Application,
    Mm,
    FirmwareVolumeImage,
    CombinedMmDxe,
    MmCore,
    Pad,
    Other(u8),
}

impl FileKind {
    pub fn from_u8(raw: u8) -> Self {
        match raw {
            0x00 => FileKind::All,
            0x01 => FileKind::Raw,
            0x02 => FileKind::Freeform,
            0x03 => FileKind::SecurityCore,
            0x04 => FileKind::PeiCore,
            0x05 => FileKind::DxeCore,
            0x06 => FileKind::Peim,
            0x07 => FileKind::Driver,
            0x08 => FileKind::CombinedPeimDriver,
            0x09 => FileKind::Application,
            0x0A => FileKind::Mm,
            0x0B => FileKind::FirmwareVolumeImage,
            0x0C => FileKind::CombinedMmDxe,
            0x0D => FileKind::MmCore,
            0xF0 => FileKind::Pad,
            other => FileKind::Other(other),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            FileKind::All => 0x00,
            FileKind::Raw => 0x01,
            FileKind::Freeform => 0x02,
            FileKind::SecurityCore => 0x03,
            FileKind::PeiCore => 0x04,
            FileKind::DxeCore => 0x05,
            FileKind::Peim => 0x06,
            FileKind::Driver => 0x07,
            FileKind::CombinedPeimDriver => 0x08,
            FileKind::Application => 0x09,
            FileKind::Mm => 0x0A,
            FileKind::FirmwareVolumeImage => 0x0B,
            FileKind::CombinedMmDxe => 0x0C,
            FileKind::MmCore => 0x0D,
            FileKind::Pad => 0xF0,
            FileKind::Other(raw) => raw,
        }
    }

    /// Check whether a file of kind `self` satisfies a search for `wanted`
    pub fn matches(self, wanted: FileKind) -> bool {
        wanted == FileKind::All || self == wanted
    }
}

/// A parsed firmware volume borrowing its bytes
#[derive(Clone, Copy, Debug)]
pub struct FirmwareVolume<'a> {
    data: &'a [u8],
    attributes: VolumeAttributes,
    file_system: Guid,
    name: Option<Guid>,
    files_offset: usize,
}

impl<'a> FirmwareVolume<'a> {
    /// Quick signature probe used on decoded section output
    pub fn looks_like_volume(data: &[u8]) -> bool {
        read_u32_at(data, FVH_SIGNATURE_OFFSET) == Ok(FVH_SIGNATURE)
    }

    /// Parse and validate a volume header
    pub fn parse(data: &'a [u8]) -> Result<Self> {
        let mut cursor = ByteCursor::new(data);
        cursor.skip(16)?;
        let file_system = cursor.read_guid()?;
        let length = cursor.read_u64()?;
        let signature = cursor.read_u32()?;
        let attributes = VolumeAttributes::from_bits_retain(cursor.read_u32()?);
        let header_length = cursor.read_u16()? as usize;
        let _checksum = cursor.read_u16()?;
        let ext_header_offset = cursor.read_u16()? as usize;

        if signature != FVH_SIGNATURE {
            return Err(LoaderError::VolumeCorrupted);
        }

        let length = usize::try_from(length).map_err(|_| LoaderError::VolumeCorrupted)?;
        if length > data.len() || header_length < FVH_FIXED_SIZE || header_length > length {
            log::warn!(
                "volume header rejected: length {:#x}, header {:#x}, available {:#x}",
                length,
                header_length,
                data.len()
            );
            return Err(LoaderError::VolumeCorrupted);
        }
        if header_length % 2 != 0 || header_checksum(&data[..header_length]) != 0 {
            return Err(LoaderError::VolumeCorrupted);
        }

        if file_system != FFS2_FILE_SYSTEM && file_system != FFS3_FILE_SYSTEM {
            log::debug!("volume with foreign file system {}", file_system);
            return Err(LoaderError::Unsupported);
        }

        let data = &data[..length];
        let (name, files_start) = if ext_header_offset != 0 {
            let mut ext = ByteCursor::at(data, ext_header_offset)?;
            let name = ext.read_guid()?;
            let ext_size = ext.read_u32()? as usize;
            let end = ext_header_offset
                .checked_add(ext_size)
                .filter(|end| *end <= length)
                .ok_or(LoaderError::VolumeCorrupted)?;
            (Some(name), end)
        } else {
            (None, header_length)
        };

        let files_offset = crate::utils::mem_util::align_up(files_start, FFS_FILE_ALIGNMENT)
            .ok_or(LoaderError::VolumeCorrupted)?
            .min(length);

        Ok(Self {
            data,
            attributes,
            file_system,
            name,
            files_offset,
        })
    }

    /// The volume bytes, `FvLength` long
    pub fn bytes(&self) -> &'a [u8] {
        self.data
    }

    /// Address the volume currently lives at
    pub fn base_address(&self) -> u64 {
        self.data.as_ptr() as u64
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn attributes(&self) -> VolumeAttributes {
        self.attributes
    }

    pub fn file_system(&self) -> Guid {
        self.file_system
    }

    /// Volume name from the extended header, if any
    pub fn name(&self) -> Option<Guid> {
        self.name
    }

    /// Erased flash reads as all ones
    pub fn erase_polarity(&self) -> bool {
        self.attributes.contains(VolumeAttributes::ERASE_POLARITY)
    }

    /// Required base alignment of the volume in memory
    pub fn alignment(&self) -> u64 {
        if self.attributes.contains(VolumeAttributes::WEAK_ALIGNMENT) {
            return 8;
        }
        1u64 << ((self.attributes.bits() & ALIGNMENT_MASK) >> ALIGNMENT_SHIFT)
    }

    /// Check whether the current address satisfies [`Self::alignment`]
    pub fn is_aligned(&self) -> bool {
        crate::utils::mem_util::is_aligned(self.base_address(), self.alignment())
    }

    /// Iterate over the valid files of the volume
    pub fn files(&self) -> Files<'a> {
        Files {
            data: self.data,
            offset: self.files_offset,
            erase_byte: if self.erase_polarity() { 0xFF } else { 0x00 },
            done: false,
        }
    }

    /// First file of `kind`
    pub fn find_file(&self, kind: FileKind) -> Result<FfsFile<'a>> {
        for file in self.files() {
            let file = file?;
            if file.kind.matches(kind) {
                return Ok(file);
            }
        }
        Err(LoaderError::NotFound)
    }
}

/// 16-bit sum over a header, zero when the checksum field is correct
fn header_checksum(header: &[u8]) -> u16 {
    header
        .chunks_exact(2)
        .fold(0u16, |sum, word| sum.wrapping_add(u16::from_le_bytes([word[0], word[1]])))
}

/// A file inside a volume
#[derive(Clone, Copy, Debug)]
pub struct FfsFile<'a> {
    pub name: Guid,
    pub kind: FileKind,
    pub attributes: FileAttributes,
    /// Offset of the file header inside the volume
    pub offset: usize,
    /// Section stream following the header
    pub data: &'a [u8],
}

/// Iterator over the files of a volume
pub struct Files<'a> {
    data: &'a [u8],
    offset: usize,
    erase_byte: u8,
    done: bool,
}

impl<'a> Files<'a> {
    fn next_file(&mut self) -> Result<Option<FfsFile<'a>>> {
        loop {
            let Ok(header) = ByteCursor::at(self.data, self.offset)
                .and_then(|cursor| cursor.peek_bytes(FFS_HEADER_SIZE))
            else {
                return Ok(None);
            };
            if header.iter().all(|byte| *byte == self.erase_byte) {
                return Ok(None);
            }

            let attributes = FileAttributes::from_bits_truncate(header[19]);
            let raw_state = header[FFS_STATE_OFFSET];
            let state = if self.erase_byte == 0xFF { !raw_state } else { raw_state };
            let state = FileState::from_bits_truncate(state).effective();

            let (header_size, size) = if attributes.contains(FileAttributes::LARGE_FILE) {
                let size = read_u32_at(self.data, self.offset + FFS_HEADER_SIZE)? as usize;
                (FFS_LARGE_HEADER_SIZE, size)
            } else {
                let size = u32::from_le_bytes([header[20], header[21], header[22], 0]) as usize;
                (FFS_HEADER_SIZE, size)
            };

            if state == FileState::HEADER_CONSTRUCTION || state == FileState::HEADER_INVALID {
                self.advance(header_size)?;
                continue;
            }

            let end = self
                .offset
                .checked_add(size)
                .filter(|end| size >= header_size && *end <= self.data.len())
                .ok_or(LoaderError::VolumeCorrupted)?;

            if state != FileState::DATA_VALID && state != FileState::MARKED_FOR_UPDATE {
                self.advance(size)?;
                continue;
            }

            let raw_header = &self.data[self.offset..self.offset + header_size];
            if !header_sum_is_valid(raw_header) {
                log::warn!("file header checksum mismatch at offset {:#x}", self.offset);
                return Err(LoaderError::VolumeCorrupted);
            }

            let mut cursor = ByteCursor::new(header);
            let name = cursor.read_guid()?;
            let kind = FileKind::from_u8(header[18]);
            let file = FfsFile {
                name,
                kind,
                attributes,
                offset: self.offset,
                data: &self.data[self.offset + header_size..end],
            };
            self.advance(size)?;

            if kind == FileKind::Pad {
                continue;
            }
            return Ok(Some(file));
        }
    }

    fn advance(&mut self, size: usize) -> Result<()> {
        let next = self
            .offset
            .checked_add(size)
            .ok_or(LoaderError::VolumeCorrupted)?;
        self.offset = crate::utils::mem_util::align_up(next, FFS_FILE_ALIGNMENT)
            .ok_or(LoaderError::VolumeCorrupted)?;
        Ok(())
    }
}

/// 8-bit header sum excluding the state and file checksum bytes
fn header_sum_is_valid(header: &[u8]) -> bool {
    let sum = header.iter().fold(0u8, |sum, byte| sum.wrapping_add(*byte));
    let excluded = header[FFS_STATE_OFFSET].wrapping_add(header[FFS_FILE_CHECKSUM_OFFSET]);
    sum.wrapping_sub(excluded) == 0
}

impl<'a> Iterator for Files<'a> {
    type Item = Result<FfsFile<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_file() {
            Ok(Some(file)) => Some(Ok(file)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(error) => {
                self.done = true;
                Some(Err(error))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_kind_round_trip_for_known_values() {
        assert_eq!(FileKind::from_u8(0x05), FileKind::DxeCore);
        assert_eq!(FileKind::DxeCore.as_u8(), 0x05);
        assert_eq!(FileKind::from_u8(0x42), FileKind::Other(0x42));
    }

    #[test]
    fn test_wildcard_matches_everything() {
        assert!(FileKind::Peim.matches(FileKind::All));
        assert!(FileKind::Peim.matches(FileKind::Peim));
        assert!(!FileKind::Peim.matches(FileKind::DxeCore));
    }

    #[test]
    fn test_effective_state_is_highest_bit() {
        let state = FileState::HEADER_CONSTRUCTION | FileState::HEADER_VALID | FileState::DATA_VALID;
        assert_eq!(state.effective(), FileState::DATA_VALID);
        let deleted = state | FileState::DELETED;
        assert_eq!(deleted.effective(), FileState::DELETED);
    }

    #[test]
    fn test_rejects_missing_signature() {
        let data = [0u8; 128];
        assert!(!FirmwareVolume::looks_like_volume(&data));
        assert_eq!(
            FirmwareVolume::parse(&data).unwrap_err(),
            LoaderError::VolumeCorrupted
        );
    }

    #[test]
    fn test_truncated_header_is_corrupted() {
        assert_eq!(
            FirmwareVolume::parse(&[0u8; 20]).unwrap_err(),
            LoaderError::VolumeCorrupted
        );
    }

    #[test]
    fn test_header_checksum_sums_words() {
        let header = [0x01, 0x00, 0xFF, 0xFF];
        assert_eq!(header_checksum(&header), 0);
    }
}
