// PE/COFF and TE on-disk layout

use crate::error::Result;
use crate::utils::cursor::ByteCursor;

pub const DOS_SIGNATURE: u16 = 0x5A4D; // "MZ"
pub const DOS_LFANEW_OFFSET: usize = 0x3C;
pub const PE_SIGNATURE: u32 = 0x0000_4550; // "PE\0\0"
pub const TE_SIGNATURE: u16 = 0x5A56; // "VZ"

pub const PE32_MAGIC: u16 = 0x010B;
pub const PE32_PLUS_MAGIC: u16 = 0x020B;

pub const COFF_HEADER_SIZE: usize = 20;
pub const SECTION_HEADER_SIZE: usize = 40;
pub const TE_HEADER_SIZE: usize = 40;
pub const DEBUG_DIRECTORY_ENTRY_SIZE: usize = 28;

/// COFF machine types
pub mod machine {
    pub const I386: u16 = 0x014C;
    pub const AMD64: u16 = 0x8664;
    pub const ARM64: u16 = 0xAA64;
    pub const RISCV64: u16 = 0x5064;
}

/// COFF characteristics
pub mod characteristics {
    pub const RELOCS_STRIPPED: u16 = 0x0001;
    pub const EXECUTABLE_IMAGE: u16 = 0x0002;
}

/// Optional header subsystem values for firmware images
pub mod subsystem {
    pub const EFI_APPLICATION: u16 = 10;
    pub const EFI_BOOT_SERVICE_DRIVER: u16 = 11;
    pub const EFI_RUNTIME_DRIVER: u16 = 12;
}

/// Data directory indices
pub mod directory {
    pub const EXPORT: usize = 0;
    pub const IMPORT: usize = 1;
    pub const BASERELOC: usize = 5;
    pub const DEBUG: usize = 6;
}

/// Base relocation types
pub mod reloc {
    pub const ABSOLUTE: u16 = 0;
    pub const HIGH: u16 = 1;
    pub const LOW: u16 = 2;
    pub const HIGHLOW: u16 = 3;
    pub const HIGHADJ: u16 = 4;
    pub const DIR64: u16 = 10;
}

pub const DEBUG_TYPE_CODEVIEW: u32 = 2;
pub const CODEVIEW_NB10: u32 = u32::from_le_bytes(*b"NB10");
pub const CODEVIEW_RSDS: u32 = u32::from_le_bytes(*b"RSDS");
pub const CODEVIEW_NB10_HEADER_SIZE: usize = 16;
pub const CODEVIEW_RSDS_HEADER_SIZE: usize = 24;

/// Relocation block header
pub const RELOC_BLOCK_HEADER_SIZE: usize = 8;

/// RVA and size of a data directory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DataDirectory {
    pub rva: u32,
    pub size: u32,
}

impl DataDirectory {
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }
}

/// Section table entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionHeader {
    pub name: [u8; 8],
    pub virtual_size: u32,
    pub virtual_address: u32,
    pub raw_size: u32,
    pub raw_offset: u32,
    pub characteristics: u32,
}

impl SectionHeader {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let mut cursor = ByteCursor::new(bytes);
        let mut name = [0u8; 8];
        name.copy_from_slice(cursor.read_bytes(8)?);
        let virtual_size = cursor.read_u32()?;
        let virtual_address = cursor.read_u32()?;
        let raw_size = cursor.read_u32()?;
        let raw_offset = cursor.read_u32()?;
        cursor.skip(12)?;
        let characteristics = cursor.read_u32()?;
        Ok(Self {
            name,
            virtual_size,
            virtual_address,
            raw_size,
            raw_offset,
            characteristics,
        })
    }

    /// Bytes copied from the file: the virtual size, unless it is zero or
    /// larger than the raw data
    pub fn copy_size(&self) -> u32 {
        if self.virtual_size == 0 || self.virtual_size > self.raw_size {
            self.raw_size
        } else {
            self.virtual_size
        }
    }

    /// Check whether `rva` falls inside the section in memory
    pub fn contains_rva(&self, rva: u32) -> bool {
        let span = self.virtual_size.max(self.raw_size);
        rva >= self.virtual_address && rva - self.virtual_address < span
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(virtual_size: u32, raw_size: u32) -> SectionHeader {
        SectionHeader {
            name: *b".text\0\0\0",
            virtual_size,
            virtual_address: 0x1000,
            raw_size,
            raw_offset: 0x400,
            characteristics: 0,
        }
    }

    #[test]
    fn test_copy_size_rules() {
        assert_eq!(header(0x100, 0x200).copy_size(), 0x100);
        assert_eq!(header(0x300, 0x200).copy_size(), 0x200);
        assert_eq!(header(0, 0x200).copy_size(), 0x200);
    }

    #[test]
    fn test_section_header_parse() {
        let mut raw = [0u8; SECTION_HEADER_SIZE];
        raw[..5].copy_from_slice(b".data");
        raw[8..12].copy_from_slice(&0x80u32.to_le_bytes());
        raw[12..16].copy_from_slice(&0x2000u32.to_le_bytes());
        raw[16..20].copy_from_slice(&0x200u32.to_le_bytes());
        raw[20..24].copy_from_slice(&0x600u32.to_le_bytes());
        raw[36..40].copy_from_slice(&0xC000_0040u32.to_le_bytes());

        let parsed = SectionHeader::parse(&raw).unwrap();
        assert_eq!(&parsed.name[..5], b".data");
        assert_eq!(parsed.virtual_address, 0x2000);
        assert_eq!(parsed.raw_offset, 0x600);
        assert!(parsed.contains_rva(0x21FF));
        assert!(!parsed.contains_rva(0x2200));
    }
}
