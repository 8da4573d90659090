//! Common test utilities
//!
//! Builders for firmware volumes, files, sections and PE/TE images laid out
//! in memory the way firmware tools emit them, plus a leaked page arena.

#![allow(dead_code)]

use std::alloc::{Layout, alloc_zeroed};

use nos_stage_loader::codec::crc32::crc32;
use nos_stage_loader::firmware::guids::FFS2_FILE_SYSTEM;
use nos_stage_loader::image::pe::{characteristics, machine, reloc, subsystem};
use nos_stage_loader::memory::{BumpPageAllocator, PAGE_SIZE};
use uefi_raw::{Guid, guid};

pub const DXE_CORE_FILE: Guid = guid!("d6a2cb7f-6a18-4e2f-b43b-9920a733700a");
pub const DRIVER_FILE: Guid = guid!("4b28e4c7-ff36-4e10-93cf-a82159e777c5");
pub const VOLUME_IMAGE_FILE: Guid = guid!("5c60f367-a505-419a-859e-2a4ff6ca6fe5");
pub const UNKNOWN_EXTRACTOR: Guid = guid!("0f9d89e8-9259-4f76-a5af-0c89e34023df");

pub mod file_kind {
    pub const DXE_CORE: u8 = 0x05;
    pub const DRIVER: u8 = 0x07;
    pub const FIRMWARE_VOLUME_IMAGE: u8 = 0x0B;
}

pub mod section_kind {
    pub const COMPRESSION: u8 = 0x01;
    pub const GUID_DEFINED: u8 = 0x02;
    pub const PE32: u8 = 0x10;
    pub const TE: u8 = 0x12;
    pub const FIRMWARE_VOLUME_IMAGE: u8 = 0x17;
    pub const RAW: u8 = 0x19;
}

pub const PROCESSING_REQUIRED: u16 = 0x0001;
pub const AUTH_STATUS_VALID: u16 = 0x0002;

const FV_HEADER_LENGTH: usize = 72;

fn put_u16(bytes: &mut [u8], offset: usize, value: u16) {
    bytes[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

fn put_u32(bytes: &mut [u8], offset: usize, value: u32) {
    bytes[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn put_u64(bytes: &mut [u8], offset: usize, value: u64) {
    bytes[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

fn pad_to(bytes: &mut Vec<u8>, alignment: usize) {
    while bytes.len() % alignment != 0 {
        bytes.push(0);
    }
}

// ============================================================================
// Sections, files and volumes
// ============================================================================

/// Leaf section with a 4-byte common header
pub fn section(kind: u8, body: &[u8]) -> Vec<u8> {
    let size = (body.len() + 4) as u32;
    let mut bytes = size.to_le_bytes()[..3].to_vec();
    bytes.push(kind);
    bytes.extend_from_slice(body);
    bytes
}

/// Concatenate sections, 4-byte aligning each
pub fn stream(sections: &[Vec<u8>]) -> Vec<u8> {
    let mut bytes = Vec::new();
    for section in sections {
        pad_to(&mut bytes, 4);
        bytes.extend_from_slice(section);
    }
    bytes
}

pub fn compressed_section(scheme: u8, uncompressed_len: u32, payload: &[u8]) -> Vec<u8> {
    let mut body = uncompressed_len.to_le_bytes().to_vec();
    body.push(scheme);
    body.extend_from_slice(payload);
    section(section_kind::COMPRESSION, &body)
}

pub fn guided_section(extractor: Guid, attributes: u16, header: &[u8], payload: &[u8]) -> Vec<u8> {
    let data_offset = (4 + 20 + header.len()) as u16;
    let mut body = extractor.to_bytes().to_vec();
    body.extend_from_slice(&data_offset.to_le_bytes());
    body.extend_from_slice(&attributes.to_le_bytes());
    body.extend_from_slice(header);
    body.extend_from_slice(payload);
    section(section_kind::GUID_DEFINED, &body)
}

/// CRC32 GUID-defined section whose stored CRC is `crc`
pub fn crc32_section_with(crc: u32, attributes: u16, payload: &[u8]) -> Vec<u8> {
    guided_section(
        nos_stage_loader::firmware::guids::CRC32_GUIDED_SECTION,
        attributes,
        &crc.to_le_bytes(),
        payload,
    )
}

pub fn crc32_section(payload: &[u8]) -> Vec<u8> {
    crc32_section_with(crc32(payload), PROCESSING_REQUIRED | AUTH_STATUS_VALID, payload)
}

/// FFS file with a valid header checksum in the DATA_VALID state
pub fn ffs_file(name: Guid, kind: u8, sections: &[u8]) -> Vec<u8> {
    let size = (24 + sections.len()) as u32;
    let mut header = [0u8; 24];
    header[..16].copy_from_slice(&name.to_bytes());
    header[17] = 0xAA;
    header[18] = kind;
    header[19] = 0;
    header[20..23].copy_from_slice(&size.to_le_bytes()[..3]);
    header[23] = 0x07;

    let sum = header
        .iter()
        .enumerate()
        .filter(|(index, _)| *index != 16 && *index != 17 && *index != 23)
        .fold(0u8, |sum, (_, byte)| sum.wrapping_add(*byte));
    header[16] = 0u8.wrapping_sub(sum);

    let mut bytes = header.to_vec();
    bytes.extend_from_slice(sections);
    bytes
}

/// FFS2 volume holding `files`, requiring `1 << alignment_log2` alignment
pub fn volume_aligned(files: &[Vec<u8>], alignment_log2: u32) -> Vec<u8> {
    let mut bytes = vec![0u8; FV_HEADER_LENGTH];
    for file in files {
        pad_to(&mut bytes, 8);
        bytes.extend_from_slice(file);
    }
    pad_to(&mut bytes, 8);
    let length = bytes.len();

    bytes[16..32].copy_from_slice(&FFS2_FILE_SYSTEM.to_bytes());
    put_u64(&mut bytes, 32, length as u64);
    bytes[40..44].copy_from_slice(b"_FVH");
    put_u32(&mut bytes, 44, 0x0000_0204 | (alignment_log2 << 16));
    put_u16(&mut bytes, 48, FV_HEADER_LENGTH as u16);
    bytes[55] = 2;
    put_u32(&mut bytes, 56, 1);
    put_u32(&mut bytes, 60, length as u32);

    let sum = bytes[..FV_HEADER_LENGTH]
        .chunks_exact(2)
        .fold(0u16, |sum, word| sum.wrapping_add(u16::from_le_bytes([word[0], word[1]])));
    put_u16(&mut bytes, 50, 0u16.wrapping_sub(sum));
    bytes
}

pub fn volume(files: &[Vec<u8>]) -> Vec<u8> {
    volume_aligned(files, 0)
}

/// Offset of the first section body of the first file in a [`volume`]
pub const FIRST_SECTION_BODY: usize = FV_HEADER_LENGTH + 24 + 4;

// ============================================================================
// Images
// ============================================================================

pub const IMAGE_SIZE: u32 = 0x1000;
pub const HEADERS_SIZE: u32 = 0x200;
pub const TEXT_RVA: u32 = 0x200;
pub const TEXT_SIZE: u32 = 0x400;
pub const DATA_RVA: u32 = 0x600;
pub const DATA_RAW_SIZE: u32 = 0x100;
pub const DATA_VIRTUAL_SIZE: u32 = 0x200;
pub const RELOC_RVA: u32 = 0x800;
pub const RELOC_RAW_SIZE: u32 = 0x200;
pub const FILE_SIZE: usize = 0xA00;
pub const DEBUG_ENTRY_RVA: u32 = 0x680;
pub const CODEVIEW_FILE_OFFSET: usize = 0x700;
pub const PE_HEADER_OFFSET: usize = 0x40;

pub const TEXT_FILL: u8 = 0xCC;
pub const DATA_FILL: u8 = 0x11;

/// Shape of a test image
#[derive(Debug, Clone)]
pub struct ImageSpec {
    pub pe32_plus: bool,
    pub machine: u16,
    pub subsystem: u16,
    pub image_base: u64,
    pub entry_point: u32,
    pub relocs_stripped: bool,
    /// (type, rva, linked value)
    pub fixups: Vec<(u16, u32, u64)>,
    /// Extra block after the valid one, declaring this size
    pub oversized_block: Option<u32>,
    /// Unmapped CodeView record with this PDB path
    pub codeview: Option<&'static str>,
}

impl Default for ImageSpec {
    fn default() -> Self {
        Self {
            pe32_plus: true,
            machine: machine::AMD64,
            subsystem: subsystem::EFI_BOOT_SERVICE_DRIVER,
            image_base: 0x10000,
            entry_point: 0x20,
            relocs_stripped: false,
            fixups: vec![
                (reloc::HIGHLOW, 0x210, 0x10000 + 0x600),
                (reloc::HIGHLOW, 0x218, 0x10000 + 0x680),
                (reloc::DIR64, 0x220, 0x10000 + 0x640),
            ],
            oversized_block: None,
            codeview: None,
        }
    }
}

impl ImageSpec {
    fn optional_header_size(&self) -> usize {
        if self.pe32_plus { 240 } else { 224 }
    }

    /// Offset of the section table; TE images strip everything before it
    pub fn section_table_offset(&self) -> usize {
        PE_HEADER_OFFSET + 4 + 20 + self.optional_header_size()
    }

    fn relocation_directory(&self) -> Vec<u8> {
        if self.relocs_stripped || self.fixups.is_empty() {
            return Vec::new();
        }
        let mut entries: Vec<u16> = self
            .fixups
            .iter()
            .map(|(kind, rva, _)| (kind << 12) | (*rva as u16 & 0x0FFF))
            .collect();
        if entries.len() % 2 != 0 {
            entries.push(0);
        }

        let mut block = 0u32.to_le_bytes().to_vec();
        block.extend_from_slice(&((8 + entries.len() * 2) as u32).to_le_bytes());
        for entry in entries {
            block.extend_from_slice(&entry.to_le_bytes());
        }
        if let Some(size) = self.oversized_block {
            block.extend_from_slice(&0x1000u32.to_le_bytes());
            block.extend_from_slice(&size.to_le_bytes());
        }
        block
    }

    /// PE32 or PE32+ file with a DOS stub
    pub fn build(&self) -> Vec<u8> {
        let mut file = vec![0u8; FILE_SIZE];
        put_u16(&mut file, 0, 0x5A4D);
        put_u32(&mut file, 0x3C, PE_HEADER_OFFSET as u32);
        put_u32(&mut file, PE_HEADER_OFFSET, 0x0000_4550);

        let coff = PE_HEADER_OFFSET + 4;
        put_u16(&mut file, coff, self.machine);
        put_u16(&mut file, coff + 2, 3);
        put_u16(&mut file, coff + 16, self.optional_header_size() as u16);
        let mut file_characteristics = characteristics::EXECUTABLE_IMAGE;
        if self.relocs_stripped {
            file_characteristics |= characteristics::RELOCS_STRIPPED;
        }
        put_u16(&mut file, coff + 18, file_characteristics);

        let optional = coff + 20;
        let (directory_count, directories) = if self.pe32_plus {
            put_u16(&mut file, optional, 0x020B);
            put_u64(&mut file, optional + 24, self.image_base);
            (optional + 108, optional + 112)
        } else {
            put_u16(&mut file, optional, 0x010B);
            put_u32(&mut file, optional + 28, self.image_base as u32);
            (optional + 92, optional + 96)
        };
        put_u32(&mut file, optional + 16, self.entry_point);
        put_u32(&mut file, optional + 32, 0x200);
        put_u32(&mut file, optional + 36, 0x200);
        put_u32(&mut file, optional + 56, IMAGE_SIZE);
        put_u32(&mut file, optional + 60, HEADERS_SIZE);
        put_u16(&mut file, optional + 68, self.subsystem);
        put_u32(&mut file, directory_count, 16);

        let relocations = self.relocation_directory();
        if !relocations.is_empty() {
            put_u32(&mut file, directories + 5 * 8, RELOC_RVA);
            put_u32(&mut file, directories + 5 * 8 + 4, relocations.len() as u32);
        }
        if self.codeview.is_some() {
            put_u32(&mut file, directories + 6 * 8, DEBUG_ENTRY_RVA);
            put_u32(&mut file, directories + 6 * 8 + 4, 28);
        }

        let table = self.section_table_offset();
        let sections: [(&[u8; 8], u32, u32, u32, u32); 3] = [
            (b".text\0\0\0", TEXT_SIZE, TEXT_RVA, TEXT_SIZE, TEXT_RVA),
            (b".data\0\0\0", DATA_VIRTUAL_SIZE, DATA_RVA, DATA_RAW_SIZE, DATA_RVA),
            (
                b".reloc\0\0",
                relocations.len() as u32,
                RELOC_RVA,
                RELOC_RAW_SIZE,
                RELOC_RVA,
            ),
        ];
        for (index, (name, virtual_size, rva, raw_size, raw_offset)) in sections.iter().enumerate() {
            let entry = table + index * 40;
            file[entry..entry + 8].copy_from_slice(*name);
            put_u32(&mut file, entry + 8, *virtual_size);
            put_u32(&mut file, entry + 12, *rva);
            put_u32(&mut file, entry + 16, *raw_size);
            put_u32(&mut file, entry + 20, *raw_offset);
        }

        file[TEXT_RVA as usize..(TEXT_RVA + TEXT_SIZE) as usize].fill(TEXT_FILL);
        file[DATA_RVA as usize..(DATA_RVA + DATA_RAW_SIZE) as usize].fill(DATA_FILL);
        let reloc_start = RELOC_RVA as usize;
        file[reloc_start..reloc_start + relocations.len()].copy_from_slice(&relocations);

        for (kind, rva, value) in &self.fixups {
            let offset = *rva as usize;
            match *kind {
                reloc::HIGH | reloc::LOW => put_u16(&mut file, offset, *value as u16),
                reloc::HIGHLOW => put_u32(&mut file, offset, *value as u32),
                reloc::DIR64 => put_u64(&mut file, offset, *value),
                _ => {}
            }
        }

        if let Some(path) = self.codeview {
            let entry = DEBUG_ENTRY_RVA as usize;
            file[entry..entry + 28].fill(0);
            let record_size = 24 + path.len() + 1;
            put_u32(&mut file, entry + 12, 2);
            put_u32(&mut file, entry + 16, record_size as u32);
            put_u32(&mut file, entry + 20, 0);
            put_u32(&mut file, entry + 24, CODEVIEW_FILE_OFFSET as u32);

            let record = &mut file[CODEVIEW_FILE_OFFSET..CODEVIEW_FILE_OFFSET + record_size];
            record.fill(0);
            record[..4].copy_from_slice(b"RSDS");
            record[24..24 + path.len()].copy_from_slice(path.as_bytes());
        }
        file
    }

    /// TE file produced by stripping the PE headers of [`Self::build`]
    pub fn build_te(&self) -> Vec<u8> {
        let pe = self.build();
        let strip = self.section_table_offset();
        let relocations = self.relocation_directory();

        let mut te = vec![0u8; 40];
        put_u16(&mut te, 0, 0x5A56);
        put_u16(&mut te, 2, self.machine);
        te[4] = 3;
        te[5] = self.subsystem as u8;
        put_u16(&mut te, 6, strip as u16);
        put_u32(&mut te, 8, self.entry_point);
        put_u32(&mut te, 12, TEXT_RVA);
        put_u64(&mut te, 16, self.image_base);
        if !relocations.is_empty() {
            put_u32(&mut te, 24, RELOC_RVA);
            put_u32(&mut te, 28, relocations.len() as u32);
        }
        te.extend_from_slice(&pe[strip..]);
        te
    }

    /// Bytes TE stripping removed beyond the TE header
    pub fn te_stripped(&self) -> u64 {
        (self.section_table_offset() - 40) as u64
    }
}

pub fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap())
}

pub fn read_u64(bytes: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(bytes[offset..offset + 8].try_into().unwrap())
}

// ============================================================================
// Memory
// ============================================================================

/// Zeroed, page-aligned memory that lives for the rest of the test run
pub fn page_buffer(size: usize) -> &'static mut [u8] {
    let layout = Layout::from_size_align(size.max(1), PAGE_SIZE).unwrap();
    // SAFETY: non-zero size; the allocation is leaked and handed out once.
    unsafe {
        let ptr = alloc_zeroed(layout);
        assert!(!ptr.is_null());
        std::slice::from_raw_parts_mut(ptr, size)
    }
}

/// Page-aligned copy of `bytes`
pub fn page_aligned(bytes: &[u8]) -> &'static [u8] {
    let copy = page_buffer(bytes.len());
    copy.copy_from_slice(bytes);
    copy
}

/// Page allocator over a leaked arena
pub fn allocator(pages: usize) -> &'static BumpPageAllocator {
    Box::leak(Box::new(BumpPageAllocator::from_static(page_buffer(
        pages * PAGE_SIZE,
    ))))
}
