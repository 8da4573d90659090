//! Section stream parsing
//!
//! A section stream is a run of 4-byte aligned sections, each starting with a
//! 24-bit size and a type byte. A size of `0xFFFFFF` means a 32-bit size
//! follows the common header.

use bitflags::bitflags;
use uefi_raw::Guid;

use crate::error::{LoaderError, Result};
use crate::utils::cursor::ByteCursor;

/// Sections start on 4-byte boundaries
pub const SECTION_ALIGNMENT: usize = 4;

const COMMON_HEADER_SIZE: usize = 4;
const EXTENDED_HEADER_SIZE: usize = 8;
const EXTENDED_SIZE_MARKER: u32 = 0x00FF_FFFF;

/// Compression scheme of a compression section
pub mod compression {
    pub const NOT_COMPRESSED: u8 = 0x00;
    pub const STANDARD: u8 = 0x01;
}

/// Section type byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SectionKind {
    Compression,
    GuidDefined,
    Disposable,
    Pe32,
    Pic,
    Te,
    DxeDepex,
    Version,
    UserInterface,
    Compatibility16,
    FirmwareVolumeImage,
    FreeformSubtypeGuid,
    Raw,
    PeiDepex,
    MmDepex,
    Other(u8),
}

impl SectionKind {
    pub fn from_u8(raw: u8) -> Self {
        match raw {
            0x01 => SectionKind::Compression,
            0x02 => SectionKind::GuidDefined,
            0x03 => SectionKind::Disposable,
            0x10 => SectionKind::Pe32,
            0x11 => SectionKind::Pic,
            0x12 => SectionKind::Te,
            0x13 => SectionKind::DxeDepex,
            0x14 => SectionKind::Version,
            0x15 => SectionKind::UserInterface,
            0x16 => SectionKind::Compatibility16,
            0x17 => SectionKind::FirmwareVolumeImage,
            0x18 => SectionKind::FreeformSubtypeGuid,
            0x19 => SectionKind::Raw,
            0x1B => SectionKind::PeiDepex,
            0x1C => SectionKind::MmDepex,
            other => SectionKind::Other(other),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            SectionKind::Compression => 0x01,
            SectionKind::GuidDefined => 0x02,
            SectionKind::Disposable => 0x03,
            SectionKind::Pe32 => 0x10,
            SectionKind::Pic => 0x11,
            SectionKind::Te => 0x12,
            SectionKind::DxeDepex => 0x13,
            SectionKind::Version => 0x14,
            SectionKind::UserInterface => 0x15,
            SectionKind::Compatibility16 => 0x16,
            SectionKind::FirmwareVolumeImage => 0x17,
            SectionKind::FreeformSubtypeGuid => 0x18,
            SectionKind::Raw => 0x19,
            SectionKind::PeiDepex => 0x1B,
            SectionKind::MmDepex => 0x1C,
            SectionKind::Other(raw) => raw,
        }
    }
}

/// Executable flavor carried by an executable section
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutableFormat {
    Pe32,
    Pic,
    Te,
}

impl ExecutableFormat {
    pub fn section_kind(self) -> SectionKind {
        match self {
            ExecutableFormat::Pe32 => SectionKind::Pe32,
            ExecutableFormat::Pic => SectionKind::Pic,
            ExecutableFormat::Te => SectionKind::Te,
        }
    }
}

bitflags! {
    /// GUID-defined section attributes
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct GuidedAttributes: u16 {
        const PROCESSING_REQUIRED = 0x0001;
        const AUTH_STATUS_VALID = 0x0002;
    }
}

/// A section borrowed from its stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Section<'a> {
    /// Leaf section that needs no further processing
    Raw { kind: SectionKind, data: &'a [u8] },
    /// Compression encapsulation
    Compressed {
        scheme: u8,
        uncompressed_len: u32,
        payload: &'a [u8],
    },
    /// GUID-defined encapsulation
    GuidDefined {
        extractor: Guid,
        attributes: GuidedAttributes,
        /// Extractor-specific header bytes between the common header and the data
        header: &'a [u8],
        payload: &'a [u8],
    },
    /// PE32, PIC or TE image
    Executable {
        format: ExecutableFormat,
        payload: &'a [u8],
    },
    /// Firmware volume image
    EmbeddedContainer { payload: &'a [u8] },
}

impl<'a> Section<'a> {
    /// Section type byte this section was parsed from
    pub fn kind(&self) -> SectionKind {
        match self {
            Section::Raw { kind, .. } => *kind,
            Section::Compressed { .. } => SectionKind::Compression,
            Section::GuidDefined { .. } => SectionKind::GuidDefined,
            Section::Executable { format, .. } => format.section_kind(),
            Section::EmbeddedContainer { .. } => SectionKind::FirmwareVolumeImage,
        }
    }

    /// Section body
    pub fn payload(&self) -> &'a [u8] {
        match self {
            Section::Raw { data, .. } => data,
            Section::Compressed { payload, .. }
            | Section::GuidDefined { payload, .. }
            | Section::Executable { payload, .. }
            | Section::EmbeddedContainer { payload } => payload,
        }
    }

    fn parse(kind: SectionKind, body: &'a [u8], section: &'a [u8]) -> Result<Self> {
        let mut cursor = ByteCursor::new(body);
        let parsed = match kind {
            SectionKind::Compression => {
                let uncompressed_len = cursor.read_u32()?;
                let scheme = cursor.read_u8()?;
                Section::Compressed {
                    scheme,
                    uncompressed_len,
                    payload: cursor.rest(),
                }
            }
            SectionKind::GuidDefined => {
                let extractor = cursor.read_guid()?;
                let data_offset = cursor.read_u16()? as usize;
                let attributes = GuidedAttributes::from_bits_truncate(cursor.read_u16()?);
                let header_end = section.len() - body.len() + cursor.position();
                if data_offset < header_end || data_offset > section.len() {
                    log::warn!("GUID-defined section with data offset {:#x}", data_offset);
                    return Err(LoaderError::VolumeCorrupted);
                }
                Section::GuidDefined {
                    extractor,
                    attributes,
                    header: &section[header_end..data_offset],
                    payload: &section[data_offset..],
                }
            }
            SectionKind::Pe32 => Section::Executable {
                format: ExecutableFormat::Pe32,
                payload: body,
            },
            SectionKind::Pic => Section::Executable {
                format: ExecutableFormat::Pic,
                payload: body,
            },
            SectionKind::Te => Section::Executable {
                format: ExecutableFormat::Te,
                payload: body,
            },
            SectionKind::FirmwareVolumeImage => Section::EmbeddedContainer { payload: body },
            other => Section::Raw {
                kind: other,
                data: body,
            },
        };
        Ok(parsed)
    }
}

/// Iterator over a section stream
#[derive(Clone, Debug)]
pub struct SectionStream<'a> {
    cursor: ByteCursor<'a>,
    done: bool,
}

impl<'a> SectionStream<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            cursor: ByteCursor::new(data),
            done: false,
        }
    }

    fn next_section(&mut self) -> Result<Option<Section<'a>>> {
        self.cursor.align_to(SECTION_ALIGNMENT);
        if self.cursor.remaining() < COMMON_HEADER_SIZE {
            return Ok(None);
        }

        let start = self.cursor.position();
        let mut header = self.cursor;
        let size = header.read_u24()?;
        let kind = SectionKind::from_u8(header.read_u8()?);
        let (size, header_size) = if size == EXTENDED_SIZE_MARKER {
            (header.read_u32()? as usize, EXTENDED_HEADER_SIZE)
        } else {
            (size as usize, COMMON_HEADER_SIZE)
        };

        if size < header_size {
            log::warn!("section at {:#x} declares size {:#x}", start, size);
            return Err(LoaderError::VolumeCorrupted);
        }

        let section = self
            .cursor
            .read_bytes(size)
            .map_err(|_| LoaderError::VolumeCorrupted)?;
        Section::parse(kind, &section[header_size..], section).map(Some)
    }
}

impl<'a> Iterator for SectionStream<'a> {
    type Item = Result<Section<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_section() {
            Ok(Some(section)) => Some(Ok(section)),
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
