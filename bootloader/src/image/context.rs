//! Executable header parsing
//!
//! [`ImageContext::parse_header`] reads a PE32, PE32+ or TE header through an
//! [`ImageReader`] and records everything the loader and the relocator need.
//! TE images are PE images with the front of the headers stripped; every RVA
//! they carry still refers to the unstripped layout, so the context keeps the
//! stripped byte count and converts RVAs to buffer offsets with
//! [`ImageContext::rva_to_offset`].

use core::fmt;

use uefi_raw::table::boot::MemoryType;

use super::debug::{self, CodeViewEntry};
use super::pe::{
    self, COFF_HEADER_SIZE, DataDirectory, SECTION_HEADER_SIZE, SectionHeader, TE_HEADER_SIZE,
    characteristics, directory, subsystem,
};
use crate::config::LoaderConfig;
use crate::error::{LoaderError, Result};

/// Byte-range access to an image that has not been loaded yet
pub trait ImageReader {
    /// Size of the image file in bytes
    fn size(&self) -> usize;

    /// Fill `buffer` from `offset`; a range past the end is a `LoadError`
    fn read(&self, offset: usize, buffer: &mut [u8]) -> Result<()>;

    /// Address of the file bytes when they are directly addressable
    fn address(&self) -> Option<u64> {
        None
    }
}

/// [`ImageReader`] over bytes already in memory
#[derive(Debug, Clone, Copy)]
pub struct MemoryReader<'a> {
    bytes: &'a [u8],
}

impl<'a> MemoryReader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    pub fn bytes(&self) -> &'a [u8] {
        self.bytes
    }
}

impl ImageReader for MemoryReader<'_> {
    fn size(&self) -> usize {
        self.bytes.len()
    }

    fn read(&self, offset: usize, buffer: &mut [u8]) -> Result<()> {
        let source = offset
            .checked_add(buffer.len())
            .and_then(|end| self.bytes.get(offset..end))
            .ok_or(LoaderError::LoadError)?;
        buffer.copy_from_slice(source);
        Ok(())
    }

    fn address(&self) -> Option<u64> {
        Some(self.bytes.as_ptr() as u64)
    }
}

/// Header flavor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Pe32,
    Pe32Plus,
    Te,
}

/// Role of the image, derived from its subsystem
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageType {
    Application,
    BootServiceDriver,
    RuntimeDriver,
}

impl ImageType {
    pub fn from_subsystem(value: u16) -> Result<Self> {
        match value {
            subsystem::EFI_APPLICATION => Ok(ImageType::Application),
            subsystem::EFI_BOOT_SERVICE_DRIVER => Ok(ImageType::BootServiceDriver),
            subsystem::EFI_RUNTIME_DRIVER => Ok(ImageType::RuntimeDriver),
            other => {
                log::warn!("image subsystem {} not supported", other);
                Err(LoaderError::Unsupported)
            }
        }
    }

    /// Memory class for the image's code
    pub fn code_memory_type(self) -> MemoryType {
        match self {
            ImageType::Application => MemoryType::LOADER_CODE,
            ImageType::BootServiceDriver => MemoryType::BOOT_SERVICES_CODE,
            ImageType::RuntimeDriver => MemoryType::RUNTIME_SERVICES_CODE,
        }
    }

    /// Memory class for the image's data
    pub fn data_memory_type(self) -> MemoryType {
        match self {
            ImageType::Application => MemoryType::LOADER_DATA,
            ImageType::BootServiceDriver => MemoryType::BOOT_SERVICES_DATA,
            ImageType::RuntimeDriver => MemoryType::RUNTIME_SERVICES_DATA,
        }
    }
}

/// Parsed image header plus load state
pub struct ImageContext<'r> {
    reader: &'r dyn ImageReader,
    pub format: ImageFormat,
    pub machine: u16,
    pub image_type: ImageType,
    /// Address the image is linked for, as a buffer address
    pub image_base: u64,
    /// Bytes the loaded image occupies, CodeView data included
    pub image_size: usize,
    /// Required alignment of the load address; zero for TE images
    pub section_alignment: u32,
    pub size_of_headers: usize,
    pub relocations_stripped: bool,
    /// Entry point as a buffer offset
    pub entry_point_offset: u64,
    pub number_of_sections: u16,
    pub reloc_directory: DataDirectory,
    pub debug_directory: DataDirectory,
    pub codeview: Option<CodeViewEntry>,
    /// Set by the loader
    pub load_address: Option<u64>,
    /// Set by the loader
    pub entry_point: Option<u64>,
    pub(crate) section_table_offset: usize,
    /// Buffer offset of the image base field in the header
    pub(crate) image_base_field: usize,
    /// Bytes removed from the front of a TE image
    pub(crate) stripped: u32,
}

impl fmt::Debug for ImageContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageContext")
            .field("format", &self.format)
            .field("machine", &format_args!("{:#x}", self.machine))
            .field("image_type", &self.image_type)
            .field("image_base", &format_args!("{:#x}", self.image_base))
            .field("image_size", &format_args!("{:#x}", self.image_size))
            .field("relocations_stripped", &self.relocations_stripped)
            .field("load_address", &self.load_address)
            .finish()
    }
}

fn header_u16(reader: &dyn ImageReader, offset: usize) -> Result<u16> {
    let mut bytes = [0u8; 2];
    reader
        .read(offset, &mut bytes)
        .map_err(|_| LoaderError::Unsupported)?;
    Ok(u16::from_le_bytes(bytes))
}

fn header_u32(reader: &dyn ImageReader, offset: usize) -> Result<u32> {
    let mut bytes = [0u8; 4];
    reader
        .read(offset, &mut bytes)
        .map_err(|_| LoaderError::Unsupported)?;
    Ok(u32::from_le_bytes(bytes))
}

fn header_u64(reader: &dyn ImageReader, offset: usize) -> Result<u64> {
    let mut bytes = [0u8; 8];
    reader
        .read(offset, &mut bytes)
        .map_err(|_| LoaderError::Unsupported)?;
    Ok(u64::from_le_bytes(bytes))
}

fn header_directory(reader: &dyn ImageReader, offset: usize) -> Result<DataDirectory> {
    Ok(DataDirectory {
        rva: header_u32(reader, offset)?,
        size: header_u32(reader, offset + 4)?,
    })
}

impl<'r> ImageContext<'r> {
    /// Parse and validate the image header
    ///
    /// Anything that is not a PE32, PE32+ or TE image for one of the
    /// configured machines is `Unsupported`.
    pub fn parse_header(reader: &'r dyn ImageReader, config: &LoaderConfig) -> Result<Self> {
        let signature = header_u16(reader, 0)?;
        let mut context = if signature == pe::TE_SIGNATURE {
            Self::parse_te(reader)?
        } else {
            Self::parse_pe(reader, signature)?
        };

        if !config.supports_machine(context.machine) {
            log::warn!("image machine {:#x} not supported", context.machine);
            return Err(LoaderError::Unsupported);
        }

        context.codeview = debug::find_codeview(&context)?;
        if let Some(entry) = context.codeview.filter(|entry| !entry.is_mapped()) {
            context.image_size = context
                .image_size
                .checked_add(entry.size as usize)
                .ok_or(LoaderError::Unsupported)?;
        }

        log::debug!(
            "{:?} image: machine {:#x}, base {:#x}, size {:#x}, entry {:#x}",
            context.format,
            context.machine,
            context.image_base,
            context.image_size,
            context.entry_point_offset
        );
        Ok(context)
    }

    fn parse_pe(reader: &'r dyn ImageReader, signature: u16) -> Result<Self> {
        let header_offset = if signature == pe::DOS_SIGNATURE {
            header_u32(reader, pe::DOS_LFANEW_OFFSET)? as usize
        } else {
            0
        };
        if header_u32(reader, header_offset)? != pe::PE_SIGNATURE {
            return Err(LoaderError::Unsupported);
        }

        let coff = header_offset + 4;
        let machine = header_u16(reader, coff)?;
        let number_of_sections = header_u16(reader, coff + 2)?;
        let optional_size = header_u16(reader, coff + 16)? as usize;
        let file_characteristics = header_u16(reader, coff + 18)?;

        let optional = coff + COFF_HEADER_SIZE;
        let (format, image_base, image_base_field, directory_count, directories) =
            match header_u16(reader, optional)? {
                pe::PE32_MAGIC => (
                    ImageFormat::Pe32,
                    header_u32(reader, optional + 28)? as u64,
                    optional + 28,
                    optional + 92,
                    optional + 96,
                ),
                pe::PE32_PLUS_MAGIC => (
                    ImageFormat::Pe32Plus,
                    header_u64(reader, optional + 24)?,
                    optional + 24,
                    optional + 108,
                    optional + 112,
                ),
                other => {
                    log::warn!("optional header magic {:#x} not supported", other);
                    return Err(LoaderError::Unsupported);
                }
            };

        let entry_point_offset = header_u32(reader, optional + 16)? as u64;
        let section_alignment = header_u32(reader, optional + 32)?;
        let size_of_image = header_u32(reader, optional + 56)? as usize;
        let size_of_headers = header_u32(reader, optional + 60)? as usize;
        let image_type = ImageType::from_subsystem(header_u16(reader, optional + 68)?)?;
        let directory_count = header_u32(reader, directory_count)? as usize;

        let read_directory = |index: usize| -> Result<DataDirectory> {
            if index < directory_count {
                header_directory(reader, directories + index * 8)
            } else {
                Ok(DataDirectory::default())
            }
        };
        let reloc_directory = read_directory(directory::BASERELOC)?;
        let debug_directory = read_directory(directory::DEBUG)?;

        let section_table_offset = optional + optional_size;
        let section_table_end =
            section_table_offset + number_of_sections as usize * SECTION_HEADER_SIZE;
        if size_of_headers > size_of_image
            || size_of_headers > reader.size()
            || section_table_end > reader.size()
        {
            log::warn!(
                "image headers out of range: headers {:#x}, image {:#x}, file {:#x}",
                size_of_headers,
                size_of_image,
                reader.size()
            );
            return Err(LoaderError::Unsupported);
        }

        Ok(Self {
            reader,
            format,
            machine,
            image_type,
            image_base,
            image_size: size_of_image,
            section_alignment,
            size_of_headers,
            relocations_stripped: file_characteristics & characteristics::RELOCS_STRIPPED != 0,
            entry_point_offset,
            number_of_sections,
            reloc_directory,
            debug_directory,
            codeview: None,
            load_address: None,
            entry_point: None,
            section_table_offset,
            image_base_field,
            stripped: 0,
        })
    }

    fn parse_te(reader: &'r dyn ImageReader) -> Result<Self> {
        let machine = header_u16(reader, 2)?;
        let mut counts = [0u8; 2];
        reader
            .read(4, &mut counts)
            .map_err(|_| LoaderError::Unsupported)?;
        let [number_of_sections, subsystem] = counts;
        let stripped_size = header_u16(reader, 6)? as u32;
        let entry_point = header_u32(reader, 8)?;
        let linked_base = header_u64(reader, 16)?;
        let reloc_directory = header_directory(reader, 24)?;
        let debug_directory = header_directory(reader, 32)?;

        let stripped = stripped_size
            .checked_sub(TE_HEADER_SIZE as u32)
            .ok_or(LoaderError::Unsupported)?;
        let image_type = ImageType::from_subsystem(subsystem as u16)?;

        let size_of_headers = TE_HEADER_SIZE + number_of_sections as usize * SECTION_HEADER_SIZE;
        if size_of_headers > reader.size() {
            return Err(LoaderError::Unsupported);
        }

        let mut context = Self {
            reader,
            format: ImageFormat::Te,
            machine,
            image_type,
            image_base: linked_base.wrapping_add(stripped as u64),
            image_size: size_of_headers,
            section_alignment: 0,
            size_of_headers,
            relocations_stripped: reloc_directory.is_empty(),
            entry_point_offset: entry_point
                .checked_sub(stripped)
                .ok_or(LoaderError::Unsupported)? as u64,
            number_of_sections: number_of_sections as u16,
            reloc_directory,
            debug_directory,
            codeview: None,
            load_address: None,
            entry_point: None,
            section_table_offset: TE_HEADER_SIZE,
            image_base_field: 16,
            stripped,
        };

        // TE headers carry no image size; derive it from what the image maps.
        let mut end = size_of_headers as u64;
        for index in 0..context.number_of_sections {
            let section = context
                .section(index)
                .map_err(|_| LoaderError::Unsupported)?;
            let span = section.virtual_size.max(section.raw_size) as u64;
            end = end.max(section.virtual_address as u64 + span);
        }
        for dir in [reloc_directory, debug_directory] {
            end = end.max(dir.rva as u64 + dir.size as u64);
        }
        context.image_size = usize::try_from(end.saturating_sub(stripped as u64))
            .map_err(|_| LoaderError::Unsupported)?
            .max(size_of_headers);

        Ok(context)
    }

    pub fn reader(&self) -> &'r dyn ImageReader {
        self.reader
    }

    /// Section table entry `index`
    pub fn section(&self, index: u16) -> Result<SectionHeader> {
        if index >= self.number_of_sections {
            return Err(LoaderError::InvalidParameter);
        }
        let mut raw = [0u8; SECTION_HEADER_SIZE];
        self.reader.read(
            self.section_table_offset + index as usize * SECTION_HEADER_SIZE,
            &mut raw,
        )?;
        SectionHeader::parse(&raw)
    }

    /// Buffer offset of `rva`
    pub fn rva_to_offset(&self, rva: u32) -> Result<usize> {
        rva.checked_sub(self.stripped)
            .map(|offset| offset as usize)
            .ok_or(LoaderError::LoadError)
    }

    /// File offset of `rva` in the unloaded image
    pub fn rva_to_file_offset(&self, rva: u32) -> Result<usize> {
        for index in 0..self.number_of_sections {
            let section = self.section(index)?;
            if section.contains_rva(rva) {
                let offset = section.raw_offset as u64 + (rva - section.virtual_address) as u64;
                return offset
                    .checked_sub(self.stripped as u64)
                    .map(|offset| offset as usize)
                    .ok_or(LoaderError::LoadError);
            }
        }
        let offset = self.rva_to_offset(rva)?;
        if offset < self.size_of_headers {
            Ok(offset)
        } else {
            Err(LoaderError::NotFound)
        }
    }

    /// Bytes a fixup log needs to record every relocation of the image
    pub fn fixup_log_size(&self) -> usize {
        if self.relocations_stripped {
            return 0;
        }
        self.reloc_directory.size as usize / 2 * 8
    }

    /// The file bytes sit at the linked address with sections already at
    /// their RVAs, so the image can run where it is
    pub fn is_execute_in_place(&self) -> bool {
        if self.reader.address() != Some(self.image_base) || self.reader.size() < self.image_size
        {
            return false;
        }
        (0..self.number_of_sections).all(|index| {
            self.section(index).is_ok_and(|section| {
                section.raw_size == 0 || section.raw_offset == section.virtual_address
            })
        })
    }
}
