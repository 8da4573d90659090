//! Image loading
//!
//! Copies headers and sections from the image file into a caller-allocated
//! buffer, zero-filling the uninitialized tail of every section.

use arrayvec::ArrayString;

use super::context::{ImageContext, ImageType};
use super::debug::{self, DEBUG_ENTRY_RVA_OFFSET, MAX_PDB_PATH};
use crate::error::{LoaderError, Result};
use crate::utils::cursor::write_u32_at;

/// Destination of a load
///
/// `address` is where the image will run. It normally equals the address of
/// `bytes`, but a staging buffer may be loaded for another address.
#[derive(Debug)]
pub struct LoadBuffer<'b> {
    pub address: u64,
    pub bytes: &'b mut [u8],
}

impl<'b> LoadBuffer<'b> {
    /// Buffer that runs where it is
    pub fn new(bytes: &'b mut [u8]) -> Self {
        Self {
            address: bytes.as_ptr() as u64,
            bytes,
        }
    }

    /// Staging buffer for an image that will run at `address`
    pub fn staged(address: u64, bytes: &'b mut [u8]) -> Self {
        Self { address, bytes }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Result of a successful load
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadedImage {
    pub address: u64,
    pub size: usize,
    pub entry_point: u64,
    pub image_type: ImageType,
    pub machine: u16,
    pub pdb_path: Option<ArrayString<MAX_PDB_PATH>>,
}

/// Load the image described by `context` into `buffer`
pub fn load(context: &mut ImageContext<'_>, buffer: &mut LoadBuffer<'_>) -> Result<LoadedImage> {
    if buffer.len() < context.image_size {
        log::warn!(
            "load buffer holds {:#x} bytes, image needs {:#x}",
            buffer.len(),
            context.image_size
        );
        return Err(LoaderError::BufferTooSmall);
    }

    if context.relocations_stripped {
        if context.image_type == ImageType::RuntimeDriver {
            log::error!("runtime image without relocations cannot be loaded");
            return Err(LoaderError::LoadError);
        }
        if buffer.address != context.image_base {
            log::warn!(
                "image without relocations requested at {:#x}, linked at {:#x}",
                buffer.address,
                context.image_base
            );
            return Err(LoaderError::InvalidParameter);
        }
    }

    let alignment = context.section_alignment as u64;
    if alignment != 0 && buffer.address % alignment != 0 {
        log::warn!(
            "load address {:#x} not aligned to {:#x}",
            buffer.address,
            alignment
        );
        return Err(LoaderError::InvalidParameter);
    }

    let reader = context.reader();
    let image = &mut buffer.bytes[..context.image_size];
    reader.read(0, &mut image[..context.size_of_headers])?;

    let mut highest_end = context.size_of_headers;
    for index in 0..context.number_of_sections {
        let section = context.section(index)?;
        let start = context.rva_to_offset(section.virtual_address)?;
        let copy_size = section.copy_size() as usize;
        let mapped_size = (section.virtual_size as usize).max(copy_size);
        let end = start
            .checked_add(mapped_size)
            .filter(|end| *end <= image.len())
            .ok_or_else(|| {
                log::warn!("section {} ends past the image", index);
                LoaderError::LoadError
            })?;

        if copy_size != 0 && section.raw_offset != 0 {
            let source = (section.raw_offset as usize)
                .checked_sub(context.stripped as usize)
                .ok_or(LoaderError::LoadError)?;
            reader.read(source, &mut image[start..start + copy_size])?;
        } else {
            image[start..start + copy_size].fill(0);
        }
        image[start + copy_size..end].fill(0);
        #[cfg(feature = "verbose_logging")]
        log::trace!(
            "section {} at {:#x}: {:#x} bytes copied, {:#x} mapped",
            index,
            start,
            copy_size,
            mapped_size
        );

        highest_end = highest_end.max(end);
    }

    let pdb_path = match context.codeview {
        Some(entry) => {
            let record = if entry.is_mapped() {
                context.rva_to_offset(entry.data_rva)?
            } else {
                place_codeview(context, image, highest_end)?
            };
            image
                .get(record..record + entry.size as usize)
                .and_then(debug::pdb_path)
        }
        None => None,
    };

    let entry_point = buffer.address.wrapping_add(context.entry_point_offset);
    context.load_address = Some(buffer.address);
    context.entry_point = Some(entry_point);

    log::info!(
        "loaded {:?} image at {:#x} ({:#x} bytes), entry {:#x}",
        context.image_type,
        buffer.address,
        context.image_size,
        entry_point
    );

    Ok(LoadedImage {
        address: buffer.address,
        size: context.image_size,
        entry_point,
        image_type: context.image_type,
        machine: context.machine,
        pdb_path,
    })
}

/// Copy an unmapped CodeView record after the last section
fn place_codeview(context: &ImageContext<'_>, image: &mut [u8], offset: usize) -> Result<usize> {
    let Some(entry) = context.codeview else {
        return Err(LoaderError::InvalidParameter);
    };
    let end = offset
        .checked_add(entry.size as usize)
        .filter(|end| *end <= image.len())
        .ok_or(LoaderError::LoadError)?;
    context
        .reader()
        .read(entry.file_offset as usize, &mut image[offset..end])?;

    let entry_offset = context.rva_to_offset(entry.entry_rva)?;
    let rva = u32::try_from(offset + context.stripped as usize).map_err(|_| LoaderError::LoadError)?;
    write_u32_at(image, entry_offset + DEBUG_ENTRY_RVA_OFFSET, rva)?;
    Ok(offset)
}

/// Describe an image that runs from where its file sits
pub fn execute_in_place(context: &mut ImageContext<'_>) -> Result<LoadedImage> {
    if !context.is_execute_in_place() {
        return Err(LoaderError::InvalidParameter);
    }
    let entry_point = context.image_base.wrapping_add(context.entry_point_offset);
    context.load_address = Some(context.image_base);
    context.entry_point = Some(entry_point);
    log::info!("image at {:#x} executes in place", context.image_base);

    Ok(LoadedImage {
        address: context.image_base,
        size: context.image_size,
        entry_point,
        image_type: context.image_type,
        machine: context.machine,
        pdb_path: None,
    })
}
