//! Base relocation
//!
//! The relocation directory is walked twice: once to validate every block
//! and fixup, and once to apply them. A directory that fails validation
//! leaves the image untouched.
//!
//! When a [`FixupLog`] is supplied, every applied fixup appends the value it
//! wrote. [`replay_fixups`] uses the log to move a runtime image again later,
//! skipping locations the image changed in the meantime.

use super::context::{ImageContext, ImageFormat};
use super::loader::LoadBuffer;
use super::pe::{RELOC_BLOCK_HEADER_SIZE, reloc};
use crate::error::{LoaderError, Result};
use crate::utils::cursor::{
    read_u16_at, read_u32_at, read_u64_at, write_u16_at, write_u32_at, write_u64_at,
};
use crate::utils::mem_util::align_up;

/// Outcome of a relocation pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelocationStats {
    pub blocks: usize,
    pub fixups: usize,
    /// Fixups left alone by [`replay_fixups`]
    pub skipped: usize,
    pub delta: u64,
}

/// Append-only record of the values written by fixups
#[derive(Debug)]
pub struct FixupLog<'l> {
    bytes: &'l mut [u8],
    used: usize,
}

impl<'l> FixupLog<'l> {
    pub fn new(bytes: &'l mut [u8]) -> Self {
        Self { bytes, used: 0 }
    }

    pub fn len(&self) -> usize {
        self.used
    }

    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    pub fn capacity(&self) -> usize {
        self.bytes.len()
    }

    /// The recorded fixups
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.used]
    }

    fn push(&mut self, width: usize, value: u64) -> Result<()> {
        let offset = log_slot(self.used, width).ok_or(LoaderError::BufferTooSmall)?;
        match width {
            2 => write_u16_at(self.bytes, offset, value as u16),
            4 => write_u32_at(self.bytes, offset, value as u32),
            _ => write_u64_at(self.bytes, offset, value),
        }
        .map_err(|_| LoaderError::BufferTooSmall)?;
        self.used = offset + width;
        Ok(())
    }
}

/// Offset of the next log entry of `width` bytes after `used` bytes
///
/// 16-bit entries are packed; wider entries are naturally aligned.
fn log_slot(used: usize, width: usize) -> Option<usize> {
    if width == 2 { Some(used) } else { align_up(used, width) }
}

fn read_logged(log: &[u8], offset: usize, width: usize) -> Result<u64> {
    let value = match width {
        2 => read_u16_at(log, offset).map(u64::from),
        4 => read_u32_at(log, offset).map(u64::from),
        _ => read_u64_at(log, offset),
    };
    value.map_err(|_| LoaderError::InvalidParameter)
}

#[derive(Debug, Clone, Copy)]
struct Fixup {
    kind: u16,
    /// Buffer offset of the patched value
    offset: usize,
}

impl Fixup {
    /// Bytes the fixup patches
    fn width(&self) -> usize {
        match self.kind {
            reloc::HIGH | reloc::LOW => 2,
            reloc::HIGHLOW => 4,
            reloc::DIR64 => 8,
            _ => 0,
        }
    }

    fn read(&self, image: &[u8]) -> Result<u64> {
        let value = match self.width() {
            2 => read_u16_at(image, self.offset)? as u64,
            4 => read_u32_at(image, self.offset)? as u64,
            _ => read_u64_at(image, self.offset)?,
        };
        Ok(value)
    }

    /// Add `delta` to the patched value, returning the value written
    fn apply(&self, image: &mut [u8], delta: u64) -> Result<u64> {
        let value = match self.kind {
            reloc::HIGH => {
                let value = read_u16_at(image, self.offset)?.wrapping_add((delta >> 16) as u16);
                write_u16_at(image, self.offset, value)?;
                value as u64
            }
            reloc::LOW => {
                let value = read_u16_at(image, self.offset)?.wrapping_add(delta as u16);
                write_u16_at(image, self.offset, value)?;
                value as u64
            }
            reloc::HIGHLOW => {
                let value = read_u32_at(image, self.offset)?.wrapping_add(delta as u32);
                write_u32_at(image, self.offset, value)?;
                value as u64
            }
            reloc::DIR64 => {
                let value = read_u64_at(image, self.offset)?.wrapping_add(delta);
                write_u64_at(image, self.offset, value)?;
                value
            }
            _ => return Err(LoaderError::Unsupported),
        };
        Ok(value)
    }
}

/// Walk every fixup of the directory at `[start, end)` in `image`,
/// returning the number of blocks
fn walk_fixups(
    context: &ImageContext<'_>,
    image: &mut [u8],
    start: usize,
    end: usize,
    mut visit: impl FnMut(&mut [u8], Fixup) -> Result<()>,
) -> Result<usize> {
    let mut position = start;
    let mut blocks = 0;

    while end - position >= RELOC_BLOCK_HEADER_SIZE {
        let block_rva = read_u32_at(image, position)?;
        let block_size = read_u32_at(image, position + 4)? as usize;
        let block_end = position
            .checked_add(block_size)
            .filter(|block_end| block_size >= RELOC_BLOCK_HEADER_SIZE && *block_end <= end)
            .ok_or_else(|| {
                log::warn!(
                    "relocation block {} at {:#x} has size {:#x}",
                    blocks,
                    position,
                    block_size
                );
                LoaderError::LoadError
            })?;

        let mut entry = position + RELOC_BLOCK_HEADER_SIZE;
        while block_end - entry >= 2 {
            let raw = read_u16_at(image, entry)?;
            let rva = block_rva
                .checked_add((raw & 0x0FFF) as u32)
                .ok_or(LoaderError::LoadError)?;
            let fixup = Fixup {
                kind: raw >> 12,
                offset: context.rva_to_offset(rva)?,
            };
            visit(image, fixup)?;
            entry += 2;
        }

        position = block_end;
        blocks += 1;
    }
    Ok(blocks)
}

/// Buffer range of the relocation directory
fn directory_range(context: &ImageContext<'_>, image_len: usize) -> Result<(usize, usize)> {
    let directory = context.reloc_directory;
    let start = context.rva_to_offset(directory.rva)?;
    let end = start
        .checked_add(directory.size as usize)
        .filter(|end| *end <= image_len)
        .ok_or_else(|| {
            log::warn!("relocation directory outside the image");
            LoaderError::LoadError
        })?;
    Ok((start, end))
}

/// Check every block and fixup, returning the log bytes they need
fn validate(context: &ImageContext<'_>, image: &mut [u8], start: usize, end: usize) -> Result<usize> {
    let mut log_bytes = 0usize;
    walk_fixups(context, image, start, end, |image, fixup| {
        match fixup.kind {
            reloc::ABSOLUTE => return Ok(()),
            reloc::HIGH | reloc::LOW | reloc::HIGHLOW | reloc::DIR64 => {}
            other => {
                log::warn!("relocation type {} not supported", other);
                return Err(LoaderError::Unsupported);
            }
        }

        let width = fixup.width();
        let fixup_end = fixup
            .offset
            .checked_add(width)
            .filter(|fixup_end| *fixup_end <= image.len())
            .ok_or_else(|| {
                log::warn!("fixup at {:#x} outside the image", fixup.offset);
                LoaderError::LoadError
            })?;
        if fixup.offset < end && fixup_end > start {
            log::warn!("fixup at {:#x} patches the relocation directory", fixup.offset);
            return Err(LoaderError::LoadError);
        }

        log_bytes = log_slot(log_bytes, width).ok_or(LoaderError::LoadError)? + width;
        Ok(())
    })?;
    Ok(log_bytes)
}

/// Image base currently recorded in the loaded header
pub fn header_base(context: &ImageContext<'_>, image: &[u8]) -> Result<u64> {
    let field = context.image_base_field;
    let base = match context.format {
        ImageFormat::Pe32 => read_u32_at(image, field)? as u64,
        ImageFormat::Pe32Plus | ImageFormat::Te => read_u64_at(image, field)?,
    };
    Ok(base.wrapping_add(context.stripped as u64))
}

fn set_header_base(context: &ImageContext<'_>, image: &mut [u8], base: u64) -> Result<()> {
    let field = context.image_base_field;
    let linked = base.wrapping_sub(context.stripped as u64);
    match context.format {
        ImageFormat::Pe32 => write_u32_at(image, field, linked as u32)?,
        ImageFormat::Pe32Plus | ImageFormat::Te => write_u64_at(image, field, linked)?,
    }
    Ok(())
}

/// Relocate a loaded image for its buffer address
pub fn relocate(
    context: &ImageContext<'_>,
    buffer: &mut LoadBuffer<'_>,
    log: Option<&mut FixupLog<'_>>,
) -> Result<RelocationStats> {
    let target = buffer.address;
    relocate_to(context, buffer, target, log)
}

/// Relocate a loaded image so it runs at `target_base`
///
/// A zero delta still walks the directory so the fixup log is complete.
pub fn relocate_to(
    context: &ImageContext<'_>,
    buffer: &mut LoadBuffer<'_>,
    target_base: u64,
    mut log: Option<&mut FixupLog<'_>>,
) -> Result<RelocationStats> {
    let delta = target_base.wrapping_sub(context.image_base);
    let mut stats = RelocationStats {
        delta,
        ..RelocationStats::default()
    };
    if context.relocations_stripped {
        return Ok(stats);
    }

    let image_len = context.image_size.min(buffer.len());
    let image = &mut buffer.bytes[..image_len];

    if !context.reloc_directory.is_empty() {
        let (start, end) = directory_range(context, image.len())?;
        let log_bytes = validate(context, image, start, end)?;
        if let Some(log) = log.as_deref() {
            let free = log.capacity() - log.len();
            if free < log_bytes {
                log::warn!(
                    "fixup log has {:#x} bytes free, relocation needs {:#x}",
                    free,
                    log_bytes
                );
                return Err(LoaderError::BufferTooSmall);
            }
        }

        let mut fixups = 0;
        stats.blocks = walk_fixups(context, image, start, end, |image, fixup| {
            if fixup.kind == reloc::ABSOLUTE {
                return Ok(());
            }
            let value = fixup.apply(image, delta)?;
            #[cfg(feature = "verbose_logging")]
            log::trace!("fixup type {} at {:#x} -> {:#x}", fixup.kind, fixup.offset, value);
            if let Some(log) = log.as_deref_mut() {
                log.push(fixup.width(), value)?;
            }
            fixups += 1;
            Ok(())
        })?;
        stats.fixups = fixups;
    }

    set_header_base(context, image, target_base)?;
    log::debug!(
        "relocated image by {:#x}: {} blocks, {} fixups",
        delta,
        stats.blocks,
        stats.fixups
    );
    Ok(stats)
}

/// Move an already relocated image to `new_base` using its fixup log
///
/// A location is patched only while it still holds the value the log
/// recorded for it.
pub fn replay_fixups(
    context: &ImageContext<'_>,
    buffer: &mut LoadBuffer<'_>,
    log: &[u8],
    new_base: u64,
) -> Result<RelocationStats> {
    let image_len = context.image_size.min(buffer.len());
    let image = &mut buffer.bytes[..image_len];
    let current = header_base(context, image)?;
    let delta = new_base.wrapping_sub(current);
    let mut stats = RelocationStats {
        delta,
        ..RelocationStats::default()
    };
    if context.relocations_stripped {
        return Ok(stats);
    }

    if !context.reloc_directory.is_empty() {
        let (start, end) = directory_range(context, image.len())?;
        if validate(context, image, start, end)? > log.len() {
            log::warn!("fixup log shorter than the relocation directory");
            return Err(LoaderError::InvalidParameter);
        }

        let mut used = 0usize;
        stats.blocks = walk_fixups(context, image, start, end, |image, fixup| {
            if fixup.kind == reloc::ABSOLUTE {
                return Ok(());
            }
            let width = fixup.width();
            let slot = log_slot(used, width).ok_or(LoaderError::InvalidParameter)?;
            let logged = read_logged(log, slot, width)?;
            used = slot + width;

            if fixup.read(image)? == logged {
                fixup.apply(image, delta)?;
                stats.fixups += 1;
            } else {
                stats.skipped += 1;
            }
            Ok(())
        })?;
    }

    set_header_base(context, image, new_base)?;
    log::debug!(
        "replayed fixups by {:#x}: {} applied, {} skipped",
        delta,
        stats.fixups,
        stats.skipped
    );
    Ok(stats)
}
