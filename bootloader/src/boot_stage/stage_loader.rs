//! Stage loader
//!
//! Finds the next stage in the registered volumes, loads and relocates it,
//! records it for the next stage and hands off.

use core::convert::Infallible;

use uefi_raw::Guid;
use uefi_raw::table::boot::MemoryType;

use super::phase::LoaderPhase;
use crate::config::LoaderConfig;
use crate::error::{LoaderError, Result};
use crate::firmware::{ContainerList, ExecutableFormat, FileKind, FoundSection, Resolver, Section};
use crate::handoff::HandoffManager;
use crate::image::{
    self, FixupLog, ImageContext, ImageFormat, ImageType, LoadBuffer, LoadedImage, MemoryReader,
    RelocationStats,
};
use crate::memory::{PAGE_SIZE, PageAllocator, pages_for};
use crate::security::AuthStatus;

/// Executable flavors tried, in order
const STAGE_FORMATS: [ExecutableFormat; 2] = [ExecutableFormat::Pe32, ExecutableFormat::Te];

/// An image ready to run
#[derive(Debug, Clone, Copy)]
pub struct StagedImage {
    /// File the image came from
    pub file: Guid,
    pub container: usize,
    pub format: ImageFormat,
    pub image: LoadedImage,
    pub auth: AuthStatus,
    /// `None` when the image runs from its volume
    pub relocation: Option<RelocationStats>,
    /// Values written by relocation, kept for runtime drivers
    pub fixup_log: Option<&'static [u8]>,
}

impl StagedImage {
    pub fn executes_in_place(&self) -> bool {
        self.relocation.is_none()
    }
}

pub struct StageLoader<'r> {
    resolver: Resolver<'r>,
    allocator: &'r dyn PageAllocator,
    config: LoaderConfig,
    phase: LoaderPhase,
}

impl<'r> StageLoader<'r> {
    pub fn new(
        resolver: Resolver<'r>,
        allocator: &'r dyn PageAllocator,
        config: LoaderConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            resolver,
            allocator,
            config,
            phase: LoaderPhase::PreMemory,
        })
    }

    pub fn phase(&self) -> LoaderPhase {
        self.phase
    }

    /// Permanent memory is up; shadow every image from now on
    pub fn enter_post_memory(&mut self) {
        if self.phase != LoaderPhase::PostMemory {
            log::info!(
                "loader phase {} -> {}",
                self.phase.as_str(),
                LoaderPhase::PostMemory.as_str()
            );
            self.phase = LoaderPhase::PostMemory;
        }
    }

    /// Find and load the first image in a file of `file_kind`
    ///
    /// PE32 sections are tried before TE. A format that is missing or
    /// cannot be loaded falls through to the next one. When `handoff` is
    /// given and module records are enabled, the image is recorded.
    pub fn load_stage(
        &self,
        containers: &mut ContainerList<'_>,
        file_kind: FileKind,
        handoff: Option<&mut HandoffManager<'_>>,
    ) -> Result<StagedImage> {
        let mut not_found = false;

        for format in STAGE_FORMATS {
            let attempt = self
                .resolver
                .find(containers, file_kind, format.section_kind())
                .and_then(|found| self.load_from_section(&found));

            match attempt {
                Ok(staged) => {
                    if let Some(handoff) = handoff {
                        if self.config.record_loaded_modules {
                            handoff.record_loaded_image(staged.file, &staged.image)?;
                        }
                    }
                    return Ok(staged);
                }
                Err(LoaderError::NotFound) => not_found = true,
                Err(LoaderError::Unsupported) => {
                    log::warn!("{:?} image in {:?} file not usable", format, file_kind);
                }
                Err(error) => return Err(error),
            }
        }

        Err(if not_found {
            LoaderError::NotFound
        } else {
            LoaderError::Unsupported
        })
    }

    /// Load the executable section `found`
    pub fn load_from_section(&self, found: &FoundSection<'_>) -> Result<StagedImage> {
        let Section::Executable { payload, .. } = found.section else {
            return Err(LoaderError::InvalidParameter);
        };

        let reader = MemoryReader::new(payload);
        let mut context = ImageContext::parse_header(&reader, &self.config)?;

        let (image, relocation, fixup_log) = if self.phase.allows_execute_in_place()
            && found.depth == 0
            && context.is_execute_in_place()
        {
            (image::execute_in_place(&mut context)?, None, None)
        } else {
            let (image, stats, log) = self.shadow(&mut context)?;
            (image, Some(stats), log)
        };

        Ok(StagedImage {
            file: found.file,
            container: found.container,
            format: context.format,
            image,
            auth: found.auth,
            relocation,
            fixup_log,
        })
    }

    /// Copy the image into fresh pages and relocate it there
    fn shadow(
        &self,
        context: &mut ImageContext<'_>,
    ) -> Result<(LoadedImage, RelocationStats, Option<&'static [u8]>)> {
        let pages = pages_for(context.image_size);
        let alignment = (context.section_alignment as usize).max(PAGE_SIZE);
        let region = self.allocator.allocate_aligned_pages(
            pages,
            alignment,
            context.image_type.code_memory_type(),
        )?;
        let address = region.address();
        let mut buffer = LoadBuffer::new(region.into_slice());

        let result = self.load_and_relocate(context, &mut buffer);
        if result.is_err() {
            self.allocator.free_pages(address, pages);
        }
        result
    }

    fn load_and_relocate(
        &self,
        context: &mut ImageContext<'_>,
        buffer: &mut LoadBuffer<'_>,
    ) -> Result<(LoadedImage, RelocationStats, Option<&'static [u8]>)> {
        let image = image::load(context, buffer)?;

        let log_size = context.fixup_log_size();
        if context.image_type != ImageType::RuntimeDriver || log_size == 0 {
            let stats = image::relocate(context, buffer, None)?;
            return Ok((image, stats, None));
        }

        let log_pages = pages_for(log_size);
        let region = self
            .allocator
            .allocate_pages(log_pages, MemoryType::RUNTIME_SERVICES_DATA)?;
        let log_address = region.address();
        let bytes = region.into_slice();

        let mut log = FixupLog::new(&mut *bytes);
        let stats = match image::relocate(context, buffer, Some(&mut log)) {
            Ok(stats) => stats,
            Err(error) => {
                self.allocator.free_pages(log_address, log_pages);
                return Err(error);
            }
        };
        let used = log.len();
        log::debug!("runtime image fixup log: {:#x} bytes at {:#x}", used, log_address);
        Ok((image, stats, Some(&bytes[..used])))
    }

    /// Load the next stage, record it, and transfer control
    ///
    /// Returns only on failure.
    ///
    /// # Safety
    /// The volumes must hold an image for the running architecture that is
    /// safe to execute.
    pub unsafe fn boot_next_stage(
        &self,
        containers: &mut ContainerList<'_>,
        file_kind: FileKind,
        mut handoff: HandoffManager<'_>,
    ) -> Result<Infallible> {
        let staged = self.load_stage(containers, file_kind, Some(&mut handoff))?;
        let execution = handoff.prepare(staged.image.entry_point)?;

        // SAFETY: the caller vouches for the volumes; the image was loaded
        // and relocated for its entry point above.
        unsafe { execution.transfer() }
    }
}
