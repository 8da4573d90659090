//! Hand-off manager
//!
//! Owns the record list until the next stage is ready. [`HandoffManager::prepare`]
//! consumes the manager, so nothing can be appended once the stack has been
//! allocated and the transfer is armed.

use uefi_raw::Guid;
use uefi_raw::table::boot::MemoryType;

use super::records::{HandoffRecordList, RecordHandle};
use super::stack::BootStack;
use super::transfer::ExecutionHandoff;
use crate::config::LoaderConfig;
use crate::error::Result;
use crate::firmware::FirmwareVolume;
use crate::firmware::guids::MEMORY_ALLOCATION_STACK;
use crate::image::LoadedImage;
use crate::memory::PageAllocator;

pub struct HandoffManager<'m> {
    records: HandoffRecordList<'m>,
    allocator: &'m dyn PageAllocator,
    config: LoaderConfig,
}

impl<'m> HandoffManager<'m> {
    pub fn new(
        records: HandoffRecordList<'m>,
        allocator: &'m dyn PageAllocator,
        config: LoaderConfig,
    ) -> Self {
        Self {
            records,
            allocator,
            config,
        }
    }

    pub fn records(&self) -> &HandoffRecordList<'m> {
        &self.records
    }

    /// Direct access for producers appending their own records
    pub fn records_mut(&mut self) -> &mut HandoffRecordList<'m> {
        &mut self.records
    }

    /// Append a module-entry record for a loaded image
    pub fn record_loaded_image(&mut self, name: Guid, image: &LoadedImage) -> Result<RecordHandle> {
        log::debug!(
            "recording module {} at {:#x} ({:#x} bytes)",
            name,
            image.address,
            image.size
        );
        self.records.add_module(
            name,
            image.address,
            image.size as u64,
            image.entry_point,
            image.image_type.code_memory_type(),
        )
    }

    /// Publish a volume to the next stage
    pub fn publish_volume(&mut self, volume: &FirmwareVolume<'_>) -> Result<RecordHandle> {
        self.records
            .add_firmware_volume(volume.base_address(), volume.len() as u64)
    }

    /// Allocate the stage stack, record it and arm the transfer
    pub fn prepare(mut self, entry_point: u64) -> Result<ExecutionHandoff> {
        let stack = BootStack::allocate(self.allocator, self.config.stack_pages())?;
        self.records.add_memory_allocation(
            MEMORY_ALLOCATION_STACK,
            stack.base(),
            stack.size() as u64,
            MemoryType::BOOT_SERVICES_DATA,
        )?;

        let handoff = ExecutionHandoff::new(entry_point, stack, self.records.base())?;
        log::info!(
            "hand-off prepared: entry {:#x}, {:#x} free bytes left in the record list",
            entry_point,
            self.records.free_space()?
        );
        Ok(handoff)
    }
}
