//! Registered volume table
//!
//! The platform registers the boot volumes up front; the resolver appends
//! every nested volume it uncovers so later searches see them too.

use arrayvec::ArrayVec;
use uefi_raw::Guid;

use super::volume::FirmwareVolume;
use crate::error::{LoaderError, Result};

/// Maximum number of volumes tracked during one boot
pub const MAX_CONTAINERS: usize = 32;

/// A registered volume
#[derive(Clone, Copy, Debug)]
pub struct ContainerEntry<'a> {
    pub volume: FirmwareVolume<'a>,
    /// Address the volume was found at, before any realignment copy; for a
    /// decoded volume, the address of the encoded section payload
    pub origin: u64,
    /// File that carried the volume, for nested volumes
    pub parent_file: Option<Guid>,
    /// Encapsulation levels between a boot volume and this one
    pub depth: usize,
    /// Volume-image files of this volume were already expanded
    pub expanded: bool,
}

/// Ordered set of searchable volumes
#[derive(Default)]
pub struct ContainerList<'a> {
    entries: ArrayVec<ContainerEntry<'a>, MAX_CONTAINERS>,
}

impl<'a> ContainerList<'a> {
    pub fn new() -> Self {
        Self {
            entries: ArrayVec::new(),
        }
    }

    /// Register a boot volume found at its own address
    pub fn register(&mut self, volume: FirmwareVolume<'a>) -> Result<usize> {
        self.register_nested(volume, volume.base_address(), None, 0)
    }

    /// Register a volume; a volume already registered from the same origin
    /// returns its existing index
    pub fn register_nested(
        &mut self,
        volume: FirmwareVolume<'a>,
        origin: u64,
        parent_file: Option<Guid>,
        depth: usize,
    ) -> Result<usize> {
        if let Some(index) = self.index_of_origin(origin) {
            return Ok(index);
        }

        self.entries
            .try_push(ContainerEntry {
                volume,
                origin,
                parent_file,
                depth,
                expanded: false,
            })
            .map_err(|_| {
                log::error!("volume table full ({} entries)", MAX_CONTAINERS);
                LoaderError::OutOfResources
            })?;

        let index = self.entries.len() - 1;
        log::info!(
            "volume {} registered at {:#x} ({:#x} bytes, depth {})",
            index,
            volume.base_address(),
            volume.len(),
            depth
        );
        Ok(index)
    }

    pub fn index_of_origin(&self, origin: u64) -> Option<usize> {
        self.entries.iter().position(|entry| entry.origin == origin)
    }

    /// Volume carried by `parent_file` whose bytes equal `bytes`
    pub fn index_of_copy(&self, parent_file: Guid, bytes: &[u8]) -> Option<usize> {
        self.entries.iter().position(|entry| {
            entry.parent_file == Some(parent_file) && entry.volume.bytes() == bytes
        })
    }

    pub fn contains_origin(&self, origin: u64) -> bool {
        self.index_of_origin(origin).is_some()
    }

    pub fn get(&self, index: usize) -> Option<&ContainerEntry<'a>> {
        self.entries.get(index)
    }

    pub(crate) fn mark_expanded(&mut self, index: usize) {
        if let Some(entry) = self.entries.get_mut(index) {
            entry.expanded = true;
        }
    }

    /// First registered volume
    pub fn first(&self) -> Option<usize> {
        if self.entries.is_empty() { None } else { Some(0) }
    }

    /// Volume registered after `previous`
    pub fn next(&self, previous: usize) -> Option<usize> {
        let next = previous.checked_add(1)?;
        (next < self.entries.len()).then_some(next)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ContainerEntry<'a>> {
        self.entries.iter()
    }
}
