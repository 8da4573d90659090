//! Firmware storage - volumes, files, sections and the recursive resolver
//!
//! Layout follows the PI firmware file system: a volume holds 8-byte aligned
//! files, a file holds 4-byte aligned sections, and encapsulation sections
//! (compression, GUID-defined, volume image) nest further streams.

pub mod containers;
pub mod guids;
pub mod resolver;
pub mod section;
pub mod volume;

pub use containers::{ContainerEntry, ContainerList, MAX_CONTAINERS};
pub use resolver::{FoundSection, Resolver};
pub use section::{ExecutableFormat, GuidedAttributes, Section, SectionKind, SectionStream};
pub use volume::{FfsFile, FileKind, FirmwareVolume};
