//! NOS Stage Loader Library - Modular Architecture
//!
//! Loads the next boot stage out of firmware volumes and hands control to it:
//! the resolver finds an executable section (decoding compressed and
//! GUID-defined encapsulations through registered codecs), the image loader
//! copies it into allocated pages, the relocator rebases it, and the hand-off
//! manager passes a record list to it on a fresh stack.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

// ============================================================================
// STRUCTURED MODULE HIERARCHY
// ============================================================================

/// Error type shared by every component
pub mod error;

/// Loader configuration value object
pub mod config;

/// Page allocator capability
pub mod memory;

/// Byte cursor, alignment helpers and the logging backend
pub mod utils;

/// Firmware volumes, files, sections and the recursive resolver
pub mod firmware;

/// Decompression and GUID-defined section codecs
pub mod codec;

/// Authentication status and section trust policy
pub mod security;

/// PE32, PE32+ and TE parsing, loading and relocation
pub mod image;

/// Record list, stage stack and terminal transfer
pub mod handoff;

/// Stage orchestration
pub mod boot_stage;

// ============================================================================
// PUBLIC API RE-EXPORTS
// ============================================================================

pub use boot_stage::{LoaderPhase, StageLoader, StagedImage};
pub use config::LoaderConfig;
pub use error::{LoaderError, Result};
pub use firmware::{ContainerList, FirmwareVolume, Resolver};
pub use handoff::{ExecutionHandoff, HandoffManager, HandoffRecordList};
pub use memory::PageAllocator;
