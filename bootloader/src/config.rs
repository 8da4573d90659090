//! Loader Configuration - Pure Value Object
//!
//! Immutable knobs consumed by the resolver, the image loader and the
//! hand-off manager. Construction goes through [`LoaderConfig::default`] and
//! the `with_*` setters; [`LoaderConfig::validate`] checks the result.
//!
//! # Examples
//!
//! ```
//! # use nos_stage_loader::config::LoaderConfig;
//! let config = LoaderConfig::default().with_max_nesting_depth(4);
//! assert!(config.validate().is_ok());
//! ```

use crate::error::{LoaderError, Result};
use crate::image::pe::machine;
use crate::memory::PAGE_SIZE;

/// Default stage stack size (128 KiB)
pub const DEFAULT_STACK_SIZE: usize = 128 * 1024;

/// Default bound on encapsulation/container nesting
pub const DEFAULT_MAX_NESTING_DEPTH: usize = 8;

/// Upper bound accepted for `max_nesting_depth`
pub const MAX_NESTING_DEPTH_LIMIT: usize = 32;

/// Machine types accepted when nothing else is configured
pub const DEFAULT_MACHINES: &[u16] = &[
    machine::I386,
    machine::AMD64,
    machine::ARM64,
    machine::RISCV64,
];

/// Stage loader configuration
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LoaderConfig {
    /// Maximum depth of nested encapsulation sections and volumes
    pub max_nesting_depth: usize,
    /// Size of the stack handed to the next stage, in bytes
    pub stack_size: usize,
    /// COFF machine types the image loader accepts
    pub supported_machines: &'static [u16],
    /// Append a module-entry record for every image the stage loader loads
    pub record_loaded_modules: bool,
}

impl LoaderConfig {
    /// Set the maximum nesting depth
    pub fn with_max_nesting_depth(mut self, depth: usize) -> Self {
        self.max_nesting_depth = depth;
        self
    }

    /// Set the hand-off stack size
    pub fn with_stack_size(mut self, size: usize) -> Self {
        self.stack_size = size;
        self
    }

    /// Restrict the accepted machine types
    pub fn with_supported_machines(mut self, machines: &'static [u16]) -> Self {
        self.supported_machines = machines;
        self
    }

    /// Enable or disable module-entry records
    pub fn with_module_records(mut self, enabled: bool) -> Self {
        self.record_loaded_modules = enabled;
        self
    }

    /// Check whether `machine` is on the allow-list
    pub fn supports_machine(&self, machine: u16) -> bool {
        self.supported_machines.contains(&machine)
    }

    /// Number of pages backing the hand-off stack
    pub fn stack_pages(&self) -> usize {
        self.stack_size / PAGE_SIZE
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_nesting_depth == 0 || self.max_nesting_depth > MAX_NESTING_DEPTH_LIMIT {
            return Err(LoaderError::InvalidParameter);
        }

        if self.stack_size == 0 || self.stack_size % PAGE_SIZE != 0 {
            return Err(LoaderError::InvalidParameter);
        }

        if self.supported_machines.is_empty() {
            return Err(LoaderError::InvalidParameter);
        }

        Ok(())
    }
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            max_nesting_depth: DEFAULT_MAX_NESTING_DEPTH,
            stack_size: DEFAULT_STACK_SIZE,
            supported_machines: DEFAULT_MACHINES,
            record_loaded_modules: true,
        }
    }
}
