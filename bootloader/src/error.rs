//! Stage loader error handling
//!
//! A single error type is shared by the resolver, the codecs, the image
//! loader, the relocator and the hand-off manager. Every fallible operation
//! returns [`Result`]; nothing in this crate panics on malformed input.

use core::fmt;

use uefi_raw::Status;

/// Stage loader error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoaderError {
    /// The searched file, section or record kind is absent
    NotFound,
    /// Format, machine type, relocation type or codec not implemented
    Unsupported,
    /// Caller contract violation
    InvalidParameter,
    /// Caller supplied a buffer smaller than required
    BufferTooSmall,
    /// Structural corruption inside an executable image
    LoadError,
    /// Payload rejected by the section trust policy
    SecurityViolation,
    /// Hand-off record list has no room left
    OutOfSpace,
    /// Page allocator exhausted or container table full
    OutOfResources,
    /// Sections nested deeper than the configured maximum
    MaxNestingExceeded,
    /// Structural corruption inside a volume or section stream
    VolumeCorrupted,
}

impl LoaderError {
    /// Convert to the firmware status code handed to platform reporting
    pub fn as_status(&self) -> Status {
        match self {
            LoaderError::NotFound => Status::NOT_FOUND,
            LoaderError::Unsupported => Status::UNSUPPORTED,
            LoaderError::InvalidParameter => Status::INVALID_PARAMETER,
            LoaderError::BufferTooSmall => Status::BUFFER_TOO_SMALL,
            LoaderError::LoadError => Status::LOAD_ERROR,
            LoaderError::SecurityViolation => Status::SECURITY_VIOLATION,
            LoaderError::OutOfSpace | LoaderError::OutOfResources => Status::OUT_OF_RESOURCES,
            LoaderError::MaxNestingExceeded | LoaderError::VolumeCorrupted => {
                Status::VOLUME_CORRUPTED
            }
        }
    }

    /// Get a human-readable description of the error
    pub fn description(&self) -> &'static str {
        match self {
            LoaderError::NotFound => "Requested item not found",
            LoaderError::Unsupported => "Unsupported format or codec",
            LoaderError::InvalidParameter => "Invalid parameter",
            LoaderError::BufferTooSmall => "Buffer too small",
            LoaderError::LoadError => "Corrupted executable image",
            LoaderError::SecurityViolation => "Payload failed trust evaluation",
            LoaderError::OutOfSpace => "Hand-off record list is full",
            LoaderError::OutOfResources => "Out of resources",
            LoaderError::MaxNestingExceeded => "Section nesting too deep",
            LoaderError::VolumeCorrupted => "Corrupted volume or section stream",
        }
    }

    /// Check if this error is recoverable by trying another candidate
    pub fn is_recoverable(&self) -> bool {
        matches!(self, LoaderError::NotFound | LoaderError::Unsupported)
    }

    /// Check if this error should trigger the platform recovery policy
    pub fn should_enter_recovery(&self) -> bool {
        matches!(
            self,
            LoaderError::SecurityViolation | LoaderError::VolumeCorrupted | LoaderError::LoadError
        )
    }
}

impl fmt::Display for LoaderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "LoaderError: {} (status: {:#x})",
            self.description(),
            self.as_status().0
        )
    }
}

impl From<LoaderError> for Status {
    fn from(error: LoaderError) -> Self {
        error.as_status()
    }
}

/// Result type used throughout the stage loader
pub type Result<T = ()> = core::result::Result<T, LoaderError>;
