//! Codec capability and registry
//!
//! Compression and GUID-defined sections are decoded by [`Codec`] trait
//! objects registered once at startup. The resolver never names a concrete
//! codec; it looks one up by [`CodecTag`] and drives it through
//! [`decode`].

pub mod crc32;
pub mod passthrough;
pub mod registry;
pub mod uefi_decompress;

pub use crc32::Crc32Extractor;
pub use passthrough::NotCompressedCodec;
pub use registry::{CodecRegistry, CodecTag, ExtractorRegistry};
pub use uefi_decompress::UefiDecompressCodec;

use uefi_raw::table::boot::MemoryType;

use crate::error::{LoaderError, Result};
use crate::firmware::section::GuidedAttributes;
use crate::memory::{PageAllocator, pages_for};
use crate::security::AuthStatus;

/// Buffer sizes a codec needs for one payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodecSizes {
    pub output_size: usize,
    pub scratch_size: usize,
}

/// Encapsulated payload handed to a codec
#[derive(Debug, Clone, Copy)]
pub struct CodecInput<'i> {
    /// Encoded bytes
    pub payload: &'i [u8],
    /// Codec-specific header bytes; empty for compression sections
    pub header: &'i [u8],
    /// GUID-defined attributes; empty for compression sections
    pub attributes: GuidedAttributes,
    /// Decoded length declared by the section header, if it carries one
    pub expected_len: Option<usize>,
}

impl<'i> CodecInput<'i> {
    pub fn new(payload: &'i [u8]) -> Self {
        Self {
            payload,
            header: &[],
            attributes: GuidedAttributes::empty(),
            expected_len: None,
        }
    }

    pub fn guided(payload: &'i [u8], header: &'i [u8], attributes: GuidedAttributes) -> Self {
        Self {
            payload,
            header,
            attributes,
            expected_len: None,
        }
    }

    /// Require the decoded output to be exactly `len` bytes
    pub fn with_expected_len(mut self, len: usize) -> Self {
        self.expected_len = Some(len);
        self
    }

    fn check_len(&self, codec: &dyn Codec, len: usize) -> Result<()> {
        match self.expected_len {
            Some(expected) if expected != len => {
                log::error!(
                    "{}: decoded size {:#x} does not match declared size {:#x}",
                    codec.name(),
                    len,
                    expected
                );
                Err(LoaderError::VolumeCorrupted)
            }
            _ => Ok(()),
        }
    }
}

/// Decoded section bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decoded<'i> {
    pub bytes: &'i [u8],
    pub auth: AuthStatus,
}

/// A compression or extraction algorithm
pub trait Codec {
    /// Short name for log output
    fn name(&self) -> &'static str;

    /// Return the decoded bytes as a sub-range of the input when no
    /// processing is required
    fn in_place<'i>(&self, _input: &CodecInput<'i>) -> Result<Option<Decoded<'i>>> {
        Ok(None)
    }

    /// Report the output and scratch sizes `transform` needs
    fn size_query(&self, input: &CodecInput<'_>) -> Result<CodecSizes>;

    /// Decode into `output`, using `scratch` as working memory
    fn transform(
        &self,
        input: &CodecInput<'_>,
        scratch: &mut [u8],
        output: &mut [u8],
    ) -> Result<AuthStatus>;
}

/// Run `codec` on `input`, allocating output and scratch pages
///
/// Output pages are allocated first so the scratch run, returned right after
/// the transform, is the most recent allocation. Output pages are returned
/// only if the transform fails. A size that disagrees with
/// [`CodecInput::expected_len`] fails with `VolumeCorrupted` before anything
/// is allocated.
pub fn decode<'i>(
    codec: &dyn Codec,
    input: &CodecInput<'i>,
    allocator: &dyn PageAllocator,
) -> Result<Decoded<'i>> {
    if let Some(decoded) = codec.in_place(input)? {
        input.check_len(codec, decoded.bytes.len())?;
        log::debug!("{}: {} bytes used in place", codec.name(), decoded.bytes.len());
        return Ok(decoded);
    }

    let sizes = codec.size_query(input)?;
    input.check_len(codec, sizes.output_size)?;
    log::debug!(
        "{}: output {:#x} bytes, scratch {:#x} bytes",
        codec.name(),
        sizes.output_size,
        sizes.scratch_size
    );

    let output: &'static mut [u8] = if sizes.output_size != 0 {
        let region = allocator.allocate_bytes(sizes.output_size, MemoryType::BOOT_SERVICES_DATA)?;
        &mut region.into_slice()[..sizes.output_size]
    } else {
        &mut []
    };
    let output_address = output.as_ptr() as u64;
    let release_output = || {
        if sizes.output_size != 0 {
            allocator.free_pages(output_address, pages_for(sizes.output_size));
        }
    };

    let mut scratch_region = None;
    let mut scratch: &mut [u8] = &mut [];
    if sizes.scratch_size != 0 {
        match allocator.allocate_bytes(sizes.scratch_size, MemoryType::BOOT_SERVICES_DATA) {
            Ok(region) => {
                scratch_region = Some((region.address(), region.pages()));
                scratch = &mut region.into_slice()[..sizes.scratch_size];
            }
            Err(error) => {
                release_output();
                return Err(error);
            }
        }
    }

    let result = codec.transform(input, scratch, output);

    if let Some((address, pages)) = scratch_region {
        allocator.free_pages(address, pages);
    }

    match result {
        Ok(auth) => Ok(Decoded {
            bytes: output,
            auth,
        }),
        Err(error) => {
            log::warn!("{}: transform failed: {}", codec.name(), error);
            release_output();
            Err(error)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{BumpPageAllocator, PAGE_SIZE};
    use alloc::boxed::Box;
    use alloc::vec;

    /// Copies its input, padded out to a fixed output size
    struct PaddingCodec {
        output_size: usize,
    }

    impl Codec for PaddingCodec {
        fn name(&self) -> &'static str {
            "padding"
        }

        fn size_query(&self, _input: &CodecInput<'_>) -> Result<CodecSizes> {
            Ok(CodecSizes {
                output_size: self.output_size,
                scratch_size: 0,
            })
        }

        fn transform(
            &self,
            input: &CodecInput<'_>,
            _scratch: &mut [u8],
            output: &mut [u8],
        ) -> Result<AuthStatus> {
            output[..input.payload.len()].copy_from_slice(input.payload);
            Ok(AuthStatus::empty())
        }
    }

    fn arena(pages: usize) -> BumpPageAllocator {
        BumpPageAllocator::from_static(Box::leak(vec![0u8; pages * PAGE_SIZE].into_boxed_slice()))
    }

    #[test]
    fn test_decode_matching_declared_size() {
        let allocator = arena(2);
        let payload = [7u8; 4];
        let input = CodecInput::new(&payload).with_expected_len(0x20);
        let decoded = decode(&PaddingCodec { output_size: 0x20 }, &input, &allocator).unwrap();
        assert_eq!(decoded.bytes.len(), 0x20);
        assert_eq!(&decoded.bytes[..4], &payload);
    }

    #[test]
    fn test_decode_rejects_size_mismatch_before_allocating() {
        let allocator = arena(2);
        let payload = [7u8; 4];
        let input = CodecInput::new(&payload).with_expected_len(4);
        assert_eq!(
            decode(&PaddingCodec { output_size: 0xa04 }, &input, &allocator),
            Err(LoaderError::VolumeCorrupted)
        );
        assert_eq!(allocator.allocation_count(), 0);
        assert_eq!(allocator.remaining(), 2 * PAGE_SIZE);
    }

    #[test]
    fn test_in_place_output_checked_against_declared_size() {
        let allocator = arena(1);
        let payload = [1u8, 2, 3];
        let input = CodecInput::new(&payload).with_expected_len(8);
        assert_eq!(
            decode(&NotCompressedCodec, &input, &allocator),
            Err(LoaderError::VolumeCorrupted)
        );

        let input = CodecInput::new(&payload).with_expected_len(3);
        let decoded = decode(&NotCompressedCodec, &input, &allocator).unwrap();
        assert_eq!(decoded.bytes.as_ptr(), payload.as_ptr());
    }
}
