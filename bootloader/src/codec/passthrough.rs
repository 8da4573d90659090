//! Compression scheme 0: the payload is stored as-is

use super::{Codec, CodecInput, CodecSizes, Decoded};
use crate::error::{LoaderError, Result};
use crate::security::AuthStatus;

/// Codec for compression sections that are not compressed
#[derive(Debug, Clone, Copy, Default)]
pub struct NotCompressedCodec;

impl Codec for NotCompressedCodec {
    fn name(&self) -> &'static str {
        "not-compressed"
    }

    fn in_place<'i>(&self, input: &CodecInput<'i>) -> Result<Option<Decoded<'i>>> {
        Ok(Some(Decoded {
            bytes: input.payload,
            auth: AuthStatus::empty(),
        }))
    }

    fn size_query(&self, input: &CodecInput<'_>) -> Result<CodecSizes> {
        Ok(CodecSizes {
            output_size: input.payload.len(),
            scratch_size: 0,
        })
    }

    fn transform(
        &self,
        input: &CodecInput<'_>,
        _scratch: &mut [u8],
        output: &mut [u8],
    ) -> Result<AuthStatus> {
        let target = output
            .get_mut(..input.payload.len())
            .ok_or(LoaderError::BufferTooSmall)?;
        target.copy_from_slice(input.payload);
        Ok(AuthStatus::empty())
    }
}
