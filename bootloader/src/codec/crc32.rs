//! CRC32 GUID-defined section extractor
//!
//! The section header carries the IEEE CRC32 of the payload. The payload is
//! never copied: extraction only verifies and reports.

use super::{Codec, CodecInput, CodecSizes, Decoded};
use crate::error::{LoaderError, Result};
use crate::firmware::section::GuidedAttributes;
use crate::security::AuthStatus;

const POLYNOMIAL: u32 = 0xEDB8_8320;

const fn build_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut index = 0;
    while index < 256 {
        let mut value = index as u32;
        let mut bit = 0;
        while bit < 8 {
            value = if value & 1 != 0 {
                (value >> 1) ^ POLYNOMIAL
            } else {
                value >> 1
            };
            bit += 1;
        }
        table[index] = value;
        index += 1;
    }
    table
}

static CRC_TABLE: [u32; 256] = build_table();

/// IEEE 802.3 CRC32
pub fn crc32(data: &[u8]) -> u32 {
    !data.iter().fold(!0u32, |crc, byte| {
        CRC_TABLE[((crc ^ *byte as u32) & 0xFF) as usize] ^ (crc >> 8)
    })
}

/// Extractor for CRC32-protected GUID-defined sections
#[derive(Debug, Clone, Copy, Default)]
pub struct Crc32Extractor;

impl Crc32Extractor {
    fn verify(&self, input: &CodecInput<'_>) -> Result<AuthStatus> {
        let stored = input
            .header
            .get(..4)
            .map(|bytes| u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
            .ok_or(LoaderError::VolumeCorrupted)?;

        if !input.attributes.contains(GuidedAttributes::AUTH_STATUS_VALID) {
            return Ok(AuthStatus::NOT_TESTED);
        }

        let computed = crc32(input.payload);
        if computed != stored {
            log::warn!("CRC32 mismatch: stored {:#010x}, computed {:#010x}", stored, computed);
            return Ok(AuthStatus::TEST_FAILED);
        }
        Ok(AuthStatus::empty())
    }
}

impl Codec for Crc32Extractor {
    fn name(&self) -> &'static str {
        "crc32"
    }

    fn in_place<'i>(&self, input: &CodecInput<'i>) -> Result<Option<Decoded<'i>>> {
        let auth = self.verify(input)?;
        Ok(Some(Decoded {
            bytes: input.payload,
            auth,
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
        let auth = self.verify(input)?;
        output
            .get_mut(..input.payload.len())
            .ok_or(LoaderError::BufferTooSmall)?
            .copy_from_slice(input.payload);
        Ok(auth)
    }
}
