//! Codec lookup by compression scheme or GUID

use hashbrown::HashMap;
use uefi_raw::Guid;

use super::{Codec, Crc32Extractor, NotCompressedCodec, UefiDecompressCodec};
use crate::error::{LoaderError, Result};
use crate::firmware::guids::{CRC32_GUIDED_SECTION, TIANO_DECOMPRESS_SECTION};
use crate::firmware::section::compression;

static NOT_COMPRESSED: NotCompressedCodec = NotCompressedCodec;
static UEFI_DECOMPRESS: UefiDecompressCodec = UefiDecompressCodec::standard();
static TIANO_DECOMPRESS: UefiDecompressCodec = UefiDecompressCodec::tiano();
static CRC32: Crc32Extractor = Crc32Extractor;

/// Key a codec is registered under
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CodecTag {
    /// Compression section scheme byte
    Compression(u8),
    /// GUID-defined section extractor
    Guided(Guid),
}

/// Resolves GUID-defined section extractors
pub trait ExtractorRegistry {
    fn lookup_extractor(&self, guid: &Guid) -> Option<&dyn Codec>;
}

/// Capability table built at startup and injected into the resolver
#[derive(Default)]
pub struct CodecRegistry<'c> {
    codecs: HashMap<CodecTag, &'c dyn Codec>,
}

impl<'c> CodecRegistry<'c> {
    pub fn new() -> Self {
        Self {
            codecs: HashMap::new(),
        }
    }

    /// Register `codec` under `tag`, returning the codec it replaced
    pub fn register(&mut self, tag: CodecTag, codec: &'c dyn Codec) -> Option<&'c dyn Codec> {
        log::debug!("codec {} registered for {:?}", codec.name(), tag);
        self.codecs.insert(tag, codec)
    }

    /// Codec for `tag`, or `Unsupported`
    pub fn lookup(&self, tag: CodecTag) -> Result<&'c dyn Codec> {
        self.codecs.get(&tag).copied().ok_or_else(|| {
            log::warn!("no codec registered for {:?}", tag);
            LoaderError::Unsupported
        })
    }

    /// Codec for a compression section scheme
    pub fn compression(&self, scheme: u8) -> Result<&'c dyn Codec> {
        self.lookup(CodecTag::Compression(scheme))
    }

    pub fn len(&self) -> usize {
        self.codecs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codecs.is_empty()
    }
}

impl CodecRegistry<'static> {
    /// Registry holding the built-in codecs
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(CodecTag::Compression(compression::NOT_COMPRESSED), &NOT_COMPRESSED);
        registry.register(CodecTag::Compression(compression::STANDARD), &UEFI_DECOMPRESS);
        registry.register(CodecTag::Guided(TIANO_DECOMPRESS_SECTION), &TIANO_DECOMPRESS);
        registry.register(CodecTag::Guided(CRC32_GUIDED_SECTION), &CRC32);
        registry
    }
}

impl ExtractorRegistry for CodecRegistry<'_> {
    fn lookup_extractor(&self, guid: &Guid) -> Option<&dyn Codec> {
        self.codecs.get(&CodecTag::Guided(*guid)).copied()
    }
}
