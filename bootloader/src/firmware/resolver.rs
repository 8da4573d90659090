//! Section resolver
//!
//! Walks the registered volumes looking for a section of a wanted kind inside
//! a file of a wanted kind. Encapsulation sections are decoded through the
//! injected codec registry and searched in turn; decoded output that turns
//! out to be a volume is registered and searched as a volume. Every decode
//! and every nested volume adds one level of nesting, bounded by
//! [`LoaderConfig::max_nesting_depth`].
//!
//! A decoded volume is registered under the address of the section payload
//! it was decoded from, so a later search finds it in the table instead of
//! decoding the section again.
//!
//! After the matching files of a volume were searched, its volume-image files
//! are expanded so that the nested volumes join the search order.

use uefi_raw::Guid;
use uefi_raw::table::boot::MemoryType;

use super::containers::{ContainerList, MAX_CONTAINERS};
use super::section::{GuidedAttributes, Section, SectionKind, SectionStream};
use super::volume::{FileKind, FirmwareVolume};
use crate::codec::{CodecInput, CodecRegistry, Decoded, ExtractorRegistry, decode};
use crate::config::LoaderConfig;
use crate::error::{LoaderError, Result};
use crate::memory::{PAGE_SIZE, PageAllocator, pages_for};
use crate::security::{AuthStatus, SectionTrustEvaluator, TrustDecision};

/// A section found by [`Resolver::find`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FoundSection<'a> {
    pub section: Section<'a>,
    /// File the section belongs to
    pub file: Guid,
    /// Index of the volume holding the file
    pub container: usize,
    /// Authentication status accumulated from the enclosing sections
    pub auth: AuthStatus,
    /// Encapsulation levels between the boot volume and the section
    pub depth: usize,
}

#[derive(Clone, Copy)]
struct Request {
    file_kind: FileKind,
    section_kind: SectionKind,
}

/// Where in the volume hierarchy a section stream sits
#[derive(Clone, Copy)]
struct Scope {
    file: Guid,
    container: usize,
    depth: usize,
    auth: AuthStatus,
}

/// Per-search bookkeeping
struct SearchState {
    request: Request,
    searched: [bool; MAX_CONTAINERS],
}

impl SearchState {
    fn new(request: Request) -> Self {
        Self {
            request,
            searched: [false; MAX_CONTAINERS],
        }
    }
}

/// Failure summary of the candidates tried so far
///
/// A candidate that is absent or unsupported is skipped; any other failure
/// ends the search.
#[derive(Default)]
struct Failures {
    unsupported: bool,
    not_found: bool,
}

impl Failures {
    fn absorb(&mut self, error: LoaderError) -> Result<()> {
        match error {
            LoaderError::NotFound => {
                self.not_found = true;
                Ok(())
            }
            LoaderError::Unsupported => {
                self.unsupported = true;
                Ok(())
            }
            other => Err(other),
        }
    }

    /// `Unsupported` only when every failed candidate was unsupported
    fn into_error(self) -> LoaderError {
        if self.unsupported && !self.not_found {
            LoaderError::Unsupported
        } else {
            LoaderError::NotFound
        }
    }
}

/// Recursive section search over a [`ContainerList`]
pub struct Resolver<'r> {
    codecs: &'r CodecRegistry<'r>,
    extractors: &'r dyn ExtractorRegistry,
    trust: &'r dyn SectionTrustEvaluator,
    allocator: &'r dyn PageAllocator,
    max_depth: usize,
}

impl<'r> Resolver<'r> {
    /// Resolver using `codecs` for both compression schemes and GUID-defined
    /// extractors
    pub fn new(
        codecs: &'r CodecRegistry<'r>,
        trust: &'r dyn SectionTrustEvaluator,
        allocator: &'r dyn PageAllocator,
        config: &LoaderConfig,
    ) -> Self {
        Self {
            codecs,
            extractors: codecs,
            trust,
            allocator,
            max_depth: config.max_nesting_depth,
        }
    }

    /// Use a separate extractor registry for GUID-defined sections
    pub fn with_extractors(mut self, extractors: &'r dyn ExtractorRegistry) -> Self {
        self.extractors = extractors;
        self
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// Find the first section of `section_kind` in a file of `file_kind`
    ///
    /// Volumes are visited in registration order, including those registered
    /// while the search runs.
    pub fn find<'a>(
        &self,
        containers: &mut ContainerList<'a>,
        file_kind: FileKind,
        section_kind: SectionKind,
    ) -> Result<FoundSection<'a>> {
        let mut state = SearchState::new(Request {
            file_kind,
            section_kind,
        });
        let mut failures = Failures::default();

        let mut cursor = containers.first();
        while let Some(index) = cursor {
            if !state.searched[index] {
                match self.search_container(containers, &mut state, index, AuthStatus::empty()) {
                    Ok(found) => {
                        log::info!(
                            "found {:?} section in file {} (volume {}, depth {})",
                            section_kind,
                            found.file,
                            found.container,
                            found.depth
                        );
                        return Ok(found);
                    }
                    Err(error) => failures.absorb(error)?,
                }
            }

            if let Err(error) = self.expand_volume_images(containers, index) {
                failures.absorb(error)?;
            }
            cursor = containers.next(index);
        }

        let error = failures.into_error();
        log::debug!(
            "no {:?} section in {:?} files: {}",
            section_kind,
            file_kind,
            error
        );
        Err(error)
    }

    /// Find a section of `section_kind` inside one known file
    pub fn find_in_file<'a>(
        &self,
        containers: &mut ContainerList<'a>,
        container: usize,
        file: Guid,
        section_kind: SectionKind,
    ) -> Result<FoundSection<'a>> {
        let entry = *containers.get(container).ok_or(LoaderError::InvalidParameter)?;
        let ffs = entry
            .volume
            .files()
            .find(|candidate| candidate.as_ref().map_or(true, |ffs| ffs.name == file))
            .ok_or(LoaderError::NotFound)??;

        let mut state = SearchState::new(Request {
            file_kind: ffs.kind,
            section_kind,
        });
        let scope = Scope {
            file,
            container,
            depth: entry.depth,
            auth: AuthStatus::empty(),
        };
        self.search_stream(containers, &mut state, scope, ffs.data)
    }

    fn search_container<'a>(
        &self,
        containers: &mut ContainerList<'a>,
        state: &mut SearchState,
        index: usize,
        auth: AuthStatus,
    ) -> Result<FoundSection<'a>> {
        let entry = *containers.get(index).ok_or(LoaderError::NotFound)?;
        state.searched[index] = true;

        let mut failures = Failures::default();
        for file in entry.volume.files() {
            let file = file?;
            if !file.kind.matches(state.request.file_kind) {
                continue;
            }
            let scope = Scope {
                file: file.name,
                container: index,
                depth: entry.depth,
                auth,
            };
            match self.search_stream(containers, state, scope, file.data) {
                Ok(found) => return Ok(found),
                Err(error) => failures.absorb(error)?,
            }
        }
        Err(failures.into_error())
    }

    fn search_stream<'a>(
        &self,
        containers: &mut ContainerList<'a>,
        state: &mut SearchState,
        scope: Scope,
        stream: &'a [u8],
    ) -> Result<FoundSection<'a>> {
        let mut failures = Failures::default();

        for section in SectionStream::new(stream) {
            let section = section?;
            #[cfg(feature = "verbose_logging")]
            log::trace!(
                "file {} depth {}: {:?} section, {:#x} bytes",
                scope.file,
                scope.depth,
                section.kind(),
                section.payload().len()
            );
            if section.kind() == state.request.section_kind {
                return Ok(FoundSection {
                    section,
                    file: scope.file,
                    container: scope.container,
                    auth: scope.auth,
                    depth: scope.depth,
                });
            }

            let attempt = match section {
                Section::Compressed {
                    scheme,
                    uncompressed_len,
                    payload,
                } => {
                    let input =
                        CodecInput::new(payload).with_expected_len(uncompressed_len as usize);
                    self.descend_compressed(containers, state, scope, scheme, input)
                }
                Section::GuidDefined {
                    extractor,
                    attributes,
                    header,
                    payload,
                } => {
                    let input = CodecInput::guided(payload, header, attributes);
                    self.descend_guided(containers, state, scope, extractor, input)
                }
                Section::EmbeddedContainer { payload } => {
                    let origin = origin_of(payload);
                    self.search_nested_volume(containers, state, scope, payload, origin)
                }
                Section::Raw { .. } | Section::Executable { .. } => continue,
            };

            match attempt {
                Ok(found) => return Ok(found),
                Err(error) => failures.absorb(error)?,
            }
        }

        Err(failures.into_error())
    }

    fn descend_compressed<'a>(
        &self,
        containers: &mut ContainerList<'a>,
        state: &mut SearchState,
        scope: Scope,
        scheme: u8,
        input: CodecInput<'a>,
    ) -> Result<FoundSection<'a>> {
        let depth = self.deeper(scope.depth)?;
        let source = origin_of(input.payload);
        if let Some(index) = containers.index_of_origin(source) {
            return self.revisit(containers, state, index, scope.auth);
        }

        let codec = self.codecs.compression(scheme)?;
        let decoded = decode(codec, &input, self.allocator)?;
        let inner = Scope {
            depth,
            auth: scope.auth | decoded.auth,
            ..scope
        };
        self.search_decoded(containers, state, inner, decoded.bytes, source)
    }

    fn descend_guided<'a>(
        &self,
        containers: &mut ContainerList<'a>,
        state: &mut SearchState,
        scope: Scope,
        extractor: Guid,
        input: CodecInput<'a>,
    ) -> Result<FoundSection<'a>> {
        let depth = self.deeper(scope.depth)?;
        let source = origin_of(input.payload);
        let decoded = match self.extractors.lookup_extractor(&extractor) {
            Some(codec) => decode(codec, &input, self.allocator)?,
            None if !input.attributes.contains(GuidedAttributes::PROCESSING_REQUIRED) => {
                let auth = if input.attributes.contains(GuidedAttributes::AUTH_STATUS_VALID) {
                    AuthStatus::IMAGE_SIGNED | AuthStatus::NOT_TESTED
                } else {
                    AuthStatus::empty()
                };
                Decoded {
                    bytes: input.payload,
                    auth,
                }
            }
            None => {
                log::warn!("no extractor for GUID-defined section {}", extractor);
                return Err(LoaderError::Unsupported);
            }
        };

        let auth = scope.auth | decoded.auth;
        if input.attributes.contains(GuidedAttributes::AUTH_STATUS_VALID)
            || decoded.auth.is_reported()
        {
            self.check_trust(auth, &scope.file)?;
        }

        if let Some(index) = containers.index_of_origin(source) {
            self.release(&input, &decoded);
            return self.revisit(containers, state, index, auth);
        }

        let inner = Scope {
            depth,
            auth,
            ..scope
        };
        self.search_decoded(containers, state, inner, decoded.bytes, source)
    }

    /// Search a volume registered by an earlier search, unless this search
    /// already covered it
    fn revisit<'a>(
        &self,
        containers: &mut ContainerList<'a>,
        state: &mut SearchState,
        index: usize,
        auth: AuthStatus,
    ) -> Result<FoundSection<'a>> {
        if state.searched[index] {
            return Err(LoaderError::NotFound);
        }
        log::debug!("reusing decoded volume {}", index);
        self.search_container(containers, state, index, auth)
    }

    /// Return decoder output pages that are no longer needed
    fn release(&self, input: &CodecInput<'_>, decoded: &Decoded<'_>) {
        let bytes = decoded.bytes;
        if bytes.is_empty() || input.payload.as_ptr_range().contains(&bytes.as_ptr()) {
            return;
        }
        self.allocator.free_pages(origin_of(bytes), pages_for(bytes.len()));
    }

    /// Continue into decoded bytes, which hold either a volume or sections
    fn search_decoded<'a>(
        &self,
        containers: &mut ContainerList<'a>,
        state: &mut SearchState,
        scope: Scope,
        bytes: &'a [u8],
        source: u64,
    ) -> Result<FoundSection<'a>> {
        if FirmwareVolume::looks_like_volume(bytes) {
            self.search_nested_volume(containers, state, scope, bytes, source)
        } else {
            self.search_stream(containers, state, scope, bytes)
        }
    }

    fn search_nested_volume<'a>(
        &self,
        containers: &mut ContainerList<'a>,
        state: &mut SearchState,
        scope: Scope,
        bytes: &'a [u8],
        origin: u64,
    ) -> Result<FoundSection<'a>> {
        let depth = self.deeper(scope.depth)?;
        let index = self.register_volume(containers, bytes, origin, scope.file, depth)?;
        if state.searched[index] {
            return Err(LoaderError::NotFound);
        }
        self.search_container(containers, state, index, scope.auth)
    }

    /// Register the volume in `bytes` under `origin`, copying it when its
    /// address does not meet the volume's alignment
    ///
    /// A volume already registered from the same origin, or with the same
    /// contents from the same file, keeps its existing index.
    fn register_volume<'a>(
        &self,
        containers: &mut ContainerList<'a>,
        bytes: &'a [u8],
        origin: u64,
        parent: Guid,
        depth: usize,
    ) -> Result<usize> {
        if let Some(index) = containers.index_of_origin(origin) {
            return Ok(index);
        }

        let volume = FirmwareVolume::parse(bytes)?;
        if let Some(index) = containers.index_of_copy(parent, volume.bytes()) {
            log::debug!("volume from file {} already registered as {}", parent, index);
            return Ok(index);
        }
        let volume = if volume.is_aligned() {
            volume
        } else {
            self.realign(volume)?
        };
        containers.register_nested(volume, origin, Some(parent), depth)
    }

    fn realign<'a>(&self, volume: FirmwareVolume<'a>) -> Result<FirmwareVolume<'a>> {
        let alignment = usize::try_from(volume.alignment())
            .map_err(|_| LoaderError::Unsupported)?
            .max(PAGE_SIZE);
        log::debug!(
            "copying volume at {:#x} to a {:#x}-aligned buffer",
            volume.base_address(),
            alignment
        );

        let region = self.allocator.allocate_aligned_pages(
            pages_for(volume.len()),
            alignment,
            MemoryType::BOOT_SERVICES_DATA,
        )?;
        let copy = &mut region.into_slice()[..volume.len()];
        copy.copy_from_slice(volume.bytes());
        FirmwareVolume::parse(copy)
    }

    /// Register the volumes carried by the volume-image files of a volume
    fn expand_volume_images(&self, containers: &mut ContainerList<'_>, index: usize) -> Result<()> {
        let entry = *containers.get(index).ok_or(LoaderError::NotFound)?;
        if entry.expanded {
            return Ok(());
        }
        containers.mark_expanded(index);

        let mut state = SearchState::new(Request {
            file_kind: FileKind::FirmwareVolumeImage,
            section_kind: SectionKind::FirmwareVolumeImage,
        });
        let mut failures = Failures::default();

        for file in entry.volume.files() {
            let file = file?;
            if file.kind != FileKind::FirmwareVolumeImage {
                continue;
            }
            let scope = Scope {
                file: file.name,
                container: index,
                depth: entry.depth,
                auth: AuthStatus::empty(),
            };

            let registered = self
                .search_stream(containers, &mut state, scope, file.data)
                .and_then(|found| {
                    let depth = self.deeper(found.depth)?;
                    let payload = found.section.payload();
                    self.register_volume(containers, payload, origin_of(payload), file.name, depth)
                });
            if let Err(error) = registered {
                failures.absorb(error)?;
            }
        }
        Ok(())
    }

    fn check_trust(&self, auth: AuthStatus, file: &Guid) -> Result<()> {
        match self.trust.evaluate(auth, file) {
            TrustDecision::Trusted => Ok(()),
            TrustDecision::StartRecovery => {
                log::error!("section of file {} rejected by trust policy ({})", file, auth);
                Err(LoaderError::SecurityViolation)
            }
        }
    }

    fn deeper(&self, depth: usize) -> Result<usize> {
        let next = depth + 1;
        if next > self.max_depth {
            log::error!("section nesting exceeds {} levels", self.max_depth);
            return Err(LoaderError::MaxNestingExceeded);
        }
        Ok(next)
    }
}

fn origin_of(bytes: &[u8]) -> u64 {
    bytes.as_ptr() as u64
}
