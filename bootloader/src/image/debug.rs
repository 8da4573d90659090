//! CodeView debug information
//!
//! Images built with debug info carry a debug directory whose CodeView entry
//! points at an RSDS or NB10 record holding the PDB path. When the record is
//! not mapped by any section (its RVA is zero) the loader appends it after
//! the last section and patches the entry to point there.

use arrayvec::ArrayString;

use super::context::ImageContext;
use super::pe::{
    CODEVIEW_NB10, CODEVIEW_NB10_HEADER_SIZE, CODEVIEW_RSDS, CODEVIEW_RSDS_HEADER_SIZE,
    DEBUG_DIRECTORY_ENTRY_SIZE, DEBUG_TYPE_CODEVIEW,
};
use crate::error::{LoaderError, Result};

/// Longest PDB path kept on a loaded image
pub const MAX_PDB_PATH: usize = 256;

/// Offset of `AddressOfRawData` inside a debug directory entry
pub const DEBUG_ENTRY_RVA_OFFSET: usize = 20;

/// The CodeView entry of an image's debug directory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodeViewEntry {
    /// RVA of the debug directory entry itself
    pub entry_rva: u32,
    /// RVA of the CodeView record, zero when no section maps it
    pub data_rva: u32,
    /// File offset of the CodeView record
    pub file_offset: u32,
    pub size: u32,
}

impl CodeViewEntry {
    pub fn is_mapped(&self) -> bool {
        self.data_rva != 0
    }
}

/// Locate the CodeView entry of the debug directory, if any
pub(crate) fn find_codeview(context: &ImageContext<'_>) -> Result<Option<CodeViewEntry>> {
    let directory = context.debug_directory;
    if directory.is_empty() {
        return Ok(None);
    }

    let count = directory.size as usize / DEBUG_DIRECTORY_ENTRY_SIZE;
    for index in 0..count {
        let entry_rva = directory.rva + (index * DEBUG_DIRECTORY_ENTRY_SIZE) as u32;
        let file_offset = match context.rva_to_file_offset(entry_rva) {
            Ok(offset) => offset,
            Err(LoaderError::NotFound) => return Ok(None),
            Err(_) => return Err(LoaderError::Unsupported),
        };

        let mut raw = [0u8; DEBUG_DIRECTORY_ENTRY_SIZE];
        context
            .reader()
            .read(file_offset, &mut raw)
            .map_err(|_| LoaderError::Unsupported)?;
        let field = |at: usize| u32::from_le_bytes([raw[at], raw[at + 1], raw[at + 2], raw[at + 3]]);

        if field(12) == DEBUG_TYPE_CODEVIEW {
            return Ok(Some(CodeViewEntry {
                entry_rva,
                data_rva: field(DEBUG_ENTRY_RVA_OFFSET),
                file_offset: field(24),
                size: field(16),
            }));
        }
    }
    Ok(None)
}

/// PDB path stored in a CodeView record
pub fn pdb_path(record: &[u8]) -> Option<ArrayString<MAX_PDB_PATH>> {
    let signature = u32::from_le_bytes(record.get(..4)?.try_into().ok()?);
    let header = match signature {
        CODEVIEW_RSDS => CODEVIEW_RSDS_HEADER_SIZE,
        CODEVIEW_NB10 => CODEVIEW_NB10_HEADER_SIZE,
        _ => return None,
    };
    let path = record.get(header..)?;
    let end = path.iter().position(|byte| *byte == 0).unwrap_or(path.len());
    let path = core::str::from_utf8(&path[..end]).ok()?;
    ArrayString::from(path).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    #[test]
    fn test_rsds_path() {
        let mut record = b"RSDS".to_vec();
        record.extend_from_slice(&[0u8; 20]);
        record.extend_from_slice(b"DxeCore.pdb\0junk");
        assert_eq!(pdb_path(&record).as_deref(), Some("DxeCore.pdb"));
    }

    #[test]
    fn test_nb10_path() {
        let mut record: Vec<u8> = b"NB10".to_vec();
        record.extend_from_slice(&[0u8; 12]);
        record.extend_from_slice(b"PeiCore.pdb");
        assert_eq!(pdb_path(&record).as_deref(), Some("PeiCore.pdb"));
    }

    #[test]
    fn test_unknown_record() {
        assert!(pdb_path(b"MTOC....").is_none());
        assert!(pdb_path(b"RS").is_none());
    }
}
