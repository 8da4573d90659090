//! Well-known GUIDs used by the loader

use uefi_raw::{Guid, guid};

/// File system GUID of FFS2 volumes
pub const FFS2_FILE_SYSTEM: Guid = guid!("8c8ce578-8a3d-4f1c-9935-896185c32dd3");

/// File system GUID of FFS3 volumes (large file support)
pub const FFS3_FILE_SYSTEM: Guid = guid!("5473c07a-3dcb-4dca-bd6f-1e9689e7349a");

/// GUID-defined section protected by a CRC32
pub const CRC32_GUIDED_SECTION: Guid = guid!("fc1bcdb0-7d31-49aa-936a-a4600d9dd083");

/// GUID-defined section compressed with the Tiano variant
pub const TIANO_DECOMPRESS_SECTION: Guid = guid!("a31280ad-481e-41b6-95e8-127f4c984779");

/// Memory-allocation record name for a loaded module
pub const MEMORY_ALLOCATION_MODULE: Guid = guid!("f8e21975-0899-4f58-a4be-5525a9c6d77a");

/// Memory-allocation record name for the hand-off stack
pub const MEMORY_ALLOCATION_STACK: Guid = guid!("4ed4bf27-4092-42e9-807d-527b1d00c9bd");
