//! Executable images
//!
//! Header parsing ([`context`]), loading ([`loader`]) and base relocation
//! ([`reloc`]) for PE32, PE32+ and TE images.

pub mod context;
pub mod debug;
pub mod loader;
pub mod pe;
pub mod reloc;

pub use context::{ImageContext, ImageFormat, ImageReader, ImageType, MemoryReader};
pub use loader::{LoadBuffer, LoadedImage, execute_in_place, load};
pub use reloc::{FixupLog, RelocationStats, relocate, relocate_to, replay_fixups};
