//! Boot Stage - Orchestration of resolve, load, relocate and hand-off

pub mod phase;
pub mod stage_loader;

// Re-export commonly used types
pub use phase::LoaderPhase;
pub use stage_loader::{StageLoader, StagedImage};
