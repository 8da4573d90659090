/// Loader phase
///
/// Threaded through the stage loader in place of a global "memory is up"
/// flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoaderPhase {
    /// Running before permanent memory; images may execute in place
    #[default]
    PreMemory,
    /// Permanent memory is available; every image is shadowed into RAM
    PostMemory,
}

impl LoaderPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PreMemory => "Pre-Memory",
            Self::PostMemory => "Post-Memory",
        }
    }

    /// Whether an execute-in-place capable image may run from its volume
    pub fn allows_execute_in_place(&self) -> bool {
        matches!(self, Self::PreMemory)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_defaults_to_pre_memory() {
        assert_eq!(LoaderPhase::default(), LoaderPhase::PreMemory);
        assert!(LoaderPhase::PreMemory.allows_execute_in_place());
        assert!(!LoaderPhase::PostMemory.allows_execute_in_place());
    }
}
