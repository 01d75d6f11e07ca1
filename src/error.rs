/// Failures of the address-space growth primitive.
///
/// Both variants mean the arena could not be extended. The allocator has no
/// fallback for either, so callers usually treat them as fatal.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
  #[error("program break could not be extended by {requested} bytes")]
  Exhausted { requested: usize },

  #[error("program break moved outside the arena (expected {expected:#x}, found {found:#x})")]
  Discontiguous { expected: usize, found: usize },
}

pub type Result<T> = core::result::Result<T, Error>;
