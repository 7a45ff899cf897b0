//! Error types for subgraph compilation and inference

use strata_kernels::KernelError;
use strata_lowered::LoweredError;

/// Result type for strata-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced to callers of [`crate::CompiledSubgraph`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Structural problem in the subgraph handed to the compiler
    #[error("Invalid subgraph: {0}")]
    InvalidSubgraph(String),

    /// Wrong number of inputs for an inference call
    #[error("Input count mismatch: expected {expected}, got {actual}")]
    InputCount { expected: usize, actual: usize },

    /// Runtime shape incompatible with the declared or derived shape
    #[error("Shape mismatch for '{name}': {reason}")]
    ShapeMismatch { name: String, reason: String },

    /// Input data length disagrees with its dimensions
    #[error("Buffer size mismatch for '{name}': expected {expected}, got {actual}")]
    BufferSizeMismatch { name: String, expected: usize, actual: usize },

    /// Rejected compile option
    #[error("Invalid option {option}: {reason}")]
    InvalidOption { option: &'static str, reason: String },

    #[error(transparent)]
    Lowered(#[from] LoweredError),

    #[error(transparent)]
    Kernel(#[from] KernelError),
}

impl Error {
    pub(crate) fn shape(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ShapeMismatch {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// A kernel was unavailable for the requested ISA and fallback was disabled.
    pub fn is_kernel_unavailable(&self) -> bool {
        matches!(self, Error::Kernel(err) if err.is_unavailable())
    }
}
