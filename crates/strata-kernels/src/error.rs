//! Error types for kernel configuration, build and execution

use strata_lowered::{BufferId, ExprId, LoweredError};

use crate::isa::Isa;

/// Result type for kernel operations
pub type Result<T> = std::result::Result<T, KernelError>;

#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    /// The backend cannot provide a kernel; callers may fall back to the reference backend.
    #[error("no {isa} kernel available for {op}: {reason}")]
    Unavailable { isa: Isa, op: String, reason: String },

    /// Runtime shapes that no kernel can serve.
    #[error("malformed kernel configuration: {0}")]
    MalformedConfig(String),

    #[error("expression {expr} reads and writes buffer {buffer}")]
    Aliasing { expr: ExprId, buffer: BufferId },

    #[error("no executor registered for expression {0}")]
    MissingExecutor(ExprId),

    #[error(transparent)]
    Lowered(#[from] LoweredError),
}

impl KernelError {
    pub fn unavailable(isa: Isa, op: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Unavailable {
            isa,
            op: op.into(),
            reason: reason.into(),
        }
    }

    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedConfig(reason.into())
    }

    /// Whether a fallback backend may be tried instead of failing the subgraph.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}
