//! Error types for lowered-program construction, validation and evaluation

use crate::ids::{BufferId, ExprId, LoopId};

/// Result type for lowered-program operations
pub type Result<T> = std::result::Result<T, LoweredError>;

/// Errors raised by the lowered IR.
///
/// Everything except [`LoweredError::Unsupported`] and
/// [`LoweredError::OutOfBounds`] is an IR-invariant violation and fatal for
/// the compilation that produced the program.
#[derive(Debug, thiserror::Error)]
pub enum LoweredError {
    #[error("unknown expression {0}")]
    UnknownExpression(ExprId),

    #[error("expression {0} appears more than once")]
    DuplicateExpression(ExprId),

    #[error("unknown loop {0}")]
    UnknownLoop(LoopId),

    #[error("unknown buffer {0}")]
    UnknownBuffer(BufferId),

    #[error("loop {0} has more than one begin marker")]
    DuplicateLoop(LoopId),

    #[error("loop {loop_id} begins at position {position} but is never closed")]
    UnclosedLoop { loop_id: LoopId, position: usize },

    /// A LoopEnd that does not close the innermost open loop.
    #[error("loop end for {found} at position {position} does not match innermost open loop {expected:?}")]
    MisnestedLoop {
        expected: Option<LoopId>,
        found: LoopId,
        position: usize,
    },

    #[error("expression {expr} declares loops {declared:?} but is enclosed by {enclosing:?}")]
    LoopMembership {
        expr: ExprId,
        declared: Vec<LoopId>,
        enclosing: Vec<LoopId>,
    },

    /// Connector whose producer is absent, later in the sequence, or lacks the port.
    #[error("expression {consumer} reads {producer}:{port}, which is not defined before it")]
    DanglingPort {
        consumer: ExprId,
        producer: ExprId,
        port: usize,
    },

    /// A value produced inside a loop consumed outside of it.
    #[error("expression {consumer} consumes {producer} outside the loop scope that defines it")]
    ScopeEscape { consumer: ExprId, producer: ExprId },

    #[error("malformed expression {expr}: {reason}")]
    Malformed { expr: ExprId, reason: String },

    #[error("{op} at expression {expr} is not supported here")]
    Unsupported { expr: ExprId, op: String },

    #[error("buffer {buffer} accessed at index {index} but holds {len} elements")]
    OutOfBounds { buffer: BufferId, index: usize, len: usize },

    #[error("no data bound for buffer {0}")]
    MissingBuffer(BufferId),

    #[error("pass '{pass}' left the program invalid: {source}")]
    PassFailed {
        pass: &'static str,
        #[source]
        source: Box<LoweredError>,
    },

    #[error("failed to serialize program: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl LoweredError {
    pub fn malformed(expr: ExprId, reason: impl Into<String>) -> Self {
        Self::Malformed {
            expr,
            reason: reason.into(),
        }
    }

    pub fn unsupported(expr: ExprId, op: impl Into<String>) -> Self {
        Self::Unsupported { expr, op: op.into() }
    }

    pub(crate) fn in_pass(self, pass: &'static str) -> Self {
        match self {
            already @ Self::PassFailed { .. } => already,
            other => Self::PassFailed {
                pass,
                source: Box::new(other),
            },
        }
    }
}
