//! Operation kinds of the lowered IR.
//!
//! The set of operations is closed: passes and backends match on [`OpKind`]
//! and query capabilities through [`MemoryAccess`] and [`LoopMarker`] instead
//! of probing concrete types at run time.

use crate::element::ElementType;
use crate::ids::LoopId;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnaryOp {
    Neg,
    Abs,
    Relu,
    Exp,
    Sqrt,
}

impl UnaryOp {
    pub fn apply(self, x: f32) -> f32 {
        match self {
            UnaryOp::Neg => -x,
            UnaryOp::Abs => x.abs(),
            UnaryOp::Relu => x.max(0.0),
            UnaryOp::Exp => x.exp(),
            UnaryOp::Sqrt => x.sqrt(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Max,
    Min,
}

impl BinaryOp {
    pub fn apply(self, a: f32, b: f32) -> f32 {
        match self {
            BinaryOp::Add => a + b,
            BinaryOp::Sub => a - b,
            BinaryOp::Mul => a * b,
            BinaryOp::Div => a / b,
            BinaryOp::Max => a.max(b),
            BinaryOp::Min => a.min(b),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OpKind {
    LoopBegin { loop_id: LoopId },
    LoopEnd { loop_id: LoopId },
    /// Buffer to register, one lane per element of the access.
    Load,
    /// One element broadcast to every lane of the access.
    BroadcastLoad,
    /// Register to buffer.
    Store,
    Scalar { value: f32 },
    Unary(UnaryOp),
    Binary(BinaryOp),
    /// Generic conversion; must be specialized before execution.
    Convert { to: ElementType },
    ConvertTruncation { to: ElementType },
    ConvertSaturation { to: ElementType },
    /// `C = A * B_packed + beta * C`; B is in the N-blocked layout produced by `GemmCopyB`.
    Gemm { beta: f32 },
    /// Repack B `[K, N]` into blocks of `n_block` columns with a leading bias row.
    GemmCopyB { n_block: usize },
}

impl OpKind {
    pub fn name(&self) -> &'static str {
        match self {
            OpKind::LoopBegin { .. } => "LoopBegin",
            OpKind::LoopEnd { .. } => "LoopEnd",
            OpKind::Load => "Load",
            OpKind::BroadcastLoad => "BroadcastLoad",
            OpKind::Store => "Store",
            OpKind::Scalar { .. } => "Scalar",
            OpKind::Unary(_) => "Unary",
            OpKind::Binary(_) => "Binary",
            OpKind::Convert { .. } => "Convert",
            OpKind::ConvertTruncation { .. } => "ConvertTruncation",
            OpKind::ConvertSaturation { .. } => "ConvertSaturation",
            OpKind::Gemm { .. } => "Gemm",
            OpKind::GemmCopyB { .. } => "GemmCopyB",
        }
    }

    /// Operations that execute through a compiled kernel.
    pub fn is_kernel(&self) -> bool {
        matches!(self, OpKind::Gemm { .. } | OpKind::GemmCopyB { .. })
    }

    /// Destination type of any conversion flavour.
    pub fn convert_target(&self) -> Option<ElementType> {
        match self {
            OpKind::Convert { to } | OpKind::ConvertTruncation { to } | OpKind::ConvertSaturation { to } => Some(*to),
            _ => None,
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpKind::LoopBegin { loop_id } | OpKind::LoopEnd { loop_id } => write!(f, "{}({loop_id})", self.name()),
            OpKind::Scalar { value } => write!(f, "Scalar({value})"),
            OpKind::Unary(op) => write!(f, "{op:?}"),
            OpKind::Binary(op) => write!(f, "{op:?}"),
            OpKind::Convert { to } | OpKind::ConvertTruncation { to } | OpKind::ConvertSaturation { to } => {
                write!(f, "{}({to})", self.name())
            }
            OpKind::Gemm { beta } => write!(f, "Gemm(beta={beta})"),
            OpKind::GemmCopyB { n_block } => write!(f, "GemmCopyB(n_block={n_block})"),
            _ => f.write_str(self.name()),
        }
    }
}

/// Register-level memory access flavours.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessKind {
    Load,
    BroadcastLoad,
    Store,
}

/// Capability: the operation moves data between registers and a buffer
/// through a strided access descriptor.
pub trait MemoryAccess {
    fn access_kind(&self) -> Option<AccessKind>;

    fn is_memory_access(&self) -> bool {
        self.access_kind().is_some()
    }

    fn is_broadcast_access(&self) -> bool {
        matches!(self.access_kind(), Some(AccessKind::BroadcastLoad))
    }
}

impl MemoryAccess for OpKind {
    fn access_kind(&self) -> Option<AccessKind> {
        match self {
            OpKind::Load => Some(AccessKind::Load),
            OpKind::BroadcastLoad => Some(AccessKind::BroadcastLoad),
            OpKind::Store => Some(AccessKind::Store),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopEdge {
    Begin,
    End,
}

/// Capability: the operation opens or closes a loop region.
pub trait LoopMarker {
    fn loop_marker(&self) -> Option<(LoopId, LoopEdge)>;

    fn is_loop_marker(&self) -> bool {
        self.loop_marker().is_some()
    }
}

impl LoopMarker for OpKind {
    fn loop_marker(&self) -> Option<(LoopId, LoopEdge)> {
        match self {
            OpKind::LoopBegin { loop_id } => Some((*loop_id, LoopEdge::Begin)),
            OpKind::LoopEnd { loop_id } => Some((*loop_id, LoopEdge::End)),
            _ => None,
        }
    }
}
