//! # strata-lowered
//!
//! The loop-explicit intermediate representation that fused tensor subgraphs
//! are lowered into, plus the passes that run over it.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ LoweredProgram                                               │
//! │   [LoopBegin L0] Load ─▶ Relu ─▶ Store [LoopEnd L0] Gemm ... │
//! │   buffers: id ─▶ (name, element type, kind)                  │
//! │   loops:   id ─▶ (work amount, increment)                    │
//! └───────────────┬──────────────────────────────┬───────────────┘
//!                 │ &mut                         │ &
//!                 ▼                              ▼
//! ┌──────────────────────────────┐   ┌──────────────────────────┐
//! │ Pipeline                     │   │ Interpreter              │
//! │  enumerate                   │   │  loops + register ops    │
//! │  fixed point {               │   │  kernel ops ─▶           │
//! │    remove redundant convert  │   │    KernelDispatch        │
//! │    specialize convert }      │   └──────────────────────────┘
//! │  memory-access optimizer     │
//! └──────────────────────────────┘
//! ```
//!
//! Structural invariants (loop nesting, no dangling ports, loop membership)
//! are checked by [`LoweredProgram::validate`]; the pipeline re-validates after
//! every pass that reports a change.

pub mod element;
pub mod error;
pub mod eval;
pub mod expression;
pub mod ids;
pub mod op;
pub mod pass;
pub mod program;
pub mod shape;

pub use element::ElementType;
pub use error::{LoweredError, Result};
pub use eval::{evaluate, HostTensor, Interpreter, KernelDispatch, Memory, NoKernels};
pub use expression::{
    AccessDescriptor, AccessHint, Direction, Expression, LoopPort, MemoryPort, OutputPort, PortConnector,
};
pub use ids::{BufferId, ExprId, LoopId, TensorId};
pub use op::{AccessKind, BinaryOp, LoopEdge, LoopMarker, MemoryAccess, OpKind, UnaryOp};
pub use pass::{
    standard_pipeline, EnumerateExpressionsPass, MemoryAccessConfig, MemoryAccessPatternOptimizer, Pass, PassResult,
    Pipeline, PipelineBuilder, RemoveRedundantConvertPass, SpecializeConvertPass,
};
pub use program::{BufferDecl, BufferKind, LoopInfo, LoopRegion, LoweredProgram, WorkAmount};
pub use shape::{trip_count, ShapeContext, ShapeMap};
