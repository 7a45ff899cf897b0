//! # strata-core
//!
//! Compiles fused tensor subgraphs into lowered programs with
//! configuration-keyed kernel executors, and runs them for whatever shapes
//! arrive at inference time.
//!
//! ## Architecture
//!
//! ```text
//! Subgraph ──lower──▶ LoweredProgram + ShapePlan + ExecutorTable
//!                          │
//!                          ▼ standard pipeline
//!                     enumerate ─▶ convert clean-up ─▶ memory-access optimizer
//!                          │
//!                          ▼
//! run(inputs) ─▶ ShapePlan::resolve ─▶ Interpreter ──kernels──▶ ExecutorTable
//!                                                               (update config,
//!                                                                rebuild on change)
//! ```
//!
//! ## Example
//!
//! ```rust
//! use strata_core::{CompileOptions, CompiledSubgraph, PartialShape, Subgraph};
//! use strata_lowered::{ElementType, HostTensor, UnaryOp};
//!
//! let mut builder = Subgraph::builder();
//! let x = builder.parameter("x", ElementType::F32, PartialShape::dynamic(1));
//! let y = builder.unary(UnaryOp::Relu, x)?;
//! builder.output("y", y)?;
//!
//! let compiled = CompiledSubgraph::compile(&builder.build()?, &CompileOptions::reference())?;
//! let outputs = compiled.run(&[HostTensor::new(vec![3], vec![-1.0, 0.5, 2.0])])?;
//! assert_eq!(outputs[0].1.data, vec![0.0, 0.5, 2.0]);
//! # Ok::<(), strata_core::Error>(())
//! ```

pub mod compiled;
pub mod error;
pub mod lowering;
pub mod options;
pub mod plan;
pub mod subgraph;

pub use compiled::CompiledSubgraph;
pub use error::{Error, Result};
pub use lowering::{lower, Lowered};
pub use options::{CompileOptions, IsaRequest};
pub use plan::{PlannedBuffer, ShapePlan, ShapeRule};
pub use subgraph::{Dim, Node, NodeOp, PartialShape, Subgraph, SubgraphBuilder, ValueId};
