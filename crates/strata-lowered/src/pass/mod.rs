//! Transformation passes over [`LoweredProgram`]s.
//!
//! A pass edits the program in place and reports what it did. Passes are
//! idempotent: running one again on its own output reports no change. They
//! fail only on malformed input, never because a rewrite does not apply.

mod convert;
mod enumerate;
pub mod memory_access;
mod pipeline;

use crate::error::Result;
use crate::program::LoweredProgram;

pub use convert::{RemoveRedundantConvertPass, SpecializeConvertPass};
pub use enumerate::EnumerateExpressionsPass;
pub use memory_access::{MemoryAccessConfig, MemoryAccessPatternOptimizer};
pub use pipeline::{Pipeline, PipelineBuilder, Step};

/// Result returned by a [`Pass`] after it runs.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PassResult {
    /// Whether the pass changed the program.
    pub changed: bool,
    /// Fixed-point rounds executed (pipeline level only).
    pub iterations: usize,
    /// Number of rewrites applied.
    pub rewrites_applied: usize,
    /// Expressions removed.
    pub erased: usize,
}

impl PassResult {
    pub fn from_counts(rewrites_applied: usize, erased: usize) -> Self {
        Self {
            changed: rewrites_applied > 0 || erased > 0,
            iterations: 0,
            rewrites_applied,
            erased,
        }
    }

    /// Merges two run results, accumulating statistics.
    pub fn merge(self, other: PassResult) -> PassResult {
        PassResult {
            changed: self.changed || other.changed,
            iterations: self.iterations + other.iterations,
            rewrites_applied: self.rewrites_applied + other.rewrites_applied,
            erased: self.erased + other.erased,
        }
    }
}

pub trait Pass: Send + Sync {
    fn name(&self) -> &'static str;
    fn run(&self, program: &mut LoweredProgram) -> Result<PassResult>;
}

/// Builds the default pass order:
/// enumeration, a bounded convert clean-up fixed point, then memory-access optimization.
pub fn standard_pipeline(max_iters: usize, memory_access: MemoryAccessConfig) -> Pipeline {
    let mut builder = PipelineBuilder::new();
    builder.pass(EnumerateExpressionsPass);
    builder.fixed_point(max_iters, |p| {
        p.pass(RemoveRedundantConvertPass);
        p.pass(SpecializeConvertPass);
    });
    builder.pass(MemoryAccessPatternOptimizer::new(memory_access));
    builder.finish()
}
