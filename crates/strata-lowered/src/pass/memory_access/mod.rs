//! Memory-access pattern analysis and optimization.
//!
//! ```text
//!  for each loop region ──▶ classify accesses ──▶ stride rewrites (emitter hints)
//!  whole program        ──▶ irregular loads/stores ──▶ single-element normalization
//!  whole program        ──▶ small accesses ──▶ adjacency groups ──▶ merged access
//! ```
//!
//! Every rewrite leaves the values computed by the program unchanged. The
//! pass runs inside a program transaction, so a failed rewrite restores the
//! input untouched.

mod analysis;
mod coalesce;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::expression::{AccessHint, Direction};
use crate::ids::ExprId;
use crate::op::{AccessKind, MemoryAccess};
use crate::pass::{Pass, PassResult};
use crate::program::LoweredProgram;

pub use analysis::{
    all_patterns, analyze_loop, cache_efficiency, classify, estimate_performance_impact, optimal_vector_size,
    LoopAccessAnalysis, MemoryAccessPattern, PatternType,
};
pub use coalesce::{coalesce_group, find_small_accesses, group_adjacent_accesses, AccessGroup};

/// Thresholds of the memory-access optimizer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MemoryAccessConfig {
    /// Accesses narrower than this are coalescing candidates; merged width never exceeds it.
    pub min_coalesce_size: usize,
    /// Largest stride still classified as strided.
    pub stride_limit: usize,
    /// Strided accesses below this efficiency are stride-rewrite candidates.
    pub min_cache_efficiency: f64,
    pub preferred_alignment: usize,
    pub max_vector_size: usize,
    /// Largest stride a vectorized strided access supports.
    pub max_vector_stride: usize,
}

impl Default for MemoryAccessConfig {
    fn default() -> Self {
        Self {
            min_coalesce_size: 4,
            stride_limit: 64,
            min_cache_efficiency: 0.5,
            preferred_alignment: 64,
            max_vector_size: 16,
            max_vector_stride: 4,
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct MemoryAccessPatternOptimizer {
    config: MemoryAccessConfig,
}

impl MemoryAccessPatternOptimizer {
    const NAME: &'static str = "memory_access_pattern_optimizer";

    pub fn new(config: MemoryAccessConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &MemoryAccessConfig {
        &self.config
    }

    fn optimize(&self, program: &mut LoweredProgram) -> Result<PassResult> {
        let before = all_patterns(program, &self.config);
        let mut rewrites = 0;
        let mut erased = 0;

        for region in program.loop_regions()? {
            let analysis = analyze_loop(program, &region, &self.config);
            tracing::trace!(
                loop_id = %analysis.loop_id,
                accesses = analysis.accesses.len(),
                can_vectorize = analysis.can_vectorize,
                optimal_vector_size = analysis.optimal_vector_size,
                has_stride_conflicts = analysis.has_stride_conflicts,
                "loop_access_analysis"
            );
            rewrites += self.optimize_strides(program, &analysis);
        }

        let irregular = self.detect_gather_scatter(program);
        rewrites += self.optimize_gather_scatter(program, &irregular);

        for group in group_adjacent_accesses(program, &self.config) {
            coalesce_group(program, &group)?;
            rewrites += 1;
            erased += group.members.len() - 1;
        }

        if rewrites > 0 {
            let after = all_patterns(program, &self.config);
            tracing::debug!(
                rewrites,
                erased,
                impact = estimate_performance_impact(&before, &after),
                "memory_access_optimized"
            );
        }
        Ok(PassResult::from_counts(rewrites, erased))
    }

    /// Attach a strided-vector hint to inefficient strided loads and stores
    /// that a vector access can serve.
    fn optimize_strides(&self, program: &mut LoweredProgram, analysis: &LoopAccessAnalysis) -> usize {
        let mut rewritten = 0;
        for (id, pattern) in &analysis.patterns {
            if pattern.kind != PatternType::Strided || pattern.cache_efficiency >= self.config.min_cache_efficiency {
                continue;
            }
            if pattern.stride > self.config.max_vector_stride || pattern.access_size < self.config.min_coalesce_size {
                continue;
            }
            let Some(expr) = program.get_mut(*id) else {
                continue;
            };
            if !matches!(expr.op.access_kind(), Some(AccessKind::Load | AccessKind::Store)) {
                continue;
            }
            let width = pattern.access_size.min(self.config.max_vector_size);
            if let Some(port) = expr.primary_access_mut() {
                if port.hint.is_none() {
                    port.hint = Some(AccessHint::StridedVector { width });
                    rewritten += 1;
                }
            }
        }
        rewritten
    }

    /// Loads and stores whose stride exceeds the strided range.
    fn detect_gather_scatter(&self, program: &LoweredProgram) -> Vec<ExprId> {
        program
            .iter()
            .filter(|expr| {
                let Some(port) = expr.primary_access() else {
                    return false;
                };
                let irregular = port.access.stride > self.config.stride_limit;
                match expr.op.access_kind() {
                    Some(AccessKind::Load) => irregular && port.direction == Direction::Read,
                    Some(AccessKind::Store) => irregular && port.direction == Direction::Write,
                    _ => false,
                }
            })
            .map(|expr| expr.id)
            .collect()
    }

    /// A single-element access does not depend on its stride, so it is
    /// normalized to a sequential one. Wider irregular accesses stay as they are.
    fn optimize_gather_scatter(&self, program: &mut LoweredProgram, irregular: &[ExprId]) -> usize {
        let mut rewritten = 0;
        for id in irregular {
            let Some(port) = program.get_mut(*id).and_then(|expr| expr.primary_access_mut()) else {
                continue;
            };
            if port.access.count == 1 {
                port.access.stride = 1;
                rewritten += 1;
            }
        }
        rewritten
    }
}

impl Pass for MemoryAccessPatternOptimizer {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn run(&self, program: &mut LoweredProgram) -> Result<PassResult> {
        program.transaction(|p| self.optimize(p))
    }
}
