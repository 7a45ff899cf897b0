//! Classification of register-level memory accesses.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::MemoryAccessConfig;
use crate::expression::{Direction, Expression};
use crate::ids::{BufferId, ExprId, LoopId};
use crate::op::MemoryAccess;
use crate::program::{LoopRegion, LoweredProgram};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PatternType {
    Sequential,
    Strided,
    Gather,
    Scatter,
    Broadcast,
    Unknown,
}

/// Derived description of one access; recomputed on every analysis run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MemoryAccessPattern {
    pub kind: PatternType,
    pub stride: usize,
    pub access_size: usize,
    pub alignment: usize,
    pub is_coalesced: bool,
    pub cache_efficiency: f64,
    /// Bytes moved per execution of the access.
    pub memory_bandwidth: usize,
}

/// Per-loop summary of the accesses whose innermost loop is `loop_id`.
#[derive(Debug, Clone, PartialEq)]
pub struct LoopAccessAnalysis {
    pub loop_id: LoopId,
    pub accesses: Vec<ExprId>,
    pub patterns: BTreeMap<ExprId, MemoryAccessPattern>,
    /// Some buffer is accessed with more than one stride inside the loop.
    pub has_stride_conflicts: bool,
    pub can_vectorize: bool,
    pub optimal_vector_size: usize,
}

/// Deterministic heuristic used to prioritise rewrites, never for correctness.
pub fn cache_efficiency(kind: PatternType, stride: usize) -> f64 {
    match kind {
        PatternType::Sequential => 0.95,
        PatternType::Broadcast => 0.90,
        PatternType::Strided if stride <= 4 => 0.8,
        PatternType::Strided if stride <= 16 => 0.6,
        PatternType::Strided => 0.3,
        PatternType::Gather | PatternType::Scatter => 0.2,
        PatternType::Unknown => 0.5,
    }
}

/// Classify the primary access of `expr`; `None` for expressions that do
/// not move data between registers and memory.
pub fn classify(program: &LoweredProgram, expr: &Expression, config: &MemoryAccessConfig) -> Option<MemoryAccessPattern> {
    let port = expr.primary_access()?;
    let stride = port.access.stride;

    let kind = if stride == 1 {
        PatternType::Sequential
    } else if stride > 1 && stride <= config.stride_limit {
        PatternType::Strided
    } else if expr.op.is_broadcast_access() {
        PatternType::Broadcast
    } else if stride > config.stride_limit {
        match port.direction {
            Direction::Read => PatternType::Gather,
            Direction::Write => PatternType::Scatter,
        }
    } else {
        PatternType::Unknown
    };

    let element_size = program
        .buffer(port.buffer)
        .map(|decl| decl.element_type.size_bytes())
        .unwrap_or(1);
    let alignment = if port.access.offset % config.preferred_alignment.max(1) == 0 {
        config.preferred_alignment
    } else {
        1
    };

    Some(MemoryAccessPattern {
        kind,
        stride,
        access_size: port.access.count,
        alignment,
        is_coalesced: alignment >= config.preferred_alignment && kind == PatternType::Sequential,
        cache_efficiency: cache_efficiency(kind, stride),
        memory_bandwidth: port.access.count * element_size,
    })
}

pub fn analyze_loop(program: &LoweredProgram, region: &LoopRegion, config: &MemoryAccessConfig) -> LoopAccessAnalysis {
    let mut accesses = Vec::new();
    let mut patterns = BTreeMap::new();
    let mut strides: BTreeMap<BufferId, usize> = BTreeMap::new();
    let mut has_stride_conflicts = false;

    for position in region.body() {
        let Some(expr) = program.at(position) else {
            continue;
        };
        if expr.loops.last().map(|port| port.loop_id) != Some(region.loop_id) {
            continue;
        }
        let Some(pattern) = classify(program, expr, config) else {
            continue;
        };
        if let Some(port) = expr.primary_access() {
            let seen = *strides.entry(port.buffer).or_insert(port.access.stride);
            has_stride_conflicts |= seen != port.access.stride;
        }
        accesses.push(expr.id);
        patterns.insert(expr.id, pattern);
    }

    let optimal_vector_size = optimal_vector_size(patterns.values(), config);
    LoopAccessAnalysis {
        loop_id: region.loop_id,
        accesses,
        patterns,
        has_stride_conflicts,
        can_vectorize: optimal_vector_size > 1,
        optimal_vector_size,
    }
}

/// Largest access width (capped at `max_vector_size`) among sequential or
/// strided accesses that meet the efficiency threshold.
pub fn optimal_vector_size<'a>(
    patterns: impl IntoIterator<Item = &'a MemoryAccessPattern>,
    config: &MemoryAccessConfig,
) -> usize {
    patterns
        .into_iter()
        .filter(|p| matches!(p.kind, PatternType::Sequential | PatternType::Strided))
        .filter(|p| p.cache_efficiency >= config.min_cache_efficiency)
        .map(|p| p.access_size.min(config.max_vector_size))
        .fold(1, usize::max)
}

/// Ratio of summed cache efficiency after a rewrite to before it.
pub fn estimate_performance_impact(before: &[MemoryAccessPattern], after: &[MemoryAccessPattern]) -> f64 {
    let original: f64 = before.iter().map(|p| p.cache_efficiency).sum();
    let optimized: f64 = after.iter().map(|p| p.cache_efficiency).sum();
    if original > 0.0 {
        optimized / original
    } else {
        1.0
    }
}

/// Patterns of every register-level access in the program.
pub fn all_patterns(program: &LoweredProgram, config: &MemoryAccessConfig) -> Vec<MemoryAccessPattern> {
    program
        .iter()
        .filter_map(|expr| classify(program, expr, config))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern(kind: PatternType, access_size: usize, cache_efficiency: f64) -> MemoryAccessPattern {
        MemoryAccessPattern {
            kind,
            stride: 1,
            access_size,
            alignment: 1,
            is_coalesced: false,
            cache_efficiency,
            memory_bandwidth: 0,
        }
    }

    #[test]
    fn efficiency_table() {
        assert_eq!(cache_efficiency(PatternType::Sequential, 1), 0.95);
        assert_eq!(cache_efficiency(PatternType::Broadcast, 0), 0.90);
        assert_eq!(cache_efficiency(PatternType::Strided, 4), 0.8);
        assert_eq!(cache_efficiency(PatternType::Strided, 8), 0.6);
        assert_eq!(cache_efficiency(PatternType::Strided, 16), 0.6);
        assert_eq!(cache_efficiency(PatternType::Strided, 17), 0.3);
        assert_eq!(cache_efficiency(PatternType::Gather, 128), 0.2);
        assert_eq!(cache_efficiency(PatternType::Unknown, 0), 0.5);
    }

    #[test]
    fn vector_size_ignores_inefficient_and_irregular_accesses() {
        let config = MemoryAccessConfig::default();
        let patterns = [
            pattern(PatternType::Sequential, 8, 0.95),
            pattern(PatternType::Strided, 32, 0.3),
            pattern(PatternType::Broadcast, 64, 0.9),
        ];
        assert_eq!(optimal_vector_size(patterns.iter(), &config), 8);

        let wide = [pattern(PatternType::Sequential, 64, 0.95)];
        assert_eq!(optimal_vector_size(wide.iter(), &config), 16);
        assert_eq!(optimal_vector_size(std::iter::empty(), &config), 1);
    }

    #[test]
    fn performance_impact_ratio() {
        let before = [pattern(PatternType::Strided, 4, 0.3)];
        let after = [pattern(PatternType::Sequential, 4, 0.9)];
        assert!((estimate_performance_impact(&before, &after) - 3.0).abs() < 1e-9);
        assert_eq!(estimate_performance_impact(&[], &after), 1.0);
    }
}
