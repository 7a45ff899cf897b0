//! Runtime shapes of every buffer of a lowered subgraph.
//!
//! The plan is recorded during lowering in dependency order, so resolving it
//! is a single forward walk: inputs take the caller's dimensions, fused
//! elementwise results follow their reference tensor, GEMM results are
//! `[M, N]` and packed weights take the blocked length.

use serde::Serialize;
use strata_kernels::GemmStaticParams;
use strata_lowered::{BufferId, ShapeContext, ShapeMap};

use crate::error::{Error, Result};
use crate::subgraph::PartialShape;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ShapeRule {
    /// Dimensions of inference input `index`, checked against the declaration.
    Input { index: usize, declared: PartialShape },
    /// Same dimensions as `reference`; every buffer in `agree` must match it.
    Elementwise { reference: BufferId, agree: Vec<BufferId> },
    /// Elementwise result whose operands are all scalars; keeps its declared dims.
    Scalar { dims: Vec<usize> },
    MatMul { a: BufferId, b: BufferId },
    Packed { b: BufferId, params: GemmStaticParams },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlannedBuffer {
    pub buffer: BufferId,
    pub name: String,
    pub rule: ShapeRule,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ShapePlan {
    entries: Vec<PlannedBuffer>,
}

impl ShapePlan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, buffer: BufferId, name: impl Into<String>, rule: ShapeRule) {
        self.entries.push(PlannedBuffer {
            buffer,
            name: name.into(),
            rule,
        });
    }

    pub fn entries(&self) -> &[PlannedBuffer] {
        &self.entries
    }

    pub fn input_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| matches!(entry.rule, ShapeRule::Input { .. }))
            .count()
    }

    /// Concrete dimensions of every planned buffer for one call.
    pub fn resolve(&self, inputs: &[&[usize]]) -> Result<ShapeMap> {
        let expected = self.input_count();
        if inputs.len() != expected {
            return Err(Error::InputCount {
                expected,
                actual: inputs.len(),
            });
        }

        let mut shapes = ShapeMap::new();
        for entry in &self.entries {
            let dims = match &entry.rule {
                ShapeRule::Input { index, declared } => {
                    let dims = inputs[*index];
                    if !declared.matches(dims) {
                        return Err(Error::shape(
                            &entry.name,
                            format!("declared {declared}, got {dims:?}"),
                        ));
                    }
                    dims.to_vec()
                }
                ShapeRule::Elementwise { reference, agree } => {
                    let dims = lookup(&shapes, *reference)?.to_vec();
                    for other in agree {
                        let other_dims = lookup(&shapes, *other)?;
                        if other_dims != dims.as_slice() {
                            return Err(Error::shape(
                                &entry.name,
                                format!("operands {dims:?} and {other_dims:?} do not agree"),
                            ));
                        }
                    }
                    dims
                }
                ShapeRule::Scalar { dims } => dims.clone(),
                ShapeRule::MatMul { a, b } => {
                    let (m, n) = matmul_dims(&entry.name, lookup(&shapes, *a)?, lookup(&shapes, *b)?)?;
                    vec![m, n]
                }
                ShapeRule::Packed { b, params } => match lookup(&shapes, *b)? {
                    [k, n] => vec![params.packed_len(*n, *k)],
                    other => {
                        return Err(Error::shape(&entry.name, format!("weights must be a matrix, got {other:?}")))
                    }
                },
            };
            shapes.insert(entry.buffer, dims);
        }
        Ok(shapes)
    }
}

fn lookup(shapes: &ShapeMap, buffer: BufferId) -> Result<&[usize]> {
    shapes
        .dims(buffer)
        .ok_or_else(|| Error::shape(buffer.to_string(), "shape is not planned before its use"))
}

/// `(M, N)` of a product, requiring matching inner dimensions.
fn matmul_dims(name: &str, a: &[usize], b: &[usize]) -> Result<(usize, usize)> {
    match (a, b) {
        ([m, k_a], [k_b, n]) if k_a == k_b => Ok((*m, *n)),
        _ => Err(Error::shape(name, format!("cannot multiply {a:?} by {b:?}"))),
    }
}
