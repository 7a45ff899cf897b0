//! Tokenized subgraphs: the fused operation lists handed to the compiler.
//!
//! A [`Subgraph`] is an ordered list of value-producing nodes with element
//! types and partial shapes. Every node only references values defined before
//! it, so list order is a topological order. [`SubgraphBuilder`] infers
//! result types and shapes and rejects ill-typed combinations up front.

use std::fmt;

use serde::{Deserialize, Serialize};
use strata_lowered::{BinaryOp, ElementType, UnaryOp};

use crate::error::{Error, Result};

/// Value produced by one subgraph node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ValueId(pub u32);

impl ValueId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ValueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Dim {
    Static(usize),
    /// Known only at inference time.
    Dynamic,
}

impl Dim {
    fn matches(self, actual: usize) -> bool {
        match self {
            Dim::Static(expected) => expected == actual,
            Dim::Dynamic => true,
        }
    }

    fn merge(self, other: Dim) -> Option<Dim> {
        match (self, other) {
            (Dim::Static(a), Dim::Static(b)) if a != b => None,
            (Dim::Static(a), _) | (_, Dim::Static(a)) => Some(Dim::Static(a)),
            (Dim::Dynamic, Dim::Dynamic) => Some(Dim::Dynamic),
        }
    }
}

impl fmt::Display for Dim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dim::Static(n) => write!(f, "{n}"),
            Dim::Dynamic => f.write_str("?"),
        }
    }
}

/// Shape with a static rank and possibly dynamic dimensions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct PartialShape(Vec<Dim>);

impl PartialShape {
    pub fn new(dims: Vec<Dim>) -> Self {
        Self(dims)
    }

    pub fn fixed(dims: &[usize]) -> Self {
        Self(dims.iter().map(|d| Dim::Static(*d)).collect())
    }

    pub fn dynamic(rank: usize) -> Self {
        Self(vec![Dim::Dynamic; rank])
    }

    /// Rank-0 shape holding one element.
    pub fn scalar() -> Self {
        Self(Vec::new())
    }

    pub fn rank(&self) -> usize {
        self.0.len()
    }

    pub fn dims(&self) -> &[Dim] {
        &self.0
    }

    pub fn is_static(&self) -> bool {
        self.0.iter().all(|d| matches!(d, Dim::Static(_)))
    }

    /// Concrete dimensions when every dimension is static.
    pub fn static_dims(&self) -> Option<Vec<usize>> {
        self.0
            .iter()
            .map(|d| match d {
                Dim::Static(n) => Some(*n),
                Dim::Dynamic => None,
            })
            .collect()
    }

    /// Statically holds exactly one element.
    pub fn is_scalar(&self) -> bool {
        self.0.iter().all(|d| *d == Dim::Static(1))
    }

    /// Whether concrete `dims` are an instance of this shape.
    pub fn matches(&self, dims: &[usize]) -> bool {
        self.0.len() == dims.len() && self.0.iter().zip(dims).all(|(d, actual)| d.matches(*actual))
    }

    fn merge(&self, other: &PartialShape) -> Option<PartialShape> {
        if self.rank() != other.rank() {
            return None;
        }
        self.0
            .iter()
            .zip(&other.0)
            .map(|(a, b)| a.merge(*b))
            .collect::<Option<Vec<_>>>()
            .map(PartialShape)
    }
}

impl fmt::Display for PartialShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, dim) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{dim}")?;
        }
        f.write_str("]")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NodeOp {
    /// Subgraph input, bound positionally at inference.
    Parameter { name: String },
    Constant { value: f32 },
    Unary { op: UnaryOp, input: ValueId },
    Binary { op: BinaryOp, lhs: ValueId, rhs: ValueId },
    Convert { to: ElementType, input: ValueId },
    /// Plain 2-D `[M, K] x [K, N]` product.
    MatMul { a: ValueId, b: ValueId },
}

impl NodeOp {
    pub fn operands(&self) -> Vec<ValueId> {
        match self {
            NodeOp::Parameter { .. } | NodeOp::Constant { .. } => Vec::new(),
            NodeOp::Unary { input, .. } | NodeOp::Convert { input, .. } => vec![*input],
            NodeOp::Binary { lhs, rhs, .. } => vec![*lhs, *rhs],
            NodeOp::MatMul { a, b } => vec![*a, *b],
        }
    }

    /// Computed per element inside a fused loop.
    pub fn is_elementwise(&self) -> bool {
        matches!(
            self,
            NodeOp::Constant { .. } | NodeOp::Unary { .. } | NodeOp::Binary { .. } | NodeOp::Convert { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: ValueId,
    pub op: NodeOp,
    pub element_type: ElementType,
    pub shape: PartialShape,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subgraph {
    nodes: Vec<Node>,
    outputs: Vec<(String, ValueId)>,
}

impl Subgraph {
    pub fn builder() -> SubgraphBuilder {
        SubgraphBuilder::default()
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, id: ValueId) -> Option<&Node> {
        self.nodes.get(id.index()).filter(|node| node.id == id)
    }

    pub fn outputs(&self) -> &[(String, ValueId)] {
        &self.outputs
    }

    /// Parameters in declaration order, which is the inference input order.
    pub fn parameters(&self) -> impl Iterator<Item = (&str, &Node)> {
        self.nodes.iter().filter_map(|node| match &node.op {
            NodeOp::Parameter { name } => Some((name.as_str(), node)),
            _ => None,
        })
    }

    /// Check ids, operand order and outputs. Subgraphs from the builder
    /// always pass; deserialized ones may not.
    pub fn validate(&self) -> Result<()> {
        for (position, node) in self.nodes.iter().enumerate() {
            if node.id.index() != position {
                return Err(Error::InvalidSubgraph(format!("node {} stored at position {position}", node.id)));
            }
            if let Some(operand) = node.op.operands().into_iter().find(|v| v.index() >= position) {
                return Err(Error::InvalidSubgraph(format!(
                    "node {} uses {operand}, which is not defined before it",
                    node.id
                )));
            }
        }
        if self.outputs.is_empty() {
            return Err(Error::InvalidSubgraph("subgraph has no outputs".into()));
        }
        for (name, value) in &self.outputs {
            if self.node(*value).is_none() {
                return Err(Error::InvalidSubgraph(format!("output '{name}' refers to unknown value {value}")));
            }
        }
        Ok(())
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|err| Error::InvalidSubgraph(err.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let subgraph: Subgraph = serde_json::from_str(json).map_err(|err| Error::InvalidSubgraph(err.to_string()))?;
        subgraph.validate()?;
        Ok(subgraph)
    }
}

/// Incremental [`Subgraph`] construction with type and shape inference.
#[derive(Debug, Default)]
pub struct SubgraphBuilder {
    nodes: Vec<Node>,
    outputs: Vec<(String, ValueId)>,
}

impl SubgraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parameter(&mut self, name: impl Into<String>, element_type: ElementType, shape: PartialShape) -> ValueId {
        self.push(NodeOp::Parameter { name: name.into() }, element_type, shape)
    }

    pub fn constant(&mut self, value: f32) -> ValueId {
        self.push(NodeOp::Constant { value }, ElementType::F32, PartialShape::scalar())
    }

    pub fn unary(&mut self, op: UnaryOp, input: ValueId) -> Result<ValueId> {
        let node = self.lookup(input)?;
        let (element_type, shape) = (node.element_type, node.shape.clone());
        Ok(self.push(NodeOp::Unary { op, input }, element_type, shape))
    }

    /// Elementwise binary op. Shapes must agree, except that a statically
    /// scalar operand broadcasts to the other.
    pub fn binary(&mut self, op: BinaryOp, lhs: ValueId, rhs: ValueId) -> Result<ValueId> {
        let (left, right) = (self.lookup(lhs)?, self.lookup(rhs)?);
        if left.element_type != right.element_type {
            return Err(Error::InvalidSubgraph(format!(
                "{op:?} mixes {} and {}",
                left.element_type, right.element_type
            )));
        }
        let shape = if right.shape.is_scalar() {
            left.shape.clone()
        } else if left.shape.is_scalar() {
            right.shape.clone()
        } else {
            left.shape.merge(&right.shape).ok_or_else(|| {
                Error::InvalidSubgraph(format!("{op:?} operands {} and {} do not agree", left.shape, right.shape))
            })?
        };
        let element_type = left.element_type;
        Ok(self.push(NodeOp::Binary { op, lhs, rhs }, element_type, shape))
    }

    pub fn convert(&mut self, input: ValueId, to: ElementType) -> Result<ValueId> {
        let shape = self.lookup(input)?.shape.clone();
        Ok(self.push(NodeOp::Convert { to, input }, to, shape))
    }

    pub fn matmul(&mut self, a: ValueId, b: ValueId) -> Result<ValueId> {
        let (left, right) = (self.lookup(a)?, self.lookup(b)?);
        if left.element_type != ElementType::F32 || right.element_type != ElementType::F32 {
            return Err(Error::InvalidSubgraph(format!(
                "MatMul requires f32 operands, got {} and {}",
                left.element_type, right.element_type
            )));
        }
        let (m, k_a, k_b, n) = match (left.shape.dims(), right.shape.dims()) {
            ([m, k_a], [k_b, n]) => (*m, *k_a, *k_b, *n),
            _ => {
                return Err(Error::InvalidSubgraph(format!(
                    "MatMul expects two matrices, got {} and {}",
                    left.shape, right.shape
                )))
            }
        };
        if k_a.merge(k_b).is_none() {
            return Err(Error::InvalidSubgraph(format!(
                "MatMul inner dimensions differ: {} and {}",
                left.shape, right.shape
            )));
        }
        Ok(self.push(NodeOp::MatMul { a, b }, ElementType::F32, PartialShape::new(vec![m, n])))
    }

    pub fn output(&mut self, name: impl Into<String>, value: ValueId) -> Result<()> {
        let name = name.into();
        self.lookup(value)?;
        if self.outputs.iter().any(|(existing, _)| *existing == name) {
            return Err(Error::InvalidSubgraph(format!("output '{name}' declared twice")));
        }
        self.outputs.push((name, value));
        Ok(())
    }

    pub fn build(self) -> Result<Subgraph> {
        let subgraph = Subgraph {
            nodes: self.nodes,
            outputs: self.outputs,
        };
        subgraph.validate()?;
        Ok(subgraph)
    }

    fn lookup(&self, id: ValueId) -> Result<&Node> {
        self.nodes
            .get(id.index())
            .ok_or_else(|| Error::InvalidSubgraph(format!("unknown value {id}")))
    }

    fn push(&mut self, op: NodeOp, element_type: ElementType, shape: PartialShape) -> ValueId {
        let id = ValueId(self.nodes.len() as u32);
        self.nodes.push(Node {
            id,
            op,
            element_type,
            shape,
        });
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_operand_broadcasts() {
        let mut builder = Subgraph::builder();
        let x = builder.parameter("x", ElementType::F32, PartialShape::new(vec![Dim::Dynamic, Dim::Static(4)]));
        let two = builder.constant(2.0);
        let y = builder.binary(BinaryOp::Mul, x, two).unwrap();
        builder.output("y", y).unwrap();
        let subgraph = builder.build().unwrap();
        assert_eq!(subgraph.node(y).unwrap().shape.to_string(), "[?,4]");
    }

    #[test]
    fn dynamic_dims_merge_with_static() {
        let mut builder = Subgraph::builder();
        let a = builder.parameter("a", ElementType::F32, PartialShape::new(vec![Dim::Dynamic, Dim::Static(3)]));
        let b = builder.parameter("b", ElementType::F32, PartialShape::new(vec![Dim::Static(2), Dim::Dynamic]));
        let c = builder.binary(BinaryOp::Add, a, b).unwrap();
        assert_eq!(
            builder.nodes[c.index()].shape,
            PartialShape::fixed(&[2, 3]),
        );
    }

    #[test]
    fn mismatched_operands_are_rejected() {
        let mut builder = Subgraph::builder();
        let a = builder.parameter("a", ElementType::F32, PartialShape::fixed(&[2, 3]));
        let b = builder.parameter("b", ElementType::F32, PartialShape::fixed(&[3, 2]));
        let i = builder.parameter("i", ElementType::I32, PartialShape::fixed(&[2, 3]));
        assert!(matches!(builder.binary(BinaryOp::Add, a, b), Err(Error::InvalidSubgraph(_))));
        assert!(matches!(builder.binary(BinaryOp::Add, a, i), Err(Error::InvalidSubgraph(_))));
        assert!(builder.matmul(a, a).is_err());
        assert!(builder.matmul(a, b).is_ok());
    }

    #[test]
    fn subgraph_without_outputs_is_invalid() {
        let mut builder = Subgraph::builder();
        builder.parameter("x", ElementType::F32, PartialShape::dynamic(1));
        assert!(matches!(builder.build(), Err(Error::InvalidSubgraph(_))));
    }

    #[test]
    fn json_round_trip_revalidates() {
        let mut builder = Subgraph::builder();
        let x = builder.parameter("x", ElementType::F32, PartialShape::dynamic(1));
        let y = builder.unary(UnaryOp::Relu, x).unwrap();
        builder.output("y", y).unwrap();
        let subgraph = builder.build().unwrap();

        let json = subgraph.to_json().unwrap();
        assert_eq!(Subgraph::from_json(&json).unwrap(), subgraph);

        let forward_ref = json.replace("\"input\": 0", "\"input\": 1");
        assert!(Subgraph::from_json(&forward_ref).is_err());
    }

    #[test]
    fn partial_shape_matching() {
        let shape = PartialShape::new(vec![Dim::Dynamic, Dim::Static(4)]);
        assert!(shape.matches(&[7, 4]));
        assert!(!shape.matches(&[7, 5]));
        assert!(!shape.matches(&[4]));
        assert!(PartialShape::scalar().is_scalar());
        assert!(PartialShape::fixed(&[1, 1]).is_scalar());
        assert!(!PartialShape::dynamic(1).is_scalar());
    }
}
