//! The lowered program: an ordered, loop-explicit sequence of expressions.
//!
//! Execution order is sequence order. Loops are delimited by paired
//! `LoopBegin`/`LoopEnd` markers; their trip counts live in the program's
//! loop table. Passes edit the sequence in place; [`LoweredProgram::transaction`]
//! gives them all-or-nothing semantics.

use crate::element::ElementType;
use crate::error::{LoweredError, Result};
use crate::expression::{Direction, Expression, PortConnector};
use crate::ids::{BufferId, ExprId, LoopId, TensorId};
use crate::op::{AccessKind, LoopEdge, LoopMarker, MemoryAccess};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Total number of elements a loop walks over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkAmount {
    Static(usize),
    /// Element count of a buffer, known only at run time.
    Elements(BufferId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LoopInfo {
    pub work_amount: WorkAmount,
    /// Elements consumed per iteration.
    pub increment: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BufferKind {
    Input,
    Output,
    Scratch,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferDecl {
    pub id: BufferId,
    pub name: String,
    pub element_type: ElementType,
    pub kind: BufferKind,
}

/// Matched marker positions of one loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopRegion {
    pub loop_id: LoopId,
    pub begin: usize,
    pub end: usize,
    /// Zero for outermost loops.
    pub depth: usize,
}

impl LoopRegion {
    /// Positions strictly between the markers.
    pub fn body(&self) -> std::ops::Range<usize> {
        self.begin + 1..self.end
    }
}

#[derive(Debug, Clone, Default)]
pub struct LoweredProgram {
    exprs: Vec<Expression>,
    loops: BTreeMap<LoopId, LoopInfo>,
    buffers: BTreeMap<BufferId, BufferDecl>,
    next_expr: u32,
    next_loop: u32,
    next_buffer: u32,
    next_tensor: u32,
}

#[derive(Serialize)]
struct ProgramDump<'a> {
    buffers: Vec<&'a BufferDecl>,
    loops: Vec<(LoopId, &'a LoopInfo)>,
    expressions: &'a [Expression],
}

impl LoweredProgram {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn declare_buffer(&mut self, name: impl Into<String>, element_type: ElementType, kind: BufferKind) -> BufferId {
        let id = BufferId(self.next_buffer);
        self.next_buffer += 1;
        self.buffers.insert(
            id,
            BufferDecl {
                id,
                name: name.into(),
                element_type,
                kind,
            },
        );
        id
    }

    pub fn buffer(&self, id: BufferId) -> Option<&BufferDecl> {
        self.buffers.get(&id)
    }

    pub fn buffers(&self) -> impl Iterator<Item = &BufferDecl> {
        self.buffers.values()
    }

    pub fn declare_loop(&mut self, info: LoopInfo) -> LoopId {
        let id = LoopId(self.next_loop);
        self.next_loop += 1;
        self.loops.insert(id, info);
        id
    }

    pub fn loop_info(&self, id: LoopId) -> Option<&LoopInfo> {
        self.loops.get(&id)
    }

    pub fn new_expr_id(&mut self) -> ExprId {
        let id = ExprId(self.next_expr);
        self.next_expr += 1;
        id
    }

    pub fn new_tensor(&mut self) -> TensorId {
        let id = TensorId(self.next_tensor);
        self.next_tensor += 1;
        id
    }

    /// Append an expression, returning its id.
    pub fn push(&mut self, expr: Expression) -> ExprId {
        let id = expr.id;
        self.next_expr = self.next_expr.max(id.0 + 1);
        self.exprs.push(expr);
        id
    }

    pub fn insert(&mut self, position: usize, expr: Expression) -> Result<ExprId> {
        if position > self.exprs.len() {
            return Err(LoweredError::malformed(
                expr.id,
                format!("insert position {position} beyond program length {}", self.exprs.len()),
            ));
        }
        let id = expr.id;
        self.next_expr = self.next_expr.max(id.0 + 1);
        self.exprs.insert(position, expr);
        Ok(id)
    }

    pub fn remove(&mut self, id: ExprId) -> Result<Expression> {
        let position = self.position(id).ok_or(LoweredError::UnknownExpression(id))?;
        Ok(self.exprs.remove(position))
    }

    pub fn position(&self, id: ExprId) -> Option<usize> {
        self.exprs.iter().position(|expr| expr.id == id)
    }

    pub fn get(&self, id: ExprId) -> Option<&Expression> {
        self.exprs.iter().find(|expr| expr.id == id)
    }

    pub fn get_mut(&mut self, id: ExprId) -> Option<&mut Expression> {
        self.exprs.iter_mut().find(|expr| expr.id == id)
    }

    pub fn at(&self, position: usize) -> Option<&Expression> {
        self.exprs.get(position)
    }

    pub fn expressions(&self) -> &[Expression] {
        &self.exprs
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Expression> {
        self.exprs.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, Expression> {
        self.exprs.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.exprs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exprs.is_empty()
    }

    /// Ids of expressions reading any output of `id`.
    pub fn consumers(&self, id: ExprId) -> Vec<ExprId> {
        self.exprs
            .iter()
            .filter(|expr| expr.inputs.iter().any(|input| input.producer == id))
            .map(|expr| expr.id)
            .collect()
    }

    /// Rewire every input reading `producer:port` to `to`. Returns the number
    /// of connectors rewritten.
    pub fn replace_uses(&mut self, producer: ExprId, port: usize, to: PortConnector) -> usize {
        let mut rewired = 0;
        for expr in &mut self.exprs {
            for input in &mut expr.inputs {
                if input.producer == producer && input.port == port {
                    *input = to;
                    rewired += 1;
                }
            }
        }
        rewired
    }

    /// Tag every expression with its position. Returns how many tags changed.
    pub fn set_topological_order(&mut self) -> usize {
        let mut retagged = 0;
        for (position, expr) in self.exprs.iter_mut().enumerate() {
            let order = Some(position as u64);
            if expr.topo_order != order {
                expr.topo_order = order;
                retagged += 1;
            }
        }
        retagged
    }

    /// Matched loop regions in order of their begin markers.
    pub fn loop_regions(&self) -> Result<Vec<LoopRegion>> {
        let mut regions = Vec::new();
        let mut open: Vec<(LoopId, usize)> = Vec::new();

        for (position, expr) in self.exprs.iter().enumerate() {
            match expr.op.loop_marker() {
                Some((loop_id, LoopEdge::Begin)) => open.push((loop_id, position)),
                Some((loop_id, LoopEdge::End)) => match open.pop() {
                    Some((begin_id, begin)) if begin_id == loop_id => regions.push(LoopRegion {
                        loop_id,
                        begin,
                        end: position,
                        depth: open.len(),
                    }),
                    other => {
                        return Err(LoweredError::MisnestedLoop {
                            expected: other.map(|(id, _)| id),
                            found: loop_id,
                            position,
                        })
                    }
                },
                None => {}
            }
        }

        if let Some((loop_id, position)) = open.pop() {
            return Err(LoweredError::UnclosedLoop { loop_id, position });
        }

        regions.sort_by_key(|region| region.begin);
        Ok(regions)
    }

    /// Check every structural invariant of the program.
    pub fn validate(&self) -> Result<()> {
        for info in self.loops.values() {
            if let WorkAmount::Elements(buffer) = info.work_amount {
                if !self.buffers.contains_key(&buffer) {
                    return Err(LoweredError::UnknownBuffer(buffer));
                }
            }
        }

        let mut positions: HashMap<ExprId, usize> = HashMap::with_capacity(self.exprs.len());
        let mut scopes: HashMap<ExprId, Vec<LoopId>> = HashMap::with_capacity(self.exprs.len());
        let mut open: Vec<(LoopId, usize)> = Vec::new();
        let mut begun: HashSet<LoopId> = HashSet::new();

        for (position, expr) in self.exprs.iter().enumerate() {
            if positions.insert(expr.id, position).is_some() {
                return Err(LoweredError::DuplicateExpression(expr.id));
            }

            let enclosing: Vec<LoopId> = open.iter().map(|(id, _)| *id).collect();

            match expr.op.loop_marker() {
                Some((loop_id, LoopEdge::Begin)) => {
                    if !self.loops.contains_key(&loop_id) {
                        return Err(LoweredError::UnknownLoop(loop_id));
                    }
                    if !begun.insert(loop_id) {
                        return Err(LoweredError::DuplicateLoop(loop_id));
                    }
                    open.push((loop_id, position));
                }
                Some((loop_id, LoopEdge::End)) => {
                    let innermost = open.last().map(|(id, _)| *id);
                    if innermost != Some(loop_id) {
                        return Err(LoweredError::MisnestedLoop {
                            expected: innermost,
                            found: loop_id,
                            position,
                        });
                    }
                    open.pop();
                }
                None => {
                    let declared = expr.loop_ids();
                    if declared != enclosing {
                        return Err(LoweredError::LoopMembership {
                            expr: expr.id,
                            declared,
                            enclosing,
                        });
                    }
                }
            }

            for input in &expr.inputs {
                let dangling = || LoweredError::DanglingPort {
                    consumer: expr.id,
                    producer: input.producer,
                    port: input.port,
                };
                let producer_position = match positions.get(&input.producer) {
                    Some(&p) if p < position => p,
                    _ => return Err(dangling()),
                };
                let producer = &self.exprs[producer_position];
                match producer.outputs.get(input.port) {
                    Some(out) if out.tensor == input.tensor => {}
                    _ => return Err(dangling()),
                }
                let producer_scope = scopes.get(&input.producer).map(Vec::as_slice).unwrap_or(&[]);
                let current: Vec<LoopId> = open.iter().map(|(id, _)| *id).collect();
                if !current.starts_with(producer_scope) {
                    return Err(LoweredError::ScopeEscape {
                        consumer: expr.id,
                        producer: input.producer,
                    });
                }
            }

            for port in &expr.memory {
                if !self.buffers.contains_key(&port.buffer) {
                    return Err(LoweredError::UnknownBuffer(port.buffer));
                }
            }
            validate_access_shape(expr)?;

            scopes.insert(expr.id, enclosing);
        }

        if let Some(&(loop_id, position)) = open.last() {
            return Err(LoweredError::UnclosedLoop { loop_id, position });
        }

        Ok(())
    }

    /// Apply `edit`, then validate. On any error the program is restored to
    /// its state before the call.
    pub fn transaction<T, F>(&mut self, edit: F) -> Result<T>
    where
        F: FnOnce(&mut Self) -> Result<T>,
    {
        let snapshot = self.clone();
        let outcome = edit(self).and_then(|value| self.validate().map(|()| value));
        if outcome.is_err() {
            *self = snapshot;
        }
        outcome
    }

    /// JSON dump used for trace-level IR logging.
    pub fn to_json(&self) -> Result<String> {
        let dump = ProgramDump {
            buffers: self.buffers.values().collect(),
            loops: self.loops.iter().map(|(id, info)| (*id, info)).collect(),
            expressions: &self.exprs,
        };
        Ok(serde_json::to_string_pretty(&dump)?)
    }
}

fn validate_access_shape(expr: &Expression) -> Result<()> {
    let Some(kind) = expr.op.access_kind() else {
        return Ok(());
    };
    let expected = match kind {
        AccessKind::Load | AccessKind::BroadcastLoad => Direction::Read,
        AccessKind::Store => Direction::Write,
    };
    match expr.memory.first() {
        Some(port) if port.direction == expected => {}
        _ => {
            return Err(LoweredError::malformed(
                expr.id,
                format!("{} requires a {:?} memory port", expr.op.name(), expected),
            ))
        }
    }
    match kind {
        AccessKind::Load | AccessKind::BroadcastLoad if expr.outputs.is_empty() => {
            Err(LoweredError::malformed(expr.id, "load without output ports"))
        }
        AccessKind::Store if expr.inputs.is_empty() => Err(LoweredError::malformed(expr.id, "store without inputs")),
        _ => Ok(()),
    }
}

impl<'a> IntoIterator for &'a LoweredProgram {
    type Item = &'a Expression;
    type IntoIter = std::slice::Iter<'a, Expression>;

    fn into_iter(self) -> Self::IntoIter {
        self.exprs.iter()
    }
}
