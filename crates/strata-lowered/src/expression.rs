use crate::element::ElementType;
use crate::ids::{BufferId, ExprId, LoopId, TensorId};
use crate::op::{MemoryAccess, OpKind};
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Reference from a consumer input to a producer output port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortConnector {
    pub producer: ExprId,
    pub port: usize,
    pub tensor: TensorId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputPort {
    pub tensor: TensorId,
    pub element_type: ElementType,
    /// Lane slice of the producer's register for split ports.
    pub lanes: Option<Range<usize>>,
}

impl OutputPort {
    pub fn new(tensor: TensorId, element_type: ElementType) -> Self {
        Self {
            tensor,
            element_type,
            lanes: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Read,
    Write,
}

/// Strided access in element units: lane `l` touches `offset + l * stride`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AccessDescriptor {
    pub stride: usize,
    pub count: usize,
    pub offset: usize,
}

impl AccessDescriptor {
    pub fn new(stride: usize, count: usize, offset: usize) -> Self {
        Self { stride, count, offset }
    }

    pub fn contiguous(count: usize, offset: usize) -> Self {
        Self::new(1, count, offset)
    }

    /// One past the last element touched, relative to the buffer start.
    pub fn end(&self) -> usize {
        if self.count == 0 {
            self.offset
        } else {
            self.offset + (self.count - 1) * self.stride + 1
        }
    }
}

/// Emitter hint attached by the memory-access optimizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccessHint {
    /// Emit a vector gather with a fixed small stride instead of scalar accesses.
    StridedVector { width: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryPort {
    pub buffer: BufferId,
    pub direction: Direction,
    pub access: AccessDescriptor,
    pub hint: Option<AccessHint>,
}

impl MemoryPort {
    pub fn read(buffer: BufferId, access: AccessDescriptor) -> Self {
        Self {
            buffer,
            direction: Direction::Read,
            access,
            hint: None,
        }
    }

    pub fn write(buffer: BufferId, access: AccessDescriptor) -> Self {
        Self {
            buffer,
            direction: Direction::Write,
            access,
            hint: None,
        }
    }
}

/// Membership in one enclosing loop; memory ports advance by
/// `ptr_increment` elements per iteration of that loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LoopPort {
    pub loop_id: LoopId,
    pub ptr_increment: usize,
}

/// One operation of a lowered program.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Expression {
    pub id: ExprId,
    pub op: OpKind,
    pub inputs: Vec<PortConnector>,
    pub outputs: Vec<OutputPort>,
    pub memory: Vec<MemoryPort>,
    /// Enclosing loops, outermost first.
    pub loops: Vec<LoopPort>,
    pub topo_order: Option<u64>,
}

impl Expression {
    pub fn new(id: ExprId, op: OpKind) -> Self {
        Self {
            id,
            op,
            inputs: Vec::new(),
            outputs: Vec::new(),
            memory: Vec::new(),
            loops: Vec::new(),
            topo_order: None,
        }
    }

    pub fn with_input(mut self, connector: PortConnector) -> Self {
        self.inputs.push(connector);
        self
    }

    pub fn with_output(mut self, port: OutputPort) -> Self {
        self.outputs.push(port);
        self
    }

    pub fn with_memory(mut self, port: MemoryPort) -> Self {
        self.memory.push(port);
        self
    }

    pub fn with_loops(mut self, loops: Vec<LoopPort>) -> Self {
        self.loops = loops;
        self
    }

    /// Connector to output `port` of this expression.
    pub fn output(&self, port: usize) -> Option<PortConnector> {
        self.outputs.get(port).map(|out| PortConnector {
            producer: self.id,
            port,
            tensor: out.tensor,
        })
    }

    pub fn loop_ids(&self) -> Vec<LoopId> {
        self.loops.iter().map(|port| port.loop_id).collect()
    }

    /// The descriptor analysed for register-level accesses.
    pub fn primary_access(&self) -> Option<&MemoryPort> {
        if self.op.is_memory_access() {
            self.memory.first()
        } else {
            None
        }
    }

    pub fn primary_access_mut(&mut self) -> Option<&mut MemoryPort> {
        if self.op.is_memory_access() {
            self.memory.first_mut()
        } else {
            None
        }
    }

    pub fn touches_buffer(&self, buffer: BufferId) -> bool {
        self.memory.iter().any(|port| port.buffer == buffer)
    }

    pub fn buffer_for(&self, direction: Direction, nth: usize) -> Option<BufferId> {
        self.memory
            .iter()
            .filter(|port| port.direction == direction)
            .nth(nth)
            .map(|port| port.buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_end_accounts_for_stride() {
        assert_eq!(AccessDescriptor::new(4, 3, 2).end(), 11);
        assert_eq!(AccessDescriptor::contiguous(0, 5).end(), 5);
    }

    #[test]
    fn primary_access_only_for_register_moves() {
        let load = Expression::new(ExprId(0), OpKind::Load)
            .with_memory(MemoryPort::read(BufferId(1), AccessDescriptor::contiguous(1, 0)));
        assert_eq!(load.primary_access().map(|p| p.buffer), Some(BufferId(1)));

        let gemm = Expression::new(ExprId(1), OpKind::Gemm { beta: 0.0 })
            .with_memory(MemoryPort::read(BufferId(1), AccessDescriptor::contiguous(1, 0)));
        assert!(gemm.primary_access().is_none());
    }
}
