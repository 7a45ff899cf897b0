#![allow(dead_code)]

use strata_lowered::{
    AccessDescriptor, BufferId, BufferKind, ElementType, ExprId, Expression, HostTensor, LoopId, LoopInfo, LoopPort,
    LoweredProgram, Memory, MemoryPort, OpKind, OutputPort, PortConnector, UnaryOp, WorkAmount,
};

/// Small builder that keeps loop membership in sync with open loops.
pub struct Builder {
    pub program: LoweredProgram,
    stack: Vec<LoopPort>,
}

impl Builder {
    pub fn new() -> Self {
        Self {
            program: LoweredProgram::new(),
            stack: Vec::new(),
        }
    }

    pub fn buffer(&mut self, name: &str, kind: BufferKind) -> BufferId {
        self.program.declare_buffer(name, ElementType::F32, kind)
    }

    pub fn open_loop(&mut self, work_amount: WorkAmount, increment: usize, ptr_increment: usize) -> LoopId {
        let loop_id = self.program.declare_loop(LoopInfo {
            work_amount,
            increment,
        });
        let id = self.program.new_expr_id();
        self.program.push(Expression::new(id, OpKind::LoopBegin { loop_id }));
        self.stack.push(LoopPort {
            loop_id,
            ptr_increment,
        });
        loop_id
    }

    pub fn close_loop(&mut self) {
        let port = self.stack.pop().expect("no open loop");
        let id = self.program.new_expr_id();
        self.program.push(Expression::new(id, OpKind::LoopEnd { loop_id: port.loop_id }));
    }

    fn emit(&mut self, op: OpKind, inputs: &[PortConnector], memory: Option<MemoryPort>, output: bool) -> ExprId {
        self.emit_typed(op, inputs, memory, output.then_some(ElementType::F32))
    }

    fn emit_typed(
        &mut self,
        op: OpKind,
        inputs: &[PortConnector],
        memory: Option<MemoryPort>,
        output: Option<ElementType>,
    ) -> ExprId {
        let id = self.program.new_expr_id();
        let mut expr = Expression::new(id, op).with_loops(self.stack.clone());
        for input in inputs {
            expr = expr.with_input(*input);
        }
        if let Some(port) = memory {
            expr = expr.with_memory(port);
        }
        if let Some(element_type) = output {
            let tensor = self.program.new_tensor();
            expr = expr.with_output(OutputPort::new(tensor, element_type));
        }
        self.program.push(expr)
    }

    pub fn output_of(&self, id: ExprId) -> PortConnector {
        self.program.get(id).and_then(|e| e.output(0)).expect("expression has an output")
    }

    pub fn load(&mut self, buffer: BufferId, access: AccessDescriptor) -> PortConnector {
        let id = self.emit(OpKind::Load, &[], Some(MemoryPort::read(buffer, access)), true);
        self.output_of(id)
    }

    pub fn broadcast_load(&mut self, buffer: BufferId, access: AccessDescriptor) -> PortConnector {
        let id = self.emit(OpKind::BroadcastLoad, &[], Some(MemoryPort::read(buffer, access)), true);
        self.output_of(id)
    }

    pub fn unary(&mut self, op: UnaryOp, input: PortConnector) -> PortConnector {
        let id = self.emit(OpKind::Unary(op), &[input], None, true);
        self.output_of(id)
    }

    /// Conversion-like op whose output has type `to`.
    pub fn convert(&mut self, op: OpKind, to: ElementType, input: PortConnector) -> PortConnector {
        let id = self.emit_typed(op, &[input], None, Some(to));
        self.output_of(id)
    }

    pub fn store(&mut self, buffer: BufferId, access: AccessDescriptor, input: PortConnector) -> ExprId {
        self.emit(OpKind::Store, &[input], Some(MemoryPort::write(buffer, access)), false)
    }

    pub fn finish(self) -> LoweredProgram {
        assert!(self.stack.is_empty(), "unclosed loops");
        self.program
    }
}

pub fn ramp(len: usize) -> Vec<f32> {
    (0..len).map(|i| i as f32 * 0.75 - 3.0).collect()
}

pub fn memory_with(bindings: &[(BufferId, Vec<f32>)]) -> Memory {
    let mut memory = Memory::new();
    for (buffer, data) in bindings {
        memory.bind(*buffer, HostTensor::new(vec![data.len()], data.clone()));
    }
    memory
}
