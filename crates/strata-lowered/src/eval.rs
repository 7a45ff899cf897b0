//! Reference interpreter for lowered programs.
//!
//! Runs a program directly over host buffers. It is the semantic oracle for
//! passes (a rewrite must not change what this computes) and the execution
//! engine for everything outside kernel-bearing expressions, which are handed
//! to a [`KernelDispatch`].
//!
//! Registers are lane vectors keyed by `(expression, output port)`. Inside a
//! loop, a memory port at lane `l` touches
//! `offset + l * stride + sum(iteration_k * ptr_increment_k)`.

use crate::error::{LoweredError, Result};
use crate::expression::Expression;
use crate::ids::{BufferId, ExprId, LoopId};
use crate::op::{LoopEdge, LoopMarker, OpKind};
use crate::program::LoweredProgram;
use crate::shape::{trip_count, ShapeContext};
use std::collections::{BTreeMap, HashMap};
use std::ops::Range;

/// Dense row-major host tensor.
#[derive(Debug, Clone, PartialEq)]
pub struct HostTensor {
    pub dims: Vec<usize>,
    pub data: Vec<f32>,
}

impl HostTensor {
    pub fn new(dims: Vec<usize>, data: Vec<f32>) -> Self {
        Self { dims, data }
    }

    pub fn zeros(dims: Vec<usize>) -> Self {
        let len = dims.iter().product();
        Self {
            dims,
            data: vec![0.0; len],
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Buffers bound for one execution.
#[derive(Debug, Clone, Default)]
pub struct Memory {
    tensors: BTreeMap<BufferId, HostTensor>,
}

impl Memory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&mut self, buffer: BufferId, tensor: HostTensor) {
        self.tensors.insert(buffer, tensor);
    }

    pub fn get(&self, buffer: BufferId) -> Option<&HostTensor> {
        self.tensors.get(&buffer)
    }

    pub fn get_mut(&mut self, buffer: BufferId) -> Option<&mut HostTensor> {
        self.tensors.get_mut(&buffer)
    }

    /// Detach a buffer so it can be written while others are read.
    pub fn take(&mut self, buffer: BufferId) -> Result<HostTensor> {
        self.tensors.remove(&buffer).ok_or(LoweredError::MissingBuffer(buffer))
    }

    pub fn data(&self, buffer: BufferId) -> Result<&[f32]> {
        self.get(buffer)
            .map(|tensor| tensor.data.as_slice())
            .ok_or(LoweredError::MissingBuffer(buffer))
    }

    pub fn into_tensors(self) -> BTreeMap<BufferId, HostTensor> {
        self.tensors
    }
}

impl ShapeContext for Memory {
    fn dims(&self, buffer: BufferId) -> Option<&[usize]> {
        self.get(buffer).map(|tensor| tensor.dims.as_slice())
    }
}

/// Executes kernel-bearing expressions on behalf of the interpreter.
pub trait KernelDispatch {
    type Error: From<LoweredError>;

    fn dispatch(&self, expr: &Expression, memory: &mut Memory) -> std::result::Result<(), Self::Error>;
}

/// Dispatcher for programs without kernel-bearing expressions.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoKernels;

impl KernelDispatch for NoKernels {
    type Error = LoweredError;

    fn dispatch(&self, expr: &Expression, _memory: &mut Memory) -> Result<()> {
        Err(LoweredError::unsupported(expr.id, expr.op.name()))
    }
}

/// Interpret `program` over `memory` with no kernel support.
pub fn evaluate(program: &LoweredProgram, memory: &mut Memory) -> Result<()> {
    Interpreter::new(program)?.run(memory, &NoKernels)
}

pub struct Interpreter<'p> {
    program: &'p LoweredProgram,
    loop_ends: HashMap<usize, usize>,
}

#[derive(Default)]
struct Frame {
    iterations: Vec<(LoopId, usize)>,
    registers: HashMap<(ExprId, usize), Vec<f32>>,
}

impl Frame {
    fn iteration(&self, loop_id: LoopId) -> usize {
        self.iterations
            .iter()
            .rev()
            .find(|(id, _)| *id == loop_id)
            .map(|(_, iter)| *iter)
            .unwrap_or(0)
    }
}

impl<'p> Interpreter<'p> {
    pub fn new(program: &'p LoweredProgram) -> Result<Self> {
        program.validate()?;
        let loop_ends = program
            .loop_regions()?
            .into_iter()
            .map(|region| (region.begin, region.end))
            .collect();
        Ok(Self { program, loop_ends })
    }

    pub fn run<D: KernelDispatch>(&self, memory: &mut Memory, kernels: &D) -> std::result::Result<(), D::Error> {
        let mut frame = Frame::default();
        self.run_range(0..self.program.len(), &mut frame, memory, kernels)
    }

    fn run_range<D: KernelDispatch>(
        &self,
        range: Range<usize>,
        frame: &mut Frame,
        memory: &mut Memory,
        kernels: &D,
    ) -> std::result::Result<(), D::Error> {
        let mut position = range.start;
        while position < range.end {
            let expr = &self.program.expressions()[position];
            match expr.op.loop_marker() {
                Some((loop_id, LoopEdge::Begin)) => {
                    let end = *self
                        .loop_ends
                        .get(&position)
                        .ok_or(LoweredError::UnknownLoop(loop_id))?;
                    let info = self.program.loop_info(loop_id).ok_or(LoweredError::UnknownLoop(loop_id))?;
                    let trips = trip_count(info, &*memory)?;
                    for iteration in 0..trips {
                        frame.iterations.push((loop_id, iteration));
                        let outcome = self.run_range(position + 1..end, frame, memory, kernels);
                        frame.iterations.pop();
                        outcome?;
                    }
                    position = end + 1;
                }
                Some((_, LoopEdge::End)) => {
                    return Err(LoweredError::malformed(expr.id, "loop end reached outside its region").into());
                }
                None if expr.op.is_kernel() => {
                    kernels.dispatch(expr, memory)?;
                    position += 1;
                }
                None => {
                    eval_expression(expr, frame, memory)?;
                    position += 1;
                }
            }
        }
        Ok(())
    }
}

fn base_offset(expr: &Expression, offset: usize, frame: &Frame) -> usize {
    expr.loops.iter().fold(offset, |acc, port| {
        acc + frame.iteration(port.loop_id) * port.ptr_increment
    })
}

fn read_register<'f>(expr: &Expression, input: usize, frame: &'f Frame) -> Result<&'f [f32]> {
    let connector = expr
        .inputs
        .get(input)
        .ok_or_else(|| LoweredError::malformed(expr.id, format!("missing input {input}")))?;
    frame
        .registers
        .get(&(connector.producer, connector.port))
        .map(Vec::as_slice)
        .ok_or_else(|| {
            LoweredError::malformed(
                expr.id,
                format!("input {}:{} has not been computed", connector.producer, connector.port),
            )
        })
}

fn eval_expression(expr: &Expression, frame: &mut Frame, memory: &mut Memory) -> Result<()> {
    let values = match &expr.op {
        OpKind::Load | OpKind::BroadcastLoad => {
            let port = expr
                .memory
                .first()
                .ok_or_else(|| LoweredError::malformed(expr.id, "load without memory port"))?;
            let data = memory.data(port.buffer)?;
            let base = base_offset(expr, port.access.offset, frame);
            let fetch = |index: usize| {
                data.get(index).copied().ok_or(LoweredError::OutOfBounds {
                    buffer: port.buffer,
                    index,
                    len: data.len(),
                })
            };
            let lanes: Vec<f32> = if matches!(expr.op, OpKind::BroadcastLoad) {
                vec![fetch(base)?; port.access.count.max(1)]
            } else {
                (0..port.access.count)
                    .map(|lane| fetch(base + lane * port.access.stride))
                    .collect::<Result<_>>()?
            };

            for (index, out) in expr.outputs.iter().enumerate() {
                let value = match &out.lanes {
                    Some(range) => lanes
                        .get(range.clone())
                        .ok_or_else(|| LoweredError::malformed(expr.id, format!("lane range {range:?} out of bounds")))?
                        .to_vec(),
                    None => lanes.clone(),
                };
                frame.registers.insert((expr.id, index), value);
            }
            return Ok(());
        }
        OpKind::Store => {
            let port = expr
                .memory
                .first()
                .ok_or_else(|| LoweredError::malformed(expr.id, "store without memory port"))?;
            let mut lanes = Vec::with_capacity(port.access.count);
            for input in 0..expr.inputs.len() {
                lanes.extend_from_slice(read_register(expr, input, frame)?);
            }
            if lanes.len() == 1 && port.access.count > 1 {
                lanes = vec![lanes[0]; port.access.count];
            }
            if lanes.len() != port.access.count {
                return Err(LoweredError::malformed(
                    expr.id,
                    format!("store of {} lanes through an access of count {}", lanes.len(), port.access.count),
                ));
            }
            let base = base_offset(expr, port.access.offset, frame);
            let tensor = memory.get_mut(port.buffer).ok_or(LoweredError::MissingBuffer(port.buffer))?;
            let len = tensor.data.len();
            for (lane, value) in lanes.into_iter().enumerate() {
                let index = base + lane * port.access.stride;
                let slot = tensor.data.get_mut(index).ok_or(LoweredError::OutOfBounds {
                    buffer: port.buffer,
                    index,
                    len,
                })?;
                *slot = value;
            }
            return Ok(());
        }
        OpKind::Scalar { value } => vec![*value],
        OpKind::Unary(op) => read_register(expr, 0, frame)?.iter().map(|x| op.apply(*x)).collect(),
        OpKind::Binary(op) => {
            let lhs = read_register(expr, 0, frame)?;
            let rhs = read_register(expr, 1, frame)?;
            match (lhs.len(), rhs.len()) {
                (a, b) if a == b => lhs.iter().zip(rhs).map(|(x, y)| op.apply(*x, *y)).collect(),
                (1, _) => rhs.iter().map(|y| op.apply(lhs[0], *y)).collect(),
                (_, 1) => lhs.iter().map(|x| op.apply(*x, rhs[0])).collect(),
                (a, b) => {
                    return Err(LoweredError::malformed(
                        expr.id,
                        format!("binary operands have {a} and {b} lanes"),
                    ))
                }
            }
        }
        OpKind::ConvertTruncation { to } => read_register(expr, 0, frame)?.iter().map(|x| to.truncate(*x)).collect(),
        OpKind::ConvertSaturation { to } => read_register(expr, 0, frame)?.iter().map(|x| to.saturate(*x)).collect(),
        OpKind::Convert { .. } => return Err(LoweredError::unsupported(expr.id, "unspecialized Convert")),
        OpKind::LoopBegin { .. } | OpKind::LoopEnd { .. } | OpKind::Gemm { .. } | OpKind::GemmCopyB { .. } => {
            return Err(LoweredError::unsupported(expr.id, expr.op.name()))
        }
    };
    frame.registers.insert((expr.id, 0), values);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::ElementType;
    use crate::expression::{AccessDescriptor, LoopPort, MemoryPort, OutputPort};
    use crate::op::BinaryOp;
    use crate::program::{BufferKind, LoopInfo, WorkAmount};

    /// `dst[i] = src[i] + 1.5` over a dynamic loop.
    fn add_scalar_program() -> (LoweredProgram, BufferId, BufferId) {
        let mut program = LoweredProgram::new();
        let src = program.declare_buffer("src", ElementType::F32, BufferKind::Input);
        let dst = program.declare_buffer("dst", ElementType::F32, BufferKind::Output);

        let scalar_id = program.new_expr_id();
        let scalar_tensor = program.new_tensor();
        program.push(
            Expression::new(scalar_id, OpKind::Scalar { value: 1.5 })
                .with_output(OutputPort::new(scalar_tensor, ElementType::F32)),
        );

        let loop_id = program.declare_loop(LoopInfo {
            work_amount: WorkAmount::Elements(src),
            increment: 2,
        });
        let loops = vec![LoopPort {
            loop_id,
            ptr_increment: 2,
        }];
        let begin = program.new_expr_id();
        program.push(Expression::new(begin, OpKind::LoopBegin { loop_id }));

        let load = program.new_expr_id();
        let t0 = program.new_tensor();
        program.push(
            Expression::new(load, OpKind::Load)
                .with_memory(MemoryPort::read(src, AccessDescriptor::contiguous(2, 0)))
                .with_output(OutputPort::new(t0, ElementType::F32))
                .with_loops(loops.clone()),
        );
        let add = program.new_expr_id();
        let t1 = program.new_tensor();
        let lhs = program.get(load).and_then(|e| e.output(0)).unwrap();
        let rhs = program.get(scalar_id).and_then(|e| e.output(0)).unwrap();
        program.push(
            Expression::new(add, OpKind::Binary(BinaryOp::Add))
                .with_input(lhs)
                .with_input(rhs)
                .with_output(OutputPort::new(t1, ElementType::F32))
                .with_loops(loops.clone()),
        );
        let store = program.new_expr_id();
        let value = program.get(add).and_then(|e| e.output(0)).unwrap();
        program.push(
            Expression::new(store, OpKind::Store)
                .with_memory(MemoryPort::write(dst, AccessDescriptor::contiguous(2, 0)))
                .with_input(value)
                .with_loops(loops),
        );
        let end = program.new_expr_id();
        program.push(Expression::new(end, OpKind::LoopEnd { loop_id }));
        (program, src, dst)
    }

    #[test]
    fn evaluates_dynamic_loop() {
        let (program, src, dst) = add_scalar_program();
        let mut memory = Memory::new();
        memory.bind(src, HostTensor::new(vec![2, 3], vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0]));
        memory.bind(dst, HostTensor::zeros(vec![2, 3]));

        evaluate(&program, &mut memory).unwrap();
        assert_eq!(memory.data(dst).unwrap(), &[1.5, 2.5, 3.5, 4.5, 5.5, 6.5]);
    }

    #[test]
    fn zero_sized_input_runs_no_iterations() {
        let (program, src, dst) = add_scalar_program();
        let mut memory = Memory::new();
        memory.bind(src, HostTensor::zeros(vec![0, 3]));
        memory.bind(dst, HostTensor::zeros(vec![0, 3]));
        evaluate(&program, &mut memory).unwrap();
        assert!(memory.data(dst).unwrap().is_empty());
    }

    #[test]
    fn out_of_bounds_access_is_reported() {
        let (program, src, dst) = add_scalar_program();
        let mut memory = Memory::new();
        memory.bind(src, HostTensor::new(vec![4], vec![1.0; 4]));
        memory.bind(dst, HostTensor::zeros(vec![2]));
        assert!(matches!(
            evaluate(&program, &mut memory),
            Err(LoweredError::OutOfBounds { buffer, .. }) if buffer == dst
        ));
    }
}
