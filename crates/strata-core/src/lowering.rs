//! Lowering of tokenized subgraphs into loop-explicit programs.
//!
//! Values are either *materialized* (held in a buffer: parameters, GEMM
//! results, elementwise values a GEMM consumes) or computed in registers
//! inside a fused loop. Every elementwise value that must land in a buffer
//! gets one 1-D loop over the element count of its destination:
//!
//! ```text
//! LoopBegin L0 (Elements(dst), increment 1)
//!   Load x   (ptr +1)     BroadcastLoad s (ptr +0)     Scalar 2.0
//!   Binary / Unary / Convert ...
//!   Store dst (ptr +1)
//! LoopEnd L0
//! ```
//!
//! A MatMul becomes a weight repack into a scratch buffer followed by the
//! GEMM over the packed layout. Both are kernel-bearing and get an executor
//! sharing one set of static block parameters.

use std::collections::HashMap;
use std::sync::Arc;

use strata_kernels::{BackendRegistry, ExecutorOptions, ExecutorTable, GemmStaticParams, KernelExecutor};
use strata_lowered::{
    AccessDescriptor, BufferId, BufferKind, ElementType, ExprId, Expression, LoopInfo, LoopPort, LoweredProgram,
    MemoryPort, OpKind, OutputPort, PortConnector, WorkAmount,
};

use crate::error::{Error, Result};
use crate::options::CompileOptions;
use crate::plan::{ShapePlan, ShapeRule};
use crate::subgraph::{NodeOp, Subgraph, ValueId};

/// Everything lowering produces for one subgraph.
#[derive(Debug)]
pub struct Lowered {
    pub program: LoweredProgram,
    pub plan: ShapePlan,
    pub executors: ExecutorTable,
    /// Input buffers in parameter order.
    pub inputs: Vec<BufferId>,
    /// Output buffers in declaration order.
    pub outputs: Vec<(String, BufferId)>,
}

#[tracing::instrument(skip_all, fields(nodes = subgraph.nodes().len(), outputs = subgraph.outputs().len()))]
pub fn lower(subgraph: &Subgraph, options: &CompileOptions, backends: &Arc<BackendRegistry>) -> Result<Lowered> {
    subgraph.validate()?;
    let params = Arc::new(options.gemm_static_params()?);
    let mut lowerer = Lowerer::new(subgraph, Arc::clone(&params));
    lowerer.lower()?;

    let executor_options = options.executor_options();
    let mut executors = ExecutorTable::new();
    for expr in lowerer.kernels.drain(..) {
        executors.register(KernelExecutor::new(
            expr,
            Arc::clone(&params),
            Arc::clone(backends),
            executor_options,
        )?)?;
    }

    tracing::debug!(
        expressions = lowerer.program.len(),
        buffers = lowerer.program.buffers().count(),
        kernels = executors.len(),
        isa = %executor_options.isa,
        "subgraph_lowered"
    );

    Ok(Lowered {
        program: lowerer.program,
        plan: lowerer.plan,
        executors,
        inputs: lowerer.inputs,
        outputs: lowerer.outputs,
    })
}

struct Lowerer<'s> {
    subgraph: &'s Subgraph,
    params: Arc<GemmStaticParams>,
    program: LoweredProgram,
    plan: ShapePlan,
    materialized: HashMap<ValueId, BufferId>,
    kernels: Vec<Expression>,
    inputs: Vec<BufferId>,
    outputs: Vec<(String, BufferId)>,
}

/// Per-loop state while emitting one fused elementwise loop.
struct FusedLoop {
    port: LoopPort,
    emitted: HashMap<ValueId, PortConnector>,
    /// Materialized operands read lane by lane.
    dense: Vec<BufferId>,
}

impl<'s> Lowerer<'s> {
    fn new(subgraph: &'s Subgraph, params: Arc<GemmStaticParams>) -> Self {
        Self {
            subgraph,
            params,
            program: LoweredProgram::new(),
            plan: ShapePlan::new(),
            materialized: HashMap::new(),
            kernels: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    fn lower(&mut self) -> Result<()> {
        let subgraph = self.subgraph;

        for (index, (name, node)) in subgraph.parameters().enumerate() {
            let buffer = self.program.declare_buffer(name, node.element_type, BufferKind::Input);
            self.plan.push(
                buffer,
                name,
                ShapeRule::Input {
                    index,
                    declared: node.shape.clone(),
                },
            );
            self.materialized.insert(node.id, buffer);
            self.inputs.push(buffer);
        }

        // A product named as an output is written straight into the output buffer.
        let mut direct_outputs: HashMap<ValueId, &str> = HashMap::new();
        for (name, value) in subgraph.outputs() {
            if matches!(self.node_op(*value)?, NodeOp::MatMul { .. }) {
                direct_outputs.entry(*value).or_insert(name.as_str());
            }
        }

        for node in subgraph.nodes() {
            if let NodeOp::MatMul { a, b } = node.op {
                let destination = direct_outputs.get(&node.id).copied();
                self.lower_matmul(node.id, a, b, destination)?;
            }
        }

        for (name, value) in subgraph.outputs() {
            if direct_outputs.get(value) == Some(&name.as_str()) {
                let buffer = self.buffer_of(*value)?;
                self.outputs.push((name.clone(), buffer));
                continue;
            }
            let element_type = self.element_type(*value)?;
            let buffer = self.program.declare_buffer(name.as_str(), element_type, BufferKind::Output);
            self.fuse_into(*value, buffer, name)?;
            self.outputs.push((name.clone(), buffer));
        }
        Ok(())
    }

    fn lower_matmul(&mut self, value: ValueId, a: ValueId, b: ValueId, destination: Option<&str>) -> Result<()> {
        let a_buffer = self.materialize(a)?;
        let b_buffer = self.materialize(b)?;

        let packed_name = format!("{value}.packed");
        let packed = self
            .program
            .declare_buffer(packed_name.as_str(), ElementType::F32, BufferKind::Scratch);
        self.plan.push(
            packed,
            packed_name,
            ShapeRule::Packed {
                b: b_buffer,
                params: *self.params,
            },
        );

        let (name, kind) = match destination {
            Some(name) => (name.to_string(), BufferKind::Output),
            None => (value.to_string(), BufferKind::Scratch),
        };
        let c = self.program.declare_buffer(name.as_str(), ElementType::F32, kind);
        self.plan.push(c, name, ShapeRule::MatMul { a: a_buffer, b: b_buffer });

        // Kernels address whole buffers; the descriptor only names the port.
        let whole = AccessDescriptor::contiguous(1, 0);
        let copy_b = Expression::new(
            self.program.new_expr_id(),
            OpKind::GemmCopyB {
                n_block: self.params.n_block,
            },
        )
        .with_memory(MemoryPort::read(b_buffer, whole))
        .with_memory(MemoryPort::write(packed, whole));
        let gemm = Expression::new(self.program.new_expr_id(), OpKind::Gemm { beta: 0.0 })
            .with_memory(MemoryPort::read(a_buffer, whole))
            .with_memory(MemoryPort::read(packed, whole))
            .with_memory(MemoryPort::write(c, whole));

        self.kernels.push(copy_b.clone());
        self.kernels.push(gemm.clone());
        self.program.push(copy_b);
        self.program.push(gemm);
        self.materialized.insert(value, c);
        Ok(())
    }

    /// Buffer holding `value`, emitting a fused loop into scratch if needed.
    fn materialize(&mut self, value: ValueId) -> Result<BufferId> {
        if let Some(buffer) = self.materialized.get(&value) {
            return Ok(*buffer);
        }
        let element_type = self.element_type(value)?;
        let name = value.to_string();
        let buffer = self
            .program
            .declare_buffer(name.as_str(), element_type, BufferKind::Scratch);
        self.fuse_into(value, buffer, &name)?;
        self.materialized.insert(value, buffer);
        Ok(buffer)
    }

    /// Emit one loop computing `value` into `destination`.
    fn fuse_into(&mut self, value: ValueId, destination: BufferId, name: &str) -> Result<()> {
        let loop_id = self.program.declare_loop(LoopInfo {
            work_amount: WorkAmount::Elements(destination),
            increment: 1,
        });
        let begin = self.program.new_expr_id();
        self.program.push(Expression::new(begin, OpKind::LoopBegin { loop_id }));

        let mut fused = FusedLoop {
            port: LoopPort {
                loop_id,
                ptr_increment: 1,
            },
            emitted: HashMap::new(),
            dense: Vec::new(),
        };
        let result = self.emit_value(value, &mut fused)?;
        let store = self.expression(OpKind::Store, &fused, 1, &[result], None)
            .with_memory(MemoryPort::write(destination, AccessDescriptor::contiguous(1, 0)));
        self.program.push(store);

        let end = self.program.new_expr_id();
        self.program.push(Expression::new(end, OpKind::LoopEnd { loop_id }));

        let rule = match fused.dense.split_first() {
            Some((reference, rest)) => ShapeRule::Elementwise {
                reference: *reference,
                agree: rest.to_vec(),
            },
            None => {
                let shape = &self
                    .subgraph
                    .node(value)
                    .ok_or_else(|| Error::InvalidSubgraph(format!("unknown value {value}")))?
                    .shape;
                let dims = shape
                    .static_dims()
                    .ok_or_else(|| Error::shape(name, format!("broadcast-only value has dynamic shape {shape}")))?;
                ShapeRule::Scalar { dims }
            }
        };
        self.plan.push(destination, name, rule);
        Ok(())
    }

    fn emit_value(&mut self, value: ValueId, fused: &mut FusedLoop) -> Result<PortConnector> {
        if let Some(connector) = fused.emitted.get(&value) {
            return Ok(*connector);
        }
        let node = self
            .subgraph
            .node(value)
            .ok_or_else(|| Error::InvalidSubgraph(format!("unknown value {value}")))?;
        let element_type = node.element_type;

        let expr = if let Some(buffer) = self.materialized.get(&value).copied() {
            let port = MemoryPort::read(buffer, AccessDescriptor::contiguous(1, 0));
            if node.shape.is_scalar() {
                self.expression(OpKind::BroadcastLoad, fused, 0, &[], Some(element_type))
                    .with_memory(port)
            } else {
                if !fused.dense.contains(&buffer) {
                    fused.dense.push(buffer);
                }
                self.expression(OpKind::Load, fused, 1, &[], Some(element_type))
                    .with_memory(port)
            }
        } else {
            match node.op.clone() {
                NodeOp::Constant { value } => {
                    self.expression(OpKind::Scalar { value }, fused, 0, &[], Some(element_type))
                }
                NodeOp::Unary { op, input } => {
                    let input = self.emit_value(input, fused)?;
                    self.expression(OpKind::Unary(op), fused, 0, &[input], Some(element_type))
                }
                NodeOp::Binary { op, lhs, rhs } => {
                    let lhs = self.emit_value(lhs, fused)?;
                    let rhs = self.emit_value(rhs, fused)?;
                    self.expression(OpKind::Binary(op), fused, 0, &[lhs, rhs], Some(element_type))
                }
                NodeOp::Convert { to, input } => {
                    let input = self.emit_value(input, fused)?;
                    self.expression(OpKind::Convert { to }, fused, 0, &[input], Some(element_type))
                }
                NodeOp::Parameter { .. } | NodeOp::MatMul { .. } => {
                    return Err(Error::InvalidSubgraph(format!("{value} is used before it is computed")))
                }
            }
        };

        let connector = expr
            .output(0)
            .ok_or_else(|| Error::InvalidSubgraph(format!("{value} produced no output")))?;
        self.program.push(expr);
        fused.emitted.insert(value, connector);
        Ok(connector)
    }

    /// Fresh expression inside the fused loop with an optional result port.
    fn expression(
        &mut self,
        op: OpKind,
        fused: &FusedLoop,
        ptr_increment: usize,
        inputs: &[PortConnector],
        output: Option<ElementType>,
    ) -> Expression {
        let id: ExprId = self.program.new_expr_id();
        let mut expr = Expression::new(id, op).with_loops(vec![LoopPort {
            ptr_increment,
            ..fused.port
        }]);
        for input in inputs {
            expr = expr.with_input(*input);
        }
        if let Some(element_type) = output {
            let tensor = self.program.new_tensor();
            expr = expr.with_output(OutputPort::new(tensor, element_type));
        }
        expr
    }

    fn node_op(&self, value: ValueId) -> Result<&'s NodeOp> {
        self.subgraph
            .node(value)
            .map(|node| &node.op)
            .ok_or_else(|| Error::InvalidSubgraph(format!("unknown value {value}")))
    }

    fn element_type(&self, value: ValueId) -> Result<ElementType> {
        self.subgraph
            .node(value)
            .map(|node| node.element_type)
            .ok_or_else(|| Error::InvalidSubgraph(format!("unknown value {value}")))
    }

    fn buffer_of(&self, value: ValueId) -> Result<BufferId> {
        self.materialized
            .get(&value)
            .copied()
            .ok_or_else(|| Error::InvalidSubgraph(format!("{value} was never materialized")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subgraph::{Dim, PartialShape};
    use strata_lowered::{BinaryOp, UnaryOp};

    fn lower_reference(subgraph: &Subgraph) -> Lowered {
        lower(
            subgraph,
            &CompileOptions::reference(),
            &Arc::new(BackendRegistry::default()),
        )
        .unwrap()
    }

    fn ops(program: &LoweredProgram) -> Vec<&'static str> {
        program.iter().map(|expr| expr.op.name()).collect()
    }

    #[test]
    fn elementwise_chain_fuses_into_one_loop() {
        let mut builder = Subgraph::builder();
        let x = builder.parameter("x", ElementType::F32, PartialShape::dynamic(2));
        let bias = builder.parameter("bias", ElementType::F32, PartialShape::scalar());
        let sum = builder.binary(BinaryOp::Add, x, bias).unwrap();
        let y = builder.unary(UnaryOp::Relu, sum).unwrap();
        builder.output("y", y).unwrap();
        let lowered = lower_reference(&builder.build().unwrap());

        assert_eq!(
            ops(&lowered.program),
            ["LoopBegin", "Load", "BroadcastLoad", "Binary", "Unary", "Store", "LoopEnd"]
        );
        lowered.program.validate().unwrap();
        assert!(lowered.executors.is_empty());

        let broadcast = &lowered.program.expressions()[2];
        assert_eq!(broadcast.loops[0].ptr_increment, 0);
        let y_buffer = lowered.outputs[0].1;
        assert_eq!(
            lowered.plan.entries().last().map(|entry| &entry.rule),
            Some(&ShapeRule::Elementwise {
                reference: lowered.inputs[0],
                agree: Vec::new(),
            })
        );
        assert_eq!(lowered.program.buffer(y_buffer).map(|b| b.kind), Some(BufferKind::Output));
    }

    #[test]
    fn shared_operand_is_loaded_once() {
        let mut builder = Subgraph::builder();
        let x = builder.parameter("x", ElementType::F32, PartialShape::dynamic(1));
        let square = builder.binary(BinaryOp::Mul, x, x).unwrap();
        builder.output("square", square).unwrap();
        let lowered = lower_reference(&builder.build().unwrap());
        assert_eq!(ops(&lowered.program), ["LoopBegin", "Load", "Binary", "Store", "LoopEnd"]);
    }

    #[test]
    fn matmul_lowers_to_repack_and_gemm() {
        let mut builder = Subgraph::builder();
        let a = builder.parameter("a", ElementType::F32, PartialShape::new(vec![Dim::Dynamic, Dim::Static(4)]));
        let w = builder.parameter("w", ElementType::F32, PartialShape::fixed(&[4, 8]));
        let relu_a = builder.unary(UnaryOp::Relu, a).unwrap();
        let y = builder.matmul(relu_a, w).unwrap();
        builder.output("y", y).unwrap();
        let lowered = lower_reference(&builder.build().unwrap());

        assert_eq!(
            ops(&lowered.program),
            ["LoopBegin", "Load", "Unary", "Store", "LoopEnd", "GemmCopyB", "Gemm"]
        );
        assert_eq!(lowered.executors.len(), 2);
        for (id, executor) in lowered.executors.iter() {
            assert_eq!(lowered.program.get(id), Some(executor.expression()));
        }

        let kinds: Vec<BufferKind> = lowered.program.buffers().map(|decl| decl.kind).collect();
        assert_eq!(
            kinds,
            [
                BufferKind::Input,
                BufferKind::Input,
                BufferKind::Scratch,
                BufferKind::Scratch,
                BufferKind::Output
            ]
        );
        assert_eq!(lowered.outputs, vec![("y".to_string(), BufferId(4))]);
    }

    #[test]
    fn product_used_twice_gets_a_copy_for_the_second_output() {
        let mut builder = Subgraph::builder();
        let a = builder.parameter("a", ElementType::F32, PartialShape::dynamic(2));
        let b = builder.parameter("b", ElementType::F32, PartialShape::dynamic(2));
        let y = builder.matmul(a, b).unwrap();
        builder.output("y", y).unwrap();
        builder.output("y_again", y).unwrap();
        let lowered = lower_reference(&builder.build().unwrap());

        assert_eq!(
            ops(&lowered.program),
            ["GemmCopyB", "Gemm", "LoopBegin", "Load", "Store", "LoopEnd"]
        );
        assert_eq!(lowered.outputs.len(), 2);
        assert_ne!(lowered.outputs[0].1, lowered.outputs[1].1);
    }

    #[test]
    fn rejects_zero_block_options() {
        let mut builder = Subgraph::builder();
        let x = builder.parameter("x", ElementType::F32, PartialShape::dynamic(1));
        builder.output("x", x).unwrap();
        let options = CompileOptions {
            gemm_n_block: 0,
            ..CompileOptions::reference()
        };
        let err = lower(
            &builder.build().unwrap(),
            &options,
            &Arc::new(BackendRegistry::default()),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Kernel(_)));
    }
}
