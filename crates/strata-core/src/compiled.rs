//! Compiled subgraphs: lowering, passes and the inference entry point.
//!
//! Compilation happens once per subgraph and is single-threaded. The result
//! is immutable apart from the per-executor kernel caches, so one
//! [`CompiledSubgraph`] can serve concurrent [`CompiledSubgraph::run`] calls.

use std::sync::Arc;

use strata_kernels::{BackendRegistry, ExecutorTable, Isa, KernelError};
use strata_lowered::{
    standard_pipeline, BufferId, BufferKind, HostTensor, Interpreter, LoweredError, LoweredProgram, Memory, PassResult,
};

use crate::error::{Error, Result};
use crate::lowering::{lower, Lowered};
use crate::options::CompileOptions;
use crate::plan::ShapePlan;
use crate::subgraph::Subgraph;

#[derive(Debug)]
pub struct CompiledSubgraph {
    program: LoweredProgram,
    plan: ShapePlan,
    executors: ExecutorTable,
    inputs: Vec<(String, BufferId)>,
    outputs: Vec<(String, BufferId)>,
    passes: PassResult,
    isa: Isa,
}

impl CompiledSubgraph {
    /// Compile against the built-in backends.
    pub fn compile(subgraph: &Subgraph, options: &CompileOptions) -> Result<Self> {
        Self::compile_with_backends(subgraph, options, Arc::new(BackendRegistry::default()))
    }

    #[tracing::instrument(skip_all, fields(nodes = subgraph.nodes().len()))]
    pub fn compile_with_backends(
        subgraph: &Subgraph,
        options: &CompileOptions,
        backends: Arc<BackendRegistry>,
    ) -> Result<Self> {
        options.validate()?;
        let Lowered {
            mut program,
            plan,
            executors,
            inputs,
            outputs,
        } = lower(subgraph, options, &backends)?;

        let pipeline = standard_pipeline(options.pipeline_max_iters, options.memory_access);
        let (passes, duration_us) = strata_tracing::timed_block!("pipeline", { pipeline.run(&mut program) });
        let passes = passes?;

        // Passes never add kernel-bearing expressions, but an executor must exist for each one left.
        if let Some(orphan) = program
            .iter()
            .find(|expr| expr.op.is_kernel() && executors.get(expr.id).is_none())
        {
            return Err(KernelError::MissingExecutor(orphan.id).into());
        }

        let inputs = subgraph
            .parameters()
            .map(|(name, _)| name.to_string())
            .zip(inputs)
            .collect();
        let isa = options.executor_options().isa;
        tracing::debug!(
            modified = passes.changed,
            rewrites = passes.rewrites_applied,
            erased = passes.erased,
            expressions = program.len(),
            kernels = executors.len(),
            isa = %isa,
            duration_us,
            "subgraph_compiled"
        );

        Ok(Self {
            program,
            plan,
            executors,
            inputs,
            outputs,
            passes,
            isa,
        })
    }

    /// Whether any pass changed the lowered program.
    pub fn modified(&self) -> bool {
        self.passes.changed
    }

    pub fn pass_result(&self) -> PassResult {
        self.passes
    }

    pub fn program(&self) -> &LoweredProgram {
        &self.program
    }

    pub fn shape_plan(&self) -> &ShapePlan {
        &self.plan
    }

    pub fn executors(&self) -> &ExecutorTable {
        &self.executors
    }

    pub fn isa(&self) -> Isa {
        self.isa
    }

    pub fn input_names(&self) -> impl Iterator<Item = &str> {
        self.inputs.iter().map(|(name, _)| name.as_str())
    }

    pub fn output_names(&self) -> impl Iterator<Item = &str> {
        self.outputs.iter().map(|(name, _)| name.as_str())
    }

    /// Run one inference. Inputs are positional in parameter order; outputs
    /// come back in declaration order.
    #[tracing::instrument(level = "debug", skip_all, fields(inputs = inputs.len()))]
    pub fn run(&self, inputs: &[HostTensor]) -> Result<Vec<(String, HostTensor)>> {
        let dims: Vec<&[usize]> = inputs.iter().map(|tensor| tensor.dims.as_slice()).collect();
        let shapes = self.plan.resolve(&dims)?;

        let mut memory = Memory::new();
        for ((name, buffer), tensor) in self.inputs.iter().zip(inputs) {
            let expected: usize = tensor.dims.iter().product();
            if tensor.len() != expected {
                return Err(Error::BufferSizeMismatch {
                    name: name.clone(),
                    expected,
                    actual: tensor.len(),
                });
            }
            memory.bind(*buffer, tensor.clone());
        }
        for decl in self.program.buffers().filter(|decl| decl.kind != BufferKind::Input) {
            let dims = shapes
                .get(&decl.id)
                .cloned()
                .ok_or_else(|| Error::shape(decl.name.as_str(), "no planned shape"))?;
            memory.bind(decl.id, HostTensor::zeros(dims));
        }

        let (outcome, duration_us) = strata_tracing::timed_block!("subgraph_run", {
            Interpreter::new(&self.program)
                .map_err(Error::from)
                .and_then(|interpreter| interpreter.run(&mut memory, &self.executors).map_err(Error::from))
        });
        outcome?;

        let mut tensors = memory.into_tensors();
        let outputs = self
            .outputs
            .iter()
            .map(|(name, buffer)| {
                tensors
                    .remove(buffer)
                    .map(|tensor| (name.clone(), tensor))
                    .ok_or(Error::Lowered(LoweredError::MissingBuffer(*buffer)))
            })
            .collect::<Result<Vec<_>>>()?;

        let elements = outputs.iter().map(|(_, tensor)| tensor.len()).sum();
        strata_tracing::performance::record_throughput("subgraph_run", elements, duration_us);
        Ok(outputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subgraph::PartialShape;
    use strata_lowered::{ElementType, UnaryOp};

    fn relu_subgraph() -> Subgraph {
        let mut builder = Subgraph::builder();
        let x = builder.parameter("x", ElementType::F32, PartialShape::dynamic(1));
        let y = builder.unary(UnaryOp::Relu, x).unwrap();
        builder.output("y", y).unwrap();
        builder.build().unwrap()
    }

    #[test]
    fn compiled_subgraph_is_shareable() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<CompiledSubgraph>();
    }

    #[test]
    fn enumeration_marks_program_modified() {
        let compiled = CompiledSubgraph::compile(&relu_subgraph(), &CompileOptions::reference()).unwrap();
        assert!(compiled.modified());
        assert!(compiled.program().iter().all(|expr| expr.topo_order.is_some()));
        assert_eq!(compiled.input_names().collect::<Vec<_>>(), ["x"]);
        assert_eq!(compiled.output_names().collect::<Vec<_>>(), ["y"]);
    }

    #[test]
    fn data_length_must_match_dims() {
        let compiled = CompiledSubgraph::compile(&relu_subgraph(), &CompileOptions::reference()).unwrap();
        let err = compiled
            .run(&[HostTensor::new(vec![3], vec![1.0, 2.0])])
            .unwrap_err();
        assert!(matches!(err, Error::BufferSizeMismatch { expected: 3, actual: 2, .. }));
    }

    #[test]
    fn empty_input_yields_empty_output() {
        let compiled = CompiledSubgraph::compile(&relu_subgraph(), &CompileOptions::reference()).unwrap();
        let outputs = compiled.run(&[HostTensor::new(vec![0], Vec::new())]).unwrap();
        assert_eq!(outputs[0].1, HostTensor::new(vec![0], Vec::new()));
    }
}
