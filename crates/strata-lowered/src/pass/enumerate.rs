use crate::error::Result;
use crate::pass::{Pass, PassResult};
use crate::program::LoweredProgram;

/// Tags every expression with its position as a monotonic topological order.
#[derive(Debug, Default, Clone, Copy)]
pub struct EnumerateExpressionsPass;

impl EnumerateExpressionsPass {
    const NAME: &'static str = "enumerate_expressions";
}

impl Pass for EnumerateExpressionsPass {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn run(&self, program: &mut LoweredProgram) -> Result<PassResult> {
        Ok(PassResult::from_counts(program.set_topological_order(), 0))
    }
}
