//! Expression → executor mapping for one compiled subgraph.
//!
//! Filled during lowering, read-only afterwards: inference only needs `&self`,
//! so a shared table needs no lock of its own.

use std::collections::HashMap;
use std::sync::Arc;

use strata_lowered::{ExprId, Expression, KernelDispatch, LoweredError, Memory};

use crate::error::{KernelError, Result};
use crate::executor::{ExecutorStats, KernelExecutor};

#[derive(Debug, Default)]
pub struct ExecutorTable {
    executors: HashMap<ExprId, Arc<KernelExecutor>>,
}

impl ExecutorTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the executor of one expression. A second executor for the
    /// same expression is an IR error.
    pub fn register(&mut self, executor: KernelExecutor) -> Result<Arc<KernelExecutor>> {
        let id = executor.expr_id();
        if self.executors.contains_key(&id) {
            return Err(LoweredError::DuplicateExpression(id).into());
        }
        let executor = Arc::new(executor);
        self.executors.insert(id, Arc::clone(&executor));
        Ok(executor)
    }

    pub fn get(&self, id: ExprId) -> Option<&Arc<KernelExecutor>> {
        self.executors.get(&id)
    }

    pub fn len(&self) -> usize {
        self.executors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ExprId, &Arc<KernelExecutor>)> {
        self.executors.iter().map(|(id, executor)| (*id, executor))
    }

    /// Build statistics of every executor, ordered by expression id.
    pub fn stats(&self) -> Vec<(ExprId, ExecutorStats)> {
        let mut stats: Vec<_> = self.iter().map(|(id, executor)| (id, executor.stats())).collect();
        stats.sort_by_key(|(id, _)| *id);
        stats
    }
}

impl KernelDispatch for ExecutorTable {
    type Error = KernelError;

    fn dispatch(&self, expr: &Expression, memory: &mut Memory) -> Result<()> {
        self.get(expr.id)
            .ok_or(KernelError::MissingExecutor(expr.id))?
            .invoke(memory)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendRegistry;
    use crate::config::GemmStaticParams;
    use crate::executor::ExecutorOptions;
    use strata_lowered::{AccessDescriptor, BufferId, MemoryPort, OpKind};

    fn executor(id: u32) -> KernelExecutor {
        let expr = Expression::new(ExprId(id), OpKind::GemmCopyB { n_block: 4 })
            .with_memory(MemoryPort::read(BufferId(0), AccessDescriptor::contiguous(1, 0)))
            .with_memory(MemoryPort::write(BufferId(1), AccessDescriptor::contiguous(1, 0)));
        KernelExecutor::new(
            expr,
            Arc::new(GemmStaticParams::new(4, 1).unwrap()),
            Arc::new(BackendRegistry::default()),
            ExecutorOptions::default(),
        )
        .unwrap()
    }

    #[test]
    fn duplicate_registration_is_an_ir_error() {
        let mut table = ExecutorTable::new();
        table.register(executor(3)).unwrap();
        let err = table.register(executor(3)).unwrap_err();
        assert!(matches!(err, KernelError::Lowered(LoweredError::DuplicateExpression(id)) if id == ExprId(3)));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn dispatch_without_executor_fails() {
        let table = ExecutorTable::new();
        let expr = Expression::new(ExprId(9), OpKind::Gemm { beta: 0.0 });
        let err = table.dispatch(&expr, &mut Memory::new()).unwrap_err();
        assert!(matches!(err, KernelError::MissingExecutor(id) if id == ExprId(9)));
    }
}
