#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use strata_kernels::{
    Backend, BackendRegistry, CompiledKernel, Emitter, ExecutorOptions, GemmStaticParams, Isa, KernelConfig,
    KernelError, KernelExecutor, ReferenceBackend, Result,
};
use strata_lowered::{AccessDescriptor, BufferId, ExprId, Expression, HostTensor, Memory, MemoryPort, OpKind};

pub const A: BufferId = BufferId(0);
pub const B: BufferId = BufferId(1);
pub const PACKED: BufferId = BufferId(2);
pub const C: BufferId = BufferId(3);

fn port() -> AccessDescriptor {
    AccessDescriptor::contiguous(1, 0)
}

pub fn copy_b_expr(n_block: usize) -> Expression {
    Expression::new(ExprId(0), OpKind::GemmCopyB { n_block })
        .with_memory(MemoryPort::read(B, port()))
        .with_memory(MemoryPort::write(PACKED, port()))
}

pub fn gemm_expr(beta: f32) -> Expression {
    Expression::new(ExprId(1), OpKind::Gemm { beta })
        .with_memory(MemoryPort::read(A, port()))
        .with_memory(MemoryPort::read(PACKED, port()))
        .with_memory(MemoryPort::write(C, port()))
}

pub fn value(i: usize) -> f32 {
    ((i * 7) % 13) as f32 * 0.25 - 1.5
}

pub fn matmul_memory(m: usize, n: usize, k: usize, params: &GemmStaticParams) -> Memory {
    let mut memory = Memory::new();
    memory.bind(A, HostTensor::new(vec![m, k], (0..m * k).map(value).collect()));
    memory.bind(B, HostTensor::new(vec![k, n], (0..k * n).map(|i| value(i + 3)).collect()));
    memory.bind(PACKED, HostTensor::zeros(vec![params.packed_len(n, k)]));
    memory.bind(C, HostTensor::zeros(vec![m, n]));
    memory
}

pub fn naive_matmul(a: &[f32], b: &[f32], m: usize, n: usize, k: usize) -> Vec<f32> {
    let mut c = vec![0.0f32; m * n];
    for i in 0..m {
        for j in 0..n {
            let mut acc = 0.0f32;
            for kk in 0..k {
                acc += a[i * k + kk] * b[kk * n + j];
            }
            c[i * n + j] = acc;
        }
    }
    c
}

pub fn bits(values: &[f32]) -> Vec<u32> {
    values.iter().map(|v| v.to_bits()).collect()
}

/// Reference kernels under another ISA name, counting backend traffic and
/// refusing configurations `accept` rejects.
pub struct ProbeBackend {
    pub isa: Isa,
    pub emitters: Arc<AtomicUsize>,
    pub builds: Arc<AtomicUsize>,
    pub accept: fn(&KernelConfig) -> bool,
}

impl ProbeBackend {
    pub fn new(isa: Isa) -> Self {
        Self {
            isa,
            emitters: Arc::new(AtomicUsize::new(0)),
            builds: Arc::new(AtomicUsize::new(0)),
            accept: |_| true,
        }
    }
}

struct ProbeEmitter {
    isa: Isa,
    inner: Box<dyn Emitter>,
    builds: Arc<AtomicUsize>,
    accept: fn(&KernelConfig) -> bool,
}

impl Emitter for ProbeEmitter {
    fn build(&self, config: &KernelConfig) -> Result<CompiledKernel> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        if !(self.accept)(config) {
            return Err(KernelError::unavailable(self.isa, config.kind(), "rejected by probe"));
        }
        self.inner.build(config)
    }
}

impl Backend for ProbeBackend {
    fn isa(&self) -> Isa {
        self.isa
    }

    fn obtain_emitter(&self, expr: &Expression) -> Result<Box<dyn Emitter>> {
        self.emitters.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ProbeEmitter {
            isa: self.isa,
            inner: ReferenceBackend.obtain_emitter(expr)?,
            builds: Arc::clone(&self.builds),
            accept: self.accept,
        }))
    }
}

pub fn registry_with(probe: ProbeBackend) -> Arc<BackendRegistry> {
    let mut registry = BackendRegistry::with_reference();
    registry.register(Arc::new(probe));
    Arc::new(registry)
}

pub fn executor(
    expr: Expression,
    params: &Arc<GemmStaticParams>,
    backends: &Arc<BackendRegistry>,
    options: ExecutorOptions,
) -> KernelExecutor {
    KernelExecutor::new(expr, Arc::clone(params), Arc::clone(backends), options).unwrap()
}
