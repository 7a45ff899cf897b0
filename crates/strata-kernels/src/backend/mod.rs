//! Backend interface for kernel emission.
//!
//! A backend produces an [`Emitter`] for one kernel-bearing expression on one
//! ISA; the emitter turns a [`KernelConfig`] into a [`CompiledKernel`].
//!
//! ```text
//! ┌────────────────────────────────────────────────┐
//! │ BackendRegistry                                │
//! │   obtain_emitter(expr, isa) ─▶ Box<dyn Emitter>│
//! └──────────────┬─────────────────────────────────┘
//!                │ one backend per ISA
//!        ┌───────┴────────┬────────────────┐
//!        ▼                ▼                ▼
//!   ┌──────────┐    ┌──────────┐     ┌──────────┐
//!   │Reference │    │  (avx2)  │ ... │  (neon)  │
//!   └──────────┘    └──────────┘     └──────────┘
//! ```
//!
//! Only the reference backend ships with this crate. Native backends are
//! registered by the embedding application; a request for an ISA with no
//! registered backend is reported as [`KernelError::Unavailable`].

mod reference;

use std::fmt;
use std::sync::Arc;

use strata_lowered::Expression;

use crate::config::KernelConfig;
use crate::error::{KernelError, Result};
use crate::isa::Isa;

pub use reference::ReferenceBackend;

/// Buffers bound for one kernel invocation.
pub struct KernelArgs<'a> {
    pub inputs: Vec<&'a [f32]>,
    pub output: &'a mut [f32],
}

impl<'a> KernelArgs<'a> {
    pub fn input(&self, index: usize) -> Result<&'a [f32]> {
        self.inputs
            .get(index)
            .copied()
            .ok_or_else(|| KernelError::malformed(format!("kernel input {index} is not bound")))
    }
}

/// Executable body of a compiled kernel.
pub trait KernelCode: Send + Sync {
    fn name(&self) -> &'static str;

    /// Run over `args`. `scratch` is the kernel's auxiliary storage.
    fn run(&self, scratch: &[f32], args: KernelArgs<'_>) -> Result<()>;
}

/// Kernel built for one configuration. Immutable once built.
pub struct CompiledKernel {
    config: KernelConfig,
    isa: Isa,
    code: Box<dyn KernelCode>,
    scratch: Vec<f32>,
}

impl CompiledKernel {
    pub fn new(config: KernelConfig, isa: Isa, code: Box<dyn KernelCode>) -> Self {
        Self {
            config,
            isa,
            code,
            scratch: Vec::new(),
        }
    }

    /// Attach zero-initialised auxiliary storage of `len` elements.
    pub fn with_scratch(mut self, len: usize) -> Self {
        self.scratch = vec![0.0; len];
        self
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn isa(&self) -> Isa {
        self.isa
    }

    pub fn scratch(&self) -> &[f32] {
        &self.scratch
    }

    pub fn run(&self, args: KernelArgs<'_>) -> Result<()> {
        self.code.run(&self.scratch, args)
    }
}

impl fmt::Debug for CompiledKernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledKernel")
            .field("code", &self.code.name())
            .field("isa", &self.isa)
            .field("config", &self.config)
            .field("scratch_len", &self.scratch.len())
            .finish()
    }
}

/// Builds kernels for one expression.
pub trait Emitter: Send {
    fn build(&self, config: &KernelConfig) -> Result<CompiledKernel>;
}

pub trait Backend: Send + Sync {
    fn isa(&self) -> Isa;

    fn obtain_emitter(&self, expr: &Expression) -> Result<Box<dyn Emitter>>;
}

/// Backends available to executors, keyed by ISA.
#[derive(Clone)]
pub struct BackendRegistry {
    backends: Vec<Arc<dyn Backend>>,
}

impl BackendRegistry {
    /// Registry with no backends at all.
    pub fn empty() -> Self {
        Self { backends: Vec::new() }
    }

    pub fn with_reference() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(ReferenceBackend));
        registry
    }

    /// Register `backend`, replacing any backend for the same ISA.
    pub fn register(&mut self, backend: Arc<dyn Backend>) {
        let isa = backend.isa();
        self.backends.retain(|existing| existing.isa() != isa);
        self.backends.push(backend);
    }

    pub fn isas(&self) -> Vec<Isa> {
        self.backends.iter().map(|b| b.isa()).collect()
    }

    pub fn obtain_emitter(&self, expr: &Expression, isa: Isa) -> Result<Box<dyn Emitter>> {
        self.backends
            .iter()
            .find(|backend| backend.isa() == isa)
            .ok_or_else(|| KernelError::unavailable(isa, expr.op.name(), "no backend registered"))?
            .obtain_emitter(expr)
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::with_reference()
    }
}

impl fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendRegistry").field("isas", &self.isas()).finish()
    }
}
