//! Configuration-keyed kernel executors.
//!
//! Each kernel-bearing expression owns one [`KernelExecutor`]. At every
//! invocation the executor recomputes its configuration from the runtime
//! shapes; an equal configuration reuses the cached kernel, a changed one
//! triggers exactly one rebuild.
//!
//! # Thread Safety
//!
//! The cached kernel sits behind a `parking_lot::RwLock`; readers clone the
//! `Arc` and release the lock before running it. Builds are serialized by a
//! separate mutex. A caller that waited on that mutex re-checks the cache
//! first, so concurrent first calls with the same shapes build once. A failed
//! build leaves the previous kernel installed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use strata_lowered::{BufferId, Direction, ExprId, Expression, LoweredError, Memory, OpKind, ShapeContext};

use crate::backend::{BackendRegistry, CompiledKernel, KernelArgs};
use crate::config::{GemmConfig, GemmCopyBConfig, GemmShape, GemmStaticParams, KernelConfig};
use crate::error::{KernelError, Result};
use crate::isa::Isa;

/// How an executor picks its backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorOptions {
    pub isa: Isa,
    /// Retry an unavailable kernel on the reference backend.
    pub fallback: bool,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            isa: Isa::Reference,
            fallback: true,
        }
    }
}

/// Per-executor counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorStats {
    /// Successful builds, first build included.
    pub builds: u64,
    pub rebuilds: u64,
    pub cache_hits: u64,
    pub failed_builds: u64,
    pub fallbacks: u64,
    /// Invocations skipped because the configuration was empty.
    pub skipped: u64,
}

#[derive(Default)]
struct Counters {
    builds: AtomicU64,
    rebuilds: AtomicU64,
    cache_hits: AtomicU64,
    failed_builds: AtomicU64,
    fallbacks: AtomicU64,
    skipped: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ExecutorStats {
        ExecutorStats {
            builds: self.builds.load(Ordering::Relaxed),
            rebuilds: self.rebuilds.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            failed_builds: self.failed_builds.load(Ordering::Relaxed),
            fallbacks: self.fallbacks.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
        }
    }
}

/// Buffers a kernel reads and the one it writes.
struct Bindings {
    reads: Vec<BufferId>,
    write: BufferId,
}

pub struct KernelExecutor {
    expr: Expression,
    static_params: Arc<GemmStaticParams>,
    backends: Arc<BackendRegistry>,
    options: ExecutorOptions,
    kernel: RwLock<Option<Arc<CompiledKernel>>>,
    build_lock: Mutex<()>,
    counters: Counters,
}

impl KernelExecutor {
    pub fn new(
        expr: Expression,
        static_params: Arc<GemmStaticParams>,
        backends: Arc<BackendRegistry>,
        options: ExecutorOptions,
    ) -> Result<Self> {
        if !expr.op.is_kernel() {
            return Err(LoweredError::unsupported(expr.id, format!("kernel executor for {}", expr.op)).into());
        }
        let executor = Self {
            expr,
            static_params,
            backends,
            options,
            kernel: RwLock::new(None),
            build_lock: Mutex::new(()),
            counters: Counters::default(),
        };
        executor.bindings()?;
        Ok(executor)
    }

    pub fn expr_id(&self) -> ExprId {
        self.expr.id
    }

    pub fn expression(&self) -> &Expression {
        &self.expr
    }

    pub fn stats(&self) -> ExecutorStats {
        self.counters.snapshot()
    }

    /// Configuration of the currently installed kernel, if any.
    pub fn current_config(&self) -> Option<KernelConfig> {
        self.kernel.read().as_ref().map(|kernel| kernel.config().clone())
    }

    /// Recompute the configuration from runtime shapes.
    pub fn update(&self, shapes: &dyn ShapeContext) -> Result<KernelConfig> {
        let bindings = self.bindings()?;
        match self.expr.op {
            OpKind::Gemm { beta } => {
                let [m, k] = matrix_dims(shapes, bindings.reads[0])?;
                let [c_rows, n] = matrix_dims(shapes, bindings.write)?;
                if m != c_rows {
                    return Err(KernelError::malformed(format!("A has {m} rows but C has {c_rows}")));
                }
                let mut config = GemmConfig::new(Arc::clone(&self.static_params));
                config.update(
                    GemmShape {
                        m,
                        n,
                        k,
                        lda: k,
                        ldb: self.static_params.n_block,
                        ldc: n,
                    },
                    beta,
                )?;
                Ok(KernelConfig::Gemm(config))
            }
            OpKind::GemmCopyB { n_block } => {
                if n_block != self.static_params.n_block {
                    return Err(KernelError::malformed(format!(
                        "copy-b block {n_block} differs from shared block {}",
                        self.static_params.n_block
                    )));
                }
                let [k, n] = matrix_dims(shapes, bindings.reads[0])?;
                let mut config = GemmCopyBConfig::new(Arc::clone(&self.static_params));
                config.update(n, k, n)?;
                Ok(KernelConfig::GemmCopyB(config))
            }
            _ => Err(LoweredError::unsupported(self.expr.id, self.expr.op.name()).into()),
        }
    }

    /// Kernel for `config`, building it if the cached one differs. Empty
    /// configurations have no kernel and never reach the backend.
    pub fn ensure_kernel(&self, config: &KernelConfig) -> Result<Option<Arc<CompiledKernel>>> {
        if config.is_empty() {
            return Ok(None);
        }
        if !config.is_completed() {
            return Err(KernelError::malformed(format!("{} is not fully specified", config.kind())));
        }
        if let Some(kernel) = self.cached(config) {
            Counters::bump(&self.counters.cache_hits);
            return Ok(Some(kernel));
        }

        let _building = self.build_lock.lock();
        if let Some(kernel) = self.cached(config) {
            Counters::bump(&self.counters.cache_hits);
            strata_tracing::perf_event!("kernel_build_shared", expr = self.expr.id.0 as u64, kind = config.kind());
            return Ok(Some(kernel));
        }

        let rebuild = self.kernel.read().is_some();
        let (built, duration_us) = strata_tracing::timed_block!("kernel_build", { self.build(config) });
        let kernel = match built {
            Ok(kernel) => Arc::new(kernel),
            Err(err) => {
                Counters::bump(&self.counters.failed_builds);
                tracing::debug!(expr = %self.expr.id, config = %config, error = %err, "kernel_build_failed");
                return Err(err);
            }
        };
        *self.kernel.write() = Some(Arc::clone(&kernel));

        Counters::bump(&self.counters.builds);
        if rebuild {
            Counters::bump(&self.counters.rebuilds);
        }
        strata_tracing::performance::record_kernel_build(config.kind(), self.expr.id.0 as u64, rebuild, duration_us);
        tracing::debug!(expr = %self.expr.id, isa = %kernel.isa(), config = %config, "kernel_installed");
        Ok(Some(kernel))
    }

    /// Run `kernel` over the expression's buffers in `memory`.
    pub fn execute(&self, kernel: &CompiledKernel, memory: &mut Memory) -> Result<()> {
        let bindings = self.bindings()?;
        let mut output = memory.take(bindings.write)?;
        let (outcome, duration_us) = strata_tracing::timed_block!("kernel_execute", {
            bindings
                .reads
                .iter()
                .map(|buffer| memory.data(*buffer))
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(KernelError::from)
                .and_then(|inputs| {
                    kernel.run(KernelArgs {
                        inputs,
                        output: &mut output.data,
                    })
                })
        });
        memory.bind(bindings.write, output);
        if outcome.is_ok() {
            if let KernelConfig::Gemm(gemm) = kernel.config() {
                let GemmShape { m, n, k, .. } = *gemm.shape();
                strata_tracing::performance::record_flops("gemm", 2 * m * n * k, duration_us);
            }
        }
        outcome
    }

    /// Update, ensure and execute in one step.
    pub fn invoke(&self, memory: &mut Memory) -> Result<()> {
        let config = self.update(&*memory)?;
        match self.ensure_kernel(&config)? {
            Some(kernel) => self.execute(&kernel, memory),
            None => {
                Counters::bump(&self.counters.skipped);
                tracing::trace!(expr = %self.expr.id, "kernel_skipped_empty_config");
                Ok(())
            }
        }
    }

    fn cached(&self, config: &KernelConfig) -> Option<Arc<CompiledKernel>> {
        self.kernel
            .read()
            .as_ref()
            .filter(|kernel| kernel.config() == config)
            .cloned()
    }

    fn build(&self, config: &KernelConfig) -> Result<CompiledKernel> {
        let isa = self.options.isa;
        let primary = self
            .backends
            .obtain_emitter(&self.expr, isa)
            .and_then(|emitter| emitter.build(config));
        match primary {
            Err(err) if err.is_unavailable() && self.options.fallback && isa != Isa::Reference => {
                Counters::bump(&self.counters.fallbacks);
                tracing::debug!(expr = %self.expr.id, isa = %isa, reason = %err, "kernel_fallback_to_reference");
                self.backends
                    .obtain_emitter(&self.expr, Isa::Reference)?
                    .build(config)
            }
            other => other,
        }
    }

    fn bindings(&self) -> Result<Bindings> {
        let reads_needed = match self.expr.op {
            OpKind::Gemm { .. } => 2,
            _ => 1,
        };
        let reads: Vec<BufferId> = (0..reads_needed)
            .map(|nth| self.expr.buffer_for(Direction::Read, nth))
            .collect::<Option<_>>()
            .ok_or_else(|| LoweredError::malformed(self.expr.id, "kernel expression lacks read ports"))?;
        let write = self
            .expr
            .buffer_for(Direction::Write, 0)
            .ok_or_else(|| LoweredError::malformed(self.expr.id, "kernel expression lacks a write port"))?;
        if reads.contains(&write) {
            return Err(KernelError::Aliasing {
                expr: self.expr.id,
                buffer: write,
            });
        }
        Ok(Bindings { reads, write })
    }
}

fn matrix_dims(shapes: &dyn ShapeContext, buffer: BufferId) -> Result<[usize; 2]> {
    let dims = shapes.dims(buffer).ok_or(LoweredError::MissingBuffer(buffer))?;
    match dims {
        [rows, cols] => Ok([*rows, *cols]),
        other => Err(KernelError::malformed(format!(
            "buffer {buffer} has rank {}, expected a matrix",
            other.len()
        ))),
    }
}

impl std::fmt::Debug for KernelExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelExecutor")
            .field("expr", &self.expr.id)
            .field("op", &self.expr.op)
            .field("options", &self.options)
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_lowered::{AccessDescriptor, MemoryPort};

    fn copy_b_expr(read: BufferId, write: BufferId) -> Expression {
        Expression::new(ExprId(0), OpKind::GemmCopyB { n_block: 4 })
            .with_memory(MemoryPort::read(read, AccessDescriptor::contiguous(1, 0)))
            .with_memory(MemoryPort::write(write, AccessDescriptor::contiguous(1, 0)))
    }

    fn params() -> Arc<GemmStaticParams> {
        Arc::new(GemmStaticParams::new(4, 2).unwrap())
    }

    #[test]
    fn aliasing_ports_are_rejected() {
        let err = KernelExecutor::new(
            copy_b_expr(BufferId(0), BufferId(0)),
            params(),
            Arc::new(BackendRegistry::default()),
            ExecutorOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, KernelError::Aliasing { .. }));
    }

    #[test]
    fn non_kernel_expression_is_rejected() {
        let expr = Expression::new(ExprId(1), OpKind::Load);
        let err = KernelExecutor::new(
            expr,
            params(),
            Arc::new(BackendRegistry::default()),
            ExecutorOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, KernelError::Lowered(LoweredError::Unsupported { .. })));
    }

    #[test]
    fn rank_mismatch_is_malformed() {
        let executor = KernelExecutor::new(
            copy_b_expr(BufferId(0), BufferId(1)),
            params(),
            Arc::new(BackendRegistry::default()),
            ExecutorOptions::default(),
        )
        .unwrap();
        let mut shapes = strata_lowered::ShapeMap::new();
        shapes.insert(BufferId(0), vec![2, 3, 4]);
        assert!(matches!(executor.update(&shapes), Err(KernelError::MalformedConfig(_))));
    }
}
