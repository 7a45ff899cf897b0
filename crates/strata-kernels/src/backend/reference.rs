//! Portable reference kernels.
//!
//! Packed B layout, per block of `n_block` columns:
//!
//! ```text
//! block b: [ bias row (n_block) | row 0 (n_block) | ... | row K-1 (n_block) ]
//! ```
//!
//! Columns past N in the last block are zero. GEMM rows of C are split into
//! chunks of `row_block` rows and processed on the rayon pool; each chunk
//! writes a disjoint slice of C.

use rayon::prelude::*;
use strata_lowered::{Expression, OpKind};

use super::{Backend, CompiledKernel, Emitter, KernelArgs, KernelCode};
use crate::config::{GemmConfig, GemmCopyBConfig, GemmShape, KernelConfig};
use crate::error::{KernelError, Result};
use crate::isa::Isa;

#[derive(Debug, Default, Clone, Copy)]
pub struct ReferenceBackend;

impl Backend for ReferenceBackend {
    fn isa(&self) -> Isa {
        Isa::Reference
    }

    fn obtain_emitter(&self, expr: &Expression) -> Result<Box<dyn Emitter>> {
        match expr.op {
            OpKind::Gemm { .. } => Ok(Box::new(GemmEmitter)),
            OpKind::GemmCopyB { .. } => Ok(Box::new(CopyBEmitter)),
            _ => Err(KernelError::unavailable(Isa::Reference, expr.op.name(), "not a kernel operation")),
        }
    }
}

struct GemmEmitter;

impl Emitter for GemmEmitter {
    fn build(&self, config: &KernelConfig) -> Result<CompiledKernel> {
        let KernelConfig::Gemm(gemm) = config else {
            return Err(KernelError::malformed(format!("gemm emitter given a {} configuration", config.kind())));
        };
        require_runnable(config)?;
        Ok(CompiledKernel::new(
            config.clone(),
            Isa::Reference,
            Box::new(GemmKernel::from_config(gemm)),
        ))
    }
}

struct CopyBEmitter;

impl Emitter for CopyBEmitter {
    fn build(&self, config: &KernelConfig) -> Result<CompiledKernel> {
        let KernelConfig::GemmCopyB(copy) = config else {
            return Err(KernelError::malformed(format!(
                "copy-b emitter given a {} configuration",
                config.kind()
            )));
        };
        require_runnable(config)?;
        let n_block = copy.static_params().n_block;
        Ok(CompiledKernel::new(config.clone(), Isa::Reference, Box::new(CopyBKernel::from_config(copy)))
            .with_scratch(n_block))
    }
}

/// Kernels index with every extent, so only updated non-empty configurations build.
fn require_runnable(config: &KernelConfig) -> Result<()> {
    if !config.is_completed() {
        return Err(KernelError::malformed(format!("{} is not fully specified", config.kind())));
    }
    if config.is_empty() {
        return Err(KernelError::malformed(format!("{} has an empty extent: {config}", config.kind())));
    }
    Ok(())
}

fn require(what: &str, len: usize, needed: usize) -> Result<()> {
    if len < needed {
        return Err(KernelError::malformed(format!("{what} holds {len} elements, kernel needs {needed}")));
    }
    Ok(())
}

struct GemmKernel {
    shape: GemmShape,
    beta: f32,
    n_block: usize,
    row_block: usize,
}

impl GemmKernel {
    fn from_config(config: &GemmConfig) -> Self {
        Self {
            shape: *config.shape(),
            beta: config.beta(),
            n_block: config.static_params().n_block,
            row_block: config.static_params().row_block,
        }
    }

    fn row(&self, i: usize, a: &[f32], packed: &[f32], c_row: &mut [f32]) {
        let GemmShape { n, k, lda, ldb, .. } = self.shape;
        let a_row = &a[i * lda..i * lda + k];
        let block_len = (k + 1) * ldb;
        for (block, start) in (0..n).step_by(self.n_block).enumerate() {
            let base = block * block_len;
            let cols = self.n_block.min(n - start);
            for jj in 0..cols {
                let mut acc = packed[base + jj];
                for (kk, a_val) in a_row.iter().enumerate() {
                    acc += a_val * packed[base + (kk + 1) * ldb + jj];
                }
                let c = &mut c_row[start + jj];
                *c = if self.beta != 0.0 { acc + self.beta * *c } else { acc };
            }
        }
    }
}

impl KernelCode for GemmKernel {
    fn name(&self) -> &'static str {
        "reference_gemm"
    }

    fn run(&self, _scratch: &[f32], args: KernelArgs<'_>) -> Result<()> {
        let GemmShape { m, n, k, lda, ldb, ldc } = self.shape;
        let a = args.input(0)?;
        let packed = args.input(1)?;
        require("A", a.len(), (m - 1) * lda + k)?;
        require("packed B", packed.len(), n.div_ceil(self.n_block) * (k + 1) * ldb)?;
        let output = args.output;
        require("C", output.len(), m * ldc)?;

        let rows_per_task = self.row_block * ldc;
        output[..m * ldc]
            .par_chunks_mut(rows_per_task)
            .enumerate()
            .for_each(|(task, chunk)| {
                for (r, c_row) in chunk.chunks_mut(ldc).enumerate() {
                    self.row(task * self.row_block + r, a, packed, c_row);
                }
            });
        Ok(())
    }
}

struct CopyBKernel {
    n: usize,
    k: usize,
    ldb: usize,
    n_block: usize,
}

impl CopyBKernel {
    fn from_config(config: &GemmCopyBConfig) -> Self {
        Self {
            n: config.n(),
            k: config.k(),
            ldb: config.ldb(),
            n_block: config.static_params().n_block,
        }
    }
}

impl KernelCode for CopyBKernel {
    fn name(&self) -> &'static str {
        "reference_gemm_copy_b"
    }

    fn run(&self, scratch: &[f32], args: KernelArgs<'_>) -> Result<()> {
        let (n, k, ldb, nb) = (self.n, self.k, self.ldb, self.n_block);
        let b = args.input(0)?;
        require("B", b.len(), (k - 1) * ldb + n)?;
        require("bias scratch", scratch.len(), nb)?;
        let block_len = (k + 1) * nb;
        let packed_len = n.div_ceil(nb) * block_len;
        let output = args.output;
        require("packed B", output.len(), packed_len)?;

        output[..packed_len]
            .par_chunks_mut(block_len)
            .enumerate()
            .for_each(|(block, dst)| {
                let start = block * nb;
                let cols = nb.min(n - start);
                let (bias, rows) = dst.split_at_mut(nb);
                bias.copy_from_slice(&scratch[..nb]);
                for (kk, row) in rows.chunks_mut(nb).enumerate() {
                    let src = &b[kk * ldb + start..kk * ldb + start + cols];
                    row[..cols].copy_from_slice(src);
                    row[cols..].fill(0.0);
                }
            });
        Ok(())
    }
}
