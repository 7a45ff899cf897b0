//! Runtime kernel configurations.
//!
//! A configuration holds the shape scalars a kernel was specialized for,
//! plus static parameters fixed at compile time and shared by `Arc` between
//! the executors of one lowered MatMul. `update` recomputes every runtime
//! field and the hash in one step. Any zero extent makes a configuration
//! *empty*: its runtime fields are nulled and no kernel is built or run for it.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{KernelError, Result};

/// Compile-time parameters shared by the GEMM kernels of one MatMul.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GemmStaticParams {
    /// Columns per packed block of B.
    pub n_block: usize,
    /// Rows of C handed to one parallel task.
    pub row_block: usize,
}

impl GemmStaticParams {
    pub fn new(n_block: usize, row_block: usize) -> Result<Self> {
        if n_block == 0 || row_block == 0 {
            return Err(KernelError::malformed(format!(
                "block sizes must be non-zero (n_block={n_block}, row_block={row_block})"
            )));
        }
        Ok(Self { n_block, row_block })
    }

    /// Element count of B packed for `n` columns and `k` rows: one bias row
    /// followed by `k` data rows per block of `n_block` columns.
    pub fn packed_len(&self, n: usize, k: usize) -> usize {
        n.div_ceil(self.n_block) * (k + 1) * self.n_block
    }

    fn hash_into(&self, seed: u64) -> u64 {
        hash_combine(hash_combine(seed, self.n_block as u64), self.row_block as u64)
    }
}

fn hash_combine(seed: u64, value: u64) -> u64 {
    seed ^ value
        .wrapping_add(0x9e37_79b9_7f4a_7c15)
        .wrapping_add(seed << 6)
        .wrapping_add(seed >> 2)
}

fn same_static(a: &Arc<GemmStaticParams>, b: &Arc<GemmStaticParams>) -> bool {
    Arc::ptr_eq(a, b) || **a == **b
}

/// Row-major GEMM extents and leading dimensions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GemmShape {
    pub m: usize,
    pub n: usize,
    pub k: usize,
    pub lda: usize,
    /// Row stride of the packed B layout.
    pub ldb: usize,
    pub ldc: usize,
}

impl GemmShape {
    fn is_degenerate(&self) -> bool {
        self.m == 0 || self.n == 0 || self.k == 0
    }
}

/// Configuration of `C = A * B_packed (+ beta * C)`.
#[derive(Debug, Clone)]
pub struct GemmConfig {
    static_params: Arc<GemmStaticParams>,
    shape: GemmShape,
    beta: f32,
    updated: bool,
    hash: u64,
}

impl GemmConfig {
    pub fn new(static_params: Arc<GemmStaticParams>) -> Self {
        let mut config = Self {
            static_params,
            shape: GemmShape::default(),
            beta: 0.0,
            updated: false,
            hash: 0,
        };
        config.hash = config.compute_hash();
        config
    }

    pub fn update(&mut self, shape: GemmShape, beta: f32) -> Result<()> {
        if shape.is_degenerate() {
            self.shape = GemmShape::default();
            self.beta = 0.0;
        } else {
            if shape.lda < shape.k {
                return Err(KernelError::malformed(format!("lda {} < k {}", shape.lda, shape.k)));
            }
            if shape.ldc < shape.n {
                return Err(KernelError::malformed(format!("ldc {} < n {}", shape.ldc, shape.n)));
            }
            if shape.ldb < self.static_params.n_block {
                return Err(KernelError::malformed(format!(
                    "ldb {} < n_block {}",
                    shape.ldb, self.static_params.n_block
                )));
            }
            self.shape = shape;
            self.beta = beta;
        }
        self.updated = true;
        self.hash = self.compute_hash();
        Ok(())
    }

    pub fn shape(&self) -> &GemmShape {
        &self.shape
    }

    pub fn beta(&self) -> f32 {
        self.beta
    }

    pub fn static_params(&self) -> &Arc<GemmStaticParams> {
        &self.static_params
    }

    pub fn is_empty(&self) -> bool {
        self.updated && self.shape.is_degenerate()
    }

    pub fn is_completed(&self) -> bool {
        self.updated
    }

    pub fn hash_value(&self) -> u64 {
        self.hash
    }

    fn compute_hash(&self) -> u64 {
        let s = &self.shape;
        let seed = [s.m, s.n, s.k, s.lda, s.ldb, s.ldc]
            .into_iter()
            .fold(self.static_params.hash_into(self.updated as u64), |seed, v| {
                hash_combine(seed, v as u64)
            });
        hash_combine(seed, self.beta.to_bits() as u64)
    }
}

impl PartialEq for GemmConfig {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
            && self.updated == other.updated
            && self.shape == other.shape
            && self.beta.to_bits() == other.beta.to_bits()
            && same_static(&self.static_params, &other.static_params)
    }
}

impl fmt::Display for GemmConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = &self.shape;
        write!(
            f,
            "gemm M={} N={} K={} LDA={} LDB={} LDC={} beta={} n_block={} row_block={}",
            s.m, s.n, s.k, s.lda, s.ldb, s.ldc, self.beta, self.static_params.n_block, self.static_params.row_block
        )
    }
}

/// Configuration of the repack of a `[K, N]` matrix B into the packed layout.
#[derive(Debug, Clone)]
pub struct GemmCopyBConfig {
    static_params: Arc<GemmStaticParams>,
    n: usize,
    k: usize,
    ldb: usize,
    updated: bool,
    hash: u64,
}

impl GemmCopyBConfig {
    pub fn new(static_params: Arc<GemmStaticParams>) -> Self {
        let mut config = Self {
            static_params,
            n: 0,
            k: 0,
            ldb: 0,
            updated: false,
            hash: 0,
        };
        config.hash = config.compute_hash();
        config
    }

    pub fn update(&mut self, n: usize, k: usize, ldb: usize) -> Result<()> {
        if n == 0 || k == 0 {
            (self.n, self.k, self.ldb) = (0, 0, 0);
        } else {
            if ldb < n {
                return Err(KernelError::malformed(format!("ldb {ldb} < n {n}")));
            }
            (self.n, self.k, self.ldb) = (n, k, ldb);
        }
        self.updated = true;
        self.hash = self.compute_hash();
        Ok(())
    }

    pub fn n(&self) -> usize {
        self.n
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn ldb(&self) -> usize {
        self.ldb
    }

    pub fn static_params(&self) -> &Arc<GemmStaticParams> {
        &self.static_params
    }

    pub fn packed_len(&self) -> usize {
        self.static_params.packed_len(self.n, self.k)
    }

    pub fn is_empty(&self) -> bool {
        self.updated && (self.n == 0 || self.k == 0)
    }

    pub fn is_completed(&self) -> bool {
        self.updated
    }

    pub fn hash_value(&self) -> u64 {
        self.hash
    }

    fn compute_hash(&self) -> u64 {
        [self.n, self.k, self.ldb]
            .into_iter()
            .fold(self.static_params.hash_into(self.updated as u64), |seed, v| {
                hash_combine(seed, v as u64)
            })
    }
}

impl PartialEq for GemmCopyBConfig {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
            && self.updated == other.updated
            && (self.n, self.k, self.ldb) == (other.n, other.k, other.ldb)
            && same_static(&self.static_params, &other.static_params)
    }
}

impl fmt::Display for GemmCopyBConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "gemm_copy_b N={} K={} LDB={} n_block={}",
            self.n, self.k, self.ldb, self.static_params.n_block
        )
    }
}

/// Configuration of any kernel-bearing expression.
#[derive(Debug, Clone, PartialEq)]
pub enum KernelConfig {
    Gemm(GemmConfig),
    GemmCopyB(GemmCopyBConfig),
}

impl KernelConfig {
    pub fn is_empty(&self) -> bool {
        match self {
            KernelConfig::Gemm(c) => c.is_empty(),
            KernelConfig::GemmCopyB(c) => c.is_empty(),
        }
    }

    pub fn is_completed(&self) -> bool {
        match self {
            KernelConfig::Gemm(c) => c.is_completed(),
            KernelConfig::GemmCopyB(c) => c.is_completed(),
        }
    }

    pub fn hash_value(&self) -> u64 {
        match self {
            KernelConfig::Gemm(c) => c.hash_value(),
            KernelConfig::GemmCopyB(c) => c.hash_value(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            KernelConfig::Gemm(_) => "gemm",
            KernelConfig::GemmCopyB(_) => "gemm_copy_b",
        }
    }
}

impl fmt::Display for KernelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelConfig::Gemm(c) => c.fmt(f),
            KernelConfig::GemmCopyB(c) => c.fmt(f),
        }
    }
}
