//! # strata-kernels
//!
//! Kernel configurations, the backend emitter interface and the executors
//! that keep one compiled kernel per kernel-bearing expression.
//!
//! ```text
//! runtime shapes ─▶ KernelExecutor::update ─▶ KernelConfig
//!                                               │
//!                         equal to cached? ─yes─┼─▶ cached kernel
//!                                               no
//!                                               ▼
//!                  BackendRegistry::obtain_emitter(expr, isa)
//!                       │ unavailable + fallback
//!                       ▼
//!                  reference backend ─▶ Emitter::build ─▶ CompiledKernel
//! ```
//!
//! An [`ExecutorTable`] implements [`strata_lowered::KernelDispatch`], so the
//! lowered-program interpreter hands every `Gemm`/`GemmCopyB` expression to
//! its executor.

pub mod backend;
pub mod config;
pub mod error;
pub mod executor;
pub mod isa;
pub mod table;

pub use backend::{Backend, BackendRegistry, CompiledKernel, Emitter, KernelArgs, KernelCode, ReferenceBackend};
pub use config::{GemmConfig, GemmCopyBConfig, GemmShape, GemmStaticParams, KernelConfig};
pub use error::{KernelError, Result};
pub use executor::{ExecutorOptions, ExecutorStats, KernelExecutor};
pub use isa::{host_isa, init_host_isa, Isa, ParseIsaError};
pub use table::ExecutorTable;
