//! Compile-time options for subgraph compilation.
//!
//! Options can be built from presets or from the environment:
//!
//! - `STRATA_ISA` - `host` (default) or an ISA name (`reference`, `sse41`, `avx2`, `avx512`, `neon`)
//! - `STRATA_DISABLE_FALLBACK` - `true`/`1`/`yes` disables the reference fallback
//! - `STRATA_GEMM_N_BLOCK` - column block of the packed GEMM layout
//! - `STRATA_PIPELINE_MAX_ITERS` - bound of the convert clean-up fixed point

use std::env;

use serde::{Deserialize, Serialize};
use strata_kernels::{host_isa, ExecutorOptions, GemmStaticParams, Isa};
use strata_lowered::MemoryAccessConfig;

use crate::error::{Error, Result};

/// Which ISA kernels are requested for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsaRequest {
    /// Whatever the host probe reports.
    Host,
    Exact(Isa),
}

impl IsaRequest {
    pub fn resolve(self) -> Isa {
        match self {
            IsaRequest::Host => host_isa(),
            IsaRequest::Exact(isa) => isa,
        }
    }

    fn from_env_value(value: &str) -> Option<Self> {
        if value.trim().eq_ignore_ascii_case("host") {
            return Some(IsaRequest::Host);
        }
        value.parse().ok().map(IsaRequest::Exact)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CompileOptions {
    pub isa: IsaRequest,
    /// Retry unavailable kernels on the reference backend.
    pub fallback: bool,
    pub memory_access: MemoryAccessConfig,
    /// Columns per block of the packed B layout.
    pub gemm_n_block: usize,
    /// Output rows per parallel GEMM task.
    pub gemm_row_block: usize,
    /// Bound of the convert clean-up fixed point.
    pub pipeline_max_iters: usize,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            isa: IsaRequest::Host,
            fallback: true,
            memory_access: MemoryAccessConfig::default(),
            gemm_n_block: 16,
            gemm_row_block: 8,
            pipeline_max_iters: 8,
        }
    }
}

impl CompileOptions {
    /// Portable kernels only; the same results on every machine.
    pub fn reference() -> Self {
        Self {
            isa: IsaRequest::Exact(Isa::Reference),
            ..Self::default()
        }
    }

    /// Fail instead of falling back when the requested ISA has no kernel.
    pub fn strict(isa: Isa) -> Self {
        Self {
            isa: IsaRequest::Exact(isa),
            fallback: false,
            ..Self::default()
        }
    }

    /// Load options from environment variables, starting from the defaults.
    /// Unparseable values are ignored.
    pub fn from_env() -> Self {
        let mut options = Self::default();

        if let Ok(isa) = env::var("STRATA_ISA") {
            if let Some(parsed) = IsaRequest::from_env_value(&isa) {
                options.isa = parsed;
            }
        }

        if let Ok(disable) = env::var("STRATA_DISABLE_FALLBACK") {
            options.fallback =
                !(disable.eq_ignore_ascii_case("true") || disable == "1" || disable.eq_ignore_ascii_case("yes"));
        }

        if let Ok(n_block) = env::var("STRATA_GEMM_N_BLOCK") {
            if let Ok(n_block) = n_block.trim().parse::<usize>() {
                options.gemm_n_block = n_block;
            }
        }

        if let Ok(max_iters) = env::var("STRATA_PIPELINE_MAX_ITERS") {
            if let Ok(max_iters) = max_iters.trim().parse::<usize>() {
                options.pipeline_max_iters = max_iters;
            }
        }

        options
    }

    pub fn validate(&self) -> Result<()> {
        if self.gemm_n_block == 0 {
            return Err(Error::InvalidOption {
                option: "gemm_n_block",
                reason: "must be positive".into(),
            });
        }
        if self.gemm_row_block == 0 {
            return Err(Error::InvalidOption {
                option: "gemm_row_block",
                reason: "must be positive".into(),
            });
        }
        if self.pipeline_max_iters == 0 {
            return Err(Error::InvalidOption {
                option: "pipeline_max_iters",
                reason: "must be positive".into(),
            });
        }
        if !(0.0..=1.0).contains(&self.memory_access.min_cache_efficiency) {
            return Err(Error::InvalidOption {
                option: "memory_access.min_cache_efficiency",
                reason: format!("{} is outside [0, 1]", self.memory_access.min_cache_efficiency),
            });
        }
        Ok(())
    }

    pub fn executor_options(&self) -> ExecutorOptions {
        ExecutorOptions {
            isa: self.isa.resolve(),
            fallback: self.fallback,
        }
    }

    pub fn gemm_static_params(&self) -> Result<GemmStaticParams> {
        Ok(GemmStaticParams::new(self.gemm_n_block, self.gemm_row_block)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const ENV_KEYS: &[&str] = &[
        "STRATA_ISA",
        "STRATA_DISABLE_FALLBACK",
        "STRATA_GEMM_N_BLOCK",
        "STRATA_PIPELINE_MAX_ITERS",
    ];

    fn reset_env() {
        for key in ENV_KEYS {
            env::remove_var(key);
        }
    }

    #[test]
    #[serial]
    fn from_env_without_variables_is_default() {
        reset_env();
        assert_eq!(CompileOptions::from_env(), CompileOptions::default());
    }

    #[test]
    #[serial]
    fn from_env_reads_every_variable() {
        reset_env();
        env::set_var("STRATA_ISA", "avx2");
        env::set_var("STRATA_DISABLE_FALLBACK", "yes");
        env::set_var("STRATA_GEMM_N_BLOCK", "32");
        env::set_var("STRATA_PIPELINE_MAX_ITERS", "3");

        let options = CompileOptions::from_env();
        assert_eq!(options.isa, IsaRequest::Exact(Isa::Avx2));
        assert!(!options.fallback);
        assert_eq!(options.gemm_n_block, 32);
        assert_eq!(options.pipeline_max_iters, 3);
        reset_env();
    }

    #[test]
    #[serial]
    fn unparseable_values_keep_defaults() {
        reset_env();
        env::set_var("STRATA_ISA", "riscv");
        env::set_var("STRATA_GEMM_N_BLOCK", "wide");
        env::set_var("STRATA_DISABLE_FALLBACK", "0");

        let options = CompileOptions::from_env();
        assert_eq!(options.isa, IsaRequest::Host);
        assert_eq!(options.gemm_n_block, 16);
        assert!(options.fallback);
        reset_env();
    }

    #[test]
    fn validation_rejects_zero_blocks() {
        let options = CompileOptions {
            gemm_n_block: 0,
            ..CompileOptions::reference()
        };
        assert!(matches!(
            options.validate(),
            Err(Error::InvalidOption {
                option: "gemm_n_block",
                ..
            })
        ));
        assert!(CompileOptions::reference().validate().is_ok());
    }

    #[test]
    fn strict_preset_disables_fallback() {
        let options = CompileOptions::strict(Isa::Avx512);
        assert_eq!(options.executor_options().isa, Isa::Avx512);
        assert!(!options.executor_options().fallback);
    }
}
