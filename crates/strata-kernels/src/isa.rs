//! Instruction-set capability probing.
//!
//! The host ISA is probed once and cached in a process-wide `OnceLock`.
//! [`init_host_isa`] performs the probe eagerly; [`host_isa`] initializes on
//! first use.

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

/// Kernel targets, ordered from least to most capable within an architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Isa {
    /// Portable Rust kernels; always available.
    Reference,
    Sse41,
    Avx2,
    Avx512,
    Neon,
}

impl Isa {
    pub fn name(self) -> &'static str {
        match self {
            Isa::Reference => "reference",
            Isa::Sse41 => "sse41",
            Isa::Avx2 => "avx2",
            Isa::Avx512 => "avx512",
            Isa::Neon => "neon",
        }
    }

    /// Whether code built for `target` runs on a machine with `self`.
    pub fn supports(self, target: Isa) -> bool {
        match target {
            Isa::Reference => true,
            Isa::Neon => self == Isa::Neon,
            Isa::Sse41 | Isa::Avx2 | Isa::Avx512 => self != Isa::Neon && self >= target,
        }
    }
}

impl fmt::Display for Isa {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown ISA '{0}'")]
pub struct ParseIsaError(String);

impl FromStr for Isa {
    type Err = ParseIsaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reference" | "ref" => Ok(Isa::Reference),
            "sse41" | "sse4.1" => Ok(Isa::Sse41),
            "avx2" => Ok(Isa::Avx2),
            "avx512" | "avx512f" => Ok(Isa::Avx512),
            "neon" => Ok(Isa::Neon),
            other => Err(ParseIsaError(other.to_string())),
        }
    }
}

static HOST_ISA: OnceLock<Isa> = OnceLock::new();

/// Probe the host once. Later calls return the cached result.
pub fn init_host_isa() -> Isa {
    *HOST_ISA.get_or_init(|| {
        let isa = probe();
        tracing::debug!(isa = %isa, "host_isa_probed");
        isa
    })
}

pub fn host_isa() -> Isa {
    init_host_isa()
}

#[cfg(target_arch = "x86_64")]
fn probe() -> Isa {
    if std::arch::is_x86_feature_detected!("avx512f") {
        Isa::Avx512
    } else if std::arch::is_x86_feature_detected!("avx2") {
        Isa::Avx2
    } else if std::arch::is_x86_feature_detected!("sse4.1") {
        Isa::Sse41
    } else {
        Isa::Reference
    }
}

#[cfg(target_arch = "aarch64")]
fn probe() -> Isa {
    Isa::Neon
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
fn probe() -> Isa {
    Isa::Reference
}
