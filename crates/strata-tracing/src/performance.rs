//! Performance-focused tracing utilities.
//!
//! [`PerformanceSpan`] is an RAII timer; the `record_*` helpers emit the
//! standard event shapes used by the kernel crates so dashboards can key on
//! a stable set of field names.

use std::time::Instant;
use tracing::Level;

/// RAII guard that measures its own lifetime and logs it on drop.
///
/// When a threshold is set the span is logged only if the measured duration
/// reaches it.
pub struct PerformanceSpan {
    name: String,
    threshold_us: Option<u64>,
    start_time: Instant,
    span: tracing::Span,
}

impl PerformanceSpan {
    pub fn new(name: impl Into<String>, threshold_us: Option<u64>) -> Self {
        Self::with_level(Level::DEBUG, name, threshold_us)
    }

    /// Create a span at an explicit tracing level.
    pub fn with_level(level: Level, name: impl Into<String>, threshold_us: Option<u64>) -> Self {
        let name = name.into();
        let span = match level {
            Level::TRACE => tracing::trace_span!("perf", name = %name),
            Level::DEBUG => tracing::debug_span!("perf", name = %name),
            Level::INFO => tracing::info_span!("perf", name = %name),
            Level::WARN => tracing::warn_span!("perf", name = %name),
            Level::ERROR => tracing::error_span!("perf", name = %name),
        };

        Self {
            name,
            threshold_us,
            start_time: Instant::now(),
            span,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn elapsed_us(&self) -> u64 {
        self.start_time.elapsed().as_micros() as u64
    }
}

impl Drop for PerformanceSpan {
    fn drop(&mut self) {
        let elapsed_us = self.elapsed_us();
        if self.threshold_us.is_none_or(|t| elapsed_us >= t) {
            let _entered = self.span.enter();
            tracing::debug!(
                duration_us = elapsed_us,
                duration_ms = elapsed_us as f64 / 1000.0,
                "performance_span_complete"
            );
        }
    }
}

/// Record a kernel (re)build.
///
/// `rebuild` distinguishes a configuration change from the first build of an
/// executor.
pub fn record_kernel_build(kernel: &str, expr: u64, rebuild: bool, duration_us: u64) {
    tracing::debug!(
        event = "kernel_build",
        kernel = kernel,
        expr = expr,
        rebuild = rebuild,
        duration_us = duration_us,
        "kernel_built"
    );
}

/// Record an elementwise throughput sample.
pub fn record_throughput(operation: &str, elements: usize, duration_us: u64) {
    let elements_per_sec = if duration_us > 0 {
        (elements as f64 / duration_us as f64) * 1_000_000.0
    } else {
        0.0
    };

    tracing::debug!(
        event = "throughput",
        operation = operation,
        elements = elements,
        duration_us = duration_us,
        elements_per_sec = elements_per_sec,
        "operation_throughput"
    );
}

/// Record floating-point throughput for a compute kernel.
pub fn record_flops(operation: &str, flops: usize, duration_us: u64) {
    let flops_per_sec = if duration_us > 0 {
        (flops as f64 / duration_us as f64) * 1_000_000.0
    } else {
        0.0
    };

    tracing::debug!(
        event = "flops",
        operation = operation,
        flops = flops,
        duration_us = duration_us,
        gflops = flops_per_sec / 1_000_000_000.0,
        "compute_performance"
    );
}
