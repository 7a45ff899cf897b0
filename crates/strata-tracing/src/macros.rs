//! Convenience macros for performance tracing.
//!
//! Callers must depend on `tracing` directly; the expansions refer to it by
//! its crate name.

/// Create a performance span with optional structured fields.
///
/// Returns a [`crate::performance::PerformanceSpan`] guard that logs the
/// elapsed time when dropped.
///
/// ```rust
/// use strata_tracing::perf_span;
///
/// {
///     let _span = perf_span!("gemm_execute", m = 64, n = 256);
///     // ... kernel body ...
/// }
/// ```
#[macro_export]
macro_rules! perf_span {
    ($name:expr) => {{
        $crate::performance::PerformanceSpan::new($name, None)
    }};
    ($name:expr, $($field:tt = $value:expr),+ $(,)?) => {{
        let _span = tracing::debug_span!(
            "perf",
            name = $name,
            $($field = $value),+
        ).entered();
        $crate::performance::PerformanceSpan::new($name, None)
    }};
}

/// Like [`perf_span!`] but only logs when the duration reaches `threshold_us`.
#[macro_export]
macro_rules! perf_span_threshold {
    ($name:expr, $threshold_us:expr) => {{
        $crate::performance::PerformanceSpan::new($name, Some($threshold_us))
    }};
    ($name:expr, $threshold_us:expr, $($field:tt = $value:expr),+ $(,)?) => {{
        let _span = tracing::debug_span!(
            "perf",
            name = $name,
            $($field = $value),+
        ).entered();
        $crate::performance::PerformanceSpan::new($name, Some($threshold_us))
    }};
}

/// Emit a debug-level performance event with the given metrics.
///
/// ```rust
/// use strata_tracing::perf_event;
///
/// perf_event!("kernel_cache_hit", expr = 3u64, builds = 1u64);
/// ```
#[macro_export]
macro_rules! perf_event {
    ($name:expr, $($field:tt = $value:expr),+ $(,)?) => {
        tracing::debug!(
            event = $name,
            $($field = $value),+
        );
    };
}

/// Time a block, returning `(result, duration_us)`.
///
/// ```rust
/// use strata_tracing::timed_block;
///
/// let (sum, _duration_us) = timed_block!("sum", { (1..=100).sum::<i32>() });
/// assert_eq!(sum, 5050);
/// ```
#[macro_export]
macro_rules! timed_block {
    ($name:expr, $block:block) => {{
        let start = std::time::Instant::now();
        let result = $block;
        let duration_us = start.elapsed().as_micros() as u64;
        tracing::debug!(
            operation = $name,
            duration_us = duration_us,
            "timed_block_complete"
        );
        (result, duration_us)
    }};
}
