use std::sync::Arc;

use tracing::Level;

use super::{Pass, PassResult};
use crate::error::Result;
use crate::program::LoweredProgram;

/// Fixed-point steps faster than this are not logged.
const FIXED_POINT_LOG_THRESHOLD_US: u64 = 1_000;

pub enum Step {
    Pass(Arc<dyn Pass>),
    FixedPoint { max_iters: usize, steps: Vec<Step> },
}

#[derive(Default)]
pub struct PipelineBuilder {
    steps: Vec<Step>,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self { steps: Vec::new() }
    }

    pub fn pass<P: Pass + 'static>(&mut self, pass: P) {
        self.steps.push(Step::Pass(Arc::new(pass)));
    }

    /// Repeat the steps added by `build` until none of them changes the
    /// program, at most `max_iters` times.
    pub fn fixed_point<F>(&mut self, max_iters: usize, build: F)
    where
        F: FnOnce(&mut PipelineBuilder),
    {
        let mut inner = PipelineBuilder::new();
        build(&mut inner);
        self.steps.push(Step::FixedPoint {
            max_iters: max_iters.max(1),
            steps: inner.steps,
        });
    }

    pub fn finish(self) -> Pipeline {
        Pipeline { steps: self.steps }
    }
}

/// Ordered pass list applied once per compiled subgraph.
pub struct Pipeline {
    steps: Vec<Step>,
}

impl Pipeline {
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::new()
    }

    /// Names of the passes in execution order, fixed points flattened.
    pub fn pass_names(&self) -> Vec<&'static str> {
        fn collect(steps: &[Step], out: &mut Vec<&'static str>) {
            for step in steps {
                match step {
                    Step::Pass(pass) => out.push(pass.name()),
                    Step::FixedPoint { steps, .. } => collect(steps, out),
                }
            }
        }
        let mut names = Vec::new();
        collect(&self.steps, &mut names);
        names
    }

    /// Run every step. The program is validated before the first pass and
    /// after every pass that reports a modification.
    #[tracing::instrument(skip_all, fields(expressions = program.len()))]
    pub fn run(&self, program: &mut LoweredProgram) -> Result<PassResult> {
        program.validate()?;
        let mut totals = PassResult::default();
        run_steps(&self.steps, program, &mut totals)?;
        tracing::debug!(
            changed = totals.changed,
            rewrites = totals.rewrites_applied,
            erased = totals.erased,
            expressions = program.len(),
            "pipeline_complete"
        );
        Ok(totals)
    }
}

fn run_steps(steps: &[Step], program: &mut LoweredProgram, totals: &mut PassResult) -> Result<bool> {
    let mut changed_any = false;
    for step in steps {
        match step {
            Step::Pass(pass) => {
                let name = pass.name();
                let _span = strata_tracing::perf_span!(name);
                let stats = pass.run(program).map_err(|err| err.in_pass(name))?;
                if stats.changed {
                    program.validate().map_err(|err| err.in_pass(name))?;
                }
                changed_any |= stats.changed;
                *totals = totals.merge(stats);
                emit_pass_stats(name, program, stats);
            }
            Step::FixedPoint { max_iters, steps } => {
                let _span = strata_tracing::perf_span_threshold!(
                    "fixed_point",
                    FIXED_POINT_LOG_THRESHOLD_US,
                    max_iters = *max_iters
                );
                let mut iter = 0usize;
                while iter < *max_iters {
                    iter += 1;
                    let mut local = PassResult::default();
                    let changed = run_steps(steps, program, &mut local)?;
                    local.iterations = 1;
                    *totals = totals.merge(local);
                    changed_any |= changed;
                    if !changed {
                        break;
                    }
                }
            }
        }
    }
    Ok(changed_any)
}

fn emit_pass_stats(name: &'static str, program: &LoweredProgram, stats: PassResult) {
    tracing::debug!(
        pass = name,
        changed = stats.changed,
        rewrites = stats.rewrites_applied,
        erased = stats.erased,
        "pass_complete"
    );
    if stats.changed && tracing::enabled!(Level::TRACE) {
        match program.to_json() {
            Ok(ir) => tracing::trace!(pass = name, ir = %ir, "pass_ir"),
            Err(err) => tracing::trace!(pass = name, error = %err, "pass_ir_unavailable"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LoweredError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Reports a change for the first `budget` runs.
    struct Countdown {
        budget: AtomicUsize,
        runs: Arc<AtomicUsize>,
    }

    impl Pass for Countdown {
        fn name(&self) -> &'static str {
            "countdown"
        }

        fn run(&self, _program: &mut LoweredProgram) -> Result<PassResult> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            let left = self.budget.load(Ordering::SeqCst);
            if left == 0 {
                return Ok(PassResult::default());
            }
            self.budget.store(left - 1, Ordering::SeqCst);
            Ok(PassResult::from_counts(1, 0))
        }
    }

    struct Broken;

    impl Pass for Broken {
        fn name(&self) -> &'static str {
            "broken"
        }

        fn run(&self, program: &mut LoweredProgram) -> Result<PassResult> {
            let id = program.new_expr_id();
            Err(LoweredError::UnknownExpression(id))
        }
    }

    #[test]
    fn fixed_point_stops_when_stable() {
        let runs = Arc::new(AtomicUsize::new(0));
        let mut builder = Pipeline::builder();
        builder.fixed_point(10, |p| {
            p.pass(Countdown {
                budget: AtomicUsize::new(2),
                runs: Arc::clone(&runs),
            })
        });
        let pipeline = builder.finish();

        let totals = pipeline.run(&mut LoweredProgram::new()).unwrap();
        assert!(totals.changed);
        assert_eq!(totals.rewrites_applied, 2);
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn fixed_point_respects_iteration_bound() {
        let runs = Arc::new(AtomicUsize::new(0));
        let mut builder = Pipeline::builder();
        builder.fixed_point(2, |p| {
            p.pass(Countdown {
                budget: AtomicUsize::new(100),
                runs: Arc::clone(&runs),
            })
        });
        builder.finish().run(&mut LoweredProgram::new()).unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn pass_errors_name_the_pass() {
        let mut builder = Pipeline::builder();
        builder.pass(Broken);
        match builder.finish().run(&mut LoweredProgram::new()) {
            Err(LoweredError::PassFailed { pass, .. }) => assert_eq!(pass, "broken"),
            other => panic!("expected pass failure, got {other:?}"),
        }
    }
}
