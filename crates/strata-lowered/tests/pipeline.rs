mod common;

use common::{memory_with, Builder};
use strata_lowered::{
    evaluate, standard_pipeline, AccessDescriptor, BufferId, BufferKind, ElementType, LoweredError, LoweredProgram,
    MemoryAccessConfig, OpKind, Pass, PassResult, Pipeline, Result, WorkAmount,
};

/// `y[i] = i32(f32(x[i]))` with the identity conversion left in.
fn converting_copy() -> (LoweredProgram, BufferId, BufferId) {
    let mut b = Builder::new();
    let x = b.buffer("x", BufferKind::Input);
    let y = b.buffer("y", BufferKind::Output);
    b.open_loop(WorkAmount::Elements(x), 1, 1);
    let value = b.load(x, AccessDescriptor::new(1, 1, 0));
    let same = b.convert(OpKind::Convert { to: ElementType::F32 }, ElementType::F32, value);
    let narrowed = b.convert(OpKind::Convert { to: ElementType::I32 }, ElementType::I32, same);
    b.store(y, AccessDescriptor::new(1, 1, 0), narrowed);
    b.close_loop();
    (b.finish(), x, y)
}

#[test]
fn standard_pipeline_order() {
    let pipeline = standard_pipeline(8, MemoryAccessConfig::default());
    assert_eq!(
        pipeline.pass_names(),
        vec![
            "enumerate_expressions",
            "remove_redundant_convert",
            "specialize_convert",
            "memory_access_pattern_optimizer",
        ]
    );
}

#[test]
fn conversions_are_cleaned_up_and_executable() {
    let (mut program, x, y) = converting_copy();
    let bindings = [(x, vec![-2.7, 1.5, 3.9]), (y, vec![0.0; 3])];

    let mut memory = memory_with(&bindings);
    assert!(matches!(
        evaluate(&program, &mut memory),
        Err(LoweredError::Unsupported { .. })
    ));

    let totals = standard_pipeline(8, MemoryAccessConfig::default())
        .run(&mut program)
        .unwrap();
    assert!(totals.changed);
    assert_eq!(totals.erased, 1);

    assert!(!program.iter().any(|e| matches!(e.op, OpKind::Convert { .. })));
    assert_eq!(
        program
            .iter()
            .filter(|e| e.op == OpKind::ConvertTruncation { to: ElementType::I32 })
            .count(),
        1
    );
    let orders: Vec<u64> = program.iter().filter_map(|e| e.topo_order).collect();
    assert_eq!(orders.len(), program.len());
    assert!(orders.windows(2).all(|w| w[0] < w[1]));

    let mut memory = memory_with(&bindings);
    evaluate(&program, &mut memory).unwrap();
    assert_eq!(memory.data(y).unwrap(), &[-2.0, 1.0, 3.0]);
}

#[test]
fn malformed_input_is_rejected_before_any_pass() {
    let mut b = Builder::new();
    let x = b.buffer("x", BufferKind::Input);
    b.open_loop(WorkAmount::Elements(x), 1, 1);
    let mut program = b.program;

    let err = standard_pipeline(8, MemoryAccessConfig::default())
        .run(&mut program)
        .unwrap_err();
    assert!(matches!(err, LoweredError::UnclosedLoop { .. }));
}

/// Drops the first load and claims success.
struct DropFirstLoad;

impl Pass for DropFirstLoad {
    fn name(&self) -> &'static str {
        "drop_first_load"
    }

    fn run(&self, program: &mut LoweredProgram) -> Result<PassResult> {
        let Some(id) = program.iter().find(|e| e.op == OpKind::Load).map(|e| e.id) else {
            return Ok(PassResult::default());
        };
        program.remove(id)?;
        Ok(PassResult::from_counts(0, 1))
    }
}

#[test]
fn invalid_pass_output_names_the_pass() {
    let (mut program, _, _) = converting_copy();
    let mut builder = Pipeline::builder();
    builder.pass(DropFirstLoad);

    match builder.finish().run(&mut program) {
        Err(LoweredError::PassFailed { pass, source }) => {
            assert_eq!(pass, "drop_first_load");
            assert!(matches!(*source, LoweredError::DanglingPort { .. }));
        }
        other => panic!("expected pass failure, got {other:?}"),
    }
}
