use proptest::prelude::*;
use strata_core::{CompileOptions, CompiledSubgraph, PartialShape, Subgraph};
use strata_lowered::{BinaryOp, ElementType, HostTensor, UnaryOp};

fn unary_op() -> impl Strategy<Value = UnaryOp> {
    prop::sample::select(vec![UnaryOp::Neg, UnaryOp::Abs, UnaryOp::Relu, UnaryOp::Exp, UnaryOp::Sqrt])
}

fn binary_op() -> impl Strategy<Value = BinaryOp> {
    prop::sample::select(vec![
        BinaryOp::Add,
        BinaryOp::Sub,
        BinaryOp::Mul,
        BinaryOp::Max,
        BinaryOp::Min,
    ])
}

proptest! {
    #[test]
    fn fused_chain_matches_direct_evaluation(
        chain in prop::collection::vec(unary_op(), 1..6),
        combine in binary_op(),
        constant in -4.0f32..4.0,
        data in prop::collection::vec(-8.0f32..8.0, 0..32),
    ) {
        let mut builder = Subgraph::builder();
        let x = builder.parameter("x", ElementType::F32, PartialShape::dynamic(1));
        let mut value = x;
        for op in &chain {
            value = builder.unary(*op, value).unwrap();
        }
        let c = builder.constant(constant);
        let y = builder.binary(combine, value, c).unwrap();
        builder.output("y", y).unwrap();
        let compiled = CompiledSubgraph::compile(&builder.build().unwrap(), &CompileOptions::reference()).unwrap();

        let outputs = compiled.run(&[HostTensor::new(vec![data.len()], data.clone())]).unwrap();
        let expected: Vec<u32> = data
            .iter()
            .map(|v| combine.apply(chain.iter().fold(*v, |acc, op| op.apply(acc)), constant).to_bits())
            .collect();
        let actual: Vec<u32> = outputs[0].1.data.iter().map(|v| v.to_bits()).collect();
        prop_assert_eq!(actual, expected);
    }
}
