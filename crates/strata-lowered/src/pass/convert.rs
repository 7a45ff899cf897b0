//! Conversion clean-up: drop identity conversions and specialize the rest.

use crate::error::{LoweredError, Result};
use crate::ids::ExprId;
use crate::op::OpKind;
use crate::pass::{Pass, PassResult};
use crate::program::LoweredProgram;

/// Removes conversions whose destination type equals their input type.
#[derive(Debug, Default, Clone, Copy)]
pub struct RemoveRedundantConvertPass;

impl RemoveRedundantConvertPass {
    const NAME: &'static str = "remove_redundant_convert";
}

impl Pass for RemoveRedundantConvertPass {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn run(&self, program: &mut LoweredProgram) -> Result<PassResult> {
        let redundant: Vec<ExprId> = program
            .iter()
            .filter(|expr| {
                let Some(target) = expr.op.convert_target() else {
                    return false;
                };
                expr.inputs.first().is_some_and(|input| {
                    program
                        .get(input.producer)
                        .and_then(|producer| producer.outputs.get(input.port))
                        .is_some_and(|out| out.element_type == target)
                })
            })
            .map(|expr| expr.id)
            .collect();

        if redundant.is_empty() {
            return Ok(PassResult::default());
        }

        program.transaction(|p| {
            for id in &redundant {
                let convert = p.remove(*id)?;
                let source = *convert
                    .inputs
                    .first()
                    .ok_or_else(|| LoweredError::malformed(*id, "conversion without input"))?;
                p.replace_uses(*id, 0, source);
            }
            Ok(())
        })?;

        tracing::debug!(removed = redundant.len(), "redundant_converts_removed");
        Ok(PassResult::from_counts(0, redundant.len()))
    }
}

/// Rewrites generic `Convert` into `ConvertTruncation`, the form backends implement.
#[derive(Debug, Default, Clone, Copy)]
pub struct SpecializeConvertPass;

impl SpecializeConvertPass {
    const NAME: &'static str = "specialize_convert";
}

impl Pass for SpecializeConvertPass {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn run(&self, program: &mut LoweredProgram) -> Result<PassResult> {
        let mut rewritten = 0;
        for expr in program.iter_mut() {
            if let OpKind::Convert { to } = expr.op {
                expr.op = OpKind::ConvertTruncation { to };
                rewritten += 1;
            }
        }
        Ok(PassResult::from_counts(rewritten, 0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::ElementType;
    use crate::expression::{Expression, OutputPort};
    use crate::op::UnaryOp;

    fn chain(target: ElementType) -> (LoweredProgram, ExprId, ExprId, ExprId) {
        let mut program = LoweredProgram::new();
        let scalar = program.new_expr_id();
        let t0 = program.new_tensor();
        program.push(
            Expression::new(scalar, OpKind::Scalar { value: 3.7 }).with_output(OutputPort::new(t0, ElementType::F32)),
        );
        let convert = program.new_expr_id();
        let t1 = program.new_tensor();
        let input = program.get(scalar).and_then(|e| e.output(0)).unwrap();
        program.push(
            Expression::new(convert, OpKind::Convert { to: target })
                .with_input(input)
                .with_output(OutputPort::new(t1, target)),
        );
        let neg = program.new_expr_id();
        let t2 = program.new_tensor();
        let input = program.get(convert).and_then(|e| e.output(0)).unwrap();
        program.push(
            Expression::new(neg, OpKind::Unary(UnaryOp::Neg))
                .with_input(input)
                .with_output(OutputPort::new(t2, target)),
        );
        (program, scalar, convert, neg)
    }

    #[test]
    fn identity_convert_is_removed_and_uses_rewired() {
        let (mut program, scalar, convert, neg) = chain(ElementType::F32);
        let result = RemoveRedundantConvertPass.run(&mut program).unwrap();
        assert_eq!(result.erased, 1);
        assert!(program.get(convert).is_none());
        assert_eq!(program.get(neg).unwrap().inputs[0].producer, scalar);
        assert!(!RemoveRedundantConvertPass.run(&mut program).unwrap().changed);
    }

    #[test]
    fn narrowing_convert_is_kept_and_specialized() {
        let (mut program, _, convert, _) = chain(ElementType::I8);
        assert!(!RemoveRedundantConvertPass.run(&mut program).unwrap().changed);

        let result = SpecializeConvertPass.run(&mut program).unwrap();
        assert_eq!(result.rewrites_applied, 1);
        assert_eq!(
            program.get(convert).unwrap().op,
            OpKind::ConvertTruncation { to: ElementType::I8 }
        );
        assert!(!SpecializeConvertPass.run(&mut program).unwrap().changed);
    }
}
