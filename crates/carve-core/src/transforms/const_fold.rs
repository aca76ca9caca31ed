use crate::error::CoreError;
use crate::ir::{EvalType, Function, OpCode, OpId};
use crate::pipeline::Transform;

use super::util::{constant_input, eval_binary, eval_unary, fold_to_constant};

/// Constant folding transform: an op whose inputs are all constants, or
/// whose output is known to be zero, becomes a COPY of the result.
pub struct ConstantFolding;

/// The constant `op` computes, if it can be known without running it.
fn fold_value(func: &Function, op: OpId) -> Option<u64> {
    let pcode = func.op(op);
    let out = pcode.output()?;
    let out_size = func.vn(out).size();
    let opcode = pcode.opcode();

    if opcode == OpCode::Copy && constant_input(func, op, 0).is_some() {
        return None;
    }
    if !opcode.has_side_effects() && opcode != OpCode::Load && func.vn(out).nz_mask() == 0 {
        return Some(0);
    }

    let in_size = |slot: usize| pcode.input(slot).map(|vn| func.vn(vn).size());
    match opcode.eval_type() {
        EvalType::Unary => {
            let a = constant_input(func, op, 0)?;
            eval_unary(opcode, a, in_size(0)?, out_size)
        }
        EvalType::Binary => {
            let a = constant_input(func, op, 0)?;
            let b = constant_input(func, op, 1)?;
            eval_binary(opcode, a, b, in_size(0)?, out_size)
        }
        EvalType::Special => match opcode {
            OpCode::MultiEqual => {
                let mut values = (0..pcode.num_inputs()).map(|slot| constant_input(func, op, slot));
                let first = values.next()??;
                values.all(|v| v == Some(first)).then_some(first)
            }
            OpCode::Piece => {
                let hi = constant_input(func, op, 0)?;
                let lo = constant_input(func, op, 1)?;
                let shift = 8 * in_size(1)?;
                (shift < 64).then(|| (hi << shift) | lo)
            }
            OpCode::Subpiece => {
                let value = constant_input(func, op, 0)?;
                let bytes = constant_input(func, op, 1)?;
                Some(if bytes >= 8 { 0 } else { value >> (8 * bytes) })
            }
            _ => None,
        },
    }
}

impl Transform for ConstantFolding {
    fn name(&self) -> &str {
        "constant-folding"
    }

    fn apply(&self, func: &mut Function) -> Result<bool, CoreError> {
        let mut changed = false;
        let ops: Vec<OpId> = func.ops().alive().collect();
        for op in ops {
            if !func.ops().contains(op) {
                continue;
            }
            if let Some(value) = fold_value(func, op) {
                tracing::trace!(func = %func.name, op = %op, value, "folded");
                fold_to_constant(func, op, value)?;
                changed = true;
            }
        }
        Ok(changed)
    }
}
