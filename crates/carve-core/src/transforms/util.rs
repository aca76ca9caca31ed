use crate::error::CoreError;
use crate::ir::address::{calc_mask, sign_extend};
use crate::ir::{Function, OpCode, OpId, VarnodeId};

/// Value of input `slot` of `op` if it is a constant.
pub fn constant_input(func: &Function, op: OpId, slot: usize) -> Option<u64> {
    func.op(op).input(slot).and_then(|vn| func.vn(vn).constant_value())
}

/// True if `op` may be deleted once its output is unread.
pub fn is_removable(func: &Function, op: OpId) -> bool {
    let pcode = func.op(op);
    if pcode.opcode().has_side_effects() || pcode.opcode() == OpCode::Load {
        return false;
    }
    match pcode.output() {
        Some(out) => {
            let vn = func.vn(out);
            !vn.is_addr_tied() && !vn.is_persist() && vn.has_no_descend()
        }
        None => false,
    }
}

/// Output storage that other code may observe, so reads of it cannot be
/// redirected to another value.
pub fn is_pinned(func: &Function, vn: VarnodeId) -> bool {
    let node = func.vn(vn);
    node.is_addr_tied() || node.is_persist()
}

fn signed(value: u64, size: u32) -> i64 {
    sign_extend(value, size) as i64
}

/// Evaluate a unary op on a constant.
pub fn eval_unary(opcode: OpCode, a: u64, in_size: u32, out_size: u32) -> Option<u64> {
    let in_mask = calc_mask(in_size);
    let a = a & in_mask;
    let value = match opcode {
        OpCode::Copy | OpCode::IntZext => a,
        OpCode::IntSext => sign_extend(a, in_size),
        OpCode::IntNegate => !a,
        OpCode::Int2Comp => a.wrapping_neg(),
        OpCode::BoolNegate => u64::from(a & 1 == 0),
        OpCode::Popcount => u64::from(a.count_ones()),
        OpCode::Lzcount => u64::from((a.leading_zeros()).saturating_sub(64 - 8 * in_size.min(8))),
        _ => return None,
    };
    Some(value & calc_mask(out_size))
}

/// Evaluate a binary op on constants. Division by zero does not fold.
pub fn eval_binary(opcode: OpCode, a: u64, b: u64, in_size: u32, out_size: u32) -> Option<u64> {
    let in_mask = calc_mask(in_size);
    let a = a & in_mask;
    let bits = 8 * u64::from(in_size.min(8));
    let value = match opcode {
        OpCode::IntAdd => a.wrapping_add(b),
        OpCode::IntSub => a.wrapping_sub(b),
        OpCode::IntMult => a.wrapping_mul(b),
        OpCode::IntDiv => a.checked_div(b)?,
        OpCode::IntRem => a.checked_rem(b)?,
        OpCode::IntSdiv => signed(a, in_size).checked_div(signed(b, in_size))? as u64,
        OpCode::IntSrem => signed(a, in_size).checked_rem(signed(b, in_size))? as u64,
        OpCode::IntAnd => a & b,
        OpCode::IntOr => a | b,
        OpCode::IntXor => a ^ b,
        OpCode::IntLeft => {
            if b >= bits {
                0
            } else {
                a << b
            }
        }
        OpCode::IntRight => {
            if b >= bits {
                0
            } else {
                a >> b
            }
        }
        OpCode::IntSright => {
            let s = signed(a, in_size);
            (s >> b.min(63)) as u64
        }
        OpCode::IntEqual => u64::from(a == b),
        OpCode::IntNotEqual => u64::from(a != b),
        OpCode::IntLess => u64::from(a < b),
        OpCode::IntLessEqual => u64::from(a <= b),
        OpCode::IntSless => u64::from(signed(a, in_size) < signed(b, in_size)),
        OpCode::IntSlessEqual => u64::from(signed(a, in_size) <= signed(b, in_size)),
        OpCode::IntCarry => u64::from(a.wrapping_add(b) & in_mask < a),
        OpCode::BoolAnd => a & b & 1,
        OpCode::BoolOr => (a | b) & 1,
        OpCode::BoolXor => (a ^ b) & 1,
        _ => return None,
    };
    Some(value & calc_mask(out_size))
}

/// Turn `op` into `COPY #value`, dropping constant inputs left unread.
pub fn fold_to_constant(func: &mut Function, op: OpId, value: u64) -> Result<(), CoreError> {
    let Some(out) = func.op(op).output() else {
        return Ok(());
    };
    let size = func.vn(out).size();
    let old: Vec<VarnodeId> = func.op(op).inputs().iter().flatten().copied().collect();
    let k = func.new_constant(size, value);
    func.op_set_all_input(op, &[k])?;
    func.op_set_opcode(op, OpCode::Copy)?;
    for vn in old {
        if func.values().get(vn).is_some_and(|n| n.is_constant() && n.has_no_descend()) {
            func.destroy_varnode(vn)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evaluation_respects_sizes() {
        assert_eq!(eval_binary(OpCode::IntAdd, 0xff, 1, 1, 1), Some(0));
        assert_eq!(eval_binary(OpCode::IntSless, 0x80, 1, 1, 1), Some(1));
        assert_eq!(eval_binary(OpCode::IntLess, 0x80, 1, 1, 1), Some(0));
        assert_eq!(eval_binary(OpCode::IntDiv, 4, 0, 4, 4), None);
        assert_eq!(eval_binary(OpCode::IntSright, 0x8000_0000, 4, 4, 4), Some(0xf800_0000));
        assert_eq!(eval_unary(OpCode::IntSext, 0xfe, 1, 4), Some(0xffff_fffe));
        assert_eq!(eval_unary(OpCode::Lzcount, 1, 4, 4), Some(31));
    }
}
