//! Non-zero bit masks: for every varnode, the bits that may be set.
//!
//! Masks start conservative (full for computed values, exact for
//! constants) and are only ever narrowed. A first depth-first pass over the
//! data flow evaluates each op after its inputs, without following
//! loop-carried merge inputs; a worklist seeded with every merge then
//! refines until nothing changes.

use std::collections::HashSet;

use crate::error::CoreError;
use crate::ir::address::{calc_mask, covering_mask, least_sig_bit, most_sig_bit, sign_bit_set};
use crate::ir::{Function, OpCode, OpId, OpStore, ValueStore, VarnodeId};
use crate::pipeline::Transform;

/// Summary of one mask computation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NzMaskReport {
    /// Mask narrowings applied, including the first pass.
    pub updates: usize,
    /// Ops taken off the worklist.
    pub iterations: usize,
    /// Some mask differs from its value before the computation started.
    pub changed: bool,
}

/// Mask of an input slot; empty slots may hold anything.
fn input_mask(ops: &OpStore, values: &ValueStore, op: OpId, slot: usize) -> Option<u64> {
    ops[op].input(slot).map(|vn| values[vn].nz_mask())
}

fn shift_right(mask: u64, sa: u64) -> u64 {
    if sa >= 64 {
        0
    } else {
        mask >> sa
    }
}

fn shift_left(mask: u64, sa: u64) -> u64 {
    if sa >= 64 {
        0
    } else {
        mask << sa
    }
}

/// The mask of `op`'s output computed from the current masks of its inputs.
pub fn local_mask(ops: &OpStore, values: &ValueStore, op: OpId) -> u64 {
    let pcode = &ops[op];
    let Some(out) = pcode.output() else {
        return 0;
    };
    let size = values[out].size();
    let full = calc_mask(size);
    if pcode.opcode().is_boolean_output() {
        return 1;
    }
    let input = |slot: usize| input_mask(ops, values, op, slot);
    let constant = |slot: usize| pcode.input(slot).and_then(|vn| values[vn].constant_value());

    let mask = match pcode.opcode() {
        OpCode::Copy | OpCode::IntZext => input(0).unwrap_or(full),
        OpCode::IntSext => match (input(0), pcode.input(0)) {
            (Some(m), Some(vn)) => {
                let in_size = values[vn].size();
                if sign_bit_set(m, in_size) {
                    m | (full & !calc_mask(in_size))
                } else {
                    m
                }
            }
            _ => full,
        },
        OpCode::IntXor | OpCode::IntOr => match (input(0), input(1)) {
            (Some(a), Some(b)) => a | b,
            _ => full,
        },
        OpCode::IntAnd => match (input(0), input(1)) {
            (Some(a), Some(b)) => a & b,
            (Some(m), None) | (None, Some(m)) => m,
            (None, None) => full,
        },
        OpCode::IntLeft => match (input(0), constant(1)) {
            (Some(m), Some(sa)) => shift_left(m, sa),
            _ => full,
        },
        OpCode::IntRight => match (input(0), constant(1)) {
            (Some(m), Some(sa)) => shift_right(m, sa),
            _ => full,
        },
        OpCode::IntSright => match (input(0), constant(1)) {
            (Some(m), Some(sa)) if size <= 8 => {
                if sign_bit_set(m, size) {
                    shift_right(m, sa) | (shift_right(full, sa) ^ full)
                } else {
                    shift_right(m, sa)
                }
            }
            _ => full,
        },
        OpCode::IntDiv => match input(0) {
            Some(m) => {
                let cover = covering_mask(m);
                match (constant(1), input(1).and_then(most_sig_bit)) {
                    (Some(_), Some(bit)) => cover >> bit,
                    _ => cover,
                }
            }
            None => full,
        },
        OpCode::IntRem => match input(1) {
            Some(m) => covering_mask(m.wrapping_sub(1)),
            None => full,
        },
        OpCode::Popcount => match input(0) {
            Some(m) => covering_mask(u64::from(m.count_ones())),
            None => full,
        },
        OpCode::Lzcount => match pcode.input(0) {
            Some(vn) => covering_mask(u64::from(values[vn].size()) * 8),
            None => full,
        },
        OpCode::Subpiece => match (input(0), constant(1)) {
            (Some(m), Some(bytes)) => shift_right(m, bytes.saturating_mul(8)),
            _ => full,
        },
        OpCode::Piece => match (input(0), input(1), pcode.input(1)) {
            (Some(hi), Some(lo), Some(lo_vn)) => {
                shift_left(hi, u64::from(values[lo_vn].size()) * 8) | lo
            }
            _ => full,
        },
        OpCode::IntMult => match (input(0), input(1)) {
            (Some(a), Some(b)) if size <= 8 => mult_mask(a, b, size, full),
            _ => full,
        },
        OpCode::IntAdd => match (input(0), input(1)) {
            (Some(a), Some(b)) => {
                let m = a | b;
                m | (m << 1)
            }
            _ => full,
        },
        OpCode::MultiEqual => {
            if pcode.num_inputs() == 0 {
                full
            } else {
                (0..pcode.num_inputs()).fold(0, |acc, slot| acc | input(slot).unwrap_or(full))
            }
        }
        _ => full,
    };
    mask & full
}

/// Product of values confined to masks `a` and `b`: the low zero bits add,
/// and the significant widths add (minus one when either is a single bit).
fn mult_mask(a: u64, b: u64, size: u32, full: u64) -> u64 {
    let (Some(hi_a), Some(hi_b)) = (most_sig_bit(a), most_sig_bit(b)) else {
        return 0;
    };
    let lo_a = least_sig_bit(a).unwrap_or(0);
    let lo_b = least_sig_bit(b).unwrap_or(0);
    let low_zeros = lo_a + lo_b;
    let bits = 8 * size;
    if low_zeros >= bits {
        return 0;
    }
    let width_a = hi_a - lo_a + 1;
    let width_b = hi_b - lo_b + 1;
    let mut total = width_a + width_b;
    if width_a == 1 || width_b == 1 {
        total -= 1;
    }
    let mut mask = full;
    if total < bits {
        mask >>= bits - total;
    }
    (mask << low_zeros) & full
}

/// Intersect `out`'s mask with `new`; true if it narrowed.
fn narrow(
    values: &mut ValueStore,
    out: VarnodeId,
    new: u64,
    report: &mut NzMaskReport,
    observe: &mut impl FnMut(VarnodeId, u64, u64),
) -> bool {
    let old = values[out].nz_mask();
    let narrowed = old & new;
    if narrowed == old {
        return false;
    }
    observe(out, old, narrowed);
    values.node_mut(out).nz_mask = narrowed;
    report.updates += 1;
    true
}

impl Function {
    /// Recompute every varnode's non-zero mask.
    pub fn calc_nz_mask(&mut self) -> NzMaskReport {
        self.calc_nz_mask_with(|_, _, _| {})
    }

    /// Like [`Function::calc_nz_mask`], calling `observe(vn, old, new)` on
    /// every narrowing after initialisation.
    pub fn calc_nz_mask_with(&mut self, mut observe: impl FnMut(VarnodeId, u64, u64)) -> NzMaskReport {
        let mut report = NzMaskReport::default();
        let before: Vec<(VarnodeId, u64)> = self.values.iter().map(|(id, vn)| (id, vn.nz_mask())).collect();

        for &(id, _) in &before {
            let vn = &self.values[id];
            let mut mask = match vn.constant_value() {
                Some(value) => value & calc_mask(vn.size()),
                None => calc_mask(vn.size()),
            };
            if vn.is_spacebase() && !vn.is_constant() {
                mask &= !0xff;
            }
            self.values.node_mut(id).nz_mask = mask;
        }

        let structure = self.blocks.structure();
        let ops = &self.ops;
        let values = &mut self.values;

        let alive: Vec<OpId> = ops.alive().collect();
        let mut visited: HashSet<OpId> = HashSet::new();
        for &root in &alive {
            if !visited.insert(root) {
                continue;
            }
            let mut stack: Vec<(OpId, usize)> = vec![(root, 0)];
            while let Some(&(cur, slot)) = stack.last() {
                let pcode = &ops[cur];
                if slot >= pcode.num_inputs() {
                    stack.pop();
                    if let Some(out) = pcode.output() {
                        let mask = local_mask(ops, values, cur);
                        narrow(values, out, mask, &mut report, &mut observe);
                    }
                    continue;
                }
                if let Some(top) = stack.last_mut() {
                    top.1 += 1;
                }
                let loop_carried = pcode.opcode() == OpCode::MultiEqual
                    && pcode.parent().is_some_and(|bb| structure.is_back_edge(bb, slot));
                if loop_carried {
                    continue;
                }
                let Some(def) = pcode.input(slot).and_then(|vn| values[vn].def()) else {
                    continue;
                };
                if ops.is_alive(def) && visited.insert(def) {
                    stack.push((def, 0));
                }
            }
        }

        let mut worklist: Vec<OpId> = alive
            .iter()
            .copied()
            .filter(|&op| ops[op].opcode() == OpCode::MultiEqual)
            .collect();
        while let Some(op) = worklist.pop() {
            report.iterations += 1;
            let Some(out) = ops[op].output() else { continue };
            let mask = local_mask(ops, values, op);
            if narrow(values, out, mask, &mut report, &mut observe) {
                worklist.extend(values[out].descend().iter().copied().filter(|&r| ops.is_alive(r)));
            }
        }

        report.changed = before
            .iter()
            .any(|&(id, mask)| self.values[id].nz_mask() != mask);
        tracing::debug!(
            func = %self.name,
            updates = report.updates,
            iterations = report.iterations,
            "computed non-zero masks"
        );
        report
    }
}

/// Recomputes non-zero masks; reports a change when any mask moved.
pub struct NonzeroMask;

impl Transform for NonzeroMask {
    fn name(&self) -> &str {
        "nonzero-mask"
    }

    fn apply(&self, func: &mut Function) -> Result<bool, CoreError> {
        Ok(func.calc_nz_mask().changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Address, FunctionBuilder};

    #[test]
    fn and_with_constant_narrows() {
        let mut fb = FunctionBuilder::new("and", 0x100);
        let x = fb.input(4, Address::register(0));
        let k = fb.constant(4, 0xf0);
        let (_, y) = fb.binop(OpCode::IntAnd, x, k, 4);
        let two = fb.constant(4, 2);
        let (_, z) = fb.binop(OpCode::IntRight, y, two, 4);
        let (_, w) = fb.unop(OpCode::IntZext, z, 8);
        fb.ret(Some(w));
        let mut f = fb.build();
        let report = f.calc_nz_mask();
        assert!(report.changed);
        assert_eq!(f.vn(x).nz_mask(), 0xffff_ffff);
        assert_eq!(f.vn(y).nz_mask(), 0xf0);
        assert_eq!(f.vn(z).nz_mask(), 0x3c);
        assert_eq!(f.vn(w).nz_mask(), 0x3c);
    }

    #[test]
    fn comparisons_are_single_bit() {
        let mut fb = FunctionBuilder::new("cmp", 0x100);
        let x = fb.input(4, Address::register(0));
        let k = fb.constant(4, 9);
        let (_, c) = fb.binop(OpCode::IntLess, x, k, 1);
        fb.ret(Some(c));
        let mut f = fb.build();
        f.calc_nz_mask();
        assert_eq!(f.vn(c).nz_mask(), 1);
    }

    #[test]
    fn spacebase_drops_low_byte() {
        let mut fb = FunctionBuilder::new("sp", 0x100);
        let sp = fb.input(8, Address::register(0x20));
        fb.func_mut().vn_flags_mut(sp).spacebase = true;
        fb.ret(Some(sp));
        let mut f = fb.build();
        f.calc_nz_mask();
        assert_eq!(f.vn(sp).nz_mask(), !0xff);
    }

    #[test]
    fn mult_and_add_masks() {
        assert_eq!(mult_mask(0b11, 0b100, 4, 0xffff_ffff), 0b1100);
        assert_eq!(mult_mask(0, 0xff, 4, 0xffff_ffff), 0);
        let mut fb = FunctionBuilder::new("add", 0x100);
        let x = fb.input(1, Address::register(0));
        let (_, xz) = fb.unop(OpCode::IntZext, x, 4);
        let one = fb.constant(4, 1);
        let (_, s) = fb.binop(OpCode::IntAdd, xz, one, 4);
        fb.ret(Some(s));
        let mut f = fb.build();
        f.calc_nz_mask();
        assert_eq!(f.vn(s).nz_mask(), 0x1ff);
    }

    #[test]
    fn loop_masks_only_narrow_and_terminate() {
        // entry -> head; head: i = merge(0, i2); i2 = (i + 1) & 7; cbranch back.
        let mut fb = FunctionBuilder::new("loop", 0x100);
        let head = fb.create_block_at(0x200);
        let exit = fb.create_block_at(0x300);
        let zero = fb.constant(4, 0);
        let (_, i0) = fb.op_to(OpCode::Copy, &[zero], 4, Address::register(8));
        fb.branch(head);
        fb.switch_to_block(head);
        let (phi, i) = fb.multiequal(&[i0, i0], 4, Address::register(8));
        let one = fb.constant(4, 1);
        let (_, inc) = fb.binop(OpCode::IntAdd, i, one, 4);
        let seven = fb.constant(4, 7);
        let (_, i2) = fb.op_to(OpCode::IntAnd, &[inc, seven], 4, Address::register(8));
        let x = fb.input(1, Address::register(0x40));
        fb.cbranch(x, head, exit);
        fb.switch_to_block(exit);
        fb.ret(Some(i));
        let mut f = fb.build();
        // Feed the back edge with i2 instead of the placeholder.
        f.op_set_input(phi, i2, 1).unwrap();
        assert!(f.verify().is_ok());

        let mut narrowings = 0;
        let report = f.calc_nz_mask_with(|_, old, new| {
            assert_eq!(new & !old, 0, "mask widened");
            assert_ne!(old, new);
            narrowings += 1;
        });
        assert_eq!(report.updates, narrowings);
        assert_eq!(f.vn(i2).nz_mask(), 7);
        assert_eq!(f.vn(i).nz_mask(), 7);

        // A second run from scratch reaches the same masks.
        let again = f.calc_nz_mask();
        assert!(!again.changed);
        assert_eq!(f.vn(i).nz_mask(), 7);
    }
}
