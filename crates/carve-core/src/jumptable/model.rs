//! Matching a simplified branch target against known table shapes.

use crate::context::ProgramContext;
use crate::ir::address::{calc_mask, covering_mask, sign_extend};
use crate::ir::{BlockId, Function, OpCode, OpId, SeqNum, VarnodeId};
use crate::pipeline::JumpTableConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) enum TableModel {
    Table {
        destinations: Vec<u64>,
        /// The guard's out-of-range edge: (guard op, out slot of its block).
        default_edge: Option<(SeqNum, usize)>,
    },
    Thunk,
    Failed(String),
}

/// `LOAD(base + index * scale)`, optionally extended and offset.
#[derive(Debug)]
struct TableLoad {
    base: u64,
    scale: u64,
    /// The index value and the values it was copied or extended from.
    index: Vec<VarnodeId>,
    entry_size: u32,
    extension: Option<OpCode>,
    offset: u64,
    target_size: u32,
}

fn strip_copies(func: &Function, mut vn: VarnodeId) -> VarnodeId {
    while let Some(def) = func.vn(vn).def() {
        let op = func.op(def);
        match (op.opcode(), op.input(0)) {
            (OpCode::Copy, Some(src)) => vn = src,
            _ => break,
        }
    }
    vn
}

fn def_of(func: &Function, vn: VarnodeId, opcode: OpCode) -> Option<OpId> {
    func.vn(vn).def().filter(|&d| func.op(d).opcode() == opcode)
}

/// Split `op` (a commutative binary op) into (other operand, constant).
fn with_constant(func: &Function, op: OpId) -> Option<(VarnodeId, u64)> {
    let (a, b) = (func.op(op).input(0)?, func.op(op).input(1)?);
    let (a, b) = (strip_copies(func, a), strip_copies(func, b));
    match (func.vn(a).constant_value(), func.vn(b).constant_value()) {
        (None, Some(k)) => Some((a, k)),
        (Some(k), None) => Some((b, k)),
        _ => None,
    }
}

fn merge_of_constants(func: &Function, merge: OpId) -> Option<Vec<u64>> {
    func.op(merge)
        .inputs()
        .iter()
        .map(|slot| {
            let vn = strip_copies(func, (*slot)?);
            func.vn(vn).constant_value()
        })
        .collect()
}

impl TableLoad {
    fn match_target(func: &Function, target: VarnodeId) -> Option<Self> {
        let target_size = func.vn(target).size();
        let (mut vn, offset) = match def_of(func, target, OpCode::IntAdd).and_then(|add| with_constant(func, add)) {
            Some((other, k)) => (other, k),
            None => (target, 0),
        };
        let mut extension = None;
        for opcode in [OpCode::IntZext, OpCode::IntSext] {
            if let Some(ext) = def_of(func, vn, opcode) {
                extension = Some(opcode);
                vn = strip_copies(func, func.op(ext).input(0)?);
            }
        }
        let load = def_of(func, vn, OpCode::Load)?;
        let entry_size = func.vn(vn).size();
        let ptr = strip_copies(func, func.op(load).input(1)?);

        let add = def_of(func, ptr, OpCode::IntAdd)?;
        let (scaled, base) = with_constant(func, add)?;
        let (index, scale) = if let Some(mult) = def_of(func, scaled, OpCode::IntMult) {
            with_constant(func, mult)?
        } else if let Some(shift) = def_of(func, scaled, OpCode::IntLeft) {
            let amount = func.op(shift).input(1).and_then(|v| func.vn(v).constant_value())?;
            if amount >= 64 {
                return None;
            }
            (strip_copies(func, func.op(shift).input(0)?), 1u64 << amount)
        } else {
            (scaled, 1)
        };

        let mut chain = vec![index];
        let mut cur = index;
        while let Some(def) = func.vn(cur).def() {
            let op = func.op(def);
            if !matches!(op.opcode(), OpCode::Copy | OpCode::IntZext | OpCode::IntSext) {
                break;
            }
            let Some(src) = op.input(0) else { break };
            chain.push(src);
            cur = src;
        }

        Some(Self {
            base,
            scale,
            index: chain,
            entry_size,
            extension,
            offset,
            target_size,
        })
    }

    /// Number of entries and the default edge, from a dominating guard or
    /// failing that from the index's non-zero mask.
    fn bound(&self, func: &mut Function, branch: OpId, guard_depth: usize) -> Result<(u64, Option<(SeqNum, usize)>), String> {
        if let Some((count, edge)) = guard_bound(func, branch, &self.index, guard_depth) {
            return Ok((count, Some(edge)));
        }
        let mask = func.vn(self.index[0]).nz_mask();
        if mask != covering_mask(mask) {
            return Err(format!("index mask {mask:#x} does not bound a table"));
        }
        Ok((mask.saturating_add(1), None))
    }

    fn read(&self, count: u64, ctx: &ProgramContext) -> Result<Vec<u64>, String> {
        if self.entry_size == 0 || self.entry_size > 8 {
            return Err(format!("unsupported table entry size {}", self.entry_size));
        }
        let mut destinations = Vec::with_capacity(count as usize);
        for i in 0..count {
            let addr = self.base.wrapping_add(i.wrapping_mul(self.scale));
            let raw = ctx
                .image
                .read_uint(addr, self.entry_size, ctx.big_endian)
                .ok_or_else(|| format!("table entry {i} at {addr:#x} is not mapped"))?;
            let value = match self.extension {
                Some(OpCode::IntSext) => sign_extend(raw, self.entry_size),
                _ => raw,
            };
            destinations.push(value.wrapping_add(self.offset) & calc_mask(self.target_size));
        }
        Ok(destinations)
    }
}

/// Look up the idom chain of the branch's block for a CBRANCH comparing the
/// index against a constant, where exactly one side leads to the branch.
fn guard_bound(
    func: &mut Function,
    branch: OpId,
    index: &[VarnodeId],
    depth: usize,
) -> Option<(u64, (SeqNum, usize))> {
    let bb = func.op(branch).parent()?;
    let dominators: Vec<BlockId> = {
        let structure = func.blocks.structure();
        std::iter::successors(structure.idom(bb), |&d| structure.idom(d))
            .take(depth)
            .collect()
    };
    let candidates: Vec<(BlockId, Vec<BlockId>)> = dominators
        .into_iter()
        .map(|d| (d, func.block(d).outs().iter().map(|e| e.point).collect()))
        .collect();
    let guarded: Vec<(BlockId, usize)> = {
        let structure = func.blocks.structure();
        candidates
            .into_iter()
            .filter(|(_, outs)| outs.len() == 2)
            .filter_map(|(d, outs)| {
                let leads: Vec<usize> = (0..2).filter(|&k| structure.dominates(outs[k], bb)).collect();
                match leads.as_slice() {
                    [slot] => Some((d, *slot)),
                    _ => None,
                }
            })
            .collect()
    };

    for (d, slot) in guarded {
        let Some(last) = func.block(d).last_op() else {
            continue;
        };
        let cbranch = func.op(last);
        if cbranch.opcode() != OpCode::CBranch {
            continue;
        }
        let Some(cond) = cbranch.input(1) else {
            continue;
        };
        let mut in_range_when_true = (slot == 1) != cbranch.is_boolean_flip();
        let mut cond = strip_copies(func, cond);
        if let Some(neg) = def_of(func, cond, OpCode::BoolNegate) {
            let Some(inner) = func.op(neg).input(0) else {
                continue;
            };
            cond = strip_copies(func, inner);
            in_range_when_true = !in_range_when_true;
        }
        let Some(cmp) = func.vn(cond).def() else {
            continue;
        };
        let cmp_op = func.op(cmp);
        let opcode = cmp_op.opcode();
        if !matches!(opcode, OpCode::IntLess | OpCode::IntLessEqual) {
            continue;
        }
        let (Some(a), Some(b)) = (cmp_op.input(0), cmp_op.input(1)) else {
            continue;
        };
        let (a, b) = (strip_copies(func, a), strip_copies(func, b));
        let count = if index.contains(&a) {
            let Some(k) = func.vn(b).constant_value() else {
                continue;
            };
            match (opcode, in_range_when_true) {
                (OpCode::IntLess, true) => k,
                (OpCode::IntLessEqual, true) => k.saturating_add(1),
                _ => continue,
            }
        } else if index.contains(&b) {
            let Some(k) = func.vn(a).constant_value() else {
                continue;
            };
            match (opcode, in_range_when_true) {
                (OpCode::IntLess, false) => k.saturating_add(1),
                (OpCode::IntLessEqual, false) => k,
                _ => continue,
            }
        } else {
            continue;
        };
        return Some((count, (func.op(last).seq(), 1 - slot)));
    }
    None
}

/// Work out the destinations of the BRANCHIND `branch` in a simplified clone.
pub(super) fn analyze(
    func: &mut Function,
    branch: OpId,
    ctx: &ProgramContext,
    config: &JumpTableConfig,
) -> TableModel {
    let Some(target) = func.op(branch).input(0) else {
        return TableModel::Failed("branch has no target".into());
    };
    let target = strip_copies(func, target);
    let node = func.vn(target);
    if let Some(value) = node.constant_value() {
        return TableModel::Table {
            destinations: vec![value],
            default_edge: None,
        };
    }
    if node.is_input() || node.flags().return_address {
        return TableModel::Thunk;
    }
    let Some(def) = node.def() else {
        return TableModel::Failed(format!("target {} is never written", func.display_vn(target)));
    };
    if func.op(def).opcode() == OpCode::MultiEqual {
        if let Some(destinations) = merge_of_constants(func, def) {
            return TableModel::Table {
                destinations,
                default_edge: None,
            };
        }
    }

    let Some(load) = TableLoad::match_target(func, target) else {
        return TableModel::Failed(format!("target computed by {} matches no table shape", func.op(def).opcode()));
    };
    func.calc_nz_mask();
    let (count, default_edge) = match load.bound(func, branch, config.guard_depth) {
        Ok(bound) => bound,
        Err(reason) => return TableModel::Failed(reason),
    };
    if count == 0 || count > config.max_table_size as u64 {
        return TableModel::Failed(format!("table of {count} entries is out of bounds"));
    }
    tracing::trace!(base = load.base, scale = load.scale, count, "matched table load");
    match load.read(count, ctx) {
        Ok(destinations) => TableModel::Table {
            destinations,
            default_edge,
        },
        Err(reason) => TableModel::Failed(reason),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::context::MemoryImage;
    use crate::ir::{Address, FunctionBuilder};

    fn context(words: &[u64], size: u32) -> Arc<ProgramContext> {
        let image = MemoryImage::new().with_words(0x9000, size, words, false);
        Arc::new(ProgramContext::new(Arc::new(image)))
    }

    #[test]
    fn masked_index_bounds_table() {
        let ctx = context(&[0x10, 0x20, 0x30, 0x40], 4);
        let mut fb = FunctionBuilder::new("masked", 0x100).with_context(ctx.clone());
        let x = fb.input(8, Address::register(0));
        let three = fb.constant(8, 3);
        let (_, idx) = fb.binop(OpCode::IntAnd, x, three, 8);
        let sh = fb.constant(4, 2);
        let (_, off) = fb.binop(OpCode::IntLeft, idx, sh, 8);
        let base = fb.constant(8, 0x9000);
        let (_, ptr) = fb.binop(OpCode::IntAdd, base, off, 8);
        let (_, entry) = fb.load(ptr, 4);
        let (_, wide) = fb.unop(OpCode::IntZext, entry, 8);
        let k = fb.constant(8, 0x1000);
        let (_, target) = fb.binop(OpCode::IntAdd, wide, k, 8);
        let branch = fb.branchind(target);
        let mut f = fb.build();

        let model = analyze(&mut f, branch, &ctx, &JumpTableConfig::default());
        assert_eq!(
            model,
            TableModel::Table {
                destinations: vec![0x1010, 0x1020, 0x1030, 0x1040],
                default_edge: None,
            }
        );
    }

    #[test]
    fn reversed_guard_with_signed_entries() {
        let ctx = context(&[0xffff_fff0, 0x10, 0x20], 4);
        let mut fb = FunctionBuilder::new("signed", 0x100).with_context(ctx.clone());
        let x = fb.input(4, Address::register(0));
        let two = fb.constant(4, 2);
        let (_, above) = fb.binop(OpCode::IntLess, two, x, 1);
        let switch = fb.create_block_at(0x200);
        let default = fb.create_block_at(0x300);
        let guard = fb.cbranch(above, default, switch);
        fb.switch_to_block(default);
        fb.ret(None);
        fb.switch_to_block(switch);
        let (_, xz) = fb.unop(OpCode::IntZext, x, 8);
        let four = fb.constant(8, 4);
        let (_, off) = fb.binop(OpCode::IntMult, xz, four, 8);
        let base = fb.constant(8, 0x9000);
        let (_, ptr) = fb.binop(OpCode::IntAdd, off, base, 8);
        let (_, entry) = fb.load(ptr, 4);
        let (_, wide) = fb.unop(OpCode::IntSext, entry, 8);
        let rel = fb.constant(8, 0x2000);
        let (_, target) = fb.binop(OpCode::IntAdd, wide, rel, 8);
        let branch = fb.branchind(target);
        let mut f = fb.build();

        let seq = f.op(guard).seq();
        let model = analyze(&mut f, branch, &ctx, &JumpTableConfig::default());
        assert_eq!(
            model,
            TableModel::Table {
                destinations: vec![0x1ff0, 0x2010, 0x2020],
                default_edge: Some((seq, 1)),
            }
        );
    }

    #[test]
    fn unbounded_index_fails() {
        let ctx = context(&[], 8);
        let mut fb = FunctionBuilder::new("open", 0x100).with_context(ctx.clone());
        let x = fb.input(8, Address::register(0));
        let eight = fb.constant(8, 8);
        let (_, off) = fb.binop(OpCode::IntMult, x, eight, 8);
        let base = fb.constant(8, 0x9000);
        let (_, ptr) = fb.binop(OpCode::IntAdd, base, off, 8);
        let (_, target) = fb.load(ptr, 8);
        let branch = fb.branchind(target);
        let mut f = fb.build();
        assert!(matches!(
            analyze(&mut f, branch, &ctx, &JumpTableConfig::default()),
            TableModel::Failed(_)
        ));
    }

    #[test]
    fn merge_of_constant_targets() {
        let ctx = context(&[], 8);
        let mut fb = FunctionBuilder::new("merge", 0x100).with_context(ctx.clone());
        let c = fb.input(1, Address::register(0x40));
        let a = fb.create_block_at(0x200);
        let b = fb.create_block_at(0x300);
        let j = fb.create_block_at(0x400);
        fb.cbranch(c, b, a);
        fb.switch_to_block(a);
        fb.branch(j);
        fb.switch_to_block(b);
        fb.branch(j);
        fb.switch_to_block(j);
        let k1 = fb.constant(8, 0x500);
        let k2 = fb.constant(8, 0x600);
        let (_, t) = fb.multiequal(&[k1, k2], 8, Address::register(8));
        let branch = fb.branchind(t);
        let mut f = fb.build();
        assert_eq!(
            analyze(&mut f, branch, &ctx, &JumpTableConfig::default()),
            TableModel::Table {
                destinations: vec![0x500, 0x600],
                default_edge: None,
            }
        );
    }
}
