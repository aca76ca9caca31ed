//! The disposable clone a jump-table recovery simplifies.
//!
//! Only blocks that can reach the branch are copied. Ops keep their
//! sequence numbers, so the branch is found again in the clone with
//! `OpStore::find`, and edges keep their slot order so merges line up.
//! Flow leaving the copied set ends in one block holding an artificial halt.

use crate::entity::SecondaryMap;
use crate::error::CoreError;
use crate::ir::{BlockEdge, BlockId, Function, HaltKind, OpCode, OpId, VarnodeId};

struct CloneBuilder<'a> {
    src: &'a Function,
    dst: Function,
    branch: OpId,
    blocks: SecondaryMap<BlockId, BlockId>,
    values: SecondaryMap<VarnodeId, VarnodeId>,
    halt: Option<BlockId>,
}

/// Clone the part of `func` that can reach the BRANCHIND `op`. `None` if
/// the entry is not among those blocks.
pub(super) fn build(func: &Function, op: OpId) -> Result<Option<Function>, CoreError> {
    let (Some(bb), Some(entry)) = (func.ops[op].parent(), func.blocks.entry()) else {
        return Ok(None);
    };
    let mut reach: SecondaryMap<BlockId, ()> = SecondaryMap::new();
    reach.insert(bb, ());
    let mut stack = vec![bb];
    while let Some(b) = stack.pop() {
        for e in func.blocks[b].ins() {
            if !reach.contains_key(e.point) {
                reach.insert(e.point, ());
                stack.push(e.point);
            }
        }
    }
    if !reach.contains_key(entry) {
        return Ok(None);
    }
    let kept: Vec<BlockId> = func
        .blocks
        .ids()
        .iter()
        .copied()
        .filter(|&b| reach.contains_key(b))
        .collect();

    let mut dst = Function::new(format!("{}@{:#x}", func.name, func.ops[op].addr()), func.entry_addr);
    dst.context = func.context.clone();
    dst.state.jumptable_recovery = true;
    let mut builder = CloneBuilder {
        src: func,
        dst,
        branch: op,
        blocks: SecondaryMap::new(),
        values: SecondaryMap::new(),
        halt: None,
    };
    builder.copy_blocks(&kept, entry)?;
    builder.copy_ops(&kept)?;
    builder.finish_halt()?;
    tracing::debug!(
        func = %func.name,
        op = %op,
        blocks = kept.len(),
        ops = builder.dst.ops.len(),
        "built partial clone"
    );
    Ok(Some(builder.dst))
}

impl CloneBuilder<'_> {
    fn bad(&self, reason: impl Into<String>) -> CoreError {
        CoreError::BadPartialClone {
            op: self.branch,
            reason: reason.into(),
        }
    }

    fn block(&self, b: BlockId) -> Result<BlockId, CoreError> {
        self.blocks
            .get(b)
            .copied()
            .ok_or_else(|| self.bad(format!("{b} is outside the clone")))
    }

    fn copy_blocks(&mut self, kept: &[BlockId], entry: BlockId) -> Result<(), CoreError> {
        let src = self.src;
        for &b in kept {
            let nb = self.dst.blocks.new_block(src.blocks[b].range());
            self.blocks.insert(b, nb);
        }
        let new_entry = self.block(entry)?;
        self.dst.blocks.set_entry(new_entry);

        for &b in kept {
            let nb = self.block(b)?;
            let mut outs = Vec::new();
            for (slot, e) in src.blocks[b].outs().iter().enumerate() {
                match self.blocks.get(e.point) {
                    Some(&target) => outs.push(BlockEdge {
                        point: target,
                        rev: e.rev,
                    }),
                    None => {
                        let halt = match self.halt {
                            Some(h) => h,
                            None => {
                                let h = self.dst.blocks.new_block(None);
                                self.halt = Some(h);
                                h
                            }
                        };
                        let halt_ins = &mut self.dst.blocks.block_mut(halt).ins;
                        halt_ins.push(BlockEdge { point: nb, rev: slot });
                        outs.push(BlockEdge {
                            point: halt,
                            rev: halt_ins.len() - 1,
                        });
                    }
                }
            }
            // Every predecessor of a kept block is kept, so in slots carry over.
            let ins = src.blocks[b]
                .ins()
                .iter()
                .map(|e| {
                    Ok(BlockEdge {
                        point: self.block(e.point)?,
                        rev: e.rev,
                    })
                })
                .collect::<Result<Vec<_>, CoreError>>()?;
            let block = self.dst.blocks.block_mut(nb);
            block.outs = outs;
            block.ins = ins;
        }
        self.dst.blocks.mark_dirty();
        Ok(())
    }

    /// The clone of `vn` as read by an op. Constants are fresh per read.
    fn value(&mut self, vn: VarnodeId) -> Result<VarnodeId, CoreError> {
        if let Some(&mapped) = self.values.get(vn) {
            return Ok(mapped);
        }
        let src = self.src;
        let node = &src.values[vn];
        let mut flags = node.flags().clone();
        if let Some(value) = node.constant_value() {
            let k = self.dst.new_constant(node.size(), value);
            *self.dst.vn_flags_mut(k) = flags;
            return Ok(k);
        }
        let is_input = node.is_input();
        flags.input = false;
        let mut copy = self.dst.new_varnode(node.size(), node.loc());
        *self.dst.vn_flags_mut(copy) = flags;
        if is_input {
            copy = self.dst.set_input_varnode(copy)?;
        }
        self.values.insert(vn, copy);
        Ok(copy)
    }

    fn copy_ops(&mut self, kept: &[BlockId]) -> Result<(), CoreError> {
        let src = self.src;
        let mut pairs: Vec<(OpId, OpId)> = Vec::new();
        for &b in kept {
            let nb = self.block(b)?;
            for &op in src.blocks[b].ops() {
                let pcode = &src.ops[op];
                let copy = self
                    .dst
                    .new_op_with_seq(pcode.opcode(), pcode.num_inputs(), pcode.seq());
                *self.dst.op_flags_mut(copy) = pcode.flags().clone();
                if let Some(out) = pcode.output() {
                    let node = &src.values[out];
                    let flags = node.flags().clone();
                    let new_out = self.dst.new_varnode_out(node.size(), node.loc(), copy)?;
                    *self.dst.vn_flags_mut(new_out) = flags;
                    self.values.insert(out, new_out);
                }
                if let Some(spec) = src.call_spec(op) {
                    self.dst.register_call(copy, spec.target)?;
                    for trial in &spec.trials {
                        self.dst.add_param_trial(copy, *trial)?;
                    }
                }
                self.dst.op_insert_end(copy, nb)?;
                pairs.push((op, copy));
            }
        }
        for (op, copy) in pairs {
            for (slot, vn) in src.ops[op].inputs().iter().enumerate() {
                if let Some(vn) = *vn {
                    let mapped = self.value(vn)?;
                    self.dst.op_set_input(copy, mapped, slot)?;
                }
            }
        }
        Ok(())
    }

    /// Fill the halt block, created on demand, with its RETURN.
    fn finish_halt(&mut self) -> Result<(), CoreError> {
        let Some(halt) = self.halt else {
            return Ok(());
        };
        let pc = self.src.ops[self.branch].addr();
        let ret = self.dst.new_op(OpCode::Return, 0, pc);
        self.dst.op_flags_mut(ret).halt = Some(HaltKind::Artificial);
        self.dst.op_insert_end(ret, halt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Address, FunctionBuilder};

    #[test]
    fn clone_keeps_backward_flow_and_sequence_numbers() {
        let mut fb = FunctionBuilder::new("pc", 0x100);
        let c = fb.input(1, Address::register(0x40));
        let x = fb.input(8, Address::register(0));
        let left = fb.create_block_at(0x200);
        let right = fb.create_block_at(0x300);
        let join = fb.create_block_at(0x400);
        let after = fb.create_block_at(0x500);
        fb.cbranch(c, right, left);
        fb.switch_to_block(left);
        let (_, a) = fb.op_to(OpCode::Copy, &[x], 8, Address::register(8));
        fb.branch(join);
        fb.switch_to_block(right);
        let k = fb.constant(8, 4);
        let (_, b) = fb.op_to(OpCode::IntAdd, &[x, k], 8, Address::register(8));
        fb.cbranch(c, join, after);
        fb.switch_to_block(join);
        let (_, m) = fb.multiequal(&[a, b], 8, Address::register(8));
        let branch = fb.branchind(m);
        fb.switch_to_block(after);
        fb.ret(None);
        let f = fb.build();

        let clone = build(&f, branch).unwrap().unwrap();
        assert!(clone.state().jumptable_recovery);
        // entry, left, right, join, and the halt block
        assert_eq!(clone.blocks().len(), 5);
        let copy = clone.ops().find(f.op(branch).seq()).unwrap();
        assert_eq!(clone.op(copy).opcode(), OpCode::BranchInd);

        let halts: Vec<OpId> = clone
            .ops()
            .alive()
            .filter(|&o| clone.op(o).flags().halt == Some(HaltKind::Artificial))
            .collect();
        assert_eq!(halts.len(), 1);
        let halt_block = clone.op(halts[0]).parent().unwrap();
        assert_eq!(clone.block(halt_block).size_in(), 1);

        // The merge reads its inputs in the same slot order as the original.
        let join_copy = clone.op(copy).parent().unwrap();
        let merge = clone.merges_of(join_copy)[0];
        let first = clone.op(merge).input(0).unwrap();
        let def = clone.vn(first).def().unwrap();
        assert_eq!(clone.op(def).opcode(), OpCode::Copy);
        assert!(clone.verify().is_ok());

        // The original is untouched.
        assert!(f.verify().is_ok());
        assert!(!f.state().jumptable_recovery);
    }

    #[test]
    fn entry_outside_backward_flow_gives_none() {
        let mut fb = FunctionBuilder::new("island", 0x100);
        fb.ret(None);
        let island = fb.create_block_at(0x200);
        fb.switch_to_block(island);
        let x = fb.input(8, Address::register(0));
        let branch = fb.branchind(x);
        let f = fb.build();
        assert!(build(&f, branch).unwrap().is_none());
    }
}
