//! Control-flow surgery: removing branches and blocks, splitting blocks,
//! and repairing the MULTIEQUALs that depend on the edited edges.
//!
//! A MULTIEQUAL in block B has one input per in-edge of B, in edge order.
//! Every routine here restores that before returning. Checks that can
//! fail run before the first mutation.

use std::collections::HashSet;

use crate::entity::SecondaryMap;
use crate::error::CoreError;

use super::block::BlockId;
use super::func::Function;
use super::op::OpId;
use super::opcode::OpCode;
use super::varnode::VarnodeId;

/// Value substituted for reads of a value whose defining block was removed.
pub const POISON: u64 = 0xBADDEF;

/// What a control-flow edit did. The block structure is already marked
/// dirty when this is returned; dominance is recomputed on the next query.
#[must_use]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CfgEdit {
    pub blocks_removed: Vec<BlockId>,
    pub blocks_added: Vec<BlockId>,
    pub edges_removed: usize,
    pub edges_added: usize,
    pub ops_destroyed: usize,
    /// Merges reduced to COPY after losing inputs.
    pub merges_collapsed: usize,
    /// Reads redirected to the poison constant.
    pub poisoned_reads: usize,
}

impl CfgEdit {
    pub fn is_empty(&self) -> bool {
        *self == CfgEdit::default()
    }

    pub fn absorb(&mut self, other: CfgEdit) {
        self.blocks_removed.extend(other.blocks_removed);
        self.blocks_added.extend(other.blocks_added);
        self.edges_removed += other.edges_removed;
        self.edges_added += other.edges_added;
        self.ops_destroyed += other.ops_destroyed;
        self.merges_collapsed += other.merges_collapsed;
        self.poisoned_reads += other.poisoned_reads;
    }
}

impl Function {
    /// MULTIEQUALs of `bb`, snapshotted. Panics if `bb` was removed.
    pub fn merges_of(&self, bb: BlockId) -> Vec<OpId> {
        self.blocks[bb]
            .ops()
            .iter()
            .copied()
            .filter(|&op| self.ops[op].opcode() == OpCode::MultiEqual)
            .collect()
    }

    /// Collapse a merge left with fewer than two inputs. One input makes it
    /// a COPY. With no input, or only its own output, it becomes a COPY of
    /// the function input at its storage. Merges flagged `no_collapse` are
    /// left as they are. Returns true if the op changed.
    pub fn zero_multi(&mut self, op: OpId) -> Result<bool, CoreError> {
        let pcode = self.op_checked(op)?;
        if pcode.opcode() != OpCode::MultiEqual || pcode.flags().no_collapse {
            return Ok(false);
        }
        let (num_inputs, first, output) = (pcode.num_inputs(), pcode.input(0), pcode.output());
        if num_inputs > 1 {
            return Ok(false);
        }
        let Some(out) = output else {
            return Err(self.violation(CoreError::Invariant(format!(
                "merge {op} has no output"
            ))));
        };
        if first.is_none() || first == Some(out) {
            let (size, loc) = (self.values[out].size(), self.values[out].loc());
            let input = self.find_or_create_input(size, loc)?;
            if num_inputs == 0 {
                self.op_insert_input(op, input, 0)?;
            } else {
                self.op_set_input(op, input, 0)?;
            }
        }
        self.op_set_opcode(op, OpCode::Copy)?;
        Ok(true)
    }

    fn check_out_slot(&mut self, bb: BlockId, slot: usize) -> Result<(), CoreError> {
        self.check_block(bb)?;
        if slot >= self.blocks[bb].size_out() {
            return Err(self.violation(CoreError::BadEdge {
                block: bb,
                slot,
                reason: format!("block has {} out edge(s)", self.blocks[bb].size_out()),
            }));
        }
        Ok(())
    }

    /// Cut out edge `slot` of `bb` and drop the matching input of every merge
    /// in the target.
    fn branch_remove_internal(&mut self, bb: BlockId, slot: usize, edit: &mut CfgEdit) -> Result<(), CoreError> {
        let target = self.blocks[bb].outs()[slot].point;
        let in_slot = self.blocks[bb].outs()[slot].rev;
        let merges = self.merges_of(target);
        for &m in &merges {
            self.op_remove_input(m, in_slot)?;
        }
        self.blocks.remove_edge(bb, slot);
        edit.edges_removed += 1;
        for m in merges {
            if self.zero_multi(m)? {
                edit.merges_collapsed += 1;
            }
        }
        Ok(())
    }

    /// Remove out edge `slot` of `bb`. A block left with a single exit loses
    /// its CBRANCH.
    pub fn remove_branch(&mut self, bb: BlockId, slot: usize) -> Result<CfgEdit, CoreError> {
        self.check_out_slot(bb, slot)?;
        let mut edit = CfgEdit::default();
        if self.blocks[bb].size_out() == 2 {
            if let Some(last) = self.blocks[bb].last_op() {
                if self.ops[last].opcode() == OpCode::CBranch {
                    self.op_destroy(last)?;
                    edit.ops_destroyed += 1;
                }
            }
        }
        self.branch_remove_internal(bb, slot, &mut edit)?;
        tracing::trace!(block = %bb, slot, "removed branch");
        Ok(edit)
    }

    /// Readers of values defined in `bb` that live outside `bb`, as
    /// (value, reader, slot).
    fn escaping_reads(&self, bb: BlockId) -> Vec<(VarnodeId, OpId, usize)> {
        let mut out = Vec::new();
        for &op in self.blocks[bb].ops() {
            let Some(v) = self.ops[op].output() else { continue };
            for (reader, slot) in self.read_slots(v) {
                if self.ops[reader].parent() != Some(bb) {
                    out.push((v, reader, slot));
                }
            }
        }
        out
    }

    /// True if `reader` is a merge in a successor of `bb` reading along an
    /// edge from `bb`.
    fn is_merge_read_from(&self, bb: BlockId, reader: OpId, slot: usize) -> bool {
        let pcode = &self.ops[reader];
        if pcode.opcode() != OpCode::MultiEqual {
            return false;
        }
        let Some(parent) = pcode.parent() else {
            return false;
        };
        self.blocks[parent].in_block(slot) == Some(bb)
    }

    /// Remove `bb` and every op in it.
    ///
    /// With `unreachable` false, flow through `bb` is preserved: its
    /// predecessors are connected straight to its single successor and the
    /// successor's merges are extended to match. Values defined in `bb` may
    /// only escape through those merges.
    ///
    /// With `unreachable` true, all edges are cut. Reads outside the block of
    /// values it defined are redirected to the poison constant, with a
    /// warning.
    pub fn remove_block(&mut self, bb: BlockId, unreachable: bool) -> Result<CfgEdit, CoreError> {
        self.check_block(bb)?;
        let mut edit = CfgEdit::default();
        let is_entry = self.blocks.entry() == Some(bb);

        if unreachable {
            if is_entry {
                return Err(self.violation(CoreError::UnsoundBlockRemoval {
                    block: bb,
                    reason: "the entry block is reachable".into(),
                }));
            }
        } else {
            self.check_reachable_removal(bb)?;
        }

        if let Some(last) = self.blocks[bb].last_op() {
            if self.ops[last].opcode() == OpCode::BranchInd {
                self.remove_jump_table(last);
            }
        }

        if unreachable {
            while self.blocks[bb].size_out() > 0 {
                let slot = self.blocks[bb].size_out() - 1;
                self.branch_remove_internal(bb, slot, &mut edit)?;
            }
            while let Some(e) = self.blocks[bb].ins().last().copied() {
                edit.absorb(self.remove_branch(e.point, e.rev)?);
            }
        } else {
            self.splice_out(bb, is_entry, &mut edit)?;
        }

        self.destroy_block_ops(bb, unreachable, &mut edit)?;
        self.blocks.remove_block(bb);
        edit.blocks_removed.push(bb);
        tracing::debug!(func = %self.name, block = %bb, unreachable, "removed block");
        Ok(edit)
    }

    fn check_reachable_removal(&mut self, bb: BlockId) -> Result<(), CoreError> {
        let block = &self.blocks[bb];
        let fail = |reason: String| CoreError::UnsoundBlockRemoval { block: bb, reason };
        if block.size_out() > 1 {
            let err = fail(format!("{} successors", block.size_out()));
            return Err(self.violation(err));
        }
        if block.outs().iter().chain(block.ins()).any(|e| e.point == bb) {
            return Err(self.violation(fail("block loops to itself".into())));
        }
        if self.blocks.entry() == Some(bb) && block.size_out() == 0 {
            return Err(self.violation(fail("entry block has no successor".into())));
        }
        let succ_slot = block.outs().first().map(|e| e.rev);
        for (v, reader, slot) in self.escaping_reads(bb) {
            let defined_by_merge = self.values[v]
                .def()
                .is_some_and(|d| self.ops[d].opcode() == OpCode::MultiEqual);
            let ok = defined_by_merge
                && self.is_merge_read_from(bb, reader, slot)
                && Some(slot) == succ_slot;
            if !ok {
                let err = fail(format!("{v} is still read by {reader} outside the block"));
                return Err(self.violation(err));
            }
        }
        if let Some(succ) = block.out_block(0) {
            let s = succ_slot.unwrap_or_default();
            for m in self.merges_of(succ) {
                if self.ops[m].input(s).is_none() {
                    let err = fail(format!("merge {m} has no input along the removed edge"));
                    return Err(self.violation(err));
                }
            }
            for m in self.merges_of(bb) {
                if self.ops[m].inputs().iter().any(Option::is_none) {
                    let err = fail(format!("merge {m} has an empty input"));
                    return Err(self.violation(err));
                }
            }
        }
        Ok(())
    }

    /// Reconnect the predecessors of `bb` to its successor, keeping the
    /// successor's merges in step with its new in-edges.
    fn splice_out(&mut self, bb: BlockId, is_entry: bool, edit: &mut CfgEdit) -> Result<(), CoreError> {
        let Some(out) = self.blocks[bb].outs().first().copied() else {
            while let Some(e) = self.blocks[bb].ins().last().copied() {
                edit.absorb(self.remove_branch(e.point, e.rev)?);
            }
            return Ok(());
        };
        let (succ, succ_slot) = (out.point, out.rev);
        let size_in = self.blocks[bb].size_in();

        let mut feeds: Vec<(OpId, Vec<VarnodeId>)> = Vec::new();
        for m in self.merges_of(succ) {
            let Some(dead) = self.ops[m].input(succ_slot) else { continue };
            let from_merge = self.values[dead].def().filter(|&d| {
                self.ops[d].opcode() == OpCode::MultiEqual && self.ops[d].parent() == Some(bb)
            });
            let inputs = match from_merge {
                Some(d) => self.ops[d].inputs().iter().flatten().copied().collect(),
                None => vec![dead; size_in],
            };
            feeds.push((m, inputs));
        }

        for &(m, _) in &feeds {
            self.op_remove_input(m, succ_slot)?;
        }
        self.blocks.remove_edge(bb, 0);
        edit.edges_removed += 1;
        while !self.blocks[bb].ins().is_empty() {
            self.blocks.redirect_in_edge(bb, 0, succ);
        }
        for (m, inputs) in feeds {
            for v in inputs {
                let end = self.ops[m].num_inputs();
                self.op_insert_input(m, v, end)?;
            }
            if self.zero_multi(m)? {
                edit.merges_collapsed += 1;
            }
        }
        if is_entry {
            self.blocks.set_entry(succ);
        }
        Ok(())
    }

    /// Unlink and destroy every op of `bb`. Reads from outside the block are
    /// poisoned when `unreachable`; otherwise none may remain.
    fn destroy_block_ops(&mut self, bb: BlockId, unreachable: bool, edit: &mut CfgEdit) -> Result<(), CoreError> {
        let ops: Vec<OpId> = self.blocks[bb].ops().to_vec();
        let defined: HashSet<VarnodeId> = ops.iter().filter_map(|&op| self.ops[op].output()).collect();

        for &op in &ops {
            for slot in 0..self.ops[op].num_inputs() {
                if self.ops[op].input(slot).is_some_and(|v| defined.contains(&v)) {
                    self.op_unset_input(op, slot)?;
                }
            }
        }

        let escaping = self.escaping_reads(bb);
        if !escaping.is_empty() {
            if !unreachable {
                let (v, reader, _) = escaping[0];
                return Err(self.violation(CoreError::UnsoundBlockRemoval {
                    block: bb,
                    reason: format!("{v} is still read by {reader} outside the block"),
                }));
            }
            let addr = self.blocks[bb].start_addr().unwrap_or(self.entry_addr);
            self.warn_once(addr, "Creating undefined varnodes in (possibly) reachable block");
            edit.poisoned_reads += self.descend_to_poison(&escaping)?;
        }

        for op in ops {
            self.op_destroy(op)?;
            edit.ops_destroyed += 1;
        }
        Ok(())
    }

    /// Point each (value, reader, slot) read at a fresh poison constant.
    fn descend_to_poison(&mut self, reads: &[(VarnodeId, OpId, usize)]) -> Result<usize, CoreError> {
        for &(v, reader, slot) in reads {
            let size = self.values[v].size();
            let poison = self.new_constant(size, POISON);
            self.vn_flags_mut(poison).undefined = true;
            self.op_set_input(reader, poison, slot)?;
        }
        Ok(reads.len())
    }

    /// Remove every block not reachable from the entry.
    pub fn remove_unreachable_blocks(&mut self) -> Result<CfgEdit, CoreError> {
        let ids = self.blocks.ids().to_vec();
        let structure = self.blocks.structure();
        let dead: Vec<BlockId> = ids.into_iter().filter(|&b| !structure.is_reachable(b)).collect();
        let mut edit = CfgEdit::default();
        for bb in dead {
            edit.absorb(self.remove_block(bb, true)?);
        }
        Ok(edit)
    }

    /// Duplicate `bb` along in-edge `in_edge`. The new block takes that one
    /// in-edge and a copy of every out-edge; ops are cloned into it, with
    /// merges becoming COPYs of the value flowing along the split edge.
    /// Returns the new block.
    pub fn node_split(&mut self, bb: BlockId, in_edge: usize) -> Result<(BlockId, CfgEdit), CoreError> {
        self.check_node_split(bb, in_edge)?;
        let mut edit = CfgEdit::default();

        let range = self.blocks[bb].range();
        let bprime = self.blocks.new_block(range);
        edit.blocks_added.push(bprime);
        self.blocks.redirect_in_edge(bb, in_edge, bprime);

        let mut new_edges: Vec<(BlockId, usize, usize)> = Vec::new();
        let outs = self.blocks[bb].outs().to_vec();
        for e in outs {
            let (_, new_slot) = self.blocks.add_edge(bprime, e.point);
            new_edges.push((e.point, e.rev, new_slot));
            edit.edges_added += 1;
        }

        let ops: Vec<OpId> = self.blocks[bb].ops().to_vec();
        let mut op_xref: SecondaryMap<OpId, OpId> = SecondaryMap::new();
        let mut vn_xref: SecondaryMap<VarnodeId, VarnodeId> = SecondaryMap::new();

        for &op in &ops {
            let pcode = &self.ops[op];
            let is_merge = pcode.opcode() == OpCode::MultiEqual;
            let (opcode, arity) = if is_merge {
                (OpCode::Copy, 1)
            } else {
                (pcode.opcode(), pcode.num_inputs())
            };
            let (pc, flags, output) = (pcode.addr(), pcode.flags().clone(), pcode.output());
            let clone = self.new_op(opcode, arity, pc);
            *self.op_flags_mut(clone) = flags;
            if let Some(out) = output {
                let (size, loc) = (self.values[out].size(), self.values[out].loc());
                let new_out = self.new_varnode_out(size, loc, clone)?;
                let out_flags = self.values[out].flags().clone();
                *self.vn_flags_mut(new_out) = out_flags;
                vn_xref.insert(out, new_out);
            }
            if let Some(spec) = self.call_spec(op).cloned() {
                self.register_call(clone, spec.target)?;
                for trial in spec.trials {
                    self.add_param_trial(clone, trial)?;
                }
            }
            self.op_insert_end(clone, bprime)?;
            op_xref.insert(op, clone);
        }

        for &op in &ops {
            let Some(&clone) = op_xref.get(op) else { continue };
            if self.ops[op].opcode() == OpCode::MultiEqual {
                if let Some(v) = self.ops[op].input(in_edge) {
                    self.op_set_input(clone, v, 0)?;
                }
                continue;
            }
            let inputs: Vec<Option<VarnodeId>> = self.ops[op].inputs().to_vec();
            for (slot, v) in inputs.into_iter().enumerate() {
                if let Some(v) = v {
                    let mapped = vn_xref.get(v).copied().unwrap_or(v);
                    self.op_set_input(clone, mapped, slot)?;
                }
            }
        }

        for m in self.merges_of(bb) {
            self.op_remove_input(m, in_edge)?;
            if self.zero_multi(m)? {
                edit.merges_collapsed += 1;
            }
        }

        for (succ, old_slot, new_slot) in new_edges {
            for m in self.merges_of(succ) {
                let Some(v) = self.ops[m].input(old_slot) else {
                    return Err(self.violation(CoreError::NodeSplit {
                        block: bb,
                        reason: format!("merge {m} has no input along edge {old_slot}"),
                    }));
                };
                let mapped = vn_xref.get(v).copied().unwrap_or(v);
                self.op_insert_input(m, mapped, new_slot)?;
            }
        }

        tracing::debug!(func = %self.name, block = %bb, in_edge, clone = %bprime, "split block");
        Ok((bprime, edit))
    }

    fn check_node_split(&mut self, bb: BlockId, in_edge: usize) -> Result<(), CoreError> {
        self.check_block(bb)?;
        let block = &self.blocks[bb];
        let fail = |reason: &str| CoreError::NodeSplit {
            block: bb,
            reason: reason.to_string(),
        };
        if block.size_in() < 2 {
            return Err(self.violation(fail("fewer than two in-edges")));
        }
        if in_edge >= block.size_in() {
            let err = CoreError::BadEdge {
                block: bb,
                slot: in_edge,
                reason: format!("block has {} in-edge(s)", block.size_in()),
            };
            return Err(self.violation(err));
        }
        let mut preds = HashSet::new();
        if !block.ins().iter().all(|e| preds.insert(e.point)) {
            return Err(self.violation(fail("duplicate predecessor")));
        }
        if preds.contains(&bb) || block.outs().iter().any(|e| e.point == bb) {
            return Err(self.violation(fail("block loops to itself")));
        }
        if block
            .last_op()
            .is_some_and(|op| self.ops[op].opcode() == OpCode::BranchInd)
        {
            return Err(self.violation(fail("multi-way branch cannot be duplicated")));
        }
        for (v, reader, slot) in self.escaping_reads(bb) {
            if !self.is_merge_read_from(bb, reader, slot) {
                let err = CoreError::NodeSplit {
                    block: bb,
                    reason: format!("{v} escapes to {reader}"),
                };
                return Err(self.violation(err));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::builder::FunctionBuilder;
    use crate::ir::Address;

    const R8: Address = Address {
        space: crate::ir::Space::Register,
        offset: 8,
    };

    /// entry -cbranch-> {x, b}; b -> s; x -> s; s merges r8.
    /// Also p -> b for a second (unreachable) predecessor of b.
    fn merge_after_two() -> (Function, BlockId, BlockId, VarnodeId, OpId) {
        let mut fb = FunctionBuilder::new("merge", 0x100);
        let c = fb.input(1, Address::register(0x40));
        let x = fb.create_block_at(0x200);
        let b = fb.create_block_at(0x300);
        let p = fb.create_block_at(0x380);
        let s = fb.create_block_at(0x400);
        fb.cbranch(c, b, x);
        fb.switch_to_block(x);
        let one = fb.constant(4, 1);
        let (_, vx) = fb.op_to(OpCode::Copy, &[one], 4, R8);
        fb.branch(s);
        fb.switch_to_block(p);
        fb.branch(b);
        fb.switch_to_block(b);
        let two = fb.constant(4, 2);
        let (_, vb) = fb.op_to(OpCode::Copy, &[two], 4, R8);
        fb.branch(s);
        fb.switch_to_block(s);
        let (m, out) = fb.multiequal(&[vx, vb], 4, R8);
        fb.ret(Some(out));
        let f = fb.try_build().unwrap();
        (f, b, s, vx, m)
    }

    #[test]
    fn removing_a_predecessor_leaves_a_single_input() {
        let (mut f, b, s, vx, m) = merge_after_two();
        assert_eq!(f.block(b).size_in(), 2);
        let edit = f.remove_block(b, true).unwrap();
        assert_eq!(edit.blocks_removed, vec![b]);
        assert_eq!(f.block(s).size_in(), 1);
        assert_eq!(f.op(m).num_inputs(), 1);
        assert_eq!(f.op(m).input(0), Some(vx));
        assert_eq!(f.op(m).opcode(), OpCode::Copy);
        // The entry's conditional branch went with the edge.
        let entry = f.blocks().entry().unwrap();
        assert_eq!(f.block(entry).size_out(), 1);
        let last = f.block(entry).last_op().unwrap();
        assert_ne!(f.op(last).opcode(), OpCode::CBranch);
        assert!(f.verify().is_ok());
    }

    #[test]
    fn unreachable_removal_poisons_outside_readers() {
        let mut fb = FunctionBuilder::new("poison", 0x100);
        let dead = fb.create_block_at(0x200);
        let live = fb.create_block_at(0x300);
        fb.branch(live);
        fb.switch_to_block(dead);
        let x = fb.input(4, Address::register(0));
        let (_, v) = fb.copy(x);
        fb.branch(live);
        fb.switch_to_block(live);
        let (user, _) = fb.copy(v);
        let z = fb.constant(4, 0);
        fb.ret(Some(z));
        let mut f = fb.try_build().unwrap();
        // `live` has in-edges from entry and dead; no merges, so arity is moot.
        let edit = f.remove_block(dead, true).unwrap();
        assert_eq!(edit.poisoned_reads, 1);
        let poison = f.op(user).input(0).unwrap();
        assert_eq!(f.vn(poison).constant_value(), Some(POISON));
        assert!(f.vn(poison).flags().undefined);
        assert_eq!(f.warnings().len(), 1);
        assert!(f.verify().is_ok());
    }

    #[test]
    fn reachable_removal_splices_merge_inputs() {
        // entry -> {a, c}; a -> b; c -> b; b: merge(va, vc) -> s; s: merge(vb, vz)
        // with entry2 -> s via a third path z.
        let mut fb = FunctionBuilder::new("splice", 0x100);
        let cond = fb.input(1, Address::register(0x40));
        let cond2 = fb.input(1, Address::register(0x41));
        let a = fb.create_block_at(0x200);
        let c = fb.create_block_at(0x300);
        let z = fb.create_block_at(0x350);
        let b = fb.create_block_at(0x400);
        let s = fb.create_block_at(0x500);
        fb.cbranch(cond, c, a);
        fb.switch_to_block(a);
        let k1 = fb.constant(4, 1);
        let (_, va) = fb.op_to(OpCode::Copy, &[k1], 4, R8);
        fb.cbranch(cond2, z, b);
        fb.switch_to_block(c);
        let k2 = fb.constant(4, 2);
        let (_, vc) = fb.op_to(OpCode::Copy, &[k2], 4, R8);
        fb.branch(b);
        fb.switch_to_block(z);
        let k3 = fb.constant(4, 3);
        let (_, vz) = fb.op_to(OpCode::Copy, &[k3], 4, R8);
        fb.branch(s);
        fb.switch_to_block(b);
        let (_, vb) = fb.multiequal(&[va, vc], 4, R8);
        fb.branch(s);
        fb.switch_to_block(s);
        let (ms, out) = fb.multiequal(&[vz, vb], 4, R8);
        fb.ret(Some(out));
        let mut f = fb.try_build().unwrap();
        assert!(f.verify().is_ok());

        // b's BRANCH is the only non-merge op and nothing reads it.
        let edit = f.remove_block(b, false).unwrap();
        assert_eq!(edit.blocks_removed, vec![b]);
        let preds: Vec<_> = f.block(s).ins().iter().map(|e| e.point).collect();
        assert_eq!(preds, vec![z, a, c]);
        assert_eq!(f.op(ms).inputs(), &[Some(vz), Some(va), Some(vc)]);
        assert!(f.verify().is_ok());
    }

    #[test]
    fn removing_a_looping_entry_seeds_the_merge_from_the_input() {
        // entry: m = merge(n) -> body; body: n = merge(m), cbranch back to
        // entry or on to exit.
        let mut fb = FunctionBuilder::new("entry_loop", 0x100);
        let entry = fb.func().blocks().entry().unwrap();
        let x = fb.input(4, Address::register(0));
        let c = fb.input(1, Address::register(0x40));
        let body = fb.create_block_at(0x200);
        let exit = fb.create_block_at(0x300);
        let (m_op, m) = fb.multiequal(&[x], 4, R8);
        fb.branch(body);
        fb.switch_to_block(body);
        let (n_op, n) = fb.multiequal(&[m], 4, R8);
        fb.cbranch(c, entry, exit);
        fb.switch_to_block(exit);
        fb.ret(Some(n));
        let mut f = fb.build();
        f.op_set_input(m_op, n, 0).unwrap();
        assert!(f.verify().is_ok());

        let edit = f.remove_block(entry, false).unwrap();
        assert_eq!(edit.blocks_removed, vec![entry]);
        assert_eq!(edit.merges_collapsed, 1);
        assert_eq!(f.blocks().entry(), Some(body));
        assert_eq!(f.block(body).in_block(0), Some(body));

        // The merge would only have read itself.
        assert_eq!(f.op(n_op).opcode(), OpCode::Copy);
        let src = f.op(n_op).input(0).unwrap();
        assert_ne!(src, n);
        assert!(f.vn(src).is_input());
        assert_eq!(f.vn(src).loc(), R8);
        assert!(f.verify().is_ok());
    }

    #[test]
    fn merge_losing_its_last_input_reads_the_function_input() {
        let mut fb = FunctionBuilder::new("orphan", 0x100);
        let c = fb.input(1, Address::register(0x40));
        let t = fb.create_block_at(0x200);
        let e = fb.create_block_at(0x300);
        let k = fb.constant(4, 5);
        let (_, v) = fb.op_to(OpCode::Copy, &[k], 4, R8);
        fb.cbranch(c, t, e);
        fb.switch_to_block(t);
        let (m, out) = fb.multiequal(&[v], 4, R8);
        fb.ret(Some(out));
        fb.switch_to_block(e);
        fb.ret(None);
        let mut f = fb.build();

        let entry = f.blocks().entry().unwrap();
        let edit = f.remove_branch(entry, 1).unwrap();
        assert_eq!(edit.merges_collapsed, 1);
        assert_eq!(f.op(m).opcode(), OpCode::Copy);
        let src = f.op(m).input(0).unwrap();
        assert!(f.vn(src).is_input());
        assert_eq!(f.vn(src).loc(), R8);
        assert_eq!(f.vn(src).size(), 4);
        assert!(f.verify().is_ok());
    }

    #[test]
    fn no_collapse_merge_keeps_its_opcode() {
        let (mut f, b, s, vx, m) = merge_after_two();
        f.op_flags_mut(m).no_collapse = true;
        let edit = f.remove_block(b, true).unwrap();
        assert_eq!(edit.merges_collapsed, 0);
        assert_eq!(f.op(m).opcode(), OpCode::MultiEqual);
        assert_eq!(f.op(m).inputs(), &[Some(vx)]);
        assert_eq!(f.block(s).size_in(), 1);
        assert!(f.verify().is_ok());
    }

    #[test]
    fn reachable_removal_with_escaping_value_fails_cleanly() {
        let mut fb = FunctionBuilder::new("escape", 0x100);
        let mid = fb.create_block_at(0x200);
        let tail = fb.create_block_at(0x300);
        fb.branch(mid);
        fb.switch_to_block(mid);
        let x = fb.input(4, Address::register(0));
        let (_, v) = fb.copy(x);
        fb.branch(tail);
        fb.switch_to_block(tail);
        fb.ret(Some(v));
        let mut f = fb.try_build().unwrap();
        let ops_before = f.ops().len();
        let err = f.remove_block(mid, false).unwrap_err();
        assert!(matches!(err, CoreError::UnsoundBlockRemoval { block, .. } if block == mid));
        assert_eq!(f.ops().len(), ops_before);
        assert!(f.blocks().contains(mid));
        assert!(f.state().needs_rebuild);
    }

    #[test]
    fn remove_branch_patches_target_merge() {
        let (mut f, _, s, vx, m) = merge_after_two();
        let entry = f.blocks().entry().unwrap();
        // Cut the taken edge (slot 1, entry -> b).
        let edit = f.remove_branch(entry, 1).unwrap();
        assert_eq!(edit.ops_destroyed, 1);
        assert_eq!(f.block(entry).size_out(), 1);
        // b keeps its edge to s through the dead predecessor p.
        assert_eq!(f.block(s).size_in(), 2);
        assert_eq!(f.op(m).input(0), Some(vx));
        assert!(f.verify().is_ok());
        // b and p are now unreachable.
        let edit = f.remove_unreachable_blocks().unwrap();
        assert_eq!(edit.blocks_removed.len(), 2);
        assert_eq!(f.op(m).num_inputs(), 1);
        assert!(f.verify().is_ok());
    }

    #[test]
    fn split_along_middle_predecessor() {
        // Three predecessors p0, p1, p2 of t; t -> u with a merge in u fed by t.
        let mut fb = FunctionBuilder::new("split", 0x100);
        let sel = fb.input(1, Address::register(0x40));
        let sel2 = fb.input(1, Address::register(0x41));
        let p0 = fb.create_block_at(0x200);
        let p12 = fb.create_block_at(0x250);
        let p1 = fb.create_block_at(0x300);
        let p2 = fb.create_block_at(0x400);
        let t = fb.create_block_at(0x500);
        let w = fb.create_block_at(0x550);
        let u = fb.create_block_at(0x600);
        fb.cbranch(sel, p12, p0);
        fb.switch_to_block(p12);
        fb.cbranch(sel2, p2, p1);
        for (blk, val) in [(p0, 10u64), (p1, 11), (p2, 12)] {
            fb.switch_to_block(blk);
            let k = fb.constant(4, val);
            fb.op_to(OpCode::Copy, &[k], 4, R8);
            fb.branch(t);
        }
        let vals: Vec<VarnodeId> = [p0, p1, p2]
            .iter()
            .map(|&b| {
                let op = fb.func().block(b).first_op().unwrap();
                fb.func().op(op).output().unwrap()
            })
            .collect();
        fb.switch_to_block(t);
        let (mt, vt) = fb.multiequal(&vals, 4, R8);
        let one = fb.constant(4, 1);
        let (_, inc) = fb.binop(OpCode::IntAdd, vt, one, 4);
        fb.cbranch(inc, u, w);
        fb.switch_to_block(w);
        fb.branch(u);
        fb.switch_to_block(u);
        let k = fb.constant(4, 0);
        fb.op_to(OpCode::Copy, &[k], 4, R8);
        let mut f = fb.try_build().unwrap();
        // u is entered from t and from w; give it a merge fed along both.
        let merge_u = f.new_op(OpCode::MultiEqual, 0, 0x600);
        f.new_unique_out(4, merge_u).unwrap();
        let w_val = f.new_constant(4, 7);
        for e in f.block(u).ins().to_vec() {
            let v = if e.point == t { inc } else { w_val };
            let end = f.op(merge_u).num_inputs();
            f.op_insert_input(merge_u, v, end).unwrap();
        }
        f.op_insert_begin(merge_u, u).unwrap();
        assert!(f.verify().is_ok());

        let t_outs: Vec<BlockId> = f.block(t).outs().iter().map(|e| e.point).collect();
        let (tp, edit) = f.node_split(t, 1).unwrap();
        assert_eq!(edit.blocks_added, vec![tp]);

        let clone_preds: Vec<_> = f.block(tp).ins().iter().map(|e| e.point).collect();
        assert_eq!(clone_preds, vec![p1]);
        let orig_preds: Vec<_> = f.block(t).ins().iter().map(|e| e.point).collect();
        assert_eq!(orig_preds, vec![p0, p2]);
        let clone_outs: Vec<_> = f.block(tp).outs().iter().map(|e| e.point).collect();
        assert_eq!(clone_outs, t_outs);
        assert_eq!(f.block(t).outs().iter().map(|e| e.point).collect::<Vec<_>>(), t_outs);

        // The original merge lost p1's input.
        assert_eq!(f.op(mt).inputs(), &[Some(vals[0]), Some(vals[2])]);
        // The clone's merge became a COPY of p1's value.
        let first = f.block(tp).first_op().unwrap();
        assert_eq!(f.op(first).opcode(), OpCode::Copy);
        assert_eq!(f.op(first).input(0), Some(vals[1]));
        // The clone's add reads the clone's copy, not the original merge.
        let add_clone = f.block(tp).ops()[1];
        assert_eq!(f.op(add_clone).input(0), f.op(first).output());
        // u's merge grew by one input per clone edge into u.
        assert_eq!(f.op(merge_u).num_inputs(), f.block(u).size_in());
        assert!(f.verify().is_ok());
    }

    #[test]
    fn split_rejects_indirect_branch() {
        let mut fb = FunctionBuilder::new("ind", 0x100);
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
        let t = fb.input(8, Address::register(0x10));
        fb.branchind(t);
        let mut f = fb.try_build().unwrap();
        let ops_before = f.ops().len();
        let err = f.node_split(j, 0).unwrap_err();
        assert!(matches!(err, CoreError::NodeSplit { .. }));
        assert_eq!(f.ops().len(), ops_before);
        assert_eq!(f.block(j).size_in(), 2);
    }
}
