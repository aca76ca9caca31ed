//! The graph editor: the only code that links varnodes and ops together.
//!
//! Every primitive either leaves def/use links, reader lists, and store
//! indices consistent, or fails before touching anything. Failures are
//! contract violations and flag the function for a rebuild.

use crate::error::CoreError;

use super::address::{calc_mask, Address, SeqNum};
use super::block::BlockId;
use super::func::Function;
use super::op::{OpFlags, OpId};
use super::opcode::OpCode;
use super::varnode::{VarnodeFlags, VarnodeId};

impl Function {
    // -- Creation --

    /// Create a free varnode, tagged with the properties of any symbol
    /// covering its storage.
    pub fn new_varnode(&mut self, size: u32, loc: Address) -> VarnodeId {
        let id = self.values.create(size, loc);
        self.tag_varnode(id);
        id
    }

    pub fn new_constant(&mut self, size: u32, value: u64) -> VarnodeId {
        self.values
            .create(size, Address::constant(value & calc_mask(size)))
    }

    /// Fresh temporary in the unique space.
    pub fn new_unique(&mut self, size: u32) -> VarnodeId {
        let loc = self.values.next_unique(size);
        self.values.create(size, loc)
    }

    /// Create a dead op with `num_inputs` empty slots.
    pub fn new_op(&mut self, opcode: OpCode, num_inputs: usize, pc: u64) -> OpId {
        self.ops.create(opcode, num_inputs, pc)
    }

    pub(crate) fn new_op_with_seq(&mut self, opcode: OpCode, num_inputs: usize, seq: SeqNum) -> OpId {
        self.ops.create_with_seq(opcode, num_inputs, seq)
    }

    /// Create a varnode and make it the output of `op`.
    pub fn new_varnode_out(&mut self, size: u32, loc: Address, op: OpId) -> Result<VarnodeId, CoreError> {
        let vn = self.new_varnode(size, loc);
        self.op_set_output(op, vn)?;
        Ok(vn)
    }

    pub fn new_unique_out(&mut self, size: u32, op: OpId) -> Result<VarnodeId, CoreError> {
        let vn = self.new_unique(size);
        self.op_set_output(op, vn)?;
        Ok(vn)
    }

    fn tag_varnode(&mut self, id: VarnodeId) {
        let Some(ctx) = self.context.clone() else {
            return;
        };
        let (loc, size) = (self.values[id].loc, self.values[id].size);
        let flags = &mut self.values.node_mut(id).flags;
        if let Some(props) = ctx.symbol_props(loc, size) {
            flags.addr_tied |= props.addr_tied;
            flags.persist |= props.persist;
        }
        if ctx.spacebase.is_some_and(|s| s.loc == loc && s.size == size) {
            flags.spacebase = true;
        }
        if ctx.return_address.is_some_and(|s| s.loc == loc && s.size == size) {
            flags.return_address = true;
        }
    }

    /// Attribute flags of `vn`. The input flag is not writable here; use
    /// [`Function::set_input_varnode`].
    pub fn vn_flags_mut(&mut self, vn: VarnodeId) -> &mut VarnodeFlags {
        &mut self.values.node_mut(vn).flags
    }

    pub fn op_flags_mut(&mut self, op: OpId) -> &mut OpFlags {
        &mut self.ops.op_mut(op).flags
    }

    /// Mark `vn` as a formal input. An existing input with identical storage
    /// absorbs `vn` (its readers move over and `vn` is destroyed); partially
    /// overlapping inputs are a contract violation. Returns the surviving
    /// input varnode.
    pub fn set_input_varnode(&mut self, vn: VarnodeId) -> Result<VarnodeId, CoreError> {
        self.check_vn(vn)?;
        let node = &self.values[vn];
        if node.is_input() {
            return Ok(vn);
        }
        if let Some(def) = node.def {
            return Err(self.violation(CoreError::BadInput {
                value: vn,
                reason: format!("already defined by {def}"),
            }));
        }
        if node.is_constant() {
            return Err(self.violation(CoreError::BadInput {
                value: vn,
                reason: "constants cannot be inputs".into(),
            }));
        }
        let (loc, size) = (node.loc, node.size);
        let overlapping = self.values.overlapping_inputs(loc, size);
        if let Some(&same) = overlapping
            .iter()
            .find(|&&other| self.values[other].loc == loc && self.values[other].size == size)
        {
            self.total_replace(vn, same)?;
            self.destroy_varnode(vn)?;
            return Ok(same);
        }
        if !overlapping.is_empty() {
            return Err(self.violation(CoreError::OverlappingInput { loc, size }));
        }
        self.values.unindex(vn);
        self.values.node_mut(vn).flags.input = true;
        self.values.index(vn, None);
        Ok(vn)
    }

    /// The input varnode at exactly this storage, creating it if needed.
    pub fn find_or_create_input(&mut self, size: u32, loc: Address) -> Result<VarnodeId, CoreError> {
        let existing = self
            .values
            .find_at(loc, size)
            .find(|&id| self.values[id].is_input());
        match existing {
            Some(id) => Ok(id),
            None => {
                let vn = self.new_varnode(size, loc);
                self.set_input_varnode(vn)
            }
        }
    }

    // -- Opcode and output --

    pub fn op_set_opcode(&mut self, op: OpId, opcode: OpCode) -> Result<(), CoreError> {
        self.op_checked(op)?;
        self.ops.op_mut(op).opcode = opcode;
        Ok(())
    }

    /// Make `vn` the output of `op`. A previous output is unlinked and left
    /// free. `vn` must itself be free.
    pub fn op_set_output(&mut self, op: OpId, vn: VarnodeId) -> Result<(), CoreError> {
        let current = self.op_checked(op)?.output;
        self.check_vn(vn)?;
        if current == Some(vn) {
            return Ok(());
        }
        let node = &self.values[vn];
        if let Some(def) = node.def {
            return Err(self.violation(CoreError::AlreadyDefined { value: vn, def }));
        }
        if node.is_input() {
            return Err(self.violation(CoreError::InputAsOutput { value: vn, op }));
        }
        if node.is_constant() {
            return Err(self.violation(CoreError::Invariant(format!(
                "constant {vn} cannot be the output of {op}"
            ))));
        }
        self.op_unset_output(op)?;
        let seq = self.ops[op].seq;
        self.values.unindex(vn);
        self.values.node_mut(vn).def = Some(op);
        self.values.index(vn, Some(seq));
        self.ops.op_mut(op).output = Some(vn);
        Ok(())
    }

    /// Detach the output of `op`; the varnode becomes free.
    pub fn op_unset_output(&mut self, op: OpId) -> Result<(), CoreError> {
        let Some(old) = self.op_checked(op)?.output else {
            return Ok(());
        };
        self.ops.op_mut(op).output = None;
        self.values.unindex(old);
        self.values.node_mut(old).def = None;
        self.values.index(old, None);
        Ok(())
    }

    // -- Input slots --

    fn check_slot(&mut self, op: OpId, slot: usize, allow_end: bool) -> Result<(), CoreError> {
        let len = self.op_checked(op)?.inputs.len();
        if slot < len || (allow_end && slot == len) {
            Ok(())
        } else {
            Err(self.violation(CoreError::SlotOutOfRange { op, slot, len }))
        }
    }

    /// Store `vn` in input `slot` of `op`. A constant that is already read
    /// elsewhere is replaced by a private copy unless it is spacebase.
    pub fn op_set_input(&mut self, op: OpId, vn: VarnodeId, slot: usize) -> Result<(), CoreError> {
        self.check_slot(op, slot, false)?;
        self.check_vn(vn)?;
        if self.ops[op].inputs[slot] == Some(vn) {
            return Ok(());
        }
        let node = &self.values[vn];
        let vn = if node.is_constant() && !node.is_spacebase() && !node.has_no_descend() {
            let (size, value, flags) = (node.size, node.loc.offset, node.flags.clone());
            let copy = self.new_constant(size, value);
            self.values.node_mut(copy).flags = flags;
            copy
        } else {
            vn
        };
        if let Some(old) = self.ops[op].inputs[slot] {
            self.values.node_mut(old).erase_descend(op);
        }
        self.ops.op_mut(op).inputs[slot] = Some(vn);
        self.values.node_mut(vn).descend.push(op);
        Ok(())
    }

    /// Clear input `slot`; the slot itself stays.
    pub fn op_unset_input(&mut self, op: OpId, slot: usize) -> Result<(), CoreError> {
        self.check_slot(op, slot, false)?;
        if let Some(old) = self.ops.op_mut(op).inputs[slot].take() {
            self.values.node_mut(old).erase_descend(op);
        }
        Ok(())
    }

    /// Insert a new slot at `slot` holding `vn`; later slots shift up.
    pub fn op_insert_input(&mut self, op: OpId, vn: VarnodeId, slot: usize) -> Result<(), CoreError> {
        self.check_slot(op, slot, true)?;
        self.check_vn(vn)?;
        self.ops.op_mut(op).inputs.insert(slot, None);
        self.op_set_input(op, vn, slot)
    }

    /// Delete input `slot`; later slots shift down.
    pub fn op_remove_input(&mut self, op: OpId, slot: usize) -> Result<(), CoreError> {
        self.op_unset_input(op, slot)?;
        self.ops.op_mut(op).inputs.remove(slot);
        Ok(())
    }

    /// Replace every input of `op` with `inputs`.
    pub fn op_set_all_input(&mut self, op: OpId, inputs: &[VarnodeId]) -> Result<(), CoreError> {
        self.op_checked(op)?;
        for &vn in inputs {
            self.check_vn(vn)?;
        }
        for slot in 0..self.ops[op].inputs.len() {
            self.op_unset_input(op, slot)?;
        }
        self.ops.op_mut(op).inputs = vec![None; inputs.len()];
        for (slot, &vn) in inputs.iter().enumerate() {
            self.op_set_input(op, vn, slot)?;
        }
        Ok(())
    }

    // -- Placement --

    fn insert_at(&mut self, op: OpId, bb: BlockId, idx: usize) -> Result<(), CoreError> {
        self.op_checked(op)?;
        self.check_block(bb)?;
        if let Some(parent) = self.ops[op].parent {
            return Err(self.violation(CoreError::Invariant(format!(
                "{op} is already placed in {parent}"
            ))));
        }
        self.blocks.block_mut(bb).ops.insert(idx, op);
        self.ops.op_mut(op).parent = Some(bb);
        self.ops.mark_alive(op);
        self.renumber(bb, idx);
        Ok(())
    }

    fn renumber(&mut self, bb: BlockId, from: usize) {
        let ops: Vec<OpId> = self.blocks[bb].ops[from..].to_vec();
        for (i, op) in ops.into_iter().enumerate() {
            self.ops.op_mut(op).order = (from + i) as u32;
        }
    }

    /// Place `op` at the start of `bb`. Non-merge ops go after the leading
    /// MULTIEQUALs.
    pub fn op_insert_begin(&mut self, op: OpId, bb: BlockId) -> Result<(), CoreError> {
        self.op_checked(op)?;
        self.check_block(bb)?;
        let idx = if self.ops[op].opcode == OpCode::MultiEqual {
            0
        } else {
            self.blocks[bb]
                .ops
                .iter()
                .take_while(|&&o| self.ops[o].opcode == OpCode::MultiEqual)
                .count()
        };
        self.insert_at(op, bb, idx)
    }

    /// Place `op` at the end of `bb`, ahead of a trailing branch or return
    /// unless `op` is itself one.
    pub fn op_insert_end(&mut self, op: OpId, bb: BlockId) -> Result<(), CoreError> {
        self.op_checked(op)?;
        self.check_block(bb)?;
        let ops = &self.blocks[bb].ops;
        let mut idx = ops.len();
        if !self.ops[op].opcode.is_flow_break() {
            if let Some(&last) = ops.last() {
                if self.ops[last].opcode.is_flow_break() {
                    idx -= 1;
                }
            }
        }
        self.insert_at(op, bb, idx)
    }

    pub fn op_insert_before(&mut self, op: OpId, follow: OpId) -> Result<(), CoreError> {
        let Some(bb) = self.op_checked(follow)?.parent else {
            return Err(self.violation(CoreError::NotInserted { op: follow }));
        };
        let idx = self.ops[follow].order as usize;
        self.insert_at(op, bb, idx)
    }

    pub fn op_insert_after(&mut self, op: OpId, prev: OpId) -> Result<(), CoreError> {
        let Some(bb) = self.op_checked(prev)?.parent else {
            return Err(self.violation(CoreError::NotInserted { op: prev }));
        };
        let idx = self.ops[prev].order as usize + 1;
        self.insert_at(op, bb, idx)
    }

    /// Take `op` out of its block and put it on the dead list. Links to
    /// varnodes are untouched.
    pub fn op_uninsert(&mut self, op: OpId) -> Result<(), CoreError> {
        let Some(bb) = self.op_checked(op)?.parent else {
            return Err(self.violation(CoreError::NotInserted { op }));
        };
        let idx = self.ops[op].order as usize;
        self.blocks.block_mut(bb).ops.remove(idx);
        self.ops.op_mut(op).parent = None;
        self.ops.mark_dead(op);
        self.renumber(bb, idx);
        Ok(())
    }

    /// Clear every input and the output of `op`, then uninsert it.
    pub fn op_unlink(&mut self, op: OpId) -> Result<(), CoreError> {
        self.op_checked(op)?;
        for slot in 0..self.ops[op].inputs.len() {
            self.op_unset_input(op, slot)?;
        }
        self.op_unset_output(op)?;
        if self.ops[op].parent.is_some() {
            self.op_uninsert(op)?;
        }
        Ok(())
    }

    // -- Destruction --

    /// Destroy `op`. Its output must have no readers left; the output is
    /// destroyed with it, as are constant inputs no longer read by anything.
    /// A call spec or jump table keyed to `op` goes too.
    pub fn op_destroy(&mut self, op: OpId) -> Result<(), CoreError> {
        let output = self.op_checked(op)?.output;
        if let Some(out) = output {
            let readers = self.values[out].descend.len();
            if readers > 0 {
                return Err(self.violation(CoreError::LiveReaders {
                    op,
                    value: out,
                    readers,
                }));
            }
        }
        if self.ops[op].parent.is_some() {
            self.op_uninsert(op)?;
        }
        let inputs: Vec<VarnodeId> = self.ops[op].inputs.iter().flatten().copied().collect();
        for slot in 0..self.ops[op].inputs.len() {
            self.op_unset_input(op, slot)?;
        }
        for vn in inputs {
            if let Some(node) = self.values.get(vn) {
                if node.is_constant() && node.has_no_descend() {
                    self.values.remove(vn);
                }
            }
        }
        if let Some(out) = output {
            self.ops.op_mut(op).output = None;
            self.values.remove(out);
        }
        self.remove_call_spec(op);
        self.remove_jump_table(op);
        self.ops.remove(op);
        Ok(())
    }

    /// Destroy `vn`: every reader slot is cleared (the readers survive) and
    /// a defining op loses its output.
    pub fn destroy_varnode(&mut self, vn: VarnodeId) -> Result<(), CoreError> {
        self.check_vn(vn)?;
        let mut readers = self.values[vn].descend.clone();
        readers.dedup();
        for op in readers {
            for slot in self.ops.op_mut(op).inputs.iter_mut() {
                if *slot == Some(vn) {
                    *slot = None;
                }
            }
        }
        self.values.node_mut(vn).descend.clear();
        if let Some(def) = self.values[vn].def {
            self.ops.op_mut(def).output = None;
        }
        self.values.remove(vn);
        Ok(())
    }

    /// Every read of `vn` becomes a read of `new`.
    pub fn total_replace(&mut self, vn: VarnodeId, new: VarnodeId) -> Result<(), CoreError> {
        self.check_vn(vn)?;
        self.check_vn(new)?;
        if vn == new {
            return Ok(());
        }
        for (op, slot) in self.read_slots(vn) {
            self.op_set_input(op, new, slot)?;
        }
        Ok(())
    }

    /// Every read of `vn` becomes a read of a constant with its size.
    pub fn total_replace_constant(&mut self, vn: VarnodeId, value: u64) -> Result<(), CoreError> {
        self.check_vn(vn)?;
        let size = self.values[vn].size;
        let constant = self.new_constant(size, value);
        let reads = self.read_slots(vn);
        if reads.is_empty() {
            self.values.remove(constant);
        }
        for (op, slot) in reads {
            self.op_set_input(op, constant, slot)?;
        }
        Ok(())
    }

    /// (op, slot) pairs reading `vn`, snapshotted. Panics if `vn` was
    /// destroyed.
    pub fn read_slots(&self, vn: VarnodeId) -> Vec<(OpId, usize)> {
        let mut readers = self.values[vn].descend.clone();
        readers.sort();
        readers.dedup();
        let mut out = Vec::new();
        for op in readers {
            for (slot, s) in self.ops[op].inputs.iter().enumerate() {
                if *s == Some(vn) {
                    out.push((op, slot));
                }
            }
        }
        out
    }
}
