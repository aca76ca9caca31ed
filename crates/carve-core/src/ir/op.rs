use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::define_entity;
use crate::entity::Arena;

use super::address::SeqNum;
use super::block::BlockId;
use super::opcode::OpCode;
use super::varnode::VarnodeId;

define_entity!(OpId, "op");

/// Why a RETURN-shaped op ends flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HaltKind {
    /// Inserted by the partial clone where the original flow leaves the clone.
    Artificial,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpFlags {
    /// First op of its machine instruction's basic block.
    #[serde(default)]
    pub start_block: bool,
    /// CBRANCH takes out edge 1 when its condition is false instead of true.
    #[serde(default)]
    pub boolean_flip: bool,
    #[serde(default)]
    pub halt: Option<HaltKind>,
    /// Merge must not be collapsed even if all inputs agree.
    #[serde(default)]
    pub no_collapse: bool,
}

/// One p-code operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PcodeOp {
    pub(crate) opcode: OpCode,
    pub(crate) inputs: Vec<Option<VarnodeId>>,
    pub(crate) output: Option<VarnodeId>,
    pub(crate) parent: Option<BlockId>,
    pub(crate) seq: SeqNum,
    /// Position within the parent block; meaningful only while inserted.
    pub(crate) order: u32,
    pub(crate) flags: OpFlags,
}

impl PcodeOp {
    pub fn opcode(&self) -> OpCode {
        self.opcode
    }

    pub fn num_inputs(&self) -> usize {
        self.inputs.len()
    }

    /// Varnode in `slot`, `None` if the slot is empty or out of range.
    pub fn input(&self, slot: usize) -> Option<VarnodeId> {
        self.inputs.get(slot).copied().flatten()
    }

    pub fn inputs(&self) -> &[Option<VarnodeId>] {
        &self.inputs
    }

    pub fn output(&self) -> Option<VarnodeId> {
        self.output
    }

    pub fn parent(&self) -> Option<BlockId> {
        self.parent
    }

    pub fn seq(&self) -> SeqNum {
        self.seq
    }

    pub fn addr(&self) -> u64 {
        self.seq.pc
    }

    pub fn order(&self) -> u32 {
        self.order
    }

    pub fn flags(&self) -> &OpFlags {
        &self.flags
    }

    pub fn is_dead(&self) -> bool {
        self.parent.is_none()
    }

    pub fn is_boolean_flip(&self) -> bool {
        self.flags.boolean_flip
    }
}

/// Owner of every op of one function.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OpStore {
    ops: Arena<OpId, PcodeOp>,
    #[serde(skip)]
    by_seq: BTreeMap<SeqNum, OpId>,
    #[serde(skip)]
    alive: BTreeSet<OpId>,
    #[serde(skip)]
    dead: BTreeSet<OpId>,
    next_uniq: u32,
}

impl OpStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a dead op with `num_inputs` empty slots and a fresh sequence number.
    pub(crate) fn create(&mut self, opcode: OpCode, num_inputs: usize, pc: u64) -> OpId {
        let seq = SeqNum::new(pc, self.next_uniq);
        self.next_uniq += 1;
        self.create_with_seq(opcode, num_inputs, seq)
    }

    /// Allocate with an explicit sequence number. Used when cloning, so the
    /// copy keeps the addresses of the original.
    pub(crate) fn create_with_seq(&mut self, opcode: OpCode, num_inputs: usize, seq: SeqNum) -> OpId {
        self.next_uniq = self.next_uniq.max(seq.uniq + 1);
        let id = self.ops.push(PcodeOp {
            opcode,
            inputs: vec![None; num_inputs],
            output: None,
            parent: None,
            seq,
            order: 0,
            flags: OpFlags::default(),
        });
        self.by_seq.insert(seq, id);
        self.dead.insert(id);
        id
    }

    pub(crate) fn remove(&mut self, id: OpId) -> Option<PcodeOp> {
        let op = self.ops.remove(id)?;
        if self.by_seq.get(&op.seq) == Some(&id) {
            self.by_seq.remove(&op.seq);
        }
        self.alive.remove(&id);
        self.dead.remove(&id);
        Some(op)
    }

    pub(crate) fn mark_alive(&mut self, id: OpId) {
        self.dead.remove(&id);
        self.alive.insert(id);
    }

    pub(crate) fn mark_dead(&mut self, id: OpId) {
        self.alive.remove(&id);
        self.dead.insert(id);
    }

    pub(crate) fn op_mut(&mut self, id: OpId) -> &mut PcodeOp {
        &mut self.ops[id]
    }

    pub(crate) fn rebuild_indices(&mut self) {
        self.by_seq.clear();
        self.alive.clear();
        self.dead.clear();
        for (id, op) in self.ops.iter() {
            self.by_seq.insert(op.seq, id);
            if op.parent.is_some() {
                self.alive.insert(id);
            } else {
                self.dead.insert(id);
            }
        }
    }

    pub fn get(&self, id: OpId) -> Option<&PcodeOp> {
        self.ops.get(id)
    }

    pub fn contains(&self, id: OpId) -> bool {
        self.ops.contains(id)
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (OpId, &PcodeOp)> {
        self.ops.iter()
    }

    pub fn find(&self, seq: SeqNum) -> Option<OpId> {
        self.by_seq.get(&seq).copied()
    }

    /// Ops generated from the machine instruction at `pc`, in sequence order.
    pub fn at_pc(&self, pc: u64) -> impl Iterator<Item = OpId> + '_ {
        self.by_seq
            .range(SeqNum::new(pc, 0)..=SeqNum::new(pc, u32::MAX))
            .map(|(_, &id)| id)
    }

    /// All ops in address order.
    pub fn iter_by_seq(&self) -> impl Iterator<Item = OpId> + '_ {
        self.by_seq.values().copied()
    }

    /// Ops ordered by sequence number strictly before `seq`, nearest first.
    pub fn before_seq(&self, seq: SeqNum) -> impl Iterator<Item = OpId> + '_ {
        self.by_seq.range(..seq).rev().map(|(_, &id)| id)
    }

    pub fn alive(&self) -> impl Iterator<Item = OpId> + '_ {
        self.alive.iter().copied()
    }

    pub fn dead(&self) -> impl Iterator<Item = OpId> + '_ {
        self.dead.iter().copied()
    }

    pub fn is_alive(&self, id: OpId) -> bool {
        self.alive.contains(&id)
    }
}

impl std::ops::Index<OpId> for OpStore {
    type Output = PcodeOp;
    fn index(&self, id: OpId) -> &PcodeOp {
        &self.ops[id]
    }
}
