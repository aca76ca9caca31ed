use serde::{Deserialize, Serialize};

use crate::define_entity;
use crate::entity::Arena;

use super::address::AddrRange;
use super::op::OpId;
use super::structure::Structure;

define_entity!(BlockId, "bb");

/// One end of a control-flow edge. `rev` is the slot of the same edge in
/// the list of the block at `point`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockEdge {
    pub point: BlockId,
    pub rev: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockFlags {
    #[serde(default)]
    pub entry: bool,
    /// Out edges come from a recovered jump table.
    #[serde(default)]
    pub switch_out: bool,
}

/// A basic block.
///
/// For a block ending in CBRANCH, out edge 0 is the fall-through (condition
/// false) and out edge 1 is the taken edge, unless the branch carries
/// `boolean_flip`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BasicBlock {
    pub(crate) ops: Vec<OpId>,
    pub(crate) ins: Vec<BlockEdge>,
    pub(crate) outs: Vec<BlockEdge>,
    pub(crate) range: Option<AddrRange>,
    pub(crate) flags: BlockFlags,
}

impl BasicBlock {
    pub fn ops(&self) -> &[OpId] {
        &self.ops
    }

    pub fn first_op(&self) -> Option<OpId> {
        self.ops.first().copied()
    }

    pub fn last_op(&self) -> Option<OpId> {
        self.ops.last().copied()
    }

    pub fn ins(&self) -> &[BlockEdge] {
        &self.ins
    }

    pub fn outs(&self) -> &[BlockEdge] {
        &self.outs
    }

    pub fn size_in(&self) -> usize {
        self.ins.len()
    }

    pub fn size_out(&self) -> usize {
        self.outs.len()
    }

    pub fn in_block(&self, slot: usize) -> Option<BlockId> {
        self.ins.get(slot).map(|e| e.point)
    }

    pub fn out_block(&self, slot: usize) -> Option<BlockId> {
        self.outs.get(slot).map(|e| e.point)
    }

    pub fn range(&self) -> Option<AddrRange> {
        self.range
    }

    pub fn start_addr(&self) -> Option<u64> {
        self.range.map(|r| r.start)
    }

    pub fn is_entry(&self) -> bool {
        self.flags.entry
    }

    pub fn is_switch_out(&self) -> bool {
        self.flags.switch_out
    }
}

/// The control-flow graph of one function.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BlockGraph {
    blocks: Arena<BlockId, BasicBlock>,
    order: Vec<BlockId>,
    entry: Option<BlockId>,
    #[serde(skip)]
    structure: Option<Structure>,
}

impl BlockGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn get(&self, id: BlockId) -> Option<&BasicBlock> {
        self.blocks.get(id)
    }

    pub fn contains(&self, id: BlockId) -> bool {
        self.blocks.contains(id)
    }

    /// Blocks in list order.
    pub fn ids(&self) -> &[BlockId] {
        &self.order
    }

    pub fn iter(&self) -> impl Iterator<Item = (BlockId, &BasicBlock)> {
        self.order.iter().map(|&id| (id, &self.blocks[id]))
    }

    pub fn entry(&self) -> Option<BlockId> {
        self.entry
    }

    pub(crate) fn block_mut(&mut self, id: BlockId) -> &mut BasicBlock {
        &mut self.blocks[id]
    }

    pub fn new_block(&mut self, range: Option<AddrRange>) -> BlockId {
        let id = self.blocks.push(BasicBlock {
            range,
            ..BasicBlock::default()
        });
        self.order.push(id);
        if self.entry.is_none() {
            self.set_entry(id);
        }
        self.mark_dirty();
        id
    }

    pub fn set_entry(&mut self, id: BlockId) {
        if let Some(old) = self.entry.and_then(|e| self.blocks.get_mut(e)) {
            old.flags.entry = false;
        }
        self.blocks[id].flags.entry = true;
        self.entry = Some(id);
        self.mark_dirty();
    }

    pub(crate) fn set_switch_out(&mut self, id: BlockId, on: bool) {
        self.blocks[id].flags.switch_out = on;
    }

    /// Drop a block that no longer has edges or ops.
    pub(crate) fn remove_block(&mut self, id: BlockId) -> Option<BasicBlock> {
        let bb = self.blocks.remove(id)?;
        self.order.retain(|&b| b != id);
        if self.entry == Some(id) {
            self.entry = None;
        }
        self.mark_dirty();
        Some(bb)
    }

    /// Append an edge `from -> to`; returns (out slot, in slot).
    pub(crate) fn add_edge(&mut self, from: BlockId, to: BlockId) -> (usize, usize) {
        let out_slot = self.blocks[from].outs.len();
        let in_slot = self.blocks[to].ins.len();
        self.blocks[from].outs.push(BlockEdge {
            point: to,
            rev: in_slot,
        });
        self.blocks[to].ins.push(BlockEdge {
            point: from,
            rev: out_slot,
        });
        self.mark_dirty();
        (out_slot, in_slot)
    }

    /// Delete out edge `out_slot` of `from`; later edges on both ends shift
    /// down by one. Returns the target and the in slot the edge occupied.
    pub(crate) fn remove_edge(&mut self, from: BlockId, out_slot: usize) -> (BlockId, usize) {
        let BlockEdge { point: to, rev: in_slot } = self.blocks[from].outs.remove(out_slot);
        self.renumber_outs(from, out_slot);
        self.blocks[to].ins.remove(in_slot);
        self.renumber_ins(to, in_slot);
        self.mark_dirty();
        (to, in_slot)
    }

    /// Move in edge `in_slot` of `to` so it arrives at `new_to` instead. The
    /// source keeps the same out slot; the edge is appended to `new_to`'s in
    /// list. Returns the new in slot.
    pub(crate) fn redirect_in_edge(&mut self, to: BlockId, in_slot: usize, new_to: BlockId) -> usize {
        let BlockEdge { point: from, rev: out_slot } = self.blocks[to].ins.remove(in_slot);
        self.renumber_ins(to, in_slot);
        let new_slot = self.blocks[new_to].ins.len();
        self.blocks[new_to].ins.push(BlockEdge {
            point: from,
            rev: out_slot,
        });
        self.blocks[from].outs[out_slot] = BlockEdge {
            point: new_to,
            rev: new_slot,
        };
        self.mark_dirty();
        new_slot
    }

    fn renumber_outs(&mut self, id: BlockId, from_slot: usize) {
        for k in from_slot..self.blocks[id].outs.len() {
            let e = self.blocks[id].outs[k];
            self.blocks[e.point].ins[e.rev].rev = k;
        }
    }

    fn renumber_ins(&mut self, id: BlockId, from_slot: usize) {
        for k in from_slot..self.blocks[id].ins.len() {
            let e = self.blocks[id].ins[k];
            self.blocks[e.point].outs[e.rev].rev = k;
        }
    }

    /// First block whose address range starts at `addr`.
    pub fn block_starting_at(&self, addr: u64) -> Option<BlockId> {
        self.iter()
            .find(|(_, bb)| bb.start_addr() == Some(addr))
            .map(|(id, _)| id)
    }

    /// Invalidate the cached structure.
    pub fn mark_dirty(&mut self) {
        self.structure = None;
    }

    pub fn is_dirty(&self) -> bool {
        self.structure.is_none()
    }

    /// Dominance and loop structure, recomputed if any edit happened since
    /// the last query.
    pub fn structure(&mut self) -> &Structure {
        let structure = match self.structure.take() {
            Some(s) => s,
            None => {
                tracing::trace!(blocks = self.len(), "recomputing block structure");
                Structure::compute(self)
            }
        };
        self.structure.insert(structure)
    }
}

impl std::ops::Index<BlockId> for BlockGraph {
    type Output = BasicBlock;
    fn index(&self, id: BlockId) -> &BasicBlock {
        &self.blocks[id]
    }
}
