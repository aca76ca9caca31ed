use crate::error::CoreError;
use crate::ir::{BlockId, Function, OpCode, OpId};
use crate::pipeline::Transform;

use super::util::{constant_input, is_removable};

/// Branch folding: a CBRANCH on a constant condition loses the edge it can
/// never take, and with it the branch op.
pub struct BranchFolding;

/// Dead code elimination transform: removes blocks unreachable from the
/// entry, then ops whose outputs nothing reads.
///
/// Ops with side effects, LOADs, and writes to address-tied or persistent
/// storage are always kept.
pub struct DeadCodeElimination;

/// Out slot of `bb` that a constant CBRANCH can never follow.
fn dead_out_slot(func: &Function, bb: BlockId) -> Option<usize> {
    let block = func.block(bb);
    if block.size_out() != 2 {
        return None;
    }
    let last = block.last_op()?;
    let op = func.op(last);
    if op.opcode() != OpCode::CBranch {
        return None;
    }
    let cond = constant_input(func, last, 1)?;
    let taken = (cond != 0) != op.is_boolean_flip();
    Some(if taken { 0 } else { 1 })
}

impl Transform for BranchFolding {
    fn name(&self) -> &str {
        "branch-folding"
    }

    fn apply(&self, func: &mut Function) -> Result<bool, CoreError> {
        let mut changed = false;
        let blocks: Vec<BlockId> = func.blocks().ids().to_vec();
        for bb in blocks {
            if !func.blocks().contains(bb) {
                continue;
            }
            if let Some(slot) = dead_out_slot(func, bb) {
                let edit = func.remove_branch(bb, slot)?;
                tracing::trace!(func = %func.name, block = %bb, slot, edges = edit.edges_removed, "folded branch");
                changed = true;
            }
        }
        Ok(changed)
    }
}

impl DeadCodeElimination {
    fn remove_dead_ops(func: &mut Function) -> Result<usize, CoreError> {
        let mut removed = 0;
        let mut worklist: Vec<OpId> = func.ops().alive().collect();
        while let Some(op) = worklist.pop() {
            if !func.ops().contains(op) || !is_removable(func, op) {
                continue;
            }
            let feeders: Vec<OpId> = func
                .op(op)
                .inputs()
                .iter()
                .flatten()
                .filter_map(|&vn| func.vn(vn).def())
                .collect();
            func.op_destroy(op)?;
            removed += 1;
            worklist.extend(feeders);
        }
        Ok(removed)
    }
}

impl Transform for DeadCodeElimination {
    fn name(&self) -> &str {
        "dead-code-elimination"
    }

    fn apply(&self, func: &mut Function) -> Result<bool, CoreError> {
        let edit = func.remove_unreachable_blocks()?;
        let removed = Self::remove_dead_ops(func)?;
        if !edit.blocks_removed.is_empty() || removed > 0 {
            tracing::debug!(
                func = %func.name,
                blocks = edit.blocks_removed.len(),
                ops = removed,
                "removed dead code"
            );
        }
        Ok(!edit.is_empty() || removed > 0)
    }
}
