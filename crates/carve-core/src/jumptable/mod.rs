//! Jump-table recovery for indirect branches.
//!
//! Recovery works on a disposable partial clone of the function: the blocks
//! that can reach the branch are copied, simplified with the reduced
//! pipeline, and the branch target is matched against a small set of table
//! shapes. Only the resulting destination list flows back into the real
//! function, as out edges of the branch's block.

mod model;
mod partial;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::context::{ProgramContext, UserOpKind};
use crate::error::CoreError;
use crate::ir::{BlockId, Function, OpCode, OpId, VarnodeId};
use crate::transforms::reduced_pipeline;

use model::TableModel;

/// The recovered destinations of one BRANCHIND.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JumpTable {
    op: OpId,
    destinations: Vec<u64>,
    #[serde(default)]
    default: Option<u64>,
    /// Number of times this table has been (re)installed.
    #[serde(default)]
    stage: u32,
    /// Supplied by the user; never re-derived.
    #[serde(default, rename = "override")]
    is_override: bool,
    /// Some destinations had no block when the table was installed.
    #[serde(default)]
    partial: bool,
}

impl JumpTable {
    pub fn op(&self) -> OpId {
        self.op
    }

    /// Destination addresses in table order. Duplicates are kept.
    pub fn destinations(&self) -> &[u64] {
        &self.destinations
    }

    pub fn default_destination(&self) -> Option<u64> {
        self.default
    }

    pub fn stage(&self) -> u32 {
        self.stage
    }

    pub fn is_override(&self) -> bool {
        self.is_override
    }

    pub fn is_partial(&self) -> bool {
        self.partial
    }
}

/// Result of [`Function::recover_jump_table`]. Every variant other than
/// `Recovered` is an expected negative outcome, not an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "kebab-case")]
pub enum JumpTableOutcome {
    Recovered {
        destinations: Vec<u64>,
        default: Option<u64>,
        /// An earlier complete table was returned without re-simplifying.
        reused: bool,
    },
    /// The backward scan found the target computed by an opaque call.
    Infeasible,
    Failed {
        reason: String,
    },
    /// The branch forwards to another function.
    Thunk,
    /// No flow from the entry reaches the branch.
    Unreachable,
    /// Recovery is switched off for this function or program.
    Disabled,
}

impl JumpTableOutcome {
    pub fn is_recovered(&self) -> bool {
        matches!(self, JumpTableOutcome::Recovered { .. })
    }
}

impl fmt::Display for JumpTableOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JumpTableOutcome::Recovered {
                destinations,
                default,
                reused,
            } => {
                let dests: Vec<String> = destinations.iter().map(|d| format!("{d:#x}")).collect();
                write!(f, "recovered [{}]", dests.join(", "))?;
                if let Some(d) = default {
                    write!(f, " default {d:#x}")?;
                }
                if *reused {
                    f.write_str(" (reused)")?;
                }
                Ok(())
            }
            JumpTableOutcome::Infeasible => f.write_str("infeasible"),
            JumpTableOutcome::Failed { reason } => write!(f, "failed: {reason}"),
            JumpTableOutcome::Thunk => f.write_str("thunk"),
            JumpTableOutcome::Unreachable => f.write_str("unreachable"),
            JumpTableOutcome::Disabled => f.write_str("disabled"),
        }
    }
}

impl Function {
    /// Record a user-supplied table for `op`. It is installed, without any
    /// analysis, the next time the branch is recovered.
    pub fn add_override_table(&mut self, op: OpId, destinations: Vec<u64>) -> Result<(), CoreError> {
        if self.op_checked(op)?.opcode() != OpCode::BranchInd {
            return Err(self.violation(CoreError::NotIndirectBranch { op }));
        }
        let stage = self.remove_jump_table(op).map_or(0, |t| t.stage);
        self.jump_tables.push(JumpTable {
            op,
            destinations,
            default: None,
            stage,
            is_override: true,
            partial: false,
        });
        Ok(())
    }

    /// Recover the destinations of the BRANCHIND `op` and install them as
    /// out edges of its block.
    pub fn recover_jump_table(&mut self, op: OpId) -> Result<JumpTableOutcome, CoreError> {
        let pcode = self.op_checked(op)?;
        if pcode.opcode() != OpCode::BranchInd {
            return Err(self.violation(CoreError::NotIndirectBranch { op }));
        }
        let Some(bb) = pcode.parent() else {
            return Err(self.violation(CoreError::NotInserted { op }));
        };

        if let Some(table) = self.find_jump_table(op) {
            if table.is_override {
                let (destinations, default) = (table.destinations.clone(), table.default);
                self.install_table(op, bb, destinations.clone(), default, true)?;
                return Ok(JumpTableOutcome::Recovered {
                    destinations,
                    default,
                    reused: false,
                });
            }
            if !table.partial {
                tracing::trace!(func = %self.name, op = %op, "reusing recovered jump table");
                return Ok(JumpTableOutcome::Recovered {
                    destinations: table.destinations.clone(),
                    default: table.default,
                    reused: true,
                });
            }
        }

        let ctx = self.context_or_default();
        let config = &ctx.config.jumptable;
        if !config.enabled || self.state.no_jumptable_recovery || self.state.jumptable_recovery {
            return Ok(JumpTableOutcome::Disabled);
        }
        let outcome = self.analyze_jump_table(op, bb, &ctx)?;
        if !outcome.is_recovered() {
            if let Some(stale) = self.remove_jump_table(op) {
                tracing::debug!(
                    func = %self.name,
                    op = %op,
                    stage = stale.stage,
                    %outcome,
                    "discarded jump table"
                );
            }
        }
        Ok(outcome)
    }

    /// Run the early scan, the partial clone and the table model for `op`,
    /// installing the table on success.
    fn analyze_jump_table(
        &mut self,
        op: OpId,
        bb: BlockId,
        ctx: &ProgramContext,
    ) -> Result<JumpTableOutcome, CoreError> {
        let config = &ctx.config.jumptable;
        if self.early_jump_table_fail(op, ctx) {
            tracing::debug!(func = %self.name, op = %op, "jump table computed by opaque call");
            return Ok(JumpTableOutcome::Infeasible);
        }

        let Some(mut clone) = partial::build(self, op)? else {
            return Ok(JumpTableOutcome::Unreachable);
        };
        self.stats.partial_clones += 1;
        let report = reduced_pipeline(&ctx.config.passes, config.max_simplify_passes).run(&mut clone)?;
        self.stats.simplify_passes += report.passes as u32;

        let seq = self.ops[op].seq();
        let Some(cloned) = clone.ops.find(seq).filter(|&c| clone.ops[c].parent().is_some()) else {
            return Ok(JumpTableOutcome::Unreachable);
        };
        match model::analyze(&mut clone, cloned, ctx, config) {
            TableModel::Table {
                destinations,
                default_edge,
            } => {
                let default = default_edge.and_then(|(seq, slot)| self.edge_target_addr(seq, slot));
                self.install_table(op, bb, destinations.clone(), default, false)?;
                Ok(JumpTableOutcome::Recovered {
                    destinations,
                    default,
                    reused: false,
                })
            }
            TableModel::Thunk => Ok(JumpTableOutcome::Thunk),
            TableModel::Failed(reason) => {
                tracing::debug!(func = %self.name, op = %op, %reason, "jump table recovery failed");
                Ok(JumpTableOutcome::Failed { reason })
            }
        }
    }

    /// Recover every BRANCHIND in the function, in address order.
    pub fn recover_jump_tables(&mut self) -> Result<Vec<(OpId, JumpTableOutcome)>, CoreError> {
        let branches: Vec<OpId> = self
            .ops
            .iter_by_seq()
            .filter(|&op| self.ops[op].opcode() == OpCode::BranchInd && self.ops[op].parent().is_some())
            .collect();
        let mut outcomes = Vec::with_capacity(branches.len());
        for op in branches {
            if !self.ops.contains(op) {
                continue;
            }
            let outcome = self.recover_jump_table(op)?;
            outcomes.push((op, outcome));
        }
        Ok(outcomes)
    }

    /// Cheap backward scan over the ops feeding the branch target. True if
    /// the address is produced by an opaque call, so a table can never be
    /// found.
    fn early_jump_table_fail(&self, op: OpId, ctx: &ProgramContext) -> bool {
        let lookahead = ctx.config.jumptable.early_fail_lookahead;
        let Some(mut tracked) = self.ops[op].input(0) else {
            return false;
        };
        let Some(bb) = self.ops[op].parent() else {
            return false;
        };
        let ops = self.blocks[bb].ops();
        let Some(pos) = ops.iter().position(|&o| o == op) else {
            return false;
        };
        for &prev in ops[..pos].iter().rev().take(lookahead) {
            // A byte-wide value is a table index or a flag, not an address
            // an opaque call could have produced; leave it to the model.
            if self.values[tracked].size() == 1 {
                return false;
            }
            let pcode = &self.ops[prev];
            let hit = pcode
                .output()
                .is_some_and(|out| self.values[out].intersects(&self.values[tracked]));
            match pcode.opcode() {
                OpCode::Call | OpCode::CallInd => return hit,
                OpCode::CallOther => {
                    let index = pcode.input(0).and_then(|v| self.values[v].constant_value());
                    match index.map(|i| ctx.userops.kind(i)) {
                        Some(UserOpKind::Opaque) | None => {
                            if hit {
                                return true;
                            }
                        }
                        Some(_) => return false,
                    }
                }
                OpCode::Store => return false,
                opcode if opcode.is_branch() => return false,
                _ if !hit => {}
                _ => match self.address_source(prev, tracked) {
                    Some(src) => tracked = src,
                    None => return false,
                },
            }
        }
        false
    }

    /// The input `prev` forms the tracked address from: the operand of a
    /// same-size unary op, or of an ADD/SUB/XOR with a constant.
    fn address_source(&self, prev: OpId, tracked: VarnodeId) -> Option<VarnodeId> {
        let pcode = &self.ops[prev];
        let src = match pcode.opcode() {
            OpCode::Copy | OpCode::IntNegate | OpCode::Int2Comp => pcode.input(0)?,
            OpCode::IntAdd | OpCode::IntSub | OpCode::IntXor => {
                let k = pcode.input(1)?;
                if !self.values[k].is_constant() {
                    return None;
                }
                pcode.input(0)?
            }
            _ => return None,
        };
        (self.values[src].size() == self.values[tracked].size()).then_some(src)
    }

    /// Start address of the block at out edge `slot` of the block holding
    /// the op with sequence number `seq`.
    fn edge_target_addr(&self, seq: crate::ir::SeqNum, slot: usize) -> Option<u64> {
        let op = self.ops.find(seq)?;
        let bb = self.ops[op].parent()?;
        let target = self.blocks[bb].out_block(slot)?;
        self.block_start(target)
    }

    fn block_start(&self, bb: BlockId) -> Option<u64> {
        let block = &self.blocks[bb];
        block
            .start_addr()
            .or_else(|| block.first_op().map(|op| self.ops[op].addr()))
    }

    /// Rebuild the out edges of `bb` from `destinations` and record the table.
    fn install_table(
        &mut self,
        op: OpId,
        bb: BlockId,
        destinations: Vec<u64>,
        default: Option<u64>,
        is_override: bool,
    ) -> Result<(), CoreError> {
        let addr = self.ops[op].addr();
        let mut wanted: Vec<BlockId> = Vec::new();
        let mut partial = false;
        for &dest in &destinations {
            match self.block_at(dest) {
                Some(target) => {
                    if !wanted.contains(&target) {
                        wanted.push(target);
                    }
                }
                None => {
                    self.warn(addr, format!("jump table destination {dest:#x} has no block"));
                    partial = true;
                }
            }
        }

        // Drop stale and duplicate edges, highest slot first so lower slots
        // keep their numbers.
        let mut seen: Vec<BlockId> = Vec::new();
        let mut stale: Vec<usize> = Vec::new();
        for (slot, edge) in self.blocks[bb].outs().iter().enumerate() {
            if wanted.contains(&edge.point) && !seen.contains(&edge.point) {
                seen.push(edge.point);
            } else {
                stale.push(slot);
            }
        }
        for slot in stale.into_iter().rev() {
            let edit = self.remove_branch(bb, slot)?;
            tracing::trace!(block = %bb, slot, merges = edit.merges_collapsed, "dropped stale switch edge");
        }

        for target in wanted {
            if seen.contains(&target) {
                continue;
            }
            let (_, in_slot) = self.blocks.add_edge(bb, target);
            let merges = self.merges_of(target);
            for m in &merges {
                let Some(out) = self.ops[*m].output() else {
                    continue;
                };
                let (size, loc) = (self.values[out].size(), self.values[out].loc());
                let placeholder = self.new_varnode(size, loc);
                self.op_insert_input(*m, placeholder, in_slot)?;
            }
            if !merges.is_empty() {
                self.state.heritage_pending = true;
            }
        }
        self.blocks.set_switch_out(bb, true);

        let stage = self.remove_jump_table(op).map_or(0, |t| t.stage + 1);
        tracing::debug!(
            func = %self.name,
            op = %op,
            destinations = destinations.len(),
            edges = self.blocks[bb].size_out(),
            partial,
            "installed jump table"
        );
        self.jump_tables.push(JumpTable {
            op,
            destinations,
            default,
            stage,
            is_override,
            partial,
        });
        Ok(())
    }
}
