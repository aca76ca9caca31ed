use std::collections::HashMap;

use crate::error::CoreError;

use super::func::Function;
use super::op::OpId;
use super::opcode::OpCode;
use super::varnode::VarnodeId;

macro_rules! ensure {
    ($cond:expr, $($arg:tt)*) => {
        if !$cond {
            return Err(CoreError::Invariant(format!($($arg)*)));
        }
    };
}

impl Function {
    /// Check every structural invariant of the graph: def/use links in both
    /// directions, block membership and ordering, edge back-pointers, merge
    /// arity, and index consistency. Returns the first violation found.
    pub fn verify(&self) -> Result<(), CoreError> {
        self.verify_links()?;
        self.verify_blocks()?;
        self.verify_side_tables()
    }

    fn verify_links(&self) -> Result<(), CoreError> {
        let mut reads: HashMap<(VarnodeId, OpId), usize> = HashMap::new();

        for (op_id, op) in self.ops.iter() {
            for (slot, vn) in op.inputs().iter().enumerate() {
                let Some(vn) = *vn else { continue };
                ensure!(
                    self.values.contains(vn),
                    "{op_id} slot {slot} refers to destroyed {vn}"
                );
                *reads.entry((vn, op_id)).or_default() += 1;
            }
            if let Some(out) = op.output() {
                ensure!(self.values.contains(out), "{op_id} output {out} was destroyed");
                ensure!(
                    self.values[out].def() == Some(op_id),
                    "{op_id} outputs {out} but {out} is defined by {:?}",
                    self.values[out].def()
                );
            }
        }

        for (vn_id, vn) in self.values.iter() {
            if let Some(def) = vn.def() {
                ensure!(self.ops.contains(def), "{vn_id} defined by destroyed {def}");
                ensure!(
                    self.ops[def].output() == Some(vn_id),
                    "{vn_id} claims {def} as def, which outputs {:?}",
                    self.ops[def].output()
                );
                ensure!(!vn.is_input(), "input {vn_id} has def {def}");
            }
            let mut counts: HashMap<OpId, usize> = HashMap::new();
            for &op in vn.descend() {
                ensure!(self.ops.contains(op), "{vn_id} read by destroyed {op}");
                *counts.entry(op).or_default() += 1;
            }
            for (&op, &n) in &counts {
                let slots = reads.get(&(vn_id, op)).copied().unwrap_or(0);
                ensure!(
                    slots == n,
                    "{vn_id} lists {op} {n} time(s) but {op} reads it in {slots} slot(s)"
                );
            }
        }

        for (&(vn, op), &n) in &reads {
            let listed = self.values[vn].descend().iter().filter(|&&d| d == op).count();
            ensure!(listed == n, "{op} reads {vn} in {n} slot(s) but is listed {listed} time(s)");
        }

        let (by_loc, by_def) = self.values.index_len();
        ensure!(
            by_loc == self.values.len() && by_def == self.values.len(),
            "value indices out of sync: {by_loc}/{by_def} entries for {} varnodes",
            self.values.len()
        );
        Ok(())
    }

    fn verify_blocks(&self) -> Result<(), CoreError> {
        let mut placed = 0usize;
        for (bb_id, bb) in self.blocks.iter() {
            for (i, &op) in bb.ops().iter().enumerate() {
                ensure!(self.ops.contains(op), "{bb_id} holds destroyed {op}");
                let pcode = &self.ops[op];
                ensure!(
                    pcode.parent() == Some(bb_id),
                    "{op} listed in {bb_id} but parent is {:?}",
                    pcode.parent()
                );
                ensure!(
                    pcode.order() as usize == i,
                    "{op} at position {i} of {bb_id} has order {}",
                    pcode.order()
                );
                ensure!(self.ops.is_alive(op), "{op} placed in {bb_id} but on the dead list");
                if pcode.opcode() == OpCode::MultiEqual {
                    ensure!(
                        pcode.num_inputs() == bb.size_in(),
                        "merge {op} in {bb_id} has {} input(s) for {} in-edge(s)",
                        pcode.num_inputs(),
                        bb.size_in()
                    );
                }
                placed += 1;
            }
            for (slot, e) in bb.outs().iter().enumerate() {
                ensure!(self.blocks.contains(e.point), "{bb_id} out {slot} to removed {}", e.point);
                let back = self.blocks[e.point].ins().get(e.rev);
                ensure!(
                    back.is_some_and(|b| b.point == bb_id && b.rev == slot),
                    "{bb_id} out {slot} has no matching in-edge on {}",
                    e.point
                );
            }
            for (slot, e) in bb.ins().iter().enumerate() {
                ensure!(self.blocks.contains(e.point), "{bb_id} in {slot} from removed {}", e.point);
                let back = self.blocks[e.point].outs().get(e.rev);
                ensure!(
                    back.is_some_and(|b| b.point == bb_id && b.rev == slot),
                    "{bb_id} in {slot} has no matching out-edge on {}",
                    e.point
                );
            }
        }

        let alive = self.ops.alive().count();
        ensure!(alive == placed, "{alive} op(s) marked alive but {placed} placed in blocks");
        for op in self.ops.dead() {
            ensure!(self.ops[op].is_dead(), "{op} on the dead list has a parent block");
        }
        Ok(())
    }

    fn verify_side_tables(&self) -> Result<(), CoreError> {
        for spec in &self.call_specs {
            ensure!(self.ops.contains(spec.op), "call spec for destroyed {}", spec.op);
        }
        for table in &self.jump_tables {
            ensure!(self.ops.contains(table.op()), "jump table for destroyed {}", table.op());
        }
        Ok(())
    }
}
