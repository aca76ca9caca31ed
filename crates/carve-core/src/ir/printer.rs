use std::fmt;

use super::func::Function;
use super::op::OpId;
use super::varnode::VarnodeId;

/// Display adapter for one varnode: `space offset : size`, e.g. `r0x8:4`.
pub struct VarnodeDisplay<'a> {
    func: &'a Function,
    vn: VarnodeId,
}

impl fmt::Display for VarnodeDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.func.values().get(self.vn) {
            Some(node) => write!(f, "{}:{}", node.loc(), node.size()),
            None => write!(f, "<{}?>", self.vn),
        }
    }
}

/// Display adapter for one op in raw listing form.
pub struct OpDisplay<'a> {
    func: &'a Function,
    op: OpId,
}

impl fmt::Display for OpDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Some(op) = self.func.ops().get(self.op) else {
            return write!(f, "<{}?>", self.op);
        };
        write!(f, "{}  ", op.seq())?;
        if let Some(out) = op.output() {
            write!(f, "{} = ", self.func.display_vn(out))?;
        }
        write!(f, "{}", op.opcode())?;
        for (i, slot) in op.inputs().iter().enumerate() {
            f.write_str(if i == 0 { " " } else { ", " })?;
            match slot {
                Some(vn) => write!(f, "{}", self.func.display_vn(*vn))?,
                None => f.write_str("_")?,
            }
        }
        if op.is_boolean_flip() {
            f.write_str(" [flip]")?;
        }
        if let Some(halt) = op.flags().halt {
            write!(f, " [halt {halt:?}]")?;
        }
        Ok(())
    }
}

impl Function {
    pub fn display_vn(&self, vn: VarnodeId) -> VarnodeDisplay<'_> {
        VarnodeDisplay { func: self, vn }
    }

    pub fn display_op(&self, op: OpId) -> OpDisplay<'_> {
        OpDisplay { func: self, op }
    }
}

fn fmt_edge_list(label: &str, blocks: impl Iterator<Item = String>, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let list: Vec<String> = blocks.collect();
    if !list.is_empty() {
        write!(f, " {label} {}", list.join(", "))?;
    }
    Ok(())
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "fn {} @ {:#x} {{", self.name, self.entry_addr)?;

        for (i, (id, bb)) in self.blocks().iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "  {id}")?;
            if let Some(start) = bb.start_addr() {
                write!(f, " @ {start:#x}")?;
            }
            if bb.is_entry() {
                f.write_str(" entry")?;
            }
            if bb.is_switch_out() {
                f.write_str(" switch")?;
            }
            fmt_edge_list("<-", bb.ins().iter().map(|e| e.point.to_string()), f)?;
            fmt_edge_list("->", bb.outs().iter().map(|e| e.point.to_string()), f)?;
            writeln!(f, ":")?;
            for &op in bb.ops() {
                writeln!(f, "    {}", self.display_op(op))?;
            }
        }

        for table in self.jump_tables() {
            let dests: Vec<String> = table
                .destinations()
                .iter()
                .map(|d| format!("{d:#x}"))
                .collect();
            write!(f, "  jumptable {}: [{}]", table.op(), dests.join(", "))?;
            if let Some(default) = table.default_destination() {
                write!(f, " default {default:#x}")?;
            }
            writeln!(f)?;
        }

        for w in self.warnings() {
            writeln!(f, "  warning {:#x}: {}", w.addr, w.message)?;
        }

        write!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use crate::ir::builder::FunctionBuilder;
    use crate::ir::{Address, OpCode};

    #[test]
    fn print_simple_add() {
        let mut fb = FunctionBuilder::new("add", 0x1000);
        let x = fb.input(4, Address::register(0));
        let one = fb.constant(4, 1);
        let (_, sum) = fb.binop(OpCode::IntAdd, x, one, 4);
        fb.ret(Some(sum));
        let func = fb.build();

        let output = format!("{func}");
        assert_eq!(
            output,
            "\
fn add @ 0x1000 {
  bb0 @ 0x1000 entry:
    0x1000:0  u0x10000000:4 = INT_ADD r0x0:4, #0x1:4
    0x1004:1  RETURN u0x10000000:4
}"
        );
    }

    #[test]
    fn print_edges_and_empty_slots() {
        let mut fb = FunctionBuilder::new("br", 0x10);
        let next = fb.create_block_at(0x20);
        let op = fb.branch(next);
        fb.switch_to_block(next);
        fb.ret(None);
        let mut func = fb.build();
        func.op_unset_input(op, 0).unwrap();

        let output = format!("{func}");
        assert!(output.contains("  bb0 @ 0x10 entry -> bb1:\n    0x10:0  BRANCH _\n"));
        assert!(output.contains("  bb1 @ 0x20 <- bb0:\n    0x20:1  RETURN\n"));
    }
}
