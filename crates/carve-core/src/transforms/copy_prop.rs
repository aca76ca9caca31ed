use crate::error::CoreError;
use crate::ir::{Function, OpCode, OpId, VarnodeId};
use crate::pipeline::Transform;

use super::util::is_pinned;

/// Copy propagation: readers of a COPY's output read its source instead,
/// and a merge whose inputs are all one value (or itself) is bypassed the
/// same way unless flagged `no_collapse`. The bypassed op is left for
/// dead-code elimination.
pub struct CopyPropagation;

/// The value every read of `op`'s output can be redirected to.
fn forwarded_value(func: &Function, op: OpId) -> Option<(VarnodeId, VarnodeId)> {
    let pcode = func.op(op);
    let out = pcode.output()?;
    if is_pinned(func, out) || func.vn(out).has_no_descend() {
        return None;
    }
    let src = match pcode.opcode() {
        OpCode::Copy => pcode.input(0)?,
        OpCode::MultiEqual if !pcode.flags().no_collapse => {
            let mut unique: Option<VarnodeId> = None;
            for slot in pcode.inputs() {
                let vn = (*slot)?;
                if vn == out {
                    continue;
                }
                match unique {
                    None => unique = Some(vn),
                    Some(u) if u == vn => {}
                    Some(_) => return None,
                }
            }
            unique?
        }
        _ => return None,
    };
    if src == out || func.vn(src).flags().annotation {
        return None;
    }
    Some((out, src))
}

impl Transform for CopyPropagation {
    fn name(&self) -> &str {
        "copy-propagation"
    }

    fn apply(&self, func: &mut Function) -> Result<bool, CoreError> {
        let mut changed = false;
        let ops: Vec<OpId> = func.ops().alive().collect();
        for op in ops {
            if !func.ops().contains(op) {
                continue;
            }
            if let Some((out, src)) = forwarded_value(func, op) {
                func.total_replace(out, src)?;
                changed = true;
            }
        }
        Ok(changed)
    }
}
