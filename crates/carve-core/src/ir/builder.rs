use std::sync::Arc;

use crate::context::ProgramContext;
use crate::error::CoreError;

use super::address::{AddrRange, Address, Space};
use super::block::BlockId;
use super::func::Function;
use super::op::OpId;
use super::opcode::OpCode;
use super::varnode::VarnodeId;

/// Distance between the addresses of consecutive emitted ops.
const INSN_STRIDE: u64 = 4;

/// Builder for constructing a single [`Function`] already in SSA form.
///
/// Tracks a "current block" cursor and a program counter; ops are appended
/// to the current block at the current address, which then advances.
/// Edits go through the graph editor, so the result satisfies every graph
/// invariant. Editor errors are collected rather than returned from each
/// call; see [`FunctionBuilder::try_build`].
pub struct FunctionBuilder {
    func: Function,
    current_block: BlockId,
    pc: u64,
    errors: Vec<CoreError>,
}

impl FunctionBuilder {
    /// Create a builder with an entry block starting at `entry_addr`.
    pub fn new(name: impl Into<String>, entry_addr: u64) -> Self {
        let mut func = Function::new(name, entry_addr);
        let entry = func.blocks.new_block(Some(AddrRange {
            start: entry_addr,
            end: entry_addr,
        }));
        Self {
            func,
            current_block: entry,
            pc: entry_addr,
            errors: Vec::new(),
        }
    }

    /// Attach a program context; varnodes created afterwards are tagged from it.
    pub fn with_context(mut self, ctx: Arc<ProgramContext>) -> Self {
        self.func.set_context(ctx);
        self
    }

    /// Create a block whose range starts at `addr`.
    pub fn create_block_at(&mut self, addr: u64) -> BlockId {
        self.func.blocks.new_block(Some(AddrRange {
            start: addr,
            end: addr,
        }))
    }

    /// Switch the cursor to `block`; the program counter moves to the
    /// block's start address if it has one.
    pub fn switch_to_block(&mut self, block: BlockId) {
        self.current_block = block;
        if let Some(start) = self.func.blocks[block].start_addr() {
            self.pc = start;
        }
    }

    pub fn current_block(&self) -> BlockId {
        self.current_block
    }

    pub fn pc(&self) -> u64 {
        self.pc
    }

    pub fn func(&self) -> &Function {
        &self.func
    }

    pub fn func_mut(&mut self) -> &mut Function {
        &mut self.func
    }

    /// Consume the builder and return the constructed `Function`.
    ///
    /// # Panics
    ///
    /// Panics if any edit made while building failed. Use
    /// [`FunctionBuilder::try_build`] to get the error instead.
    pub fn build(self) -> Function {
        match self.try_build() {
            Ok(func) => func,
            Err(e) => panic!("function builder hit an editor error: {e}"),
        }
    }

    /// Like [`FunctionBuilder::build`], failing with the first editor error.
    pub fn try_build(mut self) -> Result<Function, CoreError> {
        if self.errors.is_empty() {
            Ok(self.func)
        } else {
            Err(self.errors.swap_remove(0))
        }
    }

    // -- internal helpers --

    fn record<T>(&mut self, result: Result<T, CoreError>) -> Option<T> {
        match result {
            Ok(v) => Some(v),
            Err(e) => {
                self.errors.push(e);
                None
            }
        }
    }

    /// Create an op reading `inputs` and place it in the current block.
    fn emit(&mut self, opcode: OpCode, inputs: &[VarnodeId], output: Option<VarnodeId>) -> OpId {
        let op = self.func.new_op(opcode, inputs.len(), self.pc);
        for (slot, &vn) in inputs.iter().enumerate() {
            let r = self.func.op_set_input(op, vn, slot);
            self.record(r);
        }
        if let Some(out) = output {
            let r = self.func.op_set_output(op, out);
            self.record(r);
        }
        let r = if opcode == OpCode::MultiEqual {
            self.func.op_insert_begin(op, self.current_block)
        } else {
            self.func.op_insert_end(op, self.current_block)
        };
        self.record(r);
        self.pc += INSN_STRIDE;
        let block = self.func.blocks.block_mut(self.current_block);
        if let Some(range) = block.range.as_mut() {
            range.end = range.end.max(self.pc);
        }
        op
    }

    fn annotation(&mut self, addr: u64) -> VarnodeId {
        let vn = self.func.new_varnode(8, Address::ram(addr));
        self.func.vn_flags_mut(vn).annotation = true;
        vn
    }

    fn block_addr(&self, block: BlockId) -> u64 {
        self.func.blocks[block].start_addr().unwrap_or(0)
    }

    // ========================================================================
    // Varnodes
    // ========================================================================

    /// The function input at `loc`, created on first use.
    pub fn input(&mut self, size: u32, loc: Address) -> VarnodeId {
        let r = self.func.find_or_create_input(size, loc);
        match self.record(r) {
            Some(vn) => vn,
            None => self.func.new_varnode(size, loc),
        }
    }

    /// A fresh constant (constants are never shared between readers).
    pub fn constant(&mut self, size: u32, value: u64) -> VarnodeId {
        self.func.new_constant(size, value)
    }

    /// A free varnode at `loc`, typically used as an op output.
    pub fn varnode(&mut self, size: u32, loc: Address) -> VarnodeId {
        self.func.new_varnode(size, loc)
    }

    // ========================================================================
    // Data flow
    // ========================================================================

    /// Emit an op whose output is a fresh temporary.
    pub fn op(&mut self, opcode: OpCode, inputs: &[VarnodeId], size: u32) -> (OpId, VarnodeId) {
        let out = self.func.new_unique(size);
        let op = self.emit(opcode, inputs, Some(out));
        (op, out)
    }

    /// Emit an op whose output lives at `loc`.
    pub fn op_to(&mut self, opcode: OpCode, inputs: &[VarnodeId], size: u32, loc: Address) -> (OpId, VarnodeId) {
        let out = self.func.new_varnode(size, loc);
        let op = self.emit(opcode, inputs, Some(out));
        (op, out)
    }

    pub fn copy(&mut self, src: VarnodeId) -> (OpId, VarnodeId) {
        let size = self.func.vn(src).size();
        self.op(OpCode::Copy, &[src], size)
    }

    pub fn unop(&mut self, opcode: OpCode, a: VarnodeId, size: u32) -> (OpId, VarnodeId) {
        self.op(opcode, &[a], size)
    }

    pub fn binop(&mut self, opcode: OpCode, a: VarnodeId, b: VarnodeId, size: u32) -> (OpId, VarnodeId) {
        self.op(opcode, &[a, b], size)
    }

    /// LOAD of `size` bytes from the RAM address held in `ptr`.
    pub fn load(&mut self, ptr: VarnodeId, size: u32) -> (OpId, VarnodeId) {
        let space = self.constant(4, Space::Ram as u64);
        self.op(OpCode::Load, &[space, ptr], size)
    }

    pub fn store(&mut self, ptr: VarnodeId, value: VarnodeId) -> OpId {
        let space = self.constant(4, Space::Ram as u64);
        self.emit(OpCode::Store, &[space, ptr, value], None)
    }

    /// MULTIEQUAL at the top of the current block. `inputs` must line up
    /// with the block's in-edges.
    pub fn multiequal(&mut self, inputs: &[VarnodeId], size: u32, loc: Address) -> (OpId, VarnodeId) {
        self.op_to(OpCode::MultiEqual, inputs, size, loc)
    }

    // ========================================================================
    // Control flow
    // ========================================================================

    /// Add a raw edge, for fall-through flow without a branch op.
    pub fn edge(&mut self, from: BlockId, to: BlockId) {
        self.func.blocks.add_edge(from, to);
    }

    pub fn branch(&mut self, target: BlockId) -> OpId {
        let dest = self.annotation(self.block_addr(target));
        let op = self.emit(OpCode::Branch, &[dest], None);
        self.func.blocks.add_edge(self.current_block, target);
        op
    }

    /// Conditional branch: out edge 0 goes to `fallthrough`, out edge 1 to
    /// `taken`.
    pub fn cbranch(&mut self, cond: VarnodeId, taken: BlockId, fallthrough: BlockId) -> OpId {
        let dest = self.annotation(self.block_addr(taken));
        let op = self.emit(OpCode::CBranch, &[dest, cond], None);
        self.func.blocks.add_edge(self.current_block, fallthrough);
        self.func.blocks.add_edge(self.current_block, taken);
        op
    }

    /// Indirect branch through `target`; edges come from jump-table recovery.
    pub fn branchind(&mut self, target: VarnodeId) -> OpId {
        self.emit(OpCode::BranchInd, &[target], None)
    }

    pub fn ret(&mut self, value: Option<VarnodeId>) -> OpId {
        let inputs: Vec<VarnodeId> = value.into_iter().collect();
        self.emit(OpCode::Return, &inputs, None)
    }

    /// Direct call to `target`, registered with a call spec.
    pub fn call(&mut self, target: u64, args: &[VarnodeId]) -> OpId {
        let dest = self.annotation(target);
        let inputs: Vec<VarnodeId> = std::iter::once(dest).chain(args.iter().copied()).collect();
        let op = self.emit(OpCode::Call, &inputs, None);
        let r = self.func.register_call(op, Some(target));
        self.record(r);
        op
    }

    /// Direct call whose result lands at `loc`.
    pub fn call_to(&mut self, target: u64, args: &[VarnodeId], size: u32, loc: Address) -> (OpId, VarnodeId) {
        let dest = self.annotation(target);
        let inputs: Vec<VarnodeId> = std::iter::once(dest).chain(args.iter().copied()).collect();
        let (op, out) = self.op_to(OpCode::Call, &inputs, size, loc);
        let r = self.func.register_call(op, Some(target));
        self.record(r);
        (op, out)
    }

    /// User-defined op `index` whose result lands at `loc`.
    pub fn callother(&mut self, index: u64, args: &[VarnodeId], size: u32, loc: Address) -> (OpId, VarnodeId) {
        let idx = self.constant(4, index);
        let inputs: Vec<VarnodeId> = std::iter::once(idx).chain(args.iter().copied()).collect();
        self.op_to(OpCode::CallOther, &inputs, size, loc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diamond_with_merge() {
        let mut fb = FunctionBuilder::new("diamond", 0x100);
        let x = fb.input(4, Address::register(0));
        let zero = fb.constant(4, 0);
        let (_, cond) = fb.binop(OpCode::IntEqual, x, zero, 1);
        let a = fb.create_block_at(0x200);
        let b = fb.create_block_at(0x300);
        let join = fb.create_block_at(0x400);
        fb.cbranch(cond, b, a);
        fb.switch_to_block(a);
        let one = fb.constant(4, 1);
        let (_, va) = fb.op_to(OpCode::Copy, &[one], 4, Address::register(8));
        fb.branch(join);
        fb.switch_to_block(b);
        let two = fb.constant(4, 2);
        let (_, vb) = fb.op_to(OpCode::Copy, &[two], 4, Address::register(8));
        fb.branch(join);
        fb.switch_to_block(join);
        let (phi, v) = fb.multiequal(&[va, vb], 4, Address::register(8));
        fb.ret(Some(v));
        let f = fb.try_build().unwrap();

        assert!(f.verify().is_ok());
        let entry = f.blocks().entry().unwrap();
        assert_eq!(f.block(entry).out_block(0), Some(a));
        assert_eq!(f.block(entry).out_block(1), Some(b));
        assert_eq!(f.block(join).first_op(), Some(phi));
        assert_eq!(f.block_at(0x300), Some(b));
        assert_eq!(f.op(phi).addr(), 0x400);
    }

    #[test]
    fn calls_get_specs() {
        let mut fb = FunctionBuilder::new("caller", 0x100);
        let x = fb.input(4, Address::register(0));
        let call = fb.call(0x5000, &[x]);
        fb.ret(None);
        let f = fb.build();
        assert_eq!(f.call_spec(call).and_then(|c| c.target), Some(0x5000));
    }

    #[test]
    fn editor_errors_flag_rebuild() {
        let mut fb = FunctionBuilder::new("bad", 0x100);
        let x = fb.input(4, Address::register(0));
        let (_, out) = fb.copy(x);
        let copy = fb.func_mut().new_op(OpCode::Copy, 1, 0x100);
        let r = fb.func_mut().op_set_output(copy, out);
        assert!(r.is_err());
        let (op, _) = fb.copy(x);
        let r = fb.func_mut().op_set_input(op, x, 3);
        assert!(r.is_err());
        assert!(fb.func().state().needs_rebuild);
    }

    #[test]
    fn overlapping_input_fails_the_build() {
        let mut fb = FunctionBuilder::new("overlap", 0x100);
        fb.input(4, Address::register(0));
        fb.input(2, Address::register(2));
        fb.ret(None);
        let err = fb.try_build().unwrap_err();
        assert!(matches!(err, CoreError::OverlappingInput { .. }));
    }

    #[test]
    #[should_panic(expected = "editor error")]
    fn build_panics_on_recorded_error() {
        let mut fb = FunctionBuilder::new("overlap", 0x100);
        fb.input(4, Address::register(0));
        fb.input(2, Address::register(2));
        fb.ret(None);
        let _ = fb.build();
    }
}
