use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::context::ProgramContext;
use crate::error::CoreError;
use crate::jumptable::JumpTable;

use super::block::{BasicBlock, BlockGraph, BlockId};
use super::op::{OpId, OpStore, PcodeOp};
use super::opcode::OpCode;
use super::varnode::{ValueStore, Varnode, VarnodeId};

/// Lifecycle and analysis flags of one function.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FuncState {
    pub processing_started: bool,
    pub processing_complete: bool,
    /// This function is a partial clone built for jump-table recovery.
    pub jumptable_recovery: bool,
    pub no_jumptable_recovery: bool,
    /// A contract violation left the graph in an unknown state.
    pub needs_rebuild: bool,
    /// New control flow introduced storage that SSA construction must revisit.
    pub heritage_pending: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisStats {
    pub partial_clones: u32,
    pub simplify_passes: u32,
}

/// A note recorded against the function for later surfacing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Warning {
    pub addr: u64,
    pub message: String,
}

/// One candidate parameter location of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamTrial {
    pub addr: super::address::Address,
    pub size: u32,
    pub active: bool,
}

/// Per-call-site metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallSpec {
    pub op: OpId,
    pub target: Option<u64>,
    #[serde(default)]
    pub trials: Vec<ParamTrial>,
}

/// The IR of one function: its varnodes, ops, and control-flow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Function {
    pub name: String,
    pub entry_addr: u64,
    pub(crate) values: ValueStore,
    pub(crate) ops: OpStore,
    pub(crate) blocks: BlockGraph,
    #[serde(default)]
    pub(crate) jump_tables: Vec<JumpTable>,
    #[serde(default)]
    pub(crate) call_specs: Vec<CallSpec>,
    #[serde(default)]
    pub(crate) warnings: Vec<Warning>,
    #[serde(default)]
    pub(crate) state: FuncState,
    #[serde(default)]
    pub(crate) stats: AnalysisStats,
    #[serde(skip)]
    pub(crate) context: Option<Arc<ProgramContext>>,
}

impl Function {
    pub fn new(name: impl Into<String>, entry_addr: u64) -> Self {
        Self {
            name: name.into(),
            entry_addr,
            values: ValueStore::new(),
            ops: OpStore::new(),
            blocks: BlockGraph::new(),
            jump_tables: Vec::new(),
            call_specs: Vec::new(),
            warnings: Vec::new(),
            state: FuncState::default(),
            stats: AnalysisStats::default(),
            context: None,
        }
    }

    /// Deserialize and rebuild the store indices.
    pub fn from_json(json: &str) -> Result<Self, CoreError> {
        let mut func: Function = serde_json::from_str(json)?;
        func.rebuild_indices();
        Ok(func)
    }

    pub fn to_json(&self) -> Result<String, CoreError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Reconstruct every store index from the owned objects and clear
    /// `needs_rebuild`.
    pub fn rebuild_indices(&mut self) {
        self.ops.rebuild_indices();
        let ops = &self.ops;
        self.values
            .rebuild_indices(|op| ops.get(op).map(|o| o.seq()));
        self.blocks.mark_dirty();
        self.state.needs_rebuild = false;
    }

    pub fn set_context(&mut self, ctx: Arc<ProgramContext>) {
        self.context = Some(ctx);
    }

    pub fn context(&self) -> Option<&Arc<ProgramContext>> {
        self.context.as_ref()
    }

    /// The attached context, or an empty default one.
    pub(crate) fn context_or_default(&self) -> Arc<ProgramContext> {
        self.context
            .clone()
            .unwrap_or_else(|| Arc::new(ProgramContext::default()))
    }

    pub fn values(&self) -> &ValueStore {
        &self.values
    }

    pub fn ops(&self) -> &OpStore {
        &self.ops
    }

    pub fn blocks(&self) -> &BlockGraph {
        &self.blocks
    }

    /// The varnode behind `id`.
    ///
    /// # Panics
    ///
    /// Panics if `id` was destroyed. Handles held across edits should go
    /// through `values().get(id)` instead.
    pub fn vn(&self, id: VarnodeId) -> &Varnode {
        &self.values[id]
    }

    /// The op behind `id`. Panics on a destroyed handle like [`Function::vn`];
    /// `ops().get(id)` is the checked form.
    pub fn op(&self, id: OpId) -> &PcodeOp {
        &self.ops[id]
    }

    /// Panics on a removed block; `blocks().get(id)` is the checked form.
    pub fn block(&self, id: BlockId) -> &BasicBlock {
        &self.blocks[id]
    }

    pub fn state(&self) -> &FuncState {
        &self.state
    }

    pub fn stats(&self) -> &AnalysisStats {
        &self.stats
    }

    pub fn set_no_jumptable_recovery(&mut self, on: bool) {
        self.state.no_jumptable_recovery = on;
    }

    pub fn warnings(&self) -> &[Warning] {
        &self.warnings
    }

    pub fn warn(&mut self, addr: u64, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!(func = %self.name, addr, "{message}");
        self.warnings.push(Warning { addr, message });
    }

    /// Record a warning unless an identical one is already present.
    pub fn warn_once(&mut self, addr: u64, message: impl Into<String>) {
        let message = message.into();
        if self
            .warnings
            .iter()
            .any(|w| w.addr == addr && w.message == message)
        {
            return;
        }
        self.warn(addr, message);
    }

    pub fn call_specs(&self) -> &[CallSpec] {
        &self.call_specs
    }

    pub fn call_spec(&self, op: OpId) -> Option<&CallSpec> {
        self.call_specs.iter().find(|c| c.op == op)
    }

    /// Attach call-site metadata to a CALL or CALLIND.
    pub fn register_call(&mut self, op: OpId, target: Option<u64>) -> Result<(), CoreError> {
        let opcode = self.op_checked(op)?.opcode();
        if !matches!(opcode, OpCode::Call | OpCode::CallInd) {
            return Err(self.violation(CoreError::Invariant(format!(
                "{op} ({opcode}) cannot carry a call specification"
            ))));
        }
        self.call_specs.retain(|c| c.op != op);
        self.call_specs.push(CallSpec {
            op,
            target,
            trials: Vec::new(),
        });
        Ok(())
    }

    pub(crate) fn remove_call_spec(&mut self, op: OpId) {
        self.call_specs.retain(|c| c.op != op);
    }

    /// Add a parameter trial to the call at `op`.
    pub fn add_param_trial(&mut self, op: OpId, trial: ParamTrial) -> Result<(), CoreError> {
        if let Some(spec) = self.call_specs.iter_mut().find(|c| c.op == op) {
            spec.trials.push(trial);
            return Ok(());
        }
        Err(self.violation(CoreError::Invariant(format!(
            "{op} has no call specification"
        ))))
    }

    pub fn jump_tables(&self) -> &[JumpTable] {
        &self.jump_tables
    }

    pub fn find_jump_table(&self, op: OpId) -> Option<&JumpTable> {
        self.jump_tables.iter().find(|t| t.op() == op)
    }

    pub(crate) fn remove_jump_table(&mut self, op: OpId) -> Option<JumpTable> {
        let pos = self.jump_tables.iter().position(|t| t.op() == op)?;
        Some(self.jump_tables.remove(pos))
    }

    /// Block whose range starts at `addr`, or whose first op was generated
    /// from the instruction at `addr`.
    pub fn block_at(&self, addr: u64) -> Option<BlockId> {
        self.blocks.block_starting_at(addr).or_else(|| {
            self.blocks
                .iter()
                .find(|(_, bb)| bb.first_op().map(|op| self.ops[op].addr()) == Some(addr))
                .map(|(id, _)| id)
        })
    }

    /// Flag a contract violation: the graph needs a rebuild before further
    /// use. Returns the error for propagation.
    pub(crate) fn violation(&mut self, err: CoreError) -> CoreError {
        self.state.needs_rebuild = true;
        tracing::error!(func = %self.name, "{err}");
        err
    }

    pub(crate) fn op_checked(&mut self, op: OpId) -> Result<&PcodeOp, CoreError> {
        if !self.ops.contains(op) {
            return Err(self.violation(CoreError::StaleOp(op)));
        }
        Ok(&self.ops[op])
    }

    pub(crate) fn check_vn(&mut self, vn: VarnodeId) -> Result<(), CoreError> {
        if !self.values.contains(vn) {
            return Err(self.violation(CoreError::StaleVarnode(vn)));
        }
        Ok(())
    }

    pub(crate) fn check_block(&mut self, bb: BlockId) -> Result<(), CoreError> {
        if !self.blocks.contains(bb) {
            return Err(self.violation(CoreError::StaleBlock(bb)));
        }
        Ok(())
    }

    // -- Lifecycle hooks --

    pub fn start_processing(&mut self) {
        self.state.processing_started = true;
        self.state.processing_complete = false;
        tracing::debug!(func = %self.name, "start processing");
    }

    /// A structural edit happened outside the editor's knowledge.
    pub fn structure_reset(&mut self) {
        self.blocks.mark_dirty();
    }

    /// Release dead-list ops and orphaned free varnodes.
    pub fn stop_processing(&mut self) -> Result<(), CoreError> {
        let dead: Vec<OpId> = self.ops.dead().collect();
        for &op in &dead {
            self.op_unlink(op)?;
        }
        for op in dead {
            self.op_destroy(op)?;
        }
        let orphans: Vec<VarnodeId> = self
            .values
            .iter()
            .filter(|(_, vn)| vn.is_free() && vn.has_no_descend())
            .map(|(id, _)| id)
            .collect();
        for vn in orphans {
            self.destroy_varnode(vn)?;
        }
        self.state.processing_complete = true;
        tracing::debug!(func = %self.name, ops = self.ops.len(), values = self.values.len(), "stop processing");
        Ok(())
    }
}
