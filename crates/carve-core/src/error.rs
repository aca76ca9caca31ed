use std::path::PathBuf;

use crate::ir::{Address, BlockId, OpId, VarnodeId};

/// Core error type for the carve analysis core.
///
/// Every variant except the I/O and configuration ones is a contract
/// violation: the enclosing pass must stop, and the function is flagged as
/// needing a full rebuild.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("cannot destroy {op}: output {value} still has {readers} reader(s)")]
    LiveReaders {
        op: OpId,
        value: VarnodeId,
        readers: usize,
    },

    #[error("{value} is already defined by {def}")]
    AlreadyDefined { value: VarnodeId, def: OpId },

    #[error("{value} is an input and cannot become the output of {op}")]
    InputAsOutput { value: VarnodeId, op: OpId },

    #[error("overlapping input varnodes at {loc} (size {size})")]
    OverlappingInput { loc: Address, size: u32 },

    #[error("{value} cannot be marked as input: {reason}")]
    BadInput { value: VarnodeId, reason: String },

    #[error("slot {slot} out of range for {op} with {len} input(s)")]
    SlotOutOfRange { op: OpId, slot: usize, len: usize },

    #[error("{op} is not placed in a block")]
    NotInserted { op: OpId },

    #[error("unsound removal of {block}: {reason}")]
    UnsoundBlockRemoval { block: BlockId, reason: String },

    #[error("cannot split {block}: {reason}")]
    NodeSplit { block: BlockId, reason: String },

    #[error("bad edge {block}[{slot}]: {reason}")]
    BadEdge {
        block: BlockId,
        slot: usize,
        reason: String,
    },

    #[error("{op} is not an indirect branch")]
    NotIndirectBranch { op: OpId },

    #[error("error recovering jump table at {op}: {reason}")]
    BadPartialClone { op: OpId, reason: String },

    #[error("stale op handle {0}")]
    StaleOp(OpId),

    #[error("stale varnode handle {0}")]
    StaleVarnode(VarnodeId),

    #[error("stale block handle {0}")]
    StaleBlock(BlockId),

    #[error("graph invariant violated: {0}")]
    Invariant(String),

    #[error("configuration error in {file}: {message}")]
    Config { file: PathBuf, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
