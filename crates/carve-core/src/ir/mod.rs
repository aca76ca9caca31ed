pub mod address;
pub mod block;
pub mod block_edit;
pub mod builder;
pub mod edit;
pub mod func;
pub mod op;
pub mod opcode;
pub mod printer;
pub mod structure;
pub mod varnode;
pub mod verify;

pub use address::{AddrRange, Address, SeqNum, Space};
pub use block::{BasicBlock, BlockEdge, BlockGraph, BlockId};
pub use block_edit::CfgEdit;
pub use builder::FunctionBuilder;
pub use func::{AnalysisStats, CallSpec, FuncState, Function, ParamTrial, Warning};
pub use op::{HaltKind, OpFlags, OpId, OpStore, PcodeOp};
pub use opcode::{EvalType, OpCode};
pub use structure::Structure;
pub use varnode::{ValueStore, Varnode, VarnodeFlags, VarnodeId};
