use serde::{Deserialize, Serialize};

/// How an opcode's output is computed from its inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalType {
    Unary,
    Binary,
    /// Control flow, memory, calls, merges: anything that is not a pure
    /// function of one or two inputs.
    Special,
}

/// P-code operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpCode {
    // -- Data movement --
    Copy,
    Load,
    Store,

    // -- Control flow --
    Branch,
    CBranch,
    BranchInd,
    Call,
    CallInd,
    CallOther,
    Return,

    // -- Comparison --
    IntEqual,
    IntNotEqual,
    IntSless,
    IntSlessEqual,
    IntLess,
    IntLessEqual,

    // -- Integer arithmetic --
    IntZext,
    IntSext,
    IntAdd,
    IntSub,
    IntCarry,
    IntScarry,
    IntSborrow,
    Int2Comp,
    IntNegate,
    IntXor,
    IntAnd,
    IntOr,
    IntLeft,
    IntRight,
    IntSright,
    IntMult,
    IntDiv,
    IntSdiv,
    IntRem,
    IntSrem,

    // -- Boolean --
    BoolNegate,
    BoolXor,
    BoolAnd,
    BoolOr,

    // -- SSA / structure --
    MultiEqual,
    Piece,
    Subpiece,
    PtrAdd,
    PtrSub,
    Popcount,
    Lzcount,
}

impl OpCode {
    pub fn name(self) -> &'static str {
        match self {
            OpCode::Copy => "COPY",
            OpCode::Load => "LOAD",
            OpCode::Store => "STORE",
            OpCode::Branch => "BRANCH",
            OpCode::CBranch => "CBRANCH",
            OpCode::BranchInd => "BRANCHIND",
            OpCode::Call => "CALL",
            OpCode::CallInd => "CALLIND",
            OpCode::CallOther => "CALLOTHER",
            OpCode::Return => "RETURN",
            OpCode::IntEqual => "INT_EQUAL",
            OpCode::IntNotEqual => "INT_NOTEQUAL",
            OpCode::IntSless => "INT_SLESS",
            OpCode::IntSlessEqual => "INT_SLESSEQUAL",
            OpCode::IntLess => "INT_LESS",
            OpCode::IntLessEqual => "INT_LESSEQUAL",
            OpCode::IntZext => "INT_ZEXT",
            OpCode::IntSext => "INT_SEXT",
            OpCode::IntAdd => "INT_ADD",
            OpCode::IntSub => "INT_SUB",
            OpCode::IntCarry => "INT_CARRY",
            OpCode::IntScarry => "INT_SCARRY",
            OpCode::IntSborrow => "INT_SBORROW",
            OpCode::Int2Comp => "INT_2COMP",
            OpCode::IntNegate => "INT_NEGATE",
            OpCode::IntXor => "INT_XOR",
            OpCode::IntAnd => "INT_AND",
            OpCode::IntOr => "INT_OR",
            OpCode::IntLeft => "INT_LEFT",
            OpCode::IntRight => "INT_RIGHT",
            OpCode::IntSright => "INT_SRIGHT",
            OpCode::IntMult => "INT_MULT",
            OpCode::IntDiv => "INT_DIV",
            OpCode::IntSdiv => "INT_SDIV",
            OpCode::IntRem => "INT_REM",
            OpCode::IntSrem => "INT_SREM",
            OpCode::BoolNegate => "BOOL_NEGATE",
            OpCode::BoolXor => "BOOL_XOR",
            OpCode::BoolAnd => "BOOL_AND",
            OpCode::BoolOr => "BOOL_OR",
            OpCode::MultiEqual => "MULTIEQUAL",
            OpCode::Piece => "PIECE",
            OpCode::Subpiece => "SUBPIECE",
            OpCode::PtrAdd => "PTRADD",
            OpCode::PtrSub => "PTRSUB",
            OpCode::Popcount => "POPCOUNT",
            OpCode::Lzcount => "LZCOUNT",
        }
    }

    pub fn eval_type(self) -> EvalType {
        match self {
            OpCode::Copy
            | OpCode::IntZext
            | OpCode::IntSext
            | OpCode::Int2Comp
            | OpCode::IntNegate
            | OpCode::BoolNegate
            | OpCode::Popcount
            | OpCode::Lzcount => EvalType::Unary,
            OpCode::IntEqual
            | OpCode::IntNotEqual
            | OpCode::IntSless
            | OpCode::IntSlessEqual
            | OpCode::IntLess
            | OpCode::IntLessEqual
            | OpCode::IntAdd
            | OpCode::IntSub
            | OpCode::IntCarry
            | OpCode::IntScarry
            | OpCode::IntSborrow
            | OpCode::IntXor
            | OpCode::IntAnd
            | OpCode::IntOr
            | OpCode::IntLeft
            | OpCode::IntRight
            | OpCode::IntSright
            | OpCode::IntMult
            | OpCode::IntDiv
            | OpCode::IntSdiv
            | OpCode::IntRem
            | OpCode::IntSrem
            | OpCode::BoolXor
            | OpCode::BoolAnd
            | OpCode::BoolOr
            | OpCode::Piece
            | OpCode::Subpiece
            | OpCode::PtrSub => EvalType::Binary,
            OpCode::Load
            | OpCode::Store
            | OpCode::Branch
            | OpCode::CBranch
            | OpCode::BranchInd
            | OpCode::Call
            | OpCode::CallInd
            | OpCode::CallOther
            | OpCode::Return
            | OpCode::MultiEqual
            | OpCode::PtrAdd => EvalType::Special,
        }
    }

    pub fn is_branch(self) -> bool {
        matches!(self, OpCode::Branch | OpCode::CBranch | OpCode::BranchInd)
    }

    /// Ends a basic block.
    pub fn is_flow_break(self) -> bool {
        self.is_branch() || self == OpCode::Return
    }

    /// Output is a single-byte boolean.
    pub fn is_boolean_output(self) -> bool {
        matches!(
            self,
            OpCode::IntEqual
                | OpCode::IntNotEqual
                | OpCode::IntSless
                | OpCode::IntSlessEqual
                | OpCode::IntLess
                | OpCode::IntLessEqual
                | OpCode::IntCarry
                | OpCode::IntScarry
                | OpCode::IntSborrow
                | OpCode::BoolNegate
                | OpCode::BoolXor
                | OpCode::BoolAnd
                | OpCode::BoolOr
        )
    }

    /// Must be kept even when its output is unused.
    pub fn has_side_effects(self) -> bool {
        matches!(
            self,
            OpCode::Store
                | OpCode::Branch
                | OpCode::CBranch
                | OpCode::BranchInd
                | OpCode::Call
                | OpCode::CallInd
                | OpCode::CallOther
                | OpCode::Return
        )
    }
}

impl std::fmt::Display for OpCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
