use serde::{Deserialize, Serialize};

// =============================================================================
// OP - Machine opcodes
// =============================================================================

/// Machine opcodes.
///
/// Each opcode is followed in the program by exactly [`Op::arity`] inline
/// operand words, so the dispatcher can step over an instruction without
/// looking at what its operands mean. Discriminants are the stable numeric
/// codes of the instruction set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Op {
    // machine
    Start = 0,

    // literals
    /// Followed by: number.
    Ldcn = 1,
    /// Followed by: boolean.
    Ldcb = 2,
    Ldcu = 3,

    // arithmetic & comparison
    Plus = 4,
    Minus = 5,
    Times = 6,
    Equal = 7,
    Less = 8,
    Greater = 9,
    Leq = 10,
    Geq = 11,
    Not = 12,
    Div = 13,

    // stack & control
    Pop = 14,
    /// Followed by: environment slot.
    Assign = 15,
    /// Followed by: jump address. Pops a boolean, jumps when false.
    Jof = 16,
    /// Followed by: jump address.
    Goto = 17,

    // functions
    /// Followed by: max operand stack size, entry address, env extension count.
    Ldf = 18,
    /// Followed by: argument count.
    Call = 19,
    /// Followed by: environment slot.
    Ld = 20,
    Rtn = 21,

    Done = 22,
}

/// Operand offsets inside an LDF instruction.
pub const LDF_MAX_OS_SIZE_OFFSET: usize = 1;
pub const LDF_ADDRESS_OFFSET: usize = 2;
pub const LDF_ENV_EXTENSION_COUNT_OFFSET: usize = 3;

impl Op {
    pub const ALL: [Op; 23] = [
        Op::Start,
        Op::Ldcn,
        Op::Ldcb,
        Op::Ldcu,
        Op::Plus,
        Op::Minus,
        Op::Times,
        Op::Equal,
        Op::Less,
        Op::Greater,
        Op::Leq,
        Op::Geq,
        Op::Not,
        Op::Div,
        Op::Pop,
        Op::Assign,
        Op::Jof,
        Op::Goto,
        Op::Ldf,
        Op::Call,
        Op::Ld,
        Op::Rtn,
        Op::Done,
    ];

    /// Number of inline operand words following the opcode.
    pub fn arity(self) -> usize {
        match self {
            Op::Ldcn | Op::Ldcb | Op::Assign | Op::Jof | Op::Goto | Op::Call | Op::Ld => 1,
            Op::Ldf => 3,
            _ => 0,
        }
    }

    /// Total instruction length in words.
    pub fn width(self) -> usize {
        1 + self.arity()
    }

    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Op> {
        Op::ALL.get(code as usize).copied()
    }

    pub fn name(self) -> &'static str {
        match self {
            Op::Start => "START",
            Op::Ldcn => "LDCN",
            Op::Ldcb => "LDCB",
            Op::Ldcu => "LDCU",
            Op::Plus => "PLUS",
            Op::Minus => "MINUS",
            Op::Times => "TIMES",
            Op::Equal => "EQUAL",
            Op::Less => "LESS",
            Op::Greater => "GREATER",
            Op::Leq => "LEQ",
            Op::Geq => "GEQ",
            Op::Not => "NOT",
            Op::Div => "DIV",
            Op::Pop => "POP",
            Op::Assign => "ASSIGN",
            Op::Jof => "JOF",
            Op::Goto => "GOTO",
            Op::Ldf => "LDF",
            Op::Call => "CALL",
            Op::Ld => "LD",
            Op::Rtn => "RTN",
            Op::Done => "DONE",
        }
    }

    /// Whether the single operand is an absolute code address.
    pub fn is_jump(self) -> bool {
        matches!(self, Op::Jof | Op::Goto)
    }
}

impl std::fmt::Display for Op {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_dense_and_stable() {
        for (i, op) in Op::ALL.iter().enumerate() {
            assert_eq!(op.code() as usize, i);
            assert_eq!(Op::from_code(i as u8), Some(*op));
        }
        assert_eq!(Op::from_code(23), None);
        assert_eq!(Op::Done.code(), 22);
        assert_eq!(Op::Ldf.code(), 18);
    }

    #[test]
    fn test_arity() {
        assert_eq!(Op::Ldf.arity(), 3);
        assert_eq!(Op::Call.arity(), 1);
        assert_eq!(Op::Ldcn.width(), 2);
        assert_eq!(Op::Plus.arity(), 0);
        assert_eq!(Op::Done.width(), 1);
    }
}
