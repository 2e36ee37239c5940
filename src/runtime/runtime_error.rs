use crate::bytecode::verify::VerifyError;
use crate::runtime::heap::HeapError;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RuntimeError {
    /// `/` with a zero divisor. The machine halts with the quotient on top of
    /// the operand stack.
    #[error("division by zero")]
    DivisionByZero,

    /// Admission control could not find enough free nodes, even after a
    /// stop-the-world collection.
    #[error("out of memory: instruction needs {demand} node(s), {free} free")]
    OutOfMemory { demand: usize, free: usize },

    #[error("type error in {op}: expected {expected}, got {found}")]
    TypeMismatch {
        op: &'static str,
        expected: &'static str,
        found: &'static str,
    },

    #[error("expected an opcode at {pc}, found {word}")]
    UnknownOpcode { pc: usize, word: String },

    #[error("program counter {pc} is outside the program")]
    PcOutOfBounds { pc: usize },

    #[error("unresolved operand at {address}")]
    Unresolved { address: usize },

    #[error("operand at {address} should be {expected}")]
    MalformedOperand {
        address: usize,
        expected: &'static str,
    },

    #[error("operand stack underflow")]
    OperandStackUnderflow,

    #[error("return stack underflow")]
    ReturnStackUnderflow,

    #[error("environment slot {slot} out of range (frame has {size})")]
    UnboundSlot { slot: usize, size: usize },

    #[error("malformed program: {0}")]
    Malformed(#[from] VerifyError),

    #[error("heap error: {0}")]
    Heap(#[from] HeapError),

    #[error("execution tick limit exceeded ({limit})")]
    TickLimitExceeded { limit: usize },

    #[error("machine has halted")]
    Halted,
}

pub fn type_mismatch(op: &'static str, expected: &'static str, found: &'static str) -> RuntimeError {
    RuntimeError::TypeMismatch {
        op,
        expected,
        found,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages() {
        assert_eq!(
            RuntimeError::OutOfMemory { demand: 4, free: 1 }.to_string(),
            "out of memory: instruction needs 4 node(s), 1 free"
        );
        assert_eq!(
            type_mismatch("PLUS", "number", "boolean").to_string(),
            "type error in PLUS: expected number, got boolean"
        );
    }
}
