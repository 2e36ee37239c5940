use crate::bytecode::Op;
use crate::runtime::runtime_error::RuntimeError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One cell of a compiled program.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Word {
    /// An opcode.
    Op(Op),

    /// Numeric literal operand (LDCN).
    Number(f64),

    /// Boolean literal operand (LDCB).
    Bool(bool),

    /// Address, environment slot, argument count, stack size or extension
    /// count, depending on the opcode.
    Index(u32),

    /// Reserved backpatch site. Never present in a finished program.
    Hole,
}

/// A compiled bytecode program.
///
/// A flat array of words; addresses are absolute indices into it. By
/// convention execution starts at address 0 with `START`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Program {
    pub words: Vec<Word>,
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to encode program: {0}")]
    Encode(#[source] postcard::Error),
    #[error("failed to decode program: {0}")]
    Decode(#[source] postcard::Error),
}

impl Program {
    pub fn new() -> Self {
        Self { words: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// The opcode stored at `pc`.
    pub fn op_at(&self, pc: usize) -> Result<Op, RuntimeError> {
        match self.words.get(pc) {
            Some(Word::Op(op)) => Ok(*op),
            Some(other) => Err(RuntimeError::UnknownOpcode {
                pc,
                word: format!("{:?}", other),
            }),
            None => Err(RuntimeError::PcOutOfBounds { pc }),
        }
    }

    /// Index-kind operand at `address`.
    pub fn index_at(&self, address: usize) -> Result<usize, RuntimeError> {
        match self.words.get(address) {
            Some(Word::Index(i)) => Ok(*i as usize),
            Some(Word::Hole) => Err(RuntimeError::Unresolved { address }),
            _ => Err(RuntimeError::MalformedOperand {
                address,
                expected: "index",
            }),
        }
    }

    pub fn number_at(&self, address: usize) -> Result<f64, RuntimeError> {
        match self.words.get(address) {
            Some(Word::Number(n)) => Ok(*n),
            Some(Word::Hole) => Err(RuntimeError::Unresolved { address }),
            _ => Err(RuntimeError::MalformedOperand {
                address,
                expected: "number",
            }),
        }
    }

    pub fn bool_at(&self, address: usize) -> Result<bool, RuntimeError> {
        match self.words.get(address) {
            Some(Word::Bool(b)) => Ok(*b),
            Some(Word::Hole) => Err(RuntimeError::Unresolved { address }),
            _ => Err(RuntimeError::MalformedOperand {
                address,
                expected: "boolean",
            }),
        }
    }

    /// Walk the program instruction by instruction.
    ///
    /// Stops at the first word that is not an opcode or whose operands run
    /// past the end; the verifier reports those cases.
    pub fn instructions(&self) -> Instructions<'_> {
        Instructions { words: &self.words, pc: 0 }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        postcard::to_allocvec(self).map_err(CodecError::Encode)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        postcard::from_bytes(bytes).map_err(CodecError::Decode)
    }
}

impl Default for Program {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Instructions<'a> {
    words: &'a [Word],
    pc: usize,
}

impl<'a> Iterator for Instructions<'a> {
    /// `(address, opcode, operands)`
    type Item = (usize, Op, &'a [Word]);

    fn next(&mut self) -> Option<Self::Item> {
        let pc = self.pc;
        let Some(Word::Op(op)) = self.words.get(pc) else {
            return None;
        };
        let end = pc + op.width();
        if end > self.words.len() {
            return None;
        }
        self.pc = end;
        Some((pc, *op, &self.words[pc + 1..end]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Program {
        Program {
            words: vec![
                Word::Op(Op::Start),
                Word::Op(Op::Ldcn),
                Word::Number(2.5),
                Word::Op(Op::Ldcb),
                Word::Bool(true),
                Word::Op(Op::Done),
            ],
        }
    }

    #[test]
    fn test_instructions_walk() {
        let prog = sample();
        let walked: Vec<(usize, Op)> = prog.instructions().map(|(pc, op, _)| (pc, op)).collect();
        assert_eq!(
            walked,
            vec![(0, Op::Start), (1, Op::Ldcn), (3, Op::Ldcb), (5, Op::Done)]
        );
    }

    #[test]
    fn test_typed_operand_fetch() {
        let prog = sample();
        assert_eq!(prog.number_at(2).unwrap(), 2.5);
        assert!(prog.bool_at(4).unwrap());
        assert!(matches!(
            prog.index_at(2),
            Err(RuntimeError::MalformedOperand { address: 2, .. })
        ));
        assert!(matches!(
            prog.op_at(2),
            Err(RuntimeError::UnknownOpcode { pc: 2, .. })
        ));
        assert!(matches!(prog.op_at(99), Err(RuntimeError::PcOutOfBounds { pc: 99 })));
    }

    #[test]
    fn test_hole_is_reported_as_unresolved() {
        let prog = Program {
            words: vec![Word::Op(Op::Goto), Word::Hole],
        };
        assert!(matches!(
            prog.index_at(1),
            Err(RuntimeError::Unresolved { address: 1 })
        ));
    }

    #[test]
    fn test_postcard_encoding_roundtrip() {
        let prog = sample();
        let bytes = prog.to_bytes().unwrap();
        let decoded = Program::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, prog);
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(matches!(
            Program::from_bytes(&[0xff, 0xff, 0xff]),
            Err(CodecError::Decode(_))
        ));
    }
}
