use crate::bytecode::op::LDF_ADDRESS_OFFSET;
use crate::bytecode::{Op, Program, Word};
use std::collections::HashSet;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum VerifyError {
    #[error("expected an opcode at {address}, found {found}")]
    NotAnOpcode { address: usize, found: String },

    #[error("{op} at {address} is truncated: needs {needed} operand(s)")]
    Truncated {
        address: usize,
        op: Op,
        needed: usize,
    },

    #[error("unresolved operand at {address} (operand of {op})")]
    Unresolved { address: usize, op: Op },

    /// `address` is the operand word's own address.
    #[error("word {address} (operand {operand} of {op}) should be {expected}")]
    OperandKind {
        address: usize,
        op: Op,
        operand: usize,
        expected: &'static str,
    },

    #[error("{op} at {address} targets {target}, which is not an instruction")]
    BadTarget {
        address: usize,
        op: Op,
        target: usize,
    },

    #[error("program does not start with START")]
    MissingStart,
}

/// Expected kind of each operand of `op`.
fn operand_kinds(op: Op) -> &'static [&'static str] {
    match op {
        Op::Ldcn => &["number"],
        Op::Ldcb => &["boolean"],
        Op::Assign | Op::Ld | Op::Jof | Op::Goto | Op::Call => &["index"],
        Op::Ldf => &["index", "index", "index"],
        _ => &[],
    }
}

fn kind_matches(word: Word, expected: &str) -> bool {
    matches!(
        (word, expected),
        (Word::Number(_), "number") | (Word::Bool(_), "boolean") | (Word::Index(_), "index")
    )
}

/// Check that a program is well formed.
///
/// Every instruction position holds an opcode with the right number and kind
/// of operands, no backpatch hole is left, and every jump target or function
/// entry address is the start of an instruction.
pub fn verify(program: &Program) -> Result<(), VerifyError> {
    let words = &program.words;

    if words.first() != Some(&Word::Op(Op::Start)) {
        return Err(VerifyError::MissingStart);
    }

    let mut boundaries = HashSet::new();
    let mut targets = Vec::new();
    let mut pc = 0;

    while pc < words.len() {
        let op = match words[pc] {
            Word::Op(op) => op,
            other => {
                return Err(VerifyError::NotAnOpcode {
                    address: pc,
                    found: format!("{:?}", other),
                });
            }
        };
        boundaries.insert(pc);

        if pc + op.width() > words.len() {
            return Err(VerifyError::Truncated {
                address: pc,
                op,
                needed: op.arity(),
            });
        }

        for (i, &expected) in operand_kinds(op).iter().enumerate() {
            let address = pc + 1 + i;
            let word = words[address];
            if word == Word::Hole {
                return Err(VerifyError::Unresolved { address, op });
            }
            if !kind_matches(word, expected) {
                return Err(VerifyError::OperandKind {
                    address,
                    op,
                    operand: i,
                    expected,
                });
            }
        }

        match op {
            Op::Jof | Op::Goto => targets.push((pc, op, words[pc + 1])),
            Op::Ldf => targets.push((pc, op, words[pc + LDF_ADDRESS_OFFSET])),
            _ => {}
        }

        pc += op.width();
    }

    for (address, op, word) in targets {
        let Word::Index(target) = word else {
            continue;
        };
        let target = target as usize;
        if !boundaries.contains(&target) {
            return Err(VerifyError::BadTarget {
                address,
                op,
                target,
            });
        }
    }

    Ok(())
}
