//! Bytecode: instruction set, program format, compiler and tooling.

pub mod compile;
pub mod compile_error;
pub mod disasm;
pub mod index_table;
pub mod ir;
pub mod op;
pub mod verify;

pub use ir::{CodecError, Program, Word};
pub use op::Op;
