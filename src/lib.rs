//! Compiler and incrementally collected stack machine for a small
//! expression language.
//!
//! The pipeline is `lang::node::Node` → [`bytecode::compile::compile`] →
//! [`bytecode::Program`] → [`runtime::Vm`].

pub mod bytecode;
pub mod lang;
pub mod runtime;

use crate::bytecode::compile::compile;
use crate::bytecode::compile_error::CompileError;
use crate::lang::node::Node;
use crate::lang::value::Value;
use crate::runtime::{RuntimeError, Vm, VmConfig};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("compile error: {0}")]
    Compile(#[from] CompileError),

    #[error("runtime error: {0}")]
    Runtime(#[from] RuntimeError),
}

/// Compile and run a program.
pub fn run(program: &Node, config: VmConfig) -> Result<Value, Error> {
    let program = compile(program)?;
    Ok(Vm::new(program, config)?.run()?)
}
