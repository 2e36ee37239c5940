//! Execution: node heap, machine structures, collector and the VM.

pub mod gc;
pub mod heap;
pub mod runtime_error;
pub mod schedule;
pub mod structures;
pub mod vm;

pub use runtime_error::RuntimeError;
pub use vm::{HaltReason, MachineState, TraceSample, Vm, VmConfig};
