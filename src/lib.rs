//! Skipper - execution core of a small managed-language virtual machine.
//!
//! This library provides the bytecode interpreter, the tiering controller
//! with its call-threaded JIT, and the bytecode optimizer.

pub mod config;
pub mod jit;
pub mod optimizer;
pub mod vm;

// Re-export commonly used types
pub use config::{JitMode, RuntimeConfig};
pub use vm::{ExecutionContext, Heap, Op, Program, RunOutcome, Value, Vm, VmError};
