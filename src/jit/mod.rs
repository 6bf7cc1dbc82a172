//! Call-threaded JIT for Skipper bytecode.
//!
//! - Executable memory allocation
//! - Code buffer with label patching
//! - x86-64 and AArch64 encoders
//! - Runtime helpers shared with the interpreter's semantics
//!
//! Native code is only produced with the `jit` feature on Unix x86-64 or
//! AArch64. Elsewhere [`JitCompiler::compile`] reports a `Jit` fault.

#[cfg_attr(not(target_arch = "aarch64"), allow(dead_code))]
mod aarch64;
mod codebuf;
mod compiler;
mod helpers;
mod memory;
#[cfg_attr(not(target_arch = "x86_64"), allow(dead_code))]
mod x86_64;

pub use compiler::{CompiledRoutine, JitCompiler, Step, lower};
pub use helpers::{STATUS_CONTINUE, STATUS_FAULT, STATUS_TAKEN};
pub use memory::MemoryError;
