//! Call-threaded JIT compiler.
//!
//! A function's bytecode is first run through branch simplification, then
//! every instruction becomes one [`Step`]: a helper call, a conditional
//! branch on a helper's status, a direct jump, or an exit. The native
//! backend for the host turns steps into machine code.

use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use tracing::{debug, info, warn};

use super::helpers::{self, Helper};
use crate::optimizer::simplify_branches;
use crate::vm::{ExecutionContext, Op, Program, VmError};

/// One lowered instruction. Jump targets are step indices; `len` is the
/// epilogue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Call { helper: u64, a: u64, b: u64 },
    /// Call a branch helper; status 1 jumps to `target`.
    Branch { helper: u64, expect: u64, target: usize },
    Jump(usize),
    Exit,
}

fn address(helper: Helper) -> u64 {
    helper as usize as u64
}

/// Lower bytecode into steps. Jumps past the end exit the routine.
pub fn lower(code: &[Op]) -> Vec<Step> {
    let end = code.len();
    code.iter()
        .map(|&op| match op {
            Op::Jump(target) => Step::Jump(target.min(end)),
            Op::JumpIfTrue(target) => Step::Branch {
                helper: address(helpers::branch_helper()),
                expect: 1,
                target: target.min(end),
            },
            Op::JumpIfFalse(target) => Step::Branch {
                helper: address(helpers::branch_helper()),
                expect: 0,
                target: target.min(end),
            },
            Op::Return => Step::Exit,
            other => match helpers::helper_for(other) {
                Some((helper, a, b)) => Step::Call { helper: address(helper), a, b },
                None => Step::Exit,
            },
        })
        .collect()
}

type RoutineFn = unsafe extern "C" fn(*mut u8);

/// Native code for one function.
pub struct CompiledRoutine {
    func_id: usize,
    code_size: usize,
    entry: RoutineFn,
    // Keeps the mapping behind `entry` alive.
    _memory: super::memory::ExecutableMemory,
}

impl CompiledRoutine {
    pub fn func_id(&self) -> usize {
        self.func_id
    }

    /// Size of the generated machine code in bytes.
    pub fn code_size(&self) -> usize {
        self.code_size
    }

    /// Run the routine in the frame the caller already entered. A fault
    /// raised by a helper ends the routine and is returned here.
    pub fn invoke(&self, ctx: &mut ExecutionContext<'_>) -> Result<(), VmError> {
        let raw = (ctx as *mut ExecutionContext<'_>).cast::<u8>();
        // SAFETY: `entry` points at a finished routine in executable memory
        // owned by `self`, and `raw` is the only live path to the context
        // until the call returns.
        unsafe { (self.entry)(raw) };
        match ctx.take_pending_fault() {
            Some(fault) => Err(fault),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for CompiledRoutine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledRoutine")
            .field("func_id", &self.func_id)
            .field("code_size", &self.code_size)
            .finish()
    }
}

#[cfg(all(feature = "jit", unix, target_arch = "x86_64"))]
use super::x86_64::emit_routine as emit_native;

#[cfg(all(feature = "jit", unix, target_arch = "aarch64"))]
use super::aarch64::emit_routine as emit_native;

#[cfg(all(feature = "jit", unix, any(target_arch = "x86_64", target_arch = "aarch64")))]
fn build_routine(func_id: usize, steps: &[Step]) -> Result<CompiledRoutine, VmError> {
    let buf = emit_native(steps);
    let code_size = buf.len();
    let memory = buf.finalize().map_err(|e| VmError::Jit(e.to_string()))?;
    // SAFETY: the memory holds a complete routine with the `RoutineFn` ABI.
    let entry = unsafe { std::mem::transmute::<*const u8, RoutineFn>(memory.as_ptr()) };
    Ok(CompiledRoutine { func_id, code_size, entry, _memory: memory })
}

#[cfg(not(all(feature = "jit", unix, any(target_arch = "x86_64", target_arch = "aarch64"))))]
fn build_routine(_func_id: usize, _steps: &[Step]) -> Result<CompiledRoutine, VmError> {
    Err(VmError::Jit("native code generation is not available for this target".to_string()))
}

/// Compiles hot functions and caches their routines for the rest of the run.
#[derive(Debug, Default)]
pub struct JitCompiler {
    routines: HashMap<usize, Rc<CompiledRoutine>>,
    compile_count: usize,
}

impl JitCompiler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether this build can produce native code for the host.
    pub fn is_supported() -> bool {
        cfg!(all(feature = "jit", unix, any(target_arch = "x86_64", target_arch = "aarch64")))
    }

    /// Compile function `func_id`, or return the cached routine.
    pub fn compile(&mut self, func_id: usize, program: &Program) -> Result<Rc<CompiledRoutine>, VmError> {
        if let Some(routine) = self.routines.get(&func_id) {
            return Ok(Rc::clone(routine));
        }

        let func = program.function(func_id)?;
        let simplified = simplify_branches(&func.code, &program.constants);
        let steps = lower(&simplified.code);
        debug!(
            function = %func.name,
            instructions = func.code.len(),
            steps = steps.len(),
            branches_folded = simplified.stats.branches_folded,
            "lowered function"
        );

        let routine = build_routine(func_id, &steps).inspect_err(|e| {
            warn!(function = %func.name, error = %e, "jit compilation failed");
        })?;
        info!(function = %func.name, bytes = routine.code_size(), "compiled function");

        let routine = Rc::new(routine);
        self.routines.insert(func_id, Rc::clone(&routine));
        self.compile_count += 1;
        Ok(routine)
    }

    pub fn routine(&self, func_id: usize) -> Option<Rc<CompiledRoutine>> {
        self.routines.get(&func_id).cloned()
    }

    pub fn is_compiled(&self, func_id: usize) -> bool {
        self.routines.contains_key(&func_id)
    }

    /// Number of functions compiled so far.
    pub fn compile_count(&self) -> usize {
        self.compile_count
    }

    pub fn code_size(&self, func_id: usize) -> Option<usize> {
        self.routines.get(&func_id).map(|r| r.code_size())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::{Constant, Function};

    #[test]
    fn test_lower_control_flow() {
        let steps = lower(&[Op::JumpIfFalse(9), Op::Jump(0), Op::Return]);
        assert!(matches!(steps[0], Step::Branch { expect: 0, target: 3, .. }));
        assert_eq!(steps[1], Step::Jump(0));
        assert_eq!(steps[2], Step::Exit);
    }

    #[test]
    fn test_lower_helper_operands() {
        let steps = lower(&[Op::GetField { class: 2, field: 5 }]);
        assert!(matches!(steps[0], Step::Call { a: 2, b: 5, .. }));
    }

    #[test]
    fn test_compile_unknown_function() {
        let program = Program::new(vec![], vec![]);
        let mut jit = JitCompiler::new();
        assert_eq!(jit.compile(3, &program).unwrap_err(), VmError::UnknownFunction(3));
        assert_eq!(jit.compile_count(), 0);
    }

    #[test]
    fn test_compile_is_cached() {
        let program = Program::new(
            vec![Function::new("main", vec![Op::Push(0), Op::Return])],
            vec![Constant::Int(1)],
        );
        let mut jit = JitCompiler::new();
        match jit.compile(0, &program) {
            Ok(first) => {
                assert!(JitCompiler::is_supported());
                let second = jit.compile(0, &program).unwrap();
                assert!(Rc::ptr_eq(&first, &second));
                assert_eq!(jit.compile_count(), 1);
                assert!(jit.code_size(0).unwrap() > 0);
            }
            Err(e) => {
                assert!(!JitCompiler::is_supported());
                assert!(matches!(e, VmError::Jit(_)));
            }
        }
    }
}
