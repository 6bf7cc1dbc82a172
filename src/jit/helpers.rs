//! Runtime helpers called from compiled routines.
//!
//! Every helper has the signature `(ctx, a, b) -> status` under the C ABI,
//! where `ctx` is the `ExecutionContext` the routine was invoked with and
//! `a`/`b` are the instruction's operands. A helper performs exactly what
//! the interpreter does for the same opcode by calling the same context
//! method.
//!
//! Status: [`STATUS_CONTINUE`], [`STATUS_TAKEN`] for a taken conditional
//! branch, or [`STATUS_FAULT`] after storing the fault in the context.

use crate::vm::semantics::{ArithOp, CompareOp};
use crate::vm::{ExecutionContext, Op, VmError};

pub const STATUS_CONTINUE: u64 = 0;
pub const STATUS_TAKEN: u64 = 1;
pub const STATUS_FAULT: u64 = 2;

pub type Helper = unsafe extern "C" fn(*mut u8, u64, u64) -> u64;

const ARITH_OPS: [ArithOp; 5] = [ArithOp::Add, ArithOp::Sub, ArithOp::Mul, ArithOp::Div, ArithOp::Mod];
const COMPARE_OPS: [CompareOp; 6] = [
    CompareOp::Eq,
    CompareOp::Ne,
    CompareOp::Lt,
    CompareOp::Gt,
    CompareOp::Le,
    CompareOp::Ge,
];

/// Helper and operands implementing a non-control-flow instruction.
/// Control flow (`JUMP*`, `RETURN`) is lowered by the compiler itself.
pub fn helper_for(op: Op) -> Option<(Helper, u64, u64)> {
    let call: (Helper, u64, u64) = match op {
        Op::Push(index) => (push_constant, index as u64, 0),
        Op::Pop => (pop, 0, 0),
        Op::Dup => (dup, 0, 0),
        Op::Swap => (swap, 0, 0),

        Op::LoadLocal { slot, .. } => (load_local, slot as u64, 0),
        Op::StoreLocal { slot, .. } => (store_local, slot as u64, 0),
        Op::LoadGlobal(slot) => (load_global, slot as u64, 0),
        Op::StoreGlobal(slot) => (store_global, slot as u64, 0),

        Op::Add => (arithmetic, 0, 0),
        Op::Sub => (arithmetic, 1, 0),
        Op::Mul => (arithmetic, 2, 0),
        Op::Div => (arithmetic, 3, 0),
        Op::Mod => (arithmetic, 4, 0),
        Op::Neg => (negate, 0, 0),

        Op::CmpEq => (compare, 0, 0),
        Op::CmpNe => (compare, 1, 0),
        Op::CmpLt => (compare, 2, 0),
        Op::CmpGt => (compare, 3, 0),
        Op::CmpLe => (compare, 4, 0),
        Op::CmpGe => (compare, 5, 0),

        Op::And => (logical_and, 0, 0),
        Op::Or => (logical_or, 0, 0),
        Op::Not => (logical_not, 0, 0),

        Op::Call { func, argc } => (call_function, func as u64, argc as u64),
        Op::CallMethod { class, method } => (call_method, class as u64, method as u64),
        Op::CallNative(id) => (call_native, id as u64, 0),

        Op::NewObject(class) => (new_object, class as u64, 0),
        Op::NewArray(elem) => (new_array, elem as u64, 0),
        Op::GetField { class, field } => (get_field, class as u64, field as u64),
        Op::SetField { class, field } => (set_field, class as u64, field as u64),
        Op::GetElement => (get_element, 0, 0),
        Op::SetElement => (set_element, 0, 0),

        Op::Jump(_) | Op::JumpIfTrue(_) | Op::JumpIfFalse(_) | Op::Return => return None,
    };
    Some(call)
}

/// Helper for `JUMP_IF_TRUE` (`expect = 1`) and `JUMP_IF_FALSE`
/// (`expect = 0`).
pub fn branch_helper() -> Helper {
    branch_if
}

/// # Safety
/// `raw` must be the pointer handed to the routine by
/// `CompiledRoutine::invoke`, which holds the only borrow of the context for
/// the duration of the call.
unsafe fn with_context(
    raw: *mut u8,
    f: impl FnOnce(&mut ExecutionContext<'_>) -> Result<u64, VmError>,
) -> u64 {
    let ctx = unsafe { &mut *raw.cast::<ExecutionContext<'_>>() };
    match f(&mut *ctx) {
        Ok(status) => status,
        Err(fault) => {
            ctx.set_pending_fault(fault);
            STATUS_FAULT
        }
    }
}

fn continue_with(result: Result<(), VmError>) -> Result<u64, VmError> {
    result.map(|()| STATUS_CONTINUE)
}

fn operand(op: &str, table_len: usize, code: u64) -> Result<usize, VmError> {
    let index = code as usize;
    if index < table_len {
        Ok(index)
    } else {
        Err(VmError::MalformedInstruction {
            op: op.to_string(),
            reason: format!("helper selector {} out of range", code),
        })
    }
}

unsafe extern "C" fn push_constant(ctx: *mut u8, index: u64, _: u64) -> u64 {
    unsafe { with_context(ctx, |ctx| continue_with(ctx.push_constant(index as usize))) }
}

unsafe extern "C" fn pop(ctx: *mut u8, _: u64, _: u64) -> u64 {
    unsafe {
        with_context(ctx, |ctx| {
            ctx.discard();
            Ok(STATUS_CONTINUE)
        })
    }
}

unsafe extern "C" fn dup(ctx: *mut u8, _: u64, _: u64) -> u64 {
    unsafe { with_context(ctx, |ctx| continue_with(ctx.dup())) }
}

unsafe extern "C" fn swap(ctx: *mut u8, _: u64, _: u64) -> u64 {
    unsafe { with_context(ctx, |ctx| continue_with(ctx.swap())) }
}

unsafe extern "C" fn load_local(ctx: *mut u8, slot: u64, _: u64) -> u64 {
    unsafe {
        with_context(ctx, |ctx| {
            let value = ctx.load_local(slot as usize)?;
            ctx.push_stack(value);
            Ok(STATUS_CONTINUE)
        })
    }
}

unsafe extern "C" fn store_local(ctx: *mut u8, slot: u64, _: u64) -> u64 {
    unsafe {
        with_context(ctx, |ctx| {
            let value = ctx.pop_stack()?;
            continue_with(ctx.store_local(slot as usize, value))
        })
    }
}

unsafe extern "C" fn load_global(ctx: *mut u8, slot: u64, _: u64) -> u64 {
    unsafe {
        with_context(ctx, |ctx| {
            let value = ctx.load_global(slot as usize)?;
            ctx.push_stack(value);
            Ok(STATUS_CONTINUE)
        })
    }
}

unsafe extern "C" fn store_global(ctx: *mut u8, slot: u64, _: u64) -> u64 {
    unsafe {
        with_context(ctx, |ctx| {
            let value = ctx.pop_stack()?;
            continue_with(ctx.store_global(slot as usize, value))
        })
    }
}

unsafe extern "C" fn arithmetic(ctx: *mut u8, op: u64, _: u64) -> u64 {
    unsafe {
        with_context(ctx, |ctx| {
            let op = ARITH_OPS[operand("ARITH", ARITH_OPS.len(), op)?];
            continue_with(ctx.arithmetic(op))
        })
    }
}

unsafe extern "C" fn negate(ctx: *mut u8, _: u64, _: u64) -> u64 {
    unsafe { with_context(ctx, |ctx| continue_with(ctx.negate())) }
}

unsafe extern "C" fn compare(ctx: *mut u8, op: u64, _: u64) -> u64 {
    unsafe {
        with_context(ctx, |ctx| {
            let op = COMPARE_OPS[operand("CMP", COMPARE_OPS.len(), op)?];
            continue_with(ctx.compare(op))
        })
    }
}

unsafe extern "C" fn logical_and(ctx: *mut u8, _: u64, _: u64) -> u64 {
    unsafe { with_context(ctx, |ctx| continue_with(ctx.logical_and())) }
}

unsafe extern "C" fn logical_or(ctx: *mut u8, _: u64, _: u64) -> u64 {
    unsafe { with_context(ctx, |ctx| continue_with(ctx.logical_or())) }
}

unsafe extern "C" fn logical_not(ctx: *mut u8, _: u64, _: u64) -> u64 {
    unsafe { with_context(ctx, |ctx| continue_with(ctx.logical_not())) }
}

unsafe extern "C" fn branch_if(ctx: *mut u8, expect: u64, _: u64) -> u64 {
    unsafe {
        with_context(ctx, |ctx| {
            let condition = ctx.pop_condition()?;
            Ok(if condition == (expect != 0) { STATUS_TAKEN } else { STATUS_CONTINUE })
        })
    }
}

unsafe extern "C" fn call_function(ctx: *mut u8, func: u64, _argc: u64) -> u64 {
    unsafe { with_context(ctx, |ctx| continue_with(ctx.call_function(func as usize))) }
}

unsafe extern "C" fn call_method(ctx: *mut u8, class: u64, method: u64) -> u64 {
    unsafe {
        with_context(ctx, |ctx| continue_with(ctx.call_method(class as usize, method as usize)))
    }
}

unsafe extern "C" fn call_native(ctx: *mut u8, id: u64, _: u64) -> u64 {
    unsafe { with_context(ctx, |ctx| continue_with(ctx.call_native(id as usize))) }
}

unsafe extern "C" fn new_object(ctx: *mut u8, class: u64, _: u64) -> u64 {
    unsafe { with_context(ctx, |ctx| continue_with(ctx.new_object(class as usize))) }
}

unsafe extern "C" fn new_array(ctx: *mut u8, _elem: u64, _: u64) -> u64 {
    unsafe { with_context(ctx, |ctx| continue_with(ctx.new_array())) }
}

unsafe extern "C" fn get_field(ctx: *mut u8, class: u64, field: u64) -> u64 {
    unsafe {
        with_context(ctx, |ctx| continue_with(ctx.get_field(class as usize, field as usize)))
    }
}

unsafe extern "C" fn set_field(ctx: *mut u8, class: u64, field: u64) -> u64 {
    unsafe {
        with_context(ctx, |ctx| continue_with(ctx.set_field(class as usize, field as usize)))
    }
}

unsafe extern "C" fn get_element(ctx: *mut u8, _: u64, _: u64) -> u64 {
    unsafe { with_context(ctx, |ctx| continue_with(ctx.get_element())) }
}

unsafe extern "C" fn set_element(ctx: *mut u8, _: u64, _: u64) -> u64 {
    unsafe { with_context(ctx, |ctx| continue_with(ctx.set_element())) }
}
