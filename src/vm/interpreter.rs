//! Fetch-decode-execute loop over one function's bytecode.

use tracing::debug;

use super::context::ExecutionContext;
use super::error::VmError;
use super::ops::Op;
use super::semantics::{ArithOp, CompareOp};

/// Control-flow outcome of one instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Next,
    Jump(usize),
    Return,
}

/// Run function `func_id` in the frame the caller already entered.
///
/// The loop ends at `RETURN` or when `ip` leaves the code, including a jump
/// to `code.len()` or beyond. A result, if any, is left on the stack.
pub fn execute(ctx: &mut ExecutionContext<'_>, func_id: usize) -> Result<(), VmError> {
    let code = &ctx.program().function(func_id)?.code;
    let mut ip = 0;

    while ip < code.len() {
        let op = code[ip];
        ctx.trace_step(func_id, ip, op);

        match step(ctx, op) {
            Ok(Flow::Next) => ip += 1,
            Ok(Flow::Jump(target)) => ip = target,
            Ok(Flow::Return) => break,
            Err(e) => {
                debug!(func = func_id, ip, op = %op, error = %e, "fault");
                return Err(e);
            }
        }
    }

    Ok(())
}

fn step(ctx: &mut ExecutionContext<'_>, op: Op) -> Result<Flow, VmError> {
    match op {
        // ===== Stack =====
        Op::Push(index) => ctx.push_constant(index)?,
        Op::Pop => ctx.discard(),
        Op::Dup => ctx.dup()?,
        Op::Swap => ctx.swap()?,

        // ===== Variables =====
        Op::LoadLocal { slot, .. } => {
            let value = ctx.load_local(slot)?;
            ctx.push_stack(value);
        }
        Op::StoreLocal { slot, .. } => {
            let value = ctx.pop_stack()?;
            ctx.store_local(slot, value)?;
        }
        Op::LoadGlobal(slot) => {
            let value = ctx.load_global(slot)?;
            ctx.push_stack(value);
        }
        Op::StoreGlobal(slot) => {
            let value = ctx.pop_stack()?;
            ctx.store_global(slot, value)?;
        }

        // ===== Arithmetic =====
        Op::Add => ctx.arithmetic(ArithOp::Add)?,
        Op::Sub => ctx.arithmetic(ArithOp::Sub)?,
        Op::Mul => ctx.arithmetic(ArithOp::Mul)?,
        Op::Div => ctx.arithmetic(ArithOp::Div)?,
        Op::Mod => ctx.arithmetic(ArithOp::Mod)?,
        Op::Neg => ctx.negate()?,

        // ===== Comparison =====
        Op::CmpEq => ctx.compare(CompareOp::Eq)?,
        Op::CmpNe => ctx.compare(CompareOp::Ne)?,
        Op::CmpLt => ctx.compare(CompareOp::Lt)?,
        Op::CmpGt => ctx.compare(CompareOp::Gt)?,
        Op::CmpLe => ctx.compare(CompareOp::Le)?,
        Op::CmpGe => ctx.compare(CompareOp::Ge)?,

        // ===== Logic =====
        Op::And => ctx.logical_and()?,
        Op::Or => ctx.logical_or()?,
        Op::Not => ctx.logical_not()?,

        // ===== Control flow =====
        Op::Jump(target) => return Ok(Flow::Jump(target)),
        Op::JumpIfTrue(target) => {
            if ctx.pop_condition()? {
                return Ok(Flow::Jump(target));
            }
        }
        Op::JumpIfFalse(target) => {
            if !ctx.pop_condition()? {
                return Ok(Flow::Jump(target));
            }
        }
        Op::Return => return Ok(Flow::Return),

        // ===== Calls =====
        Op::Call { func, .. } => ctx.call_function(func)?,
        Op::CallMethod { class, method } => ctx.call_method(class, method)?,
        Op::CallNative(id) => ctx.call_native(id)?,

        // ===== Objects and arrays =====
        Op::NewObject(class) => ctx.new_object(class)?,
        Op::NewArray(_) => ctx.new_array()?,
        Op::GetField { class, field } => ctx.get_field(class, field)?,
        Op::SetField { class, field } => ctx.set_field(class, field)?,
        Op::GetElement => ctx.get_element()?,
        Op::SetElement => ctx.set_element()?,
    }
    Ok(Flow::Next)
}
